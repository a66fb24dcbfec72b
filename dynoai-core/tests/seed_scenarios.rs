//! The six end-to-end seed scenarios with literal inputs.

use dynoai_core::aggregate::aggregate;
use dynoai_core::apply::{apply, rollback};
use dynoai_core::config::Config;
use dynoai_core::grid::Grid;
use dynoai_core::kernel::correct;
use dynoai_core::orchestrator::{self, SessionInputs, SessionStatus};
use dynoai_core::sample::{Cylinder, LogSample};
use dynoai_core::table::{AfrTargetUnit, Table, VeUnit};
use dynoai_core::virtual_ecu::{CylinderModel, VirtualEcu};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

fn grid_11x9() -> Grid {
    let rpm_bins = (0..11).map(|i| 1000.0 + 500.0 * f64::from(i)).collect();
    let map_bins = (0..9).map(|j| 20.0 + 10.0 * f64::from(j)).collect();
    Grid::new(rpm_bins, map_bins).unwrap()
}

fn samples_at(grid: &Grid, afr_cmd: f64, afr_meas: f64, hits_per_cell: usize) -> Vec<LogSample> {
    let mut samples = Vec::new();
    for &rpm in grid.rpm_bins() {
        for &map_kpa in grid.map_bins() {
            for _ in 0..hits_per_cell {
                samples.push(LogSample {
                    rpm: Some(rpm),
                    map_kpa: Some(map_kpa),
                    afr_cmd_front: Some(afr_cmd),
                    afr_meas_front: Some(afr_meas),
                    ..LogSample::default()
                });
            }
        }
    }
    samples
}

/// Scenario 1: identity. Base VE all 0.8000, `afr_meas == afr_cmd`
/// everywhere, 20 hits per cell. Factor table is all zeros; apply is a
/// no-op; rollback verifies.
#[test]
fn identity_scenario() {
    let grid = grid_11x9();
    let base_ve = Table::<VeUnit>::filled(grid.clone(), 0.8).unwrap();
    let samples = samples_at(&grid, 13.5, 13.5, 20);
    let config = Config::default();

    let agg = aggregate(&samples, &grid, Cylinder::Front, &config);
    let artifact = correct(&agg.cells, &grid, &base_ve, &config).unwrap();
    assert!(artifact.factor.iter().all(|&d| d == 0.0));

    let (updated, metadata) = apply(&base_ve, &artifact, None, None, false, &config).unwrap();
    assert_eq!(updated.cells(), base_ve.cells());

    let restored = rollback(&updated, &artifact, &metadata).unwrap();
    assert_eq!(restored.cells(), base_ve.cells());
}

/// Scenario 2: uniform lean +10%. Base VE all 0.8500, `ve_actual = 0.95`
/// uniform, target AFR 13.5. Raw delta is ~+11.76%, clamped to +7.00 with
/// the default `clamp_pct = 7`. Applied VE is ~0.9095. Rollback with the
/// recorded metadata restores 0.8500 exactly.
#[test]
fn uniform_lean_plus_10_pct_scenario() {
    let grid = grid_11x9();
    let base_ve = Table::<VeUnit>::filled(grid.clone(), 0.85).unwrap();
    let afr_cmd = 13.5;
    let afr_meas = afr_cmd * 0.95 / 0.85;
    let samples = samples_at(&grid, afr_cmd, afr_meas, 20);
    let config = Config::default();

    let agg = aggregate(&samples, &grid, Cylinder::Front, &config);
    let artifact = correct(&agg.cells, &grid, &base_ve, &config).unwrap();
    for &delta in &artifact.factor {
        assert!((delta - 7.0).abs() < 1e-6, "delta {delta} should clamp to 7.0");
    }
    assert!(artifact.clamped.iter().all(|&c| c));

    let (updated, metadata) = apply(&base_ve, &artifact, None, None, false, &config).unwrap();
    for &cell in updated.cells() {
        assert!((cell - 0.9095).abs() < 1e-6);
    }

    let restored = rollback(&updated, &artifact, &metadata).unwrap();
    for &cell in restored.cells() {
        assert!((cell - 0.85).abs() < 1e-6);
    }
}

/// Scenario 3: closed-loop convergence. ECU VE uniformly 10% low of the
/// engine's actual VE, target AFR 12.5. Converges within 5 iterations with
/// a 0.3 AFR threshold.
#[test]
fn closed_loop_convergence_scenario() {
    let grid = grid_11x9();
    let ve_actual_value = 0.85;
    let ve_ecu_value = ve_actual_value * 0.9;

    let model = |afr_target| CylinderModel {
        ve_actual: Table::<VeUnit>::filled(grid.clone(), ve_actual_value).unwrap(),
        ve_ecu: Table::<VeUnit>::filled(grid.clone(), ve_ecu_value).unwrap(),
        afr_target: Table::<AfrTargetUnit>::filled(grid.clone(), afr_target).unwrap(),
    };
    let virtual_ecu = VirtualEcu::new(model(12.5), model(12.5), 0.0, 0);

    let mut config = Config::default();
    config.max_iterations = 10;
    config.convergence_threshold_afr = 0.3;
    config.min_hits_for_full_weight = 5;

    let mut sweep_points = Vec::new();
    for _ in 0..20 {
        for &rpm in grid.rpm_bins() {
            for &map_kpa in grid.map_bins() {
                sweep_points.push((rpm, map_kpa));
            }
        }
    }

    let inputs = SessionInputs {
        grid: grid.clone(),
        ve_ecu_front: Table::<VeUnit>::filled(grid.clone(), ve_ecu_value).unwrap(),
        ve_ecu_rear: Table::<VeUnit>::filled(grid.clone(), ve_ecu_value).unwrap(),
        virtual_ecu,
        sweep_points,
        iat_k: 298.0,
        tps: 50.0,
        config,
    };

    let id = orchestrator::run_closed_loop(inputs, Arc::new(AtomicBool::new(false))).unwrap();
    let session = orchestrator::get_session(id).unwrap();
    assert_eq!(session.status, SessionStatus::Converged);
    assert!(session.iterations.len() <= 5, "expected convergence within 5 iterations, got {}", session.iterations.len());
    let last = session.iterations.last().unwrap();
    assert!(last.max_afr_error_front < 0.3);
    assert!(last.max_afr_error_rear < 0.3);
}

/// Scenario 4: oscillation detection. `ve_actual == ve_ecu` everywhere (no
/// real mismatch to correct), `smooth_passes = 0` (no spatial averaging
/// between cells), and `min_hits_for_full_weight = 1` with exactly one
/// sample per cell, so the only thing driving a correction at all is
/// sensor noise. With full clamp headroom the kernel chases that noise at
/// full gain: the correction it applies after iteration 0 sets each cell's
/// VE to "whatever explains iteration 0's noisy reading exactly", so
/// iteration 1's measured error is the difference between two independent
/// noise draws rather than one, and comes in larger than iteration 0's.
/// That crosses `oscillation_margin` and fails the session after exactly
/// two recorded iterations.
#[test]
fn oscillation_scenario() {
    let grid = Grid::new(vec![1000.0, 2000.0], vec![20.0, 40.0]).unwrap();

    let model = || CylinderModel {
        ve_actual: Table::<VeUnit>::filled(grid.clone(), 0.8).unwrap(),
        ve_ecu: Table::<VeUnit>::filled(grid.clone(), 0.8).unwrap(),
        afr_target: Table::<AfrTargetUnit>::filled(grid.clone(), 13.5).unwrap(),
    };
    let virtual_ecu = VirtualEcu::new(model(), model(), 1.0, 7);

    let mut config = Config::default();
    config.max_iterations = 10;
    config.convergence_threshold_afr = 0.01;
    config.oscillation_margin = 0.1;
    config.clamp_pct = 12.0;
    config.smooth_passes = 0;
    config.min_hits_for_full_weight = 1;

    let mut sweep_points = Vec::new();
    for &rpm in grid.rpm_bins() {
        for &map_kpa in grid.map_bins() {
            sweep_points.push((rpm, map_kpa));
        }
    }

    let inputs = SessionInputs {
        grid: grid.clone(),
        ve_ecu_front: Table::<VeUnit>::filled(grid.clone(), 0.8).unwrap(),
        ve_ecu_rear: Table::<VeUnit>::filled(grid.clone(), 0.8).unwrap(),
        virtual_ecu,
        sweep_points,
        iat_k: 298.0,
        tps: 50.0,
        config,
    };

    let id = orchestrator::run_closed_loop(inputs, Arc::new(AtomicBool::new(false))).unwrap();
    let session = orchestrator::get_session(id).unwrap();

    assert_eq!(session.status, SessionStatus::Failed);
    let reason = session.failure_reason.unwrap();
    assert!(reason.contains("oscillation"), "{reason}");
    assert_eq!(session.iterations.len(), 2, "expected the run to fail on the second iteration, got {:#?}", session.iterations);
}

/// Scenario 5: hash-mismatch rollback. Mutating the updated table after
/// apply (simulating external tampering) makes rollback fail with
/// `HashMismatch` rather than silently reconstructing a wrong base.
#[test]
fn hash_mismatch_rollback_scenario() {
    let grid = Grid::new(vec![1000.0, 2000.0], vec![20.0, 40.0]).unwrap();
    let base_ve = Table::<VeUnit>::filled(grid.clone(), 0.8).unwrap();
    let config = Config::default();
    let samples = samples_at(&grid, 13.5, 13.5 * 1.02, 20);
    let agg = aggregate(&samples, &grid, Cylinder::Front, &config);
    let artifact = correct(&agg.cells, &grid, &base_ve, &config).unwrap();

    let (updated, metadata) = apply(&base_ve, &artifact, None, None, false, &config).unwrap();

    let mut tampered_cells = updated.cells().to_vec();
    tampered_cells[0] += 0.01;
    let tampered = Table::<VeUnit>::new(grid.clone(), tampered_cells).unwrap();

    let result = rollback(&tampered, &artifact, &metadata);
    assert!(matches!(
        result,
        Err(dynoai_core::error::Error::SafetyViolation(dynoai_core::error::SafetyViolation::HashMismatch { .. }))
    ));
}

/// Scenario 6: cumulative cap. Repeatedly applying a +5% correction to the
/// same lineage eventually breaches `[1/1.5, 1.5]`: `1.05^8 ≈ 1.48` is
/// still inside the cap, `1.05^9 ≈ 1.55` is not, so the 9th apply is the
/// one that fails with `CumulativeCapExceeded`.
#[test]
fn cumulative_cap_scenario() {
    let grid = Grid::new(vec![1000.0, 2000.0], vec![20.0, 40.0]).unwrap();
    let config = Config::default();
    let n = grid.n_cells();

    let mut ve = Table::<VeUnit>::filled(grid.clone(), 0.8).unwrap();
    let mut cumulative = vec![1.0_f64; n];
    let stats_samples = samples_at(&grid, 13.5, 13.5 * 1.05, 20);

    for attempt in 1..=8 {
        let agg = aggregate(&stats_samples, &grid, Cylinder::Front, &config);
        let artifact = correct(&agg.cells, &grid, &ve, &config).unwrap();
        let (updated, metadata) = apply(&ve, &artifact, None, Some(&cumulative), false, &config)
            .unwrap_or_else(|e| panic!("apply {attempt} should succeed: {e}"));
        ve = updated;
        cumulative = metadata.cumulative;
    }

    let agg = aggregate(&stats_samples, &grid, Cylinder::Front, &config);
    let artifact = correct(&agg.cells, &grid, &ve, &config).unwrap();
    let ninth = apply(&ve, &artifact, None, Some(&cumulative), false, &config);
    assert!(ninth.is_err(), "9th apply should exceed the cumulative cap");
}
