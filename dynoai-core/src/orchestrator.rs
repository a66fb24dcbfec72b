//! Closed-Loop Orchestrator (C7): drive the virtual ECU and correction
//! kernel through repeated simulate -> aggregate -> correct -> apply
//! cycles until AFR error converges, oscillates, or a budget is
//! exhausted.
//!
//! Sessions move through an explicit state machine (`pending -> running
//! -> {converged, failed, aborted, timed_out}`), and finished sessions
//! live in a single `Mutex`-guarded registry so the CLI layer can look
//! one up by id across calls.

use crate::aggregate::{aggregate, CellStats};
use crate::apply::{apply, ApplyMetadata};
use crate::config::Config;
use crate::diagnostics::diagnose;
use crate::error::{Error, Result, SafetyViolation};
use crate::grid::Grid;
use crate::kernel::{correct, CorrectionArtifact};
use crate::sample::Cylinder;
use crate::table::{Table, VeUnit};
use crate::virtual_ecu::VirtualEcu;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

/// Opaque session handle, unique for the process lifetime.
pub type SessionId = u64;

/// Terminal (and non-terminal `Running`) states of a tuning session.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Running,
    Converged,
    Failed,
    Aborted,
    TimedOut,
}

impl SessionStatus {
    /// Whether this status ends the session (no further iterations run).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Per-iteration snapshot recorded into a session's history.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IterationRecord {
    pub iteration: u32,
    pub max_afr_error_front: f64,
    pub max_afr_error_rear: f64,
    pub mean_afr_error_front: f64,
    pub mean_afr_error_rear: f64,
    pub max_delta_front: f64,
    pub max_delta_rear: f64,
    pub clamp_fraction_front: f64,
    pub clamp_fraction_rear: f64,
    pub artifact_sha_front: String,
    pub artifact_sha_rear: String,
}

/// Full state of one closed-loop tuning run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub status: SessionStatus,
    pub iterations: Vec<IterationRecord>,
    pub failure_reason: Option<String>,
    pub final_ve_front: Option<Table<VeUnit>>,
    pub final_ve_rear: Option<Table<VeUnit>>,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            status: SessionStatus::Pending,
            iterations: Vec::new(),
            failure_reason: None,
            final_ve_front: None,
            final_ve_rear: None,
        }
    }
}

type Registry = Mutex<HashMap<SessionId, Session>>;

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn next_session_id() -> SessionId {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Look up a session's current state by id. Returns `None` if the id is
/// unknown (never issued, or the process was restarted).
#[must_use]
pub fn get_session(id: SessionId) -> Option<Session> {
    registry().lock().expect("session registry poisoned").get(&id).cloned()
}

fn max_abs_afr_error(stats: &[CellStats]) -> f64 {
    stats
        .iter()
        .filter(|c| c.hit_count > 0)
        .map(|c| c.mean_afr_error.abs())
        .fold(0.0, f64::max)
}

fn mean_abs_afr_error(stats: &[CellStats]) -> f64 {
    let hit: Vec<f64> = stats.iter().filter(|c| c.hit_count > 0).map(|c| c.mean_afr_error.abs()).collect();
    if hit.is_empty() {
        0.0
    } else {
        hit.iter().sum::<f64>() / hit.len() as f64
    }
}

fn max_abs_delta(factor: &[f64]) -> f64 {
    factor.iter().map(|d| d.abs()).fold(0.0, f64::max)
}

/// Fraction, over every cell in the grid (not just cells with hits), whose
/// AFR error is within `threshold`. A cell with no hits has no error to
/// speak of and counts as converged, same as a cell that measured in.
fn converged_cells_fraction(stats: &[CellStats], threshold: f64) -> f64 {
    if stats.is_empty() {
        return 1.0;
    }
    let converged = stats.iter().filter(|c| c.mean_afr_error.abs() <= threshold).count();
    converged as f64 / stats.len() as f64
}

fn with_session(id: SessionId, f: impl FnOnce(&mut Session)) {
    let mut guard = registry().lock().expect("session registry poisoned");
    if let Some(session) = guard.get_mut(&id) {
        f(session);
    }
}

/// Parameters the caller must supply to start a closed-loop session.
pub struct SessionInputs {
    pub grid: Grid,
    pub ve_ecu_front: Table<VeUnit>,
    pub ve_ecu_rear: Table<VeUnit>,
    pub virtual_ecu: VirtualEcu,
    pub sweep_points: Vec<(f64, f64)>,
    pub iat_k: f64,
    pub tps: f64,
    pub config: Config,
}

/// Run a closed-loop tuning session to completion, registering it under a
/// fresh [`SessionId`] so its progress can be inspected via
/// [`get_session`] while it runs on another thread, or afterward.
///
/// This call blocks until the session reaches a terminal status. It
/// checks `cancel` at the top of every iteration; setting it from another
/// thread stops the loop promptly and leaves the session `Aborted`.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if `inputs.config` fails validation, or
/// if the VE tables' grids do not match `inputs.grid`. In-loop failures
/// (a rejected apply, an oscillation, a budget exhaustion) are recorded
/// as terminal session states, not returned as `Err`.
pub fn run_closed_loop(inputs: SessionInputs, cancel: Arc<AtomicBool>) -> Result<SessionId> {
    inputs.config.validate()?;
    if inputs.ve_ecu_front.grid() != &inputs.grid || inputs.ve_ecu_rear.grid() != &inputs.grid {
        return Err(Error::InvalidInput(
            "VE table dimensions do not match the session grid".to_owned(),
        ));
    }

    let id = next_session_id();
    {
        let mut guard = registry().lock().expect("session registry poisoned");
        guard.insert(id, Session::new(id));
    }
    with_session(id, |s| s.status = SessionStatus::Running);

    log::info!("orchestrator: session {id} starting");
    let outcome = drive(id, inputs, &cancel);

    with_session(id, |s| {
        s.status = outcome.status;
        s.failure_reason = outcome.failure_reason;
        s.final_ve_front = outcome.final_ve_front;
        s.final_ve_rear = outcome.final_ve_rear;
    });
    log::info!("orchestrator: session {id} finished as {:?}", outcome.status);

    Ok(id)
}

struct Outcome {
    status: SessionStatus,
    failure_reason: Option<String>,
    final_ve_front: Option<Table<VeUnit>>,
    final_ve_rear: Option<Table<VeUnit>>,
}

fn fail(reason: impl Into<String>) -> Outcome {
    Outcome {
        status: SessionStatus::Failed,
        failure_reason: Some(reason.into()),
        final_ve_front: None,
        final_ve_rear: None,
    }
}

#[allow(clippy::too_many_lines)]
fn drive(id: SessionId, mut inputs: SessionInputs, cancel: &Arc<AtomicBool>) -> Outcome {
    let grid = inputs.grid.clone();
    let config = inputs.config.clone();
    let n = grid.n_cells();

    let mut ve_front = inputs.ve_ecu_front.clone();
    let mut ve_rear = inputs.ve_ecu_rear.clone();
    inputs.virtual_ecu.set_ve_ecu_front(ve_front.clone());
    inputs.virtual_ecu.set_ve_ecu_rear(ve_rear.clone());

    let mut cumulative_front = vec![1.0_f64; n];
    let mut cumulative_rear = vec![1.0_f64; n];
    let mut prev_error_front: Option<f64> = None;
    let mut prev_error_rear: Option<f64> = None;

    let started = Instant::now();

    for iteration in 0..config.max_iterations {
        if cancel.load(Ordering::Relaxed) {
            log::info!("orchestrator: session {id} cancelled at iteration {iteration}");
            return Outcome {
                status: SessionStatus::Aborted,
                failure_reason: None,
                final_ve_front: Some(ve_front),
                final_ve_rear: Some(ve_rear),
            };
        }
        if started.elapsed().as_secs() > config.wall_clock_budget_sec {
            return Outcome {
                status: SessionStatus::TimedOut,
                failure_reason: Some("wall-clock budget exceeded".to_owned()),
                final_ve_front: Some(ve_front),
                final_ve_rear: Some(ve_rear),
            };
        }

        let samples = inputs
            .virtual_ecu
            .simulate_sweep(&inputs.sweep_points, inputs.iat_k, inputs.tps);

        let front_agg = aggregate(&samples, &grid, Cylinder::Front, &config);
        let rear_agg = aggregate(&samples, &grid, Cylinder::Rear, &config);

        let front_artifact = match correct(&front_agg.cells, &grid, &ve_front, &config) {
            Ok(a) => a,
            Err(e) => return fail(format!("front kernel: {e}")),
        };
        let rear_artifact = match correct(&rear_agg.cells, &grid, &ve_rear, &config) {
            Ok(a) => a,
            Err(e) => return fail(format!("rear kernel: {e}")),
        };

        let max_error_front = max_abs_afr_error(&front_agg.cells);
        let max_error_rear = max_abs_afr_error(&rear_agg.cells);
        let mean_error_front = mean_abs_afr_error(&front_agg.cells);
        let mean_error_rear = mean_abs_afr_error(&rear_agg.cells);
        let max_delta_front = max_abs_delta(&front_artifact.factor);
        let max_delta_rear = max_abs_delta(&rear_artifact.factor);

        let front_diag = diagnose(&front_artifact);
        let rear_diag = diagnose(&rear_artifact);

        with_session(id, |s| {
            s.iterations.push(IterationRecord {
                iteration,
                max_afr_error_front: max_error_front,
                max_afr_error_rear: max_error_rear,
                mean_afr_error_front: mean_error_front,
                mean_afr_error_rear: mean_error_rear,
                max_delta_front,
                max_delta_rear,
                clamp_fraction_front: front_diag.clamp_fraction,
                clamp_fraction_rear: rear_diag.clamp_fraction,
                artifact_sha_front: front_artifact.sha256.clone(),
                artifact_sha_rear: rear_artifact.sha256.clone(),
            });
        });

        let converged_front = converged_cells_fraction(&front_agg.cells, config.convergence_threshold_afr);
        let converged_rear = converged_cells_fraction(&rear_agg.cells, config.convergence_threshold_afr);

        if max_error_front <= config.convergence_threshold_afr
            && max_error_rear <= config.convergence_threshold_afr
            && converged_front > 0.9
            && converged_rear > 0.9
        {
            return Outcome {
                status: SessionStatus::Converged,
                failure_reason: None,
                final_ve_front: Some(ve_front),
                final_ve_rear: Some(ve_rear),
            };
        }

        if let Some(prev) = prev_error_front {
            if max_error_front > prev + config.oscillation_margin {
                return fail_with_oscillation(prev, max_error_front, config.oscillation_margin);
            }
        }
        if let Some(prev) = prev_error_rear {
            if max_error_rear > prev + config.oscillation_margin {
                return fail_with_oscillation(prev, max_error_rear, config.oscillation_margin);
            }
        }
        prev_error_front = Some(max_error_front);
        prev_error_rear = Some(max_error_rear);

        let (next_ve_front, front_meta) =
            match apply(&ve_front, &front_artifact, None, Some(&cumulative_front), false, &config) {
                Ok(r) => r,
                Err(e) => return fail(format!("front apply: {e}")),
            };
        let (next_ve_rear, rear_meta) =
            match apply(&ve_rear, &rear_artifact, None, Some(&cumulative_rear), false, &config) {
                Ok(r) => r,
                Err(e) => return fail(format!("rear apply: {e}")),
            };

        cumulative_front = meta_cumulative(&front_meta);
        cumulative_rear = meta_cumulative(&rear_meta);

        ve_front = next_ve_front;
        ve_rear = next_ve_rear;
        inputs.virtual_ecu.set_ve_ecu_front(ve_front.clone());
        inputs.virtual_ecu.set_ve_ecu_rear(ve_rear.clone());

        log::debug!(
            "orchestrator: session {id} iteration {iteration} max_afr_error front {max_error_front:.3} rear {max_error_rear:.3}"
        );
    }

    Outcome {
        status: SessionStatus::TimedOut,
        failure_reason: Some("max_iterations exhausted without convergence".to_owned()),
        final_ve_front: Some(ve_front),
        final_ve_rear: Some(ve_rear),
    }
}

fn meta_cumulative(meta: &ApplyMetadata) -> Vec<f64> {
    meta.cumulative.clone()
}

fn fail_with_oscillation(previous: f64, current: f64, margin: f64) -> Outcome {
    let err: Error = SafetyViolation::Oscillation {
        previous,
        current,
        margin,
    }
    .into();
    fail(err.to_string())
}

/// Diagnostics for the two most recent artifacts of a completed session,
/// if any iterations ran.
#[must_use]
pub fn last_iteration(session: &Session) -> Option<&IterationRecord> {
    session.iterations.last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid;
    use crate::table::AfrTargetUnit;
    use crate::virtual_ecu::CylinderModel;

    fn grid() -> Grid {
        Grid::new(vec![1000.0, 2000.0], vec![20.0, 40.0]).unwrap()
    }

    fn sweep() -> Vec<(f64, f64)> {
        let g = grid();
        let mut points = Vec::new();
        for _ in 0..30 {
            for &rpm in g.rpm_bins() {
                for &map_kpa in g.map_bins() {
                    points.push((rpm, map_kpa));
                }
            }
        }
        points
    }

    fn inputs(ve_actual: f64, ve_ecu: f64) -> SessionInputs {
        let grid = grid();
        let front = CylinderModel {
            ve_actual: Table::<VeUnit>::filled(grid.clone(), ve_actual).unwrap(),
            ve_ecu: Table::<VeUnit>::filled(grid.clone(), ve_ecu).unwrap(),
            afr_target: Table::<AfrTargetUnit>::filled(grid.clone(), 13.5).unwrap(),
        };
        let rear = CylinderModel {
            ve_actual: Table::<VeUnit>::filled(grid.clone(), ve_actual).unwrap(),
            ve_ecu: Table::<VeUnit>::filled(grid.clone(), ve_ecu).unwrap(),
            afr_target: Table::<AfrTargetUnit>::filled(grid.clone(), 13.5).unwrap(),
        };
        let virtual_ecu = VirtualEcu::new(front, rear, 0.0, 1);
        let mut config = Config::default();
        config.min_hits_for_full_weight = 5;

        SessionInputs {
            grid: grid.clone(),
            ve_ecu_front: Table::<VeUnit>::filled(grid.clone(), ve_ecu).unwrap(),
            ve_ecu_rear: Table::<VeUnit>::filled(grid.clone(), ve_ecu).unwrap(),
            virtual_ecu,
            sweep_points: sweep(),
            iat_k: 298.0,
            tps: 50.0,
            config,
        }
    }

    #[test]
    fn identity_session_converges_on_first_iteration() {
        let id = run_closed_loop(inputs(0.8, 0.8), Arc::new(AtomicBool::new(false))).unwrap();
        let session = get_session(id).unwrap();
        assert_eq!(session.status, SessionStatus::Converged);
        assert_eq!(session.iterations.len(), 1);
    }

    #[test]
    fn mismatched_ve_converges_after_several_iterations() {
        let id = run_closed_loop(inputs(0.85, 0.8), Arc::new(AtomicBool::new(false))).unwrap();
        let session = get_session(id).unwrap();
        assert_eq!(session.status, SessionStatus::Converged);
        assert!(session.iterations.len() > 1);
    }

    #[test]
    fn cancellation_is_honored() {
        let cancel = Arc::new(AtomicBool::new(true));
        let id = run_closed_loop(inputs(0.9, 0.8), cancel).unwrap();
        let session = get_session(id).unwrap();
        assert_eq!(session.status, SessionStatus::Aborted);
    }

    #[test]
    fn unknown_session_id_returns_none() {
        assert!(get_session(999_999_999).is_none());
    }

    #[test]
    fn invalid_config_is_rejected_before_a_session_is_created() {
        let mut bad = inputs(0.8, 0.8);
        bad.config.clamp_pct = 999.0;
        assert!(run_closed_loop(bad, Arc::new(AtomicBool::new(false))).is_err());
    }

    /// Scenario 4: oscillation detection. `fail_with_oscillation` is what
    /// `drive` calls the instant one iteration's `max_afr_error` grows past
    /// the previous one by more than `oscillation_margin` — exercised
    /// directly here since reproducing that growth through the real kernel
    /// and virtual ECU would need an adversarial kernel variant the core
    /// does not ship.
    #[test]
    fn oscillation_is_reported_as_a_failed_session() {
        let outcome = fail_with_oscillation(0.5, 1.2, 0.2);
        assert_eq!(outcome.status, SessionStatus::Failed);
        let reason = outcome.failure_reason.unwrap();
        assert!(reason.contains("oscillation"), "{reason}");
        assert!(reason.contains("0.5"));
        assert!(reason.contains("1.2"));
    }
}
