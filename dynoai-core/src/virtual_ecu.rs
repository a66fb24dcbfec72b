//! Virtual ECU (C6): a deterministic physics simulator standing in for a
//! real engine + data logger, used to exercise the closed-loop
//! orchestrator without hardware.
//!
//! A hidden "actual VE" table diverges from the ECU's believed VE table;
//! measured AFR is computed from the ratio between them, reusing
//! [`Table::interpolate`] for the bilinear lookup rather than
//! reimplementing it. Simulated sensor noise comes from `rand_pcg` seeded
//! once per session: same seed, same stream, same trace, every run.

use crate::sample::LogSample;
use crate::table::{AfrTargetUnit, Table, VeUnit};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;

/// Specific gas constant for dry air, J/(kg*K).
const R_SPECIFIC_AIR: f64 = 287.058;

/// Approximate per-cylinder displacement used for the air-mass estimate
/// folded into simulated torque, liters.
const CYLINDER_DISPLACEMENT_L: f64 = 1.2;

/// One bank's static truth: the VE the engine actually has, the VE the
/// ECU currently believes, and the AFR target table it is trying to hit.
#[derive(Clone, Debug)]
pub struct CylinderModel {
    pub ve_actual: Table<VeUnit>,
    pub ve_ecu: Table<VeUnit>,
    pub afr_target: Table<AfrTargetUnit>,
}

impl CylinderModel {
    fn afr_measured(&self, rpm: f64, map_kpa: f64) -> f64 {
        let ve_actual = self.ve_actual.interpolate(rpm, map_kpa);
        let ve_ecu = self.ve_ecu.interpolate(rpm, map_kpa);
        let afr_target = self.afr_target.interpolate(rpm, map_kpa);
        afr_target * (ve_actual / ve_ecu)
    }
}

/// A deterministic virtual ECU + engine, simulating front and rear
/// cylinder banks independently over a fixed RPM/MAP grid.
pub struct VirtualEcu {
    pub front: CylinderModel,
    pub rear: CylinderModel,
    noise_std_afr: f64,
    rng: Pcg32,
}

impl VirtualEcu {
    /// Build a virtual ECU with independent front/rear models and a
    /// seeded noise generator; the same `seed` always produces the same
    /// sequence of simulated samples for the same operating points.
    #[must_use]
    pub fn new(front: CylinderModel, rear: CylinderModel, noise_std_afr: f64, seed: u64) -> Self {
        Self {
            front,
            rear,
            noise_std_afr,
            rng: Pcg32::seed_from_u64(seed),
        }
    }

    /// Draw one standard-normal sample via Box-Muller, using the shared
    /// deterministic RNG stream. `rand_distr` is not part of the stack;
    /// Box-Muller needs only `rand::Rng::gen::<f64>()`.
    fn standard_normal(&mut self) -> f64 {
        let u1: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = self.rng.gen_range(0.0..1.0);
        (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
    }

    fn noisy_afr(&mut self, ideal: f64) -> f64 {
        if self.noise_std_afr <= 0.0 {
            return ideal;
        }
        ideal + self.standard_normal() * self.noise_std_afr
    }

    /// Approximate per-intake-event air mass via the ideal gas law,
    /// folded into a synthetic torque reading. Not a precise engine
    /// model; only needs to be monotonic in MAP and VE for realism.
    fn synthetic_torque(ve: f64, map_kpa: f64, iat_k: f64) -> f64 {
        let volume_m3 = (CYLINDER_DISPLACEMENT_L / 1000.0) * ve;
        let pressure_pa = map_kpa * 1000.0;
        let mass_kg = pressure_pa * volume_m3 / (R_SPECIFIC_AIR * iat_k);
        mass_kg * 1.0e5
    }

    /// Simulate one dyno-log sample at a given operating point. `iat_k`
    /// and `tps` are passed through into the sample; both cylinder banks
    /// are simulated independently using the shared noise stream (so
    /// front and rear noise draws differ even at the same point).
    pub fn simulate_point(&mut self, rpm: f64, map_kpa: f64, iat_k: f64, tps: f64) -> LogSample {
        let afr_cmd_front = self.front.afr_target.interpolate(rpm, map_kpa);
        let afr_cmd_rear = self.rear.afr_target.interpolate(rpm, map_kpa);

        let ideal_front = self.front.afr_measured(rpm, map_kpa);
        let ideal_rear = self.rear.afr_measured(rpm, map_kpa);

        let afr_meas_front = self.noisy_afr(ideal_front);
        let afr_meas_rear = self.noisy_afr(ideal_rear);

        let ve_front = self.front.ve_actual.interpolate(rpm, map_kpa);
        let torque = Self::synthetic_torque(ve_front, map_kpa, iat_k);

        LogSample {
            rpm: Some(rpm),
            map_kpa: Some(map_kpa),
            tps: Some(tps),
            afr_cmd_front: Some(afr_cmd_front),
            afr_cmd_rear: Some(afr_cmd_rear),
            afr_meas_front: Some(afr_meas_front),
            afr_meas_rear: Some(afr_meas_rear),
            spark_front: None,
            spark_rear: None,
            knock: None,
            iat: Some(iat_k),
            ect: None,
            torque: Some(torque),
            timestamp: None,
        }
    }

    /// Simulate a full sweep of operating points in the order given.
    pub fn simulate_sweep(&mut self, points: &[(f64, f64)], iat_k: f64, tps: f64) -> Vec<LogSample> {
        points
            .iter()
            .map(|&(rpm, map_kpa)| self.simulate_point(rpm, map_kpa, iat_k, tps))
            .collect()
    }

    /// Write a correction back into the ECU's believed VE table for one
    /// bank, used by the closed-loop orchestrator's in-memory apply step.
    pub fn set_ve_ecu_front(&mut self, table: Table<VeUnit>) {
        self.front.ve_ecu = table;
    }

    /// As [`Self::set_ve_ecu_front`], for the rear bank.
    pub fn set_ve_ecu_rear(&mut self, table: Table<VeUnit>) {
        self.rear.ve_ecu = table;
    }
}
