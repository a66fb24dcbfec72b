//! `LogSample`: one ephemeral dyno-log record.
//!
//! Fields that may be missing use `Option`, never NaN-as-absent. Command
//! and measured AFR are split front/rear rather than a single cylinder.

use serde::{Deserialize, Serialize};

/// One scalar record from a dyno pull, after external CSV-sniffing /
/// vendor-specific normalization (out of scope for this core).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LogSample {
    pub rpm: Option<f64>,
    pub map_kpa: Option<f64>,
    pub tps: Option<f64>,
    pub afr_cmd_front: Option<f64>,
    pub afr_cmd_rear: Option<f64>,
    pub afr_meas_front: Option<f64>,
    pub afr_meas_rear: Option<f64>,
    pub spark_front: Option<f64>,
    pub spark_rear: Option<f64>,
    pub knock: Option<f64>,
    pub iat: Option<f64>,
    pub ect: Option<f64>,
    pub torque: Option<f64>,
    pub timestamp: Option<f64>,
}

/// Which cylinder bank a sample's fields refer to, used to select the
/// `afr_cmd_*`/`afr_meas_*`/`spark_*` pair during aggregation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cylinder {
    Front,
    Rear,
}

impl LogSample {
    /// The commanded/measured AFR pair for `cylinder`, if both present.
    #[must_use]
    pub fn afr_pair(&self, cylinder: Cylinder) -> Option<(f64, f64)> {
        match cylinder {
            Cylinder::Front => Some((self.afr_cmd_front?, self.afr_meas_front?)),
            Cylinder::Rear => Some((self.afr_cmd_rear?, self.afr_meas_rear?)),
        }
    }
}
