use serde::{Deserialize, Serialize};

/// Cumulative wheel travel reported by a differential-drive base.
///
/// Travel values are odometry totals, not per-tick deltas, so a dropped frame
/// does not bias the integral: the next reading still carries the full distance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EncoderReading {
    /// Left wheel travel since power-up (meters)
    pub left_wheel_travel: f64,
    /// Right wheel travel since power-up (meters)
    pub right_wheel_travel: f64,
    /// Sensor timestamp (seconds)
    pub timestamp: f64,
}

impl EncoderReading {
    pub fn new(left_wheel_travel: f64, right_wheel_travel: f64, timestamp: f64) -> Self {
        Self {
            left_wheel_travel,
            right_wheel_travel,
            timestamp,
        }
    }
}

/// Immutable wheel encoder setup
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Distance between the wheel contact points (meters)
    pub wheelbase: f64,
    pub enabled: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            wheelbase: 0.5,
            enabled: false,
        }
    }
}
