//! Noise filter for the 8-bit thumbstick axes
//!
//! The sticks jitter by a few counts at rest and around the travel limits.
//! Samples are averaged with the last reported value, except at the three
//! fixed points (both extremes and center), which always pass unchanged so
//! a full deflection or a return to rest is never damped.

pub const AXIS_MIN: i32 = 0;
pub const AXIS_CENTER: i32 = 127;
pub const AXIS_MAX: i32 = 255;

/// Default width of the rest band around [`AXIS_CENTER`]
pub const DEFAULT_HYSTERESIS_BAND: i32 = 10;

/// Single-pole axis filter with extremal and center-hysteresis bypass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisFilter {
    enabled: bool,
    hysteresis_band: i32,
}

impl Default for AxisFilter {
    fn default() -> Self {
        Self {
            enabled: true,
            hysteresis_band: DEFAULT_HYSTERESIS_BAND,
        }
    }
}

impl AxisFilter {
    pub fn new(enabled: bool, hysteresis_band: i32) -> Self {
        Self {
            enabled,
            hysteresis_band: hysteresis_band.max(0),
        }
    }

    /// Pass-through filter, axis samples are reported as read
    pub fn disabled() -> Self {
        Self::new(false, 0)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Filter `sample` against the last reported value `previous`
    pub fn apply(&self, previous: i32, sample: i32) -> i32 {
        if !self.enabled {
            return sample;
        }

        if matches!(sample, AXIS_MIN | AXIS_CENTER | AXIS_MAX) {
            return sample;
        }

        // Held at rest: small excursions snap back to exactly center
        if previous == AXIS_CENTER && (sample - AXIS_CENTER).abs() < self.hysteresis_band {
            return AXIS_CENTER;
        }

        ((previous + sample) / 2).clamp(AXIS_MIN, AXIS_MAX)
    }
}
