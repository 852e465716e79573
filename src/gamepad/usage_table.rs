//! Last reported value per usage, for duplicate suppression

use super::smoothing::AXIS_CENTER;
use super::usages::thumb;
use super::UsagePage;
use std::collections::HashMap;
use tracing::trace;

/// Per-usage store of the last value handed to the application
///
/// Unknown entries read as their initial value: thumb axes start centered,
/// everything else starts released (0).
#[derive(Debug, Default, Clone)]
pub struct UsageStateTable {
    values: HashMap<(UsagePage, u16), i32>,
}

impl UsageStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn initial_value(page: UsagePage, usage: u16) -> i32 {
        if page == UsagePage::GenericDesktop && thumb::ALL.contains(&usage) {
            AXIS_CENTER
        } else {
            0
        }
    }

    /// Forget every reported value
    pub fn reset(&mut self) {
        self.values.clear();
    }

    pub fn get(&self, page: UsagePage, usage: u16) -> i32 {
        self.values
            .get(&(page, usage))
            .copied()
            .unwrap_or_else(|| Self::initial_value(page, usage))
    }

    /// Store `value` if it differs from the stored one
    ///
    /// Returns `true` when the value changed, which is exactly when the
    /// caller must dispatch an event.
    pub fn update(&mut self, page: UsagePage, usage: u16, value: i32) -> bool {
        if self.get(page, usage) == value {
            trace!("Suppressed duplicate {} {:#06x} = {}", page, usage, value);
            return false;
        }
        self.values.insert((page, usage), value);
        true
    }
}
