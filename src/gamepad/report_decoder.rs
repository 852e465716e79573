//! Input report decoding and event normalization
//!
//! Every field of an input report is routed by its usage page to one
//! interpreter:
//!
//! | Page            | Interpreter          | Output                              |
//! |-----------------|----------------------|-------------------------------------|
//! | Keyboard        | [`KeyboardRollover`] | press/release of the active key     |
//! | Generic Desktop | [`DpadState`] / axis | hat direction, smoothed stick value |
//! | Button/Consumer | generic dispatch     | value on change                     |
//! | other           | none                 | diagnostic only                     |
//!
//! "Generic dispatch" means the value goes through the [`UsageStateTable`]
//! and an event is emitted only when it differs from the last one.

use super::descriptor::ReportDescriptor;
use super::smoothing::AxisFilter;
use super::usage_table::UsageStateTable;
use super::usages::{dpad, keyboard};
use super::{EventSink, GamepadEvent, UsagePage};
use tracing::{debug, trace, warn};

/// First byte of every HIDP input report (DATA | Input)
pub const INPUT_REPORT_MARKER: u8 = 0xA1;

/// Zero slots tolerated after a key before it counts as released
pub const KEYBOARD_ZERO_SLOTS: u8 = 5;

/// Reasons an input report is discarded
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReportError {
    #[error("Empty report")]
    Empty,

    #[error("Not an input report: header {0:#04x}")]
    BadMarker(u8),
}

/// Keyboard-mode rollover tracking
///
/// The pad reports one key at a time in a six-slot array; the empty slots
/// arrive as usage 0. A key counts as released once more than
/// [`KEYBOARD_ZERO_SLOTS`] zero slots follow it without another key.
#[derive(Debug, Default, Clone)]
pub struct KeyboardRollover {
    active_key: Option<u16>,
    zero_slots: u8,
}

impl KeyboardRollover {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn active_key(&self) -> Option<u16> {
        self.active_key
    }

    /// Feed one keyboard slot, returning the key event it completes
    pub fn feed(&mut self, usage: u16) -> Option<GamepadEvent> {
        if keyboard::MODIFIERS.contains(&usage) {
            return None;
        }

        if usage == 0 {
            self.zero_slots = self.zero_slots.saturating_add(1);
            if self.zero_slots <= KEYBOARD_ZERO_SLOTS {
                return None;
            }
            self.zero_slots = 0;
            return self
                .active_key
                .take()
                .map(|key| GamepadEvent::digital(UsagePage::Keyboard, key, false));
        }

        self.zero_slots = 0;
        if self.active_key == Some(usage) {
            return None;
        }
        self.active_key = Some(usage);
        Some(GamepadEvent::digital(UsagePage::Keyboard, usage, true))
    }
}

/// Active hat direction; only one direction is ever held
#[derive(Debug, Clone)]
pub struct DpadState {
    active: u16,
}

impl Default for DpadState {
    fn default() -> Self {
        Self {
            active: dpad::RELEASED,
        }
    }
}

impl DpadState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn active(&self) -> Option<u16> {
        (self.active != dpad::RELEASED).then_some(self.active)
    }

    /// Feed one hat value, returning the transition it causes
    pub fn feed(&mut self, value: i32) -> Option<GamepadEvent> {
        let value = u16::try_from(value).unwrap_or(dpad::RELEASED);

        if value == dpad::RELEASED {
            if self.active == dpad::RELEASED {
                return None;
            }
            let released = std::mem::replace(&mut self.active, dpad::RELEASED);
            return Some(GamepadEvent::digital(
                UsagePage::GenericDesktop,
                released,
                false,
            ));
        }

        if self.active == value {
            return None;
        }
        // Switching directions: the new press replaces the old one
        self.active = value;
        Some(GamepadEvent::digital(UsagePage::GenericDesktop, value, true))
    }
}

/// Decoding state for one session
#[derive(Debug, Default, Clone)]
pub struct ReportDecoder {
    usage_table: UsageStateTable,
    keyboard: KeyboardRollover,
    dpad: DpadState,
    axis_filter: AxisFilter,
}

impl ReportDecoder {
    pub fn new(axis_filter: AxisFilter) -> Self {
        Self {
            axis_filter,
            ..Default::default()
        }
    }

    /// Clear every remembered value, as at the start of a connection attempt
    pub fn reset(&mut self) {
        debug!("Resetting report decoder state");
        self.usage_table.reset();
        self.keyboard.reset();
        self.dpad.reset();
    }

    pub fn usage_table(&self) -> &UsageStateTable {
        &self.usage_table
    }

    /// Decode one raw interrupt-channel report
    ///
    /// Returns the number of events handed to `sink`.
    pub fn decode(
        &mut self,
        report: &[u8],
        descriptor: &ReportDescriptor,
        sink: &mut dyn EventSink,
    ) -> Result<usize, ReportError> {
        let (&marker, payload) = report.split_first().ok_or(ReportError::Empty)?;
        if marker != INPUT_REPORT_MARKER {
            return Err(ReportError::BadMarker(marker));
        }

        let mut emitted = 0;
        for field in descriptor.fields(payload) {
            let page = UsagePage::from(field.page);
            if let Some(event) = self.interpret(page, field.usage, field.value) {
                trace!("Dispatching {:?}", event);
                sink.on_event(event);
                emitted += 1;
            }
        }
        Ok(emitted)
    }

    fn interpret(&mut self, page: UsagePage, usage: u16, value: i32) -> Option<GamepadEvent> {
        match page {
            UsagePage::Keyboard => self.keyboard.feed(usage),
            UsagePage::GenericDesktop if usage == dpad::USAGE => self.dpad.feed(value),
            UsagePage::GenericDesktop => {
                let previous = self.usage_table.get(page, usage);
                let value = self.axis_filter.apply(previous, value);
                self.dispatch(page, usage, value, true)
            }
            UsagePage::Button | UsagePage::Consumer => self.dispatch(page, usage, value, false),
            UsagePage::Unknown(code) => {
                warn!(
                    "Unrecognized input: page {:#06x}, usage {:#06x}, value {}",
                    code, usage, value
                );
                None
            }
        }
    }

    /// Duplicate-suppressed dispatch through the usage table
    fn dispatch(
        &mut self,
        page: UsagePage,
        usage: u16,
        value: i32,
        analog: bool,
    ) -> Option<GamepadEvent> {
        self.usage_table
            .update(page, usage, value)
            .then_some(GamepadEvent {
                page,
                code: usage,
                value,
                analog,
            })
    }
}
