//! Gamepad subsystem: turns HID input reports into normalized events
//!
//! Implements a three-stage decoding pipeline:
//!
//! 1. [`descriptor`] - Report descriptor layout and lazy field iteration
//! 2. [`report_decoder`] - Page-specific interpretation of every field
//! 3. [`usage_table`] / [`smoothing`] - Duplicate suppression and axis noise filtering
//!
//! # Architecture
//!
//! ```text
//! Input Report ──► Field Iterator ──► Page Interpreter ──► EventSink
//!  (0xA1 ...)      (page, usage,      (Keyboard / Hat /    (GamepadEvent)
//!                   value)             Axis / Button)
//! ```
//!
//! The decoder never blocks and never buffers: every accepted field either
//! produces exactly one event or nothing at all.

pub mod descriptor;
pub mod report_decoder;
pub mod smoothing;
pub mod usage_table;
pub mod usages;

use std::fmt::{self, Display};

pub use descriptor::{DescriptorError, ReportDescriptor, ReportField, ReportFields};
pub use report_decoder::{ReportDecoder, ReportError};
pub use smoothing::AxisFilter;
pub use usage_table::UsageStateTable;

/// HID usage pages the PG-9021 reports on
///
/// Closed set of page variants; every field is routed by matching on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsagePage {
    /// Generic Desktop: D-pad hat switch and thumbstick axes
    GenericDesktop,
    /// Keyboard/Keypad: the pad's "keyboard" mode
    Keyboard,
    /// Button: main gamepad buttons
    Button,
    /// Consumer: home, media and volume style buttons
    Consumer,
    /// Anything else, kept for diagnostics
    Unknown(u16),
}

impl UsagePage {
    pub const GENERIC_DESKTOP: u16 = 0x0001;
    pub const KEYBOARD: u16 = 0x0007;
    pub const BUTTON: u16 = 0x0009;
    pub const CONSUMER: u16 = 0x000C;

    /// Raw page number as found in the report descriptor
    pub fn code(self) -> u16 {
        match self {
            UsagePage::GenericDesktop => Self::GENERIC_DESKTOP,
            UsagePage::Keyboard => Self::KEYBOARD,
            UsagePage::Button => Self::BUTTON,
            UsagePage::Consumer => Self::CONSUMER,
            UsagePage::Unknown(code) => code,
        }
    }
}

impl From<u16> for UsagePage {
    fn from(code: u16) -> Self {
        match code {
            Self::GENERIC_DESKTOP => UsagePage::GenericDesktop,
            Self::KEYBOARD => UsagePage::Keyboard,
            Self::BUTTON => UsagePage::Button,
            Self::CONSUMER => UsagePage::Consumer,
            other => UsagePage::Unknown(other),
        }
    }
}

impl Display for UsagePage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsagePage::GenericDesktop => write!(f, "GenericDesktop"),
            UsagePage::Keyboard => write!(f, "Keyboard"),
            UsagePage::Button => write!(f, "Button"),
            UsagePage::Consumer => write!(f, "Consumer"),
            UsagePage::Unknown(code) => write!(f, "Unknown({:#06x})", code),
        }
    }
}

/// Normalized gamepad event handed to the application
///
/// `code` is the HID usage for buttons, keys and axes. For the D-pad it is
/// the hat direction value (see [`usages::dpad`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GamepadEvent {
    pub page: UsagePage,
    pub code: u16,
    pub value: i32,
    /// Set for thumbstick axes, where `value` is a position instead of 0/1
    pub analog: bool,
}

impl GamepadEvent {
    pub fn digital(page: UsagePage, code: u16, pressed: bool) -> Self {
        Self {
            page,
            code,
            value: i32::from(pressed),
            analog: false,
        }
    }

    pub fn is_pressed(&self) -> bool {
        !self.analog && self.value != 0
    }
}

/// Receiver of normalized events
///
/// Called synchronously from the decoding path, so implementations must not
/// block. Any `FnMut(GamepadEvent) + Send` closure is a sink.
pub trait EventSink: Send {
    fn on_event(&mut self, event: GamepadEvent);
}

impl<F> EventSink for F
where
    F: FnMut(GamepadEvent) + Send,
{
    fn on_event(&mut self, event: GamepadEvent) {
        self(event)
    }
}
