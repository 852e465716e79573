//! PG-9021 usage codes and their semantic names
//!
//! The pad reports in two modes. In gamepad mode it uses the Generic Desktop,
//! Button and Consumer pages. In keyboard mode (the iCade style switch
//! position) every control shows up as a key on the Keyboard page.

use super::UsagePage;

/// Consumer page (0x0C) buttons
pub mod misc {
    pub const HOME: u16 = 0x0223;
    pub const MINUS: u16 = 0x00EA;
    pub const PREV: u16 = 0x00B6;
    pub const PLAY: u16 = 0x00CD;
    pub const NEXT: u16 = 0x00B5;
    pub const PLUS: u16 = 0x00E9;
}

/// Keyboard page (0x07) codes sent in keyboard mode
pub mod keyboard {
    pub const DPAD_UP: u16 = 0x001A;
    pub const DPAD_DOWN: u16 = 0x0016;
    pub const DPAD_RIGHT: u16 = 0x0007;
    pub const DPAD_LEFT: u16 = 0x0004;

    pub const BUTTON_A: u16 = 0x001F;
    pub const BUTTON_B: u16 = 0x0020;
    pub const BUTTON_X: u16 = 0x001E;
    pub const BUTTON_Y: u16 = 0x0021;
    pub const SHOULDER_L: u16 = 0x0022;
    pub const SHOULDER_R: u16 = 0x0023;
    pub const TRIGGER_L: u16 = 0x0024;
    pub const TRIGGER_R: u16 = 0x0025;
    pub const THUMB_L: u16 = 0x0026;
    pub const THUMB_R: u16 = 0x0027;

    pub const START: u16 = 0x0028;
    pub const SELECT: u16 = 0x002A;

    pub const THUMB_L_UP: u16 = 0x0052;
    pub const THUMB_L_DOWN: u16 = 0x0051;
    pub const THUMB_L_RIGHT: u16 = 0x004F;
    pub const THUMB_L_LEFT: u16 = 0x0050;
    pub const THUMB_R_UP: u16 = 0x000C;
    pub const THUMB_R_DOWN: u16 = 0x000E;
    pub const THUMB_R_RIGHT: u16 = 0x000F;
    pub const THUMB_R_LEFT: u16 = 0x000D;

    /// Modifier keys (LeftControl..RightGUI); the pad pads its reports with them
    pub const MODIFIERS: std::ops::RangeInclusive<u16> = 0x00E0..=0x00E7;
}

/// Button page (0x09) codes
pub mod button {
    pub const A: u16 = 0x0001;
    pub const B: u16 = 0x0002;
    pub const C: u16 = 0x0003;
    pub const X: u16 = 0x0004;
    pub const Y: u16 = 0x0005;
    pub const Z: u16 = 0x0006;
    pub const SHOULDER_L: u16 = 0x0007;
    pub const SHOULDER_R: u16 = 0x0008;
    pub const TRIGGER_L: u16 = 0x0009;
    pub const TRIGGER_R: u16 = 0x000A;
    pub const SELECT: u16 = 0x000B;
    pub const START: u16 = 0x000C;
    pub const UNKNOWN: u16 = 0x000D;
    pub const THUMB_L: u16 = 0x000E;
    pub const THUMB_R: u16 = 0x000F;
}

/// Hat switch values on the Generic Desktop page
///
/// These are VALUES of the hat usage, not usages. The D-pad event carries
/// them as its code.
pub mod dpad {
    pub const USAGE: u16 = 0x0039;

    pub const UP: u16 = 0x0;
    pub const RIGHT: u16 = 0x2;
    pub const DOWN: u16 = 0x4;
    pub const LEFT: u16 = 0x6;
    /// Null state of the hat, reported while no direction is held
    pub const RELEASED: u16 = 0x8;
}

/// Thumbstick axes on the Generic Desktop page, 0..=255 with 127 at rest
pub mod thumb {
    pub const L_X: u16 = 0x0030;
    pub const L_Y: u16 = 0x0031;
    pub const R_X: u16 = 0x0032;
    pub const R_Y: u16 = 0x0035;

    pub const ALL: [u16; 4] = [L_X, L_Y, R_X, R_Y];
}

/// Semantic name of an event code, if the pad is known to send it
pub fn usage_name(page: UsagePage, code: u16) -> Option<&'static str> {
    let name = match page {
        UsagePage::Keyboard => match code {
            keyboard::DPAD_UP => "KB_DPAD_UP",
            keyboard::DPAD_DOWN => "KB_DPAD_DOWN",
            keyboard::DPAD_RIGHT => "KB_DPAD_RIGHT",
            keyboard::DPAD_LEFT => "KB_DPAD_LEFT",
            keyboard::BUTTON_A => "KB_BUTTON_A",
            keyboard::BUTTON_B => "KB_BUTTON_B",
            keyboard::BUTTON_X => "KB_BUTTON_X",
            keyboard::BUTTON_Y => "KB_BUTTON_Y",
            keyboard::SHOULDER_L => "KB_BUTTON_SHOULDER_L",
            keyboard::SHOULDER_R => "KB_BUTTON_SHOULDER_R",
            keyboard::TRIGGER_L => "KB_BUTTON_TRIGGER_L",
            keyboard::TRIGGER_R => "KB_BUTTON_TRIGGER_R",
            keyboard::THUMB_L => "KB_BUTTON_THUMB_L",
            keyboard::THUMB_R => "KB_BUTTON_THUMB_R",
            keyboard::START => "KB_MISC_BUTTON_START",
            keyboard::SELECT => "KB_MISC_BUTTON_SELECT",
            keyboard::THUMB_L_UP => "KB_THUMB_L_UP",
            keyboard::THUMB_L_DOWN => "KB_THUMB_L_DOWN",
            keyboard::THUMB_L_RIGHT => "KB_THUMB_L_RIGHT",
            keyboard::THUMB_L_LEFT => "KB_THUMB_L_LEFT",
            keyboard::THUMB_R_UP => "KB_THUMB_R_UP",
            keyboard::THUMB_R_DOWN => "KB_THUMB_R_DOWN",
            keyboard::THUMB_R_RIGHT => "KB_THUMB_R_RIGHT",
            keyboard::THUMB_R_LEFT => "KB_THUMB_R_LEFT",
            _ => return None,
        },
        UsagePage::Consumer => match code {
            misc::HOME => "MISC_BUTTON_HOME",
            misc::MINUS => "MISC_BUTTON_MINUS",
            misc::PREV => "MISC_BUTTON_PREV",
            misc::PLAY => "MISC_BUTTON_PLAY",
            misc::NEXT => "MISC_BUTTON_NEXT",
            misc::PLUS => "MISC_BUTTON_PLUS",
            _ => return None,
        },
        UsagePage::Button => match code {
            button::A => "GP_BUTTON_A",
            button::B => "GP_BUTTON_B",
            button::C => "GP_BUTTON_C",
            button::X => "GP_BUTTON_X",
            button::Y => "GP_BUTTON_Y",
            button::Z => "GP_BUTTON_Z",
            button::SHOULDER_L => "GP_BUTTON_SHOULDER_L",
            button::SHOULDER_R => "GP_BUTTON_SHOULDER_R",
            button::TRIGGER_L => "GP_BUTTON_TRIGGER_L",
            button::TRIGGER_R => "GP_BUTTON_TRIGGER_R",
            button::UNKNOWN => "GP_BUTTON_UNKNOWN",
            button::THUMB_L => "GP_BUTTON_THUMB_L",
            button::THUMB_R => "GP_BUTTON_THUMB_R",
            button::START => "GP_MISC_BUTTON_START",
            button::SELECT => "GP_MISC_BUTTON_SELECT",
            _ => return None,
        },
        UsagePage::GenericDesktop => match code {
            dpad::UP => "GP_DPAD_UP",
            dpad::DOWN => "GP_DPAD_DOWN",
            dpad::RIGHT => "GP_DPAD_RIGHT",
            dpad::LEFT => "GP_DPAD_LEFT",
            thumb::L_X => "GP_THUMB_L_X",
            thumb::L_Y => "GP_THUMB_L_Y",
            thumb::R_X => "GP_THUMB_R_X",
            thumb::R_Y => "GP_THUMB_R_Y",
            _ => return None,
        },
        UsagePage::Unknown(_) => return None,
    };
    Some(name)
}
