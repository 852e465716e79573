//! Service discovery: decoding the attributes of the peer's HID record
//!
//! 1. [`element`] - Data element reader (decode only)
//! 2. [`attribute`] - Byte-wise attribute assembly and fact extraction
//!
//! Only the three attributes a HID host needs are interpreted: the protocol
//! descriptor list (control PSM), the additional protocol descriptor lists
//! (interrupt PSM) and the HID descriptor list (report descriptor).

pub mod attribute;
pub mod element;

pub use attribute::{AttributeError, AttributeParser, DiscoveryFact, MAX_ATTRIBUTE_VALUE_SIZE};
pub use element::{DataElement, ElementError, ElementType};

pub const ATTRIBUTE_PROTOCOL_DESCRIPTOR_LIST: u16 = 0x0004;
pub const ATTRIBUTE_ADDITIONAL_PROTOCOL_DESCRIPTOR_LISTS: u16 = 0x000D;
pub const ATTRIBUTE_HID_DESCRIPTOR_LIST: u16 = 0x0206;

pub const UUID_L2CAP: u32 = 0x0100;

/// Human Interface Device service class
pub const SERVICE_CLASS_HID: u16 = 0x1124;
