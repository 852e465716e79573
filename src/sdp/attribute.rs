//! Incremental assembly of discovery attributes
//!
//! The host stack delivers attribute values one byte at a time. The parser
//! buffers them per attribute and, once the last byte of a known attribute
//! arrives, extracts the fact it carries.

use super::element::{DataElement, ElementError, ElementType};
use super::{
    ATTRIBUTE_ADDITIONAL_PROTOCOL_DESCRIPTOR_LISTS, ATTRIBUTE_HID_DESCRIPTOR_LIST,
    ATTRIBUTE_PROTOCOL_DESCRIPTOR_LIST, UUID_L2CAP,
};
use tracing::{debug, trace};

/// Largest attribute value the parser will assemble
pub const MAX_ATTRIBUTE_VALUE_SIZE: usize = 300;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttributeError {
    #[error(
        "Attribute {attribute_id:#06x} exceeds value buffer: available {capacity}, required {required}"
    )]
    Overflow {
        attribute_id: u16,
        capacity: usize,
        required: usize,
    },

    #[error("Attribute {attribute_id:#06x}: byte offset {offset} outside declared length {length}")]
    OffsetOutOfRange {
        attribute_id: u16,
        offset: usize,
        length: usize,
    },

    #[error("Attribute {attribute_id:#06x} is malformed: {source}")]
    Malformed {
        attribute_id: u16,
        source: ElementError,
    },
}

/// What a completed attribute told us about the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryFact {
    ControlPsm(u16),
    InterruptPsm(u16),
    ReportDescriptor(Vec<u8>),
}

/// Byte-wise attribute accumulator
#[derive(Debug, Clone)]
pub struct AttributeParser {
    buffer: [u8; MAX_ATTRIBUTE_VALUE_SIZE],
    attribute_id: Option<u16>,
    expected_length: usize,
    overflow_reported: bool,
}

impl Default for AttributeParser {
    fn default() -> Self {
        Self {
            buffer: [0; MAX_ATTRIBUTE_VALUE_SIZE],
            attribute_id: None,
            expected_length: 0,
            overflow_reported: false,
        }
    }
}

impl AttributeParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget any partially assembled attribute
    pub fn reset(&mut self) {
        self.attribute_id = None;
        self.expected_length = 0;
        self.overflow_reported = false;
    }

    /// Attribute currently being assembled
    pub fn current_attribute(&self) -> Option<u16> {
        self.attribute_id
    }

    /// Feed one attribute value byte
    ///
    /// Returns a fact when this byte completes a recognized attribute.
    /// Oversized attributes are reported on their first byte only and never
    /// written.
    pub fn push(
        &mut self,
        attribute_id: u16,
        offset: usize,
        byte: u8,
        total_length: usize,
    ) -> Result<Option<DiscoveryFact>, AttributeError> {
        if self.attribute_id != Some(attribute_id) || offset == 0 {
            self.attribute_id = Some(attribute_id);
            self.expected_length = total_length;
            self.overflow_reported = false;
        }

        if total_length > MAX_ATTRIBUTE_VALUE_SIZE {
            if self.overflow_reported {
                return Ok(None);
            }
            self.overflow_reported = true;
            return Err(AttributeError::Overflow {
                attribute_id,
                capacity: MAX_ATTRIBUTE_VALUE_SIZE,
                required: total_length,
            });
        }

        if offset >= total_length {
            return Err(AttributeError::OffsetOutOfRange {
                attribute_id,
                offset,
                length: total_length,
            });
        }

        self.buffer[offset] = byte;
        if offset + 1 != self.expected_length {
            return Ok(None);
        }

        trace!(
            "Attribute {:#06x} complete, {} bytes",
            attribute_id,
            self.expected_length
        );
        let value = &self.buffer[..self.expected_length];
        let fact = match attribute_id {
            ATTRIBUTE_PROTOCOL_DESCRIPTOR_LIST => {
                find_l2cap_psm(value, 0).map(|psm| psm.map(DiscoveryFact::ControlPsm))
            }
            ATTRIBUTE_ADDITIONAL_PROTOCOL_DESCRIPTOR_LISTS => {
                find_l2cap_psm(value, 1).map(|psm| psm.map(DiscoveryFact::InterruptPsm))
            }
            ATTRIBUTE_HID_DESCRIPTOR_LIST => {
                find_report_descriptor(value).map(|bytes| bytes.map(DiscoveryFact::ReportDescriptor))
            }
            other => {
                trace!("Ignoring attribute {:#06x}", other);
                Ok(None)
            }
        }
        .map_err(|source| AttributeError::Malformed {
            attribute_id,
            source,
        })?;

        match &fact {
            Some(DiscoveryFact::ControlPsm(psm)) => debug!("HID control PSM: {:#06x}", psm),
            Some(DiscoveryFact::InterruptPsm(psm)) => debug!("HID interrupt PSM: {:#06x}", psm),
            Some(DiscoveryFact::ReportDescriptor(bytes)) => {
                debug!("HID report descriptor: {} bytes", bytes.len())
            }
            None => {}
        }
        Ok(fact)
    }
}

/// Walk protocol descriptor lists `depth` sequences deep and return the PSM
/// following the L2CAP UUID
fn find_l2cap_psm(value: &[u8], depth: usize) -> Result<Option<u16>, ElementError> {
    let (root, _) = DataElement::parse(value)?;
    let mut lists = vec![root];
    for _ in 0..depth {
        let mut nested = Vec::new();
        for list in lists {
            for child in list.children() {
                let child = child?;
                if child.is_sequence() {
                    nested.push(child);
                }
            }
        }
        lists = nested;
    }

    let mut psm = None;
    for list in lists {
        for descriptor in list.children() {
            let descriptor = descriptor?;
            if !descriptor.is_sequence() {
                continue;
            }
            let mut protocol = descriptor.children();
            let Some(first) = protocol.next().transpose()? else {
                continue;
            };
            if first.as_uuid32() != Some(UUID_L2CAP) {
                continue;
            }
            if let Some(parameter) = protocol.next().transpose()? {
                match parameter.as_u16() {
                    Some(found) => psm = Some(found),
                    None => debug!("L2CAP protocol parameter is not a PSM: {:?}", parameter),
                }
            }
        }
    }
    Ok(psm)
}

/// Text element inside the nested HID descriptor list, the last one wins
fn find_report_descriptor(value: &[u8]) -> Result<Option<Vec<u8>>, ElementError> {
    let (root, _) = DataElement::parse(value)?;
    let mut descriptor = None;
    for entry in root.children() {
        let entry = entry?;
        if !entry.is_sequence() {
            continue;
        }
        for item in entry.children() {
            let item = item?;
            if item.kind() == ElementType::Text {
                descriptor = Some(item.payload().to_vec());
            }
        }
    }
    Ok(descriptor)
}
