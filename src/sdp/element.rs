//! Read-only view over SDP data elements
//!
//! A data element is a one byte header (type in the upper five bits, size
//! index in the lower three) followed by an optional length field and the
//! payload. Sequences and alternatives nest further elements in their
//! payload. Elements borrow from the attribute buffer; nothing is copied
//! until a caller asks for owned bytes.

use std::fmt;

/// Bluetooth base UUID tail (`-0000-1000-8000-00805F9B34FB`)
const BASE_UUID_TAIL: [u8; 12] = [
    0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5F, 0x9B, 0x34, 0xFB,
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ElementError {
    #[error("Element at byte {offset} needs {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Invalid size index {size_index} for {kind} element")]
    InvalidSize { kind: ElementType, size_index: u8 },
}

/// Data element type descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    Nil,
    UnsignedInt,
    SignedInt,
    Uuid,
    Text,
    Bool,
    Sequence,
    Alternative,
    Url,
    Reserved(u8),
}

impl From<u8> for ElementType {
    fn from(code: u8) -> Self {
        match code {
            0 => ElementType::Nil,
            1 => ElementType::UnsignedInt,
            2 => ElementType::SignedInt,
            3 => ElementType::Uuid,
            4 => ElementType::Text,
            5 => ElementType::Bool,
            6 => ElementType::Sequence,
            7 => ElementType::Alternative,
            8 => ElementType::Url,
            other => ElementType::Reserved(other),
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementType::Reserved(code) => write!(f, "reserved type {}", code),
            other => write!(f, "{:?}", other),
        }
    }
}

/// One decoded element borrowing its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataElement<'a> {
    kind: ElementType,
    payload: &'a [u8],
}

impl<'a> DataElement<'a> {
    /// Decode the element at the start of `bytes`
    ///
    /// Returns the element and the number of bytes it occupies, header
    /// included.
    pub fn parse(bytes: &'a [u8]) -> Result<(Self, usize), ElementError> {
        Self::parse_at(bytes, 0)
    }

    fn parse_at(bytes: &'a [u8], offset: usize) -> Result<(Self, usize), ElementError> {
        let truncated = |needed: usize| ElementError::Truncated {
            offset,
            needed,
            available: bytes.len(),
        };

        let header = *bytes.first().ok_or_else(|| truncated(1))?;
        let kind = ElementType::from(header >> 3);
        let size_index = header & 0x07;

        let (header_len, payload_len) = match size_index {
            0 if kind == ElementType::Nil => (1, 0),
            0 => (1, 1),
            1 => (1, 2),
            2 => (1, 4),
            3 => (1, 8),
            4 => (1, 16),
            5 | 6 | 7 => {
                let width = 1usize << (size_index - 5);
                let field = bytes.get(1..1 + width).ok_or_else(|| truncated(1 + width))?;
                let length = field
                    .iter()
                    .fold(0usize, |acc, &byte| (acc << 8) | usize::from(byte));
                (1 + width, length)
            }
            _ => unreachable!("size index is three bits"),
        };

        if kind == ElementType::Nil && size_index != 0 {
            return Err(ElementError::InvalidSize { kind, size_index });
        }
        if matches!(
            kind,
            ElementType::Text | ElementType::Sequence | ElementType::Alternative | ElementType::Url
        ) && size_index < 5
        {
            return Err(ElementError::InvalidSize { kind, size_index });
        }

        let total = header_len + payload_len;
        let payload = bytes.get(header_len..total).ok_or_else(|| truncated(total))?;
        Ok((Self { kind, payload }, total))
    }

    pub fn kind(&self) -> ElementType {
        self.kind
    }

    /// Raw payload, without header and length field
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    pub fn is_sequence(&self) -> bool {
        matches!(self.kind, ElementType::Sequence | ElementType::Alternative)
    }

    /// Nested elements of a sequence or alternative; empty for anything else
    pub fn children(&self) -> Children<'a> {
        Children {
            bytes: if self.is_sequence() { self.payload } else { &[] },
            position: 0,
            failed: false,
        }
    }

    /// Unsigned integer of at most 16 bits
    pub fn as_u16(&self) -> Option<u16> {
        match (self.kind, self.payload) {
            (ElementType::UnsignedInt, &[value]) => Some(u16::from(value)),
            (ElementType::UnsignedInt, &[high, low]) => Some(u16::from_be_bytes([high, low])),
            _ => None,
        }
    }

    /// UUID shortened to 32 bits
    ///
    /// 128-bit UUIDs only shorten when they are built on the Bluetooth base
    /// UUID.
    pub fn as_uuid32(&self) -> Option<u32> {
        if self.kind != ElementType::Uuid {
            return None;
        }
        match self.payload {
            &[a, b] => Some(u32::from(u16::from_be_bytes([a, b]))),
            &[a, b, c, d] => Some(u32::from_be_bytes([a, b, c, d])),
            long if long.len() == 16 && long[4..] == BASE_UUID_TAIL => {
                Some(u32::from_be_bytes([long[0], long[1], long[2], long[3]]))
            }
            _ => None,
        }
    }

    /// Bytes of a text string element
    pub fn as_text(&self) -> Option<&'a [u8]> {
        (self.kind == ElementType::Text).then_some(self.payload)
    }
}

/// Iterator over the elements nested in a sequence
///
/// Yields an error once and then stops if a child is malformed.
#[derive(Debug, Clone)]
pub struct Children<'a> {
    bytes: &'a [u8],
    position: usize,
    failed: bool,
}

impl<'a> Iterator for Children<'a> {
    type Item = Result<DataElement<'a>, ElementError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.position >= self.bytes.len() {
            return None;
        }
        match DataElement::parse_at(&self.bytes[self.position..], self.position) {
            Ok((element, length)) => {
                self.position += length;
                Some(Ok(element))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
