//! HID report descriptor layout and report field iteration
//!
//! Parses a report descriptor once into a flat list of input field groups and
//! walks raw input reports against it, yielding one `(page, usage, value)`
//! triple per field.
//!
//! ## Supported items
//!
//! - Main: Input, Output, Feature, Collection, End Collection
//! - Global: Usage Page, Logical Minimum/Maximum, Report Size, Report ID,
//!   Report Count, Push, Pop (physical and unit items are skipped)
//! - Local: Usage (16-bit and 32-bit extended), Usage Minimum/Maximum
//!
//! ## Field semantics
//!
//! - Variable fields yield their bit value against their own usage, sign
//!   extended when the logical minimum is negative.
//! - Array fields yield the selected usage with value 1. Empty slots and
//!   out-of-range indices yield usage 0 with value 0.
//! - Constant fields are padding and are skipped.
//! - Collections are flattened; Output and Feature items only reset locals.

use std::collections::HashMap;
use tracing::{debug, trace};

// Item prefixes with the size bits masked off
const ITEM_INPUT: u8 = 0x80;
const ITEM_OUTPUT: u8 = 0x90;
const ITEM_FEATURE: u8 = 0xB0;
const ITEM_COLLECTION: u8 = 0xA0;
const ITEM_END_COLLECTION: u8 = 0xC0;
const ITEM_USAGE_PAGE: u8 = 0x04;
const ITEM_LOGICAL_MINIMUM: u8 = 0x14;
const ITEM_LOGICAL_MAXIMUM: u8 = 0x24;
const ITEM_REPORT_SIZE: u8 = 0x74;
const ITEM_REPORT_ID: u8 = 0x84;
const ITEM_REPORT_COUNT: u8 = 0x94;
const ITEM_PUSH: u8 = 0xA4;
const ITEM_POP: u8 = 0xB4;
const ITEM_USAGE: u8 = 0x08;
const ITEM_USAGE_MINIMUM: u8 = 0x18;
const ITEM_USAGE_MAXIMUM: u8 = 0x28;
const LONG_ITEM_PREFIX: u8 = 0xFE;

const FLAG_CONSTANT: u32 = 0x01;
const FLAG_VARIABLE: u32 = 0x02;

/// Widest field value that fits the `i32` event value
const MAX_FIELD_BITS: u32 = 32;

/// Largest Report Count accepted on one Input item
pub const MAX_REPORT_COUNT: u32 = 65_535;

/// Errors raised while parsing a report descriptor
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("Item at offset {offset} truncated: needs {needed} data bytes")]
    Truncated { offset: usize, needed: usize },

    #[error("Pop without matching Push at offset {0}")]
    UnbalancedPop(usize),

    #[error("Report size of {0} bits is wider than 32")]
    FieldTooWide(u32),

    #[error("Report count {count} at offset {offset} exceeds {max}", max = MAX_REPORT_COUNT)]
    ReportCountTooLarge { offset: usize, count: u32 },

    #[error("Input layout of report {report_id} overflows at offset {offset}")]
    LayoutOverflow { offset: usize, report_id: u8 },
}

/// One typed field read from an input report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportField {
    pub page: u16,
    pub usage: u16,
    pub value: i32,
}

#[derive(Debug, Clone, Copy, Default)]
struct GlobalState {
    usage_page: u16,
    logical_minimum: i32,
    logical_maximum: i32,
    report_size: u32,
    report_count: u32,
    report_id: u8,
}

#[derive(Debug, Clone, Default)]
struct LocalState {
    usages: Vec<(u16, u16)>,
    usage_minimum: Option<(u16, u16)>,
    usage_maximum: Option<u16>,
}

/// A run of `count` equally sized fields declared by one Input item
#[derive(Debug, Clone)]
struct FieldGroup {
    report_id: u8,
    bit_offset: u32,
    size: u32,
    count: u32,
    logical_minimum: i32,
    logical_maximum: i32,
    variable: bool,
    usages: Vec<(u16, u16)>,
    usage_range: Option<(u16, u16, u16)>,
}

impl FieldGroup {
    /// Usage assigned to the field at `index` of a variable group
    fn variable_usage(&self, index: u32) -> (u16, u16) {
        if let Some((page, minimum, maximum)) = self.usage_range {
            let usage = u32::from(minimum) + index;
            return (page, usage.min(u32::from(maximum)) as u16);
        }
        // Fewer usages than fields: the last usage repeats
        match self.usages.get(index as usize).or(self.usages.last()) {
            Some(&usage) => usage,
            None => (0, 0),
        }
    }

    /// Usage selected by an array field holding `raw`
    fn array_usage(&self, raw: i32) -> Option<(u16, u16)> {
        if raw < self.logical_minimum || raw > self.logical_maximum {
            return None;
        }
        let index = i64::from(raw) - i64::from(self.logical_minimum);
        if let Some((page, minimum, maximum)) = self.usage_range {
            let usage = i64::from(minimum) + index;
            return (usage <= i64::from(maximum)).then_some((page, usage as u16));
        }
        usize::try_from(index)
            .ok()
            .and_then(|index| self.usages.get(index))
            .copied()
    }

    fn signed(&self) -> bool {
        self.logical_minimum < 0
    }
}

/// Parsed input layout of a report descriptor
#[derive(Debug, Clone, Default)]
pub struct ReportDescriptor {
    groups: Vec<FieldGroup>,
    uses_report_ids: bool,
}

impl ReportDescriptor {
    /// Parse the raw descriptor bytes supplied by the peer
    pub fn parse(bytes: &[u8]) -> Result<Self, DescriptorError> {
        let mut global = GlobalState::default();
        let mut global_stack: Vec<GlobalState> = Vec::new();
        let mut local = LocalState::default();
        let mut bit_offsets: HashMap<u8, u32> = HashMap::new();
        let mut groups = Vec::new();
        let mut uses_report_ids = false;

        let mut offset = 0;
        while offset < bytes.len() {
            let prefix = bytes[offset];

            if prefix == LONG_ITEM_PREFIX {
                // Long items carry vendor data only
                let size = *bytes
                    .get(offset + 1)
                    .ok_or(DescriptorError::Truncated { offset, needed: 2 })?
                    as usize;
                offset += 3 + size;
                continue;
            }

            let size = match prefix & 0x03 {
                3 => 4,
                n => n as usize,
            };
            let data = bytes
                .get(offset + 1..offset + 1 + size)
                .ok_or(DescriptorError::Truncated {
                    offset,
                    needed: size,
                })?;
            let unsigned = data
                .iter()
                .rev()
                .fold(0u32, |acc, &byte| (acc << 8) | u32::from(byte));
            let signed = sign_extend(unsigned, (size * 8) as u32);

            match prefix & 0xFC {
                ITEM_INPUT => {
                    if global.report_size > MAX_FIELD_BITS {
                        return Err(DescriptorError::FieldTooWide(global.report_size));
                    }
                    if global.report_count > MAX_REPORT_COUNT {
                        return Err(DescriptorError::ReportCountTooLarge {
                            offset,
                            count: global.report_count,
                        });
                    }
                    let overflow = DescriptorError::LayoutOverflow {
                        offset,
                        report_id: global.report_id,
                    };
                    let bits = global
                        .report_size
                        .checked_mul(global.report_count)
                        .ok_or_else(|| overflow.clone())?;
                    let bit_offset = bit_offsets.entry(global.report_id).or_insert(0);
                    let next_offset = bit_offset.checked_add(bits).ok_or(overflow)?;

                    if unsigned & FLAG_CONSTANT == 0 && bits > 0 {
                        groups.push(FieldGroup {
                            report_id: global.report_id,
                            bit_offset: *bit_offset,
                            size: global.report_size,
                            count: global.report_count,
                            logical_minimum: global.logical_minimum,
                            logical_maximum: global.logical_maximum,
                            variable: unsigned & FLAG_VARIABLE != 0,
                            usages: std::mem::take(&mut local.usages),
                            usage_range: local.usage_minimum.map(|(page, minimum)| {
                                (page, minimum, local.usage_maximum.unwrap_or(minimum))
                            }),
                        });
                    }
                    *bit_offset = next_offset;
                    local = LocalState::default();
                }
                ITEM_OUTPUT | ITEM_FEATURE | ITEM_COLLECTION | ITEM_END_COLLECTION => {
                    local = LocalState::default();
                }
                ITEM_USAGE_PAGE => global.usage_page = unsigned as u16,
                ITEM_LOGICAL_MINIMUM => global.logical_minimum = signed,
                ITEM_LOGICAL_MAXIMUM => {
                    // Maximum is only negative when the minimum is
                    global.logical_maximum = if global.logical_minimum < 0 {
                        signed
                    } else {
                        unsigned as i32
                    };
                }
                ITEM_REPORT_SIZE => global.report_size = unsigned,
                ITEM_REPORT_ID => {
                    global.report_id = unsigned as u8;
                    uses_report_ids = true;
                }
                ITEM_REPORT_COUNT => global.report_count = unsigned,
                ITEM_PUSH => global_stack.push(global),
                ITEM_POP => {
                    global = global_stack
                        .pop()
                        .ok_or(DescriptorError::UnbalancedPop(offset))?;
                }
                ITEM_USAGE => local.usages.push(split_usage(unsigned, size, global.usage_page)),
                ITEM_USAGE_MINIMUM => {
                    local.usage_minimum = Some(split_usage(unsigned, size, global.usage_page));
                }
                ITEM_USAGE_MAXIMUM => {
                    local.usage_maximum = Some(split_usage(unsigned, size, global.usage_page).1);
                }
                other => trace!("Skipping descriptor item {:#04x} at {}", other, offset),
            }

            offset += 1 + size;
        }

        debug!(
            "Parsed report descriptor: {} input groups, report ids: {}",
            groups.len(),
            uses_report_ids
        );

        Ok(Self {
            groups,
            uses_report_ids,
        })
    }

    pub fn uses_report_ids(&self) -> bool {
        self.uses_report_ids
    }

    /// Number of non-padding input fields across all reports
    pub fn input_field_count(&self) -> usize {
        self.groups.iter().map(|group| group.count as usize).sum()
    }

    /// Iterate the fields of one input report (marker byte already stripped)
    pub fn fields<'a>(&'a self, report: &'a [u8]) -> ReportFields<'a> {
        let (report_id, payload) = if self.uses_report_ids {
            match report.split_first() {
                Some((&id, rest)) => (id, rest),
                None => (0, report),
            }
        } else {
            (0, report)
        };

        ReportFields {
            groups: &self.groups,
            report_id,
            payload,
            group: 0,
            index: 0,
            exhausted: self.uses_report_ids && report.is_empty(),
        }
    }
}

/// Lazy iterator over the fields of one report
///
/// Finite and cheap to recreate: call [`ReportDescriptor::fields`] again to
/// walk the same report from the start.
#[derive(Debug, Clone)]
pub struct ReportFields<'a> {
    groups: &'a [FieldGroup],
    report_id: u8,
    payload: &'a [u8],
    group: usize,
    index: u32,
    exhausted: bool,
}

impl Iterator for ReportFields<'_> {
    type Item = ReportField;

    fn next(&mut self) -> Option<ReportField> {
        if self.exhausted {
            return None;
        }

        loop {
            let group = self.groups.get(self.group)?;

            if group.report_id != self.report_id || self.index >= group.count {
                self.group += 1;
                self.index = 0;
                continue;
            }

            let start =
                u64::from(group.bit_offset) + u64::from(self.index) * u64::from(group.size);
            if start + u64::from(group.size) > self.payload.len() as u64 * 8 {
                // Report shorter than its layout, nothing further is readable
                trace!("Report ends at bit {}, layout continues", start);
                self.exhausted = true;
                return None;
            }

            let raw = read_bits(self.payload, start, group.size);
            let value = if group.signed() {
                sign_extend(raw, group.size)
            } else {
                raw as i32
            };
            let index = self.index;
            self.index += 1;

            let field = if group.variable {
                let (page, usage) = group.variable_usage(index);
                ReportField { page, usage, value }
            } else {
                match group.array_usage(value) {
                    Some((page, usage)) if usage != 0 => ReportField {
                        page,
                        usage,
                        value: 1,
                    },
                    _ => ReportField {
                        page: group
                            .usage_range
                            .map(|(page, _, _)| page)
                            .or(group.usages.first().map(|&(page, _)| page))
                            .unwrap_or(0),
                        usage: 0,
                        value: 0,
                    },
                }
            };
            return Some(field);
        }
    }
}

/// Page and usage of a local usage item; 4-byte items carry their own page
fn split_usage(data: u32, size: usize, usage_page: u16) -> (u16, u16) {
    if size == 4 {
        ((data >> 16) as u16, data as u16)
    } else {
        (usage_page, data as u16)
    }
}

fn sign_extend(value: u32, bits: u32) -> i32 {
    if bits == 0 || bits >= 32 {
        return value as i32;
    }
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// Little-endian bit read of `size` bits starting at bit `start`
///
/// Bits past the end of `bytes` read as zero.
fn read_bits(bytes: &[u8], start: u64, size: u32) -> u32 {
    (0..size).fold(0u32, |acc, bit| {
        let position = start + u64::from(bit);
        let byte = usize::try_from(position >> 3)
            .ok()
            .and_then(|index| bytes.get(index))
            .copied()
            .unwrap_or(0);
        if byte & (1 << (position & 7)) != 0 {
            acc | (1 << bit)
        } else {
            acc
        }
    })
}
