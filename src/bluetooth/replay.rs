//! Recording host stack and capture playback
//!
//! [`ReplayStack`] answers every request successfully, hands out channel ids
//! from [`FIRST_CHANNEL_ID`] upward and records what was asked of it. A
//! [`Capture`] is a TOML list of inbound notifications, typically written
//! from a sniffed session, that can be fed to the driver in order.
//!
//! ```toml
//! interval_ms = 5
//!
//! [[events]]
//! kind = "stack_ready"
//!
//! [[events]]
//! kind = "attribute"
//! attribute_id = 4
//! value = [0x35, 0x03, 0x19, 0x01, 0x00]
//!
//! [[events]]
//! kind = "data"
//! channel = 0x41
//! payload = [0xA1, 0x01]
//! ```

use super::{ChannelDirection, ChannelId, HostStack, PeripheralAddress, StackError, StackEvent};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// First local channel id handed out by [`ReplayStack`]
pub const FIRST_CHANNEL_ID: u16 = 0x0040;

/// One request made of the host stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackRequest {
    QueryService {
        address: PeripheralAddress,
        service_class: u16,
    },
    OpenChannel {
        address: PeripheralAddress,
        psm: u16,
        mtu: u16,
        channel: ChannelId,
    },
    CloseChannel(ChannelId),
    AcceptChannel(ChannelId),
    DeclineChannel(ChannelId),
    PinCodeResponse {
        address: PeripheralAddress,
        pin: String,
    },
    RegisterService {
        psm: u16,
        mtu: u16,
    },
}

/// Shared view of the requests a [`ReplayStack`] received
///
/// Stays readable after the stack itself moved into the driver task.
#[derive(Debug, Clone, Default)]
pub struct RequestLog(Arc<Mutex<Vec<StackRequest>>>);

impl RequestLog {
    fn push(&self, request: StackRequest) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
    }

    pub fn snapshot(&self) -> Vec<StackRequest> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Drain the recorded requests
    pub fn take(&self) -> Vec<StackRequest> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[derive(Debug)]
pub struct ReplayStack {
    log: RequestLog,
    next_channel: u16,
    refuse_channels: bool,
}

impl ReplayStack {
    pub fn new() -> Self {
        Self {
            log: RequestLog::default(),
            next_channel: FIRST_CHANNEL_ID,
            refuse_channels: false,
        }
    }

    /// Fail every `open_channel` request synchronously
    pub fn refusing_channels(mut self) -> Self {
        self.refuse_channels = true;
        self
    }

    pub fn log(&self) -> RequestLog {
        self.log.clone()
    }
}

impl Default for ReplayStack {
    fn default() -> Self {
        Self::new()
    }
}

impl HostStack for ReplayStack {
    fn query_service(
        &mut self,
        address: PeripheralAddress,
        service_class: u16,
    ) -> Result<(), StackError> {
        debug!("Replay: query {:#06x} on {}", service_class, address);
        self.log.push(StackRequest::QueryService {
            address,
            service_class,
        });
        Ok(())
    }

    fn open_channel(
        &mut self,
        address: PeripheralAddress,
        psm: u16,
        mtu: u16,
    ) -> Result<ChannelId, StackError> {
        if self.refuse_channels {
            return Err(StackError::ChannelRefused { psm, status: 0x04 });
        }
        let channel = ChannelId(self.next_channel);
        self.next_channel = self.next_channel.wrapping_add(1);
        debug!("Replay: open {} on PSM {:#06x}", channel, psm);
        self.log.push(StackRequest::OpenChannel {
            address,
            psm,
            mtu,
            channel,
        });
        Ok(channel)
    }

    fn close_channel(&mut self, channel: ChannelId) -> Result<(), StackError> {
        self.log.push(StackRequest::CloseChannel(channel));
        Ok(())
    }

    fn accept_channel(&mut self, channel: ChannelId) -> Result<(), StackError> {
        self.log.push(StackRequest::AcceptChannel(channel));
        Ok(())
    }

    fn decline_channel(&mut self, channel: ChannelId) -> Result<(), StackError> {
        self.log.push(StackRequest::DeclineChannel(channel));
        Ok(())
    }

    fn pin_code_response(
        &mut self,
        address: PeripheralAddress,
        pin: &str,
    ) -> Result<(), StackError> {
        self.log.push(StackRequest::PinCodeResponse {
            address,
            pin: pin.to_string(),
        });
        Ok(())
    }

    fn register_service(&mut self, psm: u16, mtu: u16) -> Result<(), StackError> {
        self.log.push(StackRequest::RegisterService { psm, mtu });
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Failed to read capture: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse capture: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Attribute {attribute_id:#06x} in capture is empty")]
    EmptyAttribute { attribute_id: u16 },
}

/// One recorded notification; attributes are stored whole
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureEvent {
    StackReady,
    Attribute {
        attribute_id: u16,
        value: Vec<u8>,
    },
    QueryComplete {
        #[serde(default)]
        status: u8,
    },
    IncomingChannel {
        psm: u16,
        channel: ChannelId,
    },
    ChannelOpened {
        psm: u16,
        channel: ChannelId,
        direction: ChannelDirection,
        #[serde(default)]
        status: u8,
    },
    ChannelClosed {
        channel: ChannelId,
    },
    PinCodeRequest {
        address: PeripheralAddress,
    },
    Data {
        channel: ChannelId,
        payload: Vec<u8>,
    },
}

impl CaptureEvent {
    /// Expand into the notifications the stack would have delivered
    fn into_stack_events(self) -> Result<Vec<StackEvent>, CaptureError> {
        let events = match self {
            CaptureEvent::StackReady => vec![StackEvent::StackReady],
            CaptureEvent::Attribute {
                attribute_id,
                value,
            } => {
                if value.is_empty() {
                    return Err(CaptureError::EmptyAttribute { attribute_id });
                }
                let total_length = value.len();
                value
                    .into_iter()
                    .enumerate()
                    .map(|(offset, byte)| StackEvent::AttributeByte {
                        attribute_id,
                        offset,
                        byte,
                        total_length,
                    })
                    .collect()
            }
            CaptureEvent::QueryComplete { status } => vec![StackEvent::QueryComplete { status }],
            CaptureEvent::IncomingChannel { psm, channel } => {
                vec![StackEvent::IncomingChannel { psm, channel }]
            }
            CaptureEvent::ChannelOpened {
                psm,
                channel,
                direction,
                status,
            } => vec![StackEvent::ChannelOpened {
                psm,
                channel,
                direction,
                status,
            }],
            CaptureEvent::ChannelClosed { channel } => vec![StackEvent::ChannelClosed { channel }],
            CaptureEvent::PinCodeRequest { address } => {
                vec![StackEvent::PinCodeRequest { address }]
            }
            CaptureEvent::Data { channel, payload } => vec![StackEvent::Data { channel, payload }],
        };
        Ok(events)
    }
}

/// A recorded session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capture {
    /// Pause between replayed notifications
    #[serde(default)]
    pub interval_ms: u64,
    #[serde(default)]
    pub events: Vec<CaptureEvent>,
}

impl Capture {
    pub fn load(path: &Path) -> Result<Self, CaptureError> {
        info!("Loading capture from {:?}", path);
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, CaptureError> {
        let capture: Capture = toml::from_str(content)?;
        debug!("Capture holds {} recorded events", capture.events.len());
        Ok(capture)
    }

    /// Flatten into the notification sequence to replay
    pub fn stack_events(&self) -> Result<Vec<StackEvent>, CaptureError> {
        let mut events = Vec::new();
        for event in self.events.iter().cloned() {
            events.extend(event.into_stack_events()?);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::{PSM_HID_CONTROL, PSM_HID_INTERRUPT};

    #[test]
    fn test_replay_stack_assigns_sequential_ids() {
        let mut stack = ReplayStack::new();
        let log = stack.log();
        let address = PeripheralAddress::default();

        let control = stack.open_channel(address, PSM_HID_CONTROL, 48).unwrap();
        let interrupt = stack.open_channel(address, PSM_HID_INTERRUPT, 48).unwrap();
        assert_eq!(control, ChannelId(FIRST_CHANNEL_ID));
        assert_eq!(interrupt, ChannelId(FIRST_CHANNEL_ID + 1));

        let requests = log.take();
        assert_eq!(requests.len(), 2);
        assert!(log.snapshot().is_empty());
    }

    #[test]
    fn test_refusing_stack() {
        let mut stack = ReplayStack::new().refusing_channels();
        assert!(matches!(
            stack.open_channel(PeripheralAddress::default(), PSM_HID_CONTROL, 48),
            Err(StackError::ChannelRefused { psm: PSM_HID_CONTROL, .. })
        ));
        assert!(stack.log().snapshot().is_empty());
    }

    #[test]
    fn test_capture_expands_attributes() {
        let capture = Capture::from_toml_str(
            r#"
            interval_ms = 5

            [[events]]
            kind = "stack_ready"

            [[events]]
            kind = "attribute"
            attribute_id = 4
            value = [0x35, 0x00]

            [[events]]
            kind = "query_complete"

            [[events]]
            kind = "channel_opened"
            psm = 0x11
            channel = 0x40
            direction = "outgoing"

            [[events]]
            kind = "data"
            channel = 0x41
            payload = [0xA1, 0x01]
            "#,
        )
        .unwrap();
        assert_eq!(capture.interval_ms, 5);

        let events = capture.stack_events().unwrap();
        assert_eq!(events.len(), 6);
        assert_eq!(events[0], StackEvent::StackReady);
        assert_eq!(
            events[2],
            StackEvent::AttributeByte {
                attribute_id: 4,
                offset: 1,
                byte: 0x00,
                total_length: 2,
            }
        );
        assert_eq!(events[3], StackEvent::QueryComplete { status: 0 });
        assert_eq!(
            events[4],
            StackEvent::ChannelOpened {
                psm: 0x11,
                channel: ChannelId(0x40),
                direction: ChannelDirection::Outgoing,
                status: 0,
            }
        );
    }

    #[test]
    fn test_capture_rejects_empty_attribute() {
        let capture = Capture {
            interval_ms: 0,
            events: vec![CaptureEvent::Attribute {
                attribute_id: 0x0206,
                value: Vec::new(),
            }],
        };
        assert!(matches!(
            capture.stack_events(),
            Err(CaptureError::EmptyAttribute {
                attribute_id: 0x0206
            })
        ));
    }
}
