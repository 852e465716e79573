//! Bluetooth HID host: connection lifecycle over an injected host stack
//!
//! 1. [`session`] - Connection state machine and report routing
//! 2. [`driver`] - Tokio task owning the session, command marshaling
//! 3. [`replay`] - Recording host stack and capture playback
//!
//! # Architecture
//!
//! ```text
//! HostStack ──StackEvent──► DriverHandle ──► HidSession ──► EventSink
//!     ▲                      (mpsc)           │
//!     └────── requests ───────────────────────┘
//! ```

pub mod driver;
pub mod replay;
pub mod session;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use driver::{ConnectTrigger, DriverCommand, DriverError, DriverHandle};
pub use session::{ConnectionContext, ConnectionState, HidSession, SessionError, SessionSettings};

/// L2CAP PSM of the HID control channel
pub const PSM_HID_CONTROL: u16 = 0x0011;
/// L2CAP PSM of the HID interrupt channel
pub const PSM_HID_INTERRUPT: u16 = 0x0013;

pub const DEFAULT_CHANNEL_MTU: u16 = 48;

/// Status value of a successful completion
pub const STATUS_SUCCESS: u8 = 0x00;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StackError {
    #[error("Channel to PSM {psm:#06x} refused: status {status:#04x}")]
    ChannelRefused { psm: u16, status: u8 },

    #[error("Service query rejected: {0}")]
    QueryRejected(String),

    #[error("Unknown channel: {0}")]
    UnknownChannel(ChannelId),

    #[error("Transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid peripheral address '{0}', expected AA:BB:CC:DD:EE:FF")]
pub struct AddressParseError(String);

/// 6-byte hardware address of the paired peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeripheralAddress([u8; 6]);

impl PeripheralAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for PeripheralAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AddressParseError(s.to_string());
        let mut bytes = [0u8; 6];
        let mut parts = s.trim().split([':', '-']);

        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for PeripheralAddress {
    type Error = AddressParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeripheralAddress> for String {
    fn from(address: PeripheralAddress) -> Self {
        address.to_string()
    }
}

impl fmt::Display for PeripheralAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

/// Local channel identifier assigned by the host stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u16);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Which side initiated a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelDirection {
    Outgoing,
    Incoming,
}

/// Notifications delivered by the host stack, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    /// The stack finished powering up and can take requests
    StackReady,
    /// One byte of a discovery attribute value
    AttributeByte {
        attribute_id: u16,
        offset: usize,
        byte: u8,
        total_length: usize,
    },
    QueryComplete {
        status: u8,
    },
    /// The peer asks to open a channel on `psm`
    IncomingChannel {
        psm: u16,
        channel: ChannelId,
    },
    ChannelOpened {
        psm: u16,
        channel: ChannelId,
        direction: ChannelDirection,
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

/// Requests the driver makes of the host stack
///
/// Every call is non-blocking; outcomes arrive later as [`StackEvent`]s.
pub trait HostStack: Send {
    /// Query the protocol attributes of `service_class` on the peer
    fn query_service(
        &mut self,
        address: PeripheralAddress,
        service_class: u16,
    ) -> Result<(), StackError>;

    /// Start opening a channel, returning the local id it will use
    fn open_channel(
        &mut self,
        address: PeripheralAddress,
        psm: u16,
        mtu: u16,
    ) -> Result<ChannelId, StackError>;

    fn close_channel(&mut self, channel: ChannelId) -> Result<(), StackError>;

    fn accept_channel(&mut self, channel: ChannelId) -> Result<(), StackError>;

    fn decline_channel(&mut self, channel: ChannelId) -> Result<(), StackError>;

    fn pin_code_response(
        &mut self,
        address: PeripheralAddress,
        pin: &str,
    ) -> Result<(), StackError>;

    /// Accept incoming channels on `psm`
    fn register_service(&mut self, psm: u16, mtu: u16) -> Result<(), StackError>;
}
