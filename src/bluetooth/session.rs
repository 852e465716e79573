//! HID host session: the connection state machine
//!
//! # State Machine
//!
//! ```text
//! Idle ──► DiscoveringProtocols ──► OpeningControlChannel ──► OpeningInterruptChannel
//!  ▲              │                                                     │
//!  │              └──(already connected)──► Connected ◄──┬──────────────┤
//!  │                                           │         │              ▼
//!  └───────────── Closing ◄────(channel closed)┘    DiscoveringDescriptor
//! ```
//!
//! Every host stack notification goes through [`HidSession::handle`]. Nothing
//! in here blocks or waits; requests to the stack return immediately and
//! their outcome arrives as a later notification.

use super::{
    ChannelDirection, ChannelId, HostStack, PeripheralAddress, StackError, StackEvent,
    DEFAULT_CHANNEL_MTU, PSM_HID_CONTROL, PSM_HID_INTERRUPT, STATUS_SUCCESS,
};
use crate::gamepad::{AxisFilter, EventSink, ReportDecoder, ReportDescriptor, ReportError};
use crate::sdp::{
    AttributeError, AttributeParser, DiscoveryFact, MAX_ATTRIBUTE_VALUE_SIZE, SERVICE_CLASS_HID,
};
use std::fmt;
use tracing::{debug, error, info, trace, warn};

/// Default legacy pairing PIN of the pad
pub const DEFAULT_PIN_CODE: &str = "0000";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Host stack error: {0}")]
    Stack(#[from] StackError),

    #[error("Discovery attribute error: {0}")]
    Attribute(#[from] AttributeError),

    #[error("Report discarded: {0}")]
    Report(#[from] ReportError),

    #[error("No {0} PSM discovered and no fallback configured")]
    UnresolvedPsm(&'static str),

    #[error("Service discovery failed: status {0:#04x}")]
    DiscoveryFailed(u8),

    #[error("Channel to PSM {psm:#06x} failed to open: status {status:#04x}")]
    ChannelFailed { psm: u16, status: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    DiscoveringProtocols,
    OpeningControlChannel,
    OpeningInterruptChannel,
    DiscoveringDescriptor,
    Connected,
    /// One channel closed, waiting for the other
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::DiscoveringProtocols => "Discovering protocols",
            ConnectionState::OpeningControlChannel => "Opening control channel",
            ConnectionState::OpeningInterruptChannel => "Opening interrupt channel",
            ConnectionState::DiscoveringDescriptor => "Discovering descriptor",
            ConnectionState::Connected => "Connected",
            ConnectionState::Closing => "Closing",
        };
        write!(f, "{}", name)
    }
}

/// What the session knows about the link to the peer
#[derive(Debug, Clone, Default)]
pub struct ConnectionContext {
    control_channel: Option<ChannelId>,
    interrupt_channel: Option<ChannelId>,
    control_psm: Option<u16>,
    interrupt_psm: Option<u16>,
    descriptor: Vec<u8>,
    layout: ReportDescriptor,
}

impl ConnectionContext {
    pub fn control_channel(&self) -> Option<ChannelId> {
        self.control_channel
    }

    pub fn interrupt_channel(&self) -> Option<ChannelId> {
        self.interrupt_channel
    }

    pub fn control_psm(&self) -> Option<u16> {
        self.control_psm
    }

    pub fn interrupt_psm(&self) -> Option<u16> {
        self.interrupt_psm
    }

    pub fn channels_open(&self) -> bool {
        self.control_channel.is_some() && self.interrupt_channel.is_some()
    }

    /// Raw report descriptor; empty until discovered
    pub fn descriptor(&self) -> &[u8] {
        &self.descriptor
    }

    pub fn descriptor_known(&self) -> bool {
        !self.descriptor.is_empty()
    }

    pub fn layout(&self) -> &ReportDescriptor {
        &self.layout
    }

    fn store_descriptor(&mut self, bytes: Vec<u8>) {
        if bytes.len() > MAX_ATTRIBUTE_VALUE_SIZE {
            warn!(
                "Report descriptor of {} bytes exceeds {} byte capacity, dropped",
                bytes.len(),
                MAX_ATTRIBUTE_VALUE_SIZE
            );
            return;
        }
        self.layout = match ReportDescriptor::parse(&bytes) {
            Ok(layout) => layout,
            Err(e) => {
                error!("Unusable report descriptor, reports will be ignored: {}", e);
                ReportDescriptor::default()
            }
        };
        self.descriptor = bytes;
    }

    fn clear_descriptor(&mut self) {
        self.descriptor.clear();
        self.layout = ReportDescriptor::default();
    }
}

/// Fixed parameters of a session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub address: PeripheralAddress,
    pub pin_code: String,
    pub channel_mtu: u16,
    /// Used when discovery yields no control PSM; `None` aborts instead
    pub fallback_control_psm: Option<u16>,
    /// Used when discovery yields no interrupt PSM; `None` aborts instead
    pub fallback_interrupt_psm: Option<u16>,
    pub axis_filter: AxisFilter,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            address: PeripheralAddress::default(),
            pin_code: DEFAULT_PIN_CODE.to_string(),
            channel_mtu: DEFAULT_CHANNEL_MTU,
            fallback_control_psm: Some(PSM_HID_CONTROL),
            fallback_interrupt_psm: Some(PSM_HID_INTERRUPT),
            axis_filter: AxisFilter::default(),
        }
    }
}

/// Single-peripheral HID host session
pub struct HidSession {
    settings: SessionSettings,
    state: ConnectionState,
    context: ConnectionContext,
    parser: AttributeParser,
    decoder: ReportDecoder,
    sink: Box<dyn EventSink>,
}

impl fmt::Debug for HidSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HidSession")
            .field("address", &self.settings.address)
            .field("state", &self.state)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl HidSession {
    pub fn new(settings: SessionSettings, sink: Box<dyn EventSink>) -> Self {
        info!("Creating HID session for {}", settings.address);
        let decoder = ReportDecoder::new(settings.axis_filter);
        Self {
            settings,
            state: ConnectionState::Idle,
            context: ConnectionContext::default(),
            parser: AttributeParser::new(),
            decoder,
            sink,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Session state: {} -> {}", self.state, state);
            self.state = state;
        }
    }

    /// Register the HID PSMs so the peer can reconnect on its own
    pub fn register_services(&self, stack: &mut dyn HostStack) -> Result<(), SessionError> {
        for psm in [PSM_HID_INTERRUPT, PSM_HID_CONTROL] {
            stack.register_service(psm, self.settings.channel_mtu)?;
            debug!("Registered HID service on PSM {:#06x}", psm);
        }
        Ok(())
    }

    /// Start (or restart) a connection attempt
    pub fn connect(&mut self, stack: &mut dyn HostStack) {
        if self.state != ConnectionState::Idle {
            info!("Connect requested while {}, restarting", self.state);
        }
        self.decoder.reset();
        self.parser.reset();

        info!(
            "Start SDP HID query for remote HID device {}",
            self.settings.address
        );
        match stack.query_service(self.settings.address, SERVICE_CLASS_HID) {
            Ok(()) => self.set_state(ConnectionState::DiscoveringProtocols),
            Err(e) => {
                error!("Failed to start service discovery: {}", e);
                self.set_state(ConnectionState::Idle);
            }
        }
    }

    /// Close both channels; close notifications finish the teardown
    pub fn disconnect(&mut self, stack: &mut dyn HostStack) {
        let channels: Vec<ChannelId> = [self.context.control_channel, self.context.interrupt_channel]
            .into_iter()
            .flatten()
            .collect();

        if channels.is_empty() {
            info!("Disconnect requested without open channels");
            self.set_state(ConnectionState::Idle);
            return;
        }

        info!("Disconnecting from {}", self.settings.address);
        for channel in channels {
            if let Err(e) = stack.close_channel(channel) {
                warn!("Failed to close channel {}: {}", channel, e);
            }
        }
        self.set_state(ConnectionState::Closing);
    }

    /// React to one host stack notification
    pub fn handle(&mut self, stack: &mut dyn HostStack, event: StackEvent) {
        let result = match event {
            StackEvent::StackReady => {
                info!("Host stack ready");
                self.connect(stack);
                Ok(())
            }
            StackEvent::AttributeByte {
                attribute_id,
                offset,
                byte,
                total_length,
            } => self.on_attribute_byte(attribute_id, offset, byte, total_length),
            StackEvent::QueryComplete { status } => self.on_query_complete(stack, status),
            StackEvent::IncomingChannel { psm, channel } => {
                self.on_incoming_channel(stack, psm, channel)
            }
            StackEvent::ChannelOpened {
                psm,
                channel,
                direction,
                status,
            } => self.on_channel_opened(stack, psm, channel, direction, status),
            StackEvent::ChannelClosed { channel } => {
                self.on_channel_closed(channel);
                Ok(())
            }
            StackEvent::PinCodeRequest { address } => {
                info!("Pin code request - using '{}'", self.settings.pin_code);
                stack
                    .pin_code_response(address, &self.settings.pin_code)
                    .map_err(SessionError::from)
            }
            StackEvent::Data { channel, payload } => self.on_data(channel, &payload),
        };

        match result {
            Ok(()) => {}
            Err(SessionError::Report(e)) => trace!("{}", e),
            Err(SessionError::Attribute(e)) => warn!("{}", e),
            Err(e) => error!("{}", e),
        }
    }

    fn on_attribute_byte(
        &mut self,
        attribute_id: u16,
        offset: usize,
        byte: u8,
        total_length: usize,
    ) -> Result<(), SessionError> {
        let Some(fact) = self.parser.push(attribute_id, offset, byte, total_length)? else {
            return Ok(());
        };

        match fact {
            DiscoveryFact::ControlPsm(psm) => {
                info!("HID Control PSM: {:#06x}", psm);
                self.context.control_psm = Some(psm);
            }
            DiscoveryFact::InterruptPsm(psm) => {
                info!("HID Interrupt PSM: {:#06x}", psm);
                self.context.interrupt_psm = Some(psm);
            }
            DiscoveryFact::ReportDescriptor(bytes) => {
                info!("HID Descriptor: {}", hexdump(&bytes));
                self.context.store_descriptor(bytes);
                if self.state == ConnectionState::DiscoveringDescriptor
                    && self.context.descriptor_known()
                {
                    info!("HID Connection established");
                    self.set_state(ConnectionState::Connected);
                }
            }
        }
        Ok(())
    }

    fn on_query_complete(
        &mut self,
        stack: &mut dyn HostStack,
        status: u8,
    ) -> Result<(), SessionError> {
        // Channels stay open on failure; the next connect re-queries
        if status != STATUS_SUCCESS {
            self.set_state(ConnectionState::Idle);
            return Err(SessionError::DiscoveryFailed(status));
        }

        if self.state == ConnectionState::DiscoveringDescriptor {
            if !self.context.descriptor_known() {
                warn!("Descriptor query finished without a report descriptor");
                self.set_state(ConnectionState::Idle);
            }
            return Ok(());
        }

        if self.context.channels_open() {
            if self.context.descriptor_known() {
                info!("HID device re-connected");
                self.set_state(ConnectionState::Connected);
            } else {
                info!("HID device re-connected without descriptor");
                self.request_descriptor(stack)?;
            }
            return Ok(());
        }

        let (control_psm, interrupt_psm) = match self.resolve_psms() {
            Ok(psms) => psms,
            Err(e) => {
                self.set_state(ConnectionState::Idle);
                return Err(e);
            }
        };

        info!(
            "Setup HID: control PSM {:#06x}, interrupt PSM {:#06x}",
            control_psm, interrupt_psm
        );
        let channel =
            stack.open_channel(self.settings.address, control_psm, self.settings.channel_mtu)?;
        debug!("Requested control channel {}", channel);
        self.set_state(ConnectionState::OpeningControlChannel);
        Ok(())
    }

    /// Discovered PSMs with fallbacks applied; both must resolve
    fn resolve_psms(&mut self) -> Result<(u16, u16), SessionError> {
        if self.context.control_psm.is_none() {
            if let Some(fallback) = self.settings.fallback_control_psm {
                info!("HID Control PSM missing, using default {:#06x}", fallback);
                self.context.control_psm = Some(fallback);
            }
        }
        if self.context.interrupt_psm.is_none() {
            if let Some(fallback) = self.settings.fallback_interrupt_psm {
                info!("HID Interrupt PSM missing, using default {:#06x}", fallback);
                self.context.interrupt_psm = Some(fallback);
            }
        }

        let control = self
            .context
            .control_psm
            .ok_or(SessionError::UnresolvedPsm("control"))?;
        let interrupt = self
            .context
            .interrupt_psm
            .ok_or(SessionError::UnresolvedPsm("interrupt"))?;
        Ok((control, interrupt))
    }

    /// PSMs the peer may use for HID channels, discovered or default
    fn hid_psms(&self) -> (u16, u16) {
        (
            self.context.control_psm.unwrap_or(PSM_HID_CONTROL),
            self.context.interrupt_psm.unwrap_or(PSM_HID_INTERRUPT),
        )
    }

    fn on_incoming_channel(
        &mut self,
        stack: &mut dyn HostStack,
        psm: u16,
        channel: ChannelId,
    ) -> Result<(), SessionError> {
        let (control, interrupt) = self.hid_psms();
        if psm == control || psm == interrupt {
            debug!("Accepting incoming channel {} on PSM {:#06x}", channel, psm);
            stack.accept_channel(channel)?;
        } else {
            info!("Declining incoming channel {} on PSM {:#06x}", channel, psm);
            stack.decline_channel(channel)?;
        }
        Ok(())
    }

    fn on_channel_opened(
        &mut self,
        stack: &mut dyn HostStack,
        psm: u16,
        channel: ChannelId,
        direction: ChannelDirection,
        status: u8,
    ) -> Result<(), SessionError> {
        if status != STATUS_SUCCESS {
            return Err(SessionError::ChannelFailed { psm, status });
        }

        let (control, interrupt) = self.hid_psms();
        if psm == control {
            info!("HID control channel {} open ({:?})", channel, direction);
            self.context.control_channel = Some(channel);
            if direction == ChannelDirection::Outgoing {
                let requested =
                    stack.open_channel(self.settings.address, interrupt, self.settings.channel_mtu)?;
                debug!("Requested interrupt channel {} on PSM {:#06x}", requested, interrupt);
            }
            self.set_state(ConnectionState::OpeningInterruptChannel);
        } else if psm == interrupt {
            info!("HID interrupt channel {} open ({:?})", channel, direction);
            self.context.interrupt_channel = Some(channel);
        } else {
            debug!("Ignoring channel {} on PSM {:#06x}", channel, psm);
            return Ok(());
        }

        if !self.context.channels_open() {
            return Ok(());
        }

        if self.context.descriptor_known() {
            info!("HID Connection established");
            self.set_state(ConnectionState::Connected);
            Ok(())
        } else {
            self.request_descriptor(stack)
        }
    }

    fn request_descriptor(&mut self, stack: &mut dyn HostStack) -> Result<(), SessionError> {
        info!("Start SDP HID query to get HID Descriptor");
        self.parser.reset();
        stack.query_service(self.settings.address, SERVICE_CLASS_HID)?;
        self.set_state(ConnectionState::DiscoveringDescriptor);
        Ok(())
    }

    fn on_channel_closed(&mut self, channel: ChannelId) {
        if self.context.channels_open() {
            info!("HID Connection closed");
            self.context.clear_descriptor();
        }

        let mut matched = false;
        if self.context.control_channel == Some(channel) {
            self.context.control_channel = None;
            matched = true;
        }
        if self.context.interrupt_channel == Some(channel) {
            self.context.interrupt_channel = None;
            matched = true;
        }
        if !matched {
            debug!("Close of unrelated channel {}", channel);
            return;
        }

        if self.context.control_channel.is_none() && self.context.interrupt_channel.is_none() {
            self.set_state(ConnectionState::Idle);
        } else {
            warn!("Channel {} closed, HID link degraded", channel);
            self.set_state(ConnectionState::Closing);
        }
    }

    fn on_data(&mut self, channel: ChannelId, payload: &[u8]) -> Result<(), SessionError> {
        if Some(channel) == self.context.interrupt_channel {
            let emitted = self
                .decoder
                .decode(payload, &self.context.layout, self.sink.as_mut())?;
            trace!("Report on {} produced {} events", channel, emitted);
        } else if Some(channel) == self.context.control_channel {
            debug!("HID Control: {}", hexdump(payload));
        } else {
            trace!("Dropping {} bytes on unknown channel {}", payload.len(), channel);
        }
        Ok(())
    }
}

fn hexdump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{:02X}", byte))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::replay::{ReplayStack, RequestLog, StackRequest, FIRST_CHANNEL_ID};
    use crate::gamepad::descriptor::tests::GAMEPAD_DESCRIPTOR;
    use crate::gamepad::usages::button;
    use crate::gamepad::{GamepadEvent, UsagePage};
    use crate::sdp::attribute::tests::{
        hid_descriptor_list, ADDITIONAL_PROTOCOL_DESCRIPTOR_LISTS, PROTOCOL_DESCRIPTOR_LIST,
    };
    use std::sync::{Arc, Mutex};

    const ADDRESS: PeripheralAddress = PeripheralAddress::new([0xE4, 0x17, 0xD8, 0x3B, 0x0A, 0xF1]);
    const CONTROL: ChannelId = ChannelId(FIRST_CHANNEL_ID);
    const INTERRUPT: ChannelId = ChannelId(FIRST_CHANNEL_ID + 1);

    struct Harness {
        session: HidSession,
        stack: ReplayStack,
        log: RequestLog,
        events: Arc<Mutex<Vec<GamepadEvent>>>,
    }

    impl Harness {
        fn new(settings: SessionSettings) -> Self {
            let events = Arc::new(Mutex::new(Vec::new()));
            let collected = events.clone();
            let sink = move |event: GamepadEvent| collected.lock().unwrap().push(event);
            let stack = ReplayStack::new();
            let log = stack.log();
            Self {
                session: HidSession::new(settings, Box::new(sink)),
                stack,
                log,
                events,
            }
        }

        fn with_defaults() -> Self {
            Self::new(SessionSettings {
                address: ADDRESS,
                ..SessionSettings::default()
            })
        }

        fn handle(&mut self, event: StackEvent) {
            self.session.handle(&mut self.stack, event);
        }

        fn attribute(&mut self, attribute_id: u16, value: &[u8]) {
            for (offset, &byte) in value.iter().enumerate() {
                self.handle(StackEvent::AttributeByte {
                    attribute_id,
                    offset,
                    byte,
                    total_length: value.len(),
                });
            }
        }

        fn opened(&mut self, psm: u16, channel: ChannelId, direction: ChannelDirection) {
            self.handle(StackEvent::ChannelOpened {
                psm,
                channel,
                direction,
                status: STATUS_SUCCESS,
            });
        }

        fn events(&self) -> Vec<GamepadEvent> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }

        /// Full outbound connection including descriptor download
        fn connect_fully(&mut self) {
            self.session.connect(&mut self.stack);
            self.attribute(0x0004, PROTOCOL_DESCRIPTOR_LIST);
            self.attribute(0x000D, ADDITIONAL_PROTOCOL_DESCRIPTOR_LISTS);
            self.handle(StackEvent::QueryComplete { status: 0 });
            self.opened(PSM_HID_CONTROL, CONTROL, ChannelDirection::Outgoing);
            self.opened(PSM_HID_INTERRUPT, INTERRUPT, ChannelDirection::Outgoing);
            self.attribute(0x0206, &hid_descriptor_list(GAMEPAD_DESCRIPTOR));
            self.handle(StackEvent::QueryComplete { status: 0 });
        }
    }

    fn button_report(buttons: u16) -> Vec<u8> {
        let [low, high] = buttons.to_le_bytes();
        vec![0xA1, low, high, 0x08, 127, 127, 127, 127]
    }

    #[test]
    fn test_full_connection_flow() {
        let mut harness = Harness::with_defaults();
        harness.session.connect(&mut harness.stack);
        assert_eq!(harness.session.state(), ConnectionState::DiscoveringProtocols);
        assert_eq!(
            harness.log.take(),
            vec![StackRequest::QueryService {
                address: ADDRESS,
                service_class: SERVICE_CLASS_HID
            }]
        );

        harness.attribute(0x0004, PROTOCOL_DESCRIPTOR_LIST);
        harness.attribute(0x000D, ADDITIONAL_PROTOCOL_DESCRIPTOR_LISTS);
        assert_eq!(harness.session.state(), ConnectionState::DiscoveringProtocols);
        assert_eq!(harness.session.context().control_psm(), Some(0x0011));
        assert_eq!(harness.session.context().interrupt_psm(), Some(0x0013));

        harness.handle(StackEvent::QueryComplete { status: 0 });
        assert_eq!(harness.session.state(), ConnectionState::OpeningControlChannel);
        assert_eq!(
            harness.log.take(),
            vec![StackRequest::OpenChannel {
                address: ADDRESS,
                psm: PSM_HID_CONTROL,
                mtu: DEFAULT_CHANNEL_MTU,
                channel: CONTROL
            }]
        );

        harness.opened(PSM_HID_CONTROL, CONTROL, ChannelDirection::Outgoing);
        assert_eq!(harness.session.state(), ConnectionState::OpeningInterruptChannel);
        assert_eq!(
            harness.log.take(),
            vec![StackRequest::OpenChannel {
                address: ADDRESS,
                psm: PSM_HID_INTERRUPT,
                mtu: DEFAULT_CHANNEL_MTU,
                channel: INTERRUPT
            }]
        );

        harness.opened(PSM_HID_INTERRUPT, INTERRUPT, ChannelDirection::Outgoing);
        assert_eq!(harness.session.state(), ConnectionState::DiscoveringDescriptor);
        assert_eq!(harness.log.take().len(), 1);

        harness.attribute(0x0206, &hid_descriptor_list(GAMEPAD_DESCRIPTOR));
        assert_eq!(harness.session.state(), ConnectionState::Connected);
        assert_eq!(harness.session.context().descriptor(), GAMEPAD_DESCRIPTOR);

        harness.handle(StackEvent::QueryComplete { status: 0 });
        assert_eq!(harness.session.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_interrupt_reports_reach_sink() {
        let mut harness = Harness::with_defaults();
        harness.connect_fully();
        harness.events();

        harness.handle(StackEvent::Data {
            channel: INTERRUPT,
            payload: button_report(0x0001),
        });
        harness.handle(StackEvent::Data {
            channel: INTERRUPT,
            payload: button_report(0x0001),
        });
        harness.handle(StackEvent::Data {
            channel: INTERRUPT,
            payload: button_report(0x0000),
        });

        assert_eq!(
            harness.events(),
            vec![
                GamepadEvent::digital(UsagePage::Button, button::A, true),
                GamepadEvent::digital(UsagePage::Button, button::A, false),
            ]
        );
    }

    #[test]
    fn test_control_channel_data_is_not_decoded() {
        let mut harness = Harness::with_defaults();
        harness.connect_fully();
        harness.handle(StackEvent::Data {
            channel: CONTROL,
            payload: button_report(0x0001),
        });
        harness.handle(StackEvent::Data {
            channel: INTERRUPT,
            payload: vec![0xA2, 0x01],
        });
        assert!(harness.events().is_empty());
    }

    #[test]
    fn test_reconnect_keeps_channels_and_descriptor() {
        let mut harness = Harness::with_defaults();
        harness.connect_fully();
        harness.log.take();

        harness.session.connect(&mut harness.stack);
        harness.handle(StackEvent::QueryComplete { status: 0 });

        assert_eq!(harness.session.state(), ConnectionState::Connected);
        let requests = harness.log.take();
        assert_eq!(requests.len(), 1);
        assert!(matches!(requests[0], StackRequest::QueryService { .. }));
        assert_eq!(harness.session.context().descriptor(), GAMEPAD_DESCRIPTOR);
    }

    /// Connect and open both channels without answering the descriptor query
    fn open_channels(harness: &mut Harness) {
        harness.session.connect(&mut harness.stack);
        harness.handle(StackEvent::QueryComplete { status: 0 });
        harness.opened(PSM_HID_CONTROL, CONTROL, ChannelDirection::Outgoing);
        harness.opened(PSM_HID_INTERRUPT, INTERRUPT, ChannelDirection::Outgoing);
        assert_eq!(harness.session.state(), ConnectionState::DiscoveringDescriptor);
        harness.log.take();
    }

    #[test]
    fn test_failed_descriptor_query_returns_to_idle() {
        let mut harness = Harness::with_defaults();
        open_channels(&mut harness);

        harness.handle(StackEvent::QueryComplete { status: 0x04 });
        assert_eq!(harness.session.state(), ConnectionState::Idle);
        assert!(harness.session.context().channels_open());
        assert!(harness.log.take().is_empty());

        // Reconnect with channels up asks for the descriptor again
        harness.session.connect(&mut harness.stack);
        harness.handle(StackEvent::QueryComplete { status: 0 });
        assert_eq!(harness.session.state(), ConnectionState::DiscoveringDescriptor);
        assert_eq!(harness.log.take().len(), 2);

        harness.attribute(0x0206, &hid_descriptor_list(GAMEPAD_DESCRIPTOR));
        assert_eq!(harness.session.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_descriptor_query_without_descriptor_returns_to_idle() {
        let mut harness = Harness::with_defaults();
        open_channels(&mut harness);

        harness.handle(StackEvent::QueryComplete { status: 0 });
        assert_eq!(harness.session.state(), ConnectionState::Idle);
        assert!(!harness.session.context().descriptor_known());
        assert!(harness.log.take().is_empty());
    }

    #[test]
    fn test_unbounded_descriptor_leaves_empty_layout() {
        let mut harness = Harness::with_defaults();
        open_channels(&mut harness);

        // Report Size (32), Report Count (0xFFFFFFFF), Input (Data, Var)
        let unbounded = [0x75, 0x20, 0x97, 0xFF, 0xFF, 0xFF, 0xFF, 0x81, 0x02];
        harness.attribute(0x0206, &hid_descriptor_list(&unbounded));

        assert_eq!(harness.session.state(), ConnectionState::Connected);
        harness.handle(StackEvent::Data {
            channel: INTERRUPT,
            payload: vec![0xA1, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF],
        });
        assert!(harness.events().is_empty());
    }

    #[test]
    fn test_connect_resets_decode_state() {
        let mut harness = Harness::with_defaults();
        harness.connect_fully();
        harness.handle(StackEvent::Data {
            channel: INTERRUPT,
            payload: button_report(0x0001),
        });
        harness.events();

        harness.session.connect(&mut harness.stack);
        harness.handle(StackEvent::QueryComplete { status: 0 });
        harness.handle(StackEvent::Data {
            channel: INTERRUPT,
            payload: button_report(0x0001),
        });
        assert_eq!(harness.events().len(), 1);
    }

    #[test]
    fn test_fallback_psms_when_not_discovered() {
        let mut harness = Harness::with_defaults();
        harness.session.connect(&mut harness.stack);
        harness.handle(StackEvent::QueryComplete { status: 0 });

        assert_eq!(harness.session.state(), ConnectionState::OpeningControlChannel);
        assert_eq!(harness.session.context().control_psm(), Some(PSM_HID_CONTROL));
        assert_eq!(harness.session.context().interrupt_psm(), Some(PSM_HID_INTERRUPT));
    }

    #[test]
    fn test_unresolved_psm_opens_nothing() {
        let mut harness = Harness::new(SessionSettings {
            address: ADDRESS,
            fallback_interrupt_psm: None,
            ..SessionSettings::default()
        });
        harness.session.connect(&mut harness.stack);
        harness.attribute(0x0004, PROTOCOL_DESCRIPTOR_LIST);
        harness.log.take();

        harness.handle(StackEvent::QueryComplete { status: 0 });
        assert_eq!(harness.session.state(), ConnectionState::Idle);
        assert!(harness.log.take().is_empty());
    }

    #[test]
    fn test_discovery_failure_returns_to_idle() {
        let mut harness = Harness::with_defaults();
        harness.session.connect(&mut harness.stack);
        harness.log.take();

        harness.handle(StackEvent::QueryComplete { status: 0x04 });
        assert_eq!(harness.session.state(), ConnectionState::Idle);
        assert!(harness.log.take().is_empty());
    }

    #[test]
    fn test_channel_open_failures_do_not_advance() {
        let mut harness = Harness::with_defaults();
        harness.session.connect(&mut harness.stack);
        harness.handle(StackEvent::QueryComplete { status: 0 });
        assert_eq!(harness.session.state(), ConnectionState::OpeningControlChannel);

        harness.handle(StackEvent::ChannelOpened {
            psm: PSM_HID_CONTROL,
            channel: CONTROL,
            direction: ChannelDirection::Outgoing,
            status: 0x04,
        });
        assert_eq!(harness.session.state(), ConnectionState::OpeningControlChannel);
        assert_eq!(harness.session.context().control_channel(), None);

        let mut refusing = ReplayStack::new().refusing_channels();
        harness.session.connect(&mut refusing);
        harness.session.handle(&mut refusing, StackEvent::QueryComplete { status: 0 });
        assert_eq!(harness.session.state(), ConnectionState::DiscoveringProtocols);
    }

    #[test]
    fn test_closing_both_channels_clears_descriptor() {
        let mut harness = Harness::with_defaults();
        harness.connect_fully();

        harness.handle(StackEvent::ChannelClosed { channel: INTERRUPT });
        assert_eq!(harness.session.state(), ConnectionState::Closing);
        assert!(!harness.session.context().descriptor_known());
        assert_eq!(harness.session.context().control_channel(), Some(CONTROL));

        harness.handle(StackEvent::ChannelClosed { channel: CONTROL });
        assert_eq!(harness.session.state(), ConnectionState::Idle);
        assert_eq!(harness.session.context().control_channel(), None);
    }

    #[test]
    fn test_reopened_channels_download_descriptor_again() {
        let mut harness = Harness::with_defaults();
        harness.connect_fully();
        harness.handle(StackEvent::ChannelClosed { channel: INTERRUPT });
        harness.handle(StackEvent::ChannelClosed { channel: CONTROL });
        harness.log.take();

        harness.opened(PSM_HID_CONTROL, ChannelId(0x50), ChannelDirection::Incoming);
        harness.opened(PSM_HID_INTERRUPT, ChannelId(0x51), ChannelDirection::Incoming);

        assert_eq!(harness.session.state(), ConnectionState::DiscoveringDescriptor);
        assert_eq!(
            harness.log.take(),
            vec![StackRequest::QueryService {
                address: ADDRESS,
                service_class: SERVICE_CLASS_HID
            }]
        );
    }

    #[test]
    fn test_incoming_channels_filtered_by_psm() {
        let mut harness = Harness::with_defaults();
        harness.handle(StackEvent::IncomingChannel {
            psm: PSM_HID_CONTROL,
            channel: ChannelId(0x60),
        });
        harness.handle(StackEvent::IncomingChannel {
            psm: PSM_HID_INTERRUPT,
            channel: ChannelId(0x61),
        });
        harness.handle(StackEvent::IncomingChannel {
            psm: 0x0001,
            channel: ChannelId(0x62),
        });
        assert_eq!(
            harness.log.take(),
            vec![
                StackRequest::AcceptChannel(ChannelId(0x60)),
                StackRequest::AcceptChannel(ChannelId(0x61)),
                StackRequest::DeclineChannel(ChannelId(0x62)),
            ]
        );
    }

    #[test]
    fn test_pin_code_and_stack_ready() {
        let mut harness = Harness::new(SessionSettings {
            address: ADDRESS,
            pin_code: "1234".to_string(),
            ..SessionSettings::default()
        });
        harness.handle(StackEvent::PinCodeRequest { address: ADDRESS });
        harness.handle(StackEvent::StackReady);

        assert_eq!(harness.session.state(), ConnectionState::DiscoveringProtocols);
        assert_eq!(
            harness.log.take(),
            vec![
                StackRequest::PinCodeResponse {
                    address: ADDRESS,
                    pin: "1234".to_string()
                },
                StackRequest::QueryService {
                    address: ADDRESS,
                    service_class: SERVICE_CLASS_HID
                },
            ]
        );
    }

    #[test]
    fn test_disconnect_closes_both_channels() {
        let mut harness = Harness::with_defaults();
        harness.connect_fully();
        harness.log.take();

        harness.session.disconnect(&mut harness.stack);
        assert_eq!(harness.session.state(), ConnectionState::Closing);
        assert_eq!(
            harness.log.take(),
            vec![
                StackRequest::CloseChannel(CONTROL),
                StackRequest::CloseChannel(INTERRUPT),
            ]
        );
    }

    #[test]
    fn test_register_services() {
        let mut harness = Harness::with_defaults();
        harness.session.register_services(&mut harness.stack).unwrap();
        assert_eq!(
            harness.log.take(),
            vec![
                StackRequest::RegisterService {
                    psm: PSM_HID_INTERRUPT,
                    mtu: DEFAULT_CHANNEL_MTU
                },
                StackRequest::RegisterService {
                    psm: PSM_HID_CONTROL,
                    mtu: DEFAULT_CHANNEL_MTU
                },
            ]
        );
    }

    #[test]
    fn test_hexdump() {
        assert_eq!(hexdump(&[0xA1, 0x00, 0x7F]), "A1 00 7F");
        assert_eq!(hexdump(&[]), "");
    }
}
