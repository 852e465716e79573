//! Driver task owning the HID session
//!
//! The session and the host stack live inside a single tokio task. Everything
//! else (stack callbacks, the connect button, the application) talks to it
//! through [`DriverCommand`]s on an mpsc channel, so session state is only
//! ever touched from that task.
//!
//! # State Machine
//!
//! ```text
//! Initializing ──(register services)──► Running ──(cancel / senders gone)──► done
//! ```

use super::session::{ConnectionState, HidSession, SessionError};
use super::{HostStack, StackError, StackEvent};
use chrono::{DateTime, Duration, Utc};
use statum::{machine, state};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the command channel
pub const COMMAND_BUFFER: usize = 64;

/// Minimum spacing of connect button presses
pub const DEFAULT_CONNECT_DEBOUNCE_MS: i64 = 700;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Host stack error: {0}")]
    Stack(#[from] StackError),

    #[error("Command channel closed: {0}")]
    ChannelClosed(String),

    #[error("Driver task failed: {0}")]
    TaskFailed(String),
}

/// Input marshaled onto the driver task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCommand {
    Connect,
    Disconnect,
    Stack(StackEvent),
}

#[state]
#[derive(Debug, Clone)]
pub enum DriverState {
    Initializing,
    Running,
}

#[machine]
pub struct HidHostDriver<S: DriverState> {
    session: HidSession,
    stack: Box<dyn HostStack>,
    commands: mpsc::Receiver<DriverCommand>,
    state_sender: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

impl<S: DriverState> HidHostDriver<S> {
    pub fn session(&self) -> &HidSession {
        &self.session
    }
}

impl HidHostDriver<Initializing> {
    pub fn create(
        session: HidSession,
        stack: Box<dyn HostStack>,
        commands: mpsc::Receiver<DriverCommand>,
        state_sender: watch::Sender<ConnectionState>,
        shutdown: CancellationToken,
    ) -> Self {
        debug!("Creating HID host driver: {:?}", session);
        Self::new(session, stack, commands, state_sender, shutdown)
    }

    /// Register the HID services with the stack and start accepting commands
    pub fn initialize(mut self) -> Result<HidHostDriver<Running>, DriverError> {
        info!("Registering HID services");
        self.session.register_services(self.stack.as_mut())?;
        info!("HID host driver initialized, transitioning to Running state");
        Ok(self.transition())
    }
}

impl HidHostDriver<Running> {
    /// Apply one command to the session and publish the resulting state
    pub fn apply(&mut self, command: DriverCommand) {
        match command {
            DriverCommand::Connect => self.session.connect(self.stack.as_mut()),
            DriverCommand::Disconnect => self.session.disconnect(self.stack.as_mut()),
            DriverCommand::Stack(event) => self.session.handle(self.stack.as_mut(), event),
        }

        let state = self.session.state();
        let changed = self.state_sender.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            info!("HID connection state: {}", state);
        }
    }

    /// Process commands until cancelled or every sender is dropped
    pub async fn run(mut self) -> Result<(), DriverError> {
        info!("HID host driver running");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("HID host driver shutting down");
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => {
                        warn!("All driver command senders dropped, stopping");
                        break;
                    }
                },
            }
        }

        if self.session.context().channels_open() {
            self.session.disconnect(self.stack.as_mut());
        }
        Ok(())
    }
}

/// Handle to a spawned driver task
#[derive(Debug)]
pub struct DriverHandle {
    commands: mpsc::Sender<DriverCommand>,
    state: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<Result<(), DriverError>>>,
}

impl DriverHandle {
    /// Initialize the driver and spawn its task
    ///
    /// Service registration happens before spawning, so a stack that refuses
    /// it surfaces here instead of inside the task.
    pub fn spawn(session: HidSession, stack: Box<dyn HostStack>) -> Result<Self, DriverError> {
        let (command_sender, command_receiver) = mpsc::channel(COMMAND_BUFFER);
        let (state_sender, state_receiver) = watch::channel(session.state());
        let shutdown = CancellationToken::new();
        debug!("Created command channel with buffer capacity {}", COMMAND_BUFFER);

        let driver = HidHostDriver::create(
            session,
            stack,
            command_receiver,
            state_sender,
            shutdown.clone(),
        )
        .initialize()?;

        let task = tokio::spawn(async move {
            let result = driver.run().await;
            if let Err(e) = &result {
                error!("HID host driver terminated with error: {}", e);
            }
            result
        });
        info!("HID host driver started");

        Ok(Self {
            commands: command_sender,
            state: state_receiver,
            shutdown,
            task: Some(task),
        })
    }

    pub fn sender(&self) -> mpsc::Sender<DriverCommand> {
        self.commands.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Debounced connect trigger safe to fire from any thread
    pub fn connect_trigger(&self, debounce: Duration) -> ConnectTrigger {
        ConnectTrigger::new(self.commands.clone(), debounce)
    }

    pub async fn send(&self, command: DriverCommand) -> Result<(), DriverError> {
        self.commands
            .send(command)
            .await
            .map_err(|e| DriverError::ChannelClosed(e.to_string()))
    }

    /// Forward a host stack notification
    pub async fn notify(&self, event: StackEvent) -> Result<(), DriverError> {
        self.send(DriverCommand::Stack(event)).await
    }

    /// Stop the task and wait for it to finish
    pub async fn shutdown(&mut self) -> Result<(), DriverError> {
        debug!("Sending shutdown signal to HID host driver");
        self.shutdown.cancel();

        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| DriverError::TaskFailed(e.to_string()))?,
            None => {
                debug!("HID host driver already shut down");
                Ok(())
            }
        }
    }
}

/// Connect request source with press debouncing
///
/// Never touches session state: a press only enqueues
/// [`DriverCommand::Connect`] without waiting, so it can be fired from a
/// GPIO interrupt thread.
#[derive(Debug, Clone)]
pub struct ConnectTrigger {
    commands: mpsc::Sender<DriverCommand>,
    debounce: Duration,
    last_press: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl ConnectTrigger {
    pub fn new(commands: mpsc::Sender<DriverCommand>, debounce: Duration) -> Self {
        Self {
            commands,
            debounce,
            last_press: Arc::new(Mutex::new(None)),
        }
    }

    /// Register a press now; returns whether a connect was requested
    pub fn fire(&self) -> bool {
        self.fire_at(Utc::now())
    }

    /// Register a press at `now`
    ///
    /// Only a press that reached the driver starts a new debounce window.
    pub fn fire_at(&self, now: DateTime<Utc>) -> bool {
        let mut last_press = self.last_press.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = *last_press {
            if now - last <= self.debounce {
                debug!("Connect press debounced");
                return false;
            }
        }

        match self.commands.try_send(DriverCommand::Connect) {
            Ok(()) => {
                *last_press = Some(now);
                info!("Connect requested");
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!("Driver busy, connect request dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Driver stopped, connect request dropped");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::replay::{ReplayStack, StackRequest};
    use crate::bluetooth::session::SessionSettings;
    use crate::bluetooth::{ChannelDirection, ChannelId, PSM_HID_CONTROL};
    use crate::gamepad::GamepadEvent;

    fn session() -> HidSession {
        HidSession::new(SessionSettings::default(), Box::new(|_event: GamepadEvent| {}))
    }

    #[tokio::test]
    async fn test_spawn_registers_services() {
        let stack = ReplayStack::new();
        let log = stack.log();
        let mut handle = DriverHandle::spawn(session(), Box::new(stack)).unwrap();

        assert_eq!(log.snapshot().len(), 2);
        assert!(log
            .snapshot()
            .iter()
            .all(|request| matches!(request, StackRequest::RegisterService { .. })));
        assert_eq!(handle.state(), ConnectionState::Idle);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_drive_published_state() {
        let stack = ReplayStack::new();
        let log = stack.log();
        let mut handle = DriverHandle::spawn(session(), Box::new(stack)).unwrap();
        let mut state = handle.subscribe();

        handle.send(DriverCommand::Connect).await.unwrap();
        state.changed().await.unwrap();
        assert_eq!(*state.borrow_and_update(), ConnectionState::DiscoveringProtocols);

        handle
            .notify(StackEvent::QueryComplete { status: 0 })
            .await
            .unwrap();
        state.changed().await.unwrap();
        assert_eq!(*state.borrow_and_update(), ConnectionState::OpeningControlChannel);

        handle
            .notify(StackEvent::ChannelOpened {
                psm: PSM_HID_CONTROL,
                channel: ChannelId(0x40),
                direction: ChannelDirection::Outgoing,
                status: 0,
            })
            .await
            .unwrap();
        state.changed().await.unwrap();
        assert_eq!(*state.borrow_and_update(), ConnectionState::OpeningInterruptChannel);

        handle.shutdown().await.unwrap();
        let opened = log
            .snapshot()
            .into_iter()
            .filter(|request| matches!(request, StackRequest::OpenChannel { .. }))
            .count();
        assert_eq!(opened, 2);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let mut handle = DriverHandle::spawn(session(), Box::new(ReplayStack::new())).unwrap();
        handle.shutdown().await.unwrap();
        handle.shutdown().await.unwrap();
        assert!(handle.send(DriverCommand::Connect).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_trigger_debounces() {
        let (sender, mut receiver) = mpsc::channel(4);
        let trigger = ConnectTrigger::new(sender, Duration::milliseconds(DEFAULT_CONNECT_DEBOUNCE_MS));
        let start = Utc::now();

        assert!(trigger.fire_at(start));
        assert!(!trigger.fire_at(start + Duration::milliseconds(300)));
        assert!(!trigger.fire_at(start + Duration::milliseconds(700)));
        assert!(trigger.fire_at(start + Duration::milliseconds(701)));

        // Clones share the debounce window
        let clone = trigger.clone();
        assert!(!clone.fire_at(start + Duration::milliseconds(900)));

        assert_eq!(receiver.recv().await, Some(DriverCommand::Connect));
        assert_eq!(receiver.recv().await, Some(DriverCommand::Connect));
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_trigger_never_blocks_on_full_channel() {
        let (sender, _receiver) = mpsc::channel(1);
        let trigger = ConnectTrigger::new(sender, Duration::zero());
        let start = Utc::now();

        assert!(trigger.fire_at(start));
        assert!(!trigger.fire_at(start + Duration::seconds(1)));
    }

    #[tokio::test]
    async fn test_dropped_press_does_not_start_debounce() {
        let (sender, mut receiver) = mpsc::channel(1);
        let trigger = ConnectTrigger::new(sender, Duration::milliseconds(DEFAULT_CONNECT_DEBOUNCE_MS));
        let start = Utc::now();

        assert!(trigger.fire_at(start));
        // Channel full: dropped, and the window still runs from `start`
        assert!(!trigger.fire_at(start + Duration::milliseconds(800)));
        assert_eq!(receiver.recv().await, Some(DriverCommand::Connect));

        // Immediate retry once there is room
        assert!(trigger.fire_at(start + Duration::milliseconds(810)));
        assert_eq!(receiver.recv().await, Some(DriverCommand::Connect));
    }
}
