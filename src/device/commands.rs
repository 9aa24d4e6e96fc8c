use futures::channel::mpsc::Sender;
use futures::channel::oneshot;
use futures::SinkExt;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{timeout, Duration, Instant};

use crate::device::constants::WRITE_DEADLINE;
use crate::device::session::SessionState;
use crate::device::transport::GattLink;
use crate::device::types::{ConnectionState, PressensorState};
use crate::error::CommandError;

/// Requests handled by the connection manager's event loop.
#[derive(Debug)]
pub enum Command {
    ZeroPressure(oneshot::Sender<Result<i32, CommandError>>),
    ReadBattery(oneshot::Sender<Result<u8, CommandError>>),
    Reconnect(oneshot::Sender<Result<(), CommandError>>),
    SetConnectionEnabled(bool, oneshot::Sender<()>),
    Diagnostics(oneshot::Sender<Diagnostics>),
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub address: String,
    pub connection_state: ConnectionState,
    pub connection_enabled: bool,
    pub state: PressensorState,
    pub notification_counter: u8,
    pub zero_offset: i32,
    pub decode_errors: u64,
    pub misaligned_notifications: u64,
    pub consecutive_connect_failures: u32,
    pub seconds_since_battery_read: Option<u64>,
}

/**
 * Handle for issuing commands to a running session. Commands are executed by the session's own
 * event loop, in order with notification handling, so they never race the link.
 */
#[derive(Clone)]
pub struct CommandDispatcher {
    sender: Sender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl CommandDispatcher {
    pub fn new(sender: Sender<Command>, state: watch::Receiver<ConnectionState>) -> Self {
        CommandDispatcher { sender, state }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until no connect attempt is in flight and return the state at that point.
    pub async fn settled_state(&self) -> ConnectionState {
        let mut state = self.watch_state();
        if state.wait_for(|state| *state != ConnectionState::Connecting).await.is_err() {
            debug!("Session stopped while a connect attempt was in flight");
        }
        self.connection_state()
    }

    async fn request<T>(&mut self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, CommandError> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(make(tx)).await.map_err(|_| CommandError::SessionClosed)?;
        rx.await.map_err(|_| CommandError::SessionClosed)
    }

    /// Zero/tare: after the device acknowledges the write, the last raw pressure becomes the offset.
    /// Returns the new offset.
    pub async fn send_zero_command(&mut self) -> Result<i32, CommandError> {
        self.request(Command::ZeroPressure).await?
    }

    pub async fn read_battery(&mut self) -> Result<u8, CommandError> {
        self.request(Command::ReadBattery).await?
    }

    /// Connect now without waiting for an advertisement. A no-op if already connecting/connected.
    pub async fn reconnect(&mut self) -> Result<(), CommandError> {
        self.request(Command::Reconnect).await?
    }

    pub async fn set_connection_enabled(&mut self, enabled: bool) -> Result<(), CommandError> {
        self.request(|tx| Command::SetConnectionEnabled(enabled, tx)).await
    }

    pub async fn diagnostics(&mut self) -> Result<Diagnostics, CommandError> {
        self.request(Command::Diagnostics).await
    }
}

async fn with_deadline<T, F>(fut: F) -> Result<T, CommandError>
where
    F: std::future::Future<Output = Result<T, crate::error::DeviceError>>,
{
    let deadline = Duration::from_millis(WRITE_DEADLINE);
    match timeout(deadline, fut).await {
        Err(_) => Err(CommandError::Timeout(deadline)),
        Ok(result) => Ok(result?),
    }
}

/// Send the zero command over `link` and update the calibration once it is acknowledged.
pub async fn zero_pressure<L: GattLink>(link: Option<&L>, session: &mut SessionState) -> Result<i32, CommandError> {
    let link = link.ok_or(CommandError::NotConnected)?;
    let raw_pressure = session.last_raw_pressure().ok_or(CommandError::NoPressureReading)?;

    if let Err(err) = with_deadline(link.write_zero()).await {
        warn!("Failed to send zero pressure command: {}", err);
        return Err(err);
    }

    session.set_zero(raw_pressure);
    info!("Zero pressure command acknowledged; offset is now {} mbar", raw_pressure);
    Ok(session.zero_offset())
}

/// Read the battery level over `link`. On failure the last known level is kept.
pub async fn read_battery<L: GattLink>(link: Option<&L>, session: &mut SessionState) -> Result<u8, CommandError> {
    let link = link.ok_or(CommandError::NotConnected)?;

    match with_deadline(link.read_battery()).await {
        Ok(level) => {
            session.set_battery(level, Instant::now());
            debug!("Battery level: {}%", level);
            Ok(level.min(100))
        },
        Err(err) => {
            warn!("Failed to read battery level, keeping {:?}: {}", session.battery(), err);
            Err(err)
        },
    }
}
