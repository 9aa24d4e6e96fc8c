use std::sync::Arc;
use futures::channel::mpsc::{channel, Receiver, Sender};
use futures::future::pending;
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, timeout, timeout_at, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::device::commands::{self, Command, CommandDispatcher, Diagnostics};
use crate::device::constants::{
    BATTERY_CHECK_TICK, CONNECT_TIMEOUT, FALLBACK_POLL_INTERVAL, IS_CONNECTED_DEADLINE, LIVENESS_CHECK_INTERVAL,
    MAX_CONNECT_RETRIES, RETRY_BASE_DELAY, WRITE_DEADLINE,
};
use crate::device::session::SessionState;
use crate::device::transport::{BleTransport, GattLink};
use crate::device::types::{Advertisement, ConnectionState, DeviceEvent, DeviceIdentity, PressensorState};
use crate::device::watcher::watch_advertisements;
use crate::error::{CommandError, ConnectError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectTrigger {
    Advertisement,
    FallbackPoll,
    Retry,
    Manual,
    BatteryCheck,
}

/**
 * Owns the BLE session for one bound device. All events (advertisements, notifications, timers,
 * commands) are handled one at a time by `run`, so there is never more than one connect attempt
 * or link for the device.
 */
pub struct ConnectionManager<T: BleTransport> {
    transport: Arc<T>,
    identity: DeviceIdentity,
    session: SessionState,
    consumer_state: PressensorState,
    state: watch::Sender<ConnectionState>,
    enabled: bool,
    link: Option<T::Link>,
    notifications: Option<BoxStream<'static, Vec<u8>>>,
    reachable: Receiver<Advertisement>,
    commands: Receiver<Command>,
    senders: Vec<Sender<DeviceEvent>>,
    retry_at: Option<Instant>,
    fallback_at: Instant,
    consecutive_failures: u32,
}

async fn next_notification(notifications: &mut Option<BoxStream<'static, Vec<u8>>>) -> Option<Vec<u8>> {
    match notifications {
        Some(stream) => stream.next().await,
        None => pending().await,
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn close_link<L: GattLink>(link: &L) {
    match timeout(Duration::from_millis(WRITE_DEADLINE), link.disconnect()).await {
        Ok(Ok(())) => {},
        Ok(Err(err)) => debug!("Error during disconnect: {:?}", err),
        Err(_) => debug!("Disconnect timed out"),
    }
}

fn retry_delay(consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(MAX_CONNECT_RETRIES);
    Duration::from_millis(RETRY_BASE_DELAY * (1u64 << exponent))
}

impl<T: BleTransport> ConnectionManager<T> {
    pub fn new(
        transport: Arc<T>,
        identity: DeviceIdentity,
        enabled: bool,
        state: watch::Sender<ConnectionState>,
        reachable: Receiver<Advertisement>,
        commands: Receiver<Command>,
        senders: Vec<Sender<DeviceEvent>>,
    ) -> Self {
        ConnectionManager {
            transport,
            identity,
            session: SessionState::new(),
            consumer_state: PressensorState::default(),
            state,
            enabled,
            link: None,
            notifications: None,
            reachable,
            commands,
            senders,
            retry_at: None,
            fallback_at: Instant::now() + Duration::from_millis(FALLBACK_POLL_INTERVAL),
            consecutive_failures: 0,
        }
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn emit(&mut self, event: DeviceEvent) {
        let mut closed = vec![];
        for (index, sender) in self.senders.iter_mut().enumerate() {
            match sender.try_send(event.clone()) {
                Ok(()) => {},
                Err(err) if err.is_disconnected() => closed.push(index),
                Err(_) => warn!("DeviceEvent receiver is full; dropping {:?}", event),
            }
        }
        for index in closed.into_iter().rev() {
            debug!("Dropping closed DeviceEvent receiver");
            self.senders.remove(index);
        }
    }

    fn set_state(&mut self, new_state: ConnectionState) {
        if self.current_state() == new_state {
            return;
        }

        debug!("Connection state {} -> {}", self.current_state(), new_state);
        self.state.send_replace(new_state);
        self.consumer_state.connected = new_state.is_connected();
        self.emit(DeviceEvent::StateChange(new_state));
    }

    /// When the next timer-driven connect attempt is due, if any.
    fn next_wake(&self) -> Option<Instant> {
        if !self.enabled || self.current_state().is_busy() {
            return None;
        }

        match self.retry_at {
            Some(retry_at) => Some(retry_at.min(self.fallback_at)),
            None => Some(self.fallback_at),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let battery_period = Duration::from_millis(BATTERY_CHECK_TICK);
        let mut battery_tick = interval_at(Instant::now() + battery_period, battery_period);
        battery_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let liveness_period = Duration::from_millis(LIVENESS_CHECK_INTERVAL);
        let mut liveness_tick = interval_at(Instant::now() + liveness_period, liveness_period);
        liveness_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Session for {} started", self.identity.address());

        loop {
            let wake = self.next_wake();

            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                },
                Some(advertisement) = self.reachable.next() => {
                    self.on_advertisement(advertisement, &cancel).await;
                },
                Some(command) = self.commands.next() => {
                    self.on_command(command, &cancel).await;
                },
                notification = next_notification(&mut self.notifications) => match notification {
                    Some(data) => self.on_notification(&data).await,
                    None => self.on_link_lost().await,
                },
                _ = sleep_until_some(wake) => {
                    self.on_timer(&cancel).await;
                },
                _ = battery_tick.tick() => {
                    self.on_battery_tick(&cancel).await;
                },
                _ = liveness_tick.tick() => {
                    self.on_liveness_tick().await;
                },
            }
        }

        self.stop().await;
        info!("Session for {} stopped", self.identity.address());
    }

    async fn on_advertisement(&mut self, advertisement: Advertisement, cancel: &CancellationToken) {
        self.fallback_at = Instant::now() + Duration::from_millis(FALLBACK_POLL_INTERVAL);

        if !self.enabled || self.current_state().is_busy() {
            debug!("Ignoring advertisement from {} ({})", advertisement.address, self.current_state());
            return;
        }

        debug!("Advertisement from {} rssi {:?}", advertisement.address, advertisement.rssi);
        let _ = self.connect(ConnectTrigger::Advertisement, cancel).await;
    }

    async fn on_timer(&mut self, cancel: &CancellationToken) {
        let now = Instant::now();
        let trigger = match self.retry_at {
            Some(retry_at) if retry_at <= now => ConnectTrigger::Retry,
            _ if self.fallback_at <= now => ConnectTrigger::FallbackPoll,
            _ => return,
        };

        let _ = self.connect(trigger, cancel).await;
    }

    async fn on_command(&mut self, command: Command, cancel: &CancellationToken) {
        match command {
            Command::ZeroPressure(reply) => {
                let result = commands::zero_pressure(self.link.as_ref(), &mut self.session).await;
                let _ = reply.send(result);
            },
            Command::ReadBattery(reply) => {
                let result = self.refresh_battery().await;
                let _ = reply.send(result);
            },
            Command::Reconnect(reply) => {
                let result = if !self.enabled {
                    Err(CommandError::ConnectionDisabled)
                } else if self.current_state().is_busy() {
                    debug!("Reconnect requested while {}", self.current_state());
                    Ok(())
                } else {
                    self.connect(ConnectTrigger::Manual, cancel).await.map_err(CommandError::from)
                };
                let _ = reply.send(result);
            },
            Command::SetConnectionEnabled(enabled, reply) => {
                self.set_enabled(enabled).await;
                let _ = reply.send(());
            },
            Command::Diagnostics(reply) => {
                let _ = reply.send(self.diagnostics());
            },
        }
    }

    async fn on_notification(&mut self, data: &[u8]) {
        let reading = match self.session.ingest(data) {
            Ok(reading) => reading,
            Err(err) => {
                warn!("Dropping notification {:02X?}: {} ({} so far)", data, err, self.session.decode_errors());
                return;
            },
        };

        if reading.misaligned {
            let total = self.session.misaligned_notifications();
            if self.session.should_warn_misalignment() {
                warn!(
                    "Notification {:02X?} does not match temperature phase {}; cadence may be misaligned ({} so far)",
                    data, self.session.counter().value(), total,
                );
            } else {
                debug!("Misaligned notification {:02X?} ({} so far)", data, total);
            }
        }

        if let Some(pressure) = self.session.filter_pressure(reading.pressure) {
            self.consumer_state.pressure_mbar = Some(pressure);
            self.emit(DeviceEvent::Pressure(pressure));
        }

        if let Some(temperature) = reading.temperature {
            let celsius = temperature.celsius();
            if self.consumer_state.temperature_c != Some(celsius) {
                self.consumer_state.temperature_c = Some(celsius);
                self.emit(DeviceEvent::Temperature(celsius));
            }
        }
    }

    async fn on_link_lost(&mut self) {
        info!("Connection to {} lost", self.identity.address());
        self.notifications = None;
        if let Some(link) = self.link.take() {
            close_link(&link).await;
        }
        self.schedule_retry();
        self.set_state(ConnectionState::Disconnected);
    }

    async fn on_liveness_tick(&mut self) {
        let Some(link) = self.link.as_ref() else {
            return;
        };

        let alive = match timeout(Duration::from_millis(IS_CONNECTED_DEADLINE), link.is_connected()).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(err)) => {
                warn!("Could not query link state: {}", err);
                false
            },
            Err(_) => {
                warn!("Link state query timed out");
                false
            },
        };

        if !alive {
            self.on_link_lost().await;
        }
    }

    async fn on_battery_tick(&mut self, cancel: &CancellationToken) {
        if !self.session.battery_due_for_refresh(Instant::now()) {
            return;
        }

        match self.current_state() {
            ConnectionState::Connected => {
                let _ = self.refresh_battery().await;
            },
            ConnectionState::Connecting => {},
            ConnectionState::Idle | ConnectionState::Disconnected => {
                if self.enabled {
                    let _ = self.connect(ConnectTrigger::BatteryCheck, cancel).await;
                }
            },
        }
    }

    async fn refresh_battery(&mut self) -> Result<u8, CommandError> {
        let level = commands::read_battery(self.link.as_ref(), &mut self.session).await?;
        if self.consumer_state.battery_percent != Some(level) {
            self.consumer_state.battery_percent = Some(level);
            self.emit(DeviceEvent::Battery(level));
        }
        Ok(level)
    }

    fn schedule_retry(&mut self) {
        self.consecutive_failures += 1;

        if self.consecutive_failures > MAX_CONNECT_RETRIES {
            self.retry_at = None;
            if self.consecutive_failures == MAX_CONNECT_RETRIES + 1 {
                warn!(
                    "Could not connect to {} after {} attempts; waiting for the next advertisement",
                    self.identity.address(),
                    MAX_CONNECT_RETRIES,
                );
            }
            return;
        }

        let delay = retry_delay(self.consecutive_failures);
        debug!("Retrying in {:?}", delay);
        self.retry_at = Some(Instant::now() + delay);
    }

    async fn connect(&mut self, trigger: ConnectTrigger, cancel: &CancellationToken) -> Result<(), ConnectError> {
        info!("Connecting to {} ({:?})", self.identity.address(), trigger);
        self.set_state(ConnectionState::Connecting);
        self.retry_at = None;
        self.fallback_at = Instant::now() + Duration::from_millis(FALLBACK_POLL_INTERVAL);

        let result = self.open_link(cancel).await;

        // advertisements seen while connecting must not start another attempt
        while let Ok(Some(_)) = self.reachable.try_next() {}

        match result {
            Ok((link, notifications)) => {
                self.session.reset_counter_on_new_connection();
                self.link = Some(link);
                self.notifications = Some(notifications);
                self.consecutive_failures = 0;
                self.set_state(ConnectionState::Connected);
                info!("Connected to {}", self.identity.address());

                // battery is read once per connection
                let _ = self.refresh_battery().await;
                Ok(())
            },
            Err(ConnectError::Cancelled) => Err(ConnectError::Cancelled),
            Err(err) => {
                info!("Connecting to {} failed: {}", self.identity.address(), err);
                self.schedule_retry();
                self.set_state(ConnectionState::Disconnected);
                Err(err)
            },
        }
    }

    /// Connect and subscribe within CONNECT_TIMEOUT. A link that was opened but could not be
    /// subscribed in time (or before cancellation) is closed again.
    async fn open_link(&mut self, cancel: &CancellationToken) -> Result<(T::Link, BoxStream<'static, Vec<u8>>), ConnectError> {
        let limit = Duration::from_millis(CONNECT_TIMEOUT);
        let deadline = Instant::now() + limit;

        let link = tokio::select! {
            _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
            result = timeout_at(deadline, self.transport.connect(&self.identity)) => match result {
                Err(_) => return Err(ConnectError::Timeout(limit)),
                Ok(link) => link?,
            },
        };

        let subscribed = tokio::select! {
            _ = cancel.cancelled() => Err(ConnectError::Cancelled),
            result = timeout_at(deadline, link.subscribe()) => match result {
                Err(_) => Err(ConnectError::Timeout(limit)),
                Ok(notifications) => notifications.map_err(ConnectError::from),
            },
        };

        match subscribed {
            Ok(notifications) => Ok((link, notifications)),
            Err(err) => {
                close_link(&link).await;
                Err(err)
            },
        }
    }

    async fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }

        self.enabled = enabled;
        if enabled {
            info!("Connection enabled");
            self.consecutive_failures = 0;
            self.retry_at = Some(Instant::now());
        } else {
            info!("Connection disabled");
            self.stop().await;
        }
    }

    async fn stop(&mut self) {
        self.notifications = None;
        self.retry_at = None;

        if let Some(link) = self.link.take() {
            close_link(&link).await;
        }

        self.set_state(ConnectionState::Idle);
    }

    fn diagnostics(&self) -> Diagnostics {
        let now = Instant::now();

        Diagnostics {
            address: "**REDACTED**".to_string(),
            connection_state: self.current_state(),
            connection_enabled: self.enabled,
            state: self.consumer_state.clone(),
            notification_counter: self.session.counter().value(),
            zero_offset: self.session.zero_offset(),
            decode_errors: self.session.decode_errors(),
            misaligned_notifications: self.session.misaligned_notifications(),
            consecutive_connect_failures: self.consecutive_failures,
            seconds_since_battery_read: self.session.last_battery_read()
                .map(|last| now.saturating_duration_since(last).as_secs()),
        }
    }
}

/// A running session: the manager and watcher tasks plus a handle to command them.
pub struct Session {
    pub dispatcher: CommandDispatcher,
    pub manager: JoinHandle<()>,
    pub watcher: JoinHandle<()>,
}

impl Session {
    /// Wait for both tasks after `cancel` was cancelled.
    pub async fn join(self) {
        if let Err(err) = self.manager.await {
            warn!("Connection manager task failed: {:?}", err);
        }
        if let Err(err) = self.watcher.await {
            warn!("Advertisement watcher task failed: {:?}", err);
        }
    }
}

/// Bind a session to `identity`: spawns the advertisement watcher and the connection manager.
pub fn spawn_session<T: BleTransport>(
    transport: Arc<T>,
    identity: DeviceIdentity,
    enabled: bool,
    senders: Vec<Sender<DeviceEvent>>,
    cancel: CancellationToken,
) -> Session {
    // capacity of one pending advertisement; further ones are dropped by the watcher
    let (reachable_tx, reachable_rx) = channel::<Advertisement>(0);
    let (command_tx, command_rx) = channel::<Command>(8);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

    let watcher = watch_advertisements(
        cancel.child_token(),
        transport.clone(),
        identity.clone(),
        state_rx.clone(),
        reachable_tx,
    );

    let manager = ConnectionManager::new(transport, identity, enabled, state_tx, reachable_rx, command_rx, senders);
    let manager = spawn(manager.run(cancel));

    Session {
        dispatcher: CommandDispatcher::new(command_tx, state_rx),
        manager,
        watcher,
    }
}
