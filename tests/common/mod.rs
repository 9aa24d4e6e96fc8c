#![allow(dead_code)]

use std::sync::{Arc, Mutex, MutexGuard};
use async_trait::async_trait;
use futures::channel::mpsc::{channel, unbounded, Receiver, Sender, UnboundedSender};
use futures::future::pending;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::spawn;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use pressensor_ble::device::commands::{Command, CommandDispatcher};
use pressensor_ble::device::connection::ConnectionManager;
use pressensor_ble::device::transport::{BleTransport, GattLink};
use pressensor_ble::device::types::{Advertisement, ConnectionState, DeviceEvent, DeviceIdentity};
use pressensor_ble::error::DeviceError;

pub const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";
pub const NAME: &str = "PRS12345";

#[derive(Default)]
pub struct MockState {
    pub connect_attempts: usize,
    pub fail_connects: usize,
    pub hang_connects: bool,
    pub hang_subscribe: bool,
    pub link_dead: bool,
    pub hang_liveness: bool,
    pub gate: Option<Arc<Notify>>,
    pub battery: Option<u8>,
    pub battery_reads: usize,
    pub zero_fails: bool,
    pub zero_writes: usize,
    pub disconnects: usize,
    pub scans: usize,
    notifier: Option<UnboundedSender<Vec<u8>>>,
    advertiser: Option<UnboundedSender<Advertisement>>,
}

/// In-memory transport; the test pushes advertisements and notifications through it.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        let mock = MockTransport::default();
        mock.state().battery = Some(85);
        mock
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn connect_attempts(&self) -> usize {
        self.state().connect_attempts
    }

    pub fn notify(&self, data: &[u8]) {
        let state = self.state();
        let notifier = state.notifier.as_ref().expect("not subscribed");
        notifier.unbounded_send(data.to_vec()).unwrap();
    }

    /// The peer goes away: the notification stream ends.
    pub fn drop_link(&self) {
        self.state().notifier = None;
    }

    pub fn advertise(&self, advertisement: Advertisement) {
        let state = self.state();
        let advertiser = state.advertiser.as_ref().expect("not scanning");
        advertiser.unbounded_send(advertisement).unwrap();
    }

    pub fn end_scan(&self) {
        self.state().advertiser = None;
    }
}

pub struct MockLink {
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl BleTransport for MockTransport {
    type Link = MockLink;

    async fn advertisements(&self) -> Result<BoxStream<'static, Advertisement>, DeviceError> {
        let (tx, rx) = unbounded();
        let mut state = self.state();
        state.scans += 1;
        state.advertiser = Some(tx);
        Ok(rx.boxed())
    }

    async fn connect(&self, identity: &DeviceIdentity) -> Result<MockLink, DeviceError> {
        let (gate, hang) = {
            let mut state = self.state();
            state.connect_attempts += 1;
            (state.gate.take(), state.hang_connects)
        };

        if let Some(gate) = gate {
            gate.notified().await;
        }
        if hang {
            pending::<()>().await;
        }

        let mut state = self.state();
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(DeviceError::DeviceNotFound { address: identity.address().to_string() });
        }

        Ok(MockLink { state: self.state.clone() })
    }
}

#[async_trait]
impl GattLink for MockLink {
    async fn subscribe(&self) -> Result<BoxStream<'static, Vec<u8>>, DeviceError> {
        let hang = self.state.lock().unwrap().hang_subscribe;
        if hang {
            pending::<()>().await;
        }

        let (tx, rx) = unbounded();
        self.state.lock().unwrap().notifier = Some(tx);
        Ok(rx.boxed())
    }

    async fn is_connected(&self) -> Result<bool, DeviceError> {
        let (hang, dead) = {
            let state = self.state.lock().unwrap();
            (state.hang_liveness, state.link_dead)
        };
        if hang {
            pending::<()>().await;
        }
        Ok(!dead)
    }

    async fn read_battery(&self) -> Result<u8, DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.battery_reads += 1;
        state.battery.ok_or(DeviceError::Btle { source: btleplug::Error::NotConnected })
    }

    async fn write_zero(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        if state.zero_fails {
            return Err(DeviceError::Btle { source: btleplug::Error::NotConnected });
        }
        state.zero_writes += 1;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.disconnects += 1;
        state.notifier = None;
        Ok(())
    }
}

pub fn identity() -> DeviceIdentity {
    DeviceIdentity::new(ADDRESS, Some(NAME.to_string()))
}

pub fn advertisement(address: &str, name: Option<&str>) -> Advertisement {
    Advertisement {
        address: address.to_string(),
        local_name: name.map(String::from),
        services: vec![],
        rssi: Some(-70),
    }
}

pub fn pressensor_advertisement() -> Advertisement {
    advertisement(ADDRESS, Some(NAME))
}

/// Pressure (and optional temperature in tenths of a degree) as the device encodes it.
pub fn payload(pressure: i16, temperature: Option<i16>) -> Vec<u8> {
    let mut data = Vec::from(pressure.to_be_bytes());
    if let Some(temperature) = temperature {
        data.extend_from_slice(&temperature.to_be_bytes());
    }
    data
}

/// Let every task run until it blocks. Time is paused in these tests, so this only advances the
/// clock by a few milliseconds.
pub async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

pub struct Harness {
    pub mock: MockTransport,
    pub dispatcher: CommandDispatcher,
    pub reachable: Sender<Advertisement>,
    pub events: Receiver<DeviceEvent>,
    pub state: watch::Receiver<ConnectionState>,
    pub cancel: CancellationToken,
    pub manager: JoinHandle<()>,
}

impl Harness {
    pub fn start(mock: MockTransport, enabled: bool) -> Self {
        Harness::start_with_event_buffer(mock, enabled, 1024)
    }

    pub fn start_with_event_buffer(mock: MockTransport, enabled: bool, event_buffer: usize) -> Self {
        let (reachable_tx, reachable_rx) = channel::<Advertisement>(0);
        let (command_tx, command_rx) = channel::<Command>(8);
        let (event_tx, event_rx) = channel::<DeviceEvent>(event_buffer);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let cancel = CancellationToken::new();

        let manager = ConnectionManager::new(
            Arc::new(mock.clone()),
            identity(),
            enabled,
            state_tx,
            reachable_rx,
            command_rx,
            vec![event_tx],
        );
        let manager = spawn(manager.run(cancel.clone()));

        Harness {
            mock,
            dispatcher: CommandDispatcher::new(command_tx, state_rx.clone()),
            reachable: reachable_tx,
            events: event_rx,
            state: state_rx,
            cancel,
            manager,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub async fn advertise(&mut self) {
        // a full channel means a signal is already pending, same as the watcher
        let _ = self.reachable.try_send(pressensor_advertisement());
        settle().await;
    }

    pub async fn connect(&mut self) {
        self.advertise().await;
        assert_eq!(self.connection_state(), ConnectionState::Connected);
    }

    pub async fn notify(&mut self, data: &[u8]) {
        self.mock.notify(data);
        settle().await;
    }

    /// All events emitted so far.
    pub fn drain_events(&mut self) -> Vec<DeviceEvent> {
        let mut events = vec![];
        while let Ok(Some(event)) = self.events.try_next() {
            events.push(event);
        }
        events
    }
}
