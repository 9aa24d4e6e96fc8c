use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::future::ready;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use log::{debug, info, warn};

use crate::device::constants::{make_battery_level_uuid, make_battery_service_uuid, COMMAND_ZERO_PRESSURE};
use crate::device::transport::{BleTransport, GattLink};
use crate::device::types::{Advertisement, DeviceIdentity};
use crate::error::DeviceError;

/// BLE transport over the local adapters, using btleplug.
pub struct BtleTransport {
    manager: Manager,
}

impl BtleTransport {
    pub async fn new() -> Result<Self, DeviceError> {
        let manager = Manager::new().await?;
        Ok(BtleTransport { manager })
    }

    async fn adapters(&self) -> Result<Vec<Adapter>, DeviceError> {
        let adapters = self.manager.adapters().await?;
        if adapters.is_empty() {
            return Err(DeviceError::NoAdapters);
        }
        Ok(adapters)
    }
}

fn event_peripheral_id(event: CentralEvent) -> Option<PeripheralId> {
    match event {
        CentralEvent::DeviceDiscovered(id) => Some(id),
        CentralEvent::DeviceUpdated(id) => Some(id),
        CentralEvent::ServicesAdvertisement { id, .. } => Some(id),
        CentralEvent::ServiceDataAdvertisement { id, .. } => Some(id),
        CentralEvent::ManufacturerDataAdvertisement { id, .. } => Some(id),
        _ => None,
    }
}

async fn advertisement_for(adapter: Adapter, id: PeripheralId) -> Option<Advertisement> {
    let peripheral = match adapter.peripheral(&id).await {
        Ok(v) => v,
        Err(err) => {
            debug!("Advertising peripheral vanished: {:?}", err);
            return None;
        },
    };

    match peripheral.properties().await {
        Err(err) => {
            warn!("Could not query peripheral for properties: {:?}", err);
            None
        },
        Ok(None) => None,
        Ok(Some(properties)) => Some(Advertisement {
            address: properties.address.to_string(),
            local_name: properties.local_name,
            services: properties.services,
            rssi: properties.rssi,
        }),
    }
}

async fn find_peripheral(adapters: &[Adapter], identity: &DeviceIdentity) -> Result<Option<(Adapter, Peripheral)>, DeviceError> {
    for adapter in adapters {
        let peripherals = match adapter.peripherals().await {
            Ok(v) => v,
            Err(err) => {
                warn!("Failed to query BLE adapter for peripherals: {}", err);
                continue;
            },
        };

        for peripheral in peripherals {
            match peripheral.properties().await {
                Err(err) => {
                    warn!("Could not query peripheral for properties: {:?}", err);
                },
                Ok(None) => {},
                Ok(Some(properties)) => {
                    if properties.address.to_string().eq_ignore_ascii_case(identity.address()) {
                        return Ok(Some((adapter.clone(), peripheral)));
                    }
                },
            }
        }
    }

    Ok(None)
}

#[async_trait]
impl BleTransport for BtleTransport {
    type Link = BtleLink;

    async fn advertisements(&self) -> Result<BoxStream<'static, Advertisement>, DeviceError> {
        let adapters = self.adapters().await?;
        let mut streams = Vec::with_capacity(adapters.len());

        for adapter in adapters {
            info!("Scanning using adapter {}...", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));

            // Sleeping devices do not always advertise their service, so filter locally instead
            adapter.start_scan(ScanFilter::default()).await?;

            let events = adapter.events().await?;
            let stream = events
                .filter_map(|event| ready(event_peripheral_id(event)))
                .then(move |id| advertisement_for(adapter.clone(), id))
                .filter_map(ready);
            streams.push(stream.boxed());
        }

        Ok(stream::select_all(streams).boxed())
    }

    async fn connect(&self, identity: &DeviceIdentity) -> Result<BtleLink, DeviceError> {
        let adapters = self.adapters().await?;
        let (adapter, peripheral) = find_peripheral(&adapters, identity)
            .await?
            .ok_or_else(|| DeviceError::DeviceNotFound { address: identity.address().to_string() })?;

        info!("Connecting to peripheral {}...", identity.address());
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }

        info!("Connected; Discovering services...");
        peripheral.discover_services().await?;

        let pressure_service_uuid = *identity.service();
        let battery_service_uuid = make_battery_service_uuid();
        let battery_level_uuid = make_battery_level_uuid();
        let mut pressure_char = None;
        let mut zero_char = None;
        let mut battery_char = None;

        for service in peripheral.services() {
            for characteristic in &service.characteristics {
                if service.uuid == pressure_service_uuid {
                    if characteristic.properties.contains(CharPropFlags::NOTIFY) {
                        pressure_char.get_or_insert_with(|| characteristic.clone());
                    }
                    else if characteristic.properties.contains(CharPropFlags::WRITE) {
                        zero_char.get_or_insert_with(|| characteristic.clone());
                    }
                }
                else if service.uuid == battery_service_uuid && characteristic.uuid == battery_level_uuid {
                    battery_char = Some(characteristic.clone());
                }
            }
        }

        let pressure_char = pressure_char.ok_or(DeviceError::MissingCharacteristic)?;
        if zero_char.is_none() {
            warn!("Peripheral has no zero characteristic");
        }
        if battery_char.is_none() {
            warn!("Peripheral has no battery level characteristic");
        }

        Ok(BtleLink { adapter, peripheral, pressure_char, zero_char, battery_char })
    }
}

pub struct BtleLink {
    adapter: Adapter,
    peripheral: Peripheral,
    pressure_char: Characteristic,
    zero_char: Option<Characteristic>,
    battery_char: Option<Characteristic>,
}

enum LinkEvent {
    Notification(Vec<u8>),
    Dropped,
}

#[async_trait]
impl GattLink for BtleLink {
    async fn subscribe(&self) -> Result<BoxStream<'static, Vec<u8>>, DeviceError> {
        // obtain the stream before subscribing so the first notification is not missed
        let notifications = self.peripheral.notifications().await?;
        let central_events = self.adapter.events().await?;

        info!("Subscribing to characteristic {:?}", self.pressure_char.uuid);
        self.peripheral.subscribe(&self.pressure_char).await?;

        let pressure_uuid = self.pressure_char.uuid;
        let peripheral_id = self.peripheral.id();

        let notifications = notifications
            .filter(move |notification| ready(notification.uuid == pressure_uuid))
            .map(|notification| LinkEvent::Notification(notification.value));
        let dropped = central_events
            .filter(move |event| ready(matches!(event, CentralEvent::DeviceDisconnected(id) if *id == peripheral_id)))
            .map(|_| LinkEvent::Dropped);

        let stream = stream::select(notifications, dropped)
            .take_while(|event| ready(matches!(event, LinkEvent::Notification(_))))
            .filter_map(|event| ready(match event {
                LinkEvent::Notification(value) => Some(value),
                LinkEvent::Dropped => None,
            }));

        Ok(stream.boxed())
    }

    async fn is_connected(&self) -> Result<bool, DeviceError> {
        Ok(self.peripheral.is_connected().await?)
    }

    async fn read_battery(&self) -> Result<u8, DeviceError> {
        let characteristic = self.battery_char.as_ref().ok_or(DeviceError::MissingCharacteristic)?;
        let value = self.peripheral.read(characteristic).await?;
        value.first().copied().ok_or(DeviceError::EmptyBatteryValue)
    }

    async fn write_zero(&self) -> Result<(), DeviceError> {
        let characteristic = self.zero_char.as_ref().ok_or(DeviceError::MissingCharacteristic)?;
        self.peripheral.write(characteristic, &COMMAND_ZERO_PRESSURE, WriteType::WithResponse).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        if let Err(err) = self.peripheral.unsubscribe(&self.pressure_char).await {
            debug!("Error stopping notifications during disconnect: {:?}", err);
        }
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
