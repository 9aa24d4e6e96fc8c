use serde::Serialize;
use uuid::Uuid;

use crate::device::constants::{make_pressure_service_uuid, DEVICE_NAME_PREFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        *self == ConnectionState::Connected
    }

    /// Connecting or Connected; the single link to the device is taken.
    pub fn is_busy(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let result = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    StateChange(ConnectionState),
    Pressure(i32), // calibrated, millibar
    Temperature(f32), // degrees Celsius
    Battery(u8), // percent
}

/// One advertisement as seen by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: String,
    pub local_name: Option<String>,
    pub services: Vec<Uuid>,
    pub rssi: Option<i16>,
}

pub fn is_supported_name(name: &str) -> bool {
    name.starts_with(DEVICE_NAME_PREFIX)
}

impl Advertisement {
    /// True if the advertisement comes from a Pressensor, by name prefix or by service.
    pub fn is_pressensor(&self) -> bool {
        self.has_supported_name() || self.services.contains(&make_pressure_service_uuid())
    }

    pub fn has_supported_name(&self) -> bool {
        self.local_name.as_deref().map(is_supported_name).unwrap_or(false)
    }
}

/// The device a session is bound to. Immutable for the lifetime of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    address: String,
    name: Option<String>,
    service: Uuid,
}

impl DeviceIdentity {
    pub fn new(address: &str, name: Option<String>) -> Self {
        DeviceIdentity {
            address: address.to_uppercase(),
            name,
            service: make_pressure_service_uuid(),
        }
    }

    pub fn from_advertisement(advertisement: &Advertisement) -> Option<Self> {
        if !advertisement.is_pressensor() {
            return None;
        }

        Some(DeviceIdentity::new(&advertisement.address, advertisement.local_name.clone()))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn service(&self) -> &Uuid {
        &self.service
    }

    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        advertisement.address.eq_ignore_ascii_case(&self.address)
            && (advertisement.has_supported_name() || advertisement.services.contains(&self.service))
    }
}

/// Latest values for the consumer side. Values stay as "last known" after a disconnect.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PressensorState {
    pub pressure_mbar: Option<i32>,
    pub temperature_c: Option<f32>,
    pub battery_percent: Option<u8>,
    pub connected: bool,
}
