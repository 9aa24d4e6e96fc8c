use std::io;
use std::str::Utf8Error;
use std::time::Duration;
use thiserror::Error;
use btleplug;
use serde_json;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (bluetooth): {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Failed to read from stdin: {source}")]
    IOError { #[from] source: io::Error },

    #[error("No Pressensor found within {0:?}")]
    DeviceNotFound(Duration),
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("A required bluetooth characteristic is not available")]
    MissingCharacteristic,

    #[error("No bluetooth adapters available")]
    NoAdapters,

    #[error("Device {address} is not known to any bluetooth adapter")]
    DeviceNotFound { address: String },

    #[error("Battery characteristic returned an empty value")]
    EmptyBatteryValue,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolDecodeError {
    #[error("Notification too short for the pressure field ({len} bytes)")]
    TooShort { len: usize },

    #[error("Notification has a truncated temperature field ({len} bytes)")]
    TruncatedTemperature { len: usize },
}

impl ProtocolDecodeError {
    /// Whether the pressure field was readable; if so the notification still counts towards the
    /// temperature cadence.
    pub fn pressure_parsed(&self) -> bool {
        matches!(self, ProtocolDecodeError::TruncatedTemperature { .. })
    }
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Connect attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connect attempt failed: {source}")]
    Device { #[from] source: DeviceError },

    #[error("Connect attempt was cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Command failed: device is not connected")]
    NotConnected,

    #[error("Command failed: connection is disabled")]
    ConnectionDisabled,

    #[error("Command failed: no pressure reading received yet")]
    NoPressureReading,

    #[error("Command failed: device did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Command failed: {source}")]
    Device { #[from] source: DeviceError },

    #[error("Command failed: {source}")]
    Connect { #[from] source: ConnectError },

    #[error("Command failed: session has stopped")]
    SessionClosed,
}
