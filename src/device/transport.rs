use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::device::types::{Advertisement, DeviceIdentity};
use crate::error::DeviceError;

/// Access to the radio: scanning and opening links. One instance may be shared by many sessions.
#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
    type Link: GattLink;

    /// Start scanning; the stream yields every advertisement seen, unfiltered.
    async fn advertisements(&self) -> Result<BoxStream<'static, Advertisement>, DeviceError>;

    /// Open a GATT connection to the device and resolve the characteristics in use.
    async fn connect(&self, identity: &DeviceIdentity) -> Result<Self::Link, DeviceError>;
}

/// An open GATT link to one device.
#[async_trait]
pub trait GattLink: Send + Sync + 'static {
    /// Subscribe to pressure notifications. The stream ends when the link drops.
    async fn subscribe(&self) -> Result<BoxStream<'static, Vec<u8>>, DeviceError>;

    /// Ask the adapter whether the link is still up.
    async fn is_connected(&self) -> Result<bool, DeviceError>;

    async fn read_battery(&self) -> Result<u8, DeviceError>;

    /// Write the zero command and wait for the write acknowledgement.
    async fn write_zero(&self) -> Result<(), DeviceError>;

    /// Unsubscribe and close the link.
    async fn disconnect(&self) -> Result<(), DeviceError>;
}
