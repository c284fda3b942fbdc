//! Contract with the BLE transport.
//!
//! Scanning, connection setup, service discovery, MTU negotiation and
//! notification subscription all live behind these traits. The engine only
//! writes bytes and receives notification payloads through a
//! [`NotificationSink`].

use async_trait::async_trait;
use uuid::Uuid;

use crate::accumulator::NotificationSink;
use crate::error::TransportError;

/// MTU assumed until the transport reports the negotiated one.
pub const DEFAULT_MTU: usize = 247;

/// ATT header bytes taken from every write.
pub const ATT_OVERHEAD: usize = 3;

/// GATT layout of one hardware family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GattProfile {
    pub service: Uuid,
    pub write_characteristic: Uuid,
    pub notify_characteristic: Uuid,
}

#[derive(Clone, Debug)]
pub struct BleDeviceInfo {
    pub address: String,
    pub name: String,
}

#[async_trait]
pub trait BleConnector: Send {
    /// Connect, subscribe to the profile's notify characteristic and route
    /// every notification payload into `sink`.
    async fn connect(
        &mut self,
        device: &BleDeviceInfo,
        profile: &GattProfile,
        sink: NotificationSink,
    ) -> Result<Box<dyn BleLink>, TransportError>;
}

#[async_trait]
pub trait BleLink: Send {
    /// Write one payload of at most `mtu() - ATT_OVERHEAD` bytes.
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    fn mtu(&self) -> usize {
        DEFAULT_MTU
    }

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// Write `data`, split into as many writes as the link's MTU requires.
pub async fn write_all(link: &mut dyn BleLink, data: &[u8]) -> Result<(), TransportError> {
    let max = link.mtu().saturating_sub(ATT_OVERHEAD).max(1);
    for piece in data.chunks(max) {
        link.write(piece).await?;
    }
    Ok(())
}
