//! Wi-Fi Direct transport placeholder.
//!
//! Peer-to-peer Wi-Fi needs platform services that are not available from a
//! portable Rust build.  Every operation fails with
//! [`ConnectionError::Unsupported`] so the session can surface the
//! `ConnectionUnavailable` screen instead of crashing.

use arpet_core::{ConnectionMode, Device, DeviceId};
use async_trait::async_trait;
use tracing::warn;

use crate::application::transport::{ConnectionError, EventSink, Transport};

const NAME: &str = "wifi-direct";

/// A transport that reports Wi-Fi Direct as unavailable.
#[derive(Debug, Clone)]
pub struct WifiDirectTransport {
    device: Device,
}

impl WifiDirectTransport {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    fn unsupported(&self, operation: &str) -> ConnectionError {
        warn!("{operation} is not available on the {NAME} transport");
        ConnectionError::Unsupported { transport: NAME }
    }
}

#[async_trait]
impl Transport for WifiDirectTransport {
    fn name(&self) -> &'static str {
        NAME
    }

    fn local_device(&self) -> Device {
        self.device.clone()
    }

    async fn discover_hosts(&self) -> Result<Vec<Device>, ConnectionError> {
        Err(self.unsupported("discover_hosts"))
    }

    async fn connect_to_devices(
        &self,
        _devices: Vec<Device>,
        _sink: EventSink,
    ) -> Result<(), ConnectionError> {
        Err(self.unsupported("connect_to_devices"))
    }

    async fn start_listening(&self, _sink: EventSink) -> Result<(), ConnectionError> {
        Err(self.unsupported("start_listening"))
    }

    async fn stop_listening(&self) -> Result<(), ConnectionError> {
        Err(self.unsupported("stop_listening"))
    }

    async fn send(&self, _bytes: Vec<u8>) -> Result<Vec<DeviceId>, ConnectionError> {
        Err(self.unsupported("send"))
    }

    async fn send_to(&self, _device: DeviceId, _bytes: Vec<u8>) -> Result<(), ConnectionError> {
        Err(self.unsupported("send_to"))
    }

    async fn disconnect(&self) {}

    fn total_connected(&self) -> usize {
        0
    }

    fn connected_devices(&self) -> Vec<DeviceId> {
        Vec::new()
    }

    fn mode(&self) -> ConnectionMode {
        ConnectionMode::None
    }
}
