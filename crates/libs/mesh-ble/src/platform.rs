//! Platform seam: the concrete radio stack (btleplug, a NimBLE/Bluedroid
//! FFI shim, or a test double) implements [`BlePlatform`]; everything above
//! it is pure state-machine logic that never touches the radio directly.

use std::sync::Arc;

use crate::peer::Mac;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BleError {
    #[error("scan failed: {0}")]
    Scan(String),
    #[error("connect to peer failed: {0}")]
    Connect(String),
    #[error("gatt operation failed: {0}")]
    Gatt(String),
    #[error("peripheral advertising failed: {0}")]
    Advertise(String),
}

#[derive(Debug, Clone)]
pub enum BleEvent {
    ScanResult { mac: Mac, local_name: Option<String>, rssi: i16 },
    Connected { mac: Mac, handle: u16 },
    Disconnected { handle: u16 },
    MtuNegotiated { handle: u16, mtu: u16 },
    /// Notification received by the central from the peripheral's TX characteristic.
    DataReceived { handle: u16, payload: Vec<u8> },
    /// Write received by the peripheral on its RX characteristic.
    WriteReceived { mac: Mac, payload: Vec<u8> },
}

/// Receiver for events a platform backend discovers asynchronously off its
/// own scan/notification streams — the backend never calls back into
/// interface logic directly, it only ever pushes onto this sink.
pub trait BleEventSink: Send + Sync {
    fn push_event(&self, event: BleEvent);
}

#[async_trait]
pub trait BlePlatform: Send + Sync {
    async fn start_scan(&self) -> Result<(), BleError>;
    async fn stop_scan(&self) -> Result<(), BleError>;
    async fn connect(&self, mac: Mac) -> Result<u16, BleError>;
    async fn disconnect(&self, handle: u16) -> Result<(), BleError>;
    async fn write(&self, handle: u16, payload: &[u8]) -> Result<(), BleError>;
    async fn start_advertising(&self, local_name: &str) -> Result<(), BleError>;
    /// Registers where the backend delivers scan results, connection-state
    /// changes, and inbound notifications as they happen.
    fn set_event_sink(&self, sink: Arc<dyn BleEventSink>);
}

/// Computes the `TD-XXXXXX` advertised name for a local 16-byte identity.
pub fn advertised_name(identity: &[u8; 16]) -> String {
    format!("TD-{:02X}{:02X}{:02X}", identity[13], identity[14], identity[15])
}

/// Extracts the 3 hex-encoded identity bytes from an advertised name, if it
/// matches the `TD-XXXXXX` convention.
pub fn identity_suffix_from_name(name: &str) -> Option<[u8; 3]> {
    let hex = name.strip_prefix("TD-")?;
    if hex.len() != 6 {
        return None;
    }
    let mut out = [0u8; 3];
    for i in 0..3 {
        out[i] = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertised_name_round_trips_through_suffix_extraction() {
        let identity = [0xAAu8; 13]
            .iter()
            .chain([0x11, 0x22, 0x33].iter())
            .copied()
            .collect::<Vec<u8>>();
        let identity: [u8; 16] = identity.try_into().unwrap();
        let name = advertised_name(&identity);
        assert_eq!(name, "TD-112233");
        assert_eq!(identity_suffix_from_name(&name), Some([0x11, 0x22, 0x33]));
    }

    #[test]
    fn non_matching_name_yields_none() {
        assert_eq!(identity_suffix_from_name("other-device"), None);
    }
}
