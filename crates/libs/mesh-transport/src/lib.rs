//! The transport-core contract consumed by every mesh interface and by the
//! LXMF router.
//!
//! The real node wires this to the `reticulum` crate's `Transport`; this
//! crate only defines the seam and ships [`StubTransport`], an in-memory
//! double used by interface-level unit tests so they never need a live
//! Reticulum instance.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub type DestinationHash = [u8; 16];

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("packet malformed: {0}")]
    Malformed(&'static str),
    #[error("interface {0} not registered")]
    UnknownInterface(String),
    #[error("no route to destination")]
    NoPath,
    #[error("interface offline")]
    Offline,
}

/// An opaque, fully-formed Reticulum datagram. The core never inspects
/// anything but the destination hash carried in its first 16 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub destination: DestinationHash,
    raw: Vec<u8>,
}

impl Packet {
    pub fn new(destination: DestinationHash, raw: Vec<u8>) -> Self {
        Self { destination, raw }
    }

    pub fn parse(raw: &[u8]) -> Result<Self, TransportError> {
        if raw.len() < 16 {
            return Err(TransportError::Malformed("shorter than a destination hash"));
        }
        let mut destination = [0u8; 16];
        destination.copy_from_slice(&raw[..16]);
        Ok(Self { destination, raw: raw.to_vec() })
    }

    pub fn serialize(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.raw
    }
}

#[derive(Debug, Clone)]
pub struct Announce {
    pub destination: DestinationHash,
    pub app_data: Vec<u8>,
    pub hops: u8,
}

/// Registered against one or more dot-separated aspects (e.g.
/// `lxmf.propagation`); only matching announces are delivered.
pub trait AnnounceHandler: Send + Sync {
    fn aspects(&self) -> &[&'static str];
    fn received(&self, announce: &Announce);
}

/// The common shape every transport interface (TCP, LoRa, Auto, BLE)
/// presents to the orchestrator's main loop.
#[async_trait]
pub trait Interface: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self) -> Result<(), TransportError>;
    async fn stop(&self);
    /// One iteration of interface-owned maintenance; called every
    /// orchestrator tick and must never block longer than a few tens of
    /// milliseconds.
    async fn tick(&self) -> Result<(), TransportError>;
    async fn send(&self, packet: &Packet) -> Result<(), TransportError>;
    fn online(&self) -> bool;
    fn bitrate(&self) -> Option<u64> {
        None
    }
    fn rssi(&self) -> Option<i16> {
        None
    }
    fn snr(&self) -> Option<f32> {
        None
    }
}

#[async_trait]
pub trait TransportCore: Send + Sync {
    async fn register_interface(&self, iface: Arc<dyn Interface>);
    async fn deregister_interface(&self, name: &str);
    async fn process_inbound(&self, raw: &[u8], iface_name: &str) -> Result<(), TransportError>;
    async fn send(&self, packet: Packet) -> Result<(), TransportError>;
    fn register_announce_handler(&self, handler: Arc<dyn AnnounceHandler>);
    fn recall_identity(&self, destination: DestinationHash) -> Option<Vec<u8>>;
    fn recall_app_data(&self, destination: DestinationHash) -> Option<Vec<u8>>;
    fn has_path(&self, destination: DestinationHash) -> bool;
}

/// In-memory [`TransportCore`] double: routes packets to whichever
/// registered interface reports itself online, and lets tests inject paths
/// and app data without a real Reticulum stack.
#[derive(Default)]
pub struct StubTransport {
    interfaces: Mutex<HashMap<String, Arc<dyn Interface>>>,
    handlers: Mutex<Vec<Arc<dyn AnnounceHandler>>>,
    paths: Mutex<HashMap<DestinationHash, Vec<u8>>>,
    app_data: Mutex<HashMap<DestinationHash, Vec<u8>>>,
    pub sent: Mutex<Vec<Packet>>,
}

impl StubTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_path(&self, destination: DestinationHash, identity: Vec<u8>) {
        self.paths.lock().unwrap().insert(destination, identity);
    }

    pub fn set_app_data(&self, destination: DestinationHash, data: Vec<u8>) {
        self.app_data.lock().unwrap().insert(destination, data);
    }

    pub fn deliver_announce(&self, announce: Announce) {
        for handler in self.handlers.lock().unwrap().iter() {
            handler.received(&announce);
        }
    }
}

#[async_trait]
impl TransportCore for StubTransport {
    async fn register_interface(&self, iface: Arc<dyn Interface>) {
        self.interfaces.lock().unwrap().insert(iface.name().to_string(), iface);
    }

    async fn deregister_interface(&self, name: &str) {
        self.interfaces.lock().unwrap().remove(name);
    }

    async fn process_inbound(&self, raw: &[u8], iface_name: &str) -> Result<(), TransportError> {
        if !self.interfaces.lock().unwrap().contains_key(iface_name) {
            return Err(TransportError::UnknownInterface(iface_name.to_string()));
        }
        let packet = Packet::parse(raw)?;
        self.sent.lock().unwrap().push(packet);
        Ok(())
    }

    async fn send(&self, packet: Packet) -> Result<(), TransportError> {
        let online = {
            let interfaces = self.interfaces.lock().unwrap();
            interfaces.values().any(|iface| iface.online())
        };
        if !online {
            return Err(TransportError::Offline);
        }
        self.sent.lock().unwrap().push(packet);
        Ok(())
    }

    fn register_announce_handler(&self, handler: Arc<dyn AnnounceHandler>) {
        self.handlers.lock().unwrap().push(handler);
    }

    fn recall_identity(&self, destination: DestinationHash) -> Option<Vec<u8>> {
        self.paths.lock().unwrap().get(&destination).cloned()
    }

    fn recall_app_data(&self, destination: DestinationHash) -> Option<Vec<u8>> {
        self.app_data.lock().unwrap().get(&destination).cloned()
    }

    fn has_path(&self, destination: DestinationHash) -> bool {
        self.paths.lock().unwrap().contains_key(&destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysOnline;

    #[async_trait]
    impl Interface for AlwaysOnline {
        fn name(&self) -> &str {
            "test"
        }
        async fn start(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn stop(&self) {}
        async fn tick(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn send(&self, _packet: &Packet) -> Result<(), TransportError> {
            Ok(())
        }
        fn online(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn send_fails_with_no_interfaces_online() {
        let transport = StubTransport::new();
        let err = transport.send(Packet::new([1; 16], vec![1; 16])).await.unwrap_err();
        assert!(matches!(err, TransportError::Offline));
    }

    #[tokio::test]
    async fn send_succeeds_once_an_interface_is_online() {
        let transport = StubTransport::new();
        transport.register_interface(Arc::new(AlwaysOnline)).await;
        transport.send(Packet::new([1; 16], vec![1; 16])).await.unwrap();
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn parse_rejects_short_packets() {
        assert!(Packet::parse(&[1, 2, 3]).is_err());
    }
}
