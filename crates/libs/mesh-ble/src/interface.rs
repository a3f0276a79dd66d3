//! Orchestrates the fragmenter/reassembler, peer manager, and GATT op queue
//! into the [`mesh_transport::Interface`] contract.
//!
//! Platform callbacks never call back into this state directly: they push a
//! [`BleEvent`] onto a bounded pending queue which [`Interface::tick`] drains,
//! which is what keeps handshake completion and fragment delivery off the
//! BLE stack's own callback stack.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mesh_transport::{Interface, Packet, TransportCore, TransportError};

use crate::fragment::{fragment, PeerIdentity, Reassembler};
use crate::gatt_queue::{GattOpKind, GattOpQueue, DEFAULT_TIMEOUT};
use crate::peer::{should_initiate, Mac, PeerManager, PeerState};
use crate::platform::{advertised_name, identity_suffix_from_name, BleError, BleEvent, BleEventSink, BlePlatform};

const PENDING_EVENT_CAPACITY: usize = 256;
const SCAN_INTERVAL: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const CONNECTION_COOLDOWN: Duration = Duration::from_secs(3);

struct Shared {
    peers: PeerManager,
    reassembler: Reassembler,
    gatt: GattOpQueue,
    pending: VecDeque<BleEvent>,
    last_scan: Instant,
    last_keepalive: Instant,
}

pub struct BleInterface {
    name: String,
    local_identity: PeerIdentity,
    local_mac: Mac,
    platform: Arc<dyn BlePlatform>,
    transport: Arc<dyn TransportCore>,
    online: AtomicBool,
    shared: StdMutex<Shared>,
}

impl BleInterface {
    pub fn new(
        name: impl Into<String>,
        local_identity: PeerIdentity,
        local_mac: Mac,
        platform: Arc<dyn BlePlatform>,
        transport: Arc<dyn TransportCore>,
    ) -> Self {
        let now = Instant::now();
        Self {
            name: name.into(),
            local_identity,
            local_mac,
            platform,
            transport,
            online: AtomicBool::new(false),
            shared: StdMutex::new(Shared {
                peers: PeerManager::new(),
                reassembler: Reassembler::new(),
                gatt: GattOpQueue::new(),
                pending: VecDeque::new(),
                last_scan: now - SCAN_INTERVAL,
                last_keepalive: now - KEEPALIVE_INTERVAL,
            }),
        }
    }

    pub fn advertised_name(&self) -> String {
        advertised_name(&self.local_identity)
    }

    /// Registers this interface as its platform's event sink. Separate from
    /// `new` because the platform needs an `Arc<Self>`, which doesn't exist
    /// until after construction.
    pub fn attach_event_sink(self: &Arc<Self>) {
        self.platform.set_event_sink(self.clone());
    }

    /// Entry point for the platform's event callback. Never blocks and never
    /// calls back into the platform.
    pub fn push_event(&self, event: BleEvent) {
        let mut shared = self.shared.lock().unwrap();
        if shared.pending.len() >= PENDING_EVENT_CAPACITY {
            log::warn!("ble: iface={} pending event queue full, dropping oldest", self.name);
            shared.pending.pop_front();
        }
        shared.pending.push_back(event);
    }

    async fn handle_scan_result(&self, mac: Mac, local_name: Option<String>, rssi: i16) {
        let should_connect = {
            let mut shared = self.shared.lock().unwrap();
            let _ = shared.peers.discover(mac);
            if let Some(name) = &local_name {
                if let Some(suffix) = identity_suffix_from_name(name) {
                    if let Some(existing) = shared
                        .peers
                        .by_identity_matching_suffix(&suffix)
                        .map(|p| p.mac)
                    {
                        if existing != mac {
                            log::info!("ble: iface={} MAC rotation detected for peer suffix, remapping without a new handshake", self.name);
                            let _ = shared.peers.remap_mac(&existing, mac);
                        }
                    }
                }
            }
            if let Some(record) = shared.peers.by_mac_mut(&mac) {
                record.rssi = rssi;
                record.rssi_avg = record.rssi_avg * 0.8 + rssi as f32 * 0.2;
            }
            shared
                .peers
                .by_mac(&mac)
                .map(|p| p.state == PeerState::Discovered && should_initiate(&self.local_mac, &mac))
                .unwrap_or(false)
        };

        if should_connect {
            match self.platform.connect(mac).await {
                Ok(handle) => {
                    let mut shared = self.shared.lock().unwrap();
                    if let Some(record) = shared.peers.by_mac_mut(&mac) {
                        record.state = PeerState::Connecting;
                    }
                    drop(shared);
                    self.push_event(BleEvent::Connected { mac, handle });
                }
                Err(err) => {
                    log::debug!("ble: iface={} connect to peer failed: {err}", self.name);
                    let mut shared = self.shared.lock().unwrap();
                    let _ = shared.peers.record_failure(&mac);
                }
            }
        }
    }

    async fn handle_connected(&self, mac: Mac, handle: u16) {
        {
            let mut shared = self.shared.lock().unwrap();
            let _ = shared.peers.set_handle(&mac, handle);
            if let Some(record) = shared.peers.by_mac_mut(&mac) {
                record.state = PeerState::Handshaking;
            }
        }
        // Central writes its identity immediately after connecting.
        if self.platform.write(handle, &self.local_identity).await.is_err() {
            let mut shared = self.shared.lock().unwrap();
            let _ = shared.peers.record_failure(&mac);
        }
    }

    fn handle_write_received(&self, mac: Mac, payload: Vec<u8>) -> Option<(PeerIdentity, Vec<u8>)> {
        let mut shared = self.shared.lock().unwrap();
        let _ = shared.peers.discover(mac);
        let already_known = shared.peers.by_mac(&mac).and_then(|p| p.identity).is_some();

        if payload.len() == 16 && !already_known {
            let mut identity = [0u8; 16];
            identity.copy_from_slice(&payload);
            let _ = shared.peers.complete_handshake(mac, identity);
            return None;
        }

        let identity = shared.peers.by_mac(&mac).and_then(|p| p.identity)?;
        match shared.reassembler.accept(identity, &payload) {
            Ok(Some(full)) => Some((identity, full)),
            Ok(None) => None,
            Err(err) => {
                log::debug!("ble: iface={} dropped malformed fragment: {err}", self.name);
                None
            }
        }
    }

    fn handle_data_received(&self, handle: u16, payload: Vec<u8>) -> Option<(PeerIdentity, Vec<u8>)> {
        let mut shared = self.shared.lock().unwrap();
        let identity = shared.peers.by_handle(handle).and_then(|p| p.identity)?;
        match shared.reassembler.accept(identity, &payload) {
            Ok(Some(full)) => Some((identity, full)),
            Ok(None) => None,
            Err(err) => {
                log::debug!("ble: iface={} dropped malformed fragment: {err}", self.name);
                None
            }
        }
    }

    fn handle_disconnected(&self, handle: u16) {
        let mut shared = self.shared.lock().unwrap();
        shared.gatt.clear_for_connection(handle);
        if let Some(mac) = shared.peers.by_handle(handle).map(|p| p.mac) {
            if let Some(record) = shared.peers.by_mac_mut(&mac) {
                record.state = PeerState::Disconnected;
            }
        }
    }

    /// Drains pending events, applying deferred handshake/data effects.
    async fn drain_pending(&self) {
        let events: Vec<BleEvent> = {
            let mut shared = self.shared.lock().unwrap();
            shared.pending.drain(..).collect()
        };
        for event in events {
            match event {
                BleEvent::ScanResult { mac, local_name, rssi } => {
                    self.handle_scan_result(mac, local_name, rssi).await;
                }
                BleEvent::Connected { mac, handle } => {
                    self.handle_connected(mac, handle).await;
                }
                BleEvent::Disconnected { handle } => {
                    self.handle_disconnected(handle);
                }
                BleEvent::MtuNegotiated { handle, mtu } => {
                    let mut shared = self.shared.lock().unwrap();
                    if let Some(mac) = shared.peers.by_handle(handle).map(|p| p.mac) {
                        if let Some(record) = shared.peers.by_mac_mut(&mac) {
                            record.mtu = mtu;
                        }
                    }
                }
                BleEvent::WriteReceived { mac, payload } => {
                    if let Some((identity, full)) = self.handle_write_received(mac, payload) {
                        let _ = self.transport.process_inbound(&full, &self.name).await;
                        let _ = identity;
                    }
                }
                BleEvent::DataReceived { handle, payload } => {
                    if let Some((identity, full)) = self.handle_data_received(handle, payload) {
                        let _ = self.transport.process_inbound(&full, &self.name).await;
                        let _ = identity;
                    }
                }
            }
        }
    }

    fn maintenance(&self) {
        let mut shared = self.shared.lock().unwrap();
        shared.peers.expire_blacklist(Instant::now());
        shared.reassembler.sweep_timeouts();
        shared.gatt.sweep_timeouts();
        for completion in shared.gatt.drain_completions() {
            log::debug!("ble: iface={} gatt op {} completed {:?}", self.name, completion.id, completion.result);
        }
    }
}

#[async_trait]
impl Interface for BleInterface {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), TransportError> {
        self.platform.start_advertising(&self.advertised_name()).await.map_err(|_| TransportError::Offline)?;
        self.platform.start_scan().await.map_err(|_| TransportError::Offline)?;
        self.online.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.platform.stop_scan().await;
        self.online.store(false, Ordering::Release);
    }

    async fn tick(&self) -> Result<(), TransportError> {
        self.drain_pending().await;
        self.maintenance();

        let now = Instant::now();
        let due_for_scan = {
            let mut shared = self.shared.lock().unwrap();
            let due = now.duration_since(shared.last_scan) >= SCAN_INTERVAL;
            if due {
                shared.last_scan = now;
            }
            due
        };
        if due_for_scan {
            let _ = self.platform.start_scan().await;
        }
        Ok(())
    }

    async fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        let targets: Vec<(u16, u16)> = {
            let shared = self.shared.lock().unwrap();
            shared
                .peers
                .connected_handshaken()
                .filter_map(|p| p.handle.map(|h| (h, p.mtu)))
                .collect()
        };
        if targets.is_empty() {
            return Err(TransportError::NoPath);
        }
        for (handle, mtu) in targets {
            let payload_cap = (mtu as usize).saturating_sub(crate::fragment::HEADER_LEN).max(1);
            for frag in fragment(packet.serialize(), payload_cap) {
                {
                    let mut shared = self.shared.lock().unwrap();
                    shared.gatt.enqueue(handle, GattOpKind::Write, frag.clone(), DEFAULT_TIMEOUT);
                    shared.gatt.process();
                }
                let result = self.platform.write(handle, &frag).await;
                let mut shared = self.shared.lock().unwrap();
                shared.gatt.complete(
                    if result.is_ok() { crate::gatt_queue::GattOpResult::Success } else { crate::gatt_queue::GattOpResult::Failure },
                    None,
                );
                if result.is_err() {
                    log::debug!("ble: iface={} write to handle {handle} failed", self.name);
                }
            }
        }
        Ok(())
    }

    fn online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}

impl BleEventSink for BleInterface {
    fn push_event(&self, event: BleEvent) {
        BleInterface::push_event(self, event);
    }
}

impl PeerManager {
    fn by_identity_matching_suffix(&self, suffix: &[u8; 3]) -> Option<&crate::peer::PeerRecord> {
        self.iter().find(|p| p.identity.map(|id| &id[13..16] == suffix.as_slice()).unwrap_or(false))
    }

    fn connected_handshaken(&self) -> impl Iterator<Item = &crate::peer::PeerRecord> {
        self.iter().filter(|p| p.identity.is_some() && p.handle.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_transport::StubTransport;
    use std::sync::Mutex as StdSyncMutex;

    #[derive(Default)]
    struct FakePlatform {
        writes: StdSyncMutex<Vec<(u16, Vec<u8>)>>,
    }

    #[async_trait]
    impl BlePlatform for FakePlatform {
        async fn start_scan(&self) -> Result<(), BleError> {
            Ok(())
        }
        async fn stop_scan(&self) -> Result<(), BleError> {
            Ok(())
        }
        async fn connect(&self, _mac: Mac) -> Result<u16, BleError> {
            Ok(7)
        }
        async fn disconnect(&self, _handle: u16) -> Result<(), BleError> {
            Ok(())
        }
        async fn write(&self, handle: u16, payload: &[u8]) -> Result<(), BleError> {
            self.writes.lock().unwrap().push((handle, payload.to_vec()));
            Ok(())
        }
        async fn start_advertising(&self, _local_name: &str) -> Result<(), BleError> {
            Ok(())
        }
        fn set_event_sink(&self, _sink: Arc<dyn BleEventSink>) {}
    }

    #[tokio::test]
    async fn scan_result_drives_connect_and_identity_handshake_write() {
        let platform: Arc<FakePlatform> = Arc::new(FakePlatform::default());
        let transport: Arc<dyn TransportCore> = Arc::new(StubTransport::new());
        let local_identity = [3u8; 16];
        let local_mac = [1, 1, 1, 1, 1, 1];
        let iface = Arc::new(BleInterface::new("ble-test", local_identity, local_mac, platform.clone(), transport));

        let peer_mac = [9, 9, 9, 9, 9, 9];
        iface.push_event(BleEvent::ScanResult { mac: peer_mac, local_name: None, rssi: -40 });
        iface.tick().await.unwrap();
        iface.tick().await.unwrap();

        let writes = platform.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], (7, local_identity.to_vec()));

        let shared = iface.shared.lock().unwrap();
        assert_eq!(shared.peers.by_mac(&peer_mac).map(|p| p.handle), Some(Some(7)));
    }

    #[test]
    fn mac_rotation_remaps_existing_identity_without_a_handshake() {
        let mut peers = PeerManager::new();
        let old_mac = [1, 2, 3, 4, 5, 6];
        let new_mac = [1, 2, 3, 4, 5, 7];
        let identity = [7u8; 16];
        peers.discover(old_mac).unwrap();
        peers.complete_handshake(old_mac, identity).unwrap();
        peers.discover(new_mac).unwrap();

        let existing = peers.by_identity_matching_suffix(&[identity[13], identity[14], identity[15]]).map(|p| p.mac);
        assert_eq!(existing, Some(old_mac));
        peers.remap_mac(&old_mac, new_mac).unwrap();

        assert_eq!(peers.by_mac(&old_mac), None);
        assert_eq!(peers.by_mac(&new_mac).and_then(|p| p.identity), Some(identity));
    }
}
