//! IPv6 link-local multicast peer discovery, with a unicast data path once a
//! peer is known.
//!
//! The radio/socket layer is behind [`DiscoverySocket`] so the discovery
//! state machine (token derivation, peer bookkeeping, dedup, echo-timeout
//! detection) is host-testable without binding real multicast sockets.

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mesh_transport::{Interface, Packet, TransportCore, TransportError};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

pub const DISCOVERY_PORT: u16 = 29716;
pub const REVERSE_PORT: u16 = 29717;
pub const DATA_PORT: u16 = 42671;

pub const ANNOUNCE_INTERVAL: Duration = Duration::from_millis(1600);
pub const REVERSE_PEERING_INTERVAL: Duration = Duration::from_millis(5200);
pub const PEER_JOB_INTERVAL: Duration = Duration::from_secs(4);
pub const ECHO_TIMEOUT: Duration = Duration::from_millis(6500);
pub const PEER_EXPIRY: Duration = Duration::from_secs(22);

const DEDUP_CAPACITY: usize = 48;
const DEDUP_TTL: Duration = Duration::from_millis(750);

/// 32-byte discovery token: `sha256(group_id || link_local_address)`.
pub fn discovery_token(group_id: &str, link_local: Ipv6Addr) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(group_id.as_bytes());
    hasher.update(link_local.octets());
    hasher.finalize().into()
}

#[derive(Debug, Clone)]
pub struct AutoInterfacePeer {
    pub address: Ipv6Addr,
    pub data_port: u16,
    pub last_heard: Instant,
    pub last_outbound: Option<Instant>,
    pub is_local: bool,
}

/// Bounded ring of recently-seen packet hashes; membership test only, no
/// ordering guarantee is implied or required.
pub struct DedupDeque {
    capacity: usize,
    ttl: Duration,
    entries: std::collections::VecDeque<([u8; 32], Instant)>,
}

impl DedupDeque {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self { capacity, ttl, entries: std::collections::VecDeque::with_capacity(capacity) }
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(&(_, seen_at)) = self.entries.front() {
            if now.duration_since(seen_at) > self.ttl {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Returns true if `hash` was already recorded (and thus a duplicate);
    /// always records the hash afterward.
    pub fn check_and_insert(&mut self, hash: [u8; 32], now: Instant) -> bool {
        self.evict_expired(now);
        if self.entries.iter().any(|(h, _)| *h == hash) {
            return true;
        }
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((hash, now));
        false
    }
}

impl Default for DedupDeque {
    fn default() -> Self {
        Self::new(DEDUP_CAPACITY, DEDUP_TTL)
    }
}

fn packet_hash(payload: &[u8]) -> [u8; 32] {
    Sha256::digest(payload).into()
}

#[async_trait]
pub trait DiscoverySocket: Send + Sync {
    async fn send_multicast(&self, payload: &[u8]) -> std::io::Result<()>;
    async fn send_reverse(&self, payload: &[u8], to: Ipv6Addr) -> std::io::Result<()>;
    async fn send_data(&self, payload: &[u8], to: Ipv6Addr) -> std::io::Result<()>;
    /// Non-blocking poll; returns `None` if nothing is pending.
    async fn poll_discovery(&self) -> Option<(Vec<u8>, Ipv6Addr)>;
    async fn poll_data(&self) -> Option<(Vec<u8>, Ipv6Addr)>;
    fn local_link_local(&self) -> Option<Ipv6Addr>;
}

struct State {
    peers: HashMap<Ipv6Addr, AutoInterfacePeer>,
    dedup: DedupDeque,
    local_link_local: Option<Ipv6Addr>,
    last_echo_seen: Instant,
}

pub struct AutoInterface {
    name: String,
    group_id: String,
    socket: Arc<dyn DiscoverySocket>,
    transport: Arc<dyn TransportCore>,
    online: AtomicBool,
    timed_out: AtomicBool,
    carrier_changed: AtomicBool,
    state: Mutex<State>,
}

impl AutoInterface {
    pub fn new(
        name: impl Into<String>,
        group_id: impl Into<String>,
        socket: Arc<dyn DiscoverySocket>,
        transport: Arc<dyn TransportCore>,
    ) -> Self {
        Self {
            name: name.into(),
            group_id: group_id.into(),
            socket,
            transport,
            online: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            carrier_changed: AtomicBool::new(false),
            state: Mutex::new(State {
                peers: HashMap::new(),
                dedup: DedupDeque::default(),
                local_link_local: None,
                last_echo_seen: Instant::now(),
            }),
        }
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    /// Edge-triggered: clears on read, matching the reference node's
    /// level-not-counter semantics.
    pub fn carrier_changed(&self) -> bool {
        self.carrier_changed.swap(false, Ordering::AcqRel)
    }

    async fn announce(&self) {
        let Some(link_local) = self.socket.local_link_local() else { return };
        {
            let mut state = self.state.lock().await;
            if state.local_link_local != Some(link_local) {
                state.local_link_local = Some(link_local);
                self.carrier_changed.store(true, Ordering::Release);
            }
        }
        let token = discovery_token(&self.group_id, link_local);
        if self.socket.send_multicast(&token).await.is_err() {
            log::warn!("auto: iface={} multicast send failed", self.name);
        }
    }

    async fn reverse_peer_stale_peers(&self) {
        let Some(link_local) = self.socket.local_link_local() else { return };
        let token = discovery_token(&self.group_id, link_local);
        let now = Instant::now();
        let stale: Vec<Ipv6Addr> = {
            let state = self.state.lock().await;
            state
                .peers
                .values()
                .filter(|p| !p.is_local && p.last_outbound.map(|t| now.duration_since(t) > REVERSE_PEERING_INTERVAL).unwrap_or(true))
                .map(|p| p.address)
                .collect()
        };
        for addr in stale {
            let _ = self.socket.send_reverse(&token, addr).await;
        }
    }

    async fn check_echo_timeout(&self) {
        let mut state = self.state.lock().await;
        if Instant::now().duration_since(state.last_echo_seen) > ECHO_TIMEOUT {
            if !self.timed_out.swap(true, Ordering::AcqRel) {
                log::warn!("auto: iface={} echo timeout, check local firewall rules", self.name);
                self.carrier_changed.store(true, Ordering::Release);
            }
        }
        let _ = &mut state;
    }

    async fn expire_stale_peers(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.peers.retain(|_, peer| peer.is_local || now.duration_since(peer.last_heard) <= PEER_EXPIRY);
    }

    async fn handle_discovery_datagram(&self, payload: Vec<u8>, from: Ipv6Addr) {
        if payload.len() != 32 {
            return;
        }
        let mut state = self.state.lock().await;
        self.timed_out.store(false, Ordering::Release);
        state.last_echo_seen = Instant::now();
        let is_local = state.local_link_local == Some(from);
        let entry = state.peers.entry(from).or_insert_with(|| AutoInterfacePeer {
            address: from,
            data_port: DATA_PORT,
            last_heard: Instant::now(),
            last_outbound: None,
            is_local,
        });
        entry.last_heard = Instant::now();
        entry.is_local = is_local;
    }

    async fn handle_data_datagram(&self, payload: Vec<u8>) {
        let hash = packet_hash(&payload);
        let mut state = self.state.lock().await;
        if state.dedup.check_and_insert(hash, Instant::now()) {
            return;
        }
        drop(state);
        let _ = self.transport.process_inbound(&payload, &self.name).await;
    }

    /// Drains any pending datagrams on both sockets; called by [`Interface::tick`]
    /// and directly by tests.
    pub async fn poll_once(&self) {
        if let Some((payload, from)) = self.socket.poll_discovery().await {
            self.handle_discovery_datagram(payload, from).await;
        }
        if let Some((payload, _from)) = self.socket.poll_data().await {
            self.handle_data_datagram(payload).await;
        }
    }
}

#[async_trait]
impl Interface for AutoInterface {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), TransportError> {
        self.online.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) {
        self.online.store(false, Ordering::Release);
    }

    async fn tick(&self) -> Result<(), TransportError> {
        self.poll_once().await;
        self.check_echo_timeout().await;
        self.expire_stale_peers().await;
        Ok(())
    }

    async fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        let peers: Vec<Ipv6Addr> = {
            let state = self.state.lock().await;
            state.peers.values().filter(|p| !p.is_local).map(|p| p.address).collect()
        };
        if peers.is_empty() {
            return Err(TransportError::NoPath);
        }
        let mut state = self.state.lock().await;
        for addr in &peers {
            if self.socket.send_data(packet.serialize(), *addr).await.is_err() {
                log::debug!("auto: iface={} send to {addr} failed", self.name);
                continue;
            }
            if let Some(peer) = state.peers.get_mut(addr) {
                peer.last_outbound = Some(Instant::now());
            }
        }
        Ok(())
    }

    fn online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}

/// Drives the periodic announce/reverse-peering/peer-job cadence. Intended
/// to be spawned once per started interface.
pub async fn run_periodic_jobs(iface: Arc<AutoInterface>, cancel: tokio_util::sync::CancellationToken) {
    let mut announce = tokio::time::interval(ANNOUNCE_INTERVAL);
    announce.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut reverse = tokio::time::interval(REVERSE_PEERING_INTERVAL);
    reverse.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut peer_job = tokio::time::interval(PEER_JOB_INTERVAL);
    peer_job.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = announce.tick() => iface.announce().await,
            _ = reverse.tick() => iface.reverse_peer_stale_peers().await,
            _ = peer_job.tick() => { /* link-local re-check happens inside announce() */ }
        }
    }
}

pub mod net {
    //! Real multicast/unicast socket plumbing for one network interface.

    use super::{DiscoverySocket, DATA_PORT, DISCOVERY_PORT, REVERSE_PORT};
    use async_trait::async_trait;
    use socket2::{Domain, Protocol, Socket, Type};
    use std::net::{Ipv6Addr, SocketAddrV6};
    use tokio::net::UdpSocket;
    use tokio::sync::Mutex;

    pub struct TokioDiscoverySocket {
        discovery: UdpSocket,
        reverse: UdpSocket,
        data: UdpSocket,
        local_link_local: Ipv6Addr,
        scope_id: u32,
        recv_buf: Mutex<Box<[u8; 2048]>>,
    }

    impl TokioDiscoverySocket {
        pub async fn bind(
            group_id_multicast: Ipv6Addr,
            local_link_local: Ipv6Addr,
            scope_id: u32,
        ) -> std::io::Result<Self> {
            let discovery = bind_multicast(group_id_multicast, DISCOVERY_PORT, scope_id)?;
            let reverse = bind_unicast(REVERSE_PORT)?;
            let data = bind_unicast(DATA_PORT)?;
            Ok(Self {
                discovery,
                reverse,
                data,
                local_link_local,
                scope_id,
                recv_buf: Mutex::new(Box::new([0u8; 2048])),
            })
        }
    }

    fn bind_multicast(group: Ipv6Addr, port: u16, scope_id: u32) -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        let addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, scope_id);
        socket.bind(&addr.into())?;
        socket.join_multicast_v6(&group, scope_id)?;
        UdpSocket::from_std(socket.into())
    }

    fn bind_unicast(port: u16) -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        let addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0);
        socket.bind(&addr.into())?;
        UdpSocket::from_std(socket.into())
    }

    fn ipv6_of(addr: std::net::SocketAddr) -> Ipv6Addr {
        match addr {
            std::net::SocketAddr::V6(v6) => *v6.ip(),
            std::net::SocketAddr::V4(v4) => v4.ip().to_ipv6_mapped(),
        }
    }

    #[async_trait]
    impl DiscoverySocket for TokioDiscoverySocket {
        async fn send_multicast(&self, payload: &[u8]) -> std::io::Result<()> {
            let dest = SocketAddrV6::new(
                "ff02::1".parse().unwrap(),
                DISCOVERY_PORT,
                0,
                self.scope_id,
            );
            self.discovery.send_to(payload, dest).await.map(|_| ())
        }

        async fn send_reverse(&self, payload: &[u8], to: Ipv6Addr) -> std::io::Result<()> {
            let dest = SocketAddrV6::new(to, REVERSE_PORT, 0, self.scope_id);
            self.reverse.send_to(payload, dest).await.map(|_| ())
        }

        async fn send_data(&self, payload: &[u8], to: Ipv6Addr) -> std::io::Result<()> {
            let dest = SocketAddrV6::new(to, DATA_PORT, 0, self.scope_id);
            self.data.send_to(payload, dest).await.map(|_| ())
        }

        async fn poll_discovery(&self) -> Option<(Vec<u8>, Ipv6Addr)> {
            let mut buf = self.recv_buf.lock().await;
            match self.discovery.try_recv_from(&mut buf[..]) {
                Ok((n, from)) => Some((buf[..n].to_vec(), ipv6_of(from))),
                Err(_) => None,
            }
        }

        async fn poll_data(&self) -> Option<(Vec<u8>, Ipv6Addr)> {
            let mut buf = self.recv_buf.lock().await;
            match self.data.try_recv_from(&mut buf[..]) {
                Ok((n, from)) => Some((buf[..n].to_vec(), ipv6_of(from))),
                Err(_) => None,
            }
        }

        fn local_link_local(&self) -> Option<Ipv6Addr> {
            Some(self.local_link_local)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_transport::StubTransport;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn discovery_token_matches_reference_construction() {
        let token = discovery_token("reticulum", "fe80::1234:5678:9abc:def0".parse().unwrap());
        let mut hasher = Sha256::new();
        hasher.update(b"reticulum");
        hasher.update("fe80::1234:5678:9abc:def0".parse::<Ipv6Addr>().unwrap().octets());
        let expected: [u8; 32] = hasher.finalize().into();
        assert_eq!(token, expected);
    }

    #[test]
    fn dedup_deque_drops_duplicates_until_ttl_elapses() {
        let mut dedup = DedupDeque::new(4, Duration::from_millis(50));
        let now = Instant::now();
        let hash = [1u8; 32];
        assert!(!dedup.check_and_insert(hash, now));
        assert!(dedup.check_and_insert(hash, now));
        assert!(!dedup.check_and_insert(hash, now + Duration::from_millis(100)));
    }

    #[test]
    fn dedup_deque_evicts_oldest_when_full() {
        let mut dedup = DedupDeque::new(2, Duration::from_secs(10));
        let now = Instant::now();
        assert!(!dedup.check_and_insert([1; 32], now));
        assert!(!dedup.check_and_insert([2; 32], now));
        assert!(!dedup.check_and_insert([3; 32], now));
        // [1;32] should have been evicted to make room.
        assert!(!dedup.check_and_insert([1; 32], now));
    }

    struct FakeSocket {
        local: Ipv6Addr,
        discovery_inbox: StdMutex<Vec<(Vec<u8>, Ipv6Addr)>>,
        data_inbox: StdMutex<Vec<(Vec<u8>, Ipv6Addr)>>,
        sent_data: StdMutex<Vec<(Vec<u8>, Ipv6Addr)>>,
    }

    #[async_trait]
    impl DiscoverySocket for FakeSocket {
        async fn send_multicast(&self, _payload: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
        async fn send_reverse(&self, _payload: &[u8], _to: Ipv6Addr) -> std::io::Result<()> {
            Ok(())
        }
        async fn send_data(&self, payload: &[u8], to: Ipv6Addr) -> std::io::Result<()> {
            self.sent_data.lock().unwrap().push((payload.to_vec(), to));
            Ok(())
        }
        async fn poll_discovery(&self) -> Option<(Vec<u8>, Ipv6Addr)> {
            self.discovery_inbox.lock().unwrap().pop()
        }
        async fn poll_data(&self) -> Option<(Vec<u8>, Ipv6Addr)> {
            self.data_inbox.lock().unwrap().pop()
        }
        fn local_link_local(&self) -> Option<Ipv6Addr> {
            Some(self.local)
        }
    }

    #[tokio::test]
    async fn discovery_datagram_registers_a_peer_and_data_is_delivered_once() {
        let local: Ipv6Addr = "fe80::1".parse().unwrap();
        let peer_addr: Ipv6Addr = "fe80::2".parse().unwrap();
        let token = discovery_token("reticulum", peer_addr);
        let socket = Arc::new(FakeSocket {
            local,
            discovery_inbox: StdMutex::new(vec![(token.to_vec(), peer_addr)]),
            data_inbox: StdMutex::new(vec![(vec![9u8; 16], peer_addr)]),
            sent_data: StdMutex::new(Vec::new()),
        });
        let transport = Arc::new(StubTransport::new());
        let iface = AutoInterface::new("auto0", "reticulum", socket, transport.clone());
        iface.start().await.unwrap();
        iface.tick().await.unwrap();

        assert_eq!(transport.sent.lock().unwrap().len(), 1);

        let packet = Packet::new([9u8; 16], vec![9u8; 16]);
        iface.send(&packet).await.unwrap();
    }
}
