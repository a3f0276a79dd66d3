//! BLE peer manager: discovery/connection-state tracking, scoring, and
//! blacklist-with-backoff, indexed by both MAC and stable identity.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const MAX_PEERS: usize = 8;
const BLACKLIST_BASE: Duration = Duration::from_secs(2);
const BLACKLIST_CEILING: Duration = Duration::from_secs(300);
const ACTIVITY_HORIZON: Duration = Duration::from_secs(60);

pub type Mac = [u8; 6];
pub type PeerIdentity = [u8; 16];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Discovered,
    Connecting,
    Connected,
    Handshaking,
    Disconnected,
    Blacklisted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub mac: Mac,
    pub identity: Option<PeerIdentity>,
    pub state: PeerState,
    pub rssi: i16,
    pub rssi_avg: f32,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub connection_attempts: u32,
    pub successes: u32,
    pub failures: u32,
    pub consecutive_failures: u32,
    pub blacklisted_until: Option<Instant>,
    pub handle: Option<u16>,
    pub mtu: u16,
    pub last_activity: Instant,
}

impl PeerRecord {
    fn new(mac: Mac) -> Self {
        let now = Instant::now();
        Self {
            mac,
            identity: None,
            state: PeerState::Discovered,
            rssi: -100,
            rssi_avg: -100.0,
            packets_sent: 0,
            packets_received: 0,
            connection_attempts: 0,
            successes: 0,
            failures: 0,
            consecutive_failures: 0,
            blacklisted_until: None,
            handle: None,
            mtu: 23,
            last_activity: now,
        }
    }

    /// Weighted score in `[0, 1]`; higher is a better connection candidate.
    pub fn score(&self, now: Instant) -> f32 {
        let normalized_rssi = ((self.rssi_avg + 100.0) / 70.0).clamp(0.0, 1.0);
        let attempts = self.connection_attempts.max(1) as f32;
        let success_rate = self.successes as f32 / attempts;
        let elapsed = now.duration_since(self.last_activity).as_secs_f32();
        let recency = (1.0 - (elapsed / ACTIVITY_HORIZON.as_secs_f32())).clamp(0.0, 1.0);
        let throughput = ((self.packets_sent + self.packets_received) as f32 / 100.0).min(1.0);
        let penalty = (self.consecutive_failures as f32 * 0.1).min(1.0);

        (0.35 * normalized_rssi + 0.3 * success_rate + 0.2 * recency + 0.15 * throughput - penalty).max(0.0)
    }

    pub fn is_blacklisted(&self, now: Instant) -> bool {
        matches!(self.state, PeerState::Blacklisted) && self.blacklisted_until.map(|t| now < t).unwrap_or(false)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerManagerError {
    #[error("peer pool is full")]
    PoolFull,
    #[error("peer not found")]
    NotFound,
}

fn exponential_backoff(consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.min(10);
    let millis = BLACKLIST_BASE.as_millis() as u64 * 2u64.saturating_pow(exponent.saturating_sub(1).min(20));
    Duration::from_millis(millis).min(BLACKLIST_CEILING)
}

/// Returns whether `us` should initiate the connection to `peer`: the peer
/// with the numerically smaller MAC initiates, so both sides agree without
/// coordination.
pub fn should_initiate(us: &Mac, peer: &Mac) -> bool {
    us < peer
}

pub struct PeerManager {
    slots: Vec<Option<PeerRecord>>,
    mac_index: HashMap<Mac, usize>,
    identity_index: HashMap<PeerIdentity, usize>,
    handle_index: HashMap<u16, usize>,
}

impl Default for PeerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerManager {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_PEERS).map(|_| None).collect(),
            mac_index: HashMap::new(),
            identity_index: HashMap::new(),
            handle_index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn discover(&mut self, mac: Mac) -> Result<(), PeerManagerError> {
        if self.mac_index.contains_key(&mac) {
            return Ok(());
        }
        let slot_index = self.slots.iter().position(|s| s.is_none()).ok_or(PeerManagerError::PoolFull)?;
        self.slots[slot_index] = Some(PeerRecord::new(mac));
        self.mac_index.insert(mac, slot_index);
        Ok(())
    }

    pub fn by_mac(&self, mac: &Mac) -> Option<&PeerRecord> {
        self.mac_index.get(mac).and_then(|&i| self.slots[i].as_ref())
    }

    pub fn by_mac_mut(&mut self, mac: &Mac) -> Option<&mut PeerRecord> {
        let idx = *self.mac_index.get(mac)?;
        self.slots[idx].as_mut()
    }

    pub fn by_identity(&self, identity: &PeerIdentity) -> Option<&PeerRecord> {
        self.identity_index.get(identity).and_then(|&i| self.slots[i].as_ref())
    }

    pub fn by_handle(&self, handle: u16) -> Option<&PeerRecord> {
        self.handle_index.get(&handle).and_then(|&i| self.slots[i].as_ref())
    }

    /// Records the handshake outcome, promoting the peer into the identity
    /// index. MAC-rotation tolerant: if `identity` is already mapped to a
    /// different slot, that slot's MAC is updated instead of creating a
    /// duplicate record.
    pub fn complete_handshake(&mut self, mac: Mac, identity: PeerIdentity) -> Result<(), PeerManagerError> {
        if let Some(&existing_idx) = self.identity_index.get(&identity) {
            if let Some(new_idx) = self.mac_index.get(&mac).copied() {
                if new_idx != existing_idx {
                    // Same identity, rotated MAC: merge into the existing slot.
                    self.slots[new_idx] = None;
                    self.mac_index.remove(&mac);
                }
            }
            let record = self.slots[existing_idx].as_mut().ok_or(PeerManagerError::NotFound)?;
            record.mac = mac;
            record.state = PeerState::Connected;
            self.mac_index.insert(mac, existing_idx);
            return Ok(());
        }

        let idx = *self.mac_index.get(&mac).ok_or(PeerManagerError::NotFound)?;
        let record = self.slots[idx].as_mut().ok_or(PeerManagerError::NotFound)?;
        record.identity = Some(identity);
        record.state = PeerState::Connected;
        self.identity_index.insert(identity, idx);
        Ok(())
    }

    /// Re-homes a known identity's MAC without a handshake, for the case
    /// where a scan result reveals the identity advertising under a new
    /// rotated address. Any slot freshly `discover`ed under `new_mac` is
    /// merged away so the identity keeps its single, existing record.
    pub fn remap_mac(&mut self, old_mac: &Mac, new_mac: Mac) -> Result<(), PeerManagerError> {
        let idx = *self.mac_index.get(old_mac).ok_or(PeerManagerError::NotFound)?;
        if let Some(&stray_idx) = self.mac_index.get(&new_mac) {
            if stray_idx != idx {
                self.slots[stray_idx] = None;
                self.mac_index.remove(&new_mac);
            }
        }
        self.mac_index.remove(old_mac);
        self.mac_index.insert(new_mac, idx);
        self.slots[idx].as_mut().ok_or(PeerManagerError::NotFound)?.mac = new_mac;
        Ok(())
    }

    pub fn set_handle(&mut self, mac: &Mac, handle: u16) -> Result<(), PeerManagerError> {
        let idx = *self.mac_index.get(mac).ok_or(PeerManagerError::NotFound)?;
        self.slots[idx].as_mut().ok_or(PeerManagerError::NotFound)?.handle = Some(handle);
        self.handle_index.insert(handle, idx);
        Ok(())
    }

    pub fn record_success(&mut self, mac: &Mac) -> Result<(), PeerManagerError> {
        let record = self.by_mac_mut(mac).ok_or(PeerManagerError::NotFound)?;
        record.successes += 1;
        record.connection_attempts += 1;
        record.consecutive_failures = 0;
        record.blacklisted_until = None;
        record.last_activity = Instant::now();
        if record.state == PeerState::Blacklisted {
            record.state = PeerState::Discovered;
        }
        Ok(())
    }

    pub fn record_failure(&mut self, mac: &Mac) -> Result<Duration, PeerManagerError> {
        let record = self.by_mac_mut(mac).ok_or(PeerManagerError::NotFound)?;
        record.failures += 1;
        record.connection_attempts += 1;
        record.consecutive_failures += 1;
        let backoff = exponential_backoff(record.consecutive_failures);
        record.blacklisted_until = Some(Instant::now() + backoff);
        record.state = PeerState::Blacklisted;
        Ok(backoff)
    }

    /// Transitions any peer whose blacklist window has elapsed back to
    /// `Discovered`.
    pub fn expire_blacklist(&mut self, now: Instant) {
        for slot in self.slots.iter_mut().flatten() {
            if slot.state == PeerState::Blacklisted {
                if let Some(until) = slot.blacklisted_until {
                    if now >= until {
                        slot.state = PeerState::Discovered;
                        slot.blacklisted_until = None;
                    }
                }
            }
        }
    }

    pub fn remove(&mut self, mac: &Mac) {
        if let Some(idx) = self.mac_index.remove(mac) {
            if let Some(record) = self.slots[idx].take() {
                if let Some(identity) = record.identity {
                    self.identity_index.remove(&identity);
                }
                if let Some(handle) = record.handle {
                    self.handle_index.remove(&handle);
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.slots.iter().flatten()
    }

    pub fn best_connectable(&self, now: Instant) -> Option<&PeerRecord> {
        self.slots
            .iter()
            .flatten()
            .filter(|p| !p.is_blacklisted(now))
            .max_by(|a, b| a.score(now).partial_cmp(&b.score(now)).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_direction_tie_break_is_symmetric_and_exclusive() {
        let a: Mac = [0xAA, 0xBB, 0xCC, 0x00, 0x00, 0x01];
        let b: Mac = [0xAA, 0xBB, 0xCC, 0x00, 0x00, 0x02];
        assert!(should_initiate(&a, &b));
        assert!(!should_initiate(&b, &a));
    }

    #[test]
    fn pool_full_after_eight_discoveries() {
        let mut manager = PeerManager::new();
        for i in 0..MAX_PEERS as u8 {
            manager.discover([0, 0, 0, 0, 0, i]).unwrap();
        }
        assert_eq!(manager.discover([0, 0, 0, 0, 1, 0]), Err(PeerManagerError::PoolFull));
    }

    #[test]
    fn blacklist_backoff_is_monotonic_then_resets_on_success() {
        let mut manager = PeerManager::new();
        let mac = [1, 2, 3, 4, 5, 6];
        manager.discover(mac).unwrap();
        let first = manager.record_failure(&mac).unwrap();
        let second = manager.record_failure(&mac).unwrap();
        assert!(second >= first);
        manager.record_success(&mac).unwrap();
        assert_eq!(manager.by_mac(&mac).unwrap().consecutive_failures, 0);
    }

    #[test]
    fn expired_blacklist_returns_peer_to_discovered() {
        let mut manager = PeerManager::new();
        let mac = [1, 2, 3, 4, 5, 6];
        manager.discover(mac).unwrap();
        manager.record_failure(&mac).unwrap();
        manager.by_mac_mut(&mac).unwrap().blacklisted_until = Some(Instant::now() - Duration::from_secs(1));
        manager.expire_blacklist(Instant::now());
        assert_eq!(manager.by_mac(&mac).unwrap().state, PeerState::Discovered);
    }

    #[test]
    fn handshake_promotes_peer_into_identity_index() {
        let mut manager = PeerManager::new();
        let mac = [1, 2, 3, 4, 5, 6];
        let identity = [9u8; 16];
        manager.discover(mac).unwrap();
        manager.complete_handshake(mac, identity).unwrap();
        assert_eq!(manager.by_identity(&identity).unwrap().mac, mac);
    }

    #[test]
    fn mac_rotation_keeps_same_identity_slot() {
        let mut manager = PeerManager::new();
        let old_mac = [1, 2, 3, 4, 5, 6];
        let new_mac = [1, 2, 3, 4, 5, 7];
        let identity = [9u8; 16];
        manager.discover(old_mac).unwrap();
        manager.complete_handshake(old_mac, identity).unwrap();

        manager.discover(new_mac).unwrap();
        manager.complete_handshake(new_mac, identity).unwrap();

        assert_eq!(manager.by_identity(&identity).unwrap().mac, new_mac);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn remap_mac_keeps_identity_and_state_without_a_handshake() {
        let mut manager = PeerManager::new();
        let old_mac = [1, 2, 3, 4, 5, 6];
        let new_mac = [1, 2, 3, 4, 5, 7];
        let identity = [9u8; 16];
        manager.discover(old_mac).unwrap();
        manager.complete_handshake(old_mac, identity).unwrap();
        manager.set_handle(&old_mac, 42).unwrap();

        manager.discover(new_mac).unwrap();
        manager.remap_mac(&old_mac, new_mac).unwrap();

        assert_eq!(manager.by_identity(&identity).unwrap().mac, new_mac);
        assert_eq!(manager.by_mac(&old_mac), None);
        assert_eq!(manager.by_handle(42).unwrap().mac, new_mac);
        assert_eq!(manager.len(), 1);
    }
}
