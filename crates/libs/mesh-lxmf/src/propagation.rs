//! Tracks propagation nodes seen via `lxmf.propagation` announces and picks
//! the best one to route through when we have no direct path.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use mesh_transport::{Announce, AnnounceHandler, DestinationHash};
use serde::{Deserialize, Serialize};

use crate::error::LxmfError;

const PROPAGATION_ASPECT: &str = "lxmf.propagation";

/// A node not heard from in this long is scored as if it had never
/// announced, so a stale entry never outranks a live one.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq)]
pub struct PropagationNode {
    pub hash: DestinationHash,
    pub name: Option<String>,
    pub hops: u8,
    pub enabled: bool,
    pub score: f32,
    last_seen: Instant,
}

impl PropagationNode {
    fn recompute_score(&mut self, now: Instant) {
        let hop_penalty = self.hops as f32 * 0.1;
        let age = now.saturating_duration_since(self.last_seen);
        let liveness = if age > LIVENESS_TIMEOUT { 0.0 } else { 1.0 - (age.as_secs_f32() / LIVENESS_TIMEOUT.as_secs_f32()) * 0.5 };
        self.score = ((1.0 - hop_penalty) * liveness).max(0.0);
    }
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<DestinationHash, PropagationNode>,
    pinned: Option<DestinationHash>,
}

pub struct PropagationManager {
    state: RwLock<State>,
}

impl Default for PropagationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PropagationManager {
    pub fn new() -> Self {
        Self { state: RwLock::new(State::default()) }
    }

    pub fn observe_announce(&self, hash: DestinationHash, name: Option<String>, hops: u8) {
        let now = Instant::now();
        let mut state = self.state.write().unwrap();
        let node = state.nodes.entry(hash).or_insert_with(|| PropagationNode {
            hash,
            name: None,
            hops,
            enabled: true,
            score: 0.0,
            last_seen: now,
        });
        node.name = name.or_else(|| node.name.clone());
        node.hops = hops;
        node.last_seen = now;
        node.recompute_score(now);
    }

    /// Re-scores every known node against current liveness. Intended to be
    /// called once per orchestrator tick so a node that stops announcing
    /// gradually loses ranking instead of only dropping out on the next
    /// announce it happens to send.
    pub fn tick(&self) {
        let now = Instant::now();
        let mut state = self.state.write().unwrap();
        for node in state.nodes.values_mut() {
            node.recompute_score(now);
        }
    }

    pub fn nodes(&self) -> Vec<PropagationNode> {
        self.state.read().unwrap().nodes.values().cloned().collect()
    }

    pub fn set_enabled(&self, hash: &DestinationHash, enabled: bool) {
        if let Some(node) = self.state.write().unwrap().nodes.get_mut(hash) {
            node.enabled = enabled;
        }
    }

    /// Manually pins a node, disabling auto-selection. Scores still update.
    pub fn pin(&self, hash: DestinationHash) {
        self.state.write().unwrap().pinned = Some(hash);
    }

    pub fn unpin(&self) {
        self.state.write().unwrap().pinned = None;
    }

    pub fn pinned(&self) -> Option<DestinationHash> {
        self.state.read().unwrap().pinned
    }

    /// The node the router should use: the pin if set and still known,
    /// otherwise the enabled node with the highest score.
    pub fn get_effective_node(&self) -> Option<DestinationHash> {
        let state = self.state.read().unwrap();
        if let Some(pinned) = state.pinned {
            if state.nodes.contains_key(&pinned) {
                return Some(pinned);
            }
        }
        state
            .nodes
            .values()
            .filter(|n| n.enabled)
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
            .map(|n| n.hash)
    }

    pub fn save_pin(&self, path: impl AsRef<Path>) -> Result<(), LxmfError> {
        #[derive(Serialize)]
        struct Pinned {
            pinned: Option<String>,
        }
        let pinned = self.pinned().map(hex::encode);
        let toml = toml::to_string(&Pinned { pinned }).map_err(|e| LxmfError::Encode(e.to_string()))?;
        std::fs::write(path, toml).map_err(|e| LxmfError::Io(e.to_string()))
    }

    pub fn load_pin(&self, path: impl AsRef<Path>) -> Result<(), LxmfError> {
        #[derive(Deserialize)]
        struct Pinned {
            pinned: Option<String>,
        }
        let path = path.as_ref();
        if !path.exists() {
            return Ok(());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| LxmfError::Io(e.to_string()))?;
        let parsed: Pinned = toml::from_str(&contents).map_err(|e| LxmfError::Decode(e.to_string()))?;
        if let Some(hex_hash) = parsed.pinned {
            let bytes = hex::decode(&hex_hash).map_err(|e| LxmfError::Decode(e.to_string()))?;
            if bytes.len() != 16 {
                return Err(LxmfError::Decode("pinned node hash must be 16 bytes".into()));
            }
            let mut hash = [0u8; 16];
            hash.copy_from_slice(&bytes);
            self.pin(hash);
        }
        Ok(())
    }
}

impl AnnounceHandler for PropagationManager {
    fn aspects(&self) -> &[&'static str] {
        &[PROPAGATION_ASPECT]
    }

    fn received(&self, announce: &Announce) {
        let name = std::str::from_utf8(&announce.app_data).ok().map(str::to_owned);
        self.observe_announce(announce.destination, name, announce.hops);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_node_favors_fewer_hops() {
        let manager = PropagationManager::new();
        manager.observe_announce([1; 16], None, 3);
        manager.observe_announce([2; 16], None, 1);
        assert_eq!(manager.get_effective_node(), Some([2; 16]));
    }

    #[test]
    fn disabled_node_is_never_selected() {
        let manager = PropagationManager::new();
        manager.observe_announce([1; 16], None, 0);
        manager.set_enabled(&[1; 16], false);
        assert_eq!(manager.get_effective_node(), None);
    }

    #[test]
    fn pin_overrides_scoring() {
        let manager = PropagationManager::new();
        manager.observe_announce([1; 16], None, 0);
        manager.observe_announce([2; 16], None, 5);
        manager.pin([2; 16]);
        assert_eq!(manager.get_effective_node(), Some([2; 16]));
    }

    #[test]
    fn pin_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("propagation.toml");
        let manager = PropagationManager::new();
        manager.pin([9; 16]);
        manager.save_pin(&path).unwrap();

        let reloaded = PropagationManager::new();
        reloaded.load_pin(&path).unwrap();
        assert_eq!(reloaded.pinned(), Some([9; 16]));
    }

    #[test]
    fn tick_does_not_crash_on_an_empty_table() {
        let manager = PropagationManager::new();
        manager.tick();
        assert!(manager.nodes().is_empty());
    }

    #[test]
    fn freshly_observed_node_keeps_a_near_full_score() {
        let manager = PropagationManager::new();
        manager.observe_announce([1; 16], None, 0);
        manager.tick();
        let node = manager.nodes().into_iter().next().unwrap();
        assert!(node.score > 0.9);
    }
}
