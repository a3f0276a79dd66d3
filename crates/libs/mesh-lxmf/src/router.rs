//! Owns outbound/inbound queues and the direct-vs-propagation delivery
//! policy. One router per local identity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mesh_transport::{DestinationHash, Packet, TransportCore};
use rand_core::OsRng;
use reticulum::identity::{Identity, PrivateIdentity};

use crate::error::LxmfError;
use crate::message::Message;
use crate::payload::Payload;
use crate::state::MessageState;
use crate::store::MessageStore;
use crate::wire::{decode_envelope, DeliveryProof, InboundEnvelope};

/// Default timeout for a direct-delivery attempt before the router falls
/// back to propagation (if enabled) or gives up.
pub const DEFAULT_DIRECT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(12);

type MessageCallback = Box<dyn Fn(&Message) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    delivery: Vec<MessageCallback>,
    delivered: Vec<MessageCallback>,
}

struct PendingDirect {
    deadline: Instant,
}

pub struct LxmfRouter {
    local_identity: PrivateIdentity,
    local_destination: DestinationHash,
    store: Arc<dyn MessageStore>,
    transport: Arc<dyn TransportCore>,
    outbound_queue: Mutex<Vec<[u8; 32]>>,
    pending_direct: Mutex<HashMap<[u8; 32], PendingDirect>>,
    callbacks: Mutex<Callbacks>,
    propagation_only: Mutex<bool>,
    fallback_to_propagation: Mutex<bool>,
    outbound_propagation_node: Mutex<Option<DestinationHash>>,
    direct_delivery_timeout: Mutex<Duration>,
}

impl LxmfRouter {
    pub fn new(
        local_identity: PrivateIdentity,
        local_destination: DestinationHash,
        store: Arc<dyn MessageStore>,
        transport: Arc<dyn TransportCore>,
    ) -> Self {
        Self {
            local_identity,
            local_destination,
            store,
            transport,
            outbound_queue: Mutex::new(Vec::new()),
            pending_direct: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Callbacks::default()),
            propagation_only: Mutex::new(false),
            fallback_to_propagation: Mutex::new(true),
            outbound_propagation_node: Mutex::new(None),
            direct_delivery_timeout: Mutex::new(DEFAULT_DIRECT_DELIVERY_TIMEOUT),
        }
    }

    pub fn set_propagation_only(&self, enabled: bool) {
        *self.propagation_only.lock().unwrap() = enabled;
    }

    pub fn set_fallback_to_propagation(&self, enabled: bool) {
        *self.fallback_to_propagation.lock().unwrap() = enabled;
    }

    pub fn set_outbound_propagation_node(&self, hash: DestinationHash) {
        *self.outbound_propagation_node.lock().unwrap() = Some(hash);
    }

    pub fn set_direct_delivery_timeout(&self, timeout: Duration) {
        *self.direct_delivery_timeout.lock().unwrap() = timeout;
    }

    pub fn register_delivery_callback(&self, cb: impl Fn(&Message) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().delivery.push(Box::new(cb));
    }

    pub fn register_delivered_callback(&self, cb: impl Fn(&Message) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().delivered.push(Box::new(cb));
    }

    /// Packs, signs, hashes, saves, and enqueues a new outbound message.
    pub fn handle_outbound(&self, destination: DestinationHash, payload: Payload) -> Result<[u8; 32], LxmfError> {
        let mut msg = Message::new_outbound(destination, self.local_destination, payload);
        msg.wire.sign(&self.local_identity)?;
        let hash = msg.hash();
        self.store.save_message(&msg)?;
        self.outbound_queue.lock().unwrap().push(hash);
        Ok(hash)
    }

    /// Emits our delivery destination as a Reticulum announce.
    pub async fn announce(&self) -> Result<(), LxmfError> {
        let app_data = self.local_identity.as_identity().to_hex_string().into_bytes();
        let packet = Packet::new(self.local_destination, app_data);
        self.transport.send(packet).await.map_err(|e| LxmfError::Io(e.to_string()))
    }

    /// Drains the outbound queue, applying the direct/propagation selection
    /// policy to each message in turn.
    pub async fn process_outbound(&self) -> Result<(), LxmfError> {
        let queued: Vec<[u8; 32]> = std::mem::take(&mut *self.outbound_queue.lock().unwrap());
        for hash in queued {
            self.process_one_outbound(hash).await?;
        }
        self.sweep_direct_timeouts().await;
        Ok(())
    }

    async fn process_one_outbound(&self, hash: [u8; 32]) -> Result<(), LxmfError> {
        let msg = self.store.get_message(&hash)?;
        let destination = msg.destination();

        if *self.propagation_only.lock().unwrap() {
            return self.send_via_propagation(hash).await;
        }

        if self.transport.has_path(destination) {
            return self.attempt_direct(hash, msg).await;
        }

        if *self.fallback_to_propagation.lock().unwrap() {
            return self.send_via_propagation(hash).await;
        }

        self.mark_state(hash, MessageState::Failed)
    }

    async fn attempt_direct(&self, hash: [u8; 32], msg: Message) -> Result<(), LxmfError> {
        self.mark_state(hash, MessageState::Sending)?;
        let packet = Packet::new(msg.destination(), msg.wire.pack_envelope()?);
        match self.transport.send(packet).await {
            Ok(()) => {
                self.mark_state(hash, MessageState::Sent)?;
                self.pending_direct
                    .lock()
                    .unwrap()
                    .insert(hash, PendingDirect { deadline: Instant::now() + *self.direct_delivery_timeout.lock().unwrap() });
                Ok(())
            }
            Err(_) => {
                if *self.fallback_to_propagation.lock().unwrap() {
                    self.send_via_propagation(hash).await
                } else {
                    self.mark_state(hash, MessageState::Failed)
                }
            }
        }
    }

    async fn send_via_propagation(&self, hash: [u8; 32]) -> Result<(), LxmfError> {
        let Some(node_hash) = *self.outbound_propagation_node.lock().unwrap() else {
            return self.mark_state(hash, MessageState::Failed);
        };
        let Some(identity_bytes) = self.transport.recall_identity(node_hash) else {
            return self.mark_state(hash, MessageState::Failed);
        };
        if identity_bytes.len() != 64 {
            return self.mark_state(hash, MessageState::Failed);
        }
        let node_identity = Identity::new_from_slices(&identity_bytes[..32], &identity_bytes[32..]);

        self.mark_state(hash, MessageState::Sending)?;
        let msg = self.store.get_message(&hash)?;
        let timestamp = msg.timestamp;
        let envelope = match msg.wire.pack_propagation_with_rng(&node_identity, timestamp, OsRng) {
            Ok(bytes) => bytes,
            Err(_) => return self.mark_state(hash, MessageState::Failed),
        };

        let packet = Packet::new(node_hash, envelope);
        match self.transport.send(packet).await {
            Ok(()) => self.mark_state(hash, MessageState::Propagated),
            Err(_) => self.mark_state(hash, MessageState::Failed),
        }
    }

    /// Confirms direct delivery of `hash`, e.g. on receipt of a proof
    /// packet. No-op if the message is not currently pending direct
    /// delivery.
    pub fn confirm_delivery(&self, hash: [u8; 32]) -> Result<(), LxmfError> {
        self.pending_direct.lock().unwrap().remove(&hash);
        self.mark_state(hash, MessageState::Delivered)?;
        let msg = self.store.get_message(&hash)?;
        for cb in &self.callbacks.lock().unwrap().delivered {
            cb(&msg);
        }
        Ok(())
    }

    /// Re-evaluates any direct-delivery attempt whose timeout has expired,
    /// falling back to propagation rather than leaving it stuck SENDING.
    async fn sweep_direct_timeouts(&self) {
        let now = Instant::now();
        let expired: Vec<[u8; 32]> = {
            let mut pending = self.pending_direct.lock().unwrap();
            let expired = pending.iter().filter(|(_, p)| now >= p.deadline).map(|(h, _)| *h).collect::<Vec<_>>();
            for hash in &expired {
                pending.remove(hash);
            }
            expired
        };
        for hash in expired {
            if *self.fallback_to_propagation.lock().unwrap() {
                let _ = self.send_via_propagation(hash).await;
            } else {
                let _ = self.mark_state(hash, MessageState::Failed);
            }
        }
    }

    /// Demultiplexes a datagram on the `lxmf.delivery` aspect: an ordinary
    /// message is stored and its delivery callbacks fired, after which a
    /// signed [`DeliveryProof`] is returned to the sender; a proof instead
    /// confirms our own pending direct delivery via [`Self::confirm_delivery`].
    /// Returns the stored message's hash, or `None` for a proof.
    pub async fn process_inbound(&self, raw: &[u8]) -> Result<Option<[u8; 32]>, LxmfError> {
        match decode_envelope(raw)? {
            InboundEnvelope::Proof(proof) => {
                self.confirm_delivery(proof.message_hash)?;
                Ok(None)
            }
            InboundEnvelope::Message(wire) => {
                let msg = Message::from_inbound(wire);
                let hash = msg.hash();
                self.store.save_message(&msg)?;
                for cb in &self.callbacks.lock().unwrap().delivery {
                    cb(&msg);
                }
                if msg.destination() == self.local_destination {
                    let proof = DeliveryProof::new(hash, self.local_destination, &self.local_identity);
                    let packet = Packet::new(msg.source(), proof.pack_envelope());
                    let _ = self.transport.send(packet).await;
                }
                Ok(Some(hash))
            }
        }
    }

    fn mark_state(&self, hash: [u8; 32], state: MessageState) -> Result<(), LxmfError> {
        self.store.update_message_state(&hash, state)
    }

    /// Opens a short-lived link to the effective propagation node and pulls
    /// any backlog addressed to us. The actual link handshake belongs to
    /// the transport layer; this issues the sync request and lets inbound
    /// processing (`process_inbound`) handle whatever comes back.
    pub async fn request_messages_from_propagation_node(&self) -> Result<(), LxmfError> {
        let Some(node_hash) = *self.outbound_propagation_node.lock().unwrap() else {
            return Err(LxmfError::NoPath);
        };
        if !self.transport.has_path(node_hash) {
            return Err(LxmfError::NoPath);
        }
        let request = Packet::new(node_hash, self.local_destination.to_vec());
        self.transport.send(request).await.map_err(|e| LxmfError::Io(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileMessageStore;
    use crate::wire::WireMessage;
    use mesh_transport::StubTransport;

    fn router_with_store() -> (LxmfRouter, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn MessageStore> = Arc::new(FileMessageStore::open(dir.path()).unwrap());
        let transport: Arc<dyn TransportCore> = Arc::new(StubTransport::new());
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let router = LxmfRouter::new(identity, [1; 16], store, transport);
        (router, dir)
    }

    #[tokio::test]
    async fn outbound_fails_with_no_path_and_fallback_disabled() {
        let (router, _dir) = router_with_store();
        router.set_fallback_to_propagation(false);
        let payload = Payload::new(0.0, b"hi".to_vec(), Vec::new(), None);
        let hash = router.handle_outbound([2; 16], payload).unwrap();
        router.process_outbound().await.unwrap();
        let meta = router.store.get_meta(&hash).unwrap();
        assert_eq!(meta.state, MessageState::Failed);
    }

    #[tokio::test]
    async fn direct_delivery_succeeds_when_path_and_interface_online() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn MessageStore> = Arc::new(FileMessageStore::open(dir.path()).unwrap());
        let transport = Arc::new(StubTransport::new());
        transport.set_path([2; 16], vec![0; 64]);

        struct OnlineIface;
        #[async_trait::async_trait]
        impl mesh_transport::Interface for OnlineIface {
            fn name(&self) -> &str {
                "t"
            }
            async fn start(&self) -> Result<(), mesh_transport::TransportError> {
                Ok(())
            }
            async fn stop(&self) {}
            async fn tick(&self) -> Result<(), mesh_transport::TransportError> {
                Ok(())
            }
            async fn send(&self, _p: &Packet) -> Result<(), mesh_transport::TransportError> {
                Ok(())
            }
            fn online(&self) -> bool {
                true
            }
        }
        transport.register_interface(Arc::new(OnlineIface)).await;

        let identity = PrivateIdentity::new_from_rand(OsRng);
        let router = LxmfRouter::new(identity, [1; 16], store, transport);
        let payload = Payload::new(0.0, b"hi".to_vec(), Vec::new(), None);
        let hash = router.handle_outbound([2; 16], payload).unwrap();
        router.process_outbound().await.unwrap();
        let meta = router.store.get_meta(&hash).unwrap();
        assert_eq!(meta.state, MessageState::Sent);
    }

    #[tokio::test]
    async fn propagation_only_never_attempts_direct_even_with_a_path() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn MessageStore> = Arc::new(FileMessageStore::open(dir.path()).unwrap());
        let transport = Arc::new(StubTransport::new());
        transport.set_path([2; 16], vec![0; 64]);

        let identity = PrivateIdentity::new_from_rand(OsRng);
        let router = LxmfRouter::new(identity, [1; 16], store, transport);
        router.set_propagation_only(true);
        let payload = Payload::new(0.0, b"hi".to_vec(), Vec::new(), None);
        let hash = router.handle_outbound([2; 16], payload).unwrap();
        router.process_outbound().await.unwrap();
        // No propagation node configured, so the message must fail rather
        // than silently attempt direct delivery.
        let meta = router.store.get_meta(&hash).unwrap();
        assert_eq!(meta.state, MessageState::Failed);
    }

    #[tokio::test]
    async fn inbound_message_round_trips_and_fires_delivery_callback() {
        let (router, _dir) = router_with_store();
        let seen = Arc::new(Mutex::new(false));
        let seen_clone = seen.clone();
        router.register_delivery_callback(move |_msg| {
            *seen_clone.lock().unwrap() = true;
        });

        let payload = Payload::new(0.0, b"inbound".to_vec(), Vec::new(), None);
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let mut wire = WireMessage::new([1; 16], [3; 16], payload);
        wire.sign(&identity).unwrap();
        let raw = wire.pack_envelope().unwrap();

        router.process_inbound(&raw).await.unwrap();
        assert!(*seen.lock().unwrap());
    }

    #[tokio::test]
    async fn inbound_proof_confirms_pending_direct_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn MessageStore> = Arc::new(FileMessageStore::open(dir.path()).unwrap());
        let transport = Arc::new(StubTransport::new());
        transport.set_path([2; 16], vec![0; 64]);

        struct OnlineIface;
        #[async_trait::async_trait]
        impl mesh_transport::Interface for OnlineIface {
            fn name(&self) -> &str {
                "t"
            }
            async fn start(&self) -> Result<(), mesh_transport::TransportError> {
                Ok(())
            }
            async fn stop(&self) {}
            async fn tick(&self) -> Result<(), mesh_transport::TransportError> {
                Ok(())
            }
            async fn send(&self, _p: &Packet) -> Result<(), mesh_transport::TransportError> {
                Ok(())
            }
            fn online(&self) -> bool {
                true
            }
        }
        transport.register_interface(Arc::new(OnlineIface)).await;

        let identity = PrivateIdentity::new_from_rand(OsRng);
        let router = LxmfRouter::new(identity.clone(), [1; 16], store, transport);
        let delivered = Arc::new(Mutex::new(false));
        let delivered_clone = delivered.clone();
        router.register_delivered_callback(move |_msg| {
            *delivered_clone.lock().unwrap() = true;
        });

        let payload = Payload::new(0.0, b"hi".to_vec(), Vec::new(), None);
        let hash = router.handle_outbound([2; 16], payload).unwrap();
        router.process_outbound().await.unwrap();
        let meta = router.store.get_meta(&hash).unwrap();
        assert_eq!(meta.state, MessageState::Sent);

        let proof = DeliveryProof::new(hash, [2; 16], &identity);
        router.process_inbound(&proof.pack_envelope()).await.unwrap();

        let meta = router.store.get_meta(&hash).unwrap();
        assert_eq!(meta.state, MessageState::Delivered);
        assert!(*delivered.lock().unwrap());
    }
}
