//! Wires the settings bundle, identity, transport core, enabled interfaces,
//! LXMF router, and propagation manager together and drives the single
//! cooperative main loop.

pub mod config;
pub mod identity_store;

use std::sync::Arc;
use std::time::Duration;

use mesh_lxmf::{FileMessageStore, LxmfRouter, MessageStore, PropagationManager};
use mesh_transport::{DestinationHash, StubTransport, TransportCore};
use reticulum::identity::PrivateIdentity;

pub use config::NodeConfig;

#[derive(Debug, thiserror::Error)]
pub enum MeshdError {
    #[error("message store: {0}")]
    Store(#[from] mesh_lxmf::LxmfError),
    #[error("interface bind: {0}")]
    Io(#[from] std::io::Error),
}

/// Main-loop tick interval; no component may block the loop longer than a
/// few tens of milliseconds, so interface maintenance runs every tick
/// rather than on its own timers.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

fn local_destination(identity: &PrivateIdentity) -> DestinationHash {
    let bytes = identity.address_hash().as_slice();
    let mut out = [0u8; 16];
    out.copy_from_slice(&bytes[..16]);
    out
}

pub struct MeshNode {
    pub config: NodeConfig,
    pub identity: PrivateIdentity,
    pub transport: Arc<dyn TransportCore>,
    pub router: Arc<LxmfRouter>,
    pub propagation: Arc<PropagationManager>,
    interfaces: Vec<Arc<dyn mesh_transport::Interface>>,
}

impl MeshNode {
    /// Builds every interface enabled in `config` and registers it with a
    /// fresh transport core. The transport itself is the in-memory double
    /// from `mesh_transport`: binding the orchestrator to a live Reticulum
    /// `Transport` belongs to that crate, not here.
    pub async fn new(config: NodeConfig, identity: PrivateIdentity, store_root: impl AsRef<std::path::Path>) -> Result<Self, MeshdError> {
        let destination = local_destination(&identity);
        let transport: Arc<dyn TransportCore> = Arc::new(StubTransport::new());
        let store: Arc<dyn MessageStore> = Arc::new(FileMessageStore::open(store_root)?);
        let router = Arc::new(LxmfRouter::new(identity.clone(), destination, store, transport.clone()));
        let propagation = Arc::new(PropagationManager::new());
        transport.register_announce_handler(propagation.clone());

        router.register_delivery_callback(|msg| {
            println!("meshd: received message {} from {}", hex::encode(msg.hash()), hex::encode(msg.source()));
        });
        router.register_delivered_callback(|msg| {
            println!("meshd: message {} reached {}", hex::encode(msg.hash()), hex::encode(msg.destination()));
        });

        let mut interfaces: Vec<Arc<dyn mesh_transport::Interface>> = Vec::new();

        if config.tcp_enabled {
            let iface = Arc::new(mesh_tcp::TcpClientInterface::new("tcp0", config.tcp_host.clone(), config.tcp_port, transport.clone()));
            interfaces.push(iface);
        }

        if config.lora_enabled {
            let radio: Arc<dyn mesh_lora::Radio> = Arc::new(mesh_lora::LoopbackRadio::default());
            let bus = Arc::new(tokio::sync::Mutex::new(()));
            let iface = Arc::new(mesh_lora::LoraInterface::new("lora0", config.lora_config(), radio, bus, transport.clone()));
            interfaces.push(iface);
        }

        if config.auto_enabled {
            match build_auto_interface(&transport).await {
                Ok(iface) => interfaces.push(iface),
                Err(err) => log::warn!("meshd: auto interface disabled, bind failed: {err}"),
            }
        }

        if config.ble_enabled {
            match build_ble_interface(&identity, &transport).await {
                Ok(iface) => interfaces.push(iface),
                Err(err) => log::warn!("meshd: ble interface disabled: {err}"),
            }
        }

        router.set_fallback_to_propagation(config.prop_fallback_enabled);
        router.set_propagation_only(config.prop_only);
        if let Some(pinned) = &config.prop_selected_node {
            if let Ok(bytes) = hex::decode(pinned) {
                if bytes.len() == 16 {
                    let mut hash = [0u8; 16];
                    hash.copy_from_slice(&bytes);
                    propagation.pin(hash);
                }
            }
        }

        for iface in &interfaces {
            transport.register_interface(iface.clone()).await;
            if let Err(err) = iface.start().await {
                log::warn!("meshd: interface {} failed to start: {err}", iface.name());
            }
        }

        Ok(Self { config, identity, transport, router, propagation, interfaces })
    }

    /// One iteration of the cooperative main loop: tick every interface,
    /// then drain the router's outbound/inbound queues, matching the
    /// fixed ordering the reference node's scheduler uses.
    pub async fn tick(&self) {
        for iface in &self.interfaces {
            if let Err(err) = iface.tick().await {
                log::debug!("meshd: interface {} tick error: {err}", iface.name());
            }
        }
        if let Err(err) = self.router.process_outbound().await {
            log::warn!("meshd: outbound processing error: {err}");
        }
        self.propagation.tick();
        if let Some(effective) = self.propagation.get_effective_node() {
            self.router.set_outbound_propagation_node(effective);
        }
    }

    /// Runs the main loop forever at [`TICK_INTERVAL`], warning when one
    /// iteration overruns the deadline.
    pub async fn run(&self) -> ! {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let started = tokio::time::Instant::now();
            self.tick().await;
            let elapsed = started.elapsed();
            if elapsed > TICK_INTERVAL {
                log::warn!("meshd: tick took {elapsed:?}, exceeding the {TICK_INTERVAL:?} budget");
            }
        }
    }

    pub async fn shutdown(&self) {
        for iface in &self.interfaces {
            iface.stop().await;
        }
    }
}

async fn build_auto_interface(transport: &Arc<dyn TransportCore>) -> std::io::Result<Arc<dyn mesh_transport::Interface>> {
    use std::net::Ipv6Addr;
    let socket = mesh_auto::net::TokioDiscoverySocket::bind(
        "ff02::4242:4242".parse::<Ipv6Addr>().unwrap(),
        Ipv6Addr::UNSPECIFIED,
        0,
    )
    .await?;
    let iface = Arc::new(mesh_auto::AutoInterface::new("auto0", "mesh-node", Arc::new(socket), transport.clone()));
    let cancel = tokio_util::sync::CancellationToken::new();
    tokio::spawn(mesh_auto::run_periodic_jobs(iface.clone(), cancel));
    Ok(iface)
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
async fn build_ble_interface(
    identity: &PrivateIdentity,
    transport: &Arc<dyn TransportCore>,
) -> Result<Arc<dyn mesh_transport::Interface>, mesh_ble::BleError> {
    let platform = Arc::new(mesh_ble::btleplug_backend::BtleplugPlatform::first_adapter().await?);
    let local_identity: [u8; 16] = local_destination(identity);
    // btleplug is a central-role API; it does not expose the adapter's own
    // controller MAC, so the local peripheral address is synthesized from
    // the identity hash, matching the `TD-XXXXXX` advertised-name scheme.
    let mut local_mac = [0u8; 6];
    local_mac.copy_from_slice(&local_identity[10..16]);
    let iface = Arc::new(mesh_ble::BleInterface::new("ble0", local_identity, local_mac, platform, transport.clone()));
    iface.attach_event_sink();
    Ok(iface)
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
async fn build_ble_interface(
    _identity: &PrivateIdentity,
    _transport: &Arc<dyn TransportCore>,
) -> Result<Arc<dyn mesh_transport::Interface>, mesh_ble::BleError> {
    Err(mesh_ble::BleError::Advertise("no BLE backend for this target".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[tokio::test]
    async fn builds_with_every_interface_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::default();
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let node = MeshNode::new(config, identity, dir.path()).await.unwrap();
        assert!(node.interfaces.is_empty());
        node.tick().await;
    }

    #[tokio::test]
    async fn tcp_enabled_registers_one_interface() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::default();
        config.tcp_enabled = true;
        config.tcp_port = 1;
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let node = MeshNode::new(config, identity, dir.path()).await.unwrap();
        assert_eq!(node.interfaces.len(), 1);
    }
}
