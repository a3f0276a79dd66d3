//! Reconnecting, HDLC-framed TCP client interface.
//!
//! Mirrors the serial interface's connect/backoff/framing shape but targets
//! a TCP bridge server instead of a local device, with the socket tuning and
//! low-memory reconnect gate the bridge-link node expects.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mesh_transport::{Interface, Packet, TransportCore, TransportError};
use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum TcpIfaceError {
    #[error("connect to {0} timed out")]
    ConnectTimeout(SocketAddr),
    #[error("socket tuning failed: {0}")]
    SocketTune(#[from] std::io::Error),
}

/// Lets the host report available memory so the reconnect loop can skip an
/// attempt under memory pressure. Always-ok on a hosted target.
pub trait MemoryBudget: Send + Sync {
    fn largest_free_allocation(&self) -> usize;
}

pub struct AlwaysOk;
impl MemoryBudget for AlwaysOk {
    fn largest_free_allocation(&self) -> usize {
        usize::MAX
    }
}

const LOW_MEMORY_THRESHOLD: usize = 20 * 1024;

fn bounded_backoff_next(current: Duration, max: Duration) -> Duration {
    let current_ms = current.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    Duration::from_millis(current_ms.saturating_mul(2).min(max_ms))
}

fn tune_socket(stream: &TcpStream) -> std::io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(5))
        .with_interval(Duration::from_secs(2));
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let keepalive = keepalive.with_retries(12);
    sock.set_tcp_keepalive(&keepalive)?;
    #[cfg(target_os = "linux")]
    sock.set_tcp_user_timeout(Some(Duration::from_secs(24)))?;
    Ok(())
}

pub struct TcpClientInterface {
    name: String,
    host: String,
    port: u16,
    mtu: usize,
    connect_timeout: Duration,
    reconnect_backoff: Duration,
    max_reconnect_backoff: Duration,
    memory_budget: Arc<dyn MemoryBudget>,
    transport: Arc<dyn TransportCore>,
    online: Arc<AtomicBool>,
    reconnected: Arc<AtomicBool>,
    cancel: CancellationToken,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpClientInterface {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16, transport: Arc<dyn TransportCore>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        Self {
            name: name.into(),
            host: host.into(),
            port,
            mtu: 2048,
            connect_timeout: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(5),
            max_reconnect_backoff: Duration::from_secs(5),
            memory_budget: Arc::new(AlwaysOk),
            transport,
            online: Arc::new(AtomicBool::new(false)),
            reconnected: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            task: Mutex::new(None),
        }
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu.max(256);
        self
    }

    pub fn with_memory_budget(mut self, budget: Arc<dyn MemoryBudget>) -> Self {
        self.memory_budget = budget;
        self
    }

    /// Returns whether the link has reconnected since the last call, clearing
    /// the edge so the application can re-announce exactly once per event.
    pub fn check_reconnected(&self) -> bool {
        self.reconnected.swap(false, Ordering::AcqRel)
    }
}

#[async_trait]
impl Interface for TcpClientInterface {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), TransportError> {
        let Some(outbound_rx) = self.outbound_rx.lock().await.take() else {
            return Ok(());
        };
        let host = self.host.clone();
        let port = self.port;
        let mtu = self.mtu;
        let connect_timeout = self.connect_timeout;
        let reconnect_backoff = self.reconnect_backoff;
        let max_reconnect_backoff = self.max_reconnect_backoff;
        let memory_budget = self.memory_budget.clone();
        let transport = self.transport.clone();
        let online = self.online.clone();
        let reconnected = self.reconnected.clone();
        let cancel = self.cancel.clone();
        let iface_name = self.name.clone();

        let handle = tokio::spawn(async move {
            run_reconnect_loop(
                iface_name,
                host,
                port,
                mtu,
                connect_timeout,
                reconnect_backoff,
                max_reconnect_backoff,
                memory_budget,
                transport,
                online,
                reconnected,
                cancel,
                outbound_rx,
            )
            .await;
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
        self.online.store(false, Ordering::Release);
    }

    async fn tick(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        let framed = mesh_hdlc::frame(packet.serialize());
        self.outbound_tx.send(framed).await.map_err(|_| TransportError::Offline)
    }

    fn online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_reconnect_loop(
    iface_name: String,
    host: String,
    port: u16,
    mtu: usize,
    connect_timeout: Duration,
    reconnect_backoff: Duration,
    max_reconnect_backoff: Duration,
    memory_budget: Arc<dyn MemoryBudget>,
    transport: Arc<dyn TransportCore>,
    online: Arc<AtomicBool>,
    reconnected: Arc<AtomicBool>,
    cancel: CancellationToken,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
) {
    let mut backoff = reconnect_backoff;
    let mut ever_connected = false;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        if memory_budget.largest_free_allocation() < LOW_MEMORY_THRESHOLD {
            log::warn!("tcp: iface={iface_name} skipping reconnect attempt, low memory");
            tokio::time::sleep(reconnect_backoff).await;
            continue;
        }

        let addr = format!("{host}:{port}");
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                log::warn!("tcp: iface={iface_name} connect to {addr} failed err={err}");
                tokio::time::sleep(backoff).await;
                backoff = bounded_backoff_next(backoff, max_reconnect_backoff);
                continue;
            }
            Err(_) => {
                log::warn!("tcp: iface={iface_name} connect to {addr} timed out");
                tokio::time::sleep(backoff).await;
                backoff = bounded_backoff_next(backoff, max_reconnect_backoff);
                continue;
            }
        };

        if let Err(err) = tune_socket(&stream) {
            log::warn!("tcp: iface={iface_name} socket tuning failed err={err}");
        }

        log::info!("tcp: iface={iface_name} connected to {addr}");
        online.store(true, Ordering::Release);
        if ever_connected {
            reconnected.store(true, Ordering::Release);
        }
        ever_connected = true;
        backoff = reconnect_backoff;

        run_stream(&iface_name, stream, mtu, &transport, &cancel, &mut outbound_rx).await;

        online.store(false, Ordering::Release);
        if cancel.is_cancelled() {
            break;
        }
        tokio::time::sleep(backoff).await;
        backoff = bounded_backoff_next(backoff, max_reconnect_backoff);
    }
}

async fn run_stream(
    iface_name: &str,
    stream: TcpStream,
    mtu: usize,
    transport: &Arc<dyn TransportCore>,
    cancel: &CancellationToken,
    outbound_rx: &mut mpsc::Receiver<Vec<u8>>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut frame_buffer = Vec::with_capacity(mtu * 4);
    let mut read_buffer = vec![0u8; mtu.max(256)];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = read_half.read(&mut read_buffer[..]) => {
                match result {
                    Ok(0) => {
                        log::warn!("tcp: iface={iface_name} EOF from peer");
                        break;
                    }
                    Ok(n) => {
                        frame_buffer.extend_from_slice(&read_buffer[..n]);
                        for payload in mesh_hdlc::extract_frames(&mut frame_buffer, 16) {
                            if let Err(err) = transport.process_inbound(&payload, iface_name).await {
                                log::debug!("tcp: iface={iface_name} dropped malformed packet: {err}");
                            }
                        }
                        if frame_buffer.len() > mtu * 64 {
                            frame_buffer.clear();
                        }
                    }
                    Err(err) => {
                        log::warn!("tcp: iface={iface_name} read error err={err}");
                        break;
                    }
                }
            }
            outbound = outbound_rx.recv() => {
                let Some(framed) = outbound else { break; };
                if let Err(err) = write_half.write_all(&framed).await {
                    log::warn!("tcp: iface={iface_name} write error err={err}");
                    break;
                }
            }
        }
    }
}
