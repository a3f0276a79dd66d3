//! Half-duplex SX1262 LoRa transport.
//!
//! The radio silicon itself is out of scope; [`Radio`] is the seam a real
//! driver implements, and [`LoopbackRadio`] is an in-memory double used by
//! tests. The interface owns RNode-compatible wire framing, shared-bus
//! arbitration with other SPI users (display, SD card), and bitrate/RSSI/SNR
//! reporting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use mesh_transport::{Interface, Packet, TransportCore, TransportError};
use rand_core::{OsRng, RngCore};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum LoraError {
    #[error("radio busy")]
    Busy,
    #[error("spi bus arbitration timed out")]
    BusTimeout,
    #[error("radio configuration rejected: {0}")]
    Configuration(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SX1262Config {
    pub frequency_mhz: f64,
    pub bandwidth_khz: f64,
    pub spreading_factor: u8,
    pub coding_rate: u8,
    pub tx_power_dbm: i8,
    pub sync_word: u8,
    pub preamble_symbols: u16,
}

impl Default for SX1262Config {
    fn default() -> Self {
        Self {
            frequency_mhz: 927.25,
            bandwidth_khz: 62.5,
            spreading_factor: 7,
            coding_rate: 5,
            tx_power_dbm: 17,
            sync_word: 0x12,
            preamble_symbols: 20,
        }
    }
}

impl SX1262Config {
    /// Bits per second implied by the current modulation parameters.
    pub fn bitrate_bps(&self) -> f64 {
        let sf = self.spreading_factor as f64;
        let cr_overhead = 4.0 / self.coding_rate as f64;
        let symbol_rate = (self.bandwidth_khz * 1000.0) / 2f64.powf(sf);
        sf * cr_overhead * symbol_rate
    }
}

/// Seam for the physical radio. A real implementation drives SX1262 SPI
/// registers; [`LoopbackRadio`] satisfies it for host tests.
pub trait Radio: Send + Sync {
    fn configure(&self, config: &SX1262Config) -> Result<(), LoraError>;
    fn transmit(&self, payload: &[u8]) -> Result<(), LoraError>;
    fn start_receive(&self) -> Result<(), LoraError>;
    fn try_receive(&self) -> Option<Vec<u8>>;
    fn rssi(&self) -> Option<i16>;
    fn snr(&self) -> Option<f32>;
    fn is_transmitting(&self) -> bool;
}

/// In-memory radio double: echoes transmitted payloads back as receivable
/// frames so interface-level tests don't need hardware.
#[derive(Default)]
pub struct LoopbackRadio {
    inbox: StdMutex<Vec<Vec<u8>>>,
    transmitting: AtomicBool,
    last_rssi: StdMutex<Option<i16>>,
    last_snr: StdMutex<Option<f32>>,
}

impl LoopbackRadio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject_received(&self, payload: Vec<u8>) {
        self.inbox.lock().unwrap().push(payload);
    }
}

impl Radio for LoopbackRadio {
    fn configure(&self, _config: &SX1262Config) -> Result<(), LoraError> {
        Ok(())
    }

    fn transmit(&self, payload: &[u8]) -> Result<(), LoraError> {
        self.transmitting.store(true, Ordering::Release);
        *self.last_rssi.lock().unwrap() = Some(-42);
        *self.last_snr.lock().unwrap() = Some(9.5);
        self.inbox.lock().unwrap().push(payload.to_vec());
        self.transmitting.store(false, Ordering::Release);
        Ok(())
    }

    fn start_receive(&self) -> Result<(), LoraError> {
        Ok(())
    }

    fn try_receive(&self) -> Option<Vec<u8>> {
        self.inbox.lock().unwrap().pop()
    }

    fn rssi(&self) -> Option<i16> {
        *self.last_rssi.lock().unwrap()
    }

    fn snr(&self) -> Option<f32> {
        *self.last_snr.lock().unwrap()
    }

    fn is_transmitting(&self) -> bool {
        self.transmitting.load(Ordering::Acquire)
    }
}

const TRANSMIT_LOCK_TIMEOUT: Duration = Duration::from_millis(500);
const LOOP_LOCK_TIMEOUT: Duration = Duration::from_millis(5);

pub struct LoraInterface {
    name: String,
    config: SX1262Config,
    radio: Arc<dyn Radio>,
    /// Guards the shared SPI bus; also held by the display/SD-card users in
    /// the full node, so acquisition is always bounded.
    bus: Arc<Mutex<()>>,
    transport: Arc<dyn TransportCore>,
    online: AtomicBool,
}

impl LoraInterface {
    pub fn new(
        name: impl Into<String>,
        config: SX1262Config,
        radio: Arc<dyn Radio>,
        bus: Arc<Mutex<()>>,
        transport: Arc<dyn TransportCore>,
    ) -> Self {
        Self { name: name.into(), config, radio, bus, transport, online: AtomicBool::new(false) }
    }

    pub fn config(&self) -> &SX1262Config {
        &self.config
    }

    fn header_byte() -> u8 {
        (OsRng.next_u32() as u8) & 0xf0
    }
}

#[async_trait]
impl Interface for LoraInterface {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), TransportError> {
        let _guard = self.bus.lock().await;
        self.radio.configure(&self.config).map_err(|_| TransportError::Offline)?;
        self.radio.start_receive().map_err(|_| TransportError::Offline)?;
        self.online.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) {
        self.online.store(false, Ordering::Release);
    }

    async fn tick(&self) -> Result<(), TransportError> {
        let Ok(_guard) = tokio::time::timeout(LOOP_LOCK_TIMEOUT, self.bus.lock()).await else {
            // Bus busy with another user this tick; try again next time.
            return Ok(());
        };
        if let Some(frame) = self.radio.try_receive() {
            if frame.is_empty() {
                return Ok(());
            }
            let payload = &frame[1..];
            let _ = self.transport.process_inbound(payload, &self.name).await;
        }
        Ok(())
    }

    async fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        let guard = tokio::time::timeout(TRANSMIT_LOCK_TIMEOUT, self.bus.lock())
            .await
            .map_err(|_| TransportError::Offline)?;
        let mut frame = Vec::with_capacity(packet.serialize().len() + 1);
        frame.push(Self::header_byte());
        frame.extend_from_slice(packet.serialize());
        let result = self.radio.transmit(&frame).map_err(|_| TransportError::Offline);
        drop(guard);
        let _ = self.radio.start_receive();
        result
    }

    fn online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    fn bitrate(&self) -> Option<u64> {
        Some(self.config.bitrate_bps() as u64)
    }

    fn rssi(&self) -> Option<i16> {
        self.radio.rssi()
    }

    fn snr(&self) -> Option<f32> {
        self.radio.snr()
    }
}
