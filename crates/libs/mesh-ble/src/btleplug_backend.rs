//! `btleplug`-backed [`BlePlatform`]: the central-role half of the dual-role
//! contract. `btleplug` is GATT-client-only on desktop platforms, so the
//! peripheral/advertising half of [`BlePlatform`] is a logged no-op here —
//! a NimBLE or Bluedroid-backed implementation is what would provide real
//! peripheral support on an embedded target.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use uuid::Uuid;

use crate::peer::Mac;
use crate::platform::{BleError, BleEvent, BleEventSink, BlePlatform};

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fde2_0000_1000_8000_00805f9b34fb);
const RX_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000fde3_0000_1000_8000_00805f9b34fb);
const TX_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000fde4_0000_1000_8000_00805f9b34fb);

pub struct BtleplugPlatform {
    adapter: Adapter,
    peripherals: Mutex<HashMap<Mac, Peripheral>>,
    next_handle: Mutex<u16>,
    handles: Mutex<HashMap<u16, Peripheral>>,
    event_sink: Mutex<Option<Arc<dyn BleEventSink>>>,
}

impl BtleplugPlatform {
    pub async fn first_adapter() -> Result<Self, BleError> {
        let manager = Manager::new().await.map_err(|e| BleError::Scan(e.to_string()))?;
        let adapters = manager.adapters().await.map_err(|e| BleError::Scan(e.to_string()))?;
        let adapter = adapters.into_iter().next().ok_or_else(|| BleError::Scan("no bluetooth adapter present".into()))?;
        Ok(Self {
            adapter,
            peripherals: Mutex::new(HashMap::new()),
            next_handle: Mutex::new(1),
            handles: Mutex::new(HashMap::new()),
            event_sink: Mutex::new(None),
        })
    }

    fn mac_of(peripheral: &Peripheral) -> Mac {
        let mut mac = [0u8; 6];
        let addr = peripheral.address().into_inner();
        mac.copy_from_slice(&addr);
        mac
    }

    fn sink(&self) -> Option<Arc<dyn BleEventSink>> {
        self.event_sink.lock().unwrap().clone()
    }

    /// Spawns the task that forwards TX-characteristic notifications for a
    /// freshly connected peripheral into `push_event`, until the
    /// notification stream ends (the peripheral disconnected).
    fn spawn_notification_forwarder(&self, handle: u16, peripheral: Peripheral) {
        let Some(sink) = self.sink() else { return };
        tokio::spawn(async move {
            let Ok(mut notifications) = peripheral.notifications().await else { return };
            while let Some(notification) = notifications.next().await {
                if notification.uuid == TX_CHARACTERISTIC {
                    sink.push_event(BleEvent::DataReceived { handle, payload: notification.value });
                }
            }
            sink.push_event(BleEvent::Disconnected { handle });
        });
    }
}

#[async_trait]
impl BlePlatform for BtleplugPlatform {
    async fn start_scan(&self) -> Result<(), BleError> {
        self.adapter.start_scan(ScanFilter { services: vec![SERVICE_UUID] }).await.map_err(|e| BleError::Scan(e.to_string()))?;
        let discovered = self.adapter.peripherals().await.map_err(|e| BleError::Scan(e.to_string()))?;
        let sink = self.sink();
        for peripheral in discovered {
            let mac = Self::mac_of(&peripheral);
            let properties = peripheral.properties().await.ok().flatten();
            self.peripherals.lock().unwrap().insert(mac, peripheral);
            if let Some(sink) = &sink {
                let (local_name, rssi) = properties
                    .map(|p| (p.local_name, p.rssi.unwrap_or(-100)))
                    .unwrap_or((None, -100));
                sink.push_event(BleEvent::ScanResult { mac, local_name, rssi });
            }
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.adapter.stop_scan().await.map_err(|e| BleError::Scan(e.to_string()))
    }

    async fn connect(&self, mac: Mac) -> Result<u16, BleError> {
        let peripheral = {
            let peripherals = self.peripherals.lock().unwrap();
            peripherals.get(&mac).cloned().ok_or_else(|| BleError::Connect("unknown peer, scan first".into()))?
        };
        peripheral.connect().await.map_err(|e| BleError::Connect(e.to_string()))?;
        peripheral.discover_services().await.map_err(|e| BleError::Connect(e.to_string()))?;

        let characteristics = peripheral.characteristics();
        if let Some(tx) = characteristics.iter().find(|c| c.uuid == TX_CHARACTERISTIC) {
            peripheral.subscribe(tx).await.map_err(|e| BleError::Connect(e.to_string()))?;
        }

        let handle = {
            let mut next_handle = self.next_handle.lock().unwrap();
            let handle = *next_handle;
            *next_handle += 1;
            handle
        };
        self.handles.lock().unwrap().insert(handle, peripheral.clone());
        self.spawn_notification_forwarder(handle, peripheral);
        Ok(handle)
    }

    async fn disconnect(&self, handle: u16) -> Result<(), BleError> {
        let peripheral = self.handles.lock().unwrap().remove(&handle);
        if let Some(peripheral) = peripheral {
            peripheral.disconnect().await.map_err(|e| BleError::Gatt(e.to_string()))?;
        }
        Ok(())
    }

    async fn write(&self, handle: u16, payload: &[u8]) -> Result<(), BleError> {
        let peripheral = self.handles.lock().unwrap().get(&handle).cloned().ok_or_else(|| BleError::Gatt("unknown handle".into()))?;
        let characteristics = peripheral.characteristics();
        let rx = characteristics
            .iter()
            .find(|c| c.uuid == RX_CHARACTERISTIC)
            .ok_or_else(|| BleError::Gatt("rx characteristic not found".into()))?;
        peripheral.write(rx, payload, WriteType::WithoutResponse).await.map_err(|e| BleError::Gatt(e.to_string()))
    }

    async fn start_advertising(&self, _local_name: &str) -> Result<(), BleError> {
        log::warn!("ble: peripheral advertising is not supported by the desktop btleplug backend");
        Ok(())
    }

    fn set_event_sink(&self, sink: Arc<dyn BleEventSink>) {
        *self.event_sink.lock().unwrap() = Some(sink);
    }
}
