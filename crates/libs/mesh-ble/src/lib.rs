//! Dual-role (central + peripheral) BLE mesh transport.
//!
//! Composes [`fragment`], [`peer`], and [`gatt_queue`] into the
//! [`mesh_transport::Interface`] contract via [`interface::BleInterface`].
//! The concrete radio stack lives behind [`platform::BlePlatform`].

pub mod fragment;
pub mod gatt_queue;
pub mod interface;
pub mod peer;
pub mod platform;

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
pub mod btleplug_backend;

pub use interface::BleInterface;
pub use platform::{BleError, BleEvent, BleEventSink, BlePlatform};
