use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Settings bundle for one node, loaded from a TOML file at startup.
/// Every recognized option is a field here with the same name, so the
/// CLI (and any future UI) can read and write it directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub wifi_ssid: Option<String>,
    pub wifi_password: Option<String>,
    pub tcp_host: String,
    pub tcp_port: u16,
    pub tcp_enabled: bool,
    pub display_name: String,

    pub lora_enabled: bool,
    pub lora_frequency: f64,
    pub lora_bandwidth: f64,
    pub lora_sf: u8,
    pub lora_cr: u8,
    pub lora_power: i8,

    pub auto_enabled: bool,
    pub ble_enabled: bool,

    pub announce_interval: u64,
    pub sync_interval: u64,
    pub gps_time_sync: bool,

    pub prop_auto_select: bool,
    pub prop_selected_node: Option<String>,
    pub prop_fallback_enabled: bool,
    pub prop_only: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: None,
            wifi_password: None,
            tcp_host: "127.0.0.1".to_string(),
            tcp_port: 4965,
            tcp_enabled: false,
            display_name: "mesh-node".to_string(),

            lora_enabled: false,
            lora_frequency: 927.25,
            lora_bandwidth: 62.5,
            lora_sf: 7,
            lora_cr: 5,
            lora_power: 17,

            auto_enabled: false,
            ble_enabled: false,

            announce_interval: 3600,
            sync_interval: 3600,
            gps_time_sync: false,

            prop_auto_select: true,
            prop_selected_node: None,
            prop_fallback_enabled: true,
            prop_only: false,
        }
    }
}

impl NodeConfig {
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents).map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn lora_config(&self) -> mesh_lora::SX1262Config {
        mesh_lora::SX1262Config {
            frequency_mhz: self.lora_frequency,
            bandwidth_khz: self.lora_bandwidth,
            spreading_factor: self.lora_sf,
            coding_rate: self.lora_cr,
            tx_power_dbm: self.lora_power,
            ..mesh_lora::SX1262Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_node() {
        let config = NodeConfig::default();
        assert_eq!(config.tcp_port, 4965);
        assert!(!config.lora_enabled);
        assert_eq!(config.lora_frequency, 927.25);
        assert!(config.prop_auto_select);
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = NodeConfig::default();
        config.tcp_enabled = true;
        config.display_name = "node-a".to_string();
        let toml = config.to_toml().unwrap();
        let reloaded = NodeConfig::from_toml(&toml).unwrap();
        assert_eq!(config, reloaded);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config = NodeConfig::from_toml("tcp_enabled = true\n").unwrap();
        assert!(config.tcp_enabled);
        assert_eq!(config.tcp_port, NodeConfig::default().tcp_port);
    }
}
