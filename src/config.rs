// src/config.rs v2
//! Configuration management with file-based storage

use crate::{
    error::{RelayError, Result},
    listener::ListenerConfig,
    peer::PeerOptions,
    source::{ConfiguredBackend, ProviderId},
};
use serde::{Deserialize, Serialize};
use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Default TCP port clients connect to
pub const DEFAULT_TCP_PORT: u16 = 4352;

/// Where a location provider gets its data from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    Gpsd { host: String, port: u16 },
    Serial { port: String, baudrate: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub provider: ProviderId,
    pub gps_source: Option<SourceConfig>,
    pub network_source: Option<SourceConfig>,
    pub tcp_enabled: bool,
    pub tcp_bind: IpAddr,
    pub tcp_port: u16,
    pub local_enabled: bool,
    pub local_socket: PathBuf,
    /// Sentences queued per client before it counts as too slow
    pub send_buffer: usize,
    pub close_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::platform_default()
    }
}

impl RelayConfig {
    /// Get platform-specific default configuration
    pub fn platform_default() -> Self {
        Self {
            provider: ProviderId::Gps,
            gps_source: Some(SourceConfig::Gpsd {
                host: "localhost".to_string(),
                port: 2947,
            }),
            network_source: None,
            tcp_enabled: true,
            tcp_bind: IpAddr::from([0, 0, 0, 0]),
            tcp_port: DEFAULT_TCP_PORT,
            local_enabled: cfg!(unix),
            local_socket: std::env::temp_dir().join("nmea-relay.sock"),
            send_buffer: 64,
            close_timeout_ms: 2000,
        }
    }

    /// Load configuration from storage, falling back to defaults when no file exists
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        if !config_path.exists() {
            return Ok(Self::platform_default());
        }

        let contents = std::fs::read_to_string(&config_path)
            .map_err(|e| RelayError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_json(&contents)
    }

    /// Parse a configuration document; missing fields take their defaults
    pub fn from_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents)
            .map_err(|e| RelayError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Save configuration to storage
    pub fn save(&self) -> Result<PathBuf> {
        let config_path = Self::get_config_path()?;

        // Create config directory if it doesn't exist
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RelayError::Config(format!("Failed to create config directory: {}", e)))?;
        }

        let contents = serde_json::to_string_pretty(self)?;

        std::fs::write(&config_path, contents)
            .map_err(|e| RelayError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(config_path)
    }

    /// Get config file path
    pub fn get_config_path() -> Result<PathBuf> {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .map_err(|_| RelayError::Config("HOME environment variable not set".to_string()))?;

        Ok(PathBuf::from(home).join(".config").join("nmea-relay").join("config.json"))
    }

    /// Listeners to start, in display order
    pub fn listener_configs(&self) -> Vec<ListenerConfig> {
        let mut listeners = Vec::new();
        if self.tcp_enabled {
            listeners.push(ListenerConfig::Tcp {
                bind: self.tcp_bind,
                port: self.tcp_port,
            });
        }
        if self.local_enabled {
            listeners.push(ListenerConfig::Local {
                path: self.local_socket.clone(),
            });
        }
        listeners
    }

    pub fn peer_options(&self) -> PeerOptions {
        PeerOptions {
            send_buffer: self.send_buffer.max(1),
            close_timeout: Duration::from_millis(self.close_timeout_ms),
        }
    }

    pub fn backend(&self) -> ConfiguredBackend {
        ConfiguredBackend::new(self.gps_source.clone(), self.network_source.clone())
    }

    /// Update the active provider
    pub fn update_provider(&mut self, provider: ProviderId) {
        self.provider = provider;
    }

    /// Use a gpsd daemon for the given provider
    pub fn update_gpsd(&mut self, provider: ProviderId, host: String, port: u16) {
        self.set_source(provider, SourceConfig::Gpsd { host, port });
    }

    /// Use a serial receiver for the given provider
    pub fn update_serial(&mut self, provider: ProviderId, port: String, baudrate: u32) {
        self.set_source(provider, SourceConfig::Serial { port, baudrate });
    }

    fn set_source(&mut self, provider: ProviderId, source: SourceConfig) {
        match provider {
            ProviderId::Gps => self.gps_source = Some(source),
            ProviderId::Network => self.network_source = Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.provider, ProviderId::Gps);
        assert_eq!(config.tcp_port, 4352);
        assert!(config.tcp_enabled);
        assert!(config.network_source.is_none());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = RelayConfig::from_json(r#"{"tcp_port": 10110, "provider": "network"}"#).unwrap();
        assert_eq!(config.tcp_port, 10110);
        assert_eq!(config.provider, ProviderId::Network);
        assert_eq!(config.send_buffer, 64);
    }

    #[test]
    fn test_source_config_json() {
        let config = RelayConfig::from_json(
            r#"{"network_source": {"type": "serial", "port": "/dev/ttyUSB0", "baudrate": 4800}}"#,
        )
        .unwrap();
        assert_eq!(
            config.network_source,
            Some(SourceConfig::Serial {
                port: "/dev/ttyUSB0".to_string(),
                baudrate: 4800
            })
        );
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        assert!(matches!(
            RelayConfig::from_json("{not json"),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn test_update_serial() {
        let mut config = RelayConfig::default();
        config.update_serial(ProviderId::Network, "/dev/ttyUSB0".to_string(), 115200);
        assert_eq!(
            config.network_source,
            Some(SourceConfig::Serial {
                port: "/dev/ttyUSB0".to_string(),
                baudrate: 115200
            })
        );
        assert!(matches!(config.gps_source, Some(SourceConfig::Gpsd { .. })));
    }

    #[test]
    fn test_listener_configs_follow_toggles() {
        let mut config = RelayConfig::default();
        config.local_enabled = true;
        assert_eq!(config.listener_configs().len(), 2);

        config.tcp_enabled = false;
        let listeners = config.listener_configs();
        assert_eq!(listeners.len(), 1);
        assert!(matches!(listeners[0], ListenerConfig::Local { .. }));

        config.local_enabled = false;
        assert!(config.listener_configs().is_empty());
    }

    #[test]
    fn test_peer_options_never_zero_capacity() {
        let mut config = RelayConfig::default();
        config.send_buffer = 0;
        assert_eq!(config.peer_options().send_buffer, 1);
    }
}
