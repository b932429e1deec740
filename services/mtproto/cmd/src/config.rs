//! Configuration handling for the MTProto client.
//!
//! This module reads the `mtproto` section of a YAML config file and applies
//! environment variable overrides on top of it.

use anyhow::{Context, Result};
use mtproto_crypto::{RsaKeyRing, RsaPublicKey};
use mtproto_session::{ConnectionConfig, DcId, DcOption, StaticDcTable, TransportKind};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Trusted server key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsaKeyConfig {
    /// Modulus, big-endian hex
    pub modulus: String,
    /// Public exponent
    #[serde(default = "default_exponent")]
    pub exponent: u64,
}

fn default_exponent() -> u64 {
    65537
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Datacenter to connect to; 0 for the main one
    pub dc: DcId,
    /// Datacenter used when `dc` is 0
    pub main_dc: DcId,
    /// Transport to use
    pub transport: TransportKind,
    /// Whether to race IPv6 endpoints against IPv4
    pub try_ipv6: bool,
    /// Datacenter addresses; the production table when empty
    pub dc_options: Vec<DcOption>,
    /// Keys the server may prove itself with
    pub rsa_keys: Vec<RsaKeyConfig>,
    /// Seconds between pings
    pub ping_interval: u64,
    /// Seconds to wait for a connect before retrying
    pub connect_timeout: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let defaults = ConnectionConfig::default();
        Self {
            dc: 0,
            main_dc: 2,
            transport: TransportKind::Auto,
            try_ipv6: false,
            dc_options: Vec::new(),
            rsa_keys: Vec::new(),
            ping_interval: defaults.ping_interval.as_secs(),
            connect_timeout: defaults.connect_timeout.as_secs(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    mtproto: Option<ClientConfig>,
}

impl ClientConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                root.mtproto.unwrap_or_default()
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();

        info!(
            "Final client configuration: dc={}, transport={}, try_ipv6={}, {} dc options, {} rsa keys",
            config.dc,
            config.transport,
            config.try_ipv6,
            config.dc_options.len(),
            config.rsa_keys.len()
        );
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        if let Ok(dc) = std::env::var("MTPROTO_DC") {
            match dc.parse::<DcId>() {
                Ok(dc) => {
                    self.dc = dc;
                    info!("DC overridden by environment: {}", dc);
                }
                Err(_) => warn!("Ignoring invalid MTPROTO_DC '{}'", dc),
            }
        }

        if let Ok(transport) = std::env::var("MTPROTO_TRANSPORT") {
            match transport.parse::<TransportKind>() {
                Ok(kind) => {
                    self.transport = kind;
                    info!("Transport overridden by environment: {}", kind);
                }
                Err(e) => warn!("Ignoring MTPROTO_TRANSPORT: {}", e),
            }
        }

        if let Ok(try_ipv6) = std::env::var("MTPROTO_TRY_IPV6") {
            self.try_ipv6 = matches!(try_ipv6.to_lowercase().as_str(), "1" | "true" | "yes");
            info!("IPv6 overridden by environment: {}", self.try_ipv6);
        }
    }

    /// Trusted keys as a key ring
    pub fn key_ring(&self) -> Result<RsaKeyRing> {
        let keys = self
            .rsa_keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                RsaPublicKey::from_hex(&key.modulus, key.exponent)
                    .with_context(|| format!("invalid rsa key #{}", i))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(RsaKeyRing::new(keys))
    }

    /// Settings for the connection worker
    pub fn connection_config(&self) -> Result<ConnectionConfig> {
        Ok(ConnectionConfig {
            transport: self.transport,
            try_ipv6: self.try_ipv6,
            rsa_keys: self.key_ring()?,
            ping_interval: Duration::from_secs(self.ping_interval.max(1)),
            connect_timeout: Duration::from_secs(self.connect_timeout.max(1)),
            ..ConnectionConfig::default()
        })
    }

    /// Datacenter table to resolve endpoints from
    pub fn dc_table(&self) -> StaticDcTable {
        if self.dc_options.is_empty() {
            StaticDcTable::production()
        } else {
            StaticDcTable::new(self.main_dc, self.dc_options.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtproto_session::DcLookup;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.dc, 0);
        assert_eq!(config.transport, TransportKind::Auto);
        assert_eq!(config.ping_interval, 30);
        assert_eq!(config.dc_table().main_dc(), 2);
        assert!(config.key_ring().unwrap().is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
mtproto:
  dc: 4
  main_dc: 4
  transport: http
  ping_interval: 15
  dc_options:
    - id: 4
      address: 10.0.0.4
      port: 8443
  rsa_keys:
    - modulus: "c150023e2f70db7985ded064759cfecf0af328e69a41daf4d6f01b538135a6f91f8f8b2a0ec9ba9720ce352efcf6c5680ffc424bd634864902de0b4bd6d49f4e580230e3ae97d95c8b19442b3c0a10d8f5633fecedd6926a7f6dab0ddb7d457f9ea81b8465fcd6fffeed114011df91c059caedaf97625f6c96ecc74725556934ef781d866b34f011fce4d835a090196e9a5f0e4449af7eb697ddb9076494ca5f81104a305b6dd27665722c46b60e5df680fb16b210607ef217652e60236c255f6a28315f4083a96791d7214bf64c1df4fd0db1944fb26a2a57031b32eee64ad15a8ba68885cde74a5bfc920f6abf59ba5c75506373e7130f9042da922179251f"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = ClientConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.dc, 4);
        assert_eq!(config.transport, TransportKind::Http);
        assert_eq!(config.rsa_keys[0].exponent, 65537);
        assert!(!config.try_ipv6);

        let connection = config.connection_config().unwrap();
        assert_eq!(connection.rsa_keys.len(), 1);
        assert_eq!(connection.ping_interval, Duration::from_secs(15));

        let table = config.dc_table();
        assert_eq!(table.main_dc(), 4);
        let endpoints = table.lookup(4, false).unwrap();
        assert_eq!(endpoints.tcp.socket_addr(), "10.0.0.4:8443");
        assert_eq!(endpoints.http.unwrap().port, 80);
    }

    #[test]
    fn test_invalid_key_is_rejected() {
        let config = ClientConfig {
            rsa_keys: vec![RsaKeyConfig {
                modulus: "not hex".to_string(),
                exponent: 65537,
            }],
            ..ClientConfig::default()
        };
        assert!(config.connection_config().is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.main_dc, 2);
        assert!(config.dc_options.is_empty());
    }
}
