//! Configuration handling for the sockbridge binary.
//!
//! Settings come from a YAML file, then environment variables, then command
//! line flags. A missing or unreadable file falls back to defaults.

use anyhow::{bail, Context, Result};
use bridge_dgram::DatagramKind;
use bridge_handle::AddressFamily;
use bridge_stream::SocketConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

/// Sockbridge configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Connection target for the stream demo
    pub stream: StreamSettings,
    /// Stream socket tuning
    pub socket: SocketConfig,
    /// Datagram demo settings
    pub datagram: DatagramSettings,
    /// TLS settings
    pub tls: TlsSettings,
}

/// Connection target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Remote host
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Use IPv6
    pub ipv6: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            host: "203.0.113.5".to_string(),
            port: 443,
            ipv6: false,
        }
    }
}

impl StreamSettings {
    pub fn family(&self) -> AddressFamily {
        if self.ipv6 {
            AddressFamily::V6
        } else {
            AddressFamily::V4
        }
    }
}

/// Datagram destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatagramSettings {
    /// Socket type, `udp4` or `udp6`
    pub kind: String,
    /// Destination host
    pub host: String,
    /// Destination port
    pub port: u16,
}

impl Default for DatagramSettings {
    fn default() -> Self {
        Self {
            kind: "udp4".to_string(),
            host: "198.51.100.1".to_string(),
            port: 9999,
        }
    }
}

impl DatagramSettings {
    pub fn socket_kind(&self) -> Result<DatagramKind> {
        DatagramKind::from_str(&self.kind).with_context(|| format!("datagram kind {:?}", self.kind))
    }
}

/// How peer certificates are trusted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrustPolicy {
    /// Reject every certificate
    #[default]
    Reject,
    /// Accept every certificate
    TrustAll,
    /// Accept only pinned certificates
    Pinned,
}

impl FromStr for TrustPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reject" => Ok(TrustPolicy::Reject),
            "trust-all" => Ok(TrustPolicy::TrustAll),
            "pinned" => Ok(TrustPolicy::Pinned),
            other => bail!("unknown trust policy {:?} (reject, trust-all, pinned)", other),
        }
    }
}

/// TLS settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Name the server certificate is checked against
    pub server_name: String,
    /// Trust policy
    pub policy: TrustPolicy,
    /// PEM bundle of pinned certificates
    pub pinned_pem: Option<PathBuf>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            server_name: "localhost".to_string(),
            policy: TrustPolicy::default(),
            pinned_pem: None,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<BridgeConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides(|key| std::env::var(key).ok())?;

        info!(
            "Final configuration: stream={}:{}, datagram={} {}:{}, tls policy={:?}",
            config.stream.host,
            config.stream.port,
            config.datagram.kind,
            config.datagram.host,
            config.datagram.port,
            config.tls.policy
        );
        Ok(config)
    }

    /// Apply `SOCKBRIDGE_*` overrides looked up through `lookup`.
    pub fn apply_environment_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("SOCKBRIDGE_HOST") {
            info!("Stream host overridden by environment: {}", host);
            self.stream.host = host;
        }
        if let Some(port) = lookup("SOCKBRIDGE_PORT") {
            self.stream.port = port
                .parse()
                .with_context(|| format!("SOCKBRIDGE_PORT={:?}", port))?;
            info!("Stream port overridden by environment: {}", self.stream.port);
        }
        if let Some(mark) = lookup("SOCKBRIDGE_READ_HWM") {
            self.socket.read_high_water_mark = mark
                .parse()
                .with_context(|| format!("SOCKBRIDGE_READ_HWM={:?}", mark))?;
            info!("Read high-water mark overridden by environment: {}", mark);
        }
        if let Some(mark) = lookup("SOCKBRIDGE_WRITE_HWM") {
            self.socket.write_high_water_mark = mark
                .parse()
                .with_context(|| format!("SOCKBRIDGE_WRITE_HWM={:?}", mark))?;
            info!("Write high-water mark overridden by environment: {}", mark);
        }
        if let Some(policy) = lookup("SOCKBRIDGE_TLS_POLICY") {
            self.tls.policy = policy.parse()?;
            info!("TLS policy overridden by environment: {:?}", self.tls.policy);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.stream.host, "203.0.113.5");
        assert_eq!(config.stream.port, 443);
        assert_eq!(config.socket, SocketConfig::default());
        assert_eq!(config.datagram.socket_kind().unwrap(), DatagramKind::Udp4);
        assert_eq!(config.tls.policy, TrustPolicy::Reject);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
stream:
  host: 192.0.2.10
  port: 8443
socket:
  read_high_water_mark: 1024
  allow_half_open: false
datagram:
  kind: udp6
  host: "2001:db8::1"
tls:
  server_name: svc.internal
  policy: trust-all
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.stream.host, "192.0.2.10");
        assert_eq!(config.stream.port, 8443);
        assert_eq!(config.socket.read_high_water_mark, 1024);
        assert_eq!(
            config.socket.write_high_water_mark,
            SocketConfig::default().write_high_water_mark
        );
        assert!(!config.socket.allow_half_open);
        assert_eq!(config.datagram.socket_kind().unwrap(), DatagramKind::Udp6);
        assert_eq!(config.datagram.port, 9999);
        assert_eq!(config.tls.server_name, "svc.internal");
        assert_eq!(config.tls.policy, TrustPolicy::TrustAll);
    }

    #[test]
    fn test_malformed_file_uses_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"stream: [not, a, map").unwrap();
        let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.stream, StreamSettings::default());
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("SOCKBRIDGE_HOST", "192.0.2.44"),
            ("SOCKBRIDGE_PORT", "7000"),
            ("SOCKBRIDGE_WRITE_HWM", "64"),
            ("SOCKBRIDGE_TLS_POLICY", "pinned"),
        ]
        .into_iter()
        .collect();
        let mut config = BridgeConfig::default();
        config
            .apply_environment_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.stream.host, "192.0.2.44");
        assert_eq!(config.stream.port, 7000);
        assert_eq!(config.socket.write_high_water_mark, 64);
        assert_eq!(config.tls.policy, TrustPolicy::Pinned);

        let bad = config.apply_environment_overrides(|k| {
            (k == "SOCKBRIDGE_PORT").then(|| "not-a-port".to_string())
        });
        assert!(bad.is_err());
    }

    #[test]
    fn test_bad_datagram_kind() {
        let settings = DatagramSettings {
            kind: "udp5".into(),
            ..DatagramSettings::default()
        };
        let err = settings.socket_kind().unwrap_err();
        assert!(format!("{:#}", err).contains("Valid types are: udp4, udp6"));
    }
}
