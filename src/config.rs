//! Configuration schema (spec §6).
//!
//! Design Notes (spec §9) call for replacing runtime reflection over dotted
//! paths with an enumerated schema and a typed setter/getter per field. The
//! YAML/JSON loader that turns file bytes into a [`Config`] is out of scope
//! (spec §1); this module only owns the typed struct, its field enumeration,
//! and validation.

use crate::error::{Result, TunnelError};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelProtocol {
    Tcp,
    Udp,
    Quic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TlsVersion {
    V1_2,
    V1_3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorType {
    Prometheus,
    Snmp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevelField {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub interface: String,
    pub address: String, // CIDR
    pub mtu: u16,
    pub dns_servers: Vec<IpAddr>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            address: String::new(),
            mtu: 1500,
            dns_servers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub protocol: TunnelProtocol,
    pub port: u16,
    pub server_address: Option<String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            protocol: TunnelProtocol::Tcp,
            port: 0,
            server_address: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub min_version: TlsVersion,
    pub max_version: TlsVersion,
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            min_version: TlsVersion::V1_3,
            max_version: TlsVersion::V1_3,
            cert_file: String::new(),
            key_file: String::new(),
            ca_file: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThrottleConfig {
    pub enabled: bool,
    pub rate: u64,
    pub burst: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub kind: MonitorType,
    pub interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: MonitorType::Prometheus,
            interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mode: Mode,
    pub network: NetworkConfig,
    pub tunnel: TunnelConfig,
    pub tls: TlsConfig,
    pub throttle: ThrottleConfig,
    pub monitor: MonitorConfig,
    pub logging_level: LogLevelField,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Client,
            network: NetworkConfig::default(),
            tunnel: TunnelConfig::default(),
            tls: TlsConfig::default(),
            throttle: ThrottleConfig::default(),
            monitor: MonitorConfig::default(),
            logging_level: LogLevelField::Info,
        }
    }
}

/// Enumerates every settable field by its dotted path, so `config set
/// a.b.c v` never needs late-bound field lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigField {
    Mode,
    NetworkInterface,
    NetworkAddress,
    NetworkMtu,
    NetworkDnsServers,
    TunnelProtocol,
    TunnelPort,
    TunnelServerAddress,
    TlsMinVersion,
    TlsMaxVersion,
    TlsCertFile,
    TlsKeyFile,
    TlsCaFile,
    ThrottleEnabled,
    ThrottleRate,
    ThrottleBurst,
    MonitorEnabled,
    MonitorInterval,
    LoggingLevel,
}

impl ConfigField {
    pub fn from_path(path: &str) -> Option<Self> {
        Some(match path {
            "mode" => Self::Mode,
            "network.interface" => Self::NetworkInterface,
            "network.address" => Self::NetworkAddress,
            "network.mtu" => Self::NetworkMtu,
            "network.dns_servers" => Self::NetworkDnsServers,
            "tunnel.protocol" => Self::TunnelProtocol,
            "tunnel.port" => Self::TunnelPort,
            "tunnel.server_address" => Self::TunnelServerAddress,
            "security.tls.min_version" => Self::TlsMinVersion,
            "security.tls.max_version" => Self::TlsMaxVersion,
            "security.tls.cert_file" => Self::TlsCertFile,
            "security.tls.key_file" => Self::TlsKeyFile,
            "security.tls.ca_file" => Self::TlsCaFile,
            "throttle.enabled" => Self::ThrottleEnabled,
            "throttle.rate" => Self::ThrottleRate,
            "throttle.burst" => Self::ThrottleBurst,
            "monitor.enabled" => Self::MonitorEnabled,
            "monitor.interval" => Self::MonitorInterval,
            "logging.level" => Self::LoggingLevel,
            _ => return None,
        })
    }
}

impl Config {
    /// Typed setter for a single field, addressed by its enumerated variant.
    pub fn set(&mut self, field: ConfigField, value: &str) -> Result<()> {
        use ConfigField::*;
        match field {
            Mode => {
                self.mode = match value {
                    "server" => Mode::Server,
                    "client" => Mode::Client,
                    other => return Err(invalid("mode", other)),
                }
            }
            NetworkInterface => self.network.interface = value.to_string(),
            NetworkAddress => self.network.address = value.to_string(),
            NetworkMtu => {
                self.network.mtu = value
                    .parse()
                    .map_err(|_| invalid("network.mtu", value))?;
            }
            NetworkDnsServers => {
                self.network.dns_servers = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| s.parse().map_err(|_| invalid("network.dns_servers", value)))
                    .collect::<Result<Vec<_>>>()?;
            }
            TunnelProtocol => {
                self.tunnel.protocol = match value {
                    "tcp" => TunnelProtocol::Tcp,
                    "udp" => TunnelProtocol::Udp,
                    "quic" => TunnelProtocol::Quic,
                    other => return Err(invalid("tunnel.protocol", other)),
                }
            }
            TunnelPort => {
                self.tunnel.port = value
                    .parse()
                    .map_err(|_| invalid("tunnel.port", value))?;
            }
            TunnelServerAddress => self.tunnel.server_address = Some(value.to_string()),
            TlsMinVersion => self.tls.min_version = parse_tls_version(value)?,
            TlsMaxVersion => self.tls.max_version = parse_tls_version(value)?,
            TlsCertFile => self.tls.cert_file = value.to_string(),
            TlsKeyFile => self.tls.key_file = value.to_string(),
            TlsCaFile => self.tls.ca_file = value.to_string(),
            ThrottleEnabled => {
                self.throttle.enabled = value
                    .parse()
                    .map_err(|_| invalid("throttle.enabled", value))?;
            }
            ThrottleRate => {
                self.throttle.rate = value
                    .parse()
                    .map_err(|_| invalid("throttle.rate", value))?;
            }
            ThrottleBurst => {
                self.throttle.burst = value
                    .parse()
                    .map_err(|_| invalid("throttle.burst", value))?;
            }
            MonitorEnabled => {
                self.monitor.enabled = value
                    .parse()
                    .map_err(|_| invalid("monitor.enabled", value))?;
            }
            MonitorInterval => {
                self.monitor.interval_secs = value
                    .parse()
                    .map_err(|_| invalid("monitor.interval", value))?;
            }
            LoggingLevel => {
                self.logging_level = match value {
                    "debug" => LogLevelField::Debug,
                    "info" => LogLevelField::Info,
                    "warn" => LogLevelField::Warn,
                    "error" => LogLevelField::Error,
                    "fatal" => LogLevelField::Fatal,
                    other => return Err(invalid("logging.level", other)),
                }
            }
        }
        Ok(())
    }

    /// Parse and set a dotted path in one call (the "config set a.b.c v" contract).
    pub fn set_path(&mut self, path: &str, value: &str) -> Result<()> {
        let field = ConfigField::from_path(path)
            .ok_or_else(|| TunnelError::ConfigValidationError {
                field: path.to_string(),
                reason: "unknown field".to_string(),
            })?;
        self.set(field, value)
    }

    /// Stricter of the two validators the original exposed (spec §9 Open
    /// Question): reject empty required fields and out-of-range numerics.
    pub fn validate(&self) -> Result<()> {
        if self.network.interface.is_empty() {
            return Err(required("network.interface"));
        }
        if self.network.address.is_empty() {
            return Err(required("network.address"));
        }
        if !(576..=65535).contains(&self.network.mtu) {
            return Err(TunnelError::ConfigValidationError {
                field: "network.mtu".to_string(),
                reason: format!("{} out of range 576..=65535", self.network.mtu),
            });
        }
        if !(1..=65535).contains(&self.tunnel.port) {
            return Err(TunnelError::ConfigValidationError {
                field: "tunnel.port".to_string(),
                reason: format!("{} out of range 1..=65535", self.tunnel.port),
            });
        }
        if self.mode == Mode::Client && self.tunnel.server_address.is_none() {
            return Err(required("tunnel.server_address"));
        }
        if self.tls.cert_file.is_empty() {
            return Err(required("security.tls.cert_file"));
        }
        if self.tls.key_file.is_empty() {
            return Err(required("security.tls.key_file"));
        }
        if self.tls.ca_file.is_empty() {
            return Err(required("security.tls.ca_file"));
        }
        if self.tls.min_version > self.tls.max_version {
            return Err(TunnelError::ConfigValidationError {
                field: "security.tls.min_version".to_string(),
                reason: "min_version greater than max_version".to_string(),
            });
        }
        if self.throttle.enabled && self.throttle.rate == 0 {
            return Err(TunnelError::ConfigValidationError {
                field: "throttle.rate".to_string(),
                reason: "must be > 0 when throttle.enabled".to_string(),
            });
        }
        if self.throttle.enabled && self.throttle.burst == 0 {
            return Err(TunnelError::ConfigValidationError {
                field: "throttle.burst".to_string(),
                reason: "must be > 0 when throttle.enabled".to_string(),
            });
        }
        if self.monitor.enabled && self.monitor.interval_secs < 1 {
            return Err(TunnelError::ConfigValidationError {
                field: "monitor.interval".to_string(),
                reason: "must be >= 1s".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_tls_version(value: &str) -> Result<TlsVersion> {
    match value {
        "1.2" => Ok(TlsVersion::V1_2),
        "1.3" => Ok(TlsVersion::V1_3),
        other => Err(invalid("security.tls.min_version/max_version", other)),
    }
}

fn invalid(field: &str, value: &str) -> TunnelError {
    TunnelError::ConfigValidationError {
        field: field.to_string(),
        reason: format!("invalid value {value:?}"),
    }
}

fn required(field: &str) -> TunnelError {
    TunnelError::ConfigValidationError {
        field: field.to_string(),
        reason: "required field is empty".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut c = Config::default();
        c.network.interface = "tun0".to_string();
        c.network.address = "10.0.0.1/24".to_string();
        c.tunnel.port = 8443;
        c.tunnel.server_address = Some("example.com".to_string());
        c.tls.cert_file = "client.pem".to_string();
        c.tls.key_file = "client.key".to_string();
        c.tls.ca_file = "ca.pem".to_string();
        c
    }

    #[test]
    fn validate_accepts_complete_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_required_field() {
        let mut c = valid_config();
        c.network.interface.clear();
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_mtu() {
        let mut c = valid_config();
        c.network.mtu = 100;
        assert!(c.validate().is_err());
    }

    #[test]
    fn set_path_dispatches_to_typed_setter() {
        let mut c = valid_config();
        c.set_path("network.mtu", "9000").unwrap();
        assert_eq!(c.network.mtu, 9000);
    }

    #[test]
    fn set_path_rejects_unknown_field() {
        let mut c = valid_config();
        assert!(c.set_path("network.bogus", "x").is_err());
    }

    #[test]
    fn set_path_parses_comma_separated_dns_servers() {
        let mut c = valid_config();
        c.set_path("network.dns_servers", "1.1.1.1, 8.8.8.8").unwrap();
        assert_eq!(
            c.network.dns_servers,
            vec!["1.1.1.1".parse::<IpAddr>().unwrap(), "8.8.8.8".parse().unwrap()]
        );
    }
}
