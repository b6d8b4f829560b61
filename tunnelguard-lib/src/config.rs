//! Persisted configuration: the rule list, VPN interface/peer, upstream
//! resolvers, listen ports, and the DNS backup blob carried across restarts
//! (spec §6, "Persisted state").
//!
//! Modeled on the teacher's own `config::read`: a single TOML file, read
//! once at start, with a `version` field checked up front so a future
//! format change has somewhere to branch from.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::SystemTime;
use thiserror::Error;
use tokio::fs;

use crate::domain::Rule;

pub const DEFAULT_PATH: &str = "/etc/tunnelguard/config.toml";
pub const ENV_VAR: &str = "TUNNELGUARD_CONFIG_PATH";

const CURRENT_VERSION: u32 = 1;

fn default_tunnel_upstream() -> SocketAddr {
    SocketAddr::from(([8, 8, 8, 8], 53))
}

fn default_direct_upstream() -> SocketAddr {
    SocketAddr::from(([1, 1, 1, 1], 53))
}

const fn default_dns_proxy_port() -> u16 {
    5353
}

const fn default_socks_port() -> u16 {
    1080
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnConfig {
    pub interface_name: Option<String>,
    pub peer_public_key: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub version: u32,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub vpn: VpnConfig,
    #[serde(default = "default_tunnel_upstream")]
    pub tunnel_upstream: SocketAddr,
    #[serde(default = "default_direct_upstream")]
    pub direct_upstream: SocketAddr,
    #[serde(default = "default_dns_proxy_port")]
    pub dns_proxy_port: u16,
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    /// Address of a VPN-side SOCKS5 proxy the SNI proxy dials through for
    /// tunnel-classified targets (spec §4.E step 5). `None` means every
    /// tunnel-classified connection falls back to a direct dial.
    #[serde(default)]
    pub vpn_socks: Option<SocketAddr>,
    /// Opaque OS-specific backup captured by the system DNS adapter before
    /// redirection is applied; consulted at crash recovery.
    #[serde(default)]
    pub dns_backup: Option<serde_json::Value>,
    #[serde(default, with = "humantime_serde::option")]
    pub last_active: Option<SystemTime>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            version: CURRENT_VERSION,
            rules: Vec::new(),
            vpn: VpnConfig::default(),
            tunnel_upstream: default_tunnel_upstream(),
            direct_upstream: default_direct_upstream(),
            dns_proxy_port: default_dns_proxy_port(),
            socks_port: default_socks_port(),
            vpn_socks: None,
            dns_backup: None,
            last_active: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration file not found")]
    NoFile,
    #[error("unable to determine configuration version")]
    VersionNotFound,
    #[error("unsupported config version: {0} (this build supports {CURRENT_VERSION})")]
    VersionMismatch(u32),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
    #[error("serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),
}

pub async fn read(path: &Path) -> Result<Config, Error> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound { Error::NoFile } else { Error::Io(e) }
    })?;

    let table = content.parse::<toml::Table>()?;
    let version = table.get("version").and_then(|v| v.as_integer()).ok_or(Error::VersionNotFound)?;
    if version as u32 != CURRENT_VERSION {
        return Err(Error::VersionMismatch(version as u32));
    }

    let config: Config = toml::from_str(&content)?;
    Ok(config)
}

/// Writes the config back to `path`, used on every rule mutation and on
/// engine start/stop (DNS backup, last-active timestamp).
pub async fn write(path: &Path, config: &Config) -> Result<(), Error> {
    let serialized = toml::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, serialized).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.rules.push(Rule::new("example.com", true).unwrap());
        config.vpn.interface_name = Some("wg0".to_string());
        config.tunnel_upstream = SocketAddr::from((Ipv4Addr::new(9, 9, 9, 9), 53));
        config.vpn_socks = Some(SocketAddr::from((Ipv4Addr::new(10, 0, 0, 1), 1081)));

        write(&path, &config).await.unwrap();
        let read_back = read(&path).await.unwrap();

        assert_eq!(read_back.rules, config.rules);
        assert_eq!(read_back.vpn.interface_name, config.vpn.interface_name);
        assert_eq!(read_back.tunnel_upstream, config.tunnel_upstream);
        assert_eq!(read_back.vpn_socks, config.vpn_socks);
    }

    #[tokio::test]
    async fn missing_file_reports_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        assert!(matches!(read(&path).await, Err(Error::NoFile)));
    }

    #[tokio::test]
    async fn unsupported_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "version = 99\n").await.unwrap();
        assert!(matches!(read(&path).await, Err(Error::VersionMismatch(99))));
    }

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.tunnel_upstream, SocketAddr::from((Ipv4Addr::new(8, 8, 8, 8), 53)));
        assert_eq!(config.direct_upstream, SocketAddr::from((Ipv4Addr::new(1, 1, 1, 1), 53)));
        assert_eq!(config.dns_proxy_port, 5353);
        assert_eq!(config.socks_port, 1080);
    }
}
