//! Narrow adapter over the external VPN control tool (component G).
//!
//! The trait is the surface the route manager depends on; the concrete
//! implementation that shells out to the tool lives in `tunnelguard-root`,
//! reached from the daemon through [`crate::privileged::PrivilegedRunner`].

use async_trait::async_trait;
use cidr::Ipv4Cidr;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("vpn tool not available")]
    NotAvailable,
    #[error("vpn tool command failed: {0}")]
    CommandFailed(String),
    #[error("failed to parse vpn tool output: {0}")]
    Parse(String),
    #[error("no interface configured")]
    NotConfigured,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub public_key: String,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<Ipv4Cidr>,
    pub latest_handshake: Option<u64>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub public_key: String,
    pub listen_port: Option<u16>,
    pub peers: Vec<PeerInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub interface_name: String,
    pub peer_public_key: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TunnelStatus {
    NativeAvailable,
    ThirdPartyDetected,
    NoTunnel,
    Unknown,
}

/// Sentinel the adapter substitutes when a removal would otherwise leave the
/// peer's allowed-ips empty (the tool requires at least one entry).
pub fn sentinel_cidr() -> Ipv4Cidr {
    Ipv4Cidr::new(Ipv4Addr::new(0, 0, 0, 0), 32).expect("0.0.0.0/32 is always valid")
}

#[async_trait]
pub trait VpnAdapter: Send + Sync {
    async fn list_interfaces(&self) -> Result<Vec<Interface>, Error>;
    async fn get_interface(&self, name: &str) -> Result<Option<Interface>, Error>;
    async fn set_config(&self, config: InterfaceConfig) -> Result<(), Error>;
    async fn get_allowed_ips(&self) -> Result<Vec<Ipv4Cidr>, Error>;
    async fn add_allowed_ips(&self, ips: &[Ipv4Cidr]) -> Result<(), Error>;
    async fn remove_allowed_ips(&self, ips: &[Ipv4Cidr]) -> Result<(), Error>;
    async fn is_available(&self) -> bool;
    async fn is_active(&self) -> bool;
    async fn detect_tunnels(&self) -> TunnelStatus;
}
