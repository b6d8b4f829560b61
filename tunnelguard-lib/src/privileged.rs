//! Client side of the privileged channel: the unprivileged daemon forwards
//! every VPN-adapter and system-DNS-adapter mutation to `tunnelguard-root`
//! over a Unix socket, rather than holding elevated rights itself (spec
//! §9 design notes: "explicit `PrivilegedRunner` capability injected into
//! F and G").
//!
//! The wire shape reuses [`crate::ipc`]'s newline-delimited JSON
//! request/response pattern. `tunnelguard-root` runs the server side:
//! decode a [`Request`], dispatch to its local adapter implementations,
//! encode the matching [`Response`].

use async_trait::async_trait;
use cidr::Ipv4Cidr;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::ipc;
use crate::system_dns::{self, Backup, SystemDnsAdapter};
use crate::vpn::{self, Interface, InterfaceConfig, TunnelStatus, VpnAdapter};

pub const DEFAULT_PATH: &str = "/var/run/tunnelguard/root.sock";
pub const ENV_VAR: &str = "TUNNELGUARD_ROOT_SOCKET_PATH";

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Ipc(#[from] ipc::Error),
    #[error("unexpected response shape for this request")]
    MismatchedResponse,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum VpnRequest {
    ListInterfaces,
    GetInterface { name: String },
    SetConfig { config: InterfaceConfig },
    GetAllowedIps,
    AddAllowedIps { ips: Vec<Ipv4Cidr> },
    RemoveAllowedIps { ips: Vec<Ipv4Cidr> },
    IsAvailable,
    IsActive,
    DetectTunnels,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum VpnResponse {
    Interfaces(Vec<Interface>),
    Interface(Option<Interface>),
    Configured(Result<(), String>),
    AllowedIps(Vec<Ipv4Cidr>),
    Added(Result<(), String>),
    Removed(Result<(), String>),
    Available(bool),
    Active(bool),
    Tunnels(TunnelStatus),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SystemDnsRequest {
    Configure { proxy_port: u16 },
    Restore { backup: Backup },
    CheckForStaleConfig { backup: Backup },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SystemDnsResponse {
    Configured(Result<Backup, String>),
    Restored(Result<(), String>),
    Stale(Result<bool, String>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    Vpn(VpnRequest),
    SystemDns(SystemDnsRequest),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Vpn(VpnResponse),
    SystemDns(SystemDnsResponse),
}

/// Connects to `tunnelguard-root`'s privileged socket for every call. One
/// short-lived connection per request, matching the control-socket pattern
/// used between `tunnelguard-ctl` and the daemon.
#[derive(Clone, Debug)]
pub struct PrivilegedClient {
    socket_path: PathBuf,
}

impl PrivilegedClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        PrivilegedClient { socket_path: socket_path.into() }
    }

    async fn call(&self, request: Request) -> Result<Response, Error> {
        Ok(ipc::send(&self.socket_path, &request).await?)
    }

    async fn vpn_call(&self, request: VpnRequest) -> Result<VpnResponse, Error> {
        match self.call(Request::Vpn(request)).await? {
            Response::Vpn(resp) => Ok(resp),
            _ => Err(Error::MismatchedResponse),
        }
    }

    async fn system_dns_call(&self, request: SystemDnsRequest) -> Result<SystemDnsResponse, Error> {
        match self.call(Request::SystemDns(request)).await? {
            Response::SystemDns(resp) => Ok(resp),
            _ => Err(Error::MismatchedResponse),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

#[async_trait]
impl VpnAdapter for PrivilegedClient {
    async fn list_interfaces(&self) -> Result<Vec<Interface>, vpn::Error> {
        match self.vpn_call(VpnRequest::ListInterfaces).await {
            Ok(VpnResponse::Interfaces(interfaces)) => Ok(interfaces),
            Ok(_) => Err(vpn::Error::CommandFailed("mismatched privileged response".into())),
            Err(error) => Err(vpn::Error::CommandFailed(error.to_string())),
        }
    }

    async fn get_interface(&self, name: &str) -> Result<Option<Interface>, vpn::Error> {
        match self.vpn_call(VpnRequest::GetInterface { name: name.to_string() }).await {
            Ok(VpnResponse::Interface(interface)) => Ok(interface),
            Ok(_) => Err(vpn::Error::CommandFailed("mismatched privileged response".into())),
            Err(error) => Err(vpn::Error::CommandFailed(error.to_string())),
        }
    }

    async fn set_config(&self, config: InterfaceConfig) -> Result<(), vpn::Error> {
        match self.vpn_call(VpnRequest::SetConfig { config }).await {
            Ok(VpnResponse::Configured(result)) => result.map_err(vpn::Error::CommandFailed),
            Ok(_) => Err(vpn::Error::CommandFailed("mismatched privileged response".into())),
            Err(error) => Err(vpn::Error::CommandFailed(error.to_string())),
        }
    }

    async fn get_allowed_ips(&self) -> Result<Vec<Ipv4Cidr>, vpn::Error> {
        match self.vpn_call(VpnRequest::GetAllowedIps).await {
            Ok(VpnResponse::AllowedIps(ips)) => Ok(ips),
            Ok(_) => Err(vpn::Error::CommandFailed("mismatched privileged response".into())),
            Err(error) => Err(vpn::Error::CommandFailed(error.to_string())),
        }
    }

    async fn add_allowed_ips(&self, ips: &[Ipv4Cidr]) -> Result<(), vpn::Error> {
        match self.vpn_call(VpnRequest::AddAllowedIps { ips: ips.to_vec() }).await {
            Ok(VpnResponse::Added(result)) => result.map_err(vpn::Error::CommandFailed),
            Ok(_) => Err(vpn::Error::CommandFailed("mismatched privileged response".into())),
            Err(error) => Err(vpn::Error::CommandFailed(error.to_string())),
        }
    }

    async fn remove_allowed_ips(&self, ips: &[Ipv4Cidr]) -> Result<(), vpn::Error> {
        match self.vpn_call(VpnRequest::RemoveAllowedIps { ips: ips.to_vec() }).await {
            Ok(VpnResponse::Removed(result)) => result.map_err(vpn::Error::CommandFailed),
            Ok(_) => Err(vpn::Error::CommandFailed("mismatched privileged response".into())),
            Err(error) => Err(vpn::Error::CommandFailed(error.to_string())),
        }
    }

    async fn is_available(&self) -> bool {
        matches!(self.vpn_call(VpnRequest::IsAvailable).await, Ok(VpnResponse::Available(true)))
    }

    async fn is_active(&self) -> bool {
        matches!(self.vpn_call(VpnRequest::IsActive).await, Ok(VpnResponse::Active(true)))
    }

    async fn detect_tunnels(&self) -> TunnelStatus {
        match self.vpn_call(VpnRequest::DetectTunnels).await {
            Ok(VpnResponse::Tunnels(status)) => status,
            _ => TunnelStatus::Unknown,
        }
    }
}

#[async_trait]
impl SystemDnsAdapter for PrivilegedClient {
    async fn configure(&self, proxy_port: u16) -> Result<Backup, system_dns::Error> {
        match self.system_dns_call(SystemDnsRequest::Configure { proxy_port }).await {
            Ok(SystemDnsResponse::Configured(result)) => result.map_err(system_dns::Error::CommandFailed),
            Ok(_) => Err(system_dns::Error::CommandFailed("mismatched privileged response".into())),
            Err(error) => Err(system_dns::Error::CommandFailed(error.to_string())),
        }
    }

    async fn restore(&self, backup: &Backup) -> Result<(), system_dns::Error> {
        match self.system_dns_call(SystemDnsRequest::Restore { backup: backup.clone() }).await {
            Ok(SystemDnsResponse::Restored(result)) => result.map_err(system_dns::Error::CommandFailed),
            Ok(_) => Err(system_dns::Error::CommandFailed("mismatched privileged response".into())),
            Err(error) => Err(system_dns::Error::CommandFailed(error.to_string())),
        }
    }

    async fn check_for_stale_config(&self, backup: &Backup) -> Result<bool, system_dns::Error> {
        match self.system_dns_call(SystemDnsRequest::CheckForStaleConfig { backup: backup.clone() }).await {
            Ok(SystemDnsResponse::Stale(result)) => result.map_err(system_dns::Error::CommandFailed),
            Ok(_) => Err(system_dns::Error::CommandFailed("mismatched privileged response".into())),
            Err(error) => Err(system_dns::Error::CommandFailed(error.to_string())),
        }
    }
}
