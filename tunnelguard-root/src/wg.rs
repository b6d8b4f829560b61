//! Concrete [`VpnAdapter`] that shells out to the `wg` CLI (spec §4.G).
//!
//! Mutation is by rewriting a peer's `allowed-ips` CSV wholesale: fetch the
//! current set, compute the new one, invoke `wg set <iface> peer <pub>
//! allowed-ips <csv>`. Listing parses `wg show all dump`'s tab-separated
//! output, grounded on the shape the teacher's own tooling module expects
//! from `wg-quick`/`wg` (command spawning, stdout/stderr capture, `which`
//! style availability probes).

use async_trait::async_trait;
use cidr::Ipv4Cidr;
use std::net::Ipv4Addr;
use std::str::FromStr;
use tokio::process::Command;

use tunnelguard_lib::shell_command_ext::{Logs, ShellCommandExt};
use tunnelguard_lib::vpn::{self, Interface, InterfaceConfig, PeerInfo, TunnelStatus, VpnAdapter};

pub struct WgAdapter;

impl WgAdapter {
    pub fn new() -> Self {
        WgAdapter
    }

    async fn dump(&self) -> Result<Vec<Interface>, vpn::Error> {
        let output = Command::new("wg")
            .arg("show")
            .arg("all")
            .arg("dump")
            .run_stdout(Logs::Suppress)
            .await
            .map_err(|error| vpn::Error::CommandFailed(error.to_string()))?;
        parse_dump(&output)
    }

    async fn interface_by_name(&self, name: &str) -> Result<Interface, vpn::Error> {
        self.dump()
            .await?
            .into_iter()
            .find(|iface| iface.name == name)
            .ok_or(vpn::Error::NotConfigured)
    }
}

impl Default for WgAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// `wg show all dump` emits one line per interface (a short header row) and
/// one line per peer that follows it, until the next interface line.
/// Interface lines carry the 44-char base64 public key in the second
/// column; peer lines carry it in the first.
fn parse_dump(output: &str) -> Result<Vec<Interface>, vpn::Error> {
    let mut interfaces: Vec<Interface> = Vec::new();

    for line in output.lines() {
        let cols: Vec<&str> = line.split('\t').collect();
        match cols.as_slice() {
            [name, public_key, _private_key, listen_port, _fwmark] => {
                let listen_port = listen_port.parse::<u16>().ok();
                interfaces.push(Interface {
                    name: (*name).to_string(),
                    public_key: (*public_key).to_string(),
                    listen_port,
                    peers: Vec::new(),
                });
            }
            [public_key, _preshared_key, endpoint, allowed_ips, latest_handshake, rx, tx, _persistent_keepalive] => {
                let interface = interfaces
                    .last_mut()
                    .ok_or_else(|| vpn::Error::Parse("peer line before any interface line".to_string()))?;
                let allowed_ips = parse_allowed_ips(allowed_ips)?;
                let latest_handshake = latest_handshake.parse::<u64>().ok().filter(|ts| *ts != 0);
                let endpoint = if *endpoint == "(none)" { None } else { Some((*endpoint).to_string()) };
                interface.peers.push(PeerInfo {
                    public_key: (*public_key).to_string(),
                    endpoint,
                    allowed_ips,
                    latest_handshake,
                    rx_bytes: rx.parse().unwrap_or_default(),
                    tx_bytes: tx.parse().unwrap_or_default(),
                });
            }
            _ => return Err(vpn::Error::Parse(format!("unexpected column count in dump line: {line}"))),
        }
    }

    Ok(interfaces)
}

fn parse_allowed_ips(csv: &str) -> Result<Vec<Ipv4Cidr>, vpn::Error> {
    if csv == "(none)" {
        return Ok(Vec::new());
    }
    csv.split(',')
        .map(|entry| {
            cidr::parsers::parse_cidr_ignore_hostbits::<Ipv4Cidr, _>(entry.trim(), Ipv4Addr::from_str)
                .map_err(|error| vpn::Error::Parse(error.to_string()))
        })
        .collect()
}

fn format_allowed_ips(ips: &[Ipv4Cidr]) -> String {
    if ips.is_empty() {
        vpn::sentinel_cidr().to_string()
    } else {
        ips.iter().map(|ip| ip.to_string()).collect::<Vec<_>>().join(",")
    }
}

#[async_trait]
impl VpnAdapter for WgAdapter {
    async fn list_interfaces(&self) -> Result<Vec<Interface>, vpn::Error> {
        self.dump().await
    }

    async fn get_interface(&self, name: &str) -> Result<Option<Interface>, vpn::Error> {
        match self.interface_by_name(name).await {
            Ok(interface) => Ok(Some(interface)),
            Err(vpn::Error::NotConfigured) => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn set_config(&self, config: InterfaceConfig) -> Result<(), vpn::Error> {
        // Elevation is transparent here: `tunnelguard-root` already runs
        // with the rights `wg set` needs, so no privileged-wrapper retry is
        // required on this side of the split (spec §4.G's "retry with a
        // privileged wrapper" applies to the unprivileged-daemon path,
        // which never calls `wg` directly).
        let interface = self.interface_by_name(&config.interface_name).await.ok();
        let allowed_ips = interface
            .and_then(|iface| iface.peers.into_iter().find(|peer| peer.public_key == config.peer_public_key))
            .map(|peer| peer.allowed_ips)
            .unwrap_or_default();

        Command::new("wg")
            .arg("set")
            .arg(&config.interface_name)
            .arg("peer")
            .arg(&config.peer_public_key)
            .arg("allowed-ips")
            .arg(format_allowed_ips(&allowed_ips))
            .run(Logs::Print)
            .await
            .map_err(|error| vpn::Error::CommandFailed(error.to_string()))
    }

    async fn get_allowed_ips(&self) -> Result<Vec<Ipv4Cidr>, vpn::Error> {
        let interfaces = self.dump().await?;
        Ok(interfaces
            .into_iter()
            .flat_map(|iface| iface.peers)
            .flat_map(|peer| peer.allowed_ips)
            .collect())
    }

    async fn add_allowed_ips(&self, ips: &[Ipv4Cidr]) -> Result<(), vpn::Error> {
        let (interface_name, peer_public_key, mut current) = current_peer_state(&self.dump().await?)?;
        for ip in ips {
            if !current.contains(ip) {
                current.push(*ip);
            }
        }
        set_allowed_ips(&interface_name, &peer_public_key, &current).await
    }

    async fn remove_allowed_ips(&self, ips: &[Ipv4Cidr]) -> Result<(), vpn::Error> {
        let (interface_name, peer_public_key, current) = current_peer_state(&self.dump().await?)?;
        let remaining: Vec<Ipv4Cidr> = current.into_iter().filter(|ip| !ips.contains(ip)).collect();
        set_allowed_ips(&interface_name, &peer_public_key, &remaining).await
    }

    async fn is_available(&self) -> bool {
        Command::new("which")
            .arg("wg")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    async fn is_active(&self) -> bool {
        match self.dump().await {
            Ok(interfaces) => interfaces.iter().any(|iface| iface.peers.iter().any(|peer| peer.latest_handshake.is_some())),
            Err(_) => false,
        }
    }

    async fn detect_tunnels(&self) -> TunnelStatus {
        if self.is_available().await {
            if self.dump().await.map(|ifaces| !ifaces.is_empty()).unwrap_or(false) {
                TunnelStatus::NativeAvailable
            } else {
                TunnelStatus::NoTunnel
            }
        } else {
            TunnelStatus::Unknown
        }
    }
}

/// Single-interface, single-peer MVP: all mutation helpers assume exactly
/// one managed interface/peer pair, consistent with `InterfaceConfig`
/// carrying just one of each (spec §6, "VPN interface name and peer public
/// key").
fn current_peer_state(interfaces: &[Interface]) -> Result<(String, String, Vec<Ipv4Cidr>), vpn::Error> {
    let interface = interfaces.first().ok_or(vpn::Error::NotConfigured)?;
    let peer = interface.peers.first().ok_or(vpn::Error::NotConfigured)?;
    Ok((interface.name.clone(), peer.public_key.clone(), peer.allowed_ips.clone()))
}

async fn set_allowed_ips(interface_name: &str, peer_public_key: &str, ips: &[Ipv4Cidr]) -> Result<(), vpn::Error> {
    Command::new("wg")
        .arg("set")
        .arg(interface_name)
        .arg("peer")
        .arg(peer_public_key)
        .arg("allowed-ips")
        .arg(format_allowed_ips(ips))
        .run(Logs::Print)
        .await
        .map_err(|error| vpn::Error::CommandFailed(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "wg0\tAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=\t(hidden)\t51820\toff\npeerpubkey123\t(none)\t203.0.113.1:51820\t10.0.0.0/32,10.0.0.1/32\t1700000000\t100\t200\toff";

    #[test]
    fn parses_interface_and_peer_lines() {
        let interfaces = parse_dump(DUMP).unwrap();
        assert_eq!(interfaces.len(), 1);
        let iface = &interfaces[0];
        assert_eq!(iface.name, "wg0");
        assert_eq!(iface.listen_port, Some(51820));
        assert_eq!(iface.peers.len(), 1);
        let peer = &iface.peers[0];
        assert_eq!(peer.public_key, "peerpubkey123");
        assert_eq!(peer.allowed_ips.len(), 2);
        assert_eq!(peer.rx_bytes, 100);
        assert_eq!(peer.tx_bytes, 200);
        assert_eq!(peer.latest_handshake, Some(1700000000));
    }

    #[test]
    fn none_endpoint_and_allowed_ips_parse_as_empty() {
        let dump = "wg0\tpub\t(hidden)\t51820\toff\npeerpub\t(none)\t(none)\t(none)\t0\t0\t0\toff";
        let interfaces = parse_dump(dump).unwrap();
        let peer = &interfaces[0].peers[0];
        assert!(peer.endpoint.is_none());
        assert!(peer.allowed_ips.is_empty());
        assert!(peer.latest_handshake.is_none());
    }

    #[test]
    fn peer_line_before_any_interface_is_rejected() {
        let dump = "peerpub\t(none)\t(none)\t(none)\t0\t0\t0\toff";
        assert!(parse_dump(dump).is_err());
    }

    #[test]
    fn format_allowed_ips_falls_back_to_sentinel_when_empty() {
        assert_eq!(format_allowed_ips(&[]), vpn::sentinel_cidr().to_string());
    }

    #[test]
    fn format_allowed_ips_joins_with_commas() {
        let ips = vec![
            Ipv4Cidr::new(Ipv4Addr::new(10, 0, 0, 1), 32).unwrap(),
            Ipv4Cidr::new(Ipv4Addr::new(10, 0, 0, 2), 32).unwrap(),
        ];
        assert_eq!(format_allowed_ips(&ips), "10.0.0.1/32,10.0.0.2/32");
    }
}
