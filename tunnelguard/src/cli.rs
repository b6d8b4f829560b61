use clap::Parser;

use std::net::SocketAddr;
use std::path::PathBuf;

use tunnelguard_lib::command;
use tunnelguard_lib::config;
use tunnelguard_lib::privileged;

/// TunnelGuard - domain-based split tunneling daemon
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Socket path `tunnelguard-ctl` connects to
    #[arg(short, long, env = command::ENV_VAR, default_value = command::DEFAULT_PATH)]
    pub socket_path: PathBuf,

    /// Socket path for the privileged helper (`tunnelguard-root`)
    #[arg(long, env = privileged::ENV_VAR, default_value = privileged::DEFAULT_PATH)]
    pub root_socket_path: PathBuf,

    /// Persisted configuration file
    #[arg(short, long, env = config::ENV_VAR, default_value = config::DEFAULT_PATH)]
    pub config_path: PathBuf,

    /// VPN-side SOCKS5 proxy the SNI proxy dials tunnel-classified targets
    /// through (spec §4.E); overrides and persists over whatever is in the
    /// config file. Omit to keep falling back to a direct dial.
    #[arg(long)]
    pub vpn_socks_addr: Option<SocketAddr>,

    /// Log to a file instead of stdout
    #[arg(long)]
    pub log_file: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cli_with_minimum_arguments() {
        let args = Cli::try_parse_from(["tunnelguard"]).unwrap();
        assert!(!args.log_file);
        assert!(args.vpn_socks_addr.is_none());
    }

    #[test]
    fn vpn_socks_addr_is_parsed_when_given() {
        let args = Cli::try_parse_from(["tunnelguard", "--vpn-socks-addr", "127.0.0.1:1081"]).unwrap();
        assert_eq!(args.vpn_socks_addr, Some("127.0.0.1:1081".parse().unwrap()));
    }

    #[test]
    fn paths_are_overridable() {
        let args = Cli::try_parse_from([
            "tunnelguard",
            "--socket-path",
            "/tmp/tunnelguard.sock",
            "--root-socket-path",
            "/tmp/root.sock",
            "--config-path",
            "/tmp/config.toml",
        ])
        .unwrap();
        assert_eq!(args.socket_path, PathBuf::from("/tmp/tunnelguard.sock"));
        assert_eq!(args.root_socket_path, PathBuf::from("/tmp/root.sock"));
        assert_eq!(args.config_path, PathBuf::from("/tmp/config.toml"));
    }
}
