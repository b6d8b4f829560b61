use clap::Parser;

use std::path::PathBuf;

use tunnelguard_lib::privileged;

/// TunnelGuard privileged helper - the only process in the workspace
/// expected to run with elevated rights. Implements the VPN tool and
/// system DNS mutations the unprivileged daemon forwards to it.
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Unix socket this helper listens on for requests from the daemon
    #[arg(short, long, env = privileged::ENV_VAR, default_value = privileged::DEFAULT_PATH)]
    pub socket_path: PathBuf,

    /// Log to a file instead of stdout (this process typically runs
    /// detached, unsupervised, under the system's service manager)
    #[arg(long)]
    pub log_file: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}
