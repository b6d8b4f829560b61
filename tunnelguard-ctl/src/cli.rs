use clap::{Parser, Subcommand};
use std::path::PathBuf;

use tunnelguard_lib::command::{self, Command as LibCommand};

/// TunnelGuard control interface for the tunnelguard daemon
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Socket path the daemon listens on
    #[arg(short, long, env = command::ENV_VAR, default_value = command::DEFAULT_PATH)]
    pub socket_path: PathBuf,

    /// Format output as json
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Liveness probe
    Ping,

    /// Query current engine status
    Status,

    /// Add (or replace) a domain rule
    AddRule {
        /// Domain pattern, e.g. `example.com` or `*.example.com`
        pattern: String,
        /// Route this pattern through the tunnel instead of direct
        #[arg(long)]
        tunnel: bool,
    },

    /// Remove a domain rule
    RemoveRule {
        /// Domain pattern previously added with `add-rule`
        pattern: String,
    },

    /// Replace the entire rule set from a JSON file
    LoadRules {
        /// Path to a JSON file containing an array of `{pattern, tunnel}` objects
        path: PathBuf,
    },

    /// List configured rules
    GetRules,

    /// List currently injected routes
    GetRoutes,

    /// List detected tunnel/direct conflicts
    GetConflicts,

    /// Start tunneling: applies system DNS redirection and launches the proxies
    Start,

    /// Stop tunneling: restores the system resolver and tears down the proxies
    Stop,
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("error reading rules file `{path}`: {error}")]
    ReadRulesFile { path: PathBuf, error: std::io::Error },
    #[error("error parsing rules file `{path}`: {error}")]
    ParseRulesFile { path: PathBuf, error: serde_json::Error },
}

impl Command {
    pub fn into_lib_command(self) -> Result<LibCommand, Error> {
        Ok(match self {
            Command::Ping => LibCommand::Ping,
            Command::Status => LibCommand::Status,
            Command::AddRule { pattern, tunnel } => LibCommand::AddRule { pattern, tunnel },
            Command::RemoveRule { pattern } => LibCommand::RemoveRule { pattern },
            Command::LoadRules { path } => {
                let content =
                    std::fs::read_to_string(&path).map_err(|error| Error::ReadRulesFile { path: path.clone(), error })?;
                let rules = serde_json::from_str(&content).map_err(|error| Error::ParseRulesFile { path, error })?;
                LibCommand::LoadRules { rules }
            }
            Command::GetRules => LibCommand::GetRules,
            Command::GetRoutes => LibCommand::GetRoutes,
            Command::GetConflicts => LibCommand::GetConflicts,
            Command::Start => LibCommand::Start,
            Command::Stop => LibCommand::Stop,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_add_rule_with_tunnel_flag() {
        let cli = Cli::try_parse_from(["tunnelguard-ctl", "add-rule", "example.com", "--tunnel"]).unwrap();
        match cli.command {
            Command::AddRule { pattern, tunnel } => {
                assert_eq!(pattern, "example.com");
                assert!(tunnel);
            }
            other => panic!("expected AddRule, got {other:?}"),
        }
    }

    #[test]
    fn parses_status_with_json_flag() {
        let cli = Cli::try_parse_from(["tunnelguard-ctl", "--json", "status"]).unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Command::Status));
    }

    #[test]
    fn converts_get_rules_into_lib_command() {
        let lib_command = Command::GetRules.into_lib_command().unwrap();
        assert!(matches!(lib_command, LibCommand::GetRules));
    }
}
