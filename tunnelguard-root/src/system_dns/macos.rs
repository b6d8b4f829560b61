//! macOS system DNS adapter: resolver set per network service via
//! `networksetup`, redirection via a PF anchor (spec §6's exact `rdr pass`
//! rule text), cache flush via the resolver-cache daemon.

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use tunnelguard_lib::shell_command_ext::{Logs, ShellCommandExt};
use tunnelguard_lib::system_dns::{Backup, Error};

const ANCHOR_NAME: &str = "tunnelguard";
const PLATFORM: &str = "macos";

#[derive(Debug, Serialize, Deserialize)]
struct ServiceDns {
    service: String,
    original: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MacosBackup {
    services: Vec<ServiceDns>,
}

pub struct MacosDns;

impl MacosDns {
    pub fn new() -> Self {
        MacosDns
    }

    async fn list_services(&self) -> Result<Vec<String>, Error> {
        let output = Command::new("networksetup")
            .arg("-listallnetworkservices")
            .run_stdout(Logs::Suppress)
            .await
            .map_err(|error| Error::CommandFailed(error.to_string()))?;
        Ok(output
            .lines()
            .skip(1) // first line is an explanatory header, not a service name
            .filter(|line| !line.starts_with('*')) // an asterisk prefix marks a disabled service
            .map(|line| line.to_string())
            .collect())
    }

    async fn current_dns(&self, service: &str) -> Result<Option<Vec<String>>, Error> {
        let output = Command::new("networksetup")
            .arg("-getdnsservers")
            .arg(service)
            .run_stdout(Logs::Suppress)
            .await
            .map_err(|error| Error::CommandFailed(error.to_string()))?;
        if output.contains("aren't any DNS Servers") {
            Ok(None)
        } else {
            Ok(Some(output.lines().map(|line| line.to_string()).collect()))
        }
    }

    async fn set_dns(&self, service: &str, servers: &[&str]) -> Result<(), Error> {
        let mut command = Command::new("networksetup");
        command.arg("-setdnsservers").arg(service);
        if servers.is_empty() {
            command.arg("Empty");
        } else {
            for server in servers {
                command.arg(server);
            }
        }
        command.run(Logs::Print).await.map_err(|error| Error::CommandFailed(error.to_string()))
    }

    async fn flush_cache(&self) {
        let _ = Command::new("dscacheutil").arg("-flushcache").run(Logs::Suppress).await;
        let _ = Command::new("killall").arg("-HUP").arg("mDNSResponder").run(Logs::Suppress).await;
    }

    async fn install_anchor(&self, proxy_port: u16) -> Result<(), Error> {
        let rules = format!(
            "rdr pass on lo0 inet proto udp from any to 127.0.0.1 port 53 -> 127.0.0.1 port {proxy_port}\n\
             rdr pass on lo0 inet proto tcp from any to 127.0.0.1 port 53 -> 127.0.0.1 port {proxy_port}\n"
        );

        let file = tempfile::NamedTempFile::new().map_err(|error| Error::CommandFailed(error.to_string()))?;
        tokio::fs::write(file.path(), rules.as_bytes()).await.map_err(|error| Error::CommandFailed(error.to_string()))?;

        Command::new("pfctl")
            .arg("-a")
            .arg(ANCHOR_NAME)
            .arg("-f")
            .arg(file.path())
            .run(Logs::Print)
            .await
            .map_err(|error| Error::CommandFailed(error.to_string()))?;

        Command::new("pfctl").arg("-e").run(Logs::Suppress).await.ok();
        Ok(())
    }

    async fn flush_anchor(&self) -> Result<(), Error> {
        Command::new("pfctl")
            .args(["-a", ANCHOR_NAME, "-F", "all"])
            .run(Logs::Print)
            .await
            .map_err(|error| Error::CommandFailed(error.to_string()))
    }
}

impl Default for MacosDns {
    fn default() -> Self {
        Self::new()
    }
}

impl MacosDns {
    pub async fn configure(&self, proxy_port: u16) -> Result<Backup, Error> {
        let services = self.list_services().await?;
        let mut backups = Vec::with_capacity(services.len());
        for service in &services {
            let original = self.current_dns(service).await?;
            backups.push(ServiceDns { service: service.clone(), original });
            self.set_dns(service, &["127.0.0.1"]).await?;
        }

        if let Err(error) = self.install_anchor(proxy_port).await {
            // best-effort rollback so a partial configure doesn't leave DNS
            // pointed at a proxy that was never actually redirected
            for backup in &backups {
                let servers: Vec<&str> = backup.original.as_deref().unwrap_or(&[]).iter().map(String::as_str).collect();
                let _ = self.set_dns(&backup.service, &servers).await;
            }
            return Err(error);
        }

        self.flush_cache().await;

        let payload = serde_json::to_value(MacosBackup { services: backups }).expect("backup always serializes");
        Ok(Backup { platform: PLATFORM.to_string(), payload })
    }

    pub async fn restore(&self, backup: &Backup) -> Result<(), Error> {
        let restore_result = self.flush_anchor().await;

        let macos_backup: MacosBackup =
            serde_json::from_value(backup.payload.clone()).map_err(|error| Error::CommandFailed(error.to_string()))?;
        for service in macos_backup.services {
            let servers: Vec<&str> = service.original.as_deref().unwrap_or(&[]).iter().map(String::as_str).collect();
            self.set_dns(&service.service, &servers).await?;
        }

        self.flush_cache().await;
        restore_result
    }

    pub async fn check_for_stale_config(&self, backup: &Backup) -> Result<bool, Error> {
        let macos_backup: MacosBackup =
            serde_json::from_value(backup.payload.clone()).map_err(|error| Error::CommandFailed(error.to_string()))?;
        for service in &macos_backup.services {
            if let Some(current) = self.current_dns(&service.service).await? {
                if current.iter().any(|dns| dns == "127.0.0.1") {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchor_rule_text_matches_the_expected_shape() {
        let proxy_port = 5353;
        let rules = format!(
            "rdr pass on lo0 inet proto udp from any to 127.0.0.1 port 53 -> 127.0.0.1 port {proxy_port}\n\
             rdr pass on lo0 inet proto tcp from any to 127.0.0.1 port 53 -> 127.0.0.1 port {proxy_port}\n"
        );
        assert!(rules.contains("rdr pass on lo0 inet proto udp from any to 127.0.0.1 port 53 -> 127.0.0.1 port 5353"));
        assert!(rules.contains("rdr pass on lo0 inet proto tcp from any to 127.0.0.1 port 53 -> 127.0.0.1 port 5353"));
    }

    #[test]
    fn backup_round_trips_through_json() {
        let backup = MacosBackup {
            services: vec![ServiceDns { service: "Wi-Fi".to_string(), original: Some(vec!["8.8.8.8".to_string()]) }],
        };
        let value = serde_json::to_value(&backup).unwrap();
        let round_tripped: MacosBackup = serde_json::from_value(value).unwrap();
        assert_eq!(round_tripped.services[0].service, "Wi-Fi");
    }
}
