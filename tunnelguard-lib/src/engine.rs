//! Top-level composition root: wires the domain matcher, conflict detector,
//! route manager, DNS proxy and SNI proxy into the one `Engine` value the
//! daemon owns (spec §9 design notes: "explicit composition ... owned by a
//! top-level `Engine` value").

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::command::{Command, Response, StatusResponse};
use crate::conflict::{self, ConflictDetector};
use crate::config::{self, Config};
use crate::dns::{self, DnsProxy, DnsProxyConfig};
use crate::domain::Matcher;
use crate::privileged::PrivilegedClient;
use crate::route::{self, RouteManager};
use crate::sni::{self, SniProxy};
use crate::system_dns::{self, SystemDnsAdapter};
use crate::vpn::VpnAdapter;

#[derive(Debug, Error)]
pub enum Error {
    #[error("engine already running")]
    AlreadyRunning,
    #[error("engine is not running")]
    NotRunning,
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error(transparent)]
    Route(#[from] route::Error),
    #[error(transparent)]
    Dns(#[from] dns::Error),
    #[error(transparent)]
    Sni(#[from] sni::Error),
    #[error(transparent)]
    SystemDns(#[from] system_dns::Error),
}

struct Tasks {
    dns: JoinHandle<()>,
    sni: JoinHandle<()>,
    conflict_cleanup: JoinHandle<()>,
}

struct Running {
    tasks: Tasks,
    dns_backup: system_dns::Backup,
}

struct State {
    config: Config,
    running: Option<Running>,
}

pub struct Engine {
    config_path: PathBuf,
    matcher: Matcher,
    conflicts: Arc<ConflictDetector>,
    routes: Arc<RouteManager>,
    dns_proxy: Arc<DnsProxy>,
    sni_proxy: Arc<SniProxy>,
    system_dns: Arc<dyn SystemDnsAdapter>,
    state: Mutex<State>,
}

impl Engine {
    /// Reads the persisted config (or falls back to defaults on a missing
    /// file) and composes every component. Does not start network I/O or
    /// touch the system resolver — call [`Engine::start`] for that.
    ///
    /// `vpn_socks_override`, when set, takes precedence over whatever is
    /// persisted in the config file (a `--vpn-socks-addr` CLI flag, say) and
    /// is written back so it survives the next restart.
    pub async fn init(config_path: &Path, root_socket_path: &Path, vpn_socks_override: Option<SocketAddr>) -> Result<Arc<Self>, Error> {
        let mut config = match config::read(config_path).await {
            Ok(config) => config,
            Err(config::Error::NoFile) => {
                tracing::info!(path = %config_path.display(), "no configuration file found, starting with defaults");
                Config::default()
            }
            Err(error) => return Err(error.into()),
        };

        if let Some(addr) = vpn_socks_override {
            config.vpn_socks = Some(addr);
        }

        let privileged = Arc::new(PrivilegedClient::new(root_socket_path));
        let vpn: Arc<dyn VpnAdapter> = privileged.clone();
        let system_dns: Arc<dyn SystemDnsAdapter> = privileged;

        Self::from_parts(config_path, config, vpn, system_dns)
    }

    /// Composes an `Engine` from already-constructed adapters. Split out of
    /// [`Engine::init`] so tests can substitute mock adapters instead of a
    /// real `tunnelguard-root` connection.
    fn from_parts(
        config_path: &Path,
        config: Config,
        vpn: Arc<dyn VpnAdapter>,
        system_dns: Arc<dyn SystemDnsAdapter>,
    ) -> Result<Arc<Self>, Error> {
        let matcher = Matcher::new();
        matcher.load(config.rules.clone());

        let conflicts = Arc::new(ConflictDetector::default());
        let routes = RouteManager::new(conflicts.clone(), vpn);

        let dns_listen: SocketAddr = (std::net::Ipv4Addr::LOCALHOST, config.dns_proxy_port).into();
        let dns_proxy = DnsProxy::new(
            matcher.clone(),
            conflicts.clone(),
            routes.clone(),
            DnsProxyConfig {
                listen_addr: dns_listen,
                tunnel_upstream: config.tunnel_upstream,
                direct_upstream: config.direct_upstream,
                route_ttl: route::DEFAULT_ROUTE_TTL,
            },
        );

        let sni_listen: SocketAddr = (std::net::Ipv4Addr::LOCALHOST, config.socks_port).into();
        let sni_proxy = SniProxy::new(matcher.clone(), sni_listen, config.vpn_socks);

        Ok(Arc::new(Engine {
            config_path: config_path.to_path_buf(),
            matcher,
            conflicts,
            routes,
            dns_proxy,
            sni_proxy,
            system_dns,
            state: Mutex::new(State { config, running: None }),
        }))
    }

    /// Applies system DNS redirection, starts the route manager's cleanup
    /// tick and the conflict detector's own mapping-expiry tick, and spawns
    /// the DNS and SNI proxy tasks.
    pub async fn start(self: &Arc<Self>) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        if state.running.is_some() {
            return Err(Error::AlreadyRunning);
        }

        if let Some(backup) = state.config.dns_backup.clone() {
            if let Ok(backup) = serde_json::from_value::<system_dns::Backup>(backup) {
                if self.system_dns.check_for_stale_config(&backup).await.unwrap_or(false) {
                    tracing::warn!("found stale dns redirection from a prior run, restoring before continuing");
                    let _ = self.system_dns.restore(&backup).await;
                }
            }
        }

        let backup = self.system_dns.configure(state.config.dns_proxy_port).await?;
        self.routes.start().await?;

        let dns_proxy = self.dns_proxy.clone();
        let dns_task = tokio::spawn(async move {
            if let Err(error) = dns_proxy.run().await {
                tracing::error!(%error, "dns proxy task exited with an error");
            }
        });

        let sni_proxy = self.sni_proxy.clone();
        let sni_task = tokio::spawn(async move {
            if let Err(error) = sni_proxy.run().await {
                tracing::error!(%error, "sni proxy task exited with an error");
            }
        });

        let conflicts = self.conflicts.clone();
        let conflict_cleanup_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(conflict::DEFAULT_CLEANUP_INTERVAL);
            loop {
                ticker.tick().await;
                conflicts.cleanup();
            }
        });

        state.config.dns_backup = Some(serde_json::to_value(&backup).expect("backup always serializes"));
        state.config.last_active = Some(SystemTime::now());
        let config = state.config.clone();
        state.running =
            Some(Running { tasks: Tasks { dns: dns_task, sni: sni_task, conflict_cleanup: conflict_cleanup_task }, dns_backup: backup });
        drop(state);

        if let Err(error) = config::write(&self.config_path, &config).await {
            tracing::warn!(%error, "failed persisting config after start");
        }
        Ok(())
    }

    /// Tears down everything `start` set up, restoring the system resolver
    /// unconditionally (spec §5: "`stop()` on F runs `restore()`
    /// unconditionally").
    pub async fn stop(self: &Arc<Self>) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let Some(running) = state.running.take() else {
            return Err(Error::NotRunning);
        };

        self.dns_proxy.stop();
        self.sni_proxy.stop();
        running.tasks.dns.abort();
        running.tasks.sni.abort();
        running.tasks.conflict_cleanup.abort();

        if let Err(error) = self.routes.stop().await {
            tracing::error!(%error, "error removing tracked routes on stop");
        }

        let restore_result = self.system_dns.restore(&running.dns_backup).await;

        state.config.dns_backup = None;
        let config = state.config.clone();
        drop(state);

        if let Err(error) = config::write(&self.config_path, &config).await {
            tracing::warn!(%error, "failed persisting config after stop");
        }

        restore_result.map_err(Error::from)
    }

    pub async fn handle_cmd(self: &Arc<Self>, cmd: Command) -> Response {
        match cmd {
            Command::Ping => Response::Pong,
            Command::Status => Response::Status(self.status().await),
            Command::AddRule { pattern, tunnel } => match self.matcher.add(&pattern, tunnel) {
                Ok(()) => {
                    self.persist_rules().await;
                    Response::Ack
                }
                Err(error) => Response::Error(error.to_string()),
            },
            Command::RemoveRule { pattern } => {
                let removed = self.matcher.remove(&pattern);
                self.persist_rules().await;
                if removed { Response::Ack } else { Response::Error(format!("no such rule: {pattern}")) }
            }
            Command::LoadRules { rules } => {
                self.matcher.load(rules);
                self.persist_rules().await;
                Response::Ack
            }
            Command::GetRules => Response::Rules(self.matcher.get_rules()),
            Command::GetRoutes => Response::Routes(self.routes.get_routes().await),
            Command::GetConflicts => Response::Conflicts(self.conflicts.get_conflicts()),
            Command::Start => match self.start().await {
                Ok(()) => Response::Ack,
                Err(error) => Response::Error(error.to_string()),
            },
            Command::Stop => match self.stop().await {
                Ok(()) => Response::Ack,
                Err(error) => Response::Error(error.to_string()),
            },
        }
    }

    async fn status(&self) -> StatusResponse {
        let running = self.state.lock().await.running.is_some();
        StatusResponse {
            running,
            rule_count: self.matcher.get_rules().len(),
            active_route_count: self.routes.stats().await.tracked_routes,
            conflict_stats: self.conflicts.stats(),
        }
    }

    async fn persist_rules(&self) {
        let config = {
            let mut state = self.state.lock().await;
            state.config.rules = self.matcher.get_rules();
            state.config.clone()
        };
        if let Err(error) = config::write(&self.config_path, &config).await {
            tracing::warn!(%error, "failed persisting config after rule mutation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpn::{Error as VpnError, Interface, InterfaceConfig, TunnelStatus};
    use cidr::Ipv4Cidr;

    struct NoopVpn;

    #[async_trait::async_trait]
    impl VpnAdapter for NoopVpn {
        async fn list_interfaces(&self) -> Result<Vec<Interface>, VpnError> {
            Ok(vec![])
        }
        async fn get_interface(&self, _name: &str) -> Result<Option<Interface>, VpnError> {
            Ok(None)
        }
        async fn set_config(&self, _config: InterfaceConfig) -> Result<(), VpnError> {
            Ok(())
        }
        async fn get_allowed_ips(&self) -> Result<Vec<Ipv4Cidr>, VpnError> {
            Ok(vec![])
        }
        async fn add_allowed_ips(&self, _ips: &[Ipv4Cidr]) -> Result<(), VpnError> {
            Ok(())
        }
        async fn remove_allowed_ips(&self, _ips: &[Ipv4Cidr]) -> Result<(), VpnError> {
            Ok(())
        }
        async fn is_available(&self) -> bool {
            true
        }
        async fn is_active(&self) -> bool {
            true
        }
        async fn detect_tunnels(&self) -> TunnelStatus {
            TunnelStatus::NativeAvailable
        }
    }

    struct NoopSystemDns;

    #[async_trait::async_trait]
    impl SystemDnsAdapter for NoopSystemDns {
        async fn configure(&self, _proxy_port: u16) -> Result<system_dns::Backup, system_dns::Error> {
            Ok(system_dns::Backup { platform: "test".to_string(), payload: serde_json::Value::Null })
        }
        async fn restore(&self, _backup: &system_dns::Backup) -> Result<(), system_dns::Error> {
            Ok(())
        }
        async fn check_for_stale_config(&self, _backup: &system_dns::Backup) -> Result<bool, system_dns::Error> {
            Ok(false)
        }
    }

    fn test_engine(config_path: &Path) -> Arc<Engine> {
        Engine::from_parts(config_path, Config::default(), Arc::new(NoopVpn), Arc::new(NoopSystemDns)).unwrap()
    }

    #[tokio::test]
    async fn add_rule_is_reflected_in_get_rules_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        let engine = test_engine(&config_path);

        let resp = engine.handle_cmd(Command::AddRule { pattern: "example.com".to_string(), tunnel: true }).await;
        assert!(matches!(resp, Response::Ack));

        let resp = engine.handle_cmd(Command::GetRules).await;
        let Response::Rules(rules) = resp else { panic!("expected Rules response") };
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].pattern, "example.com");

        let persisted = config::read(&config_path).await.unwrap();
        assert_eq!(persisted.rules.len(), 1);
    }

    #[tokio::test]
    async fn invalid_pattern_is_reported_as_an_error_response() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        let engine = test_engine(&config_path);

        let resp = engine.handle_cmd(Command::AddRule { pattern: "*.*.bad".to_string(), tunnel: true }).await;
        assert!(matches!(resp, Response::Error(_)));
    }

    #[tokio::test]
    async fn start_then_stop_round_trips_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        // pick high, unlikely-to-collide ports so the test doesn't need root or
        // fight over well-known ports
        let mut config = Config::default();
        config.dns_proxy_port = 45353;
        config.socks_port = 41080;
        let engine = Engine::from_parts(&config_path, config, Arc::new(NoopVpn), Arc::new(NoopSystemDns)).unwrap();

        let resp = engine.handle_cmd(Command::Start).await;
        assert!(matches!(resp, Response::Ack), "{resp:?}");

        let resp = engine.handle_cmd(Command::Status).await;
        let Response::Status(status) = resp else { panic!("expected Status response") };
        assert!(status.running);

        let resp = engine.handle_cmd(Command::Stop).await;
        assert!(matches!(resp, Response::Ack), "{resp:?}");
    }

    #[tokio::test]
    async fn ping_replies_pong() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        let engine = test_engine(&config_path);
        assert!(matches!(engine.handle_cmd(Command::Ping).await, Response::Pong));
    }
}
