//! Route manager: maintains the set of injected `ip/32`s in the VPN peer's
//! allowed-ips, with TTL-driven expiry (component D).

use cidr::Ipv4Cidr;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::conflict::ConflictDetector;
use crate::vpn::{self, VpnAdapter};

pub const DEFAULT_ROUTE_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum Error {
    #[error("route manager already started")]
    AlreadyStarted,
    #[error(transparent)]
    Vpn(#[from] vpn::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InjectedRoute {
    pub ip_cidr: Ipv4Cidr,
    pub domain: String,
    #[serde(with = "humantime_serde")]
    pub t_injected: SystemTime,
    pub ttl_secs: u64,
    #[serde(with = "humantime_serde")]
    pub t_expires: SystemTime,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    Conflict,
    OriginalAllowedIp,
    OwnedByOtherDomain,
}

#[derive(Clone, Debug, Default)]
pub struct InjectOutcome {
    pub injected: Vec<Ipv4Addr>,
    pub refreshed: Vec<Ipv4Addr>,
    pub skipped: Vec<(Ipv4Addr, SkipReason)>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stats {
    pub tracked_routes: usize,
}

fn to_cidr(ip: Ipv4Addr) -> Ipv4Cidr {
    Ipv4Cidr::new(ip, 32).expect("/32 is always a valid cidr length")
}

struct Inner {
    routes: HashMap<Ipv4Addr, InjectedRoute>,
    domain_index: HashMap<String, HashSet<Ipv4Addr>>,
    original_allowed_ips: HashSet<Ipv4Addr>,
}

pub struct RouteManager {
    state: Mutex<Inner>,
    conflicts: Arc<ConflictDetector>,
    vpn: Arc<dyn VpnAdapter>,
    default_ttl: Duration,
    cleanup_interval: Duration,
    cleanup_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RouteManager {
    pub fn new(conflicts: Arc<ConflictDetector>, vpn: Arc<dyn VpnAdapter>) -> Arc<Self> {
        Arc::new(RouteManager {
            state: Mutex::new(Inner { routes: HashMap::new(), domain_index: HashMap::new(), original_allowed_ips: HashSet::new() }),
            conflicts,
            vpn,
            default_ttl: DEFAULT_ROUTE_TTL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            cleanup_task: std::sync::Mutex::new(None),
        })
    }

    /// Captures the original allowed-ips snapshot and begins the cleanup
    /// tick. Must be called once before `inject`.
    pub async fn start(self: &Arc<Self>) -> Result<(), Error> {
        if self.cleanup_task.lock().expect("cleanup task lock poisoned").is_some() {
            return Err(Error::AlreadyStarted);
        }

        let original: Vec<Ipv4Addr> = self.vpn.get_allowed_ips().await?.into_iter().map(|c| c.first_address()).collect();
        {
            let mut state = self.state.lock().await;
            state.original_allowed_ips = original.into_iter().collect();
        }

        let manager = self.clone();
        let interval = self.cleanup_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(error) = manager.cleanup_expired().await {
                    tracing::error!(%error, "route cleanup tick failed");
                }
            }
        });

        let mut guard = self.cleanup_task.lock().expect("cleanup task lock poisoned");
        if guard.is_some() {
            handle.abort();
            return Err(Error::AlreadyStarted);
        }
        *guard = Some(handle);
        Ok(())
    }

    /// Removes every tracked route and cancels the cleanup tick.
    pub async fn stop(self: &Arc<Self>) -> Result<(), Error> {
        if let Some(handle) = self.cleanup_task.lock().expect("cleanup task lock poisoned").take() {
            handle.abort();
        }

        let mut state = self.state.lock().await;
        let ips: Vec<Ipv4Addr> = state.routes.keys().copied().collect();
        let result = self.remove_from_vpn(&ips).await;
        state.routes.clear();
        state.domain_index.clear();
        result?;
        Ok(())
    }

    pub async fn inject(&self, domain: &str, ips: &[Ipv4Addr], ttl: Duration) -> Result<InjectOutcome, Error> {
        let mut state = self.state.lock().await;
        let mut outcome = InjectOutcome::default();
        let mut buffer = Vec::new();
        let now = SystemTime::now();

        for &ip in ips {
            if self.conflicts.has_conflict(ip) {
                outcome.skipped.push((ip, SkipReason::Conflict));
                continue;
            }
            if state.original_allowed_ips.contains(&ip) {
                outcome.skipped.push((ip, SkipReason::OriginalAllowedIp));
                continue;
            }
            if let Some(existing) = state.routes.get_mut(&ip) {
                if existing.domain == domain {
                    existing.ttl_secs = ttl.as_secs();
                    existing.t_expires = now + ttl;
                    outcome.refreshed.push(ip);
                } else {
                    outcome.skipped.push((ip, SkipReason::OwnedByOtherDomain));
                }
                continue;
            }

            buffer.push(ip);
            state.routes.insert(
                ip,
                InjectedRoute { ip_cidr: to_cidr(ip), domain: domain.to_string(), t_injected: now, ttl_secs: ttl.as_secs(), t_expires: now + ttl },
            );
            state.domain_index.entry(domain.to_string()).or_default().insert(ip);
        }

        if !buffer.is_empty() {
            let cidrs: Vec<Ipv4Cidr> = buffer.iter().copied().map(to_cidr).collect();
            if let Err(error) = self.vpn.add_allowed_ips(&cidrs).await {
                for ip in &buffer {
                    state.routes.remove(ip);
                    if let Some(set) = state.domain_index.get_mut(domain) {
                        set.remove(ip);
                    }
                }
                return Err(error.into());
            }
            tracing::info!(domain, ips = ?buffer, "routes injected");
            outcome.injected = buffer;
        }

        Ok(outcome)
    }

    pub async fn remove_for_domain(&self, name: &str) -> Result<Vec<Ipv4Addr>, Error> {
        let mut state = self.state.lock().await;
        let ips: Vec<Ipv4Addr> = state.domain_index.get(name).map(|s| s.iter().copied().collect()).unwrap_or_default();
        if ips.is_empty() {
            return Ok(ips);
        }
        self.remove_from_vpn(&ips).await?;
        for ip in &ips {
            state.routes.remove(ip);
        }
        state.domain_index.remove(name);
        tracing::info!(domain = name, ips = ?ips, "routes removed");
        Ok(ips)
    }

    pub async fn remove(&self, ip: Ipv4Addr) -> Result<bool, Error> {
        let mut state = self.state.lock().await;
        if !state.routes.contains_key(&ip) {
            return Ok(false);
        }
        self.remove_from_vpn(&[ip]).await?;
        if let Some(route) = state.routes.remove(&ip) {
            if let Some(set) = state.domain_index.get_mut(&route.domain) {
                set.remove(&ip);
            }
        }
        Ok(true)
    }

    pub async fn clear_all(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let ips: Vec<Ipv4Addr> = state.routes.keys().copied().collect();
        self.remove_from_vpn(&ips).await?;
        state.routes.clear();
        state.domain_index.clear();
        tracing::info!(count = ips.len(), "routes cleared");
        Ok(())
    }

    /// Batch-removes every route whose ttl has elapsed. Individual failures
    /// are logged and the ip remains tracked for the next tick.
    pub async fn cleanup_expired(&self) -> Result<Vec<Ipv4Addr>, Error> {
        let mut state = self.state.lock().await;
        let now = SystemTime::now();
        let expired: Vec<Ipv4Addr> = state.routes.iter().filter(|(_, r)| r.t_expires < now).map(|(ip, _)| *ip).collect();
        if expired.is_empty() {
            return Ok(expired);
        }

        match self.remove_from_vpn(&expired).await {
            Ok(()) => {
                for ip in &expired {
                    if let Some(route) = state.routes.remove(ip) {
                        if let Some(set) = state.domain_index.get_mut(&route.domain) {
                            set.remove(ip);
                        }
                    }
                }
                tracing::info!(count = expired.len(), ips = ?expired, "routes expired");
                Ok(expired)
            }
            Err(error) => {
                tracing::error!(%error, ips = ?expired, "failed to remove expired routes, will retry next tick");
                Ok(Vec::new())
            }
        }
    }

    pub async fn get_routes(&self) -> Vec<InjectedRoute> {
        self.state.lock().await.routes.values().cloned().collect()
    }

    pub async fn get_for_domain(&self, name: &str) -> Vec<InjectedRoute> {
        let state = self.state.lock().await;
        state
            .domain_index
            .get(name)
            .map(|ips| ips.iter().filter_map(|ip| state.routes.get(ip).cloned()).collect())
            .unwrap_or_default()
    }

    pub async fn has_for_domain(&self, name: &str) -> bool {
        self.state.lock().await.domain_index.get(name).is_some_and(|s| !s.is_empty())
    }

    pub async fn stats(&self) -> Stats {
        Stats { tracked_routes: self.state.lock().await.routes.len() }
    }

    /// Idempotently removes `ips` from the VPN peer's allowed-ips,
    /// substituting the sentinel if the resulting set would be empty.
    async fn remove_from_vpn(&self, ips: &[Ipv4Addr]) -> Result<(), vpn::Error> {
        if ips.is_empty() {
            return Ok(());
        }
        let cidrs: Vec<Ipv4Cidr> = ips.iter().copied().map(to_cidr).collect();
        self.vpn.remove_allowed_ips(&cidrs).await?;

        let remaining = self.vpn.get_allowed_ips().await?;
        if remaining.is_empty() {
            self.vpn.add_allowed_ips(&[vpn::sentinel_cidr()]).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpn::{Error as VpnError, Interface, InterfaceConfig, TunnelStatus};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockVpnState {
        allowed_ips: Vec<Ipv4Cidr>,
        fail_add: bool,
        fail_remove: bool,
    }

    struct MockVpn {
        state: StdMutex<MockVpnState>,
    }

    impl MockVpn {
        fn new() -> Arc<Self> {
            Arc::new(MockVpn { state: StdMutex::new(MockVpnState::default()) })
        }
    }

    #[async_trait::async_trait]
    impl VpnAdapter for MockVpn {
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
            Ok(self.state.lock().unwrap().allowed_ips.clone())
        }
        async fn add_allowed_ips(&self, ips: &[Ipv4Cidr]) -> Result<(), VpnError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_add {
                return Err(VpnError::CommandFailed("forced failure".into()));
            }
            for ip in ips {
                if !state.allowed_ips.contains(ip) {
                    state.allowed_ips.push(*ip);
                }
            }
            Ok(())
        }
        async fn remove_allowed_ips(&self, ips: &[Ipv4Cidr]) -> Result<(), VpnError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_remove {
                return Err(VpnError::CommandFailed("forced failure".into()));
            }
            state.allowed_ips.retain(|existing| !ips.contains(existing));
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

    fn ip(n: u8) -> Ipv4Addr {
        Ipv4Addr::new(93, 184, 216, n)
    }

    #[tokio::test]
    async fn inject_adds_a_route_and_calls_the_vpn_adapter() {
        let vpn = MockVpn::new();
        let detector = Arc::new(ConflictDetector::default());
        let manager = RouteManager::new(detector, vpn.clone());
        manager.start().await.unwrap();

        let outcome = manager.inject("example.com", &[ip(1)], Duration::from_secs(60)).await.unwrap();
        assert_eq!(outcome.injected, vec![ip(1)]);
        assert!(vpn.state.lock().unwrap().allowed_ips.contains(&to_cidr(ip(1))));
    }

    #[tokio::test]
    async fn inject_is_idempotent_for_the_same_domain() {
        let vpn = MockVpn::new();
        let detector = Arc::new(ConflictDetector::default());
        let manager = RouteManager::new(detector, vpn.clone());
        manager.start().await.unwrap();

        manager.inject("example.com", &[ip(1)], Duration::from_secs(60)).await.unwrap();
        let second = manager.inject("example.com", &[ip(1)], Duration::from_secs(60)).await.unwrap();

        assert!(second.injected.is_empty());
        assert_eq!(second.refreshed, vec![ip(1)]);
        assert_eq!(manager.get_routes().await.len(), 1);
    }

    #[tokio::test]
    async fn inject_skips_ips_with_an_active_conflict() {
        let vpn = MockVpn::new();
        let detector = Arc::new(ConflictDetector::default());
        detector.record("tunnel.test", ip(1), true);
        detector.record("direct.test", ip(1), false);

        let manager = RouteManager::new(detector, vpn);
        manager.start().await.unwrap();

        let outcome = manager.inject("tunnel.test", &[ip(1)], Duration::from_secs(60)).await.unwrap();
        assert_eq!(outcome.skipped, vec![(ip(1), SkipReason::Conflict)]);
        assert!(manager.get_routes().await.is_empty());
    }

    #[tokio::test]
    async fn inject_never_tracks_an_ip_from_the_original_snapshot() {
        let vpn = MockVpn::new();
        vpn.state.lock().unwrap().allowed_ips.push(to_cidr(ip(9)));
        let detector = Arc::new(ConflictDetector::default());
        let manager = RouteManager::new(detector, vpn);
        manager.start().await.unwrap();

        let outcome = manager.inject("example.com", &[ip(9)], Duration::from_secs(60)).await.unwrap();
        assert_eq!(outcome.skipped, vec![(ip(9), SkipReason::OriginalAllowedIp)]);
    }

    #[tokio::test]
    async fn inject_rolls_back_provisional_state_on_vpn_failure() {
        let vpn = MockVpn::new();
        vpn.state.lock().unwrap().fail_add = true;
        let detector = Arc::new(ConflictDetector::default());
        let manager = RouteManager::new(detector, vpn);
        manager.start().await.unwrap();

        let result = manager.inject("example.com", &[ip(1)], Duration::from_secs(60)).await;
        assert!(result.is_err());
        assert!(manager.get_routes().await.is_empty());
    }

    #[tokio::test]
    async fn cleanup_expired_removes_routes_past_their_ttl() {
        let vpn = MockVpn::new();
        let detector = Arc::new(ConflictDetector::default());
        let manager = RouteManager::new(detector, vpn.clone());
        manager.start().await.unwrap();

        manager.inject("example.com", &[ip(1)], Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let expired = manager.cleanup_expired().await.unwrap();
        assert_eq!(expired, vec![ip(1)]);
        assert!(manager.get_routes().await.is_empty());
        assert!(!vpn.state.lock().unwrap().allowed_ips.contains(&to_cidr(ip(1))));
    }

    #[tokio::test]
    async fn stop_removes_every_tracked_route() {
        let vpn = MockVpn::new();
        let detector = Arc::new(ConflictDetector::default());
        let manager = RouteManager::new(detector, vpn.clone());
        manager.start().await.unwrap();
        manager.inject("example.com", &[ip(1), ip(2)], Duration::from_secs(60)).await.unwrap();

        manager.stop().await.unwrap();
        assert!(manager.get_routes().await.is_empty());
    }
}
