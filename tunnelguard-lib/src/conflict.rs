//! Conflict detector: tracks which IPs have recently served both
//! tunnel-classified and direct-classified domain names.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_MAPPING_TTL: Duration = Duration::from_secs(300);
/// How often `Engine::start`'s background tick calls `cleanup()`, mirroring
/// `route::DEFAULT_CLEANUP_INTERVAL`.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
struct MappingEntry {
    domain: String,
    tunnel: bool,
    t_observed: Instant,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conflict {
    pub ip: Ipv4Addr,
    pub tunnel_domains: Vec<String>,
    pub direct_domains: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub t_detected: std::time::SystemTime,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stats {
    pub tracked_ips: usize,
    pub tracked_domains: usize,
    pub active_conflicts: usize,
}

/// Emitted on `record`/`cleanup` transitions; forwarded onto the engine's
/// event channel by the caller.
#[derive(Clone, Debug)]
pub enum ConflictEvent {
    Detected(Conflict),
    Resolved(Ipv4Addr),
}

struct State {
    mappings: HashMap<Ipv4Addr, Vec<MappingEntry>>,
    domains: HashMap<String, HashSet<Ipv4Addr>>,
    conflicts: HashMap<Ipv4Addr, Conflict>,
}

pub struct ConflictDetector {
    state: Mutex<State>,
    ttl: Duration,
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MAPPING_TTL)
    }
}

impl ConflictDetector {
    pub fn new(ttl: Duration) -> Self {
        ConflictDetector {
            state: Mutex::new(State { mappings: HashMap::new(), domains: HashMap::new(), conflicts: HashMap::new() }),
            ttl,
        }
    }

    /// Records one (domain, ip) observation; returns any event raised as a
    /// consequence of re-evaluating that ip's conflict status.
    pub fn record(&self, domain: &str, ip: Ipv4Addr, tunnel: bool) -> Option<ConflictEvent> {
        let mut state = self.state.lock().expect("conflict detector lock poisoned");
        Self::insert(&mut state, domain, ip, tunnel);
        Self::reevaluate(&mut state, ip, self.ttl)
    }

    /// Records one domain resolving to several ips; returns the first
    /// conflict (if any) among them, for the caller's `route-injection`
    /// event.
    pub fn record_batch(&self, domain: &str, ips: &[Ipv4Addr], tunnel: bool) -> Option<Conflict> {
        let mut state = self.state.lock().expect("conflict detector lock poisoned");
        for &ip in ips {
            Self::insert(&mut state, domain, ip, tunnel);
            Self::reevaluate(&mut state, ip, self.ttl);
        }
        ips.iter().find_map(|ip| state.conflicts.get(ip).cloned())
    }

    pub fn has_conflict(&self, ip: Ipv4Addr) -> bool {
        self.state.lock().expect("conflict detector lock poisoned").conflicts.contains_key(&ip)
    }

    pub fn get_conflicts(&self) -> Vec<Conflict> {
        self.state.lock().expect("conflict detector lock poisoned").conflicts.values().cloned().collect()
    }

    /// Removes every mapping recorded for `name`, re-evaluating every ip
    /// that had been associated with it.
    pub fn remove_domain(&self, name: &str) -> Vec<ConflictEvent> {
        let mut state = self.state.lock().expect("conflict detector lock poisoned");
        let ips: Vec<Ipv4Addr> = state.domains.remove(name).map(|s| s.into_iter().collect()).unwrap_or_default();
        let mut events = Vec::new();
        for ip in ips {
            if let Some(mappings) = state.mappings.get_mut(&ip) {
                mappings.retain(|m| m.domain != name);
            }
            if let Some(event) = Self::reevaluate(&mut state, ip, self.ttl) {
                events.push(event);
            }
        }
        events
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().expect("conflict detector lock poisoned");
        state.mappings.clear();
        state.domains.clear();
        state.conflicts.clear();
    }

    /// Prunes stale mappings across every tracked ip and recomputes
    /// conflicts; drops domains with zero surviving ips.
    pub fn cleanup(&self) -> Vec<ConflictEvent> {
        let mut state = self.state.lock().expect("conflict detector lock poisoned");
        let ips: Vec<Ipv4Addr> = state.mappings.keys().copied().collect();
        let mut events = Vec::new();
        for ip in ips {
            if let Some(event) = Self::reevaluate(&mut state, ip, self.ttl) {
                events.push(event);
            }
        }
        state.domains.retain(|_, ips| !ips.is_empty());
        events
    }

    pub fn stats(&self) -> Stats {
        let state = self.state.lock().expect("conflict detector lock poisoned");
        Stats {
            tracked_ips: state.mappings.len(),
            tracked_domains: state.domains.len(),
            active_conflicts: state.conflicts.len(),
        }
    }

    fn insert(state: &mut State, domain: &str, ip: Ipv4Addr, tunnel: bool) {
        let entries = state.mappings.entry(ip).or_default();
        entries.retain(|m| m.domain != domain);
        entries.push(MappingEntry { domain: domain.to_string(), tunnel, t_observed: Instant::now() });
        state.domains.entry(domain.to_string()).or_default().insert(ip);
    }

    fn reevaluate(state: &mut State, ip: Ipv4Addr, ttl: Duration) -> Option<ConflictEvent> {
        let now = Instant::now();
        let domains_before: HashSet<String> =
            state.mappings.get(&ip).map(|entries| entries.iter().map(|m| m.domain.clone()).collect()).unwrap_or_default();

        let fresh_remaining = match state.mappings.get_mut(&ip) {
            Some(entries) => {
                entries.retain(|m| now.duration_since(m.t_observed) <= ttl);
                !entries.is_empty()
            }
            None => false,
        };

        let domains_after: HashSet<String> = if fresh_remaining {
            state.mappings[&ip].iter().map(|m| m.domain.clone()).collect()
        } else {
            HashSet::new()
        };

        // a domain whose only mapping to this ip just went stale no longer
        // belongs in this ip's reverse index, even though the ip may still
        // be tracked overall (fresh entries for other domains survive it)
        for domain in domains_before.difference(&domains_after) {
            if let Some(ips) = state.domains.get_mut(domain) {
                ips.remove(&ip);
            }
        }

        if !fresh_remaining {
            state.mappings.remove(&ip);
            return if state.conflicts.remove(&ip).is_some() { Some(ConflictEvent::Resolved(ip)) } else { None };
        }

        let entries = &state.mappings[&ip];
        let mut tunnel_domains: Vec<String> = entries.iter().filter(|m| m.tunnel).map(|m| m.domain.clone()).collect();
        let mut direct_domains: Vec<String> = entries.iter().filter(|m| !m.tunnel).map(|m| m.domain.clone()).collect();
        tunnel_domains.sort();
        tunnel_domains.dedup();
        direct_domains.sort();
        direct_domains.dedup();

        if !tunnel_domains.is_empty() && !direct_domains.is_empty() {
            let already_conflicting = state.conflicts.contains_key(&ip);
            let t_detected = state.conflicts.get(&ip).map(|c| c.t_detected).unwrap_or_else(std::time::SystemTime::now);
            let conflict = Conflict { ip, tunnel_domains, direct_domains, t_detected };
            state.conflicts.insert(ip, conflict.clone());
            if already_conflicting { None } else { Some(ConflictEvent::Detected(conflict)) }
        } else if state.conflicts.remove(&ip).is_some() {
            Some(ConflictEvent::Resolved(ip))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(n: u8) -> Ipv4Addr {
        Ipv4Addr::new(198, 51, 100, n)
    }

    #[test]
    fn no_conflict_for_a_single_sided_ip() {
        let detector = ConflictDetector::default();
        detector.record("a.test", ip(1), true);
        assert!(!detector.has_conflict(ip(1)));
    }

    #[test]
    fn conflict_detected_when_both_sides_present() {
        let detector = ConflictDetector::default();
        detector.record("a.test", ip(1), true);
        let event = detector.record("b.test", ip(1), false);
        assert!(detector.has_conflict(ip(1)));
        assert!(matches!(event, Some(ConflictEvent::Detected(_))));
    }

    #[test]
    fn conflict_detected_is_emitted_only_once() {
        let detector = ConflictDetector::default();
        detector.record("a.test", ip(1), true);
        detector.record("b.test", ip(1), false);
        let event = detector.record("c.test", ip(1), false);
        assert!(event.is_none());
    }

    #[test]
    fn conflict_resolved_when_one_side_removed() {
        let detector = ConflictDetector::default();
        detector.record("a.test", ip(1), true);
        detector.record("b.test", ip(1), false);
        let events = detector.remove_domain("b.test");
        assert!(!detector.has_conflict(ip(1)));
        assert!(events.iter().any(|e| matches!(e, ConflictEvent::Resolved(i) if *i == ip(1))));
    }

    #[test]
    fn conflict_detection_is_symmetric_in_observation_order() {
        let a = ConflictDetector::default();
        a.record("a.test", ip(1), true);
        a.record("b.test", ip(1), false);

        let b = ConflictDetector::default();
        b.record("b.test", ip(1), false);
        b.record("a.test", ip(1), true);

        assert_eq!(a.get_conflicts(), b.get_conflicts());
    }

    #[test]
    fn duplicate_domains_on_a_side_are_deduplicated() {
        let detector = ConflictDetector::default();
        detector.record("a.test", ip(1), true);
        detector.record("a.test", ip(1), true);
        detector.record("b.test", ip(1), false);

        let conflict = detector.get_conflicts().into_iter().next().unwrap();
        assert_eq!(conflict.tunnel_domains, vec!["a.test".to_string()]);
    }

    #[test]
    fn stale_mappings_are_pruned_on_cleanup() {
        let detector = ConflictDetector::new(Duration::from_millis(1));
        detector.record("a.test", ip(1), true);
        detector.record("b.test", ip(1), false);
        std::thread::sleep(Duration::from_millis(5));

        let events = detector.cleanup();
        assert!(!detector.has_conflict(ip(1)));
        assert!(events.iter().any(|e| matches!(e, ConflictEvent::Resolved(i) if *i == ip(1))));
        assert_eq!(detector.stats().tracked_ips, 0);
        assert_eq!(detector.stats().tracked_domains, 0);
    }

    #[test]
    fn cleanup_only_drops_the_stale_ip_from_a_domain_with_other_fresh_ips() {
        let detector = ConflictDetector::new(Duration::from_millis(50));
        detector.record("a.test", ip(1), true);
        std::thread::sleep(Duration::from_millis(60));
        detector.record("a.test", ip(2), true);

        detector.cleanup();

        assert_eq!(detector.stats().tracked_domains, 1);
        assert_eq!(detector.stats().tracked_ips, 1);
    }

    #[test]
    fn record_batch_returns_first_conflict() {
        let detector = ConflictDetector::default();
        detector.record("other.test", ip(2), false);
        let conflict = detector.record_batch("a.test", &[ip(1), ip(2)], true);
        assert_eq!(conflict.map(|c| c.ip), Some(ip(2)));
    }
}
