//! Domain matcher: compiles a rule set and classifies names as tunnel or
//! direct.
//!
//! Matching is exact-literal-first, then longest-matching-wildcard-suffix;
//! a wildcard rule `*.<suffix>` never matches `<suffix>` itself.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("pattern is empty")]
    Empty,
    #[error("pattern contains more than one wildcard")]
    MultipleWildcards,
    #[error("wildcard must be the leading label (`*.suffix`)")]
    WildcardNotLeading,
    #[error("malformed domain label in `{0}`")]
    MalformedLabel(String),
}

fn label_valid(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }
    let bytes = label.as_bytes();
    let first_and_last_alnum = bytes[0].is_ascii_alphanumeric() && bytes[bytes.len() - 1].is_ascii_alphanumeric();
    first_and_last_alnum && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
}

fn domain_valid(name: &str) -> bool {
    !name.is_empty() && name.split('.').all(label_valid)
}

/// Validates and normalizes (lowercase, trimmed) a rule pattern.
pub fn is_valid(pattern: &str) -> Result<String, ValidationError> {
    let normalized = pattern.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(ValidationError::Empty);
    }

    let wildcard_count = normalized.matches('*').count();
    match wildcard_count {
        0 => {
            if domain_valid(&normalized) {
                Ok(normalized)
            } else {
                Err(ValidationError::MalformedLabel(normalized))
            }
        }
        1 => {
            let suffix = normalized
                .strip_prefix("*.")
                .ok_or(ValidationError::WildcardNotLeading)?;
            if domain_valid(suffix) {
                Ok(normalized)
            } else {
                Err(ValidationError::MalformedLabel(normalized))
            }
        }
        _ => Err(ValidationError::MultipleWildcards),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Rule {
    pub pattern: String,
    pub tunnel: bool,
}

impl Rule {
    pub fn new(pattern: &str, tunnel: bool) -> Result<Self, ValidationError> {
        let pattern = is_valid(pattern)?;
        Ok(Rule { pattern, tunnel })
    }
}

/// A `Rule` arriving over the wire with an invalid pattern is rejected at
/// deserialization, not silently stored.
impl<'de> Deserialize<'de> for Rule {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RawRule {
            pattern: String,
            tunnel: bool,
        }
        let raw = RawRule::deserialize(deserializer)?;
        Rule::new(&raw.pattern, raw.tunnel).map_err(de::Error::custom)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchOutcome {
    pub matched: bool,
    pub tunnel: bool,
    pub matched_rule: Option<String>,
}

impl fmt::Display for MatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "matched={} tunnel={} rule={:?}",
            self.matched, self.tunnel, self.matched_rule
        )
    }
}

/// Cheaply cloneable handle shared by the DNS proxy and the SNI proxy
/// (single-writer / many-reader: mutated only by `add`/`remove`/`load`).
#[derive(Clone, Default)]
pub struct Matcher {
    rules: Arc<RwLock<HashMap<String, Rule>>>,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, pattern: &str, tunnel: bool) -> Result<(), ValidationError> {
        let rule = Rule::new(pattern, tunnel)?;
        self.rules.write().expect("matcher lock poisoned").insert(rule.pattern.clone(), rule);
        Ok(())
    }

    /// Returns whether a rule with that pattern was present.
    pub fn remove(&self, pattern: &str) -> bool {
        let normalized = pattern.trim().to_lowercase();
        self.rules.write().expect("matcher lock poisoned").remove(&normalized).is_some()
    }

    pub fn load(&self, rules: Vec<Rule>) {
        let map = rules.into_iter().map(|r| (r.pattern.clone(), r)).collect();
        *self.rules.write().expect("matcher lock poisoned") = map;
    }

    pub fn get_rules(&self) -> Vec<Rule> {
        self.rules.read().expect("matcher lock poisoned").values().cloned().collect()
    }

    pub fn classify(&self, name: &str) -> MatchOutcome {
        let name = name.trim().to_lowercase();
        let rules = self.rules.read().expect("matcher lock poisoned");

        if let Some(rule) = rules.get(&name) {
            return MatchOutcome { matched: true, tunnel: rule.tunnel, matched_rule: Some(rule.pattern.clone()) };
        }

        let labels: Vec<&str> = name.split('.').collect();
        for start in 1..labels.len() {
            let suffix = labels[start..].join(".");
            let wildcard = format!("*.{suffix}");
            if let Some(rule) = rules.get(&wildcard) {
                return MatchOutcome { matched: true, tunnel: rule.tunnel, matched_rule: Some(rule.pattern.clone()) };
            }
        }

        MatchOutcome { matched: false, tunnel: false, matched_rule: None }
    }
}
