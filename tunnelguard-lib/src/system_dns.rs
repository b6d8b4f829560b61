//! System DNS Adapter (component F): OS-level resolver redirection.
//!
//! The trait is the surface the engine depends on; concrete per-platform
//! implementations (macOS `networksetup`/`pfctl`, Linux `resolved`/
//! `resolv.conf`/`iptables`) live in `tunnelguard-root`, reached from the
//! daemon through [`crate::privileged::PrivilegedClient`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported platform")]
    UnsupportedPlatform,
    #[error("system tool failed: {0}")]
    CommandFailed(String),
    #[error("restore failed after configure error: configure error was `{configure}`, restore error was `{restore}`")]
    RestoreAfterConfigureFailed { configure: String, restore: String },
}

/// Opaque, OS-specific snapshot of the resolver configuration captured
/// before redirection is applied. Persisted to the config store so a crash
/// can be recovered from on the next start (spec §4.F).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Backup {
    pub platform: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait SystemDnsAdapter: Send + Sync {
    /// Captures a backup, points the resolver at 127.0.0.1, installs the
    /// NAT redirect to `proxy_port`, and flushes the OS DNS cache. Rolls
    /// back via `restore()` on any failure.
    async fn configure(&self, proxy_port: u16) -> Result<Backup, Error>;

    /// Inverse of `configure`: removes the redirect rule and restores the
    /// resolver configuration carried in `backup`.
    async fn restore(&self, backup: &Backup) -> Result<(), Error>;

    /// True if the live resolver configuration still points at 127.0.0.1
    /// and `backup` indicates a prior run — i.e. a crash left redirection
    /// applied and it should be undone before configuring anew.
    async fn check_for_stale_config(&self, backup: &Backup) -> Result<bool, Error>;
}
