//! Concrete [`SystemDnsAdapter`] implementations (spec §4.F). One backend
//! per supported platform, selected at compile time with `#[cfg(target_os
//! = ...)]` the way the teacher's own worker/routing modules branch on
//! platform.

use async_trait::async_trait;
use tunnelguard_lib::system_dns::{Backup, Error, SystemDnsAdapter};

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "linux")]
mod linux;

pub struct PlatformDns {
    #[cfg(target_os = "macos")]
    inner: macos::MacosDns,
    #[cfg(target_os = "linux")]
    inner: linux::LinuxDns,
}

impl PlatformDns {
    #[cfg(target_os = "macos")]
    pub fn new() -> Self {
        PlatformDns { inner: macos::MacosDns::new() }
    }

    #[cfg(target_os = "linux")]
    pub fn new() -> Self {
        PlatformDns { inner: linux::LinuxDns::new() }
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    pub fn new() -> Self {
        PlatformDns {}
    }
}

impl Default for PlatformDns {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SystemDnsAdapter for PlatformDns {
    #[cfg(any(target_os = "macos", target_os = "linux"))]
    async fn configure(&self, proxy_port: u16) -> Result<Backup, Error> {
        self.inner.configure(proxy_port).await
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    async fn configure(&self, _proxy_port: u16) -> Result<Backup, Error> {
        Err(Error::UnsupportedPlatform)
    }

    #[cfg(any(target_os = "macos", target_os = "linux"))]
    async fn restore(&self, backup: &Backup) -> Result<(), Error> {
        self.inner.restore(backup).await
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    async fn restore(&self, _backup: &Backup) -> Result<(), Error> {
        Err(Error::UnsupportedPlatform)
    }

    #[cfg(any(target_os = "macos", target_os = "linux"))]
    async fn check_for_stale_config(&self, backup: &Backup) -> Result<bool, Error> {
        self.inner.check_for_stale_config(backup).await
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    async fn check_for_stale_config(&self, _backup: &Backup) -> Result<bool, Error> {
        Err(Error::UnsupportedPlatform)
    }
}
