//! Runner identity.
//!
//! A runner is identified by the service it competes for plus a runner id
//! derived from the host name and the listening port. The runner id names the
//! session, the health check and the container, so a restarted process finds
//! the resources its predecessor created.

use std::fmt;

use anyhow::{Context, Result};

/// Stable id of one runner process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunnerId(String);

impl RunnerId {
    /// Prefix shared by all runner ids.
    pub const PREFIX: &'static str = "boxrunner";

    /// Derive the runner id for `hostname` and `port`.
    pub fn derive(hostname: &str, port: u16) -> Self {
        Self(format!("{}-{}-{}", Self::PREFIX, hostname, port))
    }

    /// Get the id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Service name plus runner id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerIdentity {
    /// Service this runner competes for. Used as the lock key.
    pub service: String,

    /// This runner's id. Stored as the lock value while held.
    pub runner_id: RunnerId,
}

impl RunnerIdentity {
    /// Build an identity from already known parts.
    pub fn new(service: impl Into<String>, hostname: &str, port: u16) -> Self {
        Self {
            service: service.into(),
            runner_id: RunnerId::derive(hostname, port),
        }
    }

    /// Build an identity for this host.
    pub fn resolve(service: impl Into<String>, port: u16) -> Result<Self> {
        let hostname = nix::unistd::gethostname()
            .context("Could not determine hostname")?
            .into_string()
            .map_err(|raw| anyhow::anyhow!("Hostname is not valid UTF-8: {raw:?}"))?;
        Ok(Self::new(service, &hostname, port))
    }

    /// Name of the container this runner manages.
    pub fn container_name(&self) -> &str {
        self.runner_id.as_str()
    }
}
