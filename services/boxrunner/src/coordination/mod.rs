//! Coordination store interface.
//!
//! The runner only needs a small slice of a Consul-like store:
//! - Sessions bound to health checks, with a lock-delay
//! - Agent health check registration
//! - Key/value reads (optionally blocking on a modify-index cursor)
//! - Atomic acquire/release of a key by a session
//!
//! Two implementations are provided: [`ConsulClient`] talks to a Consul agent
//! over HTTP, [`MemoryStore`] keeps everything in process for tests and dry runs.

mod consul;
mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use consul::ConsulClient;
pub use memory::MemoryStore;

/// Name of the node-level liveness check every Consul agent carries.
pub const SERF_HEALTH_CHECK: &str = "serfHealth";

/// Errors from the coordination store.
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
}

/// Session summary as listed by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
}

/// Health check summary as listed by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckInfo {
    pub id: String,
}

/// A key/value entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,

    /// Session currently holding the key, if any.
    pub session: Option<String>,

    /// Cursor for the next blocking read.
    pub modify_index: u64,
}

impl KvPair {
    /// Value as text, lossily decoded.
    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// Coordination store operations used by the runner.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Create a session bound to `checks`. Returns the session id.
    async fn create_session(
        &self,
        name: &str,
        checks: &[String],
        lock_delay: Duration,
    ) -> Result<String, CoordinationError>;

    /// List all sessions.
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, CoordinationError>;

    /// Register an HTTP health check against `url`.
    async fn register_health_check(
        &self,
        id: &str,
        url: &str,
        interval: Duration,
    ) -> Result<(), CoordinationError>;

    /// List the health checks registered with the agent.
    async fn list_health_checks(&self) -> Result<Vec<HealthCheckInfo>, CoordinationError>;

    /// Read a key.
    ///
    /// With `wait_index`, blocks until the key's modify index moves past the
    /// cursor. An absent key is returned immediately either way.
    async fn kv_get(
        &self,
        key: &str,
        wait_index: Option<u64>,
    ) -> Result<Option<KvPair>, CoordinationError>;

    /// Atomically take `key` for `session`, storing `value`.
    ///
    /// Returns false if another live session holds the key.
    async fn kv_acquire(
        &self,
        key: &str,
        value: &[u8],
        session: &str,
    ) -> Result<bool, CoordinationError>;

    /// Release `key` if `session` holds it.
    async fn kv_release(&self, key: &str, session: &str) -> Result<bool, CoordinationError>;
}

/// Render a duration the way Consul parses it.
pub(crate) fn go_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}
