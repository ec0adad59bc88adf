//! Container runtime interface.
//!
//! Abstracts the container lifecycle operations the runner drives:
//! - Reachability check
//! - Image pull
//! - Create/start/wait/remove of a single named container
//!
//! [`DockerClient`] talks to the Docker Engine API; [`MockRuntime`] simulates
//! containers in memory for tests and development.

mod docker;
mod mock;

use async_trait::async_trait;
use thiserror::Error;

pub use docker::{DockerClient, DockerEndpoint};
pub use mock::MockRuntime;

/// Errors from the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("image pull failed: {0}")]
    Pull(String),

    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
}

/// Container runtime operations used by the runner.
///
/// Containers are addressed by id or name interchangeably.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the runtime answers.
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Pull `image`, defaulting to the `latest` tag.
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create a container. Returns the container id.
    async fn create_container(
        &self,
        name: &str,
        image: &str,
        cmd: &[String],
    ) -> Result<String, RuntimeError>;

    /// Start a created container.
    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Block until the container exits. Returns its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError>;

    /// Remove the container, stopping it first if it still runs.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;
}
