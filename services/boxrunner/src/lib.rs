//! Boxrunner
//!
//! Runs one named workload container on exactly one host of a peer group.
//! Every host runs a boxrunner for the same service; they compete for a lock
//! in Consul, and the holder pulls and runs the container through the Docker
//! Engine API. When the holder dies its session is invalidated, the lock is
//! freed and a peer takes over.
//!
//! ## Modules
//!
//! - `runner`: The control loop and its states
//! - `coordination`: Sessions, health checks and the lock key (Consul or in-memory)
//! - `runtime`: Container lifecycle (Docker or mock)
//! - `backoff`: Wait between a failure and the next attempt
//! - `identity`: Runner id derived from host name and port
//! - `liveness`: HTTP endpoint polled by the health check
//! - `config`: Environment configuration

pub mod backoff;
pub mod config;
pub mod coordination;
pub mod identity;
pub mod liveness;
pub mod runner;
pub mod runtime;

pub use backoff::Backoff;
pub use config::Config;
pub use coordination::{ConsulClient, CoordinationClient, MemoryStore};
pub use identity::{RunnerId, RunnerIdentity};
pub use runner::{Runner, RunnerSettings, State};
pub use runtime::{ContainerRuntime, DockerClient, MockRuntime};
