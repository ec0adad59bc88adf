//! Configuration for the boxrunner process.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::backoff::{DEFAULT_CEILING, DEFAULT_FLOOR};
use crate::liveness::HEALTH_PATH;
use crate::runner::RunnerSettings;

/// Boxrunner configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Service name. Doubles as the lock key.
    pub service: String,

    /// Port the liveness endpoint listens on. Part of the runner id.
    pub port: u16,

    /// Consul agent base URL.
    pub consul_url: String,

    /// Docker endpoint (`unix://`, `tcp://` or `http://`).
    pub docker_host: String,

    /// Workload image.
    pub image: String,

    /// Workload command.
    pub command: Vec<String>,

    /// Host name Consul uses to reach the liveness endpoint.
    pub advertise_host: String,

    /// Session lock-delay.
    pub lock_delay: Duration,

    /// Health check interval.
    pub check_interval: Duration,

    /// Settle time in SLEEP before watching the lock.
    pub sleep_interval: Duration,

    /// Backoff floor.
    pub backoff_floor: Duration,

    /// Backoff ceiling.
    pub backoff_ceiling: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let service = lookup("BOXRUNNER_SERVICE")
            .filter(|s| !s.trim().is_empty())
            .context("Missing service name. Set BOXRUNNER_SERVICE.")?;

        let port = parse_var(&lookup, "PORT", 8080)?;

        let consul_url = lookup("BOXRUNNER_CONSUL_URL")
            .unwrap_or_else(|| "http://127.0.0.1:8500".to_string());

        let docker_host = lookup("BOXRUNNER_DOCKER_HOST")
            .unwrap_or_else(|| "unix:///var/run/docker.sock".to_string());

        let image = lookup("BOXRUNNER_IMAGE").unwrap_or_else(|| "busybox".to_string());

        let command: Vec<String> = lookup("BOXRUNNER_COMMAND")
            .unwrap_or_else(|| "/bin/sleep 10".to_string())
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let advertise_host =
            lookup("BOXRUNNER_ADVERTISE_HOST").unwrap_or_else(|| "localhost".to_string());

        let lock_delay = Duration::from_secs(parse_var(&lookup, "BOXRUNNER_LOCK_DELAY_SECS", 5)?);
        let check_interval =
            Duration::from_secs(parse_var(&lookup, "BOXRUNNER_CHECK_INTERVAL_SECS", 5)?.max(1));
        let sleep_interval = Duration::from_millis(parse_var(&lookup, "BOXRUNNER_SLEEP_MS", 3000)?);

        let backoff_floor = Duration::from_millis(parse_var(
            &lookup,
            "BOXRUNNER_BACKOFF_FLOOR_MS",
            DEFAULT_FLOOR.as_millis() as u64,
        )?);
        let backoff_ceiling = Duration::from_secs(parse_var(
            &lookup,
            "BOXRUNNER_BACKOFF_CEILING_SECS",
            DEFAULT_CEILING.as_secs(),
        )?);
        anyhow::ensure!(
            backoff_floor <= backoff_ceiling,
            "BOXRUNNER_BACKOFF_FLOOR_MS must not exceed BOXRUNNER_BACKOFF_CEILING_SECS."
        );

        let log_level = lookup("BOXRUNNER_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            service,
            port,
            consul_url,
            docker_host,
            image,
            command,
            advertise_host,
            lock_delay,
            check_interval,
            sleep_interval,
            backoff_floor,
            backoff_ceiling,
            log_level,
        })
    }

    /// URL registered as the health check.
    pub fn liveness_url(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.advertise_host, self.port, HEALTH_PATH
        )
    }

    /// Runner settings derived from this configuration.
    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            image: self.image.clone(),
            command: self.command.clone(),
            liveness_url: self.liveness_url(),
            check_interval: self.check_interval,
            lock_delay: self.lock_delay,
            sleep_interval: self.sleep_interval,
            backoff_floor: self.backoff_floor,
            backoff_ceiling: self.backoff_ceiling,
        }
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(name)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{name} must be a non-negative integer."))
        .map(|v| v.unwrap_or(default))
}
