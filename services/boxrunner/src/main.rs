//! Boxrunner
//!
//! Competes for the service lock and runs the workload container while it
//! holds it.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use boxrunner::{Config, ConsulClient, DockerClient, Runner, RunnerIdentity};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        service = %config.service,
        port = config.port,
        consul_url = %config.consul_url,
        docker_host = %config.docker_host,
        image = %config.image,
        "Configuration loaded"
    );

    let identity = RunnerIdentity::resolve(config.service.clone(), config.port)?;
    info!(runner_id = %identity.runner_id, "Runner identity resolved");

    let store = ConsulClient::new(&config.consul_url).context("Could not build Consul client")?;
    let runtime =
        DockerClient::from_host(&config.docker_host).context("Could not build Docker client")?;

    // The health check polls this endpoint, so it must be up before DISCOVER.
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let liveness_handle = tokio::spawn(boxrunner::liveness::serve(addr));

    let mut runner = Runner::new(
        identity,
        config.runner_settings(),
        Arc::new(store),
        Arc::new(runtime),
    );

    tokio::select! {
        result = runner.run() => {
            let Err(e) = result;
            error!(error = %e, "Runner stopped");
            return Err(e.into());
        }
        result = liveness_handle => {
            match result {
                Ok(Ok(())) => error!("Liveness endpoint exited"),
                Ok(Err(e)) => error!(error = %e, "Liveness endpoint error"),
                Err(e) => error!(error = %e, "Liveness task panicked"),
            }
            anyhow::bail!("Liveness endpoint stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Boxrunner shutdown complete");
    Ok(())
}
