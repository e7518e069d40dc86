//! AWS Cluster Controller
//!
//! Converges `AWSCluster` resources onto cloud infrastructure (network,
//! security groups, bastion, API server load balancer, object store bucket,
//! instance state notifications) and `AWSMachine` resources onto compute
//! instances, reporting progress through conditions on each object.

mod backoff;
mod config;
mod controller;
mod dns;
mod error;
mod events;
mod instances;
mod machine;
mod metrics;
mod orchestrator;
mod resolvers;
mod scope;
mod services;
mod store;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube and reqwest both build rustls clients
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting AWS Cluster Controller");
    let config = ControllerConfig::from_env()?;
    config.log();

    let controller = Controller::new(&config).await?;
    controller.run().await?;

    Ok(())
}
