//! Main controller implementation.
//!
//! Wires the Kubernetes client, the cloud client and the reconcilers
//! together, then runs one watcher per kind next to the probes server.

use cloud_client::{CloudClient, CloudClientTrait};
use crds::{AWSCluster, AWSMachine};
use kube::{Api, Client};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::ControllerConfig;
use crate::dns::SystemResolver;
use crate::error::ControllerError;
use crate::events::KubeEventSink;
use crate::instances::InstanceTimeouts;
use crate::machine::MachineReconciler;
use crate::metrics::{self, ControllerMetrics};
use crate::orchestrator::ClusterReconciler;
use crate::services::CloudServices;
use crate::store::{KubeOwnerLookup, KubeStore};
use crate::watcher::{ReconcileFn, ReconcileFuture, WatchContext, watch_resource};

/// Running watchers and probes server
pub struct Controller {
    cluster_watcher: JoinHandle<Result<(), ControllerError>>,
    machine_watcher: JoinHandle<Result<(), ControllerError>>,
    metrics_server: JoinHandle<anyhow::Result<()>>,
}

fn api_for<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}

impl Controller {
    /// Connect to both APIs and start watching
    pub async fn new(config: &ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing AWS cluster controller");
        let client = Client::try_default().await?;

        let cloud = CloudClient::new(config.cloud_api_url.clone(), config.cloud_api_token.clone()).map_err(|e| {
            ControllerError::InvalidConfig(format!("cannot build cloud client for {}: {e}", config.cloud_api_url))
        })?;
        let timeouts = InstanceTimeouts {
            running: config.instance_running_timeout,
            terminate: config.instance_terminate_timeout,
            ..InstanceTimeouts::default()
        };
        let services = Arc::new(CloudServices::new(
            move |region| Arc::new(cloud.with_region(region)) as Arc<dyn CloudClientTrait>,
            timeouts,
            config.enable_instance_state_events,
        ));

        let clusters = Arc::new(KubeStore::<AWSCluster>::new(client.clone()));
        let owners = Arc::new(KubeOwnerLookup::new(client.clone()));
        let events = Arc::new(KubeEventSink::new(client.clone()));

        let cluster_reconciler = Arc::new(ClusterReconciler::new(
            clusters.clone(),
            owners.clone(),
            services.clone(),
            events.clone(),
            Arc::new(SystemResolver),
            config.api_server_port,
        ));
        let machine_reconciler = Arc::new(MachineReconciler::new(
            Arc::new(KubeStore::<AWSMachine>::new(client.clone())),
            clusters,
            owners,
            services,
            events,
            config.api_server_port,
        ));

        let metrics = Arc::new(ControllerMetrics::new()?);
        let metrics_server = tokio::spawn(metrics::serve(metrics.clone(), config.metrics_port));

        let reconcile_cluster: ReconcileFn = Box::new(move |key| {
            let reconciler = cluster_reconciler.clone();
            Box::pin(async move { reconciler.reconcile(&key).await }) as ReconcileFuture
        });
        let reconcile_machine: ReconcileFn = Box::new(move |key| {
            let reconciler = machine_reconciler.clone();
            Box::pin(async move { reconciler.reconcile(&key).await }) as ReconcileFuture
        });

        let namespace = config.namespace.as_deref();
        let cluster_watcher = tokio::spawn(watch_resource(
            api_for::<AWSCluster>(&client, namespace),
            Arc::new(WatchContext::new("AWSCluster", reconcile_cluster, metrics.clone())),
        ));
        let machine_watcher = tokio::spawn(watch_resource(
            api_for::<AWSMachine>(&client, namespace),
            Arc::new(WatchContext::new("AWSMachine", reconcile_machine, metrics.clone())),
        ));
        metrics.set_ready(true);
        info!("Controller initialized");

        Ok(Self {
            cluster_watcher,
            machine_watcher,
            metrics_server,
        })
    }

    /// Run until a watcher or the probes server stops
    pub async fn run(self) -> Result<(), ControllerError> {
        info!("Controller running");
        tokio::select! {
            result = self.cluster_watcher => watcher_exit("AWSCluster", result),
            result = self.machine_watcher => watcher_exit("AWSMachine", result),
            result = self.metrics_server => {
                let message = match result {
                    Ok(Ok(())) => "metrics server stopped".to_string(),
                    Ok(Err(e)) => format!("metrics server failed: {e:#}"),
                    Err(e) => format!("metrics server panicked: {e}"),
                };
                error!("{}", message);
                Err(ControllerError::Watch(message))
            }
        }
    }
}

fn watcher_exit(
    kind: &str,
    result: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> Result<(), ControllerError> {
    match result {
        Ok(Ok(())) => {
            info!("{} watcher stopped", kind);
            Ok(())
        }
        Ok(Err(e)) => {
            error!("{} watcher failed: {}", kind, e);
            Err(e)
        }
        Err(e) => {
            error!("{} watcher panicked: {}", kind, e);
            Err(ControllerError::Watch(format!("{kind} watcher panicked: {e}")))
        }
    }
}
