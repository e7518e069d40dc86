//! Resource convergers
//!
//! One converger per sub-resource of an AWSCluster, each exposing an
//! idempotent `reconcile` and `delete`:
//! - `network`: VPC and subnets
//! - `security_group`: one group per role and its ingress rules
//! - `bastion`: the bastion host
//! - `load_balancer`: the API server load balancer
//! - `object_store`: the cluster bucket
//! - `instance_state`: queue and rule for instance state-change notifications
//!
//! The orchestrator never builds convergers itself; it asks a
//! `ServiceFactory`, so tests can hand it fakes.

pub mod bastion;
pub mod instance_state;
pub mod load_balancer;
pub mod network;
pub mod object_store;
pub mod security_group;

use async_trait::async_trait;
use cloud_client::CloudClientTrait;
use std::sync::Arc;

use crate::error::ControllerError;
use crate::instances::{InstanceService, InstanceTimeouts};
use crate::scope::ClusterScope;

/// Drives one sub-resource toward its declared state
#[async_trait]
pub trait Converger: Send + Sync {
    /// Create, adopt or update the sub-resource and record it in the status
    async fn reconcile(&self, scope: &mut ClusterScope) -> Result<(), ControllerError>;

    /// Remove the sub-resource; absence counts as success
    async fn delete(&self, scope: &mut ClusterScope) -> Result<(), ControllerError>;
}

/// Builds the convergers and the instance provisioner for a cluster
pub trait ServiceFactory: Send + Sync {
    /// VPC and subnets
    fn network(&self, scope: &ClusterScope) -> Box<dyn Converger>;
    /// Security groups
    fn security_groups(&self, scope: &ClusterScope) -> Box<dyn Converger>;
    /// Bastion host
    fn bastion(&self, scope: &ClusterScope) -> Box<dyn Converger>;
    /// API server load balancer
    fn load_balancer(&self, scope: &ClusterScope) -> Box<dyn Converger>;
    /// Cluster bucket
    fn object_store(&self, scope: &ClusterScope) -> Box<dyn Converger>;
    /// Instance state-change notifications
    fn instance_state(&self, scope: &ClusterScope) -> Box<dyn Converger>;
    /// Instance provisioner
    fn instances(&self, scope: &ClusterScope) -> InstanceService;
}

type ClientFactory = dyn Fn(&str) -> Arc<dyn CloudClientTrait> + Send + Sync;

/// `ServiceFactory` building cloud-backed convergers for the cluster's region
pub struct CloudServices {
    clients: Box<ClientFactory>,
    timeouts: InstanceTimeouts,
    enable_instance_state_events: bool,
}

impl CloudServices {
    /// `clients` returns the cloud client for a region
    pub fn new<F>(clients: F, timeouts: InstanceTimeouts, enable_instance_state_events: bool) -> Self
    where
        F: Fn(&str) -> Arc<dyn CloudClientTrait> + Send + Sync + 'static,
    {
        Self {
            clients: Box::new(clients),
            timeouts,
            enable_instance_state_events,
        }
    }

    fn client(&self, scope: &ClusterScope) -> Arc<dyn CloudClientTrait> {
        (self.clients)(scope.region())
    }
}

impl ServiceFactory for CloudServices {
    fn network(&self, scope: &ClusterScope) -> Box<dyn Converger> {
        Box::new(network::NetworkService::new(self.client(scope)))
    }

    fn security_groups(&self, scope: &ClusterScope) -> Box<dyn Converger> {
        Box::new(security_group::SecurityGroupService::new(self.client(scope)))
    }

    fn bastion(&self, scope: &ClusterScope) -> Box<dyn Converger> {
        Box::new(bastion::BastionService::new(self.client(scope), self.instances(scope)))
    }

    fn load_balancer(&self, scope: &ClusterScope) -> Box<dyn Converger> {
        Box::new(load_balancer::LoadBalancerService::new(self.client(scope)))
    }

    fn object_store(&self, scope: &ClusterScope) -> Box<dyn Converger> {
        Box::new(object_store::ObjectStoreService::new(self.client(scope)))
    }

    fn instance_state(&self, scope: &ClusterScope) -> Box<dyn Converger> {
        Box::new(instance_state::InstanceStateService::new(
            self.client(scope),
            self.enable_instance_state_events,
        ))
    }

    fn instances(&self, scope: &ClusterScope) -> InstanceService {
        InstanceService::new(self.client(scope), self.timeouts)
    }
}
