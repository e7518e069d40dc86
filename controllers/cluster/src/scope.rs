//! Per-reconciliation working state of one AWSCluster.
//!
//! The scope owns the in-memory status for the duration of one
//! reconciliation. Convergers read the spec and write observations into
//! `status`; the reconciler persists it once at the end.

use crds::{AWSCluster, AWSClusterSpec, AWSClusterStatus, ConditionSeverity, NetworkStatus, ObjectKey};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Resource;
use std::collections::BTreeMap;

use crate::resolvers::tags;
use crate::store::OwnerCluster;

/// Working copy of an AWSCluster plus the facts resolved about its owner
#[derive(Debug, Clone)]
pub struct ClusterScope {
    /// Key of the AWSCluster
    pub key: ObjectKey,
    /// Metadata and spec as read (status lives in `status`)
    pub cluster: AWSCluster,
    /// Observed status being built
    pub status: AWSClusterStatus,
    /// Owning Cluster
    pub owner: OwnerCluster,
    /// Port published on the control plane endpoint
    pub api_server_port: i32,
}

impl ClusterScope {
    /// Build a scope; the object's current status seeds the working status
    pub fn new(key: ObjectKey, mut cluster: AWSCluster, owner: OwnerCluster, api_server_port: i32) -> Self {
        let status = cluster.status.take().unwrap_or_default();
        Self {
            key,
            cluster,
            status,
            owner,
            api_server_port,
        }
    }

    /// Cluster name, used in resource names and ownership tags
    pub fn name(&self) -> &str {
        &self.key.name
    }

    /// Desired state
    pub fn spec(&self) -> &AWSClusterSpec {
        &self.cluster.spec
    }

    /// Provider region
    pub fn region(&self) -> &str {
        &self.cluster.spec.region
    }

    /// Observed network
    pub fn network(&self) -> &NetworkStatus {
        &self.status.network
    }

    /// VPC id once the network has been converged
    pub fn vpc_id(&self) -> Option<&str> {
        self.status.network.vpc_id.as_deref()
    }

    /// Infrastructure is owned by an external tool
    pub fn is_externally_managed(&self) -> bool {
        self.cluster.is_externally_managed()
    }

    /// Owner uses a managed control plane
    pub fn is_managed_control_plane(&self) -> bool {
        self.owner.managed_control_plane
    }

    /// Severity for failure conditions: warnings until the control plane is
    /// up, errors afterwards
    pub fn failure_severity(&self) -> ConditionSeverity {
        if self.owner.control_plane_initialized {
            ConditionSeverity::Error
        } else {
            ConditionSeverity::Warning
        }
    }

    /// Ownership tags for a resource created for this cluster
    pub fn resource_tags(&self, name: &str, role: &str) -> BTreeMap<String, String> {
        tags::build_tags(self.name(), name, role, &self.cluster.spec.additional_tags)
    }

    /// Reference used when emitting events
    pub fn object_ref(&self) -> ObjectReference {
        self.cluster.object_ref(&())
    }

    /// The object with the working status folded back in
    pub fn to_object(&self) -> AWSCluster {
        let mut cluster = self.cluster.clone();
        cluster.status = Some(self.status.clone());
        cluster
    }

    /// Adopt metadata (resource version, finalizers) from a persisted copy
    pub fn refresh_metadata(&mut self, persisted: &AWSCluster) {
        self.cluster.metadata = persisted.metadata.clone();
    }
}
