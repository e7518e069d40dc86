//! AWSCluster CRD
//!
//! Desired infrastructure of one cluster: network, security groups, bastion,
//! API server load balancer and object store bucket. Status carries the
//! observed snapshot written back after every reconciliation.

use crate::conditions::Condition;
use crate::instance::Instance;
use crate::network::{FailureDomain, LoadBalancerScheme, NetworkSpec, NetworkStatus};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Finalizer guarding AWSCluster deletion
pub const CLUSTER_FINALIZER: &str = "awscluster.infrastructure.cluster.x-k8s.io";
/// Annotation pausing reconciliation
pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";
/// Annotation marking infrastructure managed by an external tool
pub const MANAGED_BY_ANNOTATION: &str = "cluster.x-k8s.io/managed-by";
/// Default API server port
pub const DEFAULT_API_SERVER_PORT: i32 = 6443;

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "AWSCluster",
    namespaced,
    status = "AWSClusterStatus",
    shortname = "awsc",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"VPC","type":"string","jsonPath":".status.network.vpcId"}"#,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".spec.controlPlaneEndpoint.host"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AWSClusterSpec {
    /// Provider region (immutable)
    pub region: String,

    /// Network topology
    #[serde(default)]
    pub network: NetworkSpec,

    /// Control plane endpoint; written once from the load balancer DNS name
    #[serde(default)]
    pub control_plane_endpoint: ApiEndpoint,

    /// API server load balancer settings
    #[serde(default)]
    pub control_plane_load_balancer: LoadBalancerSpec,

    /// Bastion host settings
    #[serde(default)]
    pub bastion: BastionSpec,

    /// Identity used to reach the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_ref: Option<IdentityReference>,

    /// Default SSH key for instances; empty string means no key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_name: Option<String>,

    /// Default image name lookup format
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_lookup_format: Option<String>,

    /// Default image owner organisation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_lookup_org: Option<String>,

    /// Default image base OS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_lookup_base_os: Option<String>,

    /// Tags applied to every resource of the cluster
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_tags: BTreeMap<String, String>,

    /// Object store bucket, created only when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_bucket: Option<S3Bucket>,
}

/// API endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    /// Host name
    #[serde(default)]
    pub host: String,

    /// Port
    #[serde(default)]
    pub port: i32,
}

impl ApiEndpoint {
    /// Whether the endpoint has not been published yet
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.host.is_empty() && self.port == 0
    }
}

/// API server load balancer settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    /// Scheme (immutable once set)
    #[serde(default)]
    pub scheme: LoadBalancerScheme,
}

/// Bastion host settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BastionSpec {
    /// Whether a bastion host should exist
    #[serde(default)]
    pub enabled: bool,

    /// Instance type, defaults to "t3.micro"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,

    /// Explicit image id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ami: Option<String>,

    /// CIDR blocks allowed to reach the bastion over SSH, defaults to "0.0.0.0/0"
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_cidr_blocks: Vec<String>,
}

/// Reference to the identity object granting provider access
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IdentityReference {
    /// Identity kind
    pub kind: String,

    /// Identity name
    pub name: String,
}

/// Object store bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct S3Bucket {
    /// Bucket name
    pub name: String,
}

/// Reconciliation phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum ClusterPhase {
    /// Not yet reconciled
    #[default]
    Pending,
    /// Converging
    Provisioning,
    /// Every sub-resource converged and endpoint published
    Ready,
    /// Teardown in progress
    Deleting,
}

/// Observed state of an AWSCluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AWSClusterStatus {
    /// Infrastructure ready
    #[serde(default)]
    pub ready: bool,

    /// Phase
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Observed network
    #[serde(default)]
    pub network: NetworkStatus,

    /// Failure domains keyed by availability zone
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failure_domains: BTreeMap<String, FailureDomain>,

    /// Bastion instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bastion: Option<Instance>,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl AWSCluster {
    /// Whether infrastructure is managed by an external tool
    #[must_use]
    pub fn is_externally_managed(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(MANAGED_BY_ANNOTATION))
    }

    /// Whether the paused annotation is set
    #[must_use]
    pub fn has_paused_annotation(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(PAUSED_ANNOTATION))
    }
}
