//! Network topology types
//!
//! Desired network layout (`NetworkSpec`) and the observed snapshot recorded
//! in cluster status (`NetworkStatus`).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Default CIDR block of a managed VPC
pub const DEFAULT_VPC_CIDR: &str = "10.0.0.0/16";

fn default_vpc_cidr() -> String {
    DEFAULT_VPC_CIDR.to_string()
}

/// Desired network topology
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// VPC configuration
    #[serde(default)]
    pub vpc: VpcSpec,

    /// Subnets to adopt or create
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<SubnetSpec>,
}

/// Desired VPC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VpcSpec {
    /// Existing VPC to adopt. When set, the network is unmanaged and never deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// CIDR block for a managed VPC
    #[serde(default = "default_vpc_cidr")]
    pub cidr_block: String,
}

impl Default for VpcSpec {
    fn default() -> Self {
        Self {
            id: None,
            cidr_block: default_vpc_cidr(),
        }
    }
}

impl VpcSpec {
    /// Whether the VPC is brought by the user rather than owned by the cluster
    #[must_use]
    pub fn is_unmanaged(&self) -> bool {
        self.id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

/// Desired subnet
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    /// Existing subnet to adopt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// CIDR block for a managed subnet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr_block: Option<String>,

    /// Availability zone for a managed subnet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,

    /// Whether the subnet routes to the internet
    #[serde(default)]
    pub is_public: bool,
}

/// Observed subnet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Subnet {
    /// Subnet id
    pub id: String,

    /// Availability zone
    pub availability_zone: String,

    /// CIDR block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr_block: Option<String>,

    /// Public/private flag
    #[serde(default)]
    pub is_public: bool,
}

/// Security group roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SecurityGroupRole {
    /// Bastion host
    Bastion,
    /// API server load balancer
    ApiServerLb,
    /// Service load balancers created inside the cluster
    Lb,
    /// Control plane instances
    ControlPlane,
    /// Every node
    Node,
    /// Extra group for nodes of a managed control plane
    NodeEksAdditional,
}

impl SecurityGroupRole {
    /// Roles converged for a cluster, in creation order
    #[must_use]
    pub fn cluster_roles(managed_control_plane: bool) -> Vec<SecurityGroupRole> {
        let mut roles = vec![
            SecurityGroupRole::Bastion,
            SecurityGroupRole::ApiServerLb,
            SecurityGroupRole::Lb,
            SecurityGroupRole::ControlPlane,
            SecurityGroupRole::Node,
        ];
        if managed_control_plane {
            roles.push(SecurityGroupRole::NodeEksAdditional);
        }
        roles
    }

    /// Key used in the status role map
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityGroupRole::Bastion => "bastion",
            SecurityGroupRole::ApiServerLb => "apiserver-lb",
            SecurityGroupRole::Lb => "lb",
            SecurityGroupRole::ControlPlane => "controlplane",
            SecurityGroupRole::Node => "node",
            SecurityGroupRole::NodeEksAdditional => "node-eks-additional",
        }
    }
}

impl fmt::Display for SecurityGroupRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed security group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroup {
    /// Group id
    pub id: String,

    /// Group name
    pub name: String,
}

/// Load balancer scheme
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancerScheme {
    /// Reachable from the internet, placed in public subnets
    #[default]
    InternetFacing,
    /// Reachable only inside the VPC, placed in private subnets
    Internal,
}

impl LoadBalancerScheme {
    /// Wire value
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancerScheme::InternetFacing => "internet-facing",
            LoadBalancerScheme::Internal => "internal",
        }
    }
}

/// Observed API server load balancer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerStatus {
    /// Load balancer name
    pub name: String,

    /// DNS name, empty until the provider assigns it
    #[serde(default)]
    pub dns_name: String,

    /// Scheme
    #[serde(default)]
    pub scheme: LoadBalancerScheme,

    /// Zones the load balancer serves
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub availability_zones: Vec<String>,
}

/// Observed network snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    /// VPC id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_id: Option<String>,

    /// Subnets, in discovery order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<Subnet>,

    /// Security groups keyed by role (see `SecurityGroupRole::as_str`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub security_groups: BTreeMap<String, SecurityGroup>,

    /// API server load balancer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server_elb: Option<LoadBalancerStatus>,
}

impl NetworkStatus {
    /// Subnet with the given id
    #[must_use]
    pub fn find_subnet(&self, id: &str) -> Option<&Subnet> {
        self.subnets.iter().find(|s| s.id == id)
    }

    /// Private subnets in discovery order
    pub fn private_subnets(&self) -> impl Iterator<Item = &Subnet> {
        self.subnets.iter().filter(|s| !s.is_public)
    }

    /// Public subnets in discovery order
    pub fn public_subnets(&self) -> impl Iterator<Item = &Subnet> {
        self.subnets.iter().filter(|s| s.is_public)
    }

    /// Security group recorded for a role
    #[must_use]
    pub fn security_group(&self, role: SecurityGroupRole) -> Option<&SecurityGroup> {
        self.security_groups.get(role.as_str())
    }
}

/// Per-zone failure domain flags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FailureDomain {
    /// Whether control plane machines may be placed in this zone
    #[serde(default)]
    pub control_plane: bool,
}
