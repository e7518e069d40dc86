//! AWSMachine CRD
//!
//! One compute instance of a cluster. The owning AWSCluster is referenced by
//! name within the same namespace.

use crate::conditions::Condition;
use crate::instance::{InstanceState, InstanceTemplate, MachineAddress};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Finalizer guarding AWSMachine deletion
pub const MACHINE_FINALIZER: &str = "awsmachine.infrastructure.cluster.x-k8s.io";
/// Worker role
pub const NODE_ROLE: &str = "node";
/// Control plane role
pub const CONTROL_PLANE_ROLE: &str = "control-plane";
/// Bastion role
pub const BASTION_ROLE: &str = "bastion";

fn default_role() -> String {
    NODE_ROLE.to_string()
}

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "AWSMachine",
    namespaced,
    status = "AWSMachineStatus",
    shortname = "awsm",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"Instance","type":"string","jsonPath":".status.instanceId"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.instanceState"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AWSMachineSpec {
    /// Name of the owning AWSCluster (same namespace)
    pub cluster_name: String,

    /// Machine role: "node" or "control-plane"
    #[serde(default = "default_role")]
    pub role: String,

    /// Kubernetes version, used for image lookup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Availability zone to place the instance in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,

    /// Instance configuration
    pub template: InstanceTemplate,

    /// Bootstrap user data (plain text)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
}

/// Observed state of an AWSMachine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AWSMachineStatus {
    /// Instance running
    #[serde(default)]
    pub ready: bool,

    /// Instance id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// Instance lifecycle state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_state: Option<InstanceState>,

    /// Instance addresses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    /// Additional tags applied on the last reconciliation
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub applied_tags: BTreeMap<String, String>,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_defaults_to_node() {
        let spec: AWSMachineSpec = serde_json::from_str(
            r#"{"clusterName":"prod","template":{"instanceType":"t3.large"}}"#,
        )
        .unwrap();
        assert_eq!(spec.role, NODE_ROLE);
        assert_eq!(spec.template.instance_type, "t3.large");
    }
}
