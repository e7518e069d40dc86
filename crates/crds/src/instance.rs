//! Compute instance types
//!
//! `InstanceTemplate` is the per-machine configuration surface; `Instance` is
//! the observed shape of a running (or terminated) instance.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Provider filter (name + accepted values)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    /// Filter name (e.g. "tag:Name")
    pub name: String,

    /// Accepted values
    pub values: Vec<String>,
}

/// Reference to a provider resource, by id or by filters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AwsResourceReference {
    /// Explicit id, wins over filters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Filters resolved at reconcile time
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
}

/// Managed-control-plane image flavours
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum EksAmiLookupType {
    /// Standard image
    #[default]
    AmazonLinux,
    /// GPU-enabled image
    AmazonLinuxGPU,
}

/// Image reference
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AmiReference {
    /// Explicit image id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Flavour used for managed-control-plane lookups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eks_optimized_lookup_type: Option<EksAmiLookupType>,
}

/// Block device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Device name; required for non-root volumes, ignored for the root volume
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_name: String,

    /// Size in GiB
    pub size: i64,

    /// Volume type (e.g. "gp3")
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,

    /// Provisioned IOPS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops: Option<i64>,

    /// Encrypt the volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<bool>,

    /// Key used for encryption; implies `encrypted`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
}

/// Spot purchase options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SpotMarketOptions {
    /// Maximum hourly price, passed through verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_price: Option<String>,
}

/// Per-machine instance configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTemplate {
    /// Instance type (e.g. "t3.large")
    pub instance_type: String,

    /// Image reference
    #[serde(default)]
    pub ami: AmiReference,

    /// Image name lookup format, overrides the cluster default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_lookup_format: Option<String>,

    /// Image owner organisation, overrides the cluster default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_lookup_org: Option<String>,

    /// Image base OS, overrides the cluster default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_lookup_base_os: Option<String>,

    /// IAM instance profile name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iam_instance_profile: Option<String>,

    /// Subnet by id or filters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<AwsResourceReference>,

    /// Security groups added to the role groups
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_security_groups: Vec<AwsResourceReference>,

    /// Tags added to the cluster tags
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_tags: BTreeMap<String, String>,

    /// SSH key; absent inherits, empty string means no key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_name: Option<String>,

    /// Spot options; absent means on-demand
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot_market_options: Option<SpotMarketOptions>,

    /// Placement tenancy ("default", "dedicated", "host")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenancy: Option<String>,

    /// Root volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_volume: Option<Volume>,

    /// Additional volumes; each needs a device name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_root_volumes: Vec<Volume>,

    /// Existing network interfaces; exclusive with subnet and security groups
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_interfaces: Vec<String>,
}

/// Instance lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    /// Launching
    Pending,
    /// Running
    Running,
    /// Being terminated
    ShuttingDown,
    /// Terminated
    Terminated,
    /// Being stopped
    Stopping,
    /// Stopped
    Stopped,
    /// Unrecognised state
    #[default]
    Unknown,
}

impl InstanceState {
    /// Parses the provider's state name
    #[must_use]
    pub fn from_cloud(name: &str) -> Self {
        match name {
            "pending" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "shutting-down" => InstanceState::ShuttingDown,
            "terminated" => InstanceState::Terminated,
            "stopping" => InstanceState::Stopping,
            "stopped" => InstanceState::Stopped,
            _ => InstanceState::Unknown,
        }
    }

    /// Provider's state name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Unknown => "unknown",
        }
    }
}

/// Address kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum MachineAddressType {
    /// Private IP
    InternalIP,
    /// Public IP
    ExternalIP,
    /// Private DNS name
    InternalDNS,
    /// Public DNS name
    ExternalDNS,
}

/// Instance address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineAddress {
    /// Address kind
    #[serde(rename = "type")]
    pub address_type: MachineAddressType,

    /// Address value
    pub address: String,
}

/// Observed compute instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Instance id
    pub id: String,

    /// Instance type
    #[serde(default)]
    pub instance_type: String,

    /// Image id
    #[serde(default)]
    pub image_id: String,

    /// Subnet id
    #[serde(default)]
    pub subnet_id: String,

    /// Security group ids, unique
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_group_ids: Vec<String>,

    /// Tags
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,

    /// IAM instance profile name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iam_profile: Option<String>,

    /// Root volume as requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_volume: Option<Volume>,

    /// Non-root volumes as requested
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_root_volumes: Vec<Volume>,

    /// Network interface ids
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_interfaces: Vec<String>,

    /// SSH key name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_name: Option<String>,

    /// Spot options; absent means on-demand
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot_market_options: Option<SpotMarketOptions>,

    /// Lifecycle state
    #[serde(default)]
    pub state: InstanceState,

    /// Availability zone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,

    /// Private IP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,

    /// Public IP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,

    /// Addresses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_state_round_trips_provider_names() {
        for name in ["pending", "running", "shutting-down", "terminated", "stopping", "stopped"] {
            assert_eq!(InstanceState::from_cloud(name).as_str(), name);
        }
        assert_eq!(InstanceState::from_cloud("rebooting"), InstanceState::Unknown);
    }

    #[test]
    fn test_template_ssh_key_empty_string_is_preserved() {
        let template: InstanceTemplate =
            serde_json::from_str(r#"{"instanceType":"t3.large","sshKeyName":""}"#).unwrap();
        assert_eq!(template.ssh_key_name.as_deref(), Some(""));

        let inherit: InstanceTemplate = serde_json::from_str(r#"{"instanceType":"t3.large"}"#).unwrap();
        assert_eq!(inherit.ssh_key_name, None);
    }

    #[test]
    fn test_volume_type_field_name() {
        let volume: Volume = serde_json::from_str(r#"{"size":20,"type":"gp3","iops":3000}"#).unwrap();
        assert_eq!(volume.volume_type.as_deref(), Some("gp3"));
        assert_eq!(volume.iops, Some(3000));
        assert!(volume.device_name.is_empty());
    }
}
