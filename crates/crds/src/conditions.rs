//! Condition model
//!
//! Typed, timestamped status facts attached to a desired-state object.
//! At most one condition exists per type. Re-applying a condition whose status
//! is unchanged keeps the original transition timestamp.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Summary condition of the whole object.
pub const READY_CONDITION: &str = "Ready";
/// VPC converged.
pub const VPC_READY_CONDITION: &str = "VpcReady";
/// Subnets converged.
pub const SUBNETS_READY_CONDITION: &str = "SubnetsReady";
/// Security groups for every role exist.
pub const CLUSTER_SECURITY_GROUPS_READY_CONDITION: &str = "ClusterSecurityGroupsReady";
/// Bastion host converged.
pub const BASTION_HOST_READY_CONDITION: &str = "BastionHostReady";
/// API server load balancer exists and its DNS name resolves.
pub const LOAD_BALANCER_READY_CONDITION: &str = "LoadBalancerReady";
/// Object store bucket converged.
pub const S3_BUCKET_READY_CONDITION: &str = "S3BucketReady";
/// Instance-state event integration converged.
pub const EVENT_BRIDGE_READY_CONDITION: &str = "EventBridgeReady";
/// Machine instance is running.
pub const INSTANCE_READY_CONDITION: &str = "InstanceReady";

/// VPC reconciliation failed.
pub const VPC_RECONCILIATION_FAILED_REASON: &str = "VpcReconciliationFailed";
/// Subnet reconciliation failed.
pub const SUBNETS_RECONCILIATION_FAILED_REASON: &str = "SubnetsReconciliationFailed";
/// Security group reconciliation failed.
pub const SECURITY_GROUP_RECONCILIATION_FAILED_REASON: &str = "SecurityGroupReconciliationFailed";
/// Bastion host reconciliation failed.
pub const BASTION_FAILED_REASON: &str = "BastionHostFailed";
/// Load balancer reconciliation failed.
pub const LOAD_BALANCER_FAILED_REASON: &str = "LoadBalancerFailed";
/// Bucket reconciliation failed.
pub const S3_BUCKET_FAILED_REASON: &str = "S3BucketCreationFailed";
/// Event integration setup failed.
pub const EVENT_BRIDGE_FAILED_REASON: &str = "EventBridgeFailed";
/// Load balancer has no DNS name yet.
pub const WAIT_FOR_DNS_NAME_REASON: &str = "WaitForDNSName";
/// Load balancer DNS name does not resolve yet.
pub const WAIT_FOR_DNS_NAME_RESOLVE_REASON: &str = "WaitForDNSNameResolve";
/// Owning cluster infrastructure is not ready.
pub const WAITING_FOR_CLUSTER_INFRASTRUCTURE_REASON: &str = "WaitingForClusterInfrastructure";
/// Instance creation failed.
pub const INSTANCE_PROVISION_FAILED_REASON: &str = "InstanceProvisionFailed";
/// Instance exists but is not running.
pub const INSTANCE_NOT_READY_REASON: &str = "InstanceNotReady";
/// Teardown is in progress.
pub const DELETING_REASON: &str = "Deleting";
/// A teardown step failed.
pub const DELETION_FAILED_REASON: &str = "DeletionFailed";

/// Tri-state condition status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    /// The condition holds
    True,
    /// The condition does not hold
    False,
    /// Not yet observed
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Severity of a `False` condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionSeverity {
    /// Informational, expected to clear on its own
    Info,
    /// Degraded, may need attention
    Warning,
    /// Broken
    Error,
}

/// A typed status fact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g. "LoadBalancerReady")
    #[serde(rename = "type")]
    pub type_: String,

    /// Current status
    pub status: ConditionStatus,

    /// Severity, only set while status is `False`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<ConditionSeverity>,

    /// Machine-readable reason code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the status changed
    pub last_transition_time: DateTime<Utc>,
}

/// Returns the condition of the given type, if present.
#[must_use]
pub fn get<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether the condition of the given type is present and `True`.
#[must_use]
pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    get(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Sets the condition of the given type to `True`.
pub fn mark_true(conditions: &mut Vec<Condition>, type_: &str) {
    set(conditions, Condition {
        type_: type_.to_string(),
        status: ConditionStatus::True,
        severity: None,
        reason: None,
        message: None,
        last_transition_time: Utc::now(),
    });
}

/// Sets the condition of the given type to `False` with a reason and message.
pub fn mark_false(
    conditions: &mut Vec<Condition>,
    type_: &str,
    reason: &str,
    severity: ConditionSeverity,
    message: impl Into<String>,
) {
    let message = message.into();
    set(conditions, Condition {
        type_: type_.to_string(),
        status: ConditionStatus::False,
        severity: Some(severity),
        reason: Some(reason.to_string()),
        message: (!message.is_empty()).then_some(message),
        last_transition_time: Utc::now(),
    });
}

/// Inserts or replaces a condition, keeping the previous transition time
/// when the status did not change.
pub fn set(conditions: &mut Vec<Condition>, mut condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time;
        }
        *existing = condition;
    } else {
        conditions.push(condition);
    }

    // Ready first, then alphabetical
    conditions.sort_by(|a, b| {
        (a.type_ != READY_CONDITION, &a.type_).cmp(&(b.type_ != READY_CONDITION, &b.type_))
    });
}

/// Removes the condition of the given type.
pub fn delete(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stale(type_: &str, status: ConditionStatus) -> Condition {
        Condition {
            type_: type_.to_string(),
            status,
            severity: None,
            reason: None,
            message: None,
            last_transition_time: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_mark_true_keeps_timestamp_when_unchanged() {
        let mut conditions = vec![stale(VPC_READY_CONDITION, ConditionStatus::True)];
        let before = conditions[0].last_transition_time;

        mark_true(&mut conditions, VPC_READY_CONDITION);
        mark_true(&mut conditions, VPC_READY_CONDITION);

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, before);
    }

    #[test]
    fn test_mark_false_twice_keeps_timestamp() {
        let mut conditions = vec![stale(LOAD_BALANCER_READY_CONDITION, ConditionStatus::False)];
        let before = conditions[0].last_transition_time;

        mark_false(
            &mut conditions,
            LOAD_BALANCER_READY_CONDITION,
            WAIT_FOR_DNS_NAME_REASON,
            ConditionSeverity::Info,
            "",
        );
        mark_false(
            &mut conditions,
            LOAD_BALANCER_READY_CONDITION,
            WAIT_FOR_DNS_NAME_REASON,
            ConditionSeverity::Info,
            "",
        );

        let condition = get(&conditions, LOAD_BALANCER_READY_CONDITION).unwrap();
        assert_eq!(condition.last_transition_time, before);
        assert_eq!(condition.reason.as_deref(), Some(WAIT_FOR_DNS_NAME_REASON));
        assert_eq!(condition.message, None);
    }

    #[test]
    fn test_status_flip_updates_timestamp() {
        let mut conditions = vec![stale(BASTION_HOST_READY_CONDITION, ConditionStatus::False)];
        let before = conditions[0].last_transition_time;

        mark_true(&mut conditions, BASTION_HOST_READY_CONDITION);

        assert!(is_true(&conditions, BASTION_HOST_READY_CONDITION));
        assert!(conditions[0].last_transition_time > before);
        assert_eq!(conditions[0].severity, None);
    }

    #[test]
    fn test_one_condition_per_type_ready_first() {
        let mut conditions = Vec::new();
        mark_true(&mut conditions, VPC_READY_CONDITION);
        mark_true(&mut conditions, BASTION_HOST_READY_CONDITION);
        mark_false(&mut conditions, READY_CONDITION, DELETING_REASON, ConditionSeverity::Info, "tearing down");
        mark_true(&mut conditions, VPC_READY_CONDITION);

        let types: Vec<&str> = conditions.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(types, vec![READY_CONDITION, BASTION_HOST_READY_CONDITION, VPC_READY_CONDITION]);
    }

    #[test]
    fn test_condition_serializes_type_field() {
        let mut conditions = Vec::new();
        mark_false(
            &mut conditions,
            S3_BUCKET_READY_CONDITION,
            S3_BUCKET_FAILED_REASON,
            ConditionSeverity::Error,
            "access denied",
        );
        let json = serde_json::to_value(&conditions[0]).unwrap();
        assert_eq!(json["type"], "S3BucketReady");
        assert_eq!(json["status"], "False");
        assert_eq!(json["severity"], "Error");
        assert!(json.get("lastTransitionTime").is_some());
    }
}
