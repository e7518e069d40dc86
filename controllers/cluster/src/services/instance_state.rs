//! Instance state-change notifications.
//!
//! A queue per cluster receives the provider's notifications for instances
//! that are shutting down or terminated, routed there by an event rule.

use async_trait::async_trait;
use cloud_client::{CloudClientTrait, EventRule, Queue};
use crds::conditions::{EVENT_BRIDGE_READY_CONDITION, mark_true};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use super::Converger;
use crate::error::{CloudResultExt, ControllerError, ignore_not_found};
use crate::scope::ClusterScope;

/// Queue and rule converger; a no-op unless enabled
pub struct InstanceStateService {
    client: Arc<dyn CloudClientTrait>,
    enabled: bool,
}

impl InstanceStateService {
    /// Create a converger
    pub fn new(client: Arc<dyn CloudClientTrait>, enabled: bool) -> Self {
        Self { client, enabled }
    }

    async fn ensure_queue(&self, name: &str) -> Result<Queue, ControllerError> {
        let existing = self
            .client
            .describe_queue(name)
            .await
            .with_operation(|| format!("describe queue {name}"))?;
        match existing {
            Some(queue) => Ok(queue),
            None => {
                info!("Creating queue {}", name);
                self.client
                    .create_queue(name)
                    .await
                    .with_operation(|| format!("create queue {name}"))
            }
        }
    }
}

fn queue_name(cluster: &str) -> String {
    format!("{cluster}-queue")
}

fn rule_name(cluster: &str) -> String {
    format!("{cluster}-ec2-rule")
}

/// Matches shutting-down and terminated instance notifications
fn event_pattern() -> String {
    json!({
        "source": ["aws.ec2"],
        "detail-type": ["EC2 Instance State-change Notification"],
        "detail": { "state": ["shutting-down", "terminated"] },
    })
    .to_string()
}

#[async_trait]
impl Converger for InstanceStateService {
    async fn reconcile(&self, scope: &mut ClusterScope) -> Result<(), ControllerError> {
        if !self.enabled {
            return Ok(());
        }
        let queue = self.ensure_queue(&queue_name(scope.name())).await?;

        let desired = EventRule {
            name: rule_name(scope.name()),
            event_pattern: event_pattern(),
            target_arn: queue.arn,
        };
        let current = self
            .client
            .describe_event_rule(&desired.name)
            .await
            .with_operation(|| format!("describe event rule {}", desired.name))?;
        if current.as_ref() == Some(&desired) {
            debug!("Event rule {} up to date", desired.name);
        } else {
            info!("Writing event rule {} for cluster {}", desired.name, scope.key);
            let name = desired.name.clone();
            self.client
                .put_event_rule(desired)
                .await
                .with_operation(|| format!("put event rule {name}"))?;
        }

        mark_true(&mut scope.status.conditions, EVENT_BRIDGE_READY_CONDITION);
        Ok(())
    }

    async fn delete(&self, scope: &mut ClusterScope) -> Result<(), ControllerError> {
        if !self.enabled {
            return Ok(());
        }
        let rule = rule_name(scope.name());
        ignore_not_found(self.client.delete_event_rule(&rule).await)
            .with_operation(|| format!("delete event rule {rule}"))?;
        let queue = queue_name(scope.name());
        ignore_not_found(self.client.delete_queue(&queue).await).with_operation(|| format!("delete queue {queue}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::scope_for;
    use cloud_client::MockCloudClient;
    use crds::conditions::is_true;

    #[tokio::test]
    async fn test_disabled_does_nothing() {
        let cloud = MockCloudClient::default();
        let mut scope = scope_for("prod");
        InstanceStateService::new(Arc::new(cloud.clone()), false)
            .reconcile(&mut scope)
            .await
            .unwrap();
        assert!(cloud.calls().is_empty());
        assert!(!is_true(&scope.status.conditions, EVENT_BRIDGE_READY_CONDITION));
    }

    #[tokio::test]
    async fn test_creates_queue_and_rule_once() {
        let cloud = MockCloudClient::default();
        let mut scope = scope_for("prod");
        let service = InstanceStateService::new(Arc::new(cloud.clone()), true);

        service.reconcile(&mut scope).await.unwrap();
        assert_eq!(cloud.calls(), vec!["CreateQueue:prod-queue", "PutRule:prod-ec2-rule"]);
        assert!(is_true(&scope.status.conditions, EVENT_BRIDGE_READY_CONDITION));

        let rule = cloud.describe_event_rule("prod-ec2-rule").await.unwrap().unwrap();
        assert_eq!(rule.target_arn, "arn:aws:sqs:us-east-1:123456789012:prod-queue");
        let pattern: serde_json::Value = serde_json::from_str(&rule.event_pattern).unwrap();
        assert_eq!(pattern["detail"]["state"][1], "terminated");

        cloud.clear_calls();
        service.reconcile(&mut scope).await.unwrap();
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_rule_then_queue() {
        let cloud = MockCloudClient::default();
        let mut scope = scope_for("prod");
        let service = InstanceStateService::new(Arc::new(cloud.clone()), true);
        service.reconcile(&mut scope).await.unwrap();
        cloud.clear_calls();

        service.delete(&mut scope).await.unwrap();
        assert_eq!(cloud.calls(), vec!["DeleteRule:prod-ec2-rule", "DeleteQueue:prod-queue"]);
        service.delete(&mut scope).await.unwrap();
    }
}
