//! Security group convergence.
//!
//! One group per role, named `<cluster>-<role>`. Ingress rules reference
//! other groups of the same cluster, so every group is ensured before any
//! rule is written.

use async_trait::async_trait;
use cloud_client::{CloudClientTrait, CreateSecurityGroupRequest, Filter, IngressRule, SecurityGroup};
use crds::SecurityGroupRole;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::Converger;
use crate::error::{CloudResultExt, ControllerError, ignore_not_found};
use crate::resolvers::tags;
use crate::scope::ClusterScope;

const ANYWHERE: &str = "0.0.0.0/0";
const TCP: &str = "tcp";

/// Security group converger
pub struct SecurityGroupService {
    client: Arc<dyn CloudClientTrait>,
}

impl SecurityGroupService {
    /// Create a converger
    pub fn new(client: Arc<dyn CloudClientTrait>) -> Self {
        Self { client }
    }

    async fn ensure_group(
        &self,
        scope: &ClusterScope,
        vpc_id: &str,
        role: SecurityGroupRole,
    ) -> Result<SecurityGroup, ControllerError> {
        let name = format!("{}-{role}", scope.name());
        let existing = self
            .client
            .describe_security_groups(&[Filter::new("group-name", [name.as_str()]), Filter::new("vpc-id", [vpc_id])])
            .await
            .with_operation(|| format!("describe security group {name}"))?;
        if let Some(group) = existing.into_iter().next() {
            return Ok(group);
        }

        info!("Creating security group {} for cluster {}", name, scope.key);
        self.client
            .create_security_group(CreateSecurityGroupRequest {
                vpc_id: vpc_id.to_string(),
                group_name: name.clone(),
                description: format!("Kubernetes cluster {}: {role}", scope.name()),
                tags: tags::to_cloud_tags(&scope.resource_tags(&name, role.as_str())),
            })
            .await
            .with_operation(|| format!("create security group {name}"))
    }

    async fn converge_rules(&self, group: &SecurityGroup, desired: &[IngressRule]) -> Result<(), ControllerError> {
        let missing: Vec<IngressRule> = desired
            .iter()
            .filter(|r| !group.ingress_rules.contains(r))
            .cloned()
            .collect();
        let extra: Vec<IngressRule> = group
            .ingress_rules
            .iter()
            .filter(|r| !desired.contains(r))
            .cloned()
            .collect();

        if missing.is_empty() && extra.is_empty() {
            debug!("Ingress rules of {} up to date", group.group_name);
            return Ok(());
        }
        if !missing.is_empty() {
            info!("Authorizing {} ingress rules on {}", missing.len(), group.group_name);
            self.client
                .authorize_ingress(&group.group_id, &missing)
                .await
                .with_operation(|| format!("authorize ingress on {}", group.group_id))?;
        }
        if !extra.is_empty() {
            info!("Revoking {} ingress rules on {}", extra.len(), group.group_name);
            self.client
                .revoke_ingress(&group.group_id, &extra)
                .await
                .with_operation(|| format!("revoke ingress on {}", group.group_id))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Converger for SecurityGroupService {
    async fn reconcile(&self, scope: &mut ClusterScope) -> Result<(), ControllerError> {
        let vpc_id = scope
            .vpc_id()
            .map(str::to_string)
            .ok_or_else(|| ControllerError::FailedDependency("VPC not available yet".to_string()))?;

        let mut groups = Vec::new();
        for role in SecurityGroupRole::cluster_roles(scope.is_managed_control_plane()) {
            let group = self.ensure_group(scope, &vpc_id, role).await?;
            scope.status.network.security_groups.insert(
                role.as_str().to_string(),
                crds::SecurityGroup {
                    id: group.group_id.clone(),
                    name: group.group_name.clone(),
                },
            );
            groups.push((role, group));
        }

        let ids: BTreeMap<SecurityGroupRole, String> = groups
            .iter()
            .map(|(role, group)| (*role, group.group_id.clone()))
            .collect();
        for (role, group) in &groups {
            let desired = ingress_rules(*role, &ids, scope);
            self.converge_rules(group, &desired).await?;
        }
        Ok(())
    }

    async fn delete(&self, scope: &mut ClusterScope) -> Result<(), ControllerError> {
        let Some(vpc_id) = scope.vpc_id().map(str::to_string) else {
            scope.status.network.security_groups.clear();
            return Ok(());
        };
        let groups = self
            .client
            .describe_security_groups(&[
                Filter::new("vpc-id", [vpc_id.as_str()]),
                Filter::new(format!("tag:{}", tags::cluster_tag_key(scope.name())), [tags::OWNED]),
            ])
            .await
            .with_operation(|| format!("describe security groups of {vpc_id}"))?;

        // Groups reference each other; drop every rule before any group
        for group in groups.iter().filter(|g| !g.ingress_rules.is_empty()) {
            ignore_not_found(self.client.revoke_ingress(&group.group_id, &group.ingress_rules).await)
                .with_operation(|| format!("revoke ingress on {}", group.group_id))?;
        }
        for group in &groups {
            info!("Deleting security group {} of cluster {}", group.group_name, scope.key);
            ignore_not_found(self.client.delete_security_group(&group.group_id).await)
                .with_operation(|| format!("delete security group {}", group.group_id))?;
        }

        scope.status.network.security_groups.clear();
        Ok(())
    }
}

fn rule(description: &str, from_port: i32, to_port: i32) -> IngressRule {
    IngressRule {
        description: description.to_string(),
        protocol: TCP.to_string(),
        from_port,
        to_port,
        cidr_blocks: Vec::new(),
        source_security_group_ids: Vec::new(),
    }
}

fn from_cidrs(mut rule: IngressRule, cidrs: Vec<String>) -> IngressRule {
    rule.cidr_blocks = cidrs;
    rule
}

fn from_groups(mut rule: IngressRule, ids: &BTreeMap<SecurityGroupRole, String>, roles: &[SecurityGroupRole]) -> IngressRule {
    rule.source_security_group_ids = roles.iter().filter_map(|r| ids.get(r).cloned()).collect();
    rule
}

/// Desired ingress rules of a role's group
fn ingress_rules(
    role: SecurityGroupRole,
    ids: &BTreeMap<SecurityGroupRole, String>,
    scope: &ClusterScope,
) -> Vec<IngressRule> {
    use SecurityGroupRole::{ApiServerLb, Bastion, ControlPlane, Lb, Node, NodeEksAdditional};

    let api_port = scope.api_server_port;
    let anywhere = || vec![ANYWHERE.to_string()];
    match role {
        Bastion => {
            let allowed = &scope.spec().bastion.allowed_cidr_blocks;
            let cidrs = if allowed.is_empty() { anywhere() } else { allowed.clone() };
            vec![from_cidrs(rule("SSH", 22, 22), cidrs)]
        }
        ApiServerLb => vec![from_cidrs(rule("Kubernetes API", api_port, api_port), anywhere())],
        ControlPlane => vec![
            from_groups(rule("Kubernetes API", api_port, api_port), ids, &[ApiServerLb, ControlPlane, Node]),
            from_groups(rule("SSH", 22, 22), ids, &[Bastion]),
            from_groups(rule("etcd", 2379, 2380), ids, &[ControlPlane]),
        ],
        Node => vec![
            from_cidrs(rule("Node port services", 30000, 32767), anywhere()),
            from_groups(rule("SSH", 22, 22), ids, &[Bastion]),
            from_groups(rule("Kubelet API", 10250, 10250), ids, &[ControlPlane, Node]),
        ],
        Lb | NodeEksAdditional => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::scope_for;
    use cloud_client::MockCloudClient;

    async fn scope_with_vpc(cloud: &MockCloudClient) -> ClusterScope {
        let vpc = cloud
            .create_vpc(cloud_client::CreateVpcRequest {
                cidr_block: "10.0.0.0/16".to_string(),
                tags: Vec::new(),
            })
            .await
            .unwrap();
        cloud.clear_calls();
        let mut scope = scope_for("prod");
        scope.status.network.vpc_id = Some(vpc.vpc_id);
        scope
    }

    #[tokio::test]
    async fn test_requires_vpc() {
        let cloud = MockCloudClient::default();
        let mut scope = scope_for("prod");
        let err = SecurityGroupService::new(Arc::new(cloud.clone()))
            .reconcile(&mut scope)
            .await
            .unwrap_err();
        assert!(err.is_failed_dependency());
    }

    #[tokio::test]
    async fn test_creates_one_group_per_role_with_rules() {
        let cloud = MockCloudClient::default();
        let mut scope = scope_with_vpc(&cloud).await;
        let service = SecurityGroupService::new(Arc::new(cloud.clone()));
        service.reconcile(&mut scope).await.unwrap();

        assert_eq!(cloud.security_group_count(), 5);
        assert_eq!(cloud.call_count("CreateSecurityGroup"), 5);
        // bastion, apiserver-lb, controlplane and node carry rules
        assert_eq!(cloud.call_count("AuthorizeSecurityGroupIngress"), 4);

        let control_plane = scope.network().security_group(SecurityGroupRole::ControlPlane).unwrap();
        assert_eq!(control_plane.name, "prod-controlplane");
        let groups = cloud
            .describe_security_groups(&[Filter::new("group-id", [control_plane.id.as_str()])])
            .await
            .unwrap();
        let api_rule = groups[0].ingress_rules.iter().find(|r| r.from_port == 6443).unwrap();
        assert_eq!(api_rule.source_security_group_ids.len(), 3);

        cloud.clear_calls();
        service.reconcile(&mut scope).await.unwrap();
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_managed_control_plane_adds_node_additional_group() {
        let cloud = MockCloudClient::default();
        let mut scope = scope_with_vpc(&cloud).await;
        scope.owner.managed_control_plane = true;
        SecurityGroupService::new(Arc::new(cloud.clone()))
            .reconcile(&mut scope)
            .await
            .unwrap();
        assert!(scope.network().security_group(SecurityGroupRole::NodeEksAdditional).is_some());
    }

    #[tokio::test]
    async fn test_drifted_rules_are_revoked_and_restored() {
        let cloud = MockCloudClient::default();
        let mut scope = scope_with_vpc(&cloud).await;
        let service = SecurityGroupService::new(Arc::new(cloud.clone()));
        service.reconcile(&mut scope).await.unwrap();

        let bastion = scope.network().security_group(SecurityGroupRole::Bastion).unwrap().id.clone();
        let stray = from_cidrs(rule("debug", 8080, 8080), vec![ANYWHERE.to_string()]);
        cloud.authorize_ingress(&bastion, &[stray]).await.unwrap();
        cloud.clear_calls();

        scope.cluster.spec.bastion.allowed_cidr_blocks = vec!["192.0.2.0/24".to_string()];
        service.reconcile(&mut scope).await.unwrap();
        assert_eq!(
            cloud.calls(),
            vec![
                format!("AuthorizeSecurityGroupIngress:{bastion}"),
                format!("RevokeSecurityGroupIngress:{bastion}"),
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_revokes_before_deleting() {
        let cloud = MockCloudClient::default();
        let mut scope = scope_with_vpc(&cloud).await;
        let service = SecurityGroupService::new(Arc::new(cloud.clone()));
        service.reconcile(&mut scope).await.unwrap();
        cloud.clear_calls();

        service.delete(&mut scope).await.unwrap();
        assert_eq!(cloud.security_group_count(), 0);
        assert!(scope.network().security_groups.is_empty());
        let calls = cloud.calls();
        let first_delete = calls.iter().position(|c| c.starts_with("DeleteSecurityGroup:")).unwrap();
        assert!(calls[..first_delete].iter().all(|c| c.starts_with("RevokeSecurityGroupIngress:")));
    }
}
