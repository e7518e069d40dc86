//! API server load balancer convergence.

use async_trait::async_trait;
use cloud_client::{CloudClientTrait, CreateLoadBalancerRequest, Listener, LoadBalancer};
use crds::{LoadBalancerScheme, LoadBalancerStatus, SecurityGroupRole};
use std::sync::Arc;
use tracing::{debug, info};

use super::Converger;
use crate::error::{CloudResultExt, ControllerError, ignore_not_found};
use crate::resolvers::tags;
use crate::scope::ClusterScope;

/// Provider limit on load balancer names
const MAX_NAME_LENGTH: usize = 32;
const TCP: &str = "TCP";
const ROLE: &str = "apiserver";

/// Load balancer name for a cluster, cut to the provider limit
pub fn load_balancer_name(cluster: &str) -> String {
    let mut name = format!("{cluster}-{ROLE}");
    if name.len() > MAX_NAME_LENGTH {
        let mut end = MAX_NAME_LENGTH;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

/// Load balancer converger
pub struct LoadBalancerService {
    client: Arc<dyn CloudClientTrait>,
}

impl LoadBalancerService {
    /// Create a converger
    pub fn new(client: Arc<dyn CloudClientTrait>) -> Self {
        Self { client }
    }

    async fn describe(&self, name: &str) -> Result<Option<LoadBalancer>, ControllerError> {
        self.client
            .describe_load_balancer(name)
            .await
            .with_operation(|| format!("describe load balancer {name}"))
    }
}

#[async_trait]
impl Converger for LoadBalancerService {
    async fn reconcile(&self, scope: &mut ClusterScope) -> Result<(), ControllerError> {
        let scheme = scope.spec().control_plane_load_balancer.scheme;
        let subnet_ids: Vec<String> = match scheme {
            LoadBalancerScheme::InternetFacing => scope.network().public_subnets().map(|s| s.id.clone()).collect(),
            LoadBalancerScheme::Internal => scope.network().private_subnets().map(|s| s.id.clone()).collect(),
        };
        if subnet_ids.is_empty() {
            return Err(ControllerError::FailedDependency(format!(
                "no {} subnets available for the API server load balancer",
                if scheme == LoadBalancerScheme::Internal { "private" } else { "public" }
            )));
        }
        let group = scope
            .network()
            .security_group(SecurityGroupRole::ApiServerLb)
            .map(|g| g.id.clone())
            .ok_or_else(|| {
                ControllerError::FailedDependency("API server load balancer security group not available".to_string())
            })?;

        let name = load_balancer_name(scope.name());
        let load_balancer = match self.describe(&name).await? {
            Some(existing) => {
                let missing: Vec<String> = subnet_ids
                    .iter()
                    .filter(|id| !existing.subnet_ids.contains(id))
                    .cloned()
                    .collect();
                if missing.is_empty() {
                    debug!("Load balancer {} up to date", name);
                    existing
                } else {
                    info!("Attaching {} subnets to load balancer {}", missing.len(), name);
                    self.client
                        .attach_load_balancer_subnets(&name, &missing)
                        .await
                        .with_operation(|| format!("attach subnets to load balancer {name}"))?;
                    self.describe(&name)
                        .await?
                        .ok_or_else(|| ControllerError::Cloud {
                            operation: format!("describe load balancer {name}"),
                            source: cloud_client::CloudError::NotFound(name.clone()),
                        })?
                }
            }
            None => {
                info!("Creating load balancer {} for cluster {}", name, scope.key);
                let port = scope.api_server_port;
                self.client
                    .create_load_balancer(CreateLoadBalancerRequest {
                        name: name.clone(),
                        scheme: scheme.as_str().to_string(),
                        subnet_ids,
                        security_group_ids: vec![group],
                        listeners: vec![Listener {
                            protocol: TCP.to_string(),
                            load_balancer_port: port,
                            instance_protocol: TCP.to_string(),
                            instance_port: port,
                        }],
                        tags: tags::to_cloud_tags(&scope.resource_tags(&name, ROLE)),
                    })
                    .await
                    .with_operation(|| format!("create load balancer {name}"))?
            }
        };

        scope.status.network.api_server_elb = Some(LoadBalancerStatus {
            name: load_balancer.name,
            dns_name: load_balancer.dns_name,
            scheme,
            availability_zones: load_balancer.availability_zones,
        });
        Ok(())
    }

    async fn delete(&self, scope: &mut ClusterScope) -> Result<(), ControllerError> {
        let name = load_balancer_name(scope.name());
        info!("Deleting load balancer {} of cluster {}", name, scope.key);
        ignore_not_found(self.client.delete_load_balancer(&name).await)
            .with_operation(|| format!("delete load balancer {name}"))?;
        scope.status.network.api_server_elb = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ready_scope;
    use cloud_client::MockCloudClient;

    #[test]
    fn test_name_is_truncated() {
        assert_eq!(load_balancer_name("prod"), "prod-apiserver");
        let name = load_balancer_name("a-very-long-cluster-name-for-testing");
        assert_eq!(name.len(), 32);
        assert!(name.starts_with("a-very-long-cluster-name"));
    }

    #[tokio::test]
    async fn test_creates_in_public_subnets() {
        let cloud = MockCloudClient::default();
        let mut scope = ready_scope(&cloud, "prod");
        scope.status.network.api_server_elb = None;
        let service = LoadBalancerService::new(Arc::new(cloud.clone()));
        service.reconcile(&mut scope).await.unwrap();

        let created = cloud.load_balancer("prod-apiserver").unwrap();
        let public: Vec<String> = scope.network().public_subnets().map(|s| s.id.clone()).collect();
        assert_eq!(created.subnet_ids, public);
        assert_eq!(created.scheme, "internet-facing");
        assert_eq!(created.listeners[0].load_balancer_port, 6443);
        assert_eq!(
            created.security_group_ids,
            vec![scope.network().security_groups["apiserver-lb"].id.clone()]
        );

        let status = scope.network().api_server_elb.clone().unwrap();
        assert_eq!(status.dns_name, created.dns_name);
        assert_eq!(status.availability_zones, vec!["us-east-1a".to_string()]);

        cloud.clear_calls();
        service.reconcile(&mut scope).await.unwrap();
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_internal_scheme_uses_private_subnets() {
        let cloud = MockCloudClient::default();
        let mut scope = ready_scope(&cloud, "prod");
        scope.cluster.spec.control_plane_load_balancer.scheme = LoadBalancerScheme::Internal;
        LoadBalancerService::new(Arc::new(cloud.clone()))
            .reconcile(&mut scope)
            .await
            .unwrap();
        let private: Vec<String> = scope.network().private_subnets().map(|s| s.id.clone()).collect();
        assert_eq!(cloud.load_balancer("prod-apiserver").unwrap().subnet_ids, private);
    }

    #[tokio::test]
    async fn test_missing_group_is_failed_dependency() {
        let cloud = MockCloudClient::default();
        let mut scope = ready_scope(&cloud, "prod");
        scope.status.network.security_groups.remove("apiserver-lb");
        let err = LoadBalancerService::new(Arc::new(cloud.clone()))
            .reconcile(&mut scope)
            .await
            .unwrap_err();
        assert!(err.is_failed_dependency());
        assert!(cloud.calls().iter().all(|c| !c.starts_with("CreateLoadBalancer")));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let cloud = MockCloudClient::default();
        let mut scope = ready_scope(&cloud, "prod");
        let service = LoadBalancerService::new(Arc::new(cloud.clone()));
        service.reconcile(&mut scope).await.unwrap();

        service.delete(&mut scope).await.unwrap();
        assert!(cloud.load_balancer("prod-apiserver").is_none());
        assert!(scope.network().api_server_elb.is_none());
        service.delete(&mut scope).await.unwrap();
    }
}
