//! VPC and subnet convergence.
//!
//! A VPC given by id is adopted as-is and never tagged or deleted. Otherwise
//! the cluster owns its VPC: it is found by ownership tags or created, and
//! removed again on delete together with the subnets the cluster created.

use async_trait::async_trait;
use cloud_client::{CloudClientTrait, CreateSubnetRequest, CreateVpcRequest, Filter, Subnet, Vpc};
use crds::conditions::{
    SUBNETS_READY_CONDITION, SUBNETS_RECONCILIATION_FAILED_REASON, VPC_READY_CONDITION,
    VPC_RECONCILIATION_FAILED_REASON, mark_false, mark_true,
};
use crds::{DEFAULT_VPC_CIDR, SubnetSpec};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::Converger;
use crate::error::{CloudResultExt, ControllerError, ignore_not_found};
use crate::resolvers::tags;
use crate::scope::ClusterScope;

const COMMON_ROLE: &str = "common";
const PUBLIC_ROLE: &str = "public";
const PRIVATE_ROLE: &str = "private";

/// Network converger
pub struct NetworkService {
    client: Arc<dyn CloudClientTrait>,
}

impl NetworkService {
    /// Create a converger
    pub fn new(client: Arc<dyn CloudClientTrait>) -> Self {
        Self { client }
    }

    async fn describe_vpc(&self, filters: &[Filter]) -> Result<Option<Vpc>, ControllerError> {
        Ok(self
            .client
            .describe_vpcs(filters)
            .await
            .with_operation(|| "describe VPCs".to_string())?
            .into_iter()
            .next())
    }

    async fn reconcile_vpc(&self, scope: &mut ClusterScope) -> Result<(), ControllerError> {
        let spec = scope.spec().network.vpc.clone();

        if let Some(id) = spec.id.as_deref().filter(|id| !id.is_empty()) {
            let vpc = self
                .describe_vpc(&[Filter::new("vpc-id", [id])])
                .await?
                .ok_or_else(|| ControllerError::FailedDependency(format!("VPC {id} not found")))?;
            debug!("Using unmanaged VPC {} for cluster {}", vpc.vpc_id, scope.key);
            scope.status.network.vpc_id = Some(vpc.vpc_id);
            return Ok(());
        }

        let name = format!("{}-vpc", scope.name());
        let mut vpc = match scope.vpc_id() {
            Some(id) => self.describe_vpc(&[Filter::new("vpc-id", [id])]).await?,
            None => None,
        };
        if vpc.is_none() {
            vpc = self.describe_vpc(&owned_filters(scope.name(), &name)).await?;
        }

        let desired = scope.resource_tags(&name, COMMON_ROLE);
        let vpc = match vpc {
            Some(vpc) => {
                converge_owned_tags(self.client.as_ref(), &vpc.vpc_id, &vpc.tags, &desired).await?;
                vpc
            }
            None => {
                info!("Creating VPC {} ({}) for cluster {}", name, spec.cidr_block, scope.key);
                self.client
                    .create_vpc(CreateVpcRequest {
                        cidr_block: spec.cidr_block.clone(),
                        tags: tags::to_cloud_tags(&desired),
                    })
                    .await
                    .with_operation(|| format!("create VPC for {}", scope.key))?
            }
        };
        scope.status.network.vpc_id = Some(vpc.vpc_id);
        Ok(())
    }

    async fn reconcile_subnets(&self, scope: &mut ClusterScope) -> Result<(), ControllerError> {
        let vpc_id = scope
            .vpc_id()
            .map(str::to_string)
            .ok_or_else(|| ControllerError::FailedDependency("VPC not available yet".to_string()))?;
        let network = &scope.spec().network;
        let unmanaged = network.vpc.is_unmanaged();

        let specs = if !network.subnets.is_empty() {
            network.subnets.clone()
        } else if unmanaged {
            let subnets = self
                .client
                .describe_subnets(&[Filter::new("vpc-id", [vpc_id.as_str()])])
                .await
                .with_operation(|| format!("describe subnets of {vpc_id}"))?;
            if subnets.is_empty() {
                return Err(ControllerError::FailedDependency(format!("no subnets found in VPC {vpc_id}")));
            }
            scope.status.network.subnets = subnets
                .into_iter()
                .map(|s| crds::Subnet {
                    is_public: s.map_public_ip_on_launch,
                    cidr_block: Some(s.cidr_block),
                    availability_zone: s.availability_zone,
                    id: s.subnet_id,
                })
                .collect();
            return Ok(());
        } else if network.vpc.cidr_block == DEFAULT_VPC_CIDR {
            default_subnets(scope.region())
        } else {
            return Err(ControllerError::InvalidConfig(format!(
                "subnets must be specified for VPC CIDR block {}",
                network.vpc.cidr_block
            )));
        };

        let mut observed = Vec::with_capacity(specs.len());
        for spec in &specs {
            let subnet = self.reconcile_subnet(scope, &vpc_id, unmanaged, spec).await?;
            observed.push(crds::Subnet {
                id: subnet.subnet_id,
                availability_zone: subnet.availability_zone,
                cidr_block: Some(subnet.cidr_block),
                is_public: spec.is_public,
            });
        }
        scope.status.network.subnets = observed;
        Ok(())
    }

    async fn reconcile_subnet(
        &self,
        scope: &ClusterScope,
        vpc_id: &str,
        unmanaged: bool,
        spec: &SubnetSpec,
    ) -> Result<Subnet, ControllerError> {
        if let Some(id) = spec.id.as_deref().filter(|id| !id.is_empty()) {
            return self
                .describe_subnet(&[Filter::new("subnet-id", [id])])
                .await?
                .ok_or_else(|| ControllerError::FailedDependency(format!("subnet {id} not found")));
        }

        let cidr = spec.cidr_block.as_deref().ok_or_else(|| {
            ControllerError::InvalidConfig("subnets need either an id or a CIDR block".to_string())
        })?;
        let zone = spec
            .availability_zone
            .clone()
            .unwrap_or_else(|| format!("{}a", scope.region()));
        let role = if spec.is_public { PUBLIC_ROLE } else { PRIVATE_ROLE };
        let name = format!("{}-subnet-{role}-{zone}", scope.name());
        let desired = scope.resource_tags(&name, role);

        let existing = self
            .describe_subnet(&[Filter::new("vpc-id", [vpc_id]), Filter::new("cidr-block", [cidr])])
            .await?;
        match existing {
            Some(subnet) => {
                if !unmanaged {
                    converge_owned_tags(self.client.as_ref(), &subnet.subnet_id, &subnet.tags, &desired).await?;
                }
                Ok(subnet)
            }
            None if unmanaged => Err(ControllerError::FailedDependency(format!(
                "subnet {cidr} not found in unmanaged VPC {vpc_id}"
            ))),
            None => {
                info!("Creating subnet {} ({}) for cluster {}", name, cidr, scope.key);
                self.client
                    .create_subnet(CreateSubnetRequest {
                        vpc_id: vpc_id.to_string(),
                        cidr_block: cidr.to_string(),
                        availability_zone: zone,
                        map_public_ip_on_launch: spec.is_public,
                        tags: tags::to_cloud_tags(&desired),
                    })
                    .await
                    .with_operation(|| format!("create subnet {cidr} for {}", scope.key))
            }
        }
    }

    async fn describe_subnet(&self, filters: &[Filter]) -> Result<Option<Subnet>, ControllerError> {
        Ok(self
            .client
            .describe_subnets(filters)
            .await
            .with_operation(|| "describe subnets".to_string())?
            .into_iter()
            .next())
    }
}

#[async_trait]
impl Converger for NetworkService {
    async fn reconcile(&self, scope: &mut ClusterScope) -> Result<(), ControllerError> {
        let severity = scope.failure_severity();
        if let Err(e) = self.reconcile_vpc(scope).await {
            mark_false(
                &mut scope.status.conditions,
                VPC_READY_CONDITION,
                VPC_RECONCILIATION_FAILED_REASON,
                severity,
                e.to_string(),
            );
            return Err(e);
        }
        mark_true(&mut scope.status.conditions, VPC_READY_CONDITION);

        if let Err(e) = self.reconcile_subnets(scope).await {
            mark_false(
                &mut scope.status.conditions,
                SUBNETS_READY_CONDITION,
                SUBNETS_RECONCILIATION_FAILED_REASON,
                severity,
                e.to_string(),
            );
            return Err(e);
        }
        mark_true(&mut scope.status.conditions, SUBNETS_READY_CONDITION);
        Ok(())
    }

    async fn delete(&self, scope: &mut ClusterScope) -> Result<(), ControllerError> {
        if scope.spec().network.vpc.is_unmanaged() {
            debug!("Leaving unmanaged network of cluster {} in place", scope.key);
            return Ok(());
        }
        let Some(vpc_id) = scope.vpc_id().map(str::to_string) else {
            debug!("No VPC recorded for cluster {}", scope.key);
            return Ok(());
        };

        let owned = self
            .client
            .describe_subnets(&[
                Filter::new("vpc-id", [vpc_id.as_str()]),
                Filter::new(format!("tag:{}", tags::cluster_tag_key(scope.name())), [tags::OWNED]),
            ])
            .await
            .with_operation(|| format!("describe subnets of {vpc_id}"))?;
        for subnet in owned {
            info!("Deleting subnet {} of cluster {}", subnet.subnet_id, scope.key);
            ignore_not_found(self.client.delete_subnet(&subnet.subnet_id).await)
                .with_operation(|| format!("delete subnet {}", subnet.subnet_id))?;
        }

        info!("Deleting VPC {} of cluster {}", vpc_id, scope.key);
        ignore_not_found(self.client.delete_vpc(&vpc_id).await).with_operation(|| format!("delete VPC {vpc_id}"))?;

        scope.status.network.vpc_id = None;
        scope.status.network.subnets.clear();
        Ok(())
    }
}

fn owned_filters(cluster: &str, name: &str) -> Vec<Filter> {
    vec![
        Filter::new(format!("tag:{}", tags::cluster_tag_key(cluster)), [tags::OWNED]),
        Filter::new(format!("tag:{}", tags::NAME_TAG), [name]),
    ]
}

/// Write missing or changed ownership tags. Tags outside `desired` belong to
/// someone else and are kept.
async fn converge_owned_tags(
    client: &dyn CloudClientTrait,
    resource_id: &str,
    current: &[cloud_client::Tag],
    desired: &BTreeMap<String, String>,
) -> Result<(), ControllerError> {
    let current: BTreeMap<String, String> = tags::from_cloud_tags(current)
        .into_iter()
        .filter(|(k, _)| desired.contains_key(k))
        .collect();
    tags::apply_tag_diff(client, resource_id, &tags::diff(&current, desired)).await
}

/// One private and one public subnet in the region's first zone
fn default_subnets(region: &str) -> Vec<SubnetSpec> {
    let zone = format!("{region}a");
    vec![
        SubnetSpec {
            id: None,
            cidr_block: Some("10.0.0.0/24".to_string()),
            availability_zone: Some(zone.clone()),
            is_public: false,
        },
        SubnetSpec {
            id: None,
            cidr_block: Some("10.0.1.0/24".to_string()),
            availability_zone: Some(zone),
            is_public: true,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::scope_for;
    use cloud_client::{MockCloudClient, Tag};
    use crds::conditions::is_true;

    fn converger(cloud: &MockCloudClient) -> NetworkService {
        NetworkService::new(Arc::new(cloud.clone()))
    }

    #[tokio::test]
    async fn test_creates_owned_vpc_and_spec_subnets() {
        let cloud = MockCloudClient::default();
        let mut scope = scope_for("prod");
        converger(&cloud).reconcile(&mut scope).await.unwrap();

        let vpc_id = scope.vpc_id().unwrap().to_string();
        assert_eq!(cloud.vpc_count(), 1);
        assert_eq!(scope.network().subnets.len(), 2);
        assert_eq!(scope.network().private_subnets().count(), 1);
        assert!(is_true(&scope.status.conditions, VPC_READY_CONDITION));
        assert!(is_true(&scope.status.conditions, SUBNETS_READY_CONDITION));

        let subnets = cloud
            .describe_subnets(&[Filter::new("vpc-id", [vpc_id.as_str()])])
            .await
            .unwrap();
        assert!(subnets.iter().any(|s| s.map_public_ip_on_launch));
        assert!(
            subnets
                .iter()
                .all(|s| cloud_client::tag_value(&s.tags, "sigs.k8s.io/cluster-api-provider-aws/cluster/prod")
                    == Some("owned"))
        );
    }

    #[tokio::test]
    async fn test_second_reconcile_issues_no_writes() {
        let cloud = MockCloudClient::default();
        let mut scope = scope_for("prod");
        let network = converger(&cloud);
        network.reconcile(&mut scope).await.unwrap();
        let first = scope.network().clone();

        cloud.clear_calls();
        network.reconcile(&mut scope).await.unwrap();
        assert!(cloud.calls().is_empty());
        assert_eq!(scope.network(), &first);
    }

    #[tokio::test]
    async fn test_default_subnets_for_empty_spec() {
        let cloud = MockCloudClient::default();
        let mut scope = scope_for("prod");
        scope.cluster.spec.network.subnets.clear();
        converger(&cloud).reconcile(&mut scope).await.unwrap();

        let cidrs: Vec<Option<&str>> = scope.network().subnets.iter().map(|s| s.cidr_block.as_deref()).collect();
        assert_eq!(cidrs, vec![Some("10.0.0.0/24"), Some("10.0.1.0/24")]);
        assert!(scope.network().subnets.iter().all(|s| s.availability_zone == "us-east-1a"));
    }

    #[tokio::test]
    async fn test_custom_cidr_requires_subnets() {
        let cloud = MockCloudClient::default();
        let mut scope = scope_for("prod");
        scope.cluster.spec.network.subnets.clear();
        scope.cluster.spec.network.vpc.cidr_block = "172.16.0.0/16".to_string();
        let err = converger(&cloud).reconcile(&mut scope).await.unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
        assert!(!is_true(&scope.status.conditions, SUBNETS_READY_CONDITION));
        assert!(is_true(&scope.status.conditions, VPC_READY_CONDITION));
    }

    #[tokio::test]
    async fn test_missing_unmanaged_vpc_is_failed_dependency() {
        let cloud = MockCloudClient::default();
        let mut scope = scope_for("prod");
        scope.cluster.spec.network.vpc.id = Some("vpc-missing".to_string());
        let err = converger(&cloud).reconcile(&mut scope).await.unwrap_err();
        assert!(err.is_failed_dependency());
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unmanaged_vpc_adopts_every_subnet() {
        let cloud = MockCloudClient::default();
        cloud.add_vpc(Vpc {
            vpc_id: "vpc-byo".to_string(),
            cidr_block: "10.1.0.0/16".to_string(),
            state: "available".to_string(),
            tags: vec![Tag::new("team", "net")],
        });
        for (id, public) in [("subnet-a", false), ("subnet-b", true)] {
            cloud.add_subnet(Subnet {
                subnet_id: id.to_string(),
                vpc_id: "vpc-byo".to_string(),
                cidr_block: "10.1.0.0/24".to_string(),
                availability_zone: "us-east-1b".to_string(),
                state: "available".to_string(),
                map_public_ip_on_launch: public,
                tags: Vec::new(),
            });
        }
        let mut scope = scope_for("prod");
        scope.cluster.spec.network.vpc.id = Some("vpc-byo".to_string());
        scope.cluster.spec.network.subnets.clear();

        let network = converger(&cloud);
        network.reconcile(&mut scope).await.unwrap();
        assert_eq!(scope.vpc_id(), Some("vpc-byo"));
        assert_eq!(scope.network().public_subnets().count(), 1);
        assert!(cloud.calls().is_empty());

        network.delete(&mut scope).await.unwrap();
        assert!(cloud.calls().is_empty());
        assert_eq!(scope.vpc_id(), Some("vpc-byo"));
    }

    #[tokio::test]
    async fn test_delete_removes_subnets_then_vpc() {
        let cloud = MockCloudClient::default();
        let mut scope = scope_for("prod");
        let network = converger(&cloud);
        network.reconcile(&mut scope).await.unwrap();
        cloud.clear_calls();

        network.delete(&mut scope).await.unwrap();
        let calls = cloud.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].starts_with("DeleteSubnet:"));
        assert!(calls[1].starts_with("DeleteSubnet:"));
        assert!(calls[2].starts_with("DeleteVpc:"));
        assert_eq!(cloud.vpc_count(), 0);
        assert!(scope.vpc_id().is_none());

        // Already gone
        network.delete(&mut scope).await.unwrap();
    }
}
