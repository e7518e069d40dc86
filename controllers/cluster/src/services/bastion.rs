//! Bastion host convergence.

use async_trait::async_trait;
use cloud_client::CloudClientTrait;
use crds::conditions::{BASTION_HOST_READY_CONDITION, delete as delete_condition};
use crds::{AmiReference, AwsResourceReference, BASTION_ROLE, Instance, InstanceState, InstanceTemplate};
use std::sync::Arc;
use tracing::{debug, info};

use super::Converger;
use crate::error::ControllerError;
use crate::instances::{InstanceRequest, InstanceService};
use crate::resolvers::image;
use crate::scope::ClusterScope;

/// Instance type used when none is configured
pub const DEFAULT_BASTION_INSTANCE_TYPE: &str = "t3.micro";

/// Bastion converger
pub struct BastionService {
    client: Arc<dyn CloudClientTrait>,
    instances: InstanceService,
}

impl BastionService {
    /// Create a converger
    pub fn new(client: Arc<dyn CloudClientTrait>, instances: InstanceService) -> Self {
        Self { client, instances }
    }

    fn instance_name(scope: &ClusterScope) -> String {
        format!("{}-bastion", scope.name())
    }

    /// Recorded bastion if it is still alive, else one found by tags
    async fn find(&self, scope: &ClusterScope) -> Result<Option<Instance>, ControllerError> {
        if let Some(recorded) = &scope.status.bastion {
            if let Some(instance) = self.instances.instance_by_id(&recorded.id).await? {
                if matches!(instance.state, InstanceState::Pending | InstanceState::Running) {
                    return Ok(Some(instance));
                }
            }
        }
        self.instances
            .find_existing(scope.name(), &Self::instance_name(scope), scope.vpc_id())
            .await
    }

    async fn create(&self, scope: &ClusterScope) -> Result<Instance, ControllerError> {
        let spec = &scope.spec().bastion;
        let subnet = scope
            .network()
            .public_subnets()
            .next()
            .map(|s| s.id.clone())
            .ok_or_else(|| {
                ControllerError::FailedDependency("no public subnets available for the bastion host".to_string())
            })?;
        let image_id = match spec.ami.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => {
                image::newest_image(self.client.as_ref(), image::BASTION_IMAGE_NAME, image::BASTION_IMAGE_OWNER)
                    .await?
            }
        };
        let template = InstanceTemplate {
            instance_type: spec
                .instance_type
                .clone()
                .unwrap_or_else(|| DEFAULT_BASTION_INSTANCE_TYPE.to_string()),
            ami: AmiReference {
                id: Some(image_id),
                eks_optimized_lookup_type: None,
            },
            subnet: Some(AwsResourceReference {
                id: Some(subnet),
                filters: Vec::new(),
            }),
            ..Default::default()
        };

        let name = Self::instance_name(scope);
        info!("Creating bastion host {} for cluster {}", name, scope.key);
        self.instances
            .create_instance(
                scope,
                &InstanceRequest {
                    name: &name,
                    role: BASTION_ROLE,
                    template: &template,
                    version: None,
                    failure_domain: None,
                    user_data: None,
                },
            )
            .await
    }
}

#[async_trait]
impl Converger for BastionService {
    async fn reconcile(&self, scope: &mut ClusterScope) -> Result<(), ControllerError> {
        if !scope.spec().bastion.enabled {
            if let Some(bastion) = scope.status.bastion.take() {
                info!("Bastion disabled, terminating {} of cluster {}", bastion.id, scope.key);
                self.instances.terminate(&bastion.id).await?;
            }
            delete_condition(&mut scope.status.conditions, BASTION_HOST_READY_CONDITION);
            return Ok(());
        }

        let bastion = match self.find(scope).await? {
            Some(instance) => {
                debug!("Bastion host {} of cluster {} exists", instance.id, scope.key);
                instance
            }
            None => self.create(scope).await?,
        };
        scope.status.bastion = Some(bastion);
        Ok(())
    }

    async fn delete(&self, scope: &mut ClusterScope) -> Result<(), ControllerError> {
        let bastion = match scope.status.bastion.clone() {
            Some(bastion) => Some(bastion),
            None => {
                self.instances
                    .find_existing(scope.name(), &Self::instance_name(scope), scope.vpc_id())
                    .await?
            }
        };
        if let Some(bastion) = bastion {
            info!("Terminating bastion host {} of cluster {}", bastion.id, scope.key);
            self.instances.terminate_and_wait(&bastion.id).await?;
        }
        scope.status.bastion = None;
        Ok(())
    }
}
