//! Cluster bucket convergence.

use async_trait::async_trait;
use cloud_client::CloudClientTrait;
use std::sync::Arc;
use tracing::{debug, info};

use super::Converger;
use crate::error::{CloudResultExt, ControllerError, ignore_not_found};
use crate::scope::ClusterScope;

/// Bucket converger; a no-op unless the cluster declares a bucket
pub struct ObjectStoreService {
    client: Arc<dyn CloudClientTrait>,
}

impl ObjectStoreService {
    /// Create a converger
    pub fn new(client: Arc<dyn CloudClientTrait>) -> Self {
        Self { client }
    }
}

fn bucket_name(scope: &ClusterScope) -> Option<String> {
    scope.spec().s3_bucket.as_ref().map(|b| b.name.clone())
}

#[async_trait]
impl Converger for ObjectStoreService {
    async fn reconcile(&self, scope: &mut ClusterScope) -> Result<(), ControllerError> {
        let Some(name) = bucket_name(scope) else {
            return Ok(());
        };
        let exists = self
            .client
            .bucket_exists(&name)
            .await
            .with_operation(|| format!("check bucket {name}"))?;
        if exists {
            debug!("Bucket {} exists", name);
            return Ok(());
        }
        info!("Creating bucket {} for cluster {}", name, scope.key);
        self.client
            .create_bucket(&name)
            .await
            .with_operation(|| format!("create bucket {name}"))
    }

    async fn delete(&self, scope: &mut ClusterScope) -> Result<(), ControllerError> {
        let Some(name) = bucket_name(scope) else {
            return Ok(());
        };
        info!("Deleting bucket {} of cluster {}", name, scope.key);
        ignore_not_found(self.client.delete_bucket(&name).await).with_operation(|| format!("delete bucket {name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::scope_for;
    use cloud_client::MockCloudClient;
    use crds::S3Bucket;

    #[tokio::test]
    async fn test_without_bucket_does_nothing() {
        let cloud = MockCloudClient::default();
        let mut scope = scope_for("prod");
        let service = ObjectStoreService::new(Arc::new(cloud.clone()));
        service.reconcile(&mut scope).await.unwrap();
        service.delete(&mut scope).await.unwrap();
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_creates_then_deletes_bucket() {
        let cloud = MockCloudClient::default();
        let mut scope = scope_for("prod");
        scope.cluster.spec.s3_bucket = Some(S3Bucket {
            name: "prod-ignition".to_string(),
        });
        let service = ObjectStoreService::new(Arc::new(cloud.clone()));

        service.reconcile(&mut scope).await.unwrap();
        service.reconcile(&mut scope).await.unwrap();
        assert!(cloud.has_bucket("prod-ignition"));
        assert_eq!(cloud.call_count("CreateBucket"), 1);

        service.delete(&mut scope).await.unwrap();
        service.delete(&mut scope).await.unwrap();
        assert!(!cloud.has_bucket("prod-ignition"));
    }
}
