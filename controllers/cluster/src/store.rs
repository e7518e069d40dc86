//! Declarative object store access.
//!
//! Reconcilers read an object, mutate a working copy and write it back in
//! two steps: the status subresource is replaced wholesale, then finalizers
//! and spec go out as a merge patch. Both writes carry the `resourceVersion`
//! that was read, so the API server rejects them with 409 when the object
//! changed in between; that surfaces as `ControllerError::Conflict` and the
//! working copy is thrown away.
//!
//! Replacing the status means fields cleared in the working copy (a removed
//! bastion, an emptied condition list) are cleared in the stored object too.

use async_trait::async_trait;
use crds::{CLUSTER_API_GROUP, CLUSTER_KIND, ObjectKey};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::fmt::Debug;
use std::marker::PhantomData;
use tracing::debug;

use crate::error::ControllerError;

/// Kind of a managed control plane; its clusters skip load balancer groups
const MANAGED_CONTROL_PLANE_KIND: &str = "AWSManagedControlPlane";
const CONTROL_PLANE_INITIALIZED_CONDITION: &str = "ControlPlaneInitialized";
const CLUSTER_API_VERSION: &str = "v1beta1";

/// Get and optimistic-concurrency patch for one object kind
#[async_trait]
pub trait ObjectStore<K>: Send + Sync {
    /// Object by key; `None` when it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, ControllerError>;

    /// Persist `metadata.finalizers` and `spec`, guarded by `resourceVersion`
    async fn patch_object(&self, object: &K) -> Result<K, ControllerError>;

    /// Replace `status` with the one of `object`, guarded by `resourceVersion`
    async fn replace_status(&self, object: &K) -> Result<K, ControllerError>;
}

/// Write status, then finalizers and spec, carrying the new resource
/// version from the first write into the second.
pub async fn persist<K>(store: &dyn ObjectStore<K>, object: &K) -> Result<K, ControllerError>
where
    K: Resource + Clone + Send + Sync,
{
    let written = store.replace_status(object).await?;
    let mut next = object.clone();
    next.meta_mut().resource_version = written.meta().resource_version.clone();
    store.patch_object(&next).await
}

/// Adds `finalizer` if missing; `true` when the object changed
pub(crate) fn add_finalizer<K: Resource>(object: &mut K, finalizer: &str) -> bool {
    let finalizers = object.meta_mut().finalizers.get_or_insert_with(Vec::new);
    if finalizers.iter().any(|f| f == finalizer) {
        return false;
    }
    finalizers.push(finalizer.to_string());
    true
}

/// Removes `finalizer` if present
pub(crate) fn remove_finalizer<K: Resource>(object: &mut K, finalizer: &str) {
    if let Some(finalizers) = object.meta_mut().finalizers.as_mut() {
        finalizers.retain(|f| f != finalizer);
    }
}

pub(crate) fn object_key<K: Resource>(object: &K) -> Result<ObjectKey, ControllerError> {
    ObjectKey::from_meta(object.meta())
        .ok_or_else(|| ControllerError::InvalidConfig("object has no name or namespace".to_string()))
}

/// Merge patch body for finalizers + spec
pub(crate) fn object_patch<K: Resource + Serialize>(object: &K) -> Result<Value, ControllerError> {
    let value = serde_json::to_value(object)?;
    let mut patch = Map::new();
    patch.insert(
        "metadata".to_string(),
        json!({
            "resourceVersion": object.meta().resource_version,
            "finalizers": object.meta().finalizers.clone().unwrap_or_default(),
        }),
    );
    if let Some(spec) = value.get("spec") {
        patch.insert("spec".to_string(), spec.clone());
    }
    Ok(Value::Object(patch))
}

/// Replacement body for the status subresource: the whole object, whose
/// `metadata.resourceVersion` guards the write
pub(crate) fn status_body<K: Resource + Serialize>(object: &K) -> Result<Vec<u8>, ControllerError> {
    Ok(serde_json::to_vec(object)?)
}

fn write_error(key: &ObjectKey, error: kube::Error) -> ControllerError {
    match &error {
        kube::Error::Api(response) if response.code == 409 => ControllerError::Conflict(key.to_string()),
        _ => ControllerError::Kube(error),
    }
}

/// `ObjectStore` backed by the Kubernetes API
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, ControllerError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn patch_object(&self, object: &K) -> Result<K, ControllerError> {
        let key = object_key(object)?;
        let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);
        let patch = object_patch(object)?;
        debug!("Patching {} {}", K::kind(&()), key);
        api.patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| write_error(&key, e))
    }

    async fn replace_status(&self, object: &K) -> Result<K, ControllerError> {
        let key = object_key(object)?;
        let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);
        let body = status_body(object)?;
        debug!("Replacing status of {} {}", K::kind(&()), key);
        api.replace_status(&key.name, &PostParams::default(), body)
            .await
            .map_err(|e| write_error(&key, e))
    }
}

/// What the reconcilers need to know about the owning `Cluster`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnerCluster {
    /// Cluster name
    pub name: String,
    /// `spec.paused`
    pub paused: bool,
    /// Control plane is a managed variant
    pub managed_control_plane: bool,
    /// Control plane has been initialised
    pub control_plane_initialized: bool,
}

impl OwnerCluster {
    /// Read the fields of interest from an untyped `Cluster` object body
    #[must_use]
    pub fn from_value(name: &str, data: &Value) -> Self {
        let initialized_condition = data["status"]["conditions"]
            .as_array()
            .is_some_and(|conditions| {
                conditions.iter().any(|c| {
                    c["type"].as_str() == Some(CONTROL_PLANE_INITIALIZED_CONDITION)
                        && c["status"].as_str() == Some("True")
                })
            });
        Self {
            name: name.to_string(),
            paused: data["spec"]["paused"].as_bool().unwrap_or(false),
            managed_control_plane: data["spec"]["controlPlaneRef"]["kind"].as_str()
                == Some(MANAGED_CONTROL_PLANE_KIND),
            control_plane_initialized: initialized_condition
                || data["status"]["controlPlaneReady"].as_bool().unwrap_or(false),
        }
    }
}

/// Resolves the owning `Cluster` by identity
#[async_trait]
pub trait OwnerLookup: Send + Sync {
    /// Owner cluster by key; `None` when it does not exist
    async fn owner_cluster(&self, key: &ObjectKey) -> Result<Option<OwnerCluster>, ControllerError>;
}

/// `OwnerLookup` reading `cluster.x-k8s.io/v1beta1` Clusters as dynamic objects
pub struct KubeOwnerLookup {
    client: Client,
    resource: ApiResource,
}

impl KubeOwnerLookup {
    /// Create a lookup using the given client
    pub fn new(client: Client) -> Self {
        let gvk = GroupVersionKind::gvk(CLUSTER_API_GROUP, CLUSTER_API_VERSION, CLUSTER_KIND);
        Self {
            client,
            resource: ApiResource::from_gvk(&gvk),
        }
    }
}

#[async_trait]
impl OwnerLookup for KubeOwnerLookup {
    async fn owner_cluster(&self, key: &ObjectKey) -> Result<Option<OwnerCluster>, ControllerError> {
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), &key.namespace, &self.resource);
        Ok(api
            .get_opt(&key.name)
            .await?
            .map(|cluster| OwnerCluster::from_value(&key.name, &cluster.data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_cluster;

    #[test]
    fn test_owner_cluster_from_value() {
        let data = json!({
            "spec": {
                "paused": true,
                "controlPlaneRef": { "kind": "AWSManagedControlPlane", "name": "cp" }
            },
            "status": {
                "conditions": [{ "type": "ControlPlaneInitialized", "status": "True" }]
            }
        });
        let owner = OwnerCluster::from_value("prod", &data);
        assert_eq!(owner.name, "prod");
        assert!(owner.paused);
        assert!(owner.managed_control_plane);
        assert!(owner.control_plane_initialized);
    }

    #[test]
    fn test_owner_cluster_defaults_when_fields_missing() {
        let owner = OwnerCluster::from_value("prod", &json!({ "spec": {} }));
        assert!(!owner.paused);
        assert!(!owner.managed_control_plane);
        assert!(!owner.control_plane_initialized);
    }

    #[test]
    fn test_patches_carry_resource_version() {
        let mut cluster = test_cluster("prod");
        cluster.metadata.resource_version = Some("42".to_string());
        cluster.metadata.finalizers = Some(vec![crds::CLUSTER_FINALIZER.to_string()]);

        let object = object_patch(&cluster).unwrap();
        assert_eq!(object["metadata"]["resourceVersion"], "42");
        assert_eq!(object["metadata"]["finalizers"][0], crds::CLUSTER_FINALIZER);
        assert_eq!(object["spec"]["region"], "us-east-1");
        assert!(object.get("status").is_none());

        cluster.status = Some(crds::AWSClusterStatus {
            ready: true,
            ..Default::default()
        });
        let status: Value = serde_json::from_slice(&status_body(&cluster).unwrap()).unwrap();
        assert_eq!(status["metadata"]["resourceVersion"], "42");
        assert_eq!(status["status"]["ready"], true);
        assert!(status["status"].get("bastion").is_none());
    }

    #[test]
    fn test_finalizer_helpers() {
        let mut cluster = test_cluster("prod");
        assert!(add_finalizer(&mut cluster, crds::CLUSTER_FINALIZER));
        assert!(!add_finalizer(&mut cluster, crds::CLUSTER_FINALIZER));
        assert_eq!(cluster.metadata.finalizers.as_ref().map(Vec::len), Some(1));

        remove_finalizer(&mut cluster, crds::CLUSTER_FINALIZER);
        assert_eq!(cluster.metadata.finalizers, Some(Vec::new()));
    }
}
