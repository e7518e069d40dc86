//! Cross-object references
//!
//! Objects point at their owning cluster by identity (namespace + name) and
//! resolve it through a lookup on demand. No object holds another directly.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// API group of the owning `Cluster` object
pub const CLUSTER_API_GROUP: &str = "cluster.x-k8s.io";
/// Kind of the owning `Cluster` object
pub const CLUSTER_KIND: &str = "Cluster";

/// By-identity reference to an object in a namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectKey {
    /// Namespace
    pub namespace: String,

    /// Name
    pub name: String,
}

impl ObjectKey {
    /// Create a key
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an object from its metadata; `None` when name or namespace is missing
    #[must_use]
    pub fn from_meta(meta: &ObjectMeta) -> Option<Self> {
        Some(Self::new(meta.namespace.clone()?, meta.name.clone()?))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Key of the owning `Cluster`, taken from the owner references.
///
/// Owner references are namespace-local, so the owner lives in the same
/// namespace as the owned object.
#[must_use]
pub fn owner_cluster_key(meta: &ObjectMeta) -> Option<ObjectKey> {
    let namespace = meta.namespace.clone()?;
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.kind == CLUSTER_KIND && r.api_version.split('/').next() == Some(CLUSTER_API_GROUP))
        .map(|r| ObjectKey::new(namespace, r.name.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn owner(api_version: &str, kind: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: "uid-1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_owner_cluster_key_found() {
        let meta = ObjectMeta {
            name: Some("infra".to_string()),
            namespace: Some("team-a".to_string()),
            owner_references: Some(vec![
                owner("v1", "ConfigMap", "other"),
                owner("cluster.x-k8s.io/v1beta1", "Cluster", "prod"),
            ]),
            ..Default::default()
        };
        assert_eq!(owner_cluster_key(&meta), Some(ObjectKey::new("team-a", "prod")));
    }

    #[test]
    fn test_owner_cluster_key_absent() {
        let meta = ObjectMeta {
            name: Some("infra".to_string()),
            namespace: Some("team-a".to_string()),
            ..Default::default()
        };
        assert_eq!(owner_cluster_key(&meta), None);
        assert_eq!(ObjectKey::from_meta(&meta).map(|k| k.to_string()).as_deref(), Some("team-a/infra"));
    }
}
