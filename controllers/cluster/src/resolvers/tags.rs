//! Ownership tags and tag diffing.

use cloud_client::{CloudClientTrait, Tag};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{CloudResultExt, ControllerError};

/// Prefix of the per-cluster ownership tag key
pub const CLUSTER_TAG_PREFIX: &str = "sigs.k8s.io/cluster-api-provider-aws/cluster/";
/// Role tag key
pub const ROLE_TAG: &str = "sigs.k8s.io/cluster-api-provider-aws/role";
/// Name tag key
pub const NAME_TAG: &str = "Name";
/// Ownership value for resources the controller created
pub const OWNED: &str = "owned";

/// Ownership tag key of a cluster
#[must_use]
pub fn cluster_tag_key(cluster: &str) -> String {
    format!("{CLUSTER_TAG_PREFIX}{cluster}")
}

/// Tags for a resource owned by `cluster`. Ownership, name and role tags
/// override additional tags with the same key.
#[must_use]
pub fn build_tags(
    cluster: &str,
    name: &str,
    role: &str,
    additional: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut tags = additional.clone();
    tags.insert(cluster_tag_key(cluster), OWNED.to_string());
    tags.insert(NAME_TAG.to_string(), name.to_string());
    tags.insert(ROLE_TAG.to_string(), role.to_string());
    tags
}

/// Provider tag list, sorted by key
#[must_use]
pub fn to_cloud_tags(tags: &BTreeMap<String, String>) -> Vec<Tag> {
    tags.iter().map(|(k, v)| Tag::new(k, v)).collect()
}

/// Tag map from a provider tag list
#[must_use]
pub fn from_cloud_tags(tags: &[Tag]) -> BTreeMap<String, String> {
    tags.iter().map(|t| (t.key.clone(), t.value.clone())).collect()
}

/// Changes turning one tag map into another
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDiff {
    /// Tags to create or overwrite
    pub create: BTreeMap<String, String>,
    /// Tags to remove
    pub remove: BTreeMap<String, String>,
}

impl TagDiff {
    /// No change needed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.remove.is_empty()
    }
}

/// `create` holds desired entries missing from or different in `current`;
/// `remove` holds current keys absent from `desired`.
#[must_use]
pub fn diff(current: &BTreeMap<String, String>, desired: &BTreeMap<String, String>) -> TagDiff {
    let create = desired
        .iter()
        .filter(|(k, v)| current.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let remove = current
        .iter()
        .filter(|(k, _)| !desired.contains_key(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    TagDiff { create, remove }
}

/// Apply a diff to a resource. Create and remove are independent calls and
/// an empty half is never sent.
pub async fn apply_tag_diff(
    client: &dyn CloudClientTrait,
    resource_id: &str,
    diff: &TagDiff,
) -> Result<(), ControllerError> {
    if diff.is_empty() {
        debug!("Tags of {} already up to date", resource_id);
        return Ok(());
    }
    if !diff.create.is_empty() {
        client
            .create_tags(resource_id, &to_cloud_tags(&diff.create))
            .await
            .with_operation(|| format!("create tags on {resource_id}"))?;
    }
    if !diff.remove.is_empty() {
        client
            .delete_tags(resource_id, &to_cloud_tags(&diff.remove))
            .await
            .with_operation(|| format!("delete tags on {resource_id}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloud_client::{MockCloudClient, Vpc};

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    #[test]
    fn test_diff_create_and_remove() {
        let d = diff(&map(&[("a", "1"), ("b", "2")]), &map(&[("b", "2"), ("c", "3")]));
        assert_eq!(d.create, map(&[("c", "3")]));
        assert_eq!(d.remove, map(&[("a", "1")]));
    }

    #[test]
    fn test_diff_changed_value_is_created() {
        let d = diff(&map(&[("a", "1")]), &map(&[("a", "2")]));
        assert_eq!(d.create, map(&[("a", "2")]));
        assert!(d.remove.is_empty());
    }

    #[test]
    fn test_build_tags_ownership_wins() {
        let tags = build_tags("prod", "prod-vpc", "common", &map(&[("Name", "custom"), ("team", "infra")]));
        assert_eq!(tags.get("Name").map(String::as_str), Some("prod-vpc"));
        assert_eq!(tags.get("team").map(String::as_str), Some("infra"));
        assert_eq!(
            tags.get("sigs.k8s.io/cluster-api-provider-aws/cluster/prod").map(String::as_str),
            Some("owned")
        );
    }

    #[tokio::test]
    async fn test_apply_tag_diff_issues_one_call_per_half() {
        let cloud = MockCloudClient::default();
        cloud.add_vpc(Vpc {
            vpc_id: "vpc-1".to_string(),
            cidr_block: "10.0.0.0/16".to_string(),
            state: "available".to_string(),
            tags: to_cloud_tags(&map(&[("a", "1"), ("b", "2")])),
        });

        let d = diff(&map(&[("a", "1"), ("b", "2")]), &map(&[("b", "2"), ("c", "3")]));
        apply_tag_diff(&cloud, "vpc-1", &d).await.unwrap();
        assert_eq!(cloud.calls(), vec!["CreateTags:vpc-1", "DeleteTags:vpc-1"]);

        cloud.clear_calls();
        apply_tag_diff(&cloud, "vpc-1", &TagDiff::default()).await.unwrap();
        assert!(cloud.calls().is_empty());
    }
}
