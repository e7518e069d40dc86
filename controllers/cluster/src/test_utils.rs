//! Test utilities for unit testing reconcilers
//!
//! Fixtures for AWSCluster objects and scopes, plus in-memory stand-ins for
//! the object store, owner lookup, event sink and DNS resolver.

use async_trait::async_trait;
use cloud_client::{CloudClientTrait, MockCloudClient, SecurityGroup, Subnet, Vpc};
use crds::{
    AWSCluster, AWSClusterSpec, DEFAULT_VPC_CIDR, LoadBalancerScheme, LoadBalancerStatus, NetworkSpec, ObjectKey,
    SecurityGroupRole, SubnetSpec, VpcSpec,
};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::ControllerError;
use crate::events::{EventKind, EventSink};
use crate::dns::DnsResolver;
use crate::instances::InstanceTimeouts;
use crate::resolvers::tags;
use crate::scope::ClusterScope;
use crate::services::CloudServices;
use crate::store::{ObjectStore, OwnerCluster, OwnerLookup, object_key, object_patch, status_body};

/// AWSCluster `default/<name>` owned by Cluster `<name>` with one private
/// and one public subnet in `us-east-1a`
pub fn test_cluster(name: &str) -> AWSCluster {
    AWSCluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(format!("{name}-uid")),
            owner_references: Some(vec![OwnerReference {
                api_version: "cluster.x-k8s.io/v1beta1".to_string(),
                kind: "Cluster".to_string(),
                name: name.to_string(),
                uid: format!("{name}-owner-uid"),
                ..Default::default()
            }]),
            ..Default::default()
        },
        spec: AWSClusterSpec {
            region: "us-east-1".to_string(),
            network: NetworkSpec {
                vpc: VpcSpec {
                    id: None,
                    cidr_block: DEFAULT_VPC_CIDR.to_string(),
                },
                subnets: vec![
                    SubnetSpec {
                        id: None,
                        cidr_block: Some("10.0.0.0/24".to_string()),
                        availability_zone: Some("us-east-1a".to_string()),
                        is_public: false,
                    },
                    SubnetSpec {
                        id: None,
                        cidr_block: Some("10.0.1.0/24".to_string()),
                        availability_zone: Some("us-east-1a".to_string()),
                        is_public: true,
                    },
                ],
            },
            ..Default::default()
        },
        status: None,
    }
}

/// Scope over `test_cluster(name)` with an empty status
pub fn scope_for(name: &str) -> ClusterScope {
    ClusterScope::new(
        ObjectKey::new("default", name),
        test_cluster(name),
        OwnerCluster {
            name: name.to_string(),
            ..Default::default()
        },
        crds::DEFAULT_API_SERVER_PORT,
    )
}

/// Scope whose network is already converged: the VPC, both subnets and one
/// group per cluster role exist in `cloud`, and the status records them
/// together with a load balancer DNS name. No calls are recorded.
pub fn ready_scope(cloud: &MockCloudClient, name: &str) -> ClusterScope {
    let mut scope = scope_for(name);
    let vpc_id = format!("vpc-{name}");
    cloud.add_vpc(Vpc {
        vpc_id: vpc_id.clone(),
        cidr_block: DEFAULT_VPC_CIDR.to_string(),
        state: "available".to_string(),
        tags: tags::to_cloud_tags(&scope.resource_tags(&format!("{name}-vpc"), "common")),
    });
    scope.status.network.vpc_id = Some(vpc_id.clone());

    for (suffix, cidr, public) in [("private", "10.0.0.0/24", false), ("public", "10.0.1.0/24", true)] {
        let subnet_id = format!("subnet-{name}-{suffix}");
        cloud.add_subnet(Subnet {
            subnet_id: subnet_id.clone(),
            vpc_id: vpc_id.clone(),
            cidr_block: cidr.to_string(),
            availability_zone: "us-east-1a".to_string(),
            state: "available".to_string(),
            map_public_ip_on_launch: public,
            tags: tags::to_cloud_tags(&scope.resource_tags(&format!("{name}-subnet-{suffix}-us-east-1a"), suffix)),
        });
        scope.status.network.subnets.push(crds::Subnet {
            id: subnet_id,
            availability_zone: "us-east-1a".to_string(),
            cidr_block: Some(cidr.to_string()),
            is_public: public,
        });
    }

    for role in SecurityGroupRole::cluster_roles(false) {
        let group_name = format!("{name}-{role}");
        let group_id = format!("sg-{name}-{role}");
        cloud.add_security_group(SecurityGroup {
            group_id: group_id.clone(),
            group_name: group_name.clone(),
            vpc_id: vpc_id.clone(),
            description: String::new(),
            ingress_rules: Vec::new(),
            tags: tags::to_cloud_tags(&scope.resource_tags(&group_name, role.as_str())),
        });
        scope.status.network.security_groups.insert(
            role.as_str().to_string(),
            crds::SecurityGroup {
                id: group_id,
                name: group_name,
            },
        );
    }

    scope.status.network.api_server_elb = Some(LoadBalancerStatus {
        name: format!("{name}-apiserver"),
        dns_name: format!("{name}-apiserver.us-east-1.elb.amazonaws.com"),
        scheme: LoadBalancerScheme::InternetFacing,
        availability_zones: vec!["us-east-1a".to_string()],
    });
    scope
}

/// Timeouts short enough for tests that exercise the wait paths
pub fn fast_timeouts() -> InstanceTimeouts {
    InstanceTimeouts {
        running: Duration::from_millis(50),
        terminate: Duration::from_millis(50),
        poll_interval: Duration::from_millis(10),
    }
}

/// Service factory handing out `cloud` for every region, instance-state
/// events disabled
pub fn mock_services(cloud: &MockCloudClient) -> Arc<CloudServices> {
    let cloud = cloud.clone();
    Arc::new(CloudServices::new(
        move |_| Arc::new(cloud.clone()) as Arc<dyn CloudClientTrait>,
        fast_timeouts(),
        false,
    ))
}

/// RFC 7386 merge patch
fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(entries) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(fields) = target {
        for (key, value) in entries {
            if value.is_null() {
                fields.remove(key);
            } else {
                merge(fields.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Swap the `status` of `target` for the one in `body`, dropping it when
/// `body` has none
fn replace_status(target: &mut Value, body: &Value) {
    if let Value::Object(fields) = target {
        match body.get("status") {
            Some(status) => {
                fields.insert("status".to_string(), status.clone());
            }
            None => {
                fields.remove("status");
            }
        }
    }
}

/// In-memory `ObjectStore` with resource-version compare-and-swap.
///
/// Objects marked for deletion disappear once their last finalizer is removed.
pub struct InMemoryStore<K> {
    objects: Mutex<HashMap<ObjectKey, K>>,
    fail_next_write: AtomicBool,
}

impl<K> Default for InMemoryStore<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            fail_next_write: AtomicBool::new(false),
        }
    }
}

impl<K> InMemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    /// Store an object at resource version 1
    pub fn insert(&self, mut object: K) {
        object.meta_mut().resource_version = Some("1".to_string());
        let key = object_key(&object).unwrap();
        self.objects.lock().unwrap().insert(key, object);
    }

    /// Current copy of an object
    pub fn stored(&self, key: &ObjectKey) -> Option<K> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    /// Mutate an object out of band, bumping its resource version
    pub fn update(&self, key: &ObjectKey, mutate: impl FnOnce(&mut K)) {
        let mut objects = self.objects.lock().unwrap();
        let object = objects.get_mut(key).unwrap();
        mutate(object);
        let next = next_version(object);
        object.meta_mut().resource_version = Some(next);
    }

    /// Make the next write fail as if the object had changed
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    fn apply(&self, object: &K, write: impl FnOnce(&mut Value)) -> Result<K, ControllerError> {
        let key = object_key(object)?;
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(ControllerError::Conflict(key.to_string()));
        }
        let mut objects = self.objects.lock().unwrap();
        let current = objects
            .get(&key)
            .ok_or_else(|| ControllerError::Conflict(key.to_string()))?;
        if current.meta().resource_version != object.meta().resource_version {
            return Err(ControllerError::Conflict(key.to_string()));
        }

        let mut value = serde_json::to_value(current)?;
        write(&mut value);
        let mut updated: K = serde_json::from_value(value)?;
        updated.meta_mut().resource_version = Some(next_version(current));

        let released = updated.meta().finalizers.as_ref().is_none_or(Vec::is_empty);
        if updated.meta().deletion_timestamp.is_some() && released {
            objects.remove(&key);
        } else {
            objects.insert(key, updated.clone());
        }
        Ok(updated)
    }
}

fn next_version<K: Resource>(object: &K) -> String {
    let current: u64 = object
        .meta()
        .resource_version
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    (current + 1).to_string()
}

#[async_trait]
impl<K> ObjectStore<K> for InMemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>, ControllerError> {
        Ok(self.stored(key))
    }

    async fn patch_object(&self, object: &K) -> Result<K, ControllerError> {
        let patch = object_patch(object)?;
        self.apply(object, |value| merge(value, &patch))
    }

    async fn replace_status(&self, object: &K) -> Result<K, ControllerError> {
        let body: Value = serde_json::from_slice(&status_body(object)?)?;
        self.apply(object, |value| replace_status(value, &body))
    }
}

/// `OwnerLookup` over a fixed map
#[derive(Default)]
pub struct StaticOwnerLookup {
    owners: Mutex<HashMap<ObjectKey, OwnerCluster>>,
}

impl StaticOwnerLookup {
    /// Register or replace an owner
    pub fn insert(&self, key: ObjectKey, owner: OwnerCluster) {
        self.owners.lock().unwrap().insert(key, owner);
    }

    /// Forget every owner
    pub fn clear(&self) {
        self.owners.lock().unwrap().clear();
    }
}

#[async_trait]
impl OwnerLookup for StaticOwnerLookup {
    async fn owner_cluster(&self, key: &ObjectKey) -> Result<Option<OwnerCluster>, ControllerError> {
        Ok(self.owners.lock().unwrap().get(key).cloned())
    }
}

/// `EventSink` keeping every published event
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<(EventKind, String, String)>>,
}

impl RecordingEventSink {
    /// Reasons in publish order
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|(_, reason, _)| reason.clone()).collect()
    }

    /// Kinds in publish order
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|(kind, _, _)| *kind).collect()
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn publish(&self, _object: &ObjectReference, kind: EventKind, reason: &str, message: &str) {
        self.events
            .lock()
            .unwrap()
            .push((kind, reason.to_string(), message.to_string()));
    }
}

/// Resolver answering the same for every host
pub struct StubDns(pub bool);

#[async_trait]
impl DnsResolver for StubDns {
    async fn resolves(&self, _host: &str) -> bool {
        self.0
    }
}
