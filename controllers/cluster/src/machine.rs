//! AWSMachine reconciliation.
//!
//! A machine waits for its cluster's infrastructure, then gets exactly one
//! instance: the recorded one, else one found by tags, else a new one. Tags
//! and security groups are converged on every pass.

use crds::conditions::{
    INSTANCE_NOT_READY_REASON, INSTANCE_PROVISION_FAILED_REASON, INSTANCE_READY_CONDITION,
    WAITING_FOR_CLUSTER_INFRASTRUCTURE_REASON, mark_false, mark_true,
};
use crds::{
    AWSCluster, AWSMachine, AWSMachineStatus, ConditionSeverity, Instance, InstanceState, MACHINE_FINALIZER,
    ObjectKey, owner_cluster_key,
};
use kube::Resource;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::ControllerError;
use crate::events::{EventKind, EventSink};
use crate::instances::{InstanceRequest, InstanceService};
use crate::orchestrator::ReconcileOutcome;
use crate::resolvers::security_groups;
use crate::scope::ClusterScope;
use crate::services::ServiceFactory;
use crate::store::{ObjectStore, OwnerLookup, add_finalizer, persist, remove_finalizer};

/// Requeue delay while the cluster or the instance is not ready
pub const MACHINE_REQUEUE_AFTER: Duration = Duration::from_secs(15);

/// Reconciles AWSMachine objects
pub struct MachineReconciler {
    machines: Arc<dyn ObjectStore<AWSMachine>>,
    clusters: Arc<dyn ObjectStore<AWSCluster>>,
    owners: Arc<dyn OwnerLookup>,
    services: Arc<dyn ServiceFactory>,
    events: Arc<dyn EventSink>,
    api_server_port: i32,
}

fn status_mut(machine: &mut AWSMachine) -> &mut AWSMachineStatus {
    machine.status.get_or_insert_with(AWSMachineStatus::default)
}

impl MachineReconciler {
    /// Create a reconciler from its collaborators
    pub fn new(
        machines: Arc<dyn ObjectStore<AWSMachine>>,
        clusters: Arc<dyn ObjectStore<AWSCluster>>,
        owners: Arc<dyn OwnerLookup>,
        services: Arc<dyn ServiceFactory>,
        events: Arc<dyn EventSink>,
        api_server_port: i32,
    ) -> Self {
        Self {
            machines,
            clusters,
            owners,
            services,
            events,
            api_server_port,
        }
    }

    /// Bring the instance of one AWSMachine to its declared state
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome, ControllerError> {
        let Some(mut machine) = self.machines.get(key).await? else {
            debug!("AWSMachine {} not found, nothing to do", key);
            return Ok(ReconcileOutcome::Done);
        };
        let deleting = machine.metadata.deletion_timestamp.is_some();

        let cluster_key = ObjectKey::new(key.namespace.clone(), machine.spec.cluster_name.clone());
        let Some(cluster) = self.clusters.get(&cluster_key).await? else {
            if deleting {
                info!("AWSCluster {} is gone, releasing AWSMachine {}", cluster_key, key);
                remove_finalizer(&mut machine, MACHINE_FINALIZER);
                persist(self.machines.as_ref(), &machine).await?;
                return Ok(ReconcileOutcome::Done);
            }
            info!("AWSMachine {} waiting for AWSCluster {}", key, cluster_key);
            mark_false(
                &mut status_mut(&mut machine).conditions,
                INSTANCE_READY_CONDITION,
                WAITING_FOR_CLUSTER_INFRASTRUCTURE_REASON,
                ConditionSeverity::Info,
                "",
            );
            persist(self.machines.as_ref(), &machine).await?;
            return Ok(ReconcileOutcome::RequeueAfter(MACHINE_REQUEUE_AFTER));
        };

        let owner = match owner_cluster_key(&cluster.metadata) {
            Some(owner_key) => self.owners.owner_cluster(&owner_key).await?,
            None => None,
        };
        if owner.as_ref().is_some_and(|o| o.paused) || cluster.has_paused_annotation() {
            info!("AWSMachine {} is paused, skipping", key);
            return Ok(ReconcileOutcome::Done);
        }
        let Some(owner) = owner.or_else(|| deleting.then(Default::default)) else {
            info!("AWSCluster {} has no owner Cluster yet", cluster_key);
            return Ok(ReconcileOutcome::Done);
        };

        let scope = ClusterScope::new(cluster_key, cluster, owner, self.api_server_port);
        let instances = self.services.instances(&scope);
        if deleting {
            self.reconcile_delete(key, machine, &scope, &instances).await
        } else {
            self.reconcile_normal(key, machine, &scope, &instances).await
        }
    }

    async fn reconcile_normal(
        &self,
        key: &ObjectKey,
        mut machine: AWSMachine,
        scope: &ClusterScope,
        instances: &InstanceService,
    ) -> Result<ReconcileOutcome, ControllerError> {
        info!("Reconciling AWSMachine {}", key);
        if add_finalizer(&mut machine, MACHINE_FINALIZER) {
            let persisted = self.machines.patch_object(&machine).await?;
            machine.metadata = persisted.metadata;
        }

        if !scope.status.ready {
            info!("AWSMachine {} waiting for AWSCluster {} infrastructure", key, scope.key);
            mark_false(
                &mut status_mut(&mut machine).conditions,
                INSTANCE_READY_CONDITION,
                WAITING_FOR_CLUSTER_INFRASTRUCTURE_REASON,
                ConditionSeverity::Info,
                "",
            );
            persist(self.machines.as_ref(), &machine).await?;
            return Ok(ReconcileOutcome::RequeueAfter(MACHINE_REQUEUE_AFTER));
        }

        let result = self.converge_instance(key, &mut machine, scope, instances).await;
        let written = persist(self.machines.as_ref(), &machine).await;
        match (result, written) {
            (Err(e), Err(write_error)) => {
                warn!("Failed to persist AWSMachine {} after error: {}", key, write_error);
                Err(e)
            }
            (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(e),
            (Ok(outcome), Ok(_)) => Ok(outcome),
        }
    }

    async fn find_instance(
        &self,
        key: &ObjectKey,
        machine: &AWSMachine,
        scope: &ClusterScope,
        instances: &InstanceService,
    ) -> Result<Option<Instance>, ControllerError> {
        let recorded = machine.status.as_ref().and_then(|s| s.instance_id.as_deref());
        if let Some(id) = recorded {
            if let Some(instance) = instances.instance_by_id(id).await? {
                return Ok(Some(instance));
            }
            warn!("Instance {} of AWSMachine {} no longer exists", id, key);
        }
        instances.find_existing(scope.name(), &key.name, scope.vpc_id()).await
    }

    async fn create_instance(
        &self,
        key: &ObjectKey,
        machine: &mut AWSMachine,
        scope: &ClusterScope,
        instances: &InstanceService,
    ) -> Result<Instance, ControllerError> {
        let spec = &machine.spec;
        let request = InstanceRequest {
            name: &key.name,
            role: &spec.role,
            template: &spec.template,
            version: spec.version.as_deref(),
            failure_domain: spec.failure_domain.as_deref(),
            user_data: spec.user_data.as_deref(),
        };
        let created = instances.create_instance(scope, &request).await;
        match created {
            Ok(instance) => {
                info!("Created instance {} for AWSMachine {}", instance.id, key);
                self.events
                    .publish(
                        &machine.object_ref(&()),
                        EventKind::Normal,
                        "SuccessfulCreate",
                        &format!("Created new {} instance with id {}", spec.role, instance.id),
                    )
                    .await;
                Ok(instance)
            }
            Err(e) => {
                let severity = scope.failure_severity();
                if e.is_failed_dependency() {
                    info!("AWSMachine {} waiting on dependency: {}", key, e);
                } else {
                    error!("Failed to create instance for AWSMachine {}: {}", key, e);
                    self.events
                        .publish(&machine.object_ref(&()), EventKind::Warning, "FailedCreate", &e.to_string())
                        .await;
                }
                mark_false(
                    &mut status_mut(machine).conditions,
                    INSTANCE_READY_CONDITION,
                    INSTANCE_PROVISION_FAILED_REASON,
                    severity,
                    e.to_string(),
                );
                Err(e)
            }
        }
    }

    async fn converge_instance(
        &self,
        key: &ObjectKey,
        machine: &mut AWSMachine,
        scope: &ClusterScope,
        instances: &InstanceService,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let instance = match self.find_instance(key, machine, scope, instances).await? {
            Some(instance) => instance,
            None => self.create_instance(key, machine, scope, instances).await?,
        };

        let status = status_mut(machine);
        status.instance_id = Some(instance.id.clone());
        status.instance_state = Some(instance.state);
        status.addresses = instance.addresses.clone();

        if matches!(instance.state, InstanceState::ShuttingDown | InstanceState::Terminated) {
            warn!("Instance {} of AWSMachine {} is {}", instance.id, key, instance.state.as_str());
            status.ready = false;
            mark_false(
                &mut status.conditions,
                INSTANCE_READY_CONDITION,
                INSTANCE_NOT_READY_REASON,
                ConditionSeverity::Error,
                format!("instance {} is {}", instance.id, instance.state.as_str()),
            );
            return Ok(ReconcileOutcome::Done);
        }

        let mut desired: BTreeMap<String, String> = scope.spec().additional_tags.clone();
        desired.extend(machine.spec.template.additional_tags.clone());
        let previous = machine
            .status
            .as_ref()
            .map(|s| s.applied_tags.clone())
            .unwrap_or_default();
        instances.converge_tags(&instance, &previous, &desired).await?;
        status_mut(machine).applied_tags = desired;

        let group_ids = instances
            .security_group_ids(scope, &machine.spec.role, &machine.spec.template)
            .await?;
        instances.update_security_groups(&instance.id, &group_ids).await?;

        let status = status_mut(machine);
        if instance.state == InstanceState::Running {
            status.ready = true;
            mark_true(&mut status.conditions, INSTANCE_READY_CONDITION);
            Ok(ReconcileOutcome::Done)
        } else {
            debug!("Instance {} of AWSMachine {} is {}", instance.id, key, instance.state.as_str());
            status.ready = false;
            mark_false(
                &mut status.conditions,
                INSTANCE_READY_CONDITION,
                INSTANCE_NOT_READY_REASON,
                ConditionSeverity::Warning,
                format!("instance {} is {}", instance.id, instance.state.as_str()),
            );
            Ok(ReconcileOutcome::RequeueAfter(MACHINE_REQUEUE_AFTER))
        }
    }

    /// Provided interfaces outlive the instance, so the cluster's groups are
    /// taken off them first
    async fn detach_core_groups(
        &self,
        machine: &AWSMachine,
        scope: &ClusterScope,
        instances: &InstanceService,
    ) -> Result<(), ControllerError> {
        let core = security_groups::core_security_groups(
            scope.network(),
            &machine.spec.role,
            scope.is_externally_managed(),
            scope.is_managed_control_plane(),
        )?;
        for interface in &machine.spec.template.network_interfaces {
            instances.detach_security_groups(interface, &core).await?;
        }
        Ok(())
    }

    async fn reconcile_delete(
        &self,
        key: &ObjectKey,
        mut machine: AWSMachine,
        scope: &ClusterScope,
        instances: &InstanceService,
    ) -> Result<ReconcileOutcome, ControllerError> {
        info!("Deleting AWSMachine {}", key);
        if !machine.spec.template.network_interfaces.is_empty() {
            if let Err(e) = self.detach_core_groups(&machine, scope, instances).await {
                error!("Failed to detach security groups of AWSMachine {}: {}", key, e);
                self.events
                    .publish(
                        &machine.object_ref(&()),
                        EventKind::Warning,
                        "FailedDetachSecurityGroups",
                        &e.to_string(),
                    )
                    .await;
                return Err(e);
            }
        }

        let recorded = machine.status.as_ref().and_then(|s| s.instance_id.clone());
        let instance_id = match recorded {
            Some(id) => Some(id),
            None => instances
                .find_existing(scope.name(), &key.name, scope.vpc_id())
                .await?
                .map(|instance| instance.id),
        };

        if let Some(id) = instance_id {
            if let Err(e) = instances.terminate_and_wait(&id).await {
                error!("Failed to terminate instance {} of AWSMachine {}: {}", id, key, e);
                self.events
                    .publish(&machine.object_ref(&()), EventKind::Warning, "FailedTerminate", &e.to_string())
                    .await;
                return Err(e);
            }
            info!("Terminated instance {} of AWSMachine {}", id, key);
            self.events
                .publish(
                    &machine.object_ref(&()),
                    EventKind::Normal,
                    "SuccessfulTerminate",
                    &format!("Terminated instance {id}"),
                )
                .await;
        }

        let status = status_mut(&mut machine);
        status.ready = false;
        status.instance_state = Some(InstanceState::Terminated);
        remove_finalizer(&mut machine, MACHINE_FINALIZER);
        persist(self.machines.as_ref(), &machine).await?;
        Ok(ReconcileOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::ClusterReconciler;
    use crate::store::OwnerCluster;
    use crate::test_utils::{
        InMemoryStore, RecordingEventSink, StaticOwnerLookup, StubDns, mock_services, test_cluster,
    };
    use cloud_client::{CloudClientTrait, GroupIdentifier, MockCloudClient, NetworkInterface};
    use crds::conditions::{get, is_true};
    use crds::{AWSMachineSpec, AmiReference, InstanceTemplate};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    struct Harness {
        cloud: MockCloudClient,
        machines: Arc<InMemoryStore<AWSMachine>>,
        events: Arc<RecordingEventSink>,
        clusters: ClusterReconciler,
        reconciler: MachineReconciler,
        key: ObjectKey,
    }

    fn test_machine(name: &str, cluster: &str) -> AWSMachine {
        AWSMachine {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(format!("{name}-uid")),
                ..Default::default()
            },
            spec: AWSMachineSpec {
                cluster_name: cluster.to_string(),
                role: crds::NODE_ROLE.to_string(),
                version: Some("v1.29.0".to_string()),
                failure_domain: None,
                template: InstanceTemplate {
                    instance_type: "t3.large".to_string(),
                    ami: AmiReference {
                        id: Some("ami-node".to_string()),
                        eks_optimized_lookup_type: None,
                    },
                    additional_tags: BTreeMap::from([("team".to_string(), "infra".to_string())]),
                    ..Default::default()
                },
                user_data: Some("#cloud-config".to_string()),
            },
            status: None,
        }
    }

    fn harness() -> Harness {
        let cloud = MockCloudClient::default();
        let clusters_store = Arc::new(InMemoryStore::<AWSCluster>::default());
        clusters_store.insert(test_cluster("prod"));
        let machines = Arc::new(InMemoryStore::<AWSMachine>::default());
        machines.insert(test_machine("prod-md-0", "prod"));

        let owners = Arc::new(StaticOwnerLookup::default());
        owners.insert(ObjectKey::new("default", "prod"), OwnerCluster {
            name: "prod".to_string(),
            ..Default::default()
        });
        let services = mock_services(&cloud);
        let events = Arc::new(RecordingEventSink::default());
        let clusters = ClusterReconciler::new(
            clusters_store.clone(),
            owners.clone(),
            services.clone(),
            Arc::new(RecordingEventSink::default()),
            Arc::new(StubDns(true)),
            6443,
        );
        let reconciler = MachineReconciler::new(machines.clone(), clusters_store, owners, services, events.clone(), 6443);
        Harness {
            cloud,
            machines,
            events,
            clusters,
            reconciler,
            key: ObjectKey::new("default", "prod-md-0"),
        }
    }

    async fn ready_cluster(h: &Harness) {
        let outcome = h.clusters.reconcile(&ObjectKey::new("default", "prod")).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Done);
        h.cloud.clear_calls();
    }

    fn status(h: &Harness) -> AWSMachineStatus {
        h.machines.stored(&h.key).unwrap().status.unwrap()
    }

    #[tokio::test]
    async fn test_waits_for_cluster_infrastructure() {
        let h = harness();
        let outcome = h.reconciler.reconcile(&h.key).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::RequeueAfter(MACHINE_REQUEUE_AFTER));
        assert_eq!(h.cloud.call_count("RunInstances"), 0);

        let machine = h.machines.stored(&h.key).unwrap();
        assert!(machine.metadata.finalizers.unwrap().contains(&MACHINE_FINALIZER.to_string()));
        let condition = get(&machine.status.unwrap().conditions, INSTANCE_READY_CONDITION).cloned().unwrap();
        assert_eq!(condition.reason.as_deref(), Some(WAITING_FOR_CLUSTER_INFRASTRUCTURE_REASON));
    }

    #[tokio::test]
    async fn test_missing_cluster_requeues() {
        let h = harness();
        h.machines.update(&h.key, |machine| machine.spec.cluster_name = "other".to_string());
        let outcome = h.reconciler.reconcile(&h.key).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::RequeueAfter(MACHINE_REQUEUE_AFTER));
        assert!(h.cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_creates_instance_once_and_becomes_ready() {
        let h = harness();
        ready_cluster(&h).await;

        assert_eq!(h.reconciler.reconcile(&h.key).await.unwrap(), ReconcileOutcome::Done);
        let first = status(&h);
        assert!(first.ready);
        assert!(is_true(&first.conditions, INSTANCE_READY_CONDITION));
        assert_eq!(first.instance_state, Some(InstanceState::Running));
        assert_eq!(first.applied_tags.get("team").map(String::as_str), Some("infra"));
        assert_eq!(h.cloud.call_count("RunInstances"), 1);
        assert_eq!(h.events.reasons(), vec!["SuccessfulCreate"]);
        assert_eq!(h.events.kinds(), vec![EventKind::Normal]);

        h.cloud.clear_calls();
        assert_eq!(h.reconciler.reconcile(&h.key).await.unwrap(), ReconcileOutcome::Done);
        assert!(h.cloud.calls().is_empty());
        assert_eq!(status(&h).instance_id, first.instance_id);
    }

    #[tokio::test]
    async fn test_adopts_instance_found_by_tags() {
        let h = harness();
        ready_cluster(&h).await;
        h.reconciler.reconcile(&h.key).await.unwrap();
        let id = status(&h).instance_id;

        h.machines.update(&h.key, |machine| {
            machine.status = None;
        });
        h.cloud.clear_calls();
        h.reconciler.reconcile(&h.key).await.unwrap();
        assert_eq!(h.cloud.call_count("RunInstances"), 0);
        assert_eq!(status(&h).instance_id, id);
    }

    #[tokio::test]
    async fn test_removed_additional_tag_is_deleted() {
        let h = harness();
        ready_cluster(&h).await;
        h.reconciler.reconcile(&h.key).await.unwrap();
        let id = status(&h).instance_id.unwrap();

        h.machines.update(&h.key, |machine| {
            machine.spec.template.additional_tags.clear();
        });
        h.cloud.clear_calls();
        h.reconciler.reconcile(&h.key).await.unwrap();
        assert_eq!(h.cloud.calls(), vec![format!("DeleteTags:{id}")]);
        assert!(status(&h).applied_tags.is_empty());
    }

    #[tokio::test]
    async fn test_pending_instance_requeues() {
        let h = harness();
        ready_cluster(&h).await;
        h.cloud.set_launch_state("pending");
        let outcome = h.reconciler.reconcile(&h.key).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::RequeueAfter(MACHINE_REQUEUE_AFTER));
        let status = status(&h);
        assert!(!status.ready);
        let condition = get(&status.conditions, INSTANCE_READY_CONDITION).cloned().unwrap();
        assert_eq!(condition.reason.as_deref(), Some(INSTANCE_NOT_READY_REASON));
    }

    #[tokio::test]
    async fn test_unknown_role_fails_without_launch() {
        let h = harness();
        ready_cluster(&h).await;
        h.machines.update(&h.key, |machine| machine.spec.role = "gpu".to_string());
        let err = h.reconciler.reconcile(&h.key).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(h.cloud.call_count("RunInstances"), 0);
        assert_eq!(h.events.reasons(), vec!["FailedCreate"]);
        let condition = get(&status(&h).conditions, INSTANCE_READY_CONDITION).cloned().unwrap();
        assert_eq!(condition.reason.as_deref(), Some(INSTANCE_PROVISION_FAILED_REASON));
    }

    #[tokio::test]
    async fn test_delete_detaches_groups_from_provided_interfaces() {
        let h = harness();
        ready_cluster(&h).await;
        h.cloud.add_network_interface(NetworkInterface {
            network_interface_id: "eni-user".to_string(),
            subnet_id: String::new(),
            vpc_id: String::new(),
            attachment_instance_id: None,
            groups: vec![GroupIdentifier {
                group_id: "sg-user".to_string(),
                group_name: "user".to_string(),
            }],
        });
        h.machines.update(&h.key, |machine| {
            machine.spec.template.network_interfaces = vec!["eni-user".to_string()];
        });
        h.reconciler.reconcile(&h.key).await.unwrap();
        let attached = h.cloud.describe_network_interface_groups("eni-user").await.unwrap();
        assert!(attached.len() > 1);

        h.machines.update(&h.key, |machine| {
            machine.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        });
        h.reconciler.reconcile(&h.key).await.unwrap();
        let remaining = h.cloud.describe_network_interface_groups("eni-user").await.unwrap();
        assert_eq!(remaining, vec!["sg-user".to_string()]);
        assert!(h.machines.stored(&h.key).is_none());
    }

    #[tokio::test]
    async fn test_delete_terminates_and_releases() {
        let h = harness();
        ready_cluster(&h).await;
        h.reconciler.reconcile(&h.key).await.unwrap();
        let id = status(&h).instance_id.unwrap();

        h.machines.update(&h.key, |machine| {
            machine.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        });
        assert_eq!(h.reconciler.reconcile(&h.key).await.unwrap(), ReconcileOutcome::Done);
        assert_eq!(h.cloud.instance(&id).unwrap().state, "terminated");
        assert!(h.machines.stored(&h.key).is_none());
        assert_eq!(h.events.reasons().last().map(String::as_str), Some("SuccessfulTerminate"));
    }
}
