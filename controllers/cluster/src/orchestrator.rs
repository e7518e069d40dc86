//! AWSCluster reconciliation.
//!
//! `ClusterReconciler::reconcile` is the single entry point. It loads the
//! object, runs the convergers in order against one in-memory scope and
//! writes the status back once at the end. Retrying is left to the caller.
//!
//! Create order: network, security groups, bastion, instance-state events
//! (best effort), load balancer, object store. Delete runs the reverse and
//! stops at the first hard error so nothing is removed while something
//! that depends on it still exists.

use crds::conditions::{
    BASTION_FAILED_REASON, BASTION_HOST_READY_CONDITION, CLUSTER_SECURITY_GROUPS_READY_CONDITION,
    DELETING_REASON, DELETION_FAILED_REASON, EVENT_BRIDGE_FAILED_REASON, EVENT_BRIDGE_READY_CONDITION,
    LOAD_BALANCER_FAILED_REASON, LOAD_BALANCER_READY_CONDITION, READY_CONDITION, S3_BUCKET_FAILED_REASON,
    S3_BUCKET_READY_CONDITION, SECURITY_GROUP_RECONCILIATION_FAILED_REASON, VPC_READY_CONDITION,
    VPC_RECONCILIATION_FAILED_REASON, WAIT_FOR_DNS_NAME_REASON, WAIT_FOR_DNS_NAME_RESOLVE_REASON, mark_false, mark_true,
};
use crds::{
    AWSCluster, ApiEndpoint, CLUSTER_FINALIZER, ClusterPhase, ConditionSeverity, FailureDomain, ObjectKey,
    owner_cluster_key,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::dns::DnsResolver;
use crate::error::ControllerError;
use crate::events::{EventKind, EventSink};
use crate::scope::ClusterScope;
use crate::services::{Converger, ServiceFactory};
use crate::store::{ObjectStore, OwnerLookup, add_finalizer, persist, remove_finalizer};

/// Requeue delay while waiting on the load balancer DNS name
pub const DNS_REQUEUE_AFTER: Duration = Duration::from_secs(15);

/// What the caller should do after a successful reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Converged; wait for the next change
    Done,
    /// Not finished; call again after the delay
    RequeueAfter(Duration),
}

/// When a step's condition is set `True`
#[derive(Clone, Copy)]
enum Marking {
    /// The converger manages its own conditions
    Converger,
    /// After every successful run
    Always,
    /// After a successful run when the predicate holds
    When(fn(&ClusterScope) -> bool),
    /// Never at the step; set later in the pipeline
    Deferred,
}

type Build = fn(&dyn ServiceFactory, &ClusterScope) -> Box<dyn Converger>;

/// One converger in the pipeline
#[derive(Clone, Copy)]
struct Step {
    label: &'static str,
    condition: &'static str,
    failure_reason: &'static str,
    marking: Marking,
    /// Failure is logged and recorded but never aborts the pipeline
    best_effort: bool,
    build: Build,
}

const NETWORK: Step = Step {
    label: "Network",
    condition: VPC_READY_CONDITION,
    failure_reason: VPC_RECONCILIATION_FAILED_REASON,
    marking: Marking::Converger,
    best_effort: false,
    build: |factory, scope| factory.network(scope),
};

const SECURITY_GROUPS: Step = Step {
    label: "SecurityGroups",
    condition: CLUSTER_SECURITY_GROUPS_READY_CONDITION,
    failure_reason: SECURITY_GROUP_RECONCILIATION_FAILED_REASON,
    marking: Marking::Always,
    best_effort: false,
    build: |factory, scope| factory.security_groups(scope),
};

const BASTION: Step = Step {
    label: "Bastion",
    condition: BASTION_HOST_READY_CONDITION,
    failure_reason: BASTION_FAILED_REASON,
    marking: Marking::When(|scope| scope.spec().bastion.enabled),
    best_effort: false,
    build: |factory, scope| factory.bastion(scope),
};

const INSTANCE_STATE: Step = Step {
    label: "InstanceStateEvents",
    condition: EVENT_BRIDGE_READY_CONDITION,
    failure_reason: EVENT_BRIDGE_FAILED_REASON,
    marking: Marking::Converger,
    best_effort: true,
    build: |factory, scope| factory.instance_state(scope),
};

const LOAD_BALANCER: Step = Step {
    label: "LoadBalancer",
    condition: LOAD_BALANCER_READY_CONDITION,
    failure_reason: LOAD_BALANCER_FAILED_REASON,
    marking: Marking::Deferred,
    best_effort: false,
    build: |factory, scope| factory.load_balancer(scope),
};

const OBJECT_STORE: Step = Step {
    label: "ObjectStore",
    condition: S3_BUCKET_READY_CONDITION,
    failure_reason: S3_BUCKET_FAILED_REASON,
    marking: Marking::When(|scope| scope.spec().s3_bucket.is_some()),
    best_effort: false,
    build: |factory, scope| factory.object_store(scope),
};

const CREATE_ORDER: [Step; 6] = [NETWORK, SECURITY_GROUPS, BASTION, INSTANCE_STATE, LOAD_BALANCER, OBJECT_STORE];
const DELETE_ORDER: [Step; 6] = [INSTANCE_STATE, LOAD_BALANCER, BASTION, SECURITY_GROUPS, NETWORK, OBJECT_STORE];

/// Reconciles AWSCluster objects
pub struct ClusterReconciler {
    store: Arc<dyn ObjectStore<AWSCluster>>,
    owners: Arc<dyn OwnerLookup>,
    services: Arc<dyn ServiceFactory>,
    events: Arc<dyn EventSink>,
    dns: Arc<dyn DnsResolver>,
    api_server_port: i32,
}

impl ClusterReconciler {
    /// Create a reconciler from its collaborators
    pub fn new(
        store: Arc<dyn ObjectStore<AWSCluster>>,
        owners: Arc<dyn OwnerLookup>,
        services: Arc<dyn ServiceFactory>,
        events: Arc<dyn EventSink>,
        dns: Arc<dyn DnsResolver>,
        api_server_port: i32,
    ) -> Self {
        Self {
            store,
            owners,
            services,
            events,
            dns,
            api_server_port,
        }
    }

    /// Bring the cloud resources of one AWSCluster to its declared state
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome, ControllerError> {
        let Some(cluster) = self.store.get(key).await? else {
            debug!("AWSCluster {} not found, nothing to do", key);
            return Ok(ReconcileOutcome::Done);
        };
        if cluster.is_externally_managed() {
            debug!("AWSCluster {} is externally managed, skipping", key);
            return Ok(ReconcileOutcome::Done);
        }
        let Some(owner_key) = owner_cluster_key(&cluster.metadata) else {
            info!("AWSCluster {} has no owner Cluster yet", key);
            return Ok(ReconcileOutcome::Done);
        };
        let Some(owner) = self.owners.owner_cluster(&owner_key).await? else {
            info!("Owner Cluster {} of AWSCluster {} not found", owner_key, key);
            return Ok(ReconcileOutcome::Done);
        };
        if owner.paused || cluster.has_paused_annotation() {
            info!("AWSCluster {} is paused, skipping", key);
            return Ok(ReconcileOutcome::Done);
        }

        let deleting = cluster.metadata.deletion_timestamp.is_some();
        let mut scope = ClusterScope::new(key.clone(), cluster, owner, self.api_server_port);
        if deleting {
            self.reconcile_delete(&mut scope).await
        } else {
            self.reconcile_normal(&mut scope).await
        }
    }

    async fn reconcile_normal(&self, scope: &mut ClusterScope) -> Result<ReconcileOutcome, ControllerError> {
        info!("Reconciling AWSCluster {}", scope.key);
        if add_finalizer(&mut scope.cluster, CLUSTER_FINALIZER) {
            let persisted = self.store.patch_object(&scope.cluster).await?;
            scope.refresh_metadata(&persisted);
        }
        if !scope.status.ready {
            scope.status.phase = ClusterPhase::Provisioning;
        }

        let result = self.run_create_pipeline(scope).await;
        self.write_back(scope, result).await
    }

    async fn run_create_pipeline(&self, scope: &mut ClusterScope) -> Result<ReconcileOutcome, ControllerError> {
        for step in CREATE_ORDER {
            self.converge(step, scope).await?;
        }

        let dns_name = scope
            .network()
            .api_server_elb
            .as_ref()
            .map(|lb| lb.dns_name.clone())
            .unwrap_or_default();
        if dns_name.is_empty() {
            info!("Waiting for the load balancer DNS name of {}", scope.key);
            mark_false(
                &mut scope.status.conditions,
                LOAD_BALANCER_READY_CONDITION,
                WAIT_FOR_DNS_NAME_REASON,
                ConditionSeverity::Info,
                "",
            );
            return Ok(ReconcileOutcome::RequeueAfter(DNS_REQUEUE_AFTER));
        }
        if !self.dns.resolves(&dns_name).await {
            info!("Waiting for {} to resolve for {}", dns_name, scope.key);
            mark_false(
                &mut scope.status.conditions,
                LOAD_BALANCER_READY_CONDITION,
                WAIT_FOR_DNS_NAME_RESOLVE_REASON,
                ConditionSeverity::Info,
                "",
            );
            return Ok(ReconcileOutcome::RequeueAfter(DNS_REQUEUE_AFTER));
        }
        mark_true(&mut scope.status.conditions, LOAD_BALANCER_READY_CONDITION);

        // The endpoint is written once and never moved afterwards
        if scope.cluster.spec.control_plane_endpoint.is_zero() {
            info!("Publishing control plane endpoint {}:{} for {}", dns_name, scope.api_server_port, scope.key);
            scope.cluster.spec.control_plane_endpoint = ApiEndpoint {
                host: dns_name,
                port: scope.api_server_port,
            };
        }

        scope.status.failure_domains = failure_domains(scope);

        let was_ready = scope.status.ready;
        scope.status.ready = true;
        scope.status.phase = ClusterPhase::Ready;
        mark_true(&mut scope.status.conditions, READY_CONDITION);
        if !was_ready {
            info!("AWSCluster {} is ready", scope.key);
            self.events
                .publish(&scope.object_ref(), EventKind::Normal, "Ready", "cluster infrastructure is ready")
                .await;
        }
        Ok(ReconcileOutcome::Done)
    }

    async fn converge(&self, step: Step, scope: &mut ClusterScope) -> Result<(), ControllerError> {
        let converger = (step.build)(self.services.as_ref(), scope);
        match converger.reconcile(scope).await {
            Ok(()) => {
                let ready = match step.marking {
                    Marking::Always => true,
                    Marking::When(predicate) => predicate(scope),
                    Marking::Converger | Marking::Deferred => false,
                };
                if ready {
                    mark_true(&mut scope.status.conditions, step.condition);
                }
                Ok(())
            }
            Err(e) if step.best_effort => {
                warn!("{} for {} failed (non-fatal): {}", step.label, scope.key, e);
                mark_false(
                    &mut scope.status.conditions,
                    step.condition,
                    step.failure_reason,
                    ConditionSeverity::Warning,
                    e.to_string(),
                );
                Ok(())
            }
            Err(e) => {
                if !matches!(step.marking, Marking::Converger) {
                    let severity = scope.failure_severity();
                    mark_false(
                        &mut scope.status.conditions,
                        step.condition,
                        step.failure_reason,
                        severity,
                        e.to_string(),
                    );
                }
                if e.is_failed_dependency() {
                    info!("{} for {} waiting on dependency: {}", step.label, scope.key, e);
                } else {
                    error!("{} for {} failed: {}", step.label, scope.key, e);
                    self.events
                        .publish(
                            &scope.object_ref(),
                            EventKind::Warning,
                            &format!("FailedReconcile{}", step.label),
                            &e.to_string(),
                        )
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn reconcile_delete(&self, scope: &mut ClusterScope) -> Result<ReconcileOutcome, ControllerError> {
        info!("Deleting AWSCluster {}", scope.key);
        scope.status.phase = ClusterPhase::Deleting;
        scope.status.ready = false;
        mark_false(
            &mut scope.status.conditions,
            READY_CONDITION,
            DELETING_REASON,
            ConditionSeverity::Info,
            "",
        );

        let result = self.run_delete_pipeline(scope).await;
        if result.is_ok() {
            remove_finalizer(&mut scope.cluster, CLUSTER_FINALIZER);
            info!("AWSCluster {} infrastructure removed", scope.key);
        }
        self.write_back(scope, result.map(|()| ReconcileOutcome::Done)).await
    }

    async fn run_delete_pipeline(&self, scope: &mut ClusterScope) -> Result<(), ControllerError> {
        for step in DELETE_ORDER {
            let converger = (step.build)(self.services.as_ref(), scope);
            let Err(e) = converger.delete(scope).await else {
                continue;
            };
            if step.best_effort {
                warn!("Deleting {} of {} failed (non-fatal): {}", step.label, scope.key, e);
                continue;
            }
            error!("Deleting {} of {} failed: {}", step.label, scope.key, e);
            mark_false(
                &mut scope.status.conditions,
                step.condition,
                DELETION_FAILED_REASON,
                ConditionSeverity::Warning,
                e.to_string(),
            );
            self.events
                .publish(
                    &scope.object_ref(),
                    EventKind::Warning,
                    &format!("FailedDelete{}", step.label),
                    &e.to_string(),
                )
                .await;
            return Err(e);
        }
        Ok(())
    }

    /// Persist the working copy; a pipeline error wins over a write error
    async fn write_back(
        &self,
        scope: &ClusterScope,
        result: Result<ReconcileOutcome, ControllerError>,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let written = persist(self.store.as_ref(), &scope.to_object()).await;
        match (result, written) {
            (Err(e), Err(write_error)) => {
                warn!("Failed to persist AWSCluster {} after error: {}", scope.key, write_error);
                Err(e)
            }
            (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(e),
            (Ok(outcome), Ok(_)) => Ok(outcome),
        }
    }
}

/// One failure domain per private subnet zone; control plane allowed where
/// the load balancer serves
fn failure_domains(scope: &ClusterScope) -> BTreeMap<String, FailureDomain> {
    let lb_zones: &[String] = scope
        .network()
        .api_server_elb
        .as_ref()
        .map(|lb| lb.availability_zones.as_slice())
        .unwrap_or_default();
    scope
        .network()
        .private_subnets()
        .map(|subnet| {
            (
                subnet.availability_zone.clone(),
                FailureDomain {
                    control_plane: lb_zones.contains(&subnet.availability_zone),
                },
            )
        })
        .collect()
}
