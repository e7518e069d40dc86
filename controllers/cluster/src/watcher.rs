//! Kubernetes resource watchers.
//!
//! Both kinds are driven by `kube_runtime::Controller` through the generic
//! `watch_resource()` helper. The controller serializes work per object;
//! this module maps reconcile outcomes to actions and keeps the per-object
//! Fibonacci backoff for failed runs.

use crds::ObjectKey;
use futures::StreamExt;
use kube::{Api, Resource};
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::{Controller, watcher};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::backoff::FibonacciBackoff;
use crate::error::ControllerError;
use crate::metrics::{ControllerMetrics, Outcome};
use crate::orchestrator::ReconcileOutcome;
use crate::store::object_key;

const BACKOFF_MIN_SECONDS: u64 = 5;
const BACKOFF_MAX_SECONDS: u64 = 300;

/// Boxed future of one reconciliation
pub type ReconcileFuture = Pin<Box<dyn Future<Output = Result<ReconcileOutcome, ControllerError>> + Send>>;

/// Reconcile entry point for one object key
pub type ReconcileFn = Box<dyn Fn(ObjectKey) -> ReconcileFuture + Send + Sync>;

/// Fibonacci backoff tracked per object
#[derive(Default)]
pub struct KeyedBackoff {
    entries: Mutex<HashMap<ObjectKey, FibonacciBackoff>>,
}

impl KeyedBackoff {
    /// Next delay for `key`, advancing its sequence
    pub fn next(&self, key: &ObjectKey) -> Duration {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(key.clone())
            .or_insert_with(|| FibonacciBackoff::new(BACKOFF_MIN_SECONDS, BACKOFF_MAX_SECONDS))
            .next_backoff()
    }

    /// Forget the sequence of `key`
    pub fn reset(&self, key: &ObjectKey) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

/// Shared state of one watcher
pub struct WatchContext {
    kind: &'static str,
    reconcile_fn: ReconcileFn,
    metrics: Arc<ControllerMetrics>,
    backoff: KeyedBackoff,
}

impl WatchContext {
    /// Context for objects of `kind` reconciled by `reconcile_fn`
    pub fn new(kind: &'static str, reconcile_fn: ReconcileFn, metrics: Arc<ControllerMetrics>) -> Self {
        Self {
            kind,
            reconcile_fn,
            metrics,
            backoff: KeyedBackoff::default(),
        }
    }

    async fn run(&self, key: &ObjectKey) -> Result<Action, ControllerError> {
        debug!("Reconciling {} {}", self.kind, key);
        let started = Instant::now();
        let result = (self.reconcile_fn)(key.clone()).await;
        let elapsed = started.elapsed();
        match &result {
            Ok(ReconcileOutcome::Done) => {
                self.metrics.observe(self.kind, Outcome::Success, elapsed);
                self.backoff.reset(key);
            }
            Ok(ReconcileOutcome::RequeueAfter(_)) => {
                self.metrics.observe(self.kind, Outcome::Requeue, elapsed);
                self.backoff.reset(key);
            }
            Err(e) => {
                self.metrics.observe(self.kind, Outcome::Error, elapsed);
                if e.is_failed_dependency() {
                    self.metrics.failed_dependency(self.kind);
                }
            }
        }
        result.map(action_for)
    }

    fn on_error(&self, key: &ObjectKey, error: &ControllerError) -> Action {
        if !error.is_retryable() {
            warn!("{} {} cannot succeed until it changes: {}", self.kind, key, error);
            self.backoff.reset(key);
            return Action::await_change();
        }
        let delay = self.backoff.next(key);
        if error.is_failed_dependency() {
            info!("{} {} waiting on dependency, retrying in {:?}: {}", self.kind, key, delay, error);
        } else {
            error!("Reconciliation error for {} {}, retrying in {:?}: {}", self.kind, key, delay, error);
        }
        Action::requeue(delay)
    }
}

/// Scheduler action for a finished reconciliation
pub fn action_for(outcome: ReconcileOutcome) -> Action {
    match outcome {
        ReconcileOutcome::Done => Action::await_change(),
        ReconcileOutcome::RequeueAfter(delay) => Action::requeue(delay),
    }
}

async fn reconcile<K: Resource>(object: Arc<K>, context: Arc<WatchContext>) -> Result<Action, ControllerError> {
    let key = object_key(object.as_ref())?;
    context.run(&key).await
}

fn error_policy<K: Resource>(object: Arc<K>, error: &ControllerError, context: Arc<WatchContext>) -> Action {
    match object_key(object.as_ref()) {
        Ok(key) => context.on_error(&key, error),
        Err(e) => {
            warn!("Ignoring {} without a key: {}", context.kind, e);
            Action::await_change()
        }
    }
}

/// Watch `api` and reconcile every object through `context` until the
/// watch stream ends.
///
/// Debounce waits 5 seconds after the last event before reconciling, and at
/// most 3 objects of one kind are reconciled concurrently.
pub async fn watch_resource<K>(api: Api<K>, context: Arc<WatchContext>) -> Result<(), ControllerError>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    let kind = context.kind;
    info!("Starting {} watcher", kind);
    let controller_config = ControllerConfig::default()
        .debounce(Duration::from_secs(5))
        .concurrency(3);

    Controller::new(api, watcher::Config::default())
        .with_config(controller_config)
        .run(reconcile::<K>, error_policy::<K>, context)
        .for_each(|res| async move {
            match res {
                Ok((object, _)) => debug!("Reconciled {} {}", kind, object),
                Err(e) => warn!("Controller error for {}: {}", kind, e),
            }
        })
        .await;

    Err(ControllerError::Watch(format!("{kind} watch stream ended")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context_returning(result: fn() -> Result<ReconcileOutcome, ControllerError>) -> (WatchContext, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let reconcile_fn: ReconcileFn = Box::new(move |_key| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { result() }) as ReconcileFuture
        });
        let metrics = Arc::new(ControllerMetrics::new().unwrap());
        (WatchContext::new("AWSCluster", reconcile_fn, metrics), calls)
    }

    #[test]
    fn test_action_for_outcomes() {
        assert_eq!(action_for(ReconcileOutcome::Done), Action::await_change());
        assert_eq!(
            action_for(ReconcileOutcome::RequeueAfter(Duration::from_secs(15))),
            Action::requeue(Duration::from_secs(15))
        );
    }

    #[test]
    fn test_keyed_backoff_is_per_object() {
        let backoff = KeyedBackoff::default();
        let prod = ObjectKey::new("default", "prod");
        let dev = ObjectKey::new("default", "dev");

        assert_eq!(backoff.next(&prod), Duration::from_secs(5));
        assert_eq!(backoff.next(&prod), Duration::from_secs(5));
        assert_eq!(backoff.next(&prod), Duration::from_secs(10));
        assert_eq!(backoff.next(&dev), Duration::from_secs(5));

        backoff.reset(&prod);
        assert_eq!(backoff.next(&prod), Duration::from_secs(5));
    }

    #[test]
    fn test_error_policy_backs_off_retryable_errors() {
        let (context, _) = context_returning(|| Ok(ReconcileOutcome::Done));
        let key = ObjectKey::new("default", "prod");
        let error = ControllerError::FailedDependency("subnets".to_string());
        assert_eq!(context.on_error(&key, &error), Action::requeue(Duration::from_secs(5)));
        assert_eq!(context.on_error(&key, &error), Action::requeue(Duration::from_secs(5)));
        assert_eq!(context.on_error(&key, &error), Action::requeue(Duration::from_secs(10)));
    }

    #[test]
    fn test_error_policy_waits_for_change_on_permanent_errors() {
        let (context, _) = context_returning(|| Ok(ReconcileOutcome::Done));
        let key = ObjectKey::new("default", "prod");
        let error = ControllerError::UnknownRole("gpu".to_string());
        assert_eq!(context.on_error(&key, &error), Action::await_change());
    }

    #[tokio::test]
    async fn test_success_resets_backoff() {
        let (context, calls) = context_returning(|| Ok(ReconcileOutcome::RequeueAfter(Duration::from_secs(15))));
        let key = ObjectKey::new("default", "prod");
        let error = ControllerError::Timeout {
            operation: "wait for instance i-1 to terminate".to_string(),
            waited: Duration::from_secs(600),
        };
        context.on_error(&key, &error);
        context.on_error(&key, &error);

        let action = context.run(&key).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(15)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(context.on_error(&key, &error), Action::requeue(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_failed_dependency_is_counted() {
        let (context, _) = context_returning(|| Err(ControllerError::FailedDependency("vpc".to_string())));
        let key = ObjectKey::new("default", "prod");
        assert!(context.run(&key).await.is_err());

        let text = context.metrics.encode().unwrap();
        assert!(text.contains(r#"aws_controller_failed_dependencies_total{kind="AWSCluster"} 1"#));
        assert!(text.contains(r#"aws_controller_reconciliations_total{kind="AWSCluster",outcome="error"} 1"#));
    }
}
