//! Ghost reconciliation
//!
//! The scheduler hands us a Ghost key. We re-read the Ghost through the store
//! (the watch cache may be stale), validate it, converge its dependents and
//! record the outcome on the Ghost's status and as events.

use std::sync::Arc;

use dashmap::DashMap;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ControllerConfig;
use crate::converge::{ConvergenceEngine, ConvergenceReport};
use crate::crd::{Condition, ConditionStatus, Ghost, GhostPhase, GhostStatus};
use crate::desired::{image_for, DesiredStateGenerator};
use crate::events::{actions, reasons, EventPublisher, NoopEventPublisher};
use crate::retry::RetryConfig;
use crate::store::ClusterStore;
use crate::Error;

/// Condition type summarising whether the dependents match the Ghost
pub const READY_CONDITION: &str = "Ready";

/// Result of reconciling one Ghost key
#[derive(Clone, Debug, PartialEq)]
pub enum ReconcileOutcome {
    /// The Ghost no longer exists; its dependents are garbage collected
    NothingToDo,
    /// The spec cannot be converged until it changes
    Invalid {
        /// Why the spec was rejected
        reason: String,
    },
    /// Dependents were converged
    Converged(ConvergenceReport),
}

/// Controller context shared by every reconciliation
pub struct Context {
    /// Cluster access (trait object for testability)
    pub store: Arc<dyn ClusterStore>,
    /// Desired-state generator over the loaded templates
    pub generator: Arc<DesiredStateGenerator>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Runtime settings
    pub config: ControllerConfig,
    /// Backoff policy for retryable failures
    pub backoff: RetryConfig,
    /// Consecutive failures per `namespace/name`
    failures: DashMap<String, u32>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        store: Arc<dyn ClusterStore>,
        generator: Arc<DesiredStateGenerator>,
    ) -> ContextBuilder {
        ContextBuilder::new(store, generator)
    }

    /// Count a failure for `key` and return the consecutive failure count
    pub fn record_failure(&self, key: &str) -> u32 {
        let mut entry = self.failures.entry(key.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Forget failures for `key`
    pub fn reset_failures(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Consecutive failures currently recorded for `key`
    pub fn failure_count(&self, key: &str) -> u32 {
        self.failures.get(key).map(|v| *v).unwrap_or(0)
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    store: Arc<dyn ClusterStore>,
    generator: Arc<DesiredStateGenerator>,
    events: Option<Arc<dyn EventPublisher>>,
    config: ControllerConfig,
    backoff: RetryConfig,
}

impl ContextBuilder {
    fn new(store: Arc<dyn ClusterStore>, generator: Arc<DesiredStateGenerator>) -> Self {
        Self {
            store,
            generator,
            events: None,
            config: ControllerConfig::default(),
            backoff: RetryConfig::default(),
        }
    }

    /// Set the event publisher (default: drop events)
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the runtime configuration
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the backoff policy for retryable failures
    pub fn backoff(mut self, backoff: RetryConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            store: self.store,
            generator: self.generator,
            events: self
                .events
                .unwrap_or_else(|| Arc::new(NoopEventPublisher)),
            config: self.config,
            backoff: self.backoff,
            failures: DashMap::new(),
        }
    }
}

/// Reconcile a Ghost delivered by the controller runtime
///
/// Successful passes requeue after the resync interval so drift in dependents
/// is caught even without a watch event. Deleted or invalid Ghosts wait for
/// the next change.
#[instrument(
    skip(ghost, ctx),
    fields(namespace = %ghost.namespace().unwrap_or_default(), ghost = %ghost.name_any())
)]
pub async fn reconcile(ghost: Arc<Ghost>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = ghost
        .namespace()
        .ok_or_else(|| Error::validation_for(ghost.name_any(), "Ghost must be namespaced"))?;
    let name = ghost.name_any();

    let outcome = reconcile_key(&namespace, &name, &ctx).await?;
    ctx.reset_failures(&ghost.key());

    Ok(match outcome {
        ReconcileOutcome::NothingToDo | ReconcileOutcome::Invalid { .. } => Action::await_change(),
        ReconcileOutcome::Converged(_) => Action::requeue(ctx.config.resync()),
    })
}

/// Reconcile the Ghost stored at `namespace/name`
pub async fn reconcile_key(
    namespace: &str,
    name: &str,
    ctx: &Context,
) -> Result<ReconcileOutcome, Error> {
    let Some(ghost) = ctx.store.get_ghost(namespace, name).await? else {
        debug!("Ghost not found; dependents are garbage collected");
        return Ok(ReconcileOutcome::NothingToDo);
    };

    info!(image = %image_for(&ghost.spec.image_tag), "reconciling Ghost");

    if let Err(err) = ghost.spec.validate() {
        let err = err.for_ghost(ghost.key());
        warn!(error = %err, "Ghost validation failed");
        let reason = match &err {
            Error::Validation { message, .. } => message.clone(),
            other => other.to_string(),
        };
        let status = GhostStatus::with_phase(GhostPhase::Failed)
            .message(reason.clone())
            .observed_generation(ghost.metadata.generation)
            .condition(Condition::new(
                READY_CONDITION,
                ConditionStatus::False,
                "InvalidSpec",
                reason.clone(),
            ));
        update_status(&ghost, status, ctx).await;
        publish_warning(
            &ghost,
            reasons::VALIDATION_FAILED,
            actions::VALIDATE,
            reason.clone(),
            ctx,
        )
        .await;
        return Ok(ReconcileOutcome::Invalid { reason });
    }

    let engine = ConvergenceEngine::new(ctx.store.as_ref(), &ctx.generator, ctx.events.as_ref());
    match engine.converge(&ghost).await {
        Ok(report) => {
            update_status(&ghost, converged_status(&ghost, &report), ctx).await;
            info!(changed = report.changed(), "reconciliation complete");
            Ok(ReconcileOutcome::Converged(report))
        }
        Err(e) if e.is_cancelled() => Err(e),
        Err(e) => {
            let phase = if e.is_retryable() {
                GhostPhase::Converging
            } else {
                GhostPhase::Failed
            };
            let status = GhostStatus::with_phase(phase)
                .message(e.to_string())
                .observed_generation(ghost.metadata.generation)
                .condition(Condition::new(
                    READY_CONDITION,
                    ConditionStatus::False,
                    "ReconcileFailed",
                    e.to_string(),
                ));
            update_status(&ghost, status, ctx).await;
            publish_warning(
                &ghost,
                reasons::RECONCILE_FAILED,
                actions::RECONCILE,
                e.to_string(),
                ctx,
            )
            .await;
            Err(e)
        }
    }
}

/// Decide how to requeue a Ghost whose reconciliation failed
///
/// Fatal errors wait for a change to the Ghost. Retryable errors back off
/// exponentially per Ghost until a reconcile succeeds.
pub fn error_policy(ghost: Arc<Ghost>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = ghost.key();

    if !error.is_retryable() {
        error!(?error, ghost = %key, "reconciliation failed; waiting for a spec change");
        ctx.reset_failures(&key);
        return Action::await_change();
    }

    let attempt = ctx.record_failure(&key);
    let delay = ctx.backoff.delay_for_attempt(attempt);
    error!(
        ?error,
        ghost = %key,
        attempt,
        delay_ms = delay.as_millis(),
        "reconciliation failed; retrying"
    );
    Action::requeue(delay)
}

fn converged_status(ghost: &Ghost, report: &ConvergenceReport) -> GhostStatus {
    let image = image_for(&ghost.spec.image_tag);
    let (phase, condition, message) = if report.changed() {
        let message = [&report.pvc, &report.deployment, &report.service]
            .iter()
            .filter(|c| c.wrote())
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        (
            GhostPhase::Converging,
            Condition::new(
                READY_CONDITION,
                ConditionStatus::False,
                "Converging",
                message.clone(),
            ),
            message,
        )
    } else {
        let message = format!("Deployment {} running {}", report.deployment.name(), image);
        (
            GhostPhase::Ready,
            Condition::new(
                READY_CONDITION,
                ConditionStatus::True,
                "Converged",
                message.clone(),
            ),
            message,
        )
    };

    GhostStatus::with_phase(phase)
        .message(message)
        .observed_generation(ghost.metadata.generation)
        .image(image)
        .condition(condition)
}

/// Whether `next` differs from `current` in anything but condition timestamps
fn status_changed(current: Option<&GhostStatus>, next: &GhostStatus) -> bool {
    let Some(current) = current else {
        return true;
    };
    let same_conditions = current.conditions.len() == next.conditions.len()
        && current.conditions.iter().zip(&next.conditions).all(|(a, b)| {
            a.type_ == b.type_ && a.status == b.status && a.reason == b.reason && a.message == b.message
        });
    current.phase != next.phase
        || current.message != next.message
        || current.observed_generation != next.observed_generation
        || current.image != next.image
        || !same_conditions
}

/// Patch status unless nothing changed; failures are logged, not returned
async fn update_status(ghost: &Ghost, status: GhostStatus, ctx: &Context) {
    if !status_changed(ghost.status.as_ref(), &status) {
        debug!(phase = %status.phase, "status unchanged");
        return;
    }
    let namespace = ghost.namespace().unwrap_or_default();
    let name = ghost.name_any();
    match ctx.store.patch_ghost_status(&namespace, &name, &status).await {
        Ok(()) => debug!(phase = %status.phase, "updated status"),
        Err(e) => warn!(error = %e, phase = %status.phase, "failed to update status"),
    }
}

async fn publish_warning(ghost: &Ghost, reason: &str, action: &str, note: String, ctx: &Context) {
    ctx.events
        .publish(
            &ghost.object_ref(&()),
            EventType::Warning,
            reason,
            action,
            Some(note),
        )
        .await;
}
