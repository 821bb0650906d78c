//! Controller for the Ghost CRD
//!
//! Reconciliation follows the Kubernetes controller pattern: read the Ghost,
//! derive its dependents, and converge the cluster toward them.

mod ghost;

pub use ghost::{
    error_policy, reconcile, reconcile_key, Context, ContextBuilder, ReconcileOutcome,
    READY_CONDITION,
};
