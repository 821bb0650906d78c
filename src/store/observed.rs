//! Observed-state reads for a Ghost's dependents
//!
//! PVC and Service are point lookups by their deterministic name. The
//! Deployment name is generated by the API server, so it is found by its
//! identity label. Owned matches beat unowned ones and, when more than one
//! candidate remains, the oldest wins.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use kube::ResourceExt;
use tracing::warn;

use super::ClusterStore;
use crate::crd::Ghost;
use crate::desired::DependentNames;
use crate::error::{DependentKind, Operation};
use crate::owner::{has_foreign_controller, is_controlled_by};
use crate::Error;

/// Current data PVC, if it exists
pub async fn observe_pvc(
    store: &dyn ClusterStore,
    names: &DependentNames,
) -> Result<Option<PersistentVolumeClaim>, Error> {
    store
        .get_pvc(names.namespace(), &names.pvc())
        .await
        .map_err(|e| e.during(DependentKind::PersistentVolumeClaim, Operation::Read))
}

/// Current Service, if it exists
pub async fn observe_service(
    store: &dyn ClusterStore,
    names: &DependentNames,
) -> Result<Option<Service>, Error> {
    store
        .get_service(names.namespace(), &names.service())
        .await
        .map_err(|e| e.during(DependentKind::Service, Operation::Read))
}

/// Canonical Deployment carrying the Ghost's identity label, if any
///
/// Deployments already controlled by `owner` win over unowned ones, which are
/// adopted. Deployments controlled by anything else are never returned.
pub async fn observe_deployment(
    store: &dyn ClusterStore,
    names: &DependentNames,
    owner: &Ghost,
) -> Result<Option<Deployment>, Error> {
    let selector = names.selector();
    let matches = store
        .list_deployments(names.namespace(), &selector)
        .await
        .map_err(|e| e.during(DependentKind::Deployment, Operation::Read))?;

    let (owned, rest): (Vec<_>, Vec<_>) = matches
        .into_iter()
        .partition(|d| is_controlled_by(&d.metadata, owner));
    let (foreign, orphans): (Vec<_>, Vec<_>) = rest
        .into_iter()
        .partition(|d| has_foreign_controller(&d.metadata, owner));

    if !foreign.is_empty() {
        warn!(
            namespace = names.namespace(),
            selector = %selector,
            count = foreign.len(),
            "ignoring Deployments controlled by another owner"
        );
    }

    let candidates = if owned.is_empty() { orphans } else { owned };
    if candidates.len() > 1 {
        warn!(
            namespace = names.namespace(),
            selector = %selector,
            count = candidates.len(),
            "multiple Deployments match identity label; using the oldest"
        );
    }
    Ok(select_canonical(candidates))
}

/// Pick the oldest Deployment, breaking ties by name
///
/// Objects without a creation timestamp sort last.
pub fn select_canonical(deployments: Vec<Deployment>) -> Option<Deployment> {
    deployments.into_iter().min_by(|a, b| {
        let ta = a.metadata.creation_timestamp.as_ref().map(|t| t.0);
        let tb = b.metadata.creation_timestamp.as_ref().map(|t| t.0);
        let by_age = match (ta, tb) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        };
        by_age.then_with(|| a.name_any().cmp(&b.name_any()))
    })
}
