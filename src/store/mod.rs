//! Cluster state store
//!
//! [`ClusterStore`] is the only way the reconciler touches the cluster. Three
//! implementations exist:
//! - [`KubeStore`] talks to the API server through kube-rs
//! - [`GuardedStore`] wraps another store with a per-call timeout and shutdown cancellation
//! - [`InMemoryStore`] keeps objects in memory for tests and dry runs
//!
//! Reads return `Option`: absence is a signal, not an error. The `observe_*`
//! helpers resolve a Ghost's dependents through any of them.

mod guarded;
mod kube_client;
mod memory;
mod observed;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};

#[cfg(test)]
use mockall::automock;

use crate::crd::{Ghost, GhostStatus};
use crate::Error;

pub use self::guarded::GuardedStore;
pub use self::kube_client::KubeStore;
pub use self::memory::{InMemoryStore, StoreWrite};
pub use self::observed::{observe_deployment, observe_pvc, observe_service, select_canonical};

/// Trait abstracting cluster API operations used by reconciliation
///
/// This trait allows testing convergence against a fake store while using the
/// real Kubernetes client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Get a Ghost by namespace and name
    async fn get_ghost(&self, namespace: &str, name: &str) -> Result<Option<Ghost>, Error>;

    /// Merge-patch the status subresource of a Ghost
    async fn patch_ghost_status(
        &self,
        namespace: &str,
        name: &str,
        status: &GhostStatus,
    ) -> Result<(), Error>;

    /// Get a PersistentVolumeClaim by name
    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error>;

    /// Create a PersistentVolumeClaim
    async fn create_pvc(&self, pvc: &PersistentVolumeClaim)
        -> Result<PersistentVolumeClaim, Error>;

    /// List Deployments in a namespace matching a label selector (`k=v[,k=v]`)
    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Deployment>, Error>;

    /// Create a Deployment; `generateName` is honoured when no name is set
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error>;

    /// Replace a Deployment; fails with [`Error::Conflict`] on a stale resourceVersion
    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error>;

    /// Get a Service by name
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Create a Service
    async fn create_service(&self, service: &Service) -> Result<Service, Error>;
}

/// Parse a `k=v[,k=v]` equality selector into pairs
///
/// Empty segments are ignored; a segment without `=` matches on key presence.
pub(crate) fn parse_selector(selector: &str) -> Vec<(&str, Option<&str>)> {
    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| match s.split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.trim())),
            None => (s, None),
        })
        .collect()
}
