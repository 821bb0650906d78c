//! Timeout and cancellation for store calls
//!
//! Every call is raced against the shared shutdown token and bounded by the
//! configured API timeout. A cancelled call is dropped in flight and surfaces
//! as [`Error::Cancelled`]; both outcomes are retryable.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::ClusterStore;
use crate::crd::{Ghost, GhostStatus};
use crate::Error;

/// [`ClusterStore`] decorator applying a per-call timeout and cancellation
pub struct GuardedStore {
    inner: Arc<dyn ClusterStore>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl GuardedStore {
    /// Wrap `inner`; calls fail after `timeout` or once `cancel` fires
    pub fn new(inner: Arc<dyn ClusterStore>, timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            inner,
            timeout,
            cancel,
        }
    }

    async fn guard<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(self.timeout, call()) => match result {
                Ok(inner) => inner,
                Err(_) => {
                    warn!(operation, timeout_ms = self.timeout.as_millis(), "store call timed out");
                    Err(Error::Timeout {
                        operation: operation.to_string(),
                    })
                }
            },
        }
    }
}

#[async_trait]
impl ClusterStore for GuardedStore {
    async fn get_ghost(&self, namespace: &str, name: &str) -> Result<Option<Ghost>, Error> {
        self.guard("get Ghost", || self.inner.get_ghost(namespace, name))
            .await
    }

    async fn patch_ghost_status(
        &self,
        namespace: &str,
        name: &str,
        status: &GhostStatus,
    ) -> Result<(), Error> {
        self.guard(
            "patch Ghost status",
            || self.inner.patch_ghost_status(namespace, name, status),
        )
        .await
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        self.guard("get PersistentVolumeClaim", || self.inner.get_pvc(namespace, name))
            .await
    }

    async fn create_pvc(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error> {
        self.guard("create PersistentVolumeClaim", || self.inner.create_pvc(pvc))
            .await
    }

    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Deployment>, Error> {
        self.guard(
            "list Deployments",
            || self.inner.list_deployments(namespace, selector),
        )
        .await
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        self.guard("create Deployment", || self.inner.create_deployment(deployment))
            .await
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        self.guard("update Deployment", || self.inner.update_deployment(deployment))
            .await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        self.guard("get Service", || self.inner.get_service(namespace, name))
            .await
    }

    async fn create_service(&self, service: &Service) -> Result<Service, Error> {
        self.guard("create Service", || self.inner.create_service(service))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockClusterStore;

    /// Store whose calls never complete
    struct StalledStore;

    #[async_trait]
    impl ClusterStore for StalledStore {
        async fn get_ghost(&self, _: &str, _: &str) -> Result<Option<Ghost>, Error> {
            futures::future::pending().await
        }
        async fn patch_ghost_status(&self, _: &str, _: &str, _: &GhostStatus) -> Result<(), Error> {
            futures::future::pending().await
        }
        async fn get_pvc(&self, _: &str, _: &str) -> Result<Option<PersistentVolumeClaim>, Error> {
            futures::future::pending().await
        }
        async fn create_pvc(&self, _: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim, Error> {
            futures::future::pending().await
        }
        async fn list_deployments(&self, _: &str, _: &str) -> Result<Vec<Deployment>, Error> {
            futures::future::pending().await
        }
        async fn create_deployment(&self, _: &Deployment) -> Result<Deployment, Error> {
            futures::future::pending().await
        }
        async fn update_deployment(&self, _: &Deployment) -> Result<Deployment, Error> {
            futures::future::pending().await
        }
        async fn get_service(&self, _: &str, _: &str) -> Result<Option<Service>, Error> {
            futures::future::pending().await
        }
        async fn create_service(&self, _: &Service) -> Result<Service, Error> {
            futures::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out() {
        let store = GuardedStore::new(
            Arc::new(StalledStore),
            Duration::from_secs(1),
            CancellationToken::new(),
        );

        let err = store.get_pvc("a", "ghost-data-pvc-a").await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(err.is_retryable());
    }

    /// Story: shutdown aborts an in-flight call instead of waiting for the timeout
    #[tokio::test]
    async fn story_cancellation_aborts_in_flight_call() {
        let cancel = CancellationToken::new();
        let store = GuardedStore::new(
            Arc::new(StalledStore),
            Duration::from_secs(3600),
            cancel.clone(),
        );

        let trigger = tokio::spawn(async move {
            tokio::task::yield_now().await;
            cancel.cancel();
        });
        let err = store.list_deployments("a", "app=ghost-a").await.unwrap_err();
        trigger.await.unwrap();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let inner = MockClusterStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let store = GuardedStore::new(Arc::new(inner), Duration::from_secs(1), cancel);

        let err = store.get_service("a", "ghost-service-a").await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn successful_calls_pass_through() {
        let mut inner = MockClusterStore::new();
        inner.expect_list_deployments().returning(|_, _| Ok(vec![]));
        let store = GuardedStore::new(
            Arc::new(inner),
            Duration::from_secs(1),
            CancellationToken::new(),
        );

        assert!(store
            .list_deployments("a", "app=ghost-a")
            .await
            .unwrap()
            .is_empty());
    }
}
