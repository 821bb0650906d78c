//! kube-rs backed [`ClusterStore`]

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

use super::ClusterStore;
use crate::crd::{Ghost, GhostStatus};
use crate::Error;

/// Real Kubernetes store implementation
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    /// Create a store using `field_manager` for every write
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(self.field_manager.clone()),
        }
    }
}

/// Namespace of an object about to be written
fn target_namespace<K: ResourceExt>(obj: &K) -> Result<String, Error> {
    obj.namespace()
        .ok_or_else(|| Error::serialization(format!("{} has no namespace", obj.name_any())))
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_ghost(&self, namespace: &str, name: &str) -> Result<Option<Ghost>, Error> {
        let api: Api<Ghost> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| Error::from_kube(e, "Ghost", name))
    }

    async fn patch_ghost_status(
        &self,
        namespace: &str,
        name: &str,
        status: &GhostStatus,
    ) -> Result<(), Error> {
        let api: Api<Ghost> = Api::namespaced(self.client.clone(), namespace);

        let status_patch = serde_json::json!({
            "status": status
        });

        api.patch_status(
            name,
            &PatchParams::apply(&self.field_manager),
            &Patch::Merge(&status_patch),
        )
        .await
        .map_err(|e| Error::from_kube(e, "Ghost", name))?;

        Ok(())
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| Error::from_kube(e, "PersistentVolumeClaim", name))
    }

    async fn create_pvc(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error> {
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &target_namespace(pvc)?);
        api.create(&self.post_params(), pvc)
            .await
            .map_err(|e| Error::from_kube(e, "PersistentVolumeClaim", &pvc.name_any()))
    }

    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| Error::from_kube(e, "Deployment", selector))?;
        debug!(namespace, selector, count = list.items.len(), "listed deployments");
        Ok(list.items)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        let api: Api<Deployment> =
            Api::namespaced(self.client.clone(), &target_namespace(deployment)?);
        let label = deployment
            .metadata
            .generate_name
            .clone()
            .unwrap_or_else(|| deployment.name_any());
        api.create(&self.post_params(), deployment)
            .await
            .map_err(|e| Error::from_kube(e, "Deployment", &label))
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        let name = deployment
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::serialization("cannot update a Deployment without a name"))?;
        let api: Api<Deployment> =
            Api::namespaced(self.client.clone(), &target_namespace(deployment)?);
        api.replace(name, &self.post_params(), deployment)
            .await
            .map_err(|e| Error::from_kube(e, "Deployment", name))
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| Error::from_kube(e, "Service", name))
    }

    async fn create_service(&self, service: &Service) -> Result<Service, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &target_namespace(service)?);
        api.create(&self.post_params(), service)
            .await
            .map_err(|e| Error::from_kube(e, "Service", &service.name_any()))
    }
}
