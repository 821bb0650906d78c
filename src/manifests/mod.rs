//! Baseline manifests for Ghost dependents
//!
//! Templates carry tenant-independent shape only (access mode, storage size,
//! container port, default env). The generator in [`crate::desired`] fills in
//! names, labels and the image.
//!
//! A missing or malformed template is a deployment defect: every error from
//! this module is [`Error::Manifest`] and is never retried. [`Templates::load`]
//! also checks the structure the generator fills in, so a template without a
//! `ghost` container, a `ghost-data` claim volume or a Service port stops the
//! process at startup.

use std::path::PathBuf;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use kube::core::TypeMeta;
use kube::Resource;
use serde::de::DeserializeOwned;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::desired::{DATA_VOLUME, GHOST_CONTAINER};
use crate::{Error, Result};

/// Template path for the data PersistentVolumeClaim
pub const PVC_TEMPLATE: &str = "ghost_data_pvc.yaml";
/// Template path for the Ghost Deployment
pub const DEPLOYMENT_TEMPLATE: &str = "ghost_deployment.yaml";
/// Template path for the Ghost Service
pub const SERVICE_TEMPLATE: &str = "ghost_service.yaml";

/// Source of raw template bytes
#[cfg_attr(test, automock)]
pub trait ManifestSource: Send + Sync {
    /// Read the template at `path`
    fn read(&self, path: &str) -> Result<Vec<u8>>;
}

/// Templates compiled into the binary
#[derive(Clone, Copy, Debug, Default)]
pub struct EmbeddedManifests;

impl ManifestSource for EmbeddedManifests {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let content = match path {
            PVC_TEMPLATE => include_str!("../../manifests/ghost_data_pvc.yaml"),
            DEPLOYMENT_TEMPLATE => include_str!("../../manifests/ghost_deployment.yaml"),
            SERVICE_TEMPLATE => include_str!("../../manifests/ghost_service.yaml"),
            _ => return Err(Error::manifest(path, "no embedded template with this name")),
        };
        Ok(content.as_bytes().to_vec())
    }
}

/// Templates read from a directory, for clusters that override the defaults
#[derive(Clone, Debug)]
pub struct DirManifests {
    root: PathBuf,
}

impl DirManifests {
    /// Create a source rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ManifestSource for DirManifests {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.root.join(path);
        std::fs::read(&full).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::manifest(path, format!("not found at {}", full.display()))
            }
            _ => Error::manifest(path, format!("failed to read {}: {}", full.display(), e)),
        })
    }
}

/// Load and decode the template at `path` into a typed object
///
/// The document's `apiVersion`/`kind` must match `K`.
pub fn load_template<K>(source: &dyn ManifestSource, path: &str) -> Result<K>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let bytes = source.read(path)?;

    let type_meta: TypeMeta = serde_yaml::from_slice(&bytes)
        .map_err(|e| Error::manifest(path, format!("invalid YAML: {}", e)))?;
    let expected_kind = K::kind(&());
    let expected_version = K::api_version(&());
    if type_meta.kind != expected_kind || type_meta.api_version != expected_version {
        return Err(Error::manifest(
            path,
            format!(
                "expected {}/{}, found {}/{}",
                expected_version, expected_kind, type_meta.api_version, type_meta.kind
            ),
        ));
    }

    let object = serde_yaml::from_slice(&bytes)
        .map_err(|e| Error::manifest(path, format!("failed to decode {}: {}", expected_kind, e)))?;
    debug!(path, kind = %expected_kind, "loaded template");
    Ok(object)
}

/// The three baseline templates, decoded once at startup
#[derive(Clone, Debug, PartialEq)]
pub struct Templates {
    /// Data volume claim baseline
    pub pvc: PersistentVolumeClaim,
    /// Deployment baseline
    pub deployment: Deployment,
    /// Service baseline
    pub service: Service,
}

impl Templates {
    /// Load every template from `source` and check its structure
    pub fn load(source: &dyn ManifestSource) -> Result<Self> {
        let templates = Self {
            pvc: load_template(source, PVC_TEMPLATE)?,
            deployment: load_template(source, DEPLOYMENT_TEMPLATE)?,
            service: load_template(source, SERVICE_TEMPLATE)?,
        };
        templates.validate()?;
        Ok(templates)
    }

    /// Check that every slot the generator fills in exists
    pub fn validate(&self) -> Result<()> {
        if self.pvc.spec.is_none() {
            return Err(Error::manifest(PVC_TEMPLATE, "template has no spec"));
        }

        let pod = self
            .deployment
            .spec
            .as_ref()
            .ok_or_else(|| Error::manifest(DEPLOYMENT_TEMPLATE, "template has no spec"))?
            .template
            .spec
            .as_ref()
            .ok_or_else(|| Error::manifest(DEPLOYMENT_TEMPLATE, "template has no pod spec"))?;
        if !pod.containers.iter().any(|c| c.name == GHOST_CONTAINER) {
            return Err(Error::manifest(
                DEPLOYMENT_TEMPLATE,
                format!("template has no container named '{}'", GHOST_CONTAINER),
            ));
        }
        let has_claim = pod
            .volumes
            .iter()
            .flatten()
            .any(|v| v.name == DATA_VOLUME && v.persistent_volume_claim.is_some());
        if !has_claim {
            return Err(Error::manifest(
                DEPLOYMENT_TEMPLATE,
                format!("template has no PVC volume named '{}'", DATA_VOLUME),
            ));
        }

        let has_port = self
            .service
            .spec
            .as_ref()
            .ok_or_else(|| Error::manifest(SERVICE_TEMPLATE, "template has no spec"))?
            .ports
            .as_ref()
            .is_some_and(|ports| !ports.is_empty());
        if !has_port {
            return Err(Error::manifest(SERVICE_TEMPLATE, "template has no ports"));
        }
        Ok(())
    }

    /// Load the templates compiled into the binary
    pub fn embedded() -> Result<Self> {
        Self::load(&EmbeddedManifests)
    }
}
