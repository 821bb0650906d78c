//! Drift detection between observed and desired dependents
//!
//! Only fields this operator manages are compared. For the Deployment these
//! are the `ghost` container's image, the env vars the template defines, the
//! blog port, the data volume mount and the data volume's claim. Everything
//! else (replica count, extra env, sidecars, annotations) belongs to whoever
//! set it and is carried through updates untouched.
//!
//! PVCs and Services are immutable once created, so there is no diff for them.

use std::fmt;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaimVolumeSource, Volume, VolumeMount,
};

use crate::desired::{DATA_VOLUME, GHOST_CONTAINER};

/// One managed field that differs from the desired value
#[derive(Clone, Debug, PartialEq)]
pub enum FieldChange {
    /// Container image
    Image {
        /// Observed image, if any
        from: Option<String>,
        /// Desired image
        to: String,
    },
    /// Template-defined env var missing or different
    Env(EnvVar),
    /// Blog container port missing
    Port(ContainerPort),
    /// Data volume missing or bound to another claim
    ClaimName {
        /// Observed claim, if any
        from: Option<String>,
        /// Desired claim
        to: String,
    },
    /// Data volume mount missing or at another path
    VolumeMount(VolumeMount),
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image { from, to } => {
                write!(f, "image {} -> {}", from.as_deref().unwrap_or("<none>"), to)
            }
            Self::Env(var) => write!(f, "env {}", var.name),
            Self::Port(port) => write!(f, "port {}", port.container_port),
            Self::ClaimName { from, to } => write!(
                f,
                "claim {} -> {}",
                from.as_deref().unwrap_or("<none>"),
                to
            ),
            Self::VolumeMount(mount) => write!(f, "mount {} at {}", mount.name, mount.mount_path),
        }
    }
}

/// Result of comparing an observed Deployment against the desired one
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeSet {
    /// Managed fields already match
    NoChange,
    /// Apply exactly these field changes to the observed object
    Patch(Vec<FieldChange>),
    /// Observed object is unrecognisable; take the whole desired spec
    Replace,
}

impl ChangeSet {
    /// Whether anything needs to be written
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::NoChange)
    }

    /// Short human-readable summary for logs and events
    pub fn summary(&self) -> String {
        match self {
            Self::NoChange => "no change".to_string(),
            Self::Replace => "replaced spec".to_string(),
            Self::Patch(changes) => changes
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

fn ghost_container(deployment: &Deployment) -> Option<&Container> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == GHOST_CONTAINER)
}

fn data_claim(deployment: &Deployment) -> Option<&str> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .volumes
        .iter()
        .flatten()
        .find(|v| v.name == DATA_VOLUME)?
        .persistent_volume_claim
        .as_ref()
        .map(|pvc| pvc.claim_name.as_str())
}

/// Compare the managed fields of `observed` against `desired`
pub fn diff_deployment(observed: &Deployment, desired: &Deployment) -> ChangeSet {
    let (Some(have), Some(want)) = (ghost_container(observed), ghost_container(desired)) else {
        return ChangeSet::Replace;
    };

    let mut changes = Vec::new();

    if let Some(image) = &want.image {
        if have.image.as_ref() != Some(image) {
            changes.push(FieldChange::Image {
                from: have.image.clone(),
                to: image.clone(),
            });
        }
    }

    for var in want.env.iter().flatten() {
        let current = have.env.iter().flatten().find(|v| v.name == var.name);
        if current != Some(var) {
            changes.push(FieldChange::Env(var.clone()));
        }
    }

    for port in want.ports.iter().flatten() {
        let present = have
            .ports
            .iter()
            .flatten()
            .any(|p| p.container_port == port.container_port);
        if !present {
            changes.push(FieldChange::Port(port.clone()));
        }
    }

    for mount in want.volume_mounts.iter().flatten().filter(|m| m.name == DATA_VOLUME) {
        let matches = have
            .volume_mounts
            .iter()
            .flatten()
            .any(|m| m.name == mount.name && m.mount_path == mount.mount_path);
        if !matches {
            changes.push(FieldChange::VolumeMount(mount.clone()));
        }
    }

    if let Some(claim) = data_claim(desired) {
        let current = data_claim(observed);
        if current != Some(claim) {
            changes.push(FieldChange::ClaimName {
                from: current.map(str::to_string),
                to: claim.to_string(),
            });
        }
    }

    if changes.is_empty() {
        ChangeSet::NoChange
    } else {
        ChangeSet::Patch(changes)
    }
}

/// Build the object to submit for `changes`
///
/// Starts from `observed` so its name, resourceVersion, owner references and
/// unmanaged fields survive; `desired` is only consulted for [`ChangeSet::Replace`].
pub fn apply_changes(observed: &Deployment, desired: &Deployment, changes: &ChangeSet) -> Deployment {
    let mut updated = observed.clone();
    match changes {
        ChangeSet::NoChange => {}
        ChangeSet::Replace => updated.spec = desired.spec.clone(),
        ChangeSet::Patch(fields) => {
            for change in fields {
                apply_field(&mut updated, change);
            }
        }
    }
    updated
}

fn apply_field(deployment: &mut Deployment, change: &FieldChange) {
    let Some(pod) = deployment
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
    else {
        return;
    };

    if let FieldChange::ClaimName { to, .. } = change {
        let volume = Volume {
            name: DATA_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: to.clone(),
                read_only: None,
            }),
            ..Default::default()
        };
        let volumes = pod.volumes.get_or_insert_with(Vec::new);
        match volumes.iter_mut().find(|v| v.name == DATA_VOLUME) {
            Some(existing) => *existing = volume,
            None => volumes.push(volume),
        }
        return;
    }

    let Some(container) = pod.containers.iter_mut().find(|c| c.name == GHOST_CONTAINER) else {
        return;
    };
    match change {
        FieldChange::Image { to, .. } => container.image = Some(to.clone()),
        FieldChange::Env(var) => {
            let env = container.env.get_or_insert_with(Vec::new);
            match env.iter_mut().find(|v| v.name == var.name) {
                Some(existing) => *existing = var.clone(),
                None => env.push(var.clone()),
            }
        }
        FieldChange::Port(port) => container
            .ports
            .get_or_insert_with(Vec::new)
            .push(port.clone()),
        FieldChange::VolumeMount(mount) => {
            let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
            match mounts.iter_mut().find(|m| m.name == mount.name) {
                Some(existing) => *existing = mount.clone(),
                None => mounts.push(mount.clone()),
            }
        }
        FieldChange::ClaimName { .. } => {}
    }
}
