//! Convergence engine
//!
//! Drives each dependent of a Ghost from its observed state to its desired
//! state with the minimal write: create when absent, a single update when the
//! Deployment's managed fields drift or it has no owner yet, nothing otherwise.
//! Kinds are converged in order PVC, Deployment, Service and the first error
//! ends the pass. There is no retry here; the scheduler re-runs the whole pass.

use std::fmt;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::crd::Ghost;
use crate::desired::{image_for, DependentNames, DesiredStateGenerator};
use crate::diff::{apply_changes, diff_deployment, ChangeSet};
use crate::error::{DependentKind, Operation};
use crate::events::{actions, reasons, EventPublisher};
use crate::owner::{is_controlled_by, stamp_owner};
use crate::store::{observe_deployment, observe_pvc, observe_service, ClusterStore};
use crate::Error;

/// What convergence did for one dependent
#[derive(Clone, Debug, PartialEq)]
pub enum Convergence {
    /// The dependent was absent and has been created
    Created {
        /// Name of the created object
        name: String,
    },
    /// Managed fields drifted, or the object was adopted, and one update was issued
    Updated {
        /// Name of the updated object
        name: String,
        /// Changes that were applied
        changes: ChangeSet,
    },
    /// Already converged
    Unchanged {
        /// Name of the existing object
        name: String,
    },
}

impl Convergence {
    /// Name of the object this outcome refers to
    pub fn name(&self) -> &str {
        match self {
            Self::Created { name } | Self::Updated { name, .. } | Self::Unchanged { name } => name,
        }
    }

    /// Whether a write was issued
    pub fn wrote(&self) -> bool {
        !matches!(self, Self::Unchanged { .. })
    }
}

impl fmt::Display for Convergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created { name } => write!(f, "created {}", name),
            Self::Updated { name, changes } => write!(f, "updated {} ({})", name, changes.summary()),
            Self::Unchanged { name } => write!(f, "{} unchanged", name),
        }
    }
}

/// Per-kind outcome of one convergence pass
#[derive(Clone, Debug, PartialEq)]
pub struct ConvergenceReport {
    /// Data PVC
    pub pvc: Convergence,
    /// Ghost Deployment
    pub deployment: Convergence,
    /// NodePort Service
    pub service: Convergence,
}

impl ConvergenceReport {
    /// Whether any dependent was created or updated
    pub fn changed(&self) -> bool {
        self.pvc.wrote() || self.deployment.wrote() || self.service.wrote()
    }
}

/// Converges the dependents of one Ghost
pub struct ConvergenceEngine<'a> {
    store: &'a dyn ClusterStore,
    generator: &'a DesiredStateGenerator,
    events: &'a dyn EventPublisher,
}

impl<'a> ConvergenceEngine<'a> {
    /// Create an engine over the given collaborators
    pub fn new(
        store: &'a dyn ClusterStore,
        generator: &'a DesiredStateGenerator,
        events: &'a dyn EventPublisher,
    ) -> Self {
        Self {
            store,
            generator,
            events,
        }
    }

    /// Converge PVC, Deployment and Service, stopping at the first error
    pub async fn converge(&self, ghost: &Ghost) -> Result<ConvergenceReport, Error> {
        let names = DependentNames::for_ghost(ghost)?;
        let pvc = self.converge_pvc(ghost, &names).await?;
        let deployment = self.converge_deployment(ghost, &names).await?;
        let service = self.converge_service(ghost, &names).await?;
        Ok(ConvergenceReport {
            pvc,
            deployment,
            service,
        })
    }

    /// Create the data PVC if it is absent; an existing PVC is never modified
    pub async fn converge_pvc(
        &self,
        ghost: &Ghost,
        names: &DependentNames,
    ) -> Result<Convergence, Error> {
        let kind = DependentKind::PersistentVolumeClaim;
        if let Some(existing) = observe_pvc(self.store, names).await? {
            let name = existing.name_any();
            debug!(kind = %kind, name = %name, "already exists");
            return Ok(Convergence::Unchanged { name });
        }

        let mut desired = self.generator.pvc(names);
        stamp_owner(&mut desired.metadata, ghost)?;
        let created = self
            .store
            .create_pvc(&desired)
            .await
            .map_err(|e| e.during(kind, Operation::Create))?;

        let name = created.name_any();
        info!(kind = %kind, name = %name, "created");
        self.publish(
            ghost,
            reasons::PVC_READY,
            actions::CREATE,
            format!("Created PersistentVolumeClaim {}", name),
        )
        .await;
        Ok(Convergence::Created { name })
    }

    /// Create the Deployment if absent, otherwise patch drifted managed fields
    pub async fn converge_deployment(
        &self,
        ghost: &Ghost,
        names: &DependentNames,
    ) -> Result<Convergence, Error> {
        let kind = DependentKind::Deployment;
        let desired = self.generator.deployment(ghost, names)?;
        let image = image_for(&ghost.spec.image_tag);

        let Some(observed) = observe_deployment(self.store, names, ghost).await? else {
            let mut desired = desired;
            stamp_owner(&mut desired.metadata, ghost)?;
            let created = self
                .store
                .create_deployment(&desired)
                .await
                .map_err(|e| e.during(kind, Operation::Create))?;

            let name = created.name_any();
            info!(kind = %kind, name = %name, image = %image, "created");
            self.publish(
                ghost,
                reasons::DEPLOYMENT_CREATED,
                actions::CREATE,
                format!("Created Deployment {} running {}", name, image),
            )
            .await;
            return Ok(Convergence::Created { name });
        };

        let name = observed.name_any();
        let changes = diff_deployment(&observed, &desired);
        let adopting = !is_controlled_by(&observed.metadata, ghost);
        if changes.is_empty() && !adopting {
            debug!(kind = %kind, name = %name, image = %image, "managed fields converged");
            return Ok(Convergence::Unchanged { name });
        }

        let mut updated = apply_changes(&observed, &desired, &changes);
        stamp_owner(&mut updated.metadata, ghost)?;
        self.store
            .update_deployment(&updated)
            .await
            .map_err(|e| e.during(kind, Operation::Update))?;

        let summary = changes.summary();
        let (reason, verb) = if adopting {
            (reasons::DEPLOYMENT_ADOPTED, "Adopted")
        } else {
            (reasons::DEPLOYMENT_UPDATED, "Updated")
        };
        info!(
            kind = %kind,
            name = %name,
            image = %image,
            changes = %summary,
            adopted = adopting,
            "updated"
        );
        self.publish(
            ghost,
            reason,
            actions::UPDATE,
            format!("{} Deployment {}: {}", verb, name, summary),
        )
        .await;
        Ok(Convergence::Updated { name, changes })
    }

    /// Create the Service if it is absent; an existing Service is never modified
    pub async fn converge_service(
        &self,
        ghost: &Ghost,
        names: &DependentNames,
    ) -> Result<Convergence, Error> {
        let kind = DependentKind::Service;
        if let Some(existing) = observe_service(self.store, names).await? {
            let name = existing.name_any();
            debug!(kind = %kind, name = %name, "already exists");
            return Ok(Convergence::Unchanged { name });
        }

        let mut desired = self.generator.service(names)?;
        stamp_owner(&mut desired.metadata, ghost)?;
        let created = self
            .store
            .create_service(&desired)
            .await
            .map_err(|e| e.during(kind, Operation::Create))?;

        let name = created.name_any();
        info!(kind = %kind, name = %name, "created");
        self.publish(
            ghost,
            reasons::SERVICE_CREATED,
            actions::CREATE,
            format!("Created Service {}", name),
        )
        .await;
        Ok(Convergence::Created { name })
    }

    async fn publish(&self, ghost: &Ghost, reason: &str, action: &str, note: String) {
        let reference: ObjectReference = ghost.object_ref(&());
        self.events
            .publish(&reference, EventType::Normal, reason, action, Some(note))
            .await;
    }
}
