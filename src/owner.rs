//! Owner references from dependents back to their Ghost
//!
//! The controller owner reference is what lets the cluster garbage collector
//! delete a Ghost's PVC, Deployment and Service when the Ghost goes away. This
//! operator never issues deletes itself.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::crd::Ghost;
use crate::Error;

/// Build the controller owner reference for a Ghost
///
/// Fails if the Ghost has no name or UID (i.e. was never persisted).
pub fn owner_reference(owner: &Ghost) -> Result<OwnerReference, Error> {
    owner.controller_owner_ref(&()).ok_or_else(|| {
        Error::OwnerReference(format!(
            "Ghost {} has no name or uid; cannot reference it as owner",
            owner.name_any()
        ))
    })
}

/// Stamp `owner` as the controller of the object described by `meta`
///
/// Must be called before every create. Idempotent for the same owner; fails if
/// a different controller already owns the object.
pub fn stamp_owner(meta: &mut ObjectMeta, owner: &Ghost) -> Result<(), Error> {
    let reference = owner_reference(owner)?;
    let refs = meta.owner_references.get_or_insert_with(Vec::new);

    if let Some(existing) = refs.iter().find(|r| r.controller == Some(true)) {
        if existing.uid == reference.uid {
            return Ok(());
        }
        return Err(Error::OwnerReference(format!(
            "object is already controlled by {} {}",
            existing.kind, existing.name
        )));
    }

    refs.push(reference);
    Ok(())
}

/// Whether `meta` is controlled by `owner`
pub fn is_controlled_by(meta: &ObjectMeta, owner: &Ghost) -> bool {
    let Some(uid) = owner.meta().uid.as_deref() else {
        return false;
    };
    meta.owner_references
        .iter()
        .flatten()
        .any(|r| r.controller == Some(true) && r.uid == uid)
}

/// Whether some controller other than `owner` claims the object
pub fn has_foreign_controller(meta: &ObjectMeta, owner: &Ghost) -> bool {
    let uid = owner.meta().uid.as_deref();
    meta.owner_references
        .iter()
        .flatten()
        .any(|r| r.controller == Some(true) && Some(r.uid.as_str()) != uid)
}
