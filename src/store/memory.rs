//! In-memory [`ClusterStore`]
//!
//! Mirrors the API server behaviour reconciliation depends on: resource
//! versions with 409 on stale updates, 409 on duplicate names, `generateName`,
//! UIDs, creation timestamps and equality label selectors. Every successful
//! write is journaled so tests can assert exactly which operations ran.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;

use super::{parse_selector, ClusterStore};
use crate::crd::{Ghost, GhostStatus};
use crate::error::{DependentKind, Operation};
use crate::Error;

type Key = (String, String);

/// A successful write recorded by [`InMemoryStore`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreWrite {
    /// Kind written
    pub kind: DependentKind,
    /// Create or update
    pub op: Operation,
    /// Namespace of the object
    pub namespace: String,
    /// Name of the object (generated names resolved)
    pub name: String,
}

#[derive(Default)]
struct State {
    ghosts: BTreeMap<Key, Ghost>,
    pvcs: BTreeMap<Key, PersistentVolumeClaim>,
    deployments: BTreeMap<Key, Deployment>,
    services: BTreeMap<Key, Service>,
    counter: u64,
    writes: Vec<StoreWrite>,
    failures: Vec<(DependentKind, Operation)>,
}

impl State {
    fn next(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Fill server-populated metadata for a new object
    fn admit(&mut self, meta: &mut ObjectMeta) -> Result<Key, Error> {
        let n = self.next();
        let namespace = meta
            .namespace
            .clone()
            .ok_or_else(|| Error::serialization("object has no namespace"))?;
        let name = match (&meta.name, &meta.generate_name) {
            (Some(name), _) => name.clone(),
            (None, Some(prefix)) => format!("{}{:05x}", prefix, n),
            (None, None) => return Err(Error::serialization("object has no name or generateName")),
        };
        meta.name = Some(name.clone());
        meta.uid = Some(format!("uid-{}", n));
        meta.resource_version = Some(n.to_string());
        meta.generation = Some(1);
        // Strictly increasing so creation order is observable.
        meta.creation_timestamp = Some(Time(Utc::now() + TimeDelta::seconds(n as i64)));
        Ok((namespace, name))
    }

    fn take_failure(&mut self, kind: DependentKind, op: Operation) -> bool {
        match self.failures.iter().position(|f| *f == (kind, op)) {
            Some(idx) => {
                self.failures.remove(idx);
                true
            }
            None => false,
        }
    }

    fn record(&mut self, kind: DependentKind, op: Operation, key: &Key) {
        self.writes.push(StoreWrite {
            kind,
            op,
            namespace: key.0.clone(),
            name: key.1.clone(),
        });
    }
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn matches_selector(meta: &ObjectMeta, selector: &str) -> bool {
    let labels = meta.labels.clone().unwrap_or_default();
    parse_selector(selector)
        .into_iter()
        .all(|(k, v)| match v {
            Some(v) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(k),
        })
}

/// In-memory cluster store
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Persist a Ghost, assigning UID and metadata like the API server would
    pub fn insert_ghost(&self, mut ghost: Ghost) -> Result<Ghost, Error> {
        let mut state = self.lock();
        let key = state.admit(&mut ghost.metadata)?;
        state.ghosts.insert(key, ghost.clone());
        Ok(ghost)
    }

    /// Replace a stored Ghost's spec, bumping its generation
    pub fn set_image_tag(&self, namespace: &str, name: &str, tag: &str) -> Option<Ghost> {
        let mut state = self.lock();
        let n = state.next();
        let ghost = state.ghosts.get_mut(&key(namespace, name))?;
        ghost.spec.image_tag = tag.to_string();
        ghost.metadata.generation = Some(ghost.metadata.generation.unwrap_or(0) + 1);
        ghost.metadata.resource_version = Some(n.to_string());
        Some(ghost.clone())
    }

    /// Remove a Ghost (dependents are left for the garbage collector)
    pub fn remove_ghost(&self, namespace: &str, name: &str) -> Option<Ghost> {
        self.lock().ghosts.remove(&key(namespace, name))
    }

    /// Stored Ghost, including status
    pub fn ghost(&self, namespace: &str, name: &str) -> Option<Ghost> {
        self.lock().ghosts.get(&key(namespace, name)).cloned()
    }

    /// Seed a Deployment directly, bypassing the write journal
    pub fn insert_deployment(&self, mut deployment: Deployment) -> Result<Deployment, Error> {
        let mut state = self.lock();
        let key = state.admit(&mut deployment.metadata)?;
        state.deployments.insert(key, deployment.clone());
        Ok(deployment)
    }

    /// Mutate a stored Deployment out of band, bumping its resourceVersion
    pub fn edit_deployment<F>(&self, namespace: &str, name: &str, edit: F) -> Option<Deployment>
    where
        F: FnOnce(&mut Deployment),
    {
        let mut state = self.lock();
        let n = state.next();
        let deployment = state.deployments.get_mut(&key(namespace, name))?;
        edit(deployment);
        deployment.metadata.resource_version = Some(n.to_string());
        Some(deployment.clone())
    }

    /// Stored PVC
    pub fn pvc(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.lock().pvcs.get(&key(namespace, name)).cloned()
    }

    /// Stored Service
    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.lock().services.get(&key(namespace, name)).cloned()
    }

    /// Every Deployment in a namespace, ordered by name
    pub fn deployments(&self, namespace: &str) -> Vec<Deployment> {
        self.lock()
            .deployments
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// Successful writes in order
    pub fn writes(&self) -> Vec<StoreWrite> {
        self.lock().writes.clone()
    }

    /// Forget the write journal
    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    /// Make the next `op` on `kind` fail with a conflict
    pub fn fail_next(&self, kind: DependentKind, op: Operation) {
        self.lock().failures.push((kind, op));
    }
}

#[async_trait]
impl ClusterStore for InMemoryStore {
    async fn get_ghost(&self, namespace: &str, name: &str) -> Result<Option<Ghost>, Error> {
        Ok(self.ghost(namespace, name))
    }

    async fn patch_ghost_status(
        &self,
        namespace: &str,
        name: &str,
        status: &GhostStatus,
    ) -> Result<(), Error> {
        let mut state = self.lock();
        let ghost = state
            .ghosts
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Error::conflict("Ghost", name))?;
        ghost.status = Some(status.clone());
        Ok(())
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        let mut state = self.lock();
        if state.take_failure(DependentKind::PersistentVolumeClaim, Operation::Read) {
            return Err(Error::conflict("PersistentVolumeClaim", name));
        }
        Ok(state.pvcs.get(&key(namespace, name)).cloned())
    }

    async fn create_pvc(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error> {
        let kind = DependentKind::PersistentVolumeClaim;
        let mut state = self.lock();
        if state.take_failure(kind, Operation::Create) {
            return Err(Error::conflict(kind.as_str(), pvc.name_any()));
        }
        let mut created = pvc.clone();
        let key = state.admit(&mut created.metadata)?;
        if state.pvcs.contains_key(&key) {
            return Err(Error::conflict(kind.as_str(), &key.1));
        }
        state.pvcs.insert(key.clone(), created.clone());
        state.record(kind, Operation::Create, &key);
        Ok(created)
    }

    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Deployment>, Error> {
        let mut state = self.lock();
        if state.take_failure(DependentKind::Deployment, Operation::Read) {
            return Err(Error::conflict("Deployment", selector));
        }
        Ok(state
            .deployments
            .iter()
            .filter(|((ns, _), d)| ns == namespace && matches_selector(&d.metadata, selector))
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        let kind = DependentKind::Deployment;
        let mut state = self.lock();
        if state.take_failure(kind, Operation::Create) {
            return Err(Error::conflict(kind.as_str(), deployment.name_any()));
        }
        let mut created = deployment.clone();
        let key = state.admit(&mut created.metadata)?;
        if state.deployments.contains_key(&key) {
            return Err(Error::conflict(kind.as_str(), &key.1));
        }
        state.deployments.insert(key.clone(), created.clone());
        state.record(kind, Operation::Create, &key);
        Ok(created)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        let kind = DependentKind::Deployment;
        let name = deployment.name_any();
        let namespace = deployment.namespace().unwrap_or_default();
        let mut state = self.lock();
        if state.take_failure(kind, Operation::Update) {
            return Err(Error::conflict(kind.as_str(), &name));
        }
        let n = state.next();
        let k = key(&namespace, &name);
        let stored = state
            .deployments
            .get_mut(&k)
            .ok_or_else(|| Error::conflict(kind.as_str(), &name))?;
        if stored.metadata.resource_version != deployment.metadata.resource_version {
            return Err(Error::conflict(kind.as_str(), &name));
        }

        let mut updated = deployment.clone();
        updated.metadata.resource_version = Some(n.to_string());
        if updated.spec != stored.spec {
            updated.metadata.generation = Some(stored.metadata.generation.unwrap_or(1) + 1);
        }
        *stored = updated.clone();
        state.record(kind, Operation::Update, &k);
        Ok(updated)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        let mut state = self.lock();
        if state.take_failure(DependentKind::Service, Operation::Read) {
            return Err(Error::conflict("Service", name));
        }
        Ok(state.services.get(&key(namespace, name)).cloned())
    }

    async fn create_service(&self, service: &Service) -> Result<Service, Error> {
        let kind = DependentKind::Service;
        let mut state = self.lock();
        if state.take_failure(kind, Operation::Create) {
            return Err(Error::conflict(kind.as_str(), service.name_any()));
        }
        let mut created = service.clone();
        let key = state.admit(&mut created.metadata)?;
        if state.services.contains_key(&key) {
            return Err(Error::conflict(kind.as_str(), &key.1));
        }
        state.services.insert(key.clone(), created.clone());
        state.record(kind, Operation::Create, &key);
        Ok(created)
    }
}
