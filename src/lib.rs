//! Ghost Operator - CRD-driven Kubernetes operator for Ghost blogs
//!
//! Each `Ghost` resource (`blog.example.com/v1`) describes one blog instance in
//! a tenant namespace. The operator derives three dependents from it and keeps
//! them converged:
//!
//! - a PersistentVolumeClaim holding the blog's content database
//! - a Deployment running `ghost:<imageTag>`
//! - a NodePort Service exposing the blog on port 80
//!
//! Dependents carry a controller owner reference back to their Ghost, so
//! deleting the Ghost cascades through the cluster garbage collector.
//!
//! # Modules
//!
//! - [`crd`] - Ghost Custom Resource Definition and status types
//! - [`manifests`] - Baseline templates for dependents
//! - [`desired`] - Deterministic names and desired-state generation
//! - [`owner`] - Owner references from dependents to their Ghost
//! - [`store`] - Cluster access (kube-rs, in-memory, timeout/cancellation wrapper)
//! - [`diff`] - Field-scoped drift detection for Deployments
//! - [`converge`] - Convergence engine
//! - [`events`] - Kubernetes Event publishing
//! - [`controller`] - Reconcile entry point and error policy
//! - [`retry`] - Exponential backoff with jitter
//! - [`config`] - Controller configuration
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod converge;
pub mod crd;
pub mod desired;
pub mod diff;
pub mod error;
pub mod events;
pub mod manifests;
pub mod owner;
pub mod retry;
pub mod store;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
