//! Desired-state generation for Ghost dependents
//!
//! Every function here is pure: the same Ghost and templates always yield
//! structurally identical objects, which is what makes drift detection stable.
//!
//! # Naming
//!
//! Names derive from an instance suffix. The canonical instance (a Ghost named
//! `ghost`) uses the bare namespace, so `team1/ghost` owns `ghost-data-pvc-team1`
//! and `ghost-service-team1`. Any other Ghost appends its own name
//! (`team1/docs` owns `ghost-data-pvc-team1-docs`), so several Ghosts can share
//! a namespace without colliding.
//!
//! Service names and label values must be DNS-1035 labels of at most 63
//! characters, while Ghost names may be long and dotted. A suffix that would
//! not fit, or that contains characters a label cannot hold, is sanitised,
//! truncated and tagged with a hash of `namespace/name`.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use sha2::{Digest, Sha256};

use crate::crd::Ghost;
use crate::manifests::{Templates, DEPLOYMENT_TEMPLATE, SERVICE_TEMPLATE};
use crate::{Error, Result};

/// Name of the Ghost that owns the un-suffixed dependent names
pub const CANONICAL_GHOST_NAME: &str = "ghost";
/// Prefix of the data PVC name
pub const PVC_NAME_PREFIX: &str = "ghost-data-pvc-";
/// Prefix of the Deployment generate-name
pub const DEPLOYMENT_NAME_PREFIX: &str = "ghost-deployment-";
/// Prefix of the Service name
pub const SERVICE_NAME_PREFIX: &str = "ghost-service-";

/// Identity label key shared by the Deployment, its pods and the Service selector
pub const APP_LABEL: &str = "app";
/// Label recording which Ghost owns a dependent
pub const GHOST_LABEL: &str = "blog.example.com/ghost";
/// Standard managed-by label key
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Value of the managed-by label
pub const MANAGED_BY: &str = "ghost-operator";

/// Image repository for the blog container
pub const GHOST_IMAGE_REPOSITORY: &str = "ghost";
/// Name of the blog container inside the Deployment
pub const GHOST_CONTAINER: &str = "ghost";
/// Port the blog listens on
pub const GHOST_PORT: i32 = 2368;
/// Pod volume bound to the data PVC
pub const DATA_VOLUME: &str = "ghost-data";
/// Node port used when none is configured
pub const DEFAULT_NODE_PORT: i32 = 30001;

/// Longest instance suffix. Keeps `ghost-deployment-<suffix>-` within the 58
/// characters the API server keeps of a generate-name prefix.
pub const MAX_SUFFIX_LEN: usize = 40;
/// Longest label value the API server accepts
pub const MAX_LABEL_VALUE_LEN: usize = 63;
const HASH_LEN: usize = 8;

/// Deterministic names and labels for one Ghost's dependents
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependentNames {
    namespace: String,
    ghost: String,
    ghost_label: String,
    suffix: String,
}

impl DependentNames {
    /// Derive names for the given Ghost
    ///
    /// Fails if the Ghost is not namespaced.
    pub fn for_ghost(ghost: &Ghost) -> Result<Self> {
        let name = ghost.name_any();
        let namespace = ghost
            .namespace()
            .ok_or_else(|| Error::validation_for(&name, "Ghost must be namespaced"))?;
        Ok(Self::new(namespace, name))
    }

    /// Derive names from a namespace and Ghost name
    pub fn new(namespace: impl Into<String>, ghost: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let ghost = ghost.into();
        let identity = format!("{}/{}", namespace, ghost);

        let raw = if ghost == CANONICAL_GHOST_NAME {
            namespace.clone()
        } else {
            format!("{}-{}", namespace, ghost)
        };
        let suffix = if raw.len() <= MAX_SUFFIX_LEN && is_dns_label(&raw) {
            raw
        } else {
            shorten(&sanitize(&raw), MAX_SUFFIX_LEN, &identity)
        };

        let ghost_label = if ghost.len() <= MAX_LABEL_VALUE_LEN {
            ghost.clone()
        } else {
            shorten(&ghost, MAX_LABEL_VALUE_LEN, &identity)
        };

        Self {
            namespace,
            ghost,
            ghost_label,
            suffix,
        }
    }

    /// Namespace every dependent lives in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name of the owning Ghost
    pub fn ghost(&self) -> &str {
        &self.ghost
    }

    /// PVC name, e.g. `ghost-data-pvc-team1`
    pub fn pvc(&self) -> String {
        format!("{}{}", PVC_NAME_PREFIX, self.suffix)
    }

    /// Service name, e.g. `ghost-service-team1`
    pub fn service(&self) -> String {
        format!("{}{}", SERVICE_NAME_PREFIX, self.suffix)
    }

    /// Deployment generate-name prefix, e.g. `ghost-deployment-team1-`
    pub fn deployment_prefix(&self) -> String {
        format!("{}{}-", DEPLOYMENT_NAME_PREFIX, self.suffix)
    }

    /// Value of the `app` identity label, e.g. `ghost-team1`
    pub fn app(&self) -> String {
        format!("ghost-{}", self.suffix)
    }

    /// Label selector string identifying the Deployment, e.g. `app=ghost-team1`
    pub fn selector(&self) -> String {
        format!("{}={}", APP_LABEL, self.app())
    }

    /// Identity labels used as Deployment selector and Service selector
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(APP_LABEL.to_string(), self.app())])
    }

    /// Labels stamped on every dependent object
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.selector_labels();
        labels.insert(GHOST_LABEL.to_string(), self.ghost_label.clone());
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
        labels
    }

    fn metadata(&self, name: Option<String>, generate_name: Option<String>) -> ObjectMeta {
        ObjectMeta {
            name,
            generate_name,
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels()),
            ..Default::default()
        }
    }
}

fn is_dns_label(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .collect()
}

/// Cut `value` so that `<head>-<hash>` fits in `max` characters
///
/// The hash covers `identity`, so two values that sanitise or truncate to the
/// same head still get different results.
fn shorten(value: &str, max: usize, identity: &str) -> String {
    let keep = max - HASH_LEN - 1;
    let head: String = value.chars().take(keep).collect();
    let head = head.trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    format!("{}-{}", head, short_hash(identity))
}

fn short_hash(identity: &str) -> String {
    let digest = Sha256::digest(identity.as_bytes());
    let mut out = String::with_capacity(HASH_LEN);
    for byte in digest.iter().take(HASH_LEN / 2) {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

/// Image reference for a tag, e.g. `ghost:5.1.0`
pub fn image_for(tag: &str) -> String {
    format!("{}:{}", GHOST_IMAGE_REPOSITORY, tag)
}

/// Tenant-independent generation policy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratorOptions {
    /// Node port for the Service; `None` lets the cluster allocate one
    pub node_port: Option<i32>,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            node_port: Some(DEFAULT_NODE_PORT),
        }
    }
}

/// Combines baseline templates with per-Ghost values
#[derive(Clone, Debug)]
pub struct DesiredStateGenerator {
    templates: Arc<Templates>,
    options: GeneratorOptions,
}

impl DesiredStateGenerator {
    /// Create a generator over the given templates
    pub fn new(templates: Arc<Templates>, options: GeneratorOptions) -> Self {
        Self { templates, options }
    }

    /// Generator over the embedded templates with default options
    pub fn embedded() -> Result<Self> {
        Ok(Self::new(
            Arc::new(Templates::embedded()?),
            GeneratorOptions::default(),
        ))
    }

    /// Desired data PVC: fixed size and access mode from the template
    pub fn pvc(&self, names: &DependentNames) -> PersistentVolumeClaim {
        let mut pvc = self.templates.pvc.clone();
        pvc.metadata = names.metadata(Some(names.pvc()), None);
        pvc.status = None;
        pvc
    }

    /// Desired Deployment: single replica running `ghost:<imageTag>`
    ///
    /// The name is left unset; the API server generates it from the prefix and
    /// the `app` label carries the identity.
    pub fn deployment(&self, ghost: &Ghost, names: &DependentNames) -> Result<Deployment> {
        let mut deployment = self.templates.deployment.clone();
        deployment.metadata = names.metadata(None, Some(names.deployment_prefix()));
        deployment.status = None;

        let spec = deployment
            .spec
            .as_mut()
            .ok_or_else(|| Error::manifest(DEPLOYMENT_TEMPLATE, "template has no spec"))?;
        spec.replicas = Some(1);
        spec.selector.match_labels = Some(names.selector_labels());

        let template_meta = spec.template.metadata.get_or_insert_with(Default::default);
        template_meta.labels = Some(names.labels());

        let pod = spec
            .template
            .spec
            .as_mut()
            .ok_or_else(|| Error::manifest(DEPLOYMENT_TEMPLATE, "template has no pod spec"))?;

        let container = pod
            .containers
            .iter_mut()
            .find(|c| c.name == GHOST_CONTAINER)
            .ok_or_else(|| {
                Error::manifest(
                    DEPLOYMENT_TEMPLATE,
                    format!("template has no container named '{}'", GHOST_CONTAINER),
                )
            })?;
        container.image = Some(image_for(&ghost.spec.image_tag));

        let claim = pod
            .volumes
            .iter_mut()
            .flatten()
            .find(|v| v.name == DATA_VOLUME)
            .and_then(|v| v.persistent_volume_claim.as_mut())
            .ok_or_else(|| {
                Error::manifest(
                    DEPLOYMENT_TEMPLATE,
                    format!("template has no PVC volume named '{}'", DATA_VOLUME),
                )
            })?;
        claim.claim_name = names.pvc();

        Ok(deployment)
    }

    /// Desired NodePort Service mapping port 80 to the blog port
    pub fn service(&self, names: &DependentNames) -> Result<Service> {
        let mut service = self.templates.service.clone();
        service.metadata = names.metadata(Some(names.service()), None);
        service.status = None;

        let spec = service
            .spec
            .as_mut()
            .ok_or_else(|| Error::manifest(SERVICE_TEMPLATE, "template has no spec"))?;
        spec.selector = Some(names.selector_labels());

        let port = spec
            .ports
            .iter_mut()
            .flatten()
            .next()
            .ok_or_else(|| Error::manifest(SERVICE_TEMPLATE, "template has no ports"))?;
        port.node_port = self.options.node_port;

        Ok(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::GhostSpec;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use rstest::rstest;

    fn ghost(namespace: &str, name: &str, tag: &str) -> Ghost {
        let mut ghost = Ghost::new(
            name,
            GhostSpec {
                image_tag: tag.to_string(),
            },
        );
        ghost.metadata.namespace = Some(namespace.to_string());
        ghost
    }

    fn generator() -> DesiredStateGenerator {
        DesiredStateGenerator::embedded().unwrap()
    }

    /// Story: the canonical Ghost in team1 gets the documented names
    #[test]
    fn story_team1_scenario_objects() {
        let g = ghost("team1", "ghost", "5.1.0");
        let names = DependentNames::for_ghost(&g).unwrap();
        let gen = generator();

        let pvc = gen.pvc(&names);
        assert_eq!(pvc.metadata.name.as_deref(), Some("ghost-data-pvc-team1"));
        assert_eq!(pvc.metadata.namespace.as_deref(), Some("team1"));
        let spec = pvc.spec.unwrap();
        assert_eq!(spec.access_modes, Some(vec!["ReadWriteOnce".to_string()]));
        assert_eq!(spec.resources.unwrap().requests.unwrap()["storage"].0, "1Gi");

        let deployment = gen.deployment(&g, &names).unwrap();
        assert_eq!(deployment.metadata.name, None);
        assert_eq!(
            deployment.metadata.generate_name.as_deref(),
            Some("ghost-deployment-team1-")
        );
        let dspec = deployment.spec.unwrap();
        assert_eq!(dspec.replicas, Some(1));
        assert_eq!(
            dspec.selector.match_labels.unwrap()["app"],
            "ghost-team1".to_string()
        );
        let pod = dspec.template.spec.unwrap();
        assert_eq!(pod.containers[0].image.as_deref(), Some("ghost:5.1.0"));
        assert_eq!(
            pod.volumes.unwrap()[0]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "ghost-data-pvc-team1"
        );

        let service = gen.service(&names).unwrap();
        assert_eq!(service.metadata.name.as_deref(), Some("ghost-service-team1"));
        let sspec = service.spec.unwrap();
        assert_eq!(sspec.type_.as_deref(), Some("NodePort"));
        assert_eq!(sspec.selector.unwrap()["app"], "ghost-team1");
        let port = &sspec.ports.unwrap()[0];
        assert_eq!(port.port, 80);
        assert_eq!(port.target_port, Some(IntOrString::Int(GHOST_PORT)));
        assert_eq!(port.node_port, Some(DEFAULT_NODE_PORT));
    }

    #[test]
    fn generation_is_deterministic() {
        let g = ghost("team1", "ghost", "5.1.0");
        let names = DependentNames::for_ghost(&g).unwrap();
        let gen = generator();

        assert_eq!(gen.pvc(&names), gen.pvc(&names));
        assert_eq!(
            gen.deployment(&g, &names).unwrap(),
            gen.deployment(&g, &names).unwrap()
        );
        assert_eq!(gen.service(&names).unwrap(), gen.service(&names).unwrap());
    }

    #[test]
    fn namespaces_produce_disjoint_names() {
        let a = DependentNames::new("a", "ghost");
        let b = DependentNames::new("b", "ghost");
        assert_eq!(a.pvc(), "ghost-data-pvc-a");
        assert_eq!(b.pvc(), "ghost-data-pvc-b");
        assert_eq!(a.selector(), "app=ghost-a");
        assert_eq!(b.selector(), "app=ghost-b");
    }

    /// Story: a second Ghost in the same namespace does not collide
    #[test]
    fn story_second_ghost_in_namespace_gets_own_names() {
        let canonical = DependentNames::new("team1", "ghost");
        let docs = DependentNames::new("team1", "docs");
        assert_eq!(docs.pvc(), "ghost-data-pvc-team1-docs");
        assert_eq!(docs.service(), "ghost-service-team1-docs");
        assert_eq!(docs.deployment_prefix(), "ghost-deployment-team1-docs-");
        assert_ne!(canonical.selector(), docs.selector());
    }

    #[test]
    fn labels_carry_owner_and_manager() {
        let labels = DependentNames::new("team1", "docs").labels();
        assert_eq!(labels[GHOST_LABEL], "docs");
        assert_eq!(labels[MANAGED_BY_LABEL], MANAGED_BY);
        assert_eq!(labels[APP_LABEL], "ghost-team1-docs");
    }

    fn fits_dns_label(value: &str) -> bool {
        value.len() <= 63
            && value
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && value.starts_with(|c: char| c.is_ascii_alphanumeric())
            && value.ends_with(|c: char| c.is_ascii_alphanumeric())
    }

    /// Story: `team1/my.blog` gets a Service and labels the API server accepts
    #[test]
    fn story_dotted_ghost_name_yields_valid_names() {
        let names = DependentNames::new("team1", "my.blog");
        assert!(fits_dns_label(&names.service()), "{}", names.service());
        assert!(fits_dns_label(&names.app()), "{}", names.app());
        assert!(names.service().starts_with("ghost-service-team1-my-blog-"));
        assert!(names.deployment_prefix().len() <= 58);
        assert_eq!(names.labels()[GHOST_LABEL], "my.blog");

        let dashed = DependentNames::new("team1", "my-blog");
        assert_eq!(dashed.service(), "ghost-service-team1-my-blog");
        assert_ne!(names.service(), dashed.service());
        assert_ne!(names.app(), dashed.app());
    }

    #[rstest]
    #[case::long_ghost("team1", &"b".repeat(60))]
    #[case::long_namespace(&"n".repeat(63), "ghost")]
    #[case::both_long(&"n".repeat(63), &"b".repeat(253))]
    fn long_names_are_bounded(#[case] namespace: &str, #[case] ghost: &str) {
        let names = DependentNames::new(namespace, ghost);
        assert!(fits_dns_label(&names.service()), "{}", names.service());
        assert!(fits_dns_label(&names.pvc()), "{}", names.pvc());
        assert!(fits_dns_label(&names.app()), "{}", names.app());
        assert!(names.deployment_prefix().len() <= 58);
        for value in names.labels().values() {
            assert!(value.len() <= MAX_LABEL_VALUE_LEN, "{value}");
        }
        assert_eq!(names, DependentNames::new(namespace, ghost));
    }

    #[test]
    fn truncated_names_stay_distinct() {
        let a = DependentNames::new("team1", &format!("{}a", "b".repeat(60)));
        let b = DependentNames::new("team1", &format!("{}c", "b".repeat(60)));
        assert_ne!(a.service(), b.service());
        assert_ne!(a.labels()[GHOST_LABEL], b.labels()[GHOST_LABEL]);
    }

    #[test]
    fn unnamespaced_ghost_is_rejected() {
        let g = Ghost::new(
            "ghost",
            GhostSpec {
                image_tag: "5".into(),
            },
        );
        assert!(DependentNames::for_ghost(&g).is_err());
    }

    #[test]
    fn node_port_can_be_left_to_the_cluster() {
        let gen = DesiredStateGenerator::new(
            Arc::new(Templates::embedded().unwrap()),
            GeneratorOptions { node_port: None },
        );
        let service = gen.service(&DependentNames::new("a", "ghost")).unwrap();
        assert_eq!(service.spec.unwrap().ports.unwrap()[0].node_port, None);
    }

    #[test]
    fn image_tag_is_used_verbatim() {
        assert_eq!(image_for("5.1.0-alpine"), "ghost:5.1.0-alpine");
    }
}
