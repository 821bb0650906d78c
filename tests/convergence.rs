//! Convergence behaviour against the in-memory cluster store
//!
//! These tests exercise the full reconcile path (store, generator, diff,
//! convergence, status, events) without a Kubernetes cluster.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use ghost_operator::controller::{reconcile_key, Context, ReconcileOutcome};
use ghost_operator::converge::{Convergence, ConvergenceEngine};
use ghost_operator::crd::{Ghost, GhostPhase, GhostSpec};
use ghost_operator::desired::{DependentNames, DesiredStateGenerator, GeneratorOptions};
use ghost_operator::diff::{ChangeSet, FieldChange};
use ghost_operator::error::{DependentKind, Operation};
use ghost_operator::events::RecordingEventPublisher;
use ghost_operator::store::{InMemoryStore, StoreWrite};

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

struct Cluster {
    store: Arc<InMemoryStore>,
    events: Arc<RecordingEventPublisher>,
    ctx: Context,
}

impl Cluster {
    fn new() -> Self {
        Self::with_options(GeneratorOptions::default())
    }

    fn with_options(options: GeneratorOptions) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let events = Arc::new(RecordingEventPublisher::new());
        let generator = DesiredStateGenerator::new(
            Arc::new(ghost_operator::manifests::Templates::embedded().unwrap()),
            options,
        );
        let ctx = Context::builder(store.clone(), Arc::new(generator))
            .events(events.clone())
            .build();
        Self { store, events, ctx }
    }

    fn add(&self, namespace: &str, name: &str, tag: &str) -> Ghost {
        self.store.insert_ghost(ghost(namespace, name, tag)).unwrap()
    }

    async fn reconcile(&self, namespace: &str, name: &str) -> ReconcileOutcome {
        reconcile_key(namespace, name, &self.ctx).await.unwrap()
    }

    fn deployment(&self, namespace: &str) -> Deployment {
        let mut all = self.store.deployments(namespace);
        assert_eq!(all.len(), 1, "expected exactly one Deployment in {namespace}");
        all.remove(0)
    }
}

fn image(deployment: &Deployment) -> Option<String> {
    deployment.spec.as_ref()?.template.spec.as_ref()?.containers[0]
        .image
        .clone()
}

fn report(outcome: ReconcileOutcome) -> ghost_operator::converge::ConvergenceReport {
    match outcome {
        ReconcileOutcome::Converged(report) => report,
        other => panic!("expected converged outcome, got {other:?}"),
    }
}

/// Story: Ghost{team1, 5.1.0} against an empty cluster yields the documented
/// PVC, Deployment and Service
#[tokio::test]
async fn story_team1_blog_from_empty_cluster() {
    let cluster = Cluster::new();
    cluster.add("team1", "ghost", "5.1.0");

    cluster.reconcile("team1", "ghost").await;

    let pvc = cluster.store.pvc("team1", "ghost-data-pvc-team1").unwrap();
    let pvc_spec = pvc.spec.unwrap();
    assert_eq!(pvc_spec.access_modes, Some(vec!["ReadWriteOnce".to_string()]));
    assert_eq!(
        pvc_spec.resources.unwrap().requests.unwrap()["storage"].0,
        "1Gi"
    );

    let deployment = cluster.deployment("team1");
    assert_eq!(deployment.labels()["app"], "ghost-team1");
    assert_eq!(image(&deployment).as_deref(), Some("ghost:5.1.0"));
    assert!(deployment.name_any().starts_with("ghost-deployment-team1-"));

    let service = cluster.store.service("team1", "ghost-service-team1").unwrap();
    let spec = service.spec.unwrap();
    assert_eq!(spec.type_.as_deref(), Some("NodePort"));
    assert_eq!(spec.selector.unwrap()["app"], "ghost-team1");
    let port = &spec.ports.unwrap()[0];
    assert_eq!(port.port, 80);
    assert_eq!(port.target_port, Some(IntOrString::Int(2368)));
}

/// Story: every dependent created from scratch points back at its Ghost
#[tokio::test]
async fn story_create_on_absence_stamps_owner() {
    let cluster = Cluster::new();
    let stored = cluster.add("team1", "ghost", "5.1.0");
    let uid = stored.metadata.uid.clone().unwrap();

    cluster.reconcile("team1", "ghost").await;

    let writes = cluster.store.writes();
    assert_eq!(writes.len(), 3);
    assert!(writes.iter().all(|w| w.op == Operation::Create));
    assert_eq!(
        writes.iter().map(|w| w.kind).collect::<Vec<_>>(),
        vec![
            DependentKind::PersistentVolumeClaim,
            DependentKind::Deployment,
            DependentKind::Service
        ]
    );

    let owners = [
        cluster
            .store
            .pvc("team1", "ghost-data-pvc-team1")
            .unwrap()
            .metadata,
        cluster.deployment("team1").metadata,
        cluster
            .store
            .service("team1", "ghost-service-team1")
            .unwrap()
            .metadata,
    ];
    for meta in owners {
        let refs = meta.owner_references.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].uid, uid);
        assert_eq!(refs[0].kind, "Ghost");
        assert_eq!(refs[0].controller, Some(true));
    }
}

/// Story: a second pass with nothing changed in between writes nothing
#[tokio::test]
async fn story_convergence_is_idempotent() {
    let cluster = Cluster::new();
    cluster.add("team1", "ghost", "5.1.0");

    cluster.reconcile("team1", "ghost").await;
    let deployment_before = cluster.deployment("team1");
    cluster.store.clear_writes();
    let events_before = cluster.events.events().len();

    let second = report(cluster.reconcile("team1", "ghost").await);

    assert!(!second.changed());
    assert!(cluster.store.writes().is_empty());
    assert_eq!(cluster.deployment("team1"), deployment_before);
    assert_eq!(cluster.events.events().len(), events_before);
}

#[tokio::test]
async fn generation_is_deterministic() {
    let generator = DesiredStateGenerator::embedded().unwrap();
    let g = ghost("team1", "ghost", "5.1.0");
    let names = DependentNames::for_ghost(&g).unwrap();

    assert_eq!(generator.pvc(&names), generator.pvc(&names));
    assert_eq!(
        generator.deployment(&g, &names).unwrap(),
        generator.deployment(&g, &names).unwrap()
    );
    assert_eq!(
        serde_json::to_vec(&generator.service(&names).unwrap()).unwrap(),
        serde_json::to_vec(&generator.service(&names).unwrap()).unwrap()
    );
}

/// Story: bumping imageTag from 1.0 to 2.0 issues exactly one Deployment update
#[tokio::test]
async fn story_image_drift_triggers_one_update() {
    let cluster = Cluster::new();
    cluster.add("team1", "ghost", "1.0");
    cluster.reconcile("team1", "ghost").await;
    let name = cluster.deployment("team1").name_any();
    assert_eq!(image(&cluster.deployment("team1")).as_deref(), Some("ghost:1.0"));

    cluster.store.set_image_tag("team1", "ghost", "2.0");
    cluster.store.clear_writes();
    let outcome = report(cluster.reconcile("team1", "ghost").await);

    assert_eq!(
        cluster.store.writes(),
        vec![StoreWrite {
            kind: DependentKind::Deployment,
            op: Operation::Update,
            namespace: "team1".into(),
            name: name.clone(),
        }]
    );
    assert_eq!(
        outcome.deployment,
        Convergence::Updated {
            name,
            changes: ChangeSet::Patch(vec![FieldChange::Image {
                from: Some("ghost:1.0".into()),
                to: "ghost:2.0".into(),
            }]),
        }
    );
    assert_eq!(image(&cluster.deployment("team1")).as_deref(), Some("ghost:2.0"));
    assert!(cluster
        .events
        .reasons()
        .contains(&"DeploymentUpdated".to_string()));
}

/// Story: scaling the Deployment by hand is left alone
#[tokio::test]
async fn story_replica_drift_is_ignored() {
    let cluster = Cluster::new();
    cluster.add("team1", "ghost", "5.1.0");
    cluster.reconcile("team1", "ghost").await;
    let name = cluster.deployment("team1").name_any();

    cluster.store.edit_deployment("team1", &name, |d| {
        d.spec.as_mut().unwrap().replicas = Some(3);
    });
    cluster.store.clear_writes();

    let outcome = report(cluster.reconcile("team1", "ghost").await);
    assert!(!outcome.changed());
    assert!(cluster.store.writes().is_empty());
    assert_eq!(
        cluster.deployment("team1").spec.unwrap().replicas,
        Some(3)
    );
}

/// Story: an image bump keeps out-of-band scaling instead of clobbering it
#[tokio::test]
async fn story_image_update_preserves_replicas() {
    let cluster = Cluster::new();
    cluster.add("team1", "ghost", "1.0");
    cluster.reconcile("team1", "ghost").await;
    let name = cluster.deployment("team1").name_any();
    cluster.store.edit_deployment("team1", &name, |d| {
        d.spec.as_mut().unwrap().replicas = Some(3);
    });

    cluster.store.set_image_tag("team1", "ghost", "2.0");
    cluster.reconcile("team1", "ghost").await;

    let spec = cluster.deployment("team1").spec.unwrap();
    assert_eq!(spec.replicas, Some(3));
    assert_eq!(
        spec.template.spec.unwrap().containers[0].image.as_deref(),
        Some("ghost:2.0")
    );
}

/// Story: tenants in namespaces a and b never see each other's objects
#[tokio::test]
async fn story_namespaces_are_isolated() {
    let cluster = Cluster::new();
    cluster.add("a", "ghost", "5.1.0");
    cluster.add("b", "ghost", "5.1.0");

    cluster.reconcile("a", "ghost").await;
    assert!(cluster.store.pvc("a", "ghost-data-pvc-a").is_some());
    assert!(cluster.store.pvc("b", "ghost-data-pvc-b").is_none());
    assert!(cluster.store.deployments("b").is_empty());

    cluster.reconcile("b", "ghost").await;
    let a = cluster.deployment("a");
    let b = cluster.deployment("b");
    assert_eq!(a.labels()["app"], "ghost-a");
    assert_eq!(b.labels()["app"], "ghost-b");

    cluster.store.set_image_tag("b", "ghost", "6.0");
    cluster.store.clear_writes();
    cluster.reconcile("b", "ghost").await;

    assert!(cluster.store.writes().iter().all(|w| w.namespace == "b"));
    assert_eq!(cluster.deployment("a"), a);
}

/// Story: two Ghosts in one namespace get separate dependents
#[tokio::test]
async fn story_second_ghost_in_namespace_does_not_collide() {
    let cluster = Cluster::with_options(GeneratorOptions { node_port: None });
    cluster.add("team1", "ghost", "5.1.0");
    cluster.add("team1", "docs", "5.2.0");

    cluster.reconcile("team1", "ghost").await;
    cluster.reconcile("team1", "docs").await;

    assert!(cluster.store.pvc("team1", "ghost-data-pvc-team1").is_some());
    assert!(cluster.store.pvc("team1", "ghost-data-pvc-team1-docs").is_some());
    assert!(cluster.store.service("team1", "ghost-service-team1-docs").is_some());

    let deployments = cluster.store.deployments("team1");
    assert_eq!(deployments.len(), 2);
    let mut apps: Vec<_> = deployments
        .iter()
        .map(|d| d.labels()["app"].clone())
        .collect();
    apps.sort();
    assert_eq!(apps, vec!["ghost-team1", "ghost-team1-docs"]);
}

/// Story: when a race left two Deployments behind, the oldest is managed and
/// the other is never touched
#[tokio::test]
async fn story_duplicate_deployments_resolve_to_oldest() {
    let cluster = Cluster::new();
    let stored = cluster.add("team1", "ghost", "1.0");
    cluster.reconcile("team1", "ghost").await;
    let original = cluster.deployment("team1");

    let names = DependentNames::for_ghost(&stored).unwrap();
    let mut straggler = DesiredStateGenerator::embedded()
        .unwrap()
        .deployment(&stored, &names)
        .unwrap();
    straggler.metadata = ObjectMeta {
        generate_name: straggler.metadata.generate_name.clone(),
        namespace: Some("team1".into()),
        labels: straggler.metadata.labels.clone(),
        ..Default::default()
    };
    let straggler = cluster.store.insert_deployment(straggler).unwrap();

    cluster.store.set_image_tag("team1", "ghost", "2.0");
    cluster.store.clear_writes();
    cluster.reconcile("team1", "ghost").await;

    let writes = cluster.store.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].name, original.name_any());

    let untouched = cluster
        .store
        .deployments("team1")
        .into_iter()
        .find(|d| d.name_any() == straggler.name_any())
        .unwrap();
    assert_eq!(untouched, straggler);
}

/// Story: a Deployment orphaned with `--cascade=orphan` is taken back under
/// the Ghost's ownership instead of being updated anonymously
#[tokio::test]
async fn story_orphaned_deployment_regains_owner() {
    let cluster = Cluster::new();
    let stored = cluster.add("team1", "ghost", "2.0");

    let names = DependentNames::for_ghost(&stored).unwrap();
    let mut orphan = DesiredStateGenerator::embedded()
        .unwrap()
        .deployment(&ghost("team1", "ghost", "1.0"), &names)
        .unwrap();
    orphan.metadata.owner_references = None;
    let orphan = cluster.store.insert_deployment(orphan).unwrap();

    cluster.reconcile("team1", "ghost").await;

    let adopted = cluster.deployment("team1");
    assert_eq!(adopted.name_any(), orphan.name_any());
    assert_eq!(image(&adopted).as_deref(), Some("ghost:2.0"));
    let refs = adopted.metadata.owner_references.unwrap();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].uid, stored.uid().unwrap());
    assert_eq!(refs[0].controller, Some(true));
    assert!(cluster
        .events
        .reasons()
        .contains(&"DeploymentAdopted".to_string()));
}

/// Story: a failure halfway leaves a partial state that the next pass finishes
#[tokio::test]
async fn story_partial_failure_recovers_on_retry() {
    let cluster = Cluster::new();
    cluster.add("team1", "ghost", "5.1.0");
    cluster
        .store
        .fail_next(DependentKind::Service, Operation::Create);

    let err = reconcile_key("team1", "ghost", &cluster.ctx)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.dependent_kind(), Some(DependentKind::Service));
    assert!(cluster.store.pvc("team1", "ghost-data-pvc-team1").is_some());
    assert!(cluster.store.service("team1", "ghost-service-team1").is_none());

    let outcome = report(cluster.reconcile("team1", "ghost").await);
    assert!(!outcome.pvc.wrote());
    assert!(!outcome.deployment.wrote());
    assert_eq!(
        outcome.service,
        Convergence::Created {
            name: "ghost-service-team1".into()
        }
    );
    assert_eq!(cluster.store.deployments("team1").len(), 1);
}

/// Story: deleting a Ghost needs no cleanup from the operator
#[tokio::test]
async fn story_deleted_ghost_needs_no_work() {
    let cluster = Cluster::new();
    cluster.add("team1", "ghost", "5.1.0");
    cluster.reconcile("team1", "ghost").await;
    cluster.store.remove_ghost("team1", "ghost");
    cluster.store.clear_writes();

    assert_eq!(
        cluster.reconcile("team1", "ghost").await,
        ReconcileOutcome::NothingToDo
    );
    assert!(cluster.store.writes().is_empty());
}

#[tokio::test]
async fn status_tracks_phase_and_generation() {
    let cluster = Cluster::new();
    cluster.add("team1", "ghost", "1.0");

    cluster.reconcile("team1", "ghost").await;
    let status = cluster.store.ghost("team1", "ghost").unwrap().status.unwrap();
    assert_eq!(status.phase, GhostPhase::Converging);
    assert_eq!(status.observed_generation, Some(1));

    cluster.reconcile("team1", "ghost").await;
    let status = cluster.store.ghost("team1", "ghost").unwrap().status.unwrap();
    assert_eq!(status.phase, GhostPhase::Ready);

    cluster.store.set_image_tag("team1", "ghost", "2.0");
    cluster.reconcile("team1", "ghost").await;
    let status = cluster.store.ghost("team1", "ghost").unwrap().status.unwrap();
    assert_eq!(status.phase, GhostPhase::Converging);
    assert_eq!(status.observed_generation, Some(2));
    assert_eq!(status.image.as_deref(), Some("ghost:2.0"));
}

#[tokio::test]
async fn engine_converges_without_controller() {
    let store = InMemoryStore::new();
    let events = RecordingEventPublisher::new();
    let generator = DesiredStateGenerator::embedded().unwrap();
    let stored = store.insert_ghost(ghost("team1", "ghost", "5.1.0")).unwrap();

    let report = ConvergenceEngine::new(&store, &generator, &events)
        .converge(&stored)
        .await
        .unwrap();
    assert!(report.changed());
    assert_eq!(
        events.reasons(),
        vec!["PVCReady", "DeploymentCreated", "ServiceCreated"]
    );
}
