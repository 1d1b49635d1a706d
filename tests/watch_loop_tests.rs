//! # Watch Loop Tests
//!
//! The full controller (observer, kube-runtime controller, retry policy) running
//! against the in-memory cluster under paused tokio time.

mod common;

use common::{eventually, test_config, tokio_clock, valid_spec, FakeCluster, NAMESPACE};
use job_operator::controller::identity::ObjectKey;
use job_operator::controller::reconciler::Reconciler;
use job_operator::controller::workload::WorkloadObject;
use job_operator::crd::JobPhase;
use job_operator::runtime::watch_loop::run_watch_loop;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Result<(), anyhow::Error>>,
}

impl Running {
    async fn stop(self) {
        self.shutdown.send(true).expect("loop still listening");
        let result = tokio::time::timeout(Duration::from_secs(30), self.handle)
            .await
            .expect("loop stops promptly")
            .expect("loop did not panic");
        assert!(result.is_ok());
    }
}

fn start(cluster: &Arc<FakeCluster>) -> Running {
    let reconciler =
        Reconciler::new(Arc::clone(cluster), Arc::new(test_config())).with_clock(tokio_clock());
    let (shutdown, receiver) = watch::channel(false);
    let handle = tokio::spawn(run_watch_loop(reconciler, receiver));
    Running { shutdown, handle }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

#[tokio::test(start_paused = true)]
async fn test_job_runs_to_completion_and_is_collected() {
    let cluster = FakeCluster::new();
    let running = start(&cluster);

    let key = cluster.create_job_request("loop-a", valid_spec());
    assert!(eventually(secs(5), || cluster.status(&key).phase == Some(JobPhase::Pending)).await);
    assert!(cluster.pod(&key).is_some());

    cluster.set_pod_phase(&key, "Running");
    assert!(eventually(secs(5), || cluster.status(&key).phase == Some(JobPhase::Running)).await);

    cluster.set_pod_exited(&key, 0);
    assert!(eventually(secs(5), || cluster.status(&key).phase == Some(JobPhase::Succeeded)).await);
    assert!(cluster.pod(&key).is_some(), "kept for the TTL");

    assert!(eventually(secs(10), || cluster.pod(&key).is_none()).await);
    assert_eq!(cluster.status(&key).phase, Some(JobPhase::Succeeded));
    assert_eq!(cluster.creates(), 1);

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_deleting_running_job_request_cleans_up() {
    let cluster = FakeCluster::new();
    let running = start(&cluster);

    let key = cluster.create_job_request("loop-b", valid_spec());
    assert!(eventually(secs(5), || cluster.pod(&key).is_some()).await);
    cluster.set_pod_phase(&key, "Running");
    assert!(eventually(secs(5), || cluster.status(&key).phase == Some(JobPhase::Running)).await);

    cluster.set_graceful_delete(true);
    cluster.delete_job_request(&key);
    assert!(
        eventually(secs(5), || cluster.pod(&key).is_some_and(|p| p.is_terminating())).await
    );
    assert!(cluster.job_request(&key).is_some(), "held until the workload is gone");

    cluster.finish_graceful_deletes();
    assert!(eventually(secs(10), || cluster.job_request(&key).is_none()).await);
    assert_eq!(cluster.workload_count(), 0);

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_transient_create_errors_are_retried_with_backoff() {
    let cluster = FakeCluster::new();
    cluster.fail_next_creates(3);
    let running = start(&cluster);

    let key = cluster.create_job_request("loop-c", valid_spec());
    assert!(eventually(secs(30), || cluster.status(&key).phase == Some(JobPhase::Pending)).await);

    let attempts = cluster.create_attempts();
    assert!(attempts.len() >= 4, "{} attempts", attempts.len());
    let spread = *attempts.last().unwrap() - attempts[0];
    assert!(spread >= Duration::from_millis(100), "retries were delayed: {spread:?}");
    assert!(!cluster
        .phases_seen()
        .iter()
        .any(|p| p.as_deref() == Some("Failed")));
    assert_eq!(cluster.workload_count(), 1);

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_each_job_request_gets_exactly_one_workload() {
    let cluster = FakeCluster::new();
    let running = start(&cluster);

    let keys: Vec<ObjectKey> = (0..20)
        .map(|i| cluster.create_job_request(&format!("batch-{i}"), valid_spec()))
        .collect();
    assert!(
        eventually(secs(10), || keys
            .iter()
            .all(|k| cluster.status(k).phase == Some(JobPhase::Pending)))
        .await
    );
    assert_eq!(cluster.workload_count(), 20);
    assert_eq!(cluster.creates(), 20);

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_startup_resync_reaps_orphaned_workloads() {
    let cluster = FakeCluster::new();
    let mut pod = Pod::default();
    pod.metadata.name = Some("ghost".to_string());
    pod.metadata.namespace = Some(NAMESPACE.to_string());
    pod.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "squonk.it/v1".to_string(),
        kind: "JobRequest".to_string(),
        name: "ghost".to_string(),
        uid: "ghost-uid".to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }]);
    cluster.insert_workload(WorkloadObject::Pod(pod));

    let running = start(&cluster);
    assert!(eventually(secs(5), || cluster.workload_count() == 0).await);

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_job_requests_created_before_start_are_reconciled() {
    let cluster = FakeCluster::new();
    let key = cluster.create_job_request("early", valid_spec());

    let running = start(&cluster);
    assert!(eventually(secs(5), || cluster.status(&key).phase == Some(JobPhase::Pending)).await);

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_when_idle() {
    let cluster = FakeCluster::new();
    let running = start(&cluster);
    tokio::time::sleep(Duration::from_millis(50)).await;
    running.stop().await;
}
