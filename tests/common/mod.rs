//! Common test utilities
//!
//! An in-memory cluster implementing `ResourceClient`, with the API-server
//! behaviour the operator relies on: resourceVersion preconditions,
//! finalizer-gated deletion, owner-checked creates and watch streams.
//! Faults can be injected to exercise retry paths.

#![allow(dead_code, reason = "not every test binary uses every helper")]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::stream::{BoxStream, StreamExt};
use job_operator::config::ControllerConfig;
use job_operator::controller::client::{ClientError, ResourceClient, WatchEvent};
use job_operator::controller::identity::ObjectKey;
use job_operator::controller::reconciler::{Clock, Reconciler};
use job_operator::controller::translator::WorkloadManifest;
use job_operator::controller::workload::WorkloadObject;
use job_operator::crd::{JobRequest, JobRequestSpec, JobRequestStatus, WorkloadKind};
use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateTerminated, ContainerStatus, Pod, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;

pub const NAMESPACE: &str = "data-manager";

#[derive(Default)]
struct ClusterState {
    next_resource_version: u64,
    next_uid: u64,
    job_requests: HashMap<ObjectKey, JobRequest>,
    workloads: HashMap<(WorkloadKind, ObjectKey), WorkloadObject>,
    /// Pods run by batch Jobs, keyed by the Job
    job_pods: HashMap<ObjectKey, Vec<Pod>>,
    /// Creates still to fail with a transient error
    create_failures: u32,
    /// Status patches still to fail with a conflict
    status_conflicts: u32,
    /// Deleted workloads linger with a deletionTimestamp until released
    graceful_delete: bool,
    create_attempts: Vec<tokio::time::Instant>,
    creates: u32,
    deletes: u32,
    status_patches: u32,
    finalizer_patches: u32,
    phases_seen: Vec<Option<String>>,
}

impl ClusterState {
    fn bump(&mut self) -> String {
        self.next_resource_version += 1;
        self.next_resource_version.to_string()
    }

    fn uid(&mut self, prefix: &str) -> String {
        self.next_uid += 1;
        format!("{prefix}-uid-{}", self.next_uid)
    }
}

pub struct FakeCluster {
    state: Mutex<ClusterState>,
    job_request_events: broadcast::Sender<WatchEvent<JobRequest>>,
    workload_events: broadcast::Sender<WatchEvent<WorkloadObject>>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        let (job_request_events, _) = broadcast::channel(1024);
        let (workload_events, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(ClusterState::default()),
            job_request_events,
            workload_events,
        }
    }
}

fn deletion_time() -> Time {
    serde_json::from_value(serde_json::json!("2024-01-01T00:00:00Z"))
        .expect("valid timestamp")
}

fn conflict(key: &ObjectKey) -> ClientError {
    ClientError::Conflict {
        message: format!("the object {key} has been modified; please apply your changes to the latest version"),
    }
}

fn not_found(key: &ObjectKey) -> ClientError {
    ClientError::NotFound {
        message: format!("jobrequests.squonk.it \"{}\" not found", key.name),
    }
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().expect("cluster state lock")
    }

    fn emit_job_request(&self, event: WatchEvent<JobRequest>) {
        let _ = self.job_request_events.send(event);
    }

    fn emit_workload(&self, event: WatchEvent<WorkloadObject>) {
        let _ = self.workload_events.send(event);
    }

    // --- JobRequest lifecycle, as a user would drive it ---

    /// Create a JobRequest, returning its key
    pub fn create_job_request(&self, name: &str, spec: JobRequestSpec) -> ObjectKey {
        let key = ObjectKey::new(NAMESPACE, name);
        let mut job = JobRequest::new(name, spec);
        let created = {
            let mut state = self.lock();
            job.metadata.namespace = Some(NAMESPACE.to_string());
            job.metadata.uid = Some(state.uid(name));
            job.metadata.generation = Some(1);
            job.metadata.resource_version = Some(state.bump());
            state.job_requests.insert(key.clone(), job.clone());
            job
        };
        self.emit_job_request(WatchEvent::Applied(created));
        key
    }

    /// Edit the spec, bumping the generation
    pub fn update_spec(&self, key: &ObjectKey, edit: impl FnOnce(&mut JobRequestSpec)) {
        let updated = {
            let mut state = self.lock();
            let rv = state.bump();
            let job = state.job_requests.get_mut(key).expect("JobRequest exists");
            edit(&mut job.spec);
            job.metadata.generation = Some(job.metadata.generation.unwrap_or(0) + 1);
            job.metadata.resource_version = Some(rv);
            job.clone()
        };
        self.emit_job_request(WatchEvent::Applied(updated));
    }

    /// Request deletion: removed at once without finalizers, otherwise marked
    pub fn delete_job_request(&self, key: &ObjectKey) {
        let event = {
            let mut state = self.lock();
            let Some(job) = state.job_requests.get(key).cloned() else {
                return;
            };
            if job.metadata.finalizers.as_deref().unwrap_or_default().is_empty() {
                state.job_requests.remove(key);
                WatchEvent::Deleted(job)
            } else {
                let rv = state.bump();
                let job = state.job_requests.get_mut(key).expect("JobRequest exists");
                job.metadata.deletion_timestamp.get_or_insert_with(deletion_time);
                job.metadata.resource_version = Some(rv);
                WatchEvent::Applied(job.clone())
            }
        };
        self.emit_job_request(event);
    }

    /// Remove a JobRequest ignoring finalizers, like a forced etcd delete
    pub fn force_remove_job_request(&self, key: &ObjectKey) {
        let removed = self.lock().job_requests.remove(key);
        if let Some(job) = removed {
            self.emit_job_request(WatchEvent::Deleted(job));
        }
    }

    pub fn job_request(&self, key: &ObjectKey) -> Option<JobRequest> {
        self.lock().job_requests.get(key).cloned()
    }

    pub fn status(&self, key: &ObjectKey) -> JobRequestStatus {
        self.job_request(key)
            .and_then(|job| job.status)
            .unwrap_or_default()
    }

    // --- workloads, as the kubelet and job controller would drive them ---

    pub fn workload(&self, key: &ObjectKey, kind: WorkloadKind) -> Option<WorkloadObject> {
        self.lock().workloads.get(&(kind, key.clone())).cloned()
    }

    pub fn pod(&self, key: &ObjectKey) -> Option<WorkloadObject> {
        self.workload(key, WorkloadKind::Pod)
    }

    pub fn workload_count(&self) -> usize {
        self.lock().workloads.len()
    }

    /// Insert a workload directly, bypassing ownership checks
    pub fn insert_workload(&self, mut workload: WorkloadObject) {
        let inserted = {
            let mut state = self.lock();
            let uid = state.uid(workload.name());
            let rv = state.bump();
            let meta = workload.metadata_mut();
            meta.uid.get_or_insert(uid);
            meta.resource_version = Some(rv);
            let key = ObjectKey::new(workload.namespace(), workload.name());
            state
                .workloads
                .insert((workload.kind(), key), workload.clone());
            workload
        };
        self.emit_workload(WatchEvent::Applied(inserted));
    }

    fn update_workload(
        &self,
        key: &ObjectKey,
        kind: WorkloadKind,
        edit: impl FnOnce(&mut WorkloadObject),
    ) {
        let updated = {
            let mut state = self.lock();
            let rv = state.bump();
            let workload = state
                .workloads
                .get_mut(&(kind, key.clone()))
                .expect("workload exists");
            edit(workload);
            workload.metadata_mut().resource_version = Some(rv);
            workload.clone()
        };
        self.emit_workload(WatchEvent::Applied(updated));
    }

    pub fn set_pod_phase(&self, key: &ObjectKey, phase: &str) {
        self.update_workload(key, WorkloadKind::Pod, |workload| {
            if let WorkloadObject::Pod(pod) = workload {
                pod.status = Some(PodStatus {
                    phase: Some(phase.to_string()),
                    ..PodStatus::default()
                });
            }
        });
    }

    /// The container exited; zero means Succeeded, anything else Failed
    pub fn set_pod_exited(&self, key: &ObjectKey, exit_code: i32) {
        self.update_workload(key, WorkloadKind::Pod, |workload| {
            if let WorkloadObject::Pod(pod) = workload {
                let phase = if exit_code == 0 { "Succeeded" } else { "Failed" };
                pod.status = Some(PodStatus {
                    phase: Some(phase.to_string()),
                    container_statuses: Some(vec![ContainerStatus {
                        name: "job".to_string(),
                        state: Some(ContainerState {
                            terminated: Some(ContainerStateTerminated {
                                exit_code,
                                reason: Some(
                                    if exit_code == 0 { "Completed" } else { "Error" }.to_string(),
                                ),
                                ..ContainerStateTerminated::default()
                            }),
                            ..ContainerState::default()
                        }),
                        ..ContainerStatus::default()
                    }]),
                    ..PodStatus::default()
                });
            }
        });
    }

    pub fn set_job_active(&self, key: &ObjectKey) {
        self.update_workload(key, WorkloadKind::Job, |workload| {
            if let WorkloadObject::Job(job) = workload {
                job.status = Some(JobStatus {
                    active: Some(1),
                    ..JobStatus::default()
                });
            }
        });
    }

    pub fn set_job_complete(&self, key: &ObjectKey) {
        self.update_workload(key, WorkloadKind::Job, |workload| {
            if let WorkloadObject::Job(job) = workload {
                job.status = Some(JobStatus {
                    succeeded: Some(1),
                    conditions: Some(vec![JobCondition {
                        type_: "Complete".to_string(),
                        status: "True".to_string(),
                        ..JobCondition::default()
                    }]),
                    ..JobStatus::default()
                });
            }
        });
    }

    /// The Job's only pod exited with `exit_code` and the Job gave up
    pub fn set_job_failed(&self, key: &ObjectKey, exit_code: i32) {
        let mut pod = Pod::default();
        pod.metadata.name = Some(format!("{}-x7k2p", key.name));
        pod.metadata.namespace = Some(key.namespace.clone());
        pod.status = Some(PodStatus {
            phase: Some("Failed".to_string()),
            container_statuses: Some(vec![ContainerStatus {
                name: "job".to_string(),
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code,
                        reason: Some("Error".to_string()),
                        ..ContainerStateTerminated::default()
                    }),
                    ..ContainerState::default()
                }),
                ..ContainerStatus::default()
            }]),
            ..PodStatus::default()
        });
        self.lock().job_pods.insert(key.clone(), vec![pod]);
        self.update_workload(key, WorkloadKind::Job, |workload| {
            if let WorkloadObject::Job(job) = workload {
                job.status = Some(JobStatus {
                    failed: Some(1),
                    conditions: Some(vec![JobCondition {
                        type_: "Failed".to_string(),
                        status: "True".to_string(),
                        reason: Some("BackoffLimitExceeded".to_string()),
                        message: Some("Job has reached the specified backoff limit".to_string()),
                        ..JobCondition::default()
                    }]),
                    ..JobStatus::default()
                });
            }
        });
    }

    /// Remove every workload that is waiting out its grace period
    pub fn finish_graceful_deletes(&self) {
        let removed: Vec<WorkloadObject> = {
            let mut state = self.lock();
            let keys: Vec<_> = state
                .workloads
                .iter()
                .filter(|(_, w)| w.is_terminating())
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter()
                .filter_map(|k| state.workloads.remove(k))
                .collect()
        };
        for workload in removed {
            self.emit_workload(WatchEvent::Deleted(workload));
        }
    }

    // --- fault injection and inspection ---

    pub fn fail_next_creates(&self, count: u32) {
        self.lock().create_failures = count;
    }

    pub fn conflict_next_status_patches(&self, count: u32) {
        self.lock().status_conflicts = count;
    }

    pub fn set_graceful_delete(&self, graceful: bool) {
        self.lock().graceful_delete = graceful;
    }

    pub fn create_attempts(&self) -> Vec<tokio::time::Instant> {
        self.lock().create_attempts.clone()
    }

    pub fn creates(&self) -> u32 {
        self.lock().creates
    }

    pub fn deletes(&self) -> u32 {
        self.lock().deletes
    }

    /// Every successful write the operator has made
    pub fn writes(&self) -> u32 {
        let state = self.lock();
        state.creates + state.deletes + state.status_patches + state.finalizer_patches
    }

    /// Phases in the order they were written
    pub fn phases_seen(&self) -> Vec<Option<String>> {
        self.lock().phases_seen.clone()
    }
}

fn check_resource_version(
    job: &JobRequest,
    key: &ObjectKey,
    resource_version: &str,
) -> Result<(), ClientError> {
    if job.metadata.resource_version.as_deref() == Some(resource_version) {
        Ok(())
    } else {
        Err(conflict(key))
    }
}

#[async_trait]
impl ResourceClient for FakeCluster {
    async fn get_job_request(&self, key: &ObjectKey) -> Result<Option<JobRequest>, ClientError> {
        Ok(self.job_request(key))
    }

    async fn list_job_requests(&self) -> Result<Vec<JobRequest>, ClientError> {
        Ok(self.lock().job_requests.values().cloned().collect())
    }

    async fn patch_job_request_status(
        &self,
        key: &ObjectKey,
        resource_version: &str,
        status: &JobRequestStatus,
    ) -> Result<JobRequest, ClientError> {
        let updated = {
            let mut state = self.lock();
            if state.status_conflicts > 0 {
                state.status_conflicts -= 1;
                // Someone else wrote in the meantime
                let rv = state.bump();
                if let Some(job) = state.job_requests.get_mut(key) {
                    job.metadata.resource_version = Some(rv);
                }
                return Err(conflict(key));
            }
            let rv = state.bump();
            let job = state.job_requests.get_mut(key).ok_or_else(|| not_found(key))?;
            check_resource_version(job, key, resource_version)?;
            job.status = Some(status.clone());
            job.metadata.resource_version = Some(rv);
            let job = job.clone();
            state.status_patches += 1;
            state
                .phases_seen
                .push(status.phase.map(|p| p.as_str().to_string()));
            job
        };
        self.emit_job_request(WatchEvent::Applied(updated.clone()));
        Ok(updated)
    }

    async fn set_finalizers(
        &self,
        key: &ObjectKey,
        resource_version: &str,
        finalizers: Vec<String>,
    ) -> Result<JobRequest, ClientError> {
        let (updated, removed) = {
            let mut state = self.lock();
            let rv = state.bump();
            let job = state.job_requests.get_mut(key).ok_or_else(|| not_found(key))?;
            check_resource_version(job, key, resource_version)?;
            job.metadata.finalizers = Some(finalizers);
            job.metadata.resource_version = Some(rv);
            let job = job.clone();
            state.finalizer_patches += 1;
            let released = job.metadata.deletion_timestamp.is_some()
                && job.metadata.finalizers.as_deref().unwrap_or_default().is_empty();
            if released {
                state.job_requests.remove(key);
            }
            (job, released)
        };
        if removed {
            self.emit_job_request(WatchEvent::Deleted(updated.clone()));
        } else {
            self.emit_job_request(WatchEvent::Applied(updated.clone()));
        }
        Ok(updated)
    }

    async fn get_workload(
        &self,
        key: &ObjectKey,
        kind: WorkloadKind,
    ) -> Result<Option<WorkloadObject>, ClientError> {
        Ok(self.workload(key, kind))
    }

    async fn create_workload(
        &self,
        manifest: &WorkloadManifest,
    ) -> Result<WorkloadObject, ClientError> {
        let key = ObjectKey::new(&manifest.namespace, &manifest.name);
        let created = {
            let mut state = self.lock();
            state.create_attempts.push(tokio::time::Instant::now());
            if state.create_failures > 0 {
                state.create_failures -= 1;
                return Err(ClientError::Unavailable {
                    message: "connection refused".to_string(),
                });
            }
            if let Some(existing) = state.workloads.get(&(manifest.kind, key.clone())) {
                return match existing.owner() {
                    Some(owner) if owner.uid == manifest.owner_uid => Ok(existing.clone()),
                    _ => Err(ClientError::ForeignOwner {
                        kind: manifest.kind.to_string(),
                        name: manifest.name.clone(),
                    }),
                };
            }
            let mut workload = manifest.object.clone();
            let uid = state.uid(&manifest.name);
            let rv = state.bump();
            let meta = workload.metadata_mut();
            meta.uid = Some(uid);
            meta.resource_version = Some(rv);
            state
                .workloads
                .insert((manifest.kind, key), workload.clone());
            state.creates += 1;
            workload
        };
        self.emit_workload(WatchEvent::Applied(created.clone()));
        Ok(created)
    }

    async fn delete_workload(
        &self,
        key: &ObjectKey,
        kind: WorkloadKind,
    ) -> Result<(), ClientError> {
        let event = {
            let mut state = self.lock();
            let map_key = (kind, key.clone());
            if !state.workloads.contains_key(&map_key) {
                return Ok(());
            }
            state.deletes += 1;
            if state.graceful_delete {
                let rv = state.bump();
                let workload = state.workloads.get_mut(&map_key).expect("present");
                let meta = workload.metadata_mut();
                meta.deletion_timestamp.get_or_insert_with(deletion_time);
                meta.resource_version = Some(rv);
                WatchEvent::Applied(workload.clone())
            } else {
                let workload = state.workloads.remove(&map_key).expect("present");
                WatchEvent::Deleted(workload)
            }
        };
        self.emit_workload(event);
        Ok(())
    }

    async fn list_workloads(&self) -> Result<Vec<WorkloadObject>, ClientError> {
        Ok(self.lock().workloads.values().cloned().collect())
    }

    async fn list_job_pods(&self, key: &ObjectKey) -> Result<Vec<Pod>, ClientError> {
        Ok(self.lock().job_pods.get(key).cloned().unwrap_or_default())
    }

    fn watch_job_requests(&self) -> BoxStream<'static, WatchEvent<JobRequest>> {
        broadcast_stream(self.job_request_events.subscribe())
    }

    fn watch_workloads(&self) -> BoxStream<'static, WatchEvent<WorkloadObject>> {
        broadcast_stream(self.workload_events.subscribe())
    }
}

/// A lagging receiver turns into a resync, like a watch that had to relist
fn broadcast_stream<K: Clone + Send + 'static>(
    receiver: broadcast::Receiver<WatchEvent<K>>,
) -> BoxStream<'static, WatchEvent<K>> {
    futures::stream::unfold(receiver, |mut receiver| async move {
        match receiver.recv().await {
            Ok(event) => Some((event, receiver)),
            Err(broadcast::error::RecvError::Lagged(_)) => Some((WatchEvent::Resynced, receiver)),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    })
    .boxed()
}

// --- fixtures ---

/// A JobRequest spec that passes validation
pub fn valid_spec() -> JobRequestSpec {
    JobRequestSpec {
        image: Some("informaticsmatters/rdkit-tools:1.2.0".to_string()),
        command: vec!["python".to_string(), "-m".to_string(), "tools.filter".to_string()],
        args: vec!["--input".to_string(), "in.sdf".to_string()],
        ..JobRequestSpec::default()
    }
}

/// Small, jitter-free delays so retry timing is predictable
pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        backoff_start_ms: 100,
        backoff_max_ms: 2_000,
        backoff_jitter: 0.0,
        finalizer_poll_interval_secs: 2,
        default_ttl_seconds: Some(5),
        max_concurrent_reconciliations: 4,
        ..ControllerConfig::default()
    }
}

/// Wall clock under test control
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new() -> Self {
        let start = Utc
            .with_ymd_and_hms(2024, 6, 1, 12, 0, 0)
            .single()
            .expect("valid start time");
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += chrono::Duration::from_std(by).expect("in range");
    }

    pub fn clock(&self) -> Clock {
        let now = Arc::clone(&self.now);
        Arc::new(move || *now.lock().expect("clock lock"))
    }
}

/// Wall clock that follows tokio's (possibly paused) time
pub fn tokio_clock() -> Clock {
    let origin = tokio::time::Instant::now();
    let start = Utc
        .with_ymd_and_hms(2024, 6, 1, 12, 0, 0)
        .single()
        .expect("valid start time");
    Arc::new(move || {
        start + chrono::Duration::from_std(origin.elapsed()).unwrap_or_else(|_| chrono::Duration::zero())
    })
}

pub fn reconciler(cluster: &Arc<FakeCluster>, clock: &ManualClock) -> Reconciler<FakeCluster> {
    Reconciler::new(Arc::clone(cluster), Arc::new(test_config())).with_clock(clock.clock())
}

/// Poll `condition` under tokio time until it holds or `timeout` passes
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
