//! # Reconciler
//!
//! Drives one JobRequest towards the state its spec and the cluster call for.
//!
//! Every invocation starts from a fresh read and is idempotent: running it
//! twice without an intervening change has the same effect as running it once.
//!
//! ## Module Structure
//!
//! - `types.rs` - Reconciler, error classes and outcomes
//! - `status.rs` - Status computation and guarded status writes

mod status;
mod types;

pub use status::observe;
pub use types::{Clock, ErrorClass, ReconcileOutcome, Reconciler, ReconcilerError};

use crate::controller::client::{ClientError, ResourceClient};
use crate::controller::finalizer;
use crate::controller::identity::ObjectKey;
use crate::controller::translator::{self, ValidationError, WorkloadManifest};
use crate::controller::workload::{self, WorkloadCondition, WorkloadObject};
use crate::crd::{JobPhase, JobRequest, JobRequestStatus, WorkloadKind};
use crate::observability::metrics;
use status::rfc3339;
use std::time::Duration;
use tracing::{debug, info, warn};

impl<C: ResourceClient> Reconciler<C> {
    /// Reconcile the JobRequest identified by `key`.
    ///
    /// Conflicts are retried at once from a fresh read, up to the configured
    /// bound; any other error is returned for the caller to back off.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome, ReconcilerError> {
        let mut conflicts = 0;
        loop {
            match self.reconcile_once(key).await {
                Err(e) if e.is_conflict() && conflicts < self.config.max_conflict_retries => {
                    conflicts += 1;
                    debug!(job_request = %key, attempt = conflicts, "conflict, re-reading");
                }
                result => return result,
            }
        }
    }

    async fn reconcile_once(&self, key: &ObjectKey) -> Result<ReconcileOutcome, ReconcilerError> {
        let Some(job) = self.client.get_job_request(key).await? else {
            debug!(job_request = %key, "JobRequest not found, nothing to do");
            return Ok(ReconcileOutcome::done());
        };

        if job.metadata.deletion_timestamp.is_some() {
            if finalizer::has_cleanup_finalizer(&job) {
                return finalizer::finalize(self, key, &job).await;
            }
            // Not ours to clean up; owner references let the garbage collector finish
            return Ok(ReconcileOutcome::done());
        }

        let status = job.status.clone().unwrap_or_default();
        if status.is_terminal() {
            return self.collect_finished(key, &job, &status).await;
        }
        if status.phase == Some(JobPhase::Terminating) {
            return Ok(ReconcileOutcome::done());
        }

        let manifest = match translator::translate(&job, &self.config.workload) {
            Ok(manifest) => manifest,
            Err(err) => {
                // An edit made the spec invalid; the running workload no longer matches it
                for kind in [WorkloadKind::Pod, WorkloadKind::Job] {
                    self.delete_owned(key, &job, kind).await?;
                }
                return self.fail_validation(key, &job, &status, &err).await;
            }
        };

        let job = finalizer::ensure_finalizer(self, key, job).await?;
        self.remove_other_kind(key, &job, manifest.kind).await?;

        match self.client.get_workload(key, manifest.kind).await? {
            None => self.create_workload(key, &job, &status, &manifest).await,
            Some(workload) => {
                self.observe_workload(key, &job, &status, &manifest, workload)
                    .await
            }
        }
    }

    async fn fail_validation(
        &self,
        key: &ObjectKey,
        job: &JobRequest,
        status: &JobRequestStatus,
        err: &ValidationError,
    ) -> Result<ReconcileOutcome, ReconcilerError> {
        warn!(job_request = %key, field = %err.field, "invalid JobRequest: {}", err.reason);
        let mut next = status.clone();
        next.phase = Some(JobPhase::Failed);
        next.message = Some(format!("invalid JobRequest: {err}"));
        next.completion_time
            .get_or_insert_with(|| rfc3339(self.now()));
        self.write_status(key, job, status, next).await?;
        Ok(ReconcileOutcome::done())
    }

    /// Delete a workload of the kind not requested, left over from an
    /// earlier `workloadKind`
    async fn remove_other_kind(
        &self,
        key: &ObjectKey,
        job: &JobRequest,
        kind: WorkloadKind,
    ) -> Result<(), ReconcilerError> {
        let other = match kind {
            WorkloadKind::Pod => WorkloadKind::Job,
            WorkloadKind::Job => WorkloadKind::Pod,
        };
        if self.delete_owned(key, job, other).await? {
            info!(job_request = %key, kind = %other, "workload kind changed, old workload deleted");
        }
        Ok(())
    }

    /// Delete this JobRequest's workload of `kind` unless it is already
    /// going away. Returns whether a delete was issued.
    async fn delete_owned(
        &self,
        key: &ObjectKey,
        job: &JobRequest,
        kind: WorkloadKind,
    ) -> Result<bool, ReconcilerError> {
        let Some(workload) = self.client.get_workload(key, kind).await? else {
            return Ok(false);
        };
        if !owned_by(&workload, job) || workload.is_terminating() {
            return Ok(false);
        }
        self.client.delete_workload(key, kind).await?;
        metrics::increment_workloads_deleted("spec-change");
        debug!(job_request = %key, kind = %kind, "workload deleted after spec change");
        Ok(true)
    }

    async fn create_workload(
        &self,
        key: &ObjectKey,
        job: &JobRequest,
        status: &JobRequestStatus,
        manifest: &WorkloadManifest,
    ) -> Result<ReconcileOutcome, ReconcilerError> {
        let workload = self.client.create_workload(manifest).await?;
        metrics::increment_workloads_created();
        info!(
            job_request = %key,
            kind = %manifest.kind,
            workload = %workload.name(),
            "workload created"
        );

        let mut next = status.clone();
        next.workload_ref = Some(workload.workload_ref());
        next.phase.get_or_insert(JobPhase::Pending);
        self.write_status(key, job, status, next).await?;
        Ok(ReconcileOutcome::done())
    }

    async fn observe_workload(
        &self,
        key: &ObjectKey,
        job: &JobRequest,
        status: &JobRequestStatus,
        manifest: &WorkloadManifest,
        workload: WorkloadObject,
    ) -> Result<ReconcileOutcome, ReconcilerError> {
        if workload.is_terminating() {
            debug!(job_request = %key, "workload still terminating");
            metrics::increment_requeues("workload-terminating");
            return Ok(ReconcileOutcome::requeue_after(
                self.config.finalizer_poll_interval(),
            ));
        }

        match workload.owner() {
            Some(owner) if owner.uid == manifest.owner_uid => {}
            Some(owner) => {
                // Left behind by an earlier JobRequest of the same name
                info!(
                    job_request = %key,
                    stale_owner = %owner.uid,
                    "deleting workload owned by a previous JobRequest"
                );
                self.client.delete_workload(key, manifest.kind).await?;
                metrics::increment_workloads_deleted("orphan");
                return Ok(ReconcileOutcome::requeue_after(
                    self.config.finalizer_poll_interval(),
                ));
            }
            None => {
                return Err(ClientError::ForeignOwner {
                    kind: manifest.kind.to_string(),
                    name: manifest.name.clone(),
                }
                .into());
            }
        }

        let condition = workload.condition();
        if !condition.is_terminal() && workload.spec_hash() != Some(manifest.spec_hash.as_str()) {
            info!(job_request = %key, "spec changed, recreating workload");
            self.client.delete_workload(key, manifest.kind).await?;
            metrics::increment_workloads_deleted("spec-change");
            return Ok(ReconcileOutcome::requeue_after(
                self.config.finalizer_poll_interval(),
            ));
        }

        let condition = match condition {
            WorkloadCondition::Failed(message) if manifest.kind == WorkloadKind::Job => {
                let detail = self.job_failure_detail(key).await;
                WorkloadCondition::Failed(detail.unwrap_or(message))
            }
            other => other,
        };

        let next = observe(status, &workload, &condition, &rfc3339(self.now()));
        let terminal = next.is_terminal();
        let job = self.write_status(key, job, status, next.clone()).await?;
        if terminal {
            return self.collect_finished(key, &job, &next).await;
        }
        Ok(ReconcileOutcome::done())
    }

    /// Exit details of the failed container behind a failed batch Job. The
    /// Job's own condition only says that its backoff limit was reached.
    async fn job_failure_detail(&self, key: &ObjectKey) -> Option<String> {
        match self.client.list_job_pods(key).await {
            Ok(pods) => pods.iter().find_map(workload::pod_failure_message),
            Err(e) => {
                warn!(job_request = %key, error = %e, "could not read pods of failed Job");
                None
            }
        }
    }

    /// Delete the workload of a finished JobRequest once its TTL has elapsed.
    /// Status is left untouched.
    async fn collect_finished(
        &self,
        key: &ObjectKey,
        job: &JobRequest,
        status: &JobRequestStatus,
    ) -> Result<ReconcileOutcome, ReconcilerError> {
        let kind = status
            .workload_ref
            .as_ref()
            .and_then(|r| WorkloadKind::from_kind(&r.kind))
            .unwrap_or(job.spec.workload_kind);

        let Some(workload) = self.client.get_workload(key, kind).await? else {
            return Ok(ReconcileOutcome::done());
        };
        if !owned_by(&workload, job) || workload.is_terminating() {
            return Ok(ReconcileOutcome::done());
        }
        if job.spec.debug || workload.is_debug() {
            debug!(job_request = %key, "debug workload retained");
            return Ok(ReconcileOutcome::done());
        }
        let Some(ttl) = job
            .spec
            .ttl_seconds_after_finished
            .or(self.config.default_ttl_seconds)
        else {
            return Ok(ReconcileOutcome::done());
        };
        let ttl = Duration::from_secs(ttl);

        // Without a usable completion time the TTL counts as elapsed
        let elapsed = match status
            .completion_time
            .as_deref()
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
        {
            Some(finished) => (self.now() - finished.with_timezone(&chrono::Utc))
                .to_std()
                .unwrap_or(Duration::ZERO),
            None => ttl,
        };

        if elapsed < ttl {
            metrics::increment_requeues("ttl");
            return Ok(ReconcileOutcome::requeue_after(ttl - elapsed));
        }

        info!(job_request = %key, kind = %kind, "TTL elapsed, deleting finished workload");
        self.client.delete_workload(key, kind).await?;
        metrics::increment_workloads_deleted("ttl");
        Ok(ReconcileOutcome::done())
    }
}

/// Whether the workload's controller owner is this incarnation of `job`
pub(crate) fn owned_by(workload: &WorkloadObject, job: &JobRequest) -> bool {
    match (workload.owner(), job.metadata.uid.as_deref()) {
        (Some(owner), Some(uid)) => owner.uid == uid,
        _ => false,
    }
}
