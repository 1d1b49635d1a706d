//! # Finalizer
//!
//! Ordered teardown of a JobRequest's workloads before the JobRequest itself
//! is allowed to disappear, plus the resync-time sweep for orphaned workloads.
//!
//! Every step is idempotent; a crash part-way through is picked up again by
//! the next reconciliation of the same key.

use crate::constants::CLEANUP_FINALIZER;
use crate::controller::client::{ClientError, ResourceClient};
use crate::controller::identity::ObjectKey;
use crate::controller::reconciler::{owned_by, ReconcileOutcome, Reconciler, ReconcilerError};
use crate::controller::workload::WorkloadObject;
use crate::crd::{JobPhase, JobRequest, WorkloadKind};
use crate::observability::metrics;
use kube::ResourceExt;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

pub fn has_cleanup_finalizer(job: &JobRequest) -> bool {
    job.finalizers().iter().any(|f| f == CLEANUP_FINALIZER)
}

/// Add the cleanup finalizer if missing, returning the latest object
pub async fn ensure_finalizer<C: ResourceClient>(
    reconciler: &Reconciler<C>,
    key: &ObjectKey,
    job: JobRequest,
) -> Result<JobRequest, ReconcilerError> {
    if has_cleanup_finalizer(&job) {
        return Ok(job);
    }
    let mut finalizers = job.finalizers().to_vec();
    finalizers.push(CLEANUP_FINALIZER.to_string());
    let resource_version = job.resource_version().unwrap_or_default();
    let updated = reconciler
        .client
        .set_finalizers(key, &resource_version, finalizers)
        .await?;
    debug!(job_request = %key, "cleanup finalizer added");
    Ok(updated)
}

/// Tear down the workloads of a JobRequest marked for deletion.
///
/// The finalizer is only released once no owned workload is left.
pub async fn finalize<C: ResourceClient>(
    reconciler: &Reconciler<C>,
    key: &ObjectKey,
    job: &JobRequest,
) -> Result<ReconcileOutcome, ReconcilerError> {
    let client = &reconciler.client;
    let status = job.status.clone().unwrap_or_default();

    let job = if status.accepts(JobPhase::Terminating) {
        let mut next = status.clone();
        next.phase = Some(JobPhase::Terminating);
        reconciler.write_status(key, job, &status, next).await?
    } else {
        job.clone()
    };

    let mut kinds = BTreeSet::from([job.spec.workload_kind.as_str()]);
    if let Some(workload_ref) = &status.workload_ref {
        kinds.insert(workload_ref.kind.as_str());
    }

    let mut remaining = 0usize;
    for kind in kinds.into_iter().filter_map(WorkloadKind::from_kind) {
        let Some(workload) = client.get_workload(key, kind).await? else {
            continue;
        };
        if !owned_by(&workload, &job) {
            continue;
        }
        if !workload.is_terminating() {
            client.delete_workload(key, kind).await?;
            metrics::increment_workloads_deleted("finalizer");
            info!(job_request = %key, kind = %kind, "workload deleted for JobRequest deletion");
        }
        // Only a confirmed absence releases the finalizer
        if client.get_workload(key, kind).await?.is_some() {
            remaining += 1;
        }
    }

    if remaining > 0 {
        debug!(job_request = %key, remaining, "waiting for workloads to terminate");
        metrics::increment_requeues("finalizer-wait");
        return Ok(ReconcileOutcome::requeue_after(
            reconciler.config.finalizer_poll_interval(),
        ));
    }

    let finalizers: Vec<String> = job
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != CLEANUP_FINALIZER)
        .cloned()
        .collect();
    let resource_version = job.resource_version().unwrap_or_default();
    match client.set_finalizers(key, &resource_version, finalizers).await {
        Ok(_) | Err(ClientError::NotFound { .. }) => {}
        Err(e) => return Err(e.into()),
    }
    info!(job_request = %key, "cleanup finalizer removed");
    Ok(ReconcileOutcome::done())
}

/// Delete every workload whose owning JobRequest no longer exists, or has
/// been replaced by a new object of the same name. Returns how many were deleted.
pub async fn reap_orphans<C: ResourceClient>(client: &C) -> Result<usize, ClientError> {
    let mut reaped = 0;
    for workload in client.list_workloads().await? {
        if workload.is_terminating() {
            continue;
        }
        let Some(owner) = workload.owner() else {
            continue;
        };
        let owner_key = ObjectKey::new(workload.namespace(), owner.name.clone());
        let alive = client
            .get_job_request(&owner_key)
            .await?
            .is_some_and(|job| job.metadata.uid.as_deref() == Some(owner.uid.as_str()));
        if alive {
            continue;
        }

        let workload_key = ObjectKey::new(workload.namespace(), workload.name());
        match delete_orphan(client, &workload_key, &workload).await {
            Ok(()) => reaped += 1,
            Err(e) => warn!(workload = %workload_key, error = %e, "failed to delete orphaned workload"),
        }
    }
    Ok(reaped)
}

async fn delete_orphan<C: ResourceClient>(
    client: &C,
    key: &ObjectKey,
    workload: &WorkloadObject,
) -> Result<(), ClientError> {
    client.delete_workload(key, workload.kind()).await?;
    metrics::increment_workloads_deleted("orphan");
    info!(workload = %key, kind = %workload.kind(), "orphaned workload deleted");
    Ok(())
}
