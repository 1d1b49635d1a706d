//! # Status
//!
//! Status computation and writes for JobRequests.

use super::types::{Reconciler, ReconcilerError};
use crate::controller::client::ResourceClient;
use crate::controller::identity::ObjectKey;
use crate::controller::workload::{WorkloadCondition, WorkloadObject};
use crate::crd::{JobPhase, JobRequest, JobRequestStatus};
use crate::observability::metrics;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info};

pub(crate) fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Status after observing `workload` in `condition`.
///
/// Timestamps are set once and never overwritten, and the phase only moves
/// forward, so observing the same condition again yields the same status.
pub fn observe(
    current: &JobRequestStatus,
    workload: &WorkloadObject,
    condition: &WorkloadCondition,
    now: &str,
) -> JobRequestStatus {
    let mut next = current.clone();
    next.workload_ref = Some(workload.workload_ref());

    let target = match condition {
        WorkloadCondition::Pending => JobPhase::Pending,
        WorkloadCondition::Running => JobPhase::Running,
        WorkloadCondition::Succeeded => JobPhase::Succeeded,
        WorkloadCondition::Failed(_) => JobPhase::Failed,
    };
    if !current.accepts(target) {
        return next;
    }

    next.phase = Some(target);
    if target != JobPhase::Pending {
        next.start_time.get_or_insert_with(|| now.to_string());
    }
    if target.is_terminal() {
        next.completion_time.get_or_insert_with(|| now.to_string());
    }
    next.message = match condition {
        WorkloadCondition::Failed(message) => Some(message.clone()),
        _ => None,
    };
    next
}

impl<C: ResourceClient> Reconciler<C> {
    /// Write `next` if it differs from `current`, returning the latest object.
    ///
    /// The write is guarded by the resourceVersion `job` was read at.
    pub(crate) async fn write_status(
        &self,
        key: &ObjectKey,
        job: &JobRequest,
        current: &JobRequestStatus,
        mut next: JobRequestStatus,
    ) -> Result<JobRequest, ReconcilerError> {
        next.observed_generation = job.metadata.generation.or(current.observed_generation);
        if next == *current {
            debug!(job_request = %key, "status unchanged, skipping update");
            return Ok(job.clone());
        }

        let resource_version = job.metadata.resource_version.as_deref().unwrap_or_default();
        let updated = self
            .client
            .patch_job_request_status(key, resource_version, &next)
            .await?;

        if next.phase != current.phase {
            if let Some(phase) = next.phase {
                metrics::increment_phase_transitions(phase.as_str());
                info!(
                    job_request = %key,
                    from = current.phase.map_or("None", JobPhase::as_str),
                    to = phase.as_str(),
                    "phase transition"
                );
            }
        }
        Ok(updated)
    }
}
