//! # Workload
//!
//! Uniform view over the two object kinds a JobRequest can materialize as.

use crate::constants::{LABEL_DEBUG, LABEL_INSTANCE_ID, SPEC_HASH_ANNOTATION};
use crate::crd::{WorkloadKind, WorkloadRef};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ContainerStateTerminated, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde::Serialize;

/// A Pod or a Job owned by a JobRequest
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WorkloadObject {
    Pod(Pod),
    Job(Job),
}

/// Execution state reported by the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadCondition {
    /// Accepted but not started
    Pending,
    Running,
    Succeeded,
    /// Finished unsuccessfully, with a human-readable reason
    Failed(String),
}

impl WorkloadCondition {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkloadCondition::Succeeded | WorkloadCondition::Failed(_))
    }
}

impl WorkloadObject {
    pub fn kind(&self) -> WorkloadKind {
        match self {
            WorkloadObject::Pod(_) => WorkloadKind::Pod,
            WorkloadObject::Job(_) => WorkloadKind::Job,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            WorkloadObject::Pod(pod) => &pod.metadata,
            WorkloadObject::Job(job) => &job.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            WorkloadObject::Pod(pod) => &mut pod.metadata,
            WorkloadObject::Job(job) => &mut job.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or_default()
    }

    pub fn uid(&self) -> Option<&str> {
        self.metadata().uid.as_deref()
    }

    /// Controller owner reference pointing at a JobRequest, if any
    pub fn owner(&self) -> Option<&OwnerReference> {
        self.metadata()
            .owner_references
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|owner| owner.kind == "JobRequest" && owner.controller == Some(true))
    }

    /// Name of the JobRequest this workload belongs to, from the owner
    /// reference or, failing that, the instance label
    pub fn owner_name(&self) -> Option<&str> {
        self.owner().map(|o| o.name.as_str()).or_else(|| {
            self.metadata()
                .labels
                .as_ref()
                .and_then(|labels| labels.get(LABEL_INSTANCE_ID))
                .map(String::as_str)
        })
    }

    pub fn is_terminating(&self) -> bool {
        self.metadata().deletion_timestamp.is_some()
    }

    pub fn spec_hash(&self) -> Option<&str> {
        self.metadata()
            .annotations
            .as_ref()
            .and_then(|a| a.get(SPEC_HASH_ANNOTATION))
            .map(String::as_str)
    }

    pub fn is_debug(&self) -> bool {
        self.metadata()
            .labels
            .as_ref()
            .and_then(|labels| labels.get(LABEL_DEBUG))
            .is_some_and(|v| v == "yes")
    }

    pub fn workload_ref(&self) -> WorkloadRef {
        WorkloadRef {
            kind: self.kind().as_str().to_string(),
            name: self.name().to_string(),
            uid: self.uid().map(ToString::to_string),
        }
    }

    /// Current execution state
    pub fn condition(&self) -> WorkloadCondition {
        match self {
            WorkloadObject::Pod(pod) => pod_condition(pod),
            WorkloadObject::Job(job) => job_condition(job),
        }
    }
}

fn pod_condition(pod: &Pod) -> WorkloadCondition {
    let Some(status) = pod.status.as_ref() else {
        return WorkloadCondition::Pending;
    };
    match status.phase.as_deref() {
        Some("Running") => WorkloadCondition::Running,
        Some("Succeeded") => WorkloadCondition::Succeeded,
        Some("Failed") => {
            let terminated = status
                .container_statuses
                .as_deref()
                .unwrap_or_default()
                .iter()
                .find_map(|cs| cs.state.as_ref().and_then(|s| s.terminated.as_ref()));
            let message = match terminated {
                Some(terminated) => termination_message(terminated),
                None => status
                    .message
                    .clone()
                    .or_else(|| status.reason.clone())
                    .unwrap_or_else(|| "pod failed".to_string()),
            };
            WorkloadCondition::Failed(message)
        }
        _ => WorkloadCondition::Pending,
    }
}

/// Exit details of the first container in `pod` that terminated with a
/// non-zero code
pub fn pod_failure_message(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(|cs| cs.state.as_ref().and_then(|s| s.terminated.as_ref()))
        .find(|terminated| terminated.exit_code != 0)
        .map(termination_message)
}

fn termination_message(terminated: &ContainerStateTerminated) -> String {
    let mut message = format!("container exited with code {}", terminated.exit_code);
    if let Some(reason) = terminated.reason.as_deref().filter(|r| !r.is_empty()) {
        message.push_str(&format!(" ({reason})"));
    }
    if let Some(detail) = terminated
        .message
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
    {
        message.push_str(": ");
        message.push_str(detail);
    }
    message
}

fn job_condition(job: &Job) -> WorkloadCondition {
    let Some(status) = job.status.as_ref() else {
        return WorkloadCondition::Pending;
    };
    for condition in status.conditions.as_deref().unwrap_or_default() {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" => return WorkloadCondition::Succeeded,
            "Failed" => {
                let message = condition
                    .message
                    .clone()
                    .or_else(|| condition.reason.clone())
                    .unwrap_or_else(|| "job failed".to_string());
                return WorkloadCondition::Failed(message);
            }
            _ => {}
        }
    }
    if status.succeeded.unwrap_or_default() > 0 {
        return WorkloadCondition::Succeeded;
    }
    if status.active.unwrap_or_default() > 0 {
        return WorkloadCondition::Running;
    }
    WorkloadCondition::Pending
}
