//! # JobRequest Status
//!
//! Status types and the phase state machine.

use serde::{Deserialize, Serialize};

/// Status of the JobRequest resource
///
/// Written only by the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobRequestStatus {
    #[serde(default)]
    pub phase: Option<JobPhase>,
    /// When the workload was first observed running (RFC3339)
    #[serde(default)]
    pub start_time: Option<String>,
    /// When the workload was first observed finished (RFC3339)
    #[serde(default)]
    pub completion_time: Option<String>,
    /// Human-readable detail, set for failures
    #[serde(default)]
    pub message: Option<String>,
    /// Workload materialized for this request
    #[serde(default)]
    pub workload_ref: Option<WorkloadRef>,
    /// Generation of the spec the status was computed from
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

/// Reference to the workload owned by a JobRequest
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadRef {
    /// `Pod` or `Job`
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub uid: Option<String>,
}

/// Lifecycle phase of a JobRequest
///
/// Phases only move forward: `Pending -> Running -> Succeeded | Failed`.
/// `Terminating` is entered from a non-terminal phase when the JobRequest is
/// being deleted and is never left.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, schemars::JsonSchema,
)]
pub enum JobPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Terminating,
}

impl JobPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            JobPhase::Pending => "Pending",
            JobPhase::Running => "Running",
            JobPhase::Succeeded => "Succeeded",
            JobPhase::Failed => "Failed",
            JobPhase::Terminating => "Terminating",
        }
    }

    /// Succeeded or Failed
    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            JobPhase::Pending => 0,
            JobPhase::Running => 1,
            JobPhase::Succeeded | JobPhase::Failed => 2,
            JobPhase::Terminating => 3,
        }
    }

    /// Whether `self -> next` is a forward move.
    ///
    /// Terminal and terminating phases accept nothing, which makes stale or
    /// replayed events harmless.
    pub fn can_transition_to(self, next: JobPhase) -> bool {
        if self == next || self.is_terminal() || self == JobPhase::Terminating {
            return false;
        }
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl JobRequestStatus {
    pub fn is_terminal(&self) -> bool {
        self.phase.is_some_and(JobPhase::is_terminal)
    }

    /// Whether the status may move to `next`. An unset phase accepts anything.
    pub fn accepts(&self, next: JobPhase) -> bool {
        match self.phase {
            None => true,
            Some(current) => current.can_transition_to(next),
        }
    }
}
