//! # JobRequest Spec
//!
//! Main CRD specification types and default values.

use serde::{Deserialize, Serialize};

/// JobRequest Custom Resource Definition
///
/// A request to run one isolated unit of computation. The operator turns each
/// JobRequest into exactly one Pod (or Job), follows it to completion and reports
/// the outcome on `status`.
///
/// # Example
///
/// ```yaml
/// apiVersion: squonk.it/v1
/// kind: JobRequest
/// metadata:
///   name: instance-6d1c2f
///   namespace: data-manager
/// spec:
///   image: informaticsmatters/rdkit-tools:1.2.0
///   command: ["python", "-m", "tools.filter"]
///   args: ["--input", "in.sdf"]
///   project:
///     id: project-00000001
///   ttlSecondsAfterFinished: 30
/// ```
#[derive(
    kube::CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema,
)]
#[kube(
    kind = "JobRequest",
    group = "squonk.it",
    version = "v1",
    namespaced,
    status = "crate::crd::JobRequestStatus",
    shortname = "jr",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}, {"name":"Workload", "type":"string", "jsonPath":".status.workloadRef.name"}, {"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct JobRequestSpec {
    /// Container image to run. Required; validated by the operator so that a
    /// missing value is reported on status instead of being rejected at admission.
    #[serde(default)]
    pub image: Option<String>,
    /// Container entrypoint
    #[serde(default)]
    pub command: Vec<String>,
    /// Arguments to the entrypoint
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables
    #[serde(default)]
    pub env: Vec<EnvVarSpec>,
    /// Resource requests and limits; unset values fall back to operator defaults
    #[serde(default)]
    pub resources: Option<ResourceSpec>,
    /// Input/output volumes backed by existing PersistentVolumeClaims
    #[serde(default)]
    pub volumes: Vec<VolumeMountSpec>,
    /// Seconds to keep the finished workload before it is collected
    #[serde(default)]
    pub ttl_seconds_after_finished: Option<u64>,
    /// Task identifier of the requesting service, copied to a workload label
    #[serde(default)]
    pub task_id: Option<String>,
    /// Project volume mounted into the container
    #[serde(default)]
    pub project: Option<ProjectSpec>,
    /// Mount point of the project volume (default `/project`)
    #[serde(default)]
    pub project_mount: Option<String>,
    /// Working directory of the container
    #[serde(default)]
    pub working_directory: Option<String>,
    /// Sub-path appended to the working directory
    #[serde(default)]
    pub working_sub_path: Option<String>,
    #[serde(default)]
    pub security_context: Option<SecurityContextSpec>,
    /// Kind of workload to materialize
    #[serde(default)]
    pub workload_kind: WorkloadKind,
    /// Keep the finished workload for inspection
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSpec {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Requests and limits expressed as Kubernetes quantities (e.g. `500m`, `2Gi`)
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    #[serde(default)]
    pub requests: Option<ResourceQuantities>,
    #[serde(default)]
    pub limits: Option<ResourceQuantities>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQuantities {
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
}

/// A PersistentVolumeClaim mounted into the container
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMountSpec {
    /// Volume name, unique within the JobRequest
    pub name: String,
    pub claim_name: String,
    /// Absolute path inside the container
    pub mount_path: String,
    #[serde(default)]
    pub sub_path: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    /// Project identifier, also the sub-path of the project claim
    pub id: String,
    /// Claim holding project data (operator default when unset)
    #[serde(default)]
    pub claim_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContextSpec {
    #[serde(default)]
    pub run_as_user: Option<i64>,
    #[serde(default)]
    pub run_as_group: Option<i64>,
}

/// Kind of object materialized for a JobRequest
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize, schemars::JsonSchema,
)]
pub enum WorkloadKind {
    #[default]
    Pod,
    Job,
}

impl WorkloadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadKind::Pod => "Pod",
            WorkloadKind::Job => "Job",
        }
    }

    /// Parse the `kind` of a Kubernetes object
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "Pod" => Some(WorkloadKind::Pod),
            "Job" => Some(WorkloadKind::Job),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
