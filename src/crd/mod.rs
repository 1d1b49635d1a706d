//! # Custom Resource Definitions
//!
//! CRD types for the job operator.
//!
//! ## Module Structure
//!
//! - `spec.rs` - JobRequest specification and workload settings
//! - `status.rs` - Status types and the phase state machine

mod spec;
mod status;

pub use spec::{
    EnvVarSpec, JobRequest, JobRequestSpec, ProjectSpec, ResourceQuantities, ResourceSpec,
    SecurityContextSpec, VolumeMountSpec, WorkloadKind,
};
pub use status::{JobPhase, JobRequestStatus, WorkloadRef};
