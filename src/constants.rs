//! # Constants
//!
//! Shared constants used throughout the operator.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Field manager used for every write the operator makes
pub const FIELD_MANAGER: &str = "job-operator";

/// Finalizer guarding workload cleanup on JobRequest deletion
pub const CLEANUP_FINALIZER: &str = "jobrequests.squonk.it/cleanup";

/// Annotation carrying the hash of the JobRequest spec a workload was built from
pub const SPEC_HASH_ANNOTATION: &str = "squonk.it/spec-hash";

/// Base of every workload label
pub const LABEL_BASE: &str = "data-manager.informaticsmatters.com";

pub const LABEL_PURPOSE: &str = "data-manager.informaticsmatters.com/purpose";
pub const LABEL_INSTANCE_ID: &str = "data-manager.informaticsmatters.com/instance-id";
pub const LABEL_INSTANCE_IS_JOB: &str = "data-manager.informaticsmatters.com/instance-is-job";
pub const LABEL_TASK_ID: &str = "data-manager.informaticsmatters.com/task-id";
/// Workloads carrying this label (value `yes`) are kept after completion
pub const LABEL_DEBUG: &str = "data-manager.informaticsmatters.com/debug";

/// Value of the purpose label
pub const PURPOSE_INSTANCE: &str = "INSTANCE";

/// Name of the single container in every workload
pub const CONTAINER_NAME: &str = "job";

/// Name of the project volume inside the pod
pub const PROJECT_VOLUME_NAME: &str = "project";

/// Default HTTP server port for metrics and health checks
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Default period between full resyncs of every JobRequest (seconds)
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 300;

/// Default exponential backoff starting value (milliseconds)
pub const DEFAULT_BACKOFF_START_MS: u64 = 1000;

/// Default exponential backoff maximum value (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 300_000;

/// Default jitter applied to every backoff delay (fraction of the delay)
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.1;

/// Default cap on concurrent reconciliations
pub const DEFAULT_MAX_CONCURRENT_RECONCILIATIONS: usize = 10;

/// Immediate re-reads allowed after a resourceVersion conflict
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 5;

/// Delay between checks while a deleted workload is still terminating (seconds)
pub const DEFAULT_FINALIZER_POLL_INTERVAL_SECS: u64 = 2;

/// Default time a finished workload is kept before collection (seconds)
pub const DEFAULT_JOB_TTL_SECONDS: u64 = 5;

/// Default cpu request and limit
pub const DEFAULT_JOB_CPU: &str = "1";

/// Default memory request and limit
pub const DEFAULT_JOB_MEMORY: &str = "1Gi";

/// Service account workloads run as
pub const DEFAULT_SERVICE_ACCOUNT: &str = "data-manager-app";

pub const DEFAULT_RUN_AS_USER: i64 = 1001;
pub const DEFAULT_RUN_AS_GROUP: i64 = 1001;
pub const DEFAULT_FS_GROUP: i64 = 0;

/// Default mount point of the project volume
pub const DEFAULT_PROJECT_MOUNT: &str = "/project";

/// Default PVC holding project data
pub const DEFAULT_PROJECT_CLAIM_NAME: &str = "project";
