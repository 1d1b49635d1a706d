//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables once at start.

use crate::constants::{
    DEFAULT_BACKOFF_JITTER, DEFAULT_BACKOFF_MAX_MS, DEFAULT_BACKOFF_START_MS,
    DEFAULT_FINALIZER_POLL_INTERVAL_SECS, DEFAULT_FS_GROUP, DEFAULT_JOB_CPU,
    DEFAULT_JOB_MEMORY, DEFAULT_JOB_TTL_SECONDS, DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
    DEFAULT_MAX_CONFLICT_RETRIES, DEFAULT_PROJECT_CLAIM_NAME, DEFAULT_PROJECT_MOUNT,
    DEFAULT_RESYNC_INTERVAL_SECS, DEFAULT_RUN_AS_GROUP, DEFAULT_RUN_AS_USER,
    DEFAULT_SERVICE_ACCOUNT,
};
use std::time::Duration;

/// Values applied to every workload when the JobRequest leaves them out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadDefaults {
    pub service_account: String,
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
    pub run_as_user: i64,
    pub run_as_group: i64,
    pub fs_group: i64,
    /// Mount point of the project volume
    pub project_mount: String,
    /// PVC holding project data, used when `spec.project.claimName` is absent
    pub project_claim_name: String,
}

impl Default for WorkloadDefaults {
    fn default() -> Self {
        Self {
            service_account: DEFAULT_SERVICE_ACCOUNT.to_string(),
            cpu_request: DEFAULT_JOB_CPU.to_string(),
            cpu_limit: DEFAULT_JOB_CPU.to_string(),
            memory_request: DEFAULT_JOB_MEMORY.to_string(),
            memory_limit: DEFAULT_JOB_MEMORY.to_string(),
            run_as_user: DEFAULT_RUN_AS_USER,
            run_as_group: DEFAULT_RUN_AS_GROUP,
            fs_group: DEFAULT_FS_GROUP,
            project_mount: DEFAULT_PROJECT_MOUNT.to_string(),
            project_claim_name: DEFAULT_PROJECT_CLAIM_NAME.to_string(),
        }
    }
}

/// Controller-level configuration
///
/// All settings have defaults and can be overridden via environment variables.
/// Environment variables are populated from a ConfigMap using `envFrom` in the deployment.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespaces to watch; empty means the whole cluster
    pub watch_namespaces: Vec<String>,
    /// Period between full resyncs of every known JobRequest (seconds)
    pub resync_interval_secs: u64,
    /// Exponential backoff starting value (milliseconds)
    pub backoff_start_ms: u64,
    /// Exponential backoff maximum value (milliseconds)
    pub backoff_max_ms: u64,
    /// Fraction of each backoff delay applied as random jitter
    pub backoff_jitter: f64,
    /// Most reconciliations running at once
    pub max_concurrent_reconciliations: usize,
    /// Immediate re-reads after a resourceVersion conflict before requeueing
    pub max_conflict_retries: u32,
    /// Re-check delay while a deleted workload is still terminating (seconds)
    pub finalizer_poll_interval_secs: u64,
    /// TTL for finished workloads when the JobRequest sets none.
    /// `None` keeps them until the JobRequest is deleted.
    pub default_ttl_seconds: Option<u64>,
    /// Global log level (ERROR, WARN, INFO, DEBUG, TRACE)
    pub log_level: String,
    pub workload: WorkloadDefaults,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            watch_namespaces: Vec::new(),
            resync_interval_secs: DEFAULT_RESYNC_INTERVAL_SECS,
            backoff_start_ms: DEFAULT_BACKOFF_START_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            backoff_jitter: DEFAULT_BACKOFF_JITTER,
            max_concurrent_reconciliations: DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            finalizer_poll_interval_secs: DEFAULT_FINALIZER_POLL_INTERVAL_SECS,
            default_ttl_seconds: Some(DEFAULT_JOB_TTL_SECONDS),
            log_level: "INFO".to_string(),
            workload: WorkloadDefaults::default(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let workload = WorkloadDefaults {
            service_account: env_var_or_default_str(
                &lookup,
                "JOB_SERVICE_ACCOUNT",
                DEFAULT_SERVICE_ACCOUNT,
            ),
            cpu_request: env_var_or_default_str(&lookup, "JOB_DEFAULT_CPU", DEFAULT_JOB_CPU),
            cpu_limit: env_var_or_default_str(&lookup, "JOB_DEFAULT_CPU_LIMIT", DEFAULT_JOB_CPU),
            memory_request: env_var_or_default_str(
                &lookup,
                "JOB_DEFAULT_MEMORY",
                DEFAULT_JOB_MEMORY,
            ),
            memory_limit: env_var_or_default_str(
                &lookup,
                "JOB_DEFAULT_MEMORY_LIMIT",
                DEFAULT_JOB_MEMORY,
            ),
            run_as_user: env_var_or_default(&lookup, "JOB_RUN_AS_USER", DEFAULT_RUN_AS_USER),
            run_as_group: env_var_or_default(&lookup, "JOB_RUN_AS_GROUP", DEFAULT_RUN_AS_GROUP),
            fs_group: env_var_or_default(&lookup, "JOB_FS_GROUP", DEFAULT_FS_GROUP),
            project_mount: env_var_or_default_str(
                &lookup,
                "JOB_PROJECT_MOUNT",
                DEFAULT_PROJECT_MOUNT,
            ),
            project_claim_name: env_var_or_default_str(
                &lookup,
                "JOB_PROJECT_CLAIM_NAME",
                DEFAULT_PROJECT_CLAIM_NAME,
            ),
        };

        Self {
            watch_namespaces: lookup("WATCH_NAMESPACES")
                .map(|v| parse_namespace_list(&v))
                .unwrap_or_default(),
            resync_interval_secs: env_var_or_default(
                &lookup,
                "RESYNC_INTERVAL_SECS",
                DEFAULT_RESYNC_INTERVAL_SECS,
            )
            .max(1),
            backoff_start_ms: env_var_or_default(
                &lookup,
                "BACKOFF_START_MS",
                DEFAULT_BACKOFF_START_MS,
            )
            .max(1),
            backoff_max_ms: env_var_or_default(&lookup, "BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS),
            backoff_jitter: jitter_or_default(&lookup),
            max_concurrent_reconciliations: env_var_or_default(
                &lookup,
                "MAX_CONCURRENT_RECONCILIATIONS",
                DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
            )
            .max(1),
            max_conflict_retries: env_var_or_default(
                &lookup,
                "MAX_CONFLICT_RETRIES",
                DEFAULT_MAX_CONFLICT_RETRIES,
            ),
            finalizer_poll_interval_secs: env_var_or_default(
                &lookup,
                "FINALIZER_POLL_INTERVAL_SECS",
                DEFAULT_FINALIZER_POLL_INTERVAL_SECS,
            )
            .max(1),
            default_ttl_seconds: match lookup("JOB_DEFAULT_TTL_SECONDS") {
                Some(v) if v.trim().eq_ignore_ascii_case("none") => None,
                Some(v) => v.trim().parse().ok().or(defaults.default_ttl_seconds),
                None => defaults.default_ttl_seconds,
            },
            log_level: env_var_or_default_str(&lookup, "LOG_LEVEL", "INFO"),
            workload,
        }
    }

    /// Get resync interval duration
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    /// Get backoff start duration
    pub fn backoff_start_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_start_ms)
    }

    /// Get backoff max duration
    pub fn backoff_max_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn finalizer_poll_interval(&self) -> Duration {
        Duration::from_secs(self.finalizer_poll_interval_secs)
    }
}

fn parse_namespace_list(raw: &str) -> Vec<String> {
    let mut namespaces: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|ns| !ns.is_empty())
        .map(ToString::to_string)
        .collect();
    namespaces.sort();
    namespaces.dedup();
    namespaces
}

/// Read a variable through `lookup` or return the default value
fn env_var_or_default<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Jitter factor clamped to `[0, 1]`; NaN and infinities are rejected
fn jitter_or_default<F>(lookup: &F) -> f64
where
    F: Fn(&str) -> Option<String>,
{
    let jitter: f64 = env_var_or_default(lookup, "BACKOFF_JITTER", DEFAULT_BACKOFF_JITTER);
    if jitter.is_finite() {
        jitter.clamp(0.0, 1.0)
    } else {
        DEFAULT_BACKOFF_JITTER
    }
}

/// Read a variable through `lookup` as a string or return the default
fn env_var_or_default_str<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}
