//! # Error Policy
//!
//! Turns reconciliation failures into the controller's requeue actions.
//!
//! Backoff state is tracked per JobRequest so that one failing key never slows
//! down another. Retries are unbounded; a transient failure is never written to
//! the JobRequest's status.

use crate::config::ControllerConfig;
use crate::controller::backoff::ExponentialBackoff;
use crate::controller::client::ResourceClient;
use crate::controller::identity::ObjectKey;
use crate::controller::reconciler::{ErrorClass, ReconcilerError};
use crate::crd::JobRequest;
use crate::observability::metrics;
use crate::runtime::watch_loop::ControllerContext;
use kube_runtime::controller::Action;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff state for a specific JobRequest
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: ExponentialBackoff,
    pub error_count: u32,
}

impl BackoffState {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            backoff: ExponentialBackoff::new(
                config.backoff_start_duration(),
                config.backoff_max_duration(),
                config.backoff_jitter,
            ),
            error_count: 0,
        }
    }

    pub fn increment_error(&mut self) {
        self.error_count = self.error_count.saturating_add(1);
    }
}

/// Per-key retry bookkeeping shared by all reconciliations
#[derive(Debug, Clone)]
pub struct RetryController {
    config: Arc<ControllerConfig>,
    backoff_states: Arc<Mutex<HashMap<ObjectKey, BackoffState>>>,
}

impl RetryController {
    pub fn new(config: Arc<ControllerConfig>) -> Self {
        Self {
            config,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Forget the failure history of `key` after a successful reconciliation
    pub fn reset(&self, key: &ObjectKey) {
        let mut states = self
            .backoff_states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if states.remove(key).is_some() {
            debug!(job_request = %key, "backoff reset");
        }
    }

    /// Delay before `key` is retried after `error`
    pub fn handle_reconciliation_error(&self, key: &ObjectKey, error: &ReconcilerError) -> Duration {
        let class = error.class();
        metrics::increment_reconciliation_errors(class.as_str());

        match class {
            ErrorClass::Conflict => {
                // Still conflicting after the in-place retries; try again at once
                debug!(job_request = %key, error = %error, "conflict persisted, requeueing");
                metrics::increment_requeues("conflict");
                Duration::ZERO
            }
            ErrorClass::Transient => {
                let (delay, error_count) = {
                    let mut states = self
                        .backoff_states
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    let state = states
                        .entry(key.clone())
                        .or_insert_with(|| BackoffState::new(&self.config));
                    state.increment_error();
                    (state.backoff.next_delay(), state.error_count)
                };
                warn!(
                    job_request = %key,
                    error = %error,
                    error_count,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "reconciliation failed, retrying with backoff"
                );
                metrics::increment_requeues("error-backoff");
                delay
            }
        }
    }

    /// Consecutive failures recorded for `key`
    pub fn error_count(&self, key: &ObjectKey) -> u32 {
        self.backoff_states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .map_or(0, |state| state.error_count)
    }
}

/// Error policy handed to the controller: requeue after the delay the retry
/// controller picks for this JobRequest
pub fn error_policy<C: ResourceClient>(
    job: Arc<JobRequest>,
    error: &ReconcilerError,
    ctx: Arc<ControllerContext<C>>,
) -> Action {
    let key = ObjectKey::from(job.as_ref());
    Action::requeue(ctx.retry.handle_reconciliation_error(&key, error))
}
