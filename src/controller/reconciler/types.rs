//! # Types
//!
//! Core types for the reconciler.

use crate::config::ControllerConfig;
use crate::controller::client::{ClientError, ResourceClient};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl ReconcilerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ReconcilerError::Client(e) if e.is_conflict() => ErrorClass::Conflict,
            ReconcilerError::Client(_) => ErrorClass::Transient,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.class() == ErrorClass::Conflict
    }
}

/// How a failed reconciliation is retried
///
/// Validation failures never surface here: they are terminal and written to
/// status by the reconciler itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Stale resourceVersion; retried at once from a fresh read
    Conflict,
    /// Network, server or authorization failure; retried with backoff
    Transient,
}

impl ErrorClass {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Conflict => "conflict",
            ErrorClass::Transient => "transient",
        }
    }
}

/// What a successful reconciliation asks of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileOutcome {
    /// Reconcile again after this delay even without new events
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }
}

/// Wall clock used for status timestamps and TTL arithmetic
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct Reconciler<C> {
    pub(crate) client: Arc<C>,
    pub(crate) config: Arc<ControllerConfig>,
    pub(crate) clock: Clock,
}

impl<C> Clone for Reconciler<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            config: Arc::clone(&self.config),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<C> std::fmt::Debug for Reconciler<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<C: ResourceClient> Reconciler<C> {
    pub fn new(client: Arc<C>, config: Arc<ControllerConfig>) -> Self {
        Self {
            client,
            config,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}
