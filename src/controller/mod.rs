//! # Controller
//!
//! Core controller modules for the JobRequest operator.
//!
//! - `backoff`: Exponential backoff with jitter for retries
//! - `client`: Typed cluster access behind the `ResourceClient` trait
//! - `finalizer`: Cleanup finalizer and orphan sweep
//! - `identity`: Namespace/name key of a JobRequest
//! - `observer`: Watch events and periodic resync turned into controller triggers
//! - `reconciler`: Core reconciliation logic
//! - `server`: HTTP server for metrics and health checks
//! - `translator`: JobRequest to Pod/Job manifest translation
//! - `workload`: Pod/Job wrapper and execution-state mapping

pub mod backoff;
pub mod client;
pub mod finalizer;
pub mod identity;
pub mod observer;
pub mod reconciler;
pub mod server;
pub mod translator;
pub mod workload;
