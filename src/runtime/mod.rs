//! # Runtime
//!
//! Process wiring: startup, the controller loop and the retry policy.
//!
//! - `initialization`: tracing, metrics server and Kubernetes client setup
//! - `watch_loop`: observer triggers driving a `kube_runtime` controller
//! - `error_policy`: per-key requeue decisions after failures

pub mod error_policy;
pub mod initialization;
pub mod watch_loop;
