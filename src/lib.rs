//! JobRequest Operator Library
//!
//! Runs `JobRequest` custom resources as isolated Pods or Jobs and reports
//! their outcome back on the resource's status.
//! Unit tests live in the module files; end-to-end scenarios against an
//! in-memory cluster live under `tests/`.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod runtime;
