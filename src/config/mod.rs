//! # Configuration
//!
//! Environment-driven configuration, read once when the operator starts.

mod controller;
mod server;

pub use controller::{ControllerConfig, WorkloadDefaults};
pub use server::ServerConfig;
