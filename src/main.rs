//! # JobRequest Operator
//!
//! A Kubernetes operator that turns `JobRequest` custom resources into
//! isolated Pods or Jobs.
//!
//! ## Overview
//!
//! For every JobRequest the operator:
//!
//! 1. **Validates and translates** the spec into a single owned workload
//! 2. **Observes** the workload and moves the JobRequest's phase forward
//! 3. **Collects** finished workloads once their TTL has elapsed
//! 4. **Cleans up** through a finalizer when the JobRequest is deleted
//!
//! Configuration is read from environment variables at startup; see
//! [`job_operator::config`].

use anyhow::Result;
use job_operator::runtime::initialization::initialize;
use job_operator::runtime::watch_loop::run_watch_loop;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let init = initialize().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_state = Arc::clone(&init.server_state);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Received shutdown signal, initiating graceful shutdown...");
        server_state.is_ready.store(false, Ordering::Relaxed);
        let _ = shutdown_tx.send(true);
    });

    run_watch_loop(init.reconciler, shutdown_rx).await
}

/// Resolves on SIGINT, or SIGTERM on Unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
