//! # Initialization
//!
//! Controller initialization logic including rustls setup, tracing, metrics,
//! server startup, and Kubernetes client setup.

use crate::config::{ControllerConfig, ServerConfig};
use crate::controller::client::{KubeResourceClient, ResourceClient};
use crate::controller::reconciler::Reconciler;
use crate::controller::server::{start_server, ServerState};
use crate::crd::JobRequest;
use crate::observability;
use anyhow::{Context, Result};
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Initialization result containing all necessary components for the controller
pub struct InitializationResult {
    /// Kubernetes client
    pub client: Client,
    /// Reconciler bound to the Kubernetes resource client
    pub reconciler: Reconciler<KubeResourceClient>,
    /// Server state for health checks
    pub server_state: Arc<ServerState>,
    pub controller_config: Arc<ControllerConfig>,
    pub server_config: ServerConfig,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field(
                "server_ready",
                &self
                    .server_state
                    .is_ready
                    .load(std::sync::atomic::Ordering::Relaxed),
            )
            .field("controller_config", &self.controller_config)
            .finish_non_exhaustive()
    }
}

/// Initialize the controller runtime
///
/// This function handles:
/// - rustls crypto provider setup
/// - Tracing subscriber setup
/// - Metrics registration
/// - HTTP server startup
/// - Kubernetes client creation
/// - Reconciler setup
pub async fn initialize() -> Result<InitializationResult> {
    // Required for rustls 0.23+ when no default provider is selected via features
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        return Err(anyhow::anyhow!("Failed to install rustls crypto provider"));
    }

    let controller_config = Arc::new(ControllerConfig::from_env());
    let server_config = ServerConfig::from_env();

    init_tracing(&controller_config.log_level);

    info!("Starting JobRequest operator");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );
    info!(config = ?controller_config, "controller configuration loaded");

    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::default());

    // Started in the background; readiness is awaited below
    let server_state_clone = Arc::clone(&server_state);
    let server_port = server_config.metrics_port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });
    wait_for_server_ready(&server_state, &server_handle, &server_config).await?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let resource_client = Arc::new(KubeResourceClient::new(
        client.clone(),
        controller_config.watch_namespaces.clone(),
    ));
    summarize_existing_resources(resource_client.as_ref()).await;

    let reconciler = Reconciler::new(resource_client, Arc::clone(&controller_config));

    info!("Controller initialized, starting watch loop...");

    Ok(InitializationResult {
        client,
        reconciler,
        server_state,
        controller_config,
        server_config,
    })
}

/// `RUST_LOG` wins; otherwise `LOG_LEVEL` applies to this crate only
fn init_tracing(log_level: &str) {
    let default_directive = format!("job_operator={}", log_level.to_lowercase());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    if let Err(e) = tracing_subscriber::fmt().with_env_filter(filter).try_init() {
        eprintln!("tracing subscriber already initialized: {e}");
    }
}

/// Wait for the HTTP server to become ready
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
    server_config: &ServerConfig,
) -> Result<()> {
    let startup_timeout = server_config.startup_timeout();
    let poll_interval = server_config.poll_interval();
    let start_time = std::time::Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }

        if server_state
            .is_ready
            .load(std::sync::atomic::Ordering::Relaxed)
        {
            info!("HTTP server is ready and accepting connections");
            break;
        }

        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }

        tokio::time::sleep(poll_interval).await;
    }

    Ok(())
}

/// Log the JobRequests present at startup. The first resync of the watch loop
/// reconciles them.
async fn summarize_existing_resources<C: ResourceClient>(client: &C) {
    let span = tracing::info_span!(
        "controller.startup.summary",
        operation = "summarize_existing_resources"
    );
    let _guard = span.enter();

    let jobs: Vec<JobRequest> = match client.list_job_requests().await {
        Ok(jobs) => jobs,
        Err(e) => {
            warn!(error = %e, "CRD is not queryable yet, existing JobRequests will be picked up by the watch");
            return;
        }
    };

    let mut by_namespace: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for job in &jobs {
        by_namespace
            .entry(job.namespace().unwrap_or_default())
            .or_default()
            .push(job.name_any());
    }

    info!("JobRequest operator - Startup Resource Summary");
    info!("Total Resources: {}", jobs.len());
    info!("Namespaces: {}", by_namespace.len());
    for (namespace, mut names) in by_namespace {
        names.sort();
        let shown = if names.len() <= 3 {
            names.join(", ")
        } else {
            format!("{}, ... ({} total)", names[..3].join(", "), names.len())
        };
        info!("Namespace: {namespace}");
        info!("  Resources ({}): {}", names.len(), shown);
    }
}
