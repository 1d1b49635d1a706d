//! # Watch Loop
//!
//! Runs the state observer and a `kube_runtime` controller until shutdown.
//!
//! The observer supplies three trigger streams: changed JobRequests, owners of
//! changed workloads and periodic resyncs. The controller deduplicates them,
//! never reconciles the same JobRequest twice at once and caps concurrency at
//! `MAX_CONCURRENT_RECONCILIATIONS`. Failures go through the error policy.

use crate::config::ControllerConfig;
use crate::controller::client::ResourceClient;
use crate::controller::identity::ObjectKey;
use crate::controller::observer::StateObserver;
use crate::controller::reconciler::{Reconciler, ReconcilerError};
use crate::crd::JobRequest;
use crate::observability::metrics;
use crate::runtime::error_policy::{self, RetryController};
use anyhow::anyhow;
use futures::channel::oneshot;
use futures::{Future, FutureExt, StreamExt};
use kube_runtime::controller::{self, Action, Controller};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

/// Shared by every reconciliation the controller runs
#[derive(Debug)]
pub struct ControllerContext<C> {
    pub reconciler: Reconciler<C>,
    pub retry: RetryController,
}

/// Run the controller until `shutdown` flips to true.
///
/// In-flight reconciliations are allowed to finish before this returns. A
/// failed observer task is returned as an error.
pub async fn run_watch_loop<C: ResourceClient>(
    reconciler: Reconciler<C>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), anyhow::Error> {
    let config: Arc<ControllerConfig> = Arc::new(reconciler.config().clone());

    info!(
        namespaces = ?config.watch_namespaces,
        workers = config.max_concurrent_reconciliations,
        resync_interval_secs = config.resync_interval_secs,
        "starting controller watch loop"
    );

    let (observer, store, triggers) =
        StateObserver::new(Arc::clone(reconciler.client()), config.resync_interval());
    let mut observer_handle = tokio::spawn(observer.run(shutdown.clone()));

    let context = Arc::new(ControllerContext {
        reconciler,
        retry: RetryController::new(Arc::clone(&config)),
    });
    let concurrency = u16::try_from(config.max_concurrent_reconciliations).unwrap_or(u16::MAX);

    let controller = Controller::for_stream(triggers.job_requests, store)
        .reconcile_on(triggers.owners)
        .reconcile_all_on(triggers.resyncs)
        .with_config(controller::Config::default().concurrency(concurrency))
        .graceful_shutdown_on(shutdown_signal(shutdown))
        .run(reconcile::<C>, error_policy::error_policy::<C>, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => debug!(job_request = %obj, ?action, "reconciled"),
                Err(
                    e @ (controller::Error::ObjectNotFound(_)
                    | controller::Error::ReconcilerFailed(..)),
                ) => {
                    // Already handled by the error policy, or the object is gone
                    debug!(error = %e, "reconciliation skipped or failed");
                }
                Err(e) => warn!(error = %e, "controller error"),
            }
        });
    tokio::pin!(controller);

    tokio::select! {
        () = &mut controller => {}
        joined = &mut observer_handle => {
            if let Err(e) = joined {
                return Err(anyhow!("state observer task failed: {e}"));
            }
            info!("shutdown requested, waiting for in-flight reconciliations");
            controller.await;
            info!("controller stopped gracefully");
            return Ok(());
        }
    }

    if let Err(e) = observer_handle.await {
        return Err(anyhow!("state observer task failed: {e}"));
    }
    info!("controller stopped gracefully");
    Ok(())
}

/// Resolves once `shutdown` flips to true or its sender is dropped
fn shutdown_signal(
    mut shutdown: watch::Receiver<bool>,
) -> impl Future<Output = ()> + Send + Sync + 'static {
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        if shutdown.wait_for(|stop| *stop).await.is_err() {
            debug!("shutdown sender dropped");
        }
        if tx.send(()).is_err() {
            debug!("controller already stopped");
        }
    });
    rx.map(|_| ())
}

/// Reconcile one JobRequest and turn the outcome into the controller's next
/// action
async fn reconcile<C: ResourceClient>(
    job: Arc<JobRequest>,
    ctx: Arc<ControllerContext<C>>,
) -> Result<Action, ReconcilerError> {
    let key = ObjectKey::from(job.as_ref());
    let span = tracing::info_span!("controller.reconcile", job_request = %key);

    metrics::reconciliation_started();
    let start = Instant::now();
    let result = ctx.reconciler.reconcile(&key).instrument(span).await;
    metrics::reconciliation_finished();
    metrics::increment_reconciliations();
    metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());

    let outcome = result?;
    ctx.retry.reset(&key);
    Ok(match outcome.requeue_after {
        Some(delay) => {
            debug!(
                job_request = %key,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "requeue scheduled"
            );
            Action::requeue(delay)
        }
        None => Action::await_change(),
    })
}
