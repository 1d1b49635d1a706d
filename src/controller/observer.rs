//! # State Observer
//!
//! Turns cluster change notifications into reconciliation triggers for the
//! controller runtime.
//!
//! JobRequest events update the JobRequest store and trigger their own
//! reconciliation. Workload events trigger the owning JobRequest. A periodic
//! resync refreshes the store from a full list, asks for every JobRequest to
//! be reconciled and sweeps orphaned workloads, so a missed event is repaired
//! within one resync interval.
//!
//! The observer owns the store writer. Watches over several namespaces each
//! relist on their own schedule, so a single watch's initial list never
//! replaces the store; only a full resync does.

use crate::controller::client::{ResourceClient, WatchEvent};
use crate::controller::finalizer;
use crate::controller::workload::WorkloadObject;
use crate::crd::JobRequest;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use kube_runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube_runtime::watcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Receiving ends of the observer's triggers, wired into the controller
#[derive(Debug)]
pub struct Triggers {
    /// JobRequests that changed
    pub job_requests: UnboundedReceiver<Result<JobRequest, watcher::Error>>,
    /// JobRequests whose workload changed
    pub owners: UnboundedReceiver<ObjectRef<JobRequest>>,
    /// One item per resync; every stored JobRequest is reconciled
    pub resyncs: UnboundedReceiver<()>,
}

pub struct StateObserver<C> {
    client: Arc<C>,
    writer: Writer<JobRequest>,
    store: Store<JobRequest>,
    job_requests: UnboundedSender<Result<JobRequest, watcher::Error>>,
    owners: UnboundedSender<ObjectRef<JobRequest>>,
    resyncs: UnboundedSender<()>,
    resync_interval: Duration,
    /// Orphan sweep started by the last resync
    sweep: Option<JoinHandle<()>>,
}

impl<C> std::fmt::Debug for StateObserver<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateObserver")
            .field("resync_interval", &self.resync_interval)
            .field("job_requests", &self.store.state().len())
            .finish_non_exhaustive()
    }
}

impl<C: ResourceClient> StateObserver<C> {
    /// Build an observer together with the store it maintains and the
    /// triggers it emits
    pub fn new(client: Arc<C>, resync_interval: Duration) -> (Self, Store<JobRequest>, Triggers) {
        let (store, writer) = reflector::store();
        let (job_requests_tx, job_requests_rx) = mpsc::unbounded();
        let (owners_tx, owners_rx) = mpsc::unbounded();
        let (resyncs_tx, resyncs_rx) = mpsc::unbounded();
        let observer = Self {
            client,
            writer,
            store: store.clone(),
            job_requests: job_requests_tx,
            owners: owners_tx,
            resyncs: resyncs_tx,
            resync_interval,
            sweep: None,
        };
        let triggers = Triggers {
            job_requests: job_requests_rx,
            owners: owners_rx,
            resyncs: resyncs_rx,
        };
        (observer, store, triggers)
    }

    /// Handle a JobRequest event. Returns true when a full resync is due.
    pub fn on_job_request(&mut self, event: WatchEvent<JobRequest>) -> bool {
        match event {
            WatchEvent::Applied(job) => {
                self.writer
                    .apply_watcher_event(&watcher::Event::Apply(job.clone()));
                debug!(job_request = %ObjectRef::from_obj(&job), "reconcile triggered");
                if self.job_requests.unbounded_send(Ok(job)).is_err() {
                    debug!("controller stopped, JobRequest trigger dropped");
                }
                false
            }
            WatchEvent::Deleted(job) => {
                // Gone for good; there is nothing left to reconcile
                self.writer.apply_watcher_event(&watcher::Event::Delete(job));
                false
            }
            WatchEvent::Resynced => true,
        }
    }

    /// Handle a workload event. Returns true when a full resync is due.
    pub fn on_workload(&mut self, event: WatchEvent<WorkloadObject>) -> bool {
        let workload = match event {
            WatchEvent::Applied(workload) | WatchEvent::Deleted(workload) => workload,
            WatchEvent::Resynced => return true,
        };
        match workload.owner_name() {
            Some(owner) => {
                let owner = ObjectRef::new(owner).within(workload.namespace());
                debug!(job_request = %owner, workload = %workload.name(), "reconcile triggered");
                if self.owners.unbounded_send(owner).is_err() {
                    debug!("controller stopped, workload trigger dropped");
                }
            }
            None => debug!(workload = %workload.name(), "workload without owner ignored"),
        }
        false
    }

    /// Refresh the store from a full list, reconcile every JobRequest and
    /// start an orphan sweep
    pub async fn resync(&mut self) {
        match self.client.list_job_requests().await {
            Ok(jobs) => {
                self.writer.apply_watcher_event(&watcher::Event::Init);
                for job in jobs {
                    self.writer
                        .apply_watcher_event(&watcher::Event::InitApply(job));
                }
                self.writer.apply_watcher_event(&watcher::Event::InitDone);
            }
            Err(e) => {
                warn!(error = %e, "failed to list JobRequests, resyncing known ones only");
            }
        }
        info!(job_requests = self.store.state().len(), "resync");
        if self.resyncs.unbounded_send(()).is_err() {
            debug!("controller stopped, resync dropped");
        }
        self.start_sweep();
    }

    /// Sweep orphans in the background so watch events keep flowing. A sweep
    /// still running from the previous resync is left to finish.
    fn start_sweep(&mut self) {
        if self.sweep.as_ref().is_some_and(|sweep| !sweep.is_finished()) {
            debug!("previous orphan sweep still running");
            return;
        }
        let client = Arc::clone(&self.client);
        self.sweep = Some(tokio::spawn(async move {
            match finalizer::reap_orphans(client.as_ref()).await {
                Ok(0) => {}
                Ok(reaped) => info!(reaped, "orphaned workloads deleted"),
                Err(e) => warn!(error = %e, "orphan sweep failed"),
            }
        }));
    }

    /// Watch until `shutdown` flips to true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut job_requests = self.client.watch_job_requests();
        let mut workloads = self.client.watch_workloads();
        let mut resync = tokio::time::interval(self.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let resync_due = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    false
                }
                _ = resync.tick() => true,
                event = job_requests.next() => match event {
                    Some(event) => self.on_job_request(event),
                    None => {
                        warn!("JobRequest watch ended, restarting");
                        job_requests = self.client.watch_job_requests();
                        true
                    }
                },
                event = workloads.next() => match event {
                    Some(event) => self.on_workload(event),
                    None => {
                        warn!("workload watch ended, restarting");
                        workloads = self.client.watch_workloads();
                        true
                    }
                },
            };
            if resync_due {
                self.resync().await;
            }
        }

        if let Some(sweep) = self.sweep.take() {
            if let Err(e) = sweep.await {
                warn!(error = %e, "orphan sweep task failed");
            }
        }
        debug!("state observer stopped");
    }
}
