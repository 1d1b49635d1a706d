//! # Resource Client
//!
//! Typed access to the two object families the operator works with:
//! JobRequests and the workloads materialized for them.
//!
//! The reconciler only talks to the cluster through [`ResourceClient`], so the
//! Kubernetes implementation ([`KubeResourceClient`]) can be swapped for an
//! in-memory one in tests.

mod kubernetes;

pub use kubernetes::KubeResourceClient;

use crate::controller::identity::ObjectKey;
use crate::controller::translator::WorkloadManifest;
use crate::controller::workload::WorkloadObject;
use crate::crd::{JobRequest, JobRequestStatus, WorkloadKind};
use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;

/// Failure of a single cluster call
#[derive(Debug, Error)]
pub enum ClientError {
    /// The object changed since it was read (resourceVersion mismatch)
    #[error("conflict: {message}")]
    Conflict { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    /// An object with the workload's name exists but is not ours
    #[error("{kind} {name} exists and is not owned by this JobRequest")]
    ForeignOwner { kind: String, name: String },
    /// Any other API failure
    #[error("kubernetes API error: {0}")]
    Kube(#[source] kube::Error),
    #[error("unavailable: {message}")]
    Unavailable { message: String },
}

impl ClientError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound { .. })
    }
}

impl From<kube::Error> for ClientError {
    fn from(error: kube::Error) -> Self {
        match &error {
            kube::Error::Api(api_err) if api_err.code == 409 => ClientError::Conflict {
                message: api_err.message.clone(),
            },
            kube::Error::Api(api_err) if api_err.code == 404 => ClientError::NotFound {
                message: api_err.message.clone(),
            },
            _ => ClientError::Kube(error),
        }
    }
}

/// Change notification from a watch
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    /// Object created or modified
    Applied(K),
    Deleted(K),
    /// The stream restarted with a full relist; anything may have been missed
    Resynced,
}

impl<K> WatchEvent<K> {
    pub fn map<T>(self, f: impl FnOnce(K) -> T) -> WatchEvent<T> {
        match self {
            WatchEvent::Applied(obj) => WatchEvent::Applied(f(obj)),
            WatchEvent::Deleted(obj) => WatchEvent::Deleted(f(obj)),
            WatchEvent::Resynced => WatchEvent::Resynced,
        }
    }
}

/// Typed get/create/patch/delete/list/watch over JobRequests and workloads
#[async_trait]
pub trait ResourceClient: Send + Sync + 'static {
    /// `Ok(None)` when the JobRequest does not exist
    async fn get_job_request(&self, key: &ObjectKey) -> Result<Option<JobRequest>, ClientError>;

    /// Every JobRequest in the watched namespaces
    async fn list_job_requests(&self) -> Result<Vec<JobRequest>, ClientError>;

    /// Replace `status`, guarded by the last observed resourceVersion
    async fn patch_job_request_status(
        &self,
        key: &ObjectKey,
        resource_version: &str,
        status: &JobRequestStatus,
    ) -> Result<JobRequest, ClientError>;

    /// Replace the finalizer list, guarded by the last observed resourceVersion
    async fn set_finalizers(
        &self,
        key: &ObjectKey,
        resource_version: &str,
        finalizers: Vec<String>,
    ) -> Result<JobRequest, ClientError>;

    /// `Ok(None)` when no workload of that kind and name exists
    async fn get_workload(
        &self,
        key: &ObjectKey,
        kind: WorkloadKind,
    ) -> Result<Option<WorkloadObject>, ClientError>;

    /// Create the workload. An existing object with the same name and owner
    /// uid is returned as-is; one with any other owner is `ForeignOwner`.
    async fn create_workload(
        &self,
        manifest: &WorkloadManifest,
    ) -> Result<WorkloadObject, ClientError>;

    /// Request deletion. Absence counts as success.
    async fn delete_workload(&self, key: &ObjectKey, kind: WorkloadKind)
        -> Result<(), ClientError>;

    /// Every workload labelled as belonging to a JobRequest
    async fn list_workloads(&self) -> Result<Vec<WorkloadObject>, ClientError>;

    /// Pods run by the batch Job materialized for `key`
    async fn list_job_pods(&self, key: &ObjectKey) -> Result<Vec<Pod>, ClientError>;

    /// Infinite, restartable JobRequest change stream
    fn watch_job_requests(&self) -> BoxStream<'static, WatchEvent<JobRequest>>;

    /// Infinite, restartable workload change stream
    fn watch_workloads(&self) -> BoxStream<'static, WatchEvent<WorkloadObject>>;
}
