//! # Kubernetes Resource Client
//!
//! [`ResourceClient`] backed by the Kubernetes API server.

use super::{ClientError, ResourceClient, WatchEvent};
use crate::constants::{FIELD_MANAGER, LABEL_INSTANCE_ID, LABEL_INSTANCE_IS_JOB};
use crate::controller::identity::ObjectKey;
use crate::controller::translator::WorkloadManifest;
use crate::controller::workload::WorkloadObject;
use crate::crd::{JobRequest, JobRequestStatus, WorkloadKind};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryFutureExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use kube_runtime::{watcher, WatchStreamExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt::Debug;
use tracing::{debug, warn};

/// Label selector matching every workload the operator creates
fn workload_selector() -> String {
    format!("{LABEL_INSTANCE_IS_JOB}=yes")
}

/// Cluster access scoped to the configured namespaces
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
    /// Empty means cluster-wide
    namespaces: Vec<String>,
}

impl std::fmt::Debug for KubeResourceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeResourceClient")
            .field("namespaces", &self.namespaces)
            .finish_non_exhaustive()
    }
}

impl KubeResourceClient {
    pub fn new(client: Client, namespaces: Vec<String>) -> Self {
        Self { client, namespaces }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// One Api per watched namespace, or a single cluster-wide one
    fn scoped<K>(&self) -> Vec<Api<K>>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        if self.namespaces.is_empty() {
            vec![Api::all(self.client.clone())]
        } else {
            self.namespaces
                .iter()
                .map(|ns| self.namespaced(ns))
                .collect()
        }
    }

    async fn list_all<K>(&self, params: &ListParams) -> Result<Vec<K>, ClientError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let mut items = Vec::new();
        for api in self.scoped::<K>() {
            items.extend(api.list(params).await?.items);
        }
        Ok(items)
    }

    fn watch_all<K>(&self, config: &watcher::Config) -> BoxStream<'static, WatchEvent<K>>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + Sync
            + 'static,
        <K as Resource>::DynamicType: Default,
    {
        let streams = self
            .scoped::<K>()
            .into_iter()
            .map(|api| watch_stream(api, config.clone()));
        stream::select_all(streams).boxed()
    }

    async fn delete_pod(&self, key: &ObjectKey) -> Result<(), kube::Error> {
        self.namespaced::<Pod>(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map(|_| ())
    }

    async fn delete_job(&self, key: &ObjectKey) -> Result<(), kube::Error> {
        // Foreground keeps the Job visible until its pods are gone
        self.namespaced::<Job>(&key.namespace)
            .delete(&key.name, &DeleteParams::foreground())
            .await
            .map(|_| ())
    }
}

/// Restartable watch: on any error the watcher backs off and re-lists
fn watch_stream<K>(api: Api<K>, config: watcher::Config) -> BoxStream<'static, WatchEvent<K>>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    watcher(api, config)
        .default_backoff()
        .filter_map(|event| {
            futures::future::ready(match event {
                Ok(watcher::Event::Apply(obj) | watcher::Event::InitApply(obj)) => {
                    Some(WatchEvent::Applied(obj))
                }
                Ok(watcher::Event::Delete(obj)) => Some(WatchEvent::Deleted(obj)),
                Ok(watcher::Event::InitDone) => Some(WatchEvent::Resynced),
                Ok(watcher::Event::Init) => None,
                Err(e) => {
                    warn!(error = %e, "watch stream error, relisting");
                    None
                }
            })
        })
        .boxed()
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..PostParams::default()
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get_job_request(&self, key: &ObjectKey) -> Result<Option<JobRequest>, ClientError> {
        Ok(self
            .namespaced::<JobRequest>(&key.namespace)
            .get_opt(&key.name)
            .await?)
    }

    async fn list_job_requests(&self) -> Result<Vec<JobRequest>, ClientError> {
        self.list_all(&ListParams::default()).await
    }

    async fn patch_job_request_status(
        &self,
        key: &ObjectKey,
        resource_version: &str,
        status: &JobRequestStatus,
    ) -> Result<JobRequest, ClientError> {
        // resourceVersion in a merge patch turns it into a compare-and-swap
        let patch = json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        });
        Ok(self
            .namespaced::<JobRequest>(&key.namespace)
            .patch_status(&key.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?)
    }

    async fn set_finalizers(
        &self,
        key: &ObjectKey,
        resource_version: &str,
        finalizers: Vec<String>,
    ) -> Result<JobRequest, ClientError> {
        let patch = json!({
            "metadata": {
                "resourceVersion": resource_version,
                "finalizers": finalizers,
            },
        });
        Ok(self
            .namespaced::<JobRequest>(&key.namespace)
            .patch(&key.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?)
    }

    async fn get_workload(
        &self,
        key: &ObjectKey,
        kind: WorkloadKind,
    ) -> Result<Option<WorkloadObject>, ClientError> {
        let found = match kind {
            WorkloadKind::Pod => self
                .namespaced::<Pod>(&key.namespace)
                .get_opt(&key.name)
                .await?
                .map(WorkloadObject::Pod),
            WorkloadKind::Job => self
                .namespaced::<Job>(&key.namespace)
                .get_opt(&key.name)
                .await?
                .map(WorkloadObject::Job),
        };
        Ok(found)
    }

    async fn create_workload(
        &self,
        manifest: &WorkloadManifest,
    ) -> Result<WorkloadObject, ClientError> {
        let params = post_params();
        let created = match &manifest.object {
            WorkloadObject::Pod(pod) => {
                self.namespaced::<Pod>(&manifest.namespace)
                    .create(&params, pod)
                    .map_ok(WorkloadObject::Pod)
                    .await
            }
            WorkloadObject::Job(job) => {
                self.namespaced::<Job>(&manifest.namespace)
                    .create(&params, job)
                    .map_ok(WorkloadObject::Job)
                    .await
            }
        };

        match created {
            Ok(workload) => Ok(workload),
            Err(kube::Error::Api(api_err)) if api_err.code == 409 => {
                // AlreadyExists: fine if it is ours, e.g. a replayed create
                let key = ObjectKey::new(&manifest.namespace, &manifest.name);
                match self.get_workload(&key, manifest.kind).await? {
                    Some(existing)
                        if existing
                            .owner()
                            .is_some_and(|owner| owner.uid == manifest.owner_uid) =>
                    {
                        debug!(workload = %key, "workload already exists");
                        Ok(existing)
                    }
                    Some(_) => Err(ClientError::ForeignOwner {
                        kind: manifest.kind.to_string(),
                        name: manifest.name.clone(),
                    }),
                    None => Err(ClientError::Conflict {
                        message: format!("{} {} vanished during create", manifest.kind, key),
                    }),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_workload(
        &self,
        key: &ObjectKey,
        kind: WorkloadKind,
    ) -> Result<(), ClientError> {
        let result = match kind {
            WorkloadKind::Pod => self.delete_pod(key).await,
            WorkloadKind::Job => self.delete_job(key).await,
        };
        match result {
            Ok(()) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_workloads(&self) -> Result<Vec<WorkloadObject>, ClientError> {
        let params = ListParams::default().labels(&workload_selector());
        let mut workloads: Vec<WorkloadObject> = self
            .list_all::<Pod>(&params)
            .await?
            .into_iter()
            .map(WorkloadObject::Pod)
            .collect();
        workloads.extend(
            self.list_all::<Job>(&params)
                .await?
                .into_iter()
                .map(WorkloadObject::Job),
        );
        Ok(workloads)
    }

    async fn list_job_pods(&self, key: &ObjectKey) -> Result<Vec<Pod>, ClientError> {
        // Job pods inherit the template labels, so the instance label finds them
        let params = ListParams::default().labels(&format!(
            "{LABEL_INSTANCE_ID}={},{}",
            key.name,
            workload_selector()
        ));
        let pods = self
            .namespaced::<Pod>(&key.namespace)
            .list(&params)
            .await?
            .items
            .into_iter()
            .filter(|pod| {
                pod.metadata
                    .owner_references
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .any(|owner| owner.kind == "Job" && owner.controller == Some(true))
            })
            .collect();
        Ok(pods)
    }

    fn watch_job_requests(&self) -> BoxStream<'static, WatchEvent<JobRequest>> {
        self.watch_all(&watcher::Config::default())
    }

    fn watch_workloads(&self) -> BoxStream<'static, WatchEvent<WorkloadObject>> {
        let config = watcher::Config::default().labels(&workload_selector());
        let pods = self
            .watch_all::<Pod>(&config)
            .map(|event| event.map(WorkloadObject::Pod));
        let jobs = self
            .watch_all::<Job>(&config)
            .map(|event| event.map(WorkloadObject::Job));
        stream::select(pods, jobs).boxed()
    }
}
