//! # Manifest Translator
//!
//! Pure conversion of a JobRequest into the workload that runs it.
//!
//! The output depends only on the JobRequest (identity and spec) and the
//! operator's workload defaults, so translating the same input twice yields
//! byte-identical manifests.

use crate::config::WorkloadDefaults;
use crate::constants::{
    CONTAINER_NAME, LABEL_DEBUG, LABEL_INSTANCE_ID, LABEL_INSTANCE_IS_JOB, LABEL_PURPOSE,
    LABEL_TASK_ID, PROJECT_VOLUME_NAME, PURPOSE_INSTANCE, SPEC_HASH_ANNOTATION,
};
use crate::controller::workload::WorkloadObject;
use crate::crd::{JobRequest, JobRequestSpec, VolumeMountSpec, WorkloadKind};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PersistentVolumeClaimVolumeSource, Pod, PodSecurityContext, PodSpec,
    PodTemplateSpec, ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// A JobRequest that cannot be turned into a workload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    /// Path of the offending field, e.g. `spec.image`
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// A validated workload ready to be created
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadManifest {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
    /// uid of the owning JobRequest
    pub owner_uid: String,
    /// Hash of the JobRequest spec, also stored as an annotation
    pub spec_hash: String,
    pub object: WorkloadObject,
}

/// Translate a JobRequest into its workload manifest.
pub fn translate(
    job: &JobRequest,
    defaults: &WorkloadDefaults,
) -> Result<WorkloadManifest, ValidationError> {
    let meta = &job.metadata;
    let name = required(meta.name.as_deref(), "metadata.name")?;
    let namespace = required(meta.namespace.as_deref(), "metadata.namespace")?;
    let owner_uid = required(meta.uid.as_deref(), "metadata.uid")?;
    if name.len() > 63 {
        return Err(ValidationError::new(
            "metadata.name",
            "must be no more than 63 characters",
        ));
    }

    let spec = &job.spec;
    let image = validate_image(spec.image.as_deref())?;
    if spec.command.is_empty() && spec.args.is_empty() {
        return Err(ValidationError::new(
            "spec.command",
            "at least one of command or args is required",
        ));
    }
    validate_env(spec)?;
    validate_volumes(&spec.volumes)?;
    if let Some(project) = &spec.project {
        if project.id.trim().is_empty() {
            return Err(ValidationError::new("spec.project.id", "must not be empty"));
        }
    }
    if let Some(task_id) = &spec.task_id {
        validate_label_value(task_id, "spec.taskId")?;
    }
    let project_mount = spec
        .project_mount
        .as_deref()
        .unwrap_or(&defaults.project_mount);
    if spec.project.is_some() && !project_mount.starts_with('/') {
        return Err(ValidationError::new(
            "spec.projectMount",
            "must be an absolute path",
        ));
    }

    let owner = job
        .controller_owner_ref(&())
        .ok_or_else(|| ValidationError::new("metadata.uid", "is required"))?;
    let spec_hash = spec_hash(spec);

    let metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels(name, spec)),
        annotations: Some(BTreeMap::from([(
            SPEC_HASH_ANNOTATION.to_string(),
            spec_hash.clone(),
        )])),
        owner_references: Some(vec![owner]),
        ..ObjectMeta::default()
    };
    let pod_spec = pod_spec(image, spec, defaults, project_mount);

    let object = match spec.workload_kind {
        WorkloadKind::Pod => WorkloadObject::Pod(Pod {
            metadata,
            spec: Some(pod_spec),
            status: None,
        }),
        WorkloadKind::Job => WorkloadObject::Job(Job {
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: metadata.labels.clone(),
                        annotations: metadata.annotations.clone(),
                        ..ObjectMeta::default()
                    }),
                    spec: Some(pod_spec),
                },
                ..JobSpec::default()
            }),
            metadata,
            status: None,
        }),
    };

    Ok(WorkloadManifest {
        kind: spec.workload_kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
        owner_uid: owner_uid.to_string(),
        spec_hash,
        object,
    })
}

/// Hex SHA-256 of the serialized spec, ignoring fields that only affect
/// what happens after the workload finishes
pub fn spec_hash(spec: &JobRequestSpec) -> String {
    let mut hashed = spec.clone();
    hashed.ttl_seconds_after_finished = None;
    // Field order is fixed by the struct and no maps are involved
    let bytes = serde_json::to_vec(&hashed).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}

/// `Always` for floating tags (none, `latest`, `stable`), `IfNotPresent` otherwise
pub fn image_pull_policy(image: &str) -> &'static str {
    if image.contains('@') {
        return "IfNotPresent";
    }
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    match last_segment.split_once(':') {
        None => "Always",
        Some((_, tag)) if tag.eq_ignore_ascii_case("latest") || tag.eq_ignore_ascii_case("stable") => {
            "Always"
        }
        Some(_) => "IfNotPresent",
    }
}

fn required<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str, ValidationError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ValidationError::new(field, "is required")),
    }
}

fn validate_image(image: Option<&str>) -> Result<&str, ValidationError> {
    let image = required(image, "spec.image")?;
    if image.chars().any(char::is_whitespace) {
        return Err(ValidationError::new(
            "spec.image",
            "must not contain whitespace",
        ));
    }
    Ok(image)
}

fn validate_env(spec: &JobRequestSpec) -> Result<(), ValidationError> {
    let mut seen = BTreeSet::new();
    for (i, var) in spec.env.iter().enumerate() {
        if var.name.trim().is_empty() {
            return Err(ValidationError::new(
                format!("spec.env[{i}].name"),
                "must not be empty",
            ));
        }
        if !seen.insert(var.name.as_str()) {
            return Err(ValidationError::new(
                format!("spec.env[{i}].name"),
                format!("duplicate variable {}", var.name),
            ));
        }
    }
    Ok(())
}

fn validate_volumes(volumes: &[VolumeMountSpec]) -> Result<(), ValidationError> {
    let mut names = BTreeSet::new();
    for (i, volume) in volumes.iter().enumerate() {
        let field = |f: &str| format!("spec.volumes[{i}].{f}");
        if volume.name.trim().is_empty() {
            return Err(ValidationError::new(field("name"), "must not be empty"));
        }
        if volume.name == PROJECT_VOLUME_NAME {
            return Err(ValidationError::new(
                field("name"),
                format!("{PROJECT_VOLUME_NAME} is reserved"),
            ));
        }
        if !names.insert(volume.name.as_str()) {
            return Err(ValidationError::new(
                field("name"),
                format!("duplicate volume {}", volume.name),
            ));
        }
        if volume.claim_name.trim().is_empty() {
            return Err(ValidationError::new(field("claimName"), "must not be empty"));
        }
        if !volume.mount_path.starts_with('/') {
            return Err(ValidationError::new(
                field("mountPath"),
                "must be an absolute path",
            ));
        }
    }
    Ok(())
}

fn validate_label_value(value: &str, field: &str) -> Result<(), ValidationError> {
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    let valid_ends = value
        .chars()
        .next()
        .zip(value.chars().last())
        .is_some_and(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric());
    if value.len() > 63 || !valid_chars || !valid_ends {
        return Err(ValidationError::new(
            field,
            "must be a valid label value (max 63 alphanumerics, '-', '_' or '.')",
        ));
    }
    Ok(())
}

fn labels(name: &str, spec: &JobRequestSpec) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (LABEL_PURPOSE.to_string(), PURPOSE_INSTANCE.to_string()),
        (LABEL_INSTANCE_ID.to_string(), name.to_string()),
        (LABEL_INSTANCE_IS_JOB.to_string(), "yes".to_string()),
    ]);
    if let Some(task_id) = &spec.task_id {
        labels.insert(LABEL_TASK_ID.to_string(), task_id.clone());
    }
    if spec.debug {
        labels.insert(LABEL_DEBUG.to_string(), "yes".to_string());
    }
    labels
}

fn pod_spec(
    image: &str,
    spec: &JobRequestSpec,
    defaults: &WorkloadDefaults,
    project_mount: &str,
) -> PodSpec {
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();

    if let Some(project) = &spec.project {
        volumes.push(pvc_volume(
            PROJECT_VOLUME_NAME,
            project
                .claim_name
                .as_deref()
                .unwrap_or(&defaults.project_claim_name),
            false,
        ));
        mounts.push(VolumeMount {
            name: PROJECT_VOLUME_NAME.to_string(),
            mount_path: project_mount.to_string(),
            sub_path: Some(project.id.clone()),
            ..VolumeMount::default()
        });
    }
    for volume in &spec.volumes {
        volumes.push(pvc_volume(&volume.name, &volume.claim_name, volume.read_only));
        mounts.push(VolumeMount {
            name: volume.name.clone(),
            mount_path: volume.mount_path.clone(),
            sub_path: volume.sub_path.clone(),
            read_only: volume.read_only.then_some(true),
            ..VolumeMount::default()
        });
    }

    let env: Vec<EnvVar> = spec
        .env
        .iter()
        .map(|var| EnvVar {
            name: var.name.clone(),
            value: Some(var.value.clone()),
            value_from: None,
        })
        .collect();

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some(image_pull_policy(image).to_string()),
        command: (!spec.command.is_empty()).then(|| spec.command.clone()),
        args: (!spec.args.is_empty()).then(|| spec.args.clone()),
        env: (!env.is_empty()).then_some(env),
        resources: Some(resources(spec, defaults)),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        working_dir: working_dir(spec),
        termination_message_policy: Some("FallbackToLogsOnError".to_string()),
        ..Container::default()
    };

    let security = spec.security_context.clone().unwrap_or_default();
    PodSpec {
        containers: vec![container],
        restart_policy: Some("Never".to_string()),
        service_account_name: Some(defaults.service_account.clone()),
        security_context: Some(PodSecurityContext {
            run_as_user: Some(security.run_as_user.unwrap_or(defaults.run_as_user)),
            run_as_group: Some(security.run_as_group.unwrap_or(defaults.run_as_group)),
            fs_group: Some(defaults.fs_group),
            ..PodSecurityContext::default()
        }),
        volumes: (!volumes.is_empty()).then_some(volumes),
        ..PodSpec::default()
    }
}

fn pvc_volume(name: &str, claim_name: &str, read_only: bool) -> Volume {
    Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim_name.to_string(),
            read_only: read_only.then_some(true),
        }),
        ..Volume::default()
    }
}

fn resources(spec: &JobRequestSpec, defaults: &WorkloadDefaults) -> ResourceRequirements {
    let requested = spec.resources.clone().unwrap_or_default();
    let requests = requested.requests.unwrap_or_default();
    let limits = requested.limits.unwrap_or_default();

    let quantities = |cpu: Option<String>, default_cpu: &str, memory: Option<String>, default_memory: &str| {
        BTreeMap::from([
            (
                "cpu".to_string(),
                Quantity(cpu.unwrap_or_else(|| default_cpu.to_string())),
            ),
            (
                "memory".to_string(),
                Quantity(memory.unwrap_or_else(|| default_memory.to_string())),
            ),
        ])
    };

    ResourceRequirements {
        requests: Some(quantities(
            requests.cpu,
            &defaults.cpu_request,
            requests.memory,
            &defaults.memory_request,
        )),
        limits: Some(quantities(
            limits.cpu,
            &defaults.cpu_limit,
            limits.memory,
            &defaults.memory_limit,
        )),
        ..ResourceRequirements::default()
    }
}

/// The sub-path only applies when a working directory is set
fn working_dir(spec: &JobRequestSpec) -> Option<String> {
    let dir = spec.working_directory.as_deref().filter(|d| !d.is_empty())?;
    match spec.working_sub_path.as_deref().filter(|s| !s.is_empty()) {
        Some(sub) => Some(format!(
            "{}/{}",
            dir.trim_end_matches('/'),
            sub.trim_start_matches('/')
        )),
        None => Some(dir.to_string()),
    }
}
