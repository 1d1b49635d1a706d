//! # Identity
//!
//! The key every piece of work is tracked by: a JobRequest's namespace and name.

use crate::crd::JobRequest;
use kube::ResourceExt;
use std::fmt;

/// Namespace and name of a JobRequest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl From<&JobRequest> for ObjectKey {
    fn from(job: &JobRequest) -> Self {
        Self::new(job.namespace().unwrap_or_default(), job.name_any())
    }
}
