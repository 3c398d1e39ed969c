//! Device identity and image references

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reference to a deployable workload image: repository plus optional tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub tag: Option<String>,
}

impl ImageRef {
    pub fn new(repository: impl Into<String>, tag: Option<String>) -> Self {
        Self {
            repository: repository.into(),
            tag,
        }
    }

    /// Parse `repository[:tag][@digest]`.
    ///
    /// A colon only separates a tag when it comes after the last `/`, so
    /// registry ports (`host:5000/app`) stay part of the repository. Digests
    /// are dropped.
    pub fn parse(reference: &str) -> Self {
        let reference = reference.trim();
        let reference = reference.split('@').next().unwrap_or(reference);

        let last_slash = reference.rfind('/');
        match reference.rfind(':') {
            Some(colon) if last_slash.map_or(true, |slash| colon > slash) => {
                let tag = &reference[colon + 1..];
                Self {
                    repository: reference[..colon].to_string(),
                    tag: (!tag.is_empty()).then(|| tag.to_string()),
                }
            }
            _ => Self {
                repository: reference.to_string(),
                tag: None,
            },
        }
    }

    /// Same repository, different tag
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            repository: self.repository.clone(),
            tag: Some(tag.into()),
        }
    }

    pub fn tag_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.tag.as_deref().unwrap_or(default)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "{}:{}", self.repository, tag),
            None => f.write_str(&self.repository),
        }
    }
}

/// Immutable per-process identity of this device and its workload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Human readable device name
    pub device_name: String,

    /// Numeric device ID assigned by the backend
    pub device_id: u64,

    /// Backend base URL
    pub backend_url: String,

    /// Configured workload image
    pub image: ImageRef,

    /// Name the workload container is bound to
    pub container_name: String,
}
