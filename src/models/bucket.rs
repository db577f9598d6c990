//! Represents the storage namespace uploaded papers are written into.

use serde::{Deserialize, Serialize};

/// Desired configuration of the papers bucket.
///
/// Provisioning applies this on every call, so it doubles as the payload for
/// both bucket creation and the idempotent configuration update.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BucketConfig {
    /// Fixed bucket name (e.g. "papers").
    pub name: String,

    /// Whether objects are readable without credentials.
    pub public: bool,

    /// Largest object the bucket accepts, in bytes.
    pub file_size_limit: u64,
}

impl BucketConfig {
    pub fn new(name: impl Into<String>, file_size_limit: u64) -> Self {
        Self {
            name: name.into(),
            public: true,
            file_size_limit,
        }
    }
}

/// A bucket as reported by the storage backend's listing.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Bucket {
    pub name: String,

    #[serde(default)]
    pub public: bool,

    #[serde(default)]
    pub file_size_limit: Option<u64>,
}

impl From<&BucketConfig> for Bucket {
    fn from(config: &BucketConfig) -> Self {
        Self {
            name: config.name.clone(),
            public: config.public,
            file_size_limit: Some(config.file_size_limit),
        }
    }
}
