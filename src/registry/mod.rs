// src/registry/mod.rs

//! Package registry access
//!
//! The sync engine only talks to a registry through the `RegistryClient`
//! trait. Records returned across this boundary always carry UTC
//! timestamps; implementations convert whatever the wire format uses.

pub mod pypi;

use crate::db::models::Provider;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use pypi::{PypiClient, PypiConfig};

/// Read-only view of an external package registry
pub trait RegistryClient {
    /// Registry this client talks to
    fn provider(&self) -> Provider;

    /// Registry page for a package
    fn package_url(&self, name: &str) -> String;

    /// Names of every package the registry knows about
    fn list_packages(&self) -> Result<Vec<String>>;

    /// Events from the trailing `since_hours` window, oldest first
    ///
    /// `force` bypasses any client-side caching of the changelog.
    fn get_changelog(&self, since_hours: u32, force: bool) -> Result<Vec<ChangelogEvent>>;

    /// Every released version of a package, oldest first
    fn get_package_versions(&self, name: &str) -> Result<Vec<PackageRelease>>;

    /// Artifacts uploaded for one release
    fn get_release_urls(&self, name: &str, version: &str) -> Result<Vec<ReleaseFile>>;
}

/// What happened to a package in a changelog event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A new version was released
    NewRelease,

    /// The package was registered
    Create,

    /// The package or one of its releases was removed
    Remove,

    /// Anything else the registry reports
    Other(String),
}

impl ChangeKind {
    /// Classify a registry's free-form action text
    pub fn from_action(action: &str) -> Self {
        match action.trim().to_lowercase().as_str() {
            "new release" | "new_release" => ChangeKind::NewRelease,
            "create" => ChangeKind::Create,
            "remove" | "remove release" | "remove project" => ChangeKind::Remove,
            other => ChangeKind::Other(other.to_string()),
        }
    }
}

/// One changelog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogEvent {
    pub package_name: String,
    pub version: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub kind: ChangeKind,
}

impl ChangelogEvent {
    /// Build an event from a unix timestamp in seconds
    ///
    /// Timestamps outside chrono's range fall back to the epoch.
    pub fn from_unix(package_name: &str, version: Option<&str>, unix: i64, action: &str) -> Self {
        Self {
            package_name: package_name.to_string(),
            version: version.map(str::to_string),
            timestamp: DateTime::from_timestamp(unix, 0).unwrap_or_default(),
            kind: ChangeKind::from_action(action),
        }
    }
}

/// A released version with its earliest upload time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRelease {
    pub version: String,
    pub released_at: Option<DateTime<Utc>>,
}

/// Metadata for one uploaded release artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseFile {
    pub filename: String,

    /// Artifact kind (sdist, bdist_wheel, ...)
    pub package_type: String,

    pub size: u64,
    pub md5_digest: Option<String>,
    pub sha256_digest: Option<String>,
    pub upload_time: Option<DateTime<Utc>>,
    pub url: String,
}
