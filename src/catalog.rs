// src/catalog.rs

//! Package catalog
//!
//! Get-or-create access to packages and their released versions. Both are
//! insert-if-absent only, so overlapping sync runs can ingest the same
//! changelog window without producing duplicate rows.
//!
//! Package names are stored in the provider's canonical form, so a manifest
//! pinning `Django` and a changelog event for `django` meet on one row.

use crate::db::models::{Package, PackageVersion, Provider};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, info};

/// Find a package by name for a provider
pub fn find_package(conn: &Connection, name: &str, provider: Provider) -> Result<Option<Package>> {
    Package::find_by_name(conn, &provider.normalize_name(name), provider)
}

/// Return the package identified by (name, provider), creating it if needed
///
/// `url` is only used when the package is created.
pub fn ensure_package(conn: &Connection, name: &str, provider: Provider, url: &str) -> Result<Package> {
    let name = provider.normalize_name(name);
    let candidate = Package::new(name.clone(), url.to_string(), provider);
    if candidate.insert_if_absent(conn)? {
        info!("Added package {} ({})", name, provider.as_str());
    }

    Package::find_by_name(conn, &name, provider)?.ok_or_else(|| {
        Error::NotFoundError(format!(
            "Package {} ({}) vanished after insert",
            name,
            provider.as_str()
        ))
    })
}

/// Record a released version, returning the stored row and whether it is new
///
/// Recording a version that is already known returns the existing row
/// unchanged; its release date is never overwritten. A version released
/// before the current latest one is stored as historical.
pub fn record_version(
    conn: &Connection,
    package: &Package,
    version: &str,
    release_date: Option<DateTime<Utc>>,
) -> Result<(PackageVersion, bool)> {
    let historical = match (release_date, latest_version(conn, package)?) {
        (Some(date), Some(latest)) => {
            latest.version != version && latest.release_date.is_some_and(|l| date < l)
        }
        _ => false,
    };
    store_version(conn, package, version, release_date, historical)
}

/// Record a version known to predate releases already in the catalog
///
/// Historical versions are kept for completeness but never become the
/// latest version or a dependency's update.
pub fn record_history(
    conn: &Connection,
    package: &Package,
    version: &str,
    release_date: Option<DateTime<Utc>>,
) -> Result<(PackageVersion, bool)> {
    store_version(conn, package, version, release_date, true)
}

fn store_version(
    conn: &Connection,
    package: &Package,
    version: &str,
    release_date: Option<DateTime<Utc>>,
    historical: bool,
) -> Result<(PackageVersion, bool)> {
    let package_id = package_id(package)?;

    let mut candidate = PackageVersion::new(package_id, version.to_string(), release_date);
    candidate.historical = historical;
    let was_new = candidate.insert_if_absent(conn)?;

    if !was_new {
        debug!("{} {} already recorded", package.name, version);
    } else if historical {
        debug!("Recorded {} {} as historical", package.name, version);
    } else {
        debug!("Recorded {} {}", package.name, version);
    }

    let stored = PackageVersion::find(conn, package_id, version)?.ok_or_else(|| {
        Error::NotFoundError(format!("Version {} of {} vanished after insert", version, package.name))
    })?;

    Ok((stored, was_new))
}

/// The most recently ingested version of a package that isn't historical
pub fn latest_version(conn: &Connection, package: &Package) -> Result<Option<PackageVersion>> {
    PackageVersion::latest_for_package(conn, package_id(package)?)
}

/// Every known version of a package in ingestion order
pub fn list_versions(conn: &Connection, package: &Package) -> Result<Vec<PackageVersion>> {
    PackageVersion::find_by_package(conn, package_id(package)?)
}

fn package_id(package: &Package) -> Result<i64> {
    package
        .id
        .ok_or_else(|| Error::NotFoundError(format!("Package {} has not been stored", package.name)))
}
