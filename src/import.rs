// src/import.rs

//! Manifest import
//!
//! Turns a parsed manifest into project dependencies. Dependencies that the
//! manifest doesn't mention are left alone; the caller decides whether
//! anything should be pruned.

use crate::catalog;
use crate::db;
use crate::db::models::{Log, LogAction, Project, ProjectDependency};
use crate::error::{Error, Result};
use crate::manifest;
use crate::reconcile;
use crate::registry::RegistryClient;
use rusqlite::Connection;
use serde_json::json;
use tracing::{info, warn};

/// What an import did to a project
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Pinned packages found in the manifest
    pub pinned: usize,
    pub added: usize,
    pub changed: usize,
    pub unchanged: usize,

    /// Lines or names that could not be turned into a pin
    pub missing: Vec<String>,
}

/// Import a manifest of `format` into `project`
///
/// Fails with `NotFoundError` for an unknown format before anything is
/// written. All dependency changes are applied in one transaction. Names are
/// matched in the registry's canonical form, so `Django==1.4.1` tracks the
/// same package as changelog events for `django`.
pub fn import_manifest<C: RegistryClient + ?Sized>(
    conn: &mut Connection,
    client: &C,
    project: &Project,
    lines: &[&str],
    format: &str,
) -> Result<ImportReport> {
    let parser = manifest::get_parser(format)?;
    let project_id = project
        .id
        .ok_or_else(|| Error::NotFoundError(format!("Project {} has not been stored", project.slug)))?;

    let parsed = parser.parse(lines);
    let provider = client.provider();

    let mut report = db::transaction(conn, |tx| {
        let mut report = ImportReport {
            pinned: parsed.packages.len(),
            ..ImportReport::default()
        };

        for (name, version) in &parsed.packages {
            let package = catalog::ensure_package(tx, name, provider, &client.package_url(name))?;
            let package_id = package
                .id
                .ok_or_else(|| Error::NotFoundError(format!("Package {} has not been stored", name)))?;

            let existing = ProjectDependency::find_by_project_and_package(tx, project_id, package_id)?;
            let dependency = match existing {
                None => {
                    let mut dependency = ProjectDependency::new(project_id, package_id, version.clone());
                    dependency.insert(tx)?;

                    let mut log = Log::new(project_id, LogAction::AddDependency);
                    log.package_id = Some(package_id);
                    log.payload = Some(json!({ "package": name, "version": version }));
                    log.insert(tx)?;

                    report.added += 1;
                    dependency
                }
                Some(mut dependency) if dependency.version != *version => {
                    let previous = dependency.version.clone();
                    dependency.set_version(tx, version)?;

                    let mut log = Log::new(project_id, LogAction::UpdateDependency);
                    log.package_id = Some(package_id);
                    log.payload = Some(json!({
                        "package": name,
                        "version": version,
                        "previous": previous,
                    }));
                    log.insert(tx)?;

                    report.changed += 1;
                    dependency
                }
                Some(dependency) => {
                    report.unchanged += 1;
                    dependency
                }
            };

            reconcile::reconcile_dependency(tx, &dependency)?;
        }

        Ok(report)
    })?;

    report.missing = parsed.missing;
    if !report.missing.is_empty() {
        warn!(
            "{} entries in the manifest are not pinned: {}",
            report.missing.len(),
            report.missing.join(", ")
        );
    }

    info!(
        "Imported {} pins into {}: {} added, {} changed, {} unchanged",
        report.pinned, project.slug, report.added, report.changed, report.unchanged
    );
    Ok(report)
}
