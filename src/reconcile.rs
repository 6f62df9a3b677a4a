// src/reconcile.rs

//! Dependency reconciliation
//!
//! Moves each project dependency's `update` pointer to the newest ingested
//! version of its package. Pointers only ever move forward in ingestion
//! order, and every change is a single conditional UPDATE, so reconcilers
//! running from overlapping sync runs converge on the same state.

use crate::db::models::{Package, PackageVersion, ProjectDependency};
use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, warn};

/// How a dependency's update pointer changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// `update` now points at the new version
    Advanced,

    /// The project pins the new version itself; `update` was cleared
    Cleared,
}

/// A dependency mutated by reconciliation
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub dependency: ProjectDependency,
    pub change: Change,
}

/// Reconcile every dependency on `package` against `new_version`
///
/// Returns only the dependencies whose row actually changed. Historical
/// versions never change anything.
pub fn reconcile(
    conn: &Connection,
    package: &Package,
    new_version: &PackageVersion,
) -> Result<Vec<Reconciled>> {
    let package_id = package
        .id
        .ok_or_else(|| Error::NotFoundError(format!("Package {} has not been stored", package.name)))?;
    let version_id = new_version.id.ok_or_else(|| {
        Error::NotFoundError(format!("Version {} has not been stored", new_version.version))
    })?;

    if new_version.package_id != package_id {
        return Err(Error::ConflictError(format!(
            "Version {} does not belong to package {}",
            new_version.version, package.name
        )));
    }

    if new_version.historical {
        debug!(
            "{} {} is historical, nothing to reconcile",
            package.name, new_version.version
        );
        return Ok(Vec::new());
    }

    let mut changed = Vec::new();
    for dependency in ProjectDependency::find_by_package(conn, package_id)? {
        if let Some(reconciled) = apply(conn, dependency, new_version, version_id)? {
            changed.push(reconciled);
        }
    }

    debug!(
        "Reconciled {} {}: {} dependencies changed",
        package.name,
        new_version.version,
        changed.len()
    );
    Ok(changed)
}

/// Reconcile one dependency against its package's latest known version
///
/// Used after a dependency is created or re-pinned.
pub fn reconcile_dependency(
    conn: &Connection,
    dependency: &ProjectDependency,
) -> Result<Option<Reconciled>> {
    let Some(latest) = PackageVersion::latest_for_package(conn, dependency.package_id)? else {
        return Ok(None);
    };
    let Some(version_id) = latest.id else {
        return Ok(None);
    };

    apply(conn, dependency.clone(), &latest, version_id)
}

fn apply(
    conn: &Connection,
    mut dependency: ProjectDependency,
    new_version: &PackageVersion,
    version_id: i64,
) -> Result<Option<Reconciled>> {
    let Some(dep_id) = dependency.id else {
        return Ok(None);
    };

    if !dependency.project_exists(conn)? {
        warn!(
            "Skipping dependency {} of missing project {}",
            dep_id, dependency.project_id
        );
        return Ok(None);
    }

    let change = if dependency.version == new_version.version {
        if !ProjectDependency::clear_update(conn, dep_id, version_id)? {
            return Ok(None);
        }
        dependency.update_id = None;
        Change::Cleared
    } else {
        if !ProjectDependency::advance_update(conn, dep_id, version_id)? {
            return Ok(None);
        }
        dependency.update_id = Some(version_id);
        Change::Advanced
    };

    Ok(Some(Reconciled { dependency, change }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::db::models::{Project, Provider};
    use crate::db::schema;
    use tempfile::NamedTempFile;

    struct Fixture {
        _temp: NamedTempFile,
        conn: Connection,
        package: Package,
        project_id: i64,
    }

    fn setup() -> Fixture {
        let temp = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp.path()).unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        schema::migrate(&conn).unwrap();

        let package = catalog::ensure_package(&conn, "pmxbot", Provider::Pypi, "u").unwrap();
        let project_id = Project::new("test".to_string(), "test".to_string())
            .insert(&conn)
            .unwrap();

        Fixture {
            _temp: temp,
            conn,
            package,
            project_id,
        }
    }

    fn add_dependency(f: &Fixture, version: &str) -> i64 {
        ProjectDependency::new(f.project_id, f.package.id.unwrap(), version.to_string())
            .insert(&f.conn)
            .unwrap()
    }

    fn update_version(f: &Fixture, dep_id: i64) -> Option<String> {
        let dep = ProjectDependency::find_by_id(&f.conn, dep_id).unwrap().unwrap();
        dep.update_id
            .map(|id| PackageVersion::find_by_id(&f.conn, id).unwrap().unwrap().version)
    }

    #[test]
    fn test_new_version_sets_update() {
        let f = setup();
        let dep_id = add_dependency(&f, "1101.8.0");

        let (v, _) = catalog::record_version(&f.conn, &f.package, "1101.8.1", None).unwrap();
        let changed = reconcile(&f.conn, &f.package, &v).unwrap();

        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].change, Change::Advanced);
        assert_eq!(changed[0].dependency.update_id, v.id);
        assert_eq!(update_version(&f, dep_id).as_deref(), Some("1101.8.1"));
    }

    #[test]
    fn test_update_never_regresses() {
        let f = setup();
        let dep_id = add_dependency(&f, "1.0");

        let (v1, _) = catalog::record_version(&f.conn, &f.package, "1.1", None).unwrap();
        let (v2, _) = catalog::record_version(&f.conn, &f.package, "1.2", None).unwrap();

        reconcile(&f.conn, &f.package, &v2).unwrap();
        let changed = reconcile(&f.conn, &f.package, &v1).unwrap();

        assert!(changed.is_empty());
        assert_eq!(update_version(&f, dep_id).as_deref(), Some("1.2"));
    }

    #[test]
    fn test_sequence_moves_forward() {
        let f = setup();
        let dep_id = add_dependency(&f, "1.0");

        let mut seen = Vec::new();
        for version in ["1.1", "1.2", "2.0"] {
            let (v, _) = catalog::record_version(&f.conn, &f.package, version, None).unwrap();
            reconcile(&f.conn, &f.package, &v).unwrap();
            seen.push(update_version(&f, dep_id).unwrap());
        }
        assert_eq!(seen, vec!["1.1", "1.2", "2.0"]);
    }

    #[test]
    fn test_catching_up_clears_update() {
        let f = setup();
        let dep_id = add_dependency(&f, "1.0");

        let (v1, _) = catalog::record_version(&f.conn, &f.package, "1.1", None).unwrap();
        reconcile(&f.conn, &f.package, &v1).unwrap();
        assert!(update_version(&f, dep_id).is_some());

        // The project re-pins to the version it was told about
        let mut dep = ProjectDependency::find_by_id(&f.conn, dep_id).unwrap().unwrap();
        dep.set_version(&f.conn, "1.1").unwrap();

        let changed = reconcile(&f.conn, &f.package, &v1).unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].change, Change::Cleared);
        assert_eq!(update_version(&f, dep_id), None);
    }

    #[test]
    fn test_pinned_to_new_version_without_update_is_untouched() {
        let f = setup();
        add_dependency(&f, "1.1");

        let (v, _) = catalog::record_version(&f.conn, &f.package, "1.1", None).unwrap();
        let changed = reconcile(&f.conn, &f.package, &v).unwrap();
        assert!(changed.is_empty());
    }

    #[test]
    fn test_clear_keeps_newer_update() {
        let f = setup();
        let dep_id = add_dependency(&f, "1.0");

        let (v1, _) = catalog::record_version(&f.conn, &f.package, "1.1", None).unwrap();
        let (v2, _) = catalog::record_version(&f.conn, &f.package, "1.2", None).unwrap();
        reconcile(&f.conn, &f.package, &v2).unwrap();

        let mut dep = ProjectDependency::find_by_id(&f.conn, dep_id).unwrap().unwrap();
        dep.set_version(&f.conn, "1.1").unwrap();

        // Replaying the older version must not drop the pointer to 1.2
        let changed = reconcile(&f.conn, &f.package, &v1).unwrap();
        assert!(changed.is_empty());
        assert_eq!(update_version(&f, dep_id).as_deref(), Some("1.2"));
    }

    #[test]
    fn test_reconcile_dependency_uses_latest() {
        let f = setup();
        catalog::record_version(&f.conn, &f.package, "1.1", None).unwrap();
        catalog::record_version(&f.conn, &f.package, "1.2", None).unwrap();

        let dep_id = add_dependency(&f, "1.0");
        let dep = ProjectDependency::find_by_id(&f.conn, dep_id).unwrap().unwrap();

        let reconciled = reconcile_dependency(&f.conn, &dep).unwrap().unwrap();
        assert_eq!(reconciled.change, Change::Advanced);
        assert_eq!(update_version(&f, dep_id).as_deref(), Some("1.2"));

        // Nothing more to do the second time
        let dep = ProjectDependency::find_by_id(&f.conn, dep_id).unwrap().unwrap();
        assert!(reconcile_dependency(&f.conn, &dep).unwrap().is_none());
    }

    #[test]
    fn test_historical_version_changes_nothing() {
        let f = setup();
        let dep_id = add_dependency(&f, "1.0");

        let (v2, _) = catalog::record_version(&f.conn, &f.package, "2.0", None).unwrap();
        reconcile(&f.conn, &f.package, &v2).unwrap();

        let (old, _) = catalog::record_history(&f.conn, &f.package, "1.5", None).unwrap();
        assert!(reconcile(&f.conn, &f.package, &old).unwrap().is_empty());
        assert_eq!(update_version(&f, dep_id).as_deref(), Some("2.0"));
    }

    #[test]
    fn test_dependency_of_missing_project_is_skipped() {
        let f = setup();
        let dep_id = add_dependency(&f, "1.0");

        // Without the cascade the dependency outlives its project
        f.conn.execute("PRAGMA foreign_keys = OFF", []).unwrap();
        Project::delete(&f.conn, f.project_id).unwrap();

        let (v, _) = catalog::record_version(&f.conn, &f.package, "1.1", None).unwrap();
        let changed = reconcile(&f.conn, &f.package, &v).unwrap();
        assert!(changed.is_empty());

        let dep = ProjectDependency::find_by_id(&f.conn, dep_id).unwrap().unwrap();
        assert_eq!(dep.version, "1.0");
        assert_eq!(dep.update_id, None);
    }

    #[test]
    fn test_version_of_other_package_rejected() {
        let f = setup();
        let other = catalog::ensure_package(&f.conn, "gunicorn", Provider::Pypi, "u").unwrap();
        let (v, _) = catalog::record_version(&f.conn, &other, "0.14.6", None).unwrap();

        assert!(matches!(
            reconcile(&f.conn, &f.package, &v),
            Err(Error::ConflictError(_))
        ));
    }
}
