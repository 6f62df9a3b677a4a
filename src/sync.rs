// src/sync.rs

//! Registry synchronization
//!
//! A run pulls changelog events from the registry and, for each event:
//!
//! ```text
//! ENSURE_PACKAGE -> RECORD_VERSION -> (if new) RECONCILE -> LOG
//! ```
//!
//! Each event is applied in its own transaction, so a run interrupted
//! between events leaves consistent state and a rerun over an overlapping
//! window only picks up what is missing.

use crate::catalog;
use crate::db;
use crate::db::models::{Log, LogAction, Package, PackageVersion};
use crate::error::{Error, Result};
use crate::reconcile::{self, Change, Reconciled};
use crate::registry::{ChangeKind, ChangelogEvent, PackageRelease, RegistryClient};
use rusqlite::Connection;
use serde_json::json;
use tracing::{debug, info, warn};

/// Counters describing what a run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Events (or packages, for backfills) considered
    pub events: usize,
    pub packages_created: usize,
    pub versions_recorded: usize,

    /// Versions that were already known
    pub duplicates: usize,

    pub dependencies_updated: usize,
    pub log_entries: usize,

    /// Events intentionally ignored (removals, unknown kinds)
    pub skipped: usize,

    /// Events that failed and were isolated
    pub failed: usize,
}

impl SyncReport {
    fn absorb(&mut self, other: &SyncReport) {
        self.packages_created += other.packages_created;
        self.versions_recorded += other.versions_recorded;
        self.duplicates += other.duplicates;
        self.dependencies_updated += other.dependencies_updated;
        self.log_entries += other.log_entries;
        self.skipped += other.skipped;
    }
}

/// Drives synchronization against one registry
pub struct SyncOrchestrator<'a, C: RegistryClient + ?Sized> {
    client: &'a C,
}

impl<'a, C: RegistryClient + ?Sized> SyncOrchestrator<'a, C> {
    /// Create an orchestrator for `client`
    pub fn new(client: &'a C) -> Self {
        Self { client }
    }

    /// Ingest the changelog for the trailing `since_hours` window
    ///
    /// Fails only if the changelog cannot be fetched, the database fails,
    /// or every event of a non-empty window failed.
    pub fn sync_with_changelog(
        &self,
        conn: &mut Connection,
        since_hours: u32,
        force: bool,
    ) -> Result<SyncReport> {
        info!("Synchronizing changelog for the last {} hours", since_hours);

        let events = self.client.get_changelog(since_hours, force)?;
        let mut report = SyncReport {
            events: events.len(),
            ..SyncReport::default()
        };

        for event in &events {
            match db::transaction(conn, |tx| self.apply_event(tx, event)) {
                Ok(outcome) => report.absorb(&outcome),
                Err(e) if e.is_structural() => return Err(e),
                Err(e) => {
                    warn!(
                        "Skipping changelog event for {} {}: {}",
                        event.package_name,
                        event.version.as_deref().unwrap_or("-"),
                        e
                    );
                    report.failed += 1;
                }
            }
        }

        if report.failed > 0 && report.failed == report.events {
            return Err(Error::SyncFailed(format!(
                "all {} changelog events failed",
                report.failed
            )));
        }

        info!(
            "Changelog sync complete: {} events, {} new versions, {} dependencies updated",
            report.events, report.versions_recorded, report.dependencies_updated
        );
        Ok(report)
    }

    /// Backfill the full version history of one stored package
    pub fn sync_versions_for_package(
        &self,
        conn: &mut Connection,
        package: &Package,
    ) -> Result<SyncReport> {
        info!("Synchronizing all versions of {}", package.name);

        let releases = self.client.get_package_versions(&package.name)?;
        let mut report = db::transaction(conn, |tx| ingest_releases(tx, package, &releases))?;
        report.events = releases.len();

        info!(
            "{}: {} releases, {} new",
            package.name,
            releases.len(),
            report.versions_recorded
        );
        Ok(report)
    }

    /// Register a package and backfill its history
    ///
    /// Nothing is written if the registry doesn't know the package.
    pub fn add_package(&self, conn: &mut Connection, name: &str) -> Result<(Package, SyncReport)> {
        let releases = self.client.get_package_versions(name)?;
        let provider = self.client.provider();
        let url = self.client.package_url(name);

        let (package, mut report) = db::transaction(conn, |tx| {
            let existed = catalog::find_package(tx, name, provider)?.is_some();
            let package = catalog::ensure_package(tx, name, provider, &url)?;
            let mut report = ingest_releases(tx, &package, &releases)?;
            if !existed {
                report.packages_created += 1;
            }
            Ok((package, report))
        })?;
        report.events = releases.len();

        Ok((package, report))
    }

    /// Backfill every stored package, isolating per-package failures
    pub fn sync_all_packages(&self, conn: &mut Connection) -> Result<SyncReport> {
        let packages = Package::list_all(conn)?;
        let mut report = SyncReport {
            events: packages.len(),
            ..SyncReport::default()
        };

        for package in &packages {
            match self.sync_versions_for_package(conn, package) {
                Ok(outcome) => report.absorb(&outcome),
                Err(e) if e.is_structural() => return Err(e),
                Err(e) => {
                    warn!("Skipping {}: {}", package.name, e);
                    report.failed += 1;
                }
            }
        }

        if report.failed > 0 && report.failed == report.events {
            return Err(Error::SyncFailed(format!(
                "all {} packages failed",
                report.failed
            )));
        }

        Ok(report)
    }

    /// Apply one changelog event; called inside a transaction
    fn apply_event(&self, conn: &Connection, event: &ChangelogEvent) -> Result<SyncReport> {
        let mut outcome = SyncReport::default();

        match &event.kind {
            ChangeKind::NewRelease => {
                let version = event.version.as_deref().ok_or_else(|| {
                    Error::ParseError(format!(
                        "Release event for {} has no version",
                        event.package_name
                    ))
                })?;

                let package = self.ensure_package(conn, &event.package_name, &mut outcome)?;
                let (stored, was_new) =
                    catalog::record_version(conn, &package, version, Some(event.timestamp))?;

                if !was_new {
                    outcome.duplicates += 1;
                    return Ok(outcome);
                }
                outcome.versions_recorded += 1;

                let changed = reconcile::reconcile(conn, &package, &stored)?;
                log_new_release(conn, &package, &stored, &changed, &mut outcome)?;
            }
            ChangeKind::Create => {
                self.ensure_package(conn, &event.package_name, &mut outcome)?;
            }
            ChangeKind::Remove | ChangeKind::Other(_) => {
                debug!(
                    "Ignoring {:?} event for {}",
                    event.kind, event.package_name
                );
                outcome.skipped += 1;
            }
        }

        Ok(outcome)
    }

    fn ensure_package(
        &self,
        conn: &Connection,
        name: &str,
        outcome: &mut SyncReport,
    ) -> Result<Package> {
        let provider = self.client.provider();
        if let Some(package) = catalog::find_package(conn, name, provider)? {
            return Ok(package);
        }

        let package = catalog::ensure_package(conn, name, provider, &self.client.package_url(name))?;
        outcome.packages_created += 1;
        Ok(package)
    }
}

/// Record releases in order, then reconcile once against the newest one
///
/// `releases` is oldest first. Missing releases that come before one the
/// catalog already holds are recorded as historical: ingesting them now
/// would otherwise make an old release look newer than what the changelog
/// already delivered. Reconciling only against the last new version writes
/// one log entry per dependency rather than one per release.
fn ingest_releases(
    conn: &Connection,
    package: &Package,
    releases: &[PackageRelease],
) -> Result<SyncReport> {
    let package_id = package
        .id
        .ok_or_else(|| Error::NotFoundError(format!("Package {} has not been stored", package.name)))?;

    let mut known_through = None;
    for (index, release) in releases.iter().enumerate() {
        if PackageVersion::find(conn, package_id, &release.version)?.is_some() {
            known_through = Some(index);
        }
    }

    let mut outcome = SyncReport::default();
    let mut newest: Option<PackageVersion> = None;

    for (index, release) in releases.iter().enumerate() {
        let (stored, was_new) = if known_through.is_some_and(|known| index < known) {
            catalog::record_history(conn, package, &release.version, release.released_at)?
        } else {
            catalog::record_version(conn, package, &release.version, release.released_at)?
        };

        if !was_new {
            outcome.duplicates += 1;
            continue;
        }
        outcome.versions_recorded += 1;
        if !stored.historical {
            newest = Some(stored);
        }
    }

    if let Some(version) = newest {
        let changed = reconcile::reconcile(conn, package, &version)?;
        log_new_release(conn, package, &version, &changed, &mut outcome)?;
    }

    Ok(outcome)
}

/// Write one `new_release` entry per dependency whose update advanced
fn log_new_release(
    conn: &Connection,
    package: &Package,
    version: &PackageVersion,
    changed: &[Reconciled],
    outcome: &mut SyncReport,
) -> Result<()> {
    for reconciled in changed {
        if reconciled.change != Change::Advanced {
            continue;
        }

        let dependency = &reconciled.dependency;
        let mut log = Log::new(dependency.project_id, LogAction::NewRelease);
        log.package_id = package.id;
        log.payload = Some(json!({
            "package": package.name,
            "version": version.version,
            "pinned": dependency.version,
        }));
        log.insert(conn)?;

        outcome.dependencies_updated += 1;
        outcome.log_entries += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Project, ProjectDependency, Provider};
    use crate::db::schema;
    use crate::registry::ReleaseFile;
    use chrono::{TimeZone, Utc};
    use tempfile::NamedTempFile;

    /// Registry double serving canned data
    #[derive(Default)]
    struct StaticRegistry {
        changelog: Vec<ChangelogEvent>,
        releases: Vec<(String, Vec<PackageRelease>)>,
    }

    impl RegistryClient for StaticRegistry {
        fn provider(&self) -> Provider {
            Provider::Pypi
        }

        fn package_url(&self, name: &str) -> String {
            format!("https://pypi.org/project/{}/", name)
        }

        fn list_packages(&self) -> Result<Vec<String>> {
            Ok(self.releases.iter().map(|(n, _)| n.clone()).collect())
        }

        fn get_changelog(&self, _since_hours: u32, _force: bool) -> Result<Vec<ChangelogEvent>> {
            Ok(self.changelog.clone())
        }

        fn get_package_versions(&self, name: &str) -> Result<Vec<PackageRelease>> {
            self.releases
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, r)| r.clone())
                .ok_or_else(|| Error::NotFoundError(name.to_string()))
        }

        fn get_release_urls(&self, _name: &str, _version: &str) -> Result<Vec<ReleaseFile>> {
            Ok(Vec::new())
        }
    }

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        schema::migrate(&conn).unwrap();
        (temp_file, conn)
    }

    fn release(version: &str) -> PackageRelease {
        PackageRelease {
            version: version.to_string(),
            released_at: None,
        }
    }

    fn event(name: &str, version: Option<&str>, action: &str) -> ChangelogEvent {
        ChangelogEvent::from_unix(name, version, 1345259834, action)
    }

    #[test]
    fn test_create_and_remove_events() {
        let (_temp, mut conn) = create_test_db();
        let registry = StaticRegistry {
            changelog: vec![
                event("fresh", None, "create"),
                event("gone", Some("1.0"), "remove"),
                event("other", Some("1.0"), "docupdate"),
            ],
            ..StaticRegistry::default()
        };

        let report = SyncOrchestrator::new(&registry)
            .sync_with_changelog(&mut conn, 24, false)
            .unwrap();

        assert_eq!(report.events, 3);
        assert_eq!(report.packages_created, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.failed, 0);
        assert!(Package::find_by_name(&conn, "fresh", Provider::Pypi).unwrap().is_some());
        assert!(Package::find_by_name(&conn, "gone", Provider::Pypi).unwrap().is_none());
    }

    #[test]
    fn test_bad_event_is_isolated() {
        let (_temp, mut conn) = create_test_db();
        let registry = StaticRegistry {
            changelog: vec![
                event("broken", None, "new release"),
                event("pmxbot", Some("1101.8.1"), "new release"),
            ],
            ..StaticRegistry::default()
        };

        let report = SyncOrchestrator::new(&registry)
            .sync_with_changelog(&mut conn, 24, false)
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.versions_recorded, 1);
        // The failed event's transaction was rolled back entirely
        assert!(Package::find_by_name(&conn, "broken", Provider::Pypi).unwrap().is_none());
    }

    #[test]
    fn test_all_events_failing_fails_the_run() {
        let (_temp, mut conn) = create_test_db();
        let registry = StaticRegistry {
            changelog: vec![event("broken", None, "new release")],
            ..StaticRegistry::default()
        };

        let result = SyncOrchestrator::new(&registry).sync_with_changelog(&mut conn, 24, false);
        assert!(matches!(result, Err(Error::SyncFailed(_))));
    }

    #[test]
    fn test_empty_changelog_is_not_a_failure() {
        let (_temp, mut conn) = create_test_db();
        let registry = StaticRegistry::default();

        let report = SyncOrchestrator::new(&registry)
            .sync_with_changelog(&mut conn, 24, true)
            .unwrap();
        assert_eq!(report, SyncReport::default());
    }

    #[test]
    fn test_backfill_logs_once_per_dependency() {
        let (_temp, mut conn) = create_test_db();
        let registry = StaticRegistry {
            releases: vec![(
                "pmxbot".to_string(),
                vec![release("1101.7.0"), release("1101.8.0"), release("1101.8.1")],
            )],
            ..StaticRegistry::default()
        };

        let package = catalog::ensure_package(&conn, "pmxbot", Provider::Pypi, "u").unwrap();
        let project_id = Project::new("test".to_string(), "test".to_string())
            .insert(&conn)
            .unwrap();
        let dep_id = ProjectDependency::new(project_id, package.id.unwrap(), "1101.8.0".to_string())
            .insert(&conn)
            .unwrap();

        let orchestrator = SyncOrchestrator::new(&registry);
        let report = orchestrator
            .sync_versions_for_package(&mut conn, &package)
            .unwrap();

        assert_eq!(report.events, 3);
        assert_eq!(report.versions_recorded, 3);
        assert_eq!(report.log_entries, 1);

        let dep = ProjectDependency::find_by_id(&conn, dep_id).unwrap().unwrap();
        let update = PackageVersion::find_by_id(&conn, dep.update_id.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(update.version, "1101.8.1");

        // Second backfill finds nothing new
        let report = orchestrator
            .sync_versions_for_package(&mut conn, &package)
            .unwrap();
        assert_eq!(report.versions_recorded, 0);
        assert_eq!(report.duplicates, 3);
        assert_eq!(report.log_entries, 0);
    }

    #[test]
    fn test_backfill_after_changelog_keeps_newest_update() {
        let (_temp, mut conn) = create_test_db();
        let registry = StaticRegistry {
            changelog: vec![event("pmxbot", Some("2.0"), "new release")],
            releases: vec![(
                "pmxbot".to_string(),
                vec![release("1.0"), release("1.5"), release("2.0")],
            )],
        };

        let package = catalog::ensure_package(&conn, "pmxbot", Provider::Pypi, "u").unwrap();
        let project_id = Project::new("test".to_string(), "test".to_string())
            .insert(&conn)
            .unwrap();
        let dep_id = ProjectDependency::new(project_id, package.id.unwrap(), "1.0".to_string())
            .insert(&conn)
            .unwrap();

        let orchestrator = SyncOrchestrator::new(&registry);
        orchestrator.sync_with_changelog(&mut conn, 24, false).unwrap();
        let (_, report) = orchestrator.add_package(&mut conn, "pmxbot").unwrap();

        assert_eq!(report.versions_recorded, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.log_entries, 0);

        let dep = ProjectDependency::find_by_id(&conn, dep_id).unwrap().unwrap();
        let update = PackageVersion::find_by_id(&conn, dep.update_id.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(update.version, "2.0");
        assert_eq!(catalog::latest_version(&conn, &package).unwrap().unwrap().version, "2.0");

        let logs = Log::find_by_project_and_action(&conn, project_id, LogAction::NewRelease).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].payload.as_ref().unwrap()["version"], "2.0");

        let historical: Vec<String> = catalog::list_versions(&conn, &package)
            .unwrap()
            .into_iter()
            .filter(|v| v.historical)
            .map(|v| v.version)
            .collect();
        assert_eq!(historical, vec!["1.0", "1.5"]);
    }

    #[test]
    fn test_backfill_fills_gap_and_reconciles_newer_tail() {
        let (_temp, mut conn) = create_test_db();
        let registry = StaticRegistry {
            releases: vec![(
                "pmxbot".to_string(),
                vec![release("1.0"), release("1.5"), release("2.0"), release("2.1")],
            )],
            ..StaticRegistry::default()
        };

        let package = catalog::ensure_package(&conn, "pmxbot", Provider::Pypi, "u").unwrap();
        catalog::record_version(&conn, &package, "2.0", None).unwrap();
        let project_id = Project::new("test".to_string(), "test".to_string())
            .insert(&conn)
            .unwrap();
        let dep_id = ProjectDependency::new(project_id, package.id.unwrap(), "1.0".to_string())
            .insert(&conn)
            .unwrap();

        let report = SyncOrchestrator::new(&registry)
            .sync_versions_for_package(&mut conn, &package)
            .unwrap();
        assert_eq!(report.versions_recorded, 3);
        assert_eq!(report.log_entries, 1);

        let dep = ProjectDependency::find_by_id(&conn, dep_id).unwrap().unwrap();
        let update = PackageVersion::find_by_id(&conn, dep.update_id.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(update.version, "2.1");
    }

    #[test]
    fn test_add_package_records_history() {
        let (_temp, mut conn) = create_test_db();
        let released = Utc.with_ymd_and_hms(2012, 7, 26, 23, 51, 18).unwrap();
        let registry = StaticRegistry {
            releases: vec![(
                "gunicorn".to_string(),
                vec![PackageRelease {
                    version: "0.14.6".to_string(),
                    released_at: Some(released),
                }],
            )],
            ..StaticRegistry::default()
        };

        let (package, report) = SyncOrchestrator::new(&registry)
            .add_package(&mut conn, "gunicorn")
            .unwrap();

        assert_eq!(package.url, "https://pypi.org/project/gunicorn/");
        assert_eq!(report.packages_created, 1);
        let versions = catalog::list_versions(&conn, &package).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].release_date, Some(released));
    }

    #[test]
    fn test_add_unknown_package_writes_nothing() {
        let (_temp, mut conn) = create_test_db();
        let registry = StaticRegistry::default();

        let result = SyncOrchestrator::new(&registry).add_package(&mut conn, "nope");
        assert!(matches!(result, Err(Error::NotFoundError(_))));
        assert!(Package::list_all(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_sync_all_packages_isolates_failures() {
        let (_temp, mut conn) = create_test_db();
        let registry = StaticRegistry {
            releases: vec![("pmxbot".to_string(), vec![release("1101.8.1")])],
            ..StaticRegistry::default()
        };

        catalog::ensure_package(&conn, "pmxbot", Provider::Pypi, "u").unwrap();
        catalog::ensure_package(&conn, "delisted", Provider::Pypi, "u").unwrap();

        let report = SyncOrchestrator::new(&registry)
            .sync_all_packages(&mut conn)
            .unwrap();
        assert_eq!(report.events, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.versions_recorded, 1);
    }
}
