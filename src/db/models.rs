// src/db/models.rs

//! Data models for Pinwatch database entities
//!
//! This module defines Rust structs that correspond to database tables
//! and provides methods for creating, reading and updating records.
//! Catalog rows (packages, versions) and log rows are never updated in
//! place; the only mutable column the sync engine touches is
//! `project_dependencies.update_id`.

use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::str::FromStr;

/// Wrap a column conversion error the way rusqlite expects from `from_row`
fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

/// Registry a package comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Pypi,
}

impl Provider {
    pub fn as_str(&self) -> &str {
        match self {
            Provider::Pypi => "pypi",
        }
    }

    /// Canonical form of a package name for this registry
    ///
    /// PyPI treats names case-insensitively and considers runs of `-`, `_`
    /// and `.` equivalent, so `Django` and `django` are the same project.
    pub fn normalize_name(&self, name: &str) -> String {
        match self {
            Provider::Pypi => {
                let mut out = String::with_capacity(name.len());
                let mut in_run = false;
                for c in name.trim().chars() {
                    if matches!(c, '-' | '_' | '.') {
                        if !in_run {
                            out.push('-');
                        }
                        in_run = true;
                    } else {
                        out.extend(c.to_lowercase());
                        in_run = false;
                    }
                }
                out
            }
        }
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pypi" => Ok(Provider::Pypi),
            _ => Err(format!("Invalid provider: {}", s)),
        }
    }
}

/// A Package known from a registry
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    pub id: Option<i64>,
    pub name: String,
    pub url: String,
    pub provider: Provider,
    pub created_at: Option<String>,
}

impl Package {
    /// Create a new Package
    pub fn new(name: String, url: String, provider: Provider) -> Self {
        Self {
            id: None,
            name,
            url,
            provider,
            created_at: None,
        }
    }

    /// Insert this package into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO packages (name, url, provider) VALUES (?1, ?2, ?3)",
            params![&self.name, &self.url, self.provider.as_str()],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Insert this package unless (name, provider) is already taken
    ///
    /// Returns `true` if a row was created.
    pub fn insert_if_absent(&self, conn: &Connection) -> Result<bool> {
        let changed = conn.execute(
            "INSERT OR IGNORE INTO packages (name, url, provider) VALUES (?1, ?2, ?3)",
            params![&self.name, &self.url, self.provider.as_str()],
        )?;
        Ok(changed == 1)
    }

    /// Find a package by ID
    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, url, provider, created_at FROM packages WHERE id = ?1",
        )?;

        let package = stmt.query_row([id], Self::from_row).optional()?;

        Ok(package)
    }

    /// Find a package by its registry identity
    pub fn find_by_name(conn: &Connection, name: &str, provider: Provider) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, url, provider, created_at FROM packages
             WHERE name = ?1 AND provider = ?2",
        )?;

        let package = stmt
            .query_row(params![name, provider.as_str()], Self::from_row)
            .optional()?;

        Ok(package)
    }

    /// List all packages
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, url, provider, created_at FROM packages ORDER BY name, provider",
        )?;

        let packages = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// Convert a database row to a Package
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let provider_str: String = row.get(3)?;
        let provider = provider_str
            .parse::<Provider>()
            .map_err(|e| conversion_error(3, e))?;

        Ok(Self {
            id: Some(row.get(0)?),
            name: row.get(1)?,
            url: row.get(2)?,
            provider,
            created_at: row.get(4)?,
        })
    }
}

/// A released version of a Package
///
/// The row id doubles as the ingestion sequence: a higher id was recorded
/// later. A historical version was recorded after a newer release of the
/// same package was already known, so its id says nothing about recency.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageVersion {
    pub id: Option<i64>,
    pub package_id: i64,
    pub version: String,
    pub release_date: Option<DateTime<Utc>>,
    pub historical: bool,
    pub ingested_at: Option<String>,
}

const VERSION_COLUMNS: &str = "id, package_id, version, release_date, historical, ingested_at";

impl PackageVersion {
    /// Create a new PackageVersion
    pub fn new(package_id: i64, version: String, release_date: Option<DateTime<Utc>>) -> Self {
        Self {
            id: None,
            package_id,
            version,
            release_date,
            historical: false,
            ingested_at: None,
        }
    }

    /// Insert this version into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO package_versions (package_id, version, release_date, historical)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                &self.package_id,
                &self.version,
                self.release_date.map(|d| d.to_rfc3339()),
                self.historical,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Insert this version unless (package, version) already exists
    ///
    /// Returns `true` if a row was created. The unique index makes this safe
    /// against concurrent runs inserting the same version.
    pub fn insert_if_absent(&mut self, conn: &Connection) -> Result<bool> {
        let changed = conn.execute(
            "INSERT OR IGNORE INTO package_versions (package_id, version, release_date, historical)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                &self.package_id,
                &self.version,
                self.release_date.map(|d| d.to_rfc3339()),
                self.historical,
            ],
        )?;

        if changed == 1 {
            self.id = Some(conn.last_insert_rowid());
        }
        Ok(changed == 1)
    }

    /// Find a version by ID
    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM package_versions WHERE id = ?1",
            VERSION_COLUMNS
        ))?;

        let version = stmt.query_row([id], Self::from_row).optional()?;

        Ok(version)
    }

    /// Find a specific version of a package
    pub fn find(conn: &Connection, package_id: i64, version: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM package_versions WHERE package_id = ?1 AND version = ?2",
            VERSION_COLUMNS
        ))?;

        let version = stmt
            .query_row(params![package_id, version], Self::from_row)
            .optional()?;

        Ok(version)
    }

    /// All versions of a package in ingestion order
    pub fn find_by_package(conn: &Connection, package_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM package_versions WHERE package_id = ?1 ORDER BY id",
            VERSION_COLUMNS
        ))?;

        let versions = stmt
            .query_map([package_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(versions)
    }

    /// The most recently ingested version of a package, ignoring historical
    /// versions
    pub fn latest_for_package(conn: &Connection, package_id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM package_versions
             WHERE package_id = ?1 AND historical = 0
             ORDER BY id DESC LIMIT 1",
            VERSION_COLUMNS
        ))?;

        let version = stmt.query_row([package_id], Self::from_row).optional()?;

        Ok(version)
    }

    /// Count versions recorded for a package
    pub fn count_for_package(conn: &Connection, package_id: i64) -> Result<i64> {
        let count = conn.query_row(
            "SELECT COUNT(*) FROM package_versions WHERE package_id = ?1",
            [package_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Convert a database row to a PackageVersion
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let release_date: Option<String> = row.get(3)?;
        let release_date = release_date
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|d| d.with_timezone(&Utc))
                    .map_err(|e| conversion_error(3, format!("Invalid release date {}: {}", s, e)))
            })
            .transpose()?;

        Ok(Self {
            id: Some(row.get(0)?),
            package_id: row.get(1)?,
            version: row.get(2)?,
            release_date,
            historical: row.get(4)?,
            ingested_at: row.get(5)?,
        })
    }
}

/// A Project whose dependencies are tracked
#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    pub id: Option<i64>,
    pub slug: String,
    pub name: String,
    pub created_at: Option<String>,
}

impl Project {
    /// Create a new Project
    pub fn new(slug: String, name: String) -> Self {
        Self {
            id: None,
            slug,
            name,
            created_at: None,
        }
    }

    /// Insert this project into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO projects (slug, name) VALUES (?1, ?2)",
            params![&self.slug, &self.name],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find a project by ID
    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt =
            conn.prepare("SELECT id, slug, name, created_at FROM projects WHERE id = ?1")?;

        let project = stmt.query_row([id], Self::from_row).optional()?;

        Ok(project)
    }

    /// Find a project by slug
    pub fn find_by_slug(conn: &Connection, slug: &str) -> Result<Option<Self>> {
        let mut stmt =
            conn.prepare("SELECT id, slug, name, created_at FROM projects WHERE slug = ?1")?;

        let project = stmt.query_row([slug], Self::from_row).optional()?;

        Ok(project)
    }

    /// List all projects
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt =
            conn.prepare("SELECT id, slug, name, created_at FROM projects ORDER BY slug")?;

        let projects = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(projects)
    }

    /// Delete a project by ID (dependencies and logs cascade)
    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM projects WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Convert a database row to a Project
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            slug: row.get(1)?,
            name: row.get(2)?,
            created_at: row.get(3)?,
        })
    }
}

/// A Package pinned by a Project, plus the newest known update
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectDependency {
    pub id: Option<i64>,
    pub project_id: i64,
    pub package_id: i64,
    pub version: String,
    pub update_id: Option<i64>,
}

/// Dependency joined with its package and update, for display
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyStatus {
    pub package_name: String,
    pub version: String,
    pub update_version: Option<String>,
}

const DEPENDENCY_COLUMNS: &str = "id, project_id, package_id, version, update_id";

impl ProjectDependency {
    /// Create a new ProjectDependency
    pub fn new(project_id: i64, package_id: i64, version: String) -> Self {
        Self {
            id: None,
            project_id,
            package_id,
            version,
            update_id: None,
        }
    }

    /// Insert this dependency into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO project_dependencies (project_id, package_id, version, update_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                &self.project_id,
                &self.package_id,
                &self.version,
                &self.update_id,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find a dependency by ID
    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM project_dependencies WHERE id = ?1",
            DEPENDENCY_COLUMNS
        ))?;

        let dep = stmt.query_row([id], Self::from_row).optional()?;

        Ok(dep)
    }

    /// Find all dependencies of a project
    pub fn find_by_project(conn: &Connection, project_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM project_dependencies WHERE project_id = ?1 ORDER BY id",
            DEPENDENCY_COLUMNS
        ))?;

        let deps = stmt
            .query_map([project_id], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(deps)
    }

    /// Find every dependency on a package, across all projects
    pub fn find_by_package(conn: &Connection, package_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM project_dependencies WHERE package_id = ?1 ORDER BY id",
            DEPENDENCY_COLUMNS
        ))?;

        let deps = stmt
            .query_map([package_id], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(deps)
    }

    /// Find the dependency of one project on one package
    pub fn find_by_project_and_package(
        conn: &Connection,
        project_id: i64,
        package_id: i64,
    ) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM project_dependencies WHERE project_id = ?1 AND package_id = ?2",
            DEPENDENCY_COLUMNS
        ))?;

        let dep = stmt
            .query_row(params![project_id, package_id], Self::from_row)
            .optional()?;

        Ok(dep)
    }

    /// Dependencies of a project with package names and update versions
    pub fn status_for_project(conn: &Connection, project_id: i64) -> Result<Vec<DependencyStatus>> {
        let mut stmt = conn.prepare(
            "SELECT p.name, d.version, v.version
             FROM project_dependencies d
             JOIN packages p ON p.id = d.package_id
             LEFT JOIN package_versions v ON v.id = d.update_id
             WHERE d.project_id = ?1
             ORDER BY p.name",
        )?;

        let rows = stmt
            .query_map([project_id], |row| {
                Ok(DependencyStatus {
                    package_name: row.get(0)?,
                    version: row.get(1)?,
                    update_version: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }

    /// Whether the owning project row still exists
    pub fn project_exists(&self, conn: &Connection) -> Result<bool> {
        let exists = conn
            .query_row(
                "SELECT 1 FROM projects WHERE id = ?1",
                [self.project_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        Ok(exists)
    }

    /// Change the pinned version
    pub fn set_version(&mut self, conn: &Connection, version: &str) -> Result<()> {
        let id = self.id.ok_or_else(|| {
            crate::error::Error::InitError("Cannot update dependency without ID".to_string())
        })?;

        conn.execute(
            "UPDATE project_dependencies SET version = ?1 WHERE id = ?2",
            params![version, id],
        )?;

        self.version = version.to_string();
        Ok(())
    }

    /// Point the update at `version_id` if that moves it forward
    ///
    /// The statement only matches when the version belongs to the same
    /// package, is not historical, differs from the pinned version, and was
    /// ingested after the current update (if any). Returns `true` if the row
    /// changed.
    pub fn advance_update(conn: &Connection, id: i64, version_id: i64) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE project_dependencies SET update_id = ?1
             WHERE id = ?2
               AND package_id = (SELECT package_id FROM package_versions WHERE id = ?1)
               AND (SELECT historical FROM package_versions WHERE id = ?1) = 0
               AND version <> (SELECT version FROM package_versions WHERE id = ?1)
               AND (update_id IS NULL OR update_id < ?1)",
            params![version_id, id],
        )?;
        Ok(changed == 1)
    }

    /// Clear the update because the project now pins `version_id` itself
    ///
    /// An update that was ingested after `version_id` is kept. Returns
    /// `true` if the row changed.
    pub fn clear_update(conn: &Connection, id: i64, version_id: i64) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE project_dependencies SET update_id = NULL
             WHERE id = ?1
               AND update_id IS NOT NULL
               AND update_id <= ?2
               AND version = (SELECT version FROM package_versions WHERE id = ?2)",
            params![id, version_id],
        )?;
        Ok(changed == 1)
    }

    /// Delete a dependency by ID
    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM project_dependencies WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Convert a database row to a ProjectDependency
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            project_id: row.get(1)?,
            package_id: row.get(2)?,
            version: row.get(3)?,
            update_id: row.get(4)?,
        })
    }
}

/// Kind of change recorded in the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAction {
    NewRelease,
    AddDependency,
    UpdateDependency,
}

impl LogAction {
    pub fn as_str(&self) -> &str {
        match self {
            LogAction::NewRelease => "new_release",
            LogAction::AddDependency => "add_dependency",
            LogAction::UpdateDependency => "update_dependency",
        }
    }
}

impl FromStr for LogAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "new_release" => Ok(LogAction::NewRelease),
            "add_dependency" => Ok(LogAction::AddDependency),
            "update_dependency" => Ok(LogAction::UpdateDependency),
            _ => Err(format!("Invalid log action: {}", s)),
        }
    }
}

/// Append-only audit entry scoped to a project
#[derive(Debug, Clone, PartialEq)]
pub struct Log {
    pub id: Option<i64>,
    pub project_id: i64,
    pub package_id: Option<i64>,
    pub action: LogAction,
    pub payload: Option<serde_json::Value>,
    pub created_at: Option<String>,
}

const LOG_COLUMNS: &str = "id, project_id, package_id, action, payload, created_at";

impl Log {
    /// Create a new Log entry
    pub fn new(project_id: i64, action: LogAction) -> Self {
        Self {
            id: None,
            project_id,
            package_id: None,
            action,
            payload: None,
            created_at: None,
        }
    }

    /// Insert this entry into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        let payload = self
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            "INSERT INTO logs (project_id, package_id, action, payload) VALUES (?1, ?2, ?3, ?4)",
            params![
                &self.project_id,
                &self.package_id,
                self.action.as_str(),
                payload,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// All entries for a project, newest first
    pub fn find_by_project(conn: &Connection, project_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM logs WHERE project_id = ?1 ORDER BY id DESC",
            LOG_COLUMNS
        ))?;

        let logs = stmt
            .query_map([project_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(logs)
    }

    /// Entries for a project with a given action, newest first
    pub fn find_by_project_and_action(
        conn: &Connection,
        project_id: i64,
        action: LogAction,
    ) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM logs WHERE project_id = ?1 AND action = ?2 ORDER BY id DESC",
            LOG_COLUMNS
        ))?;

        let logs = stmt
            .query_map(params![project_id, action.as_str()], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(logs)
    }

    /// Convert a database row to a Log
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let action_str: String = row.get(3)?;
        let action = action_str
            .parse::<LogAction>()
            .map_err(|e| conversion_error(3, e))?;

        let payload: Option<String> = row.get(4)?;
        let payload = payload
            .map(|s| {
                serde_json::from_str(&s)
                    .map_err(|e| conversion_error(4, format!("Invalid log payload: {}", e)))
            })
            .transpose()?;

        Ok(Self {
            id: Some(row.get(0)?),
            project_id: row.get(1)?,
            package_id: row.get(2)?,
            action,
            payload,
            created_at: row.get(5)?,
        })
    }
}
