// src/db/schema.rs

//! Database schema definitions and migrations for Pinwatch
//!
//! This module defines the SQLite schema for all core tables and provides
//! a migration system to evolve the schema over time.

use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

/// Set the schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    debug!("Current schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        debug!("Schema is up to date");
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    info!(
        "Schema migration complete. Now at version {}",
        SCHEMA_VERSION
    );
    Ok(())
}

/// Apply a specific migration version
fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        _ => Err(Error::InitError(format!(
            "Unknown migration version: {}",
            version
        ))),
    }
}

/// Initial schema - Version 1
///
/// Creates the registry-scoped catalog and the project tables:
/// - packages: Packages known from a registry
/// - package_versions: Released versions, in ingestion order
/// - projects: Projects whose dependencies are tracked
/// - project_dependencies: Pinned versions plus the available update pointer
/// - logs: Append-only activity entries owned by a project
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        CREATE TABLE packages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            url TEXT NOT NULL,
            provider TEXT NOT NULL CHECK(provider IN ('pypi')),
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(name, provider)
        );

        CREATE INDEX idx_packages_name ON packages(name);

        -- AUTOINCREMENT keeps ids strictly increasing, which is the
        -- ingestion sequence used to pick the latest version. Historical
        -- rows were recorded after a newer release and never count as latest.
        CREATE TABLE package_versions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id INTEGER NOT NULL,
            version TEXT NOT NULL,
            release_date TEXT,
            historical INTEGER NOT NULL DEFAULT 0,
            ingested_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(package_id, version),
            FOREIGN KEY (package_id) REFERENCES packages(id)
        );

        CREATE INDEX idx_package_versions_package ON package_versions(package_id);

        CREATE TABLE projects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            slug TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE project_dependencies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id INTEGER NOT NULL,
            package_id INTEGER NOT NULL,
            version TEXT NOT NULL,
            update_id INTEGER,
            UNIQUE(project_id, package_id),
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
            FOREIGN KEY (package_id) REFERENCES packages(id),
            FOREIGN KEY (update_id) REFERENCES package_versions(id) ON DELETE SET NULL
        );

        CREATE INDEX idx_project_dependencies_project ON project_dependencies(project_id);
        CREATE INDEX idx_project_dependencies_package ON project_dependencies(package_id);

        CREATE TABLE logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id INTEGER NOT NULL,
            package_id INTEGER,
            action TEXT NOT NULL CHECK(action IN ('new_release', 'add_dependency', 'update_dependency')),
            payload TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE SET NULL
        );

        CREATE INDEX idx_logs_project ON logs(project_id);
        CREATE INDEX idx_logs_action ON logs(action);
        ",
    )?;

    info!("Schema version 1 created successfully");
    Ok(())
}
