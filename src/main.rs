// src/main.rs

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use pinwatch::db::models::{Log, LogAction, Package, Project, ProjectDependency};
use pinwatch::import::import_manifest;
use pinwatch::registry::{PypiClient, PypiConfig, RegistryClient};
use pinwatch::sync::{SyncOrchestrator, SyncReport};
use pinwatch::{catalog, manifest};
use std::io;
use tracing::info;

const DEFAULT_DB_PATH: &str = "/var/lib/pinwatch/pinwatch.db";

#[derive(Parser)]
#[command(name = "pinwatch")]
#[command(author, version, about = "Track pinned dependencies against registry releases", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the Pinwatch database
    Init {
        /// Database path (default: /var/lib/pinwatch/pinwatch.db)
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
    },
    /// Register a project
    ProjectAdd {
        /// Unique project slug
        slug: String,
        /// Display name (defaults to the slug)
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
    },
    /// List projects
    ProjectList {
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
    },
    /// Import pinned dependencies from a manifest file
    Import {
        /// Project slug
        project: String,
        /// Path to the manifest file
        manifest_path: String,
        /// Manifest format (see `pinwatch formats`)
        #[arg(short, long, default_value = "pip_requirements")]
        format: String,
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
        #[arg(long, default_value = pinwatch::registry::pypi::DEFAULT_BASE_URL)]
        registry_url: String,
    },
    /// List supported manifest formats
    Formats,
    /// Show a project's dependencies and available updates
    Deps {
        /// Project slug
        project: String,
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
    },
    /// Ingest recent releases from the registry changelog
    Sync {
        /// Size of the changelog window in hours
        #[arg(long, default_value_t = 24)]
        hours: u32,
        /// Refetch the changelog even if a cached copy is fresh
        #[arg(short, long)]
        force: bool,
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
        #[arg(long, default_value = pinwatch::registry::pypi::DEFAULT_BASE_URL)]
        registry_url: String,
    },
    /// Track a package and record its full release history
    AddPackage {
        /// Package name
        name: String,
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
        #[arg(long, default_value = pinwatch::registry::pypi::DEFAULT_BASE_URL)]
        registry_url: String,
    },
    /// Re-record release history for one package, or all if omitted
    Backfill {
        /// Package name
        name: Option<String>,
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
        #[arg(long, default_value = pinwatch::registry::pypi::DEFAULT_BASE_URL)]
        registry_url: String,
    },
    /// Show the files uploaded for a release
    Files {
        /// Package name
        name: String,
        /// Release version
        version: String,
        #[arg(long, default_value = pinwatch::registry::pypi::DEFAULT_BASE_URL)]
        registry_url: String,
    },
    /// Show a project's activity log
    Log {
        /// Project slug
        project: String,
        /// Only show one action (new_release, add_dependency, update_dependency)
        #[arg(short, long)]
        action: Option<String>,
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell type
        shell: Shell,
    },
}

fn registry(url: &str) -> Result<PypiClient> {
    Ok(PypiClient::new(PypiConfig::with_base_url(url))?)
}

fn find_project(conn: &rusqlite::Connection, slug: &str) -> Result<Project> {
    Project::find_by_slug(conn, slug)?
        .ok_or_else(|| anyhow::anyhow!("Project '{}' does not exist", slug))
}

fn tracked_package<C: RegistryClient + ?Sized>(
    conn: &rusqlite::Connection,
    client: &C,
    name: &str,
) -> Result<Package> {
    catalog::find_package(conn, name, client.provider())?
        .ok_or_else(|| anyhow::anyhow!("Package '{}' is not tracked", name))
}

fn print_report(report: &SyncReport) {
    println!("  Events: {}", report.events);
    println!("  Packages created: {}", report.packages_created);
    println!("  Versions recorded: {}", report.versions_recorded);
    println!("  Already known: {}", report.duplicates);
    println!("  Dependencies updated: {}", report.dependencies_updated);
    if report.skipped > 0 {
        println!("  Skipped: {}", report.skipped);
    }
    if report.failed > 0 {
        println!("  Failed: {}", report.failed);
    }
}

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init { db_path }) => {
            info!("Initializing Pinwatch database at: {}", db_path);
            pinwatch::db::init(&db_path)?;
            println!("Database initialized successfully at: {}", db_path);
            Ok(())
        }
        Some(Commands::ProjectAdd {
            slug,
            name,
            db_path,
        }) => {
            let conn = pinwatch::db::open(&db_path)?;

            if Project::find_by_slug(&conn, &slug)?.is_some() {
                return Err(anyhow::anyhow!("Project '{}' already exists", slug));
            }

            let name = name.unwrap_or_else(|| slug.clone());
            let mut project = Project::new(slug.clone(), name);
            project.insert(&conn)?;

            println!("Added project: {}", slug);
            Ok(())
        }
        Some(Commands::ProjectList { db_path }) => {
            let conn = pinwatch::db::open(&db_path)?;
            let projects = Project::list_all(&conn)?;

            if projects.is_empty() {
                println!("No projects.");
            } else {
                println!("Projects:");
                for project in &projects {
                    println!("  {} ({})", project.slug, project.name);
                }
                println!("\nTotal: {} project(s)", projects.len());
            }
            Ok(())
        }
        Some(Commands::Import {
            project,
            manifest_path,
            format,
            db_path,
            registry_url,
        }) => {
            info!("Importing {} into {}", manifest_path, project);

            let mut conn = pinwatch::db::open(&db_path)?;
            let project = find_project(&conn, &project)?;
            let client = registry(&registry_url)?;

            let content = std::fs::read_to_string(&manifest_path)?;
            let lines: Vec<&str> = content.lines().collect();

            let report = import_manifest(&mut conn, &client, &project, &lines, &format)?;

            println!("Imported {} pinned package(s) into {}", report.pinned, project.slug);
            println!("  Added: {}", report.added);
            println!("  Changed: {}", report.changed);
            println!("  Unchanged: {}", report.unchanged);
            if !report.missing.is_empty() {
                println!("Not pinned:");
                for entry in &report.missing {
                    println!("  {}", entry);
                }
            }
            Ok(())
        }
        Some(Commands::Formats) => {
            println!("Manifest formats:");
            for (id, title) in manifest::get_parser_choices() {
                println!("  {:<20} {}", id, title);
            }
            Ok(())
        }
        Some(Commands::Deps { project, db_path }) => {
            let conn = pinwatch::db::open(&db_path)?;
            let project = find_project(&conn, &project)?;
            let project_id = project
                .id
                .ok_or_else(|| anyhow::anyhow!("Project '{}' has no ID", project.slug))?;

            let deps = ProjectDependency::status_for_project(&conn, project_id)?;
            if deps.is_empty() {
                println!("No dependencies for {}.", project.slug);
                return Ok(());
            }

            println!("Dependencies of {}:", project.slug);
            let mut outdated = 0;
            for dep in &deps {
                match &dep.update_version {
                    Some(update) => {
                        outdated += 1;
                        println!("  {} {} -> {}", dep.package_name, dep.version, update);
                    }
                    None => println!("  {} {}", dep.package_name, dep.version),
                }
            }
            println!("\nTotal: {} dependency(ies), {} outdated", deps.len(), outdated);
            Ok(())
        }
        Some(Commands::Sync {
            hours,
            force,
            db_path,
            registry_url,
        }) => {
            let mut conn = pinwatch::db::open(&db_path)?;
            let client = registry(&registry_url)?;

            let report = SyncOrchestrator::new(&client).sync_with_changelog(&mut conn, hours, force)?;

            println!("Sync complete:");
            print_report(&report);
            Ok(())
        }
        Some(Commands::AddPackage {
            name,
            db_path,
            registry_url,
        }) => {
            let mut conn = pinwatch::db::open(&db_path)?;
            let client = registry(&registry_url)?;

            let (package, report) = SyncOrchestrator::new(&client).add_package(&mut conn, &name)?;

            println!("Tracking package: {} ({})", package.name, package.url);
            println!("  Versions recorded: {}", report.versions_recorded);
            Ok(())
        }
        Some(Commands::Backfill {
            name,
            db_path,
            registry_url,
        }) => {
            let mut conn = pinwatch::db::open(&db_path)?;
            let client = registry(&registry_url)?;
            let orchestrator = SyncOrchestrator::new(&client);

            let report = match name {
                Some(name) => {
                    let package = tracked_package(&conn, &client, &name)?;
                    orchestrator.sync_versions_for_package(&mut conn, &package)?
                }
                None => orchestrator.sync_all_packages(&mut conn)?,
            };

            println!("Backfill complete:");
            print_report(&report);
            Ok(())
        }
        Some(Commands::Files {
            name,
            version,
            registry_url,
        }) => {
            let client = registry(&registry_url)?;
            let files = client.get_release_urls(&name, &version)?;

            if files.is_empty() {
                println!("No files for {} {}.", name, version);
            } else {
                println!("Files for {} {}:", name, version);
                for file in &files {
                    println!("  {} ({}, {} bytes)", file.filename, file.package_type, file.size);
                    println!("    {}", file.url);
                    if let Some(sha256) = &file.sha256_digest {
                        println!("    sha256: {}", sha256);
                    }
                }
            }
            Ok(())
        }
        Some(Commands::Log {
            project,
            action,
            db_path,
        }) => {
            let conn = pinwatch::db::open(&db_path)?;
            let project = find_project(&conn, &project)?;
            let project_id = project
                .id
                .ok_or_else(|| anyhow::anyhow!("Project '{}' has no ID", project.slug))?;

            let logs = match action {
                Some(action) => {
                    let action: LogAction = action.parse().map_err(|e: String| anyhow::anyhow!(e))?;
                    Log::find_by_project_and_action(&conn, project_id, action)?
                }
                None => Log::find_by_project(&conn, project_id)?,
            };

            if logs.is_empty() {
                println!("No log entries for {}.", project.slug);
            } else {
                for log in &logs {
                    let payload = log
                        .payload
                        .as_ref()
                        .map(|p| p.to_string())
                        .unwrap_or_default();
                    println!(
                        "  [{}] {} {}",
                        log.created_at.as_deref().unwrap_or("-"),
                        log.action.as_str(),
                        payload
                    );
                }
                println!("\nTotal: {} entry(ies)", logs.len());
            }
            Ok(())
        }
        Some(Commands::Completions { shell }) => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "pinwatch", &mut io::stdout());
            Ok(())
        }
        None => {
            // No command provided, show help
            println!("Pinwatch v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'pinwatch --help' for usage information");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_tracked_package_uses_client_provider() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("pinwatch.db");
        let db_path = db_path.to_str().unwrap();
        pinwatch::db::init(db_path).unwrap();
        let conn = pinwatch::db::open(db_path).unwrap();

        let client = PypiClient::new(PypiConfig::default()).unwrap();
        catalog::ensure_package(&conn, "Django", client.provider(), "u").unwrap();

        let package = tracked_package(&conn, &client, "Django").unwrap();
        assert_eq!(package.name, "django");
        assert!(tracked_package(&conn, &client, "flask").is_err());
    }

    #[test]
    fn test_sync_defaults() {
        let cli = Cli::try_parse_from(["pinwatch", "sync"]).unwrap();
        match cli.command {
            Some(Commands::Sync {
                hours,
                force,
                db_path,
                registry_url,
            }) => {
                assert_eq!(hours, 24);
                assert!(!force);
                assert_eq!(db_path, DEFAULT_DB_PATH);
                assert_eq!(registry_url, "https://pypi.org");
            }
            _ => panic!("expected sync command"),
        }
    }

    #[test]
    fn test_import_arguments() {
        let cli = Cli::try_parse_from([
            "pinwatch",
            "import",
            "site",
            "requirements.txt",
            "--format",
            "buildout_versions",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Import {
                project,
                manifest_path,
                format,
                ..
            }) => {
                assert_eq!(project, "site");
                assert_eq!(manifest_path, "requirements.txt");
                assert_eq!(format, "buildout_versions");
            }
            _ => panic!("expected import command"),
        }
    }
}
