// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

const DEFAULT_DB_PATH: &str = "/var/lib/pinwatch/pinwatch.db";
const DEFAULT_REGISTRY_URL: &str = "https://pypi.org";

fn db_path_arg() -> Arg {
    Arg::new("db_path")
        .short('d')
        .long("db-path")
        .value_name("PATH")
        .default_value(DEFAULT_DB_PATH)
        .help("Database path")
}

fn registry_url_arg() -> Arg {
    Arg::new("registry_url")
        .long("registry-url")
        .value_name("URL")
        .default_value(DEFAULT_REGISTRY_URL)
        .help("Registry base URL")
}

fn build_cli() -> Command {
    Command::new("pinwatch")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Pinwatch Contributors")
        .about("Track pinned dependencies against registry releases")
        .subcommand_required(false)
        .subcommand(
            Command::new("init")
                .about("Initialize the Pinwatch database")
                .arg(db_path_arg()),
        )
        .subcommand(
            Command::new("project-add")
                .about("Register a project")
                .arg(Arg::new("slug").required(true).help("Unique project slug"))
                .arg(
                    Arg::new("name")
                        .short('n')
                        .long("name")
                        .help("Display name (defaults to the slug)"),
                )
                .arg(db_path_arg()),
        )
        .subcommand(
            Command::new("project-list")
                .about("List projects")
                .arg(db_path_arg()),
        )
        .subcommand(
            Command::new("import")
                .about("Import pinned dependencies from a manifest file")
                .arg(Arg::new("project").required(true).help("Project slug"))
                .arg(Arg::new("manifest_path").required(true).help("Path to the manifest file"))
                .arg(
                    Arg::new("format")
                        .short('f')
                        .long("format")
                        .default_value("pip_requirements")
                        .help("Manifest format (pip_requirements, buildout_versions)"),
                )
                .arg(db_path_arg())
                .arg(registry_url_arg()),
        )
        .subcommand(Command::new("formats").about("List supported manifest formats"))
        .subcommand(
            Command::new("deps")
                .about("Show a project's dependencies and available updates")
                .arg(Arg::new("project").required(true).help("Project slug"))
                .arg(db_path_arg()),
        )
        .subcommand(
            Command::new("sync")
                .about("Ingest recent releases from the registry changelog")
                .arg(
                    Arg::new("hours")
                        .long("hours")
                        .default_value("24")
                        .help("Size of the changelog window in hours"),
                )
                .arg(
                    Arg::new("force")
                        .short('f')
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Refetch the changelog even if a cached copy is fresh"),
                )
                .arg(db_path_arg())
                .arg(registry_url_arg()),
        )
        .subcommand(
            Command::new("add-package")
                .about("Track a package and record its full release history")
                .arg(Arg::new("name").required(true).help("Package name"))
                .arg(db_path_arg())
                .arg(registry_url_arg()),
        )
        .subcommand(
            Command::new("backfill")
                .about("Re-record release history for one package, or all if omitted")
                .arg(Arg::new("name").help("Package name"))
                .arg(db_path_arg())
                .arg(registry_url_arg()),
        )
        .subcommand(
            Command::new("files")
                .about("Show the files uploaded for a release")
                .arg(Arg::new("name").required(true).help("Package name"))
                .arg(Arg::new("version").required(true).help("Release version"))
                .arg(registry_url_arg()),
        )
        .subcommand(
            Command::new("log")
                .about("Show a project's activity log")
                .arg(Arg::new("project").required(true).help("Project slug"))
                .arg(
                    Arg::new("action")
                        .short('a')
                        .long("action")
                        .help("Only show one action (new_release, add_dependency, update_dependency)"),
                )
                .arg(db_path_arg()),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "elvish", "fish", "powershell", "zsh"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer)
        .expect("Failed to render man page");

    let man_path = man_dir.join("pinwatch.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");

    println!("cargo:warning=Man page generated at {}", man_path.display());
}
