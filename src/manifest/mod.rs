// src/manifest/mod.rs

//! Dependency manifest parsers
//!
//! This module turns user-supplied manifest text into a mapping of
//! package name to pinned version:
//! - Pip requirements files (`name==version` per line)
//! - Buildout `[versions]` sections (INI documents)
//!
//! Parsers never fail. Lines that cannot be turned into a pin are returned
//! in `ParseResult::missing` for the user to resolve by hand.

pub mod buildout;
pub mod requirements;

use crate::error::{Error, Result};
use std::collections::BTreeMap;

pub use buildout::BuildoutVersionsParser;
pub use requirements::PipRequirementsParser;

/// Outcome of parsing a manifest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseResult {
    /// Package name to pinned version
    pub packages: BTreeMap<String, String>,

    /// Entries that could not be pinned (package name or raw line)
    pub missing: Vec<String>,
}

/// Manifest format parser trait
pub trait ManifestParser: Sync {
    /// Stable identifier used to select this parser
    fn id(&self) -> &'static str;

    /// Human readable label
    fn title(&self) -> &'static str;

    /// Parse manifest lines into pins and unresolved entries
    fn parse(&self, lines: &[&str]) -> ParseResult;
}

/// Every supported format, in presentation order
static PARSERS: &[&dyn ManifestParser] = &[&PipRequirementsParser, &BuildoutVersionsParser];

/// Look up a parser by its identifier
pub fn get_parser(name: &str) -> Result<&'static dyn ManifestParser> {
    PARSERS
        .iter()
        .copied()
        .find(|p| p.id() == name)
        .ok_or_else(|| Error::NotFoundError(format!("Parser {} does not exist", name)))
}

/// `(id, label)` pairs for every supported format
pub fn get_parser_choices() -> Vec<(&'static str, &'static str)> {
    PARSERS.iter().map(|p| (p.id(), p.title())).collect()
}

/// Parse `lines` with the parser registered under `format`
pub fn parse(lines: &[&str], format: &str) -> Result<ParseResult> {
    Ok(get_parser(format)?.parse(lines))
}

/// Parse a whole manifest document with the parser registered under `format`
pub fn parse_str(content: &str, format: &str) -> Result<ParseResult> {
    let lines: Vec<&str> = content.lines().collect();
    parse(&lines, format)
}
