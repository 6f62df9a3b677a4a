// src/manifest/buildout.rs

//! Buildout versions parser
//!
//! The input is a complete INI document; only the `[versions]` section is
//! read. The document is parsed with the same rules as Python's
//! ConfigParser, which is what buildout itself uses:
//!
//! ```text
//! [buildout]
//! versions = versions
//!
//! [versions]
//! Django = 1.4.1
//! gunicorn: 0.14.6   ; web server
//! ```
//!
//! Malformed documents and documents without a `versions` section yield an
//! empty result rather than an error.

use super::{ManifestParser, ParseResult};
use std::collections::BTreeMap;
use tracing::debug;

/// Section holding the pins
const VERSIONS_SECTION: &str = "versions";

/// Section whose entries are visible in every other section
const DEFAULT_SECTION: &str = "DEFAULT";

/// Buildout versions parser
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildoutVersionsParser;

impl ManifestParser for BuildoutVersionsParser {
    fn id(&self) -> &'static str {
        "buildout_versions"
    }

    fn title(&self) -> &'static str {
        "Buildout Versions"
    }

    fn parse(&self, lines: &[&str]) -> ParseResult {
        let document = match IniDocument::parse(lines) {
            Ok(doc) => doc,
            Err(e) => {
                debug!("Ignoring malformed buildout document: {}", e);
                return ParseResult::default();
            }
        };

        match document.items(VERSIONS_SECTION) {
            Some(packages) => ParseResult {
                packages,
                missing: Vec::new(),
            },
            None => ParseResult::default(),
        }
    }
}

/// Parsed INI document: section name to lower-cased key/value pairs
#[derive(Debug, Default)]
struct IniDocument {
    defaults: BTreeMap<String, String>,
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl IniDocument {
    /// Parse INI lines, failing on the first line that is not a section
    /// header, comment, continuation or key/value pair
    fn parse(lines: &[&str]) -> std::result::Result<Self, String> {
        let mut doc = IniDocument::default();
        let mut current: Option<String> = None;
        let mut last_key: Option<String> = None;

        for (lineno, raw) in lines.iter().enumerate() {
            let line = raw.trim_end();
            let trimmed = line.trim_start();

            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }
            // "rem" comments are a ConfigParser quirk inherited from .ini files
            if trimmed.split_whitespace().next().is_some_and(|w| w.eq_ignore_ascii_case("rem")) {
                continue;
            }

            // Indented line continues the previous value
            if line.starts_with(char::is_whitespace) {
                if let (Some(section), Some(key)) = (&current, &last_key) {
                    let value = strip_inline_comment(trimmed);
                    if let Some(existing) = doc.section_mut(section).get_mut(key) {
                        existing.push('\n');
                        existing.push_str(value);
                    }
                    continue;
                }
            }

            if let Some(header) = trimmed.strip_prefix('[') {
                let name = header
                    .find(']')
                    .map(|end| &header[..end])
                    .ok_or_else(|| format!("line {}: unterminated section header", lineno + 1))?;
                doc.section_mut(name);
                current = Some(name.to_string());
                last_key = None;
                continue;
            }

            let section = current
                .as_ref()
                .ok_or_else(|| format!("line {}: entry before any section header", lineno + 1))?;

            let split = trimmed
                .find(['=', ':'])
                .ok_or_else(|| format!("line {}: expected key = value", lineno + 1))?;
            let key = trimmed[..split].trim().to_lowercase();
            if key.is_empty() {
                return Err(format!("line {}: empty key", lineno + 1));
            }
            let value = strip_inline_comment(trimmed[split + 1..].trim()).to_string();

            doc.section_mut(section).insert(key.clone(), value);
            last_key = Some(key);
        }

        Ok(doc)
    }

    /// Entries for a section, defaults included; `None` if the section is absent
    fn items(&self, section: &str) -> Option<BTreeMap<String, String>> {
        let own = self.sections.get(section)?;
        let mut merged = self.defaults.clone();
        merged.extend(own.iter().map(|(k, v)| (k.clone(), v.clone())));
        Some(merged)
    }

    fn section_mut(&mut self, name: &str) -> &mut BTreeMap<String, String> {
        if name == DEFAULT_SECTION {
            &mut self.defaults
        } else {
            self.sections.entry(name.to_string()).or_default()
        }
    }
}

/// Remove a `;` comment that follows whitespace
fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b';' && i > 0 && bytes[i - 1].is_ascii_whitespace() {
            return value[..i].trim_end();
        }
    }
    value
}
