// src/manifest/requirements.rs

//! Pip requirements file parser
//!
//! Each non-comment line is a requirement specifier such as
//! `gunicorn==0.14.6`, `requests[socks]>=2.0,<3 ; python_version > "3"`.
//! Only exact `==` pins end up in the mapping.

use super::{ManifestParser, ParseResult};
use tracing::debug;

/// Version comparison operators, longest first so prefixes don't shadow them
const OPERATORS: &[&str] = &["===", "==", "!=", "<=", ">=", "~=", "<", ">"];

/// Pip requirements parser
#[derive(Debug, Clone, Copy, Default)]
pub struct PipRequirementsParser;

/// A parsed requirement specifier
#[derive(Debug, Clone, PartialEq, Eq)]
struct Requirement {
    /// Normalized project name
    name: String,

    /// `(operator, version)` pairs in declaration order
    specs: Vec<(String, String)>,
}

impl Requirement {
    /// Version of the first exact pin, if any
    fn pinned_version(&self) -> Option<&str> {
        self.specs
            .iter()
            .find(|(op, _)| op == "==")
            .map(|(_, version)| version.as_str())
    }
}

impl ManifestParser for PipRequirementsParser {
    fn id(&self) -> &'static str {
        "pip_requirements"
    }

    fn title(&self) -> &'static str {
        "Pip Requirements"
    }

    fn parse(&self, lines: &[&str]) -> ParseResult {
        let mut result = ParseResult::default();

        for raw in lines {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }

            match parse_requirement(line) {
                Some(req) => match req.pinned_version() {
                    Some(version) => {
                        result.packages.insert(req.name.clone(), version.to_string());
                    }
                    None => result.missing.push(req.name),
                },
                None => {
                    debug!("Unparseable requirement line: {}", raw.trim());
                    result.missing.push(raw.trim().to_string());
                }
            }
        }

        result
    }
}

/// Drop full-line comments and trailing ` #` comments
fn strip_comment(line: &str) -> &str {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return "";
    }
    match line.find(" #") {
        Some(pos) => &line[..pos],
        None => line,
    }
}

/// Normalize a project name: runs of characters other than ASCII
/// alphanumerics and `.` collapse into a single `-`
fn safe_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '.' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('-');
            in_run = true;
        }
    }
    out
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

fn is_version_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '*' | '+' | '!')
}

/// Parse a single requirement specifier
///
/// Returns `None` for anything that is not a plain requirement: pip
/// options (`-r`, `-e`, `--index-url`), URLs, dangling operators.
fn parse_requirement(line: &str) -> Option<Requirement> {
    let name_end = line.find(|c: char| !is_name_char(c)).unwrap_or(line.len());
    let name = &line[..name_end];
    if !name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        return None;
    }

    let mut rest = line[name_end..].trim_start();

    // Extras: name[extra1,extra2]
    if let Some(after) = rest.strip_prefix('[') {
        let close = after.find(']')?;
        let extras = &after[..close];
        let valid = extras
            .split(',')
            .map(str::trim)
            .all(|e| !e.is_empty() && e.chars().all(is_name_char));
        if !valid {
            return None;
        }
        rest = after[close + 1..].trim_start();
    }

    // Environment markers don't affect the pin
    if let Some(pos) = rest.find(';') {
        rest = rest[..pos].trim_end();
    }

    // Old-style parenthesized specs: name (>=1.0)
    if let Some(inner) = rest.strip_prefix('(') {
        rest = inner.strip_suffix(')')?.trim();
    }

    let mut specs = Vec::new();
    if !rest.is_empty() {
        for spec in rest.split(',') {
            specs.push(parse_spec(spec.trim())?);
        }
    }

    Some(Requirement {
        name: safe_name(name),
        specs,
    })
}

/// Parse one `op version` clause
fn parse_spec(spec: &str) -> Option<(String, String)> {
    let op = OPERATORS.iter().find(|op| spec.starts_with(**op))?;
    let version = spec[op.len()..].trim();
    if version.is_empty() || !version.chars().all(is_version_char) {
        return None;
    }
    Some((op.to_string(), version.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(lines: &[&str]) -> ParseResult {
        PipRequirementsParser.parse(lines)
    }

    #[test]
    fn test_exact_pin() {
        let result = parse(&["gunicorn==0.14.6"]);
        assert_eq!(result.packages.len(), 1);
        assert_eq!(result.packages["gunicorn"], "0.14.6");
        assert!(result.missing.is_empty());
    }

    #[test]
    fn test_unpinned_goes_to_missing_by_name() {
        let result = parse(&["gunicorn>=0.14"]);
        assert!(result.packages.is_empty());
        assert_eq!(result.missing, vec!["gunicorn"]);

        let result = parse(&["Django"]);
        assert!(result.packages.is_empty());
        assert_eq!(result.missing, vec!["Django"]);
    }

    #[test]
    fn test_blank_lines_and_comments_skipped() {
        let result = parse(&["", "   ", "# pinned for prod", "pmxbot==1101.8.0  # irc bot"]);
        assert_eq!(result.packages["pmxbot"], "1101.8.0");
        assert!(result.missing.is_empty());
    }

    #[test]
    fn test_unparseable_lines_keep_raw_text() {
        let result = parse(&[
            "-e git+https://github.com/example/project.git#egg=project",
            "-r base.txt",
            "foo==",
            "bar[unclosed==1.0",
        ]);
        assert!(result.packages.is_empty());
        assert_eq!(
            result.missing,
            vec![
                "-e git+https://github.com/example/project.git#egg=project",
                "-r base.txt",
                "foo==",
                "bar[unclosed==1.0",
            ]
        );
    }

    #[test]
    fn test_first_exact_pin_among_several_specs() {
        let result = parse(&["requests[socks, security] >= 2.0, ==2.28.1 ; python_version > '3'"]);
        assert_eq!(result.packages["requests"], "2.28.1");
        assert!(result.missing.is_empty());
    }

    #[test]
    fn test_arbitrary_equality_is_not_a_pin() {
        let result = parse(&["legacy===1.0-custom"]);
        assert!(result.packages.is_empty());
        assert_eq!(result.missing, vec!["legacy"]);
    }

    #[test]
    fn test_name_normalization() {
        let result = parse(&["zope_interface==4.0.1", "ruamel.yaml==0.17.21"]);
        assert_eq!(result.packages["zope-interface"], "4.0.1");
        assert_eq!(result.packages["ruamel.yaml"], "0.17.21");
    }

    #[test]
    fn test_parenthesized_specs() {
        let result = parse(&["Paste (==1.7.5.1)"]);
        assert_eq!(result.packages["Paste"], "1.7.5.1");
    }

    #[test]
    fn test_mixed_manifest() {
        let lines = [
            "Django==1.4.1",
            "South>=0.7",
            "--index-url https://pypi.org/simple",
            "celery==3.0.7",
        ];
        let result = parse(&lines);
        assert_eq!(result.packages.len(), 2);
        assert_eq!(result.packages["Django"], "1.4.1");
        assert_eq!(result.packages["celery"], "3.0.7");
        assert_eq!(
            result.missing,
            vec!["South", "--index-url https://pypi.org/simple"]
        );
    }

    #[test]
    fn test_safe_name() {
        assert_eq!(safe_name("foo__bar"), "foo-bar");
        assert_eq!(safe_name("foo-_-bar"), "foo-bar");
        assert_eq!(safe_name("Foo.Bar2"), "Foo.Bar2");
    }
}
