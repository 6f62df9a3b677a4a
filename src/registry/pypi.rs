// src/registry/pypi.rs

//! PyPI registry client
//!
//! Uses the public PyPI endpoints:
//! - `/simple/` (JSON form) for the package list
//! - `/rss/updates.xml` and `/rss/packages.xml` for the changelog
//! - `/pypi/<name>/json` and `/pypi/<name>/<version>/json` for releases

use super::{ChangeKind, ChangelogEvent, PackageRelease, RegistryClient, ReleaseFile};
use crate::db::models::Provider;
use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::Event;
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default registry location
pub const DEFAULT_BASE_URL: &str = "https://pypi.org";

/// Default timeout for HTTP requests (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum attempts for a request that fails at the transport level
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds, multiplied by the attempt number
const RETRY_DELAY_MS: u64 = 1000;

/// How long a fetched changelog is reused when `force` is not set
const CHANGELOG_TTL: Duration = Duration::from_secs(300);

/// Media type for the JSON form of the simple index
const SIMPLE_JSON: &str = "application/vnd.pypi.simple.v1+json";

/// Connection settings for a PyPI-compatible registry
#[derive(Debug, Clone)]
pub struct PypiConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub changelog_ttl: Duration,
}

impl Default for PypiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: HTTP_TIMEOUT,
            max_retries: MAX_RETRIES,
            changelog_ttl: CHANGELOG_TTL,
        }
    }
}

impl PypiConfig {
    /// Default settings against a different base URL (mirrors, test servers)
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            ..Self::default()
        }
    }
}

/// Changelog events kept between calls
struct CachedChangelog {
    fetched_at: Instant,
    events: Vec<ChangelogEvent>,
}

/// HTTP client for PyPI with retry support
pub struct PypiClient {
    client: Client,
    config: PypiConfig,
    changelog_cache: Mutex<Option<CachedChangelog>>,
}

impl PypiClient {
    /// Create a new client
    pub fn new(config: PypiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("pinwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            changelog_cache: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// GET `url`, retrying transport failures with a linear backoff
    fn get(&self, url: &str, accept: Option<&str>) -> Result<Response> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut request = self.client.get(url);
            if let Some(accept) = accept {
                request = request.header(reqwest::header::ACCEPT, accept);
            }

            match request.send() {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::NOT_FOUND {
                        return Err(Error::NotFoundError(format!("{} returned 404", url)));
                    }
                    if !status.is_success() {
                        return Err(Error::DownloadError(format!("HTTP {} from {}", status, url)));
                    }
                    return Ok(response);
                }
                Err(e) => {
                    if attempt >= self.config.max_retries {
                        return Err(Error::DownloadError(format!(
                            "Failed to fetch {} after {} attempts: {}",
                            url, attempt, e
                        )));
                    }
                    warn!("Fetch attempt {} for {} failed: {}, retrying...", attempt, url, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }

    fn get_text(&self, url: &str) -> Result<String> {
        self.get(url, None)?
            .text()
            .map_err(|e| Error::DownloadError(format!("Failed to read {}: {}", url, e)))
    }

    fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str, accept: Option<&str>) -> Result<T> {
        self.get(url, accept)?
            .json()
            .map_err(|e| Error::ParseError(format!("Failed to parse JSON from {}: {}", url, e)))
    }

    /// Fetch both RSS feeds, oldest event first
    fn fetch_changelog(&self) -> Result<Vec<ChangelogEvent>> {
        let updates = self.get_text(&self.url("rss/updates.xml"))?;
        let packages = self.get_text(&self.url("rss/packages.xml"))?;

        let mut events = parse_feed(&updates, FeedKind::Updates)?;
        events.extend(parse_feed(&packages, FeedKind::Packages)?);
        events.sort_by_key(|e| e.timestamp);

        info!("Fetched {} changelog events", events.len());
        Ok(events)
    }
}

impl RegistryClient for PypiClient {
    fn provider(&self) -> Provider {
        Provider::Pypi
    }

    fn package_url(&self, name: &str) -> String {
        self.url(&format!("project/{}/", name))
    }

    fn list_packages(&self) -> Result<Vec<String>> {
        let index: SimpleIndex = self.get_json(&self.url("simple/"), Some(SIMPLE_JSON))?;
        Ok(index.projects.into_iter().map(|p| p.name).collect())
    }

    fn get_changelog(&self, since_hours: u32, force: bool) -> Result<Vec<ChangelogEvent>> {
        let mut cache = self
            .changelog_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let fresh = cache
            .as_ref()
            .is_some_and(|c| c.fetched_at.elapsed() < self.config.changelog_ttl);

        if force || !fresh {
            let events = self.fetch_changelog()?;
            *cache = Some(CachedChangelog {
                fetched_at: Instant::now(),
                events,
            });
        } else {
            debug!("Using cached changelog");
        }

        let cutoff = Utc::now() - chrono::Duration::hours(i64::from(since_hours));
        let events = cache
            .as_ref()
            .map(|c| window(&c.events, cutoff))
            .unwrap_or_default();
        Ok(events)
    }

    fn get_package_versions(&self, name: &str) -> Result<Vec<PackageRelease>> {
        let project: ProjectJson = self.get_json(&self.url(&format!("pypi/{}/json", name)), None)?;
        Ok(releases_from_project(project))
    }

    fn get_release_urls(&self, name: &str, version: &str) -> Result<Vec<ReleaseFile>> {
        let release: ProjectJson =
            self.get_json(&self.url(&format!("pypi/{}/{}/json", name, version)), None)?;
        Ok(release.urls.into_iter().map(WireFile::into_release_file).collect())
    }
}

/// Events at or after `cutoff`
fn window(events: &[ChangelogEvent], cutoff: DateTime<Utc>) -> Vec<ChangelogEvent> {
    events
        .iter()
        .filter(|e| e.timestamp >= cutoff)
        .cloned()
        .collect()
}

/// Which RSS feed is being parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedKind {
    /// `updates.xml`: one item per new release
    Updates,

    /// `packages.xml`: one item per newly registered project
    Packages,
}

/// RSS item fields we care about
#[derive(Debug, Default)]
struct FeedItem {
    title: Option<String>,
    link: Option<String>,
    pub_date: Option<String>,
}

impl FeedItem {
    /// Convert to a changelog event; items without a usable date or name
    /// are dropped
    fn into_event(self, kind: FeedKind) -> Option<ChangelogEvent> {
        let pub_date = self.pub_date?;
        let timestamp = match DateTime::parse_from_rfc2822(pub_date.trim()) {
            Ok(date) => date.with_timezone(&Utc),
            Err(e) => {
                warn!("Skipping feed item with bad pubDate {}: {}", pub_date, e);
                return None;
            }
        };

        let (name, version) = self
            .link
            .as_deref()
            .and_then(name_and_version_from_link)
            .or_else(|| {
                let title = self.title.as_deref()?.trim();
                match kind {
                    FeedKind::Updates => title
                        .split_once(' ')
                        .map(|(n, v)| (n.to_string(), Some(v.trim().to_string()))),
                    FeedKind::Packages => title
                        .split_whitespace()
                        .next()
                        .map(|n| (n.to_string(), None)),
                }
            })?;

        let (kind, version) = match kind {
            FeedKind::Updates => (ChangeKind::NewRelease, Some(version?)),
            FeedKind::Packages => (ChangeKind::Create, None),
        };

        Some(ChangelogEvent {
            package_name: name,
            version,
            timestamp,
            kind,
        })
    }
}

/// Extract `(name, version)` from `.../project/<name>/[<version>/]`
fn name_and_version_from_link(link: &str) -> Option<(String, Option<String>)> {
    let (_, path) = link.split_once("/project/")?;
    let mut parts = path.split('/').filter(|p| !p.is_empty());
    let name = parts.next()?.to_string();
    let version = parts.next().map(str::to_string);
    Some((name, version))
}

/// Parse an RSS document into changelog events
fn parse_feed(xml: &str, kind: FeedKind) -> Result<Vec<ChangelogEvent>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut events = Vec::new();
    let mut buf = Vec::new();
    let mut current: Option<FeedItem> = None;
    let mut current_tag = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag == "item" {
                    current = Some(FeedItem::default());
                }
                current_tag = tag;
            }
            Ok(Event::Text(e)) => {
                if let Some(ref mut item) = current {
                    let text = e.unescape().unwrap_or_default().to_string();
                    match current_tag.as_str() {
                        "title" => item.title = Some(text),
                        "link" => item.link = Some(text),
                        "pubDate" => item.pub_date = Some(text),
                        _ => {}
                    }
                }
            }
            Ok(Event::CData(e)) => {
                if let Some(ref mut item) = current {
                    let text = String::from_utf8_lossy(&e.into_inner()).to_string();
                    if current_tag == "title" {
                        item.title = Some(text);
                    }
                }
            }
            Ok(Event::End(e)) => {
                if e.name().as_ref() == b"item" {
                    if let Some(item) = current.take() {
                        if let Some(event) = item.into_event(kind) {
                            events.push(event);
                        }
                    }
                }
                current_tag.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(Error::ParseError(format!(
                    "Failed to parse RSS feed at position {}: {}",
                    reader.buffer_position(),
                    e
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    debug!("Parsed {} events from {:?} feed", events.len(), kind);
    Ok(events)
}

/// JSON form of the simple index
#[derive(Debug, Deserialize)]
struct SimpleIndex {
    projects: Vec<SimpleProject>,
}

#[derive(Debug, Deserialize)]
struct SimpleProject {
    name: String,
}

/// Subset of the project / release JSON documents
#[derive(Debug, Deserialize)]
struct ProjectJson {
    #[serde(default)]
    releases: BTreeMap<String, Vec<WireFile>>,
    #[serde(default)]
    urls: Vec<WireFile>,
}

#[derive(Debug, Default, Deserialize)]
struct WireDigests {
    md5: Option<String>,
    sha256: Option<String>,
}

/// A release file as PyPI serializes it
#[derive(Debug, Deserialize)]
struct WireFile {
    filename: String,
    #[serde(default)]
    packagetype: String,
    #[serde(default)]
    size: u64,
    md5_digest: Option<String>,
    #[serde(default)]
    digests: WireDigests,
    upload_time: Option<String>,
    upload_time_iso_8601: Option<String>,
    url: String,
}

impl WireFile {
    /// Upload time normalized to UTC
    ///
    /// `upload_time` has no offset; PyPI records it in UTC.
    fn uploaded_at(&self) -> Option<DateTime<Utc>> {
        if let Some(iso) = &self.upload_time_iso_8601 {
            if let Ok(date) = DateTime::parse_from_rfc3339(iso) {
                return Some(date.with_timezone(&Utc));
            }
        }
        let naive = self.upload_time.as_deref()?;
        NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M:%S")
            .ok()
            .map(|d| d.and_utc())
    }

    fn into_release_file(self) -> ReleaseFile {
        let upload_time = self.uploaded_at();
        ReleaseFile {
            filename: self.filename,
            package_type: self.packagetype,
            size: self.size,
            md5_digest: self.md5_digest.or(self.digests.md5),
            sha256_digest: self.digests.sha256,
            upload_time,
            url: self.url,
        }
    }
}

/// Releases ordered by their earliest upload; undated releases go last
fn releases_from_project(project: ProjectJson) -> Vec<PackageRelease> {
    let mut releases: Vec<PackageRelease> = project
        .releases
        .into_iter()
        .map(|(version, files)| PackageRelease {
            released_at: files.iter().filter_map(WireFile::uploaded_at).min(),
            version,
        })
        .collect();

    releases.sort_by(|a, b| match (a.released_at, b.released_at) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.version.cmp(&b.version)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.version.cmp(&b.version),
    });

    releases
}
