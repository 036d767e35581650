//! The target file: which pages should be watched.
//!
//! Two formats are accepted and detected by content:
//!
//! * a JSON array whose items are either bare URL strings or objects
//!   `{ "url": "...", "selector": "..." }` or `{ "url": "...", "xpath": "..." }`.
//!   `selector` is a CSS selector, `xpath` an XPath expression; an entry may
//!   carry at most one of them;
//! * anything else is read as one URL per line.  Blank lines and lines
//!   starting with `#` are skipped.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Deserialize;
use tracing::warn;

use crate::error::SourceError;

/// Which part of a page a target's fingerprint covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Css(String),
    XPath(String),
}

impl Selector {
    pub fn expression(&self) -> &str {
        match self {
            Self::Css(expr) | Self::XPath(expr) => expr,
        }
    }
}

/// A single monitored page.  Identity is the URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub url: String,
    pub selector: Option<Selector>,
}

impl Target {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            selector: None,
        }
    }

    pub fn with_selector(url: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            selector: Some(Selector::Css(selector.into())),
        }
    }

    pub fn with_xpath(url: impl Into<String>, xpath: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            selector: Some(Selector::XPath(xpath.into())),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTarget {
    Url(String),
    Entry {
        url: String,
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        xpath: Option<String>,
    },
}

/// Cheap change detector for the target file: last-write time plus length.
/// Two edits inside the same timestamp tick still differ when the size does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceMarker {
    pub modified: Option<SystemTime>,
    pub len: u64,
}

#[derive(Debug, Clone)]
pub struct TargetSource {
    path: PathBuf,
}

impl TargetSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current modification marker, `None` while the file does not exist.
    pub fn marker(&self) -> Option<SourceMarker> {
        let meta = fs::metadata(&self.path).ok()?;
        Some(SourceMarker {
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }

    /// Read and parse the whole file.
    pub fn load(&self) -> Result<Vec<Target>, SourceError> {
        let raw = fs::read_to_string(&self.path).map_err(|source| SourceError::Io {
            path: self.path.clone(),
            source,
        })?;
        parse_targets(&raw, &self.path)
    }
}

/// Parse target file contents.  `path` is only used in error messages.
pub fn parse_targets(raw: &str, path: &Path) -> Result<Vec<Target>, SourceError> {
    let candidates = if raw.trim_start().starts_with('[') {
        let entries: Vec<RawTarget> =
            serde_json::from_str(raw).map_err(|source| SourceError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        entries
            .into_iter()
            .map(|entry| match entry {
                RawTarget::Url(url) => (url, None, None),
                RawTarget::Entry {
                    url,
                    selector,
                    xpath,
                } => (url, selector, xpath),
            })
            .collect::<Vec<_>>()
    } else {
        raw.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| (line.to_string(), None, None))
            .collect()
    };

    let mut seen = HashSet::new();
    let mut targets = Vec::with_capacity(candidates.len());
    for (url, css, xpath) in candidates {
        let url = url.trim().to_string();
        if url.is_empty() {
            return Err(SourceError::InvalidTarget {
                path: path.to_path_buf(),
                reason: "target with an empty url".to_string(),
            });
        }
        if !seen.insert(url.clone()) {
            warn!(url = %url, "duplicate target in target file; keeping the first entry");
            continue;
        }
        let selector = match (non_blank(css), non_blank(xpath)) {
            (None, None) => None,
            (Some(css), None) => Some(Selector::Css(css)),
            (None, Some(xpath)) => Some(Selector::XPath(xpath)),
            (Some(_), Some(_)) => {
                return Err(SourceError::InvalidTarget {
                    path: path.to_path_buf(),
                    reason: format!("{url}: give either selector or xpath, not both"),
                });
            }
        };
        targets.push(Target { url, selector });
    }
    Ok(targets)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}
