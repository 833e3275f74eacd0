use crate::profile::CapabilityProfile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

pub const CONTENT_SCHEME: &str = "content://";
pub const FILE_SCHEME: &str = "file://";
pub const DATA_SCHEME: &str = "data:";
pub const BLOB_SCHEME: &str = "blob:";

const BROWSER_SCHEMES: [&str; 4] = ["http://", "https://", DATA_SCHEME, BLOB_SCHEME];

/// Returns what follows `scheme` at the start of `raw`. Schemes match
/// case-insensitively.
pub fn strip_scheme<'a>(raw: &'a str, scheme: &str) -> Option<&'a str> {
    let prefix = raw.get(..scheme.len())?;
    prefix
        .eq_ignore_ascii_case(scheme)
        .then(|| &raw[scheme.len()..])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleScheme {
    ContentProvider,
    FilePath,
    /// Anything the browser can load by itself: http(s), `data:` and `blob:` sources.
    RemoteUrl,
}

/// Image reference exactly as the picker handed it over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHandle {
    pub scheme: HandleScheme,
    pub raw: String,
}

impl ImageHandle {
    pub fn new(scheme: HandleScheme, raw: impl Into<String>) -> Self {
        Self {
            scheme,
            raw: raw.into(),
        }
    }

    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let scheme = if strip_scheme(&raw, CONTENT_SCHEME).is_some() {
            HandleScheme::ContentProvider
        } else if BROWSER_SCHEMES
            .iter()
            .any(|browser| strip_scheme(&raw, browser).is_some())
        {
            HandleScheme::RemoteUrl
        } else {
            HandleScheme::FilePath
        };
        Self::new(scheme, raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedHandle {
    LocalPath(PathBuf),
    /// Loaded by the remote image loader instead of the file system.
    Remote(String),
}

impl ResolvedHandle {
    pub fn describe(&self) -> String {
        match self {
            Self::LocalPath(path) => path.display().to_string(),
            Self::Remote(url) => url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub probability: f32,
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {}%",
            self.label,
            (self.probability * 100.0).round() as i64
        )
    }
}

/// Outcome of one successful classification request.
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationReport {
    pub request_id: Uuid,
    pub source: String,
    pub profile: CapabilityProfile,
    pub predictions: Vec<Prediction>,
    pub completed_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}
