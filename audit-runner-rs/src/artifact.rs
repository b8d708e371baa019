//! Report artifacts
//!
//! Naming is a pure decision: `report-<utc timestamp>-<counter>.<ext>`. The
//! counter is shared by every job of the process, so two live jobs never receive
//! the same path even when allocated within the same millisecond.
//!
//! Lighthouse writes into `<dir>/pending`, which is never served. Only
//! [`ArtifactGuard::publish`] moves a finished report into `<dir>/published`, the
//! directory behind `/reports`. A guard that is dropped without publishing deletes
//! its file.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::AuditError;

/// Report formats understood by the Lighthouse CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Html = 0,
    Json = 1,
    Csv = 2,
    Pretty = 3,
}

struct FormatEntry {
    format: OutputFormat,
    token: &'static str,
    extension: &'static str,
    content_type: &'static str,
}

/// Format table, indexed by discriminant. `pretty` is the one format whose
/// on-disk extension differs from its name.
const FORMAT_TABLE: [FormatEntry; 4] = [
    FormatEntry {
        format: OutputFormat::Html,
        token: "html",
        extension: "html",
        content_type: "text/html; charset=utf-8",
    },
    FormatEntry {
        format: OutputFormat::Json,
        token: "json",
        extension: "json",
        content_type: "application/json",
    },
    FormatEntry {
        format: OutputFormat::Csv,
        token: "csv",
        extension: "csv",
        content_type: "text/csv; charset=utf-8",
    },
    FormatEntry {
        format: OutputFormat::Pretty,
        token: "pretty",
        extension: "txt",
        content_type: "text/plain; charset=utf-8",
    },
];

impl OutputFormat {
    pub const ALL: [OutputFormat; 4] = [
        OutputFormat::Html,
        OutputFormat::Json,
        OutputFormat::Csv,
        OutputFormat::Pretty,
    ];

    fn entry(self) -> &'static FormatEntry {
        &FORMAT_TABLE[self as usize]
    }

    /// Value passed to `--output=`
    pub fn token(self) -> &'static str {
        self.entry().token
    }

    pub fn extension(self) -> &'static str {
        self.entry().extension
    }

    pub fn content_type(self) -> &'static str {
        self.entry().content_type
    }

    /// Parse an optional caller-supplied token; absent or blank means the default
    pub fn parse_or_default(raw: Option<&str>) -> Result<Self, AuditError> {
        match raw.map(str::trim) {
            None | Some("") => Ok(Self::default()),
            Some(token) => token.parse(),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FORMAT_TABLE
            .iter()
            .find(|entry| entry.token.eq_ignore_ascii_case(s))
            .map(|entry| entry.format)
            .ok_or_else(|| {
                AuditError::UnsupportedFormat(format!(
                    "'{}' (expected one of: {})",
                    s,
                    FORMAT_TABLE
                        .iter()
                        .map(|entry| entry.token)
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

const PENDING_DIR: &str = "pending";
const PUBLISHED_DIR: &str = "published";

/// A named, not yet written, report location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub job_id: String,
    pub file_name: String,
    /// Where Lighthouse writes the report
    pub path: PathBuf,
    /// Where the report lives once published
    pub published_path: PathBuf,
    pub format: OutputFormat,
}

/// Hands out unique artifact paths inside one directory
#[derive(Debug)]
pub struct ArtifactAllocator {
    pending_dir: PathBuf,
    published_dir: PathBuf,
    counter: AtomicU64,
}

impl ArtifactAllocator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            pending_dir: dir.join(PENDING_DIR),
            published_dir: dir.join(PUBLISHED_DIR),
            counter: AtomicU64::new(0),
        }
    }

    /// Directory of published reports, served under `/reports`
    pub fn published_dir(&self) -> &Path {
        &self.published_dir
    }

    /// Create the artifact directories; called once at startup
    pub async fn prepare(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.pending_dir).await?;
        tokio::fs::create_dir_all(&self.published_dir).await
    }

    pub fn allocate(&self, format: OutputFormat) -> Artifact {
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed);
        let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3f");
        let job_id = format!("{}-{:06}", timestamp, sequence);
        let file_name = format!("report-{}.{}", job_id, format.extension());

        Artifact {
            path: self.pending_dir.join(&file_name),
            published_path: self.published_dir.join(&file_name),
            job_id,
            file_name,
            format,
        }
    }
}

/// Scoped ownership of an artifact file
#[derive(Debug)]
pub struct ArtifactGuard {
    artifact: Artifact,
    keep: bool,
}

impl ArtifactGuard {
    pub fn new(artifact: Artifact) -> Self {
        Self {
            artifact,
            keep: false,
        }
    }

    pub fn artifact(&self) -> &Artifact {
        &self.artifact
    }

    pub fn path(&self) -> &Path {
        &self.artifact.path
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::metadata(&self.artifact.path)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }

    /// Move the finished report where `/reports` can serve it and release ownership.
    /// On error the guard still drops and removes the unpublished file.
    pub async fn publish(mut self) -> std::io::Result<Artifact> {
        tokio::fs::rename(&self.artifact.path, &self.artifact.published_path).await?;
        self.keep = true;
        tracing::debug!(path = %self.artifact.published_path.display(), "Artifact published");
        Ok(self.artifact.clone())
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match std::fs::remove_file(&self.artifact.path) {
            Ok(()) => tracing::debug!(path = %self.artifact.path.display(), "Artifact removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.artifact.path.display(),
                error = %e,
                "Failed to remove artifact"
            ),
        }
    }
}
