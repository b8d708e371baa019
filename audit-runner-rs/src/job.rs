//! Job controller
//!
//! One [`Job`] per accepted request. The controller validates the request, allocates
//! the artifact under a guard, launches the audit and hands the running process to
//! the delivery path chosen by [`DeliveryMode`]. Rejected requests never reach the
//! allocator or the launcher.

use std::convert::Infallible;
use std::fmt;
use std::process::ExitStatus;
use std::time::Instant;

use axum::body::Body;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use url::Url;

use crate::artifact::{Artifact, ArtifactAllocator, ArtifactGuard, OutputFormat};
use crate::error::{AuditError, AuditResult};
use crate::launcher::{AuditLauncher, AuditProcess};
use crate::relay::{self, normalize_line, EventStreamRelay, HtmlLogRelay};
use crate::validation::{validate_api_key, validate_target_url};

/// Lines of output quoted back in a buffered failure
const LOG_TAIL_LINES: usize = 20;

/// How the caller receives the result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Wait for the process, then return the report bytes
    Report,
    /// Progressive HTML page of the live output
    Log,
    /// Server-Sent Events of the live output
    Stream,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Report => "report",
            Self::Log => "log",
            Self::Stream => "stream",
        };
        f.write_str(name)
    }
}

/// A caller's audit request, as received; validated by [`JobController::run`]
#[derive(Debug, Clone)]
pub struct AuditRequest {
    pub target_url: Option<String>,
    pub output_format: Option<String>,
    pub mode: DeliveryMode,
    pub api_key: Option<String>,
    pub headless: bool,
}

impl AuditRequest {
    pub fn new(target_url: impl Into<String>, mode: DeliveryMode) -> Self {
        Self {
            target_url: Some(target_url.into()),
            output_format: None,
            mode,
            api_key: None,
            headless: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Succeeded,
    Failed,
}

/// State of one audit from launch to delivery
#[derive(Debug)]
pub struct Job {
    id: String,
    target: Url,
    mode: DeliveryMode,
    artifact: ArtifactGuard,
    state: JobState,
    log: Vec<String>,
    started: Instant,
}

impl Job {
    fn new(target: Url, mode: DeliveryMode, artifact: Artifact) -> Self {
        Self {
            id: artifact.job_id.clone(),
            target,
            mode,
            artifact: ArtifactGuard::new(artifact),
            state: JobState::Running,
            log: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    pub fn artifact(&self) -> &Artifact {
        self.artifact.artifact()
    }

    fn state(&self) -> JobState {
        self.state
    }

    /// Buffer a line of output for the failure message
    pub fn record(&mut self, line: String) {
        self.log.push(line);
    }

    pub fn log_tail(&self, lines: usize) -> String {
        let start = self.log.len().saturating_sub(lines);
        self.log[start..].join("\n")
    }

    /// Decide success from the exit status, the failure marker and the artifact
    async fn assess(&self, exit: AuditResult<ExitStatus>, saw_failure_marker: bool) -> AuditResult<()> {
        let status = exit?;
        if !status.success() {
            return Err(AuditError::AuditFailed(match status.code() {
                Some(code) => format!("Lighthouse exited with status {}", code),
                None => "Lighthouse was terminated by a signal".to_string(),
            }));
        }
        if saw_failure_marker {
            return Err(AuditError::AuditFailed(
                "Lighthouse reported an error".to_string(),
            ));
        }
        if !self.artifact.exists().await {
            return Err(AuditError::AuditFailed(format!(
                "report {} was not written",
                self.artifact().file_name
            )));
        }
        Ok(())
    }

    fn finish(&mut self, result: &AuditResult<()>) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        match result {
            Ok(()) => {
                self.state = JobState::Succeeded;
                info!(job_id = %self.id, url = %self.target, mode = %self.mode, state = ?self.state(), elapsed_ms, "Audit succeeded");
            }
            Err(e) => {
                self.state = JobState::Failed;
                warn!(job_id = %self.id, url = %self.target, mode = %self.mode, state = ?self.state(), elapsed_ms, error = %e, "Audit failed");
            }
        }
    }

    /// Terminal step for the relay modes: publish the artifact on success, delete it otherwise
    pub async fn conclude(
        mut self,
        exit: AuditResult<ExitStatus>,
        saw_failure_marker: bool,
    ) -> AuditResult<Artifact> {
        let result = self.assess(exit, saw_failure_marker).await;
        self.finish(&result);
        result?;

        let file_name = self.artifact().file_name.clone();
        self.artifact
            .publish()
            .await
            .map_err(|e| AuditError::DeliveryError(format!("publishing {}: {}", file_name, e)))
    }

    /// Terminal step for report mode: read the artifact into the response.
    /// The file is deleted when `self` drops, on every path out of here.
    pub async fn deliver(mut self, exit: AuditResult<ExitStatus>) -> AuditResult<Report> {
        let result = match self.assess(exit, false).await {
            Err(AuditError::AuditFailed(reason)) if !self.log.is_empty() => Err(
                AuditError::AuditFailed(format!("{}\n{}", reason, self.log_tail(LOG_TAIL_LINES))),
            ),
            other => other,
        };
        self.finish(&result);
        result?;

        let format = self.artifact().format;
        let bytes = tokio::fs::read(self.artifact.path()).await.map_err(|e| {
            AuditError::DeliveryError(format!("reading {}: {}", self.artifact().file_name, e))
        })?;

        Ok(Report {
            bytes,
            content_type: format.content_type(),
        })
    }
}

/// Finished report bytes, ready to send
#[derive(Debug)]
pub struct Report {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

impl IntoResponse for Report {
    fn into_response(self) -> Response {
        (StatusCode::OK, [(CONTENT_TYPE, self.content_type)], self.bytes).into_response()
    }
}

/// The response for one accepted request
pub enum Delivery {
    Report(Report),
    Stream(mpsc::Receiver<Event>),
    Log(mpsc::Receiver<String>),
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Report(report) => f.debug_tuple("Report").field(report).finish(),
            Self::Stream(_) => f.write_str("Stream"),
            Self::Log(_) => f.write_str("Log"),
        }
    }
}

impl IntoResponse for Delivery {
    fn into_response(self) -> Response {
        match self {
            Self::Report(report) => report.into_response(),
            Self::Stream(frames) => {
                let stream = ReceiverStream::new(frames).map(Ok::<_, Infallible>);
                Sse::new(stream)
                    .keep_alive(KeepAlive::default())
                    .into_response()
            }
            Self::Log(chunks) => {
                let stream = ReceiverStream::new(chunks).map(Ok::<_, Infallible>);
                (
                    [
                        (CONTENT_TYPE, "text/html; charset=utf-8"),
                        (CACHE_CONTROL, "no-cache"),
                    ],
                    Body::from_stream(stream),
                )
                    .into_response()
            }
        }
    }
}

/// Wires validation, allocation, launch and delivery together
#[derive(Debug)]
pub struct JobController {
    allocator: ArtifactAllocator,
    launcher: AuditLauncher,
    api_key: Option<String>,
}

impl JobController {
    pub fn new(allocator: ArtifactAllocator, launcher: AuditLauncher, api_key: Option<String>) -> Self {
        Self {
            allocator,
            launcher,
            api_key,
        }
    }

    pub fn allocator(&self) -> &ArtifactAllocator {
        &self.allocator
    }

    /// Run one request to completion (report mode) or until its stream is set up.
    ///
    /// `base_url` is the public origin used to build the report link for the relay modes.
    pub async fn run(&self, request: AuditRequest, base_url: &str) -> AuditResult<Delivery> {
        if request.mode == DeliveryMode::Report {
            validate_api_key(self.api_key.as_deref(), request.api_key.as_deref())?;
        }

        let (job, process) = self.start(&request)?;
        let report_url = format!(
            "{}/reports/{}",
            base_url.trim_end_matches('/'),
            job.artifact().file_name
        );

        match request.mode {
            DeliveryMode::Report => self.run_report(job, process).await.map(Delivery::Report),
            DeliveryMode::Stream => Ok(Delivery::Stream(self.run_stream(job, process, report_url))),
            DeliveryMode::Log => Ok(Delivery::Log(self.run_log(job, process, report_url))),
        }
    }

    fn start(&self, request: &AuditRequest) -> AuditResult<(Job, AuditProcess)> {
        let target = validate_target_url(request.target_url.as_deref())?;
        let format = OutputFormat::parse_or_default(request.output_format.as_deref())?;

        let artifact = self.allocator.allocate(format);
        info!(
            job_id = %artifact.job_id,
            url = %target,
            %format,
            mode = %request.mode,
            path = %artifact.path.display(),
            "Starting audit"
        );

        // The guard exists before the launch so a failed spawn still cleans up
        let job = Job::new(target, request.mode, artifact);
        let process = self.launcher.launch(
            job.target(),
            format,
            &job.artifact().path,
            request.headless,
        )?;
        Ok((job, process))
    }

    async fn run_report(&self, mut job: Job, mut process: AuditProcess) -> AuditResult<Report> {
        while let Some(line) = process.next_line().await {
            job.record(normalize_line(&line).into_owned());
        }
        let exit = process.wait().await;
        job.deliver(exit).await
    }

    fn run_stream(&self, job: Job, process: AuditProcess, report_url: String) -> mpsc::Receiver<Event> {
        relay::spawn(EventStreamRelay, job, process, report_url)
    }

    fn run_log(&self, job: Job, process: AuditProcess, report_url: String) -> mpsc::Receiver<String> {
        let relay = HtmlLogRelay::new(job.target().as_str());
        relay::spawn(relay, job, process, report_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::LauncherConfig;

    fn controller(dir: &std::path::Path) -> JobController {
        JobController::new(
            ArtifactAllocator::new(dir),
            AuditLauncher::new(LauncherConfig {
                program: "/nonexistent/lighthouse-binary".to_string(),
                ..LauncherConfig::default()
            }),
            Some("secret".to_string()),
        )
    }

    fn artifact_count(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn test_rejections_leave_no_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path());

        let mut request = AuditRequest::new("", DeliveryMode::Stream);
        let err = controller.run(request.clone(), "http://host").await.unwrap_err();
        assert!(matches!(err, AuditError::InvalidInput(_)));

        request.target_url = Some("https://example.com".to_string());
        request.output_format = Some("pdf".to_string());
        let err = controller.run(request, "http://host").await.unwrap_err();
        assert!(matches!(err, AuditError::UnsupportedFormat(_)));

        assert_eq!(artifact_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_report_mode_requires_key() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path());

        let request = AuditRequest::new("https://example.com", DeliveryMode::Report);
        let err = controller.run(request, "http://host").await.unwrap_err();
        assert!(matches!(err, AuditError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_launch_failure_surfaces_as_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path());

        let mut request = AuditRequest::new("https://example.com", DeliveryMode::Report);
        request.api_key = Some("secret".to_string());
        let err = controller.run(request, "http://host").await.unwrap_err();
        assert!(matches!(err, AuditError::LaunchError { .. }));
        assert_eq!(artifact_count(dir.path()), 0);
    }

    #[test]
    fn test_log_tail() {
        let artifact = ArtifactAllocator::new("/tmp/unused").allocate(OutputFormat::Json);
        let mut job = Job::new(
            Url::parse("https://example.com").unwrap(),
            DeliveryMode::Report,
            artifact,
        );
        for i in 0..30 {
            job.record(format!("line {}", i));
        }
        let tail = job.log_tail(3);
        assert_eq!(tail, "line 27\nline 28\nline 29");
        assert_eq!(job.state(), JobState::Running);
    }
}
