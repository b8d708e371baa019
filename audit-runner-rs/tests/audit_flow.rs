#![cfg(unix)]
//! End-to-end audit flows against a shell script standing in for Lighthouse.
//!
//! The script records `started-<pid>` in the scenario directory, prints three log
//! lines and then behaves according to the target URL:
//! `fail` exits non-zero, `broken` prints an `Error:` line, `slow` writes a partial
//! report, sleeps and leaves a `finished-<pid>` marker, `spawner` starts a background
//! child that leaves a `child-alive` marker two seconds later.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use audit_runner::{AuditRunner, AuditRunnerConfig, LauncherConfig};
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use futures_util::StreamExt;
use tempfile::TempDir;
use tower::ServiceExt;

const API_KEY: &str = "secret";

const FAKE_LIGHTHOUSE: &str = r#"#!/bin/sh
dir="$1"
url="$2"
shift 2
out=""
fmt=""
for arg in "$@"; do
  case "$arg" in
    --output-path=*) out="${arg#--output-path=}" ;;
    --output=*) fmt="${arg#--output=}" ;;
  esac
done
touch "$dir/started-$$"
echo "Thu, 01 Jan 2026 10:00:00 GMT L1" >&2
echo "L2" >&2
echo "L3" >&2
case "$url" in
  *fail*)
    printf 'partial' > "$out"
    exit 2
    ;;
  *broken*)
    echo "Error: timeout waiting for page load" >&2
    ;;
  *slow*)
    printf 'partial' > "$out"
    sleep 2
    touch "$dir/finished-$$"
    ;;
  *spawner*)
    (sleep 2; touch "$dir/child-alive") >/dev/null 2>&1 &
    sleep 30
    ;;
esac
printf '{"url":"%s","format":"%s"}' "$url" "$fmt" > "$out"
"#;

struct Harness {
    router: Router,
    scenario: TempDir,
    artifacts: TempDir,
}

impl Harness {
    async fn new() -> Self {
        let scenario = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let script = scenario.path().join("fake-lighthouse.sh");
        std::fs::write(&script, FAKE_LIGHTHOUSE).unwrap();

        let config = AuditRunnerConfig {
            artifact_dir: artifacts.path().to_path_buf(),
            api_key: Some(API_KEY.to_string()),
            launcher: LauncherConfig {
                program: "sh".to_string(),
                leading_args: vec![
                    script.display().to_string(),
                    scenario.path().display().to_string(),
                ],
                timeout: Duration::from_secs(30),
                ..LauncherConfig::default()
            },
            ..AuditRunnerConfig::default()
        };

        let runner = Arc::new(AuditRunner::new(config));
        runner.prepare().await.unwrap();
        let router = runner.create_router();
        Self {
            router,
            scenario,
            artifacts,
        }
    }

    async fn send(&self, request: Request<Body>) -> axum::response::Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Report files in any state, pending or published
    fn artifact_files(&self) -> Vec<PathBuf> {
        let mut files = self.pending_files();
        files.extend(list(&self.artifacts.path().join("published")));
        files
    }

    fn pending_files(&self) -> Vec<PathBuf> {
        list(&self.artifacts.path().join("pending"))
    }

    fn markers(&self, prefix: &str) -> usize {
        list(self.scenario.path())
            .iter()
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map_or(false, |name| name.starts_with(prefix))
            })
            .count()
    }
}

fn list(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect()
}

fn post_ci(body: serde_json::Value, key: Option<&str>) -> Request<Body> {
    let mut builder = Request::post("/ci").header(header::CONTENT_TYPE, "application/json");
    if let Some(key) = key {
        builder = builder.header("x-api-key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri)
        .header(header::HOST, "audit.test")
        .body(Body::empty())
        .unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// `data:` payloads of a complete SSE body, in order
fn sse_data(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")))
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn buffered_report_is_returned_then_deleted() {
    let harness = Harness::new().await;

    let response = harness
        .send(post_ci(
            serde_json::json!({"url": "https://example.com/ok", "format": "json"}),
            Some(API_KEY),
        ))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
    let body = body_text(response).await;
    assert_eq!(body, r#"{"url":"https://example.com/ok","format":"json"}"#);

    assert!(harness.artifact_files().is_empty(), "artifact survived the response");
    assert_eq!(harness.markers("started-"), 1);
}

#[tokio::test]
async fn missing_url_starts_nothing() {
    let harness = Harness::new().await;

    let response = harness
        .send(post_ci(serde_json::json!({"url": ""}), Some(API_KEY)))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = harness.send(get("/stream")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert_eq!(harness.markers("started-"), 0);
    assert!(harness.artifact_files().is_empty());
}

#[tokio::test]
async fn unsupported_format_is_rejected() {
    let harness = Harness::new().await;

    let response = harness
        .send(get("/stream?url=https://example.com/ok&format=pdf"))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_text(response).await.contains("pdf"));
    assert_eq!(harness.markers("started-"), 0);
}

#[tokio::test]
async fn wrong_api_key_is_forbidden() {
    let harness = Harness::new().await;

    let response = harness
        .send(post_ci(
            serde_json::json!({"url": "https://example.com/ok"}),
            Some("guess"),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(harness.markers("started-"), 0);
}

#[tokio::test]
async fn failed_buffered_audit_is_server_error_without_artifact() {
    let harness = Harness::new().await;

    let response = harness
        .send(post_ci(
            serde_json::json!({"url": "https://example.com/fail"}),
            Some(API_KEY),
        ))
        .await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_text(response).await;
    assert!(body.contains("exited with status 2"), "{}", body);
    assert!(body.contains("L3"), "log tail missing: {}", body);
    assert!(harness.artifact_files().is_empty(), "partial artifact survived");
}

#[tokio::test]
async fn stream_relays_lines_then_done() {
    let harness = Harness::new().await;

    let response = harness
        .send(get("/stream?url=https://example.com/ok&format=json"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let events = sse_data(&body_text(response).await);
    assert_eq!(events.len(), 4, "{:?}", events);
    assert_eq!(&events[..3], ["L1", "L2", "L3"]);

    let report_url = events[3]
        .strip_prefix("done ")
        .expect("final event is done");
    let report_path = report_url
        .strip_prefix("http://audit.test")
        .expect("report url uses the request host");
    assert!(report_path.starts_with("/reports/report-"));
    assert!(report_path.ends_with(".json"));

    // Kept for static retrieval
    assert_eq!(harness.artifact_files().len(), 1);
    let response = harness.send(get(report_path)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await.contains("https://example.com/ok"));
}

#[tokio::test]
async fn stream_with_error_line_ends_in_error_event() {
    let harness = Harness::new().await;

    let response = harness.send(get("/stream?url=https://example.com/broken")).await;
    let events = sse_data(&body_text(response).await);

    assert_eq!(&events[..3], ["L1", "L2", "L3"]);
    let last = events.last().unwrap();
    assert!(last.starts_with("error "), "{}", last);
    assert!(!events.iter().any(|event| event.starts_with("done ")));
    assert!(harness.artifact_files().is_empty());
}

#[tokio::test]
async fn repeated_submissions_use_distinct_artifacts() {
    let harness = Harness::new().await;

    let first = sse_data(&body_text(harness.send(get("/stream?url=https://example.com/ok")).await).await);
    let second = sse_data(&body_text(harness.send(get("/stream?url=https://example.com/ok")).await).await);

    let first = first.last().unwrap();
    let second = second.last().unwrap();
    assert!(first.starts_with("done ") && second.starts_with("done "));
    assert_ne!(first, second);
    assert_eq!(harness.artifact_files().len(), 2);
    assert_eq!(harness.markers("started-"), 2);
}

#[tokio::test]
async fn log_mode_renders_progressive_html() {
    let harness = Harness::new().await;

    let response = harness.send(get("/log?url=https://example.com/ok")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/html; charset=utf-8"
    );

    let page = body_text(response).await;
    assert!(page.contains("<pre id=\"log\">"));
    let l1 = page.find("L1\n").unwrap();
    let l3 = page.find("L3\n").unwrap();
    assert!(l1 < l3);
    assert!(page.contains("href=\"http://audit.test/reports/report-"));
    assert!(page.ends_with("</body></html>\n"));
    assert_eq!(harness.artifact_files().len(), 1);
}

#[tokio::test]
async fn disconnect_kills_audit_and_removes_artifact() {
    let harness = Harness::new().await;

    let response = harness.send(get("/stream?url=https://example.com/slow")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let mut frames = response.into_body().into_data_stream();
    let first = frames.next().await.unwrap().unwrap();
    assert!(String::from_utf8_lossy(&first).contains("L1"));
    drop(frames);

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(harness.markers("started-"), 1);
    assert_eq!(harness.markers("finished-"), 0, "audit ran to completion");
    assert!(harness.artifact_files().is_empty());
}

#[tokio::test]
async fn disconnect_kills_processes_spawned_by_the_audit() {
    let harness = Harness::new().await;

    let response = harness.send(get("/stream?url=https://example.com/spawner")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let mut frames = response.into_body().into_data_stream();
    let first = frames.next().await.unwrap().unwrap();
    assert!(String::from_utf8_lossy(&first).contains("L1"));
    drop(frames);

    tokio::time::sleep(Duration::from_secs(4)).await;

    assert_eq!(harness.markers("child-alive"), 0, "spawned child outlived the audit");
    assert!(harness.artifact_files().is_empty());
}

#[tokio::test]
async fn running_audit_report_is_not_served() {
    let harness = Harness::new().await;

    let response = harness.send(get("/stream?url=https://example.com/slow")).await;
    let mut frames = response.into_body().into_data_stream();
    let first = frames.next().await.unwrap().unwrap();
    assert!(String::from_utf8_lossy(&first).contains("L1"));

    let mut pending = harness.pending_files();
    for _ in 0..50 {
        if !pending.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        pending = harness.pending_files();
    }
    assert_eq!(pending.len(), 1);
    let file_name = pending[0].file_name().unwrap().to_str().unwrap().to_string();

    let response = harness.send(get(&format!("/reports/{}", file_name))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = harness
        .send(get(&format!("/reports/../pending/{}", file_name)))
        .await;
    assert_ne!(response.status(), StatusCode::OK);

    // Once the audit succeeds the same name is published
    let mut rest = Vec::new();
    while let Some(frame) = frames.next().await {
        rest.extend_from_slice(&frame.unwrap());
    }
    let events = sse_data(&String::from_utf8(rest).unwrap());
    let done = events.last().unwrap();
    assert!(done.ends_with(&format!("/reports/{}", file_name)), "{}", done);

    assert!(harness.pending_files().is_empty());
    let response = harness.send(get(&format!("/reports/{}", file_name))).await;
    assert_eq!(response.status(), StatusCode::OK);
}
