//! Output multiplexer
//!
//! A single coordinating task per job reads the process output in order, hands
//! each line to a [`Relay`] strategy and pushes the resulting frames into a bounded
//! channel that backs the HTTP response body. When the caller goes away the
//! channel closes; the task then returns, which drops the process handle (killing
//! the child) and the job (deleting its artifact).

use std::borrow::Cow;

use axum::response::sse::Event;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::job::Job;
use crate::launcher::AuditProcess;

/// Substring that marks a failed audit even when the process exits cleanly
pub const FAILURE_MARKER: &str = "Error:";

const FRAME_BUFFER: usize = 64;

static TIMESTAMP_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^.*?GMT\s+").expect("timestamp pattern is valid"));

/// How a job ended, as reported to a streaming caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded { report_url: String },
    Failed { reason: String },
}

/// Delivery strategy for live output
pub trait Relay: Send + 'static {
    type Frame: Send + 'static;

    /// Frame sent before any output
    fn open(&mut self) -> Option<Self::Frame> {
        None
    }

    fn line(&mut self, line: &str) -> Self::Frame;

    fn close(&mut self, outcome: &JobOutcome) -> Vec<Self::Frame>;
}

/// Server-Sent Events: one `data:` event per line, then `done <url>` or `error <reason>`
#[derive(Debug, Default)]
pub struct EventStreamRelay;

impl Relay for EventStreamRelay {
    type Frame = Event;

    fn line(&mut self, line: &str) -> Event {
        Event::default().data(line)
    }

    fn close(&mut self, outcome: &JobOutcome) -> Vec<Event> {
        vec![Event::default().data(terminal_message(outcome))]
    }
}

/// Text carried by the final stream event
pub fn terminal_message(outcome: &JobOutcome) -> String {
    match outcome {
        JobOutcome::Succeeded { report_url } => format!("done {}", report_url),
        JobOutcome::Failed { reason } => format!("error {}", single_line(reason)),
    }
}

/// Progressive HTML page: escaped log lines in a `<pre>`, then a link to the report
#[derive(Debug)]
pub struct HtmlLogRelay {
    title: String,
}

impl HtmlLogRelay {
    pub fn new(target: &str) -> Self {
        Self {
            title: format!("Lighthouse: {}", target),
        }
    }
}

impl Relay for HtmlLogRelay {
    type Frame = String;

    fn open(&mut self) -> Option<String> {
        Some(format!(
            "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{}</title></head>\n<body>\n<pre id=\"log\">\n",
            escape_html(&self.title)
        ))
    }

    fn line(&mut self, line: &str) -> String {
        format!("{}\n", escape_html(line))
    }

    fn close(&mut self, outcome: &JobOutcome) -> Vec<String> {
        let tail = match outcome {
            JobOutcome::Succeeded { report_url } => {
                let href = escape_html(report_url);
                format!(
                    "</pre>\n<p><a id=\"report\" href=\"{href}\">View report</a></p>\n<meta http-equiv=\"refresh\" content=\"0; url={href}\">\n"
                )
            }
            JobOutcome::Failed { reason } => format!(
                "</pre>\n<p class=\"error\">{}</p>\n",
                escape_html(reason)
            ),
        };
        vec![tail, "</body></html>\n".to_string()]
    }
}

/// Encode HTML special characters
pub fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Strip the leading `... GMT` timestamp Lighthouse prefixes its log lines with.
/// Carriage returns are dropped since SSE fields cannot carry them.
pub fn normalize_line(line: &str) -> Cow<'_, str> {
    let stripped = TIMESTAMP_PREFIX.replace(line, "");
    if stripped.contains('\r') {
        Cow::Owned(stripped.replace('\r', ""))
    } else {
        stripped
    }
}

fn single_line(text: &str) -> String {
    text.split(['\r', '\n'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Start the coordinating task for one job and return the frame receiver
pub fn spawn<R: Relay>(
    mut relay: R,
    job: Job,
    mut process: AuditProcess,
    report_url: String,
) -> mpsc::Receiver<R::Frame> {
    let (tx, rx) = mpsc::channel(FRAME_BUFFER);

    tokio::spawn(async move {
        let job_id = job.id().to_string();

        if let Some(frame) = relay.open() {
            if tx.send(frame).await.is_err() {
                return;
            }
        }

        let mut saw_failure_marker = false;
        loop {
            tokio::select! {
                _ = tx.closed() => {
                    info!(job_id = %job_id, "Caller disconnected, abandoning audit");
                    return;
                }
                line = process.next_line() => match line {
                    Some(raw) => {
                        let line = normalize_line(&raw);
                        debug!(job_id = %job_id, line = %line, "Audit output");
                        if line.contains(FAILURE_MARKER) {
                            saw_failure_marker = true;
                        }
                        if tx.send(relay.line(&line)).await.is_err() {
                            info!(job_id = %job_id, "Caller disconnected, abandoning audit");
                            return;
                        }
                    }
                    None => break,
                },
            }
        }

        let exit = tokio::select! {
            exit = process.wait() => exit,
            _ = tx.closed() => {
                info!(job_id = %job_id, "Caller disconnected before audit exit");
                return;
            }
        };

        let outcome = match job.conclude(exit, saw_failure_marker).await {
            Ok(_) => JobOutcome::Succeeded { report_url },
            Err(e) => JobOutcome::Failed {
                reason: e.to_string(),
            },
        };

        for frame in relay.close(&outcome) {
            if tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    rx
}
