//! Lighthouse process launcher
//!
//! `launch` returns as soon as the child is spawned. A supervisor task owns the
//! child: it forwards stderr lines through one channel and reports the exit status
//! through a oneshot. Dropping the [`AuditProcess`] handle kills the child.
//!
//! On unix the child leads its own process group, and cancellation or timeout
//! signals the whole group so browsers started by Lighthouse die with it.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;

use crate::artifact::OutputFormat;
use crate::error::{AuditError, AuditResult};

/// Default wall-clock limit for one audit
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// How to invoke the audit binary
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Executable, e.g. `lighthouse` or `node`
    pub program: String,
    /// Arguments placed before the target URL, e.g. `["lighthouse-cli"]`
    pub leading_args: Vec<String>,
    /// Arguments appended after the generated ones
    pub extra_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Passed as `--chrome-flags` for headless requests
    pub chrome_flags: String,
    pub timeout: Duration,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            program: "lighthouse".to_string(),
            leading_args: Vec::new(),
            extra_args: Vec::new(),
            working_dir: None,
            chrome_flags: "--headless".to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditLauncher {
    config: LauncherConfig,
}

impl AuditLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Full argument list for one audit.
    ///
    /// `--port=0` lets Lighthouse pick a free debugging port so concurrent jobs
    /// never compete for one.
    pub fn build_args(
        &self,
        target: &Url,
        format: OutputFormat,
        output_path: &Path,
        headless: bool,
    ) -> Vec<String> {
        let mut args = self.config.leading_args.clone();
        args.push(target.to_string());
        args.push(format!("--output={}", format.token()));
        args.push(format!("--output-path={}", output_path.display()));
        args.push("--port=0".to_string());
        if headless && !self.config.chrome_flags.is_empty() {
            args.push(format!("--chrome-flags={}", self.config.chrome_flags));
        }
        args.extend(self.config.extra_args.iter().cloned());
        args
    }

    pub fn launch(
        &self,
        target: &Url,
        format: OutputFormat,
        output_path: &Path,
        headless: bool,
    ) -> AuditResult<AuditProcess> {
        let args = self.build_args(target, format, output_path, headless);

        let mut command = Command::new(&self.config.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        debug!(program = %self.config.program, ?args, "Spawning audit process");

        let mut child = command.spawn().map_err(|source| AuditError::LaunchError {
            program: self.config.program.clone(),
            source,
        })?;
        let pid = child.id();
        info!(pid = ?pid, url = %target, %format, "Audit process started");

        let stderr = child.stderr.take().ok_or_else(|| AuditError::LaunchError {
            program: self.config.program.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "stderr was not captured"),
        })?;

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();

        tokio::spawn(supervise(
            child,
            stderr,
            line_tx,
            exit_tx,
            cancel_rx,
            self.config.timeout,
        ));

        Ok(AuditProcess {
            lines: line_rx,
            exit: exit_rx,
            cancel: cancel_tx,
        })
    }
}

/// Handle to a running audit
#[derive(Debug)]
pub struct AuditProcess {
    lines: mpsc::UnboundedReceiver<String>,
    exit: oneshot::Receiver<AuditResult<ExitStatus>>,
    // Dropped together with the handle; the supervisor treats that as cancellation
    cancel: oneshot::Sender<()>,
}

impl AuditProcess {
    /// Next stderr line in emission order; `None` once stderr has closed
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Wait for the process to exit
    pub async fn wait(self) -> AuditResult<ExitStatus> {
        let Self { exit, cancel, .. } = self;
        let status = exit.await.unwrap_or_else(|_| {
            Err(AuditError::AuditFailed(
                "audit supervisor stopped unexpectedly".to_string(),
            ))
        });
        drop(cancel);
        status
    }
}

async fn supervise(
    mut child: Child,
    stderr: ChildStderr,
    line_tx: mpsc::UnboundedSender<String>,
    exit_tx: oneshot::Sender<AuditResult<ExitStatus>>,
    mut cancel_rx: oneshot::Receiver<()>,
    timeout: Duration,
) {
    let pid = child.id();
    let mut segments = BufReader::new(stderr).split(b'\n');
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut reading = true;

    let outcome = loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                info!(pid = ?pid, "Audit abandoned by caller, killing process");
                terminate(&mut child).await;
                break Err(AuditError::AuditFailed("audit cancelled".to_string()));
            }
            _ = &mut deadline => {
                warn!(pid = ?pid, timeout_secs = timeout.as_secs(), "Audit timed out, killing process");
                terminate(&mut child).await;
                break Err(AuditError::AuditFailed(format!(
                    "audit timed out after {}s",
                    timeout.as_secs()
                )));
            }
            segment = segments.next_segment(), if reading => match segment {
                Ok(Some(bytes)) => {
                    let line = String::from_utf8_lossy(&bytes)
                        .trim_end_matches('\r')
                        .to_string();
                    // Receiver gone means the handle was dropped; cancel_rx fires next
                    let _ = line_tx.send(line);
                }
                Ok(None) => reading = false,
                Err(e) => {
                    warn!(pid = ?pid, error = %e, "Failed to read audit output");
                    reading = false;
                }
            },
            status = child.wait(), if !reading => {
                break status.map_err(|e| {
                    AuditError::AuditFailed(format!("failed to wait for audit process: {}", e))
                });
            }
        }
    };

    drop(line_tx);
    if let Ok(status) = &outcome {
        debug!(pid = ?pid, code = ?status.code(), "Audit process exited");
    }
    let _ = exit_tx.send(outcome);
}

/// Kill the audit process and everything it spawned, then reap it
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) => debug!(pid, "Audit process group killed"),
                Err(e) => warn!(pid, error = %e, "Failed to kill audit process group"),
            }
        }
    }

    if let Err(e) = child.kill().await {
        warn!(pid = ?child.id(), error = %e, "Failed to kill audit process");
    }
}
