//! Invoking the external plan/apply tool.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;

use crate::models::DEFAULT_WORKSPACE;

/// How long to wait for the output readers after the process is gone.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRequest {
    pub working_dir: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Combined stdout and stderr, in arrival order.
    pub output: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }
}

/// Runs one tool invocation. Returns `Err` only when the process could not
/// be started; a non-zero exit is a normal `ToolOutput`.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn run(&self, request: ToolRequest, cancel: CancellationToken) -> Result<ToolOutput>;
}

/// Spawns `binary` as a child process.
#[derive(Debug, Clone)]
pub struct ProcessToolInvoker {
    binary: String,
}

impl ProcessToolInvoker {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

enum Ending {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl ToolInvoker for ProcessToolInvoker {
    async fn run(&self, request: ToolRequest, cancel: CancellationToken) -> Result<ToolOutput> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(&request.args)
            .current_dir(&request.working_dir)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "Failed to spawn {} in {}",
                self.binary,
                request.working_dir.display()
            )
        })?;

        let output = Arc::new(Mutex::new(String::new()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(collect_lines(stdout, Arc::clone(&output))));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(collect_lines(stderr, Arc::clone(&output))));
        }

        let ending = tokio::select! {
            status = child.wait() => Ending::Exited(status),
            _ = tokio::time::sleep(request.timeout) => Ending::TimedOut,
            _ = cancel.cancelled() => Ending::Cancelled,
        };

        let (exit_code, timed_out, cancelled) = match ending {
            Ending::Exited(status) => (status.context("Failed to wait for tool")?.code(), false, false),
            Ending::TimedOut => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(binary = %self.binary, error = %e, "failed to kill timed out tool");
                }
                (None, true, false)
            }
            Ending::Cancelled => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(binary = %self.binary, error = %e, "failed to kill cancelled tool");
                }
                (None, false, true)
            }
        };

        let drain = futures::future::join_all(readers);
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::warn!(binary = %self.binary, "tool output readers did not finish");
        }

        let output = output
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default();

        Ok(ToolOutput {
            output,
            exit_code,
            timed_out,
            cancelled,
        })
    }
}

/// Append output to `sink` line by line until EOF. Bytes that are not
/// UTF-8 are replaced, never dropped; the pipe is drained to the end so the
/// tool never writes into a closed pipe.
async fn collect_lines<R>(reader: R, sink: Arc<Mutex<String>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if let Ok(mut out) = sink.lock() {
                    out.push_str(&String::from_utf8_lossy(&buf));
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read tool output");
                break;
            }
        }
    }
}

pub fn plan_file_name(workspace: &str) -> String {
    format!("{}.tfplan", workspace)
}

pub fn init_args() -> Vec<String> {
    to_strings(&["init", "-input=false", "-no-color"])
}

/// `None` for the default workspace, which needs no selection.
pub fn workspace_select_args(workspace: &str) -> Option<Vec<String>> {
    if workspace == DEFAULT_WORKSPACE {
        return None;
    }
    Some(to_strings(&["workspace", "select", "-or-create", workspace]))
}

pub fn plan_args(workspace: &str, extra: &[String]) -> Vec<String> {
    let mut args = to_strings(&["plan", "-input=false", "-refresh", "-no-color", "-out"]);
    args.push(plan_file_name(workspace));
    args.extend(extra.iter().cloned());
    args
}

pub fn apply_args(workspace: &str, extra: &[String]) -> Vec<String> {
    let mut args = to_strings(&["apply", "-input=false", "-no-color"]);
    args.extend(extra.iter().cloned());
    args.push(plan_file_name(workspace));
    args
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
