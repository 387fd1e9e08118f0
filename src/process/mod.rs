//! Subprocess execution
//!
//! A thin runner over `tokio::process` used by plugin handlers (module
//! builds, tests, tasks all end up spawning tooling). Supports cooperative
//! cancellation and per-invocation timeouts; output is captured in full.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{GardenError, GardenResult};

/// Cooperative cancellation flag, cloneable into every in-flight handler
#[derive(Clone, Default)]
pub struct CancelToken {
    receiver: Option<watch::Receiver<bool>>,
}

impl CancelToken {
    /// A token that never fires
    pub fn never() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.receiver
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(false)
    }

    /// Resolves when cancellation is signalled; pends forever otherwise
    pub async fn cancelled(&self) {
        match self.receiver.clone() {
            None => std::future::pending().await,
            Some(mut rx) => {
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        // Signal owner dropped without cancelling
                        std::future::pending::<()>().await;
                    }
                }
            }
        }
    }
}

/// The owning side of a [`CancelToken`]
pub struct CancelSignal {
    sender: watch::Sender<bool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            receiver: Some(self.sender.subscribe()),
        }
    }

    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// A command to spawn
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    /// Run `script` through `sh -c`
    pub fn shell(script: impl Into<String>) -> Self {
        let mut command = Self::new("sh");
        command.args = vec!["-c".to_string(), script.into()];
        command
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn envs(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(vars);
        self
    }

    fn describe(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Captured output of a finished process
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout and stderr concatenated, for logs
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Spawn and await a command, honoring an optional timeout and the cancel
/// token. The child is killed on either.
pub async fn run_process(
    command: &ProcessCommand,
    timeout: Option<Duration>,
    cancel: &CancelToken,
) -> GardenResult<ProcessOutput> {
    debug!(command = %command.describe(), "spawning process");

    let mut builder = tokio::process::Command::new(&command.program);
    builder
        .args(&command.args)
        .envs(&command.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &command.cwd {
        builder.current_dir(cwd);
    }

    let mut child = builder.spawn().map_err(|e| GardenError::Runtime {
        message: format!("failed to spawn '{}': {}", command.describe(), e),
        node_key: None,
        source: Some(Box::new(e)),
    })?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    let wait = async {
        let status = child.wait().await;
        status.map_err(|e| GardenError::Runtime {
            message: format!("failed waiting for '{}': {}", command.describe(), e),
            node_key: None,
            source: Some(Box::new(e)),
        })
    };

    let status = tokio::select! {
        status = wait => status?,
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(GardenError::cancelled(format!(
                "process '{}' cancelled",
                command.describe()
            )));
        }
        _ = sleep_opt(timeout) => {
            let _ = child.kill().await;
            return Err(GardenError::Timeout {
                message: format!("process '{}' exceeded its timeout", command.describe()),
                seconds: timeout.map(|t| t.as_secs()).unwrap_or(0),
            });
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    Ok(ProcessOutput {
        exit_code: status.code(),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

async fn sleep_opt(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}
