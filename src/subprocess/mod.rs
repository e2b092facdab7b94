//! Subprocess abstraction.
//!
//! Tools never spawn processes directly; they build a [`CommandSpec`] and
//! hand it to a [`ProcessRunner`]. The indirection keeps the shell,
//! install, and ai command-transport tools testable with a scripted
//! runner.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EngineError, ErrorCode, Result};

#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn stdin(mut self, data: impl Into<String>) -> Self {
        self.stdin = Some(data.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    Code(i32),
    TimedOut,
    Signal(i32),
}

impl ExitKind {
    pub fn success(&self) -> bool {
        matches!(self, ExitKind::Success)
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitKind::Success => Some(0),
            ExitKind::Code(code) => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit: ExitKind,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput>;
}

impl std::fmt::Debug for dyn ProcessRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProcessRunner")
    }
}

/// Production runner backed by `tokio::process`.
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        let start = std::time::Instant::now();
        tracing::debug!("spawning: {} {}", spec.program, spec.args.join(" "));

        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        if spec.stdin.is_some() {
            cmd.stdin(std::process::Stdio::piped());
        }
        // A timed-out child must not outlive the dropped wait future.
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            EngineError::new(
                ErrorCode::IoError,
                format!("failed to spawn `{}`: {e}", spec.program),
            )
            .with_source(e)
        })?;

        if let Some(data) = &spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                use tokio::io::AsyncWriteExt;
                stdin.write_all(data.as_bytes()).await.map_err(EngineError::from)?;
                stdin.shutdown().await.map_err(EngineError::from)?;
            }
        }

        let output = match spec.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => result.map_err(EngineError::from)?,
                Err(_) => {
                    return Ok(CommandOutput {
                        exit: ExitKind::TimedOut,
                        stdout: String::new(),
                        stderr: String::new(),
                        duration: start.elapsed(),
                    });
                }
            },
            None => child.wait_with_output().await.map_err(EngineError::from)?,
        };

        let exit = if output.status.success() {
            ExitKind::Success
        } else if let Some(code) = output.status.code() {
            ExitKind::Code(code)
        } else {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                match output.status.signal() {
                    Some(signal) => ExitKind::Signal(signal),
                    None => ExitKind::Code(1),
                }
            }
            #[cfg(not(unix))]
            {
                ExitKind::Code(1)
            }
        };

        let result = CommandOutput {
            exit,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: start.elapsed(),
        };

        match &result.exit {
            ExitKind::Success => tracing::debug!(
                "`{}` finished in {:?}",
                spec.program,
                result.duration
            ),
            ExitKind::Code(code) => tracing::debug!(
                "`{}` exited with code {code} in {:?}",
                spec.program,
                result.duration
            ),
            ExitKind::TimedOut => tracing::warn!("`{}` timed out", spec.program),
            ExitKind::Signal(signal) => {
                tracing::warn!("`{}` killed by signal {signal}", spec.program)
            }
        }

        Ok(result)
    }
}
