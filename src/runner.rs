//! External command invocation seam.
//!
//! Retrieval, publish, the background listener, and descriptor dumps all go
//! through `CommandRunner`, so the fatal-vs-success branches and supervisor
//! teardown are testable without real network tools.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Captured result of a blocking external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Process exit code; -1 when terminated by signal.
    pub code: i32,
    /// Combined stdout and stderr, verbatim.
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Handle to a detached background process started by `spawn_silenced`.
#[async_trait]
pub trait ListenerHandle: Send {
    /// Terminate the process. Killing an already-exited process is not an
    /// error.
    async fn kill(&mut self) -> Result<()>;
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion, capturing combined stdout and stderr.
    async fn run(&self, command: &str) -> Result<CommandOutput>;

    /// Launch a long-running process with stdout and stderr discarded.
    async fn spawn_silenced(&self, command: &str) -> Result<Box<dyn ListenerHandle>>;
}

/// Runs commands through `sh -c`, matching how the deployment's dcm4che
/// wrapper scripts are invoked.
pub struct ShellRunner;

struct ShellChild(Child);

#[async_trait]
impl ListenerHandle for ShellChild {
    async fn kill(&mut self) -> Result<()> {
        self.0
            .kill()
            .await
            .context("Failed to kill listener process")
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str) -> Result<CommandOutput> {
        tracing::debug!(command, "running external command");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .with_context(|| format!("Failed to spawn `{command}`"))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            output: combined,
        })
    }

    async fn spawn_silenced(&self, command: &str) -> Result<Box<dyn ListenerHandle>> {
        tracing::debug!(command, "spawning background listener");
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn listener `{command}`"))?;
        Ok(Box::new(ShellChild(child)))
    }
}
