//! Background listener supervision around the retrieval stage.
//!
//! The listener must be up for the whole duration of the blocking retrieval
//! call and torn down on every exit path out of the stage, so the process and
//! its output sink never outlive the stage. `stop` without a prior `start`
//! is a safe no-op, which is what makes checkpoint-skipped retrieval stages
//! harmless.

use crate::runner::{CommandRunner, ListenerHandle};
use anyhow::Result;
use std::sync::Arc;

pub struct ProcessSupervisor {
    runner: Arc<dyn CommandRunner>,
    child: Option<Box<dyn ListenerHandle>>,
}

impl ProcessSupervisor {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            child: None,
        }
    }

    /// Launch the listener with its output discarded. Starting twice without
    /// an intervening `stop` tears down the first listener before launching
    /// the replacement.
    pub async fn start(&mut self, command: &str) -> Result<()> {
        self.stop().await?;
        let child = self.runner.spawn_silenced(command).await?;
        self.child = Some(child);
        Ok(())
    }

    /// Terminate the listener if one is running. No-op otherwise.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            child.kill().await?;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }
}
