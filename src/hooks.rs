//! Pluggable post-anonymization hooks.
//!
//! Deployment-specific logic that must run after a successful anonymization
//! (patient alias registration, encounter linking, and the like) is expressed
//! as a `Hook` and looked up by name from an explicitly constructed
//! `HookRegistry`. The registry is handed to the pipeline at construction
//! time; there is no process-wide mutable registry, so registration order is
//! a property of `main`, not of module imports.
//!
//! At most one hook may be marked as the registry default. The default is the
//! fallback returned for unknown names. Registering a second default, or two
//! hooks under one name, is a configuration error reported at registration
//! time.

use crate::errors::RegistryError;
use crate::run_context::OverviewLog;
use anyhow::Result;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// A named post-processing handler over a completed anonymized run.
pub trait Hook: Send + Sync {
    /// Name the hook registers under when no explicit name is given.
    fn name(&self) -> &str;

    /// Whether this hook is the registry default.
    fn is_default(&self) -> bool {
        false
    }

    /// Process the run directory and return a text result, which the hook
    /// stage writes verbatim to its output artifact.
    fn run(&self, run_dir: &Path, log: &mut OverviewLog, practice: bool) -> Result<String>;
}

#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<String, Arc<dyn Hook>>,
    default: Option<Arc<dyn Hook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook, deriving the name from the hook itself when not
    /// given. Errors on duplicate names and on a second default.
    pub fn register(
        &mut self,
        hook: Arc<dyn Hook>,
        name: Option<&str>,
    ) -> Result<(), RegistryError> {
        let name = name.unwrap_or_else(|| hook.name()).to_string();
        if self.hooks.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        if hook.is_default() {
            if let Some(existing) = &self.default {
                return Err(RegistryError::DefaultAlreadySet {
                    existing: existing.name().to_string(),
                });
            }
            self.default = Some(hook.clone());
        }
        self.hooks.insert(name, hook);
        Ok(())
    }

    /// Look up a hook by name, falling back to the default for unknown names.
    /// Returns `None` only when the name is unregistered and no default
    /// exists.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Hook>> {
        self.hooks.get(name).cloned().or_else(|| self.default.clone())
    }

    pub fn unregister(&mut self, name: &str) -> Result<(), RegistryError> {
        let removed = self
            .hooks
            .remove(name)
            .ok_or_else(|| RegistryError::NotRegistered(name.to_string()))?;
        if self
            .default
            .as_ref()
            .is_some_and(|d| d.name() == removed.name())
        {
            self.default = None;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

/// Built-in default hook: records that no site-specific post-processing is
/// configured and succeeds.
pub struct NoOpHook;

impl Hook for NoOpHook {
    fn name(&self) -> &str {
        "noop"
    }

    fn is_default(&self) -> bool {
        true
    }

    fn run(&self, _run_dir: &Path, log: &mut OverviewLog, practice: bool) -> Result<String> {
        log.write_line("No post-anonymization processing configured")?;
        if practice {
            Ok("noop (practice)".to_string())
        } else {
            Ok("noop".to_string())
        }
    }
}
