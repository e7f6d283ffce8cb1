//! Runtime configuration for the relay pipeline.
//!
//! Settings come from `relay.toml` in the working directory (all fields
//! optional, with defaults matching a stock dcm4che deployment) and are
//! overridden by CLI flags in `main`. The external commands are templates;
//! `{endpoint}`, `{dest}`, `{input}`, `{dir}` and `{file}` placeholders are
//! substituted at invocation time.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "relay.toml";

/// A DICOM application entity endpoint, rendered as `AE@host:port` when
/// substituted into command templates.
#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    pub ae: String,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.ae, self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Parent directory holding the `run_at_<timestamp>` run directories.
    pub data_dir: PathBuf,

    /// Endpoint the background listener binds to.
    pub local: Endpoint,
    /// Staging archive the retrieval command pulls from.
    pub staging: Endpoint,
    /// Production archive the push command transmits to.
    pub production: Endpoint,

    /// Listener command template: `{endpoint}` and `{dest}` substituted.
    pub listener_cmd: String,
    /// Retrieval command template: `{endpoint}` and `{input}` substituted.
    pub retrieve_cmd: String,
    /// Push command template: `{endpoint}` and `{dir}` substituted.
    pub push_cmd: String,
    /// Descriptor dump command template: `{file}` substituted.
    pub dump_cmd: String,
    /// De-identification engine command template; see `engine::AnonymizeRequest`
    /// for the placeholders.
    pub engine_cmd: String,

    /// Identifier-mapping store written by the de-identification engine.
    pub audit_db: PathBuf,
    /// System-of-record database holding study metadata and review flags.
    pub registry_db: PathBuf,

    /// Organization root identifier handed to the engine.
    pub org_root: String,
    /// Controlled-vocabulary file handed to the engine.
    pub vocab_file: PathBuf,
    /// Engine processing profile.
    pub profile: String,
    /// Whether the engine should burn in overlays.
    pub overlay: bool,

    /// Name of the post-anonymization hook to look up in the registry.
    pub post_anon_hook: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            local: Endpoint {
                ae: "RELAY".into(),
                host: "localhost".into(),
                port: 11112,
            },
            staging: Endpoint {
                ae: "STAGE".into(),
                host: "staging".into(),
                port: 104,
            },
            production: Endpoint {
                ae: "PROD".into(),
                host: "production".into(),
                port: 104,
            },
            listener_cmd: "dcmrcv {endpoint} -dest {dest}".into(),
            retrieve_cmd: "dicom_tools/retrieve.sh {endpoint} {input}".into(),
            push_cmd: "dcmsnd {endpoint} {dir}".into(),
            dump_cmd: "dcmdump {file}".into(),
            engine_cmd: "dicom_anon --quarantine {quarantine} --audit {audit} \
                         --modalities {modalities} --org-root {org_root} \
                         --white-list {vocab} --log {log} --profile {profile}{overlay} \
                         {source} {dest}"
                .into(),
            audit_db: PathBuf::from("identity.db"),
            registry_db: PathBuf::from("staging.db"),
            org_root: "1.2.826.0.1.3680043".into(),
            vocab_file: PathBuf::from("dicom_limited_vocab.json"),
            profile: "clean".into(),
            overlay: true,
            post_anon_hook: "noop".into(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from `relay.toml` under `base_dir`, falling back to
    /// defaults when the file does not exist.
    pub fn load_or_default(base_dir: &Path) -> Result<Self> {
        Self::load_from(&base_dir.join(CONFIG_FILE))
    }

    /// Load configuration from an explicit path. A missing file yields the
    /// defaults; a malformed file is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn listener_command(&self, dest: &Path) -> String {
        self.listener_cmd
            .replace("{endpoint}", &self.local.to_string())
            .replace("{dest}", &dest.to_string_lossy())
    }

    pub fn retrieve_command(&self, input: &Path) -> String {
        self.retrieve_cmd
            .replace("{endpoint}", &self.staging.to_string())
            .replace("{input}", &input.to_string_lossy())
    }

    pub fn push_command(&self, dir: &Path) -> String {
        self.push_cmd
            .replace("{endpoint}", &self.production.to_string())
            .replace("{dir}", &dir.to_string_lossy())
    }

    pub fn dump_command(&self, file: &Path) -> String {
        self.dump_cmd.replace("{file}", &file.to_string_lossy())
    }
}
