//! Command plugins: a TOML manifest that turns a script into a plugin.
//!
//! ```toml
//! id = "disk-usage"
//! name = "Disk usage"
//! description = "Free space on every mounted volume"
//! version = "1.0.0"
//! interpreter = "cmd"
//! command = "df -h {{path}}"
//! timeout_secs = 10
//! platforms = ["linux", "macos"]
//! ```
//!
//! `{{key}}` placeholders are filled from the execution parameters.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{PluginError, PluginParams, ToolbarPlugin};
use crate::exec::{ExecutionRequest, InterpreterKind, ProcessEngine};

#[derive(Debug, Clone, Deserialize)]
pub struct CommandManifest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    pub command: String,
    #[serde(default)]
    pub elevate: bool,
    pub timeout_secs: Option<u64>,
    /// OS names as reported by `std::env::consts::OS`. Empty = everywhere.
    #[serde(default)]
    pub platforms: Vec<String>,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

fn default_interpreter() -> String {
    "cmd".to_string()
}

impl CommandManifest {
    pub fn load(path: &Path) -> Result<Self, PluginError> {
        let content = std::fs::read_to_string(path).map_err(|e| PluginError::Manifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&content).map_err(|reason| PluginError::Manifest {
            path: path.to_path_buf(),
            reason,
        })
    }

    fn parse(content: &str) -> Result<Self, String> {
        let manifest: CommandManifest = toml::from_str(content).map_err(|e| e.to_string())?;
        if manifest.id.trim().is_empty() {
            return Err("id must not be empty".to_string());
        }
        if manifest.command.trim().is_empty() {
            return Err("command must not be empty".to_string());
        }
        manifest
            .interpreter
            .parse::<InterpreterKind>()
            .map_err(|e| e.to_string())?;
        Ok(manifest)
    }
}

/// Plugin whose action is one command run through the process engine.
pub struct CommandPlugin {
    manifest: CommandManifest,
    kind: InterpreterKind,
    engine: ProcessEngine,
}

impl CommandPlugin {
    pub fn new(manifest: CommandManifest, engine: ProcessEngine) -> Result<Self, PluginError> {
        let kind = manifest
            .interpreter
            .parse()
            .map_err(|e: crate::exec::ExecError| PluginError::Manifest {
                path: manifest.id.clone().into(),
                reason: e.to_string(),
            })?;
        Ok(Self::with_kind(manifest, kind, engine))
    }

    pub(crate) fn with_kind(
        manifest: CommandManifest,
        kind: InterpreterKind,
        engine: ProcessEngine,
    ) -> Self {
        Self {
            manifest,
            kind,
            engine,
        }
    }

    fn timeout(&self) -> Duration {
        self.manifest
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.engine.timeout())
    }
}

/// Replaces `{{key}}` with the parameter value. Strings are inserted raw,
/// other JSON values in their JSON form.
fn render_command(template: &str, params: Option<&PluginParams>) -> String {
    let Some(params) = params else {
        return template.to_string();
    };
    params.iter().fold(template.to_string(), |acc, (key, value)| {
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        acc.replace(&format!("{{{{{key}}}}}"), &rendered)
    })
}

#[async_trait]
impl ToolbarPlugin for CommandPlugin {
    fn id(&self) -> &str {
        &self.manifest.id
    }

    fn name(&self) -> &str {
        &self.manifest.name
    }

    fn description(&self) -> &str {
        &self.manifest.description
    }

    fn version(&self) -> &str {
        &self.manifest.version
    }

    async fn execute(
        &self,
        params: Option<&PluginParams>,
        cancel: CancellationToken,
    ) -> anyhow::Result<String> {
        let command = render_command(&self.manifest.command, params);
        debug!(plugin = %self.manifest.id, "Running command plugin: {command}");
        let request = ExecutionRequest::new(self.kind, command, self.manifest.elevate);

        let result = tokio::select! {
            result = self.engine.run_with_timeout(&request, self.timeout()) => result?,
            _ = cancel.cancelled() => anyhow::bail!("cancelled by host shutdown"),
        };

        if result.timed_out {
            anyhow::bail!(result.output);
        }
        if !result.succeeded {
            let code = result
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            anyhow::bail!("command exited with code {code}: {}", result.output);
        }
        Ok(result.output)
    }

    fn is_compatible(&self) -> bool {
        self.manifest.platforms.is_empty()
            || self
                .manifest
                .platforms
                .iter()
                .any(|p| p.eq_ignore_ascii_case(std::env::consts::OS))
    }
}
