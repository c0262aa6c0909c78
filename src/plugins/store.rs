//! Durable record of which plugins are installed.
//!
//! The runtime hands its registry to a `PluginStore` after every add/remove
//! and asks it on startup which plugins were added from outside the plugin
//! directory. Saving is best-effort: the runtime logs failures and moves on.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    /// File the plugin was loaded from
    pub source: PathBuf,
}

#[async_trait]
pub trait PluginStore: Send + Sync {
    async fn save(&self, records: &[PluginRecord]) -> Result<()>;

    async fn load(&self) -> Result<Vec<PluginRecord>>;
}

/// Stores the records as a pretty-printed JSON array.
pub struct JsonPluginStore {
    path: PathBuf,
}

impl JsonPluginStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PluginStore for JsonPluginStore {
    async fn save(&self, records: &[PluginRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(records)?;

        // Write-then-rename so a crash never leaves a truncated file
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!("Saved {} plugin records to {}", records.len(), self.path.display());
        Ok(())
    }

    async fn load(&self) -> Result<Vec<PluginRecord>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}
