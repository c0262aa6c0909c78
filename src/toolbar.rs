//! Toolbar layout: toolbars, their buttons, and the JSON file they live in.
//!
//! The host edits the layout through messages (`saveButtonOrder`,
//! `addButton`, ...). `ToolbarService` keeps the current layout in memory and
//! writes the whole file back after every change.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolbarConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub toolbars: Vec<SingleToolbar>,
    #[serde(default)]
    pub global_settings: Map<String, Value>,
}

impl Default for ToolbarConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            toolbars: Vec::new(),
            global_settings: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleToolbar {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_position")]
    pub position: String,
    #[serde(default = "default_true")]
    pub is_visible: bool,
    #[serde(default)]
    pub is_always_on_top: bool,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default = "default_theme")]
    pub theme: String,
    #[serde(default)]
    pub buttons: Vec<ButtonConfig>,
}

impl Default for SingleToolbar {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            position: default_position(),
            is_visible: true,
            is_always_on_top: false,
            is_pinned: true,
            theme: default_theme(),
            buttons: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ButtonKind {
    #[default]
    Script,
    Application,
    Url,
    Plugin,
    /// Anything this backend does not know how to run
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ButtonConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type", default)]
    pub kind: ButtonKind,
    /// Kind-specific settings (`scriptType`, `command`, `url`, `pluginId`, ...)
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub tooltip: String,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_position() -> String {
    "Top".to_string()
}

fn default_theme() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

impl ToolbarConfig {
    /// The toolbar button edits apply to, created on first use.
    pub fn primary_mut(&mut self) -> &mut SingleToolbar {
        if self.toolbars.is_empty() {
            self.toolbars.push(SingleToolbar::default());
        }
        &mut self.toolbars[0]
    }

    pub fn find_button(&self, id: &str) -> Option<&ButtonConfig> {
        self.toolbars
            .iter()
            .flat_map(|t| t.buttons.iter())
            .find(|b| b.id == id)
    }

    /// Reorders the primary toolbar. `order` must name every button exactly
    /// once, otherwise nothing changes and `false` is returned.
    pub fn reorder_buttons(&mut self, order: &[String]) -> bool {
        let Some(toolbar) = self.toolbars.first_mut() else {
            return false;
        };
        let unique: HashSet<&String> = order.iter().collect();
        if unique.len() != order.len() || order.len() != toolbar.buttons.len() {
            return false;
        }

        let mut ordered = Vec::with_capacity(order.len());
        for id in order {
            match toolbar.buttons.iter().find(|b| &b.id == id) {
                Some(button) => ordered.push(button.clone()),
                None => return false,
            }
        }
        toolbar.buttons = ordered;
        true
    }

    /// Appends a button to the primary toolbar, minting an id if it has none.
    pub fn add_button(&mut self, mut button: ButtonConfig) -> ButtonConfig {
        if button.id.trim().is_empty() {
            button.id = uuid::Uuid::new_v4().to_string();
        }
        self.primary_mut().buttons.push(button.clone());
        button
    }

    /// Replaces the button with the same id wherever it lives. Unknown ids
    /// are appended to the primary toolbar.
    pub fn upsert_button(&mut self, button: ButtonConfig) -> ButtonConfig {
        if !button.id.is_empty() {
            let existing = self
                .toolbars
                .iter_mut()
                .flat_map(|t| t.buttons.iter_mut())
                .find(|b| b.id == button.id);
            if let Some(slot) = existing {
                *slot = button.clone();
                return button;
            }
        }
        self.add_button(button)
    }

    pub fn remove_button(&mut self, id: &str) -> Option<ButtonConfig> {
        for toolbar in &mut self.toolbars {
            if let Some(index) = toolbar.buttons.iter().position(|b| b.id == id) {
                return Some(toolbar.buttons.remove(index));
            }
        }
        None
    }
}

/// Reads and writes the layout file.
pub struct ToolbarStore {
    path: PathBuf,
}

impl ToolbarStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing or unreadable file yields the default layout.
    pub async fn load(&self) -> ToolbarConfig {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "Toolbar config {} does not exist, using defaults",
                    self.path.display()
                );
                return ToolbarConfig::default();
            }
            Err(e) => {
                error!("Cannot read toolbar config {}: {e}", self.path.display());
                return ToolbarConfig::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(config) => {
                info!("Toolbar config loaded from {}", self.path.display());
                config
            }
            Err(e) => {
                error!(
                    "Invalid toolbar config {}, using defaults: {e}",
                    self.path.display()
                );
                ToolbarConfig::default()
            }
        }
    }

    pub async fn save(&self, config: &ToolbarConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(config)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// In-memory layout shared by concurrent host messages.
pub struct ToolbarService {
    store: ToolbarStore,
    config: Mutex<ToolbarConfig>,
}

impl ToolbarService {
    pub async fn open(store: ToolbarStore) -> Self {
        let config = store.load().await;
        Self {
            store,
            config: Mutex::new(config),
        }
    }

    pub async fn snapshot(&self) -> ToolbarConfig {
        self.config.lock().await.clone()
    }

    /// `Ok(false)` when `order` does not match the current buttons.
    pub async fn save_button_order(&self, order: &[String]) -> Result<bool> {
        let mut config = self.config.lock().await;
        if !config.reorder_buttons(order) {
            warn!("Button order does not match the toolbar, reordering aborted");
            return Ok(false);
        }
        self.store.save(&config).await?;
        info!("Button order saved");
        Ok(true)
    }

    pub async fn add_button(&self, button: ButtonConfig) -> Result<ButtonConfig> {
        let mut config = self.config.lock().await;
        let button = config.add_button(button);
        self.store.save(&config).await?;
        info!("Button '{}' added", button.label);
        Ok(button)
    }

    pub async fn upsert_button(&self, button: ButtonConfig) -> Result<ButtonConfig> {
        let mut config = self.config.lock().await;
        let button = config.upsert_button(button);
        self.store.save(&config).await?;
        info!("Button '{}' updated", button.label);
        Ok(button)
    }

    /// `Ok(None)` when no button has that id.
    pub async fn remove_button(&self, id: &str) -> Result<Option<ButtonConfig>> {
        let mut config = self.config.lock().await;
        let Some(removed) = config.remove_button(id) else {
            warn!("Button with ID '{id}' not found");
            return Ok(None);
        };
        self.store.save(&config).await?;
        info!("Button '{}' removed", removed.label);
        Ok(Some(removed))
    }
}
