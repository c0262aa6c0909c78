//! Capabilities the script host may call.
//!
//! Every operation takes primitive arguments and returns display text. Errors
//! never cross this boundary: they are logged and rendered into the text.

pub mod host;
pub mod protocol;

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, warn};

pub use host::serve;
pub use protocol::{CapabilityOperation, Inbound, Outbound, ToolbarMessage};

use crate::exec::{ExecutionRequest, ProcessEngine};
use crate::plugins::{PluginParams, PluginRuntime};

pub struct CapabilityBridge {
    engine: ProcessEngine,
    runtime: Arc<PluginRuntime>,
}

impl CapabilityBridge {
    pub fn new(engine: ProcessEngine, runtime: Arc<PluginRuntime>) -> Self {
        Self { engine, runtime }
    }

    pub fn runtime(&self) -> &Arc<PluginRuntime> {
        &self.runtime
    }

    pub async fn dispatch(&self, operation: CapabilityOperation) -> String {
        match operation {
            CapabilityOperation::ExecuteScript {
                script_type,
                command,
                elevate,
            } => self.execute_script(&script_type, &command, elevate).await,
            CapabilityOperation::ExecuteApplication {
                path,
                arguments,
                elevate,
            } => self.execute_application(&path, &arguments, elevate).await,
            CapabilityOperation::OpenUrl { url } => self.open_url(&url).await,
            CapabilityOperation::ListPlugins => self.list_plugins().await,
            CapabilityOperation::ExecutePlugin { plugin_id, params } => {
                self.execute_plugin(&plugin_id, params).await
            }
            CapabilityOperation::AddPlugin { path } => self.add_plugin(&path).await,
            CapabilityOperation::RemovePlugin { plugin_id } => self.remove_plugin(&plugin_id).await,
        }
    }

    /// Runs a command through the named interpreter and returns its output,
    /// or the timeout / elevation status text.
    pub async fn execute_script(&self, script_type: &str, command: &str, elevate: bool) -> String {
        let request = match ExecutionRequest::parse(script_type, command, elevate) {
            Ok(request) => request,
            Err(e) => {
                warn!("Rejected script request: {e}");
                return format!("Error executing script: {e}");
            }
        };

        match self.engine.run(&request).await {
            Ok(result) => result.output,
            Err(e) => {
                error!("Error executing script: {e}");
                format!("Error executing script: {e}")
            }
        }
    }

    pub async fn execute_application(&self, path: &str, arguments: &str, elevate: bool) -> String {
        match self.engine.launch_application(path, arguments, elevate).await {
            Ok(_) => format!("Application '{path}' executed successfully."),
            Err(e) => {
                error!("Error executing application {path}: {e}");
                format!("Error executing application: {e}")
            }
        }
    }

    pub async fn open_url(&self, url: &str) -> String {
        match self.engine.open_url(url).await {
            Ok(()) => format!("URL '{url}' opened successfully."),
            Err(e) => {
                error!("Error opening URL {url}: {e}");
                format!("Error opening URL: {e}")
            }
        }
    }

    /// JSON array of plugin names, in discovery order.
    pub async fn list_plugins(&self) -> String {
        let names = self.runtime.names().await;
        serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string())
    }

    pub async fn execute_plugin(&self, plugin_id: &str, params: Option<PluginParams>) -> String {
        self.runtime.execute(plugin_id, params).await.to_string()
    }

    /// Loads a unit from any path, adds its plugins and records them.
    pub async fn add_plugin(&self, path: &str) -> String {
        let plugins = match self.runtime.load(Path::new(path)).await {
            Ok(plugins) => plugins,
            Err(e) => {
                error!("Error adding plugin from {path}: {e}");
                return format!("Error adding plugin: {e}");
            }
        };
        if plugins.is_empty() {
            return "Failed to load plugin. Ensure it exports a toolbar plugin.".to_string();
        }

        let mut added = Vec::new();
        let mut failure = None;
        for plugin in plugins {
            match self.runtime.add(plugin).await {
                Ok(descriptor) => added.push(descriptor.name),
                Err(e) => {
                    error!("Error adding plugin from {path}: {e}");
                    failure = Some(e);
                }
            }
        }
        if !added.is_empty() {
            self.runtime.persist().await;
        }

        match failure {
            Some(e) => format!("Error adding plugin: {e}"),
            None => {
                info!("Added plugin(s) {added:?} from {path}");
                format!("Plugin '{}' added successfully.", added.join(", "))
            }
        }
    }

    pub async fn remove_plugin(&self, plugin_id: &str) -> String {
        if !self.runtime.remove(plugin_id).await {
            return format!("Plugin '{plugin_id}' not found.");
        }
        self.runtime.persist().await;
        format!("Plugin '{plugin_id}' removed successfully.")
    }
}
