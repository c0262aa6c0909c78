use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use libloading::Library;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::loader::{self, BoxedFactory, LoadedModule, UnitKind};
use super::registry::{Lookup, PluginRegistry};
use super::{
    LoadedPlugin, PluginDescriptor, PluginError, PluginFactory, PluginOutcome, PluginParams,
    PluginState, PluginStore, ToolbarPlugin,
};
use crate::exec::ProcessEngine;

/// A unit that could not contribute a plugin.
#[derive(Debug, Clone)]
pub struct DiscoveryFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of a discovery or restore pass.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub loaded: Vec<PluginDescriptor>,
    pub failures: Vec<DiscoveryFailure>,
}

/// Owns every loaded plugin and drives their lifecycle.
///
/// Registry mutations go through one mutex. Plugin code (`initialize`,
/// `execute`, `shutdown`) always runs with that lock released, so a plugin
/// that hangs only stalls its own call.
pub struct PluginRuntime {
    engine: ProcessEngine,
    // Declared before `libraries`: plugin instances drop before their code
    registry: Mutex<PluginRegistry>,
    libraries: Mutex<Vec<Arc<Library>>>,
    store: Option<Arc<dyn PluginStore>>,
    shutdown: CancellationToken,
}

impl PluginRuntime {
    /// `engine` runs the commands of manifest plugins.
    pub fn new(engine: ProcessEngine) -> Self {
        Self {
            engine,
            registry: Mutex::new(PluginRegistry::new()),
            libraries: Mutex::new(Vec::new()),
            store: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn PluginStore>) -> Self {
        self.store = Some(store);
        self
    }

    // ── Discovery & loading ─────────────────────────────

    /// Loads every unit found in `directory`, creating it if needed.
    ///
    /// Only a directory that cannot be created or listed fails the pass.
    /// Broken units are logged, reported, and skipped.
    pub async fn discover(&self, directory: &Path) -> Result<DiscoveryReport, PluginError> {
        let dir_error = |source| PluginError::Directory {
            path: directory.to_path_buf(),
            source,
        };

        if !tokio::fs::try_exists(directory).await.unwrap_or(false) {
            tokio::fs::create_dir_all(directory).await.map_err(dir_error)?;
            info!("Created plugins directory at {}", directory.display());
        }

        let mut entries = tokio::fs::read_dir(directory).await.map_err(dir_error)?;
        let mut candidates = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(dir_error)? {
            let path = entry.path();
            // Follows symlinks, unlike DirEntry::file_type
            let is_file = tokio::fs::metadata(&path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false);
            if is_file && UnitKind::detect(&path).is_some() {
                candidates.push(path);
            } else {
                debug!("Ignoring {}", path.display());
            }
        }
        // read_dir order is filesystem-dependent
        candidates.sort();

        let mut report = DiscoveryReport::default();
        if candidates.is_empty() {
            info!("No plugins found in {}", directory.display());
            return Ok(report);
        }

        for path in candidates {
            self.load_and_add(&path, &mut report).await;
        }

        info!(
            "Plugin discovery: {} loaded, {} skipped",
            report.loaded.len(),
            report.failures.len()
        );
        Ok(report)
    }

    /// Reloads plugins recorded by the store that are not loaded yet, e.g.
    /// plugins added from outside the plugin directory.
    pub async fn restore(&self) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        let Some(store) = &self.store else {
            return report;
        };

        let records = match store.load().await {
            Ok(records) => records,
            Err(e) => {
                warn!("Cannot read plugin list: {e:#}");
                return report;
            }
        };

        for record in records {
            if self.registry.lock().await.has_source(&record.source) {
                continue;
            }
            if !record.source.exists() {
                warn!(
                    "Recorded plugin '{}' is gone: {}",
                    record.id,
                    record.source.display()
                );
                report.failures.push(DiscoveryFailure {
                    path: record.source,
                    reason: "file no longer exists".to_string(),
                });
                continue;
            }
            self.load_and_add(&record.source, &mut report).await;
        }
        report
    }

    async fn load_and_add(&self, path: &Path, report: &mut DiscoveryReport) {
        let plugins = match self.load(path).await {
            Ok(plugins) => plugins,
            Err(e) => {
                error!("Error loading plugin from file {}: {e}", path.display());
                report.failures.push(DiscoveryFailure {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                });
                return;
            }
        };

        if plugins.is_empty() {
            report.failures.push(DiscoveryFailure {
                path: path.to_path_buf(),
                reason: "no plugin exported".to_string(),
            });
            return;
        }

        for plugin in plugins {
            match self.add(plugin).await {
                Ok(descriptor) => report.loaded.push(descriptor),
                Err(e) => {
                    error!("Error adding plugin from {}: {e}", path.display());
                    report.failures.push(DiscoveryFailure {
                        path: path.to_path_buf(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// Opens a unit and instantiates every plugin it registers.
    ///
    /// An empty vector means the unit exported no plugin (logged as a
    /// warning). Nothing is added to the registry here.
    pub async fn load(&self, path: &Path) -> Result<Vec<LoadedPlugin>, PluginError> {
        let module = loader::load_unit(path, &self.engine)?;
        if let Some(library) = module.library() {
            // Mapped for the rest of the process lifetime
            self.libraries.lock().await.push(library.clone());
        }

        if module.is_empty() {
            warn!("No valid plugin found in unit: {}", path.display());
            return Ok(Vec::new());
        }

        let mut plugins = Vec::new();
        let mut last_error = None;
        for factory in module.factories() {
            match instantiate(factory, &module) {
                Ok(plugin) => plugins.push(plugin),
                Err(e) => {
                    warn!("Rejected plugin from {}: {e}", path.display());
                    last_error = Some(e);
                }
            }
        }

        match (plugins.is_empty(), last_error) {
            (true, Some(e)) => Err(e),
            _ => Ok(plugins),
        }
    }

    /// Constructs and adds a plugin compiled into the host.
    pub async fn register_builtin(
        &self,
        factory: PluginFactory,
    ) -> Result<PluginDescriptor, PluginError> {
        let instance = construct(&factory, Path::new("<builtin>"))?;
        self.add(LoadedPlugin::in_process(instance)).await
    }

    // ── Registry membership ─────────────────────────────

    /// Initializes a plugin and adds it as `Ready`.
    pub async fn add(&self, plugin: LoadedPlugin) -> Result<PluginDescriptor, PluginError> {
        let id = plugin.id().to_string();
        if self.registry.lock().await.contains(&id) {
            return Err(PluginError::Duplicate(id));
        }

        let plugin = Arc::new(plugin);
        match AssertUnwindSafe(plugin.plugin().initialize())
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(PluginError::Initialize {
                    id,
                    reason: format!("{e:#}"),
                })
            }
            Err(panic) => {
                return Err(PluginError::Initialize {
                    id,
                    reason: panic_message(panic),
                })
            }
        }

        let inserted = self.registry.lock().await.insert(plugin.clone());
        match inserted {
            Ok(descriptor) => {
                info!("Loaded plugin: {} ({})", descriptor.name, descriptor.id);
                Ok(descriptor)
            }
            Err(e) => {
                // Lost a race with another add of the same id
                shutdown_plugin(&plugin).await;
                Err(e)
            }
        }
    }

    /// Shuts a plugin down and removes it. Accepts an id or, failing that, a
    /// case-insensitive name. Returns `false` when nothing matched.
    pub async fn remove(&self, id_or_name: &str) -> bool {
        let (id, plugin) = {
            let mut registry = self.registry.lock().await;
            let Some(id) = registry.resolve(id_or_name) else {
                warn!("Plugin '{id_or_name}' not found.");
                return false;
            };
            let plugin = registry.terminate(&id);
            (id, plugin)
        };

        if let Some(plugin) = plugin {
            shutdown_plugin(&plugin).await;
        }
        self.registry.lock().await.remove(&id);
        info!("Removed plugin: {id}");
        true
    }

    /// Best-effort save of the registry through the store.
    pub async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let records = self.registry.lock().await.records();
        match store.save(&records).await {
            Ok(()) => debug!("Persisted {} plugin records", records.len()),
            Err(e) => warn!("Failed to persist plugin list: {e:#}"),
        }
    }

    // ── Execution ───────────────────────────────────────

    /// Runs a plugin's action. Never fails: unknown, terminated, erroring
    /// and panicking plugins all come back as an outcome.
    pub async fn execute(&self, id: &str, params: Option<PluginParams>) -> PluginOutcome {
        let lookup = self.registry.lock().await.begin_execution(id);
        let plugin = match lookup {
            Lookup::Ready(plugin) => plugin,
            Lookup::NotFound => {
                warn!("Plugin with ID '{id}' not found.");
                return PluginOutcome::NotFound(id.to_string());
            }
            Lookup::NotActive => {
                warn!("Plugin '{id}' is terminated, refusing to execute");
                return PluginOutcome::NotActive(id.to_string());
            }
        };

        let cancel = self.shutdown.child_token();
        let result = AssertUnwindSafe(plugin.plugin().execute(params.as_ref(), cancel))
            .catch_unwind()
            .await;
        self.registry.lock().await.end_execution(id);

        match result {
            Ok(Ok(text)) => {
                info!("Executed plugin: {}", plugin.name());
                PluginOutcome::Completed(text)
            }
            Ok(Err(e)) => {
                error!("Error executing plugin {}: {e:#}", plugin.name());
                PluginOutcome::Failed(format!("{e:#}"))
            }
            Err(panic) => {
                let message = panic_message(panic);
                error!("Plugin {} panicked: {message}", plugin.name());
                PluginOutcome::Failed(format!("plugin panicked: {message}"))
            }
        }
    }

    /// Terminates every plugin at host exit. Entries stay in the registry as
    /// `Terminated`; in-flight executions see their cancel token fire.
    pub async fn shutdown_all(&self) {
        self.shutdown.cancel();
        let ids = self.registry.lock().await.active_ids();
        for id in ids {
            let plugin = self.registry.lock().await.terminate(&id);
            if let Some(plugin) = plugin {
                shutdown_plugin(&plugin).await;
            }
        }
        info!("All plugins shut down");
    }

    // ── Queries ─────────────────────────────────────────

    pub async fn list(&self) -> Vec<PluginDescriptor> {
        self.registry.lock().await.descriptors()
    }

    pub async fn names(&self) -> Vec<String> {
        self.registry.lock().await.names()
    }

    pub async fn len(&self) -> usize {
        self.registry.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.registry.lock().await.is_empty()
    }

    pub async fn descriptor(&self, id: &str) -> Option<PluginDescriptor> {
        self.registry.lock().await.descriptor(id)
    }

    pub async fn state(&self, id: &str) -> Option<PluginState> {
        self.registry.lock().await.state(id)
    }
}

/// Default-constructs one plugin, then checks `is_compatible()`.
fn instantiate(factory: &BoxedFactory, module: &LoadedModule) -> Result<LoadedPlugin, PluginError> {
    let instance = construct(factory.as_ref(), module.path())?;
    Ok(LoadedPlugin::from_unit(
        instance,
        module.library().cloned(),
        module.path().to_path_buf(),
    ))
}

fn construct(
    factory: &dyn Fn() -> Box<dyn ToolbarPlugin>,
    path: &Path,
) -> Result<Box<dyn ToolbarPlugin>, PluginError> {
    let instance = std::panic::catch_unwind(AssertUnwindSafe(factory)).map_err(|_| {
        PluginError::ConstructorPanicked {
            path: path.to_path_buf(),
        }
    })?;
    if !instance.is_compatible() {
        return Err(PluginError::Incompatible(instance.id().to_string()));
    }
    Ok(instance)
}

async fn shutdown_plugin(plugin: &LoadedPlugin) {
    match AssertUnwindSafe(plugin.plugin().shutdown())
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => debug!("Plugin {} shut down", plugin.id()),
        Ok(Err(e)) => warn!("Plugin {} failed to shut down cleanly: {e:#}", plugin.id()),
        Err(panic) => warn!(
            "Plugin {} panicked during shutdown: {}",
            plugin.id(),
            panic_message(panic)
        ),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
