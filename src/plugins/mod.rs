pub mod command;
pub mod loader;
pub mod registry;
pub mod runtime;
pub mod store;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

pub use command::{CommandManifest, CommandPlugin};
pub use loader::{LoadedModule, UnitKind};
pub use registry::PluginRegistry;
pub use runtime::{DiscoveryFailure, DiscoveryReport, PluginRuntime};
pub use store::{JsonPluginStore, PluginRecord, PluginStore};

/// Bumped whenever `ToolbarPlugin` or `PluginDeclaration` change shape.
pub const ABI_VERSION: u32 = 1;

/// Version of this crate, stamped into every native plugin at build time.
pub const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Symbol every native plugin unit exports (see `declare_toolbar_plugin!`).
pub const DECLARATION_SYMBOL: &[u8] = b"toolbar_plugin_declaration\0";

/// Named arguments passed to a plugin execution.
pub type PluginParams = HashMap<String, serde_json::Value>;

/// A toolbar extension.
///
/// Native units, command manifests and in-process plugins all implement
/// this trait. The runtime calls `is_compatible()` once after construction,
/// `initialize()` before the first `execute()`, and `shutdown()` before the
/// plugin leaves the registry.
#[async_trait]
pub trait ToolbarPlugin: Send + Sync {
    /// Registry key. Must be unique among loaded plugins.
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn version(&self) -> &str;

    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs the plugin's action and returns a text result for the toolbar.
    /// `cancel` fires when the host shuts down.
    async fn execute(
        &self,
        params: Option<&PluginParams>,
        cancel: CancellationToken,
    ) -> anyhow::Result<String>;

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Checked once, right after construction. `false` rejects the plugin.
    fn is_compatible(&self) -> bool {
        true
    }
}

/// Constructs one plugin instance.
pub type PluginFactory = fn() -> Box<dyn ToolbarPlugin>;

/// Receives the factories a unit exposes.
pub trait PluginRegistrar {
    fn register(&mut self, factory: PluginFactory);
}

/// The single entry point exported by a native plugin unit.
#[derive(Clone, Copy)]
pub struct PluginDeclaration {
    pub abi_version: u32,
    pub core_version: &'static str,
    pub register: fn(&mut dyn PluginRegistrar),
}

/// Exports the declaration of a native plugin unit.
///
/// ```ignore
/// toolbar_kit::declare_toolbar_plugin!(|| Box::new(ClockPlugin::default()));
/// ```
#[macro_export]
macro_rules! declare_toolbar_plugin {
    ($($factory:expr),+ $(,)?) => {
        #[doc(hidden)]
        #[no_mangle]
        #[allow(non_upper_case_globals)]
        pub static toolbar_plugin_declaration: $crate::plugins::PluginDeclaration =
            $crate::plugins::PluginDeclaration {
                abi_version: $crate::plugins::ABI_VERSION,
                core_version: $crate::plugins::CORE_VERSION,
                register: {
                    fn __register(registrar: &mut dyn $crate::plugins::PluginRegistrar) {
                        $( registrar.register($factory); )+
                    }
                    __register
                },
            };
    };
}

/// Lifecycle of a plugin instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Unloaded,
    /// Constructed and compatible, not yet initialized
    Loaded,
    Ready,
    /// At least one `execute()` in flight
    Executing,
    /// `shutdown()` was requested; no further executions
    Terminated,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unloaded => "unloaded",
            Self::Loaded => "loaded",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Public view of a registry entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub state: PluginState,
}

/// A constructed plugin together with what keeps its code alive.
///
/// Field order matters: the instance is dropped before the library that
/// contains its code.
pub struct LoadedPlugin {
    instance: Box<dyn ToolbarPlugin>,
    library: Option<Arc<libloading::Library>>,
    source: Option<PathBuf>,
}

impl LoadedPlugin {
    /// Wraps a plugin compiled into the host.
    pub fn in_process(instance: Box<dyn ToolbarPlugin>) -> Self {
        Self {
            instance,
            library: None,
            source: None,
        }
    }

    pub(crate) fn from_unit(
        instance: Box<dyn ToolbarPlugin>,
        library: Option<Arc<libloading::Library>>,
        source: PathBuf,
    ) -> Self {
        Self {
            instance,
            library,
            source: Some(source),
        }
    }

    pub fn plugin(&self) -> &dyn ToolbarPlugin {
        self.instance.as_ref()
    }

    pub fn id(&self) -> &str {
        self.instance.id()
    }

    pub fn name(&self) -> &str {
        self.instance.name()
    }

    /// File the plugin was loaded from, if any.
    pub fn source(&self) -> Option<&PathBuf> {
        self.source.as_ref()
    }

    pub fn is_native(&self) -> bool {
        self.library.is_some()
    }

    pub fn descriptor(&self, state: PluginState) -> PluginDescriptor {
        PluginDescriptor {
            id: self.instance.id().to_string(),
            name: self.instance.name().to_string(),
            description: self.instance.description().to_string(),
            version: self.instance.version().to_string(),
            state,
        }
    }
}

impl fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("id", &self.id())
            .field("source", &self.source)
            .field("native", &self.is_native())
            .finish()
    }
}

/// What `PluginRuntime::execute` produced. Soft conditions are variants,
/// not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginOutcome {
    Completed(String),
    NotFound(String),
    NotActive(String),
    Failed(String),
}

impl PluginOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

impl fmt::Display for PluginOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed(text) => f.write_str(text),
            Self::NotFound(id) => write!(f, "Plugin with ID '{id}' not found."),
            Self::NotActive(id) => write!(f, "Plugin '{id}' is not active."),
            Self::Failed(message) => write!(f, "Error executing plugin: {message}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("plugin directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot open {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("{path} does not export a toolbar plugin declaration: {reason}")]
    MissingDeclaration { path: PathBuf, reason: String },

    #[error("{path} was built for ABI {found_abi} / core {found_core}, which this host does not support")]
    AbiMismatch {
        path: PathBuf,
        found_abi: u32,
        found_core: String,
    },

    #[error("invalid plugin manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("{0} is not a plugin unit")]
    UnsupportedUnit(PathBuf),

    #[error("plugin '{0}' reports it is not compatible with this host")]
    Incompatible(String),

    #[error("plugin constructor in {path} panicked")]
    ConstructorPanicked { path: PathBuf },

    #[error("a plugin with ID '{0}' is already loaded")]
    Duplicate(String),

    #[error("plugin '{id}' failed to initialize: {reason}")]
    Initialize { id: String, reason: String },
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process plugins used by the runtime and bridge tests.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[derive(Clone, Copy, PartialEq)]
    pub enum Behavior {
        Echo,
        Fail,
        Panic,
        Hang,
        FailInit,
        Incompatible,
    }

    pub struct TestPlugin {
        pub id: String,
        pub behavior: Behavior,
        pub shutdowns: Arc<AtomicUsize>,
    }

    impl TestPlugin {
        pub fn boxed(id: &str, behavior: Behavior) -> Box<dyn ToolbarPlugin> {
            Box::new(Self {
                id: id.to_string(),
                behavior,
                shutdowns: Arc::new(AtomicUsize::new(0)),
            })
        }

        pub fn loaded(id: &str, behavior: Behavior) -> LoadedPlugin {
            LoadedPlugin::in_process(Self::boxed(id, behavior))
        }
    }

    #[async_trait]
    impl ToolbarPlugin for TestPlugin {
        fn id(&self) -> &str {
            &self.id
        }

        fn name(&self) -> &str {
            &self.id
        }

        fn description(&self) -> &str {
            "test plugin"
        }

        fn version(&self) -> &str {
            "0.0.1"
        }

        async fn initialize(&self) -> anyhow::Result<()> {
            if self.behavior == Behavior::FailInit {
                anyhow::bail!("missing settings");
            }
            Ok(())
        }

        async fn execute(
            &self,
            params: Option<&PluginParams>,
            cancel: CancellationToken,
        ) -> anyhow::Result<String> {
            match self.behavior {
                Behavior::Fail => anyhow::bail!("disk on fire"),
                Behavior::Panic => panic!("plugin bug"),
                Behavior::Hang => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(3600)) => Ok("woke".into()),
                        _ = cancel.cancelled() => Ok("cancelled".into()),
                    }
                }
                _ => {
                    let arg = params
                        .and_then(|p| p.get("arg"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("none");
                    Ok(format!("{} ran with {arg}", self.id))
                }
            }
        }

        async fn shutdown(&self) -> anyhow::Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_compatible(&self) -> bool {
            self.behavior != Behavior::Incompatible
        }
    }
}
