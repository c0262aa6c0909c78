//! Turns a file into plugin factories.
//!
//! Two unit kinds are recognised by extension:
//!
//! - native libraries (`.so` / `.dylib` / `.dll`) exporting the
//!   `toolbar_plugin_declaration` static produced by `declare_toolbar_plugin!`
//! - command manifests (`.toml`), see `command.rs`
//!
//! A native library stays mapped for as long as any plugin built from it
//! (or the runtime that loaded it) is alive.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use tracing::{debug, info};

use super::{
    CommandManifest, CommandPlugin, PluginDeclaration, PluginError, PluginFactory,
    PluginRegistrar, ToolbarPlugin, ABI_VERSION, CORE_VERSION, DECLARATION_SYMBOL,
};
use crate::exec::ProcessEngine;

pub(crate) type BoxedFactory = Box<dyn Fn() -> Box<dyn ToolbarPlugin> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Native,
    Manifest,
}

impl UnitKind {
    /// Classifies a path by extension. `None` for files that are not units.
    pub fn detect(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        if ext == std::env::consts::DLL_EXTENSION {
            Some(Self::Native)
        } else if ext == "toml" {
            Some(Self::Manifest)
        } else {
            None
        }
    }
}

/// One loaded unit and the factories it exposed.
pub struct LoadedModule {
    path: PathBuf,
    kind: UnitKind,
    library: Option<Arc<Library>>,
    factories: Vec<BoxedFactory>,
}

impl LoadedModule {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn library(&self) -> Option<&Arc<Library>> {
        self.library.as_ref()
    }

    /// Number of plugin factories the unit registered.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub(crate) fn factories(&self) -> &[BoxedFactory] {
        &self.factories
    }
}

struct FactoryCollector(Vec<PluginFactory>);

impl PluginRegistrar for FactoryCollector {
    fn register(&mut self, factory: PluginFactory) {
        self.0.push(factory);
    }
}

/// Opens a unit and collects its factories. Nothing is constructed yet.
pub fn load_unit(path: &Path, engine: &ProcessEngine) -> Result<LoadedModule, PluginError> {
    match UnitKind::detect(path) {
        Some(UnitKind::Native) => load_native(path),
        Some(UnitKind::Manifest) => load_manifest(path, engine),
        None => Err(PluginError::UnsupportedUnit(path.to_path_buf())),
    }
}

fn load_native(path: &Path) -> Result<LoadedModule, PluginError> {
    // SAFETY: plugins run fully trusted; loading runs the library's
    // initializers, which is the point of installing a plugin.
    let library = unsafe { Library::new(path) }.map_err(|e| PluginError::Open {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    // SAFETY: the symbol is the static emitted by `declare_toolbar_plugin!`,
    // checked for ABI and core version before any field is trusted further.
    let declaration: PluginDeclaration = unsafe {
        let symbol = library
            .get::<*const PluginDeclaration>(DECLARATION_SYMBOL)
            .map_err(|e| PluginError::MissingDeclaration {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        symbol.read()
    };

    let factories = collect_factories(path, declaration)?;

    info!("Loaded native plugin unit: {}", path.display());
    Ok(LoadedModule {
        path: path.to_path_buf(),
        kind: UnitKind::Native,
        library: Some(Arc::new(library)),
        factories,
    })
}

/// Checks a declaration's version stamps, then runs its `register` fn.
fn collect_factories(
    path: &Path,
    declaration: PluginDeclaration,
) -> Result<Vec<BoxedFactory>, PluginError> {
    if declaration.abi_version != ABI_VERSION || declaration.core_version != CORE_VERSION {
        return Err(PluginError::AbiMismatch {
            path: path.to_path_buf(),
            found_abi: declaration.abi_version,
            found_core: declaration.core_version.to_string(),
        });
    }

    let mut collector = FactoryCollector(Vec::new());
    (declaration.register)(&mut collector);
    debug!("{} registered {} factories", path.display(), collector.0.len());

    Ok(collector
        .0
        .into_iter()
        .map(|factory| Box::new(move || factory()) as BoxedFactory)
        .collect())
}

fn load_manifest(path: &Path, engine: &ProcessEngine) -> Result<LoadedModule, PluginError> {
    let manifest = CommandManifest::load(path)?;
    let kind = manifest
        .interpreter
        .parse()
        .map_err(|e: crate::exec::ExecError| PluginError::Manifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let engine = engine.clone();
    let factory: BoxedFactory = Box::new(move || {
        Box::new(CommandPlugin::with_kind(manifest.clone(), kind, engine.clone()))
            as Box<dyn ToolbarPlugin>
    });

    info!("Loaded command plugin manifest: {}", path.display());
    Ok(LoadedModule {
        path: path.to_path_buf(),
        kind: UnitKind::Manifest,
        library: None,
        factories: vec![factory],
    })
}
