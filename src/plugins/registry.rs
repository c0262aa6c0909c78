//! Plugin registry: id → loaded plugin, in discovery order.
//!
//! Plain data structure with no locking of its own; `PluginRuntime` owns it
//! behind a mutex and never awaits plugin code while holding that lock.

use std::sync::Arc;

use indexmap::IndexMap;

use super::{LoadedPlugin, PluginDescriptor, PluginError, PluginRecord, PluginState};

struct PluginEntry {
    plugin: Arc<LoadedPlugin>,
    state: PluginState,
    in_flight: usize,
}

/// Result of asking the registry for an executable plugin.
pub enum Lookup {
    Ready(Arc<LoadedPlugin>),
    NotFound,
    NotActive,
}

#[derive(Default)]
pub struct PluginRegistry {
    entries: IndexMap<String, PluginEntry>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Adds an initialized plugin. Ids stay unique.
    pub fn insert(&mut self, plugin: Arc<LoadedPlugin>) -> Result<PluginDescriptor, PluginError> {
        let id = plugin.id().to_string();
        if self.entries.contains_key(&id) {
            return Err(PluginError::Duplicate(id));
        }
        let descriptor = plugin.descriptor(PluginState::Ready);
        self.entries.insert(
            id,
            PluginEntry {
                plugin,
                state: PluginState::Ready,
                in_flight: 0,
            },
        );
        Ok(descriptor)
    }

    /// Marks one more execution in flight and hands out the plugin.
    pub fn begin_execution(&mut self, id: &str) -> Lookup {
        match self.entries.get_mut(id) {
            None => Lookup::NotFound,
            Some(entry) if entry.state == PluginState::Terminated => Lookup::NotActive,
            Some(entry) => {
                entry.in_flight += 1;
                entry.state = PluginState::Executing;
                Lookup::Ready(entry.plugin.clone())
            }
        }
    }

    /// Counterpart of `begin_execution`. A plugin terminated meanwhile stays
    /// terminated.
    pub fn end_execution(&mut self, id: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
            if entry.in_flight == 0 && entry.state == PluginState::Executing {
                entry.state = PluginState::Ready;
            }
        }
    }

    /// Flags a plugin as terminated and returns it so the caller can run
    /// its shutdown. `None` when missing or already terminated.
    pub fn terminate(&mut self, id: &str) -> Option<Arc<LoadedPlugin>> {
        let entry = self.entries.get_mut(id)?;
        if entry.state == PluginState::Terminated {
            return None;
        }
        entry.state = PluginState::Terminated;
        Some(entry.plugin.clone())
    }

    /// Removes an entry, keeping the order of the others.
    pub fn remove(&mut self, id: &str) -> Option<Arc<LoadedPlugin>> {
        self.entries.shift_remove(id).map(|entry| entry.plugin)
    }

    /// Exact id first, then a case-insensitive name match.
    pub fn resolve(&self, id_or_name: &str) -> Option<String> {
        if self.entries.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        self.entries
            .iter()
            .find(|(_, entry)| entry.plugin.name().eq_ignore_ascii_case(id_or_name))
            .map(|(id, _)| id.clone())
    }

    pub fn state(&self, id: &str) -> Option<PluginState> {
        self.entries.get(id).map(|entry| entry.state)
    }

    pub fn descriptor(&self, id: &str) -> Option<PluginDescriptor> {
        self.entries
            .get(id)
            .map(|entry| entry.plugin.descriptor(entry.state))
    }

    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        self.entries
            .values()
            .map(|entry| entry.plugin.descriptor(entry.state))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .values()
            .map(|entry| entry.plugin.name().to_string())
            .collect()
    }

    /// Ids of every plugin not yet terminated.
    pub fn active_ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.state != PluginState::Terminated)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Records for plugins that came from a file.
    pub fn records(&self) -> Vec<PluginRecord> {
        self.entries
            .values()
            .filter_map(|entry| {
                let source = entry.plugin.source()?;
                Some(PluginRecord {
                    id: entry.plugin.id().to_string(),
                    name: entry.plugin.name().to_string(),
                    version: entry.plugin.plugin().version().to_string(),
                    source: source.clone(),
                })
            })
            .collect()
    }

    pub fn has_source(&self, path: &std::path::Path) -> bool {
        self.entries
            .values()
            .any(|entry| entry.plugin.source().is_some_and(|s| s == path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::testing::{Behavior, TestPlugin};

    fn plugin(id: &str) -> Arc<LoadedPlugin> {
        Arc::new(TestPlugin::loaded(id, Behavior::Echo))
    }

    #[test]
    fn test_insert_keeps_discovery_order() {
        let mut registry = PluginRegistry::new();
        for id in ["zeta", "alpha", "mid"] {
            registry.insert(plugin(id)).unwrap();
        }
        assert_eq!(registry.names(), vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut registry = PluginRegistry::new();
        registry.insert(plugin("clock")).unwrap();
        let err = registry.insert(plugin("clock")).unwrap_err();
        assert!(matches!(err, PluginError::Duplicate(ref id) if id == "clock"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_execution_state_transitions() {
        let mut registry = PluginRegistry::new();
        registry.insert(plugin("clock")).unwrap();
        assert_eq!(registry.state("clock"), Some(PluginState::Ready));

        assert!(matches!(registry.begin_execution("clock"), Lookup::Ready(_)));
        assert!(matches!(registry.begin_execution("clock"), Lookup::Ready(_)));
        assert_eq!(registry.state("clock"), Some(PluginState::Executing));

        registry.end_execution("clock");
        assert_eq!(registry.state("clock"), Some(PluginState::Executing));
        registry.end_execution("clock");
        assert_eq!(registry.state("clock"), Some(PluginState::Ready));
    }

    #[test]
    fn test_terminated_plugin_is_not_active() {
        let mut registry = PluginRegistry::new();
        registry.insert(plugin("clock")).unwrap();
        assert!(registry.terminate("clock").is_some());
        assert!(registry.terminate("clock").is_none());
        assert!(matches!(registry.begin_execution("clock"), Lookup::NotActive));
        assert!(registry.active_ids().is_empty());
    }

    #[test]
    fn test_termination_during_execution_sticks() {
        let mut registry = PluginRegistry::new();
        registry.insert(plugin("clock")).unwrap();
        let _ = registry.begin_execution("clock");
        registry.terminate("clock");
        registry.end_execution("clock");
        assert_eq!(registry.state("clock"), Some(PluginState::Terminated));
    }

    #[test]
    fn test_unknown_id_not_found() {
        let mut registry = PluginRegistry::new();
        assert!(matches!(registry.begin_execution("nope"), Lookup::NotFound));
        assert!(registry.remove("nope").is_none());
    }

    #[test]
    fn test_resolve_falls_back_to_name() {
        let mut registry = PluginRegistry::new();
        registry.insert(plugin("Clock")).unwrap();
        assert_eq!(registry.resolve("Clock").as_deref(), Some("Clock"));
        assert_eq!(registry.resolve("clock").as_deref(), Some("Clock"));
        assert_eq!(registry.resolve("weather"), None);
    }

    #[test]
    fn test_remove_preserves_order() {
        let mut registry = PluginRegistry::new();
        for id in ["a", "b", "c"] {
            registry.insert(plugin(id)).unwrap();
        }
        registry.remove("b");
        assert_eq!(registry.names(), vec!["a", "c"]);
    }

    #[test]
    fn test_in_process_plugins_have_no_record() {
        let mut registry = PluginRegistry::new();
        registry.insert(plugin("clock")).unwrap();
        assert!(registry.records().is_empty());
    }
}
