//! Registry of bus-master backends.
//!
//! Constructed at startup, populated via `register()`, and passed to
//! whoever creates the master. No global state.

use crate::drivers::simulation;
use ecat_common::bus::config::MasterConfig;
use ecat_common::bus::master::{BusMaster, MasterError, MasterFactory};
use std::collections::HashMap;
use std::sync::Arc;

/// Backend factories by name.
pub struct MasterRegistry {
    factories: HashMap<&'static str, MasterFactory>,
}

impl MasterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every backend built into this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("simulation", simulation::create_master);
        registry
    }

    /// Register a backend factory.
    ///
    /// # Panics
    /// Panics if a backend with the same name is already registered.
    pub fn register(&mut self, name: &'static str, factory: MasterFactory) {
        if self.factories.contains_key(name) {
            panic!("Master backend '{name}' is already registered");
        }
        self.factories.insert(name, factory);
    }

    /// Get a backend factory by name.
    pub fn get_factory(&self, name: &str) -> Option<MasterFactory> {
        self.factories.get(name).copied()
    }

    /// Create a master by backend name.
    ///
    /// # Errors
    /// `MasterError::BackendNotFound` for an unknown name, or whatever the
    /// factory reports.
    pub fn create_master(
        &self,
        name: &str,
        config: &MasterConfig,
    ) -> Result<Arc<dyn BusMaster>, MasterError> {
        let factory = self
            .get_factory(name)
            .ok_or_else(|| MasterError::BackendNotFound(name.to_string()))?;
        factory(config)
    }

    /// All registered backend names, sorted.
    pub fn list_backends(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for MasterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
