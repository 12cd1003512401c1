//! Module catalog: identity -> setup entry point
//!
//! The resolver decides which modules exist and in which order; the catalog
//! supplies the code behind each identity. Swapping the catalog and reloading
//! replaces the whole module set without restarting the process.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::module::Registrar;

/// A module's `setup` entry point
#[async_trait]
pub trait ModuleEntry: Send + Sync {
    async fn setup(&self, registrar: &mut Registrar<'_>) -> anyhow::Result<()>;
}

/// Known module entry points keyed by identity
#[derive(Clone, Default)]
pub struct ModuleCatalog {
    entries: BTreeMap<String, Arc<dyn ModuleEntry>>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry (builder pattern).
    pub fn with<E: ModuleEntry + 'static>(mut self, identity: impl Into<String>, entry: E) -> Self {
        self.insert(identity, entry);
        self
    }

    /// Add or replace an entry.
    pub fn insert<E: ModuleEntry + 'static>(&mut self, identity: impl Into<String>, entry: E) {
        self.entries.insert(identity.into(), Arc::new(entry));
    }

    pub fn get(&self, identity: &str) -> Option<Arc<dyn ModuleEntry>> {
        self.entries.get(identity).cloned()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
