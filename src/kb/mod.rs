//! Knowledge base registry.
//!
//! Maps KB names to their root directory and merged entry types. The set is
//! fixed at startup; an admin reload replaces one KB's definition wholesale.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::config::{Config, KbConfig};
use crate::entry::{EntryContext, EntryTypeSchema};
use crate::plugin::Capabilities;

/// A loaded knowledge base definition.
#[derive(Debug, Clone, Serialize)]
pub struct Kb {
    pub name: String,
    pub root: PathBuf,
    pub git: bool,
    /// Parser context with host and plugin types merged.
    pub context: EntryContext,
}

impl Kb {
    /// Build a KB from its config, merging plugin-contributed entry types.
    #[must_use]
    pub fn from_config(config: &KbConfig, capabilities: &Capabilities) -> Self {
        let mut types: BTreeMap<String, EntryTypeSchema> = config
            .types
            .iter()
            .map(|schema| (schema.name.clone(), schema.clone()))
            .collect();

        for schema in capabilities.entry_types_for(&config.name) {
            types.entry(schema.name.clone()).or_insert_with(|| schema.clone());
        }

        Self {
            name: config.name.clone(),
            root: config.root_path(),
            git: config.git,
            context: EntryContext {
                kb: config.name.clone(),
                types,
                defaults: config.defaults.clone(),
            },
        }
    }

    /// Names of all entry types this KB accepts.
    #[must_use]
    pub fn entry_types(&self) -> Vec<&str> {
        self.context.types.keys().map(String::as_str).collect()
    }
}

/// Entry type names declared by the host configuration across all KBs.
#[must_use]
pub fn host_entry_types(config: &Config) -> BTreeSet<String> {
    config
        .kbs
        .iter()
        .flat_map(|kb| kb.types.iter().map(|schema| schema.name.clone()))
        .collect()
}

/// Registry of configured knowledge bases.
#[derive(Debug, Default)]
pub struct KbRegistry {
    kbs: RwLock<BTreeMap<String, Arc<Kb>>>,
}

impl KbRegistry {
    #[must_use]
    pub fn from_config(config: &Config, capabilities: &Capabilities) -> Self {
        let kbs = config
            .kbs
            .iter()
            .map(|kb| (kb.name.clone(), Arc::new(Kb::from_config(kb, capabilities))))
            .collect();
        Self {
            kbs: RwLock::new(kbs),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Kb>> {
        self.kbs.read().get(name).cloned()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.kbs.read().keys().cloned().collect()
    }

    #[must_use]
    pub fn all(&self) -> Vec<Arc<Kb>> {
        self.kbs.read().values().cloned().collect()
    }

    /// Replace an existing KB definition. Returns false if the name is unknown.
    pub fn replace(&self, kb: Kb) -> bool {
        let mut kbs = self.kbs.write();
        match kbs.get_mut(&kb.name) {
            Some(slot) => {
                *slot = Arc::new(kb);
                true
            }
            None => false,
        }
    }
}
