//! Plugin capability descriptors and sources.
//!
//! A plugin is nothing more than a [`PluginDescriptor`]: a name plus the entry
//! types, tools, and hooks it contributes. How descriptors are found is the
//! business of a [`PluginSource`]; the [`PluginRegistry`] merges whatever the
//! sources yield into the host's [`Capabilities`].

pub mod manifest;
pub mod registry;

use serde::Serialize;
use thiserror::Error;

use crate::dispatch::ToolSpec;
use crate::dispatch::hooks::HookSpec;
use crate::entry::EntryTypeSchema;

pub use manifest::ManifestPluginSource;
pub use registry::{Capabilities, PluginRegistry, PluginReport, RegisteredTool};

/// Why a plugin was quarantined.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PluginError {
    #[error("Plugin '{plugin}' conflicts with an existing capability: {message}")]
    Conflict { plugin: String, message: String },

    #[error("Plugin '{plugin}' failed to load: {message}")]
    Load { plugin: String, message: String },
}

impl PluginError {
    pub(crate) fn conflict(plugin: &str, message: impl Into<String>) -> Self {
        Self::Conflict {
            plugin: plugin.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn load(plugin: &str, message: impl Into<String>) -> Self {
        Self::Load {
            plugin: plugin.to_string(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "PluginConflictError",
            Self::Load { .. } => "PluginLoadError",
        }
    }

    #[must_use]
    pub fn plugin(&self) -> &str {
        match self {
            Self::Conflict { plugin, .. } | Self::Load { plugin, .. } => plugin,
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Conflict { message, .. } | Self::Load { message, .. } => message,
        }
    }
}

/// An entry type contributed by a plugin, optionally limited to some KBs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginEntryType {
    pub schema: EntryTypeSchema,
    /// Empty means every KB.
    pub kbs: Vec<String>,
}

impl PluginEntryType {
    #[must_use]
    pub fn applies_to(&self, kb: &str) -> bool {
        self.kbs.is_empty() || self.kbs.iter().any(|name| name == kb)
    }
}

/// Everything one plugin contributes.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    pub name: String,
    pub entry_types: Vec<PluginEntryType>,
    pub tools: Vec<ToolSpec>,
    pub hooks: Vec<HookSpec>,
}

impl PluginDescriptor {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entry_types: Vec::new(),
            tools: Vec::new(),
            hooks: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_entry_type(mut self, schema: EntryTypeSchema) -> Self {
        self.entry_types.push(PluginEntryType { schema, kbs: vec![] });
        self
    }

    #[must_use]
    pub fn with_scoped_entry_type(mut self, schema: EntryTypeSchema, kbs: &[&str]) -> Self {
        self.entry_types.push(PluginEntryType {
            schema,
            kbs: kbs.iter().map(ToString::to_string).collect(),
        });
        self
    }

    #[must_use]
    pub fn with_tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    #[must_use]
    pub fn with_hook(mut self, hook: HookSpec) -> Self {
        self.hooks.push(hook);
        self
    }
}

/// Somewhere plugin descriptors come from.
///
/// A source reports per-plugin failures in its output instead of failing as a
/// whole, so one broken plugin never hides the others.
pub trait PluginSource: Send + Sync {
    fn discover(&self) -> Vec<Result<PluginDescriptor, PluginError>>;
}

/// In-process plugins with native handlers.
#[derive(Debug, Default)]
pub struct StaticPluginSource {
    plugins: Vec<PluginDescriptor>,
}

impl StaticPluginSource {
    #[must_use]
    pub fn new(plugins: Vec<PluginDescriptor>) -> Self {
        Self { plugins }
    }

    pub fn push(&mut self, plugin: PluginDescriptor) {
        self.plugins.push(plugin);
    }
}

impl PluginSource for StaticPluginSource {
    fn discover(&self) -> Vec<Result<PluginDescriptor, PluginError>> {
        self.plugins.iter().cloned().map(Ok).collect()
    }
}
