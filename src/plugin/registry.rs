//! Merging plugin descriptors into the host capability set.
//!
//! Registration is all-or-nothing per plugin: a descriptor is validated in full
//! against what is already registered, and only then committed. Anything that
//! fails lands in the quarantine list of the [`PluginReport`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::commands::validate_identifier;
use crate::dispatch::ToolSpec;
use crate::dispatch::hooks::{HookEvent, RegisteredHook};
use crate::entry::EntryTypeSchema;
use crate::plugin::{PluginDescriptor, PluginEntryType, PluginError, PluginSource};

/// Owner name recorded for built-in tools and config-declared types.
pub const HOST: &str = "host";

/// A tool in the merged capability set.
#[derive(Debug, Clone)]
pub struct RegisteredTool {
    /// `host` or the contributing plugin.
    pub owner: String,
    pub spec: ToolSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSummary {
    pub name: String,
    pub entry_types: Vec<String>,
    pub tools: Vec<String>,
    pub hooks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantinedPlugin {
    pub name: String,
    pub kind: String,
    pub message: String,
}

/// What happened to every plugin seen at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginReport {
    pub active: Vec<PluginSummary>,
    pub quarantined: Vec<QuarantinedPlugin>,
    pub disabled: Vec<String>,
}

/// The authoritative, immutable set of tools, plugin entry types, and hooks.
#[derive(Debug, Default)]
pub struct Capabilities {
    tools: BTreeMap<String, RegisteredTool>,
    entry_types: BTreeMap<String, (String, PluginEntryType)>,
    hooks: HashMap<HookEvent, Vec<RegisteredHook>>,
    report: PluginReport,
}

impl Capabilities {
    #[must_use]
    pub fn tool(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    /// All tools, sorted by name.
    pub fn tools(&self) -> impl Iterator<Item = &RegisteredTool> {
        self.tools.values()
    }

    /// Hooks for `event` in firing order.
    #[must_use]
    pub fn hooks(&self, event: HookEvent) -> &[RegisteredHook] {
        self.hooks.get(&event).map_or(&[], Vec::as_slice)
    }

    /// Plugin-contributed entry types that apply to `kb`.
    pub fn entry_types_for<'a>(&'a self, kb: &'a str) -> impl Iterator<Item = &'a EntryTypeSchema> + 'a {
        self.entry_types
            .values()
            .filter(move |(_, ty)| ty.applies_to(kb))
            .map(|(_, ty)| &ty.schema)
    }

    #[must_use]
    pub fn report(&self) -> &PluginReport {
        &self.report
    }
}

/// Builds [`Capabilities`] from host built-ins and plugin sources.
#[derive(Debug)]
pub struct PluginRegistry {
    capabilities: Capabilities,
    host_types: BTreeSet<String>,
    disabled: BTreeSet<String>,
    plugins: BTreeSet<String>,
    seq: usize,
}

impl PluginRegistry {
    /// `host_types` are the entry type names declared in configuration; plugins
    /// may never redeclare them.
    #[must_use]
    pub fn new(host_types: BTreeSet<String>, disabled: &[String]) -> Self {
        Self {
            capabilities: Capabilities::default(),
            host_types,
            disabled: disabled.iter().cloned().collect(),
            plugins: BTreeSet::new(),
            seq: 0,
        }
    }

    /// Register a built-in tool. Host tools are registered before any plugin.
    ///
    /// # Errors
    ///
    /// Returns `PluginError::Conflict` if a tool with this name already exists.
    pub fn register_host_tool(&mut self, spec: ToolSpec) -> Result<(), PluginError> {
        if self.capabilities.tools.contains_key(&spec.name) {
            return Err(PluginError::conflict(
                HOST,
                format!("built-in tool '{}' registered twice", spec.name),
            ));
        }
        self.capabilities.tools.insert(
            spec.name.clone(),
            RegisteredTool {
                owner: HOST.to_string(),
                spec,
            },
        );
        Ok(())
    }

    /// Validate and commit one plugin. On failure the plugin is quarantined
    /// and nothing it contributes is visible.
    ///
    /// # Errors
    ///
    /// Returns the `PluginError` the plugin was quarantined with.
    pub fn register(&mut self, plugin: PluginDescriptor) -> Result<(), PluginError> {
        if self.disabled.contains(&plugin.name) {
            tracing::info!(plugin = %plugin.name, "plugin disabled by configuration");
            self.capabilities.report.disabled.push(plugin.name);
            return Ok(());
        }

        if let Err(err) = self.validate(&plugin) {
            self.quarantine(&err);
            return Err(err);
        }

        self.commit(plugin);
        Ok(())
    }

    /// Register everything a source yields. Failures are quarantined and logged.
    pub fn load(&mut self, source: &dyn PluginSource) {
        for discovered in source.discover() {
            match discovered {
                Ok(plugin) => {
                    let _ = self.register(plugin);
                }
                Err(err) => self.quarantine(&err),
            }
        }
    }

    /// Freeze the merged set. Hooks end up sorted by priority, then
    /// registration order.
    #[must_use]
    pub fn finish(mut self) -> Capabilities {
        for hooks in self.capabilities.hooks.values_mut() {
            hooks.sort_by_key(|hook| (hook.spec.priority, hook.seq));
        }
        self.capabilities
    }

    fn validate(&self, plugin: &PluginDescriptor) -> Result<(), PluginError> {
        let name = plugin.name.as_str();
        validate_identifier(name, "Plugin name").map_err(|e| PluginError::load(name, e.to_string()))?;
        if name == HOST || self.plugins.contains(name) {
            return Err(PluginError::conflict(name, format!("plugin name '{name}' is already registered")));
        }

        let mut own_types = BTreeSet::new();
        for ty in &plugin.entry_types {
            let type_name = ty.schema.name.as_str();
            validate_identifier(type_name, "Entry type").map_err(|e| PluginError::load(name, e.to_string()))?;
            if self.host_types.contains(type_name) {
                return Err(PluginError::conflict(
                    name,
                    format!("entry type '{type_name}' is declared by the host"),
                ));
            }
            if let Some((owner, _)) = self.capabilities.entry_types.get(type_name) {
                return Err(PluginError::conflict(
                    name,
                    format!("entry type '{type_name}' is already declared by plugin '{owner}'"),
                ));
            }
            if !own_types.insert(type_name) {
                return Err(PluginError::load(name, format!("entry type '{type_name}' declared twice")));
            }
        }

        let mut own_tools = BTreeSet::new();
        for tool in &plugin.tools {
            let tool_name = tool.name.as_str();
            validate_identifier(tool_name, "Tool name").map_err(|e| PluginError::load(name, e.to_string()))?;
            if let Some(existing) = self.capabilities.tools.get(tool_name) {
                return Err(PluginError::conflict(
                    name,
                    format!(
                        "tool '{tool_name}' is already provided by '{}' (tier {})",
                        existing.owner, existing.spec.tier
                    ),
                ));
            }
            if !own_tools.insert(tool_name) {
                return Err(PluginError::load(name, format!("tool '{tool_name}' declared twice")));
            }
        }

        Ok(())
    }

    fn commit(&mut self, plugin: PluginDescriptor) {
        let name = plugin.name;
        let mut summary = PluginSummary {
            name: name.clone(),
            entry_types: Vec::new(),
            tools: Vec::new(),
            hooks: Vec::new(),
        };

        for ty in plugin.entry_types {
            summary.entry_types.push(ty.schema.name.clone());
            self.capabilities
                .entry_types
                .insert(ty.schema.name.clone(), (name.clone(), ty));
        }

        for spec in plugin.tools {
            summary.tools.push(spec.name.clone());
            self.capabilities.tools.insert(
                spec.name.clone(),
                RegisteredTool {
                    owner: name.clone(),
                    spec,
                },
            );
        }

        for spec in plugin.hooks {
            summary.hooks.push(spec.event.to_string());
            self.seq += 1;
            self.capabilities
                .hooks
                .entry(spec.event)
                .or_default()
                .push(RegisteredHook {
                    plugin: name.clone(),
                    spec,
                    seq: self.seq,
                });
        }

        tracing::info!(
            plugin = %name,
            entry_types = summary.entry_types.len(),
            tools = summary.tools.len(),
            hooks = summary.hooks.len(),
            "plugin registered"
        );
        self.plugins.insert(name);
        self.capabilities.report.active.push(summary);
    }

    fn quarantine(&mut self, err: &PluginError) {
        tracing::warn!(plugin = %err.plugin(), kind = err.kind(), error = %err.message(), "plugin quarantined");
        self.capabilities.report.quarantined.push(QuarantinedPlugin {
            name: err.plugin().to_string(),
            kind: err.kind().to_string(),
            message: err.message().to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::dispatch::hooks::{HookContext, HookSpec};
    use crate::dispatch::{Tier, ToolCategory};
    use crate::plugin::StaticPluginSource;

    fn tool(name: &str, tier: Tier) -> ToolSpec {
        ToolSpec::new(name, tier, ToolCategory::Plugin, "test tool", |_ctx, _args| Ok(json!(null)))
    }

    fn registry() -> PluginRegistry {
        let mut registry = PluginRegistry::new(BTreeSet::from(["note".to_string()]), &[]);
        registry.register_host_tool(tool("search", Tier::Read)).unwrap();
        registry
    }

    #[test]
    fn first_registered_tool_wins() {
        let mut registry = registry();
        registry
            .register(PluginDescriptor::new("first").with_tool(tool("export", Tier::Read)))
            .unwrap();
        let err = registry
            .register(PluginDescriptor::new("second").with_tool(tool("export", Tier::Admin)))
            .unwrap_err();
        assert_eq!(err.kind(), "PluginConflictError");

        let caps = registry.finish();
        let export = caps.tool("export").unwrap();
        assert_eq!(export.owner, "first");
        assert_eq!(export.spec.tier, Tier::Read);
        assert_eq!(caps.report().quarantined[0].name, "second");
    }

    #[test]
    fn plugin_cannot_shadow_host_tool_or_type() {
        let mut registry = registry();
        assert!(
            registry
                .register(PluginDescriptor::new("shadow").with_tool(tool("search", Tier::Read)))
                .is_err()
        );
        assert!(
            registry
                .register(PluginDescriptor::new("typed").with_entry_type(EntryTypeSchema::named("note")))
                .is_err()
        );
        let caps = registry.finish();
        assert_eq!(caps.tool("search").unwrap().owner, HOST);
        assert_eq!(caps.report().quarantined.len(), 2);
    }

    #[test]
    fn quarantine_is_all_or_nothing() {
        let mut registry = registry();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let plugin = PluginDescriptor::new("partial")
            .with_entry_type(EntryTypeSchema::named("recipe"))
            .with_tool(tool("fresh_tool", Tier::Read))
            .with_tool(tool("search", Tier::Read))
            .with_hook(HookSpec::new(
                HookEvent::Before(ToolCategory::Query),
                0,
                false,
                move |_ctx| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            ));
        assert!(registry.register(plugin).is_err());

        let caps = registry.finish();
        assert!(caps.tool("fresh_tool").is_none());
        assert_eq!(caps.entry_types_for("notes").count(), 0);
        assert!(caps.hooks(HookEvent::Before(ToolCategory::Query)).is_empty());
        assert!(caps.report().active.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn duplicate_plugin_names_are_quarantined() {
        let mut registry = registry();
        registry.register(PluginDescriptor::new("dup")).unwrap();
        let err = registry.register(PluginDescriptor::new("dup")).unwrap_err();
        assert_eq!(err.kind(), "PluginConflictError");
    }

    #[test]
    fn invalid_names_fail_to_load() {
        let mut registry = registry();
        let err = registry
            .register(PluginDescriptor::new("bad").with_tool(tool("../escape", Tier::Read)))
            .unwrap_err();
        assert_eq!(err.kind(), "PluginLoadError");
    }

    #[test]
    fn hooks_sort_by_priority_then_registration() {
        let mut registry = registry();
        let noop = |_ctx: &HookContext<'_>| -> Result<(), String> { Ok(()) };
        let event = HookEvent::After(ToolCategory::Mutation);
        registry
            .register(
                PluginDescriptor::new("a")
                    .with_hook(HookSpec::new(event, 10, false, noop))
                    .with_hook(HookSpec::new(event, 0, false, noop)),
            )
            .unwrap();
        registry
            .register(PluginDescriptor::new("b").with_hook(HookSpec::new(event, 0, false, noop)))
            .unwrap();

        let caps = registry.finish();
        let order: Vec<(&str, i32)> = caps
            .hooks(event)
            .iter()
            .map(|hook| (hook.plugin.as_str(), hook.spec.priority))
            .collect();
        assert_eq!(order, vec![("a", 0), ("b", 0), ("a", 10)]);
    }

    #[test]
    fn scoped_entry_types_apply_only_to_their_kbs() {
        let mut registry = registry();
        registry
            .register(
                PluginDescriptor::new("recipes")
                    .with_scoped_entry_type(EntryTypeSchema::named("recipe"), &["kitchen"])
                    .with_entry_type(EntryTypeSchema::named("bookmark")),
            )
            .unwrap();
        let caps = registry.finish();

        let kitchen: Vec<&str> = caps.entry_types_for("kitchen").map(|s| s.name.as_str()).collect();
        assert_eq!(kitchen, vec!["bookmark", "recipe"]);
        let notes: Vec<&str> = caps.entry_types_for("notes").map(|s| s.name.as_str()).collect();
        assert_eq!(notes, vec!["bookmark"]);
    }

    #[test]
    fn disabled_plugins_are_skipped() {
        let mut registry = PluginRegistry::new(BTreeSet::new(), &["noisy".to_string()]);
        registry.load(&StaticPluginSource::new(vec![
            PluginDescriptor::new("noisy").with_tool(tool("noise", Tier::Read)),
        ]));
        let caps = registry.finish();
        assert!(caps.tool("noise").is_none());
        assert_eq!(caps.report().disabled, vec!["noisy"]);
    }

    #[test]
    fn source_errors_are_quarantined_without_affecting_others() {
        struct Mixed;
        impl PluginSource for Mixed {
            fn discover(&self) -> Vec<Result<PluginDescriptor, PluginError>> {
                vec![
                    Err(PluginError::load("broken", "manifest unreadable")),
                    Ok(PluginDescriptor::new("fine").with_tool(tool("fine_tool", Tier::Read))),
                ]
            }
        }

        let mut registry = registry();
        registry.load(&Mixed);
        let caps = registry.finish();
        assert!(caps.tool("fine_tool").is_some());
        assert!(caps.tool("search").is_some());
        assert_eq!(caps.report().quarantined[0].kind, "PluginLoadError");
    }
}
