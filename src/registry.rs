//! The process-scoped registry: configured KBs plus the merged capability set.
//!
//! Built once at startup and passed by `Arc` to the synchronizer, the search
//! engine, and the dispatcher.

use crate::config::Config;
use crate::dispatch::ToolSpec;
use crate::kb::{KbRegistry, host_entry_types};
use crate::plugin::{Capabilities, PluginRegistry, PluginSource};

#[derive(Debug)]
pub struct Registry {
    kbs: KbRegistry,
    capabilities: Capabilities,
}

impl Registry {
    /// Register host tools, then every plugin from `sources` in order, then
    /// build KBs with the merged entry types.
    ///
    /// Plugin failures are quarantined, never returned.
    #[must_use]
    pub fn build(config: &Config, host_tools: Vec<ToolSpec>, sources: &[&dyn PluginSource]) -> Self {
        let mut plugins = PluginRegistry::new(host_entry_types(config), &config.plugins.disabled);
        for tool in host_tools {
            if let Err(e) = plugins.register_host_tool(tool) {
                tracing::error!(error = %e, "skipping built-in tool");
            }
        }
        for source in sources {
            plugins.load(*source);
        }
        let capabilities = plugins.finish();
        let kbs = KbRegistry::from_config(config, &capabilities);
        Self { kbs, capabilities }
    }

    #[must_use]
    pub fn kbs(&self) -> &KbRegistry {
        &self.kbs
    }

    #[must_use]
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }
}
