//! Data-only plugins described by TOML manifests.
//!
//! A manifest can declare entry types, saved-search tools, and declarative
//! hooks. Each `*.toml` file in a configured plugin directory is one plugin.
//!
//! ```toml
//! name = "decisions"
//!
//! [[entry_types]]
//! name = "decision"
//! required = ["status"]
//! kbs = ["work"]
//!
//! [[tools]]
//! name = "open_decisions"
//! description = "Decisions still open"
//! query = "open"
//! entry_type = "decision"
//!
//! [[hooks]]
//! event = "before:mutation"
//! blocking = true
//! action = { kind = "require_arguments", arguments = ["kb"] }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::dispatch::hooks::{HookContext, HookEvent, HookSpec};
use crate::dispatch::{Tier, ToolCategory, ToolContext, ToolError, ToolSpec};
use crate::entry::EntryTypeSchema;
use crate::plugin::{PluginDescriptor, PluginEntryType, PluginError, PluginSource};
use crate::search::SearchRequest;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    name: String,
    #[serde(default)]
    entry_types: Vec<ManifestEntryType>,
    #[serde(default)]
    tools: Vec<SavedSearch>,
    #[serde(default)]
    hooks: Vec<ManifestHook>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestEntryType {
    name: String,
    #[serde(default)]
    required: Vec<String>,
    #[serde(default)]
    optional: Vec<String>,
    #[serde(default)]
    kbs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SavedSearch {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_tier")]
    tier: Tier,
    query: String,
    #[serde(default)]
    kbs: Vec<String>,
    #[serde(default)]
    entry_type: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

fn default_tier() -> Tier {
    Tier::Read
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestHook {
    event: String,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    blocking: bool,
    /// Restrict the hook to these tools; empty means all tools of the category.
    #[serde(default)]
    tools: Vec<String>,
    action: HookAction,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
enum HookAction {
    /// Always fail with `message`.
    Deny { message: String },
    /// Fail unless every named argument is present and non-null.
    RequireArguments { arguments: Vec<String> },
    /// Emit a log line.
    Log {
        #[serde(default)]
        message: Option<String>,
    },
}

impl HookAction {
    fn apply(&self, plugin: &str, ctx: &HookContext<'_>) -> Result<(), String> {
        match self {
            Self::Deny { message } => Err(message.clone()),
            Self::RequireArguments { arguments } => {
                let provided = ctx.arguments.and_then(Value::as_object);
                let missing: Vec<&str> = arguments
                    .iter()
                    .filter(|name| {
                        provided
                            .and_then(|args| args.get(name.as_str()))
                            .is_none_or(Value::is_null)
                    })
                    .map(String::as_str)
                    .collect();
                if missing.is_empty() {
                    Ok(())
                } else {
                    Err(format!("missing required argument(s): {}", missing.join(", ")))
                }
            }
            Self::Log { message } => {
                tracing::info!(
                    plugin,
                    event = %ctx.event,
                    tool = ctx.tool.unwrap_or("-"),
                    kb = ctx.kb.unwrap_or("-"),
                    correlation_id = ctx.correlation_id.unwrap_or("-"),
                    "{}",
                    message.as_deref().unwrap_or("hook fired")
                );
                Ok(())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct SavedSearchArgs {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    cursor: Option<String>,
}

impl SavedSearch {
    fn run(&self, ctx: &ToolContext<'_>, args: &Value) -> Result<Value, ToolError> {
        let args: SavedSearchArgs = ToolError::parse_args(args)?;
        let query = match args.query.as_deref().map(str::trim) {
            Some(extra) if !extra.is_empty() => format!("({}) AND ({extra})", self.query),
            _ => self.query.clone(),
        };
        let request = SearchRequest {
            query,
            kbs: self.kbs.clone(),
            entry_type: self.entry_type.clone(),
            limit: args.limit.or(self.limit),
            cursor: args.cursor,
        };
        let response = ctx.services.search().search(&request)?;
        serde_json::to_value(response).map_err(|e| ToolError::Failed(e.to_string()))
    }
}

/// Reads `*.toml` plugin manifests from a list of directories.
#[derive(Debug, Clone, Default)]
pub struct ManifestPluginSource {
    dirs: Vec<PathBuf>,
}

impl ManifestPluginSource {
    #[must_use]
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    /// Turn one manifest into a descriptor. `origin` names the plugin in
    /// errors raised before its own name is known.
    ///
    /// # Errors
    ///
    /// Returns `PluginError::Load` for invalid TOML, unknown hook events, or
    /// unknown hook actions.
    pub fn parse(origin: &str, contents: &str) -> Result<PluginDescriptor, PluginError> {
        let manifest: Manifest = toml::from_str(contents).map_err(|e| PluginError::load(origin, e.to_string()))?;
        let name = manifest.name.clone();

        let mut plugin = PluginDescriptor::new(&name);

        for ty in manifest.entry_types {
            plugin.entry_types.push(PluginEntryType {
                schema: EntryTypeSchema {
                    name: ty.name,
                    required: ty.required,
                    optional: ty.optional,
                },
                kbs: ty.kbs,
            });
        }

        for search in manifest.tools {
            let description = search
                .description
                .clone()
                .unwrap_or_else(|| format!("Saved search: {}", search.query));
            let tool_name = search.name.clone();
            let tier = search.tier;
            plugin.tools.push(ToolSpec::new(
                &tool_name,
                tier,
                ToolCategory::Query,
                &description,
                move |ctx, args| search.run(ctx, args),
            ));
        }

        for hook in manifest.hooks {
            let event: HookEvent = hook.event.parse().map_err(|e: String| PluginError::load(&name, e))?;
            let plugin_name = name.clone();
            let tools = hook.tools;
            let action = Arc::new(hook.action);
            plugin.hooks.push(HookSpec::new(event, hook.priority, hook.blocking, move |ctx| {
                if !tools.is_empty() && !ctx.tool.is_some_and(|tool| tools.iter().any(|t| t == tool)) {
                    return Ok(());
                }
                action.apply(&plugin_name, ctx)
            }));
        }

        Ok(plugin)
    }

    fn read_dir(dir: &Path) -> Vec<Result<PluginDescriptor, PluginError>> {
        let origin = dir.display().to_string();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(dir = %origin, "plugin directory does not exist");
                return Vec::new();
            }
            Err(e) => return vec![Err(PluginError::load(&origin, e.to_string()))],
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        paths.sort();

        paths
            .iter()
            .map(|path| {
                let origin = path
                    .file_stem()
                    .map_or_else(|| path.display().to_string(), |s| s.to_string_lossy().to_string());
                let contents =
                    std::fs::read_to_string(path).map_err(|e| PluginError::load(&origin, e.to_string()))?;
                Self::parse(&origin, &contents)
            })
            .collect()
    }
}

impl PluginSource for ManifestPluginSource {
    fn discover(&self) -> Vec<Result<PluginDescriptor, PluginError>> {
        self.dirs.iter().flat_map(|dir| Self::read_dir(dir)).collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::dispatch::hooks::HookContext;

    const MANIFEST: &str = r#"
        name = "decisions"

        [[entry_types]]
        name = "decision"
        required = ["status"]
        kbs = ["work"]

        [[tools]]
        name = "open_decisions"
        query = "open"
        entry_type = "decision"

        [[hooks]]
        event = "before:mutation"
        priority = 5
        blocking = true
        tools = ["delete_entry"]
        action = { kind = "deny", message = "decisions are append-only" }

        [[hooks]]
        event = "before:mutation"
        action = { kind = "require_arguments", arguments = ["kb", "path"] }
    "#;

    fn ctx<'a>(tool: &'a str, arguments: &'a Value) -> HookContext<'a> {
        HookContext {
            event: HookEvent::Before(ToolCategory::Mutation),
            tool: Some(tool),
            tier: Some(Tier::Write),
            correlation_id: None,
            arguments: Some(arguments),
            result: None,
            kb: None,
            generation: None,
        }
    }

    #[test]
    fn parses_full_manifest() {
        let plugin = ManifestPluginSource::parse("decisions", MANIFEST).unwrap();
        assert_eq!(plugin.name, "decisions");
        assert_eq!(plugin.entry_types[0].schema.required, vec!["status"]);
        assert_eq!(plugin.entry_types[0].kbs, vec!["work"]);
        assert_eq!(plugin.tools[0].name, "open_decisions");
        assert_eq!(plugin.tools[0].tier, Tier::Read);
        assert_eq!(plugin.tools[0].category, ToolCategory::Query);
        assert_eq!(plugin.hooks.len(), 2);
        assert!(plugin.hooks[0].blocking);
    }

    #[test]
    fn deny_hook_only_applies_to_listed_tools() {
        let plugin = ManifestPluginSource::parse("decisions", MANIFEST).unwrap();
        let deny = &plugin.hooks[0];
        let args = json!({"kb": "work", "path": "x.md"});

        let err = deny.handler.call(&ctx("delete_entry", &args)).unwrap_err();
        assert_eq!(err, "decisions are append-only");
        assert!(deny.handler.call(&ctx("update_entry", &args)).is_ok());
    }

    #[test]
    fn require_arguments_reports_missing_names() {
        let plugin = ManifestPluginSource::parse("decisions", MANIFEST).unwrap();
        let require = &plugin.hooks[1];

        let err = require
            .handler
            .call(&ctx("create_entry", &json!({"kb": "work", "path": null})))
            .unwrap_err();
        assert!(err.contains("path"));
        assert!(
            require
                .handler
                .call(&ctx("create_entry", &json!({"kb": "work", "path": "a.md"})))
                .is_ok()
        );
    }

    #[test]
    fn unknown_event_is_a_load_error() {
        let err = ManifestPluginSource::parse(
            "broken",
            r#"
            name = "broken"
            [[hooks]]
            event = "whenever"
            action = { kind = "log" }
            "#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "PluginLoadError");
        assert_eq!(err.plugin(), "broken");
    }

    #[test]
    fn unknown_action_is_a_load_error() {
        let err = ManifestPluginSource::parse(
            "odd",
            "name = \"odd\"\n[[hooks]]\nevent = \"sync_completed\"\naction = { kind = \"explode\" }\n",
        )
        .unwrap_err();
        assert_eq!(err.kind(), "PluginLoadError");
    }

    #[test]
    fn discovers_manifests_in_sorted_order() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.toml"), "name = \"bravo\"\n").unwrap();
        std::fs::write(dir.path().join("a.toml"), "name = \"alpha\"\n").unwrap();
        std::fs::write(dir.path().join("c.toml"), "not = [valid").unwrap();
        std::fs::write(dir.path().join("readme.md"), "ignored").unwrap();

        let source = ManifestPluginSource::new(vec![dir.path().to_path_buf(), dir.path().join("missing")]);
        let found = source.discover();
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].as_ref().unwrap().name, "alpha");
        assert_eq!(found[1].as_ref().unwrap().name, "bravo");
        assert_eq!(found[2].as_ref().unwrap_err().plugin(), "c");
    }
}
