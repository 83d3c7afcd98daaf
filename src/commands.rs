//! Service layer shared by the CLI, the protocol server, and the MCP bridge.
//!
//! [`Kbgate`] owns the process-scoped registry, the index store, the
//! synchronizer, and the search engine. Built-in tools call into it; so do the
//! render helpers at the bottom of this file.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, expand_tilde};
use crate::dispatch::builtin::builtin_tools;
use crate::dispatch::{ToolError, ToolInfo};
use crate::entry::{EntryId, FieldValue, display_path, parse_entry};
use crate::index::{IndexStore, KbIndex, KbStatus, WriteGuard};
use crate::kb::Kb;
use crate::plugin::{ManifestPluginSource, PluginReport, PluginSource};
use crate::registry::Registry;
use crate::search::{ListResponse, SearchEngine, SearchResponse};
use crate::storage::local::LocalStorageBackend;
use crate::storage::{StorageBackend, StorageError};
use crate::sync::{SyncMode, SyncReport, Synchronizer, has_hidden_component};

/// Maximum length for user-provided strings (title, entry type, etc.).
const MAX_INPUT_LENGTH: usize = 200;

/// Validate that a path is safely contained within a root directory.
///
/// Returns the full path if valid, or an error if the path would escape
/// the root directory (e.g., via `..` components or symlink tricks).
///
/// # Security
///
/// This function validates paths for new files that may not exist yet.
/// It walks up the path hierarchy to find an existing ancestor and
/// verifies that ancestor is within the root directory.
pub(crate) fn validate_path_within_root(root: &Path, relative_path: &Path) -> anyhow::Result<PathBuf> {
    // Reject paths with parent directory references
    for component in relative_path.components() {
        if let std::path::Component::ParentDir = component {
            anyhow::bail!("Invalid path: contains '..' component");
        }
    }

    // Reject absolute paths
    if relative_path.is_absolute() {
        anyhow::bail!("Invalid path: must be relative");
    }

    // Reject empty paths
    if relative_path.as_os_str().is_empty() {
        anyhow::bail!("Invalid path: cannot be empty");
    }

    let full_path = root.join(relative_path);

    let canonical_root = root
        .canonicalize()
        .map_err(|e| anyhow::anyhow!("Cannot access KB root {}: {}", root.display(), e))?;

    // Walk up to the nearest existing ancestor; new directories are allowed
    let mut check_path = full_path.as_path();
    loop {
        if check_path.exists() {
            let canonical_check = check_path.canonicalize()?;
            if !canonical_check.starts_with(&canonical_root) {
                anyhow::bail!("Path escapes KB root: {}", relative_path.display());
            }
            break;
        }

        match check_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                check_path = parent;
            }
            _ => {
                anyhow::bail!(
                    "Cannot validate path: no existing ancestor found for {}",
                    relative_path.display()
                );
            }
        }
    }

    Ok(full_path)
}

/// Validate a user-provided identifier (entry type, tool name, plugin name).
///
/// Only allows alphanumeric characters, hyphens, and underscores.
pub(crate) fn validate_identifier(value: &str, field_name: &str) -> anyhow::Result<()> {
    if value.is_empty() {
        anyhow::bail!("{field_name} cannot be empty");
    }

    if value.len() > MAX_INPUT_LENGTH {
        anyhow::bail!(
            "{field_name} too long: {} chars (max {MAX_INPUT_LENGTH})",
            value.len()
        );
    }

    // Must start with alphanumeric
    if !value.chars().next().is_some_and(char::is_alphanumeric) {
        anyhow::bail!("{field_name} must start with a letter or number");
    }

    // Only allow safe characters
    for c in value.chars() {
        if !c.is_alphanumeric() && c != '-' && c != '_' {
            anyhow::bail!(
                "{field_name} contains invalid character: '{c}' \
                (only letters, numbers, hyphens, and underscores allowed)"
            );
        }
    }

    Ok(())
}

/// Parse `key=value` filters into a map.
///
/// # Errors
///
/// Returns an error for items without `=` or with an empty key.
pub fn parse_field_filters(filters: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    filters
        .iter()
        .map(|filter| match filter.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.trim().to_string())),
            _ => anyhow::bail!("Invalid field filter '{filter}' (expected key=value)"),
        })
        .collect()
}

/// Convert a title to a URL-safe slug.
fn slugify(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Arguments of `create_entry`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateEntryRequest {
    pub kb: String,
    pub entry_type: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Relative path; defaults to `<type>/<slug of title>.md`.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(default)]
    pub body: String,
}

/// Arguments of `update_entry`. A `null` field value removes the field.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateEntryRequest {
    pub id: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(default)]
    pub body: Option<String>,
}

/// Result of a write-tier mutation, returned after the index reflects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationResult {
    pub id: EntryId,
    pub path: String,
    pub sync: SyncReport,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// What `list_kbs` reports per KB.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbInfo {
    pub name: String,
    pub root: PathBuf,
    pub entry_types: Vec<String>,
    pub git: bool,
    pub generation: u64,
    pub records: usize,
    pub available: bool,
}

/// Process services: registry, index store, synchronizer, search engine.
pub struct Kbgate {
    config: Config,
    config_path: Option<PathBuf>,
    registry: Arc<Registry>,
    store: Arc<IndexStore>,
    sync: Synchronizer,
    search: SearchEngine,
}

impl Kbgate {
    /// Build every service and run the initial reconciliation of each KB.
    ///
    /// `sources` are registered in order, before plugin manifests from
    /// `[plugins] dirs`. Plugin and KB failures are contained and reported;
    /// only index creation failures abort startup.
    ///
    /// # Errors
    ///
    /// Returns an error if an index cannot be created.
    pub fn bootstrap(
        config: Config,
        config_path: Option<PathBuf>,
        sources: &[&dyn PluginSource],
    ) -> anyhow::Result<Arc<Self>> {
        let manifests = ManifestPluginSource::new(config.plugins.dirs.iter().map(|d| expand_tilde(d)).collect());
        let mut all_sources: Vec<&dyn PluginSource> = sources.to_vec();
        all_sources.push(&manifests);

        let registry = Arc::new(Registry::build(&config, builtin_tools(), &all_sources));
        let report = registry.capabilities().report();
        tracing::info!(
            kbs = registry.kbs().names().len(),
            plugins = report.active.len(),
            quarantined = report.quarantined.len(),
            "registry built"
        );

        let store = Arc::new(IndexStore::new());
        for name in registry.kbs().names() {
            store.open(&name)?;
        }

        let sync = Synchronizer::new(Arc::clone(&registry), Arc::clone(&store));
        let search = SearchEngine::new(Arc::clone(&store), config.search.clone());
        let services = Arc::new(Self {
            config,
            config_path,
            registry,
            store,
            sync,
            search,
        });

        services.sync.reconcile_all();
        Ok(services)
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    #[must_use]
    pub fn sync(&self) -> &Synchronizer {
        &self.sync
    }

    #[must_use]
    pub fn search(&self) -> &SearchEngine {
        &self.search
    }

    /// Reconcile all KBs every `[sync] poll_interval_secs`, if set.
    pub fn spawn_poller(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let secs = self.config.sync.poll_interval_secs;
        if secs == 0 {
            return None;
        }
        let services = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(secs));
            interval.tick().await;
            loop {
                interval.tick().await;
                let services = Arc::clone(&services);
                if let Err(e) = tokio::task::spawn_blocking(move || services.sync.reconcile_all()).await {
                    tracing::error!(error = %e, "poll reconciliation task failed");
                }
            }
        }))
    }

    fn kb(&self, name: &str) -> Result<Arc<Kb>, ToolError> {
        self.registry
            .kbs()
            .get(name)
            .ok_or_else(|| ToolError::NotFound(format!("KB '{name}'")))
    }

    /// Run `f` under `kb`'s writer lock with its current definition. If a
    /// reload installed a new index while we waited, take that one instead.
    fn with_writer<T>(
        &self,
        kb: &str,
        f: impl FnOnce(&Kb, &mut WriteGuard<'_>) -> Result<T, ToolError>,
    ) -> Result<T, ToolError> {
        loop {
            let index = self.store.open(kb)?;
            let mut guard = index.lock();
            if !self.store.is_current(kb, &index) {
                continue;
            }
            let definition = self.kb(kb)?;
            return f(&definition, &mut guard);
        }
    }

    /// Create a new entry file and reconcile its KB before returning.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArguments` for bad names or paths (including hidden
    /// ones, which are never indexed), `Entry` errors if the rendered entry
    /// would not parse, and `Storage` errors if the path already exists or
    /// cannot be written.
    pub fn create_entry(
        &self,
        request: CreateEntryRequest,
        cancel: &CancellationToken,
    ) -> Result<MutationResult, ToolError> {
        self.kb(&request.kb)?;
        validate_identifier(&request.entry_type, "Entry type")
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        if let Some(title) = &request.title
            && title.len() > MAX_INPUT_LENGTH
        {
            return Err(ToolError::InvalidArguments(format!(
                "Title too long: {} chars (max {MAX_INPUT_LENGTH})",
                title.len()
            )));
        }

        let rel_path = match (&request.path, &request.title) {
            (Some(path), _) => PathBuf::from(path),
            (None, Some(title)) => {
                let slug = slugify(title);
                if slug.is_empty() {
                    return Err(ToolError::InvalidArguments(format!(
                        "Title '{title}' does not produce a usable file name"
                    )));
                }
                PathBuf::from(&request.entry_type).join(format!("{slug}.md"))
            }
            (None, None) => {
                return Err(ToolError::InvalidArguments("either 'path' or 'title' is required".into()));
            }
        };
        if !rel_path
            .extension()
            .is_some_and(|ext| ext == "md" || ext == "markdown")
        {
            return Err(ToolError::InvalidArguments("entry path must end in .md or .markdown".into()));
        }
        if has_hidden_component(&rel_path) {
            return Err(ToolError::InvalidArguments(format!(
                "entry path '{}' has a hidden component and would never be indexed",
                display_path(&rel_path)
            )));
        }

        let mut declared = request.fields;
        declared.insert("type".into(), FieldValue::String(request.entry_type.clone()));
        if let Some(title) = request.title {
            declared.insert("title".into(), FieldValue::String(title));
        }
        let text = crate::entry::parser::render(&declared, &request.body)
            .map_err(|e| ToolError::Failed(format!("cannot render front matter: {e}")))?;

        let (entry, report) = self.with_writer(&request.kb, |kb, guard| {
            validate_path_within_root(&kb.root, &rel_path).map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
            let entry = parse_entry(&kb.context, &rel_path, text.as_bytes())?;

            let storage = LocalStorageBackend::new(kb.root.clone());
            if storage.exists(&rel_path) {
                return Err(StorageError::AlreadyExists(display_path(&rel_path)).into());
            }
            if guard.current().record(&entry.id).is_some() {
                return Err(ToolError::InvalidArguments(format!("entry id '{}' already exists", entry.id)));
            }
            if cancel.is_cancelled() {
                return Err(ToolError::Cancelled);
            }
            storage.write_entry(&rel_path, &text)?;
            tracing::info!(kb = %kb.name, id = %entry.id, path = %display_path(&rel_path), "entry created");
            let report = Synchronizer::reconcile_locked(kb, guard, SyncMode::Incremental)?;
            Ok((entry, report))
        })?;

        Ok(MutationResult {
            id: entry.id,
            path: display_path(&rel_path),
            warnings: self.sync.after_pass(&report),
            sync: report,
        })
    }

    /// Apply field and body changes to an existing entry. The entry keeps its
    /// path.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids, `InvalidArguments` when the id would
    /// change, and `Entry` errors if the edited entry would not parse.
    pub fn update_entry(
        &self,
        request: UpdateEntryRequest,
        cancel: &CancellationToken,
    ) -> Result<MutationResult, ToolError> {
        let id = EntryId::from(request.id.as_str());
        self.kb(id.kb())?;

        let (report, rel_path) = self.with_writer(id.kb(), |kb, guard| {
            let current = guard.current();
            let record = current
                .record(&id)
                .ok_or_else(|| ToolError::NotFound(format!("entry '{id}'")))?;
            let rel_path = record.entry.path.clone();

            let storage = LocalStorageBackend::new(kb.root.clone());
            let bytes = storage.read_entry(&rel_path)?;
            let mut entry = parse_entry(&kb.context, &rel_path, &bytes)?;
            for (key, value) in request.fields {
                match value {
                    FieldValue::Null => entry.remove_field(&key),
                    value => entry.set_field(&key, value),
                }
            }
            if let Some(body) = request.body {
                entry.set_body(body);
            }

            let text = entry
                .to_markdown()
                .map_err(|e| ToolError::Failed(format!("cannot render front matter: {e}")))?;
            let updated = parse_entry(&kb.context, &rel_path, text.as_bytes())?;
            if updated.id != id {
                return Err(ToolError::InvalidArguments("an entry's id cannot be changed".into()));
            }

            if cancel.is_cancelled() {
                return Err(ToolError::Cancelled);
            }
            storage.write_entry(&rel_path, &text)?;
            tracing::info!(kb = %kb.name, id = %id, "entry updated");
            let report = Synchronizer::reconcile_locked(kb, guard, SyncMode::Incremental)?;
            Ok((report, rel_path))
        })?;

        Ok(MutationResult {
            id,
            path: display_path(&rel_path),
            warnings: self.sync.after_pass(&report),
            sync: report,
        })
    }

    /// Delete an entry's file and drop it from the index.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids and `Storage` errors if the file
    /// cannot be removed.
    pub fn delete_entry(&self, id: &str, cancel: &CancellationToken) -> Result<MutationResult, ToolError> {
        let id = EntryId::from(id);
        self.kb(id.kb())?;

        let (report, rel_path) = self.with_writer(id.kb(), |kb, guard| {
            let rel_path = guard
                .current()
                .record(&id)
                .map(|record| record.entry.path.clone())
                .ok_or_else(|| ToolError::NotFound(format!("entry '{id}'")))?;

            if cancel.is_cancelled() {
                return Err(ToolError::Cancelled);
            }
            let storage = LocalStorageBackend::new(kb.root.clone());
            match storage.delete_entry(&rel_path) {
                Ok(()) | Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            tracing::info!(kb = %kb.name, id = %id, "entry deleted");
            let report = Synchronizer::reconcile_locked(kb, guard, SyncMode::Incremental)?;
            Ok((report, rel_path))
        })?;

        Ok(MutationResult {
            id,
            path: display_path(&rel_path),
            warnings: self.sync.after_pass(&report),
            sync: report,
        })
    }

    /// Run an incremental pass for one KB.
    ///
    /// # Errors
    ///
    /// Returns an `Index` error if the KB is unknown or the pass failed.
    pub fn sync_kb(&self, kb: &str) -> Result<SyncReport, ToolError> {
        self.kb(kb)?;
        Ok(self.sync.reconcile(kb, SyncMode::Incremental)?)
    }

    /// Rebuild one KB's index (or all of them) from scratch.
    ///
    /// # Errors
    ///
    /// Returns the first failure when a single KB was requested. With no KB,
    /// failures are logged and the remaining KBs still run.
    pub fn reindex(&self, kb: Option<&str>) -> Result<Vec<SyncReport>, ToolError> {
        if let Some(kb) = kb {
            self.kb(kb)?;
            return Ok(vec![self.sync.reconcile(kb, SyncMode::Full)?]);
        }

        let mut reports = Vec::new();
        for name in self.registry.kbs().names() {
            match self.sync.reconcile(&name, SyncMode::Full) {
                Ok(report) => reports.push(report),
                Err(e) => tracing::warn!(kb = %name, error = %e, "reindex failed"),
            }
        }
        Ok(reports)
    }

    /// Re-read one KB's definition from the config file and restart its
    /// pipeline with a fresh index.
    ///
    /// The fresh index is fully reconciled before it replaces the old one, so
    /// a failed reload leaves the previous generation and definition serving.
    ///
    /// # Errors
    ///
    /// Returns `Failed` if the config cannot be loaded, `NotFound` if the KB
    /// is not in both the running registry and the config file, and an
    /// `Index` error if the new tree cannot be reconciled.
    pub fn reload_kb(&self, name: &str) -> Result<SyncReport, ToolError> {
        let config = Config::load(self.config_path.as_deref())
            .map_err(|e| ToolError::Failed(format!("cannot reload config: {e}")))?;
        let definition = config
            .kb(name)
            .ok_or_else(|| ToolError::NotFound(format!("KB '{name}' in configuration")))?;
        let kb = Kb::from_config(definition, self.registry.capabilities());
        self.kb(name)?;

        let fresh = Arc::new(KbIndex::create(name)?);
        let report = self.with_writer(name, |_, _previous| {
            let report = {
                let mut guard = fresh.lock();
                Synchronizer::reconcile_locked(&kb, &mut guard, SyncMode::Full)
            };
            let report = match report {
                Ok(report) => report,
                Err(e) => {
                    if let Some(previous) = self.store.get(name) {
                        previous.mark_unavailable(e.to_string());
                    }
                    tracing::warn!(kb = %name, error = %e, "reload failed; keeping previous index");
                    return Err(e.into());
                }
            };
            if !self.registry.kbs().replace(kb) {
                return Err(ToolError::NotFound(format!("KB '{name}'")));
            }
            self.store.install(name, Arc::clone(&fresh));
            Ok(report)
        })?;

        tracing::info!(kb = %name, generation = report.generation, "KB reloaded");
        self.sync.after_pass(&report);
        Ok(report)
    }

    /// Index status for one KB or all of them.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown KBs.
    pub fn kb_status(&self, kb: Option<&str>) -> Result<Vec<KbStatus>, ToolError> {
        match kb {
            Some(kb) => Ok(vec![self.store.require(kb)?.status()]),
            None => Ok(self
                .store
                .names()
                .iter()
                .filter_map(|name| self.store.get(name))
                .map(|index| index.status())
                .collect()),
        }
    }

    #[must_use]
    pub fn list_kbs(&self) -> Vec<KbInfo> {
        self.registry
            .kbs()
            .all()
            .iter()
            .map(|kb| {
                let status = self.store.get(&kb.name).map(|index| index.status());
                KbInfo {
                    name: kb.name.clone(),
                    root: kb.root.clone(),
                    entry_types: kb.entry_types().iter().map(ToString::to_string).collect(),
                    git: kb.git,
                    generation: status.as_ref().map_or(0, |s| s.generation),
                    records: status.as_ref().map_or(0, |s| s.records),
                    available: status.as_ref().is_some_and(|s| s.available),
                }
            })
            .collect()
    }

    #[must_use]
    pub fn plugin_report(&self) -> &PluginReport {
        self.registry.capabilities().report()
    }
}

/// Render search results as markdown.
#[must_use]
pub fn render_search(query: &str, response: &SearchResponse) -> String {
    let mut output = String::new();
    for kb in &response.degraded {
        let _ = writeln!(output, "> Warning: KB '{kb}' is serving a stale index\n");
    }

    if response.results.is_empty() {
        let _ = write!(output, "No matches found for '{query}'");
        return output;
    }

    for result in &response.results {
        let _ = write!(
            output,
            "## {}\n**Id:** {}\n**Type:** {} **Score:** {:.3}\n{}\n\n",
            result.title, result.id, result.entry_type, result.score, result.snippet
        );
    }
    let _ = write!(
        output,
        "*{} of {} result(s) shown*",
        response.results.len(),
        response.total
    );
    if let Some(cursor) = &response.next_cursor {
        let _ = write!(output, "\n*More results: cursor {cursor}*");
    }
    output
}

/// Render an entry listing as markdown.
#[must_use]
pub fn render_list(response: &ListResponse) -> String {
    if response.entries.is_empty() {
        return "No entries found.".to_string();
    }

    let mut output = String::new();
    for entry in &response.entries {
        let _ = writeln!(output, "- **{}**: {}\n  `{}`", entry.entry_type, entry.title, entry.id);
    }
    if let Some(cursor) = &response.next_cursor {
        let _ = write!(output, "*{} entries total, more at cursor {cursor}*", response.total);
    }
    output
}

/// Render a `get_entry` result: heading, fields, then the body.
#[must_use]
pub fn render_entry(entry: &Value) -> String {
    let text = |key: &str| entry.get(key).and_then(Value::as_str).unwrap_or_default();
    let mut output = format!("# {}\n\n**Id:** {}\n**Path:** {}\n", text("title"), text("id"), text("path"));
    if let Some(fields) = entry.get("fields").and_then(Value::as_object) {
        for (key, value) in fields {
            let _ = writeln!(output, "**{key}:** {value}");
        }
    }
    let _ = write!(output, "\n{}", text("body"));
    output
}

/// Render the tools callable at some tier.
#[must_use]
pub fn render_tools(tools: &[ToolInfo]) -> String {
    let mut output = String::new();
    for tool in tools {
        let _ = writeln!(
            output,
            "- `{}` [{}, {}] ({}): {}",
            tool.name, tool.tier, tool.category, tool.owner, tool.description
        );
    }
    output
}

/// Render the plugin report.
#[must_use]
pub fn render_plugins(report: &PluginReport) -> String {
    if report.active.is_empty() && report.quarantined.is_empty() && report.disabled.is_empty() {
        return "No plugins loaded.".to_string();
    }

    let mut output = String::new();
    for plugin in &report.active {
        let _ = writeln!(
            output,
            "- **{}**: types [{}], tools [{}], hooks [{}]",
            plugin.name,
            plugin.entry_types.join(", "),
            plugin.tools.join(", "),
            plugin.hooks.join(", ")
        );
    }
    for plugin in &report.quarantined {
        let _ = writeln!(output, "- **{}** quarantined ({}): {}", plugin.name, plugin.kind, plugin.message);
    }
    for name in &report.disabled {
        let _ = writeln!(output, "- **{name}** disabled");
    }
    output
}

/// Render reconciliation reports.
#[must_use]
pub fn render_sync(reports: &[SyncReport]) -> String {
    let mut output = String::new();
    for report in reports {
        let _ = writeln!(
            output,
            "{}: generation {} (+{} ~{} -{}, {} unchanged, {} diagnostic(s))",
            report.kb,
            report.generation,
            report.added,
            report.modified,
            report.removed,
            report.unchanged,
            report.diagnostics
        );
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    mod slugify_tests {
        use super::*;

        #[test]
        fn simple_title() {
            assert_eq!(slugify("Hello World"), "hello-world");
        }

        #[test]
        fn title_with_special_chars() {
            assert_eq!(
                slugify("AWS Lambda: Best Practices!"),
                "aws-lambda-best-practices"
            );
        }

        #[test]
        fn title_with_multiple_spaces() {
            assert_eq!(slugify("Hello    World"), "hello-world");
        }

        #[test]
        fn empty_title() {
            assert_eq!(slugify(""), "");
        }

        #[test]
        fn unicode_title() {
            assert_eq!(slugify("Café"), "café");
        }
    }

    mod validate_identifier_tests {
        use super::*;

        #[test]
        fn valid_identifier() {
            assert!(validate_identifier("note", "Entry type").is_ok());
            assert!(validate_identifier("saved-search", "Tool name").is_ok());
            assert!(validate_identifier("open_decisions", "Tool name").is_ok());
        }

        #[test]
        fn empty_identifier() {
            let result = validate_identifier("", "Entry type");
            assert!(result.unwrap_err().to_string().contains("cannot be empty"));
        }

        #[test]
        fn identifier_with_invalid_chars() {
            let result = validate_identifier("notes/a", "Entry type");
            assert!(result.unwrap_err().to_string().contains("invalid character"));
        }

        #[test]
        fn identifier_starting_with_hyphen() {
            let result = validate_identifier("-invalid", "Entry type");
            assert!(result.unwrap_err().to_string().contains("must start with"));
        }

        #[test]
        fn identifier_too_long() {
            let long_value = "a".repeat(MAX_INPUT_LENGTH + 1);
            let result = validate_identifier(&long_value, "Entry type");
            assert!(result.unwrap_err().to_string().contains("too long"));
        }
    }

    mod path_tests {
        use super::*;
        use tempfile::TempDir;

        #[test]
        fn accepts_new_nested_paths() {
            let dir = TempDir::new().unwrap();
            let full = validate_path_within_root(dir.path(), Path::new("note/new/a.md")).unwrap();
            assert!(full.ends_with("note/new/a.md"));
        }

        #[test]
        fn rejects_parent_and_absolute_paths() {
            let dir = TempDir::new().unwrap();
            assert!(validate_path_within_root(dir.path(), Path::new("../a.md")).is_err());
            assert!(validate_path_within_root(dir.path(), Path::new("/etc/passwd")).is_err());
            assert!(validate_path_within_root(dir.path(), Path::new("")).is_err());
        }

        #[cfg(unix)]
        #[test]
        fn rejects_symlink_escape() {
            let dir = TempDir::new().unwrap();
            let outside = TempDir::new().unwrap();
            std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
            let err = validate_path_within_root(dir.path(), Path::new("link/a.md")).unwrap_err();
            assert!(err.to_string().contains("escapes"));
        }
    }

    mod filter_tests {
        use super::*;

        #[test]
        fn parses_key_value_pairs() {
            let filters = parse_field_filters(&["status=open".into(), " tags = rust ".into()]).unwrap();
            assert_eq!(filters["status"], "open");
            assert_eq!(filters["tags"], "rust");
        }

        #[test]
        fn rejects_missing_equals() {
            assert!(parse_field_filters(&["status".into()]).is_err());
            assert!(parse_field_filters(&["=open".into()]).is_err());
        }
    }

    mod render_tests {
        use super::*;
        use serde_json::json;

        #[test]
        fn empty_search_says_no_matches() {
            let response = SearchResponse {
                results: vec![],
                total: 0,
                next_cursor: None,
                degraded: vec!["work".into()],
            };
            let output = render_search("apple", &response);
            assert!(output.contains("No matches found for 'apple'"));
            assert!(output.contains("stale index"));
        }

        #[test]
        fn entry_render_includes_body() {
            let output = render_entry(&json!({
                "title": "Apple",
                "id": "notes/a.md",
                "path": "a.md",
                "fields": {"type": "note"},
                "body": "apple pie\n",
            }));
            assert!(output.starts_with("# Apple"));
            assert!(output.contains("**type:** \"note\""));
            assert!(output.ends_with("apple pie\n"));
        }
    }
}
