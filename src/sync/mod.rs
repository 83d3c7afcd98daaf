//! Index synchronizer: reconciles a KB's file tree with its index.
//!
//! A pass walks the tree, parses every markdown file, classifies it against
//! the current generation, stages the difference, and publishes a new
//! generation. Nothing is visible to readers until the publish.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use walkdir::{DirEntry, WalkDir};

use crate::dispatch::hooks::{self, HookContext};
use crate::entry::{EntryId, ParsedFile, display_path, parse_file};
use crate::index::{Diagnostic, GenerationContents, IndexError, IndexRecord, IndexStore, WriteGuard};
use crate::kb::Kb;
use crate::registry::Registry;

/// File extensions considered entries.
const ENTRY_EXTENSIONS: &[&str] = &["md", "markdown"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Stage only what changed since the current generation.
    Incremental,
    /// Drop every document and re-add the whole tree.
    Full,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub kb: String,
    /// Current generation after the pass.
    pub generation: u64,
    /// Whether this pass published a new generation.
    pub published: bool,
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub diagnostics: usize,
}

/// Drives reconciliation passes for every KB.
#[derive(Debug, Clone)]
pub struct Synchronizer {
    registry: Arc<Registry>,
    store: Arc<IndexStore>,
}

impl Synchronizer {
    #[must_use]
    pub fn new(registry: Arc<Registry>, store: Arc<IndexStore>) -> Self {
        Self { registry, store }
    }

    /// Run a pass for `kb` under its writer lock, then fire `SyncCompleted` hooks.
    ///
    /// # Errors
    ///
    /// Returns `IndexError::UnknownKb` for unconfigured KBs and
    /// `IndexError::Unavailable` when the pass failed; the previous generation
    /// stays current in that case.
    pub fn reconcile(&self, kb: &str, mode: SyncMode) -> Result<SyncReport, IndexError> {
        let definition = self
            .registry
            .kbs()
            .get(kb)
            .ok_or_else(|| IndexError::UnknownKb(kb.to_string()))?;
        let report = loop {
            let index = self.store.open(kb)?;
            let mut guard = index.lock();
            // A reload may have installed a new index while we waited.
            if !self.store.is_current(kb, &index) {
                continue;
            }
            let current = self.registry.kbs().get(kb).unwrap_or_else(|| Arc::clone(&definition));
            break Self::reconcile_locked(&current, &mut guard, mode)?;
        };
        self.after_pass(&report);
        Ok(report)
    }

    /// Reconcile every configured KB. One KB failing never affects the others.
    pub fn reconcile_all(&self) -> Vec<(String, Result<SyncReport, IndexError>)> {
        self.registry
            .kbs()
            .names()
            .into_iter()
            .map(|kb| {
                let result = self.reconcile(&kb, SyncMode::Incremental);
                if let Err(e) = &result {
                    tracing::warn!(kb = %kb, error = %e, "reconciliation failed");
                }
                (kb, result)
            })
            .collect()
    }

    /// Fire `SyncCompleted` hooks for a pass that published. Call this after
    /// releasing the KB's writer lock.
    pub fn after_pass(&self, report: &SyncReport) -> Vec<String> {
        if !report.published {
            return Vec::new();
        }
        hooks::fire_notify(
            self.registry.capabilities(),
            &HookContext::sync(&report.kb, report.generation),
        )
    }

    /// Run a pass while the caller already holds the KB's writer lock.
    ///
    /// # Errors
    ///
    /// Returns `IndexError::Unavailable` if the tree cannot be fully walked or
    /// the index cannot commit. Staged changes are rolled back.
    pub fn reconcile_locked(kb: &Kb, guard: &mut WriteGuard<'_>, mode: SyncMode) -> Result<SyncReport, IndexError> {
        let files = match walk(&kb.root) {
            Ok(files) => files,
            Err(message) => return Err(fail(kb, guard, message)),
        };

        let current = guard.current();
        let head = if kb.git { git_head(&kb.root) } else { None };

        let mut records: BTreeMap<EntryId, Arc<IndexRecord>> = BTreeMap::new();
        let mut diagnostics = Vec::new();
        let mut changed: Vec<Arc<IndexRecord>> = Vec::new();
        let (mut added, mut modified, mut unchanged) = (0, 0, 0);

        for rel_path in files {
            let full_path = kb.root.join(&rel_path);
            let bytes = match std::fs::read(&full_path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    diagnostics.push(Diagnostic {
                        path: display_path(&rel_path),
                        id: EntryId::from_path(&kb.name, &rel_path),
                        kind: "StorageError".to_string(),
                        message: format!("cannot read {}: {e}", full_path.display()),
                    });
                    continue;
                }
            };

            let mut entry = match parse_file(&kb.context, &rel_path, &bytes) {
                ParsedFile::Valid(entry) => entry,
                ParsedFile::Invalid(invalid) => {
                    tracing::debug!(kb = %kb.name, path = %full_path.display(), error = %invalid.error, "skipping invalid entry");
                    diagnostics.push(Diagnostic {
                        path: display_path(&invalid.path),
                        id: invalid.id,
                        kind: invalid.error.kind().to_string(),
                        message: invalid.error.to_string(),
                    });
                    continue;
                }
            };

            if let Some(first) = records.get(&entry.id) {
                diagnostics.push(Diagnostic {
                    path: display_path(&rel_path),
                    id: entry.id.clone(),
                    kind: "ParseError".to_string(),
                    message: format!(
                        "duplicate id '{}' (already used by {})",
                        entry.id,
                        display_path(&first.entry.path)
                    ),
                });
                continue;
            }

            match current.record(&entry.id) {
                Some(old) if old.hash() == entry.hash && old.entry.path == entry.path => {
                    unchanged += 1;
                    records.insert(entry.id.clone(), Arc::clone(old));
                    continue;
                }
                Some(_) => modified += 1,
                None => added += 1,
            }

            entry.modified = modified_time(&full_path);
            entry.commit.clone_from(&head);
            let record = Arc::new(IndexRecord { entry });
            changed.push(Arc::clone(&record));
            records.insert(record.id().clone(), record);
        }

        let removed: Vec<&EntryId> = current
            .records()
            .map(|record| record.id())
            .filter(|id| !records.contains_key(*id))
            .collect();
        diagnostics.sort();

        let mut report = SyncReport {
            kb: kb.name.clone(),
            generation: current.number,
            published: false,
            added,
            modified,
            removed: removed.len(),
            unchanged,
            diagnostics: diagnostics.len(),
        };

        let nothing_changed = added == 0 && modified == 0 && removed.is_empty();
        if mode == SyncMode::Incremental && nothing_changed && diagnostics == current.diagnostics() {
            guard.index().mark_available();
            tracing::debug!(kb = %kb.name, generation = current.number, "index up to date");
            return Ok(report);
        }

        let staged = match mode {
            SyncMode::Incremental => stage_incremental(guard, &current, &changed, &removed),
            SyncMode::Full => stage_full(guard, &records),
        };
        if let Err(e) = staged {
            guard.rollback();
            return Err(fail(kb, guard, e.to_string()));
        }

        let generation = match guard.publish(GenerationContents {
            records,
            diagnostics,
            head,
        }) {
            Ok(generation) => generation,
            Err(e) => {
                guard.rollback();
                return Err(fail(kb, guard, e.to_string()));
            }
        };
        guard.index().mark_available();

        report.generation = generation.number;
        report.published = true;
        tracing::info!(
            kb = %kb.name,
            generation = report.generation,
            added = report.added,
            modified = report.modified,
            removed = report.removed,
            diagnostics = report.diagnostics,
            full = mode == SyncMode::Full,
            "sync pass published"
        );
        Ok(report)
    }
}

fn stage_incremental(
    guard: &mut WriteGuard<'_>,
    current: &crate::index::Generation,
    changed: &[Arc<IndexRecord>],
    removed: &[&EntryId],
) -> Result<(), IndexError> {
    for id in removed {
        guard.stage_delete(id);
    }
    for record in changed {
        if current.record(record.id()).is_some() {
            guard.stage_delete(record.id());
        }
        guard.stage_add(&record.entry)?;
    }
    Ok(())
}

fn stage_full(guard: &mut WriteGuard<'_>, records: &BTreeMap<EntryId, Arc<IndexRecord>>) -> Result<(), IndexError> {
    guard.stage_clear()?;
    for record in records.values() {
        guard.stage_add(&record.entry)?;
    }
    Ok(())
}

fn fail(kb: &Kb, guard: &WriteGuard<'_>, message: String) -> IndexError {
    tracing::error!(kb = %kb.name, error = %message, "reconciliation failed; serving last good generation");
    guard.index().mark_unavailable(message.clone());
    IndexError::Unavailable {
        kb: kb.name.clone(),
        message,
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    is_hidden_name(entry.file_name())
}

/// Names the walk skips. Files under such a name are never indexed.
fn is_hidden_name(name: &OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// True if any component of a relative path is skipped by the walk.
pub(crate) fn has_hidden_component(path: &Path) -> bool {
    path.components()
        .any(|component| matches!(component, Component::Normal(name) if is_hidden_name(name)))
}

fn is_entry_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ENTRY_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

/// Relative paths of all entry files under `root`, in sorted order.
///
/// Any error aborts the walk: a partial listing would make unseen files look
/// removed.
fn walk(root: &Path) -> Result<Vec<PathBuf>, String> {
    if !root.is_dir() {
        return Err(format!("KB root {} is not a readable directory", root.display()));
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry));

    for entry in walker {
        let entry = entry.map_err(|e| format!("walking {}: {e}", root.display()))?;
        if !entry.file_type().is_file() || !is_entry_file(entry.path()) {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            files.push(rel.to_path_buf());
        }
    }

    Ok(files)
}

fn modified_time(path: &Path) -> Option<DateTime<Utc>> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(DateTime::<Utc>::from(modified))
}

/// `git rev-parse HEAD` in `root`, if it is a git checkout.
fn git_head(root: &Path) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let head = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!head.is_empty()).then_some(head)
}
