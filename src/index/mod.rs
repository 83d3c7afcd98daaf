//! Versioned full-text index store.
//!
//! Each KB owns an in-memory tantivy index and a pointer to its current
//! [`Generation`]. A generation pairs the record map with the tantivy
//! [`Searcher`] that was opened right after the commit producing it, so a
//! reader holding one `Arc<Generation>` sees exactly one consistent snapshot.
//!
//! Writers go through [`KbIndex::lock`], which is also the per-KB mutation
//! lock: one reconciliation pass or one mutation at a time per KB.

pub mod schema;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, Searcher, Term};
use thiserror::Error;

use crate::entry::{Entry, EntryId};

use self::schema::{SchemaFields, build_schema, to_document};

/// Heap for each KB's single indexing thread.
const WRITER_HEAP_SIZE: usize = 20_000_000;

/// Index store errors.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Index for KB '{kb}' is unavailable: {message}")]
    Unavailable { kb: String, message: String },

    #[error("Unknown KB '{0}'")]
    UnknownKb(String),

    #[error("Index error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),
}

impl IndexError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "IndexUnavailable",
            Self::UnknownKb(_) => "NotFound",
            Self::Tantivy(_) => "IndexError",
        }
    }
}

/// One indexed entry. The tokenized form lives in tantivy; this keeps the
/// parsed entry and its content hash for lookups and change detection.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub entry: Entry,
}

impl IndexRecord {
    #[must_use]
    pub fn id(&self) -> &EntryId {
        &self.entry.id
    }

    #[must_use]
    pub fn hash(&self) -> &str {
        &self.entry.hash
    }
}

/// A file the last pass could not index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Diagnostic {
    pub path: String,
    pub id: EntryId,
    pub kind: String,
    pub message: String,
}

/// Immutable snapshot of a KB's index.
pub struct Generation {
    pub number: u64,
    records: BTreeMap<EntryId, Arc<IndexRecord>>,
    by_path: BTreeMap<PathBuf, EntryId>,
    diagnostics: Vec<Diagnostic>,
    searcher: Searcher,
    /// Git HEAD at the time of the pass, when tracked.
    pub head: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Generation {
    #[must_use]
    pub fn record(&self, id: &EntryId) -> Option<&Arc<IndexRecord>> {
        self.records.get(id)
    }

    #[must_use]
    pub fn record_at(&self, path: &Path) -> Option<&Arc<IndexRecord>> {
        self.by_path.get(path).and_then(|id| self.records.get(id))
    }

    /// Records in id order.
    pub fn records(&self) -> impl Iterator<Item = &Arc<IndexRecord>> {
        self.records.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    #[must_use]
    pub fn searcher(&self) -> &Searcher {
        &self.searcher
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("number", &self.number)
            .field("records", &self.records.len())
            .field("diagnostics", &self.diagnostics.len())
            .field("head", &self.head)
            .finish_non_exhaustive()
    }
}

/// Contents of a generation about to be published.
#[derive(Debug, Default)]
pub struct GenerationContents {
    pub records: BTreeMap<EntryId, Arc<IndexRecord>>,
    pub diagnostics: Vec<Diagnostic>,
    pub head: Option<String>,
}

/// Reported state of a KB's index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbStatus {
    pub kb: String,
    pub generation: u64,
    pub records: usize,
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub diagnostics: Vec<Diagnostic>,
}

/// A KB's index: tantivy state, current generation, writer lock.
pub struct KbIndex {
    kb: String,
    index: Index,
    fields: SchemaFields,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    current: RwLock<Arc<Generation>>,
    last_error: RwLock<Option<String>>,
}

impl KbIndex {
    /// Create an empty in-memory index at generation 0.
    ///
    /// # Errors
    ///
    /// Returns an error if tantivy cannot create the index or its writer.
    pub fn create(kb: &str) -> Result<Self, IndexError> {
        let (schema, fields) = build_schema();
        let index = Index::create_in_ram(schema);
        let writer: IndexWriter = index.writer_with_num_threads(1, WRITER_HEAP_SIZE)?;
        let reader = index.reader_builder().reload_policy(ReloadPolicy::Manual).try_into()?;

        let empty = Generation {
            number: 0,
            records: BTreeMap::new(),
            by_path: BTreeMap::new(),
            diagnostics: Vec::new(),
            searcher: reader.searcher(),
            head: None,
            created_at: Utc::now(),
        };

        Ok(Self {
            kb: kb.to_string(),
            index,
            fields,
            reader,
            writer: Mutex::new(writer),
            current: RwLock::new(Arc::new(empty)),
            last_error: RwLock::new(None),
        })
    }

    #[must_use]
    pub fn kb(&self) -> &str {
        &self.kb
    }

    #[must_use]
    pub fn index(&self) -> &Index {
        &self.index
    }

    #[must_use]
    pub fn fields(&self) -> &SchemaFields {
        &self.fields
    }

    /// The current generation. Never blocks on writers.
    #[must_use]
    pub fn current(&self) -> Arc<Generation> {
        Arc::clone(&self.current.read())
    }

    /// Take the KB's exclusive writer lock.
    pub fn lock(&self) -> WriteGuard<'_> {
        WriteGuard {
            index: self,
            writer: self.writer.lock(),
        }
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.last_error.read().is_none()
    }

    pub fn mark_unavailable(&self, message: impl Into<String>) {
        *self.last_error.write() = Some(message.into());
    }

    pub fn mark_available(&self) {
        *self.last_error.write() = None;
    }

    #[must_use]
    pub fn status(&self) -> KbStatus {
        let current = self.current();
        let last_error = self.last_error.read().clone();
        KbStatus {
            kb: self.kb.clone(),
            generation: current.number,
            records: current.len(),
            available: last_error.is_none(),
            last_error,
            head: current.head.clone(),
            updated_at: current.created_at,
            diagnostics: current.diagnostics.clone(),
        }
    }
}

impl fmt::Debug for KbIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KbIndex")
            .field("kb", &self.kb)
            .field("generation", &self.current.read().number)
            .finish_non_exhaustive()
    }
}

/// Exclusive access to one KB's index writer.
///
/// Staged changes are invisible until [`WriteGuard::publish`]; dropping the
/// guard without publishing leaves them pending for the next commit, so
/// callers that bail out should [`WriteGuard::rollback`].
pub struct WriteGuard<'a> {
    index: &'a KbIndex,
    writer: MutexGuard<'a, IndexWriter>,
}

impl WriteGuard<'_> {
    #[must_use]
    pub fn kb(&self) -> &str {
        &self.index.kb
    }

    #[must_use]
    pub fn current(&self) -> Arc<Generation> {
        self.index.current()
    }

    #[must_use]
    pub fn index(&self) -> &KbIndex {
        self.index
    }

    /// Stage a document for `entry`.
    ///
    /// # Errors
    ///
    /// Returns an error if tantivy rejects the document.
    pub fn stage_add(&mut self, entry: &Entry) -> Result<(), IndexError> {
        self.writer.add_document(to_document(&self.index.fields, entry))?;
        Ok(())
    }

    /// Stage removal of every document for `id`.
    pub fn stage_delete(&mut self, id: &EntryId) {
        self.writer
            .delete_term(Term::from_field_text(self.index.fields.id, id.as_str()));
    }

    /// Stage removal of all documents.
    ///
    /// # Errors
    ///
    /// Returns an error if tantivy cannot clear the index.
    pub fn stage_clear(&mut self) -> Result<(), IndexError> {
        self.writer.delete_all_documents()?;
        Ok(())
    }

    /// Discard staged changes.
    pub fn rollback(&mut self) {
        if let Err(e) = self.writer.rollback() {
            tracing::error!(kb = %self.index.kb, error = %e, "index rollback failed");
        }
    }

    /// Commit staged changes and atomically make them the current generation.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit or reader reload fails; the previous
    /// generation stays current.
    pub fn publish(&mut self, contents: GenerationContents) -> Result<Arc<Generation>, IndexError> {
        self.writer.commit()?;
        self.index.reader.reload()?;

        let number = self.index.current.read().number + 1;
        let by_path = contents
            .records
            .values()
            .map(|record| (record.entry.path.clone(), record.entry.id.clone()))
            .collect();
        let generation = Arc::new(Generation {
            number,
            records: contents.records,
            by_path,
            diagnostics: contents.diagnostics,
            searcher: self.index.reader.searcher(),
            head: contents.head,
            created_at: Utc::now(),
        });

        *self.index.current.write() = Arc::clone(&generation);
        tracing::debug!(kb = %self.index.kb, generation = number, records = generation.len(), "generation published");
        Ok(generation)
    }
}

/// All KB indexes in the process.
#[derive(Debug, Default)]
pub struct IndexStore {
    kbs: RwLock<BTreeMap<String, Arc<KbIndex>>>,
}

impl IndexStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, kb: &str) -> Option<Arc<KbIndex>> {
        self.kbs.read().get(kb).cloned()
    }

    /// Look up a KB's index.
    ///
    /// # Errors
    ///
    /// Returns `IndexError::UnknownKb` if no index exists for `kb`.
    pub fn require(&self, kb: &str) -> Result<Arc<KbIndex>, IndexError> {
        self.get(kb).ok_or_else(|| IndexError::UnknownKb(kb.to_string()))
    }

    /// Get or create the index for `kb`.
    ///
    /// # Errors
    ///
    /// Returns an error if a new index cannot be created.
    pub fn open(&self, kb: &str) -> Result<Arc<KbIndex>, IndexError> {
        if let Some(existing) = self.get(kb) {
            return Ok(existing);
        }
        let mut kbs = self.kbs.write();
        if let Some(existing) = kbs.get(kb) {
            return Ok(Arc::clone(existing));
        }
        let index = Arc::new(KbIndex::create(kb)?);
        kbs.insert(kb.to_string(), Arc::clone(&index));
        Ok(index)
    }

    /// Make `index` the index for `kb`. Readers holding the old one keep
    /// their snapshot.
    pub fn install(&self, kb: &str, index: Arc<KbIndex>) {
        self.kbs.write().insert(kb.to_string(), index);
    }

    /// Whether `index` is still the one registered for `kb`.
    #[must_use]
    pub fn is_current(&self, kb: &str, index: &Arc<KbIndex>) -> bool {
        self.get(kb).is_some_and(|registered| Arc::ptr_eq(&registered, index))
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.kbs.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use tantivy::collector::Count;
    use tantivy::query::AllQuery;

    use super::*;
    use crate::entry::{EntryContext, EntryTypeSchema, parse_entry};

    fn entry(path: &str, body: &str) -> Entry {
        let mut ctx = EntryContext {
            kb: "notes".into(),
            ..EntryContext::default()
        };
        ctx.types.insert("note".into(), EntryTypeSchema::named("note"));
        parse_entry(&ctx, Path::new(path), format!("---\ntype: note\n---\n{body}").as_bytes()).unwrap()
    }

    fn contents(entries: &[Entry]) -> GenerationContents {
        GenerationContents {
            records: entries
                .iter()
                .map(|e| (e.id.clone(), Arc::new(IndexRecord { entry: e.clone() })))
                .collect(),
            ..GenerationContents::default()
        }
    }

    fn doc_count(generation: &Generation) -> usize {
        generation.searcher().search(&AllQuery, &Count).unwrap()
    }

    #[test]
    fn starts_at_empty_generation_zero() {
        let index = KbIndex::create("notes").unwrap();
        let current = index.current();
        assert_eq!(current.number, 0);
        assert!(current.is_empty());
        assert!(index.is_available());
    }

    #[test]
    fn publish_advances_generation_and_keeps_old_snapshot() {
        let index = KbIndex::create("notes").unwrap();
        let a = entry("a.md", "apple");
        let b = entry("b.md", "banana");

        {
            let mut guard = index.lock();
            guard.stage_add(&a).unwrap();
            guard.publish(contents(std::slice::from_ref(&a))).unwrap();
        }
        let first = index.current();
        assert_eq!(first.number, 1);
        assert_eq!(doc_count(&first), 1);

        {
            let mut guard = index.lock();
            guard.stage_add(&b).unwrap();
            guard.publish(contents(&[a.clone(), b.clone()])).unwrap();
        }
        let second = index.current();
        assert_eq!(second.number, 2);
        assert_eq!(doc_count(&second), 2);

        assert_eq!(doc_count(&first), 1);
        assert!(first.record(&b.id).is_none());
        assert!(second.record_at(Path::new("b.md")).is_some());
    }

    #[test]
    fn delete_and_rollback() {
        let index = KbIndex::create("notes").unwrap();
        let a = entry("a.md", "apple");
        {
            let mut guard = index.lock();
            guard.stage_add(&a).unwrap();
            guard.publish(contents(std::slice::from_ref(&a))).unwrap();
        }

        {
            let mut guard = index.lock();
            guard.stage_delete(&a.id);
            guard.rollback();
        }
        {
            let mut guard = index.lock();
            guard.publish(contents(std::slice::from_ref(&a))).unwrap();
        }
        assert_eq!(doc_count(&index.current()), 1);

        {
            let mut guard = index.lock();
            guard.stage_delete(&a.id);
            guard.publish(GenerationContents::default()).unwrap();
        }
        assert_eq!(doc_count(&index.current()), 0);
    }

    #[test]
    fn availability_flag_round_trips_into_status() {
        let index = KbIndex::create("notes").unwrap();
        index.mark_unavailable("root missing");
        let status = index.status();
        assert!(!status.available);
        assert_eq!(status.last_error.as_deref(), Some("root missing"));

        index.mark_available();
        assert!(index.status().available);
    }

    #[test]
    fn store_opens_once_and_installs() {
        let store = IndexStore::new();
        let first = store.open("notes").unwrap();
        let again = store.open("notes").unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(store.is_current("notes", &first));

        let fresh = Arc::new(KbIndex::create("notes").unwrap());
        store.install("notes", Arc::clone(&fresh));
        assert!(!store.is_current("notes", &first));
        assert!(store.is_current("notes", &fresh));
        assert!(Arc::ptr_eq(&store.open("notes").unwrap(), &fresh));
        assert!(matches!(store.require("missing"), Err(IndexError::UnknownKb(_))));
        assert_eq!(store.names(), vec!["notes"]);
    }
}
