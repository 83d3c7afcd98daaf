//! Ranked search, lookup, and listing over current index generations.
//!
//! Every call grabs each targeted KB's current generation once and reads
//! only from it, so results never mix two generations of the same KB and an
//! in-flight sync pass never blocks a query.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{IndexRecordOption, Value};
use tantivy::snippet::{Snippet, SnippetGenerator};
use tantivy::{TantivyDocument, Term};
use thiserror::Error;

use crate::config::SearchConfig;
use crate::dispatch::ToolError;
use crate::entry::{Entry, EntryId};
use crate::index::{Generation, IndexError, IndexStore, KbIndex};

/// Title matches count double.
const TITLE_BOOST: f32 = 2.0;

/// Marker wrapped around highlighted spans in snippets.
const HIGHLIGHT: &str = "**";

const SECONDS_PER_DAY: f32 = 86_400.0;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Unknown KB '{0}'")]
    UnknownKb(String),

    #[error("Invalid cursor '{0}'")]
    InvalidCursor(String),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("Search failed: {0}")]
    Tantivy(#[from] tantivy::TantivyError),
}

impl From<SearchError> for ToolError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::UnknownKb(kb) => ToolError::NotFound(format!("KB '{kb}'")),
            SearchError::InvalidCursor(_) => ToolError::InvalidArguments(err.to_string()),
            SearchError::Index(e) => ToolError::Index(e),
            SearchError::Tantivy(e) => ToolError::Index(IndexError::Tantivy(e)),
        }
    }
}

/// A ranked query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    /// KBs to search; empty means all.
    #[serde(default)]
    pub kbs: Vec<String>,
    #[serde(default)]
    pub entry_type: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub cursor: Option<String>,
}

/// A single ranked hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: EntryId,
    pub kb: String,
    pub title: String,
    pub entry_type: String,
    pub path: PathBuf,
    pub score: f32,
    pub snippet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub total: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    /// KBs served from a stale generation because their last pass failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<String>,
}

/// Filters for listing entries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListRequest {
    #[serde(default)]
    pub kbs: Vec<String>,
    #[serde(default)]
    pub entry_type: Option<String>,
    /// Field equals value, or list field contains value.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySummary {
    pub id: EntryId,
    pub kb: String,
    pub title: String,
    pub entry_type: String,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

impl From<&Entry> for EntrySummary {
    fn from(entry: &Entry) -> Self {
        Self {
            id: entry.id.clone(),
            kb: entry.kb.clone(),
            title: entry.title(),
            entry_type: entry.entry_type.clone(),
            path: entry.path.clone(),
            modified: entry.modified,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse {
    pub entries: Vec<EntrySummary>,
    pub total: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// A full entry as returned by `get`.
#[derive(Debug, Clone, Serialize)]
pub struct EntryDetail {
    pub title: String,
    #[serde(flatten)]
    pub entry: Entry,
    pub generation: u64,
}

/// Query executor over the index store.
#[derive(Debug, Clone)]
pub struct SearchEngine {
    store: Arc<IndexStore>,
    config: SearchConfig,
}

impl SearchEngine {
    #[must_use]
    pub fn new(store: Arc<IndexStore>, config: SearchConfig) -> Self {
        Self { store, config }
    }

    /// Ranked full-text search across the requested KBs.
    ///
    /// # Errors
    ///
    /// Returns `SearchError::UnknownKb` for unknown KBs and
    /// `SearchError::InvalidCursor` for malformed cursors.
    pub fn search(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError> {
        let offset = parse_cursor(request.cursor.as_deref())?;
        let limit = self.limit(request.limit);
        let targets = self.targets(&request.kbs)?;

        let degraded = targets
            .iter()
            .filter(|index| !index.is_available())
            .map(|index| index.kb().to_string())
            .collect();

        if request.query.trim().is_empty() {
            return Ok(SearchResponse {
                results: vec![],
                total: 0,
                next_cursor: None,
                degraded,
            });
        }

        let now = Utc::now();
        let mut results = Vec::new();
        for index in &targets {
            let generation = index.current();
            results.extend(self.search_generation(index, &generation, request, now)?);
        }

        results.sort_by(compare_results);
        let (results, total, next_cursor) = paginate(results, offset, limit);

        Ok(SearchResponse {
            results,
            total,
            next_cursor,
            degraded,
        })
    }

    fn search_generation(
        &self,
        index: &KbIndex,
        generation: &Generation,
        request: &SearchRequest,
        now: DateTime<Utc>,
    ) -> Result<Vec<SearchResult>, SearchError> {
        if generation.is_empty() {
            return Ok(vec![]);
        }

        let fields = index.fields();
        let mut parser = QueryParser::for_index(index.index(), vec![fields.title, fields.body, fields.meta]);
        parser.set_field_boost(fields.title, TITLE_BOOST);
        let (text_query, errors) = parser.parse_query_lenient(&request.query);
        if !errors.is_empty() {
            tracing::debug!(kb = %index.kb(), query = %request.query, errors = errors.len(), "query parsed leniently");
        }

        let query: Box<dyn Query> = match &request.entry_type {
            Some(entry_type) => {
                let type_query = TermQuery::new(
                    Term::from_field_text(fields.entry_type, entry_type),
                    IndexRecordOption::Basic,
                );
                Box::new(BooleanQuery::new(vec![
                    (Occur::Must, text_query),
                    (Occur::Must, Box::new(type_query)),
                ]))
            }
            None => text_query,
        };

        let searcher = generation.searcher();
        let top_docs = searcher.search(&query, &TopDocs::with_limit(generation.len().max(1)))?;
        let mut snippets = SnippetGenerator::create(searcher, &*query, fields.body)?;
        snippets.set_max_num_chars(self.config.snippet_chars);

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            let Some(id) = doc.get_first(fields.id).and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(record) = generation.record(&EntryId::from(id)) else {
                continue;
            };
            let entry = &record.entry;
            results.push(SearchResult {
                id: entry.id.clone(),
                kb: entry.kb.clone(),
                title: entry.title(),
                entry_type: entry.entry_type.clone(),
                path: entry.path.clone(),
                score: score * self.recency_factor(entry.modified, now),
                snippet: self.snippet(&snippets.snippet(&entry.body), &entry.body),
            });
        }
        Ok(results)
    }

    /// Look up an entry by id in its KB's current generation.
    ///
    /// # Errors
    ///
    /// Returns `SearchError::UnknownKb` if the id's KB does not exist.
    pub fn get(&self, id: &str) -> Result<Option<EntryDetail>, SearchError> {
        let id = EntryId::from(id);
        let index = self.store.get(id.kb()).ok_or_else(|| SearchError::UnknownKb(id.kb().to_string()))?;
        let generation = index.current();
        Ok(generation.record(&id).map(|record| EntryDetail {
            title: record.entry.title(),
            entry: record.entry.clone(),
            generation: generation.number,
        }))
    }

    /// Enumerate entries matching the filters, in id order.
    ///
    /// # Errors
    ///
    /// Returns `SearchError::UnknownKb` for unknown KBs and
    /// `SearchError::InvalidCursor` for malformed cursors.
    pub fn list(&self, request: &ListRequest) -> Result<ListResponse, SearchError> {
        let offset = parse_cursor(request.cursor.as_deref())?;
        let limit = self.limit(request.limit);

        let mut entries = Vec::new();
        for index in self.targets(&request.kbs)? {
            let generation = index.current();
            entries.extend(
                generation
                    .records()
                    .map(|record| &record.entry)
                    .filter(|entry| {
                        request
                            .entry_type
                            .as_ref()
                            .is_none_or(|entry_type| &entry.entry_type == entry_type)
                    })
                    .filter(|entry| {
                        request
                            .fields
                            .iter()
                            .all(|(key, value)| entry.fields.get(key).is_some_and(|field| field.matches(value)))
                    })
                    .map(EntrySummary::from),
            );
        }

        let (entries, total, next_cursor) = paginate(entries, offset, limit);
        Ok(ListResponse {
            entries,
            total,
            next_cursor,
        })
    }

    fn targets(&self, kbs: &[String]) -> Result<Vec<Arc<KbIndex>>, SearchError> {
        if kbs.is_empty() {
            return Ok(self
                .store
                .names()
                .iter()
                .filter_map(|name| self.store.get(name))
                .collect());
        }
        kbs.iter()
            .map(|name| self.store.get(name).ok_or_else(|| SearchError::UnknownKb(name.clone())))
            .collect()
    }

    fn limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.config.default_limit)
            .clamp(1, self.config.max_limit.max(1))
    }

    #[allow(clippy::cast_precision_loss)]
    fn recency_factor(&self, modified: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f32 {
        let boost = self.config.recency_boost;
        let half_life = self.config.recency_half_life_days;
        let Some(modified) = modified else {
            return 1.0;
        };
        if boost <= 0.0 || half_life <= 0.0 {
            return 1.0;
        }
        let age_days = (now - modified).num_seconds().max(0) as f32 / SECONDS_PER_DAY;
        1.0 + boost * 0.5_f32.powf(age_days / half_life)
    }

    fn snippet(&self, snippet: &Snippet, body: &str) -> String {
        if snippet.fragment().is_empty() {
            return body_head(body, self.config.snippet_chars);
        }
        highlight(snippet)
    }
}

fn highlight(snippet: &Snippet) -> String {
    let fragment = snippet.fragment();
    let mut out = String::with_capacity(fragment.len() + 8);
    let mut last = 0;
    for range in snippet.highlighted() {
        out.push_str(&fragment[last..range.start]);
        out.push_str(HIGHLIGHT);
        out.push_str(&fragment[range.start..range.end]);
        out.push_str(HIGHLIGHT);
        last = range.end;
    }
    out.push_str(&fragment[last..]);
    out.trim().to_string()
}

/// First `max_chars` characters of the body, whitespace collapsed.
fn body_head(body: &str, max_chars: usize) -> String {
    let collapsed = body.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &collapsed[..cut]),
        None => collapsed,
    }
}

fn parse_cursor(cursor: Option<&str>) -> Result<usize, SearchError> {
    match cursor {
        None => Ok(0),
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|_| SearchError::InvalidCursor(raw.to_string())),
    }
}

fn paginate<T>(items: Vec<T>, offset: usize, limit: usize) -> (Vec<T>, usize, Option<String>) {
    let total = items.len();
    let page: Vec<T> = items.into_iter().skip(offset).take(limit).collect();
    let end = offset.saturating_add(page.len());
    let next_cursor = (end < total).then(|| end.to_string());
    (page, total, next_cursor)
}

/// Score descending, ties by id.
fn compare_results(a: &SearchResult, b: &SearchResult) -> Ordering {
    b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id))
}
