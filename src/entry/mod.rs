//! Entry model: a markdown document with YAML front matter.
//!
//! Entries are owned by a knowledge base and identified by a stable
//! [`EntryId`]. Parsing lives in [`parser`]; this module holds the types.

pub mod parser;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use parser::{EntryContext, ParsedFile, parse_entry, parse_file};

/// Errors produced while turning a file into an [`Entry`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntryError {
    #[error("Parse error in {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Unknown entry type '{entry_type}' in {path}")]
    UnknownType { path: String, entry_type: String },
}

impl EntryError {
    pub(crate) fn parse(path: &Path, message: impl Into<String>) -> Self {
        Self::Parse {
            path: display_path(path),
            message: message.into(),
        }
    }

    /// Stable error kind used in diagnostics and protocol errors.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "ParseError",
            Self::UnknownType { .. } => "UnknownTypeError",
        }
    }
}

/// Stable entry identifier: `<kb>/<relative path>` or `<kb>/<explicit id>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    /// Derive an id from the KB name and the file's path relative to the KB root.
    #[must_use]
    pub fn from_path(kb: &str, rel_path: &Path) -> Self {
        Self(format!("{kb}/{}", display_path(rel_path)))
    }

    /// Build an id from an explicit front-matter `id`.
    #[must_use]
    pub fn explicit(kb: &str, id: &str) -> Self {
        Self(format!("{kb}/{}", id.trim_matches('/')))
    }

    /// The KB name encoded in the id.
    #[must_use]
    pub fn kb(&self) -> &str {
        self.0.split_once('/').map_or(self.0.as_str(), |(kb, _)| kb)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntryId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A front-matter value. Nested mappings are not supported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<FieldValue>),
}

impl FieldValue {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this value equals `needle`, or contains it when it is a list.
    #[must_use]
    pub fn matches(&self, needle: &str) -> bool {
        match self {
            Self::List(items) => items.iter().any(|item| item.matches(needle)),
            Self::Null => false,
            other => other.to_text() == needle,
        }
    }

    /// Flatten to searchable text.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::String(s) => s.clone(),
            Self::List(items) => items
                .iter()
                .map(Self::to_text)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

/// Field schema for one entry type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryTypeSchema {
    pub name: String,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
}

impl EntryTypeSchema {
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            required: vec![],
            optional: vec![],
        }
    }
}

/// A parsed knowledge entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entry {
    pub id: EntryId,
    pub kb: String,
    /// Path relative to the KB root.
    pub path: PathBuf,
    pub entry_type: String,
    /// Effective front matter (KB defaults applied).
    pub fields: BTreeMap<String, FieldValue>,
    pub body: String,
    /// SHA-256 over normalized fields and body.
    pub hash: String,
    pub modified: Option<DateTime<Utc>>,
    /// Git HEAD observed when this entry was last (re)parsed.
    pub commit: Option<String>,
    /// Exact bytes of the front-matter block as read from disk.
    #[serde(skip)]
    header: Option<String>,
    /// Front matter as written in the file, before defaults.
    #[serde(skip)]
    declared: BTreeMap<String, FieldValue>,
}

impl Entry {
    /// Human-readable title: `title` field, first `# ` heading, or file stem.
    #[must_use]
    pub fn title(&self) -> String {
        if let Some(title) = self.fields.get("title").and_then(FieldValue::as_str) {
            return title.to_string();
        }
        if let Some(heading) = self
            .body
            .lines()
            .find_map(|line| line.strip_prefix("# "))
        {
            return heading.trim().to_string();
        }
        self.path
            .file_stem()
            .map_or_else(|| self.id.to_string(), |s| s.to_string_lossy().to_string())
    }

    /// Front matter exactly as declared in the file (no defaults).
    #[must_use]
    pub fn declared_fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.declared
    }

    /// Set a declared field. Invalidates the original header bytes.
    pub fn set_field(&mut self, key: &str, value: FieldValue) {
        self.declared.insert(key.to_string(), value.clone());
        self.fields.insert(key.to_string(), value);
        self.header = None;
    }

    /// Remove a declared field.
    pub fn remove_field(&mut self, key: &str) {
        if self.declared.remove(key).is_some() {
            self.fields.remove(key);
            self.header = None;
        }
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
    }

    /// Serialize back to markdown.
    ///
    /// While the front matter is untouched, the original header bytes are
    /// reproduced exactly.
    ///
    /// # Errors
    ///
    /// Returns an error if the front matter cannot be rendered as YAML.
    pub fn to_markdown(&self) -> Result<String, serde_yaml::Error> {
        match &self.header {
            Some(header) => Ok(format!("{header}{}", self.body)),
            None => parser::render(&self.declared, &self.body),
        }
    }
}

/// Forward-slash display of a relative path, independent of platform.
#[must_use]
pub fn display_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_id_from_path_uses_forward_slashes() {
        let id = EntryId::from_path("notes", Path::new("daily/a.md"));
        assert_eq!(id.as_str(), "notes/daily/a.md");
        assert_eq!(id.kb(), "notes");
    }

    #[test]
    fn explicit_id_is_prefixed_with_kb() {
        let id = EntryId::explicit("notes", "/adr-001/");
        assert_eq!(id.as_str(), "notes/adr-001");
    }

    #[test]
    fn field_value_matches_lists() {
        let tags = FieldValue::List(vec!["rust".into(), "search".into()]);
        assert!(tags.matches("rust"));
        assert!(!tags.matches("go"));
        assert!(FieldValue::Integer(3).matches("3"));
        assert!(!FieldValue::Null.matches(""));
    }

    #[test]
    fn field_value_deserializes_from_json() {
        let value: FieldValue = serde_json::from_str(r#"["a", 1, true, null]"#).unwrap();
        assert_eq!(
            value,
            FieldValue::List(vec![
                FieldValue::String("a".into()),
                FieldValue::Integer(1),
                FieldValue::Bool(true),
                FieldValue::Null,
            ])
        );
    }
}
