//! Front matter splitting, field conversion, and content hashing.
//!
//! The parser is pure: it never touches the filesystem. Callers hand it the
//! raw bytes of a file plus the [`EntryContext`] of the owning KB.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::entry::{Entry, EntryError, EntryId, EntryTypeSchema, FieldValue};

/// Front matter delimiter line.
const DELIMITER: &str = "---";

/// Alternate closing delimiter accepted by YAML.
const DOCUMENT_END: &str = "...";

/// Everything the parser needs to know about the owning KB.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EntryContext {
    pub kb: String,
    /// Declared entry types: host types plus plugin-contributed ones.
    pub types: BTreeMap<String, EntryTypeSchema>,
    /// KB-level field defaults, applied when a field is missing.
    pub defaults: BTreeMap<String, FieldValue>,
}

/// A file that could not be turned into an entry.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidEntry {
    pub id: EntryId,
    pub path: PathBuf,
    pub error: EntryError,
}

/// Result of parsing one file. Invalid files become a marker, not a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedFile {
    Valid(Entry),
    Invalid(InvalidEntry),
}

struct Split<'a> {
    header: &'a str,
    yaml: &'a str,
    body: &'a str,
}

/// Parse a file into an [`InvalidEntry`] marker instead of failing.
#[must_use]
pub fn parse_file(ctx: &EntryContext, rel_path: &Path, bytes: &[u8]) -> ParsedFile {
    match parse_entry(ctx, rel_path, bytes) {
        Ok(entry) => ParsedFile::Valid(entry),
        Err(error) => ParsedFile::Invalid(InvalidEntry {
            id: EntryId::from_path(&ctx.kb, rel_path),
            path: rel_path.to_path_buf(),
            error,
        }),
    }
}

/// Parse raw file bytes into an [`Entry`].
///
/// `modified` and `commit` are left unset; the synchronizer fills them in.
///
/// # Errors
///
/// Returns `EntryError::Parse` for malformed front matter, missing type, or
/// missing required fields, and `EntryError::UnknownType` when the resolved
/// type is not declared for the KB.
pub fn parse_entry(ctx: &EntryContext, rel_path: &Path, bytes: &[u8]) -> Result<Entry, EntryError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| EntryError::parse(rel_path, format!("not valid UTF-8: {e}")))?;

    let split = split_front_matter(rel_path, text)?;
    let declared = parse_fields(rel_path, split.yaml)?;

    let entry_type = resolve_type(ctx, rel_path, &declared)?;
    let Some(schema) = ctx.types.get(&entry_type) else {
        return Err(EntryError::UnknownType {
            path: super::display_path(rel_path),
            entry_type,
        });
    };

    let mut fields = ctx.defaults.clone();
    fields.extend(declared.iter().map(|(k, v)| (k.clone(), v.clone())));
    fields.insert("type".to_string(), FieldValue::String(entry_type.clone()));

    for required in &schema.required {
        if matches!(fields.get(required), None | Some(FieldValue::Null)) {
            return Err(EntryError::parse(
                rel_path,
                format!("missing required field '{required}' for type '{entry_type}'"),
            ));
        }
    }

    let id = match declared.get("id") {
        Some(FieldValue::String(explicit)) if !explicit.trim().is_empty() => {
            EntryId::explicit(&ctx.kb, explicit.trim())
        }
        Some(FieldValue::String(_) | FieldValue::Null) | None => {
            EntryId::from_path(&ctx.kb, rel_path)
        }
        Some(_) => return Err(EntryError::parse(rel_path, "'id' must be a string")),
    };

    let hash = content_hash(&fields, split.body);

    Ok(Entry {
        id,
        kb: ctx.kb.clone(),
        path: rel_path.to_path_buf(),
        entry_type,
        fields,
        body: split.body.to_string(),
        hash,
        modified: None,
        commit: None,
        header: Some(split.header.to_string()),
        declared,
    })
}

/// Split text into the exact header bytes, the YAML between delimiters, and the body.
///
/// Files without an opening delimiter have an empty header and YAML.
fn split_front_matter<'a>(rel_path: &Path, text: &'a str) -> Result<Split<'a>, EntryError> {
    let bom = if text.starts_with('\u{feff}') {
        '\u{feff}'.len_utf8()
    } else {
        0
    };

    let mut lines = text[bom..].split_inclusive('\n');
    let opening = match lines.next() {
        Some(line) if line.trim_end() == DELIMITER => line,
        _ => {
            return Ok(Split {
                header: &text[..bom],
                yaml: "",
                body: &text[bom..],
            });
        }
    };

    let yaml_start = bom + opening.len();
    let mut offset = yaml_start;
    for line in lines {
        let trimmed = line.trim_end();
        if trimmed == DELIMITER || trimmed == DOCUMENT_END {
            let header_end = offset + line.len();
            return Ok(Split {
                header: &text[..header_end],
                yaml: &text[yaml_start..offset],
                body: &text[header_end..],
            });
        }
        offset += line.len();
    }

    Err(EntryError::parse(rel_path, "unterminated front matter block"))
}

fn parse_fields(rel_path: &Path, yaml: &str) -> Result<BTreeMap<String, FieldValue>, EntryError> {
    if yaml.trim().is_empty() {
        return Ok(BTreeMap::new());
    }

    let value: serde_yaml::Value = serde_yaml::from_str(yaml)
        .map_err(|e| EntryError::parse(rel_path, format!("invalid YAML: {e}")))?;

    let mapping = match value {
        serde_yaml::Value::Mapping(mapping) => mapping,
        serde_yaml::Value::Null => return Ok(BTreeMap::new()),
        _ => return Err(EntryError::parse(rel_path, "front matter must be a mapping")),
    };

    let mut fields = BTreeMap::new();
    for (key, value) in mapping {
        let serde_yaml::Value::String(key) = key else {
            return Err(EntryError::parse(rel_path, "front matter keys must be strings"));
        };
        let value = convert_value(rel_path, &key, value)?;
        fields.insert(key, value);
    }
    Ok(fields)
}

fn convert_value(rel_path: &Path, key: &str, value: serde_yaml::Value) -> Result<FieldValue, EntryError> {
    use serde_yaml::Value;

    Ok(match value {
        Value::Null => FieldValue::Null,
        Value::Bool(b) => FieldValue::Bool(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => FieldValue::Integer(i),
            None => FieldValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => FieldValue::String(s),
        Value::Sequence(items) => FieldValue::List(
            items
                .into_iter()
                .map(|item| convert_value(rel_path, key, item))
                .collect::<Result<_, _>>()?,
        ),
        Value::Mapping(_) => {
            return Err(EntryError::parse(
                rel_path,
                format!("field '{key}' is a nested mapping"),
            ));
        }
        Value::Tagged(tagged) => convert_value(rel_path, key, tagged.value)?,
    })
}

/// Type comes from front matter, then the top-level directory, then KB defaults.
fn resolve_type(
    ctx: &EntryContext,
    rel_path: &Path,
    declared: &BTreeMap<String, FieldValue>,
) -> Result<String, EntryError> {
    match declared.get("type") {
        Some(FieldValue::String(t)) if !t.trim().is_empty() => return Ok(t.trim().to_string()),
        Some(FieldValue::String(_) | FieldValue::Null) | None => {}
        Some(_) => return Err(EntryError::parse(rel_path, "'type' must be a string")),
    }

    let mut components = rel_path.components();
    let first = components.next();
    if components.next().is_some()
        && let Some(dir) = first
    {
        let dir = dir.as_os_str().to_string_lossy();
        if ctx.types.contains_key(dir.as_ref()) {
            return Ok(dir.to_string());
        }
    }

    ctx.defaults
        .get("type")
        .and_then(FieldValue::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| EntryError::parse(rel_path, "no entry type in front matter or defaults"))
}

/// Content hash over normalized fields and body.
///
/// Trailing whitespace, line endings, and surrounding blank lines in the body
/// do not affect the hash.
#[must_use]
pub fn content_hash(fields: &BTreeMap<String, FieldValue>, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(fields).unwrap_or_default());
    hasher.update([0u8]);
    hasher.update(normalize_body(body).as_bytes());
    hex::encode(hasher.finalize())
}

fn normalize_body(body: &str) -> String {
    body.lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim_matches('\n')
        .to_string()
}

/// Render declared fields and a body as a markdown file.
pub(crate) fn render(
    fields: &BTreeMap<String, FieldValue>,
    body: &str,
) -> Result<String, serde_yaml::Error> {
    if fields.is_empty() {
        return Ok(body.to_string());
    }
    let yaml = serde_yaml::to_string(fields)?;
    Ok(format!("{DELIMITER}\n{yaml}{DELIMITER}\n{body}"))
}
