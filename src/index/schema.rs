//! Tantivy schema for entries.

use tantivy::TantivyDocument;
use tantivy::schema::{Field, STORED, STRING, Schema, TEXT};

use crate::entry::{Entry, FieldValue};

/// Front-matter keys that are indexed through dedicated fields instead of `meta`.
const RESERVED_KEYS: &[&str] = &["id", "type", "title"];

/// Schema field handles.
#[derive(Debug, Clone, Copy)]
pub struct SchemaFields {
    pub id: Field,
    pub entry_type: Field,
    pub title: Field,
    pub body: Field,
    pub meta: Field,
}

/// Build the entry schema.
///
/// Fields:
/// - `id`: exact entry id, stored; used for deletes and record lookup
/// - `entry_type`: exact match filter
/// - `title`: searchable text, boosted at query time
/// - `body`: searchable markdown body
/// - `meta`: searchable text of string and list front-matter values
#[must_use]
pub fn build_schema() -> (Schema, SchemaFields) {
    let mut schema_builder = Schema::builder();

    let id = schema_builder.add_text_field("id", STRING | STORED);
    let entry_type = schema_builder.add_text_field("entry_type", STRING);
    let title = schema_builder.add_text_field("title", TEXT);
    let body = schema_builder.add_text_field("body", TEXT);
    let meta = schema_builder.add_text_field("meta", TEXT);

    let schema = schema_builder.build();
    let fields = SchemaFields {
        id,
        entry_type,
        title,
        body,
        meta,
    };

    (schema, fields)
}

/// Tokenizable representation of an entry.
#[must_use]
pub fn to_document(fields: &SchemaFields, entry: &Entry) -> TantivyDocument {
    let mut doc = TantivyDocument::new();
    doc.add_text(fields.id, entry.id.as_str());
    doc.add_text(fields.entry_type, &entry.entry_type);
    doc.add_text(fields.title, entry.title());
    doc.add_text(fields.body, &entry.body);

    for (key, value) in &entry.fields {
        if RESERVED_KEYS.contains(&key.as_str()) {
            continue;
        }
        match value {
            FieldValue::String(_) | FieldValue::List(_) => doc.add_text(fields.meta, value.to_text()),
            FieldValue::Null | FieldValue::Bool(_) | FieldValue::Integer(_) | FieldValue::Float(_) => {}
        }
    }

    doc
}
