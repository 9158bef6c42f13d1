//! Canonical record envelope
//!
//! Extraction output is normalised into one envelope so a migration can load
//! records from any source into any destination:
//!
//! ```json
//! { "externalId": "42", "entityType": "tickets", "sourceSystem": "freshservice",
//!   "title": "...", "status": "...", "createdAt": "...", "updatedAt": "...",
//!   "extraction": "detail", "fields": { ...platform record... } }
//! ```
//!
//! Per-platform field-mapping tables are out of scope; the untouched platform
//! record travels in `fields` and destinations copy what they understand.

use serde_json::{Map, Value as JsonValue};

use crate::connectors::detail::{EXTRACTION_MARKER_FIELD, extraction_source};

/// Where a platform keeps the envelope's summary fields.
#[derive(Debug, Clone, Copy)]
pub struct FieldMap {
    pub id: &'static str,
    pub title: &'static str,
    pub status: &'static str,
    pub created_at: &'static str,
    pub updated_at: &'static str,
}

fn pick(record: &JsonValue, field: &str) -> JsonValue {
    match record.get(field) {
        // ServiceNow display-value responses wrap values
        Some(JsonValue::Object(wrapped)) => wrapped
            .get("value")
            .or_else(|| wrapped.get("display_value"))
            .cloned()
            .unwrap_or(JsonValue::Null),
        Some(value) => value.clone(),
        None => JsonValue::Null,
    }
}

fn id_string(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Number(n) => JsonValue::String(n.to_string()),
        other => other,
    }
}

/// Wrap one platform record in the canonical envelope.
pub fn to_canonical(
    source_system: &str,
    entity_type: &str,
    map: &FieldMap,
    record: &JsonValue,
) -> JsonValue {
    let mut fields = record.clone();
    if let Some(object) = fields.as_object_mut() {
        object.remove(EXTRACTION_MARKER_FIELD);
    }

    let mut envelope = Map::new();
    envelope.insert("externalId".into(), id_string(pick(record, map.id)));
    envelope.insert("entityType".into(), entity_type.into());
    envelope.insert("sourceSystem".into(), source_system.into());
    envelope.insert("title".into(), pick(record, map.title));
    envelope.insert("status".into(), pick(record, map.status));
    envelope.insert("createdAt".into(), pick(record, map.created_at));
    envelope.insert("updatedAt".into(), pick(record, map.updated_at));
    envelope.insert(
        "extraction".into(),
        extraction_source(record).unwrap_or("list").into(),
    );
    envelope.insert("fields".into(), fields);
    JsonValue::Object(envelope)
}

/// The external id of a canonical or raw record, for error reports.
pub fn record_id(record: &JsonValue) -> Option<String> {
    ["externalId", "id", "sys_id"]
        .iter()
        .find_map(|key| match record.get(*key) {
            Some(JsonValue::String(s)) => Some(s.clone()),
            Some(JsonValue::Number(n)) => Some(n.to_string()),
            _ => None,
        })
}

/// Build a create payload from a canonical (or raw) record: copy its platform
/// fields minus `read_only`, and fill `title_field` from the envelope title
/// when the fields lack it.
pub fn load_payload(record: &JsonValue, read_only: &[&str], title_field: &str) -> JsonValue {
    let is_canonical = record.get("fields").is_some() && record.get("sourceSystem").is_some();
    let source = if is_canonical {
        record.get("fields").cloned().unwrap_or(JsonValue::Null)
    } else {
        record.clone()
    };

    let mut payload = match source {
        JsonValue::Object(object) => object,
        _ => Map::new(),
    };
    payload.remove(EXTRACTION_MARKER_FIELD);
    for field in read_only {
        payload.remove(*field);
    }

    let has_title = payload
        .get(title_field)
        .is_some_and(|value| !value.is_null());
    if is_canonical
        && !has_title
        && let Some(title) = record.get("title").filter(|t| !t.is_null())
    {
        payload.insert(title_field.to_string(), title.clone());
    }

    JsonValue::Object(payload)
}

/// Whether `field` holds a non-blank value.
pub fn has_value(record: &JsonValue, field: &str) -> bool {
    match record.get(field) {
        Some(JsonValue::String(s)) => !s.trim().is_empty(),
        Some(JsonValue::Null) | None => false,
        Some(_) => true,
    }
}
