//! Detail phase of two-phase extraction
//!
//! List endpoints often omit fields that only the per-record endpoint returns.
//! Listed records are enriched in bounded concurrent batches with a fixed pause
//! between batches. A record whose detail call fails keeps its list fields and
//! is marked as a fallback instead of being dropped.

use futures::future::join_all;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, info, warn};

use crate::config::MAX_DETAIL_BATCH_SIZE;
use crate::connectors::trait_::{
    Connector, ConnectorError, ExtractOptions, ExtractionControl, ExtractionProgress,
    ExtractionStage,
};

/// Field added to every record that went through the detail phase.
pub const EXTRACTION_MARKER_FIELD: &str = "_extraction";
pub const SOURCE_DETAIL: &str = "detail";
pub const SOURCE_LIST_FALLBACK: &str = "list_fallback";

/// Concurrency actually used for a detail phase.
pub fn effective_batch_size(requested: usize, connector_max: usize) -> usize {
    requested
        .max(1)
        .min(connector_max.max(1))
        .min(MAX_DETAIL_BATCH_SIZE)
}

/// `"detail"`, `"list_fallback"` or `None` for records never enriched.
pub fn extraction_source(record: &JsonValue) -> Option<&str> {
    record
        .get(EXTRACTION_MARKER_FIELD)
        .and_then(|marker| marker.get("source"))
        .and_then(JsonValue::as_str)
}

fn merge_detail(listed: &JsonValue, detail: JsonValue) -> JsonValue {
    match (listed, detail) {
        (JsonValue::Object(listed), JsonValue::Object(detail)) => {
            let mut merged = listed.clone();
            merged.extend(detail);
            merged.insert(
                EXTRACTION_MARKER_FIELD.to_string(),
                json!({ "source": SOURCE_DETAIL }),
            );
            JsonValue::Object(merged)
        }
        (_, detail) => detail,
    }
}

fn mark_fallback(listed: &JsonValue, error: &ConnectorError) -> JsonValue {
    let mut record = listed.clone();
    if let Some(object) = record.as_object_mut() {
        object.insert(
            EXTRACTION_MARKER_FIELD.to_string(),
            json!({ "source": SOURCE_LIST_FALLBACK, "error": error.to_string() }),
        );
    }
    record
}

/// Enrich `records` with per-record detail calls.
pub async fn fetch_details<C>(
    connector: &C,
    entity_type: &str,
    records: Vec<JsonValue>,
    options: &ExtractOptions,
    control: &dyn ExtractionControl,
) -> Result<Vec<JsonValue>, ConnectorError>
where
    C: Connector + ?Sized,
{
    let batch_size = effective_batch_size(
        options.detail_batch_size,
        connector.metadata().max_detail_batch_size,
    );
    let total = records.len() as u64;
    let mut enriched = Vec::with_capacity(records.len());
    let mut fallbacks = 0usize;

    for (batch_index, chunk) in records.chunks(batch_size).enumerate() {
        if batch_index > 0 {
            control.sleep(options.detail_batch_delay).await;
        }

        control
            .checkpoint(&ExtractionProgress {
                entity_type: entity_type.to_string(),
                stage: ExtractionStage::Detail,
                records_fetched: enriched.len() as u64,
                total_count: Some(total),
            })
            .await?;

        let results = join_all(
            chunk
                .iter()
                .map(|record| connector.fetch_detail(entity_type, record)),
        )
        .await;

        for (listed, result) in chunk.iter().zip(results) {
            match result {
                Ok(detail) => enriched.push(merge_detail(listed, detail)),
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => {
                    fallbacks += 1;
                    warn!(
                        entity_type,
                        record_id = %listed.get("id").unwrap_or(&JsonValue::Null),
                        error = %error,
                        "Detail fetch failed; keeping list fields"
                    );
                    enriched.push(mark_fallback(listed, &error));
                }
            }
        }

        debug!(
            entity_type,
            batch = batch_index + 1,
            done = enriched.len(),
            total,
            "Detail batch complete"
        );
    }

    info!(
        entity_type,
        records = enriched.len(),
        fallbacks,
        "Detail phase complete"
    );

    Ok(enriched)
}
