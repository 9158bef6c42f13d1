//! Paginated extraction driver
//!
//! Walks a connector's list endpoint page by page until `has_more` is false,
//! then hands the listed records to the detail phase when the job asked for
//! details and the entity type supports them. Reported totals are never used
//! to decide when to stop.

use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::connectors::detail;
use crate::connectors::trait_::{
    Connector, ConnectorError, ExtractOptions, ExtractionControl, ExtractionProgress,
    ExtractionStage,
};

/// Extract every page of `entity_type`, honouring `max_records`.
pub async fn extract_all<C>(
    connector: &C,
    entity_type: &str,
    options: &ExtractOptions,
    control: &dyn ExtractionControl,
) -> Result<Vec<JsonValue>, ConnectorError>
where
    C: Connector + ?Sized,
{
    let connector_type = connector.metadata().connector_type.as_str();
    let mut records: Vec<JsonValue> = Vec::new();
    let mut cursor = options.cursor.clone();
    let mut total_count = None;
    let mut pages = 0u32;

    loop {
        let page = connector
            .extract(entity_type, &options.at(cursor.clone()))
            .await?;
        pages += 1;
        total_count = page.total_count.or(total_count);

        debug!(
            connector_type,
            entity_type,
            page = pages,
            records = page.records.len(),
            has_more = page.has_more,
            "Fetched page"
        );

        records.extend(page.records);

        let limit_reached = options
            .max_records
            .is_some_and(|max| records.len() as u64 >= max);
        if let Some(max) = options.max_records
            && limit_reached
        {
            records.truncate(usize::try_from(max).unwrap_or(usize::MAX));
        }

        control
            .checkpoint(&ExtractionProgress {
                entity_type: entity_type.to_string(),
                stage: ExtractionStage::List,
                records_fetched: records.len() as u64,
                total_count,
            })
            .await?;

        if !page.has_more || limit_reached {
            break;
        }

        let Some(next) = page.next_cursor else {
            return Err(ConnectorError::malformed(format!(
                "{entity_type}: page {pages} reports more records without a next cursor"
            )));
        };
        if cursor.as_ref() == Some(&next) {
            return Err(ConnectorError::malformed(format!(
                "{entity_type}: cursor did not advance after page {pages}"
            )));
        }
        cursor = Some(next);
    }

    info!(
        connector_type,
        entity_type,
        pages,
        records = records.len(),
        "List phase complete"
    );

    let wants_detail = options.include_details
        && connector
            .metadata()
            .entity(entity_type)
            .is_some_and(|entity| entity.supports_detail);

    if wants_detail {
        records = detail::fetch_details(connector, entity_type, records, options, control).await?;
    }

    Ok(records)
}
