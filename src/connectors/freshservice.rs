//! Freshservice connector implementation
//!
//! API key over HTTP basic auth, page-number pagination on the v2 REST API,
//! two-phase extraction for tickets, changes and problems, and loading by one
//! `POST` per record with field-level validation errors.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};
use url::Url;

use crate::connectors::canonical::{self, FieldMap};
use crate::connectors::http::ApiClient;
use crate::connectors::metadata::{AuthType, ConfigField, ConnectorMetadata, EntityTypeInfo};
use crate::connectors::registry::ConnectorContext;
use crate::connectors::trait_::{
    Connector, ConnectorError, Cursor, ExtractOptions, ExtractPage, LoadOutcome, RecordError,
};

pub const CONNECTOR_TYPE: &str = "freshservice";

/// Freshservice caps `per_page` at 100
const MAX_PAGE_SIZE: u32 = 100;

const READ_ONLY_FIELDS: &[&str] = &[
    "id",
    "display_id",
    "created_at",
    "updated_at",
    "deleted",
    "sys_id",
    "sys_created_on",
    "sys_updated_on",
];

/// REST resource behind one entity type
struct Resource {
    entity_type: &'static str,
    path: &'static str,
    /// Wrapper key of a single-record response
    detail_key: &'static str,
    supports_detail: bool,
    supports_load: bool,
    fields: FieldMap,
}

const fn summary(title: &'static str) -> FieldMap {
    FieldMap {
        id: "id",
        title,
        status: "status",
        created_at: "created_at",
        updated_at: "updated_at",
    }
}

const RESOURCES: &[Resource] = &[
    Resource {
        entity_type: "tickets",
        path: "tickets",
        detail_key: "ticket",
        supports_detail: true,
        supports_load: true,
        fields: summary("subject"),
    },
    Resource {
        entity_type: "changes",
        path: "changes",
        detail_key: "change",
        supports_detail: true,
        supports_load: true,
        fields: summary("subject"),
    },
    Resource {
        entity_type: "problems",
        path: "problems",
        detail_key: "problem",
        supports_detail: true,
        supports_load: true,
        fields: summary("subject"),
    },
    Resource {
        entity_type: "assets",
        path: "assets",
        detail_key: "asset",
        supports_detail: false,
        supports_load: true,
        fields: summary("name"),
    },
    Resource {
        entity_type: "users",
        path: "requesters",
        detail_key: "requester",
        supports_detail: false,
        supports_load: true,
        fields: summary("primary_email"),
    },
    Resource {
        entity_type: "agents",
        path: "agents",
        detail_key: "agent",
        supports_detail: false,
        supports_load: false,
        fields: summary("email"),
    },
    Resource {
        entity_type: "groups",
        path: "groups",
        detail_key: "group",
        supports_detail: false,
        supports_load: true,
        fields: summary("name"),
    },
];

fn resource(entity_type: &str) -> Result<&'static Resource, ConnectorError> {
    RESOURCES
        .iter()
        .find(|resource| resource.entity_type == entity_type)
        .ok_or_else(|| ConnectorError::UnsupportedEntity {
            entity_type: entity_type.to_string(),
        })
}

/// Validation error body returned on 400
#[derive(Debug, Deserialize)]
struct ValidationBody {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    errors: Vec<ValidationItem>,
}

#[derive(Debug, Deserialize)]
struct ValidationItem {
    #[serde(default)]
    field: Option<String>,
    message: String,
}

pub struct FreshserviceConnector {
    metadata: ConnectorMetadata,
    base_url: Url,
    api_key: String,
    client: ApiClient,
}

impl FreshserviceConnector {
    pub fn metadata_record() -> ConnectorMetadata {
        ConnectorMetadata {
            connector_type: CONNECTOR_TYPE.to_string(),
            display_name: "Freshservice".to_string(),
            auth_type: AuthType::ApiKey,
            config_fields: vec![
                ConfigField::required("domain", "Domain")
                    .describe("Account subdomain, e.g. `acme` for acme.freshservice.com"),
                ConfigField::required("apiKey", "API key").secret(),
                ConfigField::optional("baseUrl", "Base URL override"),
            ],
            entity_types: RESOURCES
                .iter()
                .map(|r| EntityTypeInfo::new(r.entity_type, r.supports_detail, r.supports_load))
                .collect(),
            max_page_size: MAX_PAGE_SIZE,
            max_detail_batch_size: 20,
            max_load_batch_size: 50,
        }
    }

    pub fn new(context: ConnectorContext) -> Result<Self, ConnectorError> {
        let config = &context.config;
        let text = |key: &str| {
            config
                .get(key)
                .and_then(JsonValue::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };

        let api_key = text("apiKey")
            .ok_or_else(|| ConnectorError::configuration("freshservice: apiKey is required"))?
            .to_string();

        let base = match (text("baseUrl"), text("domain")) {
            (Some(base_url), _) => base_url.to_string(),
            (None, Some(domain)) if domain.contains('.') => format!("https://{domain}"),
            (None, Some(domain)) => format!("https://{domain}.freshservice.com"),
            (None, None) => {
                return Err(ConnectorError::configuration(
                    "freshservice: domain is required",
                ));
            }
        };
        let base_url = Url::parse(&base)
            .map_err(|e| ConnectorError::configuration(format!("freshservice: {e}")))?;

        let client = ApiClient::new(
            context.http.clone(),
            context.tenant_id,
            CONNECTOR_TYPE,
            context.limiter.clone(),
            context.cancellation.clone(),
        );

        Ok(Self {
            metadata: Self::metadata_record(),
            base_url,
            api_key,
            client,
        })
    }

    fn url(&self, path: &str) -> Result<Url, ConnectorError> {
        self.base_url
            .join(&format!("/api/v2/{path}"))
            .map_err(|e| ConnectorError::configuration(e.to_string()))
    }

    async fn get_json(&self, url: Url) -> Result<JsonValue, ConnectorError> {
        self.client
            .send_json(|http| {
                http.get(url.clone())
                    .basic_auth(&self.api_key, Some("X"))
                    .header("Accept", "application/json")
            })
            .await
    }

    /// `Ok(Some(_))` when the platform rejected the record; `Err` for
    /// conditions that must stop the whole batch.
    async fn create_record(
        &self,
        resource: &Resource,
        index: usize,
        payload: &JsonValue,
    ) -> Result<Option<RecordError>, ConnectorError> {
        let url = self.url(resource.path)?;

        let result = self
            .client
            .send(|http| {
                http.post(url.clone())
                    .basic_auth(&self.api_key, Some("X"))
                    .json(payload)
            })
            .await;

        match result {
            Ok(_) => Ok(None),
            Err(error) if error.is_fatal() => Err(error),
            Err(ConnectorError::Http { status, body }) if status == 400 || status == 422 => {
                Ok(Some(validation_error(index, &body)))
            }
            Err(error) => Ok(Some(RecordError::new(index, error.to_string()))),
        }
    }
}

fn validation_error(index: usize, body: &str) -> RecordError {
    match serde_json::from_str::<ValidationBody>(body) {
        Ok(parsed) => parsed.errors.into_iter().fold(
            RecordError::new(
                index,
                parsed
                    .description
                    .unwrap_or_else(|| "Validation failed".to_string()),
            ),
            |error, item| error.with_field(item.field.unwrap_or_default(), item.message),
        ),
        Err(_) => RecordError::new(index, format!("HTTP 400: {body}")),
    }
}

#[async_trait]
impl Connector for FreshserviceConnector {
    fn metadata(&self) -> &ConnectorMetadata {
        &self.metadata
    }

    async fn test_connection(&self) -> Result<(), ConnectorError> {
        let mut url = self.url("tickets")?;
        url.query_pairs_mut().append_pair("per_page", "1");
        self.get_json(url).await?;
        info!(base_url = %self.base_url, "Freshservice connection verified");
        Ok(())
    }

    async fn authenticate(&self) -> Result<(), ConnectorError> {
        // API keys need no token exchange; a rejected key surfaces on first use
        if self.api_key.is_empty() {
            return Err(ConnectorError::Authentication {
                details: "freshservice API key is empty".to_string(),
            });
        }
        Ok(())
    }

    async fn extract(
        &self,
        entity_type: &str,
        options: &ExtractOptions,
    ) -> Result<ExtractPage, ConnectorError> {
        let resource = resource(entity_type)?;
        let per_page = options.batch_size.clamp(1, MAX_PAGE_SIZE);
        let page = match &options.cursor {
            None => 1,
            Some(Cursor::Page(page)) => *page,
            Some(other) => {
                return Err(ConnectorError::configuration(format!(
                    "freshservice pages by number, got cursor {other:?}"
                )));
            }
        };

        let mut url = self.url(resource.path)?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("page", &page.to_string())
                .append_pair("per_page", &per_page.to_string());
            if resource.supports_detail
                && let Some(start) = options.start_date
            {
                query.append_pair("updated_since", &start.to_rfc3339());
            }
        }

        let body = self.get_json(url).await?;
        let listed = body
            .get(resource.path)
            .and_then(JsonValue::as_array)
            .ok_or_else(|| {
                ConnectorError::malformed(format!("missing '{}' array", resource.path))
            })?;

        // A full page means there may be more
        let has_more = listed.len() as u32 == per_page;

        let records = listed
            .iter()
            .filter(|record| match options.end_date {
                Some(end) => record
                    .get("updated_at")
                    .and_then(JsonValue::as_str)
                    .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
                    .is_none_or(|updated| updated <= end),
                None => true,
            })
            .cloned()
            .collect::<Vec<_>>();

        debug!(entity_type, page, records = records.len(), has_more, "Freshservice page");

        Ok(ExtractPage {
            records,
            total_count: None,
            has_more,
            next_cursor: has_more.then_some(Cursor::Page(page + 1)),
        })
    }

    async fn fetch_detail(
        &self,
        entity_type: &str,
        record: &JsonValue,
    ) -> Result<JsonValue, ConnectorError> {
        let resource = resource(entity_type)?;
        let id = canonical::record_id(record)
            .ok_or_else(|| ConnectorError::malformed("listed record has no id"))?;

        let body = self
            .get_json(self.url(&format!("{}/{}", resource.path, id))?)
            .await?;
        body.get(resource.detail_key)
            .cloned()
            .ok_or_else(|| ConnectorError::malformed(format!("missing '{}'", resource.detail_key)))
    }

    fn transform_for_extraction(&self, entity_type: &str, records: &[JsonValue]) -> Vec<JsonValue> {
        let fields = resource(entity_type)
            .map(|r| r.fields)
            .unwrap_or(summary("name"));
        records
            .iter()
            .map(|record| canonical::to_canonical(CONNECTOR_TYPE, entity_type, &fields, record))
            .collect()
    }

    fn transform_for_load(&self, entity_type: &str, records: &[JsonValue]) -> Vec<JsonValue> {
        let title = resource(entity_type)
            .map(|r| r.fields.title)
            .unwrap_or("name");
        records
            .iter()
            .map(|record| canonical::load_payload(record, READ_ONLY_FIELDS, title))
            .collect()
    }

    fn validate_for_load(&self, entity_type: &str, records: &[JsonValue]) -> Vec<RecordError> {
        let required: &[&str] = match entity_type {
            "tickets" | "changes" | "problems" => &["subject", "description"],
            "users" => &["first_name", "primary_email"],
            "assets" => &["name", "asset_type_id"],
            "groups" => &["name"],
            _ => &[],
        };

        records
            .iter()
            .enumerate()
            .filter_map(|(index, record)| {
                let missing: Vec<&str> = required
                    .iter()
                    .copied()
                    .filter(|field| !canonical::has_value(record, field))
                    .collect();
                let needs_requester = entity_type == "tickets"
                    && !canonical::has_value(record, "email")
                    && !canonical::has_value(record, "requester_id");

                if missing.is_empty() && !needs_requester {
                    return None;
                }

                let mut error = RecordError::new(index, "Validation failed")
                    .with_record_id(canonical::record_id(record));
                for field in missing {
                    error = error.with_field(field, "is required");
                }
                if needs_requester {
                    error = error.with_field("email", "email or requester_id is required");
                }
                Some(error)
            })
            .collect()
    }

    async fn load_batch(
        &self,
        entity_type: &str,
        records: &[JsonValue],
    ) -> Result<LoadOutcome, ConnectorError> {
        let resource = resource(entity_type)?;
        if !resource.supports_load {
            return Err(ConnectorError::UnsupportedEntity {
                entity_type: entity_type.to_string(),
            });
        }

        let mut outcome = LoadOutcome::default();
        for (index, payload) in records.iter().enumerate() {
            match self.create_record(resource, index, payload).await? {
                None => outcome.record_success(),
                Some(error) => {
                    warn!(entity_type, index, error = %error.message, "Record rejected");
                    outcome.record_failure(error);
                }
            }
            self.client.ensure_not_cancelled().await?;
        }

        Ok(outcome)
    }
}
