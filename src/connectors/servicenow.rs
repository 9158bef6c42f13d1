//! ServiceNow connector implementation
//!
//! OAuth 2.0 against the instance token endpoint (password or client
//! credentials grant), offset pagination over the Table API, and loading via
//! Table API `POST`. Tokens are cached per connector instance and refreshed
//! once when a data call is rejected with 401.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::connectors::canonical::{self, FieldMap};
use crate::connectors::http::ApiClient;
use crate::connectors::metadata::{AuthType, ConfigField, ConnectorMetadata, EntityTypeInfo};
use crate::connectors::registry::ConnectorContext;
use crate::connectors::trait_::{
    Connector, ConnectorError, Cursor, ExtractOptions, ExtractPage, LoadOutcome, RecordError,
};

pub const CONNECTOR_TYPE: &str = "servicenow";

const MAX_PAGE_SIZE: u32 = 1000;

/// Refresh this long before the reported expiry
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

const READ_ONLY_FIELDS: &[&str] = &[
    "sys_id",
    "sys_created_on",
    "sys_created_by",
    "sys_updated_on",
    "sys_updated_by",
    "sys_mod_count",
    "sys_tags",
    "number",
    "id",
    "display_id",
    "created_at",
    "updated_at",
];

struct Table {
    entity_type: &'static str,
    name: &'static str,
    supports_detail: bool,
    fields: FieldMap,
    required: &'static [&'static str],
}

const fn summary(title: &'static str, status: &'static str) -> FieldMap {
    FieldMap {
        id: "sys_id",
        title,
        status,
        created_at: "sys_created_on",
        updated_at: "sys_updated_on",
    }
}

const TABLES: &[Table] = &[
    Table {
        entity_type: "incidents",
        name: "incident",
        supports_detail: true,
        fields: summary("short_description", "state"),
        required: &["short_description"],
    },
    Table {
        entity_type: "changes",
        name: "change_request",
        supports_detail: true,
        fields: summary("short_description", "state"),
        required: &["short_description"],
    },
    Table {
        entity_type: "problems",
        name: "problem",
        supports_detail: true,
        fields: summary("short_description", "state"),
        required: &["short_description"],
    },
    Table {
        entity_type: "users",
        name: "sys_user",
        supports_detail: false,
        fields: summary("user_name", "active"),
        required: &["user_name"],
    },
    Table {
        entity_type: "groups",
        name: "sys_user_group",
        supports_detail: false,
        fields: summary("name", "active"),
        required: &["name"],
    },
    Table {
        entity_type: "assets",
        name: "alm_asset",
        supports_detail: false,
        fields: summary("display_name", "install_status"),
        required: &["model"],
    },
];

fn table(entity_type: &str) -> Result<&'static Table, ConnectorError> {
    TABLES
        .iter()
        .find(|table| table.entity_type == entity_type)
        .ok_or_else(|| ConnectorError::UnsupportedEntity {
            entity_type: entity_type.to_string(),
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GrantType {
    Password,
    ClientCredentials,
}

#[derive(Debug, Clone)]
struct Credentials {
    client_id: String,
    client_secret: String,
    username: Option<String>,
    password: Option<String>,
    grant_type: GrantType,
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

/// Table API error envelope
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(default)]
    detail: Option<String>,
}

pub struct ServiceNowConnector {
    metadata: ConnectorMetadata,
    instance_url: Url,
    credentials: Credentials,
    token: RwLock<Option<AccessToken>>,
    client: ApiClient,
}

impl ServiceNowConnector {
    pub fn metadata_record() -> ConnectorMetadata {
        ConnectorMetadata {
            connector_type: CONNECTOR_TYPE.to_string(),
            display_name: "ServiceNow".to_string(),
            auth_type: AuthType::OAuth2,
            config_fields: vec![
                ConfigField::required("instanceUrl", "Instance URL")
                    .describe("e.g. https://acme.service-now.com"),
                ConfigField::required("clientId", "OAuth client ID"),
                ConfigField::required("clientSecret", "OAuth client secret").secret(),
                ConfigField::optional("username", "Username"),
                ConfigField::optional("password", "Password").secret(),
                ConfigField::optional("grantType", "Grant type")
                    .describe("`password` (default) or `client_credentials`"),
                ConfigField::optional("scope", "Scope"),
            ],
            entity_types: TABLES
                .iter()
                .map(|t| EntityTypeInfo::new(t.entity_type, t.supports_detail, true))
                .collect(),
            max_page_size: MAX_PAGE_SIZE,
            max_detail_batch_size: 20,
            max_load_batch_size: 100,
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
                .map(str::to_string)
        };
        let required = |key: &str| {
            text(key).ok_or_else(|| {
                ConnectorError::configuration(format!("servicenow: {key} is required"))
            })
        };

        let instance_url = Url::parse(&required("instanceUrl")?)
            .map_err(|e| ConnectorError::configuration(format!("servicenow: {e}")))?;

        let grant_type = match text("grantType").as_deref() {
            None | Some("password") => GrantType::Password,
            Some("client_credentials") => GrantType::ClientCredentials,
            Some(other) => {
                return Err(ConnectorError::configuration(format!(
                    "servicenow: unsupported grantType '{other}'"
                )));
            }
        };

        let credentials = Credentials {
            client_id: required("clientId")?,
            client_secret: required("clientSecret")?,
            username: text("username"),
            password: text("password"),
            grant_type,
            scope: text("scope"),
        };

        if grant_type == GrantType::Password
            && (credentials.username.is_none() || credentials.password.is_none())
        {
            return Err(ConnectorError::configuration(
                "servicenow: username and password are required for the password grant",
            ));
        }

        let client = ApiClient::new(
            context.http.clone(),
            context.tenant_id,
            CONNECTOR_TYPE,
            context.limiter.clone(),
            context.cancellation.clone(),
        );

        Ok(Self {
            metadata: Self::metadata_record(),
            instance_url,
            credentials,
            token: RwLock::new(None),
            client,
        })
    }

    fn url(&self, path: &str) -> Result<Url, ConnectorError> {
        self.instance_url
            .join(path)
            .map_err(|e| ConnectorError::configuration(e.to_string()))
    }

    async fn request_token(&self) -> Result<AccessToken, ConnectorError> {
        let url = self.url("/oauth_token.do")?;
        let credentials = &self.credentials;

        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
        ];
        match credentials.grant_type {
            GrantType::Password => {
                form.push(("grant_type", "password"));
                if let (Some(username), Some(password)) =
                    (&credentials.username, &credentials.password)
                {
                    form.push(("username", username));
                    form.push(("password", password));
                }
            }
            GrantType::ClientCredentials => form.push(("grant_type", "client_credentials")),
        }
        if let Some(scope) = &credentials.scope {
            form.push(("scope", scope));
        }

        let response = self
            .client
            .send(|http| http.post(url.clone()).form(&form))
            .await
            .map_err(|error| match error {
                ConnectorError::Http { status, body } if status == 400 => {
                    ConnectorError::Authentication {
                        details: format!("token request rejected: {body}"),
                    }
                }
                other => other,
            })?;

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ConnectorError::malformed(format!("token response: {e}")))?;

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(1800));
        info!(instance = %self.instance_url, "ServiceNow access token obtained");

        Ok(AccessToken {
            value: token.access_token,
            expires_at: Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN),
        })
    }

    async fn access_token(&self) -> Result<String, ConnectorError> {
        if let Some(token) = self.token.read().await.as_ref()
            && token.expires_at > Instant::now()
        {
            return Ok(token.value.clone());
        }

        let mut guard = self.token.write().await;
        if let Some(token) = guard.as_ref()
            && token.expires_at > Instant::now()
        {
            return Ok(token.value.clone());
        }

        let token = self.request_token().await?;
        let value = token.value.clone();
        *guard = Some(token);
        Ok(value)
    }

    async fn invalidate_token(&self) {
        *self.token.write().await = None;
    }

    /// Send an authorized request, refreshing the token once on 401.
    async fn authorized<F>(&self, build: F) -> Result<reqwest::Response, ConnectorError>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder + Send + Sync,
    {
        let mut refreshed = false;
        loop {
            let token = self.access_token().await?;
            let result = self
                .client
                .send(|http| build(http, &token).header("Accept", "application/json"))
                .await;

            match result {
                Err(ConnectorError::Authentication { .. }) if !refreshed => {
                    debug!("ServiceNow rejected token; refreshing once");
                    self.invalidate_token().await;
                    refreshed = true;
                }
                other => return other,
            }
        }
    }

    async fn authorized_json<F>(&self, build: F) -> Result<JsonValue, ConnectorError>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder + Send + Sync,
    {
        self.authorized(build)
            .await?
            .json()
            .await
            .map_err(|e| ConnectorError::malformed(e.to_string()))
    }

    fn record_query(options: &ExtractOptions) -> String {
        let mut clauses = Vec::new();
        if let Some(start) = options.start_date {
            clauses.push(format!(
                "sys_updated_on>={}",
                start.format("%Y-%m-%d %H:%M:%S")
            ));
        }
        if let Some(end) = options.end_date {
            clauses.push(format!("sys_updated_on<={}", end.format("%Y-%m-%d %H:%M:%S")));
        }
        // Stable order keeps offsets idempotent
        clauses.push("ORDERBYsys_created_on^ORDERBYsys_id".to_string());
        clauses.join("^")
    }

    async fn create_record(
        &self,
        table: &Table,
        index: usize,
        payload: &JsonValue,
    ) -> Result<Option<RecordError>, ConnectorError> {
        let url = self.url(&format!("/api/now/table/{}", table.name))?;
        let result = self
            .authorized(|http, token| http.post(url.clone()).bearer_auth(token).json(payload))
            .await;

        match result {
            Ok(_) => Ok(None),
            Err(error) if error.is_fatal() => Err(error),
            Err(ConnectorError::Http { body, status }) => Ok(Some(
                match serde_json::from_str::<ErrorEnvelope>(&body) {
                    Ok(envelope) => {
                        let error = RecordError::new(index, envelope.error.message);
                        match envelope.error.detail {
                            Some(detail) if !detail.is_empty() => {
                                error.with_field(detail_field(&detail), detail)
                            }
                            _ => error,
                        }
                    }
                    Err(_) => RecordError::new(index, format!("HTTP {status}: {body}")),
                },
            )),
            Err(error) => Ok(Some(RecordError::new(index, error.to_string()))),
        }
    }
}

/// Best guess at the field named in a Table API error detail.
fn detail_field(detail: &str) -> String {
    detail
        .split_whitespace()
        .find(|word| word.contains('_'))
        .map(|word| word.trim_matches(|c: char| !c.is_alphanumeric() && c != '_'))
        .unwrap_or("")
        .to_string()
}

#[async_trait]
impl Connector for ServiceNowConnector {
    fn metadata(&self) -> &ConnectorMetadata {
        &self.metadata
    }

    async fn test_connection(&self) -> Result<(), ConnectorError> {
        let mut url = self.url("/api/now/table/sys_user")?;
        url.query_pairs_mut().append_pair("sysparm_limit", "1");
        self.authorized_json(|http, token| http.get(url.clone()).bearer_auth(token))
            .await?;
        Ok(())
    }

    async fn authenticate(&self) -> Result<(), ConnectorError> {
        self.access_token().await.map(|_| ())
    }

    async fn extract(
        &self,
        entity_type: &str,
        options: &ExtractOptions,
    ) -> Result<ExtractPage, ConnectorError> {
        let table = table(entity_type)?;
        let limit = options.batch_size.clamp(1, MAX_PAGE_SIZE);
        let offset = match &options.cursor {
            None => 0,
            Some(Cursor::Offset(offset)) => *offset,
            Some(other) => {
                return Err(ConnectorError::configuration(format!(
                    "servicenow pages by offset, got cursor {other:?}"
                )));
            }
        };

        let mut url = self.url(&format!("/api/now/table/{}", table.name))?;
        url.query_pairs_mut()
            .append_pair("sysparm_limit", &limit.to_string())
            .append_pair("sysparm_offset", &offset.to_string())
            .append_pair("sysparm_query", &Self::record_query(options))
            .append_pair("sysparm_exclude_reference_link", "true");

        let response = self
            .authorized(|http, token| http.get(url.clone()).bearer_auth(token))
            .await?;
        let total_count = response
            .headers()
            .get("X-Total-Count")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        let body: JsonValue = response
            .json()
            .await
            .map_err(|e| ConnectorError::malformed(e.to_string()))?;

        let records = body
            .get("result")
            .and_then(JsonValue::as_array)
            .cloned()
            .ok_or_else(|| ConnectorError::malformed("missing 'result' array"))?;

        let has_more = records.len() as u32 == limit;
        let next = offset + records.len() as u64;

        debug!(entity_type, offset, records = records.len(), has_more, "ServiceNow page");

        Ok(ExtractPage {
            records,
            total_count,
            has_more,
            next_cursor: has_more.then_some(Cursor::Offset(next)),
        })
    }

    async fn fetch_detail(
        &self,
        entity_type: &str,
        record: &JsonValue,
    ) -> Result<JsonValue, ConnectorError> {
        let table = table(entity_type)?;
        let sys_id = canonical::record_id(record)
            .ok_or_else(|| ConnectorError::malformed("listed record has no sys_id"))?;

        let mut url = self.url(&format!("/api/now/table/{}/{}", table.name, sys_id))?;
        url.query_pairs_mut()
            .append_pair("sysparm_display_value", "all");

        let body = self
            .authorized_json(|http, token| http.get(url.clone()).bearer_auth(token))
            .await?;
        body.get("result")
            .cloned()
            .ok_or_else(|| ConnectorError::malformed("missing 'result'"))
    }

    fn transform_for_extraction(&self, entity_type: &str, records: &[JsonValue]) -> Vec<JsonValue> {
        let fields = table(entity_type)
            .map(|t| t.fields)
            .unwrap_or(summary("name", "active"));
        records
            .iter()
            .map(|record| canonical::to_canonical(CONNECTOR_TYPE, entity_type, &fields, record))
            .collect()
    }

    fn transform_for_load(&self, entity_type: &str, records: &[JsonValue]) -> Vec<JsonValue> {
        let title = table(entity_type)
            .map(|t| t.fields.title)
            .unwrap_or("name");
        records
            .iter()
            .map(|record| canonical::load_payload(record, READ_ONLY_FIELDS, title))
            .collect()
    }

    fn validate_for_load(&self, entity_type: &str, records: &[JsonValue]) -> Vec<RecordError> {
        let Ok(table) = table(entity_type) else {
            return Vec::new();
        };

        records
            .iter()
            .enumerate()
            .filter_map(|(index, record)| {
                let missing: Vec<&str> = table
                    .required
                    .iter()
                    .copied()
                    .filter(|field| !canonical::has_value(record, field))
                    .collect();
                if missing.is_empty() {
                    return None;
                }
                Some(missing.into_iter().fold(
                    RecordError::new(index, "Validation failed")
                        .with_record_id(canonical::record_id(record)),
                    |error, field| error.with_field(field, "is required"),
                ))
            })
            .collect()
    }

    async fn load_batch(
        &self,
        entity_type: &str,
        records: &[JsonValue],
    ) -> Result<LoadOutcome, ConnectorError> {
        let table = table(entity_type)?;
        let mut outcome = LoadOutcome::default();

        for (index, payload) in records.iter().enumerate() {
            match self.create_record(table, index, payload).await? {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_field_picks_column_name() {
        assert_eq!(
            detail_field("Mandatory field short_description is empty"),
            "short_description"
        );
        assert_eq!(detail_field("Operation failed"), "");
    }

    #[test]
    fn query_orders_by_stable_key() {
        let options = ExtractOptions {
            start_date: chrono::DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
                .ok()
                .map(|d| d.with_timezone(&chrono::Utc)),
            ..Default::default()
        };
        assert_eq!(
            ServiceNowConnector::record_query(&options),
            "sys_updated_on>=2026-01-02 03:04:05^ORDERBYsys_created_on^ORDERBYsys_id"
        );
    }
}
