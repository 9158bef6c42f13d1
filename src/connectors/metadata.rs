//! Connector metadata types
//!
//! Describes a connector type: how it authenticates, the configuration fields
//! an operator must supply, the entity types it can extract or load, and its
//! batching limits. Served as-is by `GET /connector-types`.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;

/// Authentication scheme used by a connector type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// OAuth 2.0 token endpoint (client credentials or password grant)
    #[serde(rename = "oauth2")]
    OAuth2,
    /// API key sent as the basic-auth user name
    ApiKey,
    /// Basic authentication (username/password)
    Basic,
}

/// One field of a connector configuration schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigField {
    pub name: String,
    pub label: String,
    pub required: bool,
    /// Encrypted at rest and masked in API responses
    pub sensitive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ConfigField {
    pub fn required(name: &str, label: &str) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            required: true,
            sensitive: false,
            description: None,
        }
    }

    pub fn optional(name: &str, label: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, label)
        }
    }

    pub fn secret(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
}

/// Capabilities of one entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EntityTypeInfo {
    pub name: String,
    /// The list endpoint omits fields only a per-record call returns
    pub supports_detail: bool,
    pub supports_load: bool,
}

impl EntityTypeInfo {
    pub fn new(name: &str, supports_detail: bool, supports_load: bool) -> Self {
        Self {
            name: name.to_string(),
            supports_detail,
            supports_load,
        }
    }
}

/// Metadata about a connector type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorMetadata {
    /// Registry key, e.g. `freshservice`
    pub connector_type: String,
    pub display_name: String,
    pub auth_type: AuthType,
    pub config_fields: Vec<ConfigField>,
    pub entity_types: Vec<EntityTypeInfo>,
    /// Largest page the list endpoint returns
    pub max_page_size: u32,
    /// Upper bound for concurrent detail fetches
    pub max_detail_batch_size: usize,
    /// Records sent per load call
    pub max_load_batch_size: usize,
}

impl ConnectorMetadata {
    /// Names of configuration fields that hold secrets
    pub fn secret_fields(&self) -> Vec<&str> {
        self.config_fields
            .iter()
            .filter(|field| field.sensitive)
            .map(|field| field.name.as_str())
            .collect()
    }

    pub fn entity(&self, name: &str) -> Option<&EntityTypeInfo> {
        self.entity_types.iter().find(|entity| entity.name == name)
    }

    pub fn supports_entity(&self, name: &str) -> bool {
        self.entity(name).is_some()
    }

    /// Required fields missing (or blank) in `config`
    pub fn missing_required(&self, config: &JsonValue) -> Vec<String> {
        self.config_fields
            .iter()
            .filter(|field| field.required)
            .filter(|field| match config.get(&field.name) {
                Some(JsonValue::String(value)) => value.trim().is_empty(),
                Some(JsonValue::Null) | None => true,
                Some(_) => false,
            })
            .map(|field| field.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata() -> ConnectorMetadata {
        ConnectorMetadata {
            connector_type: "acme".to_string(),
            display_name: "Acme Desk".to_string(),
            auth_type: AuthType::ApiKey,
            config_fields: vec![
                ConfigField::required("domain", "Domain"),
                ConfigField::required("apiKey", "API key").secret(),
                ConfigField::optional("baseUrl", "Base URL"),
            ],
            entity_types: vec![EntityTypeInfo::new("tickets", true, true)],
            max_page_size: 100,
            max_detail_batch_size: 20,
            max_load_batch_size: 50,
        }
    }

    #[test]
    fn secret_fields_lists_sensitive_fields_only() {
        assert_eq!(metadata().secret_fields(), vec!["apiKey"]);
    }

    #[test]
    fn missing_required_treats_blank_as_missing() {
        let missing = metadata().missing_required(&json!({"domain": "  ", "baseUrl": "x"}));
        assert_eq!(missing, vec!["domain".to_string(), "apiKey".to_string()]);
        assert!(metadata()
            .missing_required(&json!({"domain": "acme", "apiKey": "k"}))
            .is_empty());
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(metadata()).unwrap();
        assert_eq!(json["connectorType"], "acme");
        assert_eq!(json["authType"], "api_key");
        assert_eq!(json["entityTypes"][0]["supportsDetail"], true);
        assert_eq!(json["configFields"][1]["sensitive"], true);
    }
}
