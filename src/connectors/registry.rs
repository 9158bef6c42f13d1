//! Connector registry
//!
//! Maps connector-type strings to a metadata record and a factory that builds
//! a connector instance for one job. Built-in platforms form the closed
//! [`ConnectorKind`] set; tests may register extra factories.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::cancellation::JobCancellation;
use crate::connectors::freshservice::FreshserviceConnector;
use crate::connectors::servicenow::ServiceNowConnector;
use crate::connectors::{Connector, ConnectorError, ConnectorMetadata};
use crate::rate_limit::RateLimiter;

/// Error type for registry operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("Connector type '{name}' not found")]
    ConnectorTypeNotFound { name: String },
    #[error("Connector could not be built: {0}")]
    Build(#[from] ConnectorError),
}

/// Everything a connector instance needs for one job.
#[derive(Clone)]
pub struct ConnectorContext {
    pub tenant_id: Uuid,
    pub connector_id: Uuid,
    /// Decrypted connector configuration
    pub config: JsonValue,
    pub limiter: Arc<RateLimiter>,
    /// Present while running a job; absent for connection tests
    pub cancellation: Option<JobCancellation>,
    pub http: reqwest::Client,
}

/// Built-in connector types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorKind {
    Freshservice,
    ServiceNow,
}

impl ConnectorKind {
    pub const ALL: [ConnectorKind; 2] = [ConnectorKind::Freshservice, ConnectorKind::ServiceNow];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorKind::Freshservice => "freshservice",
            ConnectorKind::ServiceNow => "servicenow",
        }
    }

    pub fn metadata(&self) -> ConnectorMetadata {
        match self {
            ConnectorKind::Freshservice => FreshserviceConnector::metadata_record(),
            ConnectorKind::ServiceNow => ServiceNowConnector::metadata_record(),
        }
    }

    pub fn build(&self, context: ConnectorContext) -> Result<Arc<dyn Connector>, ConnectorError> {
        Ok(match self {
            ConnectorKind::Freshservice => Arc::new(FreshserviceConnector::new(context)?),
            ConnectorKind::ServiceNow => Arc::new(ServiceNowConnector::new(context)?),
        })
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectorKind {
    type Err = RegistryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| RegistryError::ConnectorTypeNotFound {
                name: value.to_string(),
            })
    }
}

pub type ConnectorFactory =
    Arc<dyn Fn(ConnectorContext) -> Result<Arc<dyn Connector>, ConnectorError> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    metadata: ConnectorMetadata,
    factory: ConnectorFactory,
}

/// Registry of connector types
#[derive(Clone, Default)]
pub struct Registry {
    entries: BTreeMap<String, Registration>,
}

impl Registry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in connector type
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for kind in ConnectorKind::ALL {
            registry.register(kind.metadata(), Arc::new(move |context| kind.build(context)));
        }
        registry
    }

    /// Register (or replace) a connector type
    pub fn register(&mut self, metadata: ConnectorMetadata, factory: ConnectorFactory) {
        self.entries.insert(
            metadata.connector_type.clone(),
            Registration { metadata, factory },
        );
    }

    pub fn contains(&self, connector_type: &str) -> bool {
        self.entries.contains_key(connector_type)
    }

    /// Get metadata for a specific connector type
    pub fn get_metadata(&self, connector_type: &str) -> Result<&ConnectorMetadata, RegistryError> {
        self.entries
            .get(connector_type)
            .map(|entry| &entry.metadata)
            .ok_or_else(|| RegistryError::ConnectorTypeNotFound {
                name: connector_type.to_string(),
            })
    }

    /// Metadata for all connector types, sorted by type
    pub fn list_metadata(&self) -> Vec<ConnectorMetadata> {
        self.entries
            .values()
            .map(|entry| entry.metadata.clone())
            .collect()
    }

    /// Build a connector instance of `connector_type`
    pub fn build(
        &self,
        connector_type: &str,
        context: ConnectorContext,
    ) -> Result<Arc<dyn Connector>, RegistryError> {
        let entry =
            self.entries
                .get(connector_type)
                .ok_or_else(|| RegistryError::ConnectorTypeNotFound {
                    name: connector_type.to_string(),
                })?;
        Ok((entry.factory)(context)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::kv::MemoryKvStore;
    use serde_json::json;

    fn context(config: JsonValue) -> ConnectorContext {
        ConnectorContext {
            tenant_id: Uuid::new_v4(),
            connector_id: Uuid::new_v4(),
            config,
            limiter: Arc::new(RateLimiter::new(
                Arc::new(MemoryKvStore::new(8)),
                RateLimitConfig::default(),
            )),
            cancellation: None,
            http: reqwest::Client::new(),
        }
    }

    #[test]
    fn builtin_types_are_listed_in_order() {
        let registry = Registry::with_builtin();
        let types: Vec<_> = registry
            .list_metadata()
            .into_iter()
            .map(|m| m.connector_type)
            .collect();
        assert_eq!(types, vec!["freshservice", "servicenow"]);
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in ConnectorKind::ALL {
            assert_eq!(kind.as_str().parse::<ConnectorKind>().unwrap(), kind);
        }
        assert!("jira".parse::<ConnectorKind>().is_err());
    }

    #[test]
    fn unknown_type_is_not_found() {
        let registry = Registry::with_builtin();
        assert!(matches!(
            registry.build("jira", context(json!({}))),
            Err(RegistryError::ConnectorTypeNotFound { .. })
        ));
    }

    #[test]
    fn builds_configured_connector() {
        let registry = Registry::with_builtin();
        let connector = registry
            .build(
                "freshservice",
                context(json!({"domain": "acme", "apiKey": "k"})),
            )
            .unwrap();
        assert_eq!(connector.metadata().connector_type, "freshservice");
    }

    #[test]
    fn missing_configuration_fails_build() {
        let registry = Registry::with_builtin();
        assert!(matches!(
            registry.build("servicenow", context(json!({}))),
            Err(RegistryError::Build(ConnectorError::Configuration { .. }))
        ));
    }
}
