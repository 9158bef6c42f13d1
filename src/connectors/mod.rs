//! Connectors module
//!
//! This module provides the connector contract and its pieces:
//! - The `Connector` trait every platform implements
//! - Connector metadata and the registry keyed by connector type
//! - The rate-limited HTTP client, paging driver and detail fetcher
//! - The built-in platform implementations

pub mod canonical;
pub mod detail;
pub mod freshservice;
pub mod http;
pub mod metadata;
pub mod pagination;
pub mod registry;
pub mod servicenow;
pub mod trait_;

pub use freshservice::FreshserviceConnector;
pub use http::ApiClient;
pub use metadata::{AuthType, ConfigField, ConnectorMetadata, EntityTypeInfo};
pub use registry::{ConnectorContext, ConnectorKind, Registry, RegistryError};
pub use servicenow::ServiceNowConnector;
pub use trait_::{
    Connector, ConnectorError, Cursor, ExtractOptions, ExtractPage, ExtractionControl,
    ExtractionProgress, ExtractionStage, FieldError, LoadOutcome, RecordError, Unattended,
};
