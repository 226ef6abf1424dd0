//! Source connectors.
//!
//! A connector reads one kind of external source and produces catalog
//! metadata (`discover`) plus a raw harvest document (`harvest`). Connectors
//! know nothing about the catalog itself. When a source is not configured a
//! connector returns deterministic stub data instead of failing; postgres
//! also falls back when it cannot connect.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::config::ConnectorsConfig;

pub mod postgres;
pub mod s3;
pub mod snowflake;

pub use postgres::PostgresConnector;
pub use s3::S3Connector;
pub use snowflake::SnowflakeConnector;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredAsset {
    /// Key of the owning system; may be omitted when another entry names it.
    pub system: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredColumn {
    pub asset: String,
    pub name: String,
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoverResult {
    pub assets: Vec<DiscoveredAsset>,
    pub columns: Vec<DiscoveredColumn>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarvestResult {
    pub payload: serde_json::Value,
    /// High-water mark reached by this harvest, if the source reports one.
    pub advanced_cursor: Option<NaiveDateTime>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("source query failed: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("source request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("source error: {0}")]
    Source(String),
}

pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Capability shared by every source type.
pub trait Connector: Send + Sync {
    /// Registry key, e.g. `postgres`.
    fn key(&self) -> &str;

    fn discover(&self, cursor: Option<NaiveDateTime>) -> ConnectorResult<DiscoverResult>;

    fn harvest(&self, since: Option<NaiveDateTime>) -> ConnectorResult<HarvestResult>;
}

/// Connectors by lower-cased source key, built once at startup.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ConnectorsConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PostgresConnector::new(
            config.postgres.url.clone(),
        )));
        registry.register(Arc::new(SnowflakeConnector::new(config.snowflake.clone())));
        registry.register(Arc::new(S3Connector::new(
            &config.s3.bucket,
            &config.s3.prefix,
        )));
        registry
    }

    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors
            .insert(connector.key().to_lowercase(), connector);
    }

    pub fn get(&self, source: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(&source.to_lowercase()).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.connectors.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Cursor rendering used in harvest payloads.
pub(crate) fn cursor_json(cursor: Option<NaiveDateTime>) -> serde_json::Value {
    match cursor {
        Some(ts) => serde_json::Value::String(format!("{}Z", ts.format("%Y-%m-%dT%H:%M:%S%.f"))),
        None => serde_json::Value::Null,
    }
}
