//! Snowflake source read through the SQL REST API.
//!
//! Discovery lists `INFORMATION_SCHEMA` tables and columns of each configured
//! database, limited to tables altered since the cursor. Harvest reads
//! `ACCOUNT_USAGE.QUERY_HISTORY` since the cursor, tags every query with the
//! tables it references and advances the cursor to the latest query end time.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{
    cursor_json, Connector, ConnectorError, ConnectorResult, DiscoverResult, DiscoveredAsset,
    DiscoveredColumn, HarvestResult,
};
use crate::config::SnowflakeSourceConfig;
use crate::extract_table_refs;
use crate::models::utc_now;

const SYSTEM_KEY: &str = "snowflake";
const STUB_ASSET: &str = "db.schema.table";
const POLL_INTERVAL: Duration = Duration::from_secs(1);

// Timestamps are rendered in UTC by the queries below and parsed back with
// TIMESTAMP_FORMAT.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const BINDING_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

const CURRENT_DATABASE_SQL: &str = "SELECT CURRENT_DATABASE()";

const TABLES_SQL: &str = "\
SELECT table_catalog, table_schema, table_name, table_type, comment \
FROM INFORMATION_SCHEMA.TABLES \
WHERE table_schema <> 'INFORMATION_SCHEMA'";

const TABLES_SINCE_FILTER: &str =
    " AND CONVERT_TIMEZONE('UTC', last_altered)::TIMESTAMP_NTZ >= TO_TIMESTAMP_NTZ(?)";

const COLUMNS_SQL: &str = "\
SELECT table_catalog, table_schema, table_name, column_name, data_type, comment \
FROM INFORMATION_SCHEMA.COLUMNS \
WHERE table_schema <> 'INFORMATION_SCHEMA' \
ORDER BY table_schema, table_name, ordinal_position";

const QUERY_HISTORY_SINCE_SQL: &str = r#"SELECT QUERY_TEXT,
       TO_VARCHAR(CONVERT_TIMEZONE('UTC', START_TIME), 'YYYY-MM-DD"T"HH24:MI:SS.FF6'),
       TO_VARCHAR(CONVERT_TIMEZONE('UTC', END_TIME), 'YYYY-MM-DD"T"HH24:MI:SS.FF6')
FROM SNOWFLAKE.ACCOUNT_USAGE.QUERY_HISTORY
WHERE CONVERT_TIMEZONE('UTC', END_TIME)::TIMESTAMP_NTZ >= TO_TIMESTAMP_NTZ(?)
  AND QUERY_TEXT IS NOT NULL
ORDER BY END_TIME ASC
LIMIT 10000"#;

const QUERY_HISTORY_RECENT_SQL: &str = r#"SELECT QUERY_TEXT,
       TO_VARCHAR(CONVERT_TIMEZONE('UTC', START_TIME), 'YYYY-MM-DD"T"HH24:MI:SS.FF6'),
       TO_VARCHAR(CONVERT_TIMEZONE('UTC', END_TIME), 'YYYY-MM-DD"T"HH24:MI:SS.FF6')
FROM SNOWFLAKE.ACCOUNT_USAGE.QUERY_HISTORY
WHERE QUERY_TEXT IS NOT NULL
ORDER BY END_TIME DESC
LIMIT 10000"#;

/// Result rows as the SQL API returns them: every cell is text or null.
pub type Rows = Vec<Vec<Option<String>>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Binding {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

/// Request body of `POST /api/v2/statements`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statement {
    pub statement: String,
    pub timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warehouse: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub bindings: BTreeMap<String, Binding>,
}

impl Statement {
    /// Binds `ts` to the next `?` placeholder.
    fn bind_timestamp(mut self, ts: NaiveDateTime) -> Self {
        let position = (self.bindings.len() + 1).to_string();
        self.bindings.insert(
            position,
            Binding {
                kind: "TEXT".to_string(),
                value: ts.format(BINDING_FORMAT).to_string(),
            },
        );
        self
    }
}

/// Runs statements against an account.
pub trait SqlApi: Send + Sync {
    fn execute(&self, statement: &Statement) -> ConnectorResult<Rows>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    statement_handle: Option<String>,
    message: Option<String>,
    result_set_meta_data: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Rows,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    #[serde(default)]
    partition_info: Vec<serde_json::Value>,
}

/// Blocking SQL API client; must be driven from a blocking thread.
pub struct RestSqlApi {
    base_url: String,
    token: String,
    token_type: String,
    timeout: Duration,
}

impl RestSqlApi {
    /// `None` unless the source is enabled with an account and a token.
    pub fn from_config(config: &SnowflakeSourceConfig) -> Option<Self> {
        let present = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        if !config.enabled {
            return None;
        }
        let account = present(&config.account)?;
        let token = present(&config.token)?;
        let base_url = present(&config.endpoint)
            .unwrap_or_else(|| format!("https://{}.snowflakecomputing.com", account));
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            token_type: present(&config.token_type).unwrap_or_else(|| "OAUTH".to_string()),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(&self.token)
            .header("X-Snowflake-Authorization-Token-Type", &self.token_type)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    fn fetch(
        &self,
        client: &Client,
        handle: &str,
        partition: Option<usize>,
    ) -> ConnectorResult<Response> {
        let mut request = client.get(format!("{}/api/v2/statements/{}", self.base_url, handle));
        if let Some(partition) = partition {
            request = request.query(&[("partition", partition)]);
        }
        Ok(self.authorized(request).send()?)
    }
}

fn read_body(response: Response) -> ConnectorResult<StatementResponse> {
    let status = response.status();
    let body: StatementResponse = response.json()?;
    if status.is_success() {
        Ok(body)
    } else {
        Err(ConnectorError::Source(format!(
            "snowflake statement failed with {}: {}",
            status,
            body.message.unwrap_or_default()
        )))
    }
}

impl SqlApi for RestSqlApi {
    fn execute(&self, statement: &Statement) -> ConnectorResult<Rows> {
        let client = Client::builder()
            .timeout(self.timeout + POLL_INTERVAL)
            .build()?;
        let mut response = self
            .authorized(client.post(format!("{}/api/v2/statements", self.base_url)))
            .json(statement)
            .send()?;

        // 202 means the statement is still executing.
        let mut waited = Duration::ZERO;
        while response.status() == StatusCode::ACCEPTED {
            let pending = read_body(response)?;
            let handle = pending.statement_handle.ok_or_else(|| {
                ConnectorError::Source("statement accepted without a handle".to_string())
            })?;
            if waited >= self.timeout {
                return Err(ConnectorError::Source(format!(
                    "statement {} still running after {:?}",
                    handle, waited
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
            waited += POLL_INTERVAL;
            response = self.fetch(&client, &handle, None)?;
        }

        let first = read_body(response)?;
        let mut rows = first.data;
        let partitions = first
            .result_set_meta_data
            .map(|m| m.partition_info.len())
            .unwrap_or(0);
        if partitions > 1 {
            let handle = first.statement_handle.ok_or_else(|| {
                ConnectorError::Source("partitioned result without a handle".to_string())
            })?;
            for partition in 1..partitions {
                rows.extend(read_body(self.fetch(&client, &handle, Some(partition))?)?.data);
            }
        }
        Ok(rows)
    }
}

/// Cloud warehouse source.
///
/// Without an enabled account and token every call returns the stub listing.
pub struct SnowflakeConnector {
    config: SnowflakeSourceConfig,
    api: Option<Arc<dyn SqlApi>>,
}

impl SnowflakeConnector {
    pub fn new(config: SnowflakeSourceConfig) -> Self {
        let api = RestSqlApi::from_config(&config).map(|api| Arc::new(api) as Arc<dyn SqlApi>);
        Self { config, api }
    }

    pub fn with_api(config: SnowflakeSourceConfig, api: Arc<dyn SqlApi>) -> Self {
        Self {
            config,
            api: Some(api),
        }
    }

    fn statement(&self, sql: &str, database: Option<&str>) -> Statement {
        Statement {
            statement: sql.to_string(),
            timeout: self.config.timeout_secs,
            database: database.map(str::to_string),
            warehouse: self.config.warehouse.clone(),
            role: self.config.role.clone(),
            bindings: BTreeMap::new(),
        }
    }

    fn databases(&self, api: &dyn SqlApi) -> ConnectorResult<Vec<String>> {
        if !self.config.databases.is_empty() {
            return Ok(self.config.databases.clone());
        }
        let rows = api.execute(&self.statement(CURRENT_DATABASE_SQL, None))?;
        let current = rows.into_iter().next().and_then(|row| cell(&row, 0));
        if current.is_none() {
            warn!("snowflake discover: no databases configured and no current database");
        }
        Ok(current.into_iter().collect())
    }

    fn stub_discover() -> DiscoverResult {
        DiscoverResult {
            assets: vec![DiscoveredAsset {
                system: Some(SYSTEM_KEY.to_string()),
                name: STUB_ASSET.to_string(),
                description: None,
                kind: None,
            }],
            columns: vec![DiscoveredColumn {
                asset: STUB_ASSET.to_string(),
                name: "id".to_string(),
                data_type: Some("NUMBER".to_string()),
                description: None,
            }],
        }
    }

    fn stub_harvest(since: Option<NaiveDateTime>) -> HarvestResult {
        HarvestResult {
            payload: json!({
                "type": SYSTEM_KEY,
                "since": cursor_json(since),
                "items": [{"asset": STUB_ASSET, "row_count": 1000}],
            }),
            advanced_cursor: None,
        }
    }
}

fn cell(row: &[Option<String>], index: usize) -> Option<String> {
    row.get(index).cloned().flatten()
}

fn qualified(row: &[Option<String>]) -> Option<String> {
    Some(format!("{}.{}.{}", cell(row, 0)?, cell(row, 1)?, cell(row, 2)?))
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT).ok()
}

impl Connector for SnowflakeConnector {
    fn key(&self) -> &str {
        SYSTEM_KEY
    }

    fn discover(&self, cursor: Option<NaiveDateTime>) -> ConnectorResult<DiscoverResult> {
        let Some(api) = self.api.as_deref() else {
            debug!("snowflake discover: source not configured, using stub metadata");
            return Ok(Self::stub_discover());
        };

        let mut result = DiscoverResult::default();
        for db in self.databases(api)? {
            let tables = match cursor {
                Some(since) => {
                    let sql = format!("{}{}", TABLES_SQL, TABLES_SINCE_FILTER);
                    api.execute(&self.statement(&sql, Some(&db)).bind_timestamp(since))?
                }
                None => api.execute(&self.statement(TABLES_SQL, Some(&db)))?,
            };
            let mut listed = HashSet::new();
            for row in &tables {
                let Some(name) = qualified(row) else {
                    continue;
                };
                listed.insert(name.clone());
                result.assets.push(DiscoveredAsset {
                    system: Some(SYSTEM_KEY.to_string()),
                    name,
                    description: cell(row, 4),
                    kind: cell(row, 3),
                });
            }

            let columns = api.execute(&self.statement(COLUMNS_SQL, Some(&db)))?;
            for row in &columns {
                let (Some(asset), Some(name)) = (qualified(row), cell(row, 3)) else {
                    continue;
                };
                // Unchanged tables keep their catalogued columns.
                if !listed.contains(&asset) {
                    continue;
                }
                result.columns.push(DiscoveredColumn {
                    asset,
                    name,
                    data_type: cell(row, 4),
                    description: cell(row, 5),
                });
            }
            debug!(
                "snowflake discover {}: {} tables, {} columns so far",
                db,
                result.assets.len(),
                result.columns.len()
            );
        }
        Ok(result)
    }

    fn harvest(&self, since: Option<NaiveDateTime>) -> ConnectorResult<HarvestResult> {
        let Some(api) = self.api.as_deref() else {
            debug!("snowflake harvest: source not configured, using stub metadata");
            return Ok(Self::stub_harvest(since));
        };

        let harvested_at = utc_now();
        let rows = match since {
            Some(since) => api.execute(
                &self
                    .statement(QUERY_HISTORY_SINCE_SQL, None)
                    .bind_timestamp(since),
            )?,
            None => api.execute(&self.statement(QUERY_HISTORY_RECENT_SQL, None))?,
        };

        let mut latest_end: Option<NaiveDateTime> = None;
        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(text) = cell(row, 0) else {
                continue;
            };
            let end_time = cell(row, 2);
            latest_end = latest_end.max(end_time.as_deref().and_then(parse_timestamp));

            let refs = extract_table_refs(&text);
            let tables: BTreeSet<String> = refs.sources.into_iter().chain(refs.targets).collect();
            items.push(json!({
                "query_text": text,
                "start_time": cell(row, 1),
                "end_time": end_time,
                "tables": tables,
            }));
        }
        info!(
            "snowflake harvest: {} queries since {:?}, latest end {:?}",
            items.len(),
            since,
            latest_end
        );

        Ok(HarvestResult {
            payload: json!({
                "type": SYSTEM_KEY,
                "harvested_at": cursor_json(Some(harvested_at)),
                "since": cursor_json(since),
                "items": items,
            }),
            advanced_cursor: latest_end,
        })
    }
}
