use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::{BigInt, Nullable, Text};
use serde_json::json;
use tracing::{debug, warn};

use super::{
    cursor_json, Connector, ConnectorResult, DiscoverResult, DiscoveredAsset, DiscoveredColumn,
    HarvestResult,
};
use crate::models::utc_now;

const SYSTEM_KEY: &str = "postgres";
const STUB_ASSET: &str = "public.table";

#[derive(QueryableByName, Debug)]
struct TableRow {
    #[diesel(sql_type = Text)]
    table_schema: String,
    #[diesel(sql_type = Text)]
    table_name: String,
    #[diesel(sql_type = Nullable<Text>)]
    table_type: Option<String>,
}

#[derive(QueryableByName, Debug)]
struct ColumnRow {
    #[diesel(sql_type = Text)]
    table_schema: String,
    #[diesel(sql_type = Text)]
    table_name: String,
    #[diesel(sql_type = Text)]
    column_name: String,
    #[diesel(sql_type = Nullable<Text>)]
    data_type: Option<String>,
}

#[derive(QueryableByName, Debug)]
struct RowCountRow {
    #[diesel(sql_type = Text)]
    schemaname: String,
    #[diesel(sql_type = Text)]
    relname: String,
    #[diesel(sql_type = Nullable<BigInt>)]
    n_live_tup: Option<i64>,
}

const TABLES_SQL: &str = "\
SELECT table_schema::text AS table_schema, table_name::text AS table_name, \
       table_type::text AS table_type \
FROM information_schema.tables \
WHERE table_schema NOT IN ('pg_catalog', 'information_schema') \
ORDER BY table_schema, table_name";

const COLUMNS_SQL: &str = "\
SELECT table_schema::text AS table_schema, table_name::text AS table_name, \
       column_name::text AS column_name, data_type::text AS data_type \
FROM information_schema.columns \
WHERE table_schema NOT IN ('pg_catalog', 'information_schema') \
ORDER BY table_schema, table_name, ordinal_position";

const ROW_COUNTS_SQL: &str = "\
SELECT schemaname::text AS schemaname, relname::text AS relname, \
       n_live_tup::bigint AS n_live_tup \
FROM pg_stat_user_tables \
ORDER BY schemaname, relname";

/// Relational database source read through `information_schema`.
pub struct PostgresConnector {
    url: Option<String>,
}

impl PostgresConnector {
    pub fn new(url: Option<String>) -> Self {
        Self { url }
    }

    fn connect(&self) -> Option<PgConnection> {
        let url = match self.url.as_deref() {
            Some(url) if !url.trim().is_empty() => url,
            _ => {
                debug!("postgres source not configured, using stub metadata");
                return None;
            }
        };
        match PgConnection::establish(url) {
            Ok(conn) => Some(conn),
            Err(e) => {
                warn!("postgres source unreachable, using stub metadata: {}", e);
                None
            }
        }
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
                data_type: Some("INTEGER".to_string()),
                description: None,
            }],
        }
    }

    fn stub_harvest(since: Option<NaiveDateTime>) -> HarvestResult {
        HarvestResult {
            payload: json!({
                "type": SYSTEM_KEY,
                "since": cursor_json(since),
                "items": [{"asset": STUB_ASSET, "row_count": 123}],
            }),
            advanced_cursor: None,
        }
    }
}

impl Connector for PostgresConnector {
    fn key(&self) -> &str {
        SYSTEM_KEY
    }

    fn discover(&self, _cursor: Option<NaiveDateTime>) -> ConnectorResult<DiscoverResult> {
        let Some(mut conn) = self.connect() else {
            return Ok(Self::stub_discover());
        };

        let tables = sql_query(TABLES_SQL).load::<TableRow>(&mut conn)?;
        let columns = sql_query(COLUMNS_SQL).load::<ColumnRow>(&mut conn)?;
        debug!(
            "postgres discover: {} tables, {} columns",
            tables.len(),
            columns.len()
        );

        Ok(DiscoverResult {
            assets: tables
                .into_iter()
                .map(|t| DiscoveredAsset {
                    system: Some(SYSTEM_KEY.to_string()),
                    name: format!("{}.{}", t.table_schema, t.table_name),
                    description: None,
                    kind: t.table_type,
                })
                .collect(),
            columns: columns
                .into_iter()
                .map(|c| DiscoveredColumn {
                    asset: format!("{}.{}", c.table_schema, c.table_name),
                    name: c.column_name,
                    data_type: c.data_type,
                    description: None,
                })
                .collect(),
        })
    }

    fn harvest(&self, since: Option<NaiveDateTime>) -> ConnectorResult<HarvestResult> {
        let Some(mut conn) = self.connect() else {
            return Ok(Self::stub_harvest(since));
        };

        let harvested_at = utc_now();
        let items: Vec<serde_json::Value> = sql_query(ROW_COUNTS_SQL)
            .load::<RowCountRow>(&mut conn)?
            .into_iter()
            .map(|r| {
                json!({
                    "asset": format!("{}.{}", r.schemaname, r.relname),
                    "row_count": r.n_live_tup.unwrap_or(0),
                })
            })
            .collect();

        Ok(HarvestResult {
            payload: json!({
                "type": SYSTEM_KEY,
                "harvested_at": cursor_json(Some(harvested_at)),
                "since": cursor_json(since),
                "items": items,
            }),
            advanced_cursor: Some(harvested_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_unconfigured_source_returns_stub() {
        let connector = PostgresConnector::new(None);
        let discovered = connector.discover(None).unwrap();
        assert_eq!(discovered.assets.len(), 1);
        assert_eq!(discovered.assets[0].name, "public.table");
        assert_eq!(discovered.assets[0].system.as_deref(), Some("postgres"));
        assert_eq!(discovered.columns[0].data_type.as_deref(), Some("INTEGER"));

        let harvested = connector.harvest(None).unwrap();
        assert_eq!(harvested.payload["items"][0]["row_count"], json!(123));
        assert_eq!(harvested.payload["since"], serde_json::Value::Null);
        assert!(harvested.advanced_cursor.is_none());
    }

    #[test]
    fn test_stub_is_deterministic_for_cursor() {
        let connector = PostgresConnector::new(Some("   ".to_string()));
        let since = Some(utc_now());
        assert_eq!(
            connector.harvest(since).unwrap(),
            connector.harvest(since).unwrap()
        );
    }
}
