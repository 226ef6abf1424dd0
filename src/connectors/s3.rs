use chrono::NaiveDateTime;
use serde_json::json;

use super::{cursor_json, Connector, ConnectorResult, DiscoverResult, DiscoveredAsset, HarvestResult};

const SYSTEM_KEY: &str = "s3";

/// Object store prefix listed as a single asset.
pub struct S3Connector {
    location: String,
}

impl S3Connector {
    pub fn new(bucket: &str, prefix: &str) -> Self {
        Self {
            location: format!("s3://{}/{}", bucket, prefix.trim_start_matches('/')),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }
}

impl Connector for S3Connector {
    fn key(&self) -> &str {
        SYSTEM_KEY
    }

    fn discover(&self, _cursor: Option<NaiveDateTime>) -> ConnectorResult<DiscoverResult> {
        Ok(DiscoverResult {
            assets: vec![DiscoveredAsset {
                system: Some(SYSTEM_KEY.to_string()),
                name: self.location.clone(),
                description: None,
                kind: None,
            }],
            columns: Vec::new(),
        })
    }

    fn harvest(&self, since: Option<NaiveDateTime>) -> ConnectorResult<HarvestResult> {
        Ok(HarvestResult {
            payload: json!({
                "type": SYSTEM_KEY,
                "since": cursor_json(since),
                "items": [{"asset": self.location, "objects": 3}],
            }),
            advanced_cursor: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_location() {
        assert_eq!(S3Connector::new("bucket", "prefix/").location(), "s3://bucket/prefix/");
        assert_eq!(S3Connector::new("lake", "/events/").location(), "s3://lake/events/");
    }

    #[test]
    fn test_listing_has_no_columns() {
        let connector = S3Connector::new("bucket", "prefix/");
        let discovered = connector.discover(None).unwrap();
        assert_eq!(discovered.assets.len(), 1);
        assert!(discovered.columns.is_empty());
        let harvested = connector.harvest(None).unwrap();
        assert_eq!(harvested.payload["items"][0]["objects"], json!(3));
    }
}
