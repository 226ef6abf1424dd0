use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema::{asset, asset_column, lineage_edge, scan_artifact, scan_job, system};

/// Current UTC wall clock as stored in `Timestamp` columns.
pub fn utc_now() -> NaiveDateTime {
    chrono::Utc::now().naive_utc()
}

/// Rows hidden by a delete timestamp instead of being removed.
pub trait Tombstoned {
    fn deleted_at(&self) -> Option<NaiveDateTime>;

    fn is_live(&self) -> bool {
        self.deleted_at().is_none()
    }
}

#[derive(Queryable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = system)]
pub struct System {
    pub id: i32,
    pub name: String,
    pub description: Option<String>,
    pub visibility: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = system)]
pub struct NewSystem {
    pub name: String,
    pub description: Option<String>,
    pub visibility: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Queryable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = asset)]
pub struct Asset {
    pub id: i32,
    pub system_id: i32,
    pub name: String,
    pub description: Option<String>,
    pub column_names: Option<String>,
    pub visibility: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
}

impl Asset {
    /// Final dotted segment of the asset name, used for fallback matching.
    pub fn tail_name(&self) -> &str {
        tail_segment(&self.name)
    }
}

/// Last segment of a dotted identifier (`db.schema.t` -> `t`).
pub fn tail_segment(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = asset)]
pub struct NewAsset {
    pub system_id: i32,
    pub name: String,
    pub description: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Queryable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = asset_column)]
pub struct CatalogColumn {
    pub id: i32,
    pub asset_id: i32,
    pub name: String,
    pub data_type: Option<String>,
    pub description: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = asset_column)]
pub struct NewCatalogColumn {
    pub asset_id: i32,
    pub name: String,
    pub data_type: Option<String>,
    pub description: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Queryable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = lineage_edge)]
pub struct LineageEdge {
    pub id: i32,
    pub src_asset_id: i32,
    pub src_column: Option<String>,
    pub dst_asset_id: i32,
    pub dst_column: Option<String>,
    pub confidence: i32,
    pub predicate: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = lineage_edge)]
pub struct NewLineageEdge {
    pub src_asset_id: i32,
    pub src_column: Option<String>,
    pub dst_asset_id: i32,
    pub dst_column: Option<String>,
    pub confidence: i32,
    pub predicate: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Lifecycle of a scan job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether a dispatch may move a job from `self` to `next`.
    ///
    /// Jobs reused through an idempotency key are dispatched again, possibly
    /// while an earlier dispatch still runs, so any state may re-enter
    /// `Running` and a finished job may be finished again. Nothing returns to
    /// `Pending`, and a pending job cannot finish without running.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match next {
            JobStatus::Pending => false,
            JobStatus::Running => true,
            JobStatus::Success | JobStatus::Failed => *self != JobStatus::Pending,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown scan job status: {other}")),
        }
    }
}

impl TryFrom<String> for JobStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<JobStatus> for String {
    fn from(status: JobStatus) -> Self {
        status.as_str().to_string()
    }
}

#[derive(Queryable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = scan_job)]
pub struct ScanJob {
    pub id: i32,
    pub source: String,
    pub idempotency_key: Option<String>,
    #[diesel(deserialize_as = String)]
    pub status: JobStatus,
    pub attempts: i32,
    pub last_seen_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = scan_job)]
pub struct NewScanJob {
    pub source: String,
    pub idempotency_key: Option<String>,
    #[diesel(serialize_as = String)]
    pub status: JobStatus,
    pub attempts: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Queryable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = scan_artifact)]
pub struct ScanArtifact {
    pub id: i32,
    pub source: String,
    pub payload: serde_json::Value,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = scan_artifact)]
pub struct NewScanArtifact {
    pub source: String,
    pub payload: serde_json::Value,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Tombstoned for System {
    fn deleted_at(&self) -> Option<NaiveDateTime> {
        self.deleted_at
    }
}

impl Tombstoned for Asset {
    fn deleted_at(&self) -> Option<NaiveDateTime> {
        self.deleted_at
    }
}

impl Tombstoned for CatalogColumn {
    fn deleted_at(&self) -> Option<NaiveDateTime> {
        self.deleted_at
    }
}

impl Tombstoned for LineageEdge {
    fn deleted_at(&self) -> Option<NaiveDateTime> {
        self.deleted_at
    }
}
