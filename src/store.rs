//! Catalog persistence seam.
//!
//! Every component talks to the catalog through [`CatalogConn`], a set of
//! blocking row-level queries and commands, and groups them into one unit of
//! work with [`CatalogStore::transaction`]. The PostgreSQL implementation lives
//! in [`crate::db`]; [`MemoryStore`] backs single-process deployments and tests.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::NaiveDateTime;

use crate::models::{
    Asset, CatalogColumn, JobStatus, LineageEdge, NewAsset, NewCatalogColumn, NewLineageEdge,
    NewScanArtifact, NewScanJob, NewSystem, ScanArtifact, ScanJob, System, Tombstoned,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("scan job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i32,
        from: JobStatus,
        to: JobStatus,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Row-level operations over the catalog tables.
///
/// `find_*` lookups consider tombstoned rows as well (preferring a live one) so
/// callers can revive instead of duplicating. `live_*` queries never return
/// tombstoned rows.
pub trait CatalogConn {
    fn find_system(&mut self, name: &str) -> StoreResult<Option<System>>;
    fn insert_system(&mut self, new: NewSystem) -> StoreResult<System>;
    fn revive_system(&mut self, id: i32, now: NaiveDateTime) -> StoreResult<()>;

    fn find_asset(&mut self, system_id: i32, name: &str) -> StoreResult<Option<Asset>>;
    fn insert_asset(&mut self, new: NewAsset) -> StoreResult<Asset>;
    fn revive_asset(&mut self, id: i32, now: NaiveDateTime) -> StoreResult<()>;
    fn update_asset_description(
        &mut self,
        id: i32,
        description: &str,
        now: NaiveDateTime,
    ) -> StoreResult<()>;
    fn set_column_names(
        &mut self,
        asset_id: i32,
        column_names: Option<&str>,
        now: NaiveDateTime,
    ) -> StoreResult<()>;
    /// All live assets, newest first.
    fn live_assets(&mut self) -> StoreResult<Vec<Asset>>;

    fn find_column(&mut self, asset_id: i32, name: &str) -> StoreResult<Option<CatalogColumn>>;
    fn insert_column(&mut self, new: NewCatalogColumn) -> StoreResult<CatalogColumn>;
    fn revive_column(&mut self, id: i32, now: NaiveDateTime) -> StoreResult<()>;
    /// Overwrites data type / description only where a value is given.
    fn merge_column_metadata(
        &mut self,
        id: i32,
        data_type: Option<&str>,
        description: Option<&str>,
        now: NaiveDateTime,
    ) -> StoreResult<()>;
    fn live_column_names(&mut self, asset_id: i32) -> StoreResult<Vec<String>>;

    fn insert_artifact(&mut self, new: NewScanArtifact) -> StoreResult<ScanArtifact>;

    /// All live edges in insertion order.
    fn live_edges(&mut self) -> StoreResult<Vec<LineageEdge>>;
    fn live_edge_exists(&mut self, src_asset_id: i32, dst_asset_id: i32) -> StoreResult<bool>;
    fn insert_edge(&mut self, new: NewLineageEdge) -> StoreResult<LineageEdge>;

    /// Newest job with the given source and idempotency key.
    fn find_job_by_key(&mut self, source: &str, key: &str) -> StoreResult<Option<ScanJob>>;
    fn insert_job(&mut self, new: NewScanJob) -> StoreResult<ScanJob>;
    fn job(&mut self, id: i32) -> StoreResult<Option<ScanJob>>;
    /// Jobs newest first.
    fn list_jobs(
        &mut self,
        source: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<ScanJob>>;
    /// Sets `running` and bumps the attempt counter.
    fn mark_job_running(&mut self, id: i32, now: NaiveDateTime) -> StoreResult<ScanJob>;
    /// Sets a terminal status.
    ///
    /// `last_seen_at` replaces the stored cursor only when it is later, so
    /// overlapping runs of one job cannot move the cursor backward.
    fn finish_job(
        &mut self,
        id: i32,
        status: JobStatus,
        last_seen_at: Option<NaiveDateTime>,
        now: NaiveDateTime,
    ) -> StoreResult<()>;
}

/// Fails with [`StoreError::InvalidTransition`] unless `job` may move to `next`.
pub(crate) fn check_transition(job: &ScanJob, next: JobStatus) -> StoreResult<()> {
    if job.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            id: job.id,
            from: job.status,
            to: next,
        })
    }
}

/// A durable catalog that hands out units of work.
///
/// Everything done through the connection passed to `f` commits together when
/// `f` returns `Ok` and is discarded when it returns `Err`.
pub trait CatalogStore: Send + Sync + 'static {
    type Conn: CatalogConn;

    fn transaction<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Self::Conn) -> StoreResult<T>;
}

/// In-process catalog tables.
///
/// Tables are shared between clones and copied on first write, so a clone
/// costs a handful of reference bumps.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    last_id: i32,
    systems: Arc<Vec<System>>,
    assets: Arc<Vec<Asset>>,
    columns: Arc<Vec<CatalogColumn>>,
    edges: Arc<Vec<LineageEdge>>,
    jobs: Arc<Vec<ScanJob>>,
    artifacts: Arc<Vec<Arc<ScanArtifact>>>,
}

impl MemoryCatalog {
    fn next_id(&mut self) -> i32 {
        self.last_id += 1;
        self.last_id
    }

    pub fn systems(&self) -> &[System] {
        &self.systems
    }

    pub fn assets(&self) -> &[Asset] {
        &self.assets
    }

    pub fn columns(&self) -> &[CatalogColumn] {
        &self.columns
    }

    pub fn edges(&self) -> &[LineageEdge] {
        &self.edges
    }

    pub fn jobs(&self) -> &[ScanJob] {
        &self.jobs
    }

    pub fn artifacts(&self) -> &[Arc<ScanArtifact>] {
        &self.artifacts
    }

    pub fn soft_delete_system(&mut self, id: i32) -> StoreResult<()> {
        let now = crate::models::utc_now();
        let row = find_mut(Arc::<Vec<_>>::make_mut(&mut self.systems), |s| s.id == id, "system")?;
        row.deleted_at = Some(now);
        Ok(())
    }

    pub fn soft_delete_asset(&mut self, id: i32) -> StoreResult<()> {
        let now = crate::models::utc_now();
        let row = find_mut(Arc::<Vec<_>>::make_mut(&mut self.assets), |a| a.id == id, "asset")?;
        row.deleted_at = Some(now);
        Ok(())
    }

    pub fn soft_delete_column(&mut self, id: i32) -> StoreResult<()> {
        let now = crate::models::utc_now();
        let row = find_mut(Arc::<Vec<_>>::make_mut(&mut self.columns), |c| c.id == id, "column")?;
        row.deleted_at = Some(now);
        Ok(())
    }

    pub fn set_asset_visibility(&mut self, id: i32, visibility: Option<&str>) -> StoreResult<()> {
        let row = find_mut(Arc::<Vec<_>>::make_mut(&mut self.assets), |a| a.id == id, "asset")?;
        row.visibility = visibility.map(str::to_string);
        Ok(())
    }
}

fn find_mut<'a, T>(
    rows: &'a mut [T],
    pred: impl Fn(&T) -> bool,
    what: &str,
) -> StoreResult<&'a mut T> {
    rows.iter_mut()
        .find(|r| pred(r))
        .ok_or_else(|| StoreError::NotFound(what.to_string()))
}

/// First live row, else the first tombstoned one. Callers iterate newest first.
fn prefer_live<'a, T: Tombstoned + 'a>(rows: impl Iterator<Item = &'a T>) -> Option<&'a T> {
    let mut fallback = None;
    for row in rows {
        if row.is_live() {
            return Some(row);
        }
        fallback.get_or_insert(row);
    }
    fallback
}

impl CatalogConn for MemoryCatalog {
    fn find_system(&mut self, name: &str) -> StoreResult<Option<System>> {
        Ok(prefer_live(self.systems.iter().rev().filter(|s| s.name == name)).cloned())
    }

    fn insert_system(&mut self, new: NewSystem) -> StoreResult<System> {
        let row = System {
            id: self.next_id(),
            name: new.name,
            description: new.description,
            visibility: new.visibility,
            created_at: new.created_at,
            updated_at: new.updated_at,
            deleted_at: None,
        };
        Arc::make_mut(&mut self.systems).push(row.clone());
        Ok(row)
    }

    fn revive_system(&mut self, id: i32, now: NaiveDateTime) -> StoreResult<()> {
        let row = find_mut(Arc::<Vec<_>>::make_mut(&mut self.systems), |s| s.id == id, "system")?;
        row.deleted_at = None;
        row.updated_at = now;
        Ok(())
    }

    fn find_asset(&mut self, system_id: i32, name: &str) -> StoreResult<Option<Asset>> {
        Ok(prefer_live(
            self.assets
                .iter()
                .rev()
                .filter(|a| a.system_id == system_id && a.name == name),
        )
        .cloned())
    }

    fn insert_asset(&mut self, new: NewAsset) -> StoreResult<Asset> {
        let row = Asset {
            id: self.next_id(),
            system_id: new.system_id,
            name: new.name,
            description: new.description,
            column_names: None,
            visibility: None,
            created_at: new.created_at,
            updated_at: new.updated_at,
            deleted_at: None,
        };
        Arc::make_mut(&mut self.assets).push(row.clone());
        Ok(row)
    }

    fn revive_asset(&mut self, id: i32, now: NaiveDateTime) -> StoreResult<()> {
        let row = find_mut(Arc::<Vec<_>>::make_mut(&mut self.assets), |a| a.id == id, "asset")?;
        row.deleted_at = None;
        row.updated_at = now;
        Ok(())
    }

    fn update_asset_description(
        &mut self,
        id: i32,
        description: &str,
        now: NaiveDateTime,
    ) -> StoreResult<()> {
        let row = find_mut(Arc::<Vec<_>>::make_mut(&mut self.assets), |a| a.id == id, "asset")?;
        row.description = Some(description.to_string());
        row.updated_at = now;
        Ok(())
    }

    fn set_column_names(
        &mut self,
        asset_id: i32,
        column_names: Option<&str>,
        now: NaiveDateTime,
    ) -> StoreResult<()> {
        let row = find_mut(Arc::<Vec<_>>::make_mut(&mut self.assets), |a| a.id == asset_id, "asset")?;
        row.column_names = column_names.map(str::to_string);
        row.updated_at = now;
        Ok(())
    }

    fn live_assets(&mut self) -> StoreResult<Vec<Asset>> {
        Ok(self
            .assets
            .iter()
            .rev()
            .filter(|a| a.is_live())
            .cloned()
            .collect())
    }

    fn find_column(&mut self, asset_id: i32, name: &str) -> StoreResult<Option<CatalogColumn>> {
        Ok(prefer_live(
            self.columns
                .iter()
                .rev()
                .filter(|c| c.asset_id == asset_id && c.name == name),
        )
        .cloned())
    }

    fn insert_column(&mut self, new: NewCatalogColumn) -> StoreResult<CatalogColumn> {
        let row = CatalogColumn {
            id: self.next_id(),
            asset_id: new.asset_id,
            name: new.name,
            data_type: new.data_type,
            description: new.description,
            created_at: new.created_at,
            updated_at: new.updated_at,
            deleted_at: None,
        };
        Arc::make_mut(&mut self.columns).push(row.clone());
        Ok(row)
    }

    fn revive_column(&mut self, id: i32, now: NaiveDateTime) -> StoreResult<()> {
        let row = find_mut(Arc::<Vec<_>>::make_mut(&mut self.columns), |c| c.id == id, "column")?;
        row.deleted_at = None;
        row.updated_at = now;
        Ok(())
    }

    fn merge_column_metadata(
        &mut self,
        id: i32,
        data_type: Option<&str>,
        description: Option<&str>,
        now: NaiveDateTime,
    ) -> StoreResult<()> {
        let row = find_mut(Arc::<Vec<_>>::make_mut(&mut self.columns), |c| c.id == id, "column")?;
        if let Some(dt) = data_type {
            row.data_type = Some(dt.to_string());
        }
        if let Some(desc) = description {
            row.description = Some(desc.to_string());
        }
        row.updated_at = now;
        Ok(())
    }

    fn live_column_names(&mut self, asset_id: i32) -> StoreResult<Vec<String>> {
        Ok(self
            .columns
            .iter()
            .filter(|c| c.asset_id == asset_id && c.is_live())
            .map(|c| c.name.clone())
            .collect())
    }

    fn insert_artifact(&mut self, new: NewScanArtifact) -> StoreResult<ScanArtifact> {
        let row = ScanArtifact {
            id: self.next_id(),
            source: new.source,
            payload: new.payload,
            created_at: new.created_at,
            updated_at: new.updated_at,
            deleted_at: None,
        };
        Arc::make_mut(&mut self.artifacts).push(Arc::new(row.clone()));
        Ok(row)
    }

    fn live_edges(&mut self) -> StoreResult<Vec<LineageEdge>> {
        Ok(self.edges.iter().filter(|e| e.is_live()).cloned().collect())
    }

    fn live_edge_exists(&mut self, src_asset_id: i32, dst_asset_id: i32) -> StoreResult<bool> {
        Ok(self.edges.iter().any(|e| {
            e.src_asset_id == src_asset_id && e.dst_asset_id == dst_asset_id && e.is_live()
        }))
    }

    fn insert_edge(&mut self, new: NewLineageEdge) -> StoreResult<LineageEdge> {
        let row = LineageEdge {
            id: self.next_id(),
            src_asset_id: new.src_asset_id,
            src_column: new.src_column,
            dst_asset_id: new.dst_asset_id,
            dst_column: new.dst_column,
            confidence: new.confidence,
            predicate: new.predicate,
            created_at: new.created_at,
            updated_at: new.updated_at,
            deleted_at: None,
        };
        Arc::make_mut(&mut self.edges).push(row.clone());
        Ok(row)
    }

    fn find_job_by_key(&mut self, source: &str, key: &str) -> StoreResult<Option<ScanJob>> {
        Ok(self
            .jobs
            .iter()
            .rev()
            .find(|j| j.source == source && j.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    fn insert_job(&mut self, new: NewScanJob) -> StoreResult<ScanJob> {
        let row = ScanJob {
            id: self.next_id(),
            source: new.source,
            idempotency_key: new.idempotency_key,
            status: new.status,
            attempts: new.attempts,
            last_seen_at: None,
            created_at: new.created_at,
            updated_at: new.updated_at,
            deleted_at: None,
        };
        Arc::make_mut(&mut self.jobs).push(row.clone());
        Ok(row)
    }

    fn job(&mut self, id: i32) -> StoreResult<Option<ScanJob>> {
        Ok(self.jobs.iter().find(|j| j.id == id).cloned())
    }

    fn list_jobs(
        &mut self,
        source: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<ScanJob>> {
        Ok(self
            .jobs
            .iter()
            .rev()
            .filter(|j| source.is_none_or(|s| j.source == s))
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    fn mark_job_running(&mut self, id: i32, now: NaiveDateTime) -> StoreResult<ScanJob> {
        let row = find_mut(Arc::<Vec<_>>::make_mut(&mut self.jobs), |j| j.id == id, "scan job")?;
        check_transition(row, JobStatus::Running)?;
        row.status = JobStatus::Running;
        row.attempts += 1;
        row.updated_at = now;
        Ok(row.clone())
    }

    fn finish_job(
        &mut self,
        id: i32,
        status: JobStatus,
        last_seen_at: Option<NaiveDateTime>,
        now: NaiveDateTime,
    ) -> StoreResult<()> {
        let row = find_mut(Arc::<Vec<_>>::make_mut(&mut self.jobs), |j| j.id == id, "scan job")?;
        check_transition(row, status)?;
        row.status = status;
        row.last_seen_at = row.last_seen_at.max(last_seen_at);
        row.updated_at = now;
        Ok(())
    }
}

/// Catalog held in process memory.
///
/// A unit of work runs against a copy of the tables that replaces the shared
/// state only on success, so a failed transaction leaves no partial writes.
/// Only the tables it writes to are copied. A panic inside a unit of work
/// leaves the committed tables intact, so a poisoned lock is taken over.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryCatalog>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current committed tables.
    pub fn snapshot(&self) -> StoreResult<MemoryCatalog> {
        Ok(self.lock().clone())
    }

    fn lock(&self) -> MutexGuard<'_, MemoryCatalog> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CatalogStore for MemoryStore {
    type Conn = MemoryCatalog;

    fn transaction<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut MemoryCatalog) -> StoreResult<T>,
    {
        let mut guard = self.lock();
        let mut working = guard.clone();
        let out = f(&mut working)?;
        *guard = working;
        Ok(out)
    }
}
