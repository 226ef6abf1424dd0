use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager, Pool, PooledConnection};

pub type DbPool = Pool<ConnectionManager<PgConnection>>;
pub type DbConn = PooledConnection<ConnectionManager<PgConnection>>;

use crate::models::{
    Asset, CatalogColumn, JobStatus, LineageEdge, NewAsset, NewCatalogColumn, NewLineageEdge,
    NewScanArtifact, NewScanJob, NewSystem, ScanArtifact, ScanJob, System, Tombstoned,
};
use crate::schema::{asset, asset_column, lineage_edge, scan_artifact, scan_job, system};
use crate::store::{check_transition, CatalogConn, CatalogStore, StoreError, StoreResult};

/// Create database connection pool with configurable size
pub fn create_pool(database_url: &str, max_size: u32) -> Result<DbPool, r2d2::PoolError> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder().max_size(max_size).build(manager)
}

/// Catalog stored in PostgreSQL; each unit of work is one database transaction.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl CatalogStore for PgStore {
    type Conn = PgConnection;

    fn transaction<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut PgConnection) -> StoreResult<T>,
    {
        let mut pooled: DbConn = self.pool.get()?;
        let conn: &mut PgConnection = &mut pooled;
        conn.transaction(f)
    }
}

// Rows come back newest first; a live one wins over tombstones.
fn pick_live<T: Tombstoned>(rows: Vec<T>) -> Option<T> {
    let mut fallback = None;
    for row in rows {
        if row.is_live() {
            return Some(row);
        }
        if fallback.is_none() {
            fallback = Some(row);
        }
    }
    fallback
}

fn expect_one(updated: usize, what: &str) -> StoreResult<()> {
    if updated == 0 {
        return Err(StoreError::NotFound(what.to_string()));
    }
    Ok(())
}

impl CatalogConn for PgConnection {
    fn find_system(&mut self, name: &str) -> StoreResult<Option<System>> {
        let rows = system::table
            .filter(system::name.eq(name))
            .order(system::id.desc())
            .load::<System>(self)?;
        Ok(pick_live(rows))
    }

    fn insert_system(&mut self, new: NewSystem) -> StoreResult<System> {
        Ok(diesel::insert_into(system::table)
            .values(new)
            .get_result(self)?)
    }

    fn revive_system(&mut self, id: i32, now: NaiveDateTime) -> StoreResult<()> {
        let n = diesel::update(system::table.find(id))
            .set((
                system::deleted_at.eq(None::<NaiveDateTime>),
                system::updated_at.eq(now),
            ))
            .execute(self)?;
        expect_one(n, "system")
    }

    fn find_asset(&mut self, system_id: i32, name: &str) -> StoreResult<Option<Asset>> {
        let rows = asset::table
            .filter(asset::system_id.eq(system_id))
            .filter(asset::name.eq(name))
            .order(asset::id.desc())
            .load::<Asset>(self)?;
        Ok(pick_live(rows))
    }

    fn insert_asset(&mut self, new: NewAsset) -> StoreResult<Asset> {
        Ok(diesel::insert_into(asset::table)
            .values(new)
            .get_result(self)?)
    }

    fn revive_asset(&mut self, id: i32, now: NaiveDateTime) -> StoreResult<()> {
        let n = diesel::update(asset::table.find(id))
            .set((
                asset::deleted_at.eq(None::<NaiveDateTime>),
                asset::updated_at.eq(now),
            ))
            .execute(self)?;
        expect_one(n, "asset")
    }

    fn update_asset_description(
        &mut self,
        id: i32,
        description: &str,
        now: NaiveDateTime,
    ) -> StoreResult<()> {
        let n = diesel::update(asset::table.find(id))
            .set((asset::description.eq(description), asset::updated_at.eq(now)))
            .execute(self)?;
        expect_one(n, "asset")
    }

    fn set_column_names(
        &mut self,
        asset_id: i32,
        column_names: Option<&str>,
        now: NaiveDateTime,
    ) -> StoreResult<()> {
        let n = diesel::update(asset::table.find(asset_id))
            .set((
                asset::column_names.eq(column_names),
                asset::updated_at.eq(now),
            ))
            .execute(self)?;
        expect_one(n, "asset")
    }

    fn live_assets(&mut self) -> StoreResult<Vec<Asset>> {
        Ok(asset::table
            .filter(asset::deleted_at.is_null())
            .order(asset::id.desc())
            .load::<Asset>(self)?)
    }

    fn find_column(&mut self, asset_id: i32, name: &str) -> StoreResult<Option<CatalogColumn>> {
        let rows = asset_column::table
            .filter(asset_column::asset_id.eq(asset_id))
            .filter(asset_column::name.eq(name))
            .order(asset_column::id.desc())
            .load::<CatalogColumn>(self)?;
        Ok(pick_live(rows))
    }

    fn insert_column(&mut self, new: NewCatalogColumn) -> StoreResult<CatalogColumn> {
        Ok(diesel::insert_into(asset_column::table)
            .values(new)
            .get_result(self)?)
    }

    fn revive_column(&mut self, id: i32, now: NaiveDateTime) -> StoreResult<()> {
        let n = diesel::update(asset_column::table.find(id))
            .set((
                asset_column::deleted_at.eq(None::<NaiveDateTime>),
                asset_column::updated_at.eq(now),
            ))
            .execute(self)?;
        expect_one(n, "column")
    }

    fn merge_column_metadata(
        &mut self,
        id: i32,
        data_type: Option<&str>,
        description: Option<&str>,
        now: NaiveDateTime,
    ) -> StoreResult<()> {
        if let Some(dt) = data_type {
            diesel::update(asset_column::table.find(id))
                .set(asset_column::data_type.eq(dt))
                .execute(self)?;
        }
        if let Some(desc) = description {
            diesel::update(asset_column::table.find(id))
                .set(asset_column::description.eq(desc))
                .execute(self)?;
        }
        let n = diesel::update(asset_column::table.find(id))
            .set(asset_column::updated_at.eq(now))
            .execute(self)?;
        expect_one(n, "column")
    }

    fn live_column_names(&mut self, asset_id: i32) -> StoreResult<Vec<String>> {
        Ok(asset_column::table
            .filter(asset_column::asset_id.eq(asset_id))
            .filter(asset_column::deleted_at.is_null())
            .select(asset_column::name)
            .load::<String>(self)?)
    }

    fn insert_artifact(&mut self, new: NewScanArtifact) -> StoreResult<ScanArtifact> {
        Ok(diesel::insert_into(scan_artifact::table)
            .values(new)
            .get_result(self)?)
    }

    fn live_edges(&mut self) -> StoreResult<Vec<LineageEdge>> {
        Ok(lineage_edge::table
            .filter(lineage_edge::deleted_at.is_null())
            .order(lineage_edge::id.asc())
            .load::<LineageEdge>(self)?)
    }

    fn live_edge_exists(&mut self, src_asset_id: i32, dst_asset_id: i32) -> StoreResult<bool> {
        let found = lineage_edge::table
            .filter(lineage_edge::src_asset_id.eq(src_asset_id))
            .filter(lineage_edge::dst_asset_id.eq(dst_asset_id))
            .filter(lineage_edge::deleted_at.is_null())
            .select(lineage_edge::id)
            .first::<i32>(self)
            .optional()?;
        Ok(found.is_some())
    }

    fn insert_edge(&mut self, new: NewLineageEdge) -> StoreResult<LineageEdge> {
        Ok(diesel::insert_into(lineage_edge::table)
            .values(new)
            .get_result(self)?)
    }

    fn find_job_by_key(&mut self, source: &str, key: &str) -> StoreResult<Option<ScanJob>> {
        Ok(scan_job::table
            .filter(scan_job::source.eq(source))
            .filter(scan_job::idempotency_key.eq(key))
            .order(scan_job::id.desc())
            .first::<ScanJob>(self)
            .optional()?)
    }

    fn insert_job(&mut self, new: NewScanJob) -> StoreResult<ScanJob> {
        Ok(diesel::insert_into(scan_job::table)
            .values(new)
            .get_result(self)?)
    }

    fn job(&mut self, id: i32) -> StoreResult<Option<ScanJob>> {
        Ok(scan_job::table
            .find(id)
            .first::<ScanJob>(self)
            .optional()?)
    }

    fn list_jobs(
        &mut self,
        source: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<ScanJob>> {
        let mut query = scan_job::table.into_boxed();
        if let Some(source) = source {
            query = query.filter(scan_job::source.eq(source));
        }
        Ok(query
            .order(scan_job::id.desc())
            .limit(limit)
            .offset(offset)
            .load::<ScanJob>(self)?)
    }

    fn mark_job_running(&mut self, id: i32, now: NaiveDateTime) -> StoreResult<ScanJob> {
        let job = lock_job(self, id)?;
        check_transition(&job, JobStatus::Running)?;
        Ok(diesel::update(scan_job::table.find(id))
            .set((
                scan_job::status.eq(JobStatus::Running.as_str()),
                scan_job::attempts.eq(scan_job::attempts + 1),
                scan_job::updated_at.eq(now),
            ))
            .get_result::<ScanJob>(self)?)
    }

    fn finish_job(
        &mut self,
        id: i32,
        status: JobStatus,
        last_seen_at: Option<NaiveDateTime>,
        now: NaiveDateTime,
    ) -> StoreResult<()> {
        let job = lock_job(self, id)?;
        check_transition(&job, status)?;
        let n = diesel::update(scan_job::table.find(id))
            .set((
                scan_job::status.eq(status.as_str()),
                scan_job::last_seen_at.eq(job.last_seen_at.max(last_seen_at)),
                scan_job::updated_at.eq(now),
            ))
            .execute(self)?;
        expect_one(n, "scan job")
    }
}

// The row lock lasts until the unit of work ends, so overlapping runs of one
// job read each other's committed cursor.
fn lock_job(conn: &mut PgConnection, id: i32) -> StoreResult<ScanJob> {
    scan_job::table
        .find(id)
        .for_update()
        .first::<ScanJob>(conn)
        .optional()?
        .ok_or_else(|| StoreError::NotFound("scan job".to_string()))
}
