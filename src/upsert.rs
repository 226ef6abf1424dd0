//! Reconciles discovered metadata into catalog rows.

use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::debug;

use crate::connectors::{DiscoverResult, HarvestResult};
use crate::models::{utc_now, NewAsset, NewCatalogColumn, NewScanArtifact, NewSystem, Tombstoned};
use crate::store::{CatalogConn, StoreResult};

/// What one upsert pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub systems_created: usize,
    pub systems_revived: usize,
    pub assets_created: usize,
    pub assets_revived: usize,
    pub columns_created: usize,
    pub columns_revived: usize,
    pub assets_refreshed: usize,
    pub artifact_id: i32,
}

/// Writes `discovered` and the harvest artifact through `conn`.
///
/// Runs inside the caller's unit of work; any error leaves it to the caller
/// to roll back.
pub fn upsert_discovery<C: CatalogConn + ?Sized>(
    conn: &mut C,
    source: &str,
    discovered: &DiscoverResult,
    harvested: &HarvestResult,
) -> StoreResult<UpsertReport> {
    let now = utc_now();
    let mut report = UpsertReport::default();

    let system_ids = upsert_systems(conn, discovered, now, &mut report)?;

    // Asset name -> owning system, from entries that carry one.
    let mut system_of_asset: HashMap<&str, i32> = HashMap::new();
    for entry in &discovered.assets {
        let sid = entry
            .system
            .as_deref()
            .and_then(|s| system_ids.get(s).copied());
        if let Some(sid) = sid {
            if !entry.name.is_empty() {
                system_of_asset.entry(entry.name.as_str()).or_insert(sid);
            }
        }
    }

    let mut asset_ids: HashMap<(i32, &str), i32> = HashMap::new();
    for entry in &discovered.assets {
        if entry.name.is_empty() {
            continue;
        }
        let sid = match entry.system.as_deref().filter(|s| !s.is_empty()) {
            Some(name) => system_ids.get(name).copied(),
            None => system_of_asset.get(entry.name.as_str()).copied(),
        };
        let Some(sid) = sid else {
            debug!("skipping asset {} without a resolvable system", entry.name);
            continue;
        };
        let aid = ensure_asset(conn, sid, &entry.name, entry.description.as_deref(), now, &mut report)?;
        asset_ids.insert((sid, entry.name.as_str()), aid);
    }

    let mut touched: BTreeSet<i32> = BTreeSet::new();
    for col in &discovered.columns {
        if col.asset.is_empty() || col.name.is_empty() {
            continue;
        }
        let Some(&sid) = system_of_asset.get(col.asset.as_str()) else {
            debug!("skipping column {}.{} without a resolvable system", col.asset, col.name);
            continue;
        };
        let aid = match asset_ids.get(&(sid, col.asset.as_str())) {
            Some(&aid) => aid,
            None => {
                let aid = ensure_asset(conn, sid, &col.asset, None, now, &mut report)?;
                asset_ids.insert((sid, col.asset.as_str()), aid);
                aid
            }
        };

        match conn.find_column(aid, &col.name)? {
            Some(existing) => {
                if !existing.is_live() {
                    conn.revive_column(existing.id, now)?;
                    report.columns_revived += 1;
                }
                conn.merge_column_metadata(
                    existing.id,
                    col.data_type.as_deref(),
                    col.description.as_deref(),
                    now,
                )?;
            }
            None => {
                conn.insert_column(NewCatalogColumn {
                    asset_id: aid,
                    name: col.name.clone(),
                    data_type: col.data_type.clone(),
                    description: col.description.clone(),
                    created_at: now,
                    updated_at: now,
                })?;
                report.columns_created += 1;
            }
        }
        touched.insert(aid);
    }

    for aid in &touched {
        refresh_column_names_at(conn, *aid, now)?;
    }
    report.assets_refreshed = touched.len();

    let artifact = conn.insert_artifact(NewScanArtifact {
        source: source.to_string(),
        payload: harvested.payload.clone(),
        created_at: now,
        updated_at: now,
    })?;
    report.artifact_id = artifact.id;

    Ok(report)
}

fn upsert_systems<C: CatalogConn + ?Sized>(
    conn: &mut C,
    discovered: &DiscoverResult,
    now: NaiveDateTime,
    report: &mut UpsertReport,
) -> StoreResult<HashMap<String, i32>> {
    let names: BTreeSet<&str> = discovered
        .assets
        .iter()
        .filter_map(|a| a.system.as_deref())
        .filter(|s| !s.is_empty())
        .collect();

    let mut ids = HashMap::with_capacity(names.len());
    for name in names {
        let id = match conn.find_system(name)? {
            Some(existing) => {
                if !existing.is_live() {
                    conn.revive_system(existing.id, now)?;
                    report.systems_revived += 1;
                }
                existing.id
            }
            None => {
                report.systems_created += 1;
                conn.insert_system(NewSystem {
                    name: name.to_string(),
                    description: None,
                    visibility: None,
                    created_at: now,
                    updated_at: now,
                })?
                .id
            }
        };
        ids.insert(name.to_string(), id);
    }
    Ok(ids)
}

fn ensure_asset<C: CatalogConn + ?Sized>(
    conn: &mut C,
    system_id: i32,
    name: &str,
    description: Option<&str>,
    now: NaiveDateTime,
    report: &mut UpsertReport,
) -> StoreResult<i32> {
    match conn.find_asset(system_id, name)? {
        Some(existing) => {
            if !existing.is_live() {
                conn.revive_asset(existing.id, now)?;
                report.assets_revived += 1;
            }
            if let Some(desc) = description {
                conn.update_asset_description(existing.id, desc, now)?;
            }
            Ok(existing.id)
        }
        None => {
            report.assets_created += 1;
            Ok(conn
                .insert_asset(NewAsset {
                    system_id,
                    name: name.to_string(),
                    description: description.map(str::to_string),
                    created_at: now,
                    updated_at: now,
                })?
                .id)
        }
    }
}

/// Recomputes the cached column-name list of `asset_id` from its live columns.
///
/// Column writes made outside the upsert engine call this to keep the cache
/// in step.
pub fn refresh_column_names<C: CatalogConn + ?Sized>(conn: &mut C, asset_id: i32) -> StoreResult<String> {
    refresh_column_names_at(conn, asset_id, utc_now())
}

fn refresh_column_names_at<C: CatalogConn + ?Sized>(
    conn: &mut C,
    asset_id: i32,
    now: NaiveDateTime,
) -> StoreResult<String> {
    let names: BTreeSet<String> = conn.live_column_names(asset_id)?.into_iter().collect();
    let joined = names.into_iter().collect::<Vec<_>>().join(",");
    conn.set_column_names(asset_id, Some(&joined), now)?;
    Ok(joined)
}
