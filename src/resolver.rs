//! Maps extracted table names onto catalog assets and records lineage edges.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::models::{tail_segment, utc_now, Asset, NewLineageEdge};
use crate::store::{CatalogConn, CatalogStore, StoreResult};
use crate::{extract_table_refs, TableRefs};

pub const SQL_EDGE_CONFIDENCE: i32 = 50;
pub const SQL_EDGE_PREDICATE: &str = "sqlparser";

/// One asset a table name may refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub asset_id: i32,
    pub system_id: i32,
    pub exact: bool,
}

/// Pair ranking: more exact-name matches first, then the larger of the two
/// smaller ids (favouring pairs whose older member is newer).
pub fn score(target: &Candidate, source: &Candidate) -> (u8, i32) {
    let exact = u8::from(target.exact) + u8::from(source.exact);
    (exact, target.asset_id.min(source.asset_id))
}

/// Best `(source_asset, target_asset)` pair, same-system pairs first.
///
/// Pairs resolving to the same asset are never chosen. Ties keep the first
/// pair seen.
pub fn best_pair(targets: &[Candidate], sources: &[Candidate]) -> Option<(i32, i32)> {
    pick(targets, sources, true).or_else(|| pick(targets, sources, false))
}

fn pick(targets: &[Candidate], sources: &[Candidate], same_system: bool) -> Option<(i32, i32)> {
    let mut best: Option<((u8, i32), (i32, i32))> = None;
    for t in targets {
        for s in sources {
            if s.asset_id == t.asset_id || (same_system && s.system_id != t.system_id) {
                continue;
            }
            let sc = score(t, s);
            if best.is_none_or(|(top, _)| sc > top) {
                best = Some((sc, (s.asset_id, t.asset_id)));
            }
        }
    }
    best.map(|(_, pair)| pair)
}

/// Live assets indexed by full name and by final name segment, newest first.
#[derive(Debug, Default)]
pub struct AssetIndex {
    by_name: HashMap<String, Vec<(i32, i32)>>,
    by_tail: HashMap<String, Vec<(i32, i32)>>,
}

impl AssetIndex {
    /// `assets` must already be ordered newest first.
    pub fn new(assets: &[Asset]) -> Self {
        let mut index = Self::default();
        for a in assets {
            index
                .by_name
                .entry(a.name.clone())
                .or_default()
                .push((a.id, a.system_id));
            index
                .by_tail
                .entry(a.tail_name().to_string())
                .or_default()
                .push((a.id, a.system_id));
        }
        index
    }

    /// Exact matches, then tail matches not already present as exact.
    pub fn candidates(&self, name: &str) -> Vec<Candidate> {
        let mut out: Vec<Candidate> = self
            .by_name
            .get(name)
            .into_iter()
            .flatten()
            .map(|&(asset_id, system_id)| Candidate {
                asset_id,
                system_id,
                exact: true,
            })
            .collect();
        let exact_ids: Vec<i32> = out.iter().map(|c| c.asset_id).collect();
        for &(asset_id, system_id) in self.by_tail.get(tail_segment(name)).into_iter().flatten() {
            if !exact_ids.contains(&asset_id) {
                out.push(Candidate {
                    asset_id,
                    system_id,
                    exact: false,
                });
            }
        }
        out
    }
}

/// Resolves every (target, source) pair and inserts missing edges.
///
/// Returns the number of edges created.
pub fn persist_edges<C: CatalogConn + ?Sized>(conn: &mut C, refs: &TableRefs) -> StoreResult<usize> {
    let assets = conn.live_assets()?;
    let index = AssetIndex::new(&assets);
    let now = utc_now();
    let mut created = 0;

    for target in &refs.targets {
        let target_cands = index.candidates(target);
        if target_cands.is_empty() {
            debug!("no asset matches sql target {}", target);
            continue;
        }
        for source in &refs.sources {
            // A written table is listed among the sources too.
            if source == target {
                continue;
            }
            let source_cands = index.candidates(source);
            let Some((src_id, dst_id)) = best_pair(&target_cands, &source_cands) else {
                continue;
            };
            if conn.live_edge_exists(src_id, dst_id)? {
                continue;
            }
            conn.insert_edge(NewLineageEdge {
                src_asset_id: src_id,
                src_column: None,
                dst_asset_id: dst_id,
                dst_column: None,
                confidence: SQL_EDGE_CONFIDENCE,
                predicate: Some(SQL_EDGE_PREDICATE.to_string()),
                created_at: now,
                updated_at: now,
            })?;
            created += 1;
        }
    }
    Ok(created)
}

/// Extracts table references from `sql` and, when `persist` is set, records
/// lineage edges for them in one unit of work.
///
/// The extraction is returned even if persisting fails.
pub fn resolve_sql<S: CatalogStore>(store: &S, sql: &str, persist: bool) -> TableRefs {
    let refs = extract_table_refs(sql);
    if persist && !refs.targets.is_empty() && !refs.sources.is_empty() {
        match store.transaction(|conn| persist_edges(conn, &refs)) {
            Ok(created) => info!("sql lineage persisted {} new edge(s)", created),
            Err(e) => warn!("sql lineage persistence failed: {}", e),
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewAsset, NewSystem};
    use crate::store::{CatalogConn, MemoryStore};
    use anyhow::Result;
    use pretty_assertions::assert_eq;

    fn cand(asset_id: i32, system_id: i32, exact: bool) -> Candidate {
        Candidate {
            asset_id,
            system_id,
            exact,
        }
    }

    fn add_system<C: CatalogConn>(conn: &mut C, name: &str) -> StoreResult<i32> {
        let now = utc_now();
        Ok(conn
            .insert_system(NewSystem {
                name: name.to_string(),
                description: None,
                visibility: None,
                created_at: now,
                updated_at: now,
            })?
            .id)
    }

    fn add_asset<C: CatalogConn>(conn: &mut C, system_id: i32, name: &str) -> StoreResult<i32> {
        let now = utc_now();
        Ok(conn
            .insert_asset(NewAsset {
                system_id,
                name: name.to_string(),
                description: None,
                created_at: now,
                updated_at: now,
            })?
            .id)
    }

    #[test]
    fn test_score_prefers_exactness_then_newer_pair() {
        assert_eq!(score(&cand(3, 1, true), &cand(7, 1, true)), (2, 3));
        assert!(score(&cand(1, 1, true), &cand(2, 1, true)) > score(&cand(8, 1, false), &cand(9, 1, true)));
        assert!(score(&cand(5, 1, false), &cand(6, 1, false)) > score(&cand(2, 1, false), &cand(9, 1, false)));
    }

    #[test]
    fn test_best_pair_skips_same_asset_and_prefers_same_system() {
        let targets = [cand(10, 1, true), cand(11, 2, true)];
        let sources = [cand(10, 1, true), cand(12, 2, false)];
        // (12 -> 11) is same-system; (12 -> 10) would score the same but crosses systems.
        assert_eq!(best_pair(&targets, &sources), Some((12, 11)));

        assert_eq!(best_pair(&[cand(4, 1, true)], &[cand(4, 1, true)]), None);
        assert_eq!(best_pair(&[cand(4, 1, true)], &[cand(5, 2, true)]), Some((5, 4)));
        assert_eq!(best_pair(&[], &[cand(5, 2, true)]), None);
    }

    #[test]
    fn test_candidates_exact_before_tail() -> Result<()> {
        let store = MemoryStore::new();
        let index = store.transaction(|conn| {
            let sys = add_system(conn, "pg")?;
            add_asset(conn, sys, "orders")?;
            add_asset(conn, sys, "sales.orders")?;
            Ok(AssetIndex::new(&conn.live_assets()?))
        })?;
        let cands = index.candidates("sales.orders");
        assert_eq!(cands.len(), 2);
        assert!(cands[0].exact);
        assert!(!cands[1].exact);
        assert!(index.candidates("missing").is_empty());
        Ok(())
    }

    #[test]
    fn test_resolve_sql_is_idempotent() -> Result<()> {
        let store = MemoryStore::new();
        let (src, dst) = store.transaction(|conn| {
            let sys = add_system(conn, "pg")?;
            Ok((add_asset(conn, sys, "raw.orders")?, add_asset(conn, sys, "mart.orders_daily")?))
        })?;

        let sql = "INSERT INTO mart.orders_daily SELECT * FROM raw.orders";
        let refs = resolve_sql(&store, sql, true);
        assert_eq!(refs.targets, vec!["mart.orders_daily".to_string()]);
        resolve_sql(&store, sql, true);

        let snap = store.snapshot()?;
        assert_eq!(snap.edges().len(), 1);
        let edge = &snap.edges()[0];
        assert_eq!((edge.src_asset_id, edge.dst_asset_id), (src, dst));
        assert_eq!(edge.confidence, 50);
        assert_eq!(edge.predicate.as_deref(), Some("sqlparser"));
        Ok(())
    }

    #[test]
    fn test_resolve_without_persist_writes_nothing() -> Result<()> {
        let store = MemoryStore::new();
        store.transaction(|conn| {
            let sys = add_system(conn, "pg")?;
            add_asset(conn, sys, "a")?;
            add_asset(conn, sys, "b")
        })?;
        let refs = resolve_sql(&store, "CREATE TABLE b AS SELECT * FROM a", false);
        assert_eq!(refs.sources, vec!["b".to_string(), "a".to_string()]);
        assert!(store.snapshot()?.edges().is_empty());
        Ok(())
    }

    #[test]
    fn test_exact_name_beats_newer_tail_match() -> Result<()> {
        let store = MemoryStore::new();
        let (exact_src, exact_dst) = store.transaction(|conn| {
            let pg = add_system(conn, "pg")?;
            let exact_src = add_asset(conn, pg, "raw.orders")?;
            let exact_dst = add_asset(conn, pg, "mart.daily")?;
            // Newer, so only exactness keeps them from winning.
            add_asset(conn, pg, "orders")?;
            add_asset(conn, pg, "daily")?;
            Ok((exact_src, exact_dst))
        })?;

        resolve_sql(&store, "INSERT INTO mart.daily SELECT * FROM raw.orders", true);
        let snap = store.snapshot()?;
        let pairs: Vec<(i32, i32)> = snap
            .edges()
            .iter()
            .map(|e| (e.src_asset_id, e.dst_asset_id))
            .collect();
        assert_eq!(pairs, vec![(exact_src, exact_dst)]);
        Ok(())
    }

    #[test]
    fn test_newer_of_two_exact_sources_wins() -> Result<()> {
        let store = MemoryStore::new();
        let (tgt, newer) = store.transaction(|conn| {
            let pg = add_system(conn, "pg")?;
            add_asset(conn, pg, "src")?;
            let tgt = add_asset(conn, pg, "tgt")?;
            let newer = add_asset(conn, pg, "src")?;
            Ok((tgt, newer))
        })?;

        resolve_sql(&store, "CREATE TABLE tgt AS SELECT * FROM src", true);
        let snap = store.snapshot()?;
        let pairs: Vec<(i32, i32)> = snap
            .edges()
            .iter()
            .map(|e| (e.src_asset_id, e.dst_asset_id))
            .collect();
        assert_eq!(pairs, vec![(newer, tgt)]);
        Ok(())
    }

    #[test]
    fn test_tail_match_prefers_same_system() -> Result<()> {
        let store = MemoryStore::new();
        let (src_pg, dst_pg) = store.transaction(|conn| {
            let pg = add_system(conn, "pg")?;
            let sf = add_system(conn, "snowflake")?;
            let src_pg = add_asset(conn, pg, "public.events")?;
            let dst_pg = add_asset(conn, pg, "public.sessions")?;
            // Newer assets elsewhere must not pull the edge across systems.
            add_asset(conn, sf, "db.raw.events")?;
            Ok((src_pg, dst_pg))
        })?;

        resolve_sql(&store, "INSERT INTO sessions SELECT * FROM events", true);
        let snap = store.snapshot()?;
        assert_eq!(snap.edges().len(), 1);
        assert_eq!(
            (snap.edges()[0].src_asset_id, snap.edges()[0].dst_asset_id),
            (src_pg, dst_pg)
        );
        Ok(())
    }

    #[test]
    fn test_cross_system_fallback() -> Result<()> {
        let store = MemoryStore::new();
        let (src, dst) = store.transaction(|conn| {
            let pg = add_system(conn, "pg")?;
            let s3 = add_system(conn, "s3")?;
            Ok((add_asset(conn, s3, "landing")?, add_asset(conn, pg, "staged")?))
        })?;
        resolve_sql(&store, "INSERT INTO staged SELECT * FROM landing", true);
        let snap = store.snapshot()?;
        assert_eq!(snap.edges().len(), 1);
        assert_eq!((snap.edges()[0].src_asset_id, snap.edges()[0].dst_asset_id), (src, dst));
        Ok(())
    }
}
