//! Lineage graph views over persisted edges.

use std::collections::{BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::models::Asset;
use crate::store::{CatalogConn, StoreResult};
use crate::visibility::Visibility;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphFormat {
    #[default]
    Ids,
    Ui,
}

pub const DEFAULT_DEPTH: u32 = 1;

/// Nodes and directed edges reached from a start asset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Traversal {
    pub nodes: BTreeSet<i32>,
    pub edges: BTreeSet<(i32, i32)>,
}

/// Undirected breadth-first walk from `start` over `edges`.
///
/// Nodes at distance `depth` are included but not expanded. Edges are
/// reported in their stored direction.
pub fn traverse(edges: &[(i32, i32)], start: i32, depth: u32) -> Traversal {
    let mut forward: HashMap<i32, Vec<i32>> = HashMap::new();
    let mut reverse: HashMap<i32, Vec<i32>> = HashMap::new();
    for &(src, dst) in edges {
        forward.entry(src).or_default().push(dst);
        reverse.entry(dst).or_default().push(src);
    }

    let mut dist: HashMap<i32, u32> = HashMap::from([(start, 0)]);
    let mut queue = VecDeque::from([start]);
    let mut seen_edges = BTreeSet::new();

    while let Some(node) = queue.pop_front() {
        let d = dist[&node];
        if d >= depth {
            continue;
        }
        let outgoing = forward.get(&node).into_iter().flatten().map(|&n| (n, (node, n)));
        let incoming = reverse.get(&node).into_iter().flatten().map(|&n| (n, (n, node)));
        for (next, edge) in outgoing.chain(incoming) {
            seen_edges.insert(edge);
            if dist.get(&next).is_none_or(|&known| known > d + 1) {
                dist.insert(next, d + 1);
                queue.push_back(next);
            }
        }
    }

    Traversal {
        nodes: dist.into_keys().collect(),
        edges: seen_edges,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdsGraph {
    pub nodes: Vec<i32>,
    pub edges: Vec<(i32, i32)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UiNode {
    pub id: i32,
    pub name: String,
    pub system_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UiEdge {
    pub source: i32,
    pub target: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UiGraph {
    pub nodes: Vec<UiNode>,
    pub edges: Vec<UiEdge>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum GraphView {
    Ids(IdsGraph),
    Ui(UiGraph),
}

impl GraphView {
    fn empty(format: GraphFormat) -> Self {
        shape(Vec::new(), Vec::new(), &HashMap::new(), format)
    }
}

fn shape(
    nodes: Vec<i32>,
    edges: Vec<(i32, i32)>,
    assets: &HashMap<i32, Asset>,
    format: GraphFormat,
) -> GraphView {
    match format {
        GraphFormat::Ids => GraphView::Ids(IdsGraph { nodes, edges }),
        GraphFormat::Ui => GraphView::Ui(UiGraph {
            nodes: nodes
                .into_iter()
                .map(|id| match assets.get(&id) {
                    Some(a) => UiNode {
                        id,
                        name: a.name.clone(),
                        system_id: Some(a.system_id),
                    },
                    None => UiNode {
                        id,
                        name: id.to_string(),
                        system_id: None,
                    },
                })
                .collect(),
            edges: edges
                .into_iter()
                .map(|(source, target)| UiEdge { source, target })
                .collect(),
        }),
    }
}

/// Lineage around `asset_id` within `depth` hops, or the whole graph when
/// `asset_id` is `None`.
///
/// Only live edges whose endpoints are both live and visible take part. An
/// invisible or missing start asset gives an empty graph.
pub fn lineage_graph<C, V>(
    conn: &mut C,
    asset_id: Option<i32>,
    depth: u32,
    format: GraphFormat,
    visibility: &V,
) -> StoreResult<GraphView>
where
    C: CatalogConn + ?Sized,
    V: Visibility + ?Sized,
{
    let visible: HashMap<i32, Asset> = conn
        .live_assets()?
        .into_iter()
        .filter(|a| visibility.can_see(a))
        .map(|a| (a.id, a))
        .collect();

    if let Some(start) = asset_id {
        if !visible.contains_key(&start) {
            return Ok(GraphView::empty(format));
        }
    }

    let edges: Vec<(i32, i32)> = conn
        .live_edges()?
        .into_iter()
        .filter(|e| visible.contains_key(&e.src_asset_id) && visible.contains_key(&e.dst_asset_id))
        .map(|e| (e.src_asset_id, e.dst_asset_id))
        .collect();

    let (nodes, edges) = match asset_id {
        None => {
            let nodes: BTreeSet<i32> = edges.iter().flat_map(|&(s, d)| [s, d]).collect();
            (nodes.into_iter().collect(), edges)
        }
        Some(start) => {
            let reached = traverse(&edges, start, depth);
            (
                reached.nodes.into_iter().collect(),
                reached.edges.into_iter().collect(),
            )
        }
    };
    Ok(shape(nodes, edges, &visible, format))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{utc_now, NewAsset, NewLineageEdge, NewSystem};
    use crate::store::{CatalogStore, MemoryCatalog, MemoryStore};
    use crate::visibility::{AllowAll, RoleVisibility};
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_depth_bound_is_inclusive() {
        // 1 -> 2 -> 3 -> 4, and 5 -> 2
        let edges = [(1, 2), (2, 3), (3, 4), (5, 2)];

        let zero = traverse(&edges, 2, 0);
        assert_eq!(zero.nodes, BTreeSet::from([2]));
        assert!(zero.edges.is_empty());

        let one = traverse(&edges, 2, 1);
        assert_eq!(one.nodes, BTreeSet::from([1, 2, 3, 5]));
        assert_eq!(one.edges, BTreeSet::from([(1, 2), (2, 3), (5, 2)]));

        let two = traverse(&edges, 2, 2);
        assert_eq!(two.nodes, BTreeSet::from([1, 2, 3, 4, 5]));
        assert!(two.edges.contains(&(3, 4)));
    }

    #[test]
    fn test_every_node_within_depth_of_start() {
        let edges = [(1, 2), (2, 3), (3, 4), (4, 5), (1, 6), (6, 5)];
        for depth in 0..5 {
            let reached = traverse(&edges, 1, depth);
            let far = traverse(&edges, 1, depth + 1);
            assert!(reached.nodes.is_subset(&far.nodes));
            for &(s, d) in &reached.edges {
                assert!(reached.nodes.contains(&s) && reached.nodes.contains(&d));
            }
        }
        // 5 is two hops away through 6, so depth 2 must reach it.
        assert!(traverse(&edges, 1, 2).nodes.contains(&5));
    }

    #[test]
    fn test_cycles_terminate() {
        let edges = [(1, 2), (2, 1), (2, 3), (3, 1)];
        let reached = traverse(&edges, 1, 10);
        assert_eq!(reached.nodes, BTreeSet::from([1, 2, 3]));
        assert_eq!(reached.edges.len(), 4);
    }

    fn seed(conn: &mut MemoryCatalog) -> StoreResult<Vec<i32>> {
        let now = utc_now();
        let sys = conn
            .insert_system(NewSystem {
                name: "pg".to_string(),
                description: None,
                visibility: None,
                created_at: now,
                updated_at: now,
            })?
            .id;
        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            ids.push(
                conn.insert_asset(NewAsset {
                    system_id: sys,
                    name: name.to_string(),
                    description: None,
                    created_at: now,
                    updated_at: now,
                })?
                .id,
            );
        }
        for (s, d) in [(ids[0], ids[1]), (ids[1], ids[2])] {
            conn.insert_edge(NewLineageEdge {
                src_asset_id: s,
                src_column: None,
                dst_asset_id: d,
                dst_column: None,
                confidence: 50,
                predicate: None,
                created_at: now,
                updated_at: now,
            })?;
        }
        Ok(ids)
    }

    #[test]
    fn test_global_graph_and_ui_format() -> Result<()> {
        let store = MemoryStore::new();
        let ids = store.transaction(seed)?;
        let view = store.transaction(|conn| lineage_graph(conn, None, DEFAULT_DEPTH, GraphFormat::Ids, &AllowAll))?;
        assert_eq!(
            serde_json::to_value(&view)?,
            json!({"nodes": ids, "edges": [[ids[0], ids[1]], [ids[1], ids[2]]]})
        );

        let ui = store.transaction(|conn| lineage_graph(conn, Some(ids[0]), 1, GraphFormat::Ui, &AllowAll))?;
        assert_eq!(
            serde_json::to_value(&ui)?["edges"],
            json!([{"source": ids[0], "target": ids[1]}])
        );
        assert_eq!(serde_json::to_value(&ui)?["nodes"][1]["name"], json!("b"));
        Ok(())
    }

    #[test]
    fn test_invisible_assets_are_dropped() -> Result<()> {
        let store = MemoryStore::new();
        let ids = store.transaction(seed)?;
        store.transaction(|conn| conn.set_asset_visibility(ids[1], Some("finance")))?;

        let outsider = RoleVisibility::new(["marketing"]);
        let view = store.transaction(|conn| lineage_graph(conn, None, 1, GraphFormat::Ids, &outsider))?;
        assert_eq!(view, GraphView::Ids(IdsGraph { nodes: vec![], edges: vec![] }));

        let hidden_start =
            store.transaction(|conn| lineage_graph(conn, Some(ids[1]), 3, GraphFormat::Ids, &outsider))?;
        assert_eq!(hidden_start, GraphView::empty(GraphFormat::Ids));

        let insider = RoleVisibility::new(["Finance"]);
        let view = store.transaction(|conn| lineage_graph(conn, Some(ids[0]), 2, GraphFormat::Ids, &insider))?;
        assert_eq!(
            view,
            GraphView::Ids(IdsGraph {
                nodes: ids.clone(),
                edges: vec![(ids[0], ids[1]), (ids[1], ids[2])],
            })
        );
        Ok(())
    }

    #[test]
    fn test_tombstoned_edges_and_assets_excluded() -> Result<()> {
        let store = MemoryStore::new();
        let ids = store.transaction(seed)?;
        store.transaction(|conn| conn.soft_delete_asset(ids[2]))?;
        let view = store.transaction(|conn| lineage_graph(conn, Some(ids[1]), 5, GraphFormat::Ids, &AllowAll))?;
        assert_eq!(
            view,
            GraphView::Ids(IdsGraph {
                nodes: vec![ids[0], ids[1]],
                edges: vec![(ids[0], ids[1])],
            })
        );
        let missing = store.transaction(|conn| lineage_graph(conn, Some(999), 1, GraphFormat::Ids, &AllowAll))?;
        assert_eq!(missing, GraphView::empty(GraphFormat::Ids));
        Ok(())
    }
}
