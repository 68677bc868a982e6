// ============================================================================
// Dependency manager
// ============================================================================
//
// Orders a working set of entities so that every "must precede" edge is
// satisfied, using an iterative Kahn-style topological sort over
// `EntityHandle`. Cycle detection is a DFS over the same adjacency, mirroring
// `check_cycles`/`detect_cycle_dfs` from the unit-of-work reference in the
// example pack; cycle-breaking is this crate's own addition, required by
// SPEC_FULL.md §4.3 and not present in that reference (it simply errors on a
// cycle instead of breaking one).

use std::collections::{HashMap, HashSet, VecDeque};

use crate::entity::EntityHandle;
use crate::error::{OrmError, Result};

/// One entity participating in a flush-ordering computation.
#[derive(Debug, Clone)]
pub struct Node {
    pub handle: EntityHandle,
    pub class: String,
    /// Monotonic order the entity was added to the engine in; used to break
    /// ties between nodes that become available at the same topological
    /// level, and (together with `class`) to pick which side of a cycle to
    /// break.
    pub construction_order: u64,
}

/// An edge `dependent -> must_precede`: `dependent` cannot be inserted until
/// `must_precede` has been. For deletions the caller inverts these before
/// building the graph (§4.3).
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub dependent: EntityHandle,
    pub must_precede: EntityHandle,
}

/// An edge the dependency manager chose to break to resolve a cycle: the FK
/// on `dependent` pointing at `must_precede` is bound to `NULL` in the
/// initial INSERT, and a follow-up UPDATE is required once `must_precede`
/// has a primary key.
#[derive(Debug, Clone, Copy)]
pub struct BrokenEdge {
    pub dependent: EntityHandle,
    pub must_precede: EntityHandle,
}

pub struct FlushOrder {
    pub order: Vec<EntityHandle>,
    pub broken_edges: Vec<BrokenEdge>,
}

/// Computes an insertion (or, with inverted edges, deletion) order for
/// `nodes` given `edges`. Breaks at most one edge per detected cycle,
/// choosing the dependent with the lexicographically smallest class name
/// (ties broken by construction order) as the side that gets its FK nulled.
pub fn order(nodes: Vec<Node>, mut edges: Vec<Edge>) -> Result<FlushOrder> {
    let mut broken_edges = Vec::new();
    let by_handle: HashMap<EntityHandle, Node> =
        nodes.iter().map(|n| (n.handle, n.clone())).collect();

    loop {
        match try_topo_sort(&nodes, &edges) {
            Ok(order) => return Ok(FlushOrder { order, broken_edges }),
            Err(stuck) => {
                let cycle = find_cycle(&stuck, &edges)
                    .ok_or_else(|| OrmError::cycle_break("topological sort stalled but no cycle was found"))?;
                let breaker = pick_cycle_breaker(&cycle, &by_handle)?;
                let before = edges.len();
                edges.retain(|e| !(e.dependent == breaker.dependent && e.must_precede == breaker.must_precede));
                if edges.len() == before {
                    return Err(OrmError::cycle_break(
                        "could not identify an edge to break in the detected cycle",
                    ));
                }
                broken_edges.push(breaker);
            }
        }
    }
}

/// Attempts a full Kahn's-algorithm topological sort. On success returns the
/// order; on failure returns the handles that remain unprocessed (the cycle
/// participants, plus anything only reachable through them).
fn try_topo_sort(nodes: &[Node], edges: &[Edge]) -> std::result::Result<Vec<EntityHandle>, HashSet<EntityHandle>> {
    let mut in_degree: HashMap<EntityHandle, usize> = nodes.iter().map(|n| (n.handle, 0)).collect();
    let mut forward: HashMap<EntityHandle, Vec<EntityHandle>> = HashMap::new();
    for edge in edges {
        forward.entry(edge.must_precede).or_default().push(edge.dependent);
        *in_degree.entry(edge.dependent).or_insert(0) += 1;
    }

    let construction_order_of: HashMap<EntityHandle, u64> =
        nodes.iter().map(|n| (n.handle, n.construction_order)).collect();

    let mut ready: VecDeque<EntityHandle> = VecDeque::new();
    let mut initial: Vec<EntityHandle> = nodes
        .iter()
        .filter(|n| in_degree.get(&n.handle).copied().unwrap_or(0) == 0)
        .map(|n| n.handle)
        .collect();
    initial.sort_by_key(|h| construction_order_of.get(h).copied().unwrap_or(0));
    ready.extend(initial);

    let mut visited = HashSet::new();
    let mut result = Vec::with_capacity(nodes.len());

    while let Some(handle) = ready.pop_front() {
        if !visited.insert(handle) {
            continue;
        }
        result.push(handle);

        let mut newly_ready = Vec::new();
        if let Some(successors) = forward.get(&handle) {
            for &next in successors {
                if let Some(degree) = in_degree.get_mut(&next) {
                    *degree -= 1;
                    if *degree == 0 {
                        newly_ready.push(next);
                    }
                }
            }
        }
        newly_ready.sort_by_key(|h| construction_order_of.get(h).copied().unwrap_or(0));
        for h in newly_ready {
            ready.push_back(h);
        }
    }

    if result.len() == nodes.len() {
        Ok(result)
    } else {
        let stuck: HashSet<EntityHandle> = nodes
            .iter()
            .map(|n| n.handle)
            .filter(|h| !visited.contains(h))
            .collect();
        Err(stuck)
    }
}

/// DFS cycle search restricted to the handles that stalled the Kahn pass.
fn find_cycle(stuck: &HashSet<EntityHandle>, edges: &[Edge]) -> Option<Vec<EntityHandle>> {
    let mut adjacency: HashMap<EntityHandle, Vec<EntityHandle>> = HashMap::new();
    for edge in edges {
        if stuck.contains(&edge.dependent) && stuck.contains(&edge.must_precede) {
            adjacency.entry(edge.dependent).or_default().push(edge.must_precede);
        }
    }

    let mut visited = HashSet::new();
    let mut rec_stack = Vec::new();

    for &start in stuck {
        if !visited.contains(&start) {
            if let Some(cycle) = dfs_visit(start, &adjacency, &mut visited, &mut rec_stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn dfs_visit(
    node: EntityHandle,
    adjacency: &HashMap<EntityHandle, Vec<EntityHandle>>,
    visited: &mut HashSet<EntityHandle>,
    rec_stack: &mut Vec<EntityHandle>,
) -> Option<Vec<EntityHandle>> {
    visited.insert(node);
    rec_stack.push(node);

    if let Some(deps) = adjacency.get(&node) {
        for &dep in deps {
            if rec_stack.contains(&dep) {
                let start = rec_stack.iter().position(|&h| h == dep).unwrap();
                return Some(rec_stack[start..].to_vec());
            }
            if !visited.contains(&dep) {
                if let Some(cycle) = dfs_visit(dep, adjacency, visited, rec_stack) {
                    return Some(cycle);
                }
            }
        }
    }

    rec_stack.pop();
    None
}

/// Chooses which node in the cycle gets its dependency edge broken: the one
/// with the lexicographically smallest class name, ties broken by
/// construction order (§4.3's determinism requirement).
fn pick_cycle_breaker(cycle: &[EntityHandle], by_handle: &HashMap<EntityHandle, Node>) -> Result<BrokenEdge> {
    let dependent = cycle
        .iter()
        .min_by(|&&a, &&b| {
            let na = &by_handle[&a];
            let nb = &by_handle[&b];
            na.class.cmp(&nb.class).then(na.construction_order.cmp(&nb.construction_order))
        })
        .copied()
        .ok_or_else(|| OrmError::cycle_break("empty cycle reported"))?;

    let index = cycle.iter().position(|&h| h == dependent).unwrap();
    let must_precede = cycle[(index + 1) % cycle.len()];
    Ok(BrokenEdge { dependent, must_precede })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(raw: u64, class: &str) -> Node {
        Node { handle: EntityHandle::new(raw), class: class.to_string(), construction_order: raw }
    }

    #[test]
    fn independent_nodes_preserve_construction_order() {
        let nodes = vec![node(0, "Unit"), node(1, "User")];
        let result = order(nodes, Vec::new()).unwrap();
        assert_eq!(result.order, vec![EntityHandle::new(0), EntityHandle::new(1)]);
        assert!(result.broken_edges.is_empty());
    }

    #[test]
    fn dependent_follows_its_must_precede_target() {
        let unit = node(0, "Unit");
        let user = node(1, "User");
        let edges = vec![Edge { dependent: user.handle, must_precede: unit.handle }];
        let result = order(vec![user, unit], edges).unwrap();
        assert_eq!(result.order, vec![EntityHandle::new(0), EntityHandle::new(1)]);
    }

    #[test]
    fn a_two_node_cycle_is_broken_deterministically() {
        let a = node(0, "A");
        let b = node(1, "B");
        let edges = vec![
            Edge { dependent: a.handle, must_precede: b.handle },
            Edge { dependent: b.handle, must_precede: a.handle },
        ];
        let result = order(vec![a, b], edges).unwrap();
        assert_eq!(result.order.len(), 2);
        assert_eq!(result.broken_edges.len(), 1);
        // "A" sorts before "B" lexicographically, so A's edge is the one broken.
        assert_eq!(result.broken_edges[0].dependent, EntityHandle::new(0));
    }

    #[test]
    fn three_node_cycle_still_resolves() {
        let a = node(0, "A");
        let b = node(1, "B");
        let c = node(2, "C");
        let edges = vec![
            Edge { dependent: a.handle, must_precede: b.handle },
            Edge { dependent: b.handle, must_precede: c.handle },
            Edge { dependent: c.handle, must_precede: a.handle },
        ];
        let result = order(vec![a, b, c], edges).unwrap();
        assert_eq!(result.order.len(), 3);
        assert_eq!(result.broken_edges.len(), 1);
    }
}
