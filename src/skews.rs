// Pairwise clock-offset graph
// Each edge records the fixed offset between two nodes' wall clocks,
// inferred from coincident observations of the same drone.

use tracing::debug;

pub type NodeId = i32;

/// One inferred offset between a pair of node clocks.
///
/// Canonical direction is low to high: `delta = time_at_high - time_at_low`
/// at a coincident event. Unique per `(low, high)` and immutable once
/// inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkewEdge {
    pub low: NodeId,
    pub high: NodeId,
    pub delta: i64,
}

/// Undirected labeled graph of pairwise clock skews.
///
/// Small by construction (tens of nodes), so lookups walk the edge list
/// directly in insertion order with no adjacency index.
#[derive(Debug, Default)]
pub struct SkewGraph {
    edges: Vec<SkewEdge>,
}

impl SkewGraph {
    pub fn new() -> Self {
        SkewGraph { edges: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn edges(&self) -> &[SkewEdge] {
        &self.edges
    }

    /// Record the offset between two nodes' clocks, where `delta` is
    /// `time_at_b - time_at_a` at a coincident event.
    ///
    /// Returns true if a new edge was inserted. A later observation of the
    /// same pair must agree with the stored delta; disagreement means the
    /// coincidence predicate matched two unrelated events, which is a logic
    /// error, and panics.
    pub fn record(&mut self, a: NodeId, b: NodeId, delta: i64) -> bool {
        assert_ne!(a, b, "skew edge endpoints must differ");
        let (low, high, delta) = if a < b { (a, b, delta) } else { (b, a, -delta) };

        if let Some(existing) = self.edges.iter().find(|e| e.low == low && e.high == high) {
            assert_eq!(
                existing.delta, delta,
                "inconsistent skew for pair ({}, {}): stored {}, observed {}",
                low, high, existing.delta, delta
            );
            return false;
        }

        debug!(low, high, delta, "recorded skew edge");
        self.edges.push(SkewEdge { low, high, delta });
        true
    }

    /// Offset to add to a timestamp taken on clock `from` to obtain the
    /// equivalent timestamp on clock `to`. None when no path exists within
    /// the depth budget (the current edge count).
    pub fn lookup(&self, from: NodeId, to: NodeId) -> Option<i64> {
        if from == to {
            return Some(0);
        }
        let mut visited = vec![from];
        self.search(from, to, self.edges.len(), &mut visited)
    }

    /// Depth-bounded DFS with backtracking. Traversing an edge in canonical
    /// direction adds +delta, against it -delta. The visited stack keeps
    /// the walk on simple paths; the depth budget caps recursion even so.
    fn search(&self, node: NodeId, target: NodeId, depth: usize, visited: &mut Vec<NodeId>) -> Option<i64> {
        if depth == 0 {
            return None;
        }

        // Direct edge first
        for edge in &self.edges {
            if edge.low == node && edge.high == target {
                return Some(edge.delta);
            }
            if edge.high == node && edge.low == target {
                return Some(-edge.delta);
            }
        }

        // Recurse through every unvisited neighbor, backtracking on dead ends
        for edge in &self.edges {
            let (next, step) = if edge.low == node {
                (edge.high, edge.delta)
            } else if edge.high == node {
                (edge.low, -edge.delta)
            } else {
                continue;
            };
            if visited.contains(&next) {
                continue;
            }
            visited.push(next);
            let result = self.search(next, target, depth - 1, visited);
            visited.pop();
            if let Some(rest) = result {
                return Some(step + rest);
            }
        }

        None
    }
}
