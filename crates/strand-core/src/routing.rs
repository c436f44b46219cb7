//! Link-state routing math.
//!
//! `ConnectionGraph` is the union of every accepted routing update:
//! `node -> neighbor -> cost`, as declared by `node`. Shortest paths are
//! computed with Dijkstra over declared edges only. The resulting table maps
//! each reachable destination to the direct neighbor to forward through.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};

/// Destination node → next-hop neighbor.
pub type RoutingTable = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionGraph {
    edges: BTreeMap<String, BTreeMap<String, f64>>,
}

impl ConnectionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_edge(&mut self, from: &str, to: &str, cost: f64) {
        self.edges
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string(), cost);
    }

    pub fn remove_edge(&mut self, from: &str, to: &str) -> bool {
        self.edges
            .get_mut(from)
            .map(|n| n.remove(to).is_some())
            .unwrap_or(false)
    }

    pub fn edge(&self, from: &str, to: &str) -> Option<f64> {
        self.edges.get(from).and_then(|n| n.get(to)).copied()
    }

    pub fn neighbors(&self, node: &str) -> Option<&BTreeMap<String, f64>> {
        self.edges.get(node)
    }

    pub fn contains(&self, node: &str) -> bool {
        self.edges.contains_key(node)
    }

    /// Replace everything `node` declares with `connections`.
    ///
    /// Also purges the reverse edge `X -> node` for every other node `X`
    /// that `node` no longer lists, except edges owned by `local`, which
    /// only the link layer may change. Returns whether anything changed.
    pub fn replace_node(
        &mut self,
        node: &str,
        connections: BTreeMap<String, f64>,
        local: &str,
    ) -> bool {
        let mut changed = self.edges.get(node) != Some(&connections);
        for (other, neighbors) in self.edges.iter_mut() {
            if other == local || other == node || connections.contains_key(other) {
                continue;
            }
            if neighbors.remove(node).is_some() {
                changed = true;
            }
        }
        self.edges.insert(node.to_string(), connections);
        changed
    }

    /// Full copy of the graph, for status reporting.
    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, f64>> {
        self.edges.clone()
    }

    /// Dijkstra from `source`. Returns total path cost per reachable node
    /// and the predecessor map.
    fn dijkstra(&self, source: &str) -> (HashMap<String, f64>, HashMap<String, String>) {
        let mut dist: HashMap<String, f64> = HashMap::new();
        let mut prev: HashMap<String, String> = HashMap::new();
        let mut heap = BinaryHeap::new();
        let mut seq = 0u64;

        dist.insert(source.to_string(), 0.0);
        heap.push(QueueEntry {
            cost: 0.0,
            seq,
            node: source.to_string(),
        });

        while let Some(QueueEntry { cost, node, .. }) = heap.pop() {
            if dist.get(&node).is_some_and(|d| cost > *d) {
                continue;
            }
            let Some(neighbors) = self.edges.get(&node) else {
                continue;
            };
            for (next, edge_cost) in neighbors {
                if !edge_cost.is_finite() || *edge_cost < 0.0 {
                    continue;
                }
                let alt = cost + edge_cost;
                if dist.get(next).map_or(true, |d| alt < *d) {
                    dist.insert(next.clone(), alt);
                    prev.insert(next.clone(), node.clone());
                    seq += 1;
                    heap.push(QueueEntry {
                        cost: alt,
                        seq,
                        node: next.clone(),
                    });
                }
            }
        }
        (dist, prev)
    }

    /// Shortest-path cost from `source` to every reachable node, `source`
    /// excluded.
    pub fn path_costs(&self, source: &str) -> BTreeMap<String, f64> {
        let (dist, _) = self.dijkstra(source);
        dist.into_iter().filter(|(n, _)| n != source).collect()
    }

    /// Next hop for every reachable destination. Next hops are always
    /// nodes `source` itself declares an edge to.
    pub fn routing_table(&self, source: &str) -> RoutingTable {
        let (_, prev) = self.dijkstra(source);
        let mut table = RoutingTable::new();
        for dest in prev.keys() {
            if dest == source {
                continue;
            }
            let mut hop = dest.as_str();
            loop {
                match prev.get(hop) {
                    Some(p) if p == source => {
                        table.insert(dest.clone(), hop.to_string());
                        break;
                    }
                    Some(p) => hop = p,
                    None => break,
                }
            }
        }
        table
    }
}

/// Min-heap entry: lowest cost first, then earliest insertion.
struct QueueEntry {
    cost: f64,
    seq: u64,
    node: String,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
