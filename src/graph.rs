//! Bounded "who points to whom" graphs rooted at the objects of one type.
//!
//! Expansion goes inward: the first hop finds every tracked allocation that
//! holds a reference to a seed, the second hop every allocation referencing
//! one of those, and so on until the hop budget runs out.

use std::fmt::{self, Write};

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::{
    memory::HeapMemory,
    reach::{extent, scan_words},
    tracker::LiveTable,
    types::{TypeId, TypeRegistry},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub address: usize,
    pub type_id: TypeId,
    pub type_name: String,
    /// Hop at which the node was discovered; seeds are at level 0.
    pub level: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: usize,
    pub target: usize,
    pub label: String,
    pub level: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl ObjectGraph {
    /// Builds the graph for `target` with at most `ref_limit` seeds and
    /// `ref_level` hops.
    pub fn build<M: HeapMemory + ?Sized>(
        table: &LiveTable,
        registry: &TypeRegistry,
        memory: &M,
        target: TypeId,
        ref_limit: usize,
        ref_level: usize,
    ) -> ObjectGraph {
        let mut graph = ObjectGraph::default();
        let mut known: FxHashMap<usize, usize> = FxHashMap::default();

        let mut seeds: Vec<usize> = table
            .values()
            .filter(|r| r.type_id == target)
            .map(|r| r.address)
            .collect();
        seeds.sort_unstable();
        seeds.truncate(ref_limit);

        let mut current: FxHashSet<usize> = FxHashSet::default();
        for address in seeds {
            graph.add_node(&mut known, registry, address, target, 0);
            current.insert(address);
        }

        // Leaves hold no references, so only non-leaf allocations are sources.
        let mut sources: Vec<_> = table.values().filter(|r| !r.leaf).collect();
        sources.sort_unstable_by_key(|r| r.address);

        let mut seen_edges: FxHashSet<(usize, usize, usize)> = FxHashSet::default();
        for level in 1..=ref_level {
            if current.is_empty() {
                break;
            }
            let mut next = FxHashSet::default();
            for source in sources.iter() {
                let range = match extent(source) {
                    Some(range) => range,
                    None => continue,
                };
                let mut hits = Vec::new();
                scan_words(memory, range, |slot, value| {
                    if current.contains(&value) {
                        hits.push((slot - source.address, value));
                    }
                });
                for (offset, value) in hits {
                    if !seen_edges.insert((source.address, value, offset)) {
                        continue;
                    }
                    graph.edges.push(GraphEdge {
                        source: source.address,
                        target: value,
                        label: registry.field_label(source.type_id, offset),
                        level,
                    });
                    if !known.contains_key(&source.address) {
                        graph.add_node(&mut known, registry, source.address, source.type_id, level);
                        next.insert(source.address);
                    }
                }
            }
            current = next;
        }

        graph
    }

    fn add_node(
        &mut self,
        known: &mut FxHashMap<usize, usize>,
        registry: &TypeRegistry,
        address: usize,
        type_id: TypeId,
        level: usize,
    ) {
        known.insert(address, self.nodes.len());
        self.nodes.push(GraphNode {
            address,
            type_id,
            type_name: registry.name(type_id).to_string(),
            level,
        });
    }

    /// Renders the graph in Graphviz DOT syntax.
    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_dot(&mut out);
        out
    }

    pub fn write_dot<W: Write>(&self, f: &mut W) -> fmt::Result {
        writeln!(f, "digraph objects {{")?;
        for node in self.nodes.iter() {
            writeln!(
                f,
                "  \"{:#x}\" [label=\"{}\\n{:#x}\"];",
                node.address,
                escape(&node.type_name),
                node.address
            )?;
        }
        for edge in self.edges.iter() {
            writeln!(
                f,
                "  \"{:#x}\" -> \"{:#x}\" [label=\"{}\"];",
                edge.source,
                edge.target,
                escape(&edge.label)
            )?;
        }
        writeln!(f, "}}")
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
