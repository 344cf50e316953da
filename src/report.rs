//! Aggregated views of the live heap.
//!
//! Every report stops the world (collection first, then collector disabled
//! and mutators paused) and suspends tracking for the whole traversal, so
//! it sees one consistent table.

use std::{cmp::Reverse, fmt};

use num_format::{Locale, ToFormattedString};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{Error, Result},
    graph::ObjectGraph,
    memory::HeapMemory,
    reach::Reachability,
    stack::{StackCapturer, StackKey},
    symbolize::{SymbolCache, Symbolizer},
    tracker::{LiveTable, Tracker},
    types::{TypeId, TypeRegistry},
    world::{CollectorControl, MutatorPauser, StoppedWorld},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCountRow {
    pub count: usize,
    pub type_id: TypeId,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetainedRow {
    pub bytes: usize,
    pub type_id: TypeId,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteRow {
    pub count: usize,
    pub bytes: usize,
    pub stack: StackKey,
}

/// Live object count of every type that has live objects, largest first.
pub fn type_counts(registry: &TypeRegistry) -> Vec<TypeCountRow> {
    let mut rows: Vec<_> = registry
        .live_types()
        .into_iter()
        .map(|(type_id, count)| TypeCountRow {
            count,
            type_id,
            name: registry.name(type_id).to_string(),
        })
        .collect();
    rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    rows
}

/// Sorts by descending bytes, then descending count, then stack key.
pub fn sort_sites(rows: &mut Vec<SiteRow>) {
    rows.sort_by(|a, b| {
        b.bytes
            .cmp(&a.bytes)
            .then_with(|| b.count.cmp(&a.count))
            .then_with(|| a.stack.cmp(&b.stack))
    });
}

/// Groups live allocations by stack key.  Groups below `min_bytes` are
/// dropped from the result.
pub fn allocation_sites(table: &LiveTable, min_bytes: usize) -> Vec<SiteRow> {
    let mut groups: FxHashMap<&StackKey, (usize, usize)> = FxHashMap::default();
    for record in table.values() {
        let group = groups.entry(&record.stack).or_insert((0, 0));
        group.0 += 1;
        group.1 = group.1.saturating_add(record.size);
    }
    let mut rows: Vec<_> = groups
        .into_iter()
        .filter(|(_, (_, bytes))| *bytes >= min_bytes)
        .map(|(stack, (count, bytes))| SiteRow {
            count,
            bytes,
            stack: stack.clone(),
        })
        .collect();
    sort_sites(&mut rows);
    rows
}

/// Retained size of every type with live objects, largest first.
pub fn retained_by_type<M: HeapMemory + ?Sized>(
    table: &LiveTable,
    registry: &TypeRegistry,
    memory: &M,
) -> Vec<RetainedRow> {
    let mut rows: Vec<_> = Reachability::new(table, memory)
        .retained_by_type()
        .into_iter()
        .map(|(type_id, bytes)| RetainedRow {
            bytes,
            type_id,
            name: registry.name(type_id).to_string(),
        })
        .collect();
    rows.sort_by_key(|row| (Reverse(row.bytes), row.name.clone()));
    rows
}

pub fn format_type_counts<W: fmt::Write>(rows: &[TypeCountRow], f: &mut W) -> fmt::Result {
    for row in rows {
        writeln!(
            f,
            "{:>12} {}",
            row.count.to_formatted_string(&Locale::en),
            row.name
        )?;
    }
    Ok(())
}

pub fn format_retained<W: fmt::Write>(rows: &[RetainedRow], f: &mut W) -> fmt::Result {
    for row in rows {
        writeln!(
            f,
            "{:>14}B {}",
            row.bytes.to_formatted_string(&Locale::en),
            row.name
        )?;
    }
    Ok(())
}

/// Writes one block per site: totals followed by the symbolized frames.
pub fn format_sites<W, S>(
    rows: &[SiteRow],
    symbols: &mut SymbolCache,
    symbolizer: &S,
    f: &mut W,
) -> fmt::Result
where
    W: fmt::Write,
    S: Symbolizer + ?Sized,
{
    for row in rows {
        writeln!(
            f,
            "{} allocations, {}B",
            row.count.to_formatted_string(&Locale::en),
            row.bytes.to_formatted_string(&Locale::en)
        )?;
        for ip in row.stack.frames() {
            writeln!(f, "    at {}", symbols.resolve(symbolizer, ip))?;
        }
    }
    Ok(())
}

/// Entry point for all heap reports over a tracker.
pub struct Reporter<'a, S, H: ?Sized, M: ?Sized> {
    tracker: &'a Tracker<S>,
    host: &'a H,
    memory: &'a M,
}

impl<'a, S, H, M> Reporter<'a, S, H, M>
where
    S: StackCapturer,
    H: MutatorPauser + CollectorControl + ?Sized,
    M: HeapMemory + ?Sized,
{
    pub fn new(tracker: &'a Tracker<S>, host: &'a H, memory: &'a M) -> Self {
        Reporter {
            tracker,
            host,
            memory,
        }
    }

    pub fn tracker(&self) -> &'a Tracker<S> {
        self.tracker
    }

    pub fn memory(&self) -> &'a M {
        self.memory
    }

    /// Runs `f` over a frozen table.  The collection pass runs before
    /// tracking is suspended so that the frees it causes are recorded.
    pub fn with_stopped_world<R>(&self, f: impl FnOnce(&LiveTable, &TypeRegistry) -> R) -> R {
        let _world = StoppedWorld::enter(self.host, self.host);
        let _suspend = self.tracker.suspend();
        self.tracker.with_table(f)
    }

    pub fn by_type(&self) -> Vec<TypeCountRow> {
        self.with_stopped_world(|_, registry| type_counts(registry))
    }

    pub fn by_allocation_site(&self, min_bytes: usize) -> Vec<SiteRow> {
        self.with_stopped_world(|table, _| {
            let rows = allocation_sites(table, min_bytes);
            debug!(
                "{} live allocations in {} sites at or above {}B",
                table.len(),
                rows.len(),
                min_bytes
            );
            rows
        })
    }

    pub fn retained_size_by_type(&self) -> Vec<RetainedRow> {
        let memory = self.memory;
        self.with_stopped_world(|table, registry| retained_by_type(table, registry, memory))
    }

    pub fn retained_size(&self, address: usize) -> Result<usize> {
        let memory = self.memory;
        self.with_stopped_world(|table, _| {
            Reachability::new(table, memory)
                .retained_size_of(address)
                .ok_or(Error::UntrackedAddress(address))
        })
    }

    pub fn object_graph(
        &self,
        type_id: TypeId,
        ref_limit: usize,
        ref_level: usize,
    ) -> Result<ObjectGraph> {
        let memory = self.memory;
        self.with_stopped_world(|table, registry| {
            if registry.get(type_id).is_none() {
                return Err(Error::UnknownType(type_id));
            }
            let graph = ObjectGraph::build(table, registry, memory, type_id, ref_limit, ref_level);
            debug!(
                "object graph for {}: {} nodes, {} edges",
                registry.name(type_id),
                graph.nodes.len(),
                graph.edges.len()
            );
            Ok(graph)
        })
    }
}
