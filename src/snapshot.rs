//! Serializable heap reports for viewing outside the profiled process.

use std::{
    collections::BTreeMap,
    fmt,
    fmt::{Display, Formatter},
    fs,
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicUsize, Ordering},
};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::Result,
    memory::HeapMemory,
    report::{
        allocation_sites, format_retained, format_sites, format_type_counts, retained_by_type,
        sort_sites, type_counts, Reporter, RetainedRow, SiteRow, TypeCountRow,
    },
    stack::{StackCapturer, StackKey},
    symbolize::{SymbolCache, Symbolizer},
    world::{CollectorControl, MutatorPauser},
};

static DUMP_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Type, retained-size and allocation-site tables with every stack frame
/// already symbolized.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct HeapSnapshot {
    /// Where the snapshot was requested from.
    #[serde(default)]
    pub origin: StackKey,
    pub types: Vec<TypeCountRow>,
    pub retained: Vec<RetainedRow>,
    pub sites: Vec<SiteRow>,
    pub symbols: BTreeMap<usize, String>,
}

impl Display for HeapSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.fmt_with_threshold(0, f)
    }
}

impl HeapSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures all tables in one stopped-world window and resolves the
    /// frames of every allocation site.
    pub fn capture<S, H, M, Y>(reporter: &Reporter<'_, S, H, M>, symbolizer: &Y) -> Self
    where
        S: StackCapturer,
        H: MutatorPauser + CollectorControl + ?Sized,
        M: HeapMemory + ?Sized,
        Y: Symbolizer + ?Sized,
    {
        let origin = reporter.tracker().capture_stack();
        let mut snapshot = HeapSnapshot::collect(reporter);
        snapshot.origin = origin;
        snapshot.resolve_symbols(symbolizer);
        snapshot
    }

    /// Builds all tables in one stopped-world window.  The origin and the
    /// symbol table are left empty.
    pub fn collect<S, H, M>(reporter: &Reporter<'_, S, H, M>) -> Self
    where
        S: StackCapturer,
        H: MutatorPauser + CollectorControl + ?Sized,
        M: HeapMemory + ?Sized,
    {
        let memory = reporter.memory();
        reporter.with_stopped_world(|table, registry| HeapSnapshot {
            origin: StackKey::default(),
            types: type_counts(registry),
            retained: retained_by_type(table, registry, memory),
            sites: allocation_sites(table, 0),
            symbols: BTreeMap::new(),
        })
    }

    /// Decodes every frame of the origin and of each allocation site that
    /// is not in the symbol table yet.
    pub fn resolve_symbols<Y: Symbolizer + ?Sized>(&mut self, symbolizer: &Y) {
        let mut cache = SymbolCache::from_symbols(std::mem::take(&mut self.symbols));
        let stacks = std::iter::once(&self.origin).chain(self.sites.iter().map(|row| &row.stack));
        for stack in stacks {
            for ip in stack.frames() {
                cache.resolve(symbolizer, ip);
            }
        }
        self.symbols = cache.into_symbols();
    }

    /// Writes the snapshot to `<dir>/heap_reach.<pid>/snapshot.<n>.yaml`.
    pub fn dump(&self, dir: &Path) -> Result<PathBuf> {
        let profile_dir = dir.join(format!("heap_reach.{}", process::id()));
        fs::create_dir_all(&profile_dir)?;
        let seq = DUMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = profile_dir.join(format!("snapshot.{}.yaml", seq));
        fs::write(&path, serde_yaml::to_string(self)?)?;
        info!("heap snapshot written to {}", path.display());
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Ok(serde_yaml::from_slice(&bytes)?)
    }

    /// Adds the rows of `other`: type rows by type name, sites by stack key.
    pub fn merge(&mut self, other: &HeapSnapshot) {
        if self.origin.frames().next().is_none() {
            self.origin = other.origin.clone();
        }

        let mut types: BTreeMap<String, TypeCountRow> = self
            .types
            .drain(..)
            .map(|row| (row.name.clone(), row))
            .collect();
        for row in other.types.iter() {
            types
                .entry(row.name.clone())
                .and_modify(|old| old.count += row.count)
                .or_insert_with(|| row.clone());
        }
        self.types = types.into_iter().map(|(_, row)| row).collect();
        self.types
            .sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));

        let mut retained: BTreeMap<String, RetainedRow> = self
            .retained
            .drain(..)
            .map(|row| (row.name.clone(), row))
            .collect();
        for row in other.retained.iter() {
            retained
                .entry(row.name.clone())
                .and_modify(|old| old.bytes = old.bytes.saturating_add(row.bytes))
                .or_insert_with(|| row.clone());
        }
        self.retained = retained.into_iter().map(|(_, row)| row).collect();
        self.retained
            .sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.name.cmp(&b.name)));

        let mut sites: FxHashMap<StackKey, SiteRow> = self
            .sites
            .drain(..)
            .map(|row| (row.stack.clone(), row))
            .collect();
        for row in other.sites.iter() {
            sites
                .entry(row.stack.clone())
                .and_modify(|old| {
                    old.count += row.count;
                    old.bytes = old.bytes.saturating_add(row.bytes);
                })
                .or_insert_with(|| row.clone());
        }
        self.sites = sites.into_iter().map(|(_, row)| row).collect();
        sort_sites(&mut self.sites);

        for (ip, symbol) in other.symbols.iter() {
            self.symbols.entry(*ip).or_insert_with(|| symbol.clone());
        }
    }

    /// Prints all tables, leaving out allocation sites below `min_bytes`.
    pub fn fmt_with_threshold<W: fmt::Write>(&self, min_bytes: usize, f: &mut W) -> fmt::Result {
        let mut cache = SymbolCache::from_symbols(self.symbols.clone());
        if self.origin.frames().next().is_some() {
            writeln!(f, "Snapshot taken at:")?;
            for ip in self.origin.frames() {
                writeln!(f, "    at {}", cache.resolve(&self.symbols, ip))?;
            }
            writeln!(f)?;
        }
        writeln!(f, "Live objects by type:")?;
        format_type_counts(&self.types, f)?;
        writeln!(f, "\nRetained size by type:")?;
        format_retained(&self.retained, f)?;
        writeln!(f, "\nAllocation sites:")?;
        let shown: Vec<SiteRow> = self
            .sites
            .iter()
            .filter(|row| row.bytes >= min_bytes)
            .cloned()
            .collect();
        format_sites(&shown, &mut cache, &self.symbols, f)?;
        let hidden = self.sites.len() - shown.len();
        if hidden > 0 {
            writeln!(f, "{} sites below {}B not shown", hidden, min_bytes)?;
        }
        Ok(())
    }
}
