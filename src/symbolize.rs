//! Address-to-source decoding for human-readable reports.

use std::{collections::BTreeMap, ffi::c_void, path::Path};

use backtrace::SymbolName;

/// Capability decoding an instruction address into a readable frame
/// description.  `None` means the address could not be decoded.
pub trait Symbolizer {
    fn decode(&self, address: usize) -> Option<String>;
}

/// Resolves frames with [`backtrace::resolve`].  Must run inside the
/// profiled process, since it looks at the process's own debug info.
#[derive(Clone, Copy, Debug, Default)]
pub struct BacktraceSymbolizer;

impl Symbolizer for BacktraceSymbolizer {
    fn decode(&self, address: usize) -> Option<String> {
        let mut sym = None;
        backtrace::resolve(address as *mut c_void, |s| {
            if sym.is_some() {
                return;
            }
            sym = Some(format!(
                "{} (in {},{}:{})",
                s.name().unwrap_or_else(|| SymbolName::new(&[])),
                s.filename().unwrap_or_else(|| Path::new("")).display(),
                s.lineno().unwrap_or(0),
                s.colno().unwrap_or(0)
            ));
        });
        sym
    }
}

/// Symbols resolved earlier, e.g. loaded from a dumped snapshot.
impl Symbolizer for BTreeMap<usize, String> {
    fn decode(&self, address: usize) -> Option<String> {
        self.get(&address).cloned()
    }
}

/// Placeholder rendered for frames that cannot be decoded.
pub fn placeholder(address: usize) -> String {
    format!("{:#x} (unknown)", address)
}

/// Decodes each distinct address at most once.
#[derive(Debug, Default)]
pub struct SymbolCache {
    symbols: BTreeMap<usize, String>,
}

impl SymbolCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_symbols(symbols: BTreeMap<usize, String>) -> Self {
        SymbolCache { symbols }
    }

    pub fn resolve<S: Symbolizer + ?Sized>(&mut self, symbolizer: &S, address: usize) -> &str {
        self.symbols
            .entry(address)
            .or_insert_with(|| {
                symbolizer
                    .decode(address)
                    .unwrap_or_else(|| placeholder(address))
            })
            .as_str()
    }

    /// Looks up an address without decoding it.
    pub fn get(&self, address: usize) -> String {
        self.symbols
            .get(&address)
            .cloned()
            .unwrap_or_else(|| placeholder(address))
    }

    pub fn into_symbols(self) -> BTreeMap<usize, String> {
        self.symbols
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Counting {
        calls: Cell<usize>,
    }

    impl Symbolizer for Counting {
        fn decode(&self, address: usize) -> Option<String> {
            self.calls.set(self.calls.get() + 1);
            if address % 2 == 0 {
                Some(format!("fn_{}", address))
            } else {
                None
            }
        }
    }

    #[test]
    fn decodes_once_and_falls_back_to_placeholder() {
        let sym = Counting {
            calls: Cell::new(0),
        };
        let mut cache = SymbolCache::new();
        assert_eq!(cache.resolve(&sym, 4), "fn_4");
        assert_eq!(cache.resolve(&sym, 4), "fn_4");
        assert_eq!(cache.resolve(&sym, 5), "0x5 (unknown)");
        assert_eq!(cache.resolve(&sym, 5), "0x5 (unknown)");
        assert_eq!(sym.calls.get(), 2);
        assert_eq!(cache.get(6), "0x6 (unknown)");
    }
}
