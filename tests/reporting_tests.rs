use std::cell::{Cell, RefCell};

use heap_reach::{
    memory::WORD, ByteHeap, CollectorControl, FieldMap, MutatorPauser, ProfilerConfig, Reporter,
    StackCapturer, StackKey, Tracker,
};

#[derive(Default)]
struct SiteStack {
    site: RefCell<Vec<usize>>,
}

impl StackCapturer for SiteStack {
    fn capture(&self, _skip: usize, depth: usize) -> StackKey {
        StackKey::new(&self.site.borrow(), depth)
    }
}

/// Counts stop-the-world windows and checks they never nest or leak.
#[derive(Default)]
struct Host {
    paused: Cell<bool>,
    windows: Cell<usize>,
    collections: Cell<usize>,
}

impl MutatorPauser for Host {
    fn pause(&self) {
        assert!(!self.paused.replace(true));
        self.windows.set(self.windows.get() + 1);
    }
    fn resume(&self) {
        assert!(self.paused.replace(false));
    }
}

impl CollectorControl for Host {
    fn collect(&self) {
        self.collections.set(self.collections.get() + 1);
    }
    fn enable(&self) {}
    fn disable(&self) {}
}

struct Process {
    tracker: Tracker<SiteStack>,
    heap: ByteHeap,
    host: Host,
}

impl Process {
    fn new() -> Self {
        let config = ProfilerConfig {
            stack_depth: 3,
            ..ProfilerConfig::default()
        };
        Process {
            tracker: Tracker::with_capturer(SiteStack::default(), &config),
            heap: ByteHeap::new(),
            host: Host::default(),
        }
    }

    fn at(&self, site: &[usize]) -> &Self {
        *self.tracker.capturer().site.borrow_mut() = site.to_vec();
        self
    }

    fn alloc(&mut self, address: usize, size: usize, leaf: bool) {
        self.heap.map(address, size);
        self.tracker.track(address, size, leaf);
    }

    fn free(&mut self, address: usize) -> Option<bool> {
        self.heap.unmap(address);
        self.tracker.untrack(address)
    }

    fn reporter(&self) -> Reporter<'_, SiteStack, Host, ByteHeap> {
        Reporter::new(&self.tracker, &self.host, &self.heap)
    }
}

#[test]
fn retained_size_follows_frees() {
    let mut p = Process::new();
    p.alloc(0x1000, 48, false);
    p.alloc(0x2000, 16, true);
    p.heap.write_word(0x1000 + WORD, 0x2000);

    assert_eq!(p.reporter().retained_size(0x1000).unwrap(), 64);
    assert_eq!(p.free(0x2000), Some(true));
    assert_eq!(p.reporter().retained_size(0x1000).unwrap(), 48);
    assert_eq!(p.host.windows.get(), 2);
    assert_eq!(p.host.collections.get(), 2);
    assert!(!p.host.paused.get());
}

#[test]
fn linked_list_retains_whole_tail() {
    let mut p = Process::new();
    let mut fields = FieldMap::new();
    fields.insert(0, "next".to_string());
    let nodes = [0x1000, 0x2000, 0x3000, 0x4000];
    for (i, node) in nodes.iter().enumerate() {
        p.tracker.announce_type(1, "ListNode", Some(&fields));
        p.alloc(*node, 2 * WORD, false);
        if i > 0 {
            p.heap.write_word(nodes[i - 1], *node);
        }
    }
    // Close the cycle.
    p.heap.write_word(0x4000, 0x1000);

    let reporter = p.reporter();
    assert_eq!(reporter.retained_size(0x3000).unwrap(), 8 * WORD);
    let retained = reporter.retained_size_by_type();
    assert_eq!(retained.len(), 1);
    assert_eq!(retained[0].bytes, 8 * WORD);
    assert_eq!(retained[0].name, "ListNode");

    let graph = reporter.object_graph(1, 1, 2).unwrap();
    // Seed 0x1000 is referenced by 0x4000, which is referenced by 0x3000.
    let addresses: Vec<_> = graph.nodes.iter().map(|n| n.address).collect();
    assert_eq!(addresses, vec![0x1000, 0x4000, 0x3000]);
    assert!(graph.edges.iter().all(|e| e.label == "next"));
}

#[test]
fn allocation_sites_and_types() {
    let mut p = Process::new();
    p.at(&[0xa1, 0xa2]);
    p.tracker.announce_type(7, "Buffer", None);
    p.alloc(0x1000, 100, true);
    p.tracker.announce_type(7, "Buffer", None);
    p.alloc(0x2000, 200, true);
    p.alloc(0x3000, 300, true);
    p.at(&[0xb1]);
    p.alloc(0x4000, 1000, true);

    let sites = p.reporter().by_allocation_site(150);
    assert_eq!(sites.len(), 2);
    assert_eq!((sites[0].count, sites[0].bytes), (1, 1000));
    assert_eq!(sites[0].stack.entries(), &[0xb1, 0, 0]);
    assert_eq!((sites[1].count, sites[1].bytes), (3, 600));

    let types = p.reporter().by_type();
    assert_eq!(types.len(), 1);
    assert_eq!((types[0].count, types[0].name.as_str()), (2, "Buffer"));

    p.free(0x1000);
    p.free(0x2000);
    assert!(p.reporter().by_type().is_empty());
    assert_eq!(p.free(0x1000), None);
}
