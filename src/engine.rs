use std::io::BufRead;

use ahash::AHashMap;
use tracepoints::kmem::{CallSite, EventKind, KmemEvent, Payload};

use crate::error::TraceError;
use crate::ledger::Ledger;
use crate::report::{Report, ReportRow};
use crate::source::TraceReader;
use crate::stats::{FunctionStats, StatsTable};
use crate::syms::{print_name, unresolved_name, FunctionId, Interner, Resolver};

/// What an event does to the tables, independent of which of the six
/// tracepoints produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation<'e> {
    Allocate {
        call_site: &'e CallSite,
        ptr: u64,
        bytes_req: u64,
        bytes_alloc: u64,
    },
    Free {
        ptr: u64,
    },
}

impl<'e> Operation<'e> {
    pub fn classify(event: &'e KmemEvent) -> Self {
        match &event.payload {
            Payload::Alloc(alloc) => {
                debug_assert!(!event.kind.is_free());
                Operation::Allocate {
                    call_site: &alloc.call_site,
                    ptr: alloc.ptr,
                    bytes_req: alloc.bytes_req,
                    bytes_alloc: alloc.bytes_alloc,
                }
            }
            Payload::Free(free) => Operation::Free { ptr: free.ptr },
        }
    }
}

/// Per-kind event counts, logged at the end of a run.
#[derive(Debug, Default, Clone)]
pub struct EventCounts {
    counts: AHashMap<EventKind, u64>,
    pub overwritten: u64,
    pub unknown_frees: u64,
}

impl EventCounts {
    pub fn get(&self, kind: EventKind) -> u64 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }
}

/// Owns all state of one analysis run: the live-allocation ledger, the
/// per-function statistics and the symbol interner.
pub struct Tracker<R> {
    resolver: R,
    interner: Interner,
    cache: AHashMap<u64, FunctionId>,
    ledger: Ledger,
    stats: StatsTable,
    counts: EventCounts,
}

impl<R: Resolver> Tracker<R> {
    pub fn new(resolver: R) -> Self {
        Tracker {
            resolver,
            interner: Interner::new(),
            cache: AHashMap::new(),
            ledger: Ledger::new(),
            stats: StatsTable::new(),
            counts: EventCounts::default(),
        }
    }

    pub fn process(&mut self, event: &KmemEvent) {
        *self.counts.counts.entry(event.kind).or_default() += 1;
        match Operation::classify(event) {
            Operation::Allocate {
                call_site,
                ptr,
                bytes_req,
                bytes_alloc,
            } => {
                let function = self.function_id(call_site);
                self.allocate(function, ptr, bytes_req, bytes_alloc);
            }
            Operation::Free { ptr } => self.free(ptr),
        }
    }

    pub fn function_id(&mut self, call_site: &CallSite) -> FunctionId {
        match call_site {
            CallSite::Symbol(name) => self.interner.intern(&print_name(name.as_str())),
            CallSite::Address(addr) => {
                if let Some(id) = self.cache.get(addr) {
                    return *id;
                }
                let name = match self.resolver.function_name(*addr) {
                    Some(name) => print_name(name),
                    None => {
                        tracing::debug!("no symbol for call site {addr:#x}");
                        unresolved_name(*addr)
                    }
                };
                let id = self.interner.intern(&name);
                self.cache.insert(*addr, id);
                id
            }
        }
    }

    pub fn allocate(&mut self, function: FunctionId, ptr: u64, bytes_req: u64, bytes_alloc: u64) {
        self.stats
            .get_or_create(function)
            .record_allocate(bytes_req, bytes_alloc);

        if let Some(previous) = self.ledger.put(ptr, function, bytes_req, bytes_alloc) {
            tracing::trace!(
                "{ptr:#x} allocated again by {} while still live from {}",
                self.interner.name(function),
                self.interner.name(previous.function)
            );
            self.counts.overwritten += 1;
        }
    }

    pub fn free(&mut self, ptr: u64) {
        match self.ledger.take(ptr) {
            Some(live) => self
                .stats
                .get_or_create(live.function)
                .record_free(live.bytes_req, live.bytes_alloc),
            None => self.counts.unknown_frees += 1,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn interner(&self) -> &Interner {
        &self.interner
    }

    pub fn counts(&self) -> &EventCounts {
        &self.counts
    }

    pub fn stats_for(&self, name: &str) -> Option<&FunctionStats> {
        self.stats.get(self.interner.get(name)?)
    }

    pub fn stats(&self) -> &StatsTable {
        &self.stats
    }

    /// Computes waste for every function and returns them worst first.
    pub fn finalize(self) -> Report {
        let rows = self
            .stats
            .iter()
            .map(|(id, stats)| ReportRow::new(self.interner.name(id), stats))
            .collect();
        Report::new(rows)
    }
}

/// Runs one full pass over a rendered trace.
pub fn analyze<B: BufRead, R: Resolver>(input: B, resolver: R) -> Result<Report, TraceError> {
    let mut reader = TraceReader::new(input);
    let mut tracker = Tracker::new(resolver);

    for record in reader.by_ref() {
        tracker.process(&record?.event);
    }

    let summary = reader.summary();
    let counts = tracker.counts();
    tracing::info!(
        records = summary.records,
        kmem_events = summary.kmem_events,
        ignored = summary.ignored,
        malformed = summary.malformed,
        functions = tracker.stats().len(),
        still_live = tracker.ledger().len(),
        "trace processed"
    );
    for kind in EventKind::ALL {
        tracing::debug!("{}: {}", kind.name(), counts.get(kind));
    }
    tracing::debug!(
        overwritten = counts.overwritten,
        unknown_frees = counts.unknown_frees,
        "ledger anomalies"
    );

    Ok(tracker.finalize().with_summary(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syms::{NoSymbols, Symbol, SymbolTable};
    use tracepoints::kmem::{AllocEvent, FreeEvent};

    fn alloc(kind: EventKind, name: &str, ptr: u64, req: u64, alloc: u64) -> KmemEvent {
        KmemEvent {
            kind,
            payload: Payload::Alloc(AllocEvent {
                call_site: CallSite::Symbol(name.to_string()),
                ptr,
                bytes_req: req,
                bytes_alloc: alloc,
                node: kind.is_node_variant().then_some(0),
            }),
        }
    }

    fn free(kind: EventKind, ptr: u64) -> KmemEvent {
        KmemEvent {
            kind,
            payload: Payload::Free(FreeEvent { ptr }),
        }
    }

    #[test]
    fn classifies_all_six_kinds() {
        for kind in [
            EventKind::Kmalloc,
            EventKind::KmallocNode,
            EventKind::KmemCacheAlloc,
            EventKind::KmemCacheAllocNode,
        ] {
            let event = alloc(kind, "f", 1, 2, 3);
            assert!(matches!(
                Operation::classify(&event),
                Operation::Allocate {
                    ptr: 1,
                    bytes_req: 2,
                    bytes_alloc: 3,
                    ..
                }
            ));
        }
        for kind in [EventKind::Kfree, EventKind::KmemCacheFree] {
            assert_eq!(
                Operation::classify(&free(kind, 7)),
                Operation::Free { ptr: 7 }
            );
        }
    }

    #[test]
    fn frees_only_leave_tables_empty() {
        let mut tracker = Tracker::new(NoSymbols);
        tracker.process(&free(EventKind::Kfree, 0x10));
        tracker.process(&free(EventKind::KmemCacheFree, 0x20));

        assert!(tracker.stats().is_empty());
        assert!(tracker.ledger().is_empty());
        assert_eq!(tracker.counts().unknown_frees, 2);
    }

    #[test]
    fn balanced_pair() {
        let mut tracker = Tracker::new(NoSymbols);
        tracker.process(&alloc(EventKind::Kmalloc, "F", 0x100, 10, 16));
        tracker.process(&free(EventKind::Kfree, 0x100));

        let f = *tracker.stats_for("F").unwrap();
        assert_eq!((f.current_alloc, f.current_req), (0, 0));
        assert_eq!((f.total_alloc, f.total_req), (16, 10));
        assert_eq!((f.max_alloc, f.max_req), (16, 10));
        assert_eq!(f.waste(), 0);
        assert_eq!(f.max_waste(), 6);
        assert!(tracker.ledger().is_empty());
    }

    #[test]
    fn double_allocate_overwrites_ledger_entry() {
        let mut tracker = Tracker::new(NoSymbols);
        tracker.process(&alloc(EventKind::Kmalloc, "F", 0x100, 10, 16));
        tracker.process(&alloc(EventKind::Kmalloc, "F", 0x100, 10, 16));

        assert_eq!(tracker.ledger().len(), 1);
        assert_eq!(tracker.counts().overwritten, 1);
        let f = *tracker.stats_for("F").unwrap();
        assert_eq!((f.total_alloc, f.total_req), (32, 20));

        tracker.process(&free(EventKind::Kfree, 0x100));
        let f = *tracker.stats_for("F").unwrap();
        // first allocation stays counted as live
        assert_eq!((f.current_alloc, f.current_req), (16, 10));
        assert!(tracker.ledger().is_empty());
    }

    #[test]
    fn overwrite_moves_pointer_to_new_owner() {
        let mut tracker = Tracker::new(NoSymbols);
        tracker.process(&alloc(EventKind::KmemCacheAlloc, "A", 0x100, 8, 8));
        tracker.process(&alloc(EventKind::KmallocNode, "B", 0x100, 20, 32));
        tracker.process(&free(EventKind::KmemCacheFree, 0x100));

        let a = *tracker.stats_for("A").unwrap();
        let b = *tracker.stats_for("B").unwrap();
        assert_eq!(a.current_alloc, 8);
        assert_eq!((b.current_alloc, b.current_req), (0, 0));
    }

    #[test]
    fn unknown_free_is_a_no_op() {
        let mut tracker = Tracker::new(NoSymbols);
        tracker.process(&alloc(EventKind::Kmalloc, "F", 0x100, 10, 16));
        let before = *tracker.stats_for("F").unwrap();

        tracker.process(&free(EventKind::Kfree, 0x999));

        assert_eq!(*tracker.stats_for("F").unwrap(), before);
        assert_eq!(tracker.ledger().len(), 1);
        assert_eq!(tracker.stats().len(), 1);
    }

    #[test]
    fn addresses_resolve_through_symbols() {
        let table = SymbolTable::from_symbols(vec![
            Symbol {
                name: "alloc_inode".into(),
                address: 0x1000,
                size: 0x100,
            },
            Symbol {
                name: "kmalloc_trace".into(),
                address: 0x2000,
                size: 0,
            },
        ]);
        let mut tracker = Tracker::new(&table);

        let a = tracker.function_id(&CallSite::Address(0x1010));
        let b = tracker.function_id(&CallSite::Address(0x1020));
        let c = tracker.function_id(&CallSite::Symbol("alloc_inode".into()));
        let unresolved = tracker.function_id(&CallSite::Address(0x1800));

        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(tracker.interner().name(unresolved), "0x1800");
        assert_eq!(tracker.interner().len(), 2);
    }

    #[test]
    fn analyze_reports_worst_waste_first() {
        let trace = "\
 a-1 [000] 1.000000: kmalloc: call_site=small+0x1/0x2 ptr=10 bytes_req=60 bytes_alloc=64
 a-1 [000] 1.000001: kmem_cache_alloc: call_site=big+0x1/0x2 ptr=20 bytes_req=100 bytes_alloc=128
 a-1 [000] 1.000002: kfree: ptr=30
";
        let report = analyze(trace.as_bytes(), NoSymbols).unwrap();
        let names: Vec<_> = report.rows().iter().map(|row| row.function.as_str()).collect();
        assert_eq!(names, ["big", "small"]);
        assert_eq!(report.summary().kmem_events, 3);
    }

    #[test]
    fn analyze_propagates_fatal_errors() {
        assert!(matches!(
            analyze("".as_bytes(), NoSymbols),
            Err(TraceError::NoRecords)
        ));
    }
}
