//! Per-function allocation counters.

use ahash::AHashMap;

use crate::syms::FunctionId;

/// Byte counters for one call site.
///
/// `total_*` only ever grow. `current_*` follow allocations and their
/// matching frees and may go negative on a malformed trace; they are not
/// clamped. `max_*` are independent high-water marks of the two current
/// counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FunctionStats {
    pub total_alloc: i64,
    pub total_req: i64,
    pub current_alloc: i64,
    pub current_req: i64,
    pub max_alloc: i64,
    pub max_req: i64,
}

/// Sizes past `i64::MAX` saturate, as do the counters they feed.
fn bytes(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

impl FunctionStats {
    pub fn record_allocate(&mut self, bytes_req: u64, bytes_alloc: u64) {
        let (req, alloc) = (bytes(bytes_req), bytes(bytes_alloc));
        self.total_alloc = self.total_alloc.saturating_add(alloc);
        self.total_req = self.total_req.saturating_add(req);
        self.current_alloc = self.current_alloc.saturating_add(alloc);
        self.current_req = self.current_req.saturating_add(req);
        self.max_alloc = self.max_alloc.max(self.current_alloc);
        self.max_req = self.max_req.max(self.current_req);
    }

    /// `bytes_req`/`bytes_alloc` must be the sizes the ledger stored for the
    /// pointer being freed.
    pub fn record_free(&mut self, bytes_req: u64, bytes_alloc: u64) {
        self.current_alloc = self.current_alloc.saturating_sub(bytes(bytes_alloc));
        self.current_req = self.current_req.saturating_sub(bytes(bytes_req));
    }

    pub fn waste(&self) -> i64 {
        self.current_alloc.saturating_sub(self.current_req)
    }

    /// Difference of the two watermarks, which need not have been reached at
    /// the same moment.
    pub fn max_waste(&self) -> i64 {
        self.max_alloc.saturating_sub(self.max_req)
    }
}

#[derive(Debug, Default)]
pub struct StatsTable {
    funcs: AHashMap<FunctionId, FunctionStats>,
}

impl StatsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, function: FunctionId) -> &mut FunctionStats {
        self.funcs.entry(function).or_default()
    }

    pub fn get(&self, function: FunctionId) -> Option<&FunctionStats> {
        self.funcs.get(&function)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FunctionId, &FunctionStats)> {
        self.funcs.iter().map(|(id, stats)| (*id, stats))
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syms::Interner;

    #[test]
    fn allocate_then_free() {
        let mut stats = FunctionStats::default();
        stats.record_allocate(10, 16);
        stats.record_free(10, 16);

        assert_eq!(stats.current_alloc, 0);
        assert_eq!(stats.current_req, 0);
        assert_eq!(stats.total_alloc, 16);
        assert_eq!(stats.total_req, 10);
        assert_eq!(stats.max_alloc, 16);
        assert_eq!(stats.max_req, 10);
        assert_eq!(stats.waste(), 0);
        assert_eq!(stats.max_waste(), 6);
    }

    #[test]
    fn watermarks_move_independently() {
        let mut stats = FunctionStats::default();
        // alloc-heavy first, then req-heavy after a free
        stats.record_allocate(1, 16);
        stats.record_free(1, 16);
        stats.record_allocate(10, 10);

        assert_eq!(stats.max_alloc, 16);
        assert_eq!(stats.max_req, 10);
        // never simultaneously true, still reported
        assert_eq!(stats.max_waste(), 6);
        assert_eq!(stats.waste(), 0);
    }

    #[test]
    fn free_without_allocate_goes_negative() {
        let mut stats = FunctionStats::default();
        stats.record_free(10, 16);

        assert_eq!(stats.current_alloc, -16);
        assert_eq!(stats.current_req, -10);
        assert_eq!(stats.waste(), -6);
        assert_eq!(stats.max_alloc, 0);
    }

    #[test]
    fn huge_sizes_saturate_instead_of_wrapping() {
        let mut stats = FunctionStats::default();
        stats.record_allocate(1, u64::MAX);

        assert_eq!(stats.total_alloc, i64::MAX);
        assert_eq!(stats.current_alloc, i64::MAX);
        assert_eq!(stats.max_alloc, i64::MAX);

        stats.record_allocate(1, 16);
        assert_eq!(stats.total_alloc, i64::MAX);
        assert_eq!(stats.total_req, 2);
        assert_eq!(stats.waste(), i64::MAX - 2);

        stats.record_free(1, 16);
        assert_eq!(stats.current_alloc, i64::MAX - 16);
        assert_eq!(stats.max_alloc, i64::MAX);
    }

    #[test]
    fn table_creates_zeroed_entries() {
        let mut interner = Interner::new();
        let f = interner.intern("kmalloc_trace");
        let mut table = StatsTable::new();

        assert!(table.get(f).is_none());
        assert_eq!(*table.get_or_create(f), FunctionStats::default());
        table.get_or_create(f).record_allocate(8, 8);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(f).unwrap().total_alloc, 8);
    }
}
