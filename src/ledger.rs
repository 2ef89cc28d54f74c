//! Allocations that have been handed out and not yet freed.

use ahash::AHashMap;

use crate::syms::FunctionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveAllocation {
    pub ptr: u64,
    pub function: FunctionId,
    pub bytes_alloc: u64,
    pub bytes_req: u64,
}

#[derive(Debug, Default)]
pub struct Ledger {
    live: AHashMap<u64, LiveAllocation>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `ptr` as live. A pointer that is already live is replaced and
    /// the previous entry returned; its bytes stay counted by its function.
    pub fn put(
        &mut self,
        ptr: u64,
        function: FunctionId,
        bytes_req: u64,
        bytes_alloc: u64,
    ) -> Option<LiveAllocation> {
        self.live.insert(
            ptr,
            LiveAllocation {
                ptr,
                function,
                bytes_alloc,
                bytes_req,
            },
        )
    }

    /// Removes and returns the live entry for `ptr`. `None` for pointers
    /// allocated before the trace window started or already freed.
    pub fn take(&mut self, ptr: u64) -> Option<LiveAllocation> {
        self.live.remove(&ptr)
    }

    pub fn get(&self, ptr: u64) -> Option<&LiveAllocation> {
        self.live.get(&ptr)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syms::Interner;

    #[test]
    fn put_then_take() {
        let mut interner = Interner::new();
        let f = interner.intern("alloc_skb");
        let mut ledger = Ledger::new();

        assert_eq!(ledger.put(0x1000, f, 10, 16), None);
        assert_eq!(ledger.len(), 1);

        let live = ledger.take(0x1000).unwrap();
        assert_eq!(live.function, f);
        assert_eq!((live.bytes_req, live.bytes_alloc), (10, 16));
        assert!(ledger.is_empty());
        assert_eq!(ledger.take(0x1000), None);
    }

    #[test]
    fn put_overwrites_live_pointer() {
        let mut interner = Interner::new();
        let first = interner.intern("first");
        let second = interner.intern("second");
        let mut ledger = Ledger::new();

        ledger.put(0x2000, first, 10, 16);
        let previous = ledger.put(0x2000, second, 30, 32).unwrap();
        assert_eq!(previous.function, first);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.get(0x2000).unwrap().function, second);
        assert_eq!(ledger.get(0x2000).unwrap().bytes_alloc, 32);
    }

    #[test]
    fn take_unknown_is_none() {
        let mut ledger = Ledger::new();
        assert_eq!(ledger.take(0xdead), None);
    }
}
