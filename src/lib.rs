//! Slab allocation waste per kernel call site, computed from a recorded
//! `kmem` trace.
//!
//! Every `kmalloc`/`kmem_cache_alloc` (and their `_node` variants) is charged
//! to the function that requested it; the matching `kfree`/`kmem_cache_free`
//! gives the bytes back. The difference between what was granted and what was
//! asked for is the waste reported per function.

pub mod elf;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod report;
pub mod source;
pub mod stats;
pub mod syms;

pub use engine::{analyze, Operation, Tracker};
pub use error::TraceError;
pub use report::{Report, ReportRow};
pub use syms::{NoSymbols, Resolver, SymbolTable};
