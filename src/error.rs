use std::io;

use thiserror::Error;

/// Conditions that abort an analysis run before any report is produced.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("failed to read trace: {0}")]
    Io(#[from] io::Error),
    #[error("line {line}: not a kmem trace (expected `task-pid [cpu] timestamp: event: fields`)")]
    NotATrace { line: usize },
    #[error("no records found in trace")]
    NoRecords,
    #[error("line {line}: can't find the event name field")]
    MissingEventKind { line: usize },
    #[error("failed to parse ELF image: {0}")]
    Elf(#[from] goblin::error::Error),
}
