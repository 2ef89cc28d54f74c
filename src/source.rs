//! Reader for the text form of a kmem trace, as printed by `trace-cmd report`
//! or read from `/sys/kernel/tracing/trace`.
//!
//! Record lines look like
//!
//! ```text
//!   kworker/0:1-12    [000] d..2.  5325.512361: kmalloc: call_site=ffffffff8150c3a0 ptr=0xffff88003a9f1c00 bytes_req=10 bytes_alloc=16 gfp_flags=GFP_KERNEL
//! ```
//!
//! The irq-flags column is optional. Records must already be in time order
//! across all CPUs; the reader only notices when they are not.

use std::io::{self, BufRead};

use tracepoints::kmem::{EventKind, KmemEvent};

use crate::error::TraceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub line: usize,
    pub task: String,
    pub cpu: u32,
    /// Nanoseconds.
    pub timestamp: u64,
    pub event: KmemEvent,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SourceSummary {
    /// Every record line, kmem or not.
    pub records: u64,
    pub kmem_events: u64,
    pub ignored: u64,
    pub malformed: u64,
    pub out_of_order: u64,
    pub lost_events: bool,
}

enum Line<'a> {
    Skip,
    Lost,
    Record(RawRecord<'a>),
    NoEventName,
    Other,
}

struct RawRecord<'a> {
    task: &'a str,
    cpu: u32,
    timestamp: u64,
    event: &'a str,
    fields: &'a str,
}

fn next_token(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(idx) => (&s[..idx], &s[idx..]),
        None => (s, ""),
    }
}

fn parse_timestamp(ts: &str) -> Option<u64> {
    match ts.split_once('.') {
        Some((secs, frac)) => {
            if frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let secs: u64 = secs.parse().ok()?;
            let frac = &frac[..frac.len().min(9)];
            let nanos: u64 = frac.parse().ok()?;
            let scale = 10u64.pow(9 - frac.len() as u32);
            secs.checked_mul(1_000_000_000)?.checked_add(nanos * scale)
        }
        // raw clock ticks (`trace-cmd report -t` with a counter clock)
        None => ts.parse().ok(),
    }
}

fn parse_line(line: &str) -> Line<'_> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Line::Skip;
    }
    if trimmed.starts_with("CPU") && (trimmed.contains("LOST") || trimmed.contains("DROPPED")) {
        return Line::Lost;
    }
    // trace-cmd report preamble
    if trimmed.starts_with("cpus=") || trimmed.starts_with("version") {
        return Line::Skip;
    }

    match parse_record(trimmed) {
        // `CPU 3 is empty` and similar; KVM vcpu tasks still parse as records
        Line::Other if trimmed.starts_with("CPU") => Line::Skip,
        line => line,
    }
}

fn parse_record(trimmed: &str) -> Line<'_> {
    let Some((head, tail)) = trimmed.split_once(']') else {
        return Line::Other;
    };
    let Some((task, cpu)) = head.rsplit_once('[') else {
        return Line::Other;
    };
    let Ok(cpu) = cpu.trim().parse::<u32>() else {
        return Line::Other;
    };

    // optional irq flags, then `<secs>.<frac>:`
    let mut rest = tail;
    let mut timestamp = None;
    for _ in 0..2 {
        let (token, after) = next_token(rest);
        rest = after;
        if let Some(ts) = token.strip_suffix(':') {
            timestamp = parse_timestamp(ts);
            break;
        }
    }
    let Some(timestamp) = timestamp else {
        return Line::Other;
    };

    let (token, fields) = next_token(rest);
    match token.strip_suffix(':') {
        Some(event) if !event.is_empty() => Line::Record(RawRecord {
            task: task.trim(),
            cpu,
            timestamp,
            event,
            fields: fields.trim(),
        }),
        _ => Line::NoEventName,
    }
}

/// Iterates the kmem events of a trace. Lines of other events are counted
/// and skipped; see [`SourceSummary`].
pub struct TraceReader<B> {
    lines: io::Lines<B>,
    line_no: usize,
    last_timestamp: Option<u64>,
    summary: SourceSummary,
    done: bool,
}

impl<B: BufRead> TraceReader<B> {
    pub fn new(reader: B) -> Self {
        TraceReader {
            lines: reader.lines(),
            line_no: 0,
            last_timestamp: None,
            summary: SourceSummary::default(),
            done: false,
        }
    }

    pub fn summary(&self) -> SourceSummary {
        self.summary
    }

    fn fail(&mut self, err: TraceError) -> Option<Result<TraceRecord, TraceError>> {
        self.done = true;
        Some(Err(err))
    }

    fn check_order(&mut self, timestamp: u64) {
        match self.last_timestamp {
            Some(last) if timestamp < last => {
                if self.summary.out_of_order == 0 {
                    tracing::warn!(
                        line = self.line_no,
                        "trace is not in time order, live allocations may be mismatched"
                    );
                }
                self.summary.out_of_order += 1;
            }
            _ => self.last_timestamp = Some(timestamp),
        }
    }
}

impl<B: BufRead> Iterator for TraceReader<B> {
    type Item = Result<TraceRecord, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let line = match self.lines.next() {
                Some(Ok(line)) => line,
                Some(Err(err)) => return self.fail(err.into()),
                None if self.summary.records == 0 => return self.fail(TraceError::NoRecords),
                None => {
                    self.done = true;
                    break;
                }
            };
            self.line_no += 1;
            let seen_record = self.summary.records > 0;

            let raw = match parse_line(&line) {
                Line::Skip => continue,
                Line::Lost => {
                    if !self.summary.lost_events {
                        tracing::warn!(line = self.line_no, "trace reports lost events");
                    }
                    self.summary.lost_events = true;
                    continue;
                }
                Line::Other if !seen_record => {
                    return self.fail(TraceError::NotATrace { line: self.line_no })
                }
                Line::NoEventName if !seen_record => {
                    return self.fail(TraceError::MissingEventKind { line: self.line_no })
                }
                Line::Other => {
                    // multi-line output such as stack traces
                    tracing::trace!(line = self.line_no, "skipping continuation line");
                    continue;
                }
                Line::NoEventName => {
                    self.summary.records += 1;
                    self.summary.ignored += 1;
                    continue;
                }
                Line::Record(raw) => raw,
            };

            self.summary.records += 1;
            self.check_order(raw.timestamp);

            let Some(kind) = EventKind::from_name(raw.event) else {
                self.summary.ignored += 1;
                continue;
            };

            match KmemEvent::parse(kind, raw.fields) {
                Ok(event) => {
                    self.summary.kmem_events += 1;
                    return Some(Ok(TraceRecord {
                        line: self.line_no,
                        task: raw.task.to_string(),
                        cpu: raw.cpu,
                        timestamp: raw.timestamp,
                        event,
                    }));
                }
                Err(err) => {
                    tracing::warn!(line = self.line_no, "skipping malformed event: {err}");
                    self.summary.malformed += 1;
                }
            }
        }
        None
    }
}
