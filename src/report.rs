use std::io::{self, Write};

use owo_colors::OwoColorize;

use crate::source::SourceSummary;
use crate::stats::FunctionStats;

const HEADER: &str = "                Function            \t\
Waste\tAlloc\treq\t\tTotAlloc     TotReq\t\tMaxAlloc     MaxReq\t\
MaxWaste";
const RULE: &str = "                --------            \t\
-----\t-----\t---\t\t--------     ------\t\t--------     ------\t\
--------";

/// One finalized line of the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    pub function: String,
    pub waste: i64,
    pub current_alloc: i64,
    pub current_req: i64,
    pub total_alloc: i64,
    pub total_req: i64,
    pub max_alloc: i64,
    pub max_req: i64,
    pub max_waste: i64,
}

impl ReportRow {
    pub fn new(function: &str, stats: &FunctionStats) -> Self {
        ReportRow {
            function: function.to_string(),
            waste: stats.waste(),
            current_alloc: stats.current_alloc,
            current_req: stats.current_req,
            total_alloc: stats.total_alloc,
            total_req: stats.total_req,
            max_alloc: stats.max_alloc,
            max_req: stats.max_req,
            max_waste: stats.max_waste(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Report {
    rows: Vec<ReportRow>,
    summary: SourceSummary,
}

impl Report {
    /// Orders rows by waste, largest first. Equal waste is ordered by
    /// function name so output is reproducible.
    pub fn new(mut rows: Vec<ReportRow>) -> Self {
        rows.sort_by(|a, b| {
            b.waste
                .cmp(&a.waste)
                .then_with(|| a.function.cmp(&b.function))
        });
        Report {
            rows,
            summary: SourceSummary::default(),
        }
    }

    pub fn with_summary(mut self, summary: SourceSummary) -> Self {
        self.summary = summary;
        self
    }

    pub fn rows(&self) -> &[ReportRow] {
        &self.rows
    }

    pub fn summary(&self) -> SourceSummary {
        self.summary
    }

    pub fn lost_events(&self) -> bool {
        self.summary.lost_events
    }

    pub fn render<W: Write>(&self, out: &mut W, color: bool) -> io::Result<()> {
        if color {
            writeln!(out, "{}", HEADER.bold())?;
        } else {
            writeln!(out, "{HEADER}")?;
        }
        writeln!(out, "{RULE}")?;

        for row in &self.rows {
            writeln!(
                out,
                "{:>32}\t{}\t{}\t{}\t\t{:>8}   {:>8}\t\t{:>8}   {:>8}\t{}",
                row.function,
                row.waste,
                row.current_alloc,
                row.current_req,
                row.total_alloc,
                row.total_req,
                row.max_alloc,
                row.max_req,
                row.max_waste
            )?;
        }

        if self.lost_events() {
            let note = "NOTE: events were lost while recording; figures may be incomplete";
            if color {
                writeln!(out, "{}", note.yellow())?;
            } else {
                writeln!(out, "{note}")?;
            }
        }
        Ok(())
    }
}
