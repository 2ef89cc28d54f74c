use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, IsTerminal, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use kmem_waste::{analyze, NoSymbols, SymbolTable};

const DEFAULT_INPUT_FILE: &str = "trace.txt";

/// Show slab allocation waste per call site from a kmem trace
///
/// The trace is the text output of `trace-cmd report` (or a copy of
/// /sys/kernel/tracing/trace) with the kmem events enabled.
#[derive(Debug, Parser)]
#[clap(author, version, about)]
struct Args {
    /// Trace to read, `-` for stdin
    #[clap(short, long, value_name = "FILE")]
    input: Option<PathBuf>,
    /// Same as --input
    #[clap(value_name = "FILE", conflicts_with = "input")]
    file: Option<PathBuf>,
    /// Symbolize raw call site addresses with a copy of /proc/kallsyms
    #[clap(short, long, value_name = "FILE")]
    kallsyms: Option<PathBuf>,
    /// Symbolize raw call site addresses with a vmlinux image
    #[clap(long, value_name = "FILE", conflicts_with = "kallsyms")]
    vmlinux: Option<PathBuf>,
    /// Never color the report
    #[clap(long)]
    no_color: bool,
    /// More logging on stderr, repeat for more
    #[clap(short, long, parse(from_occurrences))]
    verbose: u8,
}

fn open_input(path: &Path) -> Result<Box<dyn BufRead>> {
    if path == Path::new("-") {
        return Ok(Box::new(io::stdin().lock()));
    }
    let file = File::open(path).with_context(|| format!("can't open {}", path.display()))?;
    Ok(Box::new(BufReader::new(file)))
}

fn load_symbols(args: &Args) -> Result<Option<SymbolTable>> {
    let table = if let Some(path) = &args.kallsyms {
        let file = File::open(path).with_context(|| format!("can't open {}", path.display()))?;
        SymbolTable::from_kallsyms(BufReader::new(file))
            .with_context(|| format!("failed to load symbols from {}", path.display()))?
    } else if let Some(path) = &args.vmlinux {
        let data = std::fs::read(path).with_context(|| format!("can't read {}", path.display()))?;
        SymbolTable::from_elf(&data)
            .with_context(|| format!("failed to load symbols from {}", path.display()))?
    } else {
        return Ok(None);
    };
    tracing::info!("loaded {} symbols", table.len());
    Ok(Some(table))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let path = args
        .input
        .clone()
        .or_else(|| args.file.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_INPUT_FILE));
    let input = open_input(&path)?;
    let symbols = load_symbols(&args)?;

    let report = match &symbols {
        Some(table) => analyze(input, table),
        None => analyze(input, NoSymbols),
    }
    .with_context(|| format!("failed to analyze {}", path.display()))?;

    let stdout = io::stdout();
    let color = !args.no_color && stdout.is_terminal();
    let mut out = BufWriter::new(stdout.lock());
    report.render(&mut out, color)?;
    out.flush()?;
    Ok(())
}
