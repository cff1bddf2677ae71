//! Command-line driver: runs a concurrent B+ tree workload over page memory
//! and reports page memory, reuse list and tree statistics.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use pagegrid::primitives::concurrency::CheckpointLock;
use pagegrid::primitives::pager::{
    FilePageStore, MemoryPageStore, PageMemory, PageMemoryStats, PageStore,
};
use pagegrid::storage::btree::{BPlusTree, BTreeStatsSnapshot, TreeShape};
use pagegrid::storage::reuse::ReuseList;
use pagegrid::{GridConfig, GroupId};

#[derive(Parser, Debug)]
#[command(
    name = "pagegrid",
    version,
    about = "Drive and inspect the pagegrid page storage core",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, global = true, value_name = "FILE", help = "TOML configuration file")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for reports"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Overrides {
    #[arg(long, global = true, help = "Directory for page files (default: keep pages in memory)")]
    store_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Override page size (bytes)")]
    page_size: Option<u32>,

    #[arg(long, global = true, help = "Override the number of page memory segments")]
    segments: Option<usize>,

    #[arg(long, global = true, help = "Override page slots per segment")]
    pages_per_segment: Option<usize>,

    #[arg(long, global = true, help = "Override the B+ tree node capacity")]
    max_items: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run concurrent put/get/remove traffic against a fresh tree.
    Workload(WorkloadCmd),
    /// Print the effective configuration as TOML.
    Config,
}

#[derive(Args, Debug)]
struct WorkloadCmd {
    #[arg(long, default_value_t = 4, help = "Worker threads")]
    threads: usize,

    #[arg(long, default_value_t = 50_000, help = "Operations per thread")]
    ops: u64,

    #[arg(long, default_value_t = 100_000, help = "Keys are drawn from 0..key_space")]
    key_space: u64,

    #[arg(long, default_value_t = 0.2, help = "Share of operations that remove")]
    remove_ratio: f64,

    #[arg(long, default_value_t = 0.4, help = "Share of operations that read")]
    read_ratio: f64,

    #[arg(long, default_value_t = 0x5eed, help = "Base RNG seed")]
    seed: u64,

    #[arg(long, help = "Run a checkpoint once the workload finishes")]
    checkpoint: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Default, Serialize)]
struct WorkerTotals {
    puts: u64,
    gets: u64,
    hits: u64,
    removes: u64,
}

#[derive(Debug, Serialize)]
struct WorkloadReport {
    threads: usize,
    operations: u64,
    elapsed_ms: f64,
    ops_per_sec: f64,
    totals: WorkerTotals,
    checkpointed_pages: Option<usize>,
    reuse_pages: usize,
    shape: TreeShape,
    pager: PageMemoryStats,
    btree: BTreeStatsSnapshot,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = build_config(&cli)?;
    match &cli.command {
        Command::Config => {
            print!("{}", config.to_toml_string()?);
        }
        Command::Workload(cmd) => {
            let report = run_workload(&config, cmd)?;
            emit(&cli.format, &report, |_| print_workload_text(&report))?;
        }
    }
    Ok(())
}

fn build_config(cli: &Cli) -> Result<GridConfig, Box<dyn Error>> {
    let mut config = match &cli.config {
        Some(path) => GridConfig::load(path)?,
        None => GridConfig::default(),
    };
    let overrides = &cli.overrides;
    if let Some(dir) = &overrides.store_dir {
        config.store_dir = Some(dir.clone());
    }
    if let Some(page_size) = overrides.page_size {
        config.pager.page_size = page_size;
    }
    if let Some(segments) = overrides.segments {
        config.pager.segments = segments;
    }
    if let Some(pages) = overrides.pages_per_segment {
        config.pager.pages_per_segment = pages;
    }
    if let Some(max_items) = overrides.max_items {
        config.btree.max_items = max_items;
    }
    config.validate()?;
    Ok(config)
}

fn run_workload(config: &GridConfig, cmd: &WorkloadCmd) -> Result<WorkloadReport, Box<dyn Error>> {
    if cmd.threads == 0 || cmd.key_space == 0 {
        return Err("threads and key space must be non-zero".into());
    }
    let store: Arc<dyn PageStore> = match &config.store_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            Arc::new(FilePageStore::open(dir, config.pager.page_size)?)
        }
        None => Arc::new(MemoryPageStore::new()),
    };
    let memory = Arc::new(PageMemory::new(
        config.pager.clone(),
        store,
        Arc::new(CheckpointLock::new()),
    )?);
    memory.start()?;
    let reuse = Arc::new(ReuseList::create(
        memory.clone(),
        GroupId(1),
        config.reuse.clone(),
    )?);
    let tree = Arc::new(BPlusTree::<u64, u64>::create(
        memory.clone(),
        reuse.clone(),
        config.btree.clone(),
    )?);

    let started = Instant::now();
    let workers: Vec<_> = (0..cmd.threads)
        .map(|idx| {
            let tree = tree.clone();
            let seed = cmd.seed.wrapping_add(idx as u64);
            let (ops, key_space) = (cmd.ops, cmd.key_space);
            let (remove_ratio, read_ratio) = (cmd.remove_ratio, cmd.read_ratio);
            thread::spawn(move || -> pagegrid::Result<WorkerTotals> {
                let mut rng = StdRng::seed_from_u64(seed);
                let mut totals = WorkerTotals::default();
                for _ in 0..ops {
                    let key = rng.gen_range(0..key_space);
                    let roll: f64 = rng.gen();
                    if roll < remove_ratio {
                        tree.remove(&key)?;
                        totals.removes += 1;
                    } else if roll < remove_ratio + read_ratio {
                        if tree.get(&key)?.is_some() {
                            totals.hits += 1;
                        }
                        totals.gets += 1;
                    } else {
                        tree.put(&key, &rng.gen())?;
                        totals.puts += 1;
                    }
                }
                Ok(totals)
            })
        })
        .collect();

    let mut totals = WorkerTotals::default();
    for worker in workers {
        let part = worker.join().map_err(|_| "worker thread panicked")??;
        totals.puts += part.puts;
        totals.gets += part.gets;
        totals.hits += part.hits;
        totals.removes += part.removes;
    }
    let elapsed = started.elapsed();
    let operations = cmd.ops * cmd.threads as u64;
    let checkpointed_pages = if cmd.checkpoint {
        Some(memory.checkpoint()?)
    } else {
        None
    };
    tree.emit_stats();
    memory.emit_tracing();
    let secs = elapsed.as_secs_f64();

    Ok(WorkloadReport {
        threads: cmd.threads,
        operations,
        elapsed_ms: secs * 1_000.0,
        ops_per_sec: if secs > 0.0 { operations as f64 / secs } else { 0.0 },
        totals,
        checkpointed_pages,
        reuse_pages: reuse.len(),
        shape: tree.verify()?,
        pager: memory.stats(),
        btree: tree.stats_snapshot(),
    })
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(OutputFormat),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(OutputFormat::Text),
    }
    Ok(())
}

fn print_workload_text(report: &WorkloadReport) {
    println!(
        "Workload: threads={} ops={} elapsed={:.2} ms throughput={:.0} ops/s",
        report.threads, report.operations, report.elapsed_ms, report.ops_per_sec
    );
    println!(
        "  puts={} gets={} hits={} removes={}",
        report.totals.puts, report.totals.gets, report.totals.hits, report.totals.removes
    );
    println!();
    println!(
        "Tree: entries={} height={} leaves={} inner={}",
        report.shape.entries, report.shape.height, report.shape.leaves, report.shape.inner_nodes
    );
    let b = &report.btree;
    println!(
        "  descents={} restarts={} latched_fallbacks={} reseeks={}",
        b.descents, b.optimistic_restarts, b.latched_fallbacks, b.cursor_reseeks
    );
    println!(
        "  leaf_splits={} inner_splits={} root_splits={} leaf_merges={} inner_merges={} borrows={} collapses={}",
        b.leaf_splits,
        b.inner_splits,
        b.root_splits,
        b.leaf_merges,
        b.inner_merges,
        b.borrows,
        b.root_collapses
    );
    println!();
    let p = &report.pager;
    println!(
        "Pager: hits={} misses={} allocations={} evictions={} dirty_writebacks={} writeback_failures={}",
        p.hits, p.misses, p.allocations, p.evictions, p.dirty_writebacks, p.writeback_failures
    );
    println!(
        "  loaded_pages={} reuse_pages={} checkpointed_pages={}",
        p.loaded_pages,
        report.reuse_pages,
        report
            .checkpointed_pages
            .map_or_else(|| "-".to_string(), |n| n.to_string())
    );
}
