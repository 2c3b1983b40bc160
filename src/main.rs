//! # Main — CLI Entry Point
//!
//! Routes the two subcommands to the engines and keeps shared concerns in
//! `cli`: database wiring, the cancellation token, rayon pool sizing.
//!
//! ## Subcommands
//!
//! - `sieve` — run the combined sieve, write the unknown file and the
//!   `range` row.
//! - `stats` — fold the unknown file into per-m probabilities and persist
//!   them (or, with `--minc 1 --mstart m`, replay a factor stream and
//!   report record probability per sieve depth).
//!
//! Exit codes: 0 success, 1 usage error or already-processed range,
//! 2 second cancellation.

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use gaphunt::config::Config;

#[derive(Parser)]
#[command(name = "gaphunt", about = "Combined sieve and gap statistics for m * P#/d searches")]
struct Cli {
    /// Primorial prime P (K = P#/d)
    #[arg(long)]
    p: u32,

    /// Denominator d, a squarefree divisor of P#
    #[arg(long, default_value_t = 1)]
    d: u64,

    /// First multiplier m
    #[arg(long, default_value_t = 1)]
    mstart: u64,

    /// Number of multipliers to scan
    #[arg(long)]
    minc: u64,

    /// Half-length of the scan interval [-SL, +SL]
    #[arg(long)]
    sieve_length: u32,

    /// Sieve primes up to this bound
    #[arg(long)]
    max_prime: u64,

    /// Merit threshold for "interesting" gaps
    #[arg(long, default_value_t = 18.0)]
    min_merit: f64,

    /// Write the unknown file and database rows (0 disables)
    #[arg(long, default_value_t = 1)]
    save_unknowns: u8,

    /// Run-length encode the unknown file (smaller, not plain text)
    #[arg(long)]
    rle: bool,

    /// Verbosity: 0 quiet, 1 progress, 2 stats breakdowns, 3 everything
    #[arg(long, default_value_t = 1)]
    verbose: i32,

    /// Search database (range / range_stats / m_stats)
    #[arg(long, env = "GAPHUNT_SEARCH_DB", default_value = "prime-gap-search.db")]
    search_db: PathBuf,

    /// Known record gaps database (gaps table)
    #[arg(long, env = "GAPHUNT_RECORDS_DB", default_value = "gaps.db")]
    records_db: PathBuf,

    /// Use the per-m large-prime queue engine instead of the batched one
    #[arg(long)]
    method1: bool,

    /// Flush unknown-file checkpoints at late print boundaries
    #[arg(long)]
    save_increments: bool,

    /// Recompute every crossoff with big-integer math (slow, debugging)
    #[arg(long)]
    validate_factors: bool,

    /// Rayon worker threads (defaults to all logical cores)
    #[arg(long)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sieve the range and write the unknown file
    Sieve,
    /// Estimate per-m record probabilities from the unknown file
    Stats,
}

impl Cli {
    fn to_config(&self) -> Config {
        Config {
            p: self.p,
            d: self.d,
            mstart: self.mstart,
            minc: self.minc,
            sieve_length: self.sieve_length,
            max_prime: self.max_prime,
            min_merit: self.min_merit,
            save_unknowns: self.save_unknowns != 0,
            rle: self.rle,
            method1: self.method1,
            save_increments: self.save_increments,
            validate_factors: self.validate_factors,
            verbose: self.verbose,
            search_db: self.search_db.clone(),
            records_db: self.records_db.clone(),
            threads: self.threads.unwrap_or(0),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();
    let config = args.to_config();

    if let Err(e) = config.validate() {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    if config.threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .build_global()?;
    }

    let code = match args.command {
        Commands::Sieve => cli::run_sieve(&config)?,
        Commands::Stats => cli::run_stats(&config)?,
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
