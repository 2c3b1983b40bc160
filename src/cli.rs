//! # CLI Execution Functions
//!
//! Extracted from `main.rs` to keep the entry point slim: the sieve and
//! stats drivers, with the database wiring, signal handling, and timing
//! that both share. Engine code is synchronous; the single Tokio runtime
//! created here bridges into sqlx at the few persistence points.

use anyhow::Result;
use tracing::info;

use gaphunt::config::Config;
use gaphunt::db::Database;
use gaphunt::records::RecordGaps;
use gaphunt::{estimator, sieve, CancelToken};

/// Run the combined sieve; returns the process exit code.
pub fn run_sieve(config: &Config) -> Result<i32> {
    if config.verbose >= 0 {
        println!(
            "testing m * {}#/{}, m = {} + [0, {})",
            config.p, config.d, config.mstart, config.minc
        );
    }

    if !config.save_unknowns {
        println!("must set --save-unknowns");
        return Ok(1);
    }
    let path = config.unknown_path();
    if path.exists() {
        println!("output file '{}' already exists", path.display());
        return Ok(1);
    }

    let cancel = CancelToken::new();
    cancel.install_signal_handler();

    info!(
        p = config.p,
        d = config.d,
        mstart = config.mstart,
        minc = config.minc,
        method1 = config.method1,
        "sieve starting"
    );

    let outcome = match sieve::run(config, &cancel) {
        Ok(outcome) => outcome,
        Err(e) if cancel.is_cancelled() => {
            // Cancelled before any checkpoint-worthy depth.
            eprintln!("{}", e);
            return Ok(2);
        }
        Err(e) => return Err(e),
    };

    if config.save_unknowns {
        let mut effective = config.clone();
        effective.max_prime = outcome.max_prime;

        let rt = tokio::runtime::Runtime::new()?;
        let db = rt.block_on(Database::connect(&config.search_db))?;
        rt.block_on(db.insert_range_sieve(&effective, outcome.valid_ms as u64, outcome.seconds))?;
    }

    info!(
        valid_ms = outcome.valid_ms,
        seconds = format_args!("{:.2}", outcome.seconds),
        max_prime = outcome.max_prime,
        interrupted = outcome.interrupted,
        "sieve complete"
    );
    Ok(0)
}

/// Run the estimator; returns the process exit code.
pub fn run_stats(config: &Config) -> Result<i32> {
    let rt = tokio::runtime::Runtime::new()?;

    let mut records = RecordGaps::new(config.sieve_length);
    let records_db = rt.block_on(Database::open_records(&config.records_db))?;
    let rows = rt.block_on(records_db.load_record_gaps(&mut records))?;
    info!(rows, "record gaps loaded");

    // Single-m factor-stream mode.
    if config.minc == 1 && config.mstart != 1 {
        estimator::prob_record_vs_plimit(config, &records)?;
        return Ok(0);
    }

    let db = rt.block_on(Database::connect(&config.search_db))?;
    if !config.save_unknowns {
        println!("not saving stats (--save-unknowns=0)");
    } else if rt.block_on(db.is_range_processed(config))? {
        println!("Range already processed!");
        return Ok(1);
    }

    let result = estimator::prime_gap_stats(config, &records)?;

    if config.save_unknowns {
        rt.block_on(db.store_stats(config, &result))?;
    }

    if config.verbose >= 1 {
        let ks = config.k_stats()?;
        let n_log = config.n_log(ks.k_log);
        let record_probs: Vec<f32> = result.m_stats.iter().map(|s| s.prob_record).collect();
        let exact = rt.block_on(db.range_time(config))?;
        estimator::calculate_prp_top_percent(
            config,
            result.m_stats.len(),
            n_log,
            &record_probs,
            exact,
        );
    }

    info!(
        rows = result.m_stats.len(),
        seconds = format_args!("{:.2}", result.seconds),
        "stats complete"
    );
    Ok(0)
}
