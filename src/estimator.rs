//! # Estimator — Per-m Record Probabilities and Range Aggregates
//!
//! Folds each unknown line against the probability tables into the chance
//! that (prev_prime(m·K), next_prime(m·K)) forms a record gap, a
//! known-missing gap, or a gap above the merit threshold, plus the expected
//! gap on each side. Three contributions are summed per m:
//!
//! 1. **Inside** — both primes among the sieve's unknowns
//!    (`combined_sieve[i+j]` over pairs of ranks).
//! 2. **Extended** — one prime inside, the other past SL
//!    (per-wheel-residue `extended_record_high` tables).
//! 3. **Extended²** — both primes past SL (`extended_extended_record`).
//!
//! Lines are folded in parallel over fixed-size chunks; chunk results merge
//! in ascending-m order so every float accumulates in one canonical order
//! and re-runs are byte-identical.
//!
//! Also here: the range-level aggregates (per-gap probability histograms,
//! top-percent sums), the PRP-ordering sweep that finds where marginal
//! probability per hour drops below average, and the single-m
//! factor-stream path (`--minc 1`) that reports record probability as a
//! function of sieve depth.

use std::time::Instant;

use anyhow::{ensure, Context, Result};
use rayon::prelude::*;
use rug::Integer;
use tracing::warn;

use crate::config::Config;
use crate::prob::{nth_prob_or_zero, setup_probnth, ProbNth, GAMMA};
use crate::records::{RecordGaps, MISSING_GAPS_LOW};
use crate::unknowns::{decode_line, detect_rle, UnknownLine};
use crate::{prp_time_estimate, sieve_time_estimate};

/// One emitted `m_stats` row.
#[derive(Debug, Clone)]
pub struct MStat {
    pub m: u64,
    pub e_prev: f32,
    pub e_next: f32,
    pub prob_seen: f32,
    pub prob_record: f32,
    pub prob_missing: f32,
    pub prob_merit: f32,
    /// Unknown counts (prev, next); for reporting only.
    pub unknowns: (u32, u32),
}

/// Everything one stats run produces.
pub struct GapStatsResult {
    pub m_stats: Vec<MStat>,
    /// Per-gap probabilities averaged over valid m, indexed by gap.
    pub prob_gap_norm: Vec<f32>,
    pub prob_gap_low: Vec<f32>,
    pub prob_gap_high: Vec<f32>,
    pub seconds: f64,
}

/// Per-chunk histogram accumulators, merged in chunk order.
struct Histograms {
    norm: Vec<f32>,
    low: Vec<f32>,
    high: Vec<f32>,
}

impl Histograms {
    fn new(len: usize) -> Self {
        Histograms {
            norm: vec![0.0; len],
            low: vec![0.0; len],
            high: vec![0.0; len],
        }
    }

    fn merge(&mut self, other: &Histograms) {
        for (a, b) in self.norm.iter_mut().zip(&other.norm) {
            *a += b;
        }
        for (a, b) in self.low.iter_mut().zip(&other.low) {
            *a += b;
        }
        for (a, b) in self.high.iter_mut().zip(&other.high) {
            *a += b;
        }
    }
}

/// Read and decode the whole unknown file for this configuration,
/// autodetecting the encoding from the first line.
pub fn read_unknown_file(config: &Config) -> Result<Vec<UnknownLine>> {
    let path = config.unknown_path();
    let bytes =
        std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    let raw_lines: Vec<&[u8]> = bytes
        .split(|&b| b == b'\n')
        .filter(|l| !l.is_empty())
        .collect();
    ensure!(!raw_lines.is_empty(), "{} is empty", path.display());

    let rle = detect_rle(raw_lines[0]);
    let mut lines = Vec::with_capacity(raw_lines.len());
    for (i, raw) in raw_lines.iter().enumerate() {
        let line = decode_line(raw, rle)
            .with_context(|| format!("{} line {}", path.display(), i + 1))?;
        lines.push(line);
    }
    Ok(lines)
}

/// Fold one line into its `m_stats` row, accumulating the gap histograms.
#[allow(clippy::too_many_arguments)]
fn fold_line(
    line: &UnknownLine,
    config: &Config,
    k_log: f64,
    records: &RecordGaps,
    probs: &ProbNth,
    min_record_gap: u32,
    min_gap_min_merit: u32,
    hist: &mut Histograms,
) -> MStat {
    let m = config.mstart + line.mi;
    let low = &line.prev;
    let high = &line.next;
    // Per-m magnitude, slightly different from the range-level N_log.
    let log_start_prime = k_log + (m as f64).ln();

    let prob_prev_greater = nth_prob_or_zero(&probs.great_nth_sieve, low.len()) as f64;
    let prob_next_greater = nth_prob_or_zero(&probs.great_nth_sieve, high.len()) as f64;
    let prob_extended = probs.prob_greater_extended as f64;

    let prob_seen =
        (1.0 - prob_prev_greater * prob_extended) * (1.0 - prob_next_greater * prob_extended);

    let mut prob_record = 0.0f64;
    let mut prob_missing = 0.0f64;
    let mut prob_merit = 0.0f64;

    // Inside-sieve contribution (both primes ≤ SL).
    {
        let min_interesting_gap = min_gap_min_merit.min(min_record_gap);
        let max_i = low.len().min(probs.combined_sieve.len());
        let mut min_j = high.len();
        for (i, &gap_low) in low.iter().enumerate().take(max_i) {
            while min_j > 0 && gap_low + high[min_j - 1] >= min_interesting_gap {
                min_j -= 1;
            }
            let max_j = high.len().min(probs.combined_sieve.len() - i);

            // Starting at min_j skips some histogram mass but is a sizeable
            // speedup for very long intervals.
            let j0 = if config.sieve_length >= 100_000 { min_j } else { 0 };
            for (j, &gap_high) in high.iter().enumerate().take(max_j).skip(j0) {
                let gap = gap_low + gap_high;
                let prob_this_gap = probs.combined_sieve[i + j];

                hist.norm[gap as usize] += prob_this_gap;

                if gap >= min_gap_min_merit {
                    prob_merit += prob_this_gap as f64;
                }
                if gap >= min_record_gap && records.beats_record(gap, log_start_prime) {
                    prob_record += prob_this_gap as f64;
                    if records.is_missing(gap) {
                        prob_missing += prob_this_gap as f64;
                    }
                }
            }
        }
    }

    // Extended contribution (one prime inside, one past SL).
    let mut e_prev = 0.0f64;
    let mut e_next = 0.0f64;
    let mut prob_record_extended = 0.0f64;
    {
        let extended_high = probs.extended_high(m);
        let extended_low = probs.extended_low(m);
        let min_side_merit = min_gap_min_merit as i64 - config.sieve_length as i64;

        let max_i = low
            .len()
            .max(high.len())
            .min(probs.prime_nth_sieve.len());
        for i in 0..max_i {
            let prob_i = probs.prime_nth_sieve[i] as f64;

            if i < low.len() {
                let gap_low = low[i];
                let conditional = extended_high[gap_low as usize] as f64;
                debug_assert!((0.0..1.0).contains(&conditional));
                prob_record_extended += prob_i * prob_next_greater * conditional;
                e_prev += gap_low as f64 * prob_i;
                hist.low[gap_low as usize] += prob_i as f32;
                if gap_low as i64 >= min_side_merit {
                    prob_merit += prob_i * prob_next_greater;
                }
            }
            if i < high.len() {
                let gap_high = high[i];
                let conditional = extended_low[gap_high as usize] as f64;
                debug_assert!((0.0..1.0).contains(&conditional));
                prob_record_extended += prob_i * prob_prev_greater * conditional;
                e_next += gap_high as f64 * prob_i;
                hist.high[gap_high as usize] += prob_i as f32;
                if gap_high as i64 >= min_side_merit {
                    prob_merit += prob_i * prob_prev_greater;
                }
            }
        }
    }

    // Extended² contribution (both primes past SL).
    let prob_record_extended2 =
        prob_prev_greater * prob_next_greater * probs.extended_extended(m);

    MStat {
        m,
        e_prev: e_prev as f32,
        e_next: e_next as f32,
        prob_seen: prob_seen as f32,
        prob_record: (prob_record + prob_record_extended + prob_record_extended2) as f32,
        prob_missing: prob_missing as f32,
        prob_merit: prob_merit as f32,
        unknowns: (low.len() as u32, high.len() as u32),
    }
}

/// Fold every line; parallel over fixed chunks, merged in order.
#[allow(clippy::too_many_arguments)]
fn run_gap_file(
    config: &Config,
    k_log: f64,
    records: &RecordGaps,
    probs: &ProbNth,
    min_record_gap: u32,
    min_gap_min_merit: u32,
    lines: &[UnknownLine],
) -> (Vec<MStat>, Histograms) {
    const CHUNK: usize = 256;
    let si = 2 * config.sieve_length as usize + 1;

    let folded: Vec<(Vec<MStat>, Histograms)> = lines
        .par_chunks(CHUNK)
        .map(|chunk| {
            let mut hist = Histograms::new(si);
            let stats = chunk
                .iter()
                .map(|line| {
                    fold_line(
                        line,
                        config,
                        k_log,
                        records,
                        probs,
                        min_record_gap,
                        min_gap_min_merit,
                        &mut hist,
                    )
                })
                .collect();
            (stats, hist)
        })
        .collect();

    let mut m_stats = Vec::with_capacity(lines.len());
    let mut hist = Histograms::new(si);
    for (chunk_stats, chunk_hist) in &folded {
        m_stats.extend(chunk_stats.iter().cloned());
        hist.merge(chunk_hist);
    }

    // Running maxima, printed in m order like the fold were sequential.
    if config.verbose >= 1 {
        let mut max_record = 1e-10f32;
        let mut max_merit = 1e-10f32;
        let mut max_missing = 1e-10f32;
        for (i, s) in m_stats.iter().enumerate() {
            if s.prob_record > max_record {
                max_record = s.prob_record;
                println!(
                    "RECORD :{:<6} line {:<6} unknowns: {:3}, {:3} | e: {:.0}, {:.0}\t| prob record: {:.2e}\t| {:.7}",
                    s.m, i + 1, s.unknowns.0, s.unknowns.1, s.e_prev, s.e_next,
                    s.prob_record, s.prob_seen
                );
            }
            if s.prob_merit > max_merit {
                max_merit = s.prob_merit;
                println!(
                    "MERIT  :{:<6} line {:<6} unknowns: {:3}, {:3} | e: {:.0}, {:.0}\t| merit: {:.4e}\t| {:.7}",
                    s.m, i + 1, s.unknowns.0, s.unknowns.1, s.e_prev, s.e_next,
                    s.prob_merit, s.prob_seen
                );
            }
            if config.verbose >= 2 && s.prob_missing > max_missing {
                max_missing = s.prob_missing;
                println!(
                    "MISSING:{:<6} line {:<6} unknowns: {:3}, {:3} |\t\t\t| missing: {:.4e}\t| {:.7}",
                    s.m, i + 1, s.unknowns.0, s.unknowns.1, s.prob_missing, s.prob_seen
                );
            }
        }
    }

    (m_stats, hist)
}

/// Top-percent summary of a probability vector.
fn prob_stats(name: &str, probs: &[f32], show_sum: bool) {
    let mut sorted = probs.to_vec();
    sorted.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    println!();
    for percent in [1usize, 5, 10, 20, 50, 100] {
        let count = probs.len() * percent / 100;
        if count == 0 {
            continue;
        }
        let sum_prob: f64 = sorted[..count].iter().map(|&p| p as f64).sum();
        print!("\t{:<12}: top {:3}% ({:6})", name, percent, count);
        if show_sum {
            print!(" sum(prob) = {:.2e}", sum_prob);
        }
        println!(" (avg: {:.2e})", sum_prob / count as f64);
        if sorted[count - 1] == 0.0 {
            break;
        }
    }
}

/// The full stats pass: read the unknown file, build tables, fold, report.
/// Persistence is the caller's job (the result carries everything the sink
/// needs).
pub fn prime_gap_stats(config: &Config, records: &RecordGaps) -> Result<GapStatsResult> {
    let sl = config.sieve_length;
    ensure!(sl > 1000, "sieve length {} too small for stats", sl);
    let start = Instant::now();

    let lines = read_unknown_file(config)?;

    let ks = config.k_stats()?;
    let n_log = config.n_log(ks.k_log);
    let min_gap_min_merit = (config.min_merit * n_log).ceil() as u32;
    if config.verbose >= 2 {
        println!(
            "min gap ~= {} (for merit > {:.1})\n",
            min_gap_min_merit, config.min_merit
        );
    }

    let poss_record_gaps = records.possible_record_gaps(n_log);
    ensure!(
        poss_record_gaps.len() >= 2,
        "record table leaves fewer than two possible record gaps"
    );
    let min_record_gap = poss_record_gaps[0];
    if config.verbose >= 1 {
        println!(
            "found {} possible record gaps ({} to {})",
            poss_record_gaps.len(),
            poss_record_gaps.first().unwrap(),
            poss_record_gaps.last().unwrap()
        );
    }
    if min_record_gap > MISSING_GAPS_LOW {
        warn!(
            min_record_gap,
            "smallest possible record gap above the missing-gap window; record probabilities have low confidence"
        );
    }
    if min_record_gap > 3 * sl {
        println!("\n\thard to determine record prob, 3 * sieve_length < min_record_gap\n");
    }

    let probs = setup_probnth(
        config,
        ks.k_log,
        records,
        &poss_record_gaps,
        None,
        config.verbose,
    );

    // Lines must cover exactly the valid m, ascending.
    let valid_mi = config.valid_mi();
    ensure!(
        lines.len() == valid_mi.len(),
        "unknown file has {} lines, expected {} valid m",
        lines.len(),
        valid_mi.len()
    );
    for (line, &mi) in lines.iter().zip(&valid_mi) {
        ensure!(
            line.mi == mi,
            "unknown file out of order: line for mi={} where mi={} expected",
            line.mi,
            mi
        );
    }
    if config.verbose >= 1 {
        println!(
            "\n{} tests M_start({}) + mi({} to {})\n",
            valid_mi.len(),
            config.mstart,
            valid_mi.first().unwrap(),
            valid_mi.last().unwrap()
        );
    }

    let (m_stats, mut hist) = run_gap_file(
        config,
        ks.k_log,
        records,
        &probs,
        min_record_gap,
        min_gap_min_merit,
        &lines,
    );

    // Normalize the per-gap histograms to per-m probabilities.
    let count = valid_mi.len() as f32;
    for h in [&mut hist.norm, &mut hist.low, &mut hist.high] {
        for v in h.iter_mut() {
            *v /= count;
        }
    }

    let seconds = start.elapsed().as_secs_f64();
    if config.verbose >= 0 {
        println!(
            "{} m's processed in {:.2} seconds ({:.2}/sec)",
            m_stats.len(),
            seconds,
            m_stats.len() as f64 / seconds.max(1e-9)
        );
    }

    if config.verbose >= 1 {
        let expected_gap: Vec<f32> = m_stats.iter().map(|s| s.e_prev + s.e_next).collect();
        prob_stats("EXPECTED GAP", &expected_gap, false);

        let record: Vec<f32> = m_stats.iter().map(|s| s.prob_record).collect();
        prob_stats("RECORD", &record, true);

        let avg = |v: &[f32]| v.iter().map(|&x| x as f64).sum::<f64>() / v.len() as f64;
        let missing: Vec<f32> = m_stats.iter().map(|s| s.prob_missing).collect();
        let avg_missing = avg(&missing);
        let avg_record = avg(&record);
        // Missing gaps mostly exceed 3·SL, which is likely to be a record.
        let uncertainty = avg_missing / (avg_missing + avg_record);
        if uncertainty > 1e-5 {
            println!(
                "\tRECORD : avg: {:.2e} | missing: {:.2e} | uncertainty: {:.4}%",
                avg_record,
                avg_missing,
                100.0 * uncertainty
            );
        }

        if config.verbose >= 2 {
            let merit: Vec<f32> = m_stats.iter().map(|s| s.prob_merit).collect();
            if avg(&merit) > 1e-5 {
                prob_stats("MERIT", &merit, true);
            }
            if avg_missing > 1e-5 {
                prob_stats("MISSING", &missing, true);
            }
        }
        println!();
    }

    Ok(GapStatsResult {
        m_stats,
        prob_gap_norm: hist.norm,
        prob_gap_low: hist.low,
        prob_gap_high: hist.high,
        seconds,
    })
}

/// Sum(prob(record)) at different `--prp-top-percent` choices, marking the
/// point where marginal probability per hour drops below the running
/// average. The second sweep models skipping 90% of second sides while
/// retaining 90% of record probability.
pub fn calculate_prp_top_percent(
    config: &Config,
    valid_ms: usize,
    n_log: f64,
    probs_record: &[f32],
    exact_sieve_time: Option<f64>,
) {
    println!();

    let prp_time_est = prp_time_estimate(n_log);
    let prob_prime = 1.0 / n_log - 1.0 / (n_log * n_log);
    let estimated_prp_per_m = 1.0 / (prob_prime * (config.max_prime as f64).ln() * GAMMA.exp());
    let time_per_side = prp_time_est * estimated_prp_per_m;

    let exact = exact_sieve_time.is_some();
    let combined_time = exact_sieve_time.unwrap_or_else(|| {
        // Inflate slightly to cover stats time and startup.
        1.05 * sieve_time_estimate(config.sieve_length, config.max_prime, valid_ms)
    });

    println!(
        "{}ieve time: {:.0} seconds ({:.2} hours)",
        if exact { "S" } else { "Estimated s" },
        combined_time,
        combined_time / 3600.0
    );
    println!(
        "estimated time/m: 2 * ({:.1} PRP/m / {:.1} PRP/s) = {:.2} seconds",
        estimated_prp_per_m,
        1.0 / prp_time_est.max(1e-12),
        2.0 * time_per_side
    );
    println!();

    let mut sorted = probs_record.to_vec();
    sorted.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    let mut print_points = Vec::new();
    for percent in [1usize, 5, 10, 20, 30, 50, 100] {
        let count = sorted.len() * percent / 100;
        if count > 0 {
            print_points.push(count);
        }
    }

    println!("sum(prob(record)) at different --prp-top-percent");
    if !exact {
        println!("\tused estimate for combined_sieve timing");
    }
    println!("\testimate of optimal printed with *\n");

    for side_percent in [100usize, 10] {
        if side_percent != 100 {
            println!(
                "\tassuming {}% of next_prime(...) are skipped",
                100 - side_percent
            );
        }

        let mut sum_prob = 0.0f64;
        let mut time = combined_time;
        let mut max_happened = false;

        for i in 1..=sorted.len() {
            let sides_tested = 1.0 + side_percent as f64 / 100.0;
            let add_t = sides_tested * time_per_side;
            let add_p =
                sorted[i - 1] as f64 * if side_percent == 100 { 1.0 } else { 0.9 };

            time += add_t;
            sum_prob += add_p;

            let avg = sum_prob / time;
            let is_below_avg = (add_p / add_t) < avg || i == sorted.len();
            let first_below = !max_happened && is_below_avg;
            max_happened |= first_below;

            if first_below || print_points.contains(&i) {
                let percent = i as f64 * 100.0 / sorted.len() as f64;
                println!(
                    "\t{:7} {}({:5.1}%) | sum(prob) = {:9.5} / {:.1} hr = {:.6} prob/hour",
                    i,
                    if first_below { '*' } else { ' ' },
                    percent,
                    sum_prob,
                    time / 3600.0,
                    avg * 3600.0
                );
            }
        }
        println!();
    }
}

/// Single-m mode: replay a factor stream `(prime, offset)` and report the
/// record probability the range would have at each sieve depth.
///
/// The input lives where the unknown file would: one `prime, offset` pair
/// per line, primes ascending, each prime dividing `m·K − SL + offset`.
pub fn prob_record_vs_plimit(config: &Config, records: &RecordGaps) -> Result<()> {
    ensure!(config.minc == 1, "factor-stream mode needs --minc 1");
    let sl = config.sieve_length as u64;
    let si = (2 * sl + 1) as usize;
    ensure!(config.sieve_length > 1000, "sieve length too small");

    let path = config.unknown_path();
    let data = std::fs::read_to_string(&path)
        .with_context(|| format!("reading factor stream {}", path.display()))?;

    let ks = config.k_stats()?;
    let n_log = config.n_log(ks.k_log);
    let n = Integer::from(&ks.k * config.mstart);

    let poss_record_gaps = records.possible_record_gaps(n_log);
    ensure!(poss_record_gaps.len() >= 2, "too few possible record gaps");
    if config.verbose >= 1 {
        println!(
            "found {} possible record gaps ({} to {}) (min record merit: {:.3})\n",
            poss_record_gaps.len(),
            poss_record_gaps.first().unwrap(),
            poss_record_gaps.last().unwrap(),
            *poss_record_gaps.first().unwrap() as f64 / n_log
        );
    }
    let min_record_gap = poss_record_gaps[0];

    let mut composite = vec![false; si];

    for (lineno, raw) in data.lines().enumerate() {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let (prime_s, offset_s) = raw
            .split_once(',')
            .with_context(|| format!("line {}: expected 'prime, offset'", lineno + 1))?;
        let prime: u64 = prime_s.trim().parse()?;
        let offset: u64 = offset_s.trim().parse()?;
        ensure!(
            (2..=10_000_000_000_000u64).contains(&prime),
            "line {}: prime {} out of range",
            lineno + 1,
            prime
        );
        ensure!(offset < si as u64, "line {}: offset {} outside interval", lineno + 1, offset);

        // Every claimed factor is validated; a mismatch poisons the curve.
        let value = Integer::from(&n - sl) + offset;
        ensure!(
            value.is_divisible(&Integer::from(prime)),
            "line {}: {} does not divide m·K{:+}",
            lineno + 1,
            prime,
            offset as i64 - sl as i64
        );
        composite[offset as usize] = true;

        if prime < 5_000_000 {
            continue;
        }

        let mut unknown_low = Vec::new();
        let mut unknown_high = Vec::new();
        for x in 1..=sl as usize {
            if !composite[sl as usize - x] {
                unknown_low.push(x as u32);
            }
            if !composite[sl as usize + x] {
                unknown_high.push(x as u32);
            }
        }

        let mut at_depth = config.clone();
        at_depth.max_prime = prime;
        // Nested table rebuild stays quiet regardless of --verbose.
        let probs = setup_probnth(
            &at_depth,
            ks.k_log,
            records,
            &poss_record_gaps,
            Some(config.mstart),
            0,
        );

        let prob_prev_greater =
            nth_prob_or_zero(&probs.great_nth_sieve, unknown_low.len()) as f64;
        let prob_next_greater =
            nth_prob_or_zero(&probs.great_nth_sieve, unknown_high.len()) as f64;

        // Inside contribution, record checks only.
        let mut prob_record = 0.0f64;
        {
            let max_i = unknown_low.len().min(probs.combined_sieve.len());
            let mut min_j = unknown_high.len();
            for (i, &gap_low) in unknown_low.iter().enumerate().take(max_i) {
                while min_j > 0 && gap_low + unknown_high[min_j - 1] >= min_record_gap {
                    min_j -= 1;
                }
                let max_j = unknown_high.len().min(probs.combined_sieve.len() - i);
                for (j, &gap_high) in unknown_high.iter().enumerate().take(max_j).skip(min_j) {
                    let gap = gap_low + gap_high;
                    debug_assert!(gap >= min_record_gap);
                    if records.beats_record(gap, n_log) {
                        prob_record += probs.combined_sieve[i + j] as f64;
                    }
                }
            }
        }

        // Extended and extended² contributions.
        let mut prob_record_extended = 0.0f64;
        {
            let extended_high = probs.extended_high(config.mstart);
            let extended_low = probs.extended_low(config.mstart);
            let max_i = unknown_low
                .len()
                .max(unknown_high.len())
                .min(probs.prime_nth_sieve.len());
            for i in 0..max_i {
                let prob_i = probs.prime_nth_sieve[i] as f64;
                if i < unknown_low.len() {
                    prob_record_extended += prob_i
                        * prob_next_greater
                        * extended_high[unknown_low[i] as usize] as f64;
                }
                if i < unknown_high.len() {
                    prob_record_extended += prob_i
                        * prob_prev_greater
                        * extended_low[unknown_high[i] as usize] as f64;
                }
            }
        }
        let prob_record_extended2 = prob_prev_greater
            * prob_next_greater
            * probs.extended_extended(config.mstart);

        let combined = prob_record + prob_record_extended + prob_record_extended2;
        println!("{}, {:.7}", prime, combined);
    }
    Ok(())
}
