//! # Sieve — Combined Composite Crossoff Engine
//!
//! Produces, for every valid multiplier m in the range, the set of offsets
//! in `[−SL, +SL]` that no prime up to `max_prime` divides. Three bands,
//! increasing in prime size and decreasing in per-m work:
//!
//! - **Phase A** (p ≤ SMALL_THRESHOLD): classic per-m crossoff. Only primes
//!   dividing D (the rest of K's primes are pre-folded by the reindex mask)
//!   and primes above P. Parallel across disjoint slices of the valid-m
//!   list — each slice owns its bitmaps, the prime batch is shared
//!   read-only.
//! - **Phase B** (≤ MEDIUM_THRESHOLD): per-prime batching. Invert K once
//!   per prime, then for every coprime offset step through the arithmetic
//!   progression of m it hits.
//! - **Phase C** (≤ max_prime): per-prime interval hits via the Euclid
//!   modular search; a hit costs O(log p) instead of a scan. Cheap parity
//!   and wheel-prime rejects run before the random-access bitmap write.
//!
//! Progress prints at a geometric cadence (10 000, then 10×-growing
//! multiples); the cancel token is sampled only at those boundaries. On the
//! first cancellation `max_prime` is rounded down to a multiple of 10⁶, the
//! output name re-derived, and the partial (still correct, just shallower)
//! sieve is flushed.
//!
//! The method-1 path (`--method1`) keeps a per-m queue of large primes,
//! re-queueing each prime for the next m it hits. Slower, kept for
//! cross-checking the batched engine.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, ensure, Context, Result};
use rayon::prelude::*;
use rug::Integer;
use tracing::{info, warn};

use crate::config::{Config, KStats};
use crate::modsearch::{modulo_search_euclid_all_large, modulo_search_euclid_gcd};
use crate::primes::{generate_primes, mod_inverse, primepi_estimate, CompositeBits, SegmentedPrimes};
use crate::prob::GAMMA;
use crate::unknowns;
use crate::wheel::Reindex;
use crate::{gcd, prp_time_estimate, CancelToken};

/// Composite-bitmap allocation ceiling; configurations estimating past this
/// are rejected before Phase A.
const MAX_COMPOSITE_BYTES: u64 = 7 * 1024 * 1024 * 1024;

/// Method-1 threshold between per-m small primes and the travelling queue.
const SMALL_PRIME_LIMIT_METHOD1: u64 = 400_000;

/// What one sieve run leaves behind.
pub struct SieveOutcome {
    pub valid_ms: usize,
    pub seconds: f64,
    /// Effective depth: the configured max_prime, or the 10⁶-trimmed value
    /// after a cancellation.
    pub max_prime: u64,
    pub unknown_file: Option<PathBuf>,
    pub interrupted: bool,
}

/// Prime-band split. Phase A's per-m working set stays near the interval
/// size (cache-friendly); Phase B hands off once a prime is expected to hit
/// only a few m in the whole range.
pub fn thresholds(config: &Config) -> (u64, u64) {
    let si = 2 * config.sieve_length as u64 + 1;
    let small = 5 * si;
    let medium = (si * config.minc / 4).clamp(small, config.max_prime);
    (small, medium)
}

/// Largest prime ≤ n (n ≥ 2·10⁴). The trailing window comfortably covers
/// the largest prime gap below 10¹².
fn last_prime_at_most(n: u64) -> Result<u64> {
    let window = 50_000.min(n - 2);
    SegmentedPrimes::new(n - window, n)
        .last()
        .with_context(|| format!("no prime in ({}, {}]", n - window, n))
}

pub fn run(config: &Config, cancel: &CancelToken) -> Result<SieveOutcome> {
    if config.method1 {
        method1(config)
    } else {
        method2(config, cancel)
    }
}

// ── Stats and print cadence ─────────────────────────────────────────

struct SieveStats {
    start: Instant,
    interval_start: Instant,
    next_print: u64,
    next_mult: u64,
    total_unknowns: u64,
    prime_factors: u64,
    small_prime_factors_interval: u64,
    large_prime_factors_interval: u64,
    pi: u64,
    pi_interval: u64,
    m_stops: u64,
    m_stops_interval: u64,
    validated_factors: u64,
    prob_prime: f64,
    current_prob_prime: f64,
}

impl SieveStats {
    fn new(config: &Config, valid_ms: usize, threshold: u64, prob_prime: f64) -> Self {
        SieveStats {
            start: Instant::now(),
            interval_start: Instant::now(),
            next_print: 0,
            next_mult: if threshold <= 100_000 { 10_000 } else { 100_000 },
            total_unknowns: (2 * config.sieve_length as u64 + 1) * valid_ms as u64,
            prime_factors: 0,
            small_prime_factors_interval: 0,
            large_prime_factors_interval: 0,
            pi: 0,
            pi_interval: 0,
            m_stops: 0,
            m_stops_interval: 0,
            validated_factors: 0,
            prob_prime,
            current_prob_prime: prob_prime,
        }
    }

    /// 10 000, …, then 10, 20, …, 50, 100 pattern growing 10× up to 10¹¹;
    /// past 10⁹ the 60–90% marks print too since the intervals get wide.
    fn advance_cadence(&mut self, prime: u64, last_prime: u64) {
        const MAX_MULT: u64 = 100_000_000_000;
        if prime >= self.next_print {
            let all_ten = u64::from(prime > 1_000_000_000);
            let next_next_mult = (5 + 4 * all_ten) * self.next_mult;
            if next_next_mult <= MAX_MULT && self.next_print == next_next_mult {
                self.next_mult *= 10;
                self.next_print = 0;
            }
            self.next_print += self.next_mult;
            self.next_print = self.next_print.min(last_prime);
        }
    }

    /// Fold the interval counters into the totals.
    fn roll_interval(&mut self) {
        self.pi += self.pi_interval;
        self.prime_factors += self.small_prime_factors_interval;
        self.prime_factors += self.large_prime_factors_interval;
        self.m_stops += self.m_stops_interval;
        self.small_prime_factors_interval = 0;
        self.large_prime_factors_interval = 0;
        self.m_stops_interval = 0;
        self.pi_interval = 0;
    }

    /// PRP tests the just-finished interval saved a downstream tester, via
    /// Mertens: unknowns per side shrink like 1/(ln p · e^γ).
    fn skipped_prp(&mut self, prime: u64, valid_ms: usize) -> f64 {
        let after_sieve = self.prob_prime * (prime as f64).ln() * GAMMA.exp();
        let skipped =
            2.0 * valid_ms as f64 * (1.0 / self.current_prob_prime - 1.0 / after_sieve);
        self.current_prob_prime = after_sieve;
        skipped
    }
}

/// Interval boundary print. The expensive unknown recount only runs at
/// higher verbosity or near the end, when the numbers are worth reading.
#[allow(clippy::too_many_arguments)]
fn increment_print(
    prime: u64,
    last_prime: u64,
    valid_ms: usize,
    skipped_prp: f64,
    prp_time_est: f64,
    composite: &[CompositeBits],
    stats: &mut SieveStats,
    config: &Config,
    is_last: bool,
) {
    stats.advance_cadence(prime, last_prime);

    let secs = stats.start.elapsed().as_secs_f64();
    let int_secs = stats.interval_start.elapsed().as_secs_f64();
    let si = 2 * config.sieve_length as u64 + 1;

    if config.verbose + i32::from(is_last) >= 1 {
        println!(
            "{:<12} (primes {}/{})\t(seconds: {:.2}/{:.1} | per m: {:.3})",
            prime,
            stats.pi_interval,
            stats.pi,
            int_secs,
            secs,
            secs / valid_ms as f64
        );
        stats.interval_start = Instant::now();
    }

    if config.verbose + 2 * i32::from(is_last) + i32::from(prime > 1_000_000_000) >= 2 {
        let unknowns: u64 = composite.iter().map(|c| c.count_unmarked() as u64).sum();
        let new_composites = stats.total_unknowns.saturating_sub(unknowns);

        println!(
            "\tfactors  {:<14}\t(interval: {}, avg m/large_prime: {:.1})",
            stats.prime_factors
                + stats.small_prime_factors_interval
                + stats.large_prime_factors_interval,
            stats.small_prime_factors_interval + stats.large_prime_factors_interval,
            stats.m_stops_interval as f64 / stats.pi_interval.max(1) as f64
        );
        println!(
            "\tunknowns {:>10}/{:<6}\t(avg/m: {:.2}) (composite: {:.2}% +{:.3}% +{})",
            unknowns,
            valid_ms,
            unknowns as f64 / valid_ms as f64,
            100.0 - 100.0 * unknowns as f64 / (si * valid_ms as u64) as f64,
            100.0 * new_composites as f64 / (si * valid_ms as u64) as f64,
            new_composites
        );
        println!(
            "\t~ 2x {:.2} PRP/m\t\t(~ {:4.1} skipped PRP => {:.1} PRP/seconds)",
            1.0 / stats.current_prob_prime,
            skipped_prp,
            skipped_prp / int_secs.max(1e-9)
        );
        if stats.validated_factors > 0 {
            println!("\tvalidated {} factors", stats.validated_factors);
        }
        let run_prp_mult = int_secs / (prp_time_est * skipped_prp).max(1e-9);
        if run_prp_mult > 2.0 {
            println!(
                "\t\testimated ~{:.1}x faster to just run PRP now (CTRL+C to stop sieving)",
                run_prp_mult
            );
        }
        println!();

        stats.total_unknowns = unknowns;
        stats.roll_interval();
    }
}

/// Recompute `m·K − SL + x` with big-integer math and assert the claimed
/// factor divides it. A mismatch is an engine bug, never an input error.
fn validate_factor(k: &Integer, m: u64, x: u64, sl: u32, prime: u64) {
    let value = Integer::from(k * m) - sl + x as u32;
    assert!(
        value.is_divisible(&Integer::from(prime)),
        "factor validation failed: {} does not divide m·K{:+}",
        prime,
        x as i64 - sl as i64
    );
}

// ── Method 2: three-band batched engine ─────────────────────────────

fn method2(config: &Config, cancel: &CancelToken) -> Result<SieveOutcome> {
    let ks = config.k_stats()?;
    let sl64 = config.sieve_length as u64;
    let si = 2 * sl64 + 1;
    let m_start = config.mstart;
    let m_inc = config.minc;

    let last_prime = last_prime_at_most(config.max_prime)?;
    let p_primes = generate_primes(config.p as u64);

    let n_log = config.n_log(ks.k_log);
    let prob_prime = 1.0 / n_log - 1.0 / (n_log * n_log);

    let valid_mi = config.valid_mi();
    ensure!(!valid_mi.is_empty(), "no m in range is coprime to D");
    let valid_ms = valid_mi.len();
    let mut m_reindex = vec![-1i64; m_inc as usize];
    let mut m_not_coprime = vec![true; m_inc as usize];
    for (mii, &mi) in valid_mi.iter().enumerate() {
        m_reindex[mi as usize] = mii as i64;
        m_not_coprime[mi as usize] = false;
    }

    let reindex = Reindex::build(&p_primes, config.d, config.sieve_length, &ks.residues)?;

    let (small_threshold, medium_threshold) = thresholds(config);
    if config.verbose >= 1 {
        println!("sieve_length:  2x {}", config.sieve_length);
        println!("max_prime:        {}", config.max_prime);
        println!("small_threshold:  {}", small_threshold);
        println!("middle_threshold: {}", medium_threshold);
    }
    assert!(small_threshold >= si);
    assert!(medium_threshold >= small_threshold);
    assert!(medium_threshold <= config.max_prime);

    // Memory gate before any large allocation.
    let composite_bits: u64 = valid_mi
        .iter()
        .map(|&mi| reindex.composite_len(m_start + mi) as u64)
        .sum();
    let estimated_bytes = composite_bits / 8;
    ensure!(
        estimated_bytes < MAX_COMPOSITE_BYTES,
        "composite bitmaps would need ~{} MB (limit {} MB); shrink minc or sieve-length",
        estimated_bytes / (1024 * 1024),
        MAX_COMPOSITE_BYTES / (1024 * 1024)
    );

    let mut composite: Vec<CompositeBits> = valid_mi
        .iter()
        .map(|&mi| {
            let mut bits = CompositeBits::new(reindex.composite_len(m_start + mi));
            bits.mark(0); // sentinel: every folded-away position is composite
            bits
        })
        .collect();

    if config.verbose >= 1 {
        println!(
            "coprime m    {}/{},  coprime i {}/{}, ~{}MB",
            valid_ms,
            m_inc,
            reindex.coprime_x.len() / 2,
            config.sieve_length,
            estimated_bytes / (1024 * 1024)
        );
        if reindex.wheel > 1 {
            println!(
                "coprime wheel {}/{} (wheel {})",
                composite_bits / (2 * valid_ms as u64),
                config.sieve_length,
                reindex.wheel
            );
        }
    }

    let prp_time_est = prp_time_estimate(n_log);
    let mut stats = SieveStats::new(config, valid_ms, small_threshold, prob_prime);

    phase_a_small_primes(
        config,
        &ks,
        &reindex,
        &valid_mi,
        &mut composite,
        &mut stats,
        small_threshold,
        last_prime,
        prp_time_est,
    );

    phase_b_medium_primes(
        config,
        &ks,
        &reindex,
        &m_reindex,
        &m_not_coprime,
        &mut composite,
        &mut stats,
        small_threshold,
        medium_threshold,
        last_prime,
        prp_time_est,
    )?;

    let (effective_max_prime, interrupted) = phase_c_large_primes(
        config,
        &ks,
        &reindex,
        &valid_mi,
        &m_reindex,
        &m_not_coprime,
        &mut composite,
        &mut stats,
        medium_threshold,
        last_prime,
        prp_time_est,
        cancel,
    )?;

    stats.roll_interval();

    // Mertens' third theorem predicts the modulo-search hit count; a large
    // deviation means the Euclid descent is dropping hits.
    if medium_threshold < last_prime && !interrupted {
        let expected_m_stops = ((last_prime as f64).ln().ln()
            - (medium_threshold as f64).ln().ln())
            * 2.0
            * sl64 as f64
            * m_inc as f64;
        let error_percent =
            100.0 * (expected_m_stops - stats.m_stops as f64).abs() / expected_m_stops;
        if config.verbose >= 3 || error_percent > 0.1 {
            println!(
                "estimated modulo searches (m/prime) error {:.2}%,\t{} vs expected {:.0}",
                error_percent, stats.m_stops, expected_m_stops
            );
        }
    }

    let mut effective = config.clone();
    effective.max_prime = effective_max_prime;

    let unknown_file = if config.save_unknowns {
        Some(save_unknowns(&effective, &reindex, &valid_mi, &composite)?)
    } else {
        None
    };

    Ok(SieveOutcome {
        valid_ms,
        seconds: stats.start.elapsed().as_secs_f64(),
        max_prime: effective_max_prime,
        unknown_file,
        interrupted,
    })
}

/// Phase A: small primes, per m, parallel over disjoint m-slices.
#[allow(clippy::too_many_arguments)]
fn phase_a_small_primes(
    config: &Config,
    ks: &KStats,
    reindex: &Reindex,
    valid_mi: &[u64],
    composite: &mut [CompositeBits],
    stats: &mut SieveStats,
    small_threshold: u64,
    last_prime: u64,
    prp_time_est: f64,
) {
    let sl = config.sieve_length as u64;
    let si = (2 * sl + 1) as usize;
    let m_start = config.mstart;
    let d = config.d;
    let k_odd = d % 2 == 0;

    let chunk = (valid_mi.len() / (rayon::current_num_threads() * 4)).max(1);

    let mut primes = SegmentedPrimes::new(1, small_threshold);
    loop {
        // One batch of (prime, K mod prime) per print interval.
        let mut batch: Vec<(u64, u64)> = Vec::new();
        let mut batch_last = 0u64;
        for prime in primes.by_ref() {
            stats.pi_interval += 1;
            batch_last = prime;

            if d % prime != 0 && prime <= config.p as u64 {
                // Below P and not in D: the base reindex folded it out.
            } else if reindex.wheel as u64 % prime == 0 {
                // Wheel primes are folded per residue class.
                if config.verbose >= 2 {
                    println!("\t{} handled by coprime wheel({})", prime, reindex.wheel);
                }
            } else {
                batch.push((prime, ks.residues.rem(prime)));
            }
            if prime >= stats.next_print {
                break;
            }
        }
        if batch_last == 0 {
            break;
        }

        // Each slice owns its bitmaps; the batch is shared read-only.
        let counters: Vec<(u64, u64)> = composite
            .par_chunks_mut(chunk)
            .zip(valid_mi.par_chunks(chunk))
            .map(|(comp_chunk, mi_chunk)| {
                let mut factors = 0u64;
                let mut validated = 0u64;
                for (comp, &mi) in comp_chunk.iter_mut().zip(mi_chunk) {
                    let m = m_start + mi;
                    let table = reindex.table_for(m);
                    let center_odd = k_odd && (m & 1 == 1);
                    let low_is_even = center_odd == (sl & 1 == 1);

                    for &(prime, base_r) in &batch {
                        debug_assert!(prime > 2);
                        let modulo = (base_r as u128 * m as u128 % prime as u128) as u64;
                        // First x in [0, 2·SL] with x ≡ SL − modulo (mod p).
                        let mut flip = modulo + prime - ((sl + 1) % prime);
                        if flip >= prime {
                            flip -= prime;
                        }
                        let mut first = prime - flip - 1;
                        debug_assert!(first < prime);

                        if (first as usize) < si {
                            let even_from_low = first & 1 == 0;
                            if low_is_even == even_from_low {
                                // Even endpoint, already composite: step to
                                // the odd multiple.
                                debug_assert!(comp.is_marked(table[first as usize] as usize));
                                first += prime;
                            }
                            // Even multiples never need crossing off.
                            let shift = (2 * prime) as usize;
                            let mut x = first as usize;
                            while x < si {
                                if config.validate_factors {
                                    validate_factor(&ks.k, m, x as u64, config.sieve_length, prime);
                                    validated += 1;
                                }
                                comp.mark(table[x] as usize);
                                factors += 1;
                                x += shift;
                            }
                        }
                    }
                }
                (factors, validated)
            })
            .collect();
        for (factors, validated) in counters {
            stats.small_prime_factors_interval += factors;
            stats.validated_factors += validated;
        }

        if batch_last >= stats.next_print {
            let skipped = stats.skipped_prp(batch_last, valid_mi.len());
            increment_print(
                batch_last,
                last_prime,
                valid_mi.len(),
                skipped,
                prp_time_est,
                composite,
                stats,
                config,
                false,
            );
        }
        if batch_last >= small_threshold {
            break;
        }
    }
}

/// Phase B: one pass per prime, inverting K once and stepping the m
/// progression for every coprime offset.
#[allow(clippy::too_many_arguments)]
fn phase_b_medium_primes(
    config: &Config,
    ks: &KStats,
    reindex: &Reindex,
    m_reindex: &[i64],
    m_not_coprime: &[bool],
    composite: &mut [CompositeBits],
    stats: &mut SieveStats,
    small_threshold: u64,
    medium_threshold: u64,
    last_prime: u64,
    prp_time_est: f64,
) -> Result<()> {
    let sl = config.sieve_length as i64;
    let m_start = config.mstart;
    let m_inc = config.minc;
    let k_odd = config.d % 2 == 0;
    let m_x_parity = (m_start as i64 ^ sl) & 1;
    let valid_ms = composite.len();

    for prime in SegmentedPrimes::new(small_threshold, medium_threshold) {
        stats.pi_interval += 1;

        let base_r = ks.residues.rem(prime);
        let inv_k = mod_inverse(base_r, prime)
            .with_context(|| format!("{} unexpectedly divides K", prime))?;
        debug_assert_eq!((inv_k as u128 * base_r as u128 % prime as u128) as u64, 1);

        let m_start_shift = (prime - m_start % prime) % prime;

        for &x in &reindex.coprime_x {
            let dist = x as i64 - sl;
            debug_assert!(k_odd || dist & 1 == 1);

            // m ≡ −dist·K⁻¹ − M₀ (mod p).
            let mut mi0 = (((prime as i128 - dist as i128) * inv_k as i128
                + m_start_shift as i128)
                % prime as i128) as u64;

            let shift = (1 + u64::from(k_odd)) * prime;
            if k_odd && ((dist ^ mi0 as i64) & 1) == m_x_parity {
                // Wrong parity class: those hits land on even endpoints or
                // even m, both already handled. An odd prime flips the class.
                mi0 += prime;
            }

            let mut mi = mi0;
            while mi < m_inc {
                if !m_not_coprime[mi as usize] {
                    let m = m_start + mi;
                    let mii = m_reindex[mi as usize];
                    debug_assert!(mii >= 0);
                    if config.validate_factors {
                        validate_factor(&ks.k, m, x as u64, config.sieve_length, prime);
                        stats.validated_factors += 1;
                    }
                    composite[mii as usize].mark(reindex.table_for(m)[x as usize] as usize);
                    stats.small_prime_factors_interval += 1;
                }
                mi += shift;
            }
        }

        if prime >= stats.next_print {
            let skipped = stats.skipped_prp(prime, valid_ms);
            increment_print(
                prime,
                last_prime,
                valid_ms,
                skipped,
                prp_time_est,
                composite,
                stats,
                config,
                false,
            );
        }
    }
    Ok(())
}

/// Phase C: stream the large primes through the Euclid search. Returns the
/// effective max_prime and whether the run was interrupted.
#[allow(clippy::too_many_arguments)]
fn phase_c_large_primes(
    config: &Config,
    ks: &KStats,
    reindex: &Reindex,
    valid_mi: &[u64],
    m_reindex: &[i64],
    m_not_coprime: &[bool],
    composite: &mut [CompositeBits],
    stats: &mut SieveStats,
    medium_threshold: u64,
    last_prime: u64,
    prp_time_est: f64,
    cancel: &CancelToken,
) -> Result<(u64, bool)> {
    let sl = config.sieve_length as u64;
    let sl2 = 2 * sl;
    let m_start = config.mstart;
    let m_inc = config.minc;
    let d = config.d;

    let k_odd = d % 2 == 0;
    let d_mod3 = d % 3 == 0;
    let d_mod5 = d % 5 == 0;
    let d_mod7 = d % 7 == 0;
    let k_mod3 = ks.residues.rem(3) as i64;
    let k_mod5 = ks.residues.rem(5) as i64;
    let k_mod7 = ks.residues.rem(7) as i64;

    for prime in SegmentedPrimes::new(medium_threshold, config.max_prime) {
        stats.pi_interval += 1;
        let base_r = ks.residues.rem(prime);

        modulo_search_euclid_all_large(m_start, m_inc, sl, prime, base_r, |mi, first| {
            stats.m_stops_interval += 1;

            let m = m_start + mi;
            // With D even, even m share a factor 2 with D; reject before the
            // wide m_not_coprime read.
            if k_odd && (m & 1 == 0) {
                return;
            }
            if m_not_coprime[mi as usize] {
                return;
            }

            // first = (m·K + SL) mod p ≤ 2·SL; the offset with
            // p | m·K − SL + x is its mirror.
            debug_assert!(first <= sl2);
            let x = sl2 - first;

            // Cheap wheel-prime rejects: these positions were crossed off in
            // Phase A (or folded), skip the random bitmap write.
            let dist = x as i64 - sl as i64;
            if k_odd && (dist & 1 == 1) {
                return;
            }
            if d_mod3 && (dist + k_mod3 * m as i64) % 3 == 0 {
                return;
            }
            if d_mod5 && (dist + k_mod5 * m as i64) % 5 == 0 {
                return;
            }
            if d_mod7 && (dist + k_mod7 * m as i64) % 7 == 0 {
                return;
            }
            if !reindex.coprime[x as usize] {
                return;
            }

            if config.validate_factors {
                validate_factor(&ks.k, m, x, config.sieve_length, prime);
                stats.validated_factors += 1;
            }

            let mii = m_reindex[mi as usize];
            debug_assert!(mii >= 0);
            composite[mii as usize].mark(reindex.table_for(m)[x as usize] as usize);
            stats.large_prime_factors_interval += 1;
        });

        if prime >= stats.next_print {
            let is_last = prime == last_prime || cancel.is_cancelled();
            let skipped = stats.skipped_prp(prime, valid_mi.len());
            increment_print(
                prime,
                last_prime,
                valid_mi.len(),
                skipped,
                prp_time_est,
                composite,
                stats,
                config,
                is_last,
            );

            if cancel.is_cancelled() && prime != last_prime {
                if prime < 1_000_000 {
                    bail!("cancelled at prime {} before any checkpoint depth", prime);
                }
                // The interval was sieved by one extra prime past the trim;
                // a few entries may differ from a clean run at this depth.
                let trimmed = prime - prime % 1_000_000;
                info!(prime, trimmed, "breaking sieve loop from cancellation");
                return Ok((trimmed, true));
            }

            if config.save_increments
                && config.save_unknowns
                && prime > 10_000_000_000
                && prime != last_prime
            {
                let mut partial = config.clone();
                partial.max_prime = prime - prime % 1_000_000;
                save_unknowns(&partial, reindex, valid_mi, composite)?;
            }
        }
    }
    Ok((config.max_prime, false))
}

/// Flush the composite state to the unknown file (atomic tmp + rename).
/// One line per valid m, ascending mi, through the shared codec.
pub fn save_unknowns(
    config: &Config,
    reindex: &Reindex,
    valid_mi: &[u64],
    composite: &[CompositeBits],
) -> Result<PathBuf> {
    let path = config.unknown_path();
    let tmp = path.with_extension("tmp");
    info!(file = %path.display(), "saving unknowns");

    let sl = config.sieve_length as usize;
    let mut out = BufWriter::new(
        fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?,
    );
    for (mii, &mi) in valid_mi.iter().enumerate() {
        let m = config.mstart + mi;
        debug_assert_eq!(gcd(m, config.d), 1);
        let table = reindex.table_for(m);
        let comp = &composite[mii];

        let mut prev = Vec::new();
        let mut next = Vec::new();
        for i in 1..=sl {
            if !comp.is_marked(table[sl - i] as usize) {
                prev.push(i as u32);
            }
            if !comp.is_marked(table[sl + i] as usize) {
                next.push(i as u32);
            }
        }
        let line = unknowns::encode_line(mi, &prev, &next, config.rle)?;
        out.write_all(&line)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    drop(out);
    fs::rename(&tmp, &path).with_context(|| format!("renaming {}", tmp.display()))?;
    Ok(path)
}

// ── Method 1: per-m large-prime queue ───────────────────────────────

fn method1(config: &Config) -> Result<SieveOutcome> {
    let ks = config.k_stats()?;
    let sl = config.sieve_length as u64;
    let m_start = config.mstart;
    let m_inc = config.minc;
    let d = config.d;

    let small_limit = SMALL_PRIME_LIMIT_METHOD1.max(2 * sl + 2);
    let start = Instant::now();

    // (prime, K mod prime) for the per-m band, and the travelling queue for
    // everything larger: each large prime lives in the bucket of the next m
    // whose interval it divides.
    let mut prime_and_remainder: Vec<(u64, u64)> = Vec::new();
    let mut queue: Vec<Vec<(u64, u64)>> = vec![Vec::new(); m_inc as usize];
    {
        if config.verbose >= 0 {
            println!("\tcalculating first m each prime divides");
        }
        let expected = primepi_estimate(config.max_prime);
        let print_dots = 38u64;
        let mut pi = 0u64;
        let mut first_m_sum = 0u64;

        for prime in SegmentedPrimes::new(1, config.max_prime) {
            pi += 1;
            if config.verbose >= 0 && (pi * print_dots) % expected < print_dots {
                print!(".");
                let _ = std::io::stdout().flush();
            }

            let base_r = ks.residues.rem(prime);
            if prime <= small_limit {
                prime_and_remainder.push((prime, base_r));
                continue;
            }

            let mi = modulo_search_euclid_gcd(m_start, d, m_inc, sl, prime, base_r);
            if mi == m_inc {
                continue;
            }
            queue[mi as usize].push((prime, base_r));
            first_m_sum += mi;
        }
        if config.verbose >= 0 {
            println!();
        }
        if config.verbose >= 1 {
            println!("\tsum of first m: {}", first_m_sum);
            println!("\tprimepi({}) = {}", config.max_prime, pi);
        }
    }

    let unknown_path = config.unknown_path();
    let tmp = unknown_path.with_extension("tmp");
    let mut out = config
        .save_unknowns
        .then(|| fs::File::create(&tmp).map(BufWriter::new))
        .transpose()
        .with_context(|| format!("creating {}", tmp.display()))?;

    let mut tests = 0u64;
    let mut total_unknown = 0u64;
    let mut large_primes_tested = 0u64;

    for mi in 0..m_inc {
        let m = m_start + mi;
        if gcd(m, d) > 1 {
            debug_assert!(queue[mi as usize].is_empty());
            continue;
        }

        let mut prev_bits = CompositeBits::new(sl as usize + 1);
        let mut next_bits = CompositeBits::new(sl as usize + 1);
        // Centre is always composite.
        prev_bits.mark(0);
        next_bits.mark(0);

        for &(prime, base_r) in &prime_and_remainder {
            let modulo = (base_r as u128 * m as u128 % prime as u128) as u64;
            // prev side: p | m·K − x ⇔ x ≡ modulo (mod p).
            let mut x = modulo;
            while x <= sl {
                prev_bits.mark(x as usize);
                x += prime;
            }
            // next side: p | m·K + x ⇔ x ≡ p − modulo. Starting at p when
            // modulo == 0 skips only the centre, already marked.
            let mut x = prime - modulo;
            while x <= sl {
                next_bits.mark(x as usize);
                x += prime;
            }
        }

        let pending = std::mem::take(&mut queue[mi as usize]);
        large_primes_tested += pending.len() as u64;
        for (prime, base_r) in pending {
            let modulo = (base_r as u128 * m as u128 % prime as u128) as u64;
            if config.validate_factors {
                let value = Integer::from(&ks.k * m);
                assert_eq!(
                    Integer::from(&value % Integer::from(prime)).to_u64(),
                    Some(modulo),
                    "queue residue mismatch at m={} p={}",
                    m,
                    prime
                );
            }
            if modulo <= sl {
                prev_bits.mark(modulo as usize);
            } else {
                let first_positive = prime - modulo;
                assert!(first_positive <= sl, "queued prime misses the interval");
                next_bits.mark(first_positive as usize);
            }

            // Travel to the next m this prime hits.
            let from = mi + 1;
            let next_mi = from
                + modulo_search_euclid_gcd(m_start + from, d, m_inc - from, sl, prime, base_r);
            if next_mi < m_inc {
                queue[next_mi as usize].push((prime, base_r));
            }
        }

        tests += 1;
        let unknown_l = prev_bits.count_unmarked();
        let unknown_u = next_bits.count_unmarked();
        total_unknown += (unknown_l + unknown_u) as u64;

        if let Some(out) = out.as_mut() {
            let mut prev = Vec::with_capacity(unknown_l);
            let mut next = Vec::with_capacity(unknown_u);
            for i in 1..=sl as usize {
                if !prev_bits.is_marked(i) {
                    prev.push(i as u32);
                }
                if !next_bits.is_marked(i) {
                    next.push(i as u32);
                }
            }
            let line = unknowns::encode_line(mi, &prev, &next, config.rle)?;
            out.write_all(&line)?;
            out.write_all(b"\n")?;
        }

        if config.verbose >= 1
            && (tests == 1 || tests == 10 || tests == 100 || tests == 500 || tests % 5000 == 0)
        {
            let secs = start.elapsed().as_secs_f64();
            println!("\t{} {:4} <- unknowns -> {:<4}", m, unknown_l, unknown_u);
            println!(
                "\t    intervals {:<10} ({:.2}/sec)  {:.0} seconds elapsed",
                tests,
                tests as f64 / secs.max(1e-9),
                secs
            );
            println!(
                "\t    unknowns  {:<10} (avg: {:.2}), {:.2}% composite",
                total_unknown,
                total_unknown as f64 / tests as f64,
                100.0 * (1.0 - total_unknown as f64 / ((2.0 * sl as f64 + 1.0) * tests as f64))
            );
            println!(
                "\t    large primes tested (avg/test: {})",
                large_primes_tested / tests
            );
        }
    }

    let unknown_file = if let Some(mut out) = out {
        out.flush()?;
        drop(out);
        fs::rename(&tmp, &unknown_path)
            .with_context(|| format!("renaming {}", tmp.display()))?;
        Some(unknown_path)
    } else {
        None
    };

    if queue.iter().any(|q| !q.is_empty()) {
        warn!("large-prime queue not fully drained");
    }

    Ok(SieveOutcome {
        valid_ms: tests as usize,
        seconds: start.elapsed().as_secs_f64(),
        max_prime: config.max_prime,
        unknown_file,
        interrupted: false,
    })
}

#[cfg(test)]
mod tests {
    //! End-to-end sieve correctness on a small real configuration: the
    //! engine's unknown lists are compared *exactly* against an independent
    //! per-prime residue reconstruction, counts land near the Mertens
    //! prediction, and the two engines agree line for line. Factor
    //! validation stays on so every crossoff is big-int checked as well.

    use super::*;
    use crate::CancelToken;
    use std::path::Path;

    fn small_config(minc: u64, dir: &Path) -> Config {
        Config {
            p: 503,
            d: 210,
            mstart: 1,
            minc,
            sieve_length: 3200,
            max_prime: 150_000,
            min_merit: 12.0,
            save_unknowns: true,
            rle: false,
            method1: false,
            save_increments: false,
            validate_factors: true,
            verbose: -1,
            search_db: dir.join("gaps.db"),
            records_db: dir.join("records.db"),
            threads: 0,
        }
    }

    /// Run the engine and decode the unknown file it wrote.
    fn sieve_unknowns(config: &Config) -> Vec<(u64, Vec<u32>, Vec<u32>)> {
        let cancel = CancelToken::new();
        let outcome = run(config, &cancel).unwrap();
        let path = outcome.unknown_file.clone().unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let mut lines = Vec::new();
        for raw in bytes.split(|&b| b == b'\n').filter(|l| !l.is_empty()) {
            let line = crate::unknowns::decode_line(raw, config.rle).unwrap();
            lines.push((line.mi, line.prev, line.next));
        }
        assert_eq!(lines.len(), outcome.valid_ms);
        lines
    }

    /// Independent reconstruction of one m's unknowns: cross off every
    /// prime's progression straight from `K mod p`, no reindexing, no
    /// banding, no Euclid search.
    fn brute_unknowns(
        config: &Config,
        primes_and_r: &[(u64, u64)],
        m: u64,
    ) -> (Vec<u32>, Vec<u32>) {
        let sl = config.sieve_length as u64;
        let mut prev = CompositeBits::new(sl as usize + 1);
        let mut next = CompositeBits::new(sl as usize + 1);
        prev.mark(0);
        next.mark(0);
        for &(p, base_r) in primes_and_r {
            let modulo = (base_r as u128 * m as u128 % p as u128) as u64;
            // prev side: p | m·K − x ⇔ x ≡ modulo (mod p).
            let mut x = modulo;
            while x <= sl {
                prev.mark(x as usize);
                x += p;
            }
            // next side: p | m·K + x ⇔ x ≡ p − modulo (mod p).
            let mut x = p - modulo;
            while x <= sl {
                next.mark(x as usize);
                x += p;
            }
        }
        let collect = |bits: &CompositeBits| {
            (1..=sl as usize)
                .filter(|&i| !bits.is_marked(i))
                .map(|i| i as u32)
                .collect::<Vec<u32>>()
        };
        (collect(&prev), collect(&next))
    }

    /// The engine's unknown lists equal the brute reconstruction exactly,
    /// for every valid m: nothing extra survives, nothing is dropped.
    #[test]
    fn matches_brute_force_reconstruction() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(12, dir.path());
        let ks = config.k_stats().unwrap();
        let lines = sieve_unknowns(&config);

        let primes_and_r: Vec<(u64, u64)> = generate_primes(config.max_prime)
            .into_iter()
            .map(|p| (p, ks.residues.rem(p)))
            .collect();

        assert_eq!(lines.len(), 2); // m = 1 and m = 11 are coprime to 210
        for (mi, prev, next) in &lines {
            let m = config.mstart + mi;
            assert_eq!(gcd(m, config.d), 1);
            assert!(prev.iter().all(|&d| d >= 1 && d <= config.sieve_length));
            assert!(next.iter().all(|&d| d >= 1 && d <= config.sieve_length));
            let (expect_prev, expect_next) = brute_unknowns(&config, &primes_and_r, m);
            assert_eq!(prev, &expect_prev, "prev side differs for m={}", m);
            assert_eq!(next, &expect_next, "next side differs for m={}", m);
        }
    }

    /// Survivor counts per side land near the Mertens prediction
    /// SL / (ln(max_prime)·e^γ).
    #[test]
    fn unknown_counts_near_mertens() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(12, dir.path());
        let lines = sieve_unknowns(&config);
        let expected =
            config.sieve_length as f64 / ((config.max_prime as f64).ln() * GAMMA.exp());
        for (_, prev, next) in &lines {
            for side in [prev.len() as f64, next.len() as f64] {
                assert!(
                    side > 0.4 * expected && side < 2.5 * expected,
                    "side count {} far from expected {:.1}",
                    side,
                    expected
                );
            }
        }
    }

    /// The queue engine and the batched engine must produce identical
    /// unknown lists.
    #[test]
    fn method1_matches_method2() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(12, dir.path());
        config.validate_factors = false;
        let fast = sieve_unknowns(&config);
        config.method1 = true;
        let slow = sieve_unknowns(&config);
        assert_eq!(fast, slow);
    }

    /// Re-running the same configuration reproduces the same lists (RLE
    /// round-trip included).
    #[test]
    fn sieve_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(12, dir.path());
        config.validate_factors = false;
        config.rle = true;
        let a = sieve_unknowns(&config);
        let b = sieve_unknowns(&config);
        assert_eq!(a, b);
    }

    #[test]
    fn thresholds_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(12, dir.path());
        let (small, medium) = thresholds(&config);
        assert!(small > 2 * config.sieve_length as u64 + 1);
        assert!(medium >= small);
        assert!(medium <= config.max_prime);
    }

    #[test]
    fn last_prime_helper() {
        assert_eq!(last_prime_at_most(100_000).unwrap(), 99_991);
        assert_eq!(last_prime_at_most(99_991).unwrap(), 99_991);
    }
}
