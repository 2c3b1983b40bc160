//! # Config — Run Configuration and Derived Invariants
//!
//! A frozen description of one search range: the primorial parameters
//! (P, D), the multiplier window `[mstart, mstart + minc)`, the scan
//! half-length, the sieve depth, and the output/verbosity switches. All
//! validation happens up front (spec'd as fatal before any heavy work);
//! after `validate` the struct is never mutated except by the cancellation
//! path trimming `max_prime`.
//!
//! Also owns the two stable derivations shared by every component:
//! the 64-bit range id (`rid`) hashed from the configuration fingerprint,
//! and the unknown-file name.

use std::path::PathBuf;

use anyhow::{bail, ensure, Context, Result};
use rug::Integer;
use serde::Serialize;

use crate::primes::BigResidue;
use crate::{gcd, log_integer};

#[derive(Clone, Debug)]
pub struct Config {
    /// Primorial prime P; K = P#/D.
    pub p: u32,
    /// Denominator D, a squarefree divisor of P#.
    pub d: u64,
    /// First multiplier m.
    pub mstart: u64,
    /// Number of multipliers.
    pub minc: u64,
    /// Scan half-length SL; the interval is [−SL, +SL].
    pub sieve_length: u32,
    /// Sieve primes up to this bound.
    pub max_prime: u64,
    /// Merit threshold for "interesting" gaps.
    pub min_merit: f64,
    /// Write the unknown file (and the range row).
    pub save_unknowns: bool,
    /// Run-length encode the unknown file.
    pub rle: bool,
    /// Per-m large-prime queue path instead of the batched engine.
    pub method1: bool,
    /// Flush unknown-file checkpoints at late print boundaries.
    pub save_increments: bool,
    /// Recompute every crossoff with big-integer math and assert.
    pub validate_factors: bool,
    /// 0 = quiet, 1 = progress, 2 = stats breakdowns, 3 = everything.
    pub verbose: i32,
    pub search_db: PathBuf,
    pub records_db: PathBuf,
    /// Rayon pool size; 0 = all cores.
    pub threads: usize,
}

/// Fields that identify a range; the `rid` hash covers exactly these.
#[derive(Serialize)]
struct Fingerprint {
    p: u32,
    d: u64,
    mstart: u64,
    minc: u64,
    sieve_length: u32,
    max_prime: u64,
}

/// K = P#/D with its cached residue oracle and log-magnitude.
pub struct KStats {
    pub k: Integer,
    pub residues: BigResidue,
    /// ln K.
    pub k_log: f64,
    pub digits: u64,
}

impl Config {
    /// Reject impossible or foot-gun configurations before any allocation.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.p >= 503, "--p must be at least 503 (got {})", self.p);
        ensure!(is_prime_brute(self.p as u64), "--p {} is not prime", self.p);
        ensure!(self.d >= 1, "--d must be positive");
        validate_d_divides_primorial(self.p, self.d)?;

        ensure!(self.mstart >= 1, "--mstart must be at least 1");
        ensure!(self.minc >= 1, "--minc must be at least 1");
        self.mstart
            .checked_add(self.minc)
            .context("mstart + minc overflows u64")?;

        let sl = self.sieve_length;
        ensure!(sl > 1000, "--sieve-length must exceed 1000 (got {})", sl);
        let (sl_low, sl_high) = (6 * self.p, 22 * self.p);
        ensure!(
            sl >= sl_low && sl <= sl_high,
            "--sieve-length {} should be within [{}, {}] (6P to 22P)",
            sl,
            sl_low,
            sl_high
        );
        ensure!(sl % 2 == 0, "--sieve-length must be even (got {})", sl);

        let sieve_interval = 2 * sl as u64 + 1;
        ensure!(
            self.max_prime >= 10 * sieve_interval,
            "--max-prime {} is below the small-prime band (needs at least {})",
            self.max_prime,
            10 * sieve_interval
        );
        ensure!(self.min_merit > 0.0, "--min-merit must be positive");
        Ok(())
    }

    /// Compute K = P#/D once; fails if D does not divide P#.
    pub fn k_stats(&self) -> Result<KStats> {
        let primorial = Integer::from(Integer::primorial(self.p));
        ensure!(
            primorial.is_divisible(&Integer::from(self.d)),
            "D = {} does not divide {}#",
            self.d,
            self.p
        );
        let k = primorial / self.d;
        let k_log = log_integer(&k);
        let digits = (k.significant_bits() as f64 * std::f64::consts::LOG10_2) as u64 + 1;
        Ok(KStats {
            residues: BigResidue::new(&k),
            k,
            k_log,
            digits,
        })
    }

    /// Canonical log-magnitude for probability calibration:
    /// ln(K) + ln(mstart).
    pub fn n_log(&self, k_log: f64) -> f64 {
        k_log + (self.mstart as f64).ln()
    }

    /// Stable 64-bit range id: FNV-1a over the serialized fingerprint.
    /// Re-derivable from the persisted `range` row.
    pub fn rid(&self) -> u64 {
        let fp = Fingerprint {
            p: self.p,
            d: self.d,
            mstart: self.mstart,
            minc: self.minc,
            sieve_length: self.sieve_length,
            max_prime: self.max_prime,
        };
        // Serialization cannot fail for a plain integer struct.
        let bytes = serde_json::to_vec(&fp).unwrap_or_default();
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for b in bytes {
            hash ^= b as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        hash
    }

    /// Unknown-file name derived from the fingerprint, e.g.
    /// `503_2310_1_1000_s5000_l100M.txt`.
    pub fn unknown_filename(&self) -> String {
        format!(
            "{}_{}_{}_{}_s{}_l{}M.txt",
            self.p,
            self.d,
            self.mstart,
            self.minc,
            self.sieve_length,
            self.max_prime / 1_000_000
        )
    }

    /// Unknown file location: beside the search database, like the other
    /// per-configuration artefacts.
    pub fn unknown_path(&self) -> std::path::PathBuf {
        match self.search_db.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.join(self.unknown_filename()),
            _ => std::path::PathBuf::from(self.unknown_filename()),
        }
    }

    /// Indices mi with gcd(mstart + mi, D) = 1, ascending.
    pub fn valid_mi(&self) -> Vec<u64> {
        (0..self.minc)
            .filter(|mi| gcd(self.mstart + mi, self.d) == 1)
            .collect()
    }
}

/// Trial-division primality, adequate for P ≤ 10⁶ or so.
fn is_prime_brute(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3u64;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

/// D divides P# iff D is squarefree and every prime factor is ≤ P.
fn validate_d_divides_primorial(p: u32, d: u64) -> Result<()> {
    let mut rest = d;
    let mut f = 2u64;
    while f * f <= rest {
        if rest % f == 0 {
            rest /= f;
            if rest % f == 0 {
                bail!("--d {} is not squarefree (repeated factor {})", d, f);
            }
            if f > p as u64 {
                bail!("--d {} has factor {} above P = {}", d, f, p);
            }
        } else {
            f += 1;
        }
    }
    if rest > 1 && rest > p as u64 {
        bail!("--d {} has factor {} above P = {}", d, rest, p);
    }
    Ok(())
}
