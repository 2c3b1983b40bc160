//! # Gaphunt — Core Library
//!
//! Research toolchain for hunting extremal prime gaps around numbers of the
//! form m·P#/d: a memory-compressed combined sieve over a range of
//! multipliers, and a statistical estimator that turns the sieve's
//! survivors into per-m record/missing/merit probabilities.
//!
//! ## Module Organization
//!
//! **Engine modules**:
//! - [`sieve`] — the three-band combined sieve (and the method-1 queue path)
//! - [`wheel`] — coprimality masks and the bit-reindex compression
//! - [`modsearch`] — Euclid-descent modular interval search
//! - [`primes`] — prime generation, Montgomery arithmetic, packed bitmaps
//!
//! **Statistics modules**:
//! - [`prob`] — nth-prime / combined / extended probability tables
//! - [`records`] — the known record-gap table and missing-gap window
//! - [`estimator`] — per-m folds, range aggregation, PRP-ordering sweeps
//!
//! **Infrastructure**:
//! - [`config`] — frozen run configuration and derived invariants
//! - [`unknowns`] — sparse/RLE unknown-line codec
//! - [`db`] — SQLite sink (`range`, `range_stats`, `m_stats`) and the
//!   records source
//!
//! ## Pipeline
//!
//! **sieve → unknown file → estimator → store**. The sieve writes one line
//! per valid m; the estimator folds each line against tables built from the
//! same configuration plus the external record table, and flushes range and
//! per-m rows in a single transaction.

pub mod config;
pub mod db;
pub mod estimator;
pub mod modsearch;
pub mod primes;
pub mod prob;
pub mod records;
pub mod sieve;
pub mod unknowns;
pub mod wheel;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rug::Integer;

/// Greatest common divisor.
pub fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

/// Natural log of a big integer: exact for small values, top-53-bits plus
/// the binary magnitude for the primorial-sized ones.
pub fn log_integer(n: &Integer) -> f64 {
    let bits = n.significant_bits();
    if bits <= 53 {
        return n.to_f64().ln();
    }
    let top = Integer::from(n >> (bits - 53));
    top.to_f64().ln() + (bits - 53) as f64 * std::f64::consts::LN_2
}

/// Rough cost of one probable-prime test on a number with natural log
/// `n_log`, in seconds. Quasi-quadratic in the bit size; the constant is
/// calibrated so a ~10k-bit candidate costs a handful of milliseconds.
pub fn prp_time_estimate(n_log: f64) -> f64 {
    let bits = (n_log / std::f64::consts::LN_2).max(64.0);
    6e-12 * bits * bits * bits.ln()
}

/// Rough wall-clock estimate for sieving a whole range, used by the
/// PRP-ordering sweep when the database has no recorded sieve time.
/// Mertens bounds the crossoff count; the per-op constant covers the
/// reindexed bitmap write.
pub fn sieve_time_estimate(
    sieve_length: u32,
    max_prime: u64,
    valid_ms: usize,
) -> f64 {
    let si = 2.0 * sieve_length as f64 + 1.0;
    let crossoffs = valid_ms as f64 * si * (max_prime as f64).ln().ln();
    let searches = crate::primes::primepi_estimate(max_prime) as f64 * 30.0;
    4e-9 * (crossoffs + searches)
}

/// Cooperative cancellation shared between the signal handler and the
/// sieve. The sieve samples it at print-interval boundaries only; a second
/// signal terminates immediately with exit code 2.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Install a SIGINT/SIGTERM listener on a dedicated thread. First
    /// signal sets the flag (the sieve finishes its interval, trims, and
    /// flushes); second signal exits 2 on the spot.
    pub fn install_signal_handler(&self) {
        let flag = Arc::clone(&self.flag);
        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::warn!(error = %e, "signal handler runtime failed; CTRL+C will kill immediately");
                    return;
                }
            };
            rt.block_on(async {
                loop {
                    let ctrl_c = tokio::signal::ctrl_c();
                    #[cfg(unix)]
                    {
                        let mut sigterm = match tokio::signal::unix::signal(
                            tokio::signal::unix::SignalKind::terminate(),
                        ) {
                            Ok(s) => s,
                            Err(_) => return,
                        };
                        tokio::select! {
                            _ = ctrl_c => {},
                            _ = sigterm.recv() => {},
                        }
                    }
                    #[cfg(not(unix))]
                    {
                        let _ = ctrl_c.await;
                    }

                    if flag.swap(true, Ordering::Relaxed) {
                        eprintln!("caught 2nd CTRL+C, stopping now");
                        std::process::exit(2);
                    }
                    eprintln!("caught CTRL+C, stopping and saving after next interval");
                }
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcd_basics() {
        assert_eq!(gcd(12, 18), 6);
        assert_eq!(gcd(17, 5), 1);
        assert_eq!(gcd(0, 7), 7);
        assert_eq!(gcd(7, 0), 7);
        assert_eq!(gcd(2310, 30), 30);
    }

    #[test]
    fn log_integer_matches_f64() {
        for &n in &[2u64, 1000, 1_000_003, u64::MAX] {
            let big = Integer::from(n);
            assert!((log_integer(&big) - (n as f64).ln()).abs() < 1e-9, "n={}", n);
        }
    }

    /// ln(P#) ≈ θ(P) (Chebyshev), within a percent for P = 1009.
    #[test]
    fn log_integer_primorial_magnitude() {
        let primorial = Integer::from(Integer::primorial(1009));
        let log = log_integer(&primorial);
        assert!((log - 1009.0).abs() < 0.05 * 1009.0, "log = {}", log);
    }

    #[test]
    fn prp_estimate_grows_with_size() {
        assert!(prp_time_estimate(5000.0) > prp_time_estimate(500.0));
        assert!(prp_time_estimate(500.0) > 0.0);
    }

    #[test]
    fn cancel_token_latches() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }
}
