//! # Prob — Probability Tables for Gap Statistics
//!
//! Everything the per-m estimator folds against, built once per
//! configuration:
//!
//! - `prime_nth_sieve[i]` — chance the i-th surviving unknown is the first
//!   prime (independence assumption), `great_nth_sieve[i]` — chance the
//!   first prime lies past the i-th. Both truncated when the running
//!   still-no-prime probability drops below 10⁻¹³.
//! - `combined_sieve[n] = p²(1−p)ⁿ` — chance of (prev at rank i, next at
//!   rank j) with n = i + j, truncated below 2.5·10⁻¹⁶.
//! - Per wheel-residue extended tables: the chance that a prime just
//!   outside the sieve completes a record gap (`extended_record_high`), and
//!   that both primes fall outside and still land on a record
//!   (`extended_extended_record`). The wheel here is built from the primes
//!   {2, 3, 5, 7} dividing D — those change coprimality with m, so each
//!   residue class gets its own table; the previous-prime side of class r
//!   reads class (W − r) mod W.
//!
//! Calibration comes from the prime number theorem plus Mertens' third
//! theorem: a number near m·K survives a sieve to depth max_prime with
//! probability `1/(ln(max_prime)·e^γ)`.

use crate::config::Config;
use crate::gcd;
use crate::primes::generate_primes;
use crate::records::RecordGaps;

/// Euler–Mascheroni constant.
pub const GAMMA: f64 = 0.577_215_664_901_532_9;

/// Truncation for the nth-prime tables.
const NTH_PRIME_CUTOFF: f64 = 1e-13;

/// Truncation for the combined table; keeps the summed error per line under
/// ~10⁻⁹ for a few thousand unknowns per side.
const COMBINED_CUTOFF: f64 = 2.5e-16;

pub struct ProbNth {
    /// P(i-th surviving unknown is the first prime), inside the sieve.
    pub prime_nth_sieve: Vec<f32>,
    /// P(first prime past the i-th unknown), inside the sieve.
    pub great_nth_sieve: Vec<f32>,
    /// P(prev at rank i, next at rank j) indexed by i + j.
    pub combined_sieve: Vec<f32>,
    /// Wheel modulus W = product of {2,3,5,7} ∩ divisors(D).
    pub wheel_d: u32,
    /// Per residue r (coprime to W): P(gap completes a record with next
    /// outside the sieve | prev at distance g), indexed g ∈ [0, SL].
    /// Residues that were not built (shared factor with W, or filtered in
    /// single-m mode) stay empty.
    pub extended_record_high: Vec<Vec<f32>>,
    /// Per residue: P(both primes outside the sieve on a record gap),
    /// before conditioning on both sides escaping.
    pub extended_extended_record: Vec<f64>,
    /// Average count of extended-side coprime positions.
    pub average_coprime: f32,
    /// P(first prime beyond 2·SL | beyond SL).
    pub prob_greater_extended: f32,
}

impl ProbNth {
    /// Extended table for the next-prime side of multiplier m.
    pub fn extended_high(&self, m: u64) -> &[f32] {
        &self.extended_record_high[(m % self.wheel_d as u64) as usize]
    }

    /// Extended table for the previous-prime side of multiplier m
    /// (the negated residue class).
    pub fn extended_low(&self, m: u64) -> &[f32] {
        let r = (m % self.wheel_d as u64) as u32;
        &self.extended_record_high[((self.wheel_d - r) % self.wheel_d) as usize]
    }

    pub fn extended_extended(&self, m: u64) -> f64 {
        self.extended_extended_record[(m % self.wheel_d as u64) as usize]
    }
}

/// `table[n]` or zero past the truncation point.
#[inline]
pub fn nth_prob_or_zero(table: &[f32], nth: usize) -> f32 {
    table.get(nth).copied().unwrap_or(0.0)
}

/// Geometric nth-prime tables: push `p_still·p` / `p_still`, then
/// `p_still ← p_still·(1−p)`, until the tail is negligible.
pub fn prob_nth_prime(prob_prime: f64) -> (Vec<f32>, Vec<f32>) {
    let mut prime_nth = Vec::new();
    let mut great_nth = Vec::new();
    let mut still = 1.0f64;
    while still > NTH_PRIME_CUTOFF {
        prime_nth.push((still * prob_prime) as f32);
        great_nth.push(still as f32);
        still *= 1.0 - prob_prime;
    }
    (prime_nth, great_nth)
}

/// `p²(1−p)ⁿ` until truncation.
pub fn prob_combined_gap(prob_prime: f64) -> Vec<f32> {
    let mut combined = Vec::new();
    let mut prob = prob_prime * prob_prime;
    while prob > COMBINED_CUTOFF {
        combined.push(prob as f32);
        prob *= 1.0 - prob_prime;
    }
    combined
}

/// Build every table for one configuration.
///
/// `single_m` restricts the wheel tables to the two residue classes a lone
/// multiplier touches (the factor-stream path rebuilds these per plimit, so
/// the 48-class build would dominate). `verbose` is a call-site parameter —
/// nested rebuilds pass 0.
pub fn setup_probnth(
    config: &Config,
    k_log: f64,
    records: &RecordGaps,
    poss_record_gaps: &[u32],
    single_m: Option<u64>,
    verbose: i32,
) -> ProbNth {
    let n_log = config.n_log(k_log);
    let prob_prime = 1.0 / n_log - 1.0 / (n_log * n_log);
    let unknowns_after_sieve = 1.0 / ((config.max_prime as f64).ln() * GAMMA.exp());
    let unknowns_after_coprime = 1.0 / ((config.p as f64).ln() * GAMMA.exp());
    let prob_prime_after_sieve = prob_prime / unknowns_after_sieve;
    if verbose >= 2 {
        println!("prob prime             : {:.7}", prob_prime);
        println!("prob prime coprime     : {:.7}", prob_prime / unknowns_after_coprime);
        println!("prob prime after sieve : {:.5}\n", prob_prime_after_sieve);
    }

    let (prime_nth_sieve, great_nth_sieve) = prob_nth_prime(prob_prime_after_sieve);
    let combined_sieve = prob_combined_gap(prob_prime_after_sieve);

    let mut probs = ProbNth {
        prime_nth_sieve,
        great_nth_sieve,
        combined_sieve,
        wheel_d: 1,
        extended_record_high: Vec::new(),
        extended_extended_record: Vec::new(),
        average_coprime: 0.0,
        prob_greater_extended: 0.0,
    };
    prob_extended_gap(config, n_log, prob_prime, records, poss_record_gaps, single_m, verbose, &mut probs);
    probs
}

/// Whether residue r of the wheel is needed: always for a full range, only
/// the two classes `mstart` touches in single-m mode.
fn residue_needed(wheel: u32, r: u32, single_m: Option<u64>) -> bool {
    if gcd(r as u64, wheel as u64) > 1 {
        return false;
    }
    match single_m {
        None => true,
        Some(m) => {
            let mr = (m % wheel as u64) as u32;
            r == mr || r == (wheel - mr) % wheel
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn prob_extended_gap(
    config: &Config,
    n_log: f64,
    prob_prime: f64,
    records: &RecordGaps,
    poss_record_gaps: &[u32],
    single_m: Option<u64>,
    verbose: i32,
    out: &mut ProbNth,
) {
    let sl = config.sieve_length as usize;
    let ext_size = 2 * sl;
    let min_record = *poss_record_gaps.first().unwrap_or(&0) as usize;
    // Gaps above the catalogued tail are assumed record.
    let max_record = *poss_record_gaps.last().unwrap_or(&0) as usize;

    let k_primes = generate_primes(config.p as u64);

    // Correct the prime density for coprimality with K (and below, with the
    // wheel primes of D): outside the sieve only coprime positions count.
    let mut prob_prime_coprime = prob_prime;
    for &prime in &k_primes {
        if config.d % prime != 0 {
            prob_prime_coprime /= 1.0 - 1.0 / prime as f64;
        }
    }

    // Distances sharing a factor with K can never be prime offsets.
    let mut is_coprime = vec![true; ext_size];
    for &prime in &k_primes {
        if config.d % prime == 0 {
            continue;
        }
        let mut i = 0usize;
        while i < ext_size {
            is_coprime[i] = false;
            i += prime as usize;
        }
    }

    let wheel_primes: [u32; 4] = [2, 3, 5, 7];
    let mut wheel = 1u32;
    let mut k_mod_p = [0u32; 4];
    for (wi, &wp) in wheel_primes.iter().enumerate() {
        if config.d % wp as u64 == 0 {
            wheel *= wp;
            prob_prime_coprime /= 1.0 - 1.0 / wp as f64;
            // K mod wp from the primes of K directly.
            let mut k_mod = 1u32;
            for &kp in &k_primes {
                if config.d % kp != 0 {
                    k_mod = (k_mod * (kp % wp as u64) as u32) % wp;
                }
            }
            k_mod_p[wi] = k_mod;
        }
    }
    out.wheel_d = wheel;

    // Outside the sieve nothing has been crossed off; only the coprime
    // correction applies.
    let (prime_nth_out, great_nth_out) = prob_nth_prime(prob_prime_coprime);

    // Per-residue coprimality over [0, 2·SL), next-prime side.
    let mut coprime_ms: Vec<Vec<bool>> = vec![Vec::new(); wheel as usize];
    let mut built = 0usize;
    let mut average_inner = 0.0f64;
    let mut average_extended = 0.0f64;
    for r in 0..wheel {
        if !residue_needed(wheel, r, single_m) {
            continue;
        }
        let mut is_coprime_m = is_coprime.clone();
        for (wi, &wp) in wheel_primes.iter().enumerate() {
            if config.d % wp as u64 != 0 {
                continue;
            }
            // First positive distance with wp | r·K + dist. For a built
            // residue r·K is nonzero mod wp, so the start is in [1, wp).
            let first = (r * k_mod_p[wi]) % wp;
            let mut i = (wp - first) as usize;
            while i < ext_size {
                is_coprime_m[i] = false;
                i += wp as usize;
            }
        }
        average_inner += is_coprime_m[..sl].iter().filter(|&&c| c).count() as f64;
        average_extended += is_coprime_m[sl..].iter().filter(|&&c| c).count() as f64;
        built += 1;
        coprime_ms[r as usize] = is_coprime_m;
    }
    average_inner /= built as f64;
    average_extended /= built as f64;

    out.average_coprime = average_extended as f32;
    out.prob_greater_extended = nth_prob_or_zero(&great_nth_out, average_extended as usize);

    if verbose >= 2 {
        println!("Using wheel {} for extended probs", wheel);
        println!(
            "\taverage {:5.0} inner    coprimes => {:.3}% prob_greater",
            average_inner,
            100.0 * nth_prob_or_zero(&great_nth_out, average_inner as usize)
        );
        println!(
            "\taverage {:5.0} extended coprimes => {:.3}% prob_greater",
            average_extended,
            100.0 * out.prob_greater_extended
        );
    }

    out.extended_record_high = vec![Vec::new(); wheel as usize];
    out.extended_extended_record = vec![0.0; wheel as usize];

    for r in 0..wheel {
        if !residue_needed(wheel, r, single_m) {
            continue;
        }
        let is_coprime_m = &coprime_ms[r as usize];
        let is_coprime_m_prev = &coprime_ms[((wheel - r) % wheel) as usize];

        // Rank of each extended position among extended coprimes, and the
        // positions themselves.
        let mut count_coprime_m = vec![0u32; ext_size];
        let mut extended_coprime: Vec<usize> = Vec::new();
        {
            let mut count = 0u32;
            for x in (sl + 1)..ext_size {
                if is_coprime_m[x] {
                    extended_coprime.push(x);
                    count += 1;
                }
                count_coprime_m[x] = count;
            }
        }

        // P(record | prev at gap_prev inside, next outside the sieve).
        let mut extended_record = vec![0.0f32; sl + 1];
        for gap_prev in 1..=sl {
            if !is_coprime_m_prev[gap_prev] {
                continue;
            }
            if gap_prev + ext_size < min_record {
                continue;
            }
            let mut prob_record = 0.0f64;
            for &record_gap in poss_record_gaps {
                let dist = record_gap as i64 - gap_prev as i64;
                if dist <= sl as i64 {
                    continue;
                }
                let dist = dist as usize;
                if dist >= ext_size {
                    break;
                }
                if !is_coprime_m[dist] {
                    continue;
                }
                let num_coprime = count_coprime_m[dist] as usize;
                if num_coprime >= prime_nth_out.len() {
                    break;
                }
                prob_record += prime_nth_out[num_coprime] as f64;
            }
            assert!((0.0..1.0).contains(&prob_record));
            extended_record[gap_prev] = prob_record as f32;
        }
        out.extended_record_high[r as usize] = extended_record;

        // P(record | both primes outside the sieve), sliding the coprime
        // window so gap_prev + extended stays within [min, max] record.
        let mut prob_e2 = 0.0f64;
        if !extended_coprime.is_empty() {
            let mut min_e_c_i = extended_coprime.len();
            let mut max_e_c_i = extended_coprime.len() - 1;
            let mut prev_rank = 0usize;
            for gap_prev in (sl + 1)..ext_size {
                if !is_coprime_m_prev[gap_prev] {
                    continue;
                }
                prev_rank += 1;
                if prev_rank >= prime_nth_out.len() {
                    break;
                }

                while max_e_c_i > 0 && gap_prev + extended_coprime[max_e_c_i] > max_record {
                    max_e_c_i -= 1;
                }
                while min_e_c_i > 0 && gap_prev + extended_coprime[min_e_c_i - 1] >= min_record {
                    min_e_c_i -= 1;
                }

                if max_e_c_i == 0 {
                    // The whole window has slid past the catalogued tail:
                    // treat everything further as record.
                    debug_assert_eq!(min_e_c_i, 0);
                    prob_e2 += great_nth_out[prev_rank - 1] as f64;
                    break;
                }

                let max_i = max_e_c_i.min(prime_nth_out.len() - prev_rank + 1);
                let mut prob_e_e = 0.0f64;
                for (i, &ec) in extended_coprime
                    .iter()
                    .enumerate()
                    .take(max_i)
                    .skip(min_e_c_i)
                {
                    let gap = (gap_prev + ec) as u32;
                    if records.log_start(gap) as f64 > n_log {
                        prob_e_e += prime_nth_out[i] as f64;
                    }
                }
                prob_e_e += nth_prob_or_zero(&great_nth_out, max_i) as f64;
                prob_e2 += prob_e_e * nth_prob_or_zero(&prime_nth_out, prev_rank) as f64;
            }
        }
        assert!(prob_e2 >= 0.0);
        out.extended_extended_record[r as usize] = prob_e2;
    }
}

#[cfg(test)]
mod tests {
    //! Geometric-table identities, truncation behaviour, and the extended
    //! tables for a real configuration with an everything-is-record table.

    use super::*;
    use crate::records::RecordGaps;
    use std::path::PathBuf;

    fn test_config() -> Config {
        Config {
            p: 503,
            d: 2310,
            mstart: 1,
            minc: 100,
            sieve_length: 5000,
            max_prime: 100_000_000,
            min_merit: 18.0,
            save_unknowns: true,
            rle: false,
            method1: false,
            save_increments: false,
            validate_factors: false,
            verbose: 0,
            search_db: PathBuf::from(":memory:"),
            records_db: PathBuf::from(":memory:"),
            threads: 0,
        }
    }

    // ── Geometric tables ────────────────────────────────────────────

    #[test]
    fn prime_nth_sums_to_one() {
        let (prime_nth, _) = prob_nth_prime(0.05);
        let sum: f64 = prime_nth.iter().map(|&p| p as f64).sum();
        assert!((sum - 1.0).abs() < 1e-9, "sum = {}", sum);
    }

    #[test]
    fn great_nth_is_survival_of_prime_nth() {
        let p = 0.03;
        let (prime_nth, great_nth) = prob_nth_prime(p);
        assert_eq!(prime_nth.len(), great_nth.len());
        assert!((great_nth[0] - 1.0).abs() < 1e-12);
        for i in 0..prime_nth.len() {
            assert!((prime_nth[i] - great_nth[i] * p as f32).abs() < 1e-9);
        }
        // Monotone decreasing survival.
        assert!(great_nth.windows(2).all(|w| w[1] <= w[0]));
        // Truncated once survival is negligible.
        assert!(*great_nth.last().unwrap() as f64 > 1e-13);
    }

    #[test]
    fn combined_matches_closed_form() {
        let p = 0.04f64;
        let combined = prob_combined_gap(p);
        for (n, &c) in combined.iter().enumerate() {
            let expected = p * p * (1.0 - p).powi(n as i32);
            assert!((c as f64 - expected).abs() < 1e-12, "n={}", n);
        }
        assert!(*combined.last().unwrap() as f64 > 2.5e-16);
    }

    // ── Extended tables ─────────────────────────────────────────────

    /// D = 2310 puts 2·3·5·7 = 210 in the wheel; with an empty record table
    /// every gap is a possible record, so extended probabilities must be
    /// strictly inside [0, 1) and the ee-term nonnegative.
    #[test]
    fn extended_tables_for_real_config() {
        let config = test_config();
        let k_log = {
            let ks = config.k_stats().unwrap();
            ks.k_log
        };
        let records = RecordGaps::new(config.sieve_length);
        let poss = records.possible_record_gaps(config.n_log(k_log));
        assert!(poss.len() >= 2);

        let probs = setup_probnth(&config, k_log, &records, &poss, None, 0);
        assert_eq!(probs.wheel_d, 210);
        assert!(probs.prob_greater_extended > 0.0 && probs.prob_greater_extended < 1.0);

        let mut checked = 0;
        for r in 0..210u32 {
            let table = &probs.extended_record_high[r as usize];
            if gcd(r as u64, 210) > 1 {
                assert!(table.is_empty());
                continue;
            }
            checked += 1;
            assert_eq!(table.len(), 5001);
            assert!(table.iter().all(|&p| (0.0..1.0).contains(&p)));
            assert!(probs.extended_extended_record[r as usize] >= 0.0);
        }
        assert_eq!(checked, 48); // φ(210)
    }

    /// Single-m mode builds only the two residues the multiplier touches.
    #[test]
    fn single_m_builds_two_residues() {
        let mut config = test_config();
        config.minc = 1;
        config.mstart = 11;
        let k_log = config.k_stats().unwrap().k_log;
        let records = RecordGaps::new(config.sieve_length);
        let poss = records.possible_record_gaps(config.n_log(k_log));
        let probs = setup_probnth(&config, k_log, &records, &poss, Some(11), 0);
        let built: Vec<u32> = (0..210)
            .filter(|&r| !probs.extended_record_high[r as usize].is_empty())
            .collect();
        assert_eq!(built, vec![11, 199]);
        // The estimator's prev/next lookups land exactly on the built pair.
        assert!(!probs.extended_high(11).is_empty());
        assert!(!probs.extended_low(11).is_empty());
    }

    /// D = 1: no wheel primes, a single residue-0 table.
    #[test]
    fn trivial_wheel() {
        let mut config = test_config();
        config.d = 1;
        config.sieve_length = 5000;
        let k_log = config.k_stats().unwrap().k_log;
        let records = RecordGaps::new(config.sieve_length);
        let poss = records.possible_record_gaps(config.n_log(k_log));
        let probs = setup_probnth(&config, k_log, &records, &poss, None, 0);
        assert_eq!(probs.wheel_d, 1);
        assert_eq!(probs.extended_record_high.len(), 1);
        assert!(!probs.extended_record_high[0].is_empty());
        assert_eq!(probs.extended_high(7).len(), 5001);
    }
}
