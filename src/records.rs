//! # Records — Known Record-Gap Table
//!
//! Maps an even gap size to the natural log of the starting prime of the
//! best catalogued gap of that size; gaps never observed hold +∞ (so any
//! candidate beats them). A prefix up to `MAX_GAP` is kept, extended when a
//! huge sieve interval needs more. The missing-gap window brackets the gap
//! sizes the record project believes have never been exhibited at all.

/// Upper bound of the tracked gap table.
pub const MAX_GAP: u32 = 1_000_000;

/// Sentinel for "no known gap of this size" (log of starting prime).
pub const GAP_INF: f32 = f32::MAX;

/// Gap sizes with no known occurrence, per the missing-gaps list.
pub const MISSING_GAPS_LOW: u32 = 113_326;
pub const MISSING_GAPS_HIGH: u32 = 132_928;

/// Ignore the infinitesimal odds of gaps above this merit.
const MAX_RECORD_MERIT: f64 = 35.0;

pub struct RecordGaps {
    /// `records[gap]` = ln(start prime) of the best known gap, GAP_INF if none.
    records: Vec<f32>,
}

impl RecordGaps {
    /// An empty table sized for the configured interval.
    pub fn new(sieve_length: u32) -> Self {
        let size = MAX_GAP.max(2 * sieve_length + 1) as usize;
        RecordGaps {
            records: vec![GAP_INF; size],
        }
    }

    /// Record one (gap, merit) row; the source stores merit, the table wants
    /// `ln(start) = gap / merit`.
    pub fn insert(&mut self, gap: u64, merit: f64) {
        if merit > 0.0 && (gap as usize) < self.records.len() {
            self.records[gap as usize] = (gap as f64 / merit) as f32;
        }
    }

    #[inline]
    pub fn log_start(&self, gap: u32) -> f32 {
        self.records.get(gap as usize).copied().unwrap_or(GAP_INF)
    }

    /// Would a gap of this size starting at ln(start) ≈ `log_start` be a
    /// record?
    #[inline]
    pub fn beats_record(&self, gap: u32, log_start: f64) -> bool {
        self.log_start(gap) as f64 > log_start
    }

    /// Is this gap inside the missing window with no known occurrence?
    #[inline]
    pub fn is_missing(&self, gap: u32) -> bool {
        (MISSING_GAPS_LOW..=MISSING_GAPS_HIGH).contains(&gap) && self.log_start(gap) == GAP_INF
    }

    /// Even gaps that would set a record for numbers of magnitude `n_log`,
    /// ascending, cut off above merit 35.
    pub fn possible_record_gaps(&self, n_log: f64) -> Vec<u32> {
        let mut gaps = Vec::new();
        for g in (2..self.records.len() as u32).step_by(2) {
            if g as f64 / n_log > MAX_RECORD_MERIT {
                break;
            }
            if self.log_start(g) as f64 > n_log {
                gaps.push(g);
            }
        }
        gaps
    }
}

#[cfg(test)]
mod tests {
    //! The record model against hand-built tables, including the
    //! single-entry scenario: with only (gap 6, ln(start) 100) known, 6 is a
    //! possible record exactly when our numbers are smaller than the holder.

    use super::*;

    #[test]
    fn empty_table_treats_everything_as_record() {
        let r = RecordGaps::new(5000);
        assert!(r.beats_record(100, 1e9));
        assert_eq!(r.log_start(2), GAP_INF);
    }

    #[test]
    fn insert_recovers_log_start() {
        let mut r = RecordGaps::new(5000);
        // gap 100 with merit 4 → started near e^25.
        r.insert(100, 4.0);
        assert!((r.log_start(100) - 25.0).abs() < 1e-4);
        assert!(r.beats_record(100, 20.0));
        assert!(!r.beats_record(100, 30.0));
    }

    #[test]
    fn single_entry_scenario() {
        let mut r = RecordGaps::new(5000);
        r.insert(6, 6.0 / 100.0); // ln(start) = 100
        let with_small_n = r.possible_record_gaps(90.0);
        assert!(with_small_n.contains(&6));
        let with_large_n = r.possible_record_gaps(110.0);
        assert!(!with_large_n.contains(&6));
        // All other even gaps below the merit cutoff stay possible records.
        assert!(with_large_n.contains(&2));
        assert!(with_large_n.contains(&8));
    }

    #[test]
    fn possible_gaps_ascending_and_even() {
        let r = RecordGaps::new(5000);
        let gaps = r.possible_record_gaps(1000.0);
        assert!(gaps.windows(2).all(|w| w[0] < w[1]));
        assert!(gaps.iter().all(|g| g % 2 == 0));
        // Merit cutoff: nothing above 35 * N_log.
        assert!(*gaps.last().unwrap() as f64 <= 35.0 * 1000.0);
    }

    #[test]
    fn missing_window() {
        let mut r = RecordGaps::new(5000);
        assert!(r.is_missing(MISSING_GAPS_LOW));
        assert!(r.is_missing(MISSING_GAPS_HIGH));
        assert!(!r.is_missing(MISSING_GAPS_LOW - 2));
        // A known occurrence removes the gap from the missing set.
        r.insert(MISSING_GAPS_LOW as u64, 30.0);
        assert!(!r.is_missing(MISSING_GAPS_LOW));
    }

    #[test]
    fn oversized_interval_grows_table() {
        let r = RecordGaps::new(600_000);
        assert_eq!(r.log_start(1_200_000), GAP_INF);
        assert!(r.records.len() >= 1_200_001);
    }
}
