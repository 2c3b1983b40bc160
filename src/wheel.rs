//! # Wheel — Coprimality Masks and Bit Reindexing
//!
//! The per-m composite state conceptually covers every offset in
//! `[−SL, +SL]`, but most offsets can never be prime: any position sharing a
//! factor with K = P#/D is composite for *every* m. Those positions are
//! compressed away by a one-way reindex: offset X (shifted to `[0, 2·SL]`)
//! maps to a dense 1-based ordinal among the coprime survivors, and every
//! non-coprime position folds onto the sentinel bit 0, which is forced
//! composite up front.
//!
//! A second compression layer handles the small primes dividing D (they
//! divide `m·K + x` or not depending on `m`): for a wheel W — the part of D
//! made of primes in {2, 3, 5} or {2, 3} — each residue class `m mod W` gets
//! its own reindex that additionally folds positions killed by the wheel
//! primes for that class. Together the two layers shrink the per-m bitmap by
//! 50–80%.

use anyhow::{ensure, Result};

use crate::gcd;
use crate::primes::BigResidue;

/// Precomputed reindex tables for one run configuration.
pub struct Reindex {
    /// Half-length of the scan interval.
    pub sl: u32,
    /// `2·SL + 1` positions, offsets shifted by +SL.
    pub sieve_interval: u32,
    /// `coprime[x]` ⇔ `x − SL` shares no factor with K.
    pub coprime: Vec<bool>,
    /// Dense 1-based ordinal per position; 0 is the forced-composite sentinel.
    pub i_reindex: Vec<u32>,
    /// The coprime positions themselves, ascending.
    pub coprime_x: Vec<u32>,
    /// Wheel modulus W (1 when D has no factor in {2, 3, 5}).
    pub wheel: u32,
    /// Per residue `m mod W`: the wheel-refined reindex. Empty for residues
    /// not coprime to W (those m are invalid anyway).
    pub wheel_reindex: Vec<Vec<u32>>,
    /// Coprime count per residue (the per-m bitmap length minus the sentinel).
    pub wheel_count: Vec<usize>,
}

impl Reindex {
    /// Build masks and reindex tables.
    ///
    /// `p_primes` are all primes ≤ P; `k` is the residue oracle for K.
    pub fn build(p_primes: &[u64], d: u64, sl: u32, k: &BigResidue) -> Result<Reindex> {
        let sieve_interval = sl
            .checked_mul(2)
            .and_then(|v| v.checked_add(1))
            .ok_or_else(|| anyhow::anyhow!("sieve interval overflows u32 (SL = {})", sl))?;

        let mut coprime = vec![true; sieve_interval as usize];
        for &prime in p_primes {
            if d % prime == 0 {
                continue;
            }
            // x ≡ SL (mod p) ⇔ p divides the offset x − SL.
            let mut x = (sl as u64 % prime) as usize;
            while x < sieve_interval as usize {
                coprime[x] = false;
                x += prime as usize;
            }
        }
        // The centre offset 0 is divisible by every prime of K.
        assert!(!coprime[sl as usize]);

        let mut i_reindex = vec![0u32; sieve_interval as usize];
        let mut coprime_x = Vec::new();
        let mut count = 0u32;
        for (x, &ok) in coprime.iter().enumerate() {
            if ok {
                count += 1;
                i_reindex[x] = count;
                coprime_x.push(x as u32);
            }
        }
        assert_eq!(i_reindex[sl as usize], 0);
        // Coprime positions pair up symmetrically around the centre.
        ensure!(count % 2 == 0, "coprime position count {} is odd", count);

        // Larger wheel compresses more but multiplies table space.
        let wheel = gcd(d, if sieve_interval < 80_000 { 30 } else { 6 }) as u32;

        let k_mod_wheel = if wheel > 1 { k.rem(wheel as u64) as u32 } else { 0 };
        let mut wheel_reindex = vec![Vec::new(); wheel as usize];
        let mut wheel_count = vec![0usize; wheel as usize];
        // Residue 0 so the W = 1 (D without wheel primes) case still builds
        // its single table.
        for r in 0..wheel {
            if gcd(r as u64, wheel as u64) > 1 {
                continue;
            }
            let table = &mut wheel_reindex[r as usize];
            table.resize(sieve_interval as usize, 0);

            // (m·K − SL) mod W for m ≡ r: the left endpoint's wheel class.
            let mod_center = (r * k_mod_wheel) % wheel;
            let mod_low = (mod_center + wheel - sl % wheel) % wheel;

            let mut count = 0u32;
            for &x in &coprime_x {
                if gcd((mod_low + x % wheel) as u64 % wheel as u64, wheel as u64) == 1 {
                    count += 1;
                    table[x as usize] = count;
                }
            }
            wheel_count[r as usize] = count as usize;
        }

        Ok(Reindex {
            sl,
            sieve_interval,
            coprime,
            i_reindex,
            coprime_x,
            wheel,
            wheel_reindex,
            wheel_count,
        })
    }

    /// Bitmap length for multiplier m: wheel-refined coprime count plus the
    /// sentinel slot.
    #[inline]
    pub fn composite_len(&self, m: u64) -> usize {
        self.wheel_count[(m % self.wheel as u64) as usize] + 1
    }

    /// The reindex table to use for multiplier m.
    #[inline]
    pub fn table_for(&self, m: u64) -> &[u32] {
        &self.wheel_reindex[(m % self.wheel as u64) as usize]
    }
}
