//! Alias table for O(1) weighted sampling
//!
//! Built with Vose's method: Θ(n) construction, two uniform draws per
//! sample, exact categorical distribution up to accumulated float error.
//!
//! The table stores, per cell, an acceptance threshold in [0,1] and an
//! alias index. Sampling picks a cell uniformly, then keeps it or takes
//! its alias depending on a biased coin against the threshold.

use markgen_core::{Error, Result};
use rand::Rng;

/// Precomputed alias structure over a weight vector.
///
/// Index `i` of the table corresponds to index `i` of the weights it was
/// built from; callers map sampled indices back to their own entries.
#[derive(Debug, Clone)]
pub struct AliasTable {
    threshold: Vec<f64>,
    alias: Vec<usize>,
}

impl AliasTable {
    /// Build a table from positive integer weights.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if the weight vector is empty or sums to zero.
    /// Neither can occur for weights coming out of a `PrefixEntry`, whose
    /// invariants forbid empty lists and zero weights.
    pub fn build(weights: &[u64]) -> Result<Self> {
        let n = weights.len();
        if n == 0 {
            return Err(Error::invalid_input("alias table needs at least one weight"));
        }
        let total: f64 = weights.iter().map(|&w| w as f64).sum();
        if total <= 0.0 {
            return Err(Error::invalid_input("alias table weights sum to zero"));
        }

        // Scale each weight so the average cell mass is 1.
        let mut scaled: Vec<f64> = weights
            .iter()
            .map(|&w| (w as f64) * (n as f64) / total)
            .collect();

        let mut threshold = vec![0.0f64; n];
        let mut alias: Vec<usize> = (0..n).collect();

        let mut small: Vec<usize> = Vec::with_capacity(n);
        let mut large: Vec<usize> = Vec::with_capacity(n);
        for (i, &p) in scaled.iter().enumerate() {
            if p < 1.0 {
                small.push(i);
            } else {
                large.push(i);
            }
        }

        // Pair each under-full cell with an over-full donor. The donor's
        // remaining mass is reduced by exactly what the small cell lacks;
        // subtraction order matters for float stability.
        while let (Some(s), Some(l)) = (small.pop(), large.pop()) {
            threshold[s] = scaled[s];
            alias[s] = l;
            scaled[l] -= 1.0 - scaled[s];
            if scaled[l] < 1.0 {
                small.push(l);
            } else {
                large.push(l);
            }
        }

        // Whatever remains in either worklist is full (mass 1 up to
        // rounding); aliases stay self-referential.
        for i in large.into_iter().chain(small) {
            threshold[i] = 1.0;
            alias[i] = i;
        }

        Ok(AliasTable { threshold, alias })
    }

    /// Number of cells; equals the weight count the table was built from.
    pub fn len(&self) -> usize {
        self.threshold.len()
    }

    /// Whether the table has no cells. Never true for a built table.
    pub fn is_empty(&self) -> bool {
        self.threshold.is_empty()
    }

    /// Draw one index with probability proportional to its weight.
    ///
    /// Two RNG draws, constant time.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let i = rng.gen_range(0..self.threshold.len());
        let u: f64 = rng.gen();
        if u < self.threshold[i] {
            i
        } else {
            self.alias[i]
        }
    }
}
