//! Per-prefix suffix accumulator
//!
//! A `PrefixEntry` collects the suffixes observed after one prefix,
//! merging repeated observations into weights, and lazily builds an
//! `AliasTable` on first sample after a mutation. The suffix list is a
//! short flat vector: linear-scan merge beats hashing at the counts seen
//! in practice, and it preserves insertion order for snapshot writing.

use crate::alias::AliasTable;
use markgen_core::SuffixEntry;
use parking_lot::Mutex;
use rand::Rng;
use smallvec::SmallVec;
use tracing::error;

/// Suffix distribution for one prefix.
///
/// Invariants:
/// - suffix tokens are unique (observations merge on insert)
/// - `total_weight` equals the sum of suffix weights at all times
/// - a cached alias table, if present, reflects the current suffix list
#[derive(Debug, Default)]
pub struct PrefixEntry {
    suffixes: SmallVec<[SuffixEntry; 4]>,
    total_weight: u64,
    /// Lazily built sampling table; `None` after any mutation. Guarded by
    /// its own mutex so samplers of other prefixes never touch it.
    alias: Mutex<Option<AliasTable>>,
}

impl PrefixEntry {
    /// Create an empty entry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one observation into the entry and invalidate the table.
    ///
    /// The caller validates `weight >= 1` and token non-emptiness.
    pub fn insert(&mut self, word: &str, weight: u64) {
        match self.suffixes.iter_mut().find(|s| s.word == word) {
            Some(existing) => existing.weight += weight,
            None => self.suffixes.push(SuffixEntry::new(word, weight)),
        }
        self.total_weight += weight;
        *self.alias.get_mut() = None;
    }

    /// Sum of all suffix weights.
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Number of distinct suffixes.
    pub fn suffix_count(&self) -> usize {
        self.suffixes.len()
    }

    /// Suffixes in insertion order, for persistence and export.
    pub fn suffixes(&self) -> &[SuffixEntry] {
        &self.suffixes
    }

    /// Whether a built alias table is currently cached.
    pub fn has_alias_table(&self) -> bool {
        self.alias.lock().is_some()
    }

    /// Draw one suffix with probability proportional to its weight.
    ///
    /// Zero suffixes yield `None`; a single suffix is returned directly
    /// without building a table; otherwise the alias table is (re)built
    /// lazily and consulted with one draw.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&str> {
        match self.suffixes.len() {
            0 => None,
            1 => Some(self.suffixes[0].word.as_str()),
            _ => {
                let idx = {
                    let mut cached = self.alias.lock();
                    if cached.is_none() {
                        let weights: Vec<u64> =
                            self.suffixes.iter().map(|s| s.weight).collect();
                        match AliasTable::build(&weights) {
                            Ok(table) => *cached = Some(table),
                            Err(e) => {
                                // Unreachable while entry invariants hold
                                error!(error = %e, "alias table build failed");
                                return None;
                            }
                        }
                    }
                    cached.as_ref().map(|t| t.sample(rng))?
                };
                Some(self.suffixes[idx].word.as_str())
            }
        }
    }

    /// Rough resident-byte estimate for this entry.
    pub fn approx_bytes(&self) -> u64 {
        let base = std::mem::size_of::<PrefixEntry>() as u64;
        let suffix_overhead = std::mem::size_of::<SuffixEntry>() as u64;
        self.suffixes
            .iter()
            .map(|s| s.word.len() as u64 + suffix_overhead)
            .sum::<u64>()
            + base
    }
}
