use std::collections::HashMap;
use std::fmt;

use crate::Word;

/// Entries included in a `HistogramReport`.
pub const TOP_K_REPORTED: usize = 10;

/// Per-value observation counts accumulated over a listener session.
///
/// Counts only grow. Ordering among values with equal counts in
/// `finalize`/`top_k` follows hash-map iteration and is not stable between
/// runs.
#[derive(Debug, Clone, Default)]
pub struct Histogram {
    counts: HashMap<Word, u64>,
    canary: Option<(Word, u64)>,
    total_observations: u64,
    buffers_observed: u64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks `canary` with its own counter alongside the full table.
    pub fn with_canary(canary: Word) -> Self {
        Self {
            canary: Some((canary, 0)),
            ..Self::default()
        }
    }

    pub fn observe(&mut self, buffer: &[Word]) {
        for &word in buffer {
            *self.counts.entry(word).or_insert(0) += 1;
        }
        if let Some((canary, count)) = self.canary.as_mut() {
            let hits = buffer.iter().filter(|&&word| word == *canary).count();
            *count += hits as u64;
        }
        self.total_observations += buffer.len() as u64;
        self.buffers_observed += 1;
    }

    /// Cumulative count of `value` across every observed buffer.
    pub fn canary_count(&self, value: Word) -> u64 {
        match self.canary {
            Some((canary, count)) if canary == value => count,
            _ => self.counts.get(&value).copied().unwrap_or(0),
        }
    }

    /// All `(value, count)` pairs, most frequent first.
    pub fn finalize(&self) -> Vec<(Word, u64)> {
        let mut entries: Vec<(Word, u64)> = self
            .counts
            .iter()
            .map(|(&value, &count)| (value, count))
            .collect();
        entries.sort_unstable_by(|a, b| b.1.cmp(&a.1));
        entries
    }

    pub fn top_k(&self, k: usize) -> Vec<(Word, u64)> {
        let mut entries = self.finalize();
        entries.truncate(k);
        entries
    }

    pub fn total_observations(&self) -> u64 {
        self.total_observations
    }

    pub fn distinct_values(&self) -> usize {
        self.counts.len()
    }

    pub fn buffers_observed(&self) -> u64 {
        self.buffers_observed
    }

    /// Number of observed words that were not zero (a count, not a sum of
    /// their values). Anything nonzero is likely left over from another
    /// dispatch.
    pub fn residue_words(&self) -> u64 {
        self.total_observations - self.counts.get(&0).copied().unwrap_or(0)
    }

    pub fn report(&self, canary: Word) -> HistogramReport {
        HistogramReport {
            canary,
            canary_count: self.canary_count(canary),
            top: self.top_k(TOP_K_REPORTED),
            total_observations: self.total_observations,
            residue_words: self.residue_words(),
            buffers_observed: self.buffers_observed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramReport {
    pub canary: Word,
    pub canary_count: u64,
    pub top: Vec<(Word, u64)>,
    pub total_observations: u64,
    pub residue_words: u64,
    pub buffers_observed: u64,
}

impl fmt::Display for HistogramReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "How many times observed canary value ({}): {}\n---\nHistogram of top {} observed values:\n---\n",
            self.canary, self.canary_count, TOP_K_REPORTED
        )?;
        for (value, frequency) in &self.top {
            writeln!(f, "({value}, {frequency})")?;
        }
        Ok(())
    }
}
