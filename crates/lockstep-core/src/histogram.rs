//! Latency and checkpoint-interval histograms.
//!
//! [`LatencyHistogram`] keeps a fixed number of buckets over a range that
//! doubles (merging neighbours pairwise) whenever a sample does not fit.
//! [`IntervalHistogram`] buckets instruction counts relative to the
//! configured checkpoint timeout.

use std::io::{self, Write};

/// Buckets per latency histogram.
pub const LATENCY_BUCKETS: usize = 500;

/// Samples above this go to the big bucket instead of widening the range.
pub const BIG_BUCKET_LIMIT: u64 = 20_480_000;

/// Initial range of the record-to-replay delay histogram, in ticks.
pub const REPLAY_DELAY_RANGE: u64 = 100_000;

/// Initial range of the checkpoint-length histogram, in ticks.
pub const CHECKPOINT_TICKS_RANGE: u64 = 10_000;

/// Initial range of the checker checkpoint-length histogram, in cycles.
pub const CHECKER_CYCLES_RANGE: u64 = 100;

/// Count, sum, and extremes of the samples in one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistogramBucket {
    pub number: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
}

impl HistogramBucket {
    pub const EMPTY: Self = Self {
        number: 0,
        sum: 0,
        min: u64::MAX,
        max: 0,
    };

    pub fn add(&mut self, value: u64) {
        self.number += 1;
        self.sum = self.sum.saturating_add(value);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            number: self.number + other.number,
            sum: self.sum.saturating_add(other.sum),
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Minimum, or 0 for an empty bucket.
    pub fn min_or_zero(&self) -> u64 {
        if self.number == 0 { 0 } else { self.min }
    }

    pub fn mean(&self) -> u64 {
        self.sum.checked_div(self.number).unwrap_or(0)
    }

    fn render(&self, out: &mut impl Write, label: impl std::fmt::Display) -> io::Result<()> {
        writeln!(
            out,
            "{label} : {} : {} : {} : {}",
            self.number,
            self.min_or_zero(),
            self.max,
            self.mean()
        )
    }
}

impl Default for HistogramBucket {
    fn default() -> Self {
        Self::EMPTY
    }
}

// ---------------------------------------------------------------------------
// LatencyHistogram
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyHistogram {
    range: u64,
    buckets: Vec<HistogramBucket>,
    big: HistogramBucket,
}

impl LatencyHistogram {
    pub fn new(initial_range: u64) -> Self {
        Self {
            range: initial_range.max(1),
            buckets: vec![HistogramBucket::EMPTY; LATENCY_BUCKETS],
            big: HistogramBucket::EMPTY,
        }
    }

    pub fn range(&self) -> u64 {
        self.range
    }

    pub fn buckets(&self) -> &[HistogramBucket] {
        &self.buckets
    }

    pub fn big_bucket(&self) -> &HistogramBucket {
        &self.big
    }

    /// Total samples, big bucket included.
    pub fn count(&self) -> u64 {
        self.buckets.iter().map(|b| b.number).sum::<u64>() + self.big.number
    }

    pub fn record(&mut self, value: u64) {
        if value > BIG_BUCKET_LIMIT {
            self.big.add(value);
            return;
        }
        while self.range <= value {
            self.widen();
        }
        let index = value as u128 * LATENCY_BUCKETS as u128 / u128::from(self.range);
        let index = usize::try_from(index).unwrap_or(LATENCY_BUCKETS - 1);
        self.buckets[index.min(LATENCY_BUCKETS - 1)].add(value);
    }

    fn widen(&mut self) {
        self.range *= 2;
        for i in 0..LATENCY_BUCKETS / 2 {
            self.buckets[i] = self.buckets[2 * i].merge(self.buckets[2 * i + 1]);
        }
        for bucket in &mut self.buckets[LATENCY_BUCKETS / 2..] {
            *bucket = HistogramBucket::EMPTY;
        }
    }

    /// Write `size : number : min : max : mean` lines plus the big bucket.
    pub fn render(&self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "size : number : min : max : mean")?;
        for (i, bucket) in self.buckets.iter().enumerate() {
            let lower = i as u64 * self.range / LATENCY_BUCKETS as u64;
            bucket.render(out, lower)?;
        }
        self.big.render(out, "bigbucket")
    }
}

// ---------------------------------------------------------------------------
// IntervalHistogram
// ---------------------------------------------------------------------------

/// Counts of instruction intervals in buckets of width `timeout / 10`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalHistogram {
    timeout: u64,
    entries: u64,
    counts: Vec<u64>,
}

impl IntervalHistogram {
    pub fn new(timeout: u64) -> Self {
        let entries = (timeout / 10).max(1);
        Self {
            timeout: timeout.max(1),
            entries,
            counts: vec![0; usize::try_from(entries + 1).unwrap_or(1)],
        }
    }

    fn index(&self, value: u64) -> usize {
        let index = u128::from(value) * u128::from(self.entries) / u128::from(self.timeout);
        usize::try_from(index).unwrap_or(usize::MAX)
    }

    /// Count one interval; values past the timeout grow the vector.
    pub fn record(&mut self, value: u64) {
        let index = self.index(value);
        if index >= self.counts.len() {
            self.counts.resize(index + 1, 0);
        }
        self.counts[index] += 1;
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Write `size : number` lines; buckets past the timeout only when
    /// non-empty.
    pub fn render(&self, out: &mut impl Write, title: &str) -> io::Result<()> {
        writeln!(out, "{title}")?;
        writeln!(out, "size : number")?;
        let fixed = usize::try_from(self.entries + 1).unwrap_or(usize::MAX);
        for (i, &count) in self.counts.iter().enumerate() {
            if i < fixed || count > 0 {
                let lower = i as u64 * self.timeout / self.entries;
                writeln!(out, "{lower} : {count}")?;
            }
        }
        Ok(())
    }
}
