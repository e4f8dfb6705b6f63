//! Rank-error quantile summary.

use ordered_float::OrderedFloat;
use smallvec::SmallVec;
use tracing::trace;

use crate::error::SketchError;

/// The rank accuracy used when none is specified.
pub const DEFAULT_EPSILON: f64 = 0.01;

/// An element of the summary. For the definition of `g` and `delta`, see the original paper:
/// <http://infolab.stanford.edu/~datar/courses/cs361a/papers/quantiles.pdf>
#[derive(Clone, Copy, Debug, PartialEq)]
struct Entry {
    v: f64,
    g: u32,
    delta: u32,
}

/// A Greenwald–Khanna quantile summary with a buffer for incoming values.
///
/// Quantile estimates carry a rank error of at most `epsilon * n`, without any assumption on
/// the input distribution. Once [`merge_with`](Self::merge_with) has been called, the
/// guarantee loosens to `2 * epsilon * n`.
///
/// # Example
///
/// ```
/// use sketches::GKArray;
///
/// let mut summary = GKArray::new(0.01).unwrap();
/// for i in 0..1000 {
///     summary.add(i as f64);
/// }
///
/// let median = summary.quantile(0.5);
/// assert!(median >= 480.0 && median <= 520.0);
/// ```
#[derive(Clone, Debug)]
pub struct GKArray {
    /// The rank accuracy of the summary.
    epsilon: f64,

    /// The summary bands, ordered by value; the last entry is always the maximum inserted
    /// value.
    entries: SmallVec<[Entry; 4]>,

    /// Values waiting to be folded into the summary.
    incoming: Vec<f64>,

    /// The minimum value seen so far.
    min: f64,

    /// The maximum value seen so far.
    max: f64,

    /// The number of values seen so far.
    count: u64,

    /// The sum of the values seen so far.
    sum: f64,
}

impl GKArray {
    /// Creates a new summary with the given rank accuracy.
    ///
    /// # Errors
    ///
    /// Returns an error if epsilon is not in the valid range (0, 1).
    pub fn new(epsilon: f64) -> Result<Self, SketchError> {
        if !(epsilon > 0.0 && epsilon < 1.0) {
            return Err(SketchError::InvalidArgument {
                reason: "epsilon must be between 0 and 1 (exclusive)",
            });
        }
        Ok(Self {
            epsilon,
            entries: SmallVec::new(),
            // Preallocate the incoming buffer for better insert throughput.
            incoming: Vec::with_capacity((1.0 / epsilon) as usize + 1),
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            count: 0,
            sum: 0.0,
        })
    }

    /// Returns the rank accuracy of the summary.
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Adds a new value to the summary.
    pub fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.incoming.push(value);
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
        if self.count % ((1.0 / self.epsilon) as u64 + 1) == 0 {
            self.compress();
        }
    }

    /// Returns an epsilon-accurate estimate of the value at the given quantile.
    ///
    /// Returns NaN when the quantile is outside `[0, 1]` or the summary is empty. Flushes the
    /// incoming buffer, so the summary itself may compress; estimates are unchanged by the
    /// flush and repeated calls return identical results.
    pub fn quantile(&mut self, q: f64) -> f64 {
        if !(0.0..=1.0).contains(&q) || self.count == 0 {
            return f64::NAN;
        }

        if !self.incoming.is_empty() {
            self.compress();
        }

        let rank = (q * (self.count - 1) as f64) as i64 + 1;
        let spread = (self.epsilon * (self.count - 1) as f64) as i64;
        let mut g_sum = 0i64;
        let mut i = 0;
        while i < self.entries.len() {
            g_sum += self.entries[i].g as i64;
            if g_sum + self.entries[i].delta as i64 > rank + spread {
                break;
            }
            i += 1;
        }
        if i == 0 {
            return self.min;
        }
        self.entries[i - 1].v
    }

    /// Returns the number of values in the summary.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Returns the sum of the values in the summary.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Returns the average of the values in the summary.
    pub fn avg(&self) -> f64 {
        self.sum / self.count as f64
    }

    /// Returns the minimum value in the summary, or `None` if it is empty.
    pub fn min(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.min)
        }
    }

    /// Returns the maximum value in the summary, or `None` if it is empty.
    pub fn max(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.max)
        }
    }

    /// Returns `true` if the summary holds no values.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Folds the incoming buffer into the summary bands.
    pub fn compress(&mut self) {
        self.compress_with(Vec::new());
    }

    /// Merges another summary into this one, in place. The other summary is unchanged.
    ///
    /// The merged summary carries a `2 * epsilon * n` rank-error guarantee: the other
    /// summary's bands are re-inserted as new observations whose own rank error is bounded by
    /// epsilon, on top of the epsilon error of this summary.
    ///
    /// # Errors
    ///
    /// If the two summaries have different epsilons, an error is returned and this summary is
    /// unchanged.
    pub fn merge_with(&mut self, other: &GKArray) -> Result<(), SketchError> {
        if other.epsilon != self.epsilon {
            return Err(SketchError::IncompatibleEpsilon {
                expected: self.epsilon,
                actual: other.epsilon,
            });
        }
        if other.count == 0 {
            return Ok(());
        }
        if self.count == 0 {
            *self = other.clone();
            return Ok(());
        }

        // Work on a flushed view of the other summary without mutating it.
        let flushed;
        let other = if other.incoming.is_empty() {
            other
        } else {
            let mut compressed = other.clone();
            compressed.compress();
            flushed = compressed;
            &flushed
        };

        // Turn the other summary's bands into incoming entries: counting how often each band
        // value would be returned when querying the quantiles i/(count-1) spares inserting
        // every value individually, while keeping the total count intact.
        let spread = (other.epsilon * (other.count - 1) as f64) as i64;
        let mut incoming_entries = Vec::with_capacity(other.entries.len() + 1);

        let first = other.entries[0];
        let leading = first.g as i64 + first.delta as i64 - spread - 1;
        if leading > 0 {
            // Back-date the leading band to the other summary's minimum.
            incoming_entries.push(Entry {
                v: other.min,
                g: leading as u32,
                delta: 0,
            });
        }
        for i in 0..other.entries.len() - 1 {
            let g = (other.entries[i + 1].g as i64 + other.entries[i + 1].delta as i64
                - other.entries[i].delta as i64)
                .max(0);
            incoming_entries.push(Entry {
                v: other.entries[i].v,
                g: g as u32,
                delta: 0,
            });
        }
        incoming_entries.push(Entry {
            v: other.entries[other.entries.len() - 1].v,
            g: spread as u32 + 1,
            delta: 0,
        });

        self.count += other.count;
        self.sum += other.sum;
        if other.min < self.min {
            self.min = other.min;
        }
        if other.max > self.max {
            self.max = other.max;
        }
        self.compress_with(incoming_entries);
        Ok(())
    }

    /// Merges the given entries and the incoming buffer into the summary bands, dropping the
    /// bands that the removal threshold allows.
    fn compress_with(&mut self, mut incoming: Vec<Entry>) {
        incoming.reserve(self.incoming.len());
        for &v in &self.incoming {
            incoming.push(Entry { v, g: 1, delta: 0 });
        }
        incoming.sort_unstable_by_key(|entry| OrderedFloat(entry.v));

        let removal_threshold = 2 * (self.epsilon * (self.count.saturating_sub(1)) as f64) as u64;
        let mut merged: SmallVec<[Entry; 4]> =
            SmallVec::with_capacity(self.entries.len() + incoming.len() / 3);

        let mut i = 0;
        let mut j = 0;
        while i < incoming.len() || j < self.entries.len() {
            if j == self.entries.len() {
                // Done with the summary bands; only incoming entries remain.
                if i + 1 < incoming.len()
                    && incoming[i].g as u64 + incoming[i + 1].g as u64 <= removal_threshold
                {
                    incoming[i + 1].g += incoming[i].g;
                } else {
                    merged.push(incoming[i]);
                }
                i += 1;
            } else if i < incoming.len() && incoming[i].v < self.entries[j].v {
                if incoming[i].g as u64 + self.entries[j].g as u64 + self.entries[j].delta as u64
                    <= removal_threshold
                {
                    // Absorbable into the next band.
                    self.entries[j].g += incoming[i].g;
                } else {
                    incoming[i].delta = (self.entries[j].g as u64 + self.entries[j].delta as u64)
                        .saturating_sub(incoming[i].g as u64)
                        as u32;
                    merged.push(incoming[i]);
                }
                i += 1;
            } else {
                if j + 1 < self.entries.len()
                    && self.entries[j].g as u64
                        + self.entries[j + 1].g as u64
                        + self.entries[j + 1].delta as u64
                        <= removal_threshold
                {
                    // Absorbable into the next band.
                    self.entries[j + 1].g += self.entries[j].g;
                } else {
                    merged.push(self.entries[j]);
                }
                j += 1;
            }
        }
        trace!(bands = merged.len(), threshold = removal_threshold, "compressed summary");
        self.entries = merged;
        self.incoming.clear();
    }

    #[cfg(test)]
    fn g_sum(&self) -> u64 {
        self.entries.iter().map(|entry| entry.g as u64).sum::<u64>() + self.incoming.len() as u64
    }
}

impl Default for GKArray {
    /// Creates a summary with the default rank accuracy of 1%.
    fn default() -> Self {
        Self::new(DEFAULT_EPSILON).expect("the default epsilon is valid")
    }
}
