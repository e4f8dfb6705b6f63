use std::any::Any;

use sketches_protos::sketches::Store as ProtoStore;
use tracing::debug;

use super::{Store, GROWTH_BUFFER};
use crate::encoding::{self, Flag, FlagType, BIN_ENCODING_CONTIGUOUS_COUNTS};

/// A dense store that collapses highest-indexed bins when the bin budget is exceeded.
///
/// The mirror image of [`CollapsingLowestDenseStore`](super::CollapsingLowestDenseStore):
/// when adding a new index would exceed the bin budget, the highest-indexed bins are summed
/// into the highest surviving bin, preserving accuracy for the lower quantiles.
///
/// Use this store when lower quantiles (e.g., p1, p5) matter most.
#[derive(Clone, Debug)]
pub struct CollapsingHighestDenseStore {
    /// The bin counts, stored contiguously.
    bins: Vec<f64>,

    /// Total count across all bins.
    count: f64,

    /// The index that the first slot of `bins` corresponds to.
    min_index: i32,

    /// The index that the last slot of `bins` corresponds to.
    max_index: i32,

    /// Maximum number of bins to maintain.
    max_num_bins: usize,

    /// Whether collapsing has occurred.
    is_collapsed: bool,
}

impl CollapsingHighestDenseStore {
    /// Creates an empty `CollapsingHighestDenseStore` with the given maximum number of bins.
    pub fn new(max_num_bins: usize) -> Self {
        assert!(max_num_bins >= 1, "max_num_bins must be at least 1");
        Self {
            bins: Vec::new(),
            count: 0.0,
            min_index: 0,
            max_index: 0,
            max_num_bins,
            is_collapsed: false,
        }
    }

    /// Returns `true` if this store has collapsed bins.
    ///
    /// If true, accuracy guarantees no longer hold for the highest quantiles.
    pub fn is_collapsed(&self) -> bool {
        self.is_collapsed
    }

    fn mark_collapsed(&mut self) {
        if !self.is_collapsed {
            self.is_collapsed = true;
            debug!(max_num_bins = self.max_num_bins, "bin budget exceeded, collapsing highest bins");
        }
    }

    /// Ensures the backing array covers the given index as far as the bin budget allows.
    fn grow(&mut self, index: i32) {
        if self.bins.is_empty() {
            let len = (GROWTH_BUFFER as usize).min(self.max_num_bins);
            self.bins.resize(len, 0.0);
            self.min_index = index;
            self.max_index = index + self.bins.len() as i32 - 1;
            return;
        }
        if index < self.min_index {
            self.grow_left(index);
        } else if index > self.max_index {
            self.grow_right(index);
        }
    }

    fn grow_left(&mut self, index: i32) {
        if self.min_index < index {
            return;
        }

        if index <= self.min_index - self.max_num_bins as i32 {
            // Everything currently tracked collapses into the highest bin of the new range.
            self.mark_collapsed();
            self.bins.clear();
            self.bins.resize(self.max_num_bins, 0.0);
            self.min_index = index;
            self.max_index = index + self.max_num_bins as i32 - 1;
            self.bins[self.max_num_bins - 1] = self.count;
        } else if index <= self.max_index - self.max_num_bins as i32 {
            let max_index = index + self.max_num_bins as i32 - 1;

            let mut collapsed = 0.0;
            let mut i = (max_index + 1).max(self.min_index);
            while i <= self.max_index {
                collapsed += self.bins[(i - self.min_index) as usize];
                i += 1;
            }
            if collapsed > 0.0 {
                self.mark_collapsed();
            }

            // Shift the kept counts towards the end of a budget-sized array.
            let shift = (self.min_index - index) as usize;
            self.bins.resize(self.max_num_bins, 0.0);
            self.bins.copy_within(..self.max_num_bins - shift, shift);
            for bin in &mut self.bins[..shift] {
                *bin = 0.0;
            }

            self.min_index = index;
            self.max_index = max_index;
            self.bins[self.max_num_bins - 1] += collapsed;
        } else {
            let mut tmp_bins = vec![0.0; (self.max_index - index + 1) as usize];
            tmp_bins[(self.min_index - index) as usize..].copy_from_slice(&self.bins);
            self.bins = tmp_bins;
            self.min_index = index;
        }
    }

    fn grow_right(&mut self, index: i32) {
        if self.max_index > index || self.bins.len() >= self.max_num_bins {
            return;
        }

        let max_index = if index >= self.min_index + self.max_num_bins as i32 {
            self.min_index + self.max_num_bins as i32 - 1
        } else {
            // Expand bins by up to an extra GROWTH_BUFFER bins than strictly required.
            (index + GROWTH_BUFFER).min(self.min_index + self.max_num_bins as i32 - 1)
        };

        self.bins.resize((max_index - self.min_index + 1) as usize, 0.0);
        self.max_index = max_index;
    }
}

impl Store for CollapsingHighestDenseStore {
    fn add_with_count(&mut self, index: i32, count: f64) {
        if count == 0.0 {
            return;
        }

        self.grow(index);
        let idx = if index > self.max_index {
            // The index fell victim to the bin budget; its count goes to the highest bin.
            self.mark_collapsed();
            self.bins.len() - 1
        } else {
            (index - self.min_index) as usize
        };
        self.bins[idx] += count;
        self.count += count;
    }

    fn is_empty(&self) -> bool {
        self.count == 0.0
    }

    fn total_count(&self) -> f64 {
        self.count
    }

    fn min_index(&self) -> Option<i32> {
        if self.count == 0.0 {
            return None;
        }

        for (i, &count) in self.bins.iter().enumerate() {
            if count > 0.0 {
                return Some(self.min_index + i as i32);
            }
        }
        None
    }

    fn max_index(&self) -> Option<i32> {
        if self.count == 0.0 {
            return None;
        }

        for (i, &count) in self.bins.iter().enumerate().rev() {
            if count > 0.0 {
                return Some(self.min_index + i as i32);
            }
        }
        None
    }

    fn key_at_rank(&self, rank: f64) -> Option<i32> {
        if self.count == 0.0 {
            return None;
        }

        let rank = rank.max(0.0);
        let mut cumulative = 0.0;
        for (i, &count) in self.bins.iter().enumerate() {
            cumulative += count;
            if cumulative > rank {
                return Some(self.min_index + i as i32);
            }
        }
        self.max_index()
    }

    fn for_each<F: FnMut(i32, f64) -> bool>(&self, mut f: F) {
        for (i, &count) in self.bins.iter().enumerate() {
            if count > 0.0 && f(self.min_index + i as i32, count) {
                return;
            }
        }
    }

    fn merge_with<O: Store>(&mut self, other: &O) {
        if other.total_count() == 0.0 {
            return;
        }

        let Some(o) = (other as &dyn Any).downcast_ref::<CollapsingHighestDenseStore>() else {
            other.for_each(|index, count| {
                self.add_with_count(index, count);
                false
            });
            return;
        };

        if self.count == 0.0 {
            let max_num_bins = self.max_num_bins;
            *self = o.clone();
            self.max_num_bins = max_num_bins;
            return;
        }

        if o.is_collapsed {
            self.mark_collapsed();
        }

        self.grow_left(o.min_index);
        self.grow_right(o.max_index);

        let mut collapsed = 0.0;
        for index in o.min_index..=o.max_index {
            let count = o.bins[(index - o.min_index) as usize];
            if index > self.max_index {
                collapsed += count;
            } else {
                self.bins[(index - self.min_index) as usize] += count;
            }
        }
        if collapsed > 0.0 {
            self.mark_collapsed();
            let last = self.bins.len() - 1;
            self.bins[last] += collapsed;
        }
        self.count += o.count;
    }

    fn clear(&mut self) {
        self.bins.clear();
        self.count = 0.0;
        self.min_index = 0;
        self.max_index = 0;
        self.is_collapsed = false;
    }

    fn reweight(&mut self, w: f64) {
        for count in &mut self.bins {
            *count *= w;
        }
        self.count *= w;
    }

    fn encode(&self, out: &mut Vec<u8>, flag_type: FlagType) {
        if self.count == 0.0 {
            return;
        }

        encoding::encode_flag(out, Flag::new(flag_type, BIN_ENCODING_CONTIGUOUS_COUNTS));
        encoding::encode_uvarint64(out, self.bins.len() as u64);
        encoding::encode_varint64(out, self.min_index as i64);
        encoding::encode_varint64(out, 1);
        for &count in &self.bins {
            encoding::encode_varfloat64(out, count);
        }
    }

    fn to_proto(&self) -> ProtoStore {
        let mut proto = ProtoStore::new();

        if self.count == 0.0 {
            return proto;
        }

        proto.contiguousBinIndexOffset = self.min_index;
        proto.contiguousBinCounts = self.bins.clone();

        proto
    }
}

impl Default for CollapsingHighestDenseStore {
    /// Creates a collapsing highest dense store with a default budget of 2048 bins.
    fn default() -> Self {
        Self::new(2048)
    }
}
