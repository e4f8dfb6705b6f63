use std::any::Any;

use sketches_protos::sketches::Store as ProtoStore;
use tracing::debug;

use super::{Store, GROWTH_BUFFER};
use crate::encoding::{self, Flag, FlagType, BIN_ENCODING_CONTIGUOUS_COUNTS};

/// A dense store that collapses lowest-indexed bins when the bin budget is exceeded.
///
/// This store maintains a maximum number of bins. When adding a new index would exceed this
/// limit, the lowest-indexed bins are summed into the lowest surviving bin, sacrificing
/// accuracy for lower quantiles to preserve accuracy for higher quantiles.
///
/// Use this store when:
/// - You need bounded memory usage
/// - Higher quantiles (e.g., p95, p99) are more important than lower quantiles
/// - You're tracking latencies or other metrics where the tail matters most
#[derive(Clone, Debug)]
pub struct CollapsingLowestDenseStore {
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

impl CollapsingLowestDenseStore {
    /// Creates an empty `CollapsingLowestDenseStore` with the given maximum number of bins.
    ///
    /// Bins are not allocated until values are added; the array then grows as needed up to
    /// `max_num_bins`.
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
    /// If true, accuracy guarantees no longer hold for the lowest quantiles.
    pub fn is_collapsed(&self) -> bool {
        self.is_collapsed
    }

    fn mark_collapsed(&mut self) {
        if !self.is_collapsed {
            self.is_collapsed = true;
            debug!(max_num_bins = self.max_num_bins, "bin budget exceeded, collapsing lowest bins");
        }
    }

    /// Ensures the backing array covers the given index as far as the bin budget allows.
    fn grow(&mut self, index: i32) {
        if self.bins.is_empty() {
            let len = (GROWTH_BUFFER as usize).min(self.max_num_bins);
            self.bins.resize(len, 0.0);
            self.max_index = index;
            self.min_index = index - self.bins.len() as i32 + 1;
            return;
        }
        if index < self.min_index {
            self.grow_left(index);
        } else if index > self.max_index {
            self.grow_right(index);
        }
    }

    fn grow_left(&mut self, index: i32) {
        if self.min_index < index || self.bins.len() >= self.max_num_bins {
            return;
        }

        let min_index = if self.max_index >= index + self.max_num_bins as i32 {
            self.max_index - self.max_num_bins as i32 + 1
        } else {
            // Expand bins by up to an extra GROWTH_BUFFER bins than strictly required.
            (index - GROWTH_BUFFER).max(self.max_index - self.max_num_bins as i32 + 1)
        };

        let mut tmp_bins = vec![0.0; (self.max_index - min_index + 1) as usize];
        tmp_bins[(self.min_index - min_index) as usize..].copy_from_slice(&self.bins);
        self.bins = tmp_bins;
        self.min_index = min_index;
    }

    fn grow_right(&mut self, index: i32) {
        if self.max_index > index {
            return;
        }

        if index >= self.max_index + self.max_num_bins as i32 {
            // Everything currently tracked collapses into the lowest bin of the new range.
            self.mark_collapsed();
            self.bins.clear();
            self.bins.resize(self.max_num_bins, 0.0);
            self.max_index = index;
            self.min_index = index - self.max_num_bins as i32 + 1;
            self.bins[0] = self.count;
        } else if index >= self.min_index + self.max_num_bins as i32 {
            let min_index = index - self.max_num_bins as i32 + 1;

            let mut collapsed = 0.0;
            let mut i = self.min_index;
            while i < min_index && i <= self.max_index {
                collapsed += self.bins[(i - self.min_index) as usize];
                i += 1;
            }
            if collapsed > 0.0 {
                self.mark_collapsed();
            }

            self.bins.copy_within((min_index - self.min_index) as usize.., 0);
            let kept = (self.max_index - min_index + 1) as usize;
            for bin in &mut self.bins[kept..] {
                *bin = 0.0;
            }
            self.bins.resize(self.max_num_bins, 0.0);

            self.max_index = index;
            self.min_index = min_index;
            self.bins[0] += collapsed;
        } else {
            // Expand bins by up to an extra GROWTH_BUFFER bins than strictly required.
            let max_index = (index + GROWTH_BUFFER).min(self.min_index + self.max_num_bins as i32 - 1);
            self.bins.resize((max_index - self.min_index + 1) as usize, 0.0);
            self.max_index = max_index;
        }
    }
}

impl Store for CollapsingLowestDenseStore {
    fn add_with_count(&mut self, index: i32, count: f64) {
        if count == 0.0 {
            return;
        }

        self.grow(index);
        let idx = if index < self.min_index {
            // The index fell victim to the bin budget; its count goes to the lowest bin.
            self.mark_collapsed();
            0
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

        let Some(o) = (other as &dyn Any).downcast_ref::<CollapsingLowestDenseStore>() else {
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

        self.grow_right(o.max_index);
        self.grow_left(o.min_index);

        let mut collapsed = 0.0;
        for index in o.min_index..=o.max_index {
            let count = o.bins[(index - o.min_index) as usize];
            if index < self.min_index {
                collapsed += count;
            } else {
                self.bins[(index - self.min_index) as usize] += count;
            }
        }
        if collapsed > 0.0 {
            self.mark_collapsed();
            self.bins[0] += collapsed;
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

impl Default for CollapsingLowestDenseStore {
    /// Creates a collapsing lowest dense store with a default budget of 2048 bins.
    fn default() -> Self {
        Self::new(2048)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Bin;

    #[test]
    fn test_within_limit() {
        let mut store = CollapsingLowestDenseStore::new(10);
        for index in 0..10 {
            store.add(index);
        }

        assert_eq!(10.0, store.total_count());
        assert!(!store.is_collapsed());
        assert_eq!(Some(0), store.min_index());
        assert_eq!(Some(9), store.max_index());
    }

    #[test]
    fn test_collapse_on_high_index() {
        let mut store = CollapsingLowestDenseStore::new(5);
        for index in 0..5 {
            store.add(index);
        }
        assert!(!store.is_collapsed());

        store.add(5);

        assert!(store.is_collapsed());
        assert_eq!(6.0, store.total_count());
        // The bin budget holds and the maximum index stays exact.
        let bins = store.bins();
        assert!(bins.len() <= 5);
        assert_eq!(Some(5), store.max_index());
        assert_eq!(vec![Bin::new(1, 2.0), Bin::new(2, 1.0), Bin::new(3, 1.0), Bin::new(4, 1.0), Bin::new(5, 1.0)], bins);
    }

    #[test]
    fn test_collapse_on_low_index() {
        let mut store = CollapsingLowestDenseStore::new(5);
        for index in 5..10 {
            store.add(index);
        }
        assert!(!store.is_collapsed());

        // The low index cannot be represented within the budget; it lands in the lowest bin.
        store.add(0);

        assert!(store.is_collapsed());
        assert_eq!(6.0, store.total_count());
        assert_eq!(Some(5), store.min_index());
        assert_eq!(Some(9), store.max_index());
        assert_eq!(2.0, store.bins()[0].count());
    }

    #[test]
    fn test_collapse_far_jump() {
        let mut store = CollapsingLowestDenseStore::new(4);
        store.add(0);
        store.add(10_000);

        assert!(store.is_collapsed());
        assert_eq!(2.0, store.total_count());
        assert_eq!(Some(10_000), store.max_index());
        assert_eq!(vec![Bin::new(9_997, 1.0), Bin::new(10_000, 1.0)], store.bins());
    }

    #[test]
    fn test_bin_budget_holds_under_any_sequence() {
        let max_num_bins = 8;
        let mut store = CollapsingLowestDenseStore::new(max_num_bins);
        let indexes = [3, -50, 676, -35_688, 35_688, 0, 0, 1, -1, 12, 500, 499];
        for &index in &indexes {
            store.add(index);
            assert!(store.bins.len() <= max_num_bins);
            if let (Some(min), Some(max)) = (store.min_index(), store.max_index()) {
                assert!(max - min + 1 <= max_num_bins as i32);
            }
        }
        assert_eq!(indexes.len() as f64, store.total_count());
        assert_eq!(Some(35_688), store.max_index());
    }

    #[test]
    fn test_key_at_rank_after_collapse() {
        let mut store = CollapsingLowestDenseStore::new(3);
        store.add(0);
        store.add(1);
        store.add(2);
        store.add(3);

        assert!(store.is_collapsed());
        assert_eq!(4.0, store.total_count());
        assert!(store.key_at_rank(0.0).is_some());
        assert_eq!(Some(3), store.key_at_rank(3.0));
        assert_eq!(Some(3), store.key_at_rank(100.0));
    }

    #[test]
    fn test_merge_same_type() {
        let mut store1 = CollapsingLowestDenseStore::new(8);
        store1.add(0);
        store1.add(1);

        let mut store2 = CollapsingLowestDenseStore::new(8);
        store2.add(5);
        store2.add_with_count(10, 2.0);

        store1.merge_with(&store2);

        assert_eq!(5.0, store1.total_count());
        assert_eq!(Some(10), store1.max_index());
        // Indexes 0 and 1 no longer fit next to 10 within 8 bins.
        assert_eq!(Some(3), store1.min_index());
    }

    #[test]
    fn test_merge_respects_collapse_flag() {
        let mut store1 = CollapsingLowestDenseStore::new(5);
        store1.add(0);

        let mut store2 = CollapsingLowestDenseStore::new(5);
        for index in 0..10 {
            store2.add(index);
        }
        assert!(store2.is_collapsed());

        store1.merge_with(&store2);
        assert!(store1.is_collapsed());
    }

    #[test]
    fn test_merge_from_unbounded_store(){
        use crate::store::DenseStore;

        let mut dense = DenseStore::new();
        for index in 0..20 {
            dense.add(index);
        }

        let mut store = CollapsingLowestDenseStore::new(4);
        store.merge_with(&dense);

        assert_eq!(20.0, store.total_count());
        assert_eq!(Some(19), store.max_index());
        assert!(store.max_index().unwrap() - store.min_index().unwrap() < 4);
    }

    #[test]
    fn test_clear() {
        let mut store = CollapsingLowestDenseStore::new(4);
        for index in 0..10 {
            store.add(index);
        }
        assert!(store.is_collapsed());

        store.clear();

        assert!(store.is_empty());
        assert!(!store.is_collapsed());
        assert_eq!(None, store.min_index());
    }

    #[test]
    fn test_binary_roundtrip() {
        let mut store = CollapsingLowestDenseStore::new(16);
        for index in -5..25 {
            store.add(index);
        }

        let mut out = Vec::new();
        store.encode(&mut out, FlagType::NegativeStore);

        let mut decoded = CollapsingLowestDenseStore::new(16);
        let mut input = &out[..];
        let flag = encoding::decode_flag(&mut input).unwrap();
        decoded.decode_and_merge_with(&mut input, flag.sub_flag()).unwrap();

        assert!(input.is_empty());
        assert_eq!(store.bins(), decoded.bins());
    }
}
