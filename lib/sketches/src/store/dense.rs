use std::any::Any;

use sketches_protos::sketches::Store as ProtoStore;

use super::{Store, GROWTH_BUFFER};
use crate::encoding::{self, Flag, FlagType, BIN_ENCODING_CONTIGUOUS_COUNTS};

/// A dense store using contiguous array storage.
///
/// This store grows unbounded to accommodate any range of indices. It's memory-efficient when
/// the indices are clustered together, but can use significant memory if indices are widely
/// scattered.
///
/// Use this store when:
/// - You have a bounded range of input values
/// - Memory usage is not a concern
/// - You need the fastest possible insertion performance
#[derive(Clone, Debug)]
pub struct DenseStore {
    /// The bin counts, stored contiguously.
    bins: Vec<f64>,

    /// Total count across all bins.
    count: f64,

    /// The index that the first slot of `bins` corresponds to.
    min_index: i32,

    /// The index that the last slot of `bins` corresponds to.
    max_index: i32,
}

impl DenseStore {
    /// Creates an empty `DenseStore`.
    pub fn new() -> Self {
        Self {
            bins: Vec::new(),
            count: 0.0,
            min_index: 0,
            max_index: 0,
        }
    }

    /// Ensures the backing array covers the given index, growing if necessary.
    fn grow(&mut self, index: i32) {
        if self.bins.is_empty() {
            self.bins.resize(GROWTH_BUFFER as usize, 0.0);
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
        if self.min_index < index {
            return;
        }

        let min_index = index - GROWTH_BUFFER;
        let mut tmp_bins = vec![0.0; (self.max_index - min_index + 1) as usize];
        tmp_bins[(self.min_index - min_index) as usize..].copy_from_slice(&self.bins);
        self.bins = tmp_bins;
        self.min_index = min_index;
    }

    fn grow_right(&mut self, index: i32) {
        if self.max_index > index {
            return;
        }

        let max_index = index + GROWTH_BUFFER;
        self.bins.resize((max_index - self.min_index + 1) as usize, 0.0);
        self.max_index = max_index;
    }
}

impl Store for DenseStore {
    fn add_with_count(&mut self, index: i32, count: f64) {
        if count == 0.0 {
            return;
        }

        self.grow(index);
        self.bins[(index - self.min_index) as usize] += count;
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

        let Some(o) = (other as &dyn Any).downcast_ref::<DenseStore>() else {
            other.for_each(|index, count| {
                self.add_with_count(index, count);
                false
            });
            return;
        };

        if self.count == 0.0 {
            *self = o.clone();
            return;
        }

        if self.min_index > o.min_index {
            self.grow_left(o.min_index);
        }
        if self.max_index < o.max_index {
            self.grow_right(o.max_index);
        }
        for index in o.min_index..=o.max_index {
            self.bins[(index - self.min_index) as usize] += o.bins[(index - o.min_index) as usize];
        }
        self.count += o.count;
    }

    fn clear(&mut self) {
        self.bins.clear();
        self.count = 0.0;
        self.min_index = 0;
        self.max_index = 0;
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

impl Default for DenseStore {
    fn default() -> Self {
        Self::new()
    }
}
