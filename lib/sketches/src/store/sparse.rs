use std::any::Any;
use std::collections::BTreeMap;

use sketches_protos::sketches::Store as ProtoStore;

use super::Store;
use crate::encoding::{self, Flag, FlagType, BIN_ENCODING_INDEX_DELTAS_AND_COUNTS};

/// A sparse store using a sorted map for bin storage.
///
/// This store only keeps track of non-empty bins, making it memory-efficient for data with
/// widely scattered indices, at the cost of a map lookup per insertion.
///
/// Use this store when:
/// - Input values span a wide range with gaps
/// - You want memory proportional to the number of distinct bins
#[derive(Clone, Debug, Default)]
pub struct SparseStore {
    /// The bin counts, keyed by index.
    counts: BTreeMap<i32, f64>,

    /// Total count across all bins.
    total: f64,
}

impl SparseStore {
    /// Creates an empty `SparseStore`.
    pub fn new() -> Self {
        Self {
            counts: BTreeMap::new(),
            total: 0.0,
        }
    }
}

impl Store for SparseStore {
    fn add_with_count(&mut self, index: i32, count: f64) {
        if count == 0.0 {
            return;
        }

        *self.counts.entry(index).or_insert(0.0) += count;
        self.total += count;
    }

    fn is_empty(&self) -> bool {
        self.total == 0.0
    }

    fn total_count(&self) -> f64 {
        self.total
    }

    fn min_index(&self) -> Option<i32> {
        self.counts.iter().find(|(_, &c)| c > 0.0).map(|(&k, _)| k)
    }

    fn max_index(&self) -> Option<i32> {
        self.counts.iter().rev().find(|(_, &c)| c > 0.0).map(|(&k, _)| k)
    }

    fn key_at_rank(&self, rank: f64) -> Option<i32> {
        if self.total == 0.0 {
            return None;
        }

        let rank = rank.max(0.0);
        let mut cumulative = 0.0;
        for (&index, &count) in &self.counts {
            cumulative += count;
            if cumulative > rank {
                return Some(index);
            }
        }
        self.max_index()
    }

    fn for_each<F: FnMut(i32, f64) -> bool>(&self, mut f: F) {
        for (&index, &count) in &self.counts {
            if count > 0.0 && f(index, count) {
                return;
            }
        }
    }

    fn merge_with<O: Store>(&mut self, other: &O) {
        if let Some(o) = (other as &dyn Any).downcast_ref::<SparseStore>() {
            for (&index, &count) in &o.counts {
                if count > 0.0 {
                    *self.counts.entry(index).or_insert(0.0) += count;
                }
            }
            self.total += o.total;
            return;
        }

        other.for_each(|index, count| {
            self.add_with_count(index, count);
            false
        });
    }

    fn clear(&mut self) {
        self.counts.clear();
        self.total = 0.0;
    }

    fn reweight(&mut self, w: f64) {
        for count in self.counts.values_mut() {
            *count *= w;
        }
        self.total *= w;
    }

    fn encode(&self, out: &mut Vec<u8>, flag_type: FlagType) {
        if self.counts.is_empty() {
            return;
        }

        encoding::encode_flag(out, Flag::new(flag_type, BIN_ENCODING_INDEX_DELTAS_AND_COUNTS));
        encoding::encode_uvarint64(out, self.counts.len() as u64);
        let mut previous_index = 0i64;
        for (&index, &count) in &self.counts {
            encoding::encode_varint64(out, index as i64 - previous_index);
            encoding::encode_varfloat64(out, count);
            previous_index = index as i64;
        }
    }

    fn to_proto(&self) -> ProtoStore {
        let mut proto = ProtoStore::new();
        for (&index, &count) in &self.counts {
            if count > 0.0 {
                proto.binCounts.insert(index, count);
            }
        }
        proto
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Bin;

    #[test]
    fn test_add_and_query() {
        let mut store = SparseStore::new();
        store.add(5);
        store.add_with_count(-1000, 2.0);
        store.add_with_count(1_000_000, 0.5);

        assert_eq!(3.5, store.total_count());
        assert_eq!(Some(-1000), store.min_index());
        assert_eq!(Some(1_000_000), store.max_index());
        assert_eq!(
            vec![Bin::new(-1000, 2.0), Bin::new(5, 1.0), Bin::new(1_000_000, 0.5)],
            store.bins()
        );
    }

    #[test]
    fn test_key_at_rank() {
        let mut store = SparseStore::new();
        store.add_with_count(-5, 1.0);
        store.add_with_count(3, 2.0);

        assert_eq!(Some(-5), store.key_at_rank(-1.0));
        assert_eq!(Some(-5), store.key_at_rank(0.5));
        assert_eq!(Some(3), store.key_at_rank(1.0));
        assert_eq!(Some(3), store.key_at_rank(10.0));
        assert_eq!(None, SparseStore::new().key_at_rank(0.0));
    }

    #[test]
    fn test_merge_cross_type() {
        use crate::store::DenseStore;

        let mut dense = DenseStore::new();
        dense.add_with_count(0, 1.0);
        dense.add_with_count(1, 2.0);

        let mut sparse = SparseStore::new();
        sparse.add_with_count(1, 1.0);
        sparse.merge_with(&dense);

        assert_eq!(4.0, sparse.total_count());
        assert_eq!(vec![Bin::new(0, 1.0), Bin::new(1, 3.0)], sparse.bins());
    }

    #[test]
    fn test_binary_roundtrip_into_dense() {
        use crate::store::DenseStore;

        let mut sparse = SparseStore::new();
        sparse.add_with_count(-42, 1.5);
        sparse.add_with_count(17, 3.0);

        let mut out = Vec::new();
        sparse.encode(&mut out, FlagType::PositiveStore);

        let mut dense = DenseStore::new();
        let mut input = &out[..];
        let flag = encoding::decode_flag(&mut input).unwrap();
        dense.decode_and_merge_with(&mut input, flag.sub_flag()).unwrap();

        assert!(input.is_empty());
        assert_eq!(sparse.bins(), dense.bins());
    }

    #[test]
    fn test_clear() {
        let mut store = SparseStore::new();
        store.add(1);
        store.clear();

        assert!(store.is_empty());
        assert_eq!(None, store.min_index());
    }
}
