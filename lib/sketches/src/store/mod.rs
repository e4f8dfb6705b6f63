//! Sketch storage.
//!
//! Stores manage holding the counts of mapped values: conceptually each store is a finite
//! mapping from signed 32-bit bin indices to non-negative `f64` counts. The store variants
//! trade space, accuracy and insertion throughput differently; they all speak the same binary
//! and protobuf encodings and can be merged into one another.

use std::any::Any;

use sketches_protos::sketches::Store as ProtoStore;

use crate::encoding::{
    self, FlagType, SubFlag, BIN_ENCODING_CONTIGUOUS_COUNTS, BIN_ENCODING_INDEX_DELTAS,
    BIN_ENCODING_INDEX_DELTAS_AND_COUNTS,
};
use crate::error::{DecodeError, ProtoConversionError};

mod buffered_paginated;
pub use self::buffered_paginated::BufferedPaginatedStore;

mod collapsing_highest;
pub use self::collapsing_highest::CollapsingHighestDenseStore;

mod collapsing_lowest;
pub use self::collapsing_lowest::CollapsingLowestDenseStore;

mod dense;
pub use self::dense::DenseStore;

mod memory;

mod sparse;
pub use self::sparse::SparseStore;

// Grow dense bin arrays by an extra GROWTH_BUFFER bins to prevent growing too often.
pub(crate) const GROWTH_BUFFER: i32 = 128;

/// A bin is a bucket index paired with the count of observations in the bucket.
///
/// Bins with a zero count are semantically absent from a store.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bin {
    index: i32,
    count: f64,
}

impl Bin {
    /// Creates a bin from its index and count.
    pub fn new(index: i32, count: f64) -> Self {
        Self { index, count }
    }

    /// Returns the index of the bin.
    pub fn index(&self) -> i32 {
        self.index
    }

    /// Returns the count of observations within the bin.
    pub fn count(&self) -> f64 {
        self.count
    }
}

/// Storage for sketch observations.
///
/// Stores are not thread-safe; all calls on one instance must be externally serialized.
pub trait Store: Any + Clone + Send + Sync {
    /// Adds one observation to the bin at the given index.
    fn add(&mut self, index: i32) {
        self.add_with_count(index, 1.0);
    }

    /// Adds a count of observations to the bin at the given index.
    ///
    /// Adding a zero count is a no-op. The count must not be negative; negative counts are
    /// rejected before they reach the store.
    fn add_with_count(&mut self, index: i32, count: f64);

    /// Adds a bin to the store.
    fn add_bin(&mut self, bin: Bin) {
        self.add_with_count(bin.index(), bin.count());
    }

    /// Returns `true` if the store holds no observations.
    fn is_empty(&self) -> bool;

    /// Returns the total count across all bins.
    fn total_count(&self) -> f64;

    /// Returns the minimum index with a non-zero count, or `None` if the store is empty.
    fn min_index(&self) -> Option<i32>;

    /// Returns the maximum index with a non-zero count, or `None` if the store is empty.
    fn max_index(&self) -> Option<i32>;

    /// Returns the smallest index whose cumulative count exceeds the given rank.
    ///
    /// Negative ranks are treated as zero; ranks at or beyond the total count return the
    /// maximum index. Returns `None` only on an empty store.
    fn key_at_rank(&self, rank: f64) -> Option<i32>;

    /// Calls `f` on each non-empty bin, in ascending index order, until `f` returns `true` or
    /// the bins are exhausted. Each index is reported at most once, with its total count.
    fn for_each<F: FnMut(i32, f64) -> bool>(&self, f: F);

    /// Returns the non-empty bins of the store, in ascending index order.
    fn bins(&self) -> Vec<Bin> {
        let mut bins = Vec::new();
        self.for_each(|index, count| {
            bins.push(Bin::new(index, count));
            false
        });
        bins
    }

    /// Merges another store into this one, bin by bin.
    ///
    /// Any store type can be merged into any other; implementations provide fast paths for
    /// merging stores of their own type.
    fn merge_with<O: Store>(&mut self, other: &O)
    where
        Self: Sized,
    {
        other.for_each(|index, count| {
            self.add_with_count(index, count);
            false
        });
    }

    /// Resets the store to empty, keeping already-allocated memory for reuse when possible.
    fn clear(&mut self);

    /// Multiplies every count by `w`.
    ///
    /// The weight must be positive; it is validated before it reaches the store.
    fn reweight(&mut self, w: f64);

    /// Appends the bins of this store to the output as flag-tagged chunks of the given type.
    fn encode(&self, out: &mut Vec<u8>, flag_type: FlagType);

    /// Reads bins from the input, in the layout described by the sub-flag, and merges them
    /// into this store.
    fn decode_and_merge_with(&mut self, input: &mut &[u8], sub_flag: SubFlag) -> Result<(), DecodeError> {
        decode_bins(self, input, sub_flag)
    }

    /// Merges the bins of a protobuf `Store` into this one.
    ///
    /// Counts appearing in both the sparse and the contiguous representation are summed.
    fn merge_from_proto(&mut self, proto: &ProtoStore) -> Result<(), ProtoConversionError> {
        for (&index, &count) in &proto.binCounts {
            let count = validate_proto_count(index, count)?;
            self.add_with_count(index, count);
        }

        let offset = proto.contiguousBinIndexOffset;
        for (i, &count) in proto.contiguousBinCounts.iter().enumerate() {
            let index = offset + i as i32;
            let count = validate_proto_count(index, count)?;
            self.add_with_count(index, count);
        }

        Ok(())
    }

    /// Converts this store to a protobuf `Store`.
    fn to_proto(&self) -> ProtoStore;
}

/// Decodes bins from any of the bin encodings and merges them into the store, one bin at a
/// time. Store implementations with a cheaper layout-specific path override
/// [`Store::decode_and_merge_with`] and fall back to this for the remaining layouts.
pub(crate) fn decode_bins<S: Store>(
    store: &mut S, input: &mut &[u8], sub_flag: SubFlag,
) -> Result<(), DecodeError> {
    match sub_flag {
        BIN_ENCODING_INDEX_DELTAS_AND_COUNTS => {
            let num_bins = encoding::decode_uvarint64(input)?;
            let mut index = 0i64;
            for _ in 0..num_bins {
                index += encoding::decode_varint64(input)?;
                let count = encoding::decode_varfloat64(input)?;
                store.add_with_count(checked_index(index)?, count);
            }
            Ok(())
        }
        BIN_ENCODING_INDEX_DELTAS => {
            let num_bins = encoding::decode_uvarint64(input)?;
            let mut index = 0i64;
            for _ in 0..num_bins {
                index += encoding::decode_varint64(input)?;
                store.add(checked_index(index)?);
            }
            Ok(())
        }
        BIN_ENCODING_CONTIGUOUS_COUNTS => {
            let num_bins = encoding::decode_uvarint64(input)?;
            let mut index = encoding::decode_varint64(input)?;
            let index_delta = encoding::decode_varint64(input)?;
            for _ in 0..num_bins {
                let count = encoding::decode_varfloat64(input)?;
                store.add_with_count(checked_index(index)?, count);
                index += index_delta;
            }
            Ok(())
        }
        _ => Err(DecodeError::UnknownFlag {
            flag: sub_flag.value(),
        }),
    }
}

/// Narrows a decoded bin index to the 32-bit index range.
pub(crate) fn checked_index(index: i64) -> Result<i32, DecodeError> {
    if index > i32::MAX as i64 || index < i32::MIN as i64 {
        return Err(DecodeError::VarintOverflow);
    }
    Ok(index as i32)
}

/// Validates a protobuf `f64` bin count.
///
/// # Errors
///
/// If the count is negative, an error is returned.
pub(crate) fn validate_proto_count(index: i32, count: f64) -> Result<f64, ProtoConversionError> {
    if !(count >= 0.0) {
        return Err(ProtoConversionError::NegativeBinCount { index, count });
    }
    Ok(count)
}
