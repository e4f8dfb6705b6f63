//! Relative-error quantile sketch.

use sketches_protos::sketches::DDSketch as ProtoDDSketch;

use crate::encoding::{
    self, Flag, FlagType, FLAG_COUNT, FLAG_MAX, FLAG_MIN, FLAG_SUM, FLAG_ZERO_COUNT,
};
use crate::error::{DecodeError, ProtoConversionError, SketchError};
use crate::mapping::{IndexMapping, LogarithmicMapping};
use crate::store::{BufferedPaginatedStore, CollapsingHighestDenseStore, CollapsingLowestDenseStore, Store};

/// The relative accuracy used when none is specified.
pub const DEFAULT_RELATIVE_ACCURACY: f64 = 0.01;

/// The bin budget used by the collapsing constructors when none is specified.
pub const DEFAULT_MAX_NUM_BINS: usize = 2048;

/// A fast and fully-mergeable quantile sketch with relative-error guarantees.
///
/// Values are mapped to exponentially-sized buckets by an [`IndexMapping`]; bucket counts live
/// in a [`Store`] for positive values and one for negative values, while zero (and values too
/// small in magnitude to index) is counted separately. Any quantile estimate `ŷ` of a true
/// value `y` satisfies `|ŷ − y| ≤ α·|y|`, where `α` is the mapping's relative accuracy, and
/// merging sketches preserves that guarantee exactly.
///
/// Defaults to a logarithmic index mapping and buffered-paginated stores, which never collapse
/// bins. Use the collapsing constructors for a hard bound on memory.
///
/// # Example
///
/// ```
/// use sketches::DDSketch;
///
/// let mut sketch = DDSketch::with_relative_accuracy(0.01).unwrap();
/// sketch.add(1.0).unwrap();
/// sketch.add(2.0).unwrap();
/// sketch.add(3.0).unwrap();
///
/// let median = sketch.quantile(0.5).unwrap();
/// ```
#[derive(Clone, Debug)]
pub struct DDSketch<M: IndexMapping = LogarithmicMapping, S: Store = BufferedPaginatedStore> {
    /// The index mapping for this sketch.
    mapping: M,

    /// Store for positive values.
    positive_store: S,

    /// Store for negative values, indexed by magnitude.
    negative_store: S,

    /// Count of zero values, and of values too small in magnitude to be indexed.
    zero_count: f64,
}

impl DDSketch<LogarithmicMapping, BufferedPaginatedStore> {
    /// Creates a new `DDSketch` with the given relative accuracy, a logarithmic index mapping
    /// and buffered-paginated stores.
    ///
    /// # Errors
    ///
    /// If the relative accuracy is not between `0` and `1`, an error is returned.
    pub fn with_relative_accuracy(relative_accuracy: f64) -> Result<Self, SketchError> {
        let mapping = LogarithmicMapping::new(relative_accuracy)?;
        Ok(Self::new(
            mapping,
            BufferedPaginatedStore::new(),
            BufferedPaginatedStore::new(),
        ))
    }
}

impl DDSketch<LogarithmicMapping, CollapsingLowestDenseStore> {
    /// Creates a new `DDSketch` whose stores collapse their lowest bins once they hold
    /// `max_num_bins` bins, bounding memory at the expense of the accuracy of the lowest
    /// tracked quantiles.
    ///
    /// # Errors
    ///
    /// If the relative accuracy is not between `0` and `1`, an error is returned.
    pub fn collapsing_lowest(relative_accuracy: f64, max_num_bins: usize) -> Result<Self, SketchError> {
        if max_num_bins == 0 {
            return Err(SketchError::InvalidArgument {
                reason: "the maximum number of bins must be at least 1",
            });
        }
        let mapping = LogarithmicMapping::new(relative_accuracy)?;
        Ok(Self::new(
            mapping,
            CollapsingLowestDenseStore::new(max_num_bins),
            CollapsingLowestDenseStore::new(max_num_bins),
        ))
    }
}

impl DDSketch<LogarithmicMapping, CollapsingHighestDenseStore> {
    /// Creates a new `DDSketch` whose stores collapse their highest bins once they hold
    /// `max_num_bins` bins, bounding memory at the expense of the accuracy of the highest
    /// tracked quantiles.
    ///
    /// # Errors
    ///
    /// If the relative accuracy is not between `0` and `1`, an error is returned.
    pub fn collapsing_highest(relative_accuracy: f64, max_num_bins: usize) -> Result<Self, SketchError> {
        if max_num_bins == 0 {
            return Err(SketchError::InvalidArgument {
                reason: "the maximum number of bins must be at least 1",
            });
        }
        let mapping = LogarithmicMapping::new(relative_accuracy)?;
        Ok(Self::new(
            mapping,
            CollapsingHighestDenseStore::new(max_num_bins),
            CollapsingHighestDenseStore::new(max_num_bins),
        ))
    }
}

impl<M: IndexMapping, S: Store> DDSketch<M, S> {
    /// Creates a new `DDSketch` with the given mapping and stores.
    pub fn new(mapping: M, positive_store: S, negative_store: S) -> Self {
        Self {
            mapping,
            positive_store,
            negative_store,
            zero_count: 0.0,
        }
    }

    /// Adds a single value to the sketch.
    ///
    /// # Errors
    ///
    /// If the value is NaN, infinite, or outside the indexable range of the mapping, an error
    /// is returned and the sketch is unchanged.
    pub fn add(&mut self, value: f64) -> Result<(), SketchError> {
        self.add_with_count(value, 1.0)
    }

    /// Adds a value to the sketch with the given count.
    ///
    /// This is useful for weighted values or pre-aggregated data; the count does not need to
    /// be an integer.
    ///
    /// # Errors
    ///
    /// If the value is NaN, infinite, or outside the indexable range of the mapping, or the
    /// count is negative or NaN, an error is returned and the sketch is unchanged.
    pub fn add_with_count(&mut self, value: f64, count: f64) -> Result<(), SketchError> {
        if value.is_nan() || value.is_infinite() {
            return Err(SketchError::InvalidArgument {
                reason: "the value must be finite",
            });
        }
        if value > self.mapping.max_indexable_value() || value < -self.mapping.max_indexable_value() {
            return Err(SketchError::UntrackableValue { value });
        }
        if !(count >= 0.0) {
            return Err(SketchError::NegativeCount { count });
        }
        if count == 0.0 {
            return Ok(());
        }

        if value > self.mapping.min_indexable_value() {
            self.positive_store.add_with_count(self.mapping.index(value), count);
        } else if value < -self.mapping.min_indexable_value() {
            self.negative_store.add_with_count(self.mapping.index(-value), count);
        } else {
            self.zero_count += count;
        }
        Ok(())
    }

    /// Returns the approximate value at the given quantile.
    ///
    /// # Errors
    ///
    /// If the quantile is outside `[0, 1]` or the sketch is empty, an error is returned.
    pub fn quantile(&self, q: f64) -> Result<f64, SketchError> {
        if !(0.0..=1.0).contains(&q) {
            return Err(SketchError::InvalidArgument {
                reason: "the quantile must be between 0 and 1",
            });
        }

        let count = self.count();
        if count == 0.0 {
            return Err(SketchError::NoData);
        }

        let rank = q * (count - 1.0);
        let negative_count = self.negative_store.total_count();

        if rank < negative_count {
            // Negative values are stored by magnitude, so the rank is reversed.
            match self.negative_store.key_at_rank(negative_count - 1.0 - rank) {
                Some(index) => Ok(-self.mapping.value(index)),
                None => unreachable!("the negative store holds the rank"),
            }
        } else if rank < self.zero_count + negative_count {
            Ok(0.0)
        } else {
            match self.positive_store.key_at_rank(rank - self.zero_count - negative_count) {
                Some(index) => Ok(self.mapping.value(index)),
                None => unreachable!("the positive store holds the rank"),
            }
        }
    }

    /// Returns the approximate values at each of the given quantiles.
    ///
    /// # Errors
    ///
    /// If any quantile is outside `[0, 1]` or the sketch is empty, an error is returned.
    pub fn quantiles(&self, qs: &[f64]) -> Result<Vec<f64>, SketchError> {
        qs.iter().map(|&q| self.quantile(q)).collect()
    }

    /// Returns the total count of values added to the sketch.
    pub fn count(&self) -> f64 {
        self.zero_count + self.positive_store.total_count() + self.negative_store.total_count()
    }

    /// Returns the count of values that were routed to the zero bucket.
    pub fn zero_count(&self) -> f64 {
        self.zero_count
    }

    /// Returns `true` if the sketch holds no values.
    pub fn is_empty(&self) -> bool {
        self.zero_count == 0.0 && self.positive_store.is_empty() && self.negative_store.is_empty()
    }

    /// Returns an approximation of the minimum value added to the sketch.
    ///
    /// Exact when the minimum is zero or was routed to the zero bucket; otherwise within the
    /// mapping's relative accuracy.
    ///
    /// # Errors
    ///
    /// If the sketch is empty, an error is returned.
    pub fn min(&self) -> Result<f64, SketchError> {
        if !self.negative_store.is_empty() {
            match self.negative_store.max_index() {
                Some(index) => Ok(-self.mapping.value(index)),
                None => unreachable!("the negative store is not empty"),
            }
        } else if self.zero_count > 0.0 {
            Ok(0.0)
        } else {
            match self.positive_store.min_index() {
                Some(index) => Ok(self.mapping.value(index)),
                None => Err(SketchError::NoData),
            }
        }
    }

    /// Returns an approximation of the maximum value added to the sketch.
    ///
    /// Exact when the maximum is zero or was routed to the zero bucket; otherwise within the
    /// mapping's relative accuracy.
    ///
    /// # Errors
    ///
    /// If the sketch is empty, an error is returned.
    pub fn max(&self) -> Result<f64, SketchError> {
        if !self.positive_store.is_empty() {
            match self.positive_store.max_index() {
                Some(index) => Ok(self.mapping.value(index)),
                None => unreachable!("the positive store is not empty"),
            }
        } else if self.zero_count > 0.0 {
            Ok(0.0)
        } else {
            match self.negative_store.min_index() {
                Some(index) => Ok(-self.mapping.value(index)),
                None => Err(SketchError::NoData),
            }
        }
    }

    /// Returns an approximation of the sum of the values added to the sketch, computed from
    /// the bucket midpoints.
    pub fn sum(&self) -> f64 {
        let mut sum = 0.0;
        self.for_each(|value, count| {
            sum += value * count;
            false
        });
        sum
    }

    /// Calls `f` with each tracked `(value, count)` pair until `f` returns `true` or the pairs
    /// are exhausted. Values are bucket midpoints, not the original inputs; the order is
    /// unspecified.
    pub fn for_each<F: FnMut(f64, f64) -> bool>(&self, mut f: F) {
        if self.zero_count != 0.0 && f(0.0, self.zero_count) {
            return;
        }
        let mut stopped = false;
        self.positive_store.for_each(|index, count| {
            stopped = f(self.mapping.value(index), count);
            stopped
        });
        if stopped {
            return;
        }
        self.negative_store.for_each(|index, count| {
            stopped = f(-self.mapping.value(index), count);
            stopped
        });
    }

    /// Merges another sketch into this one. The other sketch is unchanged.
    ///
    /// # Errors
    ///
    /// If the sketches do not use equal index mappings, an error is returned and this sketch
    /// is unchanged.
    pub fn merge_with<S2: Store>(&mut self, other: &DDSketch<M, S2>) -> Result<(), SketchError> {
        if !self.mapping.equals(&other.mapping) {
            return Err(SketchError::IncompatibleMapping);
        }

        self.positive_store.merge_with(&other.positive_store);
        self.negative_store.merge_with(&other.negative_store);
        self.zero_count += other.zero_count;
        Ok(())
    }

    /// Multiplies every tracked count by `w`. Quantile estimates are unaffected.
    ///
    /// # Errors
    ///
    /// If the weight is not positive, an error is returned and the sketch is unchanged.
    pub fn reweight(&mut self, w: f64) -> Result<(), SketchError> {
        if !(w > 0.0) {
            return Err(SketchError::InvalidArgument {
                reason: "the weight must be positive",
            });
        }
        if w == 1.0 {
            return Ok(());
        }

        self.positive_store.reweight(w);
        self.negative_store.reweight(w);
        self.zero_count *= w;
        Ok(())
    }

    /// Re-buckets this sketch through another mapping, optionally scaling every value, and
    /// returns the result as a new sketch backed by the provided stores.
    ///
    /// The error bound of the result is the sum of the two mappings' relative accuracies in
    /// the worst case.
    pub fn change_mapping<M2: IndexMapping, S2: Store>(
        &self, new_mapping: M2, mut positive_store: S2, mut negative_store: S2, scale_factor: f64,
    ) -> DDSketch<M2, S2> {
        change_store_mapping(
            &self.mapping,
            &new_mapping,
            &self.positive_store,
            &mut positive_store,
            scale_factor,
        );
        change_store_mapping(
            &self.mapping,
            &new_mapping,
            &self.negative_store,
            &mut negative_store,
            scale_factor,
        );
        let mut sketch = DDSketch::new(new_mapping, positive_store, negative_store);
        sketch.zero_count = self.zero_count;
        sketch
    }

    /// Clears the sketch, keeping allocated store memory for reuse.
    pub fn clear(&mut self) {
        self.positive_store.clear();
        self.negative_store.clear();
        self.zero_count = 0.0;
    }

    /// Returns a reference to the index mapping.
    pub fn mapping(&self) -> &M {
        &self.mapping
    }

    /// Returns a reference to the positive value store.
    pub fn positive_store(&self) -> &S {
        &self.positive_store
    }

    /// Returns a reference to the negative value store.
    pub fn negative_store(&self) -> &S {
        &self.negative_store
    }

    /// Returns the relative accuracy of this sketch.
    pub fn relative_accuracy(&self) -> f64 {
        self.mapping.relative_accuracy()
    }

    pub(crate) fn set_zero_count(&mut self, zero_count: f64) {
        self.zero_count = zero_count;
    }

    /// Appends this sketch to the output as a sequence of flag-tagged chunks.
    ///
    /// When `omit_index_mapping` is true the mapping chunk is skipped and readers must supply
    /// an equal mapping when decoding.
    pub fn encode(&self, out: &mut Vec<u8>, omit_index_mapping: bool) {
        if self.zero_count != 0.0 {
            encoding::encode_flag(out, FLAG_ZERO_COUNT);
            encoding::encode_varfloat64(out, self.zero_count);
        }
        if !omit_index_mapping {
            self.mapping.encode(out);
        }
        self.positive_store.encode(out, FlagType::PositiveStore);
        self.negative_store.encode(out, FlagType::NegativeStore);
    }

    /// Reads a sketch from its binary representation.
    ///
    /// The mapping may be supplied by the caller, embedded in the input, or both; when both
    /// are present they must be equal.
    ///
    /// # Errors
    ///
    /// If the input is malformed, contains unknown flags, carries a mapping that conflicts
    /// with the provided one, or no mapping is available at all, an error is returned.
    pub fn decode(input: &[u8], mapping: Option<M>) -> Result<Self, DecodeError>
    where
        S: Default,
    {
        let mut input = input;
        let mut mapping = mapping;
        let mut positive_store = S::default();
        let mut negative_store = S::default();
        let mut zero_count = 0.0;

        decode_chunks(
            &mut input,
            &mut mapping,
            &mut positive_store,
            &mut negative_store,
            &mut zero_count,
            skip_exact_summary_statistics,
        )?;

        match mapping {
            Some(mapping) => Ok(Self {
                mapping,
                positive_store,
                negative_store,
                zero_count,
            }),
            None => Err(DecodeError::MissingIndexMapping),
        }
    }

    /// Reads a sketch from its binary representation and merges it into this one.
    ///
    /// # Errors
    ///
    /// If the input is malformed or its mapping is not equal to this sketch's, an error is
    /// returned and this sketch is unchanged.
    pub fn decode_and_merge_with(&mut self, input: &[u8]) -> Result<(), DecodeError>
    where
        S: Default,
    {
        let decoded = Self::decode(input, Some(self.mapping.clone()))?;
        self.positive_store.merge_with(&decoded.positive_store);
        self.negative_store.merge_with(&decoded.negative_store);
        self.zero_count += decoded.zero_count;
        Ok(())
    }

    /// Creates a `DDSketch` from a protobuf `DDSketch` message.
    ///
    /// The caller provides the mapping instance; the protobuf's mapping parameters must
    /// describe it.
    ///
    /// # Errors
    ///
    /// Returns an error if the protobuf is missing a mapping, the mapping parameters don't
    /// match the provided mapping, or any count is negative.
    pub fn from_proto(proto: &ProtoDDSketch, mapping: M) -> Result<Self, ProtoConversionError>
    where
        S: Default,
    {
        let proto_mapping = proto.mapping.as_ref().ok_or(ProtoConversionError::MissingMapping)?;
        mapping.validate_proto_mapping(proto_mapping)?;

        if !(proto.zeroCount >= 0.0) {
            return Err(ProtoConversionError::NegativeZeroCount { count: proto.zeroCount });
        }

        let mut positive_store = S::default();
        if let Some(proto_positive) = proto.positiveValues.as_ref() {
            positive_store.merge_from_proto(proto_positive)?;
        }

        let mut negative_store = S::default();
        if let Some(proto_negative) = proto.negativeValues.as_ref() {
            negative_store.merge_from_proto(proto_negative)?;
        }

        Ok(Self {
            mapping,
            positive_store,
            negative_store,
            zero_count: proto.zeroCount,
        })
    }

    /// Converts this `DDSketch` to a protobuf `DDSketch` message.
    pub fn to_proto(&self) -> ProtoDDSketch {
        let mut proto = ProtoDDSketch::new();

        proto.mapping = protobuf::MessageField::some(self.mapping.to_proto());

        if !self.positive_store.is_empty() {
            proto.positiveValues = protobuf::MessageField::some(self.positive_store.to_proto());
        }

        if !self.negative_store.is_empty() {
            proto.negativeValues = protobuf::MessageField::some(self.negative_store.to_proto());
        }

        proto.zeroCount = self.zero_count;

        proto
    }
}

fn change_store_mapping<M1: IndexMapping, M2: IndexMapping, S1: Store, S2: Store>(
    old_mapping: &M1, new_mapping: &M2, old_store: &S1, new_store: &mut S2, scale_factor: f64,
) {
    old_store.for_each(|index, count| {
        new_store.add_with_count(new_mapping.index(scale_factor * old_mapping.value(index)), count);
        false
    });
}

/// Consumes the payload of the exact-summary-statistics feature flags without recording it.
fn skip_exact_summary_statistics(input: &mut &[u8], flag: Flag) -> Result<(), DecodeError> {
    if flag == FLAG_COUNT {
        encoding::decode_varfloat64(input).map(|_| ())
    } else if flag == FLAG_SUM || flag == FLAG_MIN || flag == FLAG_MAX {
        encoding::decode_float64_le(input).map(|_| ())
    } else {
        Err(DecodeError::UnknownFlag { flag: flag.bits() })
    }
}

/// Reads flag-tagged chunks until the input is exhausted, dispatching store chunks to the
/// stores, mapping chunks against `mapping`, and the zero count into `zero_count`. Any other
/// sketch-feature chunk goes to `fallback`.
pub(crate) fn decode_chunks<M: IndexMapping, S: Store, F>(
    input: &mut &[u8], mapping: &mut Option<M>, positive_store: &mut S, negative_store: &mut S,
    zero_count: &mut f64, mut fallback: F,
) -> Result<(), DecodeError>
where
    F: FnMut(&mut &[u8], Flag) -> Result<(), DecodeError>,
{
    while !input.is_empty() {
        let flag = encoding::decode_flag(input)?;
        match flag.flag_type()? {
            FlagType::PositiveStore => positive_store.decode_and_merge_with(input, flag.sub_flag())?,
            FlagType::NegativeStore => negative_store.decode_and_merge_with(input, flag.sub_flag())?,
            FlagType::IndexMapping => {
                let decoded = M::decode(input, flag)?;
                match mapping.as_ref() {
                    Some(existing) => {
                        if !existing.equals(&decoded) {
                            return Err(DecodeError::IncompatibleMapping);
                        }
                    }
                    None => *mapping = Some(decoded),
                }
            }
            FlagType::SketchFeatures => {
                if flag == FLAG_ZERO_COUNT {
                    *zero_count += encoding::decode_varfloat64(input)?;
                } else {
                    fallback(input, flag)?;
                }
            }
        }
    }
    Ok(())
}

impl<M: IndexMapping + Default, S: Store + Default> Default for DDSketch<M, S> {
    fn default() -> Self {
        Self::new(M::default(), S::default(), S::default())
    }
}
