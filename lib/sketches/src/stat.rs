//! Exact summary statistics.

use crate::encoding::{self, Flag, FLAG_COUNT, FLAG_MAX, FLAG_MIN, FLAG_SUM};
use crate::error::{DecodeError, SketchError};
use crate::mapping::IndexMapping;
use crate::sketch::{decode_chunks, DDSketch};
use crate::store::Store;

/// Exactly-maintained count, sum, minimum and maximum of a stream of weighted values.
#[derive(Clone, Debug, PartialEq)]
pub struct SummaryStatistics {
    count: f64,
    sum: f64,
    min: f64,
    max: f64,
}

impl SummaryStatistics {
    /// Creates empty summary statistics.
    pub fn new() -> Self {
        Self {
            count: 0.0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Creates summary statistics from previously recorded values.
    ///
    /// # Errors
    ///
    /// If the count is negative, if the count is zero but min and max are not the infinities
    /// of an empty summary, or if min exceeds max, an error is returned.
    pub fn from_data(count: f64, sum: f64, min: f64, max: f64) -> Result<Self, SketchError> {
        if !(count >= 0.0) {
            return Err(SketchError::InvalidArgument {
                reason: "the count cannot be negative",
            });
        }
        if count == 0.0 && (sum != 0.0 || min != f64::INFINITY || max != f64::NEG_INFINITY) {
            return Err(SketchError::InvalidArgument {
                reason: "an empty summary must have a zero sum and infinite bounds",
            });
        }
        if count > 0.0 && min > max {
            return Err(SketchError::InvalidArgument {
                reason: "the minimum cannot be greater than the maximum",
            });
        }
        Ok(Self { count, sum, min, max })
    }

    /// Returns the total count.
    pub fn count(&self) -> f64 {
        self.count
    }

    /// Returns the sum of the values, weighted by their counts.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Returns the minimum value.
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Returns the maximum value.
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Records a value with the given count.
    ///
    /// The bounds track the value even when the count is zero.
    pub fn add(&mut self, value: f64, count: f64) {
        self.count += count;
        self.sum += value * count;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }

    /// Merges other summary statistics into these.
    pub fn merge_with(&mut self, other: &SummaryStatistics) {
        self.count += other.count;
        self.sum += other.sum;
        if other.min < self.min {
            self.min = other.min;
        }
        if other.max > self.max {
            self.max = other.max;
        }
    }

    /// Multiplies the count and the sum by `w`. The bounds are unchanged.
    pub fn reweight(&mut self, w: f64) {
        self.count *= w;
        self.sum *= w;
    }

    /// Resets to an empty summary.
    pub fn clear(&mut self) {
        self.count = 0.0;
        self.sum = 0.0;
        self.min = f64::INFINITY;
        self.max = f64::NEG_INFINITY;
    }
}

impl Default for SummaryStatistics {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`DDSketch`] that additionally tracks exact count, sum, minimum and maximum.
///
/// Quantile queries keep the approximate relative-error guarantee, while `count`, `sum`,
/// `min` and `max` are exact rather than bucket approximations.
#[derive(Clone, Debug)]
pub struct DDSketchWithExactSummaryStatistics<M: IndexMapping, S: Store> {
    sketch: DDSketch<M, S>,
    summary: SummaryStatistics,
}

impl<M: IndexMapping, S: Store> DDSketchWithExactSummaryStatistics<M, S> {
    /// Creates a new sketch with exact summary statistics from the given mapping and stores.
    pub fn new(mapping: M, positive_store: S, negative_store: S) -> Self {
        Self {
            sketch: DDSketch::new(mapping, positive_store, negative_store),
            summary: SummaryStatistics::new(),
        }
    }

    /// Adds a single value to the sketch.
    ///
    /// # Errors
    ///
    /// See [`DDSketch::add`].
    pub fn add(&mut self, value: f64) -> Result<(), SketchError> {
        self.add_with_count(value, 1.0)
    }

    /// Adds a value to the sketch with the given count.
    ///
    /// # Errors
    ///
    /// See [`DDSketch::add_with_count`].
    pub fn add_with_count(&mut self, value: f64, count: f64) -> Result<(), SketchError> {
        self.sketch.add_with_count(value, count)?;
        if count != 0.0 {
            self.summary.add(value, count);
        }
        Ok(())
    }

    /// Returns the approximate value at the given quantile.
    ///
    /// # Errors
    ///
    /// See [`DDSketch::quantile`].
    pub fn quantile(&self, q: f64) -> Result<f64, SketchError> {
        self.sketch.quantile(q)
    }

    /// Returns the exact total count.
    pub fn count(&self) -> f64 {
        self.summary.count()
    }

    /// Returns the exact sum of the added values.
    pub fn sum(&self) -> f64 {
        self.summary.sum()
    }

    /// Returns the exact minimum of the added values.
    ///
    /// # Errors
    ///
    /// If the sketch is empty, an error is returned.
    pub fn min(&self) -> Result<f64, SketchError> {
        if self.summary.count() == 0.0 {
            return Err(SketchError::NoData);
        }
        Ok(self.summary.min())
    }

    /// Returns the exact maximum of the added values.
    ///
    /// # Errors
    ///
    /// If the sketch is empty, an error is returned.
    pub fn max(&self) -> Result<f64, SketchError> {
        if self.summary.count() == 0.0 {
            return Err(SketchError::NoData);
        }
        Ok(self.summary.max())
    }

    /// Returns `true` if the sketch holds no values.
    pub fn is_empty(&self) -> bool {
        self.summary.count() == 0.0
    }

    /// Merges another sketch into this one.
    ///
    /// # Errors
    ///
    /// See [`DDSketch::merge_with`].
    pub fn merge_with(&mut self, other: &Self) -> Result<(), SketchError> {
        self.sketch.merge_with(&other.sketch)?;
        self.summary.merge_with(&other.summary);
        Ok(())
    }

    /// Multiplies every tracked count by `w`.
    ///
    /// # Errors
    ///
    /// See [`DDSketch::reweight`].
    pub fn reweight(&mut self, w: f64) -> Result<(), SketchError> {
        self.sketch.reweight(w)?;
        self.summary.reweight(w);
        Ok(())
    }

    /// Clears the sketch and the summary statistics.
    pub fn clear(&mut self) {
        self.sketch.clear();
        self.summary.clear();
    }

    /// Returns a reference to the underlying approximate sketch.
    pub fn sketch(&self) -> &DDSketch<M, S> {
        &self.sketch
    }

    /// Appends this sketch to the output, including the exact summary statistics as
    /// sketch-feature chunks.
    pub fn encode(&self, out: &mut Vec<u8>, omit_index_mapping: bool) {
        if self.summary.count() != 0.0 {
            encoding::encode_flag(out, FLAG_COUNT);
            encoding::encode_varfloat64(out, self.summary.count());
            encoding::encode_flag(out, FLAG_SUM);
            encoding::encode_float64_le(out, self.summary.sum());
            encoding::encode_flag(out, FLAG_MIN);
            encoding::encode_float64_le(out, self.summary.min());
            encoding::encode_flag(out, FLAG_MAX);
            encoding::encode_float64_le(out, self.summary.max());
        }
        self.sketch.encode(out, omit_index_mapping);
    }

    /// Reads a sketch with exact summary statistics from its binary representation.
    ///
    /// # Errors
    ///
    /// In addition to the failure modes of [`DDSketch::decode`], decoding fails when the
    /// summary statistics and the bins disagree on whether the sketch is empty.
    pub fn decode(input: &[u8], mapping: Option<M>) -> Result<Self, DecodeError>
    where
        S: Default,
    {
        let mut input = input;
        let mut mapping = mapping;
        let mut positive_store = S::default();
        let mut negative_store = S::default();
        let mut zero_count = 0.0;

        let mut count = 0.0;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;

        decode_chunks(
            &mut input,
            &mut mapping,
            &mut positive_store,
            &mut negative_store,
            &mut zero_count,
            |input: &mut &[u8], flag: Flag| {
                if flag == FLAG_COUNT {
                    count += encoding::decode_varfloat64(input)?;
                } else if flag == FLAG_SUM {
                    sum += encoding::decode_float64_le(input)?;
                } else if flag == FLAG_MIN {
                    min = min.min(encoding::decode_float64_le(input)?);
                } else if flag == FLAG_MAX {
                    max = max.max(encoding::decode_float64_le(input)?);
                } else {
                    return Err(DecodeError::UnknownFlag { flag: flag.bits() });
                }
                Ok(())
            },
        )?;

        let mapping = mapping.ok_or(DecodeError::MissingIndexMapping)?;
        let mut sketch = DDSketch::new(mapping, positive_store, negative_store);
        sketch.set_zero_count(zero_count);

        let summary =
            SummaryStatistics::from_data(count, sum, min, max).map_err(|_| DecodeError::InconsistentSummaryStatistics)?;
        if summary.count() == 0.0 && !sketch.is_empty() {
            return Err(DecodeError::InconsistentSummaryStatistics);
        }

        Ok(Self { sketch, summary })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::LogarithmicMapping;
    use crate::store::BufferedPaginatedStore;

    fn new_sketch() -> DDSketchWithExactSummaryStatistics<LogarithmicMapping, BufferedPaginatedStore> {
        DDSketchWithExactSummaryStatistics::new(
            LogarithmicMapping::new(0.01).unwrap(),
            BufferedPaginatedStore::new(),
            BufferedPaginatedStore::new(),
        )
    }

    fn assert_summary_empty(s: &SummaryStatistics) {
        assert_eq!(0.0, s.count());
        assert_eq!(0.0, s.sum());
        assert_eq!(f64::INFINITY, s.min());
        assert_eq!(f64::NEG_INFINITY, s.max());
    }

    #[test]
    fn test_from_data() {
        assert!(SummaryStatistics::from_data(0.0, 0.0, f64::INFINITY, f64::NEG_INFINITY).is_ok());
        assert!(SummaryStatistics::from_data(1.0, 2.0, 3.0, 3.0).is_ok());
        assert!(SummaryStatistics::from_data(1.0, 2.0, 3.0, 4.0).is_ok());
        assert!(SummaryStatistics::from_data(0.0, 0.0, 0.0, 0.0).is_err());
        assert!(SummaryStatistics::from_data(-1.0, 0.0, 0.0, 0.0).is_err());
        assert!(SummaryStatistics::from_data(1.0, 0.0, 1.0, 0.0).is_err());
    }

    #[test]
    fn test_empty() {
        assert_summary_empty(&SummaryStatistics::new());
    }

    #[test]
    fn test_add_with_count() {
        let mut s = SummaryStatistics::new();
        s.add(0.0, 0.0);
        assert_eq!(0.0, s.count());
        assert_eq!(0.0, s.sum());
        assert_eq!(0.0, s.min());
        assert_eq!(0.0, s.max());

        s.add(1.0, -2.0);
        assert_eq!(-2.0, s.count());
        assert_eq!(-2.0, s.sum());
        assert_eq!(0.0, s.min());
        assert_eq!(1.0, s.max());

        s.add(-2.0, 3.0);
        assert_eq!(1.0, s.count());
        assert_eq!(-8.0, s.sum());
        assert_eq!(-2.0, s.min());
        assert_eq!(1.0, s.max());
    }

    #[test]
    fn test_merge_with() {
        let mut s1 = SummaryStatistics::new();
        let s2 = SummaryStatistics::new();
        s1.merge_with(&s2);
        assert_summary_empty(&s1);

        let mut s2 = SummaryStatistics::new();
        s2.add(1.0, -2.0);
        s1.merge_with(&s2);
        assert_eq!(s2, s1);

        let mut s3 = SummaryStatistics::new();
        s3.add(-6.0, -7.0);
        let mut expected = s2.clone();
        expected.add(-6.0, -7.0);
        s1.merge_with(&s3);
        assert_eq!(expected, s1);
    }

    #[test]
    fn test_clear() {
        let mut s = SummaryStatistics::new();
        s.clear();
        assert_summary_empty(&s);
        s.add(1.0, 2.0);
        s.clear();
        assert_summary_empty(&s);
    }

    #[test]
    fn test_copy_is_independent() {
        let mut s = SummaryStatistics::new();
        s.add(-1.0, 1.0);
        let mut copy = s.clone();
        s.add(2.0, -3.0);
        copy.add(4.0, 5.0);

        assert_eq!(-2.0, s.count());
        assert_eq!(6.0, copy.count());
        assert_eq!(4.0, copy.max());
        assert_eq!(2.0, s.max());
    }

    #[test]
    fn test_reweight() {
        let mut s = SummaryStatistics::new();
        s.add(2.0, 3.0);
        s.reweight(0.5);

        assert_eq!(1.5, s.count());
        assert_eq!(3.0, s.sum());
        assert_eq!(2.0, s.min());
        assert_eq!(2.0, s.max());
    }

    #[test]
    fn test_sketch_exact_statistics() {
        let mut sketch = new_sketch();
        for value in [-10.0, -1.0, 0.0, 3.0, 100.0] {
            sketch.add(value).unwrap();
        }

        assert_eq!(5.0, sketch.count());
        assert_eq!(92.0, sketch.sum());
        assert_eq!(-10.0, sketch.min().unwrap());
        assert_eq!(100.0, sketch.max().unwrap());

        // The quantile query keeps the approximate guarantee.
        let q99 = sketch.quantile(0.99).unwrap();
        assert!((q99 - 100.0).abs() <= 100.0 * 0.01 + 1e-9);
    }

    #[test]
    fn test_sketch_merge() {
        let mut sketch1 = new_sketch();
        sketch1.add(1.0).unwrap();
        sketch1.add(5.0).unwrap();

        let mut sketch2 = new_sketch();
        sketch2.add(-3.0).unwrap();

        sketch1.merge_with(&sketch2).unwrap();

        assert_eq!(3.0, sketch1.count());
        assert_eq!(3.0, sketch1.sum());
        assert_eq!(-3.0, sketch1.min().unwrap());
        assert_eq!(5.0, sketch1.max().unwrap());
    }

    #[test]
    fn test_sketch_reweight_keeps_bounds() {
        let mut sketch = new_sketch();
        sketch.add(2.0).unwrap();
        sketch.add(8.0).unwrap();

        sketch.reweight(2.0).unwrap();

        assert_eq!(4.0, sketch.count());
        assert_eq!(20.0, sketch.sum());
        assert_eq!(2.0, sketch.min().unwrap());
        assert_eq!(8.0, sketch.max().unwrap());
    }

    #[test]
    fn test_sketch_binary_roundtrip() {
        let mut sketch = new_sketch();
        for value in [-2.5, 0.0, 1.0, 7.25] {
            sketch.add(value).unwrap();
        }

        let mut out = Vec::new();
        sketch.encode(&mut out, false);

        let decoded = DDSketchWithExactSummaryStatistics::<LogarithmicMapping, BufferedPaginatedStore>::decode(
            &out, None,
        )
        .unwrap();

        assert_eq!(sketch.count(), decoded.count());
        assert_eq!(sketch.sum(), decoded.sum());
        assert_eq!(sketch.min().unwrap(), decoded.min().unwrap());
        assert_eq!(sketch.max().unwrap(), decoded.max().unwrap());
        assert_eq!(sketch.quantile(0.5).unwrap(), decoded.quantile(0.5).unwrap());
    }

    #[test]
    fn test_sketch_decode_empty() {
        let sketch = new_sketch();
        let mut out = Vec::new();
        sketch.encode(&mut out, false);

        let decoded = DDSketchWithExactSummaryStatistics::<LogarithmicMapping, BufferedPaginatedStore>::decode(
            &out, None,
        )
        .unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_sketch_decode_inconsistent() {
        // Bins without summary statistics cannot be loaded as an exact-statistics sketch.
        let mut plain = crate::DDSketch::with_relative_accuracy(0.01).unwrap();
        plain.add(1.0).unwrap();

        let mut out = Vec::new();
        plain.encode(&mut out, false);

        let result = DDSketchWithExactSummaryStatistics::<LogarithmicMapping, BufferedPaginatedStore>::decode(
            &out, None,
        );
        assert!(matches!(result, Err(DecodeError::InconsistentSummaryStatistics)));
    }

    #[test]
    fn test_plain_sketch_skips_exact_statistics() {
        // A plain sketch can decode a stream that carries exact summary statistics.
        let mut sketch = new_sketch();
        sketch.add(1.0).unwrap();
        sketch.add(2.0).unwrap();

        let mut out = Vec::new();
        sketch.encode(&mut out, false);

        let plain =
            crate::DDSketch::<LogarithmicMapping, BufferedPaginatedStore>::decode(&out, None).unwrap();
        assert_eq!(2.0, plain.count());
    }
}
