//! Linearly-interpolated index mapping implementation.

use sketches_protos::sketches::index_mapping::Interpolation;

use super::{
    build_float64, floor_index, get_exponent, get_significand_plus_one, validate_gamma_offset,
    validate_relative_accuracy, IndexMapping,
};
use crate::error::SketchError;

/// Linearly-interpolated index mapping.
///
/// Approximates the memory-optimal [`LogarithmicMapping`](super::LogarithmicMapping) by
/// reading the floor of the base-2 logarithm straight out of the IEEE-754 exponent bits and
/// linearly interpolating the logarithm in between powers of 2: `p(v) = e + s` for
/// `v = 2^e * (1 + s)`.
///
/// Because the interpolation underestimates the logarithm, buckets must be slightly narrower
/// than the logarithmic mapping's for the same accuracy, trading a little memory for much
/// faster insertion.
#[derive(Clone, Debug)]
pub struct LinearlyInterpolatedMapping {
    /// The base of the bucket boundaries.
    gamma: f64,
    /// An offset shifting all bucket indices.
    index_offset: f64,
    /// Precomputed 1/log2(gamma).
    multiplier: f64,
    /// The relative accuracy guarantee.
    relative_accuracy: f64,
    /// Minimum value that can be indexed.
    min_indexable_value: f64,
    /// Maximum value that can be indexed.
    max_indexable_value: f64,
}

impl LinearlyInterpolatedMapping {
    /// Creates a new linearly-interpolated mapping with the given relative accuracy.
    ///
    /// # Errors
    ///
    /// Returns an error if the relative accuracy is not in the valid range (0, 1).
    pub fn new(relative_accuracy: f64) -> Result<Self, SketchError> {
        validate_relative_accuracy(relative_accuracy)?;
        // The bucket width on the interpolated scale that guarantees the requested accuracy is
        // ln((1 + alpha) / (1 - alpha)), hence gamma = 2^width.
        let gamma = ((1.0 + relative_accuracy) / (1.0 - relative_accuracy)).ln().exp2();
        Self::with_gamma_offset(gamma, 0.0)
    }

    /// Approximates log2 of the given value from its binary representation.
    fn approximate_log(&self, value: f64) -> f64 {
        let bits = value.to_bits();
        get_exponent(bits) + get_significand_plus_one(bits) - 1.0
    }

    /// Inverse of [`Self::approximate_log`].
    fn approximate_inverse_log(&self, x: f64) -> f64 {
        let exponent = x.floor();
        let significand_plus_one = x - exponent + 1.0;
        build_float64(exponent as i32, significand_plus_one)
    }
}

impl IndexMapping for LinearlyInterpolatedMapping {
    fn with_gamma_offset(gamma: f64, index_offset: f64) -> Result<Self, SketchError> {
        validate_gamma_offset(gamma, index_offset)?;

        let multiplier = 1.0 / gamma.log2();
        let relative_accuracy = 1.0 - 2.0 / (1.0 + gamma.log2().exp());

        let min_indexable_value = f64::max(
            ((i32::MIN as f64 - index_offset) / multiplier + 1.0).exp2(),
            f64::MIN_POSITIVE * gamma,
        );
        let max_indexable_value = f64::min(
            ((i32::MAX as f64 - index_offset) / multiplier - 1.0).exp2(),
            f64::MAX / gamma,
        );

        Ok(Self {
            gamma,
            index_offset,
            multiplier,
            relative_accuracy,
            min_indexable_value,
            max_indexable_value,
        })
    }

    fn index(&self, value: f64) -> i32 {
        floor_index(self.approximate_log(value) * self.multiplier + self.index_offset)
    }

    fn lower_bound(&self, index: i32) -> f64 {
        self.approximate_inverse_log((index as f64 - self.index_offset) / self.multiplier)
    }

    fn relative_accuracy(&self) -> f64 {
        self.relative_accuracy
    }

    fn min_indexable_value(&self) -> f64 {
        self.min_indexable_value
    }

    fn max_indexable_value(&self) -> f64 {
        self.max_indexable_value
    }

    fn gamma(&self) -> f64 {
        self.gamma
    }

    fn index_offset(&self) -> f64 {
        self.index_offset
    }

    fn interpolation() -> Interpolation {
        Interpolation::LINEAR
    }
}

impl Default for LinearlyInterpolatedMapping {
    /// Creates a linearly-interpolated mapping with 1% relative accuracy.
    fn default() -> Self {
        Self::new(0.01).expect("0.01 is a valid relative accuracy")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_invalid_accuracy() {
        assert!(LinearlyInterpolatedMapping::new(0.0).is_err());
        assert!(LinearlyInterpolatedMapping::new(1.0).is_err());
    }

    #[test]
    fn test_relative_accuracy_roundtrip() {
        for alpha in [1e-1, 1e-2, 1e-3] {
            let mapping = LinearlyInterpolatedMapping::new(alpha).unwrap();
            assert!(
                (mapping.relative_accuracy() - alpha).abs() < 1e-12,
                "alpha {} reconstructed as {}",
                alpha,
                mapping.relative_accuracy()
            );
        }
    }

    #[test]
    fn test_approximate_log_exact_at_powers_of_two() {
        let mapping = LinearlyInterpolatedMapping::new(0.01).unwrap();
        for exponent in -20..20 {
            let value = (exponent as f64).exp2();
            assert_eq!(exponent as f64, mapping.approximate_log(value));
        }
    }

    #[test]
    fn test_approximate_log_inverse() {
        let mapping = LinearlyInterpolatedMapping::new(0.01).unwrap();
        for &value in &[0.001, 0.3, 1.0, 2.5, 42.0, 1e9] {
            let roundtripped = mapping.approximate_inverse_log(mapping.approximate_log(value));
            assert!(
                (roundtripped - value).abs() <= value * 1e-12,
                "value {} roundtripped to {}",
                value,
                roundtripped
            );
        }
    }

    #[test]
    fn test_index_offset_shifts_buckets() {
        let base = LinearlyInterpolatedMapping::new(0.01).unwrap();
        let shifted = LinearlyInterpolatedMapping::with_gamma_offset(base.gamma(), 5.0).unwrap();

        for &value in &[0.25, 1.0, 42.0, 1e6] {
            assert_eq!(base.index(value) + 5, shifted.index(value));
        }
    }
}
