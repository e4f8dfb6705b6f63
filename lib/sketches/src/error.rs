//! Error types.

use std::fmt;

use snafu::Snafu;

/// Errors returned by sketch, store and summary operations.
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum SketchError {
    /// An argument is outside its valid range.
    #[snafu(display("invalid argument: {reason}"))]
    InvalidArgument {
        /// What was wrong with the argument.
        reason: &'static str,
    },

    /// The value is outside the range that the index mapping can track.
    #[snafu(display("value {value} is outside the range that is tracked by the sketch"))]
    UntrackableValue {
        /// The offending value.
        value: f64,
    },

    /// Counts cannot be negative.
    #[snafu(display("count {count} is negative"))]
    NegativeCount {
        /// The offending count.
        count: f64,
    },

    /// Sketches with different index mappings cannot be merged.
    #[snafu(display("cannot merge sketches with different index mappings"))]
    IncompatibleMapping,

    /// Summaries with different accuracy parameters cannot be merged.
    #[snafu(display("cannot merge summaries with different epsilons: {expected} vs {actual}"))]
    IncompatibleEpsilon {
        /// The epsilon of the receiving summary.
        expected: f64,
        /// The epsilon of the argument summary.
        actual: f64,
    },

    /// The sketch holds no data.
    #[snafu(display("the sketch holds no data"))]
    NoData,
}

/// Errors returned while decoding the streaming binary format.
#[derive(Clone, Debug, PartialEq)]
pub enum DecodeError {
    /// The input ended in the middle of a chunk.
    EndOfInput,

    /// A varint-encoded index does not fit in 32 bits.
    VarintOverflow,

    /// The flag byte does not correspond to any known chunk type.
    UnknownFlag {
        /// The raw flag byte.
        flag: u8,
    },

    /// The encoded index mapping does not match the one the sketch uses.
    IncompatibleMapping,

    /// No index mapping was provided by the caller or found in the input.
    MissingIndexMapping,

    /// The decoded summary statistics disagree with the decoded bins.
    InconsistentSummaryStatistics,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndOfInput => write!(f, "unexpected end of input"),
            Self::VarintOverflow => write!(f, "varint overflows a 32-bit integer"),
            Self::UnknownFlag { flag } => write!(f, "unknown flag: {:#010b}", flag),
            Self::IncompatibleMapping => {
                write!(f, "the encoded index mapping is incompatible with the expected one")
            }
            Self::MissingIndexMapping => write!(f, "no index mapping was provided or encoded"),
            Self::InconsistentSummaryStatistics => {
                write!(f, "the summary statistics do not match the sketch contents")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors that can occur during Protocol Buffers conversion.
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum ProtoConversionError {
    /// The protobuf message is missing the required mapping field.
    #[snafu(display("protobuf message is missing required mapping field"))]
    MissingMapping,

    /// The gamma value in the protobuf does not match the expected gamma.
    #[snafu(display("gamma mismatch: expected {expected}, got {actual}"))]
    GammaMismatch {
        /// The expected gamma value.
        expected: f64,
        /// The actual gamma value from the protobuf.
        actual: f64,
    },

    /// The index offset in the protobuf does not match the expected offset.
    #[snafu(display("index offset mismatch: expected {expected}, got {actual}"))]
    IndexOffsetMismatch {
        /// The expected index offset.
        expected: f64,
        /// The actual index offset from the protobuf.
        actual: f64,
    },

    /// The interpolation mode is not supported.
    #[snafu(display("unsupported interpolation mode: {actual}"))]
    UnsupportedInterpolation {
        /// The actual interpolation mode value from the protobuf.
        actual: i32,
    },

    /// The gamma value in the protobuf is invalid.
    #[snafu(display("invalid gamma: {actual}"))]
    InvalidGamma {
        /// The actual gamma value from the protobuf.
        actual: f64,
    },

    /// A bin count value is negative, which is invalid.
    #[snafu(display("negative bin count at index {index}: {count}"))]
    NegativeBinCount {
        /// The bin index.
        index: i32,
        /// The negative count value.
        count: f64,
    },

    /// The zero count is negative.
    #[snafu(display("negative zero count: {count}"))]
    NegativeZeroCount {
        /// The negative zero count value.
        count: f64,
    },
}
