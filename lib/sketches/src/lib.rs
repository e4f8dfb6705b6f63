//! Mergeable quantile sketches for summarizing numeric streams in sublinear memory.
//!
//! This crate provides two sketch families:
//!
//! - [`DDSketch`]: a relative-error sketch. Values are mapped to exponentially-sized buckets,
//!   so any quantile estimate `ŷ` of a true value `y` satisfies `|ŷ − y| ≤ α·|y|` for the
//!   configured relative accuracy `α`. Merging sketches preserves the guarantee exactly.
//!
//! - [`GKArray`]: a rank-error summary in the style of Greenwald–Khanna. Quantile estimates
//!   are within `ε·n` ranks of the true quantile (within `2ε·n` after merges), without any
//!   assumption on the input distribution.
//!
//! # Quick Start
//!
//! ```
//! use sketches::DDSketch;
//!
//! // Create a sketch with 1% relative accuracy.
//! let mut sketch = DDSketch::with_relative_accuracy(0.01).unwrap();
//!
//! sketch.add(1.5).unwrap();
//! sketch.add(2.5).unwrap();
//! sketch.add(3.5).unwrap();
//!
//! let p50 = sketch.quantile(0.5).unwrap();
//! let p99 = sketch.quantile(0.99).unwrap();
//! ```
//!
//! # Store Types
//!
//! The buckets of a [`DDSketch`] live in a [`store::Store`], and the store type is the main
//! space/accuracy/throughput trade-off:
//!
//! - [`store::BufferedPaginatedStore`]: pages of counts plus a raw-index buffer with
//!   self-tuning compaction. Exact, and space-efficient on sparse, outlier-heavy or
//!   multimodal inputs. The default.
//! - [`store::DenseStore`]: one contiguous array. Exact and fastest, but unbounded.
//! - [`store::CollapsingLowestDenseStore`] / [`store::CollapsingHighestDenseStore`]: dense
//!   stores with a hard bin budget that collapse one extreme end when the budget is hit.
//! - [`store::SparseStore`]: a sorted map, exact, memory proportional to distinct buckets.
//!
//! # Serialization
//!
//! Sketches serialize to a compact flag-framed binary format ([`DDSketch::encode`] /
//! [`DDSketch::decode`]) that round-trips across store types, and convert to and from the
//! shared Protocol Buffers schema ([`DDSketch::to_proto`] / [`DDSketch::from_proto`]).
//!
//! # Thread Safety
//!
//! Sketches and stores are single-threaded values; wrap them in a lock to share them across
//! threads.

#![deny(warnings)]
#![deny(missing_docs)]

mod common;

pub mod encoding;
pub mod error;
pub mod mapping;
pub mod store;

mod gk;
pub use gk::{GKArray, DEFAULT_EPSILON};

mod sketch;
pub use sketch::{DDSketch, DEFAULT_MAX_NUM_BINS, DEFAULT_RELATIVE_ACCURACY};

mod stat;
pub use stat::{DDSketchWithExactSummaryStatistics, SummaryStatistics};

pub use error::{DecodeError, ProtoConversionError, SketchError};
pub use mapping::{
    CubicallyInterpolatedMapping, IndexMapping, LinearlyInterpolatedMapping, LogarithmicMapping,
};
pub use store::{
    Bin, BufferedPaginatedStore, CollapsingHighestDenseStore, CollapsingLowestDenseStore, DenseStore,
    SparseStore, Store,
};
