//! Protocol Buffers definitions for the sketches wire format.
//!
//! This crate contains generated code for the fixed schema that other sketch
//! implementations also speak, used to exchange serialized sketches in a
//! portable way.
#![deny(warnings)]
#![allow(clippy::enum_variant_names)]
mod include {
    include!(concat!(env!("OUT_DIR"), "/protos/mod.rs"));
}

/// Sketch-related definitions.
pub mod sketches {
    pub use super::include::sketch::*;
}
