//! A library for compiling tag graphs into cache files and reading them back.
//!
//! The write path ([`build::BuildWorkload`]) imports a scenario tag and every
//! tag reachable from it into a struct heap, runs per-class postprocessing
//! hooks over the resolved graph, and serializes the heap into a single
//! pointer-resolved cache file for a chosen engine target. The read path
//! ([`map::Map`]) parses such a file back into bounds-checked regions and a
//! tag table. Both sides share the same wire contract bit-for-bit.

pub mod build;
pub mod engine;
pub mod map;
pub mod script;
pub mod tag;

pub use crate::build::{BuildError, BuildParameters, BuildWorkload};
pub use crate::engine::Engine;
pub use crate::map::{LoadOptions, Map, MapError, Region};
