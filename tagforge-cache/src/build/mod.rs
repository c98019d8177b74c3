//! The build workload: imports a tag graph into a struct heap, runs
//! postprocessing hooks over it, and serializes the result into a cache
//! file for a target engine.

use thiserror::Error;

use crate::engine::Engine;
use crate::script::{ScriptCompileError, TokenizerError};
use crate::tag::TagClass;

mod fixup;
mod postprocess;
mod workload;
mod writer;

#[cfg(test)]
mod tests;

pub use postprocess::EffectFlags;
pub use workload::BuildWorkload;

/// Tag ids are 16-bit with one value reserved for the null sentinel.
pub const MAX_TAGS: usize = 0xFFFE;
/// Backstop on heap growth; struct offsets must stay well inside u32 range.
pub const MAX_STRUCTS: usize = 1 << 20;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("{path}.{class}: tag not found on any search path")]
    UnresolvedDependency { path: String, class: TagClass },

    #[error("{path}: expected {expected}, found {found}")]
    WrongTagClass {
        path: String,
        expected: String,
        found: TagClass,
    },

    #[error("{path}.{class}: class does not permit cyclic references")]
    DependencyCycleUnsafe { path: String, class: TagClass },

    #[error("{path}.{class}: not present in the reference index")]
    MissingIndexedTag { path: String, class: TagClass },

    #[error("{path}: invalid tag file ({reason})")]
    InvalidTagFile { path: String, reason: &'static str },

    #[error("too many tags ({count}, maximum {maximum})")]
    TooManyTags { count: usize, maximum: usize },

    #[error("too many structs ({count}, maximum {maximum})")]
    TooManyStructs { count: usize, maximum: usize },

    #[error("struct of {size} bytes exceeds the target's addressable size ({maximum})")]
    StructTooLarge { size: usize, maximum: usize },

    #[error("tag space exhausted ({required} bytes required, {available} available)")]
    TagSpaceExhausted { required: usize, available: usize },

    #[error("field {field}: value {value} does not fit the target engine's width (maximum {maximum})")]
    EngineIncompatibleValue {
        field: &'static str,
        value: u32,
        maximum: u32,
    },

    #[error("struct {from} holds a pointer to nonexistent struct {target}")]
    DanglingPointer { from: usize, target: usize },

    #[error(transparent)]
    ScriptSyntax(#[from] TokenizerError),

    #[error(transparent)]
    ScriptCompile(#[from] ScriptCompileError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Parameters of one compile invocation.
#[derive(Debug, Clone)]
pub struct BuildParameters {
    pub engine: Engine,
    /// Replaces the computed CRC32 in the header without touching the body.
    pub forged_crc: Option<u32>,
    pub compress: bool,
    /// Deduplicate identical structs before fixup.
    pub optimize_space: bool,
    /// Degrade graph-traversal hooks to no-ops.
    pub disable_recursion: bool,
    /// Overrides the scenario name recorded in the header.
    pub rename_scenario: Option<String>,
    /// Reference index for stock tag reuse: (class, lowercased path) pairs
    /// in index order.
    pub index: Option<Vec<(TagClass, String)>>,
    /// Require every indexable tag to resolve through the index.
    pub always_index: bool,
}

impl BuildParameters {
    pub fn new(engine: Engine) -> BuildParameters {
        BuildParameters {
            engine,
            forged_crc: None,
            compress: engine.compressed_by_default(),
            optimize_space: false,
            disable_recursion: false,
            rename_scenario: None,
            index: None,
            always_index: false,
        }
    }
}
