//! Script node tables and the bytecode-compiler seam.
//!
//! The scenario tag embeds the compiled form of its scripts as a fixed-format
//! node table: a 16-byte header followed by 16-byte nodes. The table payload
//! is little-endian on every engine; the runtime rebuilds its own pointers at
//! load time, so nothing in it is address-sensitive.

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use num_enum::{FromPrimitive, IntoPrimitive};
use thiserror::Error;

use crate::script::tokenizer::{Token, TokenValue};
use crate::tag::TagClass;

pub const NODE_TABLE_HEADER_SIZE: usize = 16;
pub const NODE_SIZE: usize = 16;

/// Value type of a script node. Reference types map to tag classes; anything
/// unrecognized is left alone by the postprocessing pass.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum ScriptValueType {
    Void = 0,
    Boolean = 1,
    Real = 2,
    Short = 3,
    Long = 4,
    StringLiteral = 5,
    Script = 6,
    Sound = 9,
    Effect = 10,
    Damage = 11,
    LoopingSound = 12,
    AnimationGraph = 13,
    ActorVariant = 14,
    DamageEffect = 15,
    ObjectDefinition = 16,
    #[num_enum(catch_all)]
    Unrecognized(u16),
}

impl ScriptValueType {
    /// The tag class a reference-typed node names, if any.
    pub fn tag_class(self) -> Option<TagClass> {
        match self {
            ScriptValueType::Sound => Some(TagClass::Sound),
            ScriptValueType::Effect => Some(TagClass::Effect),
            ScriptValueType::Damage | ScriptValueType::DamageEffect => {
                Some(TagClass::DamageEffect)
            }
            ScriptValueType::LoopingSound => Some(TagClass::SoundLooping),
            ScriptValueType::AnimationGraph => Some(TagClass::AnimationGraph),
            ScriptValueType::ActorVariant => Some(TagClass::ActorVariant),
            ScriptValueType::ObjectDefinition => Some(TagClass::ObjectDefinition),
            _ => None,
        }
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ScriptNodeFlags: u16 {
        const PRIMITIVE = 0x0001;
        const SCRIPT_CALL = 0x0002;
        const GLOBAL = 0x0004;
    }
}

/// One node of a compiled script table.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ScriptNode {
    pub value_type: u16,
    pub flags: ScriptNodeFlags,
    pub next: u32,
    pub string_offset: u32,
    pub data: u32,
}

/// Accessors over a raw node table buffer. Layout:
/// header `{node_count, first_element, reserved, reserved}`, then
/// `node_count` nodes of `{value_type, flags, next, string_offset, data}`.
pub mod node_table {
    use super::*;

    pub fn node_count(buf: &[u8]) -> u32 {
        LittleEndian::read_u32(&buf[0..4])
    }

    pub fn set_node_count(buf: &mut [u8], count: u32) {
        LittleEndian::write_u32(&mut buf[0..4], count);
    }

    pub fn first_element(buf: &[u8]) -> u32 {
        LittleEndian::read_u32(&buf[4..8])
    }

    pub fn set_first_element(buf: &mut [u8], pointer: u32) {
        LittleEndian::write_u32(&mut buf[4..8], pointer);
    }

    /// Number of nodes the buffer can actually hold, regardless of what the
    /// header claims.
    pub fn capacity(buf: &[u8]) -> usize {
        buf.len().saturating_sub(NODE_TABLE_HEADER_SIZE) / NODE_SIZE
    }

    pub fn read_node(buf: &[u8], index: usize) -> ScriptNode {
        let at = NODE_TABLE_HEADER_SIZE + index * NODE_SIZE;
        ScriptNode {
            value_type: LittleEndian::read_u16(&buf[at..at + 2]),
            flags: ScriptNodeFlags::from_bits_retain(LittleEndian::read_u16(&buf[at + 2..at + 4])),
            next: LittleEndian::read_u32(&buf[at + 4..at + 8]),
            string_offset: LittleEndian::read_u32(&buf[at + 8..at + 12]),
            data: LittleEndian::read_u32(&buf[at + 12..at + 16]),
        }
    }

    pub fn write_node(buf: &mut [u8], index: usize, node: ScriptNode) {
        let at = NODE_TABLE_HEADER_SIZE + index * NODE_SIZE;
        LittleEndian::write_u16(&mut buf[at..at + 2], node.value_type);
        LittleEndian::write_u16(&mut buf[at + 2..at + 4], node.flags.bits());
        LittleEndian::write_u32(&mut buf[at + 4..at + 8], node.next);
        LittleEndian::write_u32(&mut buf[at + 8..at + 12], node.string_offset);
        LittleEndian::write_u32(&mut buf[at + 12..at + 16], node.data);
    }

    /// Build a table buffer from a node list.
    pub fn build(nodes: &[ScriptNode]) -> Vec<u8> {
        let mut buf = vec![0u8; NODE_TABLE_HEADER_SIZE + nodes.len() * NODE_SIZE];
        set_node_count(&mut buf, nodes.len() as u32);
        for (i, &node) in nodes.iter().enumerate() {
            write_node(&mut buf, i, node);
        }
        buf
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("script compilation failed: {reason}")]
pub struct ScriptCompileError {
    pub reason: String,
}

/// External collaborator turning a token stream into a node table buffer.
pub trait ScriptCompiler {
    fn compile(&self, tokens: &[Token]) -> Result<Vec<u8>, ScriptCompileError>;
}

/// Reference compiler: emits one primitive node per non-parenthesis token,
/// linked in sequence. Enough to exercise the embedding and postprocessing
/// paths without the full bytecode emitter.
#[derive(Default)]
pub struct NodeTableCompiler;

impl NodeTableCompiler {
    pub fn new() -> NodeTableCompiler {
        NodeTableCompiler
    }
}

impl ScriptCompiler for NodeTableCompiler {
    fn compile(&self, tokens: &[Token]) -> Result<Vec<u8>, ScriptCompileError> {
        let mut nodes = Vec::new();
        let mut string_cursor = 0u32;
        for token in tokens {
            let (value_type, string_offset, data) = match &token.value {
                TokenValue::ParenthesisBegin | TokenValue::ParenthesisEnd => continue,
                TokenValue::Integer(v) => (ScriptValueType::Long, 0, *v as u32),
                TokenValue::Decimal(v) => (ScriptValueType::Real, 0, v.to_bits()),
                TokenValue::String(text) => {
                    let at = string_cursor;
                    string_cursor += text.len() as u32 + 1;
                    (ScriptValueType::StringLiteral, at, 0)
                }
            };
            nodes.push(ScriptNode {
                value_type: u16::from(value_type),
                flags: ScriptNodeFlags::PRIMITIVE,
                next: nodes.len() as u32 + 1,
                string_offset,
                data,
            });
        }
        // The last node terminates the chain.
        if let Some(last) = nodes.last_mut() {
            last.next = u32::MAX;
        }
        Ok(node_table::build(nodes.as_slice()))
    }
}
