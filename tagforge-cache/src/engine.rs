//! Engine targets and their wire-level parameters.
//!
//! The struct heap is engine-independent; everything engine-specific funnels
//! through this table so the writer and the loader agree on byte order,
//! field widths, base addresses and capacity limits for a given target.

use num_enum::TryFromPrimitive;

/// Byte order a target engine expects for numeric fields.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WireOrder {
    Little,
    Big,
}

/// The engine variant a cache file is built for.
///
/// Discriminants are the four-character codes written into the cache header.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u32)]
pub enum Engine {
    /// `reta` - the baseline desktop release.
    Retail = 0x7265_7461,
    /// `cust` - desktop release with the enlarged tag space.
    Custom = 0x6375_7374,
    /// `demo` - trial build, relocated base address.
    Demo = 0x6465_6D6F,
    /// `cons` - console port: big-endian, narrow table indices.
    Console = 0x636F_6E73,
    /// `anni` - remaster; always ships compressed.
    Anniversary = 0x616E_6E69,
}

impl Engine {
    pub const ALL: [Engine; 5] = [
        Engine::Retail,
        Engine::Custom,
        Engine::Demo,
        Engine::Console,
        Engine::Anniversary,
    ];

    pub fn fourcc(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Engine::Retail => "retail",
            Engine::Custom => "custom",
            Engine::Demo => "demo",
            Engine::Console => "console",
            Engine::Anniversary => "anniversary",
        }
    }

    pub fn from_name(name: &str) -> Option<Engine> {
        Engine::ALL.into_iter().find(|e| e.name() == name)
    }

    pub fn wire_order(self) -> WireOrder {
        match self {
            Engine::Console => WireOrder::Big,
            _ => WireOrder::Little,
        }
    }

    /// Address the tag data window is mapped to in the target runtime.
    /// Every pointer in the serialized file is relative to this.
    pub fn base_memory_address(self) -> u32 {
        match self {
            Engine::Retail | Engine::Custom | Engine::Anniversary => 0x4044_0000,
            Engine::Demo => 0x4BF1_0000,
            Engine::Console => 0x803A_6000,
        }
    }

    /// Upper bound on the tag data window, in bytes.
    pub fn max_tag_space(self) -> usize {
        match self {
            Engine::Retail | Engine::Demo => 0x0170_0000,
            Engine::Custom => 0x01C0_0000,
            Engine::Console => 0x0160_0000,
            Engine::Anniversary => 0x0400_0000,
        }
    }

    /// Wire width of `FieldType::Index` fields. The console runtime keeps its
    /// lookup tables 16-bit.
    pub fn index_width(self) -> usize {
        match self {
            Engine::Console => 2,
            _ => 4,
        }
    }

    pub fn compressed_by_default(self) -> bool {
        matches!(self, Engine::Anniversary)
    }

    /// The remaster cannot read uncompressed files at all.
    pub fn requires_compression(self) -> bool {
        matches!(self, Engine::Anniversary)
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
