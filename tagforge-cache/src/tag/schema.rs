//! Declarative tag field layouts.
//!
//! A schema describes the canonical (in-heap) layout of every struct a tag
//! class emits: plain scalars, dependency references, blocks (variable-length
//! child arrays) and opaque data payloads. The compiler walks these layouts
//! to parse tag files into the struct heap, and the writer walks the
//! flattened slot form to convert every field for the target engine.

use crate::engine::Engine;
use crate::tag::TagClass;

/// Scalar field types. Canonical widths are fixed; wire widths may differ per
/// engine (see [`SlotKind::wire_width`]).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    /// Four-character code, stored and written as its character sequence.
    Fourcc,
    /// Table index; 16-bit on narrow-index engines, 32-bit elsewhere.
    Index,
    Flags16,
    Flags32,
    /// Reserved zero bytes, copied verbatim.
    Pad(u32),
}

/// Which classes a dependency field will accept at import time.
#[derive(Debug, Clone)]
pub enum DependencyClass {
    Exact(TagClass),
    OneOf(&'static [TagClass]),
    Any,
}

impl DependencyClass {
    pub fn accepts(&self, class: TagClass) -> bool {
        match self {
            DependencyClass::Exact(expected) => *expected == class,
            DependencyClass::OneOf(set) => set.contains(&class),
            DependencyClass::Any => true,
        }
    }
}

impl std::fmt::Display for DependencyClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyClass::Exact(class) => f.write_str(class.extension()),
            DependencyClass::OneOf(set) => {
                let names: Vec<&str> = set.iter().map(|c| c.extension()).collect();
                f.write_str(&names.join("|"))
            }
            DependencyClass::Any => f.write_str("*"),
        }
    }
}

/// One field of a struct layout, in declaration order.
#[derive(Debug, Clone)]
pub enum FieldDef {
    Scalar {
        name: &'static str,
        ty: FieldType,
    },
    /// 16 bytes on the wire: class fourcc, path pointer (zeroed in cache),
    /// path length (zeroed in cache), tag id.
    Dependency {
        name: &'static str,
        expected: DependencyClass,
    },
    /// 12 bytes on the wire: element count, pointer to the first element
    /// struct, reserved. One child struct is allocated per element.
    Block {
        name: &'static str,
        element: StructLayout,
    },
    /// 16 bytes on the wire: size, flags, file offset, pointer. The payload
    /// becomes an opaque child struct.
    Data {
        name: &'static str,
    },
}

pub const DEPENDENCY_WIRE_SIZE: u32 = 16;
pub const BLOCK_WIRE_SIZE: u32 = 12;
pub const DATA_WIRE_SIZE: u32 = 16;

impl FieldDef {
    pub fn name(&self) -> &'static str {
        match self {
            FieldDef::Scalar { name, .. }
            | FieldDef::Dependency { name, .. }
            | FieldDef::Block { name, .. }
            | FieldDef::Data { name } => *name,
        }
    }

    fn canonical_size(&self) -> u32 {
        match self {
            FieldDef::Scalar { ty, .. } => match ty {
                FieldType::U8 | FieldType::I8 => 1,
                FieldType::U16 | FieldType::I16 | FieldType::Flags16 => 2,
                FieldType::U32
                | FieldType::I32
                | FieldType::F32
                | FieldType::Fourcc
                | FieldType::Index
                | FieldType::Flags32 => 4,
                FieldType::Pad(n) => *n,
            },
            FieldDef::Dependency { .. } => DEPENDENCY_WIRE_SIZE,
            FieldDef::Block { .. } => BLOCK_WIRE_SIZE,
            FieldDef::Data { .. } => DATA_WIRE_SIZE,
        }
    }
}

/// Canonical layout of one struct kind (a tag root or a block element).
#[derive(Debug, Clone)]
pub struct StructLayout {
    pub name: &'static str,
    pub alignment: u32,
    pub fields: Vec<FieldDef>,
}

impl StructLayout {
    pub fn new(name: &'static str, alignment: u32, fields: Vec<FieldDef>) -> StructLayout {
        StructLayout {
            name,
            alignment,
            fields,
        }
    }

    /// Canonical byte size, before any engine conversion.
    pub fn byte_size(&self) -> u32 {
        self.fields.iter().map(|f| f.canonical_size()).sum()
    }

    /// Canonical offset of a named field.
    pub fn field_offset(&self, name: &str) -> Option<u32> {
        let mut offset = 0;
        for field in &self.fields {
            if field.name() == name {
                return Some(offset);
            }
            offset += field.canonical_size();
        }
        None
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name() == name)
    }

    /// Flatten to the scalar slot list the writer converts field by field.
    pub fn slots(&self) -> Vec<Slot> {
        let mut slots = Vec::new();
        let mut offset = 0;
        for field in &self.fields {
            let name = field.name();
            match field {
                FieldDef::Scalar { ty, .. } => {
                    slots.push(Slot::new(offset, name, SlotKind::from_scalar(*ty)));
                }
                FieldDef::Dependency { .. } => {
                    slots.push(Slot::new(offset, name, SlotKind::Fourcc));
                    slots.push(Slot::new(offset + 4, name, SlotKind::U32));
                    slots.push(Slot::new(offset + 8, name, SlotKind::U32));
                    slots.push(Slot::new(offset + 12, name, SlotKind::TagId));
                }
                FieldDef::Block { .. } => {
                    slots.push(Slot::new(offset, name, SlotKind::Count));
                    slots.push(Slot::new(offset + 4, name, SlotKind::Pointer));
                    slots.push(Slot::new(offset + 8, name, SlotKind::U32));
                }
                FieldDef::Data { .. } => {
                    slots.push(Slot::new(offset, name, SlotKind::U32));
                    slots.push(Slot::new(offset + 4, name, SlotKind::U32));
                    slots.push(Slot::new(offset + 8, name, SlotKind::U32));
                    slots.push(Slot::new(offset + 12, name, SlotKind::Pointer));
                }
            }
            offset += field.canonical_size();
        }
        slots
    }
}

/// One scalar cell of a flattened struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Canonical byte offset within the struct.
    pub offset: u32,
    /// Field name, for error context.
    pub name: &'static str,
    pub kind: SlotKind,
}

impl Slot {
    fn new(offset: u32, name: &'static str, kind: SlotKind) -> Slot {
        Slot { offset, name, kind }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    /// Byte-order invariant character code.
    Fourcc,
    /// Engine-width table index.
    Index,
    /// Resolved tag id.
    TagId,
    /// Block element count.
    Count,
    /// Base-relative address, rewritten at fixup.
    Pointer,
    Pad(u32),
}

impl SlotKind {
    fn from_scalar(ty: FieldType) -> SlotKind {
        match ty {
            FieldType::U8 => SlotKind::U8,
            FieldType::I8 => SlotKind::I8,
            FieldType::U16 => SlotKind::U16,
            FieldType::I16 => SlotKind::I16,
            FieldType::U32 | FieldType::Flags32 => SlotKind::U32,
            FieldType::I32 => SlotKind::I32,
            FieldType::F32 => SlotKind::F32,
            FieldType::Fourcc => SlotKind::Fourcc,
            FieldType::Index => SlotKind::Index,
            FieldType::Flags16 => SlotKind::U16,
            FieldType::Pad(n) => SlotKind::Pad(n),
        }
    }

    pub fn canonical_width(self) -> u32 {
        match self {
            SlotKind::U8 | SlotKind::I8 => 1,
            SlotKind::U16 | SlotKind::I16 => 2,
            SlotKind::U32
            | SlotKind::I32
            | SlotKind::F32
            | SlotKind::Fourcc
            | SlotKind::Index
            | SlotKind::TagId
            | SlotKind::Count
            | SlotKind::Pointer => 4,
            SlotKind::Pad(n) => n,
        }
    }

    pub fn wire_width(self, engine: Engine) -> u32 {
        match self {
            SlotKind::Index => engine.index_width() as u32,
            other => other.canonical_width(),
        }
    }
}

/// Wire size of a flattened struct for a target engine. Opaque structs
/// (empty slot list) serialize their bytes verbatim.
pub fn wire_size(slots: &[Slot], canonical_len: usize, engine: Engine) -> usize {
    if slots.is_empty() {
        canonical_len
    } else {
        slots.iter().map(|s| s.kind.wire_width(engine) as usize).sum()
    }
}

/// Schema for one tag class: the layout of its root struct.
#[derive(Debug, Clone)]
pub struct TagSchema {
    pub class: TagClass,
    pub layout: StructLayout,
}

/// External collaborator supplying field layouts per tag class.
pub trait SchemaProvider {
    fn schema(&self, class: TagClass) -> Option<&TagSchema>;
}

/// Built-in schemas for the closed class set, so the toolchain works
/// stand-alone. Field names are load-bearing: the postprocessing hooks look
/// their offsets up by name.
pub struct BuiltinSchemas {
    schemas: Vec<TagSchema>,
}

/// Classes an effect part may reference.
pub const EFFECT_PART_CLASSES: &[TagClass] = &[
    TagClass::Sound,
    TagClass::DamageEffect,
    TagClass::Light,
    TagClass::Weapon,
    TagClass::Vehicle,
    TagClass::Scenery,
    TagClass::Projectile,
    TagClass::ObjectDefinition,
];

impl BuiltinSchemas {
    pub fn new() -> BuiltinSchemas {
        use FieldDef::{Block, Data, Dependency, Scalar};
        use FieldType::{Flags32, F32, U16, U32};

        let schemas = vec![
            TagSchema {
                class: TagClass::Scenario,
                layout: StructLayout::new(
                    "scenario",
                    4,
                    vec![
                        Scalar { name: "flags", ty: Flags32 },
                        Block {
                            name: "palette",
                            element: StructLayout::new(
                                "scenario_palette_entry",
                                4,
                                vec![Dependency {
                                    name: "reference",
                                    expected: DependencyClass::Any,
                                }],
                            ),
                        },
                        Data { name: "script_source" },
                        Data { name: "script_syntax_data" },
                    ],
                ),
            },
            TagSchema {
                class: TagClass::Effect,
                layout: StructLayout::new(
                    "effect",
                    4,
                    vec![
                        Scalar { name: "flags", ty: Flags32 },
                        Scalar { name: "maximum_damage_radius", ty: F32 },
                        Block {
                            name: "events",
                            element: StructLayout::new(
                                "effect_event",
                                4,
                                vec![
                                    Scalar { name: "delay_lower", ty: F32 },
                                    Scalar { name: "delay_upper", ty: F32 },
                                    Block {
                                        name: "parts",
                                        element: StructLayout::new(
                                            "effect_part",
                                            4,
                                            vec![
                                                Scalar {
                                                    name: "type_class",
                                                    ty: FieldType::Fourcc,
                                                },
                                                Dependency {
                                                    name: "type",
                                                    expected: DependencyClass::OneOf(
                                                        EFFECT_PART_CLASSES,
                                                    ),
                                                },
                                            ],
                                        ),
                                    },
                                ],
                            ),
                        },
                    ],
                ),
            },
            TagSchema {
                class: TagClass::DamageEffect,
                layout: StructLayout::new(
                    "damage_effect",
                    4,
                    vec![
                        Scalar { name: "radius_lower", ty: F32 },
                        Scalar { name: "radius_upper", ty: F32 },
                        Scalar { name: "cutoff_scale", ty: F32 },
                        Scalar { name: "flags", ty: Flags32 },
                    ],
                ),
            },
            TagSchema {
                class: TagClass::Light,
                layout: StructLayout::new(
                    "light",
                    4,
                    vec![
                        Scalar { name: "radius", ty: F32 },
                        Scalar { name: "intensity", ty: F32 },
                        Scalar { name: "color", ty: U32 },
                    ],
                ),
            },
            TagSchema {
                class: TagClass::Sound,
                layout: StructLayout::new(
                    "sound",
                    4,
                    vec![
                        Scalar { name: "gain", ty: F32 },
                        Scalar { name: "pitch", ty: F32 },
                        Scalar { name: "channel_count", ty: FieldType::Index },
                    ],
                ),
            },
            TagSchema {
                class: TagClass::SoundLooping,
                layout: StructLayout::new(
                    "sound_looping",
                    4,
                    vec![
                        Scalar { name: "detail_gain", ty: F32 },
                        Dependency {
                            name: "track",
                            expected: DependencyClass::Exact(TagClass::Sound),
                        },
                    ],
                ),
            },
            TagSchema {
                class: TagClass::AnimationGraph,
                layout: StructLayout::new(
                    "animation_graph",
                    4,
                    vec![
                        Scalar { name: "node_count", ty: FieldType::Index },
                        Block {
                            name: "sound_references",
                            element: StructLayout::new(
                                "animation_sound_reference",
                                4,
                                vec![Dependency {
                                    name: "sound",
                                    expected: DependencyClass::Exact(TagClass::Sound),
                                }],
                            ),
                        },
                    ],
                ),
            },
            TagSchema {
                class: TagClass::ActorVariant,
                layout: StructLayout::new(
                    "actor_variant",
                    4,
                    vec![
                        Scalar { name: "engage_distance", ty: F32 },
                        Dependency {
                            name: "major_variant",
                            expected: DependencyClass::Exact(TagClass::ActorVariant),
                        },
                    ],
                ),
            },
            TagSchema {
                class: TagClass::Bitmap,
                layout: StructLayout::new(
                    "bitmap",
                    4,
                    vec![
                        Scalar { name: "width", ty: U16 },
                        Scalar { name: "height", ty: U16 },
                        Scalar { name: "pixel_data_size", ty: U32 },
                    ],
                ),
            },
            TagSchema {
                class: TagClass::StringList,
                layout: StructLayout::new(
                    "string_list",
                    4,
                    vec![Block {
                        name: "strings",
                        element: StructLayout::new(
                            "string_list_entry",
                            4,
                            vec![Data { name: "text" }],
                        ),
                    }],
                ),
            },
            TagSchema {
                class: TagClass::ObjectDefinition,
                layout: StructLayout::new(
                    "object_definition",
                    4,
                    vec![
                        Scalar { name: "bounding_radius", ty: F32 },
                        Dependency {
                            name: "creation_effect",
                            expected: DependencyClass::Exact(TagClass::Effect),
                        },
                    ],
                ),
            },
            TagSchema {
                class: TagClass::Weapon,
                layout: StructLayout::new(
                    "weapon",
                    4,
                    vec![
                        Scalar { name: "bounding_radius", ty: F32 },
                        Dependency {
                            name: "fire_effect",
                            expected: DependencyClass::Exact(TagClass::Effect),
                        },
                        Dependency {
                            name: "impact_damage",
                            expected: DependencyClass::Exact(TagClass::DamageEffect),
                        },
                    ],
                ),
            },
            TagSchema {
                class: TagClass::Vehicle,
                layout: StructLayout::new(
                    "vehicle",
                    4,
                    vec![
                        Scalar { name: "bounding_radius", ty: F32 },
                        Dependency {
                            name: "collision_damage",
                            expected: DependencyClass::Exact(TagClass::DamageEffect),
                        },
                    ],
                ),
            },
            TagSchema {
                class: TagClass::Scenery,
                layout: StructLayout::new(
                    "scenery",
                    4,
                    vec![
                        Scalar { name: "bounding_radius", ty: F32 },
                        Dependency {
                            name: "idle_effect",
                            expected: DependencyClass::Exact(TagClass::Effect),
                        },
                    ],
                ),
            },
            TagSchema {
                class: TagClass::Projectile,
                layout: StructLayout::new(
                    "projectile",
                    4,
                    vec![
                        Scalar { name: "bounding_radius", ty: F32 },
                        Scalar { name: "initial_velocity", ty: F32 },
                        Dependency {
                            name: "impact_damage",
                            expected: DependencyClass::Exact(TagClass::DamageEffect),
                        },
                    ],
                ),
            },
        ];

        BuiltinSchemas { schemas }
    }
}

impl Default for BuiltinSchemas {
    fn default() -> Self {
        BuiltinSchemas::new()
    }
}

impl SchemaProvider for BuiltinSchemas {
    fn schema(&self, class: TagClass) -> Option<&TagSchema> {
        self.schemas.iter().find(|s| s.class == class)
    }
}
