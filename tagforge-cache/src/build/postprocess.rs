//! Per-class postprocessing hooks.
//!
//! Hooks run once per tag root struct, in topological dependency order
//! (dependencies before dependents, ties in first-import order), after the
//! whole graph has been materialized and before fixup. They are the one
//! place a class can compute derived values with full knowledge of its
//! resolved subtree.

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::build::{BuildError, BuildWorkload};
use crate::engine::Engine;
use crate::script::compiler::{node_table, ScriptNodeFlags, ScriptValueType, NODE_TABLE_HEADER_SIZE};
use crate::tag::schema::FieldDef;
use crate::tag::{TagClass, TagId};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct EffectFlags: u32 {
        const MUST_BE_DETERMINISTIC = 0x0001;
        const MUST_BE_DETERMINISTIC_CONSOLE = 0x0002;
    }
}

pub(crate) fn run_hooks(workload: &mut BuildWorkload) -> Result<(), BuildError> {
    for tag_index in dispatch_order(workload) {
        match workload.tags[tag_index].class {
            TagClass::Effect => effect_hook(workload, tag_index)?,
            TagClass::Scenario => scenario_hook(workload, tag_index)?,
            _ => {}
        }
    }
    Ok(())
}

/// Topological order over the tag graph: post-order depth-first traversal
/// from every tag in arena (first-import) order. Cycle back-edges are
/// ignored; the order is deterministic for identical input graphs.
fn dispatch_order(workload: &BuildWorkload) -> Vec<usize> {
    let count = workload.tags.len();
    let mut state = vec![0u8; count]; // 0 = unvisited, 1 = on stack, 2 = done
    let mut order = Vec::with_capacity(count);

    for root in 0..count {
        if state[root] != 0 {
            continue;
        }
        state[root] = 1;
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        while let Some(&(node, cursor)) = stack.last() {
            let dependencies = &workload.tags[node].dependencies;
            if cursor < dependencies.len() {
                let id = dependencies[cursor];
                if let Some(frame) = stack.last_mut() {
                    frame.1 += 1;
                }
                if id.is_null() {
                    continue;
                }
                let child = id.index as usize;
                if state[child] == 0 {
                    state[child] = 1;
                    stack.push((child, 0));
                }
            } else {
                state[node] = 2;
                order.push(node);
                stack.pop();
            }
        }
    }
    order
}

/// Aggregation hook for effects: classify every part two block levels deep,
/// propagate the determinism requirement upward, and track the maximum
/// damage radius across damage-effect parts.
fn effect_hook(workload: &mut BuildWorkload, tag_index: usize) -> Result<(), BuildError> {
    if workload.params.disable_recursion {
        return Ok(());
    }

    let schemas = workload.schemas;
    let Some(effect_schema) = schemas.schema(TagClass::Effect) else {
        return Ok(());
    };
    let layout = &effect_schema.layout;
    let (Some(flags_offset), Some(radius_offset), Some(events_offset)) = (
        layout.field_offset("flags"),
        layout.field_offset("maximum_damage_radius"),
        layout.field_offset("events"),
    ) else {
        return Ok(());
    };
    let Some(FieldDef::Block { element: event_layout, .. }) = layout.field("events") else {
        return Ok(());
    };
    let Some(parts_offset) = event_layout.field_offset("parts") else {
        return Ok(());
    };
    let Some(FieldDef::Block { element: part_layout, .. }) = event_layout.field("parts") else {
        return Ok(());
    };
    let (Some(type_class_offset), Some(type_offset)) = (
        part_layout.field_offset("type_class"),
        part_layout.field_offset("type"),
    ) else {
        return Ok(());
    };
    let damage_radius_offset = schemas
        .schema(TagClass::DamageEffect)
        .and_then(|s| s.layout.field_offset("radius_upper"));

    let Some(root) = workload.tags[tag_index].root_struct else {
        return Ok(());
    };

    let mut must_be_deterministic = false;
    let mut maximum_radius = read_f32(&workload.structs[root].data, radius_offset);

    let event_count = read_u32(&workload.structs[root].data, events_offset) as usize;
    if let Some(events_first) = workload.structs[root].pointer_at(events_offset + 4) {
        for event in 0..event_count {
            let event_struct = events_first + event;
            let part_count = read_u32(&workload.structs[event_struct].data, parts_offset) as usize;
            let Some(parts_first) = workload.structs[event_struct].pointer_at(parts_offset + 4)
            else {
                continue;
            };
            for part in 0..part_count {
                let part_struct = parts_first + part;
                let id = TagId::from_u32(read_u32(
                    &workload.structs[part_struct].data,
                    type_offset + 12,
                ));
                if id.is_null() {
                    continue;
                }
                let fourcc =
                    BigEndian::read_u32(&workload.structs[part_struct].data[type_offset as usize..]);
                let Ok(class) = TagClass::try_from(fourcc) else {
                    continue;
                };
                if class.is_object() {
                    write_fourcc(
                        &mut workload.structs[part_struct].data,
                        type_class_offset,
                        TagClass::ObjectDefinition.fourcc(),
                    );
                } else {
                    write_fourcc(
                        &mut workload.structs[part_struct].data,
                        type_class_offset,
                        class.fourcc(),
                    );
                    if matches!(class, TagClass::DamageEffect | TagClass::Light) {
                        must_be_deterministic = true;
                    }
                    if class == TagClass::DamageEffect {
                        if let (Some(radius_at), Some(dep_root)) = (
                            damage_radius_offset,
                            workload.tags[id.index as usize].root_struct,
                        ) {
                            let radius = read_f32(&workload.structs[dep_root].data, radius_at);
                            if radius > maximum_radius {
                                maximum_radius = radius;
                            }
                        }
                    }
                }
            }
        }
    }

    let root_data = &mut workload.structs[root].data;
    write_f32(root_data, radius_offset, maximum_radius);

    let mut flags = EffectFlags::from_bits_retain(read_u32(root_data, flags_offset));
    flags.remove(EffectFlags::MUST_BE_DETERMINISTIC | EffectFlags::MUST_BE_DETERMINISTIC_CONSOLE);
    if must_be_deterministic {
        flags.insert(if workload.params.engine == Engine::Console {
            EffectFlags::MUST_BE_DETERMINISTIC_CONSOLE
        } else {
            EffectFlags::MUST_BE_DETERMINISTIC
        });
    }
    write_u32(root_data, flags_offset, flags.bits());
    Ok(())
}

/// Redaction hook for scenarios: detach the node table from absolute
/// addressing and null every reference-typed node's tag id, keeping
/// globals and call sites untouched. The runtime recomputes both at load.
fn scenario_hook(workload: &mut BuildWorkload, tag_index: usize) -> Result<(), BuildError> {
    let Some(schema) = workload.schemas.schema(TagClass::Scenario) else {
        return Ok(());
    };
    let Some(syntax_offset) = schema.layout.field_offset("script_syntax_data") else {
        return Ok(());
    };
    let Some(root) = workload.tags[tag_index].root_struct else {
        return Ok(());
    };
    let Some(table_struct) = workload.structs[root].pointer_at(syntax_offset + 12) else {
        return Ok(());
    };

    let buf = &mut workload.structs[table_struct].data;
    if buf.len() < NODE_TABLE_HEADER_SIZE {
        return Ok(());
    }
    node_table::set_first_element(buf, 0);

    let count = (node_table::node_count(buf) as usize).min(node_table::capacity(buf));
    for i in 0..count {
        let mut node = node_table::read_node(buf, i);
        if ScriptValueType::from(node.value_type).tag_class().is_none() {
            continue;
        }
        if node
            .flags
            .intersects(ScriptNodeFlags::GLOBAL | ScriptNodeFlags::SCRIPT_CALL)
        {
            continue;
        }
        node.data = TagId::NULL.as_u32();
        node_table::write_node(buf, i, node);
    }
    Ok(())
}

fn read_u32(data: &[u8], offset: u32) -> u32 {
    LittleEndian::read_u32(&data[offset as usize..])
}

fn write_u32(data: &mut [u8], offset: u32, value: u32) {
    LittleEndian::write_u32(&mut data[offset as usize..offset as usize + 4], value);
}

fn read_f32(data: &[u8], offset: u32) -> f32 {
    LittleEndian::read_f32(&data[offset as usize..])
}

fn write_f32(data: &mut [u8], offset: u32, value: f32) {
    LittleEndian::write_f32(&mut data[offset as usize..offset as usize + 4], value);
}

fn write_fourcc(data: &mut [u8], offset: u32, fourcc: u32) {
    BigEndian::write_u32(&mut data[offset as usize..offset as usize + 4], fourcc);
}
