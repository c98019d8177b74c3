//! Engine conversion and cache file emission.
//!
//! The heap's canonical bytes are engine-independent; this pass converts
//! every field through the per-kind conversion table (byte order plus any
//! wire-width difference), rewrites pointer cells to base-relative
//! addresses, assembles the tag index and header, and optionally compresses
//! the body. The conversion is total and lossless for in-range values;
//! anything that would truncate is a fatal error, never a silent wrap.

use std::io::Write;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::build::workload::{BuildStruct, BuildWorkload};
use crate::build::{fixup, BuildError};
use crate::engine::{Engine, WireOrder};
use crate::map::types::{
    CacheFlags, CacheHeader, HEADER_SIZE, TAG_INDEX_ENTRY_SIZE, TAG_INDEX_HEADER_SIZE,
};
use crate::tag::schema::{wire_size, SlotKind};
use crate::tag::TagId;

pub(crate) fn serialize(workload: &mut BuildWorkload) -> Result<Vec<u8>, BuildError> {
    let engine = workload.params.engine;
    let order = engine.wire_order();
    let base = engine.base_memory_address();

    fixup::validate_pointers(workload)?;

    // Tag data window layout: index header, entries, path blob, structs.
    let tag_count = workload.tags.len();
    let mut path_blob = Vec::new();
    let mut path_offsets = Vec::with_capacity(tag_count);
    for tag in &workload.tags {
        path_offsets.push(path_blob.len());
        path_blob.extend_from_slice(tag.path.as_bytes());
        path_blob.push(0);
    }

    let entries_offset = TAG_INDEX_HEADER_SIZE;
    let paths_offset = entries_offset + tag_count * TAG_INDEX_ENTRY_SIZE;
    let structs_offset = (paths_offset + path_blob.len()).div_ceil(16) * 16;
    let tag_data_length = fixup::assign_offsets(workload, structs_offset)?;

    let mut tag_data = vec![0u8; tag_data_length];

    // Index header.
    put_u32(&mut tag_data[0..4], base + entries_offset as u32, order);
    let scenario_id = workload
        .scenario_tag
        .map(TagId::new)
        .unwrap_or(TagId::NULL)
        .as_u32();
    put_u32(&mut tag_data[4..8], scenario_id, order);
    put_u32(&mut tag_data[8..12], tag_count as u32, order);

    // One entry per tag.
    for (i, tag) in workload.tags.iter().enumerate() {
        let at = entries_offset + i * TAG_INDEX_ENTRY_SIZE;
        tag_data[at..at + 4].copy_from_slice(&tag.class.fourcc().to_be_bytes());
        put_u32(&mut tag_data[at + 4..at + 8], TagId::new(i).as_u32(), order);
        put_u32(
            &mut tag_data[at + 8..at + 12],
            base + (paths_offset + path_offsets[i]) as u32,
            order,
        );
        let (data_pointer, flags) = match (tag.indexed, tag.root_struct) {
            (Some(stock), _) => (stock, 1u32),
            (None, Some(root)) => {
                let offset = workload.structs[root]
                    .offset
                    .expect("root struct offset assigned");
                (base + offset as u32, 0)
            }
            (None, None) => (0, 0),
        };
        put_u32(&mut tag_data[at + 12..at + 16], data_pointer, order);
        put_u32(&mut tag_data[at + 16..at + 20], flags, order);
    }

    tag_data[paths_offset..paths_offset + path_blob.len()].copy_from_slice(&path_blob);

    for s in &workload.structs {
        if s.dead {
            continue;
        }
        write_struct(&mut tag_data, s, &workload.structs, engine, base)?;
    }

    // Header over the finished body; the checksum covers the uncompressed
    // body, compression comes after.
    let body = tag_data;
    let computed_crc = crc32fast::hash(&body);
    let compress = workload.params.compress || engine.requires_compression();
    let file_length = (HEADER_SIZE + body.len()) as u32;

    let header = CacheHeader {
        engine,
        decompressed_length: if compress { file_length } else { 0 },
        file_length,
        tag_data_offset: HEADER_SIZE as u32,
        tag_data_length: body.len() as u32,
        base_memory_address: base,
        checksum: workload.params.forged_crc.unwrap_or(computed_crc),
        flags: if compress {
            CacheFlags::COMPRESSED
        } else {
            CacheFlags::empty()
        },
        scenario_name: scenario_name(workload),
    };

    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    header.write(&mut out)?;
    if compress {
        let mut encoder = ZlibEncoder::new(out, Compression::default());
        encoder.write_all(&body)?;
        out = encoder.finish()?;
        log::debug!(
            "compressed {} byte body to {} bytes",
            body.len(),
            out.len() - HEADER_SIZE
        );
    } else {
        out.extend_from_slice(&body);
    }
    Ok(out)
}

fn scenario_name(workload: &BuildWorkload) -> String {
    if let Some(name) = &workload.params.rename_scenario {
        return name.clone();
    }
    workload
        .scenario_tag
        .map(|t| {
            let path = workload.tags[t].path.as_str();
            path.rsplit('/').next().unwrap_or(path).to_owned()
        })
        .unwrap_or_default()
}

/// Convert one struct's canonical bytes into its wire form at its assigned
/// offset, walking the flattened field map. Opaque payloads copy verbatim.
fn write_struct(
    out: &mut [u8],
    s: &BuildStruct,
    structs: &[BuildStruct],
    engine: Engine,
    base: u32,
) -> Result<(), BuildError> {
    let order = engine.wire_order();
    let start = s.offset.expect("struct offset assigned before write");

    if s.slots.is_empty() {
        out[start..start + s.data.len()].copy_from_slice(&s.data);
        return Ok(());
    }

    let mut wire_at = start;
    for slot in &s.slots {
        let canonical = slot.offset as usize;
        match slot.kind {
            SlotKind::U8 | SlotKind::I8 => out[wire_at] = s.data[canonical],
            SlotKind::U16 | SlotKind::I16 => {
                let value = LittleEndian::read_u16(&s.data[canonical..]);
                put_u16(&mut out[wire_at..wire_at + 2], value, order);
            }
            SlotKind::U32 | SlotKind::I32 | SlotKind::F32 | SlotKind::TagId | SlotKind::Count => {
                let value = LittleEndian::read_u32(&s.data[canonical..]);
                put_u32(&mut out[wire_at..wire_at + 4], value, order);
            }
            SlotKind::Fourcc => {
                out[wire_at..wire_at + 4].copy_from_slice(&s.data[canonical..canonical + 4]);
            }
            SlotKind::Pad(_) => {
                // Already zero.
            }
            SlotKind::Index => {
                let value = LittleEndian::read_u32(&s.data[canonical..]);
                if engine.index_width() == 2 {
                    if value > u32::from(u16::MAX) {
                        return Err(BuildError::EngineIncompatibleValue {
                            field: slot.name,
                            value,
                            maximum: u32::from(u16::MAX),
                        });
                    }
                    put_u16(&mut out[wire_at..wire_at + 2], value as u16, order);
                } else {
                    put_u32(&mut out[wire_at..wire_at + 4], value, order);
                }
            }
            SlotKind::Pointer => {
                let value = match s.pointer_at(slot.offset) {
                    Some(target) => {
                        let target_offset = structs[target]
                            .offset
                            .expect("pointer target offset assigned");
                        base + target_offset as u32
                    }
                    None => LittleEndian::read_u32(&s.data[canonical..]),
                };
                put_u32(&mut out[wire_at..wire_at + 4], value, order);
            }
        }
        wire_at += slot.kind.wire_width(engine) as usize;
    }

    debug_assert_eq!(wire_at - start, wire_size(&s.slots, s.data.len(), engine));
    Ok(())
}

fn put_u16(buf: &mut [u8], value: u16, order: WireOrder) {
    match order {
        WireOrder::Little => LittleEndian::write_u16(buf, value),
        WireOrder::Big => BigEndian::write_u16(buf, value),
    }
}

fn put_u32(buf: &mut [u8], value: u32, order: WireOrder) {
    match order {
        WireOrder::Little => LittleEndian::write_u32(buf, value),
        WireOrder::Big => BigEndian::write_u32(buf, value),
    }
}
