//! Struct deduplication, offset assignment and pointer validation.

use crate::build::workload::{BuildStruct, BuildWorkload};
use crate::build::BuildError;
use crate::tag::schema;

/// Merge structs with identical bytes, field maps, alignment and (resolved)
/// pointer lists. Runs to a fixpoint so parents whose children merged can
/// merge in a later round. Ineligible structs are left alone.
pub(crate) fn dedupe_structs(workload: &mut BuildWorkload) {
    let count = workload.structs.len();
    let mut remap: Vec<usize> = (0..count).collect();

    loop {
        let mut changed = false;
        for candidate in 0..count {
            if remap[candidate] != candidate || workload.structs[candidate].unsafe_to_dedupe {
                continue;
            }
            for target in 0..candidate {
                if remap[target] != target || workload.structs[target].unsafe_to_dedupe {
                    continue;
                }
                if structs_equal(
                    &workload.structs[target],
                    &workload.structs[candidate],
                    &remap,
                ) {
                    remap[candidate] = target;
                    changed = true;
                    break;
                }
            }
        }
        if !changed {
            break;
        }
    }

    for s in &mut workload.structs {
        for pointer in &mut s.pointers {
            pointer.target = remap[pointer.target];
        }
    }
    for tag in &mut workload.tags {
        if let Some(root) = tag.root_struct {
            tag.root_struct = Some(remap[root]);
        }
    }

    let mut merged = 0usize;
    for (index, &to) in remap.iter().enumerate() {
        if to != index {
            workload.structs[index].dead = true;
            merged += 1;
        }
    }
    if merged > 0 {
        log::debug!("deduplicated {} of {} structs", merged, count);
    }
}

fn structs_equal(a: &BuildStruct, b: &BuildStruct, remap: &[usize]) -> bool {
    a.alignment == b.alignment
        && a.data == b.data
        && a.slots == b.slots
        && a.pointers.len() == b.pointers.len()
        && a
            .pointers
            .iter()
            .zip(&b.pointers)
            .all(|(p, q)| {
                p.offset == q.offset && p.kind == q.kind && remap[p.target] == remap[q.target]
            })
}

/// Every descriptor must lead to a live struct before serialization.
pub(crate) fn validate_pointers(workload: &BuildWorkload) -> Result<(), BuildError> {
    for (from, s) in workload.structs.iter().enumerate() {
        if s.dead {
            continue;
        }
        for pointer in &s.pointers {
            if pointer.target >= workload.structs.len() || workload.structs[pointer.target].dead {
                return Err(BuildError::DanglingPointer {
                    from,
                    target: pointer.target,
                });
            }
        }
    }
    Ok(())
}

/// Assign final offsets in first-discovery order, honoring per-struct
/// alignment. Offsets are relative to the tag data window; `start` is where
/// the struct region begins (past the index header, entries and path blob).
/// Returns the total window length.
pub(crate) fn assign_offsets(
    workload: &mut BuildWorkload,
    start: usize,
) -> Result<usize, BuildError> {
    let engine = workload.params.engine;
    let tag_space = engine.max_tag_space();
    let mut cursor = start;

    for s in &mut workload.structs {
        if s.dead {
            continue;
        }
        let size = schema::wire_size(&s.slots, s.data.len(), engine);
        if size > tag_space {
            return Err(BuildError::StructTooLarge {
                size,
                maximum: tag_space,
            });
        }
        let alignment = s.alignment.max(1) as usize;
        cursor = cursor.div_ceil(alignment) * alignment;
        s.offset = Some(cursor);
        cursor += size;
    }

    if cursor > tag_space {
        return Err(BuildError::TagSpaceExhausted {
            required: cursor,
            available: tag_space,
        });
    }
    Ok(cursor)
}
