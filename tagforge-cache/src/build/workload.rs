//! Tag import and the struct heap.
//!
//! Tags and structs live in index-addressed arenas so cyclic references
//! never need shared ownership: a tag's slot is allocated eagerly on first
//! request and marked in-progress, and a re-entrant request for it simply
//! reuses the unfinished index. Forward references become valid once fixup
//! has assigned every struct its final offset.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};

use crate::build::{fixup, postprocess, writer, BuildError, BuildParameters, MAX_STRUCTS, MAX_TAGS};
use crate::script::{tokenize, ScriptCompiler};
use crate::tag::file::{TagFileError, TagFileHeader};
use crate::tag::schema::{FieldDef, FieldType, SchemaProvider, Slot, StructLayout};
use crate::tag::source::TagSource;
use crate::tag::{TagClass, TagId};

/// One tag of the session. Immutable once its import finishes.
#[derive(Debug)]
pub(crate) struct BuildTag {
    pub path: String,
    pub class: TagClass,
    /// `None` while allocation is pending and for indexed tags.
    pub root_struct: Option<usize>,
    /// Direct dependencies in discovery order.
    pub dependencies: Vec<TagId>,
    pub in_progress: bool,
    /// Stock reuse: position in the reference index instead of struct data.
    pub indexed: Option<u32>,
}

/// Where a pointer descriptor leads.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum PointerKind {
    /// First struct of a contiguous block element run.
    BlockElements,
    /// Opaque data payload struct.
    DataPayload,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct PointerDescriptor {
    /// Canonical offset of the pointer cell within the owning struct.
    pub offset: u32,
    /// Target struct index.
    pub target: usize,
    pub kind: PointerKind,
}

/// One struct of the heap: canonical bytes plus relocation metadata.
#[derive(Debug)]
pub(crate) struct BuildStruct {
    pub data: Vec<u8>,
    /// Flattened field map; empty for opaque payloads (copied verbatim).
    pub slots: Vec<Slot>,
    pub alignment: u32,
    pub pointers: Vec<PointerDescriptor>,
    /// Block element structs must keep their run contiguous.
    pub unsafe_to_dedupe: bool,
    /// Tombstone left behind by the dedupe pass.
    pub dead: bool,
    /// Final offset within the tag data window, assigned at fixup.
    pub offset: Option<usize>,
}

impl BuildStruct {
    pub fn pointer_at(&self, offset: u32) -> Option<usize> {
        self.pointers
            .iter()
            .find(|p| p.offset == offset)
            .map(|p| p.target)
    }
}

/// One compile session: the tag arena, the struct heap, and the
/// collaborators everything is resolved through.
pub struct BuildWorkload<'a> {
    pub(crate) tags: Vec<BuildTag>,
    pub(crate) structs: Vec<BuildStruct>,
    pub(crate) scenario_tag: Option<usize>,
    pub(crate) params: &'a BuildParameters,
    pub(crate) schemas: &'a dyn SchemaProvider,
    lookup: HashMap<(String, TagClass), usize>,
    source: &'a mut dyn TagSource,
    script_compiler: &'a dyn ScriptCompiler,
}

impl<'a> BuildWorkload<'a> {
    /// Compile the graph rooted at `scenario_path` into a cache file.
    pub fn compile_map(
        scenario_path: &str,
        source: &'a mut dyn TagSource,
        schemas: &'a dyn SchemaProvider,
        script_compiler: &'a dyn ScriptCompiler,
        params: &'a BuildParameters,
    ) -> Result<Vec<u8>, BuildError> {
        let mut workload = BuildWorkload::new(source, schemas, script_compiler, params);
        let scenario = workload.import_tag(scenario_path, TagClass::Scenario)?;
        workload.scenario_tag = Some(scenario.index as usize);
        postprocess::run_hooks(&mut workload)?;
        if params.optimize_space {
            fixup::dedupe_structs(&mut workload);
        }
        writer::serialize(&mut workload)
    }

    pub(crate) fn new(
        source: &'a mut dyn TagSource,
        schemas: &'a dyn SchemaProvider,
        script_compiler: &'a dyn ScriptCompiler,
        params: &'a BuildParameters,
    ) -> BuildWorkload<'a> {
        BuildWorkload {
            tags: Vec::new(),
            structs: Vec::new(),
            scenario_tag: None,
            params,
            schemas,
            lookup: HashMap::new(),
            source,
            script_compiler,
        }
    }

    /// Import a tag and, transitively, everything it references.
    ///
    /// Diamonds resolve to the already-imported tag; a re-entrant request
    /// for an in-progress tag yields its unfinished index unless the tag's
    /// class forbids cycles.
    pub(crate) fn import_tag(&mut self, path: &str, class: TagClass) -> Result<TagId, BuildError> {
        if let Some(&tag_index) = self.lookup.get(&(path.to_owned(), class)) {
            let tag = &self.tags[tag_index];
            if tag.in_progress && !class.allows_self_reference() {
                return Err(BuildError::DependencyCycleUnsafe {
                    path: path.to_owned(),
                    class,
                });
            }
            return Ok(TagId::new(tag_index));
        }

        if self.tags.len() >= MAX_TAGS {
            return Err(BuildError::TooManyTags {
                count: self.tags.len() + 1,
                maximum: MAX_TAGS,
            });
        }

        if class.is_indexable() {
            if let Some(index) = &self.params.index {
                let key = path.to_ascii_lowercase();
                if let Some(position) = index.iter().position(|(c, p)| *c == class && *p == key) {
                    let tag_index = self.tags.len();
                    self.lookup.insert((path.to_owned(), class), tag_index);
                    self.tags.push(BuildTag {
                        path: path.to_owned(),
                        class,
                        root_struct: None,
                        dependencies: Vec::new(),
                        in_progress: false,
                        indexed: Some(position as u32),
                    });
                    log::debug!("indexed {}.{} as stock tag #{}", path, class, position);
                    return Ok(TagId::new(tag_index));
                }
                if self.params.always_index {
                    return Err(BuildError::MissingIndexedTag {
                        path: path.to_owned(),
                        class,
                    });
                }
            }
        }

        let bytes = match self.source.load(path, class)? {
            Some(bytes) => bytes,
            None => {
                return Err(match self.source.probe_class(path) {
                    Some(found) if found != class => BuildError::WrongTagClass {
                        path: path.to_owned(),
                        expected: class.to_string(),
                        found,
                    },
                    _ => BuildError::UnresolvedDependency {
                        path: path.to_owned(),
                        class,
                    },
                });
            }
        };

        let mut rdr = Cursor::new(bytes.as_slice());
        let header = TagFileHeader::parse(&mut rdr).map_err(|e| BuildError::InvalidTagFile {
            path: path.to_owned(),
            reason: tag_file_reason(&e),
        })?;
        if header.class != class {
            return Err(BuildError::WrongTagClass {
                path: path.to_owned(),
                expected: class.to_string(),
                found: header.class,
            });
        }

        let layout = self
            .schemas
            .schema(class)
            .ok_or(BuildError::InvalidTagFile {
                path: path.to_owned(),
                reason: "no schema registered for class",
            })?
            .layout
            .clone();

        let tag_index = self.tags.len();
        self.lookup.insert((path.to_owned(), class), tag_index);
        self.tags.push(BuildTag {
            path: path.to_owned(),
            class,
            root_struct: None,
            dependencies: Vec::new(),
            in_progress: true,
            indexed: None,
        });

        let root = self.alloc_struct(layout.slots(), layout.byte_size() as usize, layout.alignment, false)?;
        self.tags[tag_index].root_struct = Some(root);
        self.fill_struct(root, &layout, &mut rdr, tag_index, path)?;

        if class == TagClass::Scenario {
            self.compile_scenario_scripts(root, &layout, path)?;
        }

        self.tags[tag_index].in_progress = false;
        log::debug!("imported {}.{} as tag {}", path, class, tag_index);
        Ok(TagId::new(tag_index))
    }

    pub(crate) fn alloc_struct(
        &mut self,
        slots: Vec<Slot>,
        size: usize,
        alignment: u32,
        unsafe_to_dedupe: bool,
    ) -> Result<usize, BuildError> {
        if self.structs.len() >= MAX_STRUCTS {
            return Err(BuildError::TooManyStructs {
                count: self.structs.len() + 1,
                maximum: MAX_STRUCTS,
            });
        }
        self.structs.push(BuildStruct {
            data: vec![0; size],
            slots,
            alignment,
            pointers: Vec::new(),
            unsafe_to_dedupe,
            dead: false,
            offset: None,
        });
        Ok(self.structs.len() - 1)
    }

    /// Parse one struct's fields from the tag file into the heap slot
    /// `struct_index`, recursing into dependencies, blocks and data.
    fn fill_struct(
        &mut self,
        struct_index: usize,
        layout: &StructLayout,
        rdr: &mut Cursor<&[u8]>,
        tag_index: usize,
        tag_path: &str,
    ) -> Result<(), BuildError> {
        let mut data = vec![0u8; layout.byte_size() as usize];
        let mut pointers: Vec<PointerDescriptor> = Vec::new();
        let mut offset = 0usize;

        for field in &layout.fields {
            match field {
                FieldDef::Scalar { ty, .. } => {
                    read_scalar(rdr, *ty, &mut data[offset..]).map_err(|_| truncated(tag_path))?;
                }
                FieldDef::Dependency { expected, .. } => {
                    let fourcc = rdr.read_u32::<BigEndian>().map_err(|_| truncated(tag_path))?;
                    if fourcc == 0 {
                        LittleEndian::write_u32(&mut data[offset + 12..offset + 16], TagId::NULL.as_u32());
                    } else {
                        let dep_class =
                            TagClass::try_from(fourcc).map_err(|_| BuildError::InvalidTagFile {
                                path: tag_path.to_owned(),
                                reason: "unknown dependency class",
                            })?;
                        let length = rdr.read_u16::<LittleEndian>().map_err(|_| truncated(tag_path))?;
                        let mut path_buf = vec![0u8; length as usize];
                        rdr.read_exact(&mut path_buf).map_err(|_| truncated(tag_path))?;
                        let dep_path =
                            String::from_utf8(path_buf).map_err(|_| BuildError::InvalidTagFile {
                                path: tag_path.to_owned(),
                                reason: "dependency path is not valid utf-8",
                            })?;
                        if !expected.accepts(dep_class) {
                            return Err(BuildError::WrongTagClass {
                                path: dep_path,
                                expected: expected.to_string(),
                                found: dep_class,
                            });
                        }
                        let id = self.import_tag(&dep_path, dep_class)?;
                        BigEndian::write_u32(&mut data[offset..offset + 4], dep_class.fourcc());
                        LittleEndian::write_u32(&mut data[offset + 12..offset + 16], id.as_u32());
                        self.tags[tag_index].dependencies.push(id);
                    }
                }
                FieldDef::Block { element, .. } => {
                    let count = rdr.read_u32::<LittleEndian>().map_err(|_| truncated(tag_path))?;
                    LittleEndian::write_u32(&mut data[offset..offset + 4], count);
                    if count > 0 {
                        // Reserve the whole run up front so the elements get
                        // consecutive struct indices regardless of what their
                        // own children allocate.
                        let element_slots = element.slots();
                        let element_size = element.byte_size() as usize;
                        let first = self.structs.len();
                        for _ in 0..count {
                            self.alloc_struct(
                                element_slots.clone(),
                                element_size,
                                element.alignment,
                                true,
                            )?;
                        }
                        for e in 0..count as usize {
                            self.fill_struct(first + e, element, rdr, tag_index, tag_path)?;
                        }
                        pointers.push(PointerDescriptor {
                            offset: (offset + 4) as u32,
                            target: first,
                            kind: PointerKind::BlockElements,
                        });
                    }
                }
                FieldDef::Data { .. } => {
                    let length = rdr.read_u32::<LittleEndian>().map_err(|_| truncated(tag_path))?;
                    LittleEndian::write_u32(&mut data[offset..offset + 4], length);
                    if length > 0 {
                        let mut payload = vec![0u8; length as usize];
                        rdr.read_exact(&mut payload).map_err(|_| truncated(tag_path))?;
                        let child = self.alloc_struct(Vec::new(), 0, 4, false)?;
                        self.structs[child].data = payload;
                        pointers.push(PointerDescriptor {
                            offset: (offset + 12) as u32,
                            target: child,
                            kind: PointerKind::DataPayload,
                        });
                    }
                }
            }
            offset += field_size(field);
        }

        let slot = &mut self.structs[struct_index];
        slot.data = data;
        slot.pointers = pointers;
        Ok(())
    }

    /// Tokenize and compile the scenario's script source, embedding the
    /// resulting node table as the syntax-data payload.
    fn compile_scenario_scripts(
        &mut self,
        root: usize,
        layout: &StructLayout,
        tag_path: &str,
    ) -> Result<(), BuildError> {
        let (Some(source_offset), Some(syntax_offset)) = (
            layout.field_offset("script_source"),
            layout.field_offset("script_syntax_data"),
        ) else {
            return Ok(());
        };

        let text = match self.structs[root].pointer_at(source_offset + 12) {
            Some(payload) => String::from_utf8(self.structs[payload].data.clone()).map_err(|_| {
                BuildError::InvalidTagFile {
                    path: tag_path.to_owned(),
                    reason: "script source is not valid utf-8",
                }
            })?,
            None => return Ok(()),
        };
        if text.is_empty() {
            return Ok(());
        }

        let tokens = tokenize(&text)?;
        let table = self.script_compiler.compile(&tokens)?;
        log::debug!(
            "compiled {} script tokens into a {} byte node table",
            tokens.len(),
            table.len()
        );

        let child = self.alloc_struct(Vec::new(), 0, 4, false)?;
        let length = table.len() as u32;
        self.structs[child].data = table;
        let root_struct = &mut self.structs[root];
        LittleEndian::write_u32(
            &mut root_struct.data[syntax_offset as usize..syntax_offset as usize + 4],
            length,
        );
        // A freshly compiled table replaces any table the tag file carried.
        root_struct.pointers.retain(|p| p.offset != syntax_offset + 12);
        root_struct.pointers.push(PointerDescriptor {
            offset: syntax_offset + 12,
            target: child,
            kind: PointerKind::DataPayload,
        });
        Ok(())
    }
}

fn field_size(field: &FieldDef) -> usize {
    use crate::tag::schema::{BLOCK_WIRE_SIZE, DATA_WIRE_SIZE, DEPENDENCY_WIRE_SIZE};
    match field {
        FieldDef::Scalar { ty, .. } => match ty {
            FieldType::U8 | FieldType::I8 => 1,
            FieldType::U16 | FieldType::I16 | FieldType::Flags16 => 2,
            FieldType::Pad(n) => *n as usize,
            _ => 4,
        },
        FieldDef::Dependency { .. } => DEPENDENCY_WIRE_SIZE as usize,
        FieldDef::Block { .. } => BLOCK_WIRE_SIZE as usize,
        FieldDef::Data { .. } => DATA_WIRE_SIZE as usize,
    }
}

/// Read one scalar at its canonical width into the canonical buffer.
fn read_scalar(rdr: &mut Cursor<&[u8]>, ty: FieldType, out: &mut [u8]) -> std::io::Result<()> {
    match ty {
        FieldType::U8 | FieldType::I8 => out[0] = rdr.read_u8()?,
        FieldType::U16 | FieldType::I16 | FieldType::Flags16 => {
            LittleEndian::write_u16(&mut out[..2], rdr.read_u16::<LittleEndian>()?);
        }
        FieldType::Fourcc => {
            BigEndian::write_u32(&mut out[..4], rdr.read_u32::<BigEndian>()?);
        }
        FieldType::Pad(_) => {}
        _ => LittleEndian::write_u32(&mut out[..4], rdr.read_u32::<LittleEndian>()?),
    }
    Ok(())
}

fn truncated(path: &str) -> BuildError {
    BuildError::InvalidTagFile {
        path: path.to_owned(),
        reason: "truncated field data",
    }
}

fn tag_file_reason(error: &TagFileError) -> &'static str {
    match error {
        TagFileError::BadMagic { .. } => "bad magic",
        TagFileError::BadVersion { .. } => "unsupported version",
        TagFileError::UnknownClass { .. } => "unknown class",
        TagFileError::Truncated => "truncated header",
    }
}
