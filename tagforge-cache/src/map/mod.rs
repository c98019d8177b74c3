//! The cache file loader: the mirror read path of the build workload.
//!
//! A loaded [`Map`] owns up to four independently addressable regions
//! (primary, bitmap, localization, sound), validates the header and
//! checksum, transparently reverses compression, and rebuilds the tag
//! table from the tag index. All reads are bounds-checked; nothing here
//! mutates the file.

use std::io::Read;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use flate2::read::ZlibDecoder;
use thiserror::Error;

use crate::engine::{Engine, WireOrder};
use crate::map::types::{
    CacheFlags, CacheHeader, HEADER_SIZE, TAG_ENTRY_FLAG_INDEXED, TAG_INDEX_ENTRY_SIZE,
    TAG_INDEX_HEADER_SIZE,
};
use crate::tag::{TagClass, TagId};

pub mod types;


/// One of the four independently addressable byte ranges of a loaded map.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Region {
    Primary,
    Bitmap,
    Localization,
    Sound,
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Region::Primary => "primary",
            Region::Bitmap => "bitmap",
            Region::Localization => "localization",
            Region::Sound => "sound",
        })
    }
}

#[derive(Error, Debug)]
pub enum MapError {
    #[error("file too small for a cache header ({length} bytes)")]
    TruncatedHeader { length: usize },

    #[error("invalid magic value {magic:#010x}")]
    InvalidMagic { magic: u32 },

    #[error("unknown engine tag {engine:#010x}")]
    UnknownEngine { engine: u32 },

    #[error("corrupt cache file: {reason}")]
    InvalidLength { reason: &'static str },

    #[error("checksum mismatch (header {expected:#010x}, body {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("failed to decompress cache file body")]
    DecompressionFailure(#[source] std::io::Error),

    #[error("{region} region read out of bounds (offset {offset}, size {size})")]
    OutOfBounds {
        region: Region,
        offset: usize,
        size: usize,
    },

    #[error("tag index entry has unrecognized class {fourcc:#010x}")]
    UnknownTagClass { fourcc: u32 },

    #[error("corrupt tag index: {reason}")]
    CorruptTagIndex { reason: &'static str },
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Enforce the header checksum against the (decompressed) body.
    pub verify_checksum: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions {
            verify_checksum: true,
        }
    }
}

/// One entry of the reconstructed tag table.
#[derive(Debug, Clone)]
pub struct MapTag {
    pub path: String,
    pub class: TagClass,
    pub id: TagId,
    /// Root struct offset within the tag data window; `None` for stock
    /// (indexed) tags.
    pub data_offset: Option<u32>,
    /// Position in the external reference index, for stock tags.
    pub indexed_id: Option<u32>,
}

/// A loaded, read-only cache file.
#[derive(Debug)]
pub struct Map {
    data: Vec<u8>,
    bitmap_data: Vec<u8>,
    localization_data: Vec<u8>,
    sound_data: Vec<u8>,
    header: CacheHeader,
    compressed: bool,
    tags: Vec<MapTag>,
    scenario_tag: Option<usize>,
    protected: bool,
}

impl Map {
    /// Load a map from its primary buffer plus optional split resource
    /// buffers. Compressed primaries are reversed transparently.
    pub fn load(
        data: Vec<u8>,
        bitmap_data: Vec<u8>,
        localization_data: Vec<u8>,
        sound_data: Vec<u8>,
        options: &LoadOptions,
    ) -> Result<Map, MapError> {
        let header = CacheHeader::parse(&data)?;

        let compressed = header.flags.contains(CacheFlags::COMPRESSED);
        let data = if compressed {
            decompress(&header, data)?
        } else {
            data
        };

        if header.file_length as usize != data.len() {
            return Err(MapError::InvalidLength {
                reason: "file length field does not match the data",
            });
        }

        let actual = crc32fast::hash(&data[HEADER_SIZE..]);
        if options.verify_checksum && actual != header.checksum {
            return Err(MapError::ChecksumMismatch {
                expected: header.checksum,
                actual,
            });
        }

        let tag_data_offset = header.tag_data_offset as usize;
        let tag_data_length = header.tag_data_length as usize;
        let window_end = tag_data_offset
            .checked_add(tag_data_length)
            .ok_or(MapError::InvalidLength {
                reason: "tag data window overflows",
            })?;
        if tag_data_offset < HEADER_SIZE || window_end > data.len() {
            return Err(MapError::InvalidLength {
                reason: "tag data window exceeds the primary region",
            });
        }

        let mut map = Map {
            data,
            bitmap_data,
            localization_data,
            sound_data,
            header,
            compressed,
            tags: Vec::new(),
            scenario_tag: None,
            protected: false,
        };
        map.populate_tag_array()?;
        if map.protected {
            log::warn!("map fails the compiler's structural invariants; possibly protected");
        }
        Ok(map)
    }

    pub fn header(&self) -> &CacheHeader {
        &self.header
    }

    pub fn engine(&self) -> Engine {
        self.header.engine
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Structural invariants the compiler always guarantees were violated.
    /// Advisory only; the map still loads.
    pub fn is_protected(&self) -> bool {
        self.protected
    }

    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    pub fn tags(&self) -> &[MapTag] {
        &self.tags
    }

    pub fn tag(&self, index: usize) -> Option<&MapTag> {
        self.tags.get(index)
    }

    /// Index of the scenario tag, if the header names one.
    pub fn scenario_tag(&self) -> Option<usize> {
        self.scenario_tag
    }

    /// Bounds-checked read: at least `min_size` bytes at `offset` within the
    /// given region.
    pub fn get_data_at_offset(
        &self,
        region: Region,
        offset: usize,
        min_size: usize,
    ) -> Result<&[u8], MapError> {
        let buffer = match region {
            Region::Primary => &self.data,
            Region::Bitmap => &self.bitmap_data,
            Region::Localization => &self.localization_data,
            Region::Sound => &self.sound_data,
        };
        let end = offset.checked_add(min_size);
        match end {
            Some(end) if end <= buffer.len() => Ok(&buffer[offset..]),
            _ => Err(MapError::OutOfBounds {
                region,
                offset,
                size: min_size,
            }),
        }
    }

    /// Like [`Map::get_data_at_offset`], but within the tag data sub-window
    /// of the primary region.
    pub fn get_tag_data_at_offset(&self, offset: usize, min_size: usize) -> Result<&[u8], MapError> {
        let window_offset = self.header.tag_data_offset as usize;
        let window_length = self.header.tag_data_length as usize;
        let end = offset.checked_add(min_size);
        match end {
            Some(end) if end <= window_length => {
                Ok(&self.data[window_offset + offset..window_offset + window_length])
            }
            _ => Err(MapError::OutOfBounds {
                region: Region::Primary,
                offset: window_offset + offset,
                size: min_size,
            }),
        }
    }

    /// Undo the fixup stage for one pointer: subtract the recorded base
    /// memory address and bounds-check against the tag data window.
    pub fn resolve_tag_data_pointer(&self, pointer: u32, min_size: usize) -> Result<&[u8], MapError> {
        let base = self.header.base_memory_address;
        if pointer < base {
            return Err(MapError::OutOfBounds {
                region: Region::Primary,
                offset: pointer as usize,
                size: min_size,
            });
        }
        self.get_tag_data_at_offset((pointer - base) as usize, min_size)
    }

    /// Rebuild the tag table from the tag index header.
    fn populate_tag_array(&mut self) -> Result<(), MapError> {
        let order = self.header.engine.wire_order();
        let base = self.header.base_memory_address;

        let index = self.get_tag_data_at_offset(0, TAG_INDEX_HEADER_SIZE)?;
        let tag_array_pointer = get_u32(&index[0..4], order);
        let scenario_id = TagId::from_u32(get_u32(&index[4..8], order));
        let tag_count = get_u32(&index[8..12], order) as usize;

        if tag_array_pointer < base {
            return Err(MapError::CorruptTagIndex {
                reason: "tag array pointer below the base address",
            });
        }
        let entries_offset = (tag_array_pointer - base) as usize;
        self.get_tag_data_at_offset(entries_offset, tag_count * TAG_INDEX_ENTRY_SIZE)?;

        let window_length = self.header.tag_data_length as usize;
        let mut tags = Vec::with_capacity(tag_count);
        let mut protected = false;

        for i in 0..tag_count {
            let entry =
                self.get_tag_data_at_offset(entries_offset + i * TAG_INDEX_ENTRY_SIZE, TAG_INDEX_ENTRY_SIZE)?;
            let fourcc = BigEndian::read_u32(&entry[0..4]);
            let class = TagClass::try_from(fourcc)
                .map_err(|_| MapError::UnknownTagClass { fourcc })?;
            let id = TagId::from_u32(get_u32(&entry[4..8], order));
            let path_pointer = get_u32(&entry[8..12], order);
            let data_pointer = get_u32(&entry[12..16], order);
            let flags = get_u32(&entry[16..20], order);

            let path = self.read_tag_path(path_pointer)?;
            if path.is_empty() {
                protected = true;
            }

            let (data_offset, indexed_id) = if flags & TAG_ENTRY_FLAG_INDEXED != 0 {
                (None, Some(data_pointer))
            } else {
                if data_pointer < base || (data_pointer - base) as usize >= window_length {
                    return Err(MapError::CorruptTagIndex {
                        reason: "tag data pointer outside the primary region",
                    });
                }
                (Some(data_pointer - base), None)
            };

            tags.push(MapTag {
                path,
                class,
                id,
                data_offset,
                indexed_id,
            });
        }

        // Duplicate path+class pairs never come out of the compiler.
        let mut seen: Vec<(u32, &str)> = tags
            .iter()
            .map(|t| (t.class.fourcc(), t.path.as_str()))
            .collect();
        seen.sort_unstable();
        if seen.windows(2).any(|w| w[0] == w[1]) {
            protected = true;
        }

        self.scenario_tag = if scenario_id.is_null() {
            protected = true;
            None
        } else {
            let index = scenario_id.index as usize;
            if index >= tags.len() {
                return Err(MapError::CorruptTagIndex {
                    reason: "scenario tag id out of range",
                });
            }
            if tags[index].class != TagClass::Scenario {
                protected = true;
            }
            Some(index)
        };

        self.tags = tags;
        self.protected = protected;
        Ok(())
    }

    fn read_tag_path(&self, pointer: u32) -> Result<String, MapError> {
        let available = self.resolve_tag_data_pointer(pointer, 1)?;
        match available.iter().position(|&b| b == 0) {
            Some(end) => Ok(String::from_utf8_lossy(&available[..end]).into_owned()),
            None => Err(MapError::CorruptTagIndex {
                reason: "unterminated tag path",
            }),
        }
    }
}

fn decompress(header: &CacheHeader, data: Vec<u8>) -> Result<Vec<u8>, MapError> {
    let expected = header.decompressed_length as usize;
    if expected < HEADER_SIZE {
        return Err(MapError::InvalidLength {
            reason: "decompressed length smaller than the header",
        });
    }
    let mut out = Vec::with_capacity(expected);
    out.extend_from_slice(&data[..HEADER_SIZE]);
    let mut decoder = ZlibDecoder::new(&data[HEADER_SIZE..]);
    decoder
        .read_to_end(&mut out)
        .map_err(MapError::DecompressionFailure)?;
    if out.len() != expected {
        return Err(MapError::InvalidLength {
            reason: "decompressed length field does not match the stream",
        });
    }
    Ok(out)
}

fn get_u32(buf: &[u8], order: WireOrder) -> u32 {
    match order {
        WireOrder::Little => LittleEndian::read_u32(buf),
        WireOrder::Big => BigEndian::read_u32(buf),
    }
}
