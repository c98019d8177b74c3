//! Fixed-layout cache file records shared by the writer and the loader.

use std::io::{self, Write};

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};

use crate::engine::Engine;
use crate::map::MapError;

/// `head`
pub const HEAD_MAGIC: u32 = 0x6865_6164;
/// `foot`
pub const FOOT_MAGIC: u32 = 0x666F_6F74;

pub const HEADER_SIZE: usize = 128;
pub const SCENARIO_NAME_SIZE: usize = 32;

pub const TAG_INDEX_HEADER_SIZE: usize = 16;
pub const TAG_INDEX_ENTRY_SIZE: usize = 24;

/// Bit 0 of the per-entry flags word marks a stock/indexed tag.
pub const TAG_ENTRY_FLAG_INDEXED: u32 = 0x1;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct CacheFlags: u32 {
        const COMPRESSED = 0x1;
    }
}

/// The fixed 128-byte cache file header. Always little-endian regardless of
/// the engine target; only the body past it is engine-converted.
#[derive(Debug, Clone)]
pub struct CacheHeader {
    pub engine: Engine,
    /// Total uncompressed file length; zero for uncompressed files.
    pub decompressed_length: u32,
    /// Total primary region length (uncompressed).
    pub file_length: u32,
    pub tag_data_offset: u32,
    pub tag_data_length: u32,
    pub base_memory_address: u32,
    /// CRC32 over the body (everything past the header), possibly forged.
    pub checksum: u32,
    pub flags: CacheFlags,
    pub scenario_name: String,
}

impl CacheHeader {
    pub fn parse(bytes: &[u8]) -> Result<CacheHeader, MapError> {
        if bytes.len() < HEADER_SIZE {
            return Err(MapError::TruncatedHeader {
                length: bytes.len(),
            });
        }
        let magic = BigEndian::read_u32(&bytes[0..4]);
        if magic != HEAD_MAGIC {
            return Err(MapError::InvalidMagic { magic });
        }
        let foot = BigEndian::read_u32(&bytes[124..128]);
        if foot != FOOT_MAGIC {
            return Err(MapError::InvalidMagic { magic: foot });
        }
        let engine_fourcc = BigEndian::read_u32(&bytes[4..8]);
        let engine = Engine::try_from(engine_fourcc).map_err(|_| MapError::UnknownEngine {
            engine: engine_fourcc,
        })?;

        let name_bytes = &bytes[36..36 + SCENARIO_NAME_SIZE];
        let name_end = name_bytes.iter().position(|&b| b == 0).unwrap_or(SCENARIO_NAME_SIZE);
        let scenario_name = String::from_utf8_lossy(&name_bytes[..name_end]).into_owned();

        Ok(CacheHeader {
            engine,
            decompressed_length: LittleEndian::read_u32(&bytes[8..12]),
            file_length: LittleEndian::read_u32(&bytes[12..16]),
            tag_data_offset: LittleEndian::read_u32(&bytes[16..20]),
            tag_data_length: LittleEndian::read_u32(&bytes[20..24]),
            base_memory_address: LittleEndian::read_u32(&bytes[24..28]),
            checksum: LittleEndian::read_u32(&bytes[28..32]),
            flags: CacheFlags::from_bits_retain(LittleEndian::read_u32(&bytes[32..36])),
            scenario_name,
        })
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<BigEndian>(HEAD_MAGIC)?;
        w.write_u32::<BigEndian>(self.engine.fourcc())?;
        w.write_u32::<LittleEndian>(self.decompressed_length)?;
        w.write_u32::<LittleEndian>(self.file_length)?;
        w.write_u32::<LittleEndian>(self.tag_data_offset)?;
        w.write_u32::<LittleEndian>(self.tag_data_length)?;
        w.write_u32::<LittleEndian>(self.base_memory_address)?;
        w.write_u32::<LittleEndian>(self.checksum)?;
        w.write_u32::<LittleEndian>(self.flags.bits())?;

        let mut name = [0u8; SCENARIO_NAME_SIZE];
        let source = self.scenario_name.as_bytes();
        let length = source.len().min(SCENARIO_NAME_SIZE - 1);
        name[..length].copy_from_slice(&source[..length]);
        w.write_all(&name)?;

        w.write_all(&[0u8; HEADER_SIZE - 36 - SCENARIO_NAME_SIZE - 4])?;
        w.write_u32::<BigEndian>(FOOT_MAGIC)?;
        Ok(())
    }
}
