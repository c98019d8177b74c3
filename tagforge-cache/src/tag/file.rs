//! The editable tag file container (`tagf`).
//!
//! A tag file is the loose on-disk form of a single tag: a small header
//! followed by the class's fields in schema order. Scalars are stored at
//! their canonical widths, little-endian. Dependencies store the referenced
//! class and path; blocks store their element count followed by the elements
//! inline; data fields store a length-prefixed payload.

use std::io::Read;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};

use crate::tag::TagClass;

/// `tagf`
pub const TAG_FILE_MAGIC: u32 = 0x7461_6766;
pub const TAG_FILE_VERSION: u16 = 1;

#[derive(Debug, Copy, Clone)]
pub struct TagFileHeader {
    pub class: TagClass,
}

#[derive(Debug)]
pub enum TagFileError {
    BadMagic { magic: u32 },
    BadVersion { version: u16 },
    UnknownClass { fourcc: u32 },
    Truncated,
}

impl TagFileHeader {
    pub fn parse<R: Read>(rdr: &mut R) -> Result<TagFileHeader, TagFileError> {
        let magic = rdr.read_u32::<BigEndian>().map_err(|_| TagFileError::Truncated)?;
        if magic != TAG_FILE_MAGIC {
            return Err(TagFileError::BadMagic { magic });
        }
        let fourcc = rdr.read_u32::<BigEndian>().map_err(|_| TagFileError::Truncated)?;
        let class =
            TagClass::try_from(fourcc).map_err(|_| TagFileError::UnknownClass { fourcc })?;
        let version = rdr.read_u16::<LittleEndian>().map_err(|_| TagFileError::Truncated)?;
        if version != TAG_FILE_VERSION {
            return Err(TagFileError::BadVersion { version });
        }
        rdr.read_u16::<LittleEndian>().map_err(|_| TagFileError::Truncated)?;
        Ok(TagFileHeader { class })
    }
}

/// Sequential tag file writer. The caller is responsible for emitting values
/// in the exact order the class schema declares them; the reader re-walks the
/// same schema on import.
pub struct TagFileBuilder {
    buf: Vec<u8>,
}

impl TagFileBuilder {
    pub fn new(class: TagClass) -> TagFileBuilder {
        let mut buf = Vec::new();
        buf.extend_from_slice(&TAG_FILE_MAGIC.to_be_bytes());
        buf.extend_from_slice(&class.fourcc().to_be_bytes());
        buf.extend_from_slice(&TAG_FILE_VERSION.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        TagFileBuilder { buf }
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn i8(&mut self, value: i8) -> &mut Self {
        self.buf.push(value as u8);
        self
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn i16(&mut self, value: i16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn f32(&mut self, value: f32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn fourcc(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// A dependency reference; `None` writes a null reference.
    pub fn dependency(&mut self, reference: Option<(TagClass, &str)>) -> &mut Self {
        match reference {
            Some((class, path)) => {
                self.buf.extend_from_slice(&class.fourcc().to_be_bytes());
                self.buf.extend_from_slice(&(path.len() as u16).to_le_bytes());
                self.buf.extend_from_slice(path.as_bytes());
            }
            None => {
                self.buf.extend_from_slice(&0u32.to_be_bytes());
            }
        }
        self
    }

    /// Begin a block: the caller must follow with `count` runs of the
    /// element layout's fields.
    pub fn block_count(&mut self, count: u32) -> &mut Self {
        self.buf.extend_from_slice(&count.to_le_bytes());
        self
    }

    pub fn data(&mut self, payload: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(payload);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}
