//! Git pack file format.
//!
//! The conversations treat pack encoding as an external service behind
//! [`PackCodec`]. [`PackfileCodec`] is the default implementation: it writes
//! and reads version-2 packs of undeltified objects.
//! See: https://git-scm.com/docs/pack-format

use crate::{GitError, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use gitwire_objects::{GitObject, ObjectId, ObjectType};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io::{Read, Write};

/// Magic bytes at the start of a pack file.
pub const PACK_SIGNATURE: &[u8; 4] = b"PACK";
/// Pack file version we support.
const PACK_VERSION: u32 = 2;
const HEADER_LEN: usize = 12;
const CHECKSUM_LEN: usize = 20;
const OFS_DELTA_TYPE: u8 = 6;
const REF_DELTA_TYPE: u8 = 7;

/// Pack encoding and decoding used by fetch and push conversations.
pub trait PackCodec: Send {
    /// Decodes a pack into its objects, keyed by id.
    fn decode(&self, pack: &[u8]) -> Result<HashMap<ObjectId, GitObject>>;

    /// Encodes objects into a pack.
    fn encode(&self, objects: &[GitObject]) -> Result<Vec<u8>>;
}

/// Default codec for undeltified version-2 packs.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackfileCodec;

impl PackCodec for PackfileCodec {
    fn decode(&self, pack: &[u8]) -> Result<HashMap<ObjectId, GitObject>> {
        let objects = PackParser::new(pack).parse()?;
        Ok(objects.into_iter().map(|o| (o.id, o)).collect())
    }

    fn encode(&self, objects: &[GitObject]) -> Result<Vec<u8>> {
        let mut builder = PackBuilder::new();
        for object in objects {
            builder.add(object.clone());
        }
        builder.build()
    }
}

/// Builds a pack file from a set of objects.
pub struct PackBuilder {
    objects: Vec<GitObject>,
}

impl PackBuilder {
    /// Creates a new pack builder.
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
        }
    }

    /// Adds an object to the pack.
    pub fn add(&mut self, object: GitObject) {
        self.objects.push(object);
    }

    /// Number of objects added so far.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if no object was added.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Builds the pack file.
    pub fn build(self) -> Result<Vec<u8>> {
        let mut pack = Vec::new();

        pack.extend_from_slice(PACK_SIGNATURE);
        pack.extend_from_slice(&PACK_VERSION.to_be_bytes());
        pack.extend_from_slice(&(self.objects.len() as u32).to_be_bytes());

        for object in &self.objects {
            Self::write_object(&mut pack, object)?;
        }

        let checksum = Sha1::digest(&pack);
        pack.extend_from_slice(&checksum);

        tracing::debug!(objects = self.objects.len(), bytes = pack.len(), "built pack");
        Ok(pack)
    }

    /// Writes a single object entry.
    fn write_object(pack: &mut Vec<u8>, object: &GitObject) -> Result<()> {
        let obj_type = object.object_type.pack_type();
        let size = object.data.len();

        // First byte: (MSB=more bytes) (3 bits type) (4 bits size)
        let mut first_byte = (obj_type << 4) | ((size & 0x0F) as u8);
        let mut remaining_size = size >> 4;

        if remaining_size > 0 {
            first_byte |= 0x80;
        }
        pack.push(first_byte);

        // 7 bits per byte, MSB=continue
        while remaining_size > 0 {
            let mut byte = (remaining_size & 0x7F) as u8;
            remaining_size >>= 7;
            if remaining_size > 0 {
                byte |= 0x80;
            }
            pack.push(byte);
        }

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&object.data)
            .map_err(|e| GitError::InvalidPack(e.to_string()))?;
        let compressed = encoder
            .finish()
            .map_err(|e| GitError::InvalidPack(e.to_string()))?;
        pack.extend_from_slice(&compressed);

        Ok(())
    }
}

impl Default for PackBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses a pack file and extracts objects.
pub struct PackParser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PackParser<'a> {
    /// Creates a new pack parser.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Parses the pack file, returning objects in pack order.
    pub fn parse(&mut self) -> Result<Vec<GitObject>> {
        if self.data.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err(GitError::InvalidPack("pack too small".to_string()));
        }

        if &self.data[0..4] != PACK_SIGNATURE {
            return Err(GitError::InvalidPack("invalid signature".to_string()));
        }

        let version = u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]]);
        if version != PACK_VERSION {
            return Err(GitError::InvalidPack(format!(
                "unsupported version: {}",
                version
            )));
        }

        let object_count =
            u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]]) as usize;

        let checksum_start = self.data.len() - CHECKSUM_LEN;
        let computed = Sha1::digest(&self.data[..checksum_start]);
        if computed.as_slice() != &self.data[checksum_start..] {
            return Err(GitError::InvalidPack("checksum mismatch".to_string()));
        }

        self.pos = HEADER_LEN;

        // The count is untrusted; every entry takes at least two bytes.
        let mut objects = Vec::with_capacity(object_count.min(checksum_start / 2));
        for _ in 0..object_count {
            objects.push(self.parse_object(checksum_start)?);
        }

        if self.pos != checksum_start {
            return Err(GitError::InvalidPack(format!(
                "{} trailing bytes after last object",
                checksum_start - self.pos
            )));
        }

        tracing::debug!(objects = objects.len(), "parsed pack");
        Ok(objects)
    }

    /// Parses a single object.
    fn parse_object(&mut self, end: usize) -> Result<GitObject> {
        if self.pos >= end {
            return Err(GitError::InvalidPack("unexpected end of pack".to_string()));
        }

        let first_byte = self.data[self.pos];
        self.pos += 1;

        let obj_type_code = (first_byte >> 4) & 0x07;
        let mut size = (first_byte & 0x0F) as usize;
        let mut shift = 4;

        if first_byte & 0x80 != 0 {
            loop {
                if self.pos >= end {
                    return Err(GitError::InvalidPack("unexpected end in size".to_string()));
                }
                if shift > 57 {
                    return Err(GitError::InvalidPack("object size overflow".to_string()));
                }
                let byte = self.data[self.pos];
                self.pos += 1;
                size |= ((byte & 0x7F) as usize) << shift;
                shift += 7;
                if byte & 0x80 == 0 {
                    break;
                }
            }
        }

        if obj_type_code == OFS_DELTA_TYPE || obj_type_code == REF_DELTA_TYPE {
            return Err(GitError::InvalidPack(
                "delta entries are not supported (fetch with a depth of 1 to avoid them)".to_string(),
            ));
        }
        let object_type = ObjectType::from_pack_type(obj_type_code)?;

        let remaining = &self.data[self.pos..end];
        let mut decoder = ZlibDecoder::new(remaining);
        let mut decompressed = Vec::with_capacity(size.min(remaining.len() * 8));
        decoder
            .by_ref()
            .take(size as u64 + 1)
            .read_to_end(&mut decompressed)
            .map_err(|e| GitError::InvalidPack(format!("decompression failed: {}", e)))?;
        if decompressed.len() != size {
            return Err(GitError::InvalidPack(format!(
                "object size mismatch: expected {}, got {}",
                size,
                decompressed.len()
            )));
        }

        self.pos += decoder.total_in() as usize;

        Ok(GitObject::new(object_type, decompressed))
    }
}
