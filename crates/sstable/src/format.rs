use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Result as IoResult, Seek, SeekFrom, Write};

use crate::SstError;

/// Maximum entry payload per data block, excluding the CRC trailer.
pub const BLOCK_PAYLOAD_LIMIT: usize = 4 * 1024;

/// Size of the fixed footer at the end of every table file.
pub const FOOTER_BYTES: u64 = 32;

/// Parsed footer: locations of the block index and the bloom filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub index_off: u64,
    pub index_len: u64,
    pub bloom_off: u64,
    pub bloom_len: u64,
}

impl Footer {
    /// Writes the footer (all fields `u64` little-endian).
    pub fn write_to<W: Write>(&self, w: &mut W) -> IoResult<()> {
        w.write_u64::<LittleEndian>(self.index_off)?;
        w.write_u64::<LittleEndian>(self.index_len)?;
        w.write_u64::<LittleEndian>(self.bloom_off)?;
        w.write_u64::<LittleEndian>(self.bloom_len)?;
        Ok(())
    }

    /// Reads the footer from the last [`FOOTER_BYTES`] of the file and
    /// bounds-checks its offsets against the file size.
    pub fn read_from<R: Read + Seek>(r: &mut R) -> Result<(Footer, u64), SstError> {
        let filesize = r.seek(SeekFrom::End(0))?;
        if filesize < FOOTER_BYTES {
            return Err(SstError::Corrupt(format!(
                "file too small for footer: {} bytes",
                filesize
            )));
        }

        r.seek(SeekFrom::Start(filesize - FOOTER_BYTES))?;
        let footer = Footer {
            index_off: r.read_u64::<LittleEndian>()?,
            index_len: r.read_u64::<LittleEndian>()?,
            bloom_off: r.read_u64::<LittleEndian>()?,
            bloom_len: r.read_u64::<LittleEndian>()?,
        };

        let body_end = filesize - FOOTER_BYTES;
        let index_end = footer.index_off.checked_add(footer.index_len);
        let bloom_end = footer.bloom_off.checked_add(footer.bloom_len);
        match (index_end, bloom_end) {
            (Some(ie), Some(be)) if ie <= body_end && be <= body_end => Ok((footer, filesize)),
            _ => Err(SstError::Corrupt("footer offsets out of range".to_string())),
        }
    }
}

/// Index entry describing one data block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMeta {
    /// First key stored in the block.
    pub first_key: Vec<u8>,
    /// Byte offset of the block within the file.
    pub offset: u64,
    /// Block length including the CRC trailer.
    pub len: u64,
}

/// Serializes the block index: `count(u32 LE)` then one record per block.
pub fn write_block_index<W: Write>(w: &mut W, blocks: &[BlockMeta]) -> IoResult<()> {
    w.write_u32::<LittleEndian>(blocks.len() as u32)?;
    for meta in blocks {
        w.write_u32::<LittleEndian>(meta.first_key.len() as u32)?;
        w.write_all(&meta.first_key)?;
        w.write_u64::<LittleEndian>(meta.offset)?;
        w.write_u64::<LittleEndian>(meta.len)?;
    }
    Ok(())
}

/// Deserializes the block index written by [`write_block_index`].
pub fn read_block_index(bytes: &[u8]) -> Result<Vec<BlockMeta>, SstError> {
    let mut r = bytes;
    let count = r
        .read_u32::<LittleEndian>()
        .map_err(|_| SstError::Corrupt("block index truncated".to_string()))?;

    let mut blocks = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let klen = r
            .read_u32::<LittleEndian>()
            .map_err(|_| SstError::Corrupt("block index truncated".to_string()))?
            as usize;
        if klen > r.len() {
            return Err(SstError::Corrupt("block index key overruns".to_string()));
        }
        let mut first_key = vec![0u8; klen];
        r.read_exact(&mut first_key)
            .map_err(|_| SstError::Corrupt("block index truncated".to_string()))?;
        let offset = r
            .read_u64::<LittleEndian>()
            .map_err(|_| SstError::Corrupt("block index truncated".to_string()))?;
        let len = r
            .read_u64::<LittleEndian>()
            .map_err(|_| SstError::Corrupt("block index truncated".to_string()))?;
        blocks.push(BlockMeta {
            first_key,
            offset,
            len,
        });
    }
    Ok(blocks)
}
