use bloom::BloomFilter;
use byteorder::{LittleEndian, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::fs::{rename, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::format::{write_block_index, BlockMeta, Footer, BLOCK_PAYLOAD_LIMIT};
use crate::SstError;

/// Streams sorted entries into an immutable table file.
///
/// Entries **must** be supplied in ascending raw-key order; the writer only
/// asserts this in debug builds. An empty value is a tombstone and is stored
/// like any other value.
///
/// The file is written to `<path>.tmp`, fsynced, then atomically renamed into
/// place, so readers never observe a partial table.
pub struct TableWriter;

impl TableWriter {
    /// Writes a table at `path` from sorted `(key, value)` entries.
    ///
    /// `expected_count` sizes the bloom filter; it is a hint, not a limit.
    ///
    /// # Errors
    ///
    /// Returns [`SstError::Corrupt`] if `entries` is empty (a table with no
    /// blocks is never published) and [`SstError::Io`] on filesystem errors.
    pub fn write_sorted<I>(path: &Path, expected_count: usize, entries: I) -> Result<(), SstError>
    where
        I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    {
        let tmp_path = path.with_extension("sst.tmp");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut w = BufWriter::new(file);

        let mut bloom = BloomFilter::with_capacity(expected_count.max(1));
        let mut blocks: Vec<BlockMeta> = Vec::new();
        let mut block_buf: Vec<u8> = Vec::with_capacity(BLOCK_PAYLOAD_LIMIT);
        let mut block_first_key: Option<Vec<u8>> = None;
        let mut offset = 0u64;

        #[cfg(debug_assertions)]
        let mut prev_key: Option<Vec<u8>> = None;

        for (key, value) in entries {
            #[cfg(debug_assertions)]
            {
                if let Some(ref prev) = prev_key {
                    debug_assert!(prev <= &key, "entries must be sorted by key");
                }
                prev_key = Some(key.clone());
            }

            let entry_len = 4 + key.len() + 4 + value.len();

            // On overflow the current block flushes and a new one opens at
            // this entry.
            if !block_buf.is_empty() && block_buf.len() + entry_len > BLOCK_PAYLOAD_LIMIT {
                let first_key = block_first_key.take().expect("non-empty block has a first key");
                offset += flush_block(&mut w, &mut blocks, first_key, &block_buf, offset)?;
                block_buf.clear();
            }

            if block_buf.is_empty() {
                block_first_key = Some(key.clone());
            }

            block_buf.write_u32::<LittleEndian>(key.len() as u32)?;
            block_buf.extend_from_slice(&key);
            block_buf.write_u32::<LittleEndian>(value.len() as u32)?;
            block_buf.extend_from_slice(&value);

            bloom.insert(&key);
        }

        if let Some(first_key) = block_first_key.take() {
            offset += flush_block(&mut w, &mut blocks, first_key, &block_buf, offset)?;
        }

        if blocks.is_empty() {
            drop(w);
            let _ = std::fs::remove_file(&tmp_path);
            return Err(SstError::Corrupt(
                "refusing to write an empty table".to_string(),
            ));
        }

        let index_off = offset;
        let mut index_buf = Vec::new();
        write_block_index(&mut index_buf, &blocks)?;
        w.write_all(&index_buf)?;

        let bloom_off = index_off + index_buf.len() as u64;
        let mut bloom_buf = Vec::with_capacity(bloom.serialized_size());
        bloom.write_to(&mut bloom_buf)?;
        w.write_all(&bloom_buf)?;

        Footer {
            index_off,
            index_len: index_buf.len() as u64,
            bloom_off,
            bloom_len: bloom_buf.len() as u64,
        }
        .write_to(&mut w)?;

        w.flush()?;
        w.get_ref().sync_all()?;
        drop(w);

        rename(&tmp_path, path)?;
        Ok(())
    }
}

/// Writes one block payload plus its CRC trailer, records its metadata, and
/// returns the number of bytes written.
fn flush_block<W: Write>(
    w: &mut W,
    blocks: &mut Vec<BlockMeta>,
    first_key: Vec<u8>,
    payload: &[u8],
    offset: u64,
) -> Result<u64, SstError> {
    let mut hasher = Crc32::new();
    hasher.update(payload);

    w.write_all(payload)?;
    w.write_u32::<LittleEndian>(hasher.finalize())?;

    let len = payload.len() as u64 + 4;
    blocks.push(BlockMeta {
        first_key,
        offset,
        len,
    });
    Ok(len)
}

#[cfg(test)]
#[path = "tests/writer_tests.rs"]
mod tests;
