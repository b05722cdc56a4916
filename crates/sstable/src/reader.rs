use bloom::BloomFilter;
use byteorder::{LittleEndian, ReadBytesExt};
use cache::{BlockCache, BlockKey};
use crc32fast::Hasher as Crc32;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::format::{read_block_index, BlockMeta, Footer};
use crate::SstError;

/// Maximum key size we'll allocate during reads (64 KiB). Prevents OOM on corrupt files.
const MAX_KEY_BYTES: usize = 64 * 1024;

/// Reads an immutable table file.
///
/// On [`open`](TableReader::open) the footer, block index, and bloom filter
/// are loaded into memory. A persistent file handle is kept for the lifetime
/// of the reader, wrapped in a `Mutex` so that `get` can be called through a
/// shared `&self` reference. Block payloads go through the shared
/// [`BlockCache`], keyed by `(table id, offset, length)`; cached payloads are
/// stored post-verification, so a cache hit skips the CRC check.
pub struct TableReader {
    id: Uuid,
    #[allow(dead_code)]
    path: PathBuf,
    file: Mutex<File>,
    index: Vec<BlockMeta>,
    bloom: BloomFilter,
    cache: Arc<BlockCache>,
    size_bytes: u64,
}

impl TableReader {
    /// Opens a table file, loading its footer, block index, and bloom filter.
    ///
    /// # Errors
    ///
    /// Returns [`SstError::Corrupt`] if the footer is too short, its offsets
    /// fall outside the file, or the index/bloom sections fail to decode.
    pub fn open<P: AsRef<Path>>(
        path: P,
        id: Uuid,
        cache: Arc<BlockCache>,
    ) -> Result<Self, SstError> {
        let path_buf = path.as_ref().to_path_buf();
        let mut f = File::open(&path_buf)?;

        let (footer, filesize) = Footer::read_from(&mut f)?;

        f.seek(SeekFrom::Start(footer.index_off))?;
        let mut index_buf = vec![0u8; footer.index_len as usize];
        f.read_exact(&mut index_buf)?;
        let index = read_block_index(&index_buf)?;

        for meta in &index {
            let end = meta.offset.checked_add(meta.len);
            if meta.len < 4 || end.is_none() || end.unwrap() > footer.index_off {
                return Err(SstError::Corrupt(format!(
                    "block entry out of range: offset {} len {}",
                    meta.offset, meta.len
                )));
            }
        }

        f.seek(SeekFrom::Start(footer.bloom_off))?;
        let mut bloom_section = f.by_ref().take(footer.bloom_len);
        let bloom = BloomFilter::read_from(&mut bloom_section)
            .map_err(|e| SstError::Corrupt(format!("bloom section: {}", e)))?;

        Ok(Self {
            id,
            path: path_buf,
            file: Mutex::new(f),
            index,
            bloom,
            cache,
            size_bytes: filesize,
        })
    }

    /// Point lookup for a single raw key.
    ///
    /// The bloom filter is consulted first: a negative answer skips all disk
    /// I/O. Otherwise the block index is binary-searched for the greatest
    /// block whose first key ≤ `key`, the block is fetched (through the
    /// cache) and CRC-verified, and its entries are scanned linearly —
    /// stopping early once a key greater than the target is seen.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SstError> {
        if !self.bloom.may_contain(key) {
            return Ok(None);
        }

        // Greatest block with first_key <= key.
        let idx = self.index.partition_point(|m| m.first_key.as_slice() <= key);
        if idx == 0 {
            return Ok(None);
        }
        let meta = &self.index[idx - 1];

        let block = self.fetch_block(meta)?;
        let mut r: &[u8] = &block;
        while !r.is_empty() {
            let (entry_key, value) = read_entry(&mut r)?;
            match entry_key.as_slice().cmp(key) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => return Ok(Some(value)),
                std::cmp::Ordering::Greater => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Iterates every `(key, value)` pair in key order, validating each
    /// block's CRC as it is visited.
    #[must_use]
    pub fn scan(&self) -> TableScan<'_> {
        TableScan {
            reader: self,
            next_block: 0,
            entries: Vec::new().into_iter(),
            failed: false,
        }
    }

    /// Returns the smallest and largest keys in the table.
    ///
    /// The lower bound comes from the block index; the upper bound requires
    /// reading the final block.
    pub fn key_range(&self) -> Result<(Vec<u8>, Vec<u8>), SstError> {
        let first = self.index[0].first_key.clone();
        let last_meta = &self.index[self.index.len() - 1];
        let block = self.fetch_block(last_meta)?;

        let mut r: &[u8] = &block;
        let mut last = last_meta.first_key.clone();
        while !r.is_empty() {
            let (key, _) = read_entry(&mut r)?;
            last = key;
        }
        Ok((first, last))
    }

    /// Table id used in the manifest and the block cache key.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Total file size in bytes, as used for compaction leveling.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Number of data blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    /// Fetches a block payload through the cache, verifying the CRC trailer
    /// on a miss.
    fn fetch_block(&self, meta: &BlockMeta) -> Result<Arc<Vec<u8>>, SstError> {
        let cache_key = BlockKey {
            table: self.id,
            offset: meta.offset,
            len: meta.len,
        };
        if let Some(block) = self.cache.get(&cache_key) {
            return Ok(block);
        }

        let mut raw = vec![0u8; meta.len as usize];
        {
            let mut f = self.file.lock().map_err(|_| {
                SstError::Io(std::io::Error::other("table file lock poisoned"))
            })?;
            f.seek(SeekFrom::Start(meta.offset))?;
            f.read_exact(&mut raw)?;
        }

        let payload_len = raw.len() - 4;
        let stored_crc = u32::from_le_bytes(raw[payload_len..].try_into().expect("crc trailer"));
        let mut hasher = Crc32::new();
        hasher.update(&raw[..payload_len]);
        let actual_crc = hasher.finalize();
        if actual_crc != stored_crc {
            return Err(SstError::Corrupt(format!(
                "block crc mismatch at offset {}: expected {:#010x}, got {:#010x}",
                meta.offset, stored_crc, actual_crc
            )));
        }

        raw.truncate(payload_len);
        let block = Arc::new(raw);
        self.cache.insert(cache_key, block.clone());
        Ok(block)
    }
}

impl std::fmt::Debug for TableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableReader")
            .field("id", &self.id)
            .field("blocks", &self.index.len())
            .field("size_bytes", &self.size_bytes)
            .finish()
    }
}

/// Reads one `klen | key | vlen | value` entry, advancing the slice.
fn read_entry(r: &mut &[u8]) -> Result<(Vec<u8>, Vec<u8>), SstError> {
    let klen = r
        .read_u32::<LittleEndian>()
        .map_err(|_| SstError::Corrupt("entry overruns block".to_string()))? as usize;
    if klen > MAX_KEY_BYTES || klen > r.len() {
        return Err(SstError::Corrupt("entry key overruns block".to_string()));
    }
    let mut key = vec![0u8; klen];
    r.read_exact(&mut key)
        .map_err(|_| SstError::Corrupt("entry overruns block".to_string()))?;

    let vlen = r
        .read_u32::<LittleEndian>()
        .map_err(|_| SstError::Corrupt("entry overruns block".to_string()))? as usize;
    if vlen > r.len() {
        return Err(SstError::Corrupt("entry value overruns block".to_string()));
    }
    let mut value = vec![0u8; vlen];
    r.read_exact(&mut value)
        .map_err(|_| SstError::Corrupt("entry overruns block".to_string()))?;

    Ok((key, value))
}

/// Lazy full-table scan yielding `(key, value)` pairs block by block.
///
/// A corrupt block yields one `Err` and then ends the iteration.
pub struct TableScan<'a> {
    reader: &'a TableReader,
    next_block: usize,
    entries: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
    failed: bool,
}

impl Iterator for TableScan<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>), SstError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(pair) = self.entries.next() {
                return Some(Ok(pair));
            }
            if self.next_block >= self.reader.index.len() {
                return None;
            }

            let meta = &self.reader.index[self.next_block];
            self.next_block += 1;

            let block = match self.reader.fetch_block(meta) {
                Ok(b) => b,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            };

            let mut r: &[u8] = &block;
            let mut parsed = Vec::new();
            while !r.is_empty() {
                match read_entry(&mut r) {
                    Ok(pair) => parsed.push(pair),
                    Err(e) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                }
            }
            self.entries = parsed.into_iter();
        }
    }
}

#[cfg(test)]
#[path = "tests/reader_tests.rs"]
mod tests;
