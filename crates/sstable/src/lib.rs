//! # SSTable — Immutable Sorted Runs
//!
//! On-disk file format and access paths for tidepool's sorted tables.
//!
//! ## File Layout
//!
//! ```text
//! [data block 0]...[data block n-1][block index][bloom][footer: 32 bytes]
//! ```
//!
//! Each data block holds up to 4 KiB of `klen(u32 LE) | key | vlen(u32 LE) |
//! value` entries followed by a 4-byte CRC-32 trailer. The block index lists
//! `block_count(u32 LE)` then, per block, `klen | first_key | offset(u64 LE) |
//! length(u64 LE)` where `length` includes the CRC trailer. The footer is
//! `index_off | index_len | bloom_off | bloom_len`, all `u64` little-endian.
//!
//! ## Access Paths
//!
//! - [`TableWriter::write_sorted`] streams sorted entries into blocks,
//!   feeding the bloom filter along the way, and publishes the file
//!   atomically (temp + rename).
//! - [`TableReader::get`] is the point-lookup path: bloom → block index
//!   binary search → cached block fetch with CRC verification → linear scan
//!   that short-circuits on the first key past the target.
//! - [`TableReader::scan`] walks every block in order, validating CRCs.
//!
//! Corruption is reported as [`SstError::Corrupt`], never silently skipped.

mod format;
mod reader;
mod writer;

use std::io;
use thiserror::Error;

pub use format::{Footer, BLOCK_PAYLOAD_LIMIT, FOOTER_BYTES};
pub use reader::{TableReader, TableScan};
pub use writer::TableWriter;

/// Errors that can occur while writing or reading an SSTable.
#[derive(Debug, Error)]
pub enum SstError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The file violates the format: bad footer, out-of-range offsets, a
    /// block CRC mismatch, or an entry that overruns its block.
    #[error("corrupt sstable: {0}")]
    Corrupt(String),
}
