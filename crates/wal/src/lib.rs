//! # WAL — Write-Ahead Log
//!
//! Provides crash-safe durability for the tidepool storage engine.
//!
//! Every mutation is appended to the WAL **before** the corresponding
//! in-memory update. On restart the WAL is replayed to reconstruct pending
//! state, guaranteeing that no acknowledged write is lost.
//!
//! ## Binary Frame Format
//!
//! ```text
//! [seq: u64 BE][len: u32 BE][payload: len bytes][crc32: u32 BE]
//! ```
//!
//! The CRC-32 (polynomial 0xEDB88320) covers the payload bytes only. Frames
//! are sequential and self-delimiting. BEGIN and COMMIT frames carry the
//! reserved sequence zero.
//!
//! ## Payloads
//!
//! Two JSON payload shapes share the same frame:
//!
//! - **Legacy op**: `{"key": ..., "value"?: ...}` — a committed single
//!   operation. An absent `value` is a tombstone.
//! - **Transactional frame**: `{"type": "begin"|"op"|"commit", "txid": ...,
//!   "key"?: ..., "value"??: ...}` — `value` is double-optional so that "no
//!   value field" and "explicit null ⇒ tombstone" stay distinguishable.
//!
//! ## Segments
//!
//! With a nonzero `rotate_bytes`, an append that would grow the active file
//! beyond the threshold first rotates it: the active file is renamed to
//! `<stem>.NNNNNN.log` with a strictly increasing index and a fresh active
//! file is opened. Replay reads rotated segments in filename order, then the
//! active file. `gc(manifest_seq)` unlinks segments fully covered by the
//! manifest; the active file is never unlinked.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Safety cap on a single payload (64 MiB). Larger length fields are treated
/// as corruption.
const MAX_PAYLOAD_BYTES: u32 = 64 * 1024 * 1024;

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A frame failed CRC or length validation outside a file tail.
    #[error("corrupt wal frame")]
    Corrupt,
}

/// A decoded WAL payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// Legacy single operation, treated as committed. `value: None` is a
    /// tombstone.
    Op {
        key: Vec<u8>,
        value: Option<Vec<u8>>,
    },
    /// Opens a transaction.
    Begin { txid: Uuid },
    /// One operation inside a transaction. `value: None` is a tombstone.
    TxOp {
        txid: Uuid,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
    },
    /// Commits a transaction; everything buffered since its BEGIN applies.
    Commit { txid: Uuid },
}

/// A replayed frame: the sequence from the frame header plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalFrame {
    pub seq: u64,
    pub record: WalRecord,
}

/// On-the-wire JSON shape shared by both payload kinds.
#[derive(Serialize, Deserialize)]
struct RawPayload {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    txid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<Vec<u8>>,
    /// Outer None = field absent, Some(None) = explicit null (tombstone).
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    value: Option<Option<Vec<u8>>>,
}

fn double_option<'de, D>(de: D) -> Result<Option<Option<Vec<u8>>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Vec<u8>>::deserialize(de).map(Some)
}

impl WalRecord {
    fn to_payload(&self) -> Vec<u8> {
        let raw = match self {
            WalRecord::Op { key, value } => RawPayload {
                kind: None,
                txid: None,
                key: Some(key.clone()),
                value: value.clone().map(Some),
            },
            WalRecord::Begin { txid } => RawPayload {
                kind: Some("begin".to_string()),
                txid: Some(*txid),
                key: None,
                value: None,
            },
            WalRecord::TxOp { txid, key, value } => RawPayload {
                kind: Some("op".to_string()),
                txid: Some(*txid),
                key: Some(key.clone()),
                value: Some(value.clone()),
            },
            WalRecord::Commit { txid } => RawPayload {
                kind: Some("commit".to_string()),
                txid: Some(*txid),
                key: None,
                value: None,
            },
        };
        // RawPayload has no map keys or non-string types that can fail.
        serde_json::to_vec(&raw).expect("wal payload serialization cannot fail")
    }

    fn from_payload(bytes: &[u8]) -> Option<WalRecord> {
        let raw: RawPayload = serde_json::from_slice(bytes).ok()?;
        match raw.kind.as_deref() {
            None => Some(WalRecord::Op {
                key: raw.key?,
                value: raw.value.flatten(),
            }),
            Some("begin") => Some(WalRecord::Begin { txid: raw.txid? }),
            Some("op") => Some(WalRecord::TxOp {
                txid: raw.txid?,
                key: raw.key?,
                value: raw.value?,
            }),
            Some("commit") => Some(WalRecord::Commit { txid: raw.txid? }),
            Some(_) => None,
        }
    }
}

/// Append-only WAL writer with size-based segment rotation.
///
/// Frames are serialized into a reusable scratch buffer and written to the
/// active file in a single `write_all` call. Durability is the caller's
/// responsibility: invoke [`sync`](WalWriter::sync) after a committed batch.
pub struct WalWriter {
    active_path: PathBuf,
    file: File,
    active_len: u64,
    /// Rotation threshold in bytes; 0 disables rotation.
    rotate_bytes: u64,
    next_segment_index: u64,
    /// Reusable scratch buffer to avoid allocation on every append.
    buf: Vec<u8>,
}

impl WalWriter {
    /// Opens (or creates) the active WAL file in append mode.
    ///
    /// Existing rotated segments next to `path` are scanned to seed the next
    /// rotation index.
    pub fn open<P: AsRef<Path>>(path: P, rotate_bytes: u64) -> Result<Self, WalError> {
        let active_path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active_path)?;
        let active_len = file.metadata()?.len();

        let next_segment_index = segment_paths(&active_path)?
            .last()
            .and_then(|p| segment_index(&active_path, p))
            .map_or(1, |i| i + 1);

        Ok(Self {
            active_path,
            file,
            active_len,
            rotate_bytes,
            next_segment_index,
            buf: Vec::with_capacity(256),
        })
    }

    /// Serializes `record` under `seq` and appends the frame to the active
    /// file, rotating first if the frame would push the file past the
    /// configured threshold.
    pub fn append(&mut self, seq: u64, record: &WalRecord) -> Result<(), WalError> {
        let payload = record.to_payload();
        if payload.len() as u64 > MAX_PAYLOAD_BYTES as u64 {
            return Err(WalError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "WAL payload too large",
            )));
        }

        let frame_len = 8 + 4 + payload.len() as u64 + 4;
        if self.rotate_bytes > 0
            && self.active_len > 0
            && self.active_len + frame_len > self.rotate_bytes
        {
            self.rotate()?;
        }

        self.buf.clear();
        self.buf.write_u64::<BigEndian>(seq)?;
        self.buf.write_u32::<BigEndian>(payload.len() as u32)?;
        self.buf.extend_from_slice(&payload);

        let mut hasher = Crc32::new();
        hasher.update(&payload);
        self.buf.write_u32::<BigEndian>(hasher.finalize())?;

        // Single write call for the entire frame.
        self.file.write_all(&self.buf)?;
        self.active_len += frame_len;

        Ok(())
    }

    /// Forces all appended frames to durable storage via `fsync`.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Closes the active file, renames it to the next rotated segment, and
    /// opens a fresh active file.
    fn rotate(&mut self) -> Result<(), WalError> {
        self.file.flush()?;
        self.file.sync_all()?;

        let segment = rotated_name(&self.active_path, self.next_segment_index);
        fs::rename(&self.active_path, &segment)?;
        tracing::debug!(segment = %segment.display(), "rotated wal segment");
        self.next_segment_index += 1;

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.active_path)?;
        self.active_len = 0;
        Ok(())
    }

    /// Unlinks rotated segments whose highest sequence is already covered by
    /// the manifest. The active file is never unlinked.
    ///
    /// Returns the number of segments removed.
    pub fn gc(&self, manifest_seq: u64) -> Result<usize, WalError> {
        let mut removed = 0;
        for segment in segment_paths(&self.active_path)? {
            let max_seq = replay_file(&segment)?
                .iter()
                .map(|f| f.seq)
                .max()
                .unwrap_or(0);
            if max_seq <= manifest_seq {
                fs::remove_file(&segment)?;
                tracing::debug!(segment = %segment.display(), max_seq, "wal gc unlinked segment");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Returns the path of the active WAL file.
    #[must_use]
    pub fn active_path(&self) -> &Path {
        &self.active_path
    }
}

/// Replays the WAL at `path`: rotated segments in filename order, then the
/// active file.
///
/// Each file is read until its end or until the first frame whose length or
/// CRC fails validation; such tails are expected after a crash and are
/// dropped silently. A missing active file yields an empty replay.
pub fn replay<P: AsRef<Path>>(path: P) -> Result<Vec<WalFrame>, WalError> {
    let active = path.as_ref();
    let mut frames = Vec::new();

    for segment in segment_paths(active)? {
        frames.extend(replay_file(&segment)?);
    }
    if active.exists() {
        frames.extend(replay_file(active)?);
    }
    Ok(frames)
}

/// Reads every valid frame from a single WAL file, stopping at the first
/// invalid or truncated frame.
fn replay_file(path: &Path) -> Result<Vec<WalFrame>, WalError> {
    let file = File::open(path)?;
    let mut rdr = BufReader::new(file);
    let mut frames = Vec::new();
    let mut payload = Vec::with_capacity(256);

    loop {
        let seq = match rdr.read_u64::<BigEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(WalError::Io(e)),
        };

        let len = match rdr.read_u32::<BigEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(WalError::Io(e)),
        };
        if len > MAX_PAYLOAD_BYTES {
            tracing::warn!(path = %path.display(), len, "wal frame length invalid, truncating");
            break;
        }

        payload.clear();
        payload.resize(len as usize, 0);
        match rdr.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(WalError::Io(e)),
        }

        let crc = match rdr.read_u32::<BigEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(WalError::Io(e)),
        };

        let mut hasher = Crc32::new();
        hasher.update(&payload);
        if hasher.finalize() != crc {
            tracing::warn!(path = %path.display(), seq, "wal frame crc mismatch, truncating");
            break;
        }

        match WalRecord::from_payload(&payload) {
            Some(record) => frames.push(WalFrame { seq, record }),
            None => {
                tracing::warn!(path = %path.display(), seq, "wal payload undecodable, truncating");
                break;
            }
        }
    }

    Ok(frames)
}

/// Lists rotated segments next to the active file, sorted by filename.
///
/// Zero-padded indices make the filename order the numeric order.
pub fn segment_paths(active: &Path) -> Result<Vec<PathBuf>, WalError> {
    let dir = active.parent().unwrap_or_else(|| Path::new("."));
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut segments: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| segment_index(active, p).is_some())
        .collect();
    segments.sort();
    Ok(segments)
}

/// Builds the rotated-segment filename for `index`: `<stem>.NNNNNN.log`.
fn rotated_name(active: &Path, index: u64) -> PathBuf {
    let stem = active
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("wal");
    active.with_file_name(format!("{}.{:06}.log", stem, index))
}

/// Parses the rotation index out of a candidate segment path, or `None` if
/// the path is not a rotated segment of `active`.
fn segment_index(active: &Path, candidate: &Path) -> Option<u64> {
    let stem = active.file_stem()?.to_str()?;
    let name = candidate.file_name()?.to_str()?;
    let middle = name
        .strip_prefix(stem)?
        .strip_prefix('.')?
        .strip_suffix(".log")?;
    if middle.len() == 6 && middle.bytes().all(|b| b.is_ascii_digit()) {
        middle.parse().ok()
    } else {
        None
    }
}
