//! # CLI — tidepool Interactive Shell
//!
//! A REPL-style command-line interface over a tidepool store. Reads commands
//! from stdin, executes them against the untyped document collections, and
//! prints results to stdout. Designed for both interactive use and scripted
//! testing (pipe commands via stdin).
//!
//! ## Commands
//!
//! ```text
//! PUT coll id json      Insert or update a document (id parsed as JSON,
//!                       bare words become strings)
//! GET coll id           Look up a document (prints value or "(nil)")
//! DEL coll id           Delete a document (writes a tombstone)
//! SCAN coll [prefix]    List documents, optionally by encoded-id prefix
//! HISTORY coll id       Print the visible version history of a document
//! FLUSH                 Force flush memtable to a new table
//! COMPACT               Run one compaction tick
//! STATUS                Print compaction status and metrics
//! BACKUP [note]         Create a backup bundle
//! BACKUPS               List backup bundles
//! RESTORE id            Restore a backup by uuid
//! EXIT / QUIT           Shut down gracefully
//! ```
//!
//! ## Configuration
//!
//! All settings are controlled via environment variables:
//!
//! ```text
//! TIDEPOOL_PATH        Store directory               (default: "data")
//! TIDEPOOL_CACHE_KB    Block cache capacity in KiB   (default: 65536)
//! TIDEPOOL_WAL_SEG_KB  WAL segment size in KiB       (default: 4096, 0 = off)
//! TIDEPOOL_SCAN_LIMIT  Default scan limit            (default: 100)
//! ```

use anyhow::Result;
use serde_json::Value;
use std::io::{self, BufRead, Write};
use store::{Store, StoreOptions};

/// Reads a configuration value from the environment, falling back to `default`.
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parses an id argument: valid JSON is taken as-is, anything else becomes a
/// JSON string, so `GET users alice` and `GET users "alice"` agree.
fn parse_id(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(io::stderr)
        .init();

    let path = env_or("TIDEPOOL_PATH", "data");
    let cache_kb: usize = env_or("TIDEPOOL_CACHE_KB", "65536").parse().unwrap_or(65536);
    let wal_seg_kb: u64 = env_or("TIDEPOOL_WAL_SEG_KB", "4096").parse().unwrap_or(4096);
    let scan_limit: usize = env_or("TIDEPOOL_SCAN_LIMIT", "100").parse().unwrap_or(100);

    let mut options = StoreOptions::new(&path);
    options.cache_bytes = cache_kb * 1024;
    options.wal_segment_bytes = wal_seg_kb * 1024;
    options.default_scan_limit = scan_limit;
    let store = Store::open(options)?;

    println!(
        "tidepool started (seq={}, path={}, cache={}KiB, wal_seg={}KiB)",
        store.sequence(),
        path,
        cache_kb,
        wal_seg_kb
    );

    let stdin = io::stdin();
    let mut out = io::stdout();
    for line in stdin.lock().lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match run_command(&store, trimmed) {
            Ok(Reply::Text(text)) => println!("{}", text),
            Ok(Reply::Exit) => {
                println!("bye");
                break;
            }
            Err(e) => println!("(error) {}", e),
        }
        out.flush()?;
    }
    Ok(())
}

enum Reply {
    Text(String),
    Exit,
}

fn run_command(store: &Store, line: &str) -> Result<Reply> {
    let mut parts = line.splitn(4, char::is_whitespace);
    let cmd = parts.next().unwrap_or("").to_ascii_uppercase();

    let reply = match cmd.as_str() {
        "PUT" => {
            let coll = parts.next().ok_or_else(|| anyhow::anyhow!("usage: PUT coll id json"))?;
            let id = parts.next().ok_or_else(|| anyhow::anyhow!("usage: PUT coll id json"))?;
            let body = parts.next().ok_or_else(|| anyhow::anyhow!("usage: PUT coll id json"))?;
            let value: Value = serde_json::from_str(body)?;
            let seq = store.documents(coll).put(parse_id(id), value)?;
            Reply::Text(format!("OK seq={}", seq))
        }
        "GET" => {
            let coll = parts.next().ok_or_else(|| anyhow::anyhow!("usage: GET coll id"))?;
            let id = parts.next().ok_or_else(|| anyhow::anyhow!("usage: GET coll id"))?;
            match store.documents(coll).get(&parse_id(id), None)? {
                Some(value) => Reply::Text(value.to_string()),
                None => Reply::Text("(nil)".to_string()),
            }
        }
        "DEL" => {
            let coll = parts.next().ok_or_else(|| anyhow::anyhow!("usage: DEL coll id"))?;
            let id = parts.next().ok_or_else(|| anyhow::anyhow!("usage: DEL coll id"))?;
            let seq = store.documents(coll).delete(&parse_id(id))?;
            Reply::Text(format!("OK seq={}", seq))
        }
        "SCAN" => {
            let coll = parts.next().ok_or_else(|| anyhow::anyhow!("usage: SCAN coll [prefix]"))?;
            let prefix = parts.next().map(str::as_bytes);
            let rows = store.documents(coll).scan(prefix, None, None)?;
            let mut lines: Vec<String> = rows
                .iter()
                .map(|(id, value)| format!("{} -> {}", id, value))
                .collect();
            lines.push(format!("({} documents)", rows.len()));
            Reply::Text(lines.join("\n"))
        }
        "HISTORY" => {
            let coll = parts.next().ok_or_else(|| anyhow::anyhow!("usage: HISTORY coll id"))?;
            let id = parts.next().ok_or_else(|| anyhow::anyhow!("usage: HISTORY coll id"))?;
            let versions = store.documents(coll).history(&parse_id(id), None)?;
            let mut lines: Vec<String> = versions
                .iter()
                .map(|(seq, value)| match value {
                    Some(v) => format!("seq={} {}", seq, v),
                    None => format!("seq={} (deleted)", seq),
                })
                .collect();
            lines.push(format!("({} versions)", versions.len()));
            Reply::Text(lines.join("\n"))
        }
        "FLUSH" => {
            store.flush()?;
            Reply::Text("OK".to_string())
        }
        "COMPACT" => {
            store.compact_now()?;
            Reply::Text("OK".to_string())
        }
        "STATUS" => {
            let status = store.compaction_status();
            let metrics = store.metrics();
            let mut lines = vec![format!(
                "seq={} debt_bytes={} pending_tables={} running={}",
                store.sequence(),
                status.debt_bytes,
                status.pending_tables,
                status.running
            )];
            for level in &status.levels {
                lines.push(format!(
                    "L{}: {} tables, {} bytes",
                    level.level, level.tables, level.size_bytes
                ));
            }
            lines.push(format!(
                "batches={} ops={} flushes={} compactions={} cache_hits={} cache_misses={}",
                metrics.batches,
                metrics.ops,
                metrics.flushes,
                metrics.compactions,
                metrics.cache.hits,
                metrics.cache.misses
            ));
            Reply::Text(lines.join("\n"))
        }
        "BACKUP" => {
            let note = parts.next();
            let backup = store.create_backup(note)?;
            Reply::Text(format!("OK {} ({} bytes)", backup.id, backup.size_bytes))
        }
        "BACKUPS" => {
            let backups = store.list_backups()?;
            let mut lines: Vec<String> = backups
                .iter()
                .map(|b| {
                    format!(
                        "{} {} {} bytes{}",
                        b.id,
                        b.created_at,
                        b.size_bytes,
                        b.note.as_deref().map(|n| format!(" ({})", n)).unwrap_or_default()
                    )
                })
                .collect();
            lines.push(format!("({} backups)", backups.len()));
            Reply::Text(lines.join("\n"))
        }
        "RESTORE" => {
            let id = parts.next().ok_or_else(|| anyhow::anyhow!("usage: RESTORE id"))?;
            store.restore_backup(id.parse()?)?;
            Reply::Text("OK".to_string())
        }
        "EXIT" | "QUIT" => Reply::Exit,
        other => Reply::Text(format!("(error) unknown command: {}", other)),
    };
    Ok(reply)
}
