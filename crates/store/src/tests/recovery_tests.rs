use super::helpers::*;
use crate::{keys, JsonDoc, Store, StoreError, WAL_FILENAME};
use anyhow::Result;
use serde_json::json;
use tempfile::tempdir;
use uuid::Uuid;
use wal::{WalRecord, WalWriter};

// --------------------- Restart recovery ---------------------

#[test]
fn wal_replay_restores_unflushed_writes() -> Result<()> {
    let dir = tempdir()?;
    {
        let store = open(dir.path());
        let users = store.collection::<User>("users");
        users.put(&user("u1", "a@example.com", &[]))?;
        users.put(&user("u2", "b@example.com", &[]))?;
        users.delete(&"u1".to_string())?;
        // No flush: everything lives in the WAL and memtable.
    }

    let store = open(dir.path());
    let users = store.collection::<User>("users");
    assert!(users.get(&"u1".to_string())?.is_none(), "delete replayed");
    assert_eq!(users.get(&"u2".to_string())?.unwrap().email, "b@example.com");
    assert_eq!(store.sequence(), 3);
    Ok(())
}

#[test]
fn flushed_data_survives_restart() -> Result<()> {
    let dir = tempdir()?;
    {
        let store = open(dir.path());
        let users = store.collection::<User>("users");
        users.put(&user("u1", "a@example.com", &[]))?;
        store.flush()?;
    }
    assert!(count_sst_files(dir.path()) >= 1);

    let store = open(dir.path());
    let users = store.collection::<User>("users");
    assert_eq!(users.get(&"u1".to_string())?.unwrap().email, "a@example.com");
    Ok(())
}

#[test]
fn recovery_combines_tables_and_wal() -> Result<()> {
    let dir = tempdir()?;
    {
        let store = open(dir.path());
        let users = store.collection::<User>("users");
        users.put(&user("flushed", "sst@example.com", &[]))?;
        store.flush()?;
        users.put(&user("pending", "wal@example.com", &[]))?;
    }

    let store = open(dir.path());
    let users = store.collection::<User>("users");
    assert!(users.get(&"flushed".to_string())?.is_some());
    assert!(users.get(&"pending".to_string())?.is_some());
    Ok(())
}

#[test]
fn sequence_continues_after_restart() -> Result<()> {
    let dir = tempdir()?;
    {
        let store = open(dir.path());
        let users = store.collection::<User>("users");
        for i in 0..5 {
            users.put(&user(&format!("u{}", i), "a@example.com", &[]))?;
        }
        store.flush()?;
    }

    let store = open(dir.path());
    assert!(store.sequence() >= 5);
    let users = store.collection::<User>("users");
    let seq = users.put(&user("u9", "a@example.com", &[]))?;
    assert!(seq > 5, "new writes allocate past recovered sequence");
    Ok(())
}

// --------------------- Transactional replay ---------------------

fn doc_bytes(id: i64, value: &str) -> Vec<u8> {
    serde_json::to_vec(&JsonDoc {
        id: json!(id),
        value: json!(value),
    })
    .unwrap()
}

#[test]
fn uncommitted_wal_transaction_is_invisible() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("db");
    std::fs::create_dir_all(&path)?;

    // BEGIN + OP, synced, but no COMMIT — as a crash mid-batch leaves it.
    {
        let mut w = WalWriter::open(path.join(WAL_FILENAME), 0)?;
        let txid = Uuid::new_v4();
        w.append(0, &WalRecord::Begin { txid })?;
        w.append(
            1,
            &WalRecord::TxOp {
                txid,
                key: keys::encode_base("docs", b"1"),
                value: Some(doc_bytes(1, "v1")),
            },
        )?;
        w.sync()?;
    }

    let store = open(&path);
    let docs = store.documents("docs");
    assert!(docs.get(&json!(1), None)?.is_none());
    Ok(())
}

#[test]
fn committed_wal_transaction_applies_on_replay() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("db");
    std::fs::create_dir_all(&path)?;

    {
        let mut w = WalWriter::open(path.join(WAL_FILENAME), 0)?;
        let txid = Uuid::new_v4();
        w.append(0, &WalRecord::Begin { txid })?;
        w.append(
            1,
            &WalRecord::TxOp {
                txid,
                key: keys::encode_base("docs", b"1"),
                value: Some(doc_bytes(1, "v1")),
            },
        )?;
        w.append(0, &WalRecord::Commit { txid })?;
        w.sync()?;
    }

    let store = open(&path);
    let docs = store.documents("docs");
    assert_eq!(docs.get(&json!(1), None)?, Some(json!("v1")));
    Ok(())
}

// --------------------- Corruption ---------------------

#[test]
fn corrupt_manifest_is_fatal() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("MANIFEST.json"), b"{oops").unwrap();

    let err = Store::open(opts(dir.path())).unwrap_err();
    assert!(matches!(err, StoreError::Corrupt(_)), "got {:?}", err);
}

#[test]
fn corrupt_table_block_fails_open() -> Result<()> {
    let dir = tempdir()?;
    {
        let store = open(dir.path());
        let users = store.collection::<User>("users");
        users.put(&user("u1", "a@example.com", &[]))?;
        store.flush()?;
    }

    // Flip a byte in the first data block of the only table.
    let sst = std::fs::read_dir(dir.path())?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.extension().is_some_and(|x| x == "sst"))
        .expect("one table");
    let mut bytes = std::fs::read(&sst)?;
    bytes[8] ^= 0xFF;
    std::fs::write(&sst, &bytes)?;

    let err = Store::open(opts(dir.path())).unwrap_err();
    assert!(matches!(err, StoreError::Corrupt(_)), "got {:?}", err);
    Ok(())
}

#[test]
fn truncated_wal_tail_is_healed_silently() -> Result<()> {
    let dir = tempdir()?;
    {
        let store = open(dir.path());
        let users = store.collection::<User>("users");
        users.put(&user("u1", "a@example.com", &[]))?;
        users.put(&user("u2", "b@example.com", &[]))?;
    }

    // Chop bytes off the WAL tail, as a crash mid-append would.
    let wal_path = dir.path().join(WAL_FILENAME);
    let bytes = std::fs::read(&wal_path)?;
    std::fs::write(&wal_path, &bytes[..bytes.len() - 5])?;

    let store = open(dir.path());
    let users = store.collection::<User>("users");
    assert!(users.get(&"u1".to_string())?.is_some(), "intact frame survives");
    assert!(users.get(&"u2".to_string())?.is_none(), "torn frame dropped");
    Ok(())
}

// --------------------- WAL segments ---------------------

#[test]
fn rotated_wal_segments_recover_all_writes() -> Result<()> {
    let dir = tempdir()?;
    {
        let mut options = opts(dir.path());
        options.wal_segment_bytes = 1024;
        options.memtable_limit = 10_000; // keep everything in the WAL
        let store = Store::open(options)?;
        let users = store.collection::<User>("users");
        for i in 0..200 {
            users.put(&user(&format!("u{:03}", i), "a@example.com", &[]))?;
        }
    }

    assert!(
        wal::segment_paths(&dir.path().join(WAL_FILENAME))?.len() > 1,
        "1 KiB segments must have rotated"
    );

    let mut options = opts(dir.path());
    options.wal_segment_bytes = 1024;
    let store = Store::open(options)?;
    let users = store.collection::<User>("users");
    for i in [0usize, 50, 199] {
        assert!(
            users.get(&format!("u{:03}", i))?.is_some(),
            "u{:03} lost across rotation",
            i
        );
    }
    Ok(())
}
