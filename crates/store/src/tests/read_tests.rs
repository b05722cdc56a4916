use super::helpers::*;
use anyhow::Result;
use tempfile::tempdir;

// --------------------- Scans ---------------------

#[test]
fn scan_orders_by_encoded_id() -> Result<()> {
    let dir = tempdir()?;
    let store = open(dir.path());
    let users = store.collection::<User>("users");

    for id in ["u3", "u1", "u2"] {
        users.put(&user(id, "a@example.com", &[]))?;
    }

    let all = users.scan(None, None, None)?;
    let ids: Vec<&str> = all.iter().map(|u| u.id.as_str()).collect();
    assert_eq!(ids, vec!["u1", "u2", "u3"]);
    Ok(())
}

#[test]
fn scan_filters_by_encoded_id_prefix() -> Result<()> {
    let dir = tempdir()?;
    let store = open(dir.path());
    let users = store.collection::<User>("users");

    for id in ["a1", "a2", "b1"] {
        users.put(&user(id, "a@example.com", &[]))?;
    }

    // String ids encode as JSON strings, so the prefix includes the opening
    // quote.
    let hits = users.scan(Some(b"\"a"), None, None)?;
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|u| u.id.starts_with('a')));
    Ok(())
}

#[test]
fn scan_respects_explicit_and_default_limits() -> Result<()> {
    let dir = tempdir()?;
    let mut options = opts(dir.path());
    options.default_scan_limit = 2;
    let store = crate::Store::open(options)?;
    let users = store.collection::<User>("users");

    for i in 0..5 {
        users.put(&user(&format!("u{}", i), "a@example.com", &[]))?;
    }

    assert_eq!(users.scan(None, None, None)?.len(), 2, "default limit");
    assert_eq!(users.scan(None, Some(4), None)?.len(), 4, "explicit limit");
    Ok(())
}

#[test]
fn scan_skips_tombstones() -> Result<()> {
    let dir = tempdir()?;
    let store = open(dir.path());
    let users = store.collection::<User>("users");

    users.put(&user("u1", "a@example.com", &[]))?;
    users.put(&user("u2", "b@example.com", &[]))?;
    users.delete(&"u1".to_string())?;

    let all = users.scan(None, None, None)?;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, "u2");
    Ok(())
}

// --------------------- History & snapshots ---------------------

#[test]
fn history_records_versions_and_tombstones() -> Result<()> {
    let dir = tempdir()?;
    let store = open(dir.path());
    let users = store.collection::<User>("users");

    users.put(&user("u1", "v1@example.com", &[]))?;
    users.put(&user("u1", "v2@example.com", &[]))?;
    users.delete(&"u1".to_string())?;

    let history = users.history(&"u1".to_string(), None)?;
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].1.as_ref().unwrap().email, "v1@example.com");
    assert_eq!(history[1].1.as_ref().unwrap().email, "v2@example.com");
    assert!(history[2].1.is_none(), "delete appends a tombstone version");

    // Sequences strictly increase within one key.
    assert!(history[0].0 < history[1].0 && history[1].0 < history[2].0);
    Ok(())
}

#[test]
fn history_truncates_to_snapshot() -> Result<()> {
    let dir = tempdir()?;
    let store = open(dir.path());
    let users = store.collection::<User>("users");

    users.put(&user("u1", "v1@example.com", &[]))?;
    let snap = store.snapshot();
    users.put(&user("u1", "v2@example.com", &[]))?;

    let history = users.history(&"u1".to_string(), Some(&snap))?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].1.as_ref().unwrap().email, "v1@example.com");
    Ok(())
}

#[test]
fn get_at_reads_past_versions() -> Result<()> {
    let dir = tempdir()?;
    let store = open(dir.path());
    let users = store.collection::<User>("users");

    users.put(&user("u1", "v1@example.com", &[]))?;
    let s1 = store.snapshot();
    users.put(&user("u1", "v2@example.com", &[]))?;
    users.delete(&"u1".to_string())?;

    assert_eq!(
        users.get_at(&"u1".to_string(), Some(&s1))?.unwrap().email,
        "v1@example.com"
    );
    assert!(users.get(&"u1".to_string())?.is_none(), "latest state is deleted");
    Ok(())
}

#[test]
fn snapshot_taken_before_creation_sees_nothing() -> Result<()> {
    let dir = tempdir()?;
    let store = open(dir.path());
    let users = store.collection::<User>("users");

    let snap = store.snapshot();
    users.put(&user("u1", "a@example.com", &[]))?;

    assert!(users.get_at(&"u1".to_string(), Some(&snap))?.is_none());
    assert!(users.get(&"u1".to_string())?.is_some());
    Ok(())
}
