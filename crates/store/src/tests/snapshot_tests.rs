use super::helpers::*;
use anyhow::Result;
use serde_json::json;
use tempfile::tempdir;

#[test]
fn snapshot_survives_restart_through_embedded_sequences() -> Result<()> {
    let dir = tempdir()?;

    let store = open(dir.path());
    let docs = store.documents("docs");
    docs.put(json!(1), json!("v1"))?;
    let s1 = store.snapshot();
    docs.put(json!(1), json!("v2"))?;
    let s2 = store.snapshot();
    store.flush()?;
    drop(docs);
    drop(store);

    // The handles carry plain sequences, which stay meaningful across the
    // restart because table keys embed them.
    let store = open(dir.path());
    let docs = store.documents("docs");
    assert_eq!(docs.get(&json!(1), Some(&s1))?, Some(json!("v1")));
    assert_eq!(docs.get(&json!(1), Some(&s2))?, Some(json!("v2")));
    assert_eq!(docs.get(&json!(1), None)?, Some(json!("v2")));
    Ok(())
}

#[test]
fn snapshot_is_stable_while_writes_continue() -> Result<()> {
    let dir = tempdir()?;
    let store = open(dir.path());
    let users = store.collection::<User>("users");

    users.put(&user("u1", "v1@example.com", &[]))?;
    let snap = store.snapshot();

    users.put(&user("u1", "v2@example.com", &[]))?;
    users.put(&user("u2", "x@example.com", &[]))?;
    users.delete(&"u1".to_string())?;

    assert_eq!(
        users.get_at(&"u1".to_string(), Some(&snap))?.unwrap().email,
        "v1@example.com"
    );
    assert!(users.get_at(&"u2".to_string(), Some(&snap))?.is_none());
    assert_eq!(users.scan(None, None, Some(&snap))?.len(), 1);
    Ok(())
}

#[test]
fn snapshot_sequence_matches_store_sequence() -> Result<()> {
    let dir = tempdir()?;
    let store = open(dir.path());
    let users = store.collection::<User>("users");

    users.put(&user("u1", "a@example.com", &[]))?;
    let snap = store.snapshot();
    assert_eq!(snap.sequence(), store.sequence());

    users.put(&user("u2", "b@example.com", &[]))?;
    assert!(snap.sequence() < store.sequence());
    Ok(())
}

#[test]
fn committed_batch_is_visible_to_later_snapshots_immediately() -> Result<()> {
    let dir = tempdir()?;
    let store = open(dir.path());
    let users = store.collection::<User>("users");

    let mut batch = crate::Batch::new();
    batch.put(&users, &user("u1", "a@example.com", &[]))?;
    batch.put(&users, &user("u2", "b@example.com", &[]))?;
    store.batch(batch)?;

    // No flush has happened; the commit is readable from memory.
    let snap = store.snapshot();
    assert_eq!(users.scan(None, None, Some(&snap))?.len(), 2);
    Ok(())
}
