use super::helpers::*;
use crate::Store;
use anyhow::Result;
use tempfile::tempdir;

/// Compaction is driven manually here, so table counts are deterministic.
fn open_manual(path: &std::path::Path) -> Store {
    let mut options = opts(path);
    options.auto_compact = false;
    Store::open(options).expect("open store")
}

fn tables_total(store: &Store) -> usize {
    store
        .compaction_status()
        .levels
        .iter()
        .map(|l| l.tables)
        .sum()
}

// --------------------- Merging ---------------------

#[test]
fn compaction_merges_overlapping_l0_tables() -> Result<()> {
    let dir = tempdir()?;
    let store = open_manual(dir.path());
    let users = store.collection::<User>("users");

    // Five flushes over the same four ids: five overlapping L0 tables.
    for round in 0..5 {
        for i in 0..4 {
            users.put(&user(&format!("u{}", i), &format!("r{}@example.com", round), &[]))?;
        }
        store.flush()?;
    }

    let before = tables_total(&store);
    assert_eq!(before, 5);

    store.compact_now()?;
    let after = tables_total(&store);
    assert!(after < before, "L0 count must strictly decrease: {} -> {}", after, before);

    // Union of keys preserved, newest value wins.
    for i in 0..4 {
        let u = users.get(&format!("u{}", i))?.expect("key survives merge");
        assert_eq!(u.email, "r4@example.com");
    }

    // The merged table set still recovers cleanly.
    drop(users);
    drop(store);
    let store = open_manual(dir.path());
    let users = store.collection::<User>("users");
    for i in 0..4 {
        assert_eq!(
            users.get(&format!("u{}", i))?.expect("recovered").email,
            "r4@example.com"
        );
    }
    Ok(())
}

#[test]
fn disjoint_tables_are_left_alone() -> Result<()> {
    let dir = tempdir()?;
    let store = open_manual(dir.path());
    let users = store.collection::<User>("users");

    // Three tables with disjoint id ranges: nothing overlaps.
    for round in 0..3 {
        users.put(&user(&format!("u{}", round), "a@example.com", &[]))?;
        store.flush()?;
    }

    let before = tables_total(&store);
    store.compact_now()?;
    assert_eq!(tables_total(&store), before);
    Ok(())
}

// --------------------- Status & debt ---------------------

#[test]
fn status_reports_levels_and_debt() -> Result<()> {
    let dir = tempdir()?;
    let store = open_manual(dir.path());
    let users = store.collection::<User>("users");

    // Six tiny L0 tables: debt accrues past the fourth.
    for round in 0..6 {
        users.put(&user(&format!("u{}", round), "a@example.com", &[]))?;
        store.flush()?;
    }

    let status = store.compaction_status();
    let l0 = status.levels.iter().find(|l| l.level == 0).expect("L0 present");
    assert_eq!(l0.tables, 6);
    assert!(status.debt_bytes > 0, "more than four L0 tables must accrue debt");
    // Debt excludes the four smallest tables.
    assert!(status.debt_bytes < l0.size_bytes);
    assert!(!status.running);
    Ok(())
}

#[test]
fn few_tables_accrue_no_debt() -> Result<()> {
    let dir = tempdir()?;
    let store = open_manual(dir.path());
    let users = store.collection::<User>("users");

    for round in 0..3 {
        users.put(&user(&format!("u{}", round), "a@example.com", &[]))?;
        store.flush()?;
    }

    assert_eq!(store.compaction_status().debt_bytes, 0);
    Ok(())
}

// --------------------- Version retention ---------------------

#[test]
fn live_snapshot_pins_versions_through_compaction() -> Result<()> {
    let dir = tempdir()?;
    let store = open_manual(dir.path());
    let users = store.collection::<User>("users");

    users.put(&user("u1", "v1@example.com", &[]))?;
    store.flush()?;
    let snap = store.snapshot();
    users.put(&user("u1", "v2@example.com", &[]))?;
    store.flush()?;

    store.compact_now()?;
    assert_eq!(tables_total(&store), 1);

    // The snapshot still reads its version from the merged table set.
    assert_eq!(
        users.get_at(&"u1".to_string(), Some(&snap))?.unwrap().email,
        "v1@example.com"
    );
    assert_eq!(users.get(&"u1".to_string())?.unwrap().email, "v2@example.com");

    // Even across a restart: the merged table must carry both versions.
    drop(users);
    drop(store);
    let store = open_manual(dir.path());
    let users = store.collection::<User>("users");
    assert_eq!(
        users.get_at(&"u1".to_string(), Some(&snap))?.unwrap().email,
        "v1@example.com"
    );
    Ok(())
}

#[test]
fn superseded_versions_age_out_once_snapshots_allow() -> Result<()> {
    let dir = tempdir()?;
    let store = open_manual(dir.path());
    let users = store.collection::<User>("users");

    users.put(&user("u1", "v1@example.com", &[]))?;
    store.flush()?;
    let snap = store.snapshot();
    users.put(&user("u1", "v2@example.com", &[]))?;
    store.flush()?;

    // With the snapshot live, v1 is pinned.
    store.compact_now()?;
    drop(snap);

    // A later snapshot floor above v2 lets a second merge drop v1. Force two
    // overlapping tables again first.
    users.put(&user("u1", "v3@example.com", &[]))?;
    store.flush()?;
    let late_snap = store.snapshot();
    store.compact_now()?;

    drop(users);
    drop(store);
    let store = open_manual(dir.path());
    let users = store.collection::<User>("users");
    let history = users.history(&"u1".to_string(), None)?;
    assert!(
        history.iter().all(|(_, v)| v.is_none()
            || v.as_ref().unwrap().email != "v1@example.com"),
        "v1 dropped once no snapshot could see it: {:?}",
        history.len()
    );
    assert_eq!(users.get(&"u1".to_string())?.unwrap().email, "v3@example.com");
    drop(late_snap);
    Ok(())
}

#[test]
fn fully_tombstoned_ids_coalesce_without_live_snapshots() -> Result<()> {
    let dir = tempdir()?;
    let store = open_manual(dir.path());
    let users = store.collection::<User>("users");

    users.put(&user("dead", "a@example.com", &[]))?;
    users.put(&user("live", "b@example.com", &[]))?;
    store.flush()?;
    users.delete(&"dead".to_string())?;
    store.flush()?;

    store.compact_now()?;
    assert_eq!(tables_total(&store), 1);

    drop(users);
    drop(store);
    let store = open_manual(dir.path());
    let users = store.collection::<User>("users");
    assert!(users.get(&"dead".to_string())?.is_none());
    assert!(
        users.history(&"dead".to_string(), None)?.is_empty(),
        "coalesced id leaves no bootstrapped versions"
    );
    assert!(users.get(&"live".to_string())?.is_some());
    Ok(())
}
