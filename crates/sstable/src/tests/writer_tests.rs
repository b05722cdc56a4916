use crate::format::{Footer, FOOTER_BYTES};
use crate::{SstError, TableWriter};
use std::io::{Seek, SeekFrom};
use tempfile::tempdir;

fn entries(n: usize, value_len: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    (0..n)
        .map(|i| {
            (
                format!("key{:06}", i).into_bytes(),
                vec![b'v'; value_len],
            )
        })
        .collect()
}

#[test]
fn writes_footer_with_valid_offsets() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.sst");

    TableWriter::write_sorted(&path, 4, entries(4, 8)).unwrap();

    let mut f = std::fs::File::open(&path).unwrap();
    let (footer, filesize) = Footer::read_from(&mut f).unwrap();

    assert!(footer.index_off > 0);
    assert!(footer.bloom_off >= footer.index_off + footer.index_len);
    assert_eq!(
        footer.bloom_off + footer.bloom_len,
        filesize - FOOTER_BYTES,
        "bloom runs up to the footer"
    );

    // Data blocks start at offset zero.
    f.seek(SeekFrom::Start(0)).unwrap();
}

#[test]
fn small_input_fits_one_block() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.sst");

    TableWriter::write_sorted(&path, 10, entries(10, 16)).unwrap();

    let cache = std::sync::Arc::new(cache::BlockCache::new(0));
    let reader = crate::TableReader::open(&path, uuid::Uuid::new_v4(), cache).unwrap();
    assert_eq!(reader.block_count(), 1);
}

#[test]
fn large_input_splits_into_blocks() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.sst");

    // ~500 entries x ~110 bytes each is far past one 4 KiB block.
    TableWriter::write_sorted(&path, 500, entries(500, 100)).unwrap();

    let cache = std::sync::Arc::new(cache::BlockCache::new(0));
    let reader = crate::TableReader::open(&path, uuid::Uuid::new_v4(), cache).unwrap();
    assert!(
        reader.block_count() > 10,
        "expected many blocks, got {}",
        reader.block_count()
    );
}

#[test]
fn empty_input_is_refused_and_leaves_no_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.sst");

    let result = TableWriter::write_sorted(&path, 0, Vec::new());
    assert!(matches!(result, Err(SstError::Corrupt(_))));
    assert!(!path.exists());
    assert!(!path.with_extension("sst.tmp").exists());
}

#[test]
fn no_tmp_file_remains_after_write() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.sst");

    TableWriter::write_sorted(&path, 4, entries(4, 8)).unwrap();

    assert!(path.exists());
    assert!(!path.with_extension("sst.tmp").exists());
}

#[test]
fn tombstones_are_stored_as_empty_values() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.sst");

    let input = vec![
        (b"a".to_vec(), b"alive".to_vec()),
        (b"b".to_vec(), Vec::new()), // tombstone
    ];
    TableWriter::write_sorted(&path, 2, input).unwrap();

    let cache = std::sync::Arc::new(cache::BlockCache::new(0));
    let reader = crate::TableReader::open(&path, uuid::Uuid::new_v4(), cache).unwrap();
    assert_eq!(reader.get(b"a").unwrap().unwrap(), b"alive");
    assert_eq!(reader.get(b"b").unwrap().unwrap(), Vec::<u8>::new());
}
