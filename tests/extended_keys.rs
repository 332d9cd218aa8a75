//! Extended keys: inline prefixes with blob-backed overflow, deep-copied
//! separators, and blob ownership across erase.

use martendb::{ByteArena, Database, DbError, CURSOR_FIRST, CURSOR_NEXT};

/// 16-byte inline area: 8 bytes of prefix plus the 8-byte blob id. Every
/// key below is longer than 16 bytes, so all of them overflow.
fn ext_db() -> Database {
    Database::builder()
        .in_memory()
        .page_size(144)
        .key_size(16)
        .create()
        .unwrap()
}

/// Keys sharing a long common prefix, distinguished only in the overflow
/// portion — slot comparisons must resolve the blobs to order them.
fn long_key(i: u32) -> Vec<u8> {
    format!("shared-prefix-beyond-inline-{i:08}").into_bytes()
}

#[test]
fn long_keys_roundtrip() {
    let mut db = ext_db();
    let mut arena = ByteArena::new();

    for i in 0..30 {
        db.insert(&long_key(i), format!("r{i}").as_bytes(), 0).unwrap();
    }
    db.check_integrity().unwrap();

    for i in 0..30 {
        let len = db.find(&long_key(i), &mut arena).unwrap();
        assert_eq!(&arena.as_slice()[..len], format!("r{i}").as_bytes());
    }

    let err = db.find(b"shared-prefix-beyond-inline-unknown", &mut arena).unwrap_err();
    assert!(DbError::is_not_found(&err));
}

#[test]
fn long_keys_scan_in_order() {
    let mut db = ext_db();
    for i in (0..20).rev() {
        db.insert(&long_key(i), b"", 0).unwrap();
    }

    let cursor = db.cursor();
    let mut key = ByteArena::new();
    cursor
        .move_to(&mut db, Some(&mut key), None, CURSOR_FIRST)
        .unwrap();
    let mut seen = vec![key.as_slice().to_vec()];
    while cursor
        .move_to(&mut db, Some(&mut key), None, CURSOR_NEXT)
        .is_ok()
    {
        seen.push(key.as_slice().to_vec());
    }

    let expected: Vec<Vec<u8>> = (0..20).map(long_key).collect();
    assert_eq!(seen, expected);
    cursor.close(&mut db);
}

/// Splits copy a leaf key upward as a separator. For extended keys the
/// separator must own a fresh blob: erasing the original leaf key (which
/// frees its blob) must leave the separator usable.
#[test]
fn separator_blobs_are_independent_of_leaf_blobs() {
    let mut db = ext_db();
    // Three levels deep, so internal nodes also rotate and merge extended
    // separators on the way down.
    for i in 0..30 {
        db.insert(&long_key(i), b"r", 0).unwrap();
    }
    db.check_integrity().unwrap();

    // Erase every key; each erase frees the leaf copy's blob while
    // separators above keep resolving through their own blobs.
    for i in 0..30 {
        db.erase(&long_key(i)).unwrap();
        db.check_integrity().unwrap();
    }

    let mut arena = ByteArena::new();
    for i in 0..30 {
        let err = db.find(&long_key(i), &mut arena).unwrap_err();
        assert!(DbError::is_not_found(&err));
    }
}

#[test]
fn erase_reinsert_long_keys() {
    let mut db = ext_db();
    let mut arena = ByteArena::new();

    for i in 0..16 {
        db.insert(&long_key(i), b"one", 0).unwrap();
    }
    for i in (0..16).step_by(2) {
        db.erase(&long_key(i)).unwrap();
    }
    db.check_integrity().unwrap();
    for i in (0..16).step_by(2) {
        db.insert(&long_key(i), b"two", 0).unwrap();
    }
    db.check_integrity().unwrap();

    for i in 0..16 {
        let len = db.find(&long_key(i), &mut arena).unwrap();
        let expected: &[u8] = if i % 2 == 0 { b"two" } else { b"one" };
        assert_eq!(&arena.as_slice()[..len], expected, "key {i}");
    }
}

#[test]
fn mixed_inline_and_extended_keys() {
    let mut db = ext_db();
    let mut arena = ByteArena::new();

    for i in 0u8..10 {
        db.insert(&[i], b"short", 0).unwrap();
        db.insert(&long_key(i as u32), b"long", 0).unwrap();
    }
    db.check_integrity().unwrap();

    for i in 0u8..10 {
        let len = db.find(&[i], &mut arena).unwrap();
        assert_eq!(&arena.as_slice()[..len], b"short");
        let len = db.find(&long_key(i as u32), &mut arena).unwrap();
        assert_eq!(&arena.as_slice()[..len], b"long");
    }
}

#[test]
fn extended_keys_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("extkeys.mdb");

    {
        let mut db = Database::builder()
            .path(&path)
            .page_size(256)
            .key_size(16)
            .enable_crc(true)
            .create()
            .unwrap();
        for i in 0..25 {
            db.insert(&long_key(i), format!("v{i}").as_bytes(), 0).unwrap();
        }
        db.close().unwrap();
    }

    let mut db = Database::builder().path(&path).open().unwrap();
    db.check_integrity().unwrap();
    let mut arena = ByteArena::new();
    for i in 0..25 {
        let len = db.find(&long_key(i), &mut arena).unwrap();
        assert_eq!(&arena.as_slice()[..len], format!("v{i}").as_bytes());
    }
}
