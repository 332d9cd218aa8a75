//! Basic tree operations: point lookups, record storage classes,
//! overwrite semantics, and file-backed persistence.

use martendb::{ByteArena, Database, DbError, OVERWRITE};

fn small_db() -> Database {
    // 8-byte page header + 28-byte node header + 4 slots of 27 bytes.
    Database::builder()
        .in_memory()
        .page_size(144)
        .key_size(16)
        .create()
        .unwrap()
}

fn get(db: &mut Database, key: &[u8]) -> Option<Vec<u8>> {
    let mut arena = ByteArena::new();
    match db.find(key, &mut arena) {
        Ok(len) => Some(arena.as_slice()[..len].to_vec()),
        Err(e) if DbError::is_not_found(&e) => None,
        Err(e) => panic!("find failed: {e}"),
    }
}

#[test]
fn insert_then_find() {
    let mut db = small_db();
    db.insert(b"k", b"value", 0).unwrap();
    assert_eq!(get(&mut db, b"k"), Some(b"value".to_vec()));
    assert_eq!(get(&mut db, b"missing"), None);
}

#[test]
fn insert_erase_find_is_not_found() {
    let mut db = small_db();
    db.insert(b"k", b"value", 0).unwrap();
    db.erase(b"k").unwrap();
    assert_eq!(get(&mut db, b"k"), None);
}

#[test]
fn erase_then_reinsert_gets_new_record() {
    let mut db = small_db();
    db.insert(b"k", b"old", 0).unwrap();
    db.erase(b"k").unwrap();
    db.insert(b"k", b"new", 0).unwrap();
    assert_eq!(get(&mut db, b"k"), Some(b"new".to_vec()));
}

#[test]
fn duplicate_insert_fails_without_overwrite() {
    let mut db = small_db();
    db.insert(b"k", b"one", 0).unwrap();

    let err = db.insert(b"k", b"two", 0).unwrap_err();
    assert!(DbError::is_key_exists(&err));
    assert_eq!(get(&mut db, b"k"), Some(b"one".to_vec()));

    db.insert(b"k", b"two", OVERWRITE).unwrap();
    assert_eq!(get(&mut db, b"k"), Some(b"two".to_vec()));
}

#[test]
fn erase_missing_key_is_not_found() {
    let mut db = small_db();
    let err = db.erase(b"nope").unwrap_err();
    assert!(DbError::is_not_found(&err));

    db.insert(b"k", b"v", 0).unwrap();
    let err = db.erase(b"nope").unwrap_err();
    assert!(DbError::is_not_found(&err));
}

#[test]
fn record_storage_classes_roundtrip() {
    let mut db = small_db();

    // Empty, tiny (<8), small (==8), and blob-backed (>8) records.
    db.insert(b"empty", b"", 0).unwrap();
    db.insert(b"tiny", b"abc", 0).unwrap();
    db.insert(b"small", b"12345678", 0).unwrap();
    let big = vec![0x5Au8; 300];
    db.insert(b"big", &big, 0).unwrap();

    assert_eq!(get(&mut db, b"empty"), Some(Vec::new()));
    assert_eq!(get(&mut db, b"tiny"), Some(b"abc".to_vec()));
    assert_eq!(get(&mut db, b"small"), Some(b"12345678".to_vec()));
    assert_eq!(get(&mut db, b"big"), Some(big));

    db.check_integrity().unwrap();
}

#[test]
fn overwrite_across_storage_classes() {
    let mut db = small_db();
    db.insert(b"k", b"tiny", 0).unwrap();
    db.insert(b"k", &vec![1u8; 200], OVERWRITE).unwrap();
    assert_eq!(get(&mut db, b"k"), Some(vec![1u8; 200]));
    db.insert(b"k", b"", OVERWRITE).unwrap();
    assert_eq!(get(&mut db, b"k"), Some(Vec::new()));
}

#[test]
fn many_keys_split_and_survive() {
    let mut db = small_db();
    for i in 0u16..200 {
        let key = i.to_be_bytes();
        let record = format!("record-{i}");
        db.insert(&key, record.as_bytes(), 0).unwrap();
    }
    db.check_integrity().unwrap();

    for i in 0u16..200 {
        let key = i.to_be_bytes();
        assert_eq!(
            get(&mut db, &key),
            Some(format!("record-{i}").into_bytes()),
            "key {i} lost after splits"
        );
    }
}

#[test]
fn erase_everything_leaves_usable_tree() {
    let mut db = small_db();
    for i in 0u16..50 {
        db.insert(&i.to_be_bytes(), b"r", 0).unwrap();
    }
    for i in 0u16..50 {
        db.erase(&i.to_be_bytes()).unwrap();
        db.check_integrity().unwrap();
    }
    assert_eq!(get(&mut db, &7u16.to_be_bytes()), None);

    db.insert(b"again", b"works", 0).unwrap();
    assert_eq!(get(&mut db, b"again"), Some(b"works".to_vec()));
}

#[test]
fn create_close_open_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("roundtrip.mdb");

    {
        let mut db = Database::builder()
            .path(&path)
            .page_size(256)
            .key_size(16)
            .enable_crc(true)
            .create()
            .unwrap();
        for i in 0u16..40 {
            db.insert(&i.to_be_bytes(), format!("v{i}").as_bytes(), 0)
                .unwrap();
        }
        db.close().unwrap();
    }

    let mut db = Database::builder().path(&path).open().unwrap();
    db.check_integrity().unwrap();
    for i in 0u16..40 {
        assert_eq!(
            get(&mut db, &i.to_be_bytes()),
            Some(format!("v{i}").into_bytes())
        );
    }

    db.erase(&11u16.to_be_bytes()).unwrap();
    db.close().unwrap();

    let mut db = Database::builder().path(&path).open().unwrap();
    assert_eq!(get(&mut db, &11u16.to_be_bytes()), None);
    assert_eq!(get(&mut db, &12u16.to_be_bytes()), Some(b"v12".to_vec()));
}

#[test]
fn checksum_detects_torn_page() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("corrupt.mdb");

    {
        let mut db = Database::builder()
            .path(&path)
            .page_size(256)
            .key_size(16)
            .enable_crc(true)
            .create()
            .unwrap();
        for i in 0u16..8 {
            db.insert(&i.to_be_bytes(), b"payload", 0).unwrap();
        }
        db.close().unwrap();
    }

    // Flip a byte inside the root page's payload (page 1).
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        file.seek(SeekFrom::Start(256 + 64)).unwrap();
        file.write_all(&[0xFF]).unwrap();
    }

    let mut db = Database::builder().path(&path).open().unwrap();
    let mut arena = ByteArena::new();
    let err = db.find(&0u16.to_be_bytes(), &mut arena).unwrap_err();
    assert!(DbError::is_corruption(&err), "got: {err}");
}

#[test]
fn open_rejects_foreign_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("not-a-db");
    std::fs::write(&path, vec![0xABu8; 4096]).unwrap();

    let err = Database::builder().path(&path).open().unwrap_err();
    assert!(DbError::is_corruption(&err));
}

#[test]
fn configured_compressor_shrinks_blob_records() {
    use martendb::Compressor;

    /// Byte-level run-length coding; enough to exercise the capability
    /// end to end.
    struct RunLength;

    impl Compressor for RunLength {
        fn compressed_length(&self, input_len: usize) -> usize {
            input_len * 2
        }

        fn compress(
            &mut self,
            inp1: &[u8],
            inp2: Option<&[u8]>,
            arena: &mut ByteArena,
        ) -> eyre::Result<usize> {
            let worst = self.compressed_length(inp1.len() + inp2.map_or(0, |s| s.len()));
            if arena.len() < worst {
                arena.resize(worst);
            }
            let out = arena.as_mut_slice();
            let mut iter = inp1.iter().chain(inp2.into_iter().flatten());
            let mut current = match iter.next() {
                Some(b) => *b,
                None => return Ok(0),
            };
            let mut written = 0usize;
            let mut run = 1u8;
            for &b in iter {
                if b == current && run < u8::MAX {
                    run += 1;
                } else {
                    out[written] = run;
                    out[written + 1] = current;
                    written += 2;
                    current = b;
                    run = 1;
                }
            }
            out[written] = run;
            out[written + 1] = current;
            Ok(written + 2)
        }

        fn decompress(
            &mut self,
            inp: &[u8],
            expected_len: usize,
            arena: &mut ByteArena,
        ) -> eyre::Result<()> {
            arena.clear();
            for pair in inp.chunks(2) {
                for _ in 0..pair[0] {
                    arena.append(&[pair[1]]);
                }
            }
            eyre::ensure!(arena.len() == expected_len, "bad decompressed length");
            Ok(())
        }
    }

    let mut db = Database::builder()
        .in_memory()
        .page_size(144)
        .key_size(16)
        .compressor(Box::new(RunLength))
        .create()
        .unwrap();

    let record = vec![0x11u8; 5000];
    db.insert(b"compressible", &record, 0).unwrap();
    assert_eq!(get(&mut db, b"compressible"), Some(record));

    // Overwriting frees the old compressed blob and writes a new one.
    let record2 = vec![0x22u8; 3000];
    db.insert(b"compressible", &record2, OVERWRITE).unwrap();
    assert_eq!(get(&mut db, b"compressible"), Some(record2));
    db.check_integrity().unwrap();
}

#[test]
fn custom_comparator_orders_the_tree() {
    fn reversed(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        b.cmp(a)
    }

    let mut db = Database::builder()
        .in_memory()
        .page_size(144)
        .key_size(16)
        .comparator(martendb::Comparator::Callback(reversed))
        .create()
        .unwrap();

    for i in 0u8..20 {
        db.insert(&[i], &[i], 0).unwrap();
    }
    db.check_integrity().unwrap();

    // First in reversed order is the numerically largest key.
    let cursor = db.cursor();
    let mut key = ByteArena::new();
    cursor
        .move_to(&mut db, Some(&mut key), None, martendb::CURSOR_FIRST)
        .unwrap();
    assert_eq!(key.as_slice(), &[19]);
    cursor.close(&mut db);
}
