//! Cursor lifecycle: approximate matching, ordered traversal, uncoupling
//! before structural edits, and survival across cache eviction.

use martendb::{
    ByteArena, Cursor, CursorState, Database, DbError, CURSOR_FIRST, CURSOR_LAST, CURSOR_NEXT,
    CURSOR_PREVIOUS, FIND_GE_MATCH, FIND_GT_MATCH, FIND_LE_MATCH, FIND_LT_MATCH, OVERWRITE,
};

fn small_db() -> Database {
    Database::builder()
        .in_memory()
        .page_size(144)
        .key_size(16)
        .create()
        .unwrap()
}

/// Leaves after seeding 10,20,..,80: [10,20], [30,40], [50,60,70,80].
fn seeded_db() -> Database {
    let mut db = small_db();
    for k in (10u8..=80).step_by(10) {
        db.insert(&[k], &[k], 0).unwrap();
    }
    db
}

fn current_key(cursor: &Cursor, db: &mut Database) -> u8 {
    let mut key = ByteArena::new();
    cursor.move_to(db, Some(&mut key), None, 0).unwrap();
    key.as_slice()[0]
}

#[test]
fn exact_find_couples_and_reads_record() {
    let mut db = seeded_db();
    let cursor = db.cursor();
    assert_eq!(cursor.state(), CursorState::Nil);

    let mut record = ByteArena::new();
    cursor
        .find(&mut db, &[30], None, Some(&mut record), 0)
        .unwrap();
    assert_eq!(cursor.state(), CursorState::Coupled);
    assert_eq!(record.as_slice(), &[30]);

    let err = cursor.find(&mut db, &[35], None, None, 0).unwrap_err();
    assert!(DbError::is_not_found(&err));
    cursor.close(&mut db);
}

#[test]
fn approximate_matching_modes() {
    let mut db = seeded_db();
    let cursor = db.cursor();
    let mut key = ByteArena::new();

    // Between keys: LT/LE land on 40, GT/GE land on 50.
    for (flags, expected) in [
        (FIND_LT_MATCH, 40u8),
        (FIND_LE_MATCH, 40),
        (FIND_GT_MATCH, 50),
        (FIND_GE_MATCH, 50),
    ] {
        cursor
            .find(&mut db, &[45], Some(&mut key), None, flags)
            .unwrap();
        assert_eq!(key.as_slice(), &[expected], "flags {flags:#x}");
    }

    // On a key: LE/GE stay, LT/GT step over (LT crosses a page boundary).
    for (flags, expected) in [
        (FIND_LE_MATCH, 30u8),
        (FIND_GE_MATCH, 30),
        (FIND_LT_MATCH, 20),
        (FIND_GT_MATCH, 40),
    ] {
        cursor
            .find(&mut db, &[30], Some(&mut key), None, flags)
            .unwrap();
        assert_eq!(key.as_slice(), &[expected], "flags {flags:#x}");
    }

    // Off both ends.
    let err = cursor
        .find(&mut db, &[5], None, None, FIND_LT_MATCH)
        .unwrap_err();
    assert!(DbError::is_not_found(&err));
    let err = cursor
        .find(&mut db, &[90], None, None, FIND_GT_MATCH)
        .unwrap_err();
    assert!(DbError::is_not_found(&err));

    cursor
        .find(&mut db, &[5], Some(&mut key), None, FIND_GE_MATCH)
        .unwrap();
    assert_eq!(key.as_slice(), &[10]);
    cursor
        .find(&mut db, &[90], Some(&mut key), None, FIND_LE_MATCH)
        .unwrap();
    assert_eq!(key.as_slice(), &[80]);

    cursor.close(&mut db);
}

#[test]
fn full_scan_forward_and_backward() {
    let mut db = seeded_db();
    let cursor = db.cursor();
    let mut key = ByteArena::new();

    let mut forward = Vec::new();
    cursor
        .move_to(&mut db, Some(&mut key), None, CURSOR_FIRST)
        .unwrap();
    forward.push(key.as_slice()[0]);
    loop {
        match cursor.move_to(&mut db, Some(&mut key), None, CURSOR_NEXT) {
            Ok(()) => forward.push(key.as_slice()[0]),
            Err(e) => {
                assert!(DbError::is_not_found(&e));
                break;
            }
        }
    }
    assert_eq!(forward, vec![10, 20, 30, 40, 50, 60, 70, 80]);

    let mut backward = Vec::new();
    cursor
        .move_to(&mut db, Some(&mut key), None, CURSOR_LAST)
        .unwrap();
    backward.push(key.as_slice()[0]);
    while cursor
        .move_to(&mut db, Some(&mut key), None, CURSOR_PREVIOUS)
        .is_ok()
    {
        backward.push(key.as_slice()[0]);
    }
    assert_eq!(backward, vec![80, 70, 60, 50, 40, 30, 20, 10]);

    cursor.close(&mut db);
}

#[test]
fn next_and_previous_on_nil_cursor_fail() {
    let mut db = seeded_db();
    let cursor = db.cursor();

    let err = cursor.move_to(&mut db, None, None, CURSOR_NEXT).unwrap_err();
    assert!(DbError::is_not_found(&err));
    let err = cursor
        .move_to(&mut db, None, None, CURSOR_PREVIOUS)
        .unwrap_err();
    assert!(DbError::is_not_found(&err));

    // First/last are fine from nil.
    cursor.move_to(&mut db, None, None, CURSOR_FIRST).unwrap();
    assert_eq!(cursor.state(), CursorState::Coupled);
    cursor.close(&mut db);
    assert_eq!(cursor.state(), CursorState::Nil);
}

#[test]
fn first_and_last_on_empty_tree_fail() {
    let mut db = small_db();
    let cursor = db.cursor();
    let err = cursor
        .move_to(&mut db, None, None, CURSOR_FIRST)
        .unwrap_err();
    assert!(DbError::is_not_found(&err));
}

#[test]
fn structural_edit_uncouples_then_cursor_recovers() {
    let mut db = seeded_db();
    let cursor = db.cursor();
    cursor.find(&mut db, &[30], None, None, 0).unwrap();
    assert_eq!(cursor.state(), CursorState::Coupled);

    // Erasing 40 drains the [30,40] leaf below threshold and rebalances,
    // which uncouples every cursor on the touched pages first.
    db.erase(&[40]).unwrap();
    assert_eq!(cursor.state(), CursorState::Uncoupled);

    // The cursor still resolves to its key, and moves on correctly.
    assert_eq!(current_key(&cursor, &mut db), 30);
    let mut key = ByteArena::new();
    cursor
        .move_to(&mut db, Some(&mut key), None, CURSOR_NEXT)
        .unwrap();
    assert_eq!(key.as_slice(), &[50]);

    cursor.close(&mut db);
}

#[test]
fn cursor_survives_cache_eviction() {
    let mut db = Database::builder()
        .in_memory()
        .page_size(144)
        .key_size(16)
        .cache_capacity(1)
        .create()
        .unwrap();
    for k in (10u8..=80).step_by(10) {
        db.insert(&[k], &[k], 0).unwrap();
    }

    let cursor = db.cursor();
    cursor.find(&mut db, &[20], None, None, 0).unwrap();
    assert_eq!(cursor.state(), CursorState::Coupled);

    // Touching the far end of the tree churns the one-page cache and
    // evicts the cursor's leaf; eviction must uncouple it, not break it.
    let mut arena = ByteArena::new();
    db.find(&[80], &mut arena).unwrap();
    assert_eq!(cursor.state(), CursorState::Uncoupled);
    assert_eq!(db.cached_pages(), 1);

    let mut key = ByteArena::new();
    cursor
        .move_to(&mut db, Some(&mut key), None, CURSOR_NEXT)
        .unwrap();
    assert_eq!(key.as_slice(), &[30]);

    cursor.close(&mut db);
}

#[test]
fn overwrite_requires_coupled_cursor() {
    let mut db = seeded_db();
    let cursor = db.cursor();

    let err = cursor.overwrite(&mut db, b"record", 0).unwrap_err();
    assert!(DbError::is_invalid_argument(&err));

    cursor.find(&mut db, &[20], None, None, 0).unwrap();
    cursor.overwrite(&mut db, b"rewritten", 0).unwrap();

    let mut arena = ByteArena::new();
    let len = db.find(&[20], &mut arena).unwrap();
    assert_eq!(&arena.as_slice()[..len], b"rewritten");

    cursor.close(&mut db);
}

#[test]
fn record_count_and_size() {
    let mut db = small_db();
    db.insert(&[1], b"", 0).unwrap();
    db.insert(&[2], b"abc", 0).unwrap();
    db.insert(&[3], b"12345678", 0).unwrap();
    db.insert(&[4], &vec![9u8; 500], 0).unwrap();

    let cursor = db.cursor();
    for (key, size) in [(1u8, 0u64), (2, 3), (3, 8), (4, 500)] {
        cursor.find(&mut db, &[key], None, None, 0).unwrap();
        assert_eq!(cursor.record_size(&mut db).unwrap(), size, "key {key}");
        assert_eq!(cursor.record_count(&mut db, 0).unwrap(), 1);
    }

    let nil = db.cursor();
    assert!(DbError::is_invalid_argument(
        &nil.record_count(&mut db, 0).unwrap_err()
    ));
    assert!(DbError::is_invalid_argument(
        &nil.record_size(&mut db).unwrap_err()
    ));

    cursor.close(&mut db);
}

#[test]
fn duplicate_clones_position() {
    let mut db = seeded_db();
    let cursor = db.cursor();
    cursor.find(&mut db, &[50], None, None, 0).unwrap();

    let clone = cursor.duplicate(&mut db).unwrap();
    assert_eq!(clone.state(), CursorState::Coupled);

    // The clone moves independently.
    let mut key = ByteArena::new();
    clone
        .move_to(&mut db, Some(&mut key), None, CURSOR_NEXT)
        .unwrap();
    assert_eq!(key.as_slice(), &[60]);
    assert_eq!(current_key(&cursor, &mut db), 50);

    // Both get uncoupled by an edit on their page.
    db.erase(&[70]).unwrap();
    db.check_integrity().unwrap();

    assert_eq!(current_key(&cursor, &mut db), 50);
    assert_eq!(current_key(&clone, &mut db), 60);

    cursor.close(&mut db);
    clone.close(&mut db);
}

#[test]
fn uncouple_is_idempotent() {
    let mut db = seeded_db();
    let cursor = db.cursor();

    // No-op on nil.
    cursor.uncouple(&mut db).unwrap();
    assert_eq!(cursor.state(), CursorState::Nil);

    cursor.find(&mut db, &[10], None, None, 0).unwrap();
    cursor.uncouple(&mut db).unwrap();
    assert_eq!(cursor.state(), CursorState::Uncoupled);
    // No-op when already uncoupled.
    cursor.uncouple(&mut db).unwrap();

    assert_eq!(current_key(&cursor, &mut db), 10);
    cursor.close(&mut db);
}

#[test]
fn erase_of_cursor_key_leaves_cursor_unresolvable() {
    let mut db = seeded_db();
    let cursor = db.cursor();
    cursor.find(&mut db, &[60], None, None, 0).unwrap();

    db.erase(&[60]).unwrap();

    // The cursor saved the erased key; re-coupling cannot find it.
    let err = cursor.move_to(&mut db, None, None, CURSOR_NEXT).unwrap_err();
    assert!(DbError::is_not_found(&err));

    cursor.close(&mut db);
}
