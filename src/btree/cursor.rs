//! # B+Tree Cursor
//!
//! A cursor is a random access iterator over the tree. Most movements are
//! O(1) and memory-only, because the cursor is directly *coupled* to a slot
//! of an in-memory page. When that page is about to be mutated or evicted,
//! the cursor is *uncoupled*: the current key is copied into the cursor's
//! private arena and the page reference dropped. The next access couples
//! it again with an ordinary lookup of the saved key.
//!
//! ## States
//!
//! - **Nil** — points nowhere; the only state a cursor should be in when
//!   its database goes away.
//! - **Coupled** — holds (page address, slot, duplicate index). The page
//!   currently contains a valid key at that slot, and the cursor is
//!   registered on the page's cursor list.
//! - **Uncoupled** — holds a private copy of the key plus the duplicate
//!   index; no page reference.
//!
//! ```text
//!        couple_to / find / move_to
//!   Nil ───────────────────────────▶ Coupled
//!    ▲                                │  uncouple (before splits, merges,
//!    │ set_to_nil / close             ▼   slot removal, cache eviction)
//!    └───────────────────────────  Uncoupled
//!                 (couples again lazily on next access)
//! ```
//!
//! ## Registration
//!
//! Coupled cursors are registered on their page so structural edits can
//! find exactly the cursors that point into a slot array about to change.
//! Registration holds weak references; dropping a `Cursor` handle silently
//! deregisters it.
//!
//! Cursor operations take the owning [`Database`] explicitly: the cursor
//! itself stores no backpointer, and every movement may need to load pages.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use eyre::Result;

use crate::db::Database;
use crate::error::DbError;
use crate::memory::ByteArena;
use crate::page::PageRc;

use super::key::{unpack_record, InlineRecord};
use super::node::NodeRef;

/// Move to the first key of the tree.
pub const CURSOR_FIRST: u32 = 0x0001;
/// Move to the last key of the tree.
pub const CURSOR_LAST: u32 = 0x0002;
/// Move to the next key.
pub const CURSOR_NEXT: u32 = 0x0004;
/// Move to the previous key.
pub const CURSOR_PREVIOUS: u32 = 0x0008;
/// Skip duplicate records while moving.
pub const CURSOR_SKIP_DUPLICATES: u32 = 0x0010;
/// Stay within the current key's duplicate list while moving.
pub const CURSOR_ONLY_DUPLICATES: u32 = 0x0020;

/// Find: accept only the key itself.
pub const FIND_EXACT_MATCH: u32 = 0x4000;
/// Find: accept the largest key below the search key.
pub const FIND_LT_MATCH: u32 = 0x1000;
/// Find: accept the smallest key above the search key.
pub const FIND_GT_MATCH: u32 = 0x2000;
/// Find: exact, or the largest key below.
pub const FIND_LE_MATCH: u32 = FIND_LT_MATCH | FIND_EXACT_MATCH;
/// Find: exact, or the smallest key above.
pub const FIND_GE_MATCH: u32 = FIND_GT_MATCH | FIND_EXACT_MATCH;

/// Externally visible cursor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Nil,
    Coupled,
    Uncoupled,
}

#[derive(Clone)]
pub(crate) enum CursorPos {
    Nil,
    Coupled {
        address: u64,
        slot: usize,
        dup: u32,
    },
    Uncoupled {
        /// Private copy of the key the cursor points at.
        key: ByteArena,
        dup: u32,
    },
}

pub(crate) struct BtreeCursor {
    pub(crate) pos: CursorPos,
}

/// Handle to a tree cursor. Cheap to move around; the state lives behind a
/// shared cell so the engine can uncouple it during structural edits.
pub struct Cursor {
    pub(crate) inner: Rc<RefCell<BtreeCursor>>,
}

impl Cursor {
    pub(crate) fn new_nil() -> Self {
        Self {
            inner: Rc::new(RefCell::new(BtreeCursor {
                pos: CursorPos::Nil,
            })),
        }
    }

    pub fn state(&self) -> CursorState {
        match self.inner.borrow().pos {
            CursorPos::Nil => CursorState::Nil,
            CursorPos::Coupled { .. } => CursorState::Coupled,
            CursorPos::Uncoupled { .. } => CursorState::Uncoupled,
        }
    }

    /// Detaches from any page and discards the saved key. The cursor no
    /// longer points anywhere.
    pub fn set_to_nil(&self, db: &mut Database) {
        let prev = std::mem::replace(&mut self.inner.borrow_mut().pos, CursorPos::Nil);
        if let CursorPos::Coupled { address, .. } = prev {
            if let Some(page) = db.cache.peek(address) {
                page.borrow_mut().remove_cursor(&self.inner);
            }
        }
    }

    /// Equivalent to `set_to_nil`.
    pub fn close(&self, db: &mut Database) {
        self.set_to_nil(db);
    }

    /// Clones this cursor's state; a coupled clone registers on the same
    /// page.
    pub fn duplicate(&self, db: &mut Database) -> Result<Cursor> {
        let pos = self.inner.borrow().pos.clone();
        let clone = Cursor {
            inner: Rc::new(RefCell::new(BtreeCursor { pos: pos.clone() })),
        };
        if let CursorPos::Coupled { address, .. } = pos {
            let page = db.fetch_page(address)?;
            page.borrow_mut().add_cursor(Rc::downgrade(&clone.inner));
        }
        Ok(clone)
    }

    /// Copies the current key into the private arena and detaches from the
    /// page. A no-op for nil and already-uncoupled cursors, so bulk paths
    /// can call it unconditionally.
    pub fn uncouple(&self, db: &mut Database) -> Result<()> {
        let (address, slot, dup) = match self.inner.borrow().pos {
            CursorPos::Coupled { address, slot, dup } => (address, slot, dup),
            _ => return Ok(()),
        };
        let page = db.fetch_page(address)?;
        let key_bytes = db.materialize_slot_key(&page, slot)?;
        page.borrow_mut().remove_cursor(&self.inner);
        let mut key = ByteArena::new();
        key.assign(&key_bytes);
        self.inner.borrow_mut().pos = CursorPos::Uncoupled { key, dup };
        Ok(())
    }

    /// Locates `key` (subject to the match-mode flags), couples the cursor
    /// to the found slot, and materializes the found key and its record
    /// into the provided arenas.
    pub fn find(
        &self,
        db: &mut Database,
        key: &[u8],
        key_arena: Option<&mut ByteArena>,
        record_arena: Option<&mut ByteArena>,
        flags: u32,
    ) -> Result<()> {
        let (page, slot) = db.cursor_locate(key, flags)?;
        self.set_to_nil(db);
        db.couple_cursor(&self.inner, &page, slot, 0);
        self.fill_output(db, &page, slot, key_arena, record_arena)?;
        db.purge_cache()?;
        Ok(())
    }

    /// Moves to the first, last, next, or previous key. Next/previous from
    /// a nil cursor fail with `KeyNotFound`; page-boundary moves follow the
    /// leaf sibling pointers.
    pub fn move_to(
        &self,
        db: &mut Database,
        key_arena: Option<&mut ByteArena>,
        record_arena: Option<&mut ByteArena>,
        flags: u32,
    ) -> Result<()> {
        let (page, slot, dup) = if flags & CURSOR_FIRST != 0 {
            let leaf = db.leftmost_leaf()?;
            let count = leaf_count(db, &leaf);
            if count == 0 {
                return Err(DbError::KeyNotFound.into());
            }
            (leaf, 0, 0)
        } else if flags & CURSOR_LAST != 0 {
            let leaf = db.rightmost_leaf()?;
            let count = leaf_count(db, &leaf);
            if count == 0 {
                return Err(DbError::KeyNotFound.into());
            }
            (leaf, count - 1, 0)
        } else if flags & CURSOR_NEXT != 0 {
            let (page, slot, dup) = self.require_position(db)?;
            match db.leaf_successor(&page, slot as i32)? {
                Some((p, s)) => (p, s, dup),
                None => return Err(DbError::KeyNotFound.into()),
            }
        } else if flags & CURSOR_PREVIOUS != 0 {
            let (page, slot, dup) = self.require_position(db)?;
            match db.leaf_predecessor(&page, slot as i32)? {
                Some((p, s)) => (p, s, dup),
                None => return Err(DbError::KeyNotFound.into()),
            }
        } else {
            // No direction: (re)couple to the current position.
            self.require_position(db)?
        };

        self.set_to_nil(db);
        db.couple_cursor(&self.inner, &page, slot, dup);
        self.fill_output(db, &page, slot, key_arena, record_arena)?;
        db.purge_cache()?;
        Ok(())
    }

    /// Replaces the record of the currently-coupled key. The key itself is
    /// untouched, so no cursors move.
    pub fn overwrite(&self, db: &mut Database, record: &[u8], _flags: u32) -> Result<()> {
        let (address, slot) = match self.inner.borrow().pos {
            CursorPos::Coupled { address, slot, .. } => (address, slot),
            _ => {
                return Err(DbError::InvalidArgument("overwrite needs a coupled cursor").into());
            }
        };
        let page = db.fetch_page(address)?;
        db.overwrite_record(&page, slot, record)
    }

    /// Number of records attached to the current key. This engine stores
    /// one record per key, so the count is 1 for any valid position.
    pub fn record_count(&self, db: &mut Database, _flags: u32) -> Result<u32> {
        if matches!(self.inner.borrow().pos, CursorPos::Nil) {
            return Err(DbError::InvalidArgument("cursor does not point to a key").into());
        }
        let (page, slot, dup) = self.require_position(db)?;
        self.set_to_nil(db);
        db.couple_cursor(&self.inner, &page, slot, dup);
        Ok(1)
    }

    /// Size of the current key's record, without materializing blobs.
    pub fn record_size(&self, db: &mut Database) -> Result<u64> {
        if matches!(self.inner.borrow().pos, CursorPos::Nil) {
            return Err(DbError::InvalidArgument("cursor does not point to a key").into());
        }
        let (page, slot, dup) = self.require_position(db)?;
        self.set_to_nil(db);
        db.couple_cursor(&self.inner, &page, slot, dup);

        let (flags, rid) = {
            let p = page.borrow();
            let node = NodeRef::new(p.payload(), db.config.key_size);
            let k = node.key(slot);
            (k.flags(), k.rid_bytes())
        };
        match unpack_record(flags, &rid) {
            InlineRecord::Empty => Ok(0),
            InlineRecord::Tiny(data) => Ok(data.len() as u64),
            InlineRecord::Small(_) => Ok(8),
            InlineRecord::Blob(id) => db.blobs.size(&mut db.device, id),
        }
    }

    /// Resolves the cursor to a concrete (page, slot): coupled cursors load
    /// their page, uncoupled cursors re-find their saved key.
    fn require_position(&self, db: &mut Database) -> Result<(PageRc, usize, u32)> {
        let pos = self.inner.borrow().pos.clone();
        match pos {
            CursorPos::Nil => Err(DbError::KeyNotFound.into()),
            CursorPos::Coupled { address, slot, dup } => {
                Ok((db.fetch_page(address)?, slot, dup))
            }
            CursorPos::Uncoupled { key, dup } => {
                let (page, slot) = db.cursor_locate(key.as_slice(), 0)?;
                Ok((page, slot, dup))
            }
        }
    }

    fn fill_output(
        &self,
        db: &mut Database,
        page: &PageRc,
        slot: usize,
        key_arena: Option<&mut ByteArena>,
        record_arena: Option<&mut ByteArena>,
    ) -> Result<()> {
        if let Some(arena) = key_arena {
            let key = db.materialize_slot_key(page, slot)?;
            arena.assign(&key);
        }
        if let Some(arena) = record_arena {
            db.read_record_at(page, slot, arena)?;
        }
        Ok(())
    }
}

fn leaf_count(db: &Database, page: &PageRc) -> usize {
    let p = page.borrow();
    NodeRef::new(p.payload(), db.config.key_size).count()
}

impl Database {
    /// Hands out a fresh nil cursor for this database.
    pub fn cursor(&self) -> Cursor {
        Cursor::new_nil()
    }

    /// Couples a cursor to a page slot and registers it on the page.
    pub(crate) fn couple_cursor(
        &mut self,
        inner: &Rc<RefCell<BtreeCursor>>,
        page: &PageRc,
        slot: usize,
        dup: u32,
    ) {
        let address = page.borrow().address();
        page.borrow_mut().add_cursor(Rc::downgrade(inner));
        inner.borrow_mut().pos = CursorPos::Coupled { address, slot, dup };
    }

    /// Uncouples every cursor on `page` whose slot is at or past `start`.
    /// Must be called before any edit that renumbers slots.
    pub(crate) fn uncouple_all_cursors(&mut self, page: &PageRc, start: usize) -> Result<()> {
        let page_address = page.borrow().address();
        let cursors = page.borrow_mut().live_cursors();

        for cursor in cursors {
            let hit = match cursor.borrow().pos {
                CursorPos::Coupled { address, slot, dup }
                    if address == page_address && slot >= start =>
                {
                    Some((slot, dup))
                }
                _ => None,
            };
            if let Some((slot, dup)) = hit {
                let key_bytes = self.materialize_slot_key(page, slot)?;
                let mut key = ByteArena::new();
                key.assign(&key_bytes);
                cursor.borrow_mut().pos = CursorPos::Uncoupled { key, dup };
                page.borrow_mut().remove_cursor(&cursor);
            }
        }
        Ok(())
    }

    /// Locates `key` for a cursor, honoring the approximate-match flags.
    pub(crate) fn cursor_locate(&mut self, key: &[u8], flags: u32) -> Result<(PageRc, usize)> {
        let page = self.find_leaf(key)?;
        let slot = self.get_slot(&page, key)?;
        let equal =
            slot >= 0 && self.compare_slot_key(&page, slot as usize, key)? == Ordering::Equal;

        let want_lt = flags & FIND_LT_MATCH != 0;
        let want_gt = flags & FIND_GT_MATCH != 0;
        let exact_ok = flags & FIND_EXACT_MATCH != 0 || (!want_lt && !want_gt);

        if equal {
            if exact_ok {
                return Ok((page, slot as usize));
            }
            if want_lt {
                return self
                    .leaf_predecessor(&page, slot)?
                    .ok_or_else(|| eyre::Report::from(DbError::KeyNotFound));
            }
            return self
                .leaf_successor(&page, slot)?
                .ok_or_else(|| eyre::Report::from(DbError::KeyNotFound));
        }

        if want_lt {
            if slot >= 0 {
                return Ok((page, slot as usize));
            }
            return self
                .leaf_predecessor(&page, slot)?
                .ok_or_else(|| eyre::Report::from(DbError::KeyNotFound));
        }
        if want_gt {
            return self
                .leaf_successor(&page, slot)?
                .ok_or_else(|| eyre::Report::from(DbError::KeyNotFound));
        }
        Err(DbError::KeyNotFound.into())
    }
}
