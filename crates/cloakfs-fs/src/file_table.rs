//! Registry of open encrypted files, keyed by device/inode identity.
//!
//! Several open handles to the same inode must share one write lock and
//! one cached file id, no matter which path or descriptor they came
//! through. Entries are refcounted: the slot appears with the first open
//! of an inode and disappears with its last close, so the table stays
//! proportional to the number of open files.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use cloakfs_core::types::FileIdent;
use cloakfs_crypto::FILE_ID_LEN;

/// Shared per-inode state.
pub struct Entry {
    /// Serializes content access: writers exclusive, readers shared.
    content: RwLock<()>,
    /// File id from the header, cached after the first read or write.
    /// `None` until the header exists or has been read.
    id: RwLock<Option<[u8; FILE_ID_LEN]>>,
}

impl Entry {
    fn new() -> Self {
        Self {
            content: RwLock::new(()),
            id: RwLock::new(None),
        }
    }

    pub fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.content.read().expect("content lock poisoned")
    }

    pub fn cached_id(&self) -> Option<[u8; FILE_ID_LEN]> {
        *self.id.read().expect("id lock poisoned")
    }

    pub fn set_cached_id(&self, id: [u8; FILE_ID_LEN]) {
        *self.id.write().expect("id lock poisoned") = Some(id);
    }

    /// Exclusive access to the id slot, for the create-once header path.
    pub fn id_slot(&self) -> RwLockWriteGuard<'_, Option<[u8; FILE_ID_LEN]>> {
        self.id.write().expect("id lock poisoned")
    }
}

struct Slot {
    refs: u64,
    entry: Arc<Entry>,
}

pub struct OpenFileTable {
    table: Mutex<HashMap<FileIdent, Slot>>,
    /// Total number of write locks ever taken, across all files.
    /// Handles compare against it to detect consecutive writes.
    write_ops: AtomicU64,
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            write_ops: AtomicU64::new(0),
        }
    }

    /// Register one open handle of `ident` and get its shared entry.
    pub fn register(&self, ident: FileIdent) -> Arc<Entry> {
        let mut table = self.table.lock().expect("file table poisoned");
        let slot = table.entry(ident).or_insert_with(|| Slot {
            refs: 0,
            entry: Arc::new(Entry::new()),
        });
        slot.refs += 1;
        Arc::clone(&slot.entry)
    }

    /// Drop one handle of `ident`. The entry is removed with the last one.
    pub fn unregister(&self, ident: FileIdent) {
        let mut table = self.table.lock().expect("file table poisoned");
        let Some(slot) = table.get_mut(&ident) else {
            debug_assert!(false, "unregister of unknown ident {ident}");
            return;
        };
        slot.refs -= 1;
        if slot.refs == 0 {
            table.remove(&ident);
        }
    }

    /// Take the content write lock of `entry` and return the guard plus
    /// the global sequence number of this write operation.
    pub fn write_lock<'a>(&self, entry: &'a Entry) -> (RwLockWriteGuard<'a, ()>, u64) {
        let guard = entry.content.write().expect("content lock poisoned");
        let op = self.write_ops.fetch_add(1, Ordering::SeqCst) + 1;
        (guard, op)
    }

    pub fn write_op_count(&self) -> u64 {
        self.write_ops.load(Ordering::SeqCst)
    }

    /// Number of registered handles for `ident`.
    pub fn open_count(&self, ident: FileIdent) -> u64 {
        let table = self.table.lock().expect("file table poisoned");
        table.get(&ident).map_or(0, |s| s.refs)
    }
}

impl Default for OpenFileTable {
    fn default() -> Self {
        Self::new()
    }
}
