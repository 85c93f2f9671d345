//! Small cache of directory handles and their IVs.
//!
//! Path resolution re-reads `cloakfs.diriv` for every component, which
//! makes a deep tree walk quadratic in syscalls. Directory accesses
//! cluster heavily on the last few directories touched, so a handful of
//! slots already absorbs almost all repeat lookups. Entries are keyed by
//! device/inode identity and hold a duplicated descriptor, so a cached
//! handle stays valid across renames of the directory and cannot outlive
//! its slot: both store and lookup hand out fresh duplicates.
//!
//! A background sweeper clears the whole cache periodically. That bounds
//! how long a deleted directory's descriptor (and disk space) can be
//! pinned by the cache.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::debug;

use cloakfs_core::types::FileIdent;
use cloakfs_crypto::DIR_IV_LEN;

/// Number of cache slots. Directory accesses are bursty on a couple of
/// directories at a time, so a few slots go a long way.
const SLOTS: usize = 3;

/// Interval of the background sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Slot {
    ident: FileIdent,
    fd: OwnedFd,
    iv: [u8; DIR_IV_LEN],
}

#[derive(Default)]
struct Inner {
    slots: [Option<Slot>; SLOTS],
    /// Round-robin eviction cursor.
    next: usize,
    lookups: u64,
    hits: u64,
}

pub struct DirCache {
    inner: Arc<Mutex<Inner>>,
}

impl DirCache {
    /// Create the cache and start its background sweeper. The sweeper
    /// holds only a weak reference and exits once the cache is dropped.
    pub fn new() -> Self {
        let inner = Arc::new(Mutex::new(Inner::default()));
        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&inner);
        std::thread::Builder::new()
            .name("cloakfs-dircache-sweep".into())
            .spawn(move || loop {
                std::thread::sleep(SWEEP_INTERVAL);
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let mut inner = inner.lock().expect("dircache poisoned");
                let (hits, lookups) = (inner.hits, inner.lookups);
                inner.slots = Default::default();
                debug!(hits, lookups, "directory cache swept");
            })
            .expect("spawning dircache sweeper");
        Self { inner }
    }

    /// Cache the directory open at `fd` under its identity. The
    /// descriptor is duplicated; the caller keeps ownership of `fd`.
    pub fn store(
        &self,
        ident: FileIdent,
        fd: BorrowedFd<'_>,
        iv: [u8; DIR_IV_LEN],
    ) -> std::io::Result<()> {
        let dup = fd.try_clone_to_owned()?;
        let mut inner = self.inner.lock().expect("dircache poisoned");
        // Overwrite an existing entry for the same directory in place.
        let idx = inner
            .slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.ident == ident))
            .unwrap_or_else(|| {
                let idx = inner.next;
                inner.next = (inner.next + 1) % SLOTS;
                idx
            });
        inner.slots[idx] = Some(Slot { ident, fd: dup, iv });
        Ok(())
    }

    /// Look up a directory by identity. Returns a duplicated descriptor
    /// and the IV, or `None` on a miss (including dup failure).
    pub fn lookup(&self, ident: FileIdent) -> Option<(OwnedFd, [u8; DIR_IV_LEN])> {
        let mut inner = self.inner.lock().expect("dircache poisoned");
        inner.lookups += 1;
        let slot = inner
            .slots
            .iter()
            .flatten()
            .find(|s| s.ident == ident)?;
        let dup = slot.fd.as_fd().try_clone_to_owned().ok()?;
        let iv = slot.iv;
        inner.hits += 1;
        Some((dup, iv))
    }

    /// Drop all entries, e.g. after unlinking a cached directory.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("dircache poisoned");
        inner.slots = Default::default();
    }
}

impl Default for DirCache {
    fn default() -> Self {
        Self::new()
    }
}
