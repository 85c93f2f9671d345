//! Pooled nonce generation.
//!
//! Fetching a handful of bytes from the OS random source per block is slow;
//! a background producer delivers 512-byte batches over a bounded channel
//! and a mutex-protected pool hands them out in nonce-sized pieces. Nonce
//! uniqueness rests on randomness alone: at 128 bits or more, the birthday
//! bound stays astronomically far away for any realistic file or mount
//! lifetime, and unlike a persisted counter this survives crashes and
//! restarts with no durable state.

use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Mutex;
use std::thread;

use rand::rngs::OsRng;
use rand::RngCore;

/// Batch size delivered by the refill thread. Large enough to amortize the
/// OS round trip, small enough to keep little unused randomness around.
const PREFETCH_BYTES: usize = 512;

/// Fetch `n` bytes from the OS random source directly, bypassing the pool.
/// Used for one-off values: file ids, directory IVs, salts.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}

pub struct NonceGenerator {
    nonce_len: usize,
    inner: Mutex<Pool>,
}

struct Pool {
    buf: Vec<u8>,
    pos: usize,
    refill: Receiver<Vec<u8>>,
    last: Vec<u8>,
}

impl NonceGenerator {
    /// Create a generator for `nonce_len`-byte nonces and start its refill
    /// thread. The thread blocks on the bounded channel between requests
    /// and exits once the generator is dropped.
    pub fn new(nonce_len: usize) -> Self {
        assert!(
            nonce_len >= 16,
            "nonces below 128 bits cannot rely on randomness for uniqueness"
        );
        let (tx, rx): (SyncSender<Vec<u8>>, Receiver<Vec<u8>>) = mpsc::sync_channel(1);
        thread::Builder::new()
            .name("cloakfs-nonce-refill".into())
            .spawn(move || loop {
                let mut batch = vec![0u8; PREFETCH_BYTES];
                OsRng.fill_bytes(&mut batch);
                if tx.send(batch).is_err() {
                    // Generator dropped, wind down.
                    return;
                }
            })
            .expect("spawning nonce refill thread");
        Self {
            nonce_len,
            inner: Mutex::new(Pool {
                buf: Vec::new(),
                pos: 0,
                refill: rx,
                last: Vec::new(),
            }),
        }
    }

    pub fn nonce_len(&self) -> usize {
        self.nonce_len
    }

    /// Return a fresh random nonce.
    pub fn next(&self) -> Vec<u8> {
        let mut pool = self.inner.lock().expect("nonce pool poisoned");
        if pool.buf.len() - pool.pos < self.nonce_len {
            // Pool exhausted; any leftover tail is discarded.
            let batch = pool
                .refill
                .recv()
                .expect("nonce refill thread died");
            assert_eq!(batch.len(), PREFETCH_BYTES, "short refill batch");
            pool.buf = batch;
            pool.pos = 0;
        }
        let nonce = pool.buf[pool.pos..pool.pos + self.nonce_len].to_vec();
        pool.pos += self.nonce_len;
        // Two identical nonces in a row mean the random source is broken.
        // Continuing would reuse (key, nonce) pairs, so die loudly.
        assert!(nonce != pool.last, "random source produced a repeated nonce");
        pool.last = nonce.clone();
        nonce
    }
}
