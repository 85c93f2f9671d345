//! The encrypted file abstraction.
//!
//! `CryptFile` wraps one open descriptor of a ciphertext file and
//! exposes plaintext positioned reads and writes. All offset juggling is
//! delegated to [`ContentEnc`]; this module owns the locking protocol,
//! the file header lifecycle and the read-modify-write cycle for partial
//! blocks.
//!
//! Locking protocol: every handle of the same inode shares one
//! [`Entry`] from the [`OpenFileTable`]. Reads take its lock shared,
//! writes and truncates take it exclusive. Ciphertext blocks are never
//! mutated in place by two writers at once, which AEAD would not
//! forgive.

use std::fs::File;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::sync::Arc;

use tracing::debug;

use cloakfs_core::error::CloakResult;
use cloakfs_core::types::FileIdent;
use cloakfs_crypto::{ContentEnc, FileHeader, FILE_ID_LEN, HEADER_LEN};

use crate::file_table::{Entry, OpenFileTable};

/// `read_at` until `buf` is full or EOF. Returns the bytes read.
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match file.read_at(&mut buf[n..], offset + n as u64) {
            Ok(0) => break,
            Ok(r) => n += r,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

pub struct CryptFile {
    file: File,
    ident: FileIdent,
    entry: Arc<Entry>,
    table: Arc<OpenFileTable>,
    enc: Arc<ContentEnc>,
    /// Sequence number of the last write through this handle, 0 if none.
    last_op: u64,
    /// Plaintext offset of the last byte written through this handle.
    last_written_off: u64,
}

impl CryptFile {
    /// Wrap an already-open ciphertext file and register it in the table.
    pub fn open(file: File, enc: Arc<ContentEnc>, table: Arc<OpenFileTable>) -> CloakResult<Self> {
        let meta = file.metadata()?;
        let ident = FileIdent {
            dev: meta.dev(),
            ino: meta.ino(),
        };
        let entry = table.register(ident);
        Ok(Self {
            file,
            ident,
            entry,
            table,
            enc,
            last_op: 0,
            last_written_off: 0,
        })
    }

    pub fn ident(&self) -> FileIdent {
        self.ident
    }

    /// Current plaintext size.
    pub fn size(&self) -> CloakResult<u64> {
        let entry = Arc::clone(&self.entry);
        let _guard = entry.read_lock();
        let cipher_size = self.file.metadata()?.len();
        Ok(self.enc.cipher_size_to_plain_size(cipher_size))
    }

    /// Read up to `length` plaintext bytes at `offset`. A short result
    /// means EOF was reached.
    pub fn read_at(&self, offset: u64, length: u64) -> CloakResult<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let entry = Arc::clone(&self.entry);
        let _guard = entry.read_lock();
        let Some(id) = self.file_id()? else {
            // No header yet: the file is empty.
            return Ok(Vec::new());
        };
        self.read_range(offset, length, &id)
    }

    /// Write `data` at plaintext offset `offset`. Writes past the current
    /// end of file leave a hole that reads back as zeros.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> CloakResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let entry = Arc::clone(&self.entry);
        let (_guard, op) = self.table.write_lock(&entry);
        let id = self.ensure_file_id()?;

        // Streaming writes through one handle skip the size probe: if
        // this handle performed the immediately preceding write and the
        // new data continues exactly where it left off, there is no hole.
        let consecutive =
            self.last_op != 0 && op == self.last_op + 1 && offset == self.last_written_off + 1;
        if !consecutive {
            self.pad_hole(offset, &id)?;
        }

        let n = self.write_range(offset, data, &id)?;
        self.last_op = op;
        self.last_written_off = offset + data.len() as u64 - 1;
        Ok(n)
    }

    /// Change the plaintext size to `new_size`.
    pub fn truncate(&mut self, new_size: u64) -> CloakResult<()> {
        let entry = Arc::clone(&self.entry);
        let (_guard, _op) = self.table.write_lock(&entry);

        if new_size == 0 {
            self.file.set_len(0)?;
            // The header is gone; the next write mints a new file id.
            *self.entry.id_slot() = None;
            return Ok(());
        }

        let id = self.ensure_file_id()?;
        let cipher_size = self.file.metadata()?.len();
        let old_size = self.enc.cipher_size_to_plain_size(cipher_size);
        if new_size == old_size {
            return Ok(());
        }
        if new_size < old_size {
            self.shrink(new_size, &id)
        } else {
            self.grow(new_size, old_size, &id)
        }
    }

    // ---- internals (content lock held by the caller) ----------------------

    /// Cached file id, reading the header on first use. `None` for a
    /// headerless (empty) file.
    fn file_id(&self) -> CloakResult<Option<[u8; FILE_ID_LEN]>> {
        if let Some(id) = self.entry.cached_id() {
            return Ok(Some(id));
        }
        let mut slot = self.entry.id_slot();
        if let Some(id) = *slot {
            return Ok(Some(id));
        }
        let mut buf = [0u8; HEADER_LEN];
        let n = read_full_at(&self.file, &mut buf, 0)?;
        if n == 0 {
            return Ok(None);
        }
        let header = FileHeader::parse(&buf[..n])?;
        *slot = Some(header.id);
        Ok(Some(header.id))
    }

    /// Like [`file_id`](Self::file_id), but creates the header if the
    /// file has none. Requires the content write lock.
    fn ensure_file_id(&self) -> CloakResult<[u8; FILE_ID_LEN]> {
        if let Some(id) = self.entry.cached_id() {
            return Ok(id);
        }
        let mut slot = self.entry.id_slot();
        if let Some(id) = *slot {
            return Ok(id);
        }
        let mut buf = [0u8; HEADER_LEN];
        let n = read_full_at(&self.file, &mut buf, 0)?;
        if n > 0 {
            let header = FileHeader::parse(&buf[..n])?;
            *slot = Some(header.id);
            return Ok(header.id);
        }
        let header = FileHeader::random();
        debug!(ident = %self.ident, "creating file header");
        if let Err(e) = self.file.write_all_at(&header.pack(), 0) {
            // A torn header would make the whole file unreadable, an
            // empty file is merely empty.
            let _ = self.file.set_len(0);
            return Err(e.into());
        }
        *slot = Some(header.id);
        Ok(header.id)
    }

    fn read_range(&self, offset: u64, length: u64, id: &[u8; FILE_ID_LEN]) -> CloakResult<Vec<u8>> {
        let blocks = self.enc.explode_plain_range(offset, length);
        if blocks.is_empty() {
            return Ok(Vec::new());
        }
        let (coff, clen) = self.enc.joint_ciphertext_range(&blocks);
        let mut ciphertext = vec![0u8; clen as usize];
        let n = read_full_at(&self.file, &mut ciphertext, coff)?;
        ciphertext.truncate(n);
        if ciphertext.is_empty() {
            return Ok(Vec::new());
        }
        let plain = self
            .enc
            .decrypt_blocks(&ciphertext, blocks[0].block_no, id)?;
        let skip = blocks[0].skip as usize;
        if plain.len() <= skip {
            return Ok(Vec::new());
        }
        let end = plain.len().min(skip + length as usize);
        Ok(plain[skip..end].to_vec())
    }

    /// Read-modify-write cycle: partial edge blocks are merged with
    /// their current content, then the whole run is encrypted and
    /// written with one positioned write.
    fn write_range(&self, offset: u64, data: &[u8], id: &[u8; FILE_ID_LEN]) -> CloakResult<usize> {
        let blocks = self.enc.explode_plain_range(offset, data.len() as u64);
        let mut plain_blocks: Vec<Vec<u8>> = Vec::with_capacity(blocks.len());
        let mut consumed = 0usize;
        for b in &blocks {
            let chunk = &data[consumed..consumed + b.length as usize];
            consumed += b.length as usize;
            if b.is_partial(&self.enc) {
                // A decrypt failure here aborts the write: merging into
                // corrupt data would overwrite the evidence.
                let old = self.read_range(b.block_plain_off(&self.enc), self.enc.plain_bs(), id)?;
                plain_blocks.push(self.enc.merge_blocks(&old, chunk, b.skip as usize));
            } else {
                plain_blocks.push(chunk.to_vec());
            }
        }
        let refs: Vec<&[u8]> = plain_blocks.iter().map(|v| v.as_slice()).collect();
        let ciphertext = self.enc.encrypt_blocks(&refs, blocks[0].block_no, id)?;
        let coff = self.enc.block_no_to_cipher_off(blocks[0].block_no);
        self.file.write_all_at(&ciphertext, coff)?;
        Ok(data.len())
    }

    /// Prepare for a write at `offset` that may lie past EOF: complete
    /// the current last block with zeros. The untouched ciphertext range
    /// in between stays sparse and reads back as zero blocks.
    fn pad_hole(&self, offset: u64, id: &[u8; FILE_ID_LEN]) -> CloakResult<()> {
        let cipher_size = self.file.metadata()?.len();
        let plain_size = self.enc.cipher_size_to_plain_size(cipher_size);
        if offset <= plain_size {
            return Ok(());
        }
        // The write lands in the block that already holds EOF: the RMW
        // cycle zero-fills the gap inside that block and the file grows
        // to exactly the written end, so padding would only inflate it.
        if self.enc.plain_off_to_block_no(offset) == self.enc.plain_off_to_block_no(plain_size) {
            return Ok(());
        }
        debug!(offset, plain_size, "write past EOF, padding last block");
        self.zero_pad(plain_size, id)
    }

    /// Extend the last block to a full block of zeros, if it is partial.
    fn zero_pad(&self, plain_size: u64, id: &[u8; FILE_ID_LEN]) -> CloakResult<()> {
        let last_len = plain_size % self.enc.plain_bs();
        if last_len == 0 {
            return Ok(());
        }
        let missing = self.enc.plain_bs() - last_len;
        let zeros = vec![0u8; missing as usize];
        self.write_range(plain_size, &zeros, id)?;
        Ok(())
    }

    fn shrink(&self, new_size: u64, id: &[u8; FILE_ID_LEN]) -> CloakResult<()> {
        let bs = self.enc.plain_bs();
        if new_size % bs == 0 {
            self.file.set_len(self.enc.plain_size_to_cipher_size(new_size))?;
            return Ok(());
        }
        // The new last block shrinks, which changes its ciphertext
        // entirely. Re-encrypt the surviving prefix.
        let last_block_no = new_size / bs;
        let block_off = last_block_no * bs;
        let keep = self.read_range(block_off, new_size - block_off, id)?;
        self.file
            .set_len(self.enc.block_no_to_cipher_off(last_block_no))?;
        self.write_range(block_off, &keep, id)?;
        Ok(())
    }

    fn grow(&self, new_size: u64, old_size: u64, id: &[u8; FILE_ID_LEN]) -> CloakResult<()> {
        let bs = self.enc.plain_bs();
        // Growth confined to the block holding EOF: one zero byte at the
        // new end and the RMW cycle extends the block to exactly
        // new_size. Padding here would round the size up to a full block.
        let old_last = self.enc.plain_off_to_block_no(old_size.saturating_sub(1));
        if old_last == self.enc.plain_off_to_block_no(new_size - 1) {
            self.write_range(new_size - 1, &[0u8], id)?;
            return Ok(());
        }
        if old_size % bs != 0 {
            self.zero_pad(old_size, id)?;
        }
        if new_size % bs == 0 {
            // All added blocks are holes; plain ftruncate produces the
            // all-zero ciphertext blocks that read back as zeros.
            self.file.set_len(self.enc.plain_size_to_cipher_size(new_size))?;
            return Ok(());
        }
        // An all-zero partial trailing block would not parse, so the
        // last block must be real ciphertext. One zero byte at the new
        // end creates it; everything before stays sparse.
        self.write_range(new_size - 1, &[0u8], id)?;
        Ok(())
    }
}

impl Drop for CryptFile {
    fn drop(&mut self) {
        self.table.unregister(self.ident);
    }
}
