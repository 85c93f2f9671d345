//! Block-oriented content encryption.
//!
//! Translates arbitrary plaintext byte ranges into aligned ciphertext
//! block ranges and back. Every plaintext block of `plain_bs` bytes maps
//! to `plain_bs + nonce_len + 16` ciphertext bytes at a fixed offset, so
//! all range math is pure arithmetic and a request touching N blocks
//! needs exactly one positioned storage read or write.

use std::sync::Arc;

use tracing::{debug, warn};

use cloakfs_core::error::{CloakError, CloakResult};

use crate::aead::CryptoCore;
use crate::bpool::BufferPool;
use crate::{FILE_ID_LEN, HEADER_LEN};

/// Largest request the kernel will hand us in one piece. Must be a
/// multiple of the plaintext block size.
pub const MAX_REQUEST_BYTES: u64 = 128 * 1024;

/// One (possibly partial) block's worth of a byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntraBlock {
    /// Block number within the file.
    pub block_no: u64,
    /// Offset of the range start inside the block payload.
    pub skip: u64,
    /// Payload bytes covered in this block.
    pub length: u64,
}

impl IntraBlock {
    /// A partial block requires a read-modify-write cycle.
    pub fn is_partial(&self, enc: &ContentEnc) -> bool {
        self.skip > 0 || self.length < enc.plain_bs
    }

    /// Ciphertext offset of this block.
    pub fn block_cipher_off(&self, enc: &ContentEnc) -> u64 {
        enc.block_no_to_cipher_off(self.block_no)
    }

    /// Plaintext offset of this block.
    pub fn block_plain_off(&self, enc: &ContentEnc) -> u64 {
        enc.block_no_to_plain_off(self.block_no)
    }

    /// Crop a decrypted (possibly short) block down to the part this
    /// descriptor covers.
    pub fn crop<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let skip = self.skip as usize;
        let want = skip + self.length as usize;
        if data.len() < skip {
            return &[];
        }
        if data.len() < want {
            return &data[skip..];
        }
        &data[skip..want]
    }
}

pub struct ContentEnc {
    core: Arc<CryptoCore>,
    plain_bs: u64,
    cipher_bs: u64,
    /// All-zero block of cipher_bs bytes, for the hole fast path.
    all_zero_block: Vec<u8>,
    /// Plaintext-block scratch pool.
    pblock_pool: BufferPool,
    /// Ciphertext-block scratch pool.
    cblock_pool: BufferPool,
}

impl ContentEnc {
    pub fn new(core: Arc<CryptoCore>, plain_bs: u64) -> Self {
        assert!(plain_bs > 0, "zero block size");
        assert_eq!(
            MAX_REQUEST_BYTES % plain_bs,
            0,
            "block size must divide the maximum request size"
        );
        let cipher_bs = plain_bs + core.nonce_len() as u64 + core.overhead() as u64;
        Self {
            all_zero_block: vec![0u8; cipher_bs as usize],
            pblock_pool: BufferPool::new(plain_bs as usize),
            cblock_pool: BufferPool::new(cipher_bs as usize),
            core,
            plain_bs,
            cipher_bs,
        }
    }

    /// Construct with the block size from a validated mount configuration.
    pub fn from_config(core: Arc<CryptoCore>, cfg: &cloakfs_core::MountConfig) -> Self {
        Self::new(core, cfg.plain_block_size)
    }

    pub fn plain_bs(&self) -> u64 {
        self.plain_bs
    }

    pub fn cipher_bs(&self) -> u64 {
        self.cipher_bs
    }

    /// Per-block ciphertext expansion: nonce + tag.
    pub fn block_overhead(&self) -> u64 {
        self.cipher_bs - self.plain_bs
    }

    // ---- offset arithmetic ------------------------------------------------

    pub fn plain_off_to_block_no(&self, plain_off: u64) -> u64 {
        plain_off / self.plain_bs
    }

    pub fn cipher_off_to_block_no(&self, cipher_off: u64) -> u64 {
        (cipher_off - HEADER_LEN as u64) / self.cipher_bs
    }

    pub fn block_no_to_cipher_off(&self, block_no: u64) -> u64 {
        HEADER_LEN as u64 + block_no * self.cipher_bs
    }

    pub fn block_no_to_plain_off(&self, block_no: u64) -> u64 {
        block_no * self.plain_bs
    }

    pub fn plain_off_to_cipher_off(&self, plain_off: u64) -> u64 {
        self.block_no_to_cipher_off(self.plain_off_to_block_no(plain_off))
            + plain_off % self.plain_bs
    }

    /// Plaintext size of a file from its ciphertext size.
    ///
    /// A size of exactly `HEADER_LEN` is an interrupted first write and
    /// counts as empty; anything between 0 and `HEADER_LEN` is corrupt
    /// (logged, best effort 0); a trailing block shorter than the
    /// per-block overhead counts as 1 byte.
    pub fn cipher_size_to_plain_size(&self, cipher_size: u64) -> u64 {
        if cipher_size == 0 {
            return 0;
        }
        if cipher_size == HEADER_LEN as u64 {
            debug!(cipher_size, "file is header-only: interrupted write?");
            return 0;
        }
        if cipher_size < HEADER_LEN as u64 {
            warn!(cipher_size, "file smaller than the header: corrupt");
            return 0;
        }
        let block_count = self.cipher_off_to_block_no(cipher_size - 1) + 1;
        let overhead = self.block_overhead() * block_count + HEADER_LEN as u64;
        match cipher_size.checked_sub(overhead) {
            Some(n) if n > 0 => n,
            _ => {
                // Trailing block truncated inside its nonce/tag. There was
                // plaintext there, so report the minimum instead of erroring.
                warn!(cipher_size, "incomplete trailing block");
                1
            }
        }
    }

    /// Ciphertext size of a file from its plaintext size.
    pub fn plain_size_to_cipher_size(&self, plain_size: u64) -> u64 {
        if plain_size == 0 {
            return 0;
        }
        let block_count = self.plain_off_to_block_no(plain_size - 1) + 1;
        plain_size + self.block_overhead() * block_count + HEADER_LEN as u64
    }

    // ---- range splitting --------------------------------------------------

    /// Partition the plaintext range `[offset, offset+length)` into
    /// contiguous per-block descriptors. Zero length yields an empty list.
    pub fn explode_plain_range(&self, mut offset: u64, mut length: u64) -> Vec<IntraBlock> {
        let mut blocks = Vec::new();
        while length > 0 {
            let block_no = self.plain_off_to_block_no(offset);
            let skip = offset - self.block_no_to_plain_off(block_no);
            let len = length.min(self.plain_bs - skip);
            blocks.push(IntraBlock {
                block_no,
                skip,
                length: len,
            });
            offset += len;
            length -= len;
        }
        blocks
    }

    /// Same, over a ciphertext range (offsets include the file header).
    /// Used when the cipher-side window is driven externally, e.g. when
    /// serving ciphertext views of plaintext files.
    pub fn explode_cipher_range(&self, mut offset: u64, mut length: u64) -> Vec<IntraBlock> {
        debug_assert!(offset >= HEADER_LEN as u64, "range starts inside the header");
        let mut blocks = Vec::new();
        while length > 0 {
            let block_no = self.cipher_off_to_block_no(offset);
            let skip = offset - self.block_no_to_cipher_off(block_no);
            let len = length.min(self.cipher_bs - skip);
            blocks.push(IntraBlock {
                block_no,
                skip,
                length: len,
            });
            offset += len;
            length -= len;
        }
        blocks
    }

    /// Minimal block-aligned ciphertext window covering `blocks`, so a
    /// multi-block request needs a single storage read.
    pub fn joint_ciphertext_range(&self, blocks: &[IntraBlock]) -> (u64, u64) {
        assert!(!blocks.is_empty(), "empty block list");
        let first = &blocks[0];
        let last = &blocks[blocks.len() - 1];
        let offset = self.block_no_to_cipher_off(first.block_no);
        let length = self.block_no_to_cipher_off(last.block_no) + self.cipher_bs - offset;
        (offset, length)
    }

    // ---- block encryption -------------------------------------------------

    fn concat_aad(block_no: u64, file_id: &[u8; FILE_ID_LEN]) -> [u8; 8 + FILE_ID_LEN] {
        let mut aad = [0u8; 8 + FILE_ID_LEN];
        aad[..8].copy_from_slice(&block_no.to_be_bytes());
        aad[8..].copy_from_slice(file_id);
        aad
    }

    /// Encrypt one plaintext block with a fresh random nonce.
    /// Output: `nonce || ciphertext || tag`. Empty in, empty out.
    pub fn encrypt_block(
        &self,
        plaintext: &[u8],
        block_no: u64,
        file_id: &[u8; FILE_ID_LEN],
    ) -> CloakResult<Vec<u8>> {
        let nonce = self.core.nonce_gen.next();
        self.do_encrypt_block(plaintext, block_no, file_id, &nonce)
    }

    /// Encrypt one block with a caller-chosen nonce. Only safe with the
    /// nonce-misuse-resistant backend, hence the hard check.
    pub fn encrypt_block_with_nonce(
        &self,
        plaintext: &[u8],
        block_no: u64,
        file_id: &[u8; FILE_ID_LEN],
        nonce: &[u8],
    ) -> CloakResult<Vec<u8>> {
        assert_eq!(
            self.core.algorithm(),
            cloakfs_core::config::AeadAlgorithm::Aes256Siv,
            "external nonces are only safe in SIV mode"
        );
        self.do_encrypt_block(plaintext, block_no, file_id, nonce)
    }

    fn do_encrypt_block(
        &self,
        plaintext: &[u8],
        block_no: u64,
        file_id: &[u8; FILE_ID_LEN],
        nonce: &[u8],
    ) -> CloakResult<Vec<u8>> {
        if plaintext.is_empty() {
            return Ok(Vec::new());
        }
        assert!(
            plaintext.len() as u64 <= self.plain_bs,
            "oversized plaintext block: {}",
            plaintext.len()
        );
        let aad = Self::concat_aad(block_no, file_id);
        let mut out = self.cblock_pool.get();
        out.extend_from_slice(nonce);
        self.core.seal(&mut out, nonce, plaintext, &aad)?;
        assert_eq!(
            out.len(),
            plaintext.len() + self.block_overhead() as usize,
            "unexpected ciphertext length"
        );
        Ok(out)
    }

    /// Encrypt consecutive blocks starting at `first_block_no` and return
    /// the concatenated ciphertext.
    pub fn encrypt_blocks(
        &self,
        plaintext_blocks: &[&[u8]],
        first_block_no: u64,
        file_id: &[u8; FILE_ID_LEN],
    ) -> CloakResult<Vec<u8>> {
        let mut out = Vec::with_capacity(plaintext_blocks.len() * self.cipher_bs as usize);
        for (i, block) in plaintext_blocks.iter().enumerate() {
            let cblock = self.encrypt_block(block, first_block_no + i as u64, file_id)?;
            out.extend_from_slice(&cblock);
            if cblock.capacity() == self.cblock_pool.buf_size() {
                self.cblock_pool.put(cblock);
            }
        }
        Ok(out)
    }

    /// Verify and decrypt one ciphertext block.
    ///
    /// Corner case: a full-sized block of all-zero bytes decrypts to an
    /// all-zero plaintext block without touching the AEAD. That is the
    /// file-hole representation; an attacker substituting a zero block can
    /// only ever fabricate a hole, which sparse files produce legitimately
    /// anyway. The astronomically improbable collision with a real
    /// ciphertext is an accepted trade-off of the format.
    pub fn decrypt_block(
        &self,
        ciphertext: &[u8],
        block_no: u64,
        file_id: &[u8; FILE_ID_LEN],
    ) -> CloakResult<Vec<u8>> {
        if ciphertext.is_empty() {
            return Ok(Vec::new());
        }
        if ciphertext == self.all_zero_block {
            debug!(block_no, "file hole encountered");
            return Ok(vec![0u8; self.plain_bs as usize]);
        }
        let nonce_len = self.core.nonce_len();
        if ciphertext.len() < nonce_len {
            warn!(len = ciphertext.len(), block_no, "block too short");
            return Err(CloakError::BlockTooShort {
                len: ciphertext.len(),
            });
        }
        let (nonce, body) = ciphertext.split_at(nonce_len);
        if nonce.iter().all(|&b| b == 0) {
            return Err(CloakError::AllZeroNonce);
        }
        let aad = Self::concat_aad(block_no, file_id);
        let mut out = self.pblock_pool.get();
        match self.core.open(&mut out, nonce, body, &aad) {
            Ok(()) => Ok(out),
            Err(e) => {
                self.pblock_pool.put(out);
                Err(e)
            }
        }
    }

    /// Decrypt a run of consecutive blocks, stopping at the first failure.
    pub fn decrypt_blocks(
        &self,
        ciphertext: &[u8],
        first_block_no: u64,
        file_id: &[u8; FILE_ID_LEN],
    ) -> CloakResult<Vec<u8>> {
        let mut out = Vec::with_capacity(
            ciphertext.len() / self.cipher_bs as usize * self.plain_bs as usize + self.plain_bs as usize,
        );
        let mut block_no = first_block_no;
        for cblock in ciphertext.chunks(self.cipher_bs as usize) {
            let pblock = match self.decrypt_block(cblock, block_no, file_id) {
                Ok(p) => p,
                Err(e) => {
                    warn!(block_no, error = %e, "decrypt failed");
                    return Err(e);
                }
            };
            out.extend_from_slice(&pblock);
            if pblock.capacity() == self.pblock_pool.buf_size() {
                self.pblock_pool.put(pblock);
            }
            block_no += 1;
        }
        Ok(out)
    }

    /// Overlay `new_data` onto `old_data` at `offset` within one block.
    /// The result length is `max(old_len, offset + new_len)`, capped at a
    /// full block.
    pub fn merge_blocks(&self, old_data: &[u8], new_data: &[u8], offset: usize) -> Vec<u8> {
        // Fast path for small-file creation.
        if old_data.is_empty() && offset == 0 {
            return new_data.to_vec();
        }
        assert!(
            offset + new_data.len() <= self.plain_bs as usize,
            "merge exceeds block size"
        );
        let mut out = vec![0u8; self.plain_bs as usize];
        out[..old_data.len()].copy_from_slice(old_data);
        out[offset..offset + new_data.len()].copy_from_slice(new_data);
        let out_len = old_data.len().max(offset + new_data.len());
        out.truncate(out_len);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::MasterKey;
    use crate::{DEFAULT_PLAIN_BS, KEY_SIZE, TAG_SIZE};
    use cloakfs_core::config::AeadAlgorithm;
    use proptest::prelude::*;

    fn engine() -> ContentEnc {
        let master = MasterKey::from_bytes([1u8; KEY_SIZE]);
        let core = Arc::new(CryptoCore::new(&master, AeadAlgorithm::Aes256Gcm, true));
        ContentEnc::new(core, DEFAULT_PLAIN_BS)
    }

    #[test]
    fn cipher_bs_is_plain_plus_overhead() {
        let enc = engine();
        assert_eq!(enc.cipher_bs(), 4096 + 16 + TAG_SIZE as u64);
    }

    #[test]
    fn from_config_uses_configured_block_size() {
        let master = MasterKey::from_bytes([1u8; KEY_SIZE]);
        let cfg = cloakfs_core::MountConfig {
            plain_block_size: 2048,
            ..Default::default()
        };
        let core = Arc::new(CryptoCore::from_config(&master, &cfg));
        let enc = ContentEnc::from_config(core, &cfg);
        assert_eq!(enc.plain_bs(), 2048);
        assert_eq!(enc.cipher_bs(), 2048 + 16 + TAG_SIZE as u64);
    }

    #[test]
    fn block_roundtrip_reference_vector() {
        // 4096 bytes of 0x41 at block 0 under an all-zero file id.
        let enc = engine();
        let plain = vec![0x41u8; 4096];
        let file_id = [0u8; FILE_ID_LEN];
        let ct = enc.encrypt_block(&plain, 0, &file_id).unwrap();
        assert_eq!(ct.len() as u64, enc.cipher_bs());
        assert_eq!(enc.decrypt_block(&ct, 0, &file_id).unwrap(), plain);

        let mut corrupt = ct.clone();
        corrupt[0] ^= 1;
        assert!(enc.decrypt_block(&corrupt, 0, &file_id).is_err());
    }

    #[test]
    fn wrong_block_no_or_file_id_fails() {
        let enc = engine();
        let file_id = [3u8; FILE_ID_LEN];
        let ct = enc.encrypt_block(b"data", 5, &file_id).unwrap();
        assert!(enc.decrypt_block(&ct, 6, &file_id).is_err());
        assert!(enc.decrypt_block(&ct, 5, &[4u8; FILE_ID_LEN]).is_err());
        assert_eq!(enc.decrypt_block(&ct, 5, &file_id).unwrap(), b"data");
    }

    #[test]
    fn byte_flip_first_and_last_always_fails() {
        let enc = engine();
        let file_id = [9u8; FILE_ID_LEN];
        let ct = enc.encrypt_block(&[0xAB; 100], 1, &file_id).unwrap();
        for pos in [0, ct.len() - 1] {
            let mut bad = ct.clone();
            bad[pos] ^= 0xFF;
            assert!(
                enc.decrypt_block(&bad, 1, &file_id).is_err(),
                "flip at {} must fail",
                pos
            );
        }
    }

    #[test]
    fn empty_block_maps_to_empty() {
        let enc = engine();
        let file_id = [0u8; FILE_ID_LEN];
        assert!(enc.encrypt_block(&[], 0, &file_id).unwrap().is_empty());
        assert!(enc.decrypt_block(&[], 0, &file_id).unwrap().is_empty());
    }

    #[test]
    fn all_zero_block_is_a_hole() {
        let enc = engine();
        let zeros = vec![0u8; enc.cipher_bs() as usize];
        let plain = enc.decrypt_block(&zeros, 7, &[1u8; FILE_ID_LEN]).unwrap();
        assert_eq!(plain, vec![0u8; enc.plain_bs() as usize]);
    }

    #[test]
    fn all_zero_nonce_is_rejected() {
        let enc = engine();
        // Non-zero body so the hole fast path does not trigger.
        let mut ct = vec![0u8; enc.cipher_bs() as usize];
        *ct.last_mut().unwrap() = 1;
        assert!(matches!(
            enc.decrypt_block(&ct, 0, &[0u8; FILE_ID_LEN]),
            Err(CloakError::AllZeroNonce)
        ));
    }

    #[test]
    fn truncated_block_is_too_short() {
        let enc = engine();
        assert!(matches!(
            enc.decrypt_block(&[1, 2, 3], 0, &[0u8; FILE_ID_LEN]),
            Err(CloakError::BlockTooShort { len: 3 })
        ));
    }

    #[test]
    fn blocks_roundtrip_and_short_circuit() {
        let enc = engine();
        let file_id = [2u8; FILE_ID_LEN];
        let b0 = vec![1u8; 4096];
        let b1 = vec![2u8; 4096];
        let b2 = vec![3u8; 100];
        let ct = enc
            .encrypt_blocks(&[&b0, &b1, &b2], 0, &file_id)
            .unwrap();
        let plain = enc.decrypt_blocks(&ct, 0, &file_id).unwrap();
        assert_eq!(plain.len(), 4096 + 4096 + 100);
        assert_eq!(&plain[..4096], &b0[..]);
        assert_eq!(&plain[8192..], &b2[..]);

        let mut bad = ct.clone();
        bad[enc.cipher_bs() as usize + 20] ^= 1; // corrupt block 1
        assert!(enc.decrypt_blocks(&bad, 0, &file_id).is_err());
    }

    #[test]
    fn size_conversion_corner_cases() {
        let enc = engine();
        assert_eq!(enc.cipher_size_to_plain_size(0), 0);
        assert_eq!(enc.cipher_size_to_plain_size(HEADER_LEN as u64), 0);
        assert_eq!(enc.cipher_size_to_plain_size(HEADER_LEN as u64 - 1), 0);
        assert_eq!(enc.plain_size_to_cipher_size(0), 0);
        // One full block.
        assert_eq!(
            enc.plain_size_to_cipher_size(4096),
            HEADER_LEN as u64 + enc.cipher_bs()
        );
        // Trailing block truncated inside its overhead counts as 1 byte.
        assert_eq!(enc.cipher_size_to_plain_size(HEADER_LEN as u64 + 10), 1);
    }

    #[test]
    fn merge_blocks_semantics() {
        let enc = engine();
        assert_eq!(enc.merge_blocks(&[], b"new", 0), b"new");
        assert_eq!(enc.merge_blocks(b"abcdef", b"XY", 2), b"abXYef");
        // Extension past the old end.
        assert_eq!(enc.merge_blocks(b"ab", b"XY", 4), b"ab\0\0XY");
    }

    #[test]
    fn explode_zero_length_is_empty() {
        let enc = engine();
        assert!(enc.explode_plain_range(1234, 0).is_empty());
    }

    #[test]
    fn joint_range_covers_and_aligns() {
        let enc = engine();
        for (off, len) in [(0u64, 70000u64), (0, 10), (234, 6511), (65444, 54)] {
            let blocks = enc.explode_plain_range(off, len);
            let (aoff, alen) = enc.joint_ciphertext_range(&blocks);
            assert!(alen >= len);
            assert_eq!((aoff - HEADER_LEN as u64) % enc.cipher_bs(), 0);
            if off % enc.plain_bs() != 0 {
                assert!(blocks[0].skip > 0);
            }
        }
    }

    #[test]
    fn explode_cipher_range_tiles() {
        let enc = engine();
        let off = HEADER_LEN as u64 + 100;
        let blocks = enc.explode_cipher_range(off, 3 * enc.cipher_bs());
        let total: u64 = blocks.iter().map(|b| b.length).sum();
        assert_eq!(total, 3 * enc.cipher_bs());
        assert_eq!(blocks[0].skip, 100);
    }

    proptest! {
        #[test]
        fn explode_plain_range_tiles_exactly(
            offset in 0u64..1 << 40,
            length in 0u64..MAX_REQUEST_BYTES,
        ) {
            let enc = engine();
            let blocks = enc.explode_plain_range(offset, length);
            let mut cursor = offset;
            let mut last_block_no = None;
            for b in &blocks {
                prop_assert!(b.length >= 1 && b.length <= enc.plain_bs());
                prop_assert!(b.skip < enc.plain_bs());
                prop_assert_eq!(enc.block_no_to_plain_off(b.block_no) + b.skip, cursor);
                if let Some(prev) = last_block_no {
                    prop_assert_eq!(b.block_no, prev + 1);
                }
                last_block_no = Some(b.block_no);
                cursor += b.length;
            }
            prop_assert_eq!(cursor, offset + length);
        }

        #[test]
        fn size_conversions_roundtrip(plain_size in 0u64..1 << 40) {
            let enc = engine();
            prop_assert_eq!(
                enc.cipher_size_to_plain_size(enc.plain_size_to_cipher_size(plain_size)),
                plain_size
            );
        }

        #[test]
        fn block_roundtrip_any_length(
            len in 0usize..=4096,
            block_no in 0u64..1 << 32,
            id_byte in any::<u8>(),
        ) {
            let enc = engine();
            let file_id = [id_byte; FILE_ID_LEN];
            let plain = vec![0x5Au8; len];
            let ct = enc.encrypt_block(&plain, block_no, &file_id).unwrap();
            let back = enc.decrypt_block(&ct, block_no, &file_id).unwrap();
            prop_assert_eq!(back, plain);
        }
    }
}
