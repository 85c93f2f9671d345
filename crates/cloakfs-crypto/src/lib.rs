//! cloakfs-crypto: the encryption engine behind the overlay.
//!
//! Ciphertext file layout (binary):
//! ```text
//! [ header: version (2 bytes BE) || file_id (16 random bytes) ]
//! [ block 0: nonce || AEAD(plaintext, aad = block_no (8 bytes BE) || file_id) ]
//! [ block 1 ] ...
//! ```
//!
//! Each 4096-byte plaintext block becomes `4096 + nonce_len + 16` bytes of
//! ciphertext. The AAD binds every block to its position and its file, so
//! blocks can neither be reordered within a file nor spliced between files.
//! A file of exactly header length is logically empty (interrupted first
//! write); an all-zero ciphertext block is a file hole.
//!
//! Key hierarchy (HKDF-SHA256 from the 32-byte master key):
//! ```text
//! Master Key
//!   ├── Content key  (domain "cloakfs-content-<algo>", AEAD for file blocks)
//!   └── Name key     (domain "cloakfs-names-siv", deterministic AES-SIV,
//!                     tweaked per directory by its DirIV)
//! ```

pub mod aead;
pub mod bpool;
pub mod content;
pub mod header;
pub mod kdf;
pub mod names;
pub mod nonce;
pub mod pad;

pub use aead::CryptoCore;
pub use content::{ContentEnc, IntraBlock};
pub use header::FileHeader;
pub use kdf::MasterKey;
pub use names::{DirIvSource, LongNameKind, NameTransform};
pub use nonce::{random_bytes, NonceGenerator};

/// Master key length in bytes (256-bit).
pub const KEY_SIZE: usize = 32;

/// Authentication tag length in bytes, identical for all backends.
pub const TAG_SIZE: usize = 16;

/// Length of the random per-file id in the file header.
pub const FILE_ID_LEN: usize = 16;

/// Total length of the per-file header: version (2) + id (16).
pub const HEADER_LEN: usize = 2 + FILE_ID_LEN;

/// Default plaintext block size in bytes.
pub const DEFAULT_PLAIN_BS: u64 = 4096;

/// Length of a per-directory IV.
pub const DIR_IV_LEN: usize = 16;
