//! cloakfs-core: shared types, mount configuration and error taxonomy.
//!
//! Everything here is consumed by both the crypto engine (cloakfs-crypto)
//! and the storage-facing layer (cloakfs-fs). This crate performs no I/O
//! and no cryptography.

pub mod config;
pub mod error;
pub mod types;

pub use config::{AeadAlgorithm, FeatureFlag, MountConfig, ScryptParams};
pub use error::{CloakError, CloakResult};
pub use types::FileIdent;
