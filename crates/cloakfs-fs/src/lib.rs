//! cloakfs-fs: the storage layer of the overlay.
//!
//! Sits between a kernel-filesystem adapter and cloakfs-crypto. Owns
//! everything that touches file descriptors: fd-relative syscall
//! wrappers, per-directory IV files, a small cache of directory handles,
//! the table that serializes writers per inode, and the encrypted file
//! read/write/truncate path.

pub mod dircache;
pub mod diriv;
pub mod file;
pub mod file_table;
pub mod longname;
pub mod openat;

pub use dircache::DirCache;
pub use diriv::{create_dir_iv_at, read_dir_iv_at, DIRIV_NAME};
pub use file::CryptFile;
pub use file_table::{Entry, OpenFileTable};
pub use longname::{delete_long_name_at, read_long_name_at, write_long_name_at};
