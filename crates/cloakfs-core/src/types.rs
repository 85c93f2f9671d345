use serde::{Deserialize, Serialize};

/// Identity of a backing file: device number + inode number.
///
/// Two open handles on the same backing file always map to the same
/// `FileIdent`, which is what makes it a usable key for write
/// serialization and directory-handle caching. Hard links share one
/// identity and therefore one write lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdent {
    pub dev: u64,
    pub ino: u64,
}

impl FileIdent {
    pub fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }
}

impl std::fmt::Display for FileIdent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev{}:ino{}", self.dev, self.ino)
    }
}
