//! Extended-attribute storage

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Named binary metadata attached to a file.
pub trait AttributeStore: Send + Sync {
    fn get(&self, path: &Path, name: &str) -> io::Result<Option<Vec<u8>>>;

    fn set(&self, path: &Path, name: &str, value: &[u8]) -> io::Result<()>;

    /// Removing an attribute that isn't there succeeds.
    fn remove(&self, path: &Path, name: &str) -> io::Result<()>;
}

/// OS extended attributes (`setxattr` and friends).
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct XattrStore;

#[cfg(unix)]
impl AttributeStore for XattrStore {
    fn get(&self, path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
        xattr::get(path, name)
    }

    fn set(&self, path: &Path, name: &str, value: &[u8]) -> io::Result<()> {
        xattr::set(path, name, value)
    }

    fn remove(&self, path: &Path, name: &str) -> io::Result<()> {
        if xattr::get(path, name)?.is_none() {
            return Ok(());
        }
        xattr::remove(path, name)
    }
}

/// Attributes kept in process memory. Used where the filesystem has no
/// extended attributes, and in tests.
#[derive(Debug, Default)]
pub struct MemoryAttributeStore {
    attributes: Mutex<HashMap<(PathBuf, String), Vec<u8>>>,
}

impl MemoryAttributeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn ensure_exists(path: &Path) -> io::Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} does not exist", path.display()),
        ))
    }
}

impl AttributeStore for MemoryAttributeStore {
    fn get(&self, path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
        ensure_exists(path)?;
        Ok(self
            .attributes
            .lock()
            .get(&(path.to_path_buf(), name.to_string()))
            .cloned())
    }

    fn set(&self, path: &Path, name: &str, value: &[u8]) -> io::Result<()> {
        ensure_exists(path)?;
        self.attributes
            .lock()
            .insert((path.to_path_buf(), name.to_string()), value.to_vec());
        Ok(())
    }

    fn remove(&self, path: &Path, name: &str) -> io::Result<()> {
        ensure_exists(path)?;
        self.attributes
            .lock()
            .remove(&(path.to_path_buf(), name.to_string()));
        Ok(())
    }
}

/// The platform's native attribute store.
pub fn platform_store() -> Arc<dyn AttributeStore> {
    #[cfg(unix)]
    {
        Arc::new(XattrStore)
    }
    #[cfg(not(unix))]
    {
        tracing::warn!("Extended attributes unavailable; provenance is kept in memory only");
        Arc::new(MemoryAttributeStore::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("a.bin");
        std::fs::write(&file, b"x").unwrap();

        let store = MemoryAttributeStore::new();
        assert_eq!(store.get(&file, "user.test").unwrap(), None);

        store.set(&file, "user.test", b"value").unwrap();
        assert_eq!(store.get(&file, "user.test").unwrap(), Some(b"value".to_vec()));

        store.remove(&file, "user.test").unwrap();
        store.remove(&file, "user.test").unwrap();
        assert_eq!(store.get(&file, "user.test").unwrap(), None);

        let missing = dir.path().join("missing.bin");
        assert!(store.set(&missing, "user.test", b"v").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_xattr_store_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("a.bin");
        std::fs::write(&file, b"x").unwrap();

        let store = XattrStore;
        if store.set(&file, "user.ferry.test", b"1").is_err() {
            // filesystem without user xattrs (some tmpfs/overlay mounts)
            return;
        }
        assert_eq!(store.get(&file, "user.ferry.test").unwrap(), Some(b"1".to_vec()));
        store.remove(&file, "user.ferry.test").unwrap();
        store.remove(&file, "user.ferry.test").unwrap();
        assert_eq!(store.get(&file, "user.ferry.test").unwrap(), None);
    }
}
