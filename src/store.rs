//! File Store - reads and writes for file-backed nodes and outputs

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub modified: Option<SystemTime>,
}

pub trait FileStore {
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn write_file(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;
    fn stat(&self, path: &Path) -> io::Result<FileStat>;

    /// Where a relative path actually lives; memory-mapped reads need it.
    fn locate(&self, path: &Path) -> PathBuf {
        path.to_path_buf()
    }
}

/// Filesystem store resolving relative paths against a base directory
/// (usually the directory holding the declaration).
#[derive(Debug, Clone, Default)]
pub struct FsStore {
    base: Option<PathBuf>,
}

impl FsStore {
    pub fn new() -> Self {
        Self { base: None }
    }

    pub fn rooted(base: impl Into<PathBuf>) -> Self {
        Self {
            base: Some(base.into()),
        }
    }
}

impl FileStore for FsStore {
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(self.locate(path))
    }

    fn write_file(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let full = self.locate(path);
        if let Some(parent) = full.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(full, bytes)
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let meta = fs::metadata(self.locate(path))?;
        Ok(FileStat {
            size: meta.len(),
            modified: meta.modified().ok(),
        })
    }

    fn locate(&self, path: &Path) -> PathBuf {
        match &self.base {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

/// In-memory store with a logical clock standing in for mtimes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: Mutex<HashMap<PathBuf, (Vec<u8>, u64)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, bytes: Vec<u8>) {
        if let Ok(mut files) = self.files.lock() {
            let path = path.into();
            let version = files.get(&path).map_or(1, |(_, v)| v + 1);
            files.insert(path, (bytes, version));
        }
    }

    fn not_found(path: &Path) -> io::Error {
        io::Error::new(io::ErrorKind::NotFound, format!("{} not in store", path.display()))
    }

    fn poisoned() -> io::Error {
        io::Error::new(io::ErrorKind::Other, "memory store lock poisoned")
    }
}

impl FileStore for MemoryStore {
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        let files = self.files.lock().map_err(|_| Self::poisoned())?;
        files
            .get(path)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| Self::not_found(path))
    }

    fn write_file(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        self.insert(path, bytes.to_vec());
        Ok(())
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let files = self.files.lock().map_err(|_| Self::poisoned())?;
        let (bytes, version) = files.get(path).ok_or_else(|| Self::not_found(path))?;
        Ok(FileStat {
            size: bytes.len() as u64,
            modified: Some(SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(*version)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::rooted(dir.path());
        store.write_file(Path::new("out/image.bin"), &[1, 2, 3]).unwrap();
        assert_eq!(store.read_file(Path::new("out/image.bin")).unwrap(), vec![1, 2, 3]);
        assert_eq!(store.stat(Path::new("out/image.bin")).unwrap().size, 3);
    }

    #[test]
    fn test_memory_store_bumps_mtime_on_write() {
        let store = MemoryStore::new();
        store.insert("key.bin", vec![0; 16]);
        let first = store.stat(Path::new("key.bin")).unwrap().modified;
        store.insert("key.bin", vec![1; 16]);
        let second = store.stat(Path::new("key.bin")).unwrap().modified;
        assert_ne!(first, second);
        assert!(store.read_file(Path::new("missing")).is_err());
    }
}
