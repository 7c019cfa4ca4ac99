//! Verified image cache on local disk.
//!
//! Entries live at `<dir>/<name>-<checksum>.img` and only ever appear there
//! by atomic rename of a fully verified staging file, so a reader can never
//! observe a partial download as a hit.

use crate::manifest::ImageDescriptor;
use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use tempfile::NamedTempFile;

const BUFFER_SIZE: usize = 64 * 1024;
const ENTRY_EXT: &str = "img";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub checksum: String,
    pub len: u64,
    pub path: PathBuf,
}

/// Lowercase hex SHA-256 of a file.
pub fn file_checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug)]
pub struct CacheStore {
    dir: PathBuf,
    /// Live writer locks; an entry dies with the last holder.
    writers: Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl CacheStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(Error::storage)?;
        Ok(Self {
            dir,
            writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, image: &ImageDescriptor) -> PathBuf {
        self.dir.join(format!("{}.{}", image.cache_key(), ENTRY_EXT))
    }

    /// Returns the entry for `image` if one is present and intact.
    ///
    /// The length is always checked; with `verify` the checksum is recomputed
    /// too. A damaged entry is removed and reported as a miss.
    pub fn lookup(&self, image: &ImageDescriptor, verify: bool) -> Result<Option<CacheEntry>> {
        let path = self.path_for(image);
        let len = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if len != image.size {
            tracing::warn!(
                "cache entry {} has {} bytes, expected {}; discarding",
                path.display(),
                len,
                image.size
            );
            self.discard(&path);
            return Ok(None);
        }
        if verify {
            let actual = file_checksum(&path)?;
            if actual != image.checksum {
                tracing::warn!("cache entry {} fails checksum; discarding", path.display());
                self.discard(&path);
                return Ok(None);
            }
        }

        tracing::debug!("cache hit for {}", image.name);
        Ok(Some(CacheEntry {
            checksum: image.checksum.clone(),
            len,
            path,
        }))
    }

    fn discard(&self, path: &Path) {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("failed to remove {}: {}", path.display(), e);
        }
    }

    /// Lock that keeps a cache key single-writer within this process.
    pub fn writer_lock(&self, image: &ImageDescriptor) -> Arc<Mutex<()>> {
        let mut writers = self.writers.lock().unwrap_or_else(|e| e.into_inner());
        writers.retain(|_, lock| lock.strong_count() > 0);
        let key = image.cache_key();
        if let Some(lock) = writers.get(&key).and_then(Weak::upgrade) {
            return lock;
        }
        let lock = Arc::new(Mutex::new(()));
        writers.insert(key, Arc::downgrade(&lock));
        lock
    }

    /// A fresh staging file next to the entries, so committing is a rename.
    pub fn stage(&self) -> Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix(".staging-")
            .tempfile_in(&self.dir)
            .map_err(Error::storage)
    }

    /// Publishes a verified staging file as the entry for `image`.
    pub fn commit(&self, staged: NamedTempFile, image: &ImageDescriptor) -> Result<CacheEntry> {
        let path = self.path_for(image);
        staged
            .persist(&path)
            .map_err(|e| Error::storage(e.error))?;
        tracing::info!("cached {} at {}", image.name, path.display());
        Ok(CacheEntry {
            checksum: image.checksum.clone(),
            len: image.size,
            path,
        })
    }

    /// Bytes held by committed entries.
    pub fn usage(&self) -> Result<u64> {
        let mut used = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.path().extension().is_some_and(|ext| ext == ENTRY_EXT) {
                used += entry.metadata()?.len();
            }
        }
        Ok(used)
    }

    /// Removes every entry and leftover staging file. Returns bytes freed.
    pub fn clear(&self) -> Result<u64> {
        let mut freed = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let ours = path.extension().is_some_and(|ext| ext == ENTRY_EXT)
                || name.starts_with(".staging-");
            if !ours || !entry.file_type()?.is_file() {
                continue;
            }
            freed += entry.metadata()?.len();
            std::fs::remove_file(&path)?;
        }
        tracing::info!("cleared {} bytes from {}", freed, self.dir.display());
        Ok(freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const EMPTY_SHA: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const ABC_SHA: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    fn image(size: u64, checksum: &str) -> ImageDescriptor {
        ImageDescriptor {
            name: "boot".into(),
            url: "file:///boot.img".into(),
            size,
            checksum: checksum.into(),
            compressed: false,
            sparse: false,
            partition_size: None,
        }
    }

    #[test]
    fn staged_file_is_invisible_until_commit() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        let image = image(3, ABC_SHA);

        let mut staged = store.stage().unwrap();
        staged.write_all(b"abc").unwrap();
        assert_eq!(store.lookup(&image, true).unwrap(), None);

        let entry = store.commit(staged, &image).unwrap();
        assert_eq!(entry.path, dir.path().join(format!("boot-{}.img", ABC_SHA)));
        assert_eq!(store.lookup(&image, true).unwrap(), Some(entry));
    }

    #[test]
    fn damaged_entry_is_discarded() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        let image = image(3, ABC_SHA);
        let path = store.path_for(&image);

        std::fs::write(&path, b"ab").unwrap();
        assert_eq!(store.lookup(&image, false).unwrap(), None);
        assert!(!path.exists());

        std::fs::write(&path, b"abd").unwrap();
        assert!(store.lookup(&image, false).unwrap().is_some());
        assert_eq!(store.lookup(&image, true).unwrap(), None);
        assert!(!path.exists());
    }

    #[test]
    fn checksum_of_empty_file() {
        let file = NamedTempFile::new().unwrap();
        assert_eq!(file_checksum(file.path()).unwrap(), EMPTY_SHA);
    }

    #[test]
    fn clear_removes_entries_only() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("boot-x.img"), b"1234").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"keep").unwrap();
        assert_eq!(store.clear().unwrap(), 4);
        assert!(dir.path().join("notes.txt").exists());
        assert!(!dir.path().join("boot-x.img").exists());
    }

    #[test]
    fn writer_lock_is_shared_per_key() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        let a = store.writer_lock(&image(3, ABC_SHA));
        let b = store.writer_lock(&image(3, ABC_SHA));
        let c = store.writer_lock(&image(0, EMPTY_SHA));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn released_writer_locks_are_forgotten() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        for n in 0..50u32 {
            let lock = store.writer_lock(&image(3, &format!("{:064x}", n)));
            drop(lock.lock().unwrap());
        }
        let held = store.writer_lock(&image(3, ABC_SHA));
        assert_eq!(store.writers.lock().unwrap().len(), 1);
        assert!(Arc::ptr_eq(&held, &store.writer_lock(&image(3, ABC_SHA))));
    }
}
