//! Image acquisition, verification and caching.
//!
//! [`ImageManager::prepare`] turns a manifest entry into a verified cache
//! entry, downloading and decompressing it only on a miss. The checksum is
//! computed over the decompressed bytes while they are staged, and nothing is
//! committed unless length and checksum both match. A hit is re-hashed before
//! it is handed out, so a cached file damaged on disk is fetched again.
//! [`ImageManager::chunks`] then streams the entry back in bounded pieces.

pub mod cache;
pub mod chunk;
pub mod source;
pub mod sparse;

pub use cache::{CacheEntry, CacheStore};
pub use chunk::{ChunkPlan, ChunkStream, ImageChunk};
pub use source::{DefaultSource, FileSource, HttpSource, ImageSource};

use crate::manifest::{ImageDescriptor, Manifest};
use crate::utils::Utils;
use crate::{Error, Result};
use chunk::RawReader;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use sparse::SparseReader;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

const COPY_BUFFER: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct ImageConfig {
    pub cache_dir: PathBuf,
    /// Largest chunk handed out by [`ImageManager::chunks`].
    pub chunk_size: usize,
    /// Chunks buffered ahead of the consumer.
    pub queue_depth: usize,
    /// Upper bound for the cache directory, in bytes.
    pub quota: Option<u64>,
}

impl ImageConfig {
    pub fn default_cache_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("qdlflash")
            .join("images")
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            cache_dir: Self::default_cache_dir(),
            chunk_size: crate::protocol::engine::DEFAULT_CHUNK_SIZE,
            queue_depth: 4,
            quota: None,
        }
    }
}

/// A manifest image whose verified payload sits in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedImage {
    pub descriptor: ImageDescriptor,
    pub entry: CacheEntry,
    /// Whether this call had to fetch the image.
    pub fetched: bool,
}

pub struct ImageManager {
    config: ImageConfig,
    cache: CacheStore,
    source: Arc<dyn ImageSource>,
}

impl ImageManager {
    /// Manager fetching over HTTP or from local files.
    pub fn new(config: ImageConfig) -> Result<Self> {
        Self::with_source(config, Arc::new(DefaultSource::new()?))
    }

    pub fn with_source(config: ImageConfig, source: Arc<dyn ImageSource>) -> Result<Self> {
        let cache = CacheStore::open(&config.cache_dir)?;
        tracing::debug!("image cache at {}", cache.dir().display());
        Ok(Self {
            config,
            cache,
            source,
        })
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Whether an entry of the right length exists. Cheap; [`prepare`](Self::prepare)
    /// still re-hashes it.
    pub fn is_cached(&self, image: &ImageDescriptor) -> Result<bool> {
        Ok(self.cache.lookup(image, false)?.is_some())
    }

    /// Bytes that still have to be downloaded for `manifest`.
    pub fn missing_bytes(&self, manifest: &Manifest) -> Result<u64> {
        let mut missing = 0;
        for image in &manifest.images {
            if !self.is_cached(image)? {
                missing += image.size;
            }
        }
        Ok(missing)
    }

    fn ensure_room(&self, needed: u64) -> Result<()> {
        let Some(quota) = self.config.quota else {
            return Ok(());
        };
        let used = self.cache.usage()?;
        if used.saturating_add(needed) > quota {
            return Err(Error::StorageSpace(format!(
                "need {} more, {} of {} quota in use",
                Utils::format_bytes(needed),
                Utils::format_bytes(used),
                Utils::format_bytes(quota)
            )));
        }
        Ok(())
    }

    /// Fails with [`Error::StorageSpace`] if the missing images do not fit.
    pub fn check_storage(&self, manifest: &Manifest) -> Result<()> {
        let missing = self.missing_bytes(manifest)?;
        tracing::info!("{} to download", Utils::format_bytes(missing));
        self.ensure_room(missing)
    }

    /// Makes sure the verified payload of `image` is cached.
    ///
    /// `progress` receives the number of decompressed bytes staged so far
    /// while a download is running.
    pub fn prepare(
        &self,
        image: &ImageDescriptor,
        progress: &mut dyn FnMut(u64),
    ) -> Result<PreparedImage> {
        let lock = self.cache.writer_lock(image);
        let _writer = lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(entry) = self.cache.lookup(image, true)? {
            return Ok(PreparedImage {
                descriptor: image.clone(),
                entry,
                fetched: false,
            });
        }

        tracing::info!("cache miss for {}", image.name);
        self.ensure_room(image.size)?;
        let entry = self.fetch(image, progress)?;
        Ok(PreparedImage {
            descriptor: image.clone(),
            entry,
            fetched: true,
        })
    }

    fn fetch(&self, image: &ImageDescriptor, progress: &mut dyn FnMut(u64)) -> Result<CacheEntry> {
        let raw = self.source.fetch(&image.url)?;
        let mut reader: Box<dyn Read + Send> = if image.compressed {
            Box::new(GzDecoder::new(raw))
        } else {
            raw
        };

        let mut staged = self.cache.stage()?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; COPY_BUFFER];
        let mut len = 0u64;
        loop {
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::download(&image.url, e)),
            };
            len += n as u64;
            if len > image.size {
                return Err(Error::SizeMismatch {
                    name: image.name.clone(),
                    expected: image.size,
                    actual: len,
                });
            }
            hasher.update(&buffer[..n]);
            staged.write_all(&buffer[..n]).map_err(Error::storage)?;
            progress(len);
        }

        if len != image.size {
            return Err(Error::SizeMismatch {
                name: image.name.clone(),
                expected: image.size,
                actual: len,
            });
        }
        let actual = hex::encode(hasher.finalize());
        if actual != image.checksum {
            tracing::error!("{}: checksum mismatch, discarding download", image.name);
            return Err(Error::ChecksumMismatch {
                name: image.name.clone(),
                expected: image.checksum.clone(),
                actual,
            });
        }

        staged.as_file().sync_all().map_err(Error::storage)?;
        self.cache.commit(staged, image)
    }

    /// Number of bytes the image occupies on the device once written.
    pub fn expanded_len(&self, prepared: &PreparedImage) -> Result<u64> {
        if !prepared.descriptor.sparse {
            return Ok(prepared.descriptor.size);
        }
        let file = BufReader::new(File::open(&prepared.entry.path)?);
        Ok(SparseReader::new(file, 1)?.header().expanded_len())
    }

    /// Streams the payload from the start, at most `chunk_size` bytes per
    /// chunk. Every call restarts from the beginning.
    pub fn chunks(&self, prepared: &PreparedImage, chunk_size: usize) -> Result<ChunkStream> {
        let chunk_size = chunk_size.min(self.config.chunk_size).max(1);
        let file = File::open(&prepared.entry.path)?;
        let name = &prepared.descriptor.name;
        let size = prepared.descriptor.size;
        let depth = self.config.queue_depth;
        if prepared.descriptor.sparse {
            let reader = SparseReader::new(BufReader::new(file), chunk_size)?;
            ChunkStream::spawn(name, reader, size, depth)
        } else {
            let plan = ChunkPlan::new(size, chunk_size);
            ChunkStream::spawn(name, RawReader::new(file, plan), size, depth)
        }
    }

    /// Drops every cached image. Returns the number of bytes freed.
    pub fn clear_cache(&self) -> Result<u64> {
        self.cache.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MemorySource {
        files: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl ImageSource for MemorySource {
        fn fetch(&self, url: &str) -> Result<Box<dyn Read + Send>> {
            let files = self.files.lock().unwrap();
            let data = files
                .get(url)
                .cloned()
                .ok_or_else(|| Error::download(url, "not found"))?;
            Ok(Box::new(std::io::Cursor::new(data)))
        }
    }

    fn descriptor(name: &str, data: &[u8], compressed: bool) -> ImageDescriptor {
        ImageDescriptor {
            name: name.into(),
            url: format!("mem://{}", name),
            size: data.len() as u64,
            checksum: hex::encode(Sha256::digest(data)),
            compressed,
            sparse: false,
            partition_size: None,
        }
    }

    fn manager(dir: &TempDir, source: Arc<MemorySource>, quota: Option<u64>) -> ImageManager {
        let config = ImageConfig {
            cache_dir: dir.path().to_path_buf(),
            chunk_size: 1000,
            quota,
            ..ImageConfig::default()
        };
        ImageManager::with_source(config, source).unwrap()
    }

    #[test]
    fn gzip_payload_is_verified_after_decompression() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&data).unwrap();
        let gz = encoder.finish().unwrap();

        let source = Arc::new(MemorySource::default());
        let image = descriptor("boot", &data, true);
        source.files.lock().unwrap().insert(image.url.clone(), gz);

        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, source, None);
        let mut staged = 0;
        let prepared = manager.prepare(&image, &mut |n| staged = n).unwrap();
        assert!(prepared.fetched);
        assert_eq!(staged, 5000);
        assert_eq!(std::fs::read(&prepared.entry.path).unwrap(), data);

        let again = manager.prepare(&image, &mut |_| {}).unwrap();
        assert!(!again.fetched);

        let chunks: Vec<_> = manager
            .chunks(&prepared, 4096)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.data.len() <= 1000));
    }

    #[test]
    fn oversized_download_stops_early() {
        let source = Arc::new(MemorySource::default());
        let mut image = descriptor("boot", b"abcdef", false);
        image.size = 3;
        source
            .files
            .lock()
            .unwrap()
            .insert(image.url.clone(), b"abcdef".to_vec());

        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, source, None);
        let err = manager.prepare(&image, &mut |_| {}).unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { actual: 6, .. }));
        assert!(!manager.is_cached(&image).unwrap());
    }

    #[test]
    fn quota_reports_storage_space() {
        let source = Arc::new(MemorySource::default());
        let image = descriptor("boot", &[0u8; 2048], false);
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, source, Some(1024));
        let manifest = Manifest {
            images: vec![image.clone()],
        };
        assert_eq!(manager.missing_bytes(&manifest).unwrap(), 2048);
        assert!(matches!(
            manager.check_storage(&manifest),
            Err(Error::StorageSpace(_))
        ));
        assert!(matches!(
            manager.prepare(&image, &mut |_| {}),
            Err(Error::StorageSpace(_))
        ));
    }

    #[test]
    fn sparse_image_expands_on_read() {
        let sparse = sparse::tests::sample();
        let source = Arc::new(MemorySource::default());
        let mut image = descriptor("system", &sparse, false);
        image.sparse = true;
        source
            .files
            .lock()
            .unwrap()
            .insert(image.url.clone(), sparse.clone());

        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, source, None);
        let prepared = manager.prepare(&image, &mut |_| {}).unwrap();
        assert_eq!(manager.expanded_len(&prepared).unwrap(), 48);

        let chunks: Vec<_> = manager
            .chunks(&prepared, 64)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let offsets: Vec<_> = chunks.iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, 40]);
        assert!(chunks[1].last);
        assert_eq!(chunks[1].consumed, sparse.len() as u64);
    }

    #[test]
    fn damaged_hit_is_fetched_again() {
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 13) as u8).collect();
        let source = Arc::new(MemorySource::default());
        let image = descriptor("boot", &data, false);
        source
            .files
            .lock()
            .unwrap()
            .insert(image.url.clone(), data.clone());

        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, source, None);
        let first = manager.prepare(&image, &mut |_| {}).unwrap();
        assert!(first.fetched);

        let mut damaged = data.clone();
        damaged[40] ^= 0xFF;
        std::fs::write(&first.entry.path, &damaged).unwrap();
        assert!(manager.is_cached(&image).unwrap());

        let second = manager.prepare(&image, &mut |_| {}).unwrap();
        assert!(second.fetched);
        assert_eq!(std::fs::read(&second.entry.path).unwrap(), data);
    }
}
