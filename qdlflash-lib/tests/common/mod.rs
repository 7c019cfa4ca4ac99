#![allow(dead_code)]

use qdlflash_lib::image::ImageSource;
use qdlflash_lib::protocol::EngineConfig;
use qdlflash_lib::{
    ChannelObserver, Error, FlashConfig, FlashEvent, FlashSnapshot, ImageConfig, ImageDescriptor,
    ImageManager, Manifest, Result,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// In-memory image server that counts fetches.
#[derive(Default)]
pub struct CountingSource {
    files: Mutex<HashMap<String, Vec<u8>>>,
    fetches: AtomicUsize,
}

impl CountingSource {
    pub fn serve(&self, url: &str, data: Vec<u8>) {
        self.files.lock().unwrap().insert(url.to_string(), data);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ImageSource for CountingSource {
    fn fetch(&self, url: &str) -> Result<Box<dyn Read + Send>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let data = self
            .files
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::download(url, "404"))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

pub fn descriptor(name: &str, data: &[u8]) -> ImageDescriptor {
    ImageDescriptor {
        name: name.into(),
        url: format!("https://images.test/{}.img", name),
        size: data.len() as u64,
        checksum: sha256_hex(data),
        compressed: false,
        sparse: false,
        partition_size: None,
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub source: Arc<CountingSource>,
    pub manifest: Manifest,
    pub images: Arc<ImageManager>,
}

impl Fixture {
    pub fn new(images: &[(&str, Vec<u8>)]) -> Self {
        Self::with_quota(images, None)
    }

    pub fn with_quota(images: &[(&str, Vec<u8>)], quota: Option<u64>) -> Self {
        let source = Arc::new(CountingSource::default());
        let mut manifest = Manifest::default();
        for (name, data) in images {
            let image = descriptor(name, data);
            source.serve(&image.url, data.clone());
            manifest.images.push(image);
        }
        Self::from_manifest(manifest, source, quota)
    }

    pub fn from_manifest(
        manifest: Manifest,
        source: Arc<CountingSource>,
        quota: Option<u64>,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let config = ImageConfig {
            cache_dir: dir.path().join("cache"),
            quota,
            ..ImageConfig::default()
        };
        let images = Arc::new(ImageManager::with_source(config, source.clone()).unwrap());
        Self {
            dir,
            source,
            manifest,
            images,
        }
    }
}

pub fn fast_config() -> FlashConfig {
    FlashConfig {
        engine: EngineConfig {
            response_timeout: Duration::from_secs(2),
            ..EngineConfig::default()
        },
        connect_timeout: Some(Duration::from_secs(5)),
        poll_interval: Duration::from_millis(5),
        disconnect_grace: Duration::from_millis(200),
        ..FlashConfig::default()
    }
}

pub fn recorder() -> (Arc<ChannelObserver>, Receiver<(FlashEvent, FlashSnapshot)>) {
    let (tx, rx) = mpsc::channel();
    (Arc::new(ChannelObserver::new(tx)), rx)
}
