//! Where image bytes come from.

use crate::{Error, Result};
use reqwest::blocking::Client;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

/// Connect/read timeout of HTTP fetches; images are large, so this bounds
/// stalls rather than total time.
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Opens a byte stream for an image URL.
pub trait ImageSource: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Box<dyn Read + Send>>;
}

/// Downloads over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(HTTP_TIMEOUT)
            .timeout(None)
            .build()
            .map_err(|e| Error::download("http client", e))?;
        Ok(Self { client })
    }
}

impl ImageSource for HttpSource {
    fn fetch(&self, url: &str) -> Result<Box<dyn Read + Send>> {
        tracing::info!("downloading {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::download(url, e))?;
        if !response.status().is_success() {
            return Err(Error::download(
                url,
                format!("server answered {}", response.status()),
            ));
        }
        Ok(Box::new(response))
    }
}

/// Reads `file://` URLs and plain paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSource;

impl FileSource {
    fn path(url: &str) -> PathBuf {
        PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
    }
}

impl ImageSource for FileSource {
    fn fetch(&self, url: &str) -> Result<Box<dyn Read + Send>> {
        let path = Self::path(url);
        tracing::debug!("reading image from {}", path.display());
        let file = File::open(&path).map_err(|e| Error::download(url, e))?;
        Ok(Box::new(file))
    }
}

/// Picks HTTP or file access from the URL scheme.
#[derive(Debug, Clone)]
pub struct DefaultSource {
    http: HttpSource,
}

impl DefaultSource {
    pub fn new() -> Result<Self> {
        Ok(Self {
            http: HttpSource::new()?,
        })
    }
}

impl ImageSource for DefaultSource {
    fn fetch(&self, url: &str) -> Result<Box<dyn Read + Send>> {
        if url.starts_with("http://") || url.starts_with("https://") {
            self.http.fetch(url)
        } else if url.contains("://") && !url.starts_with("file://") {
            Err(Error::download(url, "unsupported URL scheme"))
        } else {
            FileSource.fetch(url)
        }
    }
}
