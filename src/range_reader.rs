//! Range-based reader interface for cloud-optimized raster assets.
//!
//! Windowed reads depend on fetching small byte ranges instead of whole
//! files; this module provides a unified interface over the sources that
//! support that: local files (seek + read), HTTP(S) (Range header), and
//! S3-compatible stores (`GetObject` with a range). An in-memory variant
//! backs the full-download fallback and tests.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{FetchError, Result};

/// Trait for reading byte ranges from any source.
pub trait RangeReader: Send + Sync {
    /// Read a range of bytes from the source.
    fn read_range(&self, offset: u64, length: usize) -> Result<Vec<u8>>;

    /// Total size of the source in bytes.
    fn size(&self) -> u64;

    /// Human-readable identifier for this source (logging, errors, cache
    /// keys).
    fn identifier(&self) -> &str;

    /// Whether this is a local file (fast random access) or remote
    /// (expensive reads).
    fn is_local(&self) -> bool {
        let id = self.identifier();
        !id.starts_with("http://") && !id.starts_with("https://") && !id.starts_with("s3://")
    }
}

/// Local file range reader.
pub struct LocalRangeReader {
    path: PathBuf,
    size: u64,
}

impl LocalRangeReader {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = std::fs::metadata(&path)?;
        Ok(Self {
            path,
            size: metadata.len(),
        })
    }
}

impl RangeReader for LocalRangeReader {
    fn read_range(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; length];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        self.path.to_str().unwrap_or("<invalid path>")
    }
}

/// HTTP range reader for remote raster assets.
///
/// Uses a blocking client; the acquisition pipeline is synchronous per band
/// and async callers wrap it in `spawn_blocking`.
pub struct HttpRangeReader {
    url: String,
    size: u64,
    client: reqwest::blocking::Client,
}

impl HttpRangeReader {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        // Size via HEAD; servers that omit Content-Length report 0
        let response = client.head(url).send()?;
        if !response.status().is_success() {
            return Err(FetchError::AssetUnavailable(format!(
                "HEAD {url} failed: {}",
                response.status()
            )));
        }
        let size = response.content_length().unwrap_or(0);

        Ok(Self {
            url: url.to_string(),
            size,
            client,
        })
    }
}

impl RangeReader for HttpRangeReader {
    fn read_range(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let range = format!("bytes={}-{}", offset, offset + length as u64 - 1);
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::RANGE, range)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::AssetUnavailable(format!(
                "range request to {} failed: {status}",
                self.url
            )));
        }

        let bytes = response.bytes()?;

        // A store without ranged access answers 200 with the whole body;
        // surface that as unavailability so callers can fall back to a
        // full download instead of decoding a mis-sliced buffer
        if status != reqwest::StatusCode::PARTIAL_CONTENT && bytes.len() != length {
            return Err(FetchError::AssetUnavailable(format!(
                "{} ignored the range request",
                self.url
            )));
        }

        Ok(bytes.to_vec())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.url
    }
}

/// In-memory range reader over an already-downloaded buffer.
///
/// Backs the full-download fallback path and synthetic rasters in tests.
pub struct MemoryRangeReader {
    data: Vec<u8>,
    identifier: String,
}

impl MemoryRangeReader {
    #[must_use]
    pub fn new(data: Vec<u8>, identifier: impl Into<String>) -> Self {
        Self {
            data,
            identifier: identifier.into(),
        }
    }
}

impl RangeReader for MemoryRangeReader {
    fn read_range(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let start = offset as usize;
        let end = start + length;
        if end > self.data.len() {
            return Err(FetchError::DecodeError(format!(
                "range {start}..{end} out of bounds for {} byte buffer",
                self.data.len()
            )));
        }
        Ok(self.data[start..end].to_vec())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn is_local(&self) -> bool {
        true
    }
}

/// Create a range reader from a path or URL, dispatching on scheme.
pub fn create_range_reader(source: &str) -> Result<Arc<dyn RangeReader>> {
    if source.starts_with("s3://") {
        Ok(Arc::new(crate::s3::S3RangeReader::new(source)?))
    } else if source.starts_with("http://") || source.starts_with("https://") {
        Ok(Arc::new(HttpRangeReader::new(source)?))
    } else {
        Ok(Arc::new(LocalRangeReader::new(source)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_local_range_reader() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"Hello, World!").unwrap();

        let reader = LocalRangeReader::new(file.path()).unwrap();
        assert_eq!(reader.size(), 13);

        let data = reader.read_range(0, 5).unwrap();
        assert_eq!(&data, b"Hello");

        let data = reader.read_range(7, 5).unwrap();
        assert_eq!(&data, b"World");
    }

    #[test]
    fn test_memory_range_reader() {
        let reader = MemoryRangeReader::new(b"0123456789".to_vec(), "mem:test");
        assert_eq!(reader.size(), 10);
        assert!(reader.is_local());
        assert_eq!(reader.read_range(2, 3).unwrap(), b"234");
        assert!(reader.read_range(8, 5).is_err());
    }

    #[test]
    fn test_local_reader_missing_file() {
        assert!(LocalRangeReader::new("/nonexistent/path/raster.tif").is_err());
    }
}
