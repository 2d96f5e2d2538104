//! S3-compatible asset access using `object_store`.
//!
//! Sentinel-2 archives are mirrored on S3-compatible storage; catalog
//! providers may hand out `s3://` asset references alongside HTTPS ones.
//! Supports AWS S3, MinIO, and other S3-compatible stores.
//!
//! # Configuration
//!
//! Credentials and endpoint come from the environment:
//! - `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`
//! - `AWS_REGION` (default: us-east-1)
//! - `AWS_ENDPOINT_URL` - custom endpoint for MinIO/S3-compatible services
//! - `AWS_ALLOW_HTTP` - set to "true" to allow HTTP endpoints
//! - `AWS_SKIP_SIGNATURE` - set to "true" for anonymous access to public
//!   buckets (the Sentinel-2 open-data mirrors)

use std::ops::Range;
use std::sync::Arc;

use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{GetOptions, GetRange, ObjectStore};
use tokio::runtime::{Handle, Runtime};

use crate::error::{FetchError, Result};
use crate::range_reader::RangeReader;

/// Connection settings for an S3-compatible store.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub key: String,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub allow_http: bool,
    pub skip_signature: bool,
}

impl S3Config {
    /// Parse an `s3://bucket/key` URL, filling credentials from the
    /// environment.
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| FetchError::AssetUnavailable(format!("bad S3 URL {url}: {e}")))?;

        if parsed.scheme() != "s3" {
            return Err(FetchError::AssetUnavailable(format!(
                "expected s3:// URL, got: {}",
                parsed.scheme()
            )));
        }

        let bucket = parsed
            .host_str()
            .ok_or_else(|| FetchError::AssetUnavailable(format!("missing bucket in S3 URL {url}")))?
            .to_string();

        let key = parsed.path().trim_start_matches('/').to_string();

        if key.is_empty() {
            return Err(FetchError::AssetUnavailable(format!(
                "missing key in S3 URL {url}"
            )));
        }

        Ok(Self {
            bucket,
            key,
            region: std::env::var("AWS_REGION").ok().or(Some("us-east-1".to_string())),
            endpoint_url: std::env::var("AWS_ENDPOINT_URL").ok(),
            access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok(),
            secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
            allow_http: std::env::var("AWS_ALLOW_HTTP")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(false),
            skip_signature: std::env::var("AWS_SKIP_SIGNATURE")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(false),
        })
    }
}

/// S3 range reader implementing [`RangeReader`] over `object_store`.
///
/// `object_store` is async; the reader bridges into the synchronous
/// pipeline by blocking on an existing tokio handle when one is ambient
/// (callers on runtime threads must be inside `spawn_blocking`), or on a
/// private runtime otherwise.
pub struct S3RangeReader {
    store: Arc<dyn ObjectStore>,
    path: ObjectPath,
    size: u64,
    url: String,
    runtime: BlockingRuntime,
}

enum BlockingRuntime {
    Ambient(Handle),
    Owned(Runtime),
}

impl BlockingRuntime {
    fn current_or_new() -> Result<Self> {
        match Handle::try_current() {
            Ok(handle) => Ok(Self::Ambient(handle)),
            Err(_) => Runtime::new()
                .map(Self::Owned)
                .map_err(FetchError::from),
        }
    }

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        match self {
            Self::Ambient(handle) => handle.block_on(fut),
            Self::Owned(runtime) => runtime.block_on(fut),
        }
    }
}

impl S3RangeReader {
    pub fn new(url: &str) -> Result<Self> {
        Self::from_config(S3Config::from_url(url)?)
    }

    pub fn from_config(config: S3Config) -> Result<Self> {
        let mut builder = AmazonS3Builder::new().with_bucket_name(&config.bucket);

        if let Some(region) = &config.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.with_endpoint(endpoint);
        }
        if let Some(access_key) = &config.access_key_id {
            builder = builder.with_access_key_id(access_key);
        }
        if let Some(secret_key) = &config.secret_access_key {
            builder = builder.with_secret_access_key(secret_key);
        }
        if config.allow_http {
            builder = builder.with_allow_http(true);
        }
        if config.skip_signature {
            builder = builder.with_skip_signature(true);
        }

        let store = builder
            .build()
            .map_err(|e| FetchError::AssetUnavailable(format!("S3 store init failed: {e}")))?;
        let path = ObjectPath::from(config.key.as_str());
        let url = format!("s3://{}/{}", config.bucket, config.key);

        let runtime = BlockingRuntime::current_or_new()?;

        // Size via HEAD
        let meta = runtime
            .block_on(store.head(&path))
            .map_err(|e| FetchError::AssetUnavailable(format!("HEAD {url} failed: {e}")))?;
        let size = meta.size as u64;

        Ok(Self {
            store: Arc::new(store),
            path,
            size,
            url,
            runtime,
        })
    }
}

impl RangeReader for S3RangeReader {
    fn read_range(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let range = Range {
            start: offset as usize,
            end: offset as usize + length,
        };

        let options = GetOptions {
            range: Some(GetRange::Bounded(range)),
            ..Default::default()
        };

        let bytes = self
            .runtime
            .block_on(async {
                let result = self.store.get_opts(&self.path, options).await?;
                result.bytes().await
            })
            .map_err(|e| {
                FetchError::AssetUnavailable(format!("range request to {} failed: {e}", self.url))
            })?;

        Ok(bytes.to_vec())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.url
    }

    fn is_local(&self) -> bool {
        false
    }
}
