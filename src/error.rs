//! Error types for scene acquisition and composite assembly.

use thiserror::Error;

/// Errors that can occur while acquiring scenes or assembling composites.
///
/// Failures local to one band or one scene (`BandNotFound`,
/// `EmptyIntersection`, per-fetch `AssetUnavailable`) are contained by the
/// scene loop and logged; geometry and configuration errors are raised to
/// the caller before any network activity begins.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Malformed or degenerate bounding box. Caller error, not retried.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Network or HTTP failure while reaching an asset. Retryable at the
    /// caller's discretion; nothing in this crate retries internally.
    #[error("asset unavailable: {0}")]
    AssetUnavailable(String),

    /// The requested band is missing from a scene's asset index.
    #[error("band {band} not found in scene {scene}")]
    BandNotFound { band: String, scene: String },

    /// The requested bounding box does not intersect the asset's extent.
    /// Signals a caller geometry mismatch rather than infrastructure failure.
    #[error("bounding box does not intersect asset {0}")]
    EmptyIntersection(String),

    /// Received bytes do not parse as a valid raster.
    #[error("failed to decode raster: {0}")]
    DecodeError(String),

    /// Band pixel grids disagree beyond the reconciliation tolerance.
    #[error("band dimension mismatch: expected {expected_width}x{expected_height}, band {band} is {width}x{height}")]
    DimensionMismatch {
        band: String,
        width: usize,
        height: usize,
        expected_width: usize,
        expected_height: usize,
    },

    /// Band samples carry different coordinate reference systems.
    #[error("band {band} has CRS EPSG:{crs}, composite uses EPSG:{expected}")]
    CrsMismatch { band: String, crs: i32, expected: i32 },

    /// The computed crop window has non-positive width or height.
    #[error("invalid crop size: width and height must be > 0")]
    InvalidCropSize,

    /// Catalog search transport or payload failure. Distinct from an empty
    /// result set, which is reported as success with zero scenes.
    #[error("catalog search failed: {0}")]
    SearchFailed(String),

    /// Coordinate transformation failure.
    #[error("projection error: {0}")]
    Projection(String),

    /// GeoTIFF encoding failure while persisting a raster.
    #[error("tiff write error: {0}")]
    TiffWrite(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, FetchError>;

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        FetchError::AssetUnavailable(e.to_string())
    }
}

impl From<tiff::TiffError> for FetchError {
    fn from(e: tiff::TiffError) -> Self {
        FetchError::DecodeError(e.to_string())
    }
}
