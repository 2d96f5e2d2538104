//! # scenefetch - Windowed Sentinel-2 Scene Acquisition
//!
//! A library for fetching multi-band satellite imagery for a point or
//! bounding box and assembling it into tagged in-memory composites, without
//! GDAL.
//!
//! ## Features
//!
//! - **Geodetic windows**: point + kilometer half-extents to a degree bbox,
//!   accounting for latitude-dependent longitude scale
//! - **Partial reads**: windowed fetches against cloud-optimized GeoTIFFs
//!   via HTTP/S3 byte ranges - only the intersecting tiles move over the
//!   network
//! - **Full-download fallback**: streaming fetch with byte progress for
//!   stores without range support
//! - **Composite assembly**: per-band samples reconciled onto one grid,
//!   stacked band-major, tagged with acquisition metadata
//! - **Catalog search**: STAC `/search` against a configurable provider
//!   (Planetary Computer, Element84 earth-search)
//! - **GeoTIFF output**: composites and crops written with georeferencing
//!   and acquisition tags, pure Rust
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use scenefetch::{acquire_point, AcquireOptions, Provider, save_composite};
//!
//! // 3 km x 3 km around a point, RGB bands, scenes under 30% cloud
//! let options = AcquireOptions {
//!     max_cloud_cover: 30.0,
//!     date_range: ("2024-01-01".into(), "2024-01-13".into()),
//!     ..AcquireOptions::default()
//! };
//! let composites = acquire_point(
//!     &Provider::planetary_computer(),
//!     51.4827, 46.2086,
//!     3.0, 3.0,
//!     &options,
//! )?;
//!
//! for composite in &composites {
//!     // `saratov.tif` becomes e.g. `saratov_2024_01_05_RGB.tif`
//!     save_composite(composite, "saratov.tif")?;
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`geometry`]: [`GeoBox`] construction and CRS reprojection
//! - [`catalog`]: provider strategy and STAC search client
//! - [`cog`]: COG metadata and tile reads over byte ranges
//! - [`window`]: windowed reads producing [`BandSample`]s
//! - [`fetch`]: full-asset streaming fallback with progress reporting
//! - [`composite`]: band reconciliation and tagged [`RasterComposite`]s
//! - [`writer`]: GeoTIFF persistence
//! - [`crop`]: crop an already-fetched raster to a bounding box
//! - [`range_reader`]: I/O abstraction over file/HTTP/S3/memory sources

pub mod acquire;
pub mod catalog;
pub mod cog;
pub mod composite;
pub mod crop;
pub mod error;
pub mod fetch;
pub mod geometry;
pub mod range_reader;
pub mod raster;
pub mod s3;
pub mod tile_cache;
pub mod window;
pub mod writer;

// ============================================================================
// Pipeline entry points
// ============================================================================

pub use acquire::{
    AcquireOptions, acquire_bbox, acquire_bbox_async, acquire_point, acquire_point_async,
};

// ============================================================================
// Geometry
// ============================================================================

pub use geometry::{GeoBox, Point, delta_km_to_deg};
pub use geometry::projection::{project_point, reproject_bounds};

// ============================================================================
// Catalog
// ============================================================================

pub use catalog::{Provider, SceneRecord, SENTINEL2_BANDS, search};

// ============================================================================
// Readers
// ============================================================================

pub use cog::{CogMeta, CogSource, Compression, OverviewMeta};
pub use fetch::{ProgressObserver, content_length, read_full};
pub use window::{read_window, read_window_from};

// ============================================================================
// Data model
// ============================================================================

pub use composite::{RasterComposite, SceneInfo, TagSet, assemble};
pub use raster::{Affine, BandSample, RasterMeta, SampleType};

// ============================================================================
// Persistence
// ============================================================================

pub use crop::crop_to_bbox;
pub use writer::{GeoTiffCompression, GeoTiffWriter, save_composite};

// ============================================================================
// I/O abstraction
// ============================================================================

pub use error::{FetchError, Result};
pub use range_reader::{
    HttpRangeReader, LocalRangeReader, MemoryRangeReader, RangeReader, create_range_reader,
};
pub use s3::{S3Config, S3RangeReader};
