//! The scene acquisition pipeline.
//!
//! Caller geometry is normalized, the catalog is searched, and for each
//! matching scene the selected bands are fetched sequentially and assembled
//! into one tagged composite. Failures local to a band or a scene are
//! logged and contained: the scene yields no composite, siblings continue.
//! A composite is only produced when every requested band succeeded; no
//! partial composite flows downstream.
//!
//! The pipeline is synchronous; per-scene work shares no mutable state and
//! the async wrappers run it on the blocking thread pool.

use tracing::{info, warn};

use crate::catalog::{self, Provider, SceneRecord};
use crate::composite::{self, RGB_BANDS, RasterComposite};
use crate::error::{FetchError, Result};
use crate::fetch;
use crate::geometry::GeoBox;
use crate::window;

/// The CRS of caller-supplied geometry (geodetic degrees).
const INPUT_CRS: i32 = 4326;

/// Options for a scene acquisition request.
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// Bands to fetch and stack, in composite order.
    pub bands: Vec<String>,
    /// Upper bound on catalog cloud cover, percent.
    pub max_cloud_cover: f64,
    /// Inclusive ISO-8601 date range for the search.
    pub date_range: (String, String),
    /// Cap on either output dimension for windowed reads; `None` reads the
    /// full window at native resolution.
    pub max_output_size: Option<usize>,
    /// Stream whole assets instead of windowed reads. Strictly more
    /// expensive; for stores that reject range requests.
    pub force_full_download: bool,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            bands: RGB_BANDS.iter().map(|s| s.to_string()).collect(),
            max_cloud_cover: 10.0,
            date_range: ("2024-01-01".to_string(), "2024-03-01".to_string()),
            max_output_size: Some(1024),
            force_full_download: false,
        }
    }
}

/// Acquire composites for a bounding box built around a center point, with
/// half-extents in kilometers.
pub fn acquire_point(
    provider: &Provider,
    lat: f64,
    lon: f64,
    half_width_km: f64,
    half_height_km: f64,
    options: &AcquireOptions,
) -> Result<Vec<RasterComposite>> {
    let bbox = GeoBox::from_center_km(lat, lon, half_width_km, half_height_km);
    acquire_bbox(provider, &bbox, options)
}

/// Acquire one composite per catalog scene matching the search filter, in
/// catalog order.
pub fn acquire_bbox(
    provider: &Provider,
    bbox: &GeoBox,
    options: &AcquireOptions,
) -> Result<Vec<RasterComposite>> {
    if options.bands.is_empty() {
        return Err(FetchError::InvalidGeometry(
            "empty band selection".to_string(),
        ));
    }

    let scenes = catalog::search(
        provider,
        bbox,
        options.max_cloud_cover,
        (&options.date_range.0, &options.date_range.1),
    )?;

    if scenes.is_empty() {
        info!(provider = %provider.name, "no scenes match the search filter");
        return Ok(Vec::new());
    }

    info!(
        provider = %provider.name,
        scenes = scenes.len(),
        bands = ?options.bands,
        "fetching scenes"
    );

    let mut composites = Vec::new();
    for scene in &scenes {
        match fetch_scene(scene, bbox, options) {
            Ok(composite) => composites.push(composite),
            Err(e) => {
                warn!(scene = %scene.id, "skipping scene: {e}");
            }
        }
    }

    Ok(composites)
}

/// Fetch every requested band for one scene and assemble the composite.
fn fetch_scene(
    scene: &SceneRecord,
    bbox: &GeoBox,
    options: &AcquireOptions,
) -> Result<RasterComposite> {
    let mut samples = Vec::with_capacity(options.bands.len());

    for band in &options.bands {
        let url = scene.band_url(band).ok_or_else(|| FetchError::BandNotFound {
            band: band.clone(),
            scene: scene.id.clone(),
        })?;

        let sample = if options.force_full_download {
            fetch::read_full(url, band, None)?
        } else {
            match window::read_window(url, band, bbox, INPUT_CRS, options.max_output_size) {
                Ok(sample) => sample,
                // Stores without ranged access get the expensive path
                Err(FetchError::AssetUnavailable(reason)) => {
                    warn!(
                        scene = %scene.id,
                        band = %band,
                        "windowed read unavailable ({reason}), falling back to full download"
                    );
                    fetch::read_full(url, band, None)?
                }
                Err(e) => return Err(e),
            }
        };

        samples.push(sample);
    }

    composite::assemble(samples, &options.bands, &scene.info())
}

/// Async variant of [`acquire_point`]; runs the synchronous pipeline on the
/// blocking thread pool.
pub async fn acquire_point_async(
    provider: Provider,
    lat: f64,
    lon: f64,
    half_width_km: f64,
    half_height_km: f64,
    options: AcquireOptions,
) -> Result<Vec<RasterComposite>> {
    tokio::task::spawn_blocking(move || {
        acquire_point(&provider, lat, lon, half_width_km, half_height_km, &options)
    })
    .await
    .map_err(|e| FetchError::Io(std::io::Error::other(format!("task join error: {e}"))))?
}

/// Async variant of [`acquire_bbox`].
pub async fn acquire_bbox_async(
    provider: Provider,
    bbox: GeoBox,
    options: AcquireOptions,
) -> Result<Vec<RasterComposite>> {
    tokio::task::spawn_blocking(move || acquire_bbox(&provider, &bbox, &options))
        .await
        .map_err(|e| FetchError::Io(std::io::Error::other(format!("task join error: {e}"))))?
}
