//! Band reconciliation and composite assembly.
//!
//! Per-band windowed reads against the same bounding box are expected to
//! produce matching or near-matching grids; independent asset boundaries
//! can still shift a band by a few pixels. Assembly adopts the first band
//! in the requested order as authoritative, reconciles the rest by
//! cropping to the minimum shared shape within a small tolerance, and
//! stacks bands along a new leading axis.

use chrono::Datelike;
use ndarray::{Array3, s};
use tracing::warn;

use crate::error::{FetchError, Result};
use crate::raster::{BandSample, RasterMeta};

/// Largest per-axis pixel disagreement reconciled by cropping; anything
/// bigger means the bands were read from genuinely different grids.
pub const DIM_TOLERANCE_PX: usize = 8;

/// The canonical red/green/blue band triple.
pub const RGB_BANDS: [&str; 3] = ["B04", "B03", "B02"];

/// Scene-level acquisition metadata attached to a composite.
#[derive(Debug, Clone)]
pub struct SceneInfo {
    /// Stable catalog identifier of the acquisition.
    pub id: String,
    /// Cloud cover percentage reported by the catalog.
    pub cloud_cover: f64,
    /// ISO-8601 acquisition timestamp, verbatim from the catalog.
    pub datetime: String,
    /// Platform string, e.g. `sentinel-2a`; absent in some catalogs.
    pub platform: Option<String>,
}

/// Tag set attached to an assembled composite.
#[derive(Debug, Clone, PartialEq)]
pub struct TagSet {
    pub title: String,
    pub cloud_cover: f64,
    /// Acquisition timestamp, verbatim ISO-8601.
    pub datetime: String,
    /// Derived filename suffix `_{year}_{month:02}_{day:02}_{bandlabel}`;
    /// absent when the acquisition timestamp could not be parsed.
    pub suffix: Option<String>,
    pub platform: String,
}

/// The assembled multi-band in-memory raster product for one scene.
///
/// Pixel data is stacked band-major (`[band, row, col]`) with one shared
/// transform and CRS. Created once, tagged once, and owned exclusively
/// until handed to persistence; the backing memory is released when the
/// composite is dropped. The only sanctioned mutation is
/// [`replace_pixels`](Self::replace_pixels).
#[derive(Debug, Clone)]
pub struct RasterComposite {
    pub pixels: Array3<f32>,
    pub meta: RasterMeta,
    /// Band codes in stack order.
    pub bands: Vec<String>,
    pub tags: TagSet,
}

impl RasterComposite {
    /// Number of bands in the stack.
    #[must_use]
    pub fn band_count(&self) -> usize {
        self.pixels.dim().0
    }

    /// Grid shape as (rows, cols).
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        let (_, rows, cols) = self.pixels.dim();
        (rows, cols)
    }

    /// Replace the pixel stack, keeping CRS and tags, and halve the
    /// transform's pixel-scale terms.
    ///
    /// The scale adjustment is a fixed 2x assumption, not derived from the
    /// shape ratio: call this only when the replacement array genuinely
    /// represents exactly double spatial resolution (the post
    /// super-resolution flow), otherwise the returned georeferencing is
    /// wrong.
    pub fn replace_pixels(self, new_pixels: Array3<f32>) -> Result<RasterComposite> {
        let (bands, rows, cols) = new_pixels.dim();
        if bands != self.bands.len() {
            return Err(FetchError::DimensionMismatch {
                band: format!("stack of {bands}"),
                width: cols,
                height: rows,
                expected_width: self.shape().1,
                expected_height: self.shape().0,
            });
        }

        let meta = RasterMeta::new(
            cols,
            rows,
            bands,
            self.meta.sample_type,
            self.meta.crs_epsg,
            self.meta.transform.halve_pixel_scale(),
            self.meta.nodata,
        )?;

        Ok(RasterComposite {
            pixels: new_pixels,
            meta,
            bands: self.bands,
            tags: self.tags,
        })
    }
}

/// Assemble per-band samples into one tagged composite.
///
/// The transform, CRS and dimensions of the first band in `band_order` are
/// authoritative. Samples may be passed in any order; they are stacked in
/// the exact order given by `band_order`.
pub fn assemble(
    samples: Vec<BandSample>,
    band_order: &[String],
    scene: &SceneInfo,
) -> Result<RasterComposite> {
    if band_order.is_empty() {
        return Err(FetchError::InvalidGeometry(
            "empty band selection".to_string(),
        ));
    }

    // Reorder samples to match the requested stacking order
    let mut ordered: Vec<BandSample> = Vec::with_capacity(band_order.len());
    let mut pool = samples;
    for code in band_order {
        let idx = pool
            .iter()
            .position(|s| &s.band == code)
            .ok_or_else(|| FetchError::BandNotFound {
                band: code.clone(),
                scene: scene.id.clone(),
            })?;
        ordered.push(pool.swap_remove(idx));
    }

    let first = &ordered[0];
    let (auth_rows, auth_cols) = first.shape();
    let auth_crs = first.meta.crs_epsg;

    // Reconcile grids: tolerate boundary jitter by cropping to the minimum
    // shared shape, reject real grid disagreements
    let mut min_rows = auth_rows;
    let mut min_cols = auth_cols;
    for sample in &ordered[1..] {
        if sample.meta.crs_epsg != auth_crs {
            return Err(FetchError::CrsMismatch {
                band: sample.band.clone(),
                crs: sample.meta.crs_epsg,
                expected: auth_crs,
            });
        }
        let (rows, cols) = sample.shape();
        if rows.abs_diff(auth_rows) > DIM_TOLERANCE_PX || cols.abs_diff(auth_cols) > DIM_TOLERANCE_PX
        {
            return Err(FetchError::DimensionMismatch {
                band: sample.band.clone(),
                width: cols,
                height: rows,
                expected_width: auth_cols,
                expected_height: auth_rows,
            });
        }
        min_rows = min_rows.min(rows);
        min_cols = min_cols.min(cols);
    }

    let mut stack = Array3::<f32>::zeros((ordered.len(), min_rows, min_cols));
    for (i, sample) in ordered.iter().enumerate() {
        stack
            .slice_mut(s![i, .., ..])
            .assign(&sample.pixels.slice(s![..min_rows, ..min_cols]));
    }

    let meta = RasterMeta::new(
        min_cols,
        min_rows,
        ordered.len(),
        first.meta.sample_type,
        auth_crs,
        first.meta.transform,
        first.meta.nodata,
    )?;

    let bands: Vec<String> = band_order.to_vec();
    let tags = derive_tags(&bands, scene);

    Ok(RasterComposite {
        pixels: stack,
        meta,
        bands,
        tags,
    })
}

/// Derive the composite tag set from the band selection and scene metadata.
fn derive_tags(bands: &[String], scene: &SceneInfo) -> TagSet {
    let is_rgb = bands.len() == 3 && bands.iter().zip(RGB_BANDS).all(|(b, r)| b == r);

    let title = if is_rgb {
        "Sentinel-2 RGB Composite".to_string()
    } else if bands.len() == 1 {
        format!("Sentinel-2 {} Band", bands[0])
    } else {
        "Sentinel-2 Multi-band Composite".to_string()
    };

    let band_label = if is_rgb {
        "RGB".to_string()
    } else {
        bands.join("-")
    };

    let suffix = match chrono::DateTime::parse_from_rfc3339(&scene.datetime) {
        Ok(date) => Some(format!(
            "_{}_{:02}_{:02}_{}",
            date.year(),
            date.month(),
            date.day(),
            band_label
        )),
        Err(e) => {
            warn!(
                scene = %scene.id,
                datetime = %scene.datetime,
                "cannot parse acquisition timestamp, omitting suffix tag: {e}"
            );
            None
        }
    };

    TagSet {
        title,
        cloud_cover: scene.cloud_cover,
        datetime: scene.datetime.clone(),
        suffix,
        platform: scene
            .platform
            .clone()
            .unwrap_or_else(|| "Sentinel-2".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{Affine, SampleType};
    use ndarray::Array2;

    fn scene() -> SceneInfo {
        SceneInfo {
            id: "S2A_MSIL2A_20240105T085721".to_string(),
            cloud_cover: 12.5,
            datetime: "2024-01-05T08:57:21.024Z".to_string(),
            platform: Some("sentinel-2a".to_string()),
        }
    }

    fn sample(band: &str, rows: usize, cols: usize, fill: f32) -> BandSample {
        let transform = Affine::new(10.0, 0.0, 600_000.0, 0.0, -10.0, 5_700_000.0);
        let meta = RasterMeta::new(cols, rows, 1, SampleType::UInt16, 32638, transform, Some(0.0))
            .unwrap();
        BandSample {
            band: band.to_string(),
            pixels: Array2::from_elem((rows, cols), fill),
            meta,
        }
    }

    fn rgb_order() -> Vec<String> {
        RGB_BANDS.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_assemble_rgb_composite() {
        let samples = vec![
            sample("B02", 40, 60, 2.0),
            sample("B03", 40, 60, 3.0),
            sample("B04", 40, 60, 4.0),
        ];
        let composite = assemble(samples, &rgb_order(), &scene()).unwrap();

        assert_eq!(composite.band_count(), 3);
        assert_eq!(composite.shape(), (40, 60));
        // Stack order follows band_order, not arrival order
        assert_eq!(composite.pixels[[0, 0, 0]], 4.0);
        assert_eq!(composite.pixels[[1, 0, 0]], 3.0);
        assert_eq!(composite.pixels[[2, 0, 0]], 2.0);
        assert_eq!(composite.bands, vec!["B04", "B03", "B02"]);

        assert_eq!(composite.tags.title, "Sentinel-2 RGB Composite");
        assert_eq!(composite.tags.cloud_cover, 12.5);
        assert_eq!(composite.tags.platform, "sentinel-2a");
        assert_eq!(composite.tags.suffix.as_deref(), Some("_2024_01_05_RGB"));
    }

    #[test]
    fn test_assemble_single_band() {
        let samples = vec![sample("B08", 16, 16, 8.0)];
        let composite = assemble(samples, &["B08".to_string()], &scene()).unwrap();
        assert_eq!(composite.band_count(), 1);
        assert_eq!(composite.tags.title, "Sentinel-2 B08 Band");
        assert_eq!(composite.tags.suffix.as_deref(), Some("_2024_01_05_B08"));
    }

    #[test]
    fn test_assemble_crops_to_min_shared_shape() {
        // Jitter of a few pixels between bands is reconciled by cropping
        let samples = vec![
            sample("B04", 40, 60, 4.0),
            sample("B03", 38, 61, 3.0),
            sample("B02", 40, 59, 2.0),
        ];
        let composite = assemble(samples, &rgb_order(), &scene()).unwrap();
        assert_eq!(composite.shape(), (38, 59));
        assert_eq!(composite.meta.height, 38);
        assert_eq!(composite.meta.width, 59);
    }

    #[test]
    fn test_assemble_rejects_large_mismatch() {
        let samples = vec![sample("B04", 40, 60, 4.0), sample("B03", 20, 60, 3.0), sample("B02", 40, 60, 2.0)];
        let err = assemble(samples, &rgb_order(), &scene()).unwrap_err();
        assert!(matches!(err, FetchError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_assemble_rejects_crs_mismatch() {
        let mut odd = sample("B03", 40, 60, 3.0);
        odd.meta.crs_epsg = 32637;
        let samples = vec![sample("B04", 40, 60, 4.0), odd, sample("B02", 40, 60, 2.0)];
        let err = assemble(samples, &rgb_order(), &scene()).unwrap_err();
        assert!(matches!(err, FetchError::CrsMismatch { .. }));
    }

    #[test]
    fn test_assemble_missing_band() {
        let samples = vec![sample("B04", 40, 60, 4.0), sample("B02", 40, 60, 2.0)];
        let err = assemble(samples, &rgb_order(), &scene()).unwrap_err();
        assert!(matches!(err, FetchError::BandNotFound { .. }));
    }

    #[test]
    fn test_unparseable_date_omits_suffix_only() {
        let mut bad_scene = scene();
        bad_scene.datetime = "sometime in winter".to_string();
        let samples = vec![sample("B08", 8, 8, 1.0)];
        let composite = assemble(samples, &["B08".to_string()], &bad_scene).unwrap();
        assert!(composite.tags.suffix.is_none());
        assert_eq!(composite.tags.datetime, "sometime in winter");
    }

    #[test]
    fn test_default_platform() {
        let mut anon = scene();
        anon.platform = None;
        let samples = vec![sample("B08", 8, 8, 1.0)];
        let composite = assemble(samples, &["B08".to_string()], &anon).unwrap();
        assert_eq!(composite.tags.platform, "Sentinel-2");
    }

    #[test]
    fn test_replace_pixels_halves_scale() {
        let samples = vec![sample("B08", 10, 10, 1.0)];
        let composite = assemble(samples, &["B08".to_string()], &scene()).unwrap();
        let (c, f) = (composite.meta.transform.c, composite.meta.transform.f);

        let upscaled = Array3::from_elem((1, 20, 20), 2.0_f32);
        let replaced = composite.replace_pixels(upscaled).unwrap();

        assert_eq!(replaced.meta.transform.a, 5.0);
        assert_eq!(replaced.meta.transform.e, -5.0);
        assert_eq!(replaced.meta.transform.c, c);
        assert_eq!(replaced.meta.transform.f, f);
        assert_eq!(replaced.shape(), (20, 20));
        assert_eq!(replaced.meta.width, 20);
        // Tag set survives the replacement
        assert_eq!(replaced.tags.suffix.as_deref(), Some("_2024_01_05_B08"));
    }

    #[test]
    fn test_replace_pixels_same_shape() {
        let samples = vec![sample("B08", 10, 10, 1.0)];
        let composite = assemble(samples, &["B08".to_string()], &scene()).unwrap();
        let replaced = composite
            .replace_pixels(Array3::from_elem((1, 10, 10), 9.0_f32))
            .unwrap();
        assert_eq!(replaced.meta.transform.a, 5.0);
        assert_eq!(replaced.meta.transform.e, -5.0);
    }

    #[test]
    fn test_replace_pixels_band_count_mismatch() {
        let samples = vec![sample("B08", 10, 10, 1.0)];
        let composite = assemble(samples, &["B08".to_string()], &scene()).unwrap();
        let err = composite
            .replace_pixels(Array3::from_elem((3, 20, 20), 0.0_f32))
            .unwrap_err();
        assert!(matches!(err, FetchError::DimensionMismatch { .. }));
    }
}
