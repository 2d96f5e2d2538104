//! Windowed reads against cloud-optimized raster assets.
//!
//! Converts a geodetic bounding box into a pixel window on the asset's own
//! grid, fetches only the tiles that intersect it, and returns a
//! [`BandSample`] whose transform maps pixel (0, 0) to the top-left of the
//! intersection. When the window exceeds `max_output_size`, the read drops
//! to a raster overview and/or decimates with a single integer step on both
//! axes, preserving aspect ratio.

use ahash::AHashMap;
use ndarray::Array2;
use std::sync::Arc;

use crate::cog::CogSource;
use crate::error::{FetchError, Result};
use crate::geometry::GeoBox;
use crate::geometry::projection::reproject_bounds;
use crate::raster::{BandSample, RasterMeta};

/// A pixel window on the full-resolution grid of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PixelWindow {
    pub col0: usize,
    pub row0: usize,
    pub width: usize,
    pub height: usize,
}

/// Open a remote asset and read the sub-window covered by `bbox`.
///
/// `bbox_crs` is the EPSG code the bounding box is expressed in; it is
/// reprojected into the asset's declared CRS when they differ, so pixel
/// geometry is always computed in the asset's own grid. With
/// `max_output_size` set, the result is downsampled so that neither output
/// dimension exceeds it.
///
/// The returned sample's transform reflects the cropped (and possibly
/// resampled) window, not the original asset.
pub fn read_window(
    asset_url: &str,
    band: &str,
    bbox: &GeoBox,
    bbox_crs: i32,
    max_output_size: Option<usize>,
) -> Result<BandSample> {
    let source = CogSource::open(asset_url)?;
    read_window_from(&source, band, bbox, bbox_crs, max_output_size)
}

/// Read a sub-window from an already-opened asset.
pub fn read_window_from(
    source: &CogSource,
    band: &str,
    bbox: &GeoBox,
    bbox_crs: i32,
    max_output_size: Option<usize>,
) -> Result<BandSample> {
    let meta = &source.meta;
    let transform = meta.transform().ok_or_else(|| {
        FetchError::DecodeError(format!("asset {} has no georeferencing", source.identifier()))
    })?;

    let window = compute_window(source, bbox, bbox_crs)?;

    // Pick an overview when the full-resolution window would overshoot the
    // output size cap, then decimate the remainder with one integer step.
    let needed_scale = match max_output_size {
        Some(max) if max > 0 => window.width.max(window.height) as f64 / max as f64,
        _ => 1.0,
    };
    let level = source.best_overview_for_scale(needed_scale);
    let layout = source.layout(level);
    let scale = layout.scale;

    let lcol0 = window.col0 / scale;
    let lrow0 = window.row0 / scale;
    let lcol1 = ((window.col0 + window.width).div_ceil(scale)).min(layout.width);
    let lrow1 = ((window.row0 + window.height).div_ceil(scale)).min(layout.height);
    let lwidth = lcol1.saturating_sub(lcol0).max(1);
    let lheight = lrow1.saturating_sub(lrow0).max(1);

    let step = match max_output_size {
        Some(max) if max > 0 => lwidth.max(lheight).div_ceil(max).max(1),
        _ => 1,
    };

    let out_width = lwidth.div_ceil(step);
    let out_height = lheight.div_ceil(step);

    let pixels = sample_level_window(source, level, lcol0, lrow0, lwidth, lheight, step, 0)?;

    // Output pixel (0,0) sits at the window's top-left; the effective pixel
    // size is the full-resolution scale times overview factor times step.
    let out_transform = transform
        .window((lcol0 * scale) as f64, (lrow0 * scale) as f64)
        .rescaled((scale * step) as f64);

    let sample_meta = RasterMeta::new(
        out_width,
        out_height,
        1,
        meta.sample_type,
        meta.crs_epsg.unwrap_or(bbox_crs),
        out_transform,
        meta.nodata,
    )?;

    let pixels = Array2::from_shape_vec((out_height, out_width), pixels)
        .map_err(|e| FetchError::DecodeError(format!("window shape mismatch: {e}")))?;

    Ok(BandSample {
        band: band.to_string(),
        pixels,
        meta: sample_meta,
    })
}

/// Compute the clamped full-resolution pixel window covered by `bbox`.
pub(crate) fn compute_window(
    source: &CogSource,
    bbox: &GeoBox,
    bbox_crs: i32,
) -> Result<PixelWindow> {
    let meta = &source.meta;
    let transform = meta.transform().ok_or_else(|| {
        FetchError::DecodeError(format!("asset {} has no georeferencing", source.identifier()))
    })?;

    // Reproject into the asset's CRS; an asset without a declared CRS is
    // taken to share the caller's.
    let bounds = match meta.crs_epsg {
        Some(asset_epsg) if asset_epsg != bbox_crs => {
            reproject_bounds(bbox.bounds(), bbox_crs, asset_epsg)?
        }
        _ => bbox.bounds(),
    };
    let (minx, miny, maxx, maxy) = normalize_bounds(bounds);

    let degenerate = || {
        FetchError::DecodeError(format!(
            "asset {} has degenerate pixel scale",
            source.identifier()
        ))
    };
    let (col0f, row0f) = transform.world_to_pixel(minx, maxy).ok_or_else(degenerate)?;
    let (col1f, row1f) = transform.world_to_pixel(maxx, miny).ok_or_else(degenerate)?;

    if col1f <= 0.0 || row1f <= 0.0 || col0f >= meta.width as f64 || row0f >= meta.height as f64 {
        return Err(FetchError::EmptyIntersection(source.identifier().to_string()));
    }

    let col0 = col0f.floor().max(0.0) as usize;
    let row0 = row0f.floor().max(0.0) as usize;
    let col1 = (col1f.ceil() as usize).min(meta.width);
    let row1 = (row1f.ceil() as usize).min(meta.height);

    if col1 <= col0 || row1 <= row0 {
        return Err(FetchError::EmptyIntersection(source.identifier().to_string()));
    }

    Ok(PixelWindow {
        col0,
        row0,
        width: col1 - col0,
        height: row1 - row0,
    })
}

fn normalize_bounds(bounds: (f64, f64, f64, f64)) -> (f64, f64, f64, f64) {
    let (ax, ay, bx, by) = bounds;
    (ax.min(bx), ay.min(by), ax.max(bx), ay.max(by))
}

/// Read a `width` x `height` window at (`col0`, `row0`) of a resolution
/// level, sampling every `step` pixels of one band. Tiles are fetched once
/// each and sampled from memory.
#[allow(clippy::too_many_arguments)]
pub(crate) fn sample_level_window(
    source: &CogSource,
    level: Option<usize>,
    col0: usize,
    row0: usize,
    width: usize,
    height: usize,
    step: usize,
    band: usize,
) -> Result<Vec<f32>> {
    let layout = source.layout(level);
    let bands = source.meta.bands;

    let out_width = width.div_ceil(step);
    let out_height = height.div_ceil(step);

    // Preload every tile the window touches
    let tile_col0 = col0 / layout.tile_width;
    let tile_row0 = row0 / layout.tile_height;
    let tile_col1 = (col0 + width - 1).min(layout.width - 1) / layout.tile_width;
    let tile_row1 = (row0 + height - 1).min(layout.height - 1) / layout.tile_height;

    let mut tiles: AHashMap<usize, Arc<Vec<f32>>> = AHashMap::new();
    for tr in tile_row0..=tile_row1 {
        for tc in tile_col0..=tile_col1 {
            let idx = tr * layout.tiles_across + tc;
            tiles.insert(idx, source.read_tile(level, idx)?);
        }
    }

    let sample_pixel = |px: usize, py: usize| -> f32 {
        let tile_col = px / layout.tile_width;
        let tile_row = py / layout.tile_height;
        let tile_idx = tile_row * layout.tiles_across + tile_col;

        let Some(tile) = tiles.get(&tile_idx) else {
            return f32::NAN;
        };

        let local_x = px % layout.tile_width;
        let local_y = py % layout.tile_height;
        let pixel_idx = (local_y * layout.tile_width + local_x) * bands + band;
        tile.get(pixel_idx).copied().unwrap_or(f32::NAN)
    };

    let mut out = Vec::with_capacity(out_width * out_height);
    for oy in 0..out_height {
        let py = (row0 + oy * step).min(layout.height - 1);
        for ox in 0..out_width {
            let px = (col0 + ox * step).min(layout.width - 1);
            out.push(sample_pixel(px, py));
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::projection::project_point;
    use crate::range_reader::MemoryRangeReader;
    use crate::raster::{Affine, RasterMeta, SampleType};
    use crate::writer::GeoTiffWriter;
    use ndarray::Array3;
    use std::io::Cursor;

    /// 60x40 synthetic raster in UTM 38N: origin (600000, 5700000), 10 m
    /// pixels, value = row * 100 + col.
    fn synthetic_source(name: &str) -> CogSource {
        let pixels = Array3::from_shape_fn((1, 40, 60), |(_, r, c)| (r * 100 + c) as f32);
        let transform = Affine::new(10.0, 0.0, 600_000.0, 0.0, -10.0, 5_700_000.0);
        let meta = RasterMeta::new(60, 40, 1, SampleType::UInt16, 32638, transform, None).unwrap();

        let mut buf = Cursor::new(Vec::new());
        GeoTiffWriter::new(&pixels, &meta).write_to(&mut buf).unwrap();

        CogSource::from_reader(Arc::new(MemoryRangeReader::new(buf.into_inner(), name))).unwrap()
    }

    #[test]
    fn test_normalize_bounds_swapped() {
        assert_eq!(
            normalize_bounds((10.0, 5.0, 2.0, 8.0)),
            (2.0, 5.0, 10.0, 8.0)
        );
    }

    #[test]
    fn test_window_same_crs() {
        let source = synthetic_source("mem:window-same-crs");
        // 200 m x 100 m, 100 m in from the top-left corner
        let bbox = GeoBox::new(600_100.0, 5_699_800.0, 600_300.0, 5_699_900.0).unwrap();

        let sample = read_window_from(&source, "B04", &bbox, 32638, None).unwrap();

        assert_eq!(sample.shape(), (10, 20));
        assert_eq!(sample.band, "B04");
        assert_eq!(sample.meta.crs_epsg, 32638);

        // Pixel (0,0) maps to the intersection's top-left
        let t = sample.meta.transform;
        assert_eq!(t.pixel_to_world(0.0, 0.0), (600_100.0, 5_699_900.0));

        // Window starts at source row 10, col 10
        assert_eq!(sample.pixels[[0, 0]], 1010.0);
        assert_eq!(sample.pixels[[0, 1]], 1011.0);
        assert_eq!(sample.pixels[[1, 0]], 1110.0);
    }

    #[test]
    fn test_window_reprojects_geodetic_bbox() {
        let source = synthetic_source("mem:window-geodetic");

        // Same 20x10 pixel window as above, expressed in lon/lat
        let (lon_a, lat_a) = project_point(32638, 4326, 600_100.0, 5_699_800.0).unwrap();
        let (lon_b, lat_b) = project_point(32638, 4326, 600_300.0, 5_699_900.0).unwrap();
        let bbox = GeoBox::new(
            lon_a.min(lon_b),
            lat_a.min(lat_b),
            lon_a.max(lon_b),
            lat_a.max(lat_b),
        )
        .unwrap();

        let sample = read_window_from(&source, "B04", &bbox, 4326, None).unwrap();

        let (rows, cols) = sample.shape();
        assert!((9..=12).contains(&rows), "rows = {rows}");
        assert!((19..=22).contains(&cols), "cols = {cols}");

        // Transform maps pixel (0,0) to the intersection top-left within
        // one pixel
        let t = sample.meta.transform;
        let (x0, y0) = t.pixel_to_world(0.0, 0.0);
        assert!((x0 - 600_100.0).abs() <= 10.0, "x0 = {x0}");
        assert!((y0 - 5_699_900.0).abs() <= 10.0, "y0 = {y0}");
    }

    #[test]
    fn test_window_outside_extent() {
        let source = synthetic_source("mem:window-outside");
        let bbox = GeoBox::new(700_000.0, 5_699_000.0, 700_500.0, 5_699_500.0).unwrap();
        let err = read_window_from(&source, "B04", &bbox, 32638, None).unwrap_err();
        assert!(matches!(err, FetchError::EmptyIntersection(_)));
    }

    #[test]
    fn test_window_decimated_to_max_output_size() {
        let source = synthetic_source("mem:window-decimated");
        let bbox = GeoBox::new(600_100.0, 5_699_800.0, 600_300.0, 5_699_900.0).unwrap();

        // 20x10 window capped at 5: one integer step (4) on both axes
        let sample = read_window_from(&source, "B04", &bbox, 32638, Some(5)).unwrap();

        assert_eq!(sample.shape(), (3, 5));
        let t = sample.meta.transform;
        assert_eq!(t.a, 40.0);
        assert_eq!(t.e, -40.0);
        assert_eq!(t.pixel_to_world(0.0, 0.0), (600_100.0, 5_699_900.0));

        // Nearest-neighbour decimation keeps grid-aligned samples
        assert_eq!(sample.pixels[[0, 0]], 1010.0);
        assert_eq!(sample.pixels[[0, 1]], 1014.0);
        assert_eq!(sample.pixels[[1, 0]], 1410.0);
    }

    #[test]
    fn test_window_clamps_partial_overlap() {
        let source = synthetic_source("mem:window-partial");
        // Pokes past the west and north edges
        let bbox = GeoBox::new(599_900.0, 5_699_950.0, 600_100.0, 5_700_100.0).unwrap();

        let sample = read_window_from(&source, "B04", &bbox, 32638, None).unwrap();
        assert_eq!(sample.shape(), (5, 10));
        let t = sample.meta.transform;
        assert_eq!(t.pixel_to_world(0.0, 0.0), (600_000.0, 5_700_000.0));
        assert_eq!(sample.pixels[[0, 0]], 0.0);
    }
}
