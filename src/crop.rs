//! Crop an already-fetched raster to a bounding box and persist the result.
//!
//! The bounding box may be expressed in a different CRS than the raster; it
//! is reprojected into the raster's own CRS before the pixel window is
//! computed. The output file shares the source's band count and sample
//! type, with transform and dimensions updated for the window.

use std::path::Path;

use ndarray::Array3;
use tracing::info;

use crate::cog::CogSource;
use crate::error::{FetchError, Result};
use crate::geometry::GeoBox;
use crate::geometry::projection::reproject_bounds;
use crate::raster::RasterMeta;
use crate::window::sample_level_window;
use crate::writer::GeoTiffWriter;

/// Crop `raster_path` to `bbox` and write the result to `output_path`.
///
/// Offsets are computed as `(coord - origin) / pixel_size` rounded to the
/// raster's grid, then clamped so the window lies entirely within the
/// source extent. Fails with [`FetchError::InvalidCropSize`], writing
/// nothing, when the clamped window has non-positive width or height,
/// meaning the bbox does not meaningfully intersect the raster.
pub fn crop_to_bbox<P: AsRef<Path>, Q: AsRef<Path>>(
    raster_path: P,
    bbox: &GeoBox,
    bbox_crs: i32,
    output_path: Q,
) -> Result<()> {
    let raster_path = raster_path.as_ref();
    let path_str = raster_path
        .to_str()
        .ok_or_else(|| FetchError::InvalidGeometry(format!("non-UTF8 path {raster_path:?}")))?;

    let source = CogSource::open(path_str)?;
    let meta = &source.meta;
    let transform = meta
        .transform()
        .ok_or_else(|| FetchError::DecodeError(format!("{path_str} has no georeferencing")))?;

    let bounds = match meta.crs_epsg {
        Some(raster_epsg) if raster_epsg != bbox_crs => {
            reproject_bounds(bbox.bounds(), bbox_crs, raster_epsg)?
        }
        _ => bbox.bounds(),
    };
    let (left, bottom, right, top) = bounds;

    // Window in grid coordinates, rounded to the pixel grid
    let pixel_width = transform.pixel_width();
    let pixel_height = -transform.pixel_height();
    let col_off = ((left - transform.c) / pixel_width).round() as i64;
    let row_off = ((transform.f - top) / pixel_height).round() as i64;
    let width = ((right - left) / pixel_width).round() as i64;
    let height = ((top - bottom) / pixel_height).round() as i64;

    if width <= 0 || height <= 0 {
        return Err(FetchError::InvalidCropSize);
    }

    // Clamp to the source extent; an empty clamped window means the bbox
    // lies outside the raster
    let col0 = col_off.max(0);
    let row0 = row_off.max(0);
    let col1 = (col_off + width).min(meta.width as i64);
    let row1 = (row_off + height).min(meta.height as i64);

    if col1 <= col0 || row1 <= row0 {
        return Err(FetchError::InvalidCropSize);
    }

    let (col0, row0) = (col0 as usize, row0 as usize);
    let out_width = (col1 - col0 as i64) as usize;
    let out_height = (row1 - row0 as i64) as usize;

    let mut stack = Array3::<f32>::zeros((meta.bands, out_height, out_width));
    for band in 0..meta.bands {
        let values =
            sample_level_window(&source, None, col0, row0, out_width, out_height, 1, band)?;
        let grid = ndarray::Array2::from_shape_vec((out_height, out_width), values)
            .map_err(|e| FetchError::DecodeError(format!("crop shape mismatch: {e}")))?;
        stack.index_axis_mut(ndarray::Axis(0), band).assign(&grid);
    }

    let out_meta = RasterMeta::new(
        out_width,
        out_height,
        meta.bands,
        meta.sample_type,
        meta.crs_epsg.unwrap_or(bbox_crs),
        transform.window(col0 as f64, row0 as f64),
        meta.nodata,
    )?;

    GeoTiffWriter::new(&stack, &out_meta).write(output_path.as_ref())?;

    info!(
        source = %path_str,
        output = %output_path.as_ref().display(),
        window = format!("{out_width}x{out_height}+{col0}+{row0}"),
        "cropped raster written"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{Affine, SampleType};
    use ndarray::Array3;
    use tempfile::tempdir;

    /// 60x40 synthetic raster in UTM 38N: origin (600000, 5700000), 10 m
    /// pixels, value = row * 100 + col.
    fn write_source(path: &Path) {
        let pixels = Array3::from_shape_fn((1, 40, 60), |(_, r, c)| (r * 100 + c) as f32);
        let transform = Affine::new(10.0, 0.0, 600_000.0, 0.0, -10.0, 5_700_000.0);
        let meta =
            RasterMeta::new(60, 40, 1, SampleType::UInt16, 32638, transform, None).unwrap();
        GeoTiffWriter::new(&pixels, &meta).write(path).unwrap();
    }

    #[test]
    fn test_crop_interior_window() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("source.tif");
        let out = dir.path().join("cropped.tif");
        write_source(&src);

        // 200 m x 100 m window starting 100 m in from the top-left corner,
        // expressed directly in the raster CRS
        let bbox = GeoBox::new(600_100.0, 5_699_800.0, 600_300.0, 5_699_900.0).unwrap();
        crop_to_bbox(&src, &bbox, 32638, &out).unwrap();

        let cropped = CogSource::open(out.to_str().unwrap()).unwrap();
        assert_eq!(cropped.meta.width, 20);
        assert_eq!(cropped.meta.height, 10);

        let t = cropped.meta.transform().unwrap();
        assert_eq!(t.pixel_to_world(0.0, 0.0), (600_100.0, 5_699_900.0));

        // Window starts at col 10, row 10
        let tile = cropped.read_tile(None, 0).unwrap();
        assert_eq!(tile[0], 1010.0);
    }

    #[test]
    fn test_crop_clamps_to_extent() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("source.tif");
        let out = dir.path().join("cropped.tif");
        write_source(&src);

        // Window pokes past the west and north edges; reads are clamped
        let bbox = GeoBox::new(599_900.0, 5_699_950.0, 600_100.0, 5_700_100.0).unwrap();
        crop_to_bbox(&src, &bbox, 32638, &out).unwrap();

        let cropped = CogSource::open(out.to_str().unwrap()).unwrap();
        assert_eq!(cropped.meta.width, 10);
        assert_eq!(cropped.meta.height, 5);
        let t = cropped.meta.transform().unwrap();
        assert_eq!(t.pixel_to_world(0.0, 0.0), (600_000.0, 5_700_000.0));
    }

    #[test]
    fn test_crop_outside_extent_fails_without_output() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("source.tif");
        let out = dir.path().join("cropped.tif");
        write_source(&src);

        // Entirely east of the raster
        let bbox = GeoBox::new(700_000.0, 5_699_000.0, 700_500.0, 5_699_500.0).unwrap();
        let err = crop_to_bbox(&src, &bbox, 32638, &out).unwrap_err();
        assert!(matches!(err, FetchError::InvalidCropSize));
        assert!(!out.exists());
    }

    #[test]
    fn test_crop_degenerate_bbox_fails() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("source.tif");
        let out = dir.path().join("cropped.tif");
        write_source(&src);

        // Narrower than one pixel: rounds to zero width
        let bbox = GeoBox::new(600_100.0, 5_699_800.0, 600_102.0, 5_699_900.0).unwrap();
        let err = crop_to_bbox(&src, &bbox, 32638, &out).unwrap_err();
        assert!(matches!(err, FetchError::InvalidCropSize));
        assert!(!out.exists());
    }
}
