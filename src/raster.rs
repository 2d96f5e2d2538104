//! Core raster data model: affine transform algebra, sample types, and the
//! validated metadata record shared by band samples and composites.

use ndarray::Array2;

use crate::error::{FetchError, Result};

/// Six-coefficient affine transform mapping pixel (col, row) to CRS (x, y):
///
/// ```text
/// x = a * col + b * row + c
/// y = d * col + e * row + f
/// ```
///
/// `a` and `e` are the pixel scales (`e` negative for north-up rasters),
/// `b` and `d` are rotation/skew terms (zero for axis-aligned grids), and
/// `c`/`f` place pixel (0, 0) at the raster's top-left corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl Affine {
    #[must_use]
    pub fn new(a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) -> Self {
        Self { a, b, c, d, e, f }
    }

    /// Build a transform from GeoTIFF ModelPixelScale + ModelTiepoint tags.
    ///
    /// The tiepoint maps pixel (i, j) to world (x, y); GeoTIFF pixel scale
    /// is stored positive, with the Y axis implicitly inverted.
    #[must_use]
    pub fn from_scale_tiepoint(scale: [f64; 3], tiepoint: [f64; 6]) -> Self {
        let (i, j, x, y) = (tiepoint[0], tiepoint[1], tiepoint[3], tiepoint[4]);
        Self {
            a: scale[0],
            b: 0.0,
            c: x - i * scale[0],
            d: 0.0,
            e: -scale[1],
            f: y + j * scale[1],
        }
    }

    /// Convert pixel coordinates to world coordinates.
    #[inline]
    #[must_use]
    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.a * col + self.b * row + self.c,
            self.d * col + self.e * row + self.f,
        )
    }

    /// Convert world coordinates to fractional pixel coordinates.
    ///
    /// Inverts the scale terms only; returns `None` when either scale is
    /// zero. Rotated grids do not occur in the cloud-optimized assets this
    /// crate reads.
    #[inline]
    #[must_use]
    pub fn world_to_pixel(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        if self.a == 0.0 || self.e == 0.0 {
            return None;
        }
        Some(((x - self.c) / self.a, (y - self.f) / self.e))
    }

    /// Transform for a window whose top-left pixel is (`col_off`, `row_off`)
    /// of this grid: same scales, translated origin.
    #[must_use]
    pub fn window(&self, col_off: f64, row_off: f64) -> Self {
        let (c, f) = self.pixel_to_world(col_off, row_off);
        Self { c, f, ..*self }
    }

    /// Transform for the same extent sampled every `step` pixels
    /// (nearest-neighbour decimation): scales and skew multiply by `step`.
    #[must_use]
    pub fn rescaled(&self, step: f64) -> Self {
        Self {
            a: self.a * step,
            b: self.b * step,
            d: self.d * step,
            e: self.e * step,
            ..*self
        }
    }

    /// Halve the pixel-scale terms, leaving translation and skew untouched.
    ///
    /// Encodes the fixed resolution-doubling contract of
    /// [`RasterComposite::replace_pixels`](crate::composite::RasterComposite::replace_pixels):
    /// the caller supplies an array with exactly twice the spatial
    /// resolution, so each pixel covers half the ground distance.
    #[must_use]
    pub fn halve_pixel_scale(&self) -> Self {
        Self {
            a: self.a / 2.0,
            e: self.e / 2.0,
            ..*self
        }
    }

    /// X pixel size (CRS units per column).
    #[inline]
    #[must_use]
    pub fn pixel_width(&self) -> f64 {
        self.a
    }

    /// Y pixel size (CRS units per row, negative for north-up).
    #[inline]
    #[must_use]
    pub fn pixel_height(&self) -> f64 {
        self.e
    }
}

/// Numeric sample type of a raster asset, detected from TIFF tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl SampleType {
    #[must_use]
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleType::UInt8 | SampleType::Int8 => 1,
            SampleType::UInt16 | SampleType::Int16 => 2,
            SampleType::UInt32 | SampleType::Int32 | SampleType::Float32 => 4,
            SampleType::UInt64 | SampleType::Int64 | SampleType::Float64 => 8,
        }
    }

    /// Detect sample type from TIFF BitsPerSample + SampleFormat tags.
    #[must_use]
    pub fn from_tags(bits_per_sample: u16, sample_format: u16) -> Option<Self> {
        const FORMAT_UINT: u16 = 1;
        const FORMAT_INT: u16 = 2;
        const FORMAT_FLOAT: u16 = 3;

        match (sample_format, bits_per_sample) {
            (FORMAT_UINT, 8) => Some(SampleType::UInt8),
            (FORMAT_UINT, 16) => Some(SampleType::UInt16),
            (FORMAT_UINT, 32) => Some(SampleType::UInt32),
            (FORMAT_UINT, 64) => Some(SampleType::UInt64),
            (FORMAT_INT, 8) => Some(SampleType::Int8),
            (FORMAT_INT, 16) => Some(SampleType::Int16),
            (FORMAT_INT, 32) => Some(SampleType::Int32),
            (FORMAT_INT, 64) => Some(SampleType::Int64),
            (FORMAT_FLOAT, 32) => Some(SampleType::Float32),
            (FORMAT_FLOAT, 64) => Some(SampleType::Float64),
            // Default to unsigned if sample format not specified
            (_, 8) => Some(SampleType::UInt8),
            (_, 16) => Some(SampleType::UInt16),
            (_, 32) => Some(SampleType::UInt32),
            _ => None,
        }
    }
}

/// Immutable, validated raster metadata record.
///
/// Dimensions, band count, sample type, CRS, transform and nodata are
/// validated together at construction, so a metadata value that exists is
/// always internally consistent; there is no partial-update path.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterMeta {
    pub width: usize,
    pub height: usize,
    pub bands: usize,
    pub sample_type: SampleType,
    pub crs_epsg: i32,
    pub transform: Affine,
    pub nodata: Option<f64>,
    /// Output driver identifier carried through to persistence.
    pub driver: &'static str,
}

impl RasterMeta {
    pub fn new(
        width: usize,
        height: usize,
        bands: usize,
        sample_type: SampleType,
        crs_epsg: i32,
        transform: Affine,
        nodata: Option<f64>,
    ) -> Result<Self> {
        if width == 0 || height == 0 || bands == 0 {
            return Err(FetchError::InvalidGeometry(format!(
                "raster metadata with empty shape: {width}x{height}x{bands}"
            )));
        }
        if !transform.a.is_finite()
            || !transform.e.is_finite()
            || transform.a == 0.0
            || transform.e == 0.0
        {
            return Err(FetchError::InvalidGeometry(format!(
                "raster metadata with degenerate pixel scale ({}, {})",
                transform.a, transform.e
            )));
        }
        Ok(Self {
            width,
            height,
            bands,
            sample_type,
            crs_epsg,
            transform,
            nodata,
            driver: "GTiff",
        })
    }

    /// Same grid, different dimensions and transform. Revalidates.
    pub fn with_window(&self, width: usize, height: usize, transform: Affine) -> Result<Self> {
        Self::new(
            width,
            height,
            self.bands,
            self.sample_type,
            self.crs_epsg,
            transform,
            self.nodata,
        )
    }
}

/// The result of fetching one spectral band for one scene.
///
/// Transient: produced by a reader, consumed by composite assembly, not
/// retained. Pixel values are converted to `f32` at decode time regardless
/// of the source sample type; the original type is preserved in `meta` so
/// persistence can round-trip it.
#[derive(Debug, Clone)]
pub struct BandSample {
    /// Canonical band code, e.g. `B04`.
    pub band: String,
    /// Row-major single-channel pixel grid.
    pub pixels: Array2<f32>,
    pub meta: RasterMeta,
}

impl BandSample {
    /// Grid shape as (rows, cols).
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        let s = self.pixels.shape();
        (s[0], s[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn north_up(scale: f64, origin_x: f64, origin_y: f64) -> Affine {
        Affine::new(scale, 0.0, origin_x, 0.0, -scale, origin_y)
    }

    #[test]
    fn test_affine_from_scale_tiepoint() {
        let t = Affine::from_scale_tiepoint([10.0, 10.0, 0.0], [0.0, 0.0, 0.0, 600_000.0, 5_700_000.0, 0.0]);
        assert_eq!(t.pixel_to_world(0.0, 0.0), (600_000.0, 5_700_000.0));
        assert_eq!(t.pixel_to_world(2.0, 3.0), (600_020.0, 5_699_970.0));
    }

    #[test]
    fn test_affine_roundtrip() {
        let t = north_up(10.0, 399_960.0, 5_700_000.0);
        let (x, y) = t.pixel_to_world(120.5, 87.25);
        let (col, row) = t.world_to_pixel(x, y).unwrap();
        assert!((col - 120.5).abs() < 1e-9);
        assert!((row - 87.25).abs() < 1e-9);
    }

    #[test]
    fn test_affine_window_translates_origin() {
        let t = north_up(10.0, 0.0, 1000.0);
        let w = t.window(5.0, 7.0);
        assert_eq!(w.pixel_to_world(0.0, 0.0), t.pixel_to_world(5.0, 7.0));
        assert_eq!(w.a, t.a);
        assert_eq!(w.e, t.e);
    }

    #[test]
    fn test_affine_rescaled() {
        let t = north_up(10.0, 0.0, 0.0);
        let r = t.rescaled(4.0);
        assert_eq!(r.a, 40.0);
        assert_eq!(r.e, -40.0);
        assert_eq!(r.c, 0.0);
    }

    #[test]
    fn test_affine_halve_pixel_scale() {
        let t = Affine::new(10.0, 0.0, 500.0, 0.0, -10.0, 9000.0);
        let h = t.halve_pixel_scale();
        assert_eq!(h.a, 5.0);
        assert_eq!(h.e, -5.0);
        assert_eq!(h.c, 500.0);
        assert_eq!(h.f, 9000.0);
        assert_eq!(h.b, 0.0);
        assert_eq!(h.d, 0.0);
    }

    #[test]
    fn test_world_to_pixel_degenerate_scale() {
        let t = Affine::new(0.0, 0.0, 0.0, 0.0, -10.0, 0.0);
        assert!(t.world_to_pixel(1.0, 1.0).is_none());
    }

    #[test]
    fn test_sample_type_detection() {
        assert_eq!(SampleType::from_tags(16, 1), Some(SampleType::UInt16));
        assert_eq!(SampleType::from_tags(32, 3), Some(SampleType::Float32));
        assert_eq!(SampleType::from_tags(8, 0), Some(SampleType::UInt8));
        assert_eq!(SampleType::from_tags(12, 1), None);
    }

    #[test]
    fn test_raster_meta_validates_shape() {
        let t = north_up(10.0, 0.0, 0.0);
        assert!(RasterMeta::new(0, 10, 1, SampleType::UInt16, 32638, t, None).is_err());
        assert!(RasterMeta::new(10, 10, 0, SampleType::UInt16, 32638, t, None).is_err());
        assert!(RasterMeta::new(10, 10, 1, SampleType::UInt16, 32638, t, None).is_ok());
    }

    #[test]
    fn test_raster_meta_validates_scale() {
        let degenerate = Affine::new(0.0, 0.0, 0.0, 0.0, -10.0, 0.0);
        assert!(RasterMeta::new(10, 10, 1, SampleType::UInt16, 32638, degenerate, None).is_err());
    }
}
