//! GeoTIFF output for composites and cropped rasters.
//!
//! Writes valid GeoTIFFs with pure Rust (no GDAL): pixel data interleaved
//! in one strip, georeferencing via ModelPixelScale + ModelTiepoint +
//! GeoKeyDirectory, the source PROJ string as GeoAsciiParams, acquisition
//! tags as GDAL metadata XML, and the nodata value as the GDAL nodata tag.
//! Unsigned 8/16-bit data round-trips in its source type; everything else
//! is written as 32-bit float.

use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::{Path, PathBuf};

use ndarray::Array3;
use tiff::encoder::TiffEncoder;
use tiff::tags::Tag;

use crate::composite::{RasterComposite, TagSet};
use crate::error::{FetchError, Result};
use crate::geometry::projection::{get_proj_string, is_geographic_crs};
use crate::raster::{RasterMeta, SampleType};

// GeoTIFF tag IDs (not in the standard tiff crate)
const GEOTIFF_MODELPIXELSCALE: u16 = 33550;
const GEOTIFF_MODELTIEPOINT: u16 = 33922;
const GEOTIFF_GEOKEYDIRECTORY: u16 = 34735;
const GEOTIFF_GEOASCIIPARAMS: u16 = 34737;
const TAG_GDAL_METADATA: u16 = 42112;
const TAG_GDAL_NODATA: u16 = 42113;

// GeoKey IDs
const GT_MODEL_TYPE_GEO_KEY: u16 = 1024;
const GT_RASTER_TYPE_GEO_KEY: u16 = 1025;
const GEOGRAPHIC_TYPE_GEO_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_GEO_KEY: u16 = 3072;

// GeoKey values
const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;

/// Compression for GeoTIFF output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GeoTiffCompression {
    /// No compression - fastest, largest files
    #[default]
    None,
    /// Deflate (zlib) - smaller files, slower
    Deflate,
}

/// Builder for writing a band-major pixel stack as a GeoTIFF.
pub struct GeoTiffWriter<'a> {
    pixels: &'a Array3<f32>,
    meta: &'a RasterMeta,
    tags: Option<&'a TagSet>,
    compression: GeoTiffCompression,
}

impl<'a> GeoTiffWriter<'a> {
    #[must_use]
    pub fn new(pixels: &'a Array3<f32>, meta: &'a RasterMeta) -> Self {
        Self {
            pixels,
            meta,
            tags: None,
            compression: GeoTiffCompression::default(),
        }
    }

    /// Attach an acquisition tag set, written as GDAL metadata items.
    #[must_use]
    pub fn tags(mut self, tags: &'a TagSet) -> Self {
        self.tags = Some(tags);
        self
    }

    #[must_use]
    pub fn compression(mut self, compression: GeoTiffCompression) -> Self {
        self.compression = compression;
        self
    }

    /// Write to a file path.
    pub fn write<P: AsRef<Path>>(self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        self.write_to(writer)
    }

    /// Write to any writer that implements Write + Seek.
    pub fn write_to<W: Write + Seek>(self, writer: W) -> Result<()> {
        let (bands, height, width) = self.pixels.dim();

        if bands == 0 || width == 0 || height == 0 {
            return Err(FetchError::TiffWrite(format!(
                "raster has empty shape: {width}x{height}x{bands}"
            )));
        }
        if bands != self.meta.bands || width != self.meta.width || height != self.meta.height {
            return Err(FetchError::TiffWrite(format!(
                "pixel stack {width}x{height}x{bands} disagrees with metadata {}x{}x{}",
                self.meta.width, self.meta.height, self.meta.bands
            )));
        }

        let mut encoder = TiffEncoder::new(writer).map_err(write_err)?;
        self.write_image(&mut encoder, width as u32, height as u32, bands)
    }

    fn write_image<W: Write + Seek>(
        &self,
        encoder: &mut TiffEncoder<W>,
        width: u32,
        height: u32,
        bands: usize,
    ) -> Result<()> {
        let out_type = output_sample_type(self.meta.sample_type);
        let bits = (out_type.bytes_per_sample() * 8) as u16;
        let format = sample_format_tag(out_type);

        let mut dir = encoder.image_directory().map_err(write_err)?;

        dir.write_tag(Tag::ImageWidth, width).map_err(write_err)?;
        dir.write_tag(Tag::ImageLength, height).map_err(write_err)?;

        let bits_per_sample: Vec<u16> = vec![bits; bands];
        dir.write_tag(Tag::BitsPerSample, bits_per_sample.as_slice())
            .map_err(write_err)?;

        let compression_tag: u16 = match self.compression {
            GeoTiffCompression::None => 1,
            GeoTiffCompression::Deflate => 8,
        };
        dir.write_tag(Tag::Compression, compression_tag)
            .map_err(write_err)?;

        // BlackIsZero; spectral stacks are not display RGB
        dir.write_tag(Tag::PhotometricInterpretation, 1u16)
            .map_err(write_err)?;

        dir.write_tag(Tag::SamplesPerPixel, bands as u16)
            .map_err(write_err)?;

        let sample_format: Vec<u16> = vec![format; bands];
        dir.write_tag(Tag::SampleFormat, sample_format.as_slice())
            .map_err(write_err)?;

        // Chunky: interleaved B1,B2,...,B1,B2,...
        dir.write_tag(Tag::PlanarConfiguration, 1u16)
            .map_err(write_err)?;

        // Single strip holding the whole image
        dir.write_tag(Tag::RowsPerStrip, height).map_err(write_err)?;

        if bands > 1 {
            let extra_samples: Vec<u16> = vec![0; bands - 1];
            dir.write_tag(Tag::ExtraSamples, extra_samples.as_slice())
                .map_err(write_err)?;
        }

        self.write_geo_tags(&mut dir)?;
        self.write_gdal_tags(&mut dir)?;

        let strip = self.encode_strip(out_type)?;
        let strip_offset = dir.write_data(strip.as_slice()).map_err(write_err)?;
        // Classic TIFF: offsets stay LONG
        dir.write_tag(Tag::StripOffsets, strip_offset as u32)
            .map_err(write_err)?;
        dir.write_tag(Tag::StripByteCounts, strip.len() as u32)
            .map_err(write_err)?;

        dir.finish().map_err(write_err)?;

        Ok(())
    }

    /// Interleave the band-major stack into chunky pixel order and encode
    /// samples in the output type, compressing when requested.
    fn encode_strip(&self, out_type: SampleType) -> Result<Vec<u8>> {
        let (bands, height, width) = self.pixels.dim();
        let mut raw = Vec::with_capacity(width * height * bands * out_type.bytes_per_sample());

        for row in 0..height {
            for col in 0..width {
                for band in 0..bands {
                    let v = self.pixels[[band, row, col]];
                    match out_type {
                        SampleType::UInt8 => {
                            raw.push(v.round().clamp(0.0, f32::from(u8::MAX)) as u8);
                        }
                        SampleType::UInt16 => {
                            let q = v.round().clamp(0.0, f32::from(u16::MAX)) as u16;
                            raw.extend_from_slice(&q.to_le_bytes());
                        }
                        _ => raw.extend_from_slice(&v.to_le_bytes()),
                    }
                }
            }
        }

        match self.compression {
            GeoTiffCompression::None => Ok(raw),
            GeoTiffCompression::Deflate => {
                use flate2::Compression as Flate;
                use flate2::write::ZlibEncoder;

                let mut enc = ZlibEncoder::new(Vec::new(), Flate::default());
                enc.write_all(&raw)?;
                enc.finish().map_err(FetchError::from)
            }
        }
    }

    fn write_geo_tags<W: Write + Seek, K: tiff::encoder::TiffKind>(
        &self,
        dir: &mut tiff::encoder::DirectoryEncoder<W, K>,
    ) -> Result<()> {
        let t = &self.meta.transform;

        // ModelPixelScale: [ScaleX, ScaleY, ScaleZ], stored positive
        let pixel_scale = [t.a, -t.e, 0.0];
        dir.write_tag(Tag::Unknown(GEOTIFF_MODELPIXELSCALE), pixel_scale.as_slice())
            .map_err(write_err)?;

        // ModelTiepoint: pixel (0, 0) at the transform's origin
        let tiepoint = [0.0, 0.0, 0.0, t.c, t.f, 0.0];
        dir.write_tag(Tag::Unknown(GEOTIFF_MODELTIEPOINT), tiepoint.as_slice())
            .map_err(write_err)?;

        let geokeys = build_geokey_directory(self.meta.crs_epsg);
        dir.write_tag(Tag::Unknown(GEOTIFF_GEOKEYDIRECTORY), geokeys.as_slice())
            .map_err(write_err)?;

        if let Some(proj_string) = get_proj_string(self.meta.crs_epsg) {
            // Pipe-delimited, null-terminated per the GeoTIFF specification
            let ascii_params = format!("{proj_string}|");
            dir.write_tag(Tag::Unknown(GEOTIFF_GEOASCIIPARAMS), ascii_params.as_bytes())
                .map_err(write_err)?;
        }

        Ok(())
    }

    fn write_gdal_tags<W: Write + Seek, K: tiff::encoder::TiffKind>(
        &self,
        dir: &mut tiff::encoder::DirectoryEncoder<W, K>,
    ) -> Result<()> {
        if let Some(tags) = self.tags {
            let xml = gdal_metadata_xml(tags);
            dir.write_tag(Tag::Unknown(TAG_GDAL_METADATA), xml.as_bytes())
                .map_err(write_err)?;
        }

        if let Some(nodata) = self.meta.nodata {
            let value = format!("{nodata}\0");
            dir.write_tag(Tag::Unknown(TAG_GDAL_NODATA), value.as_bytes())
                .map_err(write_err)?;
        }

        Ok(())
    }
}

fn write_err(e: tiff::TiffError) -> FetchError {
    FetchError::TiffWrite(e.to_string())
}

/// Types the strip encoder can represent; others are widened to f32.
fn output_sample_type(source: SampleType) -> SampleType {
    match source {
        SampleType::UInt8 | SampleType::UInt16 => source,
        _ => SampleType::Float32,
    }
}

fn sample_format_tag(out_type: SampleType) -> u16 {
    match out_type {
        SampleType::UInt8 | SampleType::UInt16 => 1,
        _ => 3, // IEEE float
    }
}

fn build_geokey_directory(crs_epsg: i32) -> Vec<u16> {
    // [KeyDirectoryVersion, KeyRevision, MinorRevision, NumberOfKeys,
    //  KeyID, TIFFTagLocation, Count, Value, ...]
    let is_geographic = is_geographic_crs(crs_epsg);

    let mut keys = vec![1, 1, 0, 3];

    keys.extend_from_slice(&[
        GT_MODEL_TYPE_GEO_KEY,
        0,
        1,
        if is_geographic {
            MODEL_TYPE_GEOGRAPHIC
        } else {
            MODEL_TYPE_PROJECTED
        },
    ]);

    keys.extend_from_slice(&[GT_RASTER_TYPE_GEO_KEY, 0, 1, RASTER_PIXEL_IS_AREA]);

    if is_geographic {
        keys.extend_from_slice(&[GEOGRAPHIC_TYPE_GEO_KEY, 0, 1, crs_epsg as u16]);
    } else {
        keys.extend_from_slice(&[PROJECTED_CS_TYPE_GEO_KEY, 0, 1, crs_epsg as u16]);
    }

    keys
}

fn gdal_metadata_xml(tags: &TagSet) -> String {
    let mut xml = String::from("<GDALMetadata>\n");
    let mut item = |name: &str, value: &str| {
        xml.push_str(&format!(
            "  <Item name=\"{name}\">{}</Item>\n",
            xml_escape(value)
        ));
    };
    item("Title", &tags.title);
    item("CloudCover", &tags.cloud_cover.to_string());
    item("Date", &tags.datetime);
    if let Some(suffix) = &tags.suffix {
        item("Suffix", suffix);
    }
    item("Platform", &tags.platform);
    xml.push_str("</GDALMetadata>\0");
    xml
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

impl RasterComposite {
    /// Write this composite to a GeoTIFF file, tags included.
    pub fn write_geotiff<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        GeoTiffWriter::new(&self.pixels, &self.meta)
            .tags(&self.tags)
            .write(path)
    }
}

/// Persist a composite, inserting the derived suffix tag before the file
/// extension when present. Returns the path actually written.
///
/// `composites/saratov.tif` with suffix `_2024_01_05_RGB` lands at
/// `composites/saratov_2024_01_05_RGB.tif`.
pub fn save_composite<P: AsRef<Path>>(composite: &RasterComposite, path: P) -> Result<PathBuf> {
    let path = path.as_ref();

    let target = match &composite.tags.suffix {
        Some(suffix) => {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("tif");
            path.with_file_name(format!("{stem}{suffix}.{ext}"))
        }
        None => path.to_path_buf(),
    };

    composite.write_geotiff(&target)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cog::CogSource;
    use crate::range_reader::MemoryRangeReader;
    use crate::raster::Affine;
    use ndarray::Array3;
    use std::io::Cursor;
    use std::sync::Arc;

    fn test_meta(width: usize, height: usize, bands: usize, sample_type: SampleType) -> RasterMeta {
        let transform = Affine::new(10.0, 0.0, 600_000.0, 0.0, -10.0, 5_700_000.0);
        RasterMeta::new(width, height, bands, sample_type, 32638, transform, Some(0.0)).unwrap()
    }

    fn gradient(bands: usize, height: usize, width: usize) -> Array3<f32> {
        Array3::from_shape_fn((bands, height, width), |(b, r, c)| {
            (b * 10_000 + r * 100 + c) as f32
        })
    }

    #[test]
    fn test_write_and_reopen_uint16() {
        let pixels = gradient(1, 16, 20);
        let meta = test_meta(20, 16, 1, SampleType::UInt16);

        let mut buf = Cursor::new(Vec::new());
        GeoTiffWriter::new(&pixels, &meta).write_to(&mut buf).unwrap();

        let source = CogSource::from_reader(Arc::new(MemoryRangeReader::new(
            buf.into_inner(),
            "mem:write-roundtrip",
        )))
        .unwrap();

        assert_eq!(source.meta.width, 20);
        assert_eq!(source.meta.height, 16);
        assert_eq!(source.meta.bands, 1);
        assert_eq!(source.meta.sample_type, SampleType::UInt16);
        assert_eq!(source.meta.crs_epsg, Some(32638));
        assert_eq!(source.meta.nodata, Some(0.0));

        let t = source.meta.transform().unwrap();
        assert_eq!(t.pixel_to_world(0.0, 0.0), (600_000.0, 5_700_000.0));
        assert!((t.a - 10.0).abs() < 1e-9);
        assert!((t.e + 10.0).abs() < 1e-9);

        // Strip data reads back through the tile path
        let tile = source.read_tile(None, 0).unwrap();
        assert_eq!(tile[0], 0.0);
        assert_eq!(tile[1], 1.0);
        assert_eq!(tile[20], 100.0);
    }

    #[test]
    fn test_write_multiband_interleaves() {
        let pixels = gradient(3, 4, 5);
        let meta = test_meta(5, 4, 3, SampleType::UInt16);

        let mut buf = Cursor::new(Vec::new());
        GeoTiffWriter::new(&pixels, &meta).write_to(&mut buf).unwrap();

        let source = CogSource::from_reader(Arc::new(MemoryRangeReader::new(
            buf.into_inner(),
            "mem:write-multiband",
        )))
        .unwrap();
        assert_eq!(source.meta.bands, 3);

        let tile = source.read_tile(None, 0).unwrap();
        // First pixel: bands 0, 1, 2 interleaved
        assert_eq!(tile[0], 0.0);
        assert_eq!(tile[1], 10_000.0);
        assert_eq!(tile[2], 20_000.0);
    }

    #[test]
    fn test_write_deflate_roundtrip() {
        let pixels = gradient(1, 8, 8);
        let meta = test_meta(8, 8, 1, SampleType::UInt16);

        let mut buf = Cursor::new(Vec::new());
        GeoTiffWriter::new(&pixels, &meta)
            .compression(GeoTiffCompression::Deflate)
            .write_to(&mut buf)
            .unwrap();

        let source = CogSource::from_reader(Arc::new(MemoryRangeReader::new(
            buf.into_inner(),
            "mem:write-deflate",
        )))
        .unwrap();
        let tile = source.read_tile(None, 0).unwrap();
        assert_eq!(tile[9], 101.0); // row 1, col 1
    }

    #[test]
    fn test_write_float32_for_wide_types() {
        let pixels = gradient(1, 4, 4);
        let meta = test_meta(4, 4, 1, SampleType::Float64);

        let mut buf = Cursor::new(Vec::new());
        GeoTiffWriter::new(&pixels, &meta).write_to(&mut buf).unwrap();

        let source = CogSource::from_reader(Arc::new(MemoryRangeReader::new(
            buf.into_inner(),
            "mem:write-f32",
        )))
        .unwrap();
        assert_eq!(source.meta.sample_type, SampleType::Float32);
    }

    #[test]
    fn test_write_rejects_shape_mismatch() {
        let pixels = gradient(1, 4, 4);
        let meta = test_meta(5, 4, 1, SampleType::UInt16);
        let mut buf = Cursor::new(Vec::new());
        let err = GeoTiffWriter::new(&pixels, &meta).write_to(&mut buf).unwrap_err();
        assert!(matches!(err, FetchError::TiffWrite(_)));
    }

    #[test]
    fn test_gdal_metadata_xml_escapes() {
        let tags = TagSet {
            title: "A <composite> & more".to_string(),
            cloud_cover: 1.5,
            datetime: "2024-01-05T08:57:21Z".to_string(),
            suffix: Some("_2024_01_05_RGB".to_string()),
            platform: "sentinel-2a".to_string(),
        };
        let xml = gdal_metadata_xml(&tags);
        assert!(xml.contains("A &lt;composite&gt; &amp; more"));
        assert!(xml.contains("<Item name=\"Suffix\">_2024_01_05_RGB</Item>"));
        assert!(xml.contains("<Item name=\"CloudCover\">1.5</Item>"));
    }
}
