//! Cloud-optimized GeoTIFF access over byte ranges.
//!
//! Opening an asset reads only the TIFF header and IFD chain (typically a
//! few KB), never the pixel data. Tile data is fetched on demand with range
//! requests, decompressed, run through the TIFF predictor, converted to
//! `f32`, and cached in the global LRU tile cache.
//!
//! Supported layout: tiled or stripped TIFFs, DEFLATE/LZW/ZSTD/JPEG or
//! uncompressed, predictors 1/2/3, with georeferencing from the
//! ModelPixelScale + ModelTiepoint tags and CRS from the GeoKey directory.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{FetchError, Result};
use crate::range_reader::{RangeReader, create_range_reader};
use crate::raster::{Affine, SampleType};
use crate::tile_cache;

// TIFF tag constants
const TAG_IMAGE_WIDTH: u16 = 256;
const TAG_IMAGE_LENGTH: u16 = 257;
const TAG_BITS_PER_SAMPLE: u16 = 258;
const TAG_COMPRESSION: u16 = 259;
const TAG_STRIP_OFFSETS: u16 = 273;
const TAG_SAMPLES_PER_PIXEL: u16 = 277;
const TAG_ROWS_PER_STRIP: u16 = 278;
const TAG_STRIP_BYTE_COUNTS: u16 = 279;
const TAG_PREDICTOR: u16 = 317;
const TAG_TILE_WIDTH: u16 = 322;
const TAG_TILE_LENGTH: u16 = 323;
const TAG_TILE_OFFSETS: u16 = 324;
const TAG_TILE_BYTE_COUNTS: u16 = 325;
const TAG_SAMPLE_FORMAT: u16 = 339;
const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
const TAG_MODEL_TIEPOINT: u16 = 33922;
const TAG_GEO_KEY_DIRECTORY: u16 = 34735;
const TAG_GDAL_NODATA: u16 = 42113;

// GeoKey constants
const GEO_KEY_GEOGRAPHIC_TYPE: u16 = 2048;
const GEO_KEY_PROJECTED_CRS: u16 = 3072;

/// Compression method declared by the asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Lzw,
    Jpeg,
    Deflate,
    Zstd,
}

impl Compression {
    #[must_use]
    pub fn from_tag(value: u16) -> Option<Self> {
        match value {
            1 => Some(Compression::None),
            5 => Some(Compression::Lzw),
            7 => Some(Compression::Jpeg),
            8 | 32946 => Some(Compression::Deflate), // 32946 is old deflate
            50000 => Some(Compression::Zstd),
            _ => None,
        }
    }
}

/// Asset metadata read from the primary IFD without loading tile data.
#[derive(Debug, Clone)]
pub struct CogMeta {
    pub width: usize,
    pub height: usize,

    /// Tile dimensions; for stripped TIFFs a strip is treated as a tile
    /// spanning the full image width.
    pub tile_width: usize,
    pub tile_height: usize,

    pub bands: usize,
    pub sample_type: SampleType,
    pub compression: Compression,
    /// Predictor (1=none, 2=horizontal differencing, 3=floating point)
    pub predictor: u16,
    pub little_endian: bool,

    pub tile_offsets: Vec<u64>,
    pub tile_byte_counts: Vec<u64>,
    pub tiles_across: usize,
    pub tiles_down: usize,
    pub is_tiled: bool,

    /// ModelPixelScale (`x_scale`, `y_scale`, `z_scale`)
    pub pixel_scale: Option<[f64; 3]>,
    /// ModelTiepoint (i, j, k, x, y, z)
    pub tiepoint: Option<[f64; 6]>,

    /// CRS EPSG code from the GeoKey directory
    pub crs_epsg: Option<i32>,
    pub nodata: Option<f64>,
}

impl CogMeta {
    /// Affine transform of the full-resolution grid, if the asset carries
    /// georeferencing tags.
    #[must_use]
    pub fn transform(&self) -> Option<Affine> {
        let scale = self.pixel_scale?;
        let tiepoint = self.tiepoint?;
        Some(Affine::from_scale_tiepoint(scale, tiepoint))
    }
}

/// Reduced-resolution level parsed from a subsequent IFD.
#[derive(Debug, Clone)]
pub struct OverviewMeta {
    pub width: usize,
    pub height: usize,
    pub tile_width: usize,
    pub tile_height: usize,
    pub tiles_across: usize,
    pub tiles_down: usize,
    pub tile_offsets: Vec<u64>,
    pub tile_byte_counts: Vec<u64>,
    /// Scale factor relative to full resolution (2, 4, 8, ...), floor
    /// division of widths as GDAL computes it.
    pub scale: usize,
}

/// Pixel-grid layout of one resolution level.
#[derive(Debug, Clone, Copy)]
pub struct LevelLayout {
    pub width: usize,
    pub height: usize,
    pub tile_width: usize,
    pub tile_height: usize,
    pub tiles_across: usize,
    /// Scale factor relative to the full-resolution grid.
    pub scale: usize,
}

/// A cloud-optimized raster asset opened for windowed reads.
pub struct CogSource {
    reader: Arc<dyn RangeReader>,
    pub meta: CogMeta,
    /// Overview levels, in IFD order (finest to coarsest for COGs).
    pub overviews: Vec<OverviewMeta>,
}

impl std::fmt::Debug for CogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CogSource")
            .field("meta", &self.meta)
            .field("overviews", &self.overviews)
            .finish_non_exhaustive()
    }
}

impl CogSource {
    /// Open an asset from a local path, HTTP(S) URL, or S3 URL.
    ///
    /// Reads only the header and IFD chain.
    pub fn open(source: &str) -> Result<Self> {
        let reader = create_range_reader(source)?;
        Self::from_reader(reader)
    }

    /// Open from an existing range reader.
    pub fn from_reader(reader: Arc<dyn RangeReader>) -> Result<Self> {
        let header = reader.read_range(0, 8)?;
        if header.len() < 8 {
            return Err(FetchError::DecodeError("truncated TIFF header".into()));
        }

        let little_endian = match &header[0..2] {
            b"II" => true,
            b"MM" => false,
            _ => return Err(FetchError::DecodeError("invalid TIFF signature".into())),
        };

        let version = read_u16(&header[2..4], little_endian);
        if version != 42 {
            return Err(FetchError::DecodeError(format!(
                "invalid TIFF version: {version}"
            )));
        }

        let ifd_offset = read_u32(&header[4..8], little_endian);
        let file_size = reader.size();

        let ifd_bytes = read_ifd_block(&reader, u64::from(ifd_offset), file_size)?;
        let (meta, next_ifd_offset) = parse_primary_ifd(&ifd_bytes, &reader, little_endian)?;

        // Walk the IFD chain for overview levels
        let mut overviews = Vec::new();
        let mut current_offset = next_ifd_offset;
        let full_width = meta.width;

        while current_offset != 0 {
            let ovr_bytes = read_ifd_block(&reader, u64::from(current_offset), file_size)?;
            match parse_overview_ifd(&ovr_bytes, &reader, little_endian) {
                Ok((mut ovr, next_offset)) => {
                    // Floor division matches GDAL: 20966/1310 -> 16, not 17
                    ovr.scale = (full_width / ovr.width).max(1);
                    overviews.push(ovr);
                    current_offset = next_offset;
                }
                Err(_) => break,
            }

            // COGs typically carry at most ~10 levels
            if overviews.len() > 12 {
                break;
            }
        }

        Ok(Self {
            reader,
            meta,
            overviews,
        })
    }

    /// Identifier of the underlying source (URL or path).
    #[must_use]
    pub fn identifier(&self) -> &str {
        self.reader.identifier()
    }

    /// Layout of a resolution level; `None` selects full resolution.
    #[must_use]
    pub fn layout(&self, level: Option<usize>) -> LevelLayout {
        match level {
            Some(idx) => {
                let ovr = &self.overviews[idx];
                LevelLayout {
                    width: ovr.width,
                    height: ovr.height,
                    tile_width: ovr.tile_width,
                    tile_height: ovr.tile_height,
                    tiles_across: ovr.tiles_across,
                    scale: ovr.scale,
                }
            }
            None => LevelLayout {
                width: self.meta.width,
                height: self.meta.height,
                tile_width: self.meta.tile_width,
                tile_height: self.meta.tile_height,
                tiles_across: self.meta.tiles_across,
                scale: 1,
            },
        }
    }

    /// Pick the coarsest overview whose scale does not exceed
    /// `needed_scale` (source pixels per output pixel). Returns `None` when
    /// full resolution is required.
    #[must_use]
    pub fn best_overview_for_scale(&self, needed_scale: f64) -> Option<usize> {
        if needed_scale < 1.5 {
            return None;
        }

        let mut best_idx = None;
        let mut best_scale = 0usize;
        for (idx, ovr) in self.overviews.iter().enumerate() {
            if ovr.scale as f64 <= needed_scale && ovr.scale > best_scale {
                best_scale = ovr.scale;
                best_idx = Some(idx);
            }
        }
        best_idx
    }

    /// Read one tile at a resolution level, decompressed and converted to
    /// `f32`. Cached globally; empty tiles (zero byte count) come back
    /// NaN-filled.
    pub fn read_tile(&self, level: Option<usize>, tile_index: usize) -> Result<Arc<Vec<f32>>> {
        let source_id = self.reader.identifier();

        if let Some(cached) = tile_cache::get(source_id, level, tile_index) {
            return Ok(cached);
        }

        let (offsets, byte_counts, tile_width, tile_height) = match level {
            Some(idx) => {
                let ovr = self.overviews.get(idx).ok_or_else(|| {
                    FetchError::DecodeError(format!("overview index {idx} out of range"))
                })?;
                (
                    &ovr.tile_offsets,
                    &ovr.tile_byte_counts,
                    ovr.tile_width,
                    ovr.tile_height,
                )
            }
            None => (
                &self.meta.tile_offsets,
                &self.meta.tile_byte_counts,
                self.meta.tile_width,
                self.meta.tile_height,
            ),
        };

        if tile_index >= offsets.len() {
            return Err(FetchError::DecodeError(format!(
                "tile index {tile_index} out of range (max {})",
                offsets.len()
            )));
        }

        let offset = offsets[tile_index];
        let byte_count = byte_counts[tile_index] as usize;

        if byte_count == 0 {
            let pixel_count = tile_width * tile_height * self.meta.bands;
            let blank = Arc::new(vec![f32::NAN; pixel_count]);
            tile_cache::insert(source_id, level, tile_index, Arc::clone(&blank));
            return Ok(blank);
        }

        let compressed = self.reader.read_range(offset, byte_count)?;

        let decompressed = decompress_tile(
            &compressed,
            self.meta.compression,
            tile_width,
            tile_height,
            self.meta.bands,
            self.meta.sample_type.bytes_per_sample(),
        )?;

        let unpredicted = apply_predictor(
            decompressed,
            self.meta.predictor,
            tile_width,
            self.meta.bands,
            self.meta.sample_type.bytes_per_sample(),
        )?;

        let result = Arc::new(convert_to_f32(
            &unpredicted,
            self.meta.sample_type,
            self.meta.little_endian,
        ));

        tile_cache::insert(source_id, level, tile_index, Arc::clone(&result));

        Ok(result)
    }
}

/// Read an IFD block, clamped to the bytes available in the file.
fn read_ifd_block(reader: &Arc<dyn RangeReader>, offset: u64, file_size: u64) -> Result<Vec<u8>> {
    if file_size > 0 && offset >= file_size {
        return Err(FetchError::DecodeError(format!(
            "IFD offset {offset} beyond end of file ({file_size} bytes)"
        )));
    }
    // Typical COG IFDs fit well under 4KB
    let estimate = if file_size > 0 {
        4096.min((file_size - offset) as usize)
    } else {
        4096
    };
    reader.read_range(offset, estimate)
}

// ============================================================================
// IFD parsing
// ============================================================================

struct IfdEntry {
    field_type: u16,
    count: u32,
    value_offset: u32,
    raw_bytes: [u8; 4],
}

#[inline]
fn read_u16(bytes: &[u8], little_endian: bool) -> u16 {
    if little_endian {
        u16::from_le_bytes([bytes[0], bytes[1]])
    } else {
        u16::from_be_bytes([bytes[0], bytes[1]])
    }
}

#[inline]
fn read_u32(bytes: &[u8], little_endian: bool) -> u32 {
    if little_endian {
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    } else {
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

#[inline]
fn read_u64(bytes: &[u8], little_endian: bool) -> u64 {
    let arr: [u8; 8] = bytes[..8].try_into().unwrap_or([0; 8]);
    if little_endian {
        u64::from_le_bytes(arr)
    } else {
        u64::from_be_bytes(arr)
    }
}

#[inline]
fn read_f64(bytes: &[u8], little_endian: bool) -> f64 {
    let arr: [u8; 8] = bytes[..8].try_into().unwrap_or([0; 8]);
    if little_endian {
        f64::from_le_bytes(arr)
    } else {
        f64::from_be_bytes(arr)
    }
}

/// Parse IFD entries into a tag map and return the following IFD offset.
fn parse_entries(ifd_bytes: &[u8], little_endian: bool) -> (HashMap<u16, IfdEntry>, u32) {
    let entry_count = if ifd_bytes.len() >= 2 {
        read_u16(&ifd_bytes[0..2], little_endian) as usize
    } else {
        0
    };

    let mut tags: HashMap<u16, IfdEntry> = HashMap::with_capacity(entry_count);

    for i in 0..entry_count {
        let offset = 2 + i * 12;
        if offset + 12 > ifd_bytes.len() {
            break;
        }

        let tag = read_u16(&ifd_bytes[offset..offset + 2], little_endian);
        let field_type = read_u16(&ifd_bytes[offset + 2..offset + 4], little_endian);
        let count = read_u32(&ifd_bytes[offset + 4..offset + 8], little_endian);
        let value_offset = read_u32(&ifd_bytes[offset + 8..offset + 12], little_endian);

        tags.insert(
            tag,
            IfdEntry {
                field_type,
                count,
                value_offset,
                raw_bytes: [
                    ifd_bytes[offset + 8],
                    ifd_bytes[offset + 9],
                    ifd_bytes[offset + 10],
                    ifd_bytes[offset + 11],
                ],
            },
        );
    }

    let next_ifd_pos = 2 + entry_count * 12;
    let next_ifd_offset = if next_ifd_pos + 4 <= ifd_bytes.len() {
        read_u32(&ifd_bytes[next_ifd_pos..next_ifd_pos + 4], little_endian)
    } else {
        0
    };

    (tags, next_ifd_offset)
}

fn parse_primary_ifd(
    ifd_bytes: &[u8],
    reader: &Arc<dyn RangeReader>,
    little_endian: bool,
) -> Result<(CogMeta, u32)> {
    let (tags, next_ifd_offset) = parse_entries(ifd_bytes, little_endian);

    let width = get_tag_value(&tags, TAG_IMAGE_WIDTH, little_endian)
        .ok_or_else(|| FetchError::DecodeError("missing ImageWidth tag".into()))?
        as usize;
    let height = get_tag_value(&tags, TAG_IMAGE_LENGTH, little_endian)
        .ok_or_else(|| FetchError::DecodeError("missing ImageLength tag".into()))?
        as usize;

    // BitsPerSample and SampleFormat are per-band arrays on multiband
    // assets; bands share one type, so the first entry decides
    let bits_per_sample =
        read_tag_first(&tags, TAG_BITS_PER_SAMPLE, reader, little_endian).unwrap_or(8) as u16;
    let sample_format =
        read_tag_first(&tags, TAG_SAMPLE_FORMAT, reader, little_endian).unwrap_or(1) as u16;
    let bands = get_tag_value(&tags, TAG_SAMPLES_PER_PIXEL, little_endian).unwrap_or(1) as usize;
    let compression_val = get_tag_value(&tags, TAG_COMPRESSION, little_endian).unwrap_or(1) as u16;
    let predictor = get_tag_value(&tags, TAG_PREDICTOR, little_endian).unwrap_or(1) as u16;

    let sample_type = SampleType::from_tags(bits_per_sample, sample_format).ok_or_else(|| {
        FetchError::DecodeError(format!(
            "unsupported sample type: bits={bits_per_sample}, format={sample_format}"
        ))
    })?;

    let compression = Compression::from_tag(compression_val).ok_or_else(|| {
        FetchError::DecodeError(format!("unsupported compression: {compression_val}"))
    })?;

    let is_tiled = tags.contains_key(&TAG_TILE_OFFSETS);
    let has_strips = tags.contains_key(&TAG_STRIP_OFFSETS);

    // For tiled layouts use the tile grid; strips become full-width tiles
    let (tile_width, tile_height, tiles_across, tiles_down, tile_offsets, tile_byte_counts) =
        if is_tiled {
            let tw =
                get_tag_value(&tags, TAG_TILE_WIDTH, little_endian).unwrap_or(width as u32) as usize;
            let th = get_tag_value(&tags, TAG_TILE_LENGTH, little_endian).unwrap_or(height as u32)
                as usize;
            let ta = width.div_ceil(tw);
            let td = height.div_ceil(th);
            let total = ta * td;

            let offsets =
                read_tag_array_u64(&tags, TAG_TILE_OFFSETS, reader, little_endian, total)?;
            let counts =
                read_tag_array_u64(&tags, TAG_TILE_BYTE_COUNTS, reader, little_endian, total)?;

            (tw, th, ta, td, offsets, counts)
        } else if has_strips {
            let rows_per_strip = get_tag_value(&tags, TAG_ROWS_PER_STRIP, little_endian)
                .unwrap_or(height as u32) as usize;
            let td = height.div_ceil(rows_per_strip.max(1));

            let offsets = read_tag_array_u64(&tags, TAG_STRIP_OFFSETS, reader, little_endian, td)?;
            let counts =
                read_tag_array_u64(&tags, TAG_STRIP_BYTE_COUNTS, reader, little_endian, td)?;

            (width, rows_per_strip, 1, td, offsets, counts)
        } else {
            return Err(FetchError::DecodeError(
                "TIFF has neither tile nor strip tags".into(),
            ));
        };

    let pixel_scale = read_tag_f64_array(&tags, TAG_MODEL_PIXEL_SCALE, reader, little_endian, 3)?
        .map(|v| [v[0], v[1], v[2]]);
    let tiepoint = read_tag_f64_array(&tags, TAG_MODEL_TIEPOINT, reader, little_endian, 6)?
        .map(|v| [v[0], v[1], v[2], v[3], v[4], v[5]]);

    let crs_epsg = read_crs_from_geokeys(&tags, reader, little_endian)?;
    let nodata = read_gdal_nodata(&tags, reader)?;

    Ok((
        CogMeta {
            width,
            height,
            tile_width,
            tile_height,
            bands,
            sample_type,
            compression,
            predictor,
            little_endian,
            tile_offsets,
            tile_byte_counts,
            tiles_across,
            tiles_down,
            is_tiled,
            pixel_scale,
            tiepoint,
            crs_epsg,
            nodata,
        },
        next_ifd_offset,
    ))
}

/// Parse an overview IFD: dimensions and tiling only, everything else is
/// inherited from the primary IFD.
fn parse_overview_ifd(
    ifd_bytes: &[u8],
    reader: &Arc<dyn RangeReader>,
    little_endian: bool,
) -> Result<(OverviewMeta, u32)> {
    let (tags, next_ifd_offset) = parse_entries(ifd_bytes, little_endian);

    let width = get_tag_value(&tags, TAG_IMAGE_WIDTH, little_endian)
        .ok_or_else(|| FetchError::DecodeError("overview missing ImageWidth tag".into()))?
        as usize;
    let height = get_tag_value(&tags, TAG_IMAGE_LENGTH, little_endian)
        .ok_or_else(|| FetchError::DecodeError("overview missing ImageLength tag".into()))?
        as usize;

    let tile_width = get_tag_value(&tags, TAG_TILE_WIDTH, little_endian)
        .ok_or_else(|| FetchError::DecodeError("overview missing TileWidth tag".into()))?
        as usize;
    let tile_height = get_tag_value(&tags, TAG_TILE_LENGTH, little_endian)
        .ok_or_else(|| FetchError::DecodeError("overview missing TileLength tag".into()))?
        as usize;

    let tiles_across = width.div_ceil(tile_width);
    let tiles_down = height.div_ceil(tile_height);
    let total = tiles_across * tiles_down;

    let tile_offsets = read_tag_array_u64(&tags, TAG_TILE_OFFSETS, reader, little_endian, total)?;
    let tile_byte_counts =
        read_tag_array_u64(&tags, TAG_TILE_BYTE_COUNTS, reader, little_endian, total)?;

    Ok((
        OverviewMeta {
            width,
            height,
            tile_width,
            tile_height,
            tiles_across,
            tiles_down,
            tile_offsets,
            tile_byte_counts,
            scale: 1, // filled in by the caller from the width ratio
        },
        next_ifd_offset,
    ))
}

fn get_tag_value(tags: &HashMap<u16, IfdEntry>, tag: u16, little_endian: bool) -> Option<u32> {
    let entry = tags.get(&tag)?;

    if entry.count == 1 {
        match entry.field_type {
            1 => Some(u32::from(entry.raw_bytes[0])),
            3 => Some(u32::from(read_u16(&entry.raw_bytes, little_endian))),
            4 => Some(read_u32(&entry.raw_bytes, little_endian)),
            _ => None,
        }
    } else {
        None
    }
}

/// First value of a tag that may be scalar or a per-band array.
fn read_tag_first(
    tags: &HashMap<u16, IfdEntry>,
    tag: u16,
    reader: &Arc<dyn RangeReader>,
    little_endian: bool,
) -> Option<u32> {
    if let Some(v) = get_tag_value(tags, tag, little_endian) {
        return Some(v);
    }
    read_tag_array_u64(tags, tag, reader, little_endian, 0)
        .ok()?
        .first()
        .map(|v| *v as u32)
}

fn read_tag_array_u64(
    tags: &HashMap<u16, IfdEntry>,
    tag: u16,
    reader: &Arc<dyn RangeReader>,
    little_endian: bool,
    expected_count: usize,
) -> Result<Vec<u64>> {
    let entry = tags
        .get(&tag)
        .ok_or_else(|| FetchError::DecodeError(format!("missing tag {tag}")))?;

    let type_size = match entry.field_type {
        3 => 2,  // SHORT
        4 => 4,  // LONG
        16 => 8, // LONG8
        _ => {
            return Err(FetchError::DecodeError(format!(
                "unsupported type {} for tag {tag}",
                entry.field_type
            )));
        }
    };

    let total_bytes = entry.count as usize * type_size;

    let raw_bytes = if total_bytes <= 4 {
        entry.raw_bytes[..total_bytes].to_vec()
    } else {
        reader.read_range(u64::from(entry.value_offset), total_bytes)?
    };

    let mut values = Vec::with_capacity(entry.count as usize);
    for i in 0..entry.count as usize {
        let offset = i * type_size;
        let value = match entry.field_type {
            3 => u64::from(read_u16(&raw_bytes[offset..], little_endian)),
            4 => u64::from(read_u32(&raw_bytes[offset..], little_endian)),
            16 => read_u64(&raw_bytes[offset..], little_endian),
            _ => 0,
        };
        values.push(value);
    }

    // Tolerate short arrays; missing entries read as empty tiles
    while values.len() < expected_count {
        values.push(0);
    }

    Ok(values)
}

fn read_tag_f64_array(
    tags: &HashMap<u16, IfdEntry>,
    tag: u16,
    reader: &Arc<dyn RangeReader>,
    little_endian: bool,
    min_count: usize,
) -> Result<Option<Vec<f64>>> {
    let Some(entry) = tags.get(&tag) else {
        return Ok(None);
    };

    // DOUBLE
    if entry.field_type != 12 || (entry.count as usize) < min_count {
        return Ok(None);
    }

    let total_bytes = entry.count as usize * 8;
    let raw_bytes = reader.read_range(u64::from(entry.value_offset), total_bytes)?;

    let mut values = Vec::with_capacity(entry.count as usize);
    for i in 0..entry.count as usize {
        values.push(read_f64(&raw_bytes[i * 8..], little_endian));
    }

    Ok(Some(values))
}

/// Extract the CRS EPSG code from the GeoKey directory tag.
fn read_crs_from_geokeys(
    tags: &HashMap<u16, IfdEntry>,
    reader: &Arc<dyn RangeReader>,
    little_endian: bool,
) -> Result<Option<i32>> {
    let Some(entry) = tags.get(&TAG_GEO_KEY_DIRECTORY) else {
        return Ok(None);
    };

    // GeoKey directory is an array of SHORTs
    if entry.field_type != 3 {
        return Ok(None);
    }

    let total_bytes = entry.count as usize * 2;
    let raw_bytes = if total_bytes <= 4 {
        entry.raw_bytes[..total_bytes].to_vec()
    } else {
        reader.read_range(u64::from(entry.value_offset), total_bytes)?
    };

    // Header: KeyDirectoryVersion, KeyRevision, MinorRevision, NumberOfKeys
    // then per key: KeyID, TIFFTagLocation, Count, Value
    if raw_bytes.len() < 8 {
        return Ok(None);
    }

    let num_keys = read_u16(&raw_bytes[6..8], little_endian) as usize;

    for i in 0..num_keys {
        let offset = 8 + i * 8;
        if offset + 8 > raw_bytes.len() {
            break;
        }

        let key_id = read_u16(&raw_bytes[offset..], little_endian);
        let value = read_u16(&raw_bytes[offset + 6..], little_endian);

        if (key_id == GEO_KEY_PROJECTED_CRS || key_id == GEO_KEY_GEOGRAPHIC_TYPE) && value > 0 {
            return Ok(Some(i32::from(value)));
        }
    }

    Ok(None)
}

fn read_gdal_nodata(
    tags: &HashMap<u16, IfdEntry>,
    reader: &Arc<dyn RangeReader>,
) -> Result<Option<f64>> {
    let Some(entry) = tags.get(&TAG_GDAL_NODATA) else {
        return Ok(None);
    };

    let total_bytes = entry.count as usize;
    let raw_bytes = if total_bytes <= 4 {
        entry.raw_bytes[..total_bytes].to_vec()
    } else {
        reader.read_range(u64::from(entry.value_offset), total_bytes)?
    };

    let nodata_str = String::from_utf8_lossy(&raw_bytes);
    let nodata_str = nodata_str.trim_end_matches('\0').trim();

    Ok(nodata_str.parse().ok())
}

// ============================================================================
// Decompression and data conversion
// ============================================================================

fn decompress_tile(
    compressed: &[u8],
    compression: Compression,
    tile_width: usize,
    tile_height: usize,
    bands: usize,
    bytes_per_sample: usize,
) -> Result<Vec<u8>> {
    let expected_size = tile_width * tile_height * bands * bytes_per_sample;

    match compression {
        Compression::None => {
            if compressed.len() >= expected_size {
                Ok(compressed[..expected_size].to_vec())
            } else {
                let mut result = compressed.to_vec();
                result.resize(expected_size, 0);
                Ok(result)
            }
        }
        Compression::Deflate => {
            use std::io::Read;
            let mut decoder = flate2::read::ZlibDecoder::new(compressed);
            let mut decompressed = Vec::with_capacity(expected_size);
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| FetchError::DecodeError(format!("deflate: {e}")))?;
            Ok(decompressed)
        }
        Compression::Lzw => {
            let mut decoder =
                weezl::decode::Decoder::with_tiff_size_switch(weezl::BitOrder::Msb, 8);
            decoder
                .decode(compressed)
                .map_err(|e| FetchError::DecodeError(format!("lzw: {e}")))
        }
        Compression::Jpeg => {
            use image::ImageReader;
            use std::io::Cursor;

            let reader = ImageReader::with_format(Cursor::new(compressed), image::ImageFormat::Jpeg);
            let img = reader
                .decode()
                .map_err(|e| FetchError::DecodeError(format!("jpeg: {e}")))?;

            let raw = match img {
                image::DynamicImage::ImageRgb8(rgb) => rgb.into_raw(),
                image::DynamicImage::ImageLuma8(gray) => gray.into_raw(),
                other => other.to_rgb8().into_raw(),
            };
            Ok(raw)
        }
        Compression::Zstd => zstd::stream::decode_all(compressed)
            .map_err(|e| FetchError::DecodeError(format!("zstd: {e}"))),
    }
}

/// Reverse TIFF predictor encoding.
///
/// Predictor 2 differencing operates on whole samples, not bytes: multi-byte
/// samples must accumulate as integers so carries propagate between the low
/// and high bytes. Rows are independent per the TIFF specification.
fn apply_predictor(
    data: Vec<u8>,
    predictor: u16,
    tile_width: usize,
    bands: usize,
    bytes_per_sample: usize,
) -> Result<Vec<u8>> {
    match predictor {
        1 => Ok(data),

        // Horizontal differencing: original[i] = sample[i] + original[i-1]
        2 => {
            let mut result = data;
            let row_bytes = tile_width * bands * bytes_per_sample;
            let samples_per_row = tile_width * bands;

            for row in result.chunks_mut(row_bytes) {
                match bytes_per_sample {
                    1 => {
                        for i in 1..row.len() {
                            row[i] = row[i].wrapping_add(row[i - 1]);
                        }
                    }
                    2 => {
                        for i in 1..samples_per_row.min(row.len() / 2) {
                            let prev_offset = (i - 1) * 2;
                            let curr_offset = i * 2;
                            let prev = u16::from_le_bytes([row[prev_offset], row[prev_offset + 1]]);
                            let curr = u16::from_le_bytes([row[curr_offset], row[curr_offset + 1]]);
                            let sum = curr.wrapping_add(prev);
                            row[curr_offset..curr_offset + 2].copy_from_slice(&sum.to_le_bytes());
                        }
                    }
                    4 => {
                        for i in 1..samples_per_row.min(row.len() / 4) {
                            let prev_offset = (i - 1) * 4;
                            let curr_offset = i * 4;
                            let prev = u32::from_le_bytes(
                                row[prev_offset..prev_offset + 4].try_into().unwrap(),
                            );
                            let curr = u32::from_le_bytes(
                                row[curr_offset..curr_offset + 4].try_into().unwrap(),
                            );
                            let sum = curr.wrapping_add(prev);
                            row[curr_offset..curr_offset + 4].copy_from_slice(&sum.to_le_bytes());
                        }
                    }
                    8 => {
                        for i in 1..samples_per_row.min(row.len() / 8) {
                            let prev_offset = (i - 1) * 8;
                            let curr_offset = i * 8;
                            let prev = u64::from_le_bytes(
                                row[prev_offset..prev_offset + 8].try_into().unwrap(),
                            );
                            let curr = u64::from_le_bytes(
                                row[curr_offset..curr_offset + 8].try_into().unwrap(),
                            );
                            let sum = curr.wrapping_add(prev);
                            row[curr_offset..curr_offset + 8].copy_from_slice(&sum.to_le_bytes());
                        }
                    }
                    _ => {
                        for i in bytes_per_sample..row.len() {
                            row[i] = row[i].wrapping_add(row[i - bytes_per_sample]);
                        }
                    }
                }
            }

            Ok(result)
        }

        // Floating-point predictor: bytes at the same position within each
        // sample accumulate independently
        3 => {
            let mut result = data;
            let row_bytes = tile_width * bands * bytes_per_sample;

            for row in result.chunks_mut(row_bytes) {
                for byte_pos in 0..bytes_per_sample {
                    for i in 1..(row.len() / bytes_per_sample) {
                        let idx = i * bytes_per_sample + byte_pos;
                        let prev_idx = (i - 1) * bytes_per_sample + byte_pos;
                        row[idx] = row[idx].wrapping_add(row[prev_idx]);
                    }
                }
            }

            Ok(result)
        }

        _ => Err(FetchError::DecodeError(format!(
            "unsupported predictor: {predictor}"
        ))),
    }
}

fn convert_to_f32(data: &[u8], sample_type: SampleType, little_endian: bool) -> Vec<f32> {
    let bytes_per_sample = sample_type.bytes_per_sample();
    let sample_count = data.len() / bytes_per_sample;
    let mut result = Vec::with_capacity(sample_count);

    macro_rules! decode {
        ($ty:ty) => {{
            for chunk in data.chunks_exact(bytes_per_sample) {
                let arr: [u8; std::mem::size_of::<$ty>()] = chunk.try_into().unwrap();
                let v = if little_endian {
                    <$ty>::from_le_bytes(arr)
                } else {
                    <$ty>::from_be_bytes(arr)
                };
                result.push(v as f32);
            }
        }};
    }

    match sample_type {
        SampleType::UInt8 => decode!(u8),
        SampleType::Int8 => decode!(i8),
        SampleType::UInt16 => decode!(u16),
        SampleType::Int16 => decode!(i16),
        SampleType::UInt32 => decode!(u32),
        SampleType::Int32 => decode!(i32),
        SampleType::UInt64 => decode!(u64),
        SampleType::Int64 => decode!(i64),
        SampleType::Float32 => decode!(f32),
        SampleType::Float64 => decode!(f64),
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_detection() {
        assert_eq!(Compression::from_tag(1), Some(Compression::None));
        assert_eq!(Compression::from_tag(5), Some(Compression::Lzw));
        assert_eq!(Compression::from_tag(8), Some(Compression::Deflate));
        assert_eq!(Compression::from_tag(32946), Some(Compression::Deflate));
        assert_eq!(Compression::from_tag(50000), Some(Compression::Zstd));
        assert_eq!(Compression::from_tag(999), None);
    }

    #[test]
    fn test_invalid_signature_is_decode_error() {
        use crate::range_reader::MemoryRangeReader;
        let reader = Arc::new(MemoryRangeReader::new(
            b"PK\x03\x04 definitely not a tiff".to_vec(),
            "mem:bad",
        ));
        let err = CogSource::from_reader(reader).unwrap_err();
        assert!(matches!(err, FetchError::DecodeError(_)));
    }

    #[test]
    fn test_predictor2_16bit_carries() {
        // Two u16 samples per row: 1000, +24 -> 1000, 1024. The +24 delta
        // overflows the low byte (0xE8 + 0x18), so byte-level accumulation
        // would corrupt the high byte.
        let first: u16 = 1000;
        let delta: u16 = 24;
        let mut data = Vec::new();
        data.extend_from_slice(&first.to_le_bytes());
        data.extend_from_slice(&delta.to_le_bytes());

        let out = apply_predictor(data, 2, 2, 1, 2).unwrap();
        let s0 = u16::from_le_bytes([out[0], out[1]]);
        let s1 = u16::from_le_bytes([out[2], out[3]]);
        assert_eq!(s0, 1000);
        assert_eq!(s1, 1024);
    }

    #[test]
    fn test_predictor2_rows_independent() {
        // 2x2 tile of u8: second row must not accumulate from the first
        let data = vec![10, 5, 100, 1];
        let out = apply_predictor(data, 2, 2, 1, 1).unwrap();
        assert_eq!(out, vec![10, 15, 100, 101]);
    }

    #[test]
    fn test_predictor2_wrapping() {
        let data = vec![250u8, 10];
        let out = apply_predictor(data, 2, 2, 1, 1).unwrap();
        assert_eq!(out, vec![250, 4]); // 250 + 10 wraps mod 256
    }

    #[test]
    fn test_predictor_unsupported() {
        assert!(apply_predictor(vec![0u8; 4], 9, 2, 1, 1).is_err());
    }

    #[test]
    fn test_convert_u16_le() {
        let data = [1u16, 513, 65535]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect::<Vec<_>>();
        let out = convert_to_f32(&data, SampleType::UInt16, true);
        assert_eq!(out, vec![1.0, 513.0, 65535.0]);
    }

    #[test]
    fn test_convert_f32_be() {
        let data = 1.5_f32.to_be_bytes().to_vec();
        let out = convert_to_f32(&data, SampleType::Float32, false);
        assert_eq!(out, vec![1.5]);
    }

    #[test]
    fn test_decompress_uncompressed_pads_short_tile() {
        let out = decompress_tile(&[1, 2, 3], Compression::None, 2, 2, 1, 1).unwrap();
        assert_eq!(out, vec![1, 2, 3, 0]);
    }

    #[test]
    fn test_decompress_deflate_roundtrip() {
        use flate2::Compression as Flate;
        use flate2::write::ZlibEncoder;
        use std::io::Write;

        let raw: Vec<u8> = (0..16).collect();
        let mut enc = ZlibEncoder::new(Vec::new(), Flate::default());
        enc.write_all(&raw).unwrap();
        let compressed = enc.finish().unwrap();

        let out = decompress_tile(&compressed, Compression::Deflate, 4, 4, 1, 1).unwrap();
        assert_eq!(out, raw);
    }
}
