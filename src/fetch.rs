//! Full-asset streaming fallback.
//!
//! Strictly more expensive than a windowed read in bytes and memory; exists
//! only for stores that reject range requests. Streams the entire asset
//! body into memory in 1 MB chunks, optionally reporting byte progress to
//! an observer, then decodes it as a single-band GeoTIFF.

use std::io::{Cursor, Read};
use std::time::Duration;

use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::tags::Tag;

use crate::error::{FetchError, Result};
use crate::raster::{Affine, BandSample, RasterMeta, SampleType};

const STREAM_CHUNK_BYTES: usize = 1024 * 1024;

const TAG_GEO_KEY_DIRECTORY: u16 = 34735;
const TAG_GDAL_NODATA: u16 = 42113;
const GEO_KEY_GEOGRAPHIC_TYPE: u32 = 2048;
const GEO_KEY_PROJECTED_CRS: u32 = 3072;

/// Observer for byte progress during full-asset streaming.
///
/// Purely observational: implementations must not block and cannot alter
/// the fetch outcome. `total_bytes` is 0 when the server omits a
/// Content-Length header.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, bytes_so_far: u64, total_bytes: u64);
}

impl<F> ProgressObserver for F
where
    F: Fn(u64, u64) + Send + Sync,
{
    fn on_progress(&self, bytes_so_far: u64, total_bytes: u64) {
        self(bytes_so_far, total_bytes)
    }
}

/// Size of a remote asset in bytes via a HEAD request, when the server
/// reports one. Used to estimate transfer cost before committing to a full
/// download.
pub fn content_length(asset_url: &str) -> Result<Option<u64>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let response = client.head(asset_url).send()?;
    if !response.status().is_success() {
        return Err(FetchError::AssetUnavailable(format!(
            "HEAD {asset_url} failed: {}",
            response.status()
        )));
    }
    Ok(response.content_length())
}

/// Stream an entire remote asset into memory and decode it.
///
/// Returns the full pixel grid with the asset's native transform and CRS,
/// uncropped and unresampled.
pub fn read_full(
    asset_url: &str,
    band: &str,
    progress: Option<&dyn ProgressObserver>,
) -> Result<BandSample> {
    let buffer = stream_bytes(asset_url, progress)?;
    decode_band(&buffer, band, asset_url)
}

fn stream_bytes(asset_url: &str, progress: Option<&dyn ProgressObserver>) -> Result<Vec<u8>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(600))
        .build()?;

    let mut response = client.get(asset_url).send()?;
    if !response.status().is_success() {
        return Err(FetchError::AssetUnavailable(format!(
            "GET {asset_url} failed: {}",
            response.status()
        )));
    }

    let total = response.content_length().unwrap_or(0);
    let mut buffer = Vec::with_capacity(total as usize);
    let mut chunk = vec![0u8; STREAM_CHUNK_BYTES];

    loop {
        let n = response
            .read(&mut chunk)
            .map_err(|e| FetchError::AssetUnavailable(format!("stream from {asset_url}: {e}")))?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(observer) = progress {
            observer.on_progress(buffer.len() as u64, total);
        }
    }

    Ok(buffer)
}

/// Decode a downloaded buffer as a single-band GeoTIFF.
pub(crate) fn decode_band(buffer: &[u8], band: &str, source_id: &str) -> Result<BandSample> {
    let mut decoder = Decoder::new(Cursor::new(buffer))
        .map_err(|e| FetchError::DecodeError(format!("{source_id}: {e}")))?
        .with_limits(Limits::unlimited());

    let (width, height) = decoder
        .dimensions()
        .map_err(|e| FetchError::DecodeError(format!("{source_id}: {e}")))?;
    let (width, height) = (width as usize, height as usize);

    let pixel_scale = decoder
        .get_tag_f64_vec(Tag::ModelPixelScaleTag)
        .ok()
        .filter(|v| v.len() >= 3);
    let tiepoint = decoder
        .get_tag_f64_vec(Tag::ModelTiepointTag)
        .ok()
        .filter(|v| v.len() >= 6);

    let transform = match (pixel_scale, tiepoint) {
        (Some(scale), Some(tie)) => Affine::from_scale_tiepoint(
            [scale[0], scale[1], scale[2]],
            [tie[0], tie[1], tie[2], tie[3], tie[4], tie[5]],
        ),
        _ => {
            return Err(FetchError::DecodeError(format!(
                "{source_id} has no georeferencing"
            )));
        }
    };

    let crs_epsg = read_crs_geokeys(&mut decoder);
    let nodata = decoder
        .get_tag_ascii_string(Tag::from_u16_exhaustive(TAG_GDAL_NODATA))
        .ok()
        .and_then(|s| s.trim_end_matches('\0').trim().parse::<f64>().ok());

    let image = decoder
        .read_image()
        .map_err(|e| FetchError::DecodeError(format!("{source_id}: {e}")))?;

    let (values, sample_type) = decoding_result_to_f32(image);

    // Multi-sample images interleave channels; keep the first, matching the
    // single-band contract of spectral assets
    let samples_per_pixel = values.len() / (width * height).max(1);
    let pixels: Vec<f32> = if samples_per_pixel > 1 {
        values
            .chunks_exact(samples_per_pixel)
            .map(|px| px[0])
            .collect()
    } else {
        values
    };

    if pixels.len() != width * height {
        return Err(FetchError::DecodeError(format!(
            "{source_id}: decoded {} samples for a {width}x{height} grid",
            pixels.len()
        )));
    }

    let meta = RasterMeta::new(
        width,
        height,
        1,
        sample_type,
        crs_epsg.unwrap_or(4326),
        transform,
        nodata,
    )?;

    let pixels = ndarray::Array2::from_shape_vec((height, width), pixels)
        .map_err(|e| FetchError::DecodeError(format!("{source_id}: {e}")))?;

    Ok(BandSample {
        band: band.to_string(),
        pixels,
        meta,
    })
}

fn read_crs_geokeys<R: Read + std::io::Seek>(decoder: &mut Decoder<R>) -> Option<i32> {
    let keys = decoder
        .get_tag_u32_vec(Tag::from_u16_exhaustive(TAG_GEO_KEY_DIRECTORY))
        .ok()?;
    if keys.len() < 4 {
        return None;
    }

    let num_keys = keys[3] as usize;
    for i in 0..num_keys {
        let offset = 4 + i * 4;
        if offset + 4 > keys.len() {
            break;
        }
        let key_id = keys[offset];
        let value = keys[offset + 3];
        if (key_id == GEO_KEY_PROJECTED_CRS || key_id == GEO_KEY_GEOGRAPHIC_TYPE) && value > 0 {
            return Some(value as i32);
        }
    }
    None
}

fn decoding_result_to_f32(result: DecodingResult) -> (Vec<f32>, SampleType) {
    match result {
        DecodingResult::U8(v) => (v.into_iter().map(f32::from).collect(), SampleType::UInt8),
        DecodingResult::U16(v) => (v.into_iter().map(f32::from).collect(), SampleType::UInt16),
        DecodingResult::U32(v) => (v.into_iter().map(|x| x as f32).collect(), SampleType::UInt32),
        DecodingResult::U64(v) => (v.into_iter().map(|x| x as f32).collect(), SampleType::UInt64),
        DecodingResult::I8(v) => (v.into_iter().map(f32::from).collect(), SampleType::Int8),
        DecodingResult::I16(v) => (v.into_iter().map(f32::from).collect(), SampleType::Int16),
        DecodingResult::I32(v) => (v.into_iter().map(|x| x as f32).collect(), SampleType::Int32),
        DecodingResult::I64(v) => (v.into_iter().map(|x| x as f32).collect(), SampleType::Int64),
        DecodingResult::F16(v) => (
            v.into_iter().map(f32::from).collect(),
            SampleType::Float32,
        ),
        DecodingResult::F32(v) => (v, SampleType::Float32),
        DecodingResult::F64(v) => (v.into_iter().map(|x| x as f32).collect(), SampleType::Float64),
    }
}
