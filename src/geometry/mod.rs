pub mod projection;

use crate::error::{FetchError, Result};

/// Kilometers per degree of latitude (and of longitude at the equator).
const KM_PER_DEGREE: f64 = 111.32;

/// A simple 2D point with x and y coordinates.
///
/// Used for geographic coordinates (longitude/latitude) and for pixel
/// coordinates in window computations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    /// X coordinate (longitude for geographic points)
    pub x: f64,
    /// Y coordinate (latitude for geographic points)
    pub y: f64,
}

impl Point {
    #[inline]
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Create a point from longitude and latitude (EPSG:4326).
    #[inline]
    #[must_use]
    pub fn lonlat(lon: f64, lat: f64) -> Self {
        Self { x: lon, y: lat }
    }

    /// Get longitude (alias for x).
    #[inline]
    #[must_use]
    pub fn lon(&self) -> f64 {
        self.x
    }

    /// Get latitude (alias for y).
    #[inline]
    #[must_use]
    pub fn lat(&self) -> f64 {
        self.y
    }
}

impl From<(f64, f64)> for Point {
    #[inline]
    fn from((x, y): (f64, f64)) -> Self {
        Self::new(x, y)
    }
}

/// An axis-aligned geodetic bounding box in degrees.
///
/// Immutable once constructed. Produced either directly from caller-supplied
/// bounds (validated) or derived from a center point and half-extents in
/// kilometers. Consumed by catalog search and by both raster readers.
///
/// # Example
///
/// ```rust
/// use scenefetch::GeoBox;
///
/// // 3 km x 3 km around Saratov
/// let bbox = GeoBox::from_center_km(51.4827, 46.2086, 3.0, 3.0);
/// assert!(bbox.min_lon < bbox.max_lon);
/// assert!(bbox.min_lat < bbox.max_lat);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl GeoBox {
    /// Create a bounding box from explicit degree bounds.
    ///
    /// Fails with [`FetchError::InvalidGeometry`] unless min < max on both
    /// axes.
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Result<Self> {
        if !(min_lon < max_lon) || !(min_lat < max_lat) {
            return Err(FetchError::InvalidGeometry(format!(
                "degenerate bbox: lon [{min_lon}, {max_lon}], lat [{min_lat}, {max_lat}]"
            )));
        }
        Ok(Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        })
    }

    /// Build a bounding box around a center point from half-extents in
    /// kilometers.
    ///
    /// Longitude degrees shrink with latitude, so the east-west extent is
    /// scaled by `cos(lat)`. The approximation degenerates only at the poles
    /// (`cos(lat)` -> 0), which is left unguarded.
    #[must_use]
    pub fn from_center_km(center_lat: f64, center_lon: f64, half_width_km: f64, half_height_km: f64) -> Self {
        let (delta_lon, delta_lat) = delta_km_to_deg(center_lat, half_width_km, half_height_km);
        Self {
            min_lon: center_lon - delta_lon,
            min_lat: center_lat - delta_lat,
            max_lon: center_lon + delta_lon,
            max_lat: center_lat + delta_lat,
        }
    }

    /// Center of the box.
    #[must_use]
    pub fn center(&self) -> Point {
        Point::lonlat(
            (self.min_lon + self.max_lon) / 2.0,
            (self.min_lat + self.max_lat) / 2.0,
        )
    }

    /// Bounds as a `(minx, miny, maxx, maxy)` tuple.
    #[must_use]
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        (self.min_lon, self.min_lat, self.max_lon, self.max_lat)
    }

    /// Bounds as the `[minx, miny, maxx, maxy]` array used in catalog
    /// search payloads.
    #[must_use]
    pub fn to_array(&self) -> [f64; 4] {
        [self.min_lon, self.min_lat, self.max_lon, self.max_lat]
    }
}

/// Convert kilometer deltas at a given latitude to degree deltas.
///
/// Returns `(delta_lon_deg, delta_lat_deg)`.
#[must_use]
pub fn delta_km_to_deg(lat: f64, delta_x_km: f64, delta_y_km: f64) -> (f64, f64) {
    let delta_lat_deg = delta_y_km / KM_PER_DEGREE;
    let delta_lon_deg = delta_x_km / (KM_PER_DEGREE * lat.to_radians().cos());
    (delta_lon_deg, delta_lat_deg)
}
