//! Coordinate transformations between EPSG codes using pure Rust
//! (proj4rs + crs-definitions). No GDAL/PROJ system dependency.

use crate::error::{FetchError, Result};

/// Project a point from one CRS to another.
///
/// Handles transformations between any EPSG codes present in the
/// crs-definitions database (thousands of codes including UTM zones and
/// national grids).
///
/// # Arguments
/// * `source_epsg` - Source CRS EPSG code
/// * `target_epsg` - Target CRS EPSG code
/// * `x` - X coordinate in source CRS
/// * `y` - Y coordinate in source CRS
///
/// # Returns
/// Tuple of (x, y) in target CRS, or an error if an EPSG code is not
/// supported.
#[inline]
pub fn project_point(source_epsg: i32, target_epsg: i32, x: f64, y: f64) -> Result<(f64, f64)> {
    // No-op if same CRS
    if source_epsg == target_epsg {
        return Ok((x, y));
    }

    project_with_proj4rs(source_epsg, target_epsg, x, y)
}

/// Reproject a `(minx, miny, maxx, maxy)` bounds tuple by transforming its
/// min and max corners.
///
/// Axis-aligned corner transformation is the geometry contract of the
/// acquisition pipeline: windows are computed in the asset's own pixel grid
/// afterwards, so edge densification is unnecessary at the scales involved.
pub fn reproject_bounds(
    bounds: (f64, f64, f64, f64),
    source_epsg: i32,
    target_epsg: i32,
) -> Result<(f64, f64, f64, f64)> {
    let (minx, miny) = project_point(source_epsg, target_epsg, bounds.0, bounds.1)?;
    let (maxx, maxy) = project_point(source_epsg, target_epsg, bounds.2, bounds.3)?;
    Ok((minx, miny, maxx, maxy))
}

/// Get the PROJ4 string for an EPSG code from the crs-definitions database.
#[inline]
#[must_use]
pub fn get_proj_string(epsg: i32) -> Option<&'static str> {
    u16::try_from(epsg)
        .ok()
        .and_then(crs_definitions::from_code)
        .map(|def| def.proj4)
}

/// Check if an EPSG code represents a geographic (lon/lat) CRS.
#[inline]
#[must_use]
pub fn is_geographic_crs(epsg: i32) -> bool {
    if let Some(proj_str) = get_proj_string(epsg) {
        proj_str.contains("+proj=longlat")
    } else {
        epsg == 4326 || (epsg >= 4000 && epsg < 5000)
    }
}

fn project_with_proj4rs(source_epsg: i32, target_epsg: i32, x: f64, y: f64) -> Result<(f64, f64)> {
    use proj4rs::proj::Proj;
    use proj4rs::transform::transform;

    let source_str = get_proj_string(source_epsg).ok_or_else(|| {
        FetchError::Projection(format!(
            "EPSG:{source_epsg} is not in the crs-definitions database"
        ))
    })?;
    let target_str = get_proj_string(target_epsg).ok_or_else(|| {
        FetchError::Projection(format!(
            "EPSG:{target_epsg} is not in the crs-definitions database"
        ))
    })?;

    let source_proj = Proj::from_proj_string(source_str)
        .map_err(|e| FetchError::Projection(format!("invalid source projection EPSG:{source_epsg}: {e:?}")))?;
    let target_proj = Proj::from_proj_string(target_str)
        .map_err(|e| FetchError::Projection(format!("invalid target projection EPSG:{target_epsg}: {e:?}")))?;

    // proj4rs uses radians for geographic coordinates
    let (x_in, y_in) = if is_geographic_crs(source_epsg) {
        (x.to_radians(), y.to_radians())
    } else {
        (x, y)
    };

    let mut point = (x_in, y_in, 0.0);
    transform(&source_proj, &target_proj, &mut point).map_err(|e| {
        FetchError::Projection(format!(
            "transform from EPSG:{source_epsg} to EPSG:{target_epsg} failed: {e:?}"
        ))
    })?;

    let (out_x, out_y) = if is_geographic_crs(target_epsg) {
        (point.0.to_degrees(), point.1.to_degrees())
    } else {
        (point.0, point.1)
    };

    Ok((out_x, out_y))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-6;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < EPS
    }

    #[test]
    fn test_project_point_same_crs() {
        let (x, y) = project_point(4326, 4326, 10.0, 51.5).unwrap();
        assert!(approx_eq(x, 10.0));
        assert!(approx_eq(y, 51.5));
    }

    #[test]
    fn test_project_point_4326_to_3857_origin() {
        let (x, y) = project_point(4326, 3857, 0.0, 0.0).unwrap();
        assert!(approx_eq(x, 0.0));
        assert!(approx_eq(y, 0.0));
    }

    #[test]
    fn test_project_point_to_utm() {
        // EPSG:32633 is UTM zone 33N; easting near 500000 at zone center
        let (x, y) = project_point(4326, 32633, 15.0, 52.0).unwrap();
        assert!(x > 400_000.0 && x < 600_000.0, "UTM easting: {x}");
        assert!(y > 5_000_000.0 && y < 6_000_000.0, "UTM northing: {y}");
    }

    #[test]
    fn test_project_point_roundtrip_utm() {
        let lon = 15.0;
        let lat = 52.0;

        let (x, y) = project_point(4326, 32633, lon, lat).unwrap();
        let (lon2, lat2) = project_point(32633, 4326, x, y).unwrap();

        assert!((lon - lon2).abs() < 1e-5, "lon roundtrip: {lon} -> {lon2}");
        assert!((lat - lat2).abs() < 1e-5, "lat roundtrip: {lat} -> {lat2}");
    }

    #[test]
    fn test_reproject_bounds_identity() {
        let b = (10.0, 50.0, 11.0, 51.0);
        assert_eq!(reproject_bounds(b, 4326, 4326).unwrap(), b);
    }

    #[test]
    fn test_reproject_bounds_preserves_ordering() {
        // Sentinel-2 tiles over Saratov are in UTM zone 38N (EPSG:32638)
        let (minx, miny, maxx, maxy) =
            reproject_bounds((46.18, 51.46, 46.24, 51.50), 4326, 32638).unwrap();
        assert!(minx < maxx);
        assert!(miny < maxy);
    }

    #[test]
    fn test_get_proj_string_common_codes() {
        assert!(get_proj_string(4326).is_some(), "4326 should be in database");
        assert!(get_proj_string(3857).is_some(), "3857 should be in database");
        assert!(get_proj_string(32638).is_some(), "UTM 38N should be in database");
        assert!(get_proj_string(999_999).is_none());
    }

    #[test]
    fn test_is_geographic_crs() {
        assert!(is_geographic_crs(4326), "4326 is geographic");
        assert!(!is_geographic_crs(3857), "3857 is projected");
        assert!(!is_geographic_crs(32633), "UTM is projected");
    }

    #[test]
    fn test_unsupported_epsg_code() {
        let result = project_point(4326, 999_999, 0.0, 0.0);
        assert!(matches!(result, Err(FetchError::Projection(_))));
    }
}
