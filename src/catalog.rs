//! Catalog search: provider strategy and STAC client.
//!
//! The choice of catalog endpoint and provider-specific band naming is data,
//! not control flow: a [`Provider`] value carries the search URL, the
//! collection id, and the band-name mapping table, and is passed explicitly
//! into every entry point. Adding a provider means adding a constructor,
//! not another branch in the pipeline.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::composite::SceneInfo;
use crate::error::{FetchError, Result};
use crate::geometry::GeoBox;

/// The 13 Sentinel-2 spectral band codes.
pub const SENTINEL2_BANDS: [&str; 13] = [
    "B01", "B02", "B03", "B04", "B05", "B06", "B07", "B08", "B8A", "B09", "B10", "B11", "B12",
];

/// Catalog provider configuration: endpoint, collection, and the mapping
/// from canonical band codes to provider-specific asset keys.
#[derive(Debug, Clone)]
pub struct Provider {
    pub name: String,
    pub search_url: String,
    pub collection: String,
    /// Canonical band code -> provider-specific asset key.
    pub band_names: HashMap<String, String>,
}

impl Provider {
    /// Microsoft Planetary Computer: assets are keyed by canonical band
    /// codes (`B04`). Usually the faster mirror.
    #[must_use]
    pub fn planetary_computer() -> Self {
        let band_names = SENTINEL2_BANDS
            .iter()
            .map(|b| (b.to_string(), b.to_string()))
            .collect();
        Self {
            name: "microsoft".to_string(),
            search_url: "https://planetarycomputer.microsoft.com/api/stac/v1/search".to_string(),
            collection: "sentinel-2-l2a".to_string(),
            band_names,
        }
    }

    /// Element84 earth-search on AWS: assets are keyed by descriptive
    /// names (`red`, `swir16`).
    #[must_use]
    pub fn element84() -> Self {
        let pairs = [
            ("B01", "coastal"),
            ("B02", "blue"),
            ("B03", "green"),
            ("B04", "red"),
            ("B05", "rededge1"),
            ("B06", "rededge2"),
            ("B07", "rededge3"),
            ("B08", "nir"),
            ("B8A", "nir08"),
            ("B09", "nir09"),
            ("B10", "cirrus"),
            ("B11", "swir16"),
            ("B12", "swir22"),
        ];
        let band_names = pairs
            .iter()
            .map(|(code, label)| (code.to_string(), label.to_string()))
            .collect();
        Self {
            name: "element84".to_string(),
            search_url: "https://earth-search.aws.element84.com/v1/search".to_string(),
            collection: "sentinel-2-l2a".to_string(),
            band_names,
        }
    }

    /// Provider-specific asset key for a canonical band code.
    #[must_use]
    pub fn asset_key(&self, canonical: &str) -> Option<&str> {
        self.band_names.get(canonical).map(String::as_str)
    }
}

/// One catalog item matching the search filter.
#[derive(Debug, Clone)]
pub struct SceneRecord {
    pub id: String,
    pub cloud_cover: f64,
    /// ISO-8601 acquisition timestamp, verbatim.
    pub datetime: String,
    pub platform: Option<String>,
    /// Asset URLs keyed by canonical band code.
    assets: HashMap<String, String>,
}

impl SceneRecord {
    /// Build a scene record directly, with assets keyed by canonical band
    /// code. Catalog searches produce records through
    /// [`search`]; this constructor serves callers that source scenes
    /// elsewhere (fixtures, local mirrors).
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        cloud_cover: f64,
        datetime: impl Into<String>,
        platform: Option<String>,
        assets: HashMap<String, String>,
    ) -> Self {
        Self {
            id: id.into(),
            cloud_cover,
            datetime: datetime.into(),
            platform,
            assets,
        }
    }

    /// Asset URL for a canonical band code.
    #[must_use]
    pub fn band_url(&self, canonical: &str) -> Option<&str> {
        self.assets.get(canonical).map(String::as_str)
    }

    /// Scene metadata consumed by composite tagging.
    #[must_use]
    pub fn info(&self) -> SceneInfo {
        SceneInfo {
            id: self.id.clone(),
            cloud_cover: self.cloud_cover,
            datetime: self.datetime.clone(),
            platform: self.platform.clone(),
        }
    }
}

// STAC wire types

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    features: Vec<StacItem>,
}

#[derive(Debug, Deserialize)]
struct StacItem {
    id: String,
    properties: ItemProperties,
    #[serde(default)]
    assets: HashMap<String, AssetRef>,
}

#[derive(Debug, Deserialize)]
struct ItemProperties {
    #[serde(rename = "eo:cloud_cover")]
    cloud_cover: Option<f64>,
    datetime: Option<String>,
    platform: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AssetRef {
    href: String,
}

#[derive(Debug, Serialize)]
struct SearchBody<'a> {
    collections: [&'a str; 1],
    bbox: [f64; 4],
    datetime: String,
    query: serde_json::Value,
    limit: u32,
}

/// Search the provider's catalog for scenes intersecting `bbox` within the
/// date range and below the cloud-cover bound.
///
/// An empty result set is success with zero scenes; transport, HTTP and
/// payload failures are [`FetchError::SearchFailed`]. Results come back in
/// catalog order.
pub fn search(
    provider: &Provider,
    bbox: &GeoBox,
    max_cloud_cover: f64,
    date_range: (&str, &str),
) -> Result<Vec<SceneRecord>> {
    let body = SearchBody {
        collections: [provider.collection.as_str()],
        bbox: bbox.to_array(),
        datetime: format!("{}/{}", date_range.0, date_range.1),
        query: json!({ "eo:cloud_cover": { "lt": max_cloud_cover } }),
        limit: 100,
    };

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .map_err(|e| FetchError::SearchFailed(e.to_string()))?;

    let response = client
        .post(&provider.search_url)
        .json(&body)
        .send()
        .map_err(|e| FetchError::SearchFailed(format!("{}: {e}", provider.search_url)))?;

    if !response.status().is_success() {
        return Err(FetchError::SearchFailed(format!(
            "{} returned {}",
            provider.search_url,
            response.status()
        )));
    }

    let parsed: SearchResponse = response
        .json()
        .map_err(|e| FetchError::SearchFailed(format!("malformed search response: {e}")))?;

    debug!(
        provider = %provider.name,
        scenes = parsed.features.len(),
        "catalog search complete"
    );

    Ok(parsed
        .features
        .into_iter()
        .map(|item| canonicalize_item(provider, item))
        .collect())
}

/// Re-key a STAC item's assets from provider labels to canonical band
/// codes.
fn canonicalize_item(provider: &Provider, item: StacItem) -> SceneRecord {
    let mut assets = HashMap::new();
    for code in SENTINEL2_BANDS {
        if let Some(label) = provider.asset_key(code)
            && let Some(asset) = item.assets.get(label)
        {
            assets.insert(code.to_string(), asset.href.clone());
        }
    }

    SceneRecord {
        id: item.id,
        cloud_cover: item.properties.cloud_cover.unwrap_or(0.0),
        datetime: item.properties.datetime.unwrap_or_default(),
        platform: item.properties.platform,
        assets,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_mapping_total_over_13_bands() {
        for provider in [Provider::planetary_computer(), Provider::element84()] {
            for code in SENTINEL2_BANDS {
                assert!(
                    provider.asset_key(code).is_some(),
                    "{} missing mapping for {code}",
                    provider.name
                );
            }
        }
    }

    #[test]
    fn test_element84_labels() {
        let provider = Provider::element84();
        assert_eq!(provider.asset_key("B04"), Some("red"));
        assert_eq!(provider.asset_key("B8A"), Some("nir08"));
        assert_eq!(provider.asset_key("B12"), Some("swir22"));
        assert_eq!(provider.asset_key("B99"), None);
    }

    #[test]
    fn test_canonicalize_item_rekeys_assets() {
        let raw = serde_json::json!({
            "id": "S2B_38VLQ_20240107_0_L2A",
            "properties": {
                "eo:cloud_cover": 4.2,
                "datetime": "2024-01-07T08:58:00Z",
                "platform": "sentinel-2b"
            },
            "assets": {
                "red": { "href": "https://example.com/B04.tif" },
                "green": { "href": "https://example.com/B03.tif" },
                "thumbnail": { "href": "https://example.com/preview.jpg" }
            }
        });
        let item: StacItem = serde_json::from_value(raw).unwrap();
        let scene = canonicalize_item(&Provider::element84(), item);

        assert_eq!(scene.band_url("B04"), Some("https://example.com/B04.tif"));
        assert_eq!(scene.band_url("B03"), Some("https://example.com/B03.tif"));
        assert_eq!(scene.band_url("B02"), None);
        assert_eq!(scene.cloud_cover, 4.2);
        assert_eq!(scene.platform.as_deref(), Some("sentinel-2b"));
    }

    #[test]
    fn test_search_response_tolerates_missing_fields() {
        let raw = serde_json::json!({
            "features": [{
                "id": "bare-item",
                "properties": {}
            }]
        });
        let parsed: SearchResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.features.len(), 1);
        let scene = canonicalize_item(&Provider::planetary_computer(), parsed.features.into_iter().next().unwrap());
        assert_eq!(scene.cloud_cover, 0.0);
        assert_eq!(scene.datetime, "");
        assert!(scene.band_url("B02").is_none());
    }

    #[test]
    fn test_scene_info_copies_metadata() {
        let scene = SceneRecord {
            id: "abc".to_string(),
            cloud_cover: 7.0,
            datetime: "2024-01-05T08:57:21Z".to_string(),
            platform: None,
            assets: HashMap::new(),
        };
        let info = scene.info();
        assert_eq!(info.id, "abc");
        assert_eq!(info.cloud_cover, 7.0);
        assert_eq!(info.datetime, "2024-01-05T08:57:21Z");
    }
}
