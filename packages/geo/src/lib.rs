#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! District polygon loading and point-in-polygon classification.
//!
//! Loads a `GeoJSON` feature collection of NYC borough or community
//! district boundaries, explodes `MultiPolygon` features into one
//! [`District`] per patch (mirroring the upstream TLC boundary files,
//! where each borough is published as a single multi-patch geometry),
//! and answers `classify(lon, lat)` by scanning districts in ascending
//! index order — the first containing polygon wins. The scan order is
//! load-bearing: it is the deterministic tie-break for points that sit
//! exactly on a shared edge between two districts.

use geo::{Contains, Point, Polygon};
use thiserror::Error;

/// Errors that can occur while loading district boundaries.
#[derive(Debug, Error)]
pub enum GeoError {
    /// The input could not be parsed as `GeoJSON`.
    #[error("GeoJSON parse error: {0}")]
    Parse(#[from] geojson::Error),

    /// The top-level value was not a `FeatureCollection`.
    #[error("expected a GeoJSON FeatureCollection")]
    NotAFeatureCollection,

    /// A feature was missing required properties or geometry.
    #[error("feature {index} is malformed: {message}")]
    MalformedFeature {
        /// Index of the offending feature in the collection.
        index: usize,
        /// Description of what went wrong.
        message: String,
    },
}

/// A single simple polygon with a borough-encoding integer index.
///
/// `index / 10000` recovers the borough code (§3). Districts within one
/// borough carry successive indices starting at `borough_id * 10000 + 1`.
pub struct District {
    /// Borough-encoded district index; the classifier's tie-break order.
    pub index: u32,
    /// Human-readable district/borough name.
    pub name: String,
    polygon: Polygon<f64>,
}

impl District {
    /// Returns whether `(lon, lat)` falls inside this district's polygon.
    #[must_use]
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        self.polygon.contains(&Point::new(lon, lat))
    }
}

/// An ordered, immutable collection of districts, safe to share across
/// concurrent readers once constructed.
pub struct GeoIndex {
    /// Districts sorted ascending by `index`. Scan order for `classify`.
    districts: Vec<District>,
}

impl GeoIndex {
    /// Parses a `GeoJSON` feature collection of district boundaries.
    ///
    /// Each feature must carry either a `boro_name` + `boro_code`
    /// property pair (boroughs) or a `boro_cd` property (community
    /// districts), matching the NYC TLC boundary file conventions.
    /// `MultiPolygon` geometries are exploded into one [`District`] per
    /// patch, numbered `base_index + patch_offset + 1`; a bare `Polygon`
    /// geometry is treated as a single-patch `MultiPolygon`.
    ///
    /// # Errors
    ///
    /// Returns [`GeoError`] if the input is not valid `GeoJSON`, is not
    /// a `FeatureCollection`, or a feature is missing the properties or
    /// geometry needed to assign it an index.
    pub fn load(geojson_str: &str) -> Result<Self, GeoError> {
        let parsed: geojson::GeoJson = geojson_str.parse()?;
        let collection: geojson::FeatureCollection = match parsed {
            geojson::GeoJson::FeatureCollection(fc) => fc,
            _ => return Err(GeoError::NotAFeatureCollection),
        };

        let mut districts = Vec::new();
        for (i, feature) in collection.features.into_iter().enumerate() {
            districts.extend(district_patches_from_feature(i, feature)?);
        }

        districts.sort_by_key(|d| d.index);
        log::info!("loaded {} districts", districts.len());

        Ok(Self { districts })
    }

    /// Classifies a point by scanning districts in ascending `index`
    /// order and returning the first polygon that contains it. Returns
    /// `None` if the point falls outside every known district.
    #[must_use]
    pub fn classify(&self, lon: f64, lat: f64) -> Option<u32> {
        self.districts
            .iter()
            .find(|d| d.contains(lon, lat))
            .map(|d| d.index)
    }

    /// Returns the number of loaded districts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.districts.len()
    }

    /// Returns whether no districts were loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.districts.is_empty()
    }
}

fn district_patches_from_feature(
    index: usize,
    feature: geojson::Feature,
) -> Result<Vec<District>, GeoError> {
    let properties = feature
        .properties
        .as_ref()
        .ok_or_else(|| GeoError::MalformedFeature {
            index,
            message: "missing properties".to_string(),
        })?;

    let (name, base_index) = if let Some(boro_name) = properties.get("boro_name") {
        let name = boro_name.as_str().unwrap_or_default().to_string();
        let code = property_as_i64(properties, "boro_code").ok_or_else(|| {
            GeoError::MalformedFeature {
                index,
                message: "boro_name present without numeric boro_code".to_string(),
            }
        })?;
        (name, u32::try_from(code).unwrap_or(0) * 10000)
    } else if let Some(cd) = property_as_i64(properties, "boro_cd") {
        (format!("Community District {cd}"), u32::try_from(cd).unwrap_or(0) * 100)
    } else {
        return Err(GeoError::MalformedFeature {
            index,
            message: "neither boro_name nor boro_cd present".to_string(),
        });
    };

    let geometry = feature.geometry.ok_or_else(|| GeoError::MalformedFeature {
        index,
        message: "missing geometry".to_string(),
    })?;

    let geo_geom: geo::Geometry<f64> =
        geometry.try_into().map_err(|_| GeoError::MalformedFeature {
            index,
            message: "geometry is not a Polygon or MultiPolygon".to_string(),
        })?;

    let patches: Vec<Polygon<f64>> = match geo_geom {
        geo::Geometry::Polygon(p) => vec![p],
        geo::Geometry::MultiPolygon(mp) => mp.0,
        _ => {
            return Err(GeoError::MalformedFeature {
                index,
                message: "geometry is not a Polygon or MultiPolygon".to_string(),
            });
        }
    };

    Ok(patches
        .into_iter()
        .enumerate()
        .map(|(patch_offset, polygon)| District {
            #[allow(clippy::cast_possible_truncation)]
            index: base_index + patch_offset as u32 + 1,
            name: name.clone(),
            polygon,
        })
        .collect())
}

fn property_as_i64(properties: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<i64> {
    match properties.get(key)? {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_geojson(boro_code: i32, boro_name: &str, x0: f64, y0: f64, x1: f64, y1: f64) -> String {
        format!(
            r#"{{
                "type": "FeatureCollection",
                "features": [{{
                    "type": "Feature",
                    "properties": {{ "boro_name": "{boro_name}", "boro_code": {boro_code} }},
                    "geometry": {{
                        "type": "MultiPolygon",
                        "coordinates": [[[[{x0}, {y0}], [{x1}, {y0}], [{x1}, {y1}], [{x0}, {y1}], [{x0}, {y0}]]]]
                    }}
                }}]
            }}"#
        )
    }

    #[test]
    fn classifies_point_inside_single_district() {
        let geo = GeoIndex::load(&square_geojson(1, "Manhattan", 0.0, 0.0, 10.0, 10.0)).unwrap();
        assert_eq!(geo.len(), 1);
        assert_eq!(geo.classify(5.0, 5.0), Some(10001));
        assert_eq!(geo.classify(-5.0, -5.0), None);
    }

    #[test]
    fn ascending_index_order_breaks_overlap_ties() {
        let manhattan = square_geojson(1, "Manhattan", 0.0, 0.0, 10.0, 10.0);
        let bronx = square_geojson(2, "Bronx", 5.0, 5.0, 15.0, 15.0);
        let combined = format!(
            r#"{{"type":"FeatureCollection","features":[{},{}]}}"#,
            serde_json::from_str::<serde_json::Value>(&manhattan).unwrap()["features"][0],
            serde_json::from_str::<serde_json::Value>(&bronx).unwrap()["features"][0],
        );
        let geo = GeoIndex::load(&combined).unwrap();
        // (7,7) lies in both squares; lower index (Manhattan, 10001) wins.
        assert_eq!(geo.classify(7.0, 7.0), Some(10001));
        // (12,12) lies only in the Bronx square.
        assert_eq!(geo.classify(12.0, 12.0), Some(20001));
    }

    #[test]
    fn community_district_property_derives_index() {
        let geojson = r#"{
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": { "boro_cd": 101 },
                "geometry": {
                    "type": "MultiPolygon",
                    "coordinates": [[[[0,0],[10,0],[10,10],[0,10],[0,0]]]]
                }
            }]
        }"#;
        let geo = GeoIndex::load(geojson).unwrap();
        assert_eq!(geo.classify(5.0, 5.0), Some(10101));
    }

    #[test]
    fn rejects_feature_without_recognizable_properties() {
        let geojson = r#"{
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": { "name": "mystery" },
                "geometry": {
                    "type": "MultiPolygon",
                    "coordinates": [[[[0,0],[10,0],[10,10],[0,10],[0,0]]]]
                }
            }]
        }"#;
        assert!(GeoIndex::load(geojson).is_err());
    }
}
