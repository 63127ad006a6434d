//! Spatial and temporal filter construction.
//!
//! Normalizes a bounding box or GeoJSON polygon into the query geometry the
//! catalog and subsetter APIs accept. Validation happens here, at
//! construction, so every downstream consumer can trust the geometry.
//!
//! Axis convention: the command line takes bounding boxes as
//! `min_lat,min_lon,max_lat,max_lon`; the wire format is longitude-first.
//! A value outside its axis range is rejected, never swapped.

use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use crate::error::SubsetError;

/// Geographic bounding box in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    /// Southern bound, degrees latitude.
    pub min_lat: f64,
    /// Western bound, degrees longitude.
    pub min_lon: f64,
    /// Northern bound, degrees latitude.
    pub max_lat: f64,
    /// Eastern bound, degrees longitude.
    pub max_lon: f64,
}

/// Closed polygon ring of `(lon, lat)` vertices.
#[derive(Debug, Clone, PartialEq)]
pub struct Ring {
    vertices: Vec<(f64, f64)>,
}

impl Ring {
    /// Vertices of the ring, `(lon, lat)`, first equals last.
    pub fn vertices(&self) -> &[(f64, f64)] {
        &self.vertices
    }
}

/// Spatial constraint for a run. Exactly one variant is active.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Rectangular bounding box.
    BoundingBox(BoundingBox),
    /// Closed polygon ring.
    Polygon(Ring),
}

/// Inclusive temporal constraint with timezone-aware endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Start of the range.
    pub start: DateTime<Utc>,
    /// End of the range, `start <= end`.
    pub end: DateTime<Utc>,
}

impl Filter {
    /// Build a bounding-box filter, validating bounds and axis ranges.
    pub fn bounding_box(
        min_lat: f64,
        min_lon: f64,
        max_lat: f64,
        max_lon: f64,
    ) -> Result<Self, SubsetError> {
        for (name, value) in [("min_lat", min_lat), ("max_lat", max_lat)] {
            if !(-90.0..=90.0).contains(&value) {
                return Err(SubsetError::InvalidGeometry(format!(
                    "{name}={value} is outside [-90, 90]; bounding boxes are \
                     min_lat,min_lon,max_lat,max_lon"
                )));
            }
        }
        for (name, value) in [("min_lon", min_lon), ("max_lon", max_lon)] {
            if !(-180.0..=180.0).contains(&value) {
                return Err(SubsetError::InvalidGeometry(format!(
                    "{name}={value} is outside [-180, 180]; bounding boxes are \
                     min_lat,min_lon,max_lat,max_lon"
                )));
            }
        }
        if min_lat >= max_lat || min_lon >= max_lon {
            return Err(SubsetError::InvalidGeometry(format!(
                "degenerate bounding box: ({min_lat},{min_lon}) must be south-west \
                 of ({max_lat},{max_lon})"
            )));
        }
        Ok(Filter::BoundingBox(BoundingBox {
            min_lat,
            min_lon,
            max_lat,
            max_lon,
        }))
    }

    /// Parse a bounding box from its command-line form
    /// `"min_lat,min_lon,max_lat,max_lon"`.
    pub fn parse_bbox(input: &str) -> Result<Self, SubsetError> {
        let parts: Vec<&str> = input.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(SubsetError::InvalidGeometry(format!(
                "expected 4 comma-separated values (min_lat,min_lon,max_lat,max_lon), got {}",
                parts.len()
            )));
        }
        let mut values = [0.0f64; 4];
        for (slot, part) in values.iter_mut().zip(&parts) {
            *slot = part.parse().map_err(|_| {
                SubsetError::InvalidGeometry(format!("invalid coordinate: {part}"))
            })?;
        }
        Self::bounding_box(values[0], values[1], values[2], values[3])
    }

    /// Build a polygon filter from a closed ring of `(lon, lat)` vertices.
    ///
    /// The ring must be closed (first vertex equals last) and contain at
    /// least three distinct vertices. Orientation is normalized to
    /// counter-clockwise, which the subsetter requires. Deeper topology
    /// validation is out of scope.
    pub fn polygon(vertices: Vec<(f64, f64)>) -> Result<Self, SubsetError> {
        if vertices.len() < 4 {
            return Err(SubsetError::InvalidGeometry(format!(
                "polygon ring needs at least 3 distinct vertices plus closure, got {} points",
                vertices.len()
            )));
        }
        let first = vertices[0];
        let last = *vertices.last().expect("ring checked non-empty");
        if first != last {
            return Err(SubsetError::InvalidGeometry(
                "polygon ring is not closed: first vertex must equal last".to_string(),
            ));
        }
        let mut distinct = vertices[..vertices.len() - 1].to_vec();
        distinct.dedup();
        if distinct.len() < 3 {
            return Err(SubsetError::InvalidGeometry(format!(
                "polygon ring has only {} distinct vertices, need at least 3",
                distinct.len()
            )));
        }
        for &(lon, lat) in &vertices {
            if !(-180.0..=180.0).contains(&lon) || !(-90.0..=90.0).contains(&lat) {
                return Err(SubsetError::InvalidGeometry(format!(
                    "polygon vertex ({lon},{lat}) is outside valid lon/lat ranges"
                )));
            }
        }
        let mut vertices = vertices;
        if signed_area(&vertices) < 0.0 {
            vertices.reverse();
        }
        Ok(Filter::Polygon(Ring { vertices }))
    }

    /// Read a polygon filter from a GeoJSON file.
    ///
    /// Accepts a FeatureCollection, a single Feature, or a bare
    /// Polygon/MultiPolygon geometry; the first feature's exterior ring is
    /// used.
    pub fn polygon_from_path(path: &Path) -> Result<Self, SubsetError> {
        let content = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&content).map_err(|e| {
            SubsetError::InvalidGeometry(format!("{} is not valid GeoJSON: {e}", path.display()))
        })?;
        let ring = exterior_ring(&value).ok_or_else(|| {
            SubsetError::InvalidGeometry(format!(
                "{} contains no polygon geometry",
                path.display()
            ))
        })?;
        Self::polygon(ring)
    }

    /// Encode this filter as the catalog's spatial query parameter.
    ///
    /// Bounding boxes serialize longitude-first (`min_lon,min_lat,max_lon,
    /// max_lat`); polygons serialize as `lon1,lat1,lon2,lat2,...` in
    /// counter-clockwise order.
    pub fn cmr_query_param(&self) -> (&'static str, String) {
        match self {
            Filter::BoundingBox(b) => (
                "bounding_box",
                format!("{},{},{},{}", b.min_lon, b.min_lat, b.max_lon, b.max_lat),
            ),
            Filter::Polygon(ring) => {
                let coords: Vec<String> = ring
                    .vertices
                    .iter()
                    .map(|(lon, lat)| format!("{lon},{lat}"))
                    .collect();
                ("polygon", coords.join(","))
            }
        }
    }
}

impl TimeRange {
    /// Build a time range, validating `start <= end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, SubsetError> {
        if start > end {
            return Err(SubsetError::InvalidGeometry(format!(
                "time range start ({start}) is after end ({end})"
            )));
        }
        Ok(Self { start, end })
    }

    /// Parse a time range from its command-line form `"start,end"` with
    /// ISO-8601 timestamps. Timestamps without an offset are taken as UTC.
    pub fn parse(input: &str) -> Result<Self, SubsetError> {
        let (start, end) = input.split_once(',').ok_or_else(|| {
            SubsetError::InvalidGeometry(format!(
                "expected \"start,end\" ISO-8601 timestamps, got {input:?}"
            ))
        })?;
        Self::new(parse_timestamp(start.trim())?, parse_timestamp(end.trim())?)
    }

    /// Encode this range as the catalog's `temporal` parameter value.
    pub fn cmr_temporal_value(&self) -> String {
        format!(
            "{},{}",
            self.start.format("%Y-%m-%dT%H:%M:%SZ"),
            self.end.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, SubsetError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|_| {
            SubsetError::InvalidGeometry(format!("invalid ISO-8601 timestamp: {s}"))
        })
}

/// Shoelace sum; positive for counter-clockwise rings.
fn signed_area(vertices: &[(f64, f64)]) -> f64 {
    let mut sum = 0.0;
    for pair in vertices.windows(2) {
        let (x1, y1) = pair[0];
        let (x2, y2) = pair[1];
        sum += (x2 - x1) * (y2 + y1);
    }
    -sum / 2.0
}

/// Locate the first exterior ring in a GeoJSON value.
fn exterior_ring(value: &Value) -> Option<Vec<(f64, f64)>> {
    let geometry = match value.get("type").and_then(Value::as_str)? {
        "FeatureCollection" => value.get("features")?.as_array()?.first()?.get("geometry")?,
        "Feature" => value.get("geometry")?,
        _ => value,
    };
    let coordinates = geometry.get("coordinates")?;
    let ring = match geometry.get("type").and_then(Value::as_str)? {
        "Polygon" => coordinates.as_array()?.first()?,
        "MultiPolygon" => coordinates.as_array()?.first()?.as_array()?.first()?,
        _ => return None,
    };
    ring.as_array()?
        .iter()
        .map(|position| {
            let pair = position.as_array()?;
            Some((pair.first()?.as_f64()?, pair.get(1)?.as_f64()?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_bbox_round_trips_bounds() {
        let filter = Filter::parse_bbox("40.0,-100.0,42.0,-96.0").unwrap();
        let (key, value) = filter.cmr_query_param();
        assert_eq!(key, "bounding_box");
        // Wire format is lon-first
        assert_eq!(value, "-100,40,-96,42");
        match filter {
            Filter::BoundingBox(b) => {
                assert_eq!(b.min_lat, 40.0);
                assert_eq!(b.min_lon, -100.0);
                assert_eq!(b.max_lat, 42.0);
                assert_eq!(b.max_lon, -96.0);
            }
            _ => panic!("expected bounding box"),
        }
    }

    #[test]
    fn test_bbox_rejects_degenerate() {
        // min >= max on the latitude axis
        assert!(Filter::parse_bbox("42.0,-100.0,40.0,-96.0").is_err());
        // min >= max on the longitude axis
        assert!(Filter::parse_bbox("40.0,-96.0,42.0,-100.0").is_err());
        // zero-area box
        assert!(Filter::parse_bbox("40.0,-100.0,40.0,-100.0").is_err());
    }

    #[test]
    fn test_bbox_rejects_swapped_axis_order() {
        // lon-first input puts -100 where a latitude belongs; must error,
        // not silently swap
        let err = Filter::parse_bbox("-100.0,40.0,-96.0,42.0").unwrap_err();
        assert!(matches!(err, SubsetError::InvalidGeometry(_)));
        assert!(err.to_string().contains("[-90, 90]"));
    }

    #[test]
    fn test_bbox_rejects_malformed_input() {
        assert!(Filter::parse_bbox("40.0,-100.0,42.0").is_err());
        assert!(Filter::parse_bbox("40.0,-100.0,42.0,abc").is_err());
        assert!(Filter::parse_bbox("").is_err());
    }

    #[test]
    fn test_polygon_rejects_open_ring() {
        let open = vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)];
        let err = Filter::polygon(open).unwrap_err();
        assert!(err.to_string().contains("not closed"));
    }

    #[test]
    fn test_polygon_rejects_too_few_vertices() {
        let degenerate = vec![(0.0, 0.0), (1.0, 0.0), (0.0, 0.0)];
        assert!(Filter::polygon(degenerate).is_err());
        let repeated = vec![(0.0, 0.0), (0.0, 0.0), (1.0, 0.0), (0.0, 0.0)];
        assert!(Filter::polygon(repeated).is_err());
    }

    #[test]
    fn test_polygon_normalizes_to_counter_clockwise() {
        // Clockwise square
        let cw = vec![(0.0, 0.0), (0.0, 1.0), (1.0, 1.0), (1.0, 0.0), (0.0, 0.0)];
        let filter = Filter::polygon(cw).unwrap();
        match &filter {
            Filter::Polygon(ring) => {
                assert!(signed_area(ring.vertices()) > 0.0);
            }
            _ => panic!("expected polygon"),
        }
        let (key, value) = filter.cmr_query_param();
        assert_eq!(key, "polygon");
        assert_eq!(value, "0,0,1,0,1,1,0,1,0,0");
    }

    #[test]
    fn test_polygon_from_geojson_feature_collection() {
        let geojson = r#"{
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": {},
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[-100.0, 40.0], [-96.0, 40.0], [-96.0, 42.0], [-100.0, 42.0], [-100.0, 40.0]]]
                }
            }]
        }"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(geojson.as_bytes()).unwrap();
        let filter = Filter::polygon_from_path(file.path()).unwrap();
        match filter {
            Filter::Polygon(ring) => assert_eq!(ring.vertices().len(), 5),
            _ => panic!("expected polygon"),
        }
    }

    #[test]
    fn test_polygon_from_geojson_without_polygon_geometry() {
        let geojson = r#"{"type": "Feature", "geometry": {"type": "Point", "coordinates": [0.0, 0.0]}}"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(geojson.as_bytes()).unwrap();
        assert!(Filter::polygon_from_path(file.path()).is_err());
    }

    #[test]
    fn test_time_range_parse() {
        let range = TimeRange::parse("2019-04-01T00:00:00,2019-04-30T23:59:59").unwrap();
        assert_eq!(
            range.cmr_temporal_value(),
            "2019-04-01T00:00:00Z,2019-04-30T23:59:59Z"
        );
    }

    #[test]
    fn test_time_range_accepts_offsets() {
        let range = TimeRange::parse("2019-04-01T00:00:00+02:00,2019-04-02T00:00:00Z").unwrap();
        assert_eq!(
            range.cmr_temporal_value(),
            "2019-03-31T22:00:00Z,2019-04-02T00:00:00Z"
        );
    }

    #[test]
    fn test_time_range_rejects_reversed() {
        assert!(TimeRange::parse("2019-05-01T00:00:00,2019-04-01T00:00:00").is_err());
        assert!(TimeRange::parse("not-a-date,2019-04-01T00:00:00").is_err());
    }
}
