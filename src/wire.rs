//! Wire formats of the external services.
//!
//! Parsing is kept free of I/O so it can be exercised without a network and
//! reused by any transport. The HTTP clients in [`crate::http`] only fetch
//! bodies and hand them to these functions.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{OptionExt, Result, Service, SpeedMatchError};
use crate::signs::{is_speed_limit_sign, parse_sign_value};
use crate::{Bounds, GpsPoint, RoadSegment, TrafficSign};

const KMH_PER_MPH: f64 = 1.609_344;

// ============================================================================
// Road network (Overpass)
// ============================================================================

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<OverpassElement>,
}

#[derive(Debug, Deserialize)]
struct OverpassElement {
    id: Value,
    #[serde(default)]
    tags: OverpassTags,
    bounds: Option<OverpassBounds>,
    #[serde(default)]
    geometry: Vec<OverpassCoord>,
}

#[derive(Debug, Default, Deserialize)]
struct OverpassTags {
    name: Option<String>,
    highway: Option<String>,
    maxspeed: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OverpassBounds {
    minlat: f64,
    minlon: f64,
    maxlat: f64,
    maxlon: f64,
}

#[derive(Debug, Deserialize)]
struct OverpassCoord {
    lat: f64,
    lon: f64,
}

/// Overpass QL selecting every highway way inside `bbox`, with full geometry.
pub fn overpass_query(bbox: &Bounds) -> String {
    format!(
        "[out:json];way({},{},{},{})[highway];out geom;",
        bbox.min_lat, bbox.min_lng, bbox.max_lat, bbox.max_lng
    )
}

/// Parse an Overpass `out geom` response into road segments.
///
/// Ways without geometry are skipped. An empty body or broken JSON is a
/// [`SpeedMatchError::MalformedResponse`].
pub fn parse_overpass_response(body: &str) -> Result<Vec<RoadSegment>> {
    if body.trim().is_empty() {
        return Err(SpeedMatchError::malformed(Service::RoadNetwork, "empty body"));
    }
    let response: OverpassResponse = serde_json::from_str(body)
        .map_err(|e| SpeedMatchError::malformed(Service::RoadNetwork, e.to_string()))?;

    let segments = response
        .elements
        .into_iter()
        .filter_map(|element| {
            let polyline: Vec<GpsPoint> = element
                .geometry
                .iter()
                .map(|c| GpsPoint::new(c.lat, c.lon))
                .collect();
            let bounds = match element.bounds {
                Some(b) => Bounds::new(b.minlat, b.maxlat, b.minlon, b.maxlon),
                None => Bounds::from_points(&polyline)?,
            };
            if polyline.is_empty() {
                return None;
            }
            let id = match element.id {
                Value::String(s) => s,
                other => other.to_string(),
            };
            Some(RoadSegment {
                id,
                name: element.tags.name.unwrap_or_else(|| "Unnamed Road".to_string()),
                road_type: element.tags.highway.unwrap_or_else(|| "unknown".to_string()),
                tagged_speed_limit: element.tags.maxspeed.as_deref().and_then(parse_maxspeed),
                polyline,
                bounds,
            })
        })
        .collect();

    Ok(segments)
}

/// Parse an OSM `maxspeed` tag into mph.
///
/// Bare numbers and "mph" values are taken as mph; "km/h" and "kmh" values
/// are converted. Anything non-numeric or non-positive is absent.
pub fn parse_maxspeed(raw: &str) -> Option<f64> {
    let raw = raw.trim().to_ascii_lowercase();
    let number_end = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let value: f64 = raw[..number_end].parse().ok()?;
    if !value.is_finite() || value <= 0.0 {
        return None;
    }

    let unit = raw[number_end..].trim();
    match unit {
        "" | "mph" => Some(value),
        "km/h" | "kmh" | "kph" => Some(value / KMH_PER_MPH),
        _ => None,
    }
}

// ============================================================================
// Traffic signs (Mapillary)
// ============================================================================

#[derive(Debug, Deserialize)]
struct MapillaryResponse {
    #[serde(default)]
    data: Vec<MapillaryFeature>,
}

#[derive(Debug, Deserialize)]
struct MapillaryFeature {
    id: Value,
    #[serde(default)]
    object_value: String,
    geometry: Option<MapillaryGeometry>,
}

#[derive(Debug, Deserialize)]
struct MapillaryGeometry {
    coordinates: Vec<f64>,
}

/// Mapillary `bbox` parameter: minLon,minLat,maxLon,maxLat.
pub fn mapillary_bbox_param(bbox: &Bounds) -> String {
    format!(
        "{},{},{},{}",
        bbox.min_lng, bbox.min_lat, bbox.max_lng, bbox.max_lat
    )
}

/// Parse a Mapillary map features response, keeping only maximum speed limit signs.
pub fn parse_mapillary_response(body: &str) -> Result<Vec<TrafficSign>> {
    if body.trim().is_empty() {
        return Err(SpeedMatchError::malformed(Service::TrafficSigns, "empty body"));
    }
    let response: MapillaryResponse = serde_json::from_str(body)
        .map_err(|e| SpeedMatchError::malformed(Service::TrafficSigns, e.to_string()))?;

    let signs = response
        .data
        .into_iter()
        .filter(|f| is_speed_limit_sign(&f.object_value))
        .filter_map(|f| {
            let coords = f.geometry?.coordinates;
            let (lon, lat) = (*coords.first()?, *coords.get(1)?);
            let id = match f.id {
                Value::String(s) => s,
                other => other.to_string(),
            };
            Some(TrafficSign {
                id,
                location: GpsPoint::new(lat, lon),
                parsed_speed_limit: parse_sign_value(&f.object_value),
                raw_value: f.object_value,
            })
        })
        .collect();

    Ok(signs)
}

// ============================================================================
// Reverse geocoding (MapQuest)
// ============================================================================

/// Extract `results[0].locations[0].roadMetadata.speedLimit` from a MapQuest
/// reverse geocoding response.
///
/// A location without road metadata or with a null limit yields `Ok(None)`.
/// A response missing the results or locations structure is malformed.
pub fn parse_mapquest_response(body: &str) -> Result<Option<f64>> {
    if body.trim().is_empty() {
        return Err(SpeedMatchError::malformed(Service::ReverseGeocode, "empty body"));
    }
    let value: Value = serde_json::from_str(body)
        .map_err(|e| SpeedMatchError::malformed(Service::ReverseGeocode, e.to_string()))?;

    let location = value
        .get("results")
        .and_then(|r| r.get(0))
        .ok_or_malformed(Service::ReverseGeocode, "results")?
        .get("locations")
        .and_then(|l| l.get(0))
        .ok_or_malformed(Service::ReverseGeocode, "locations")?;

    let limit = match location
        .get("roadMetadata")
        .and_then(|m| m.get("speedLimit"))
    {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    Ok(limit.filter(|v| v.is_finite() && *v > 0.0))
}
