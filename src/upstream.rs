//! HTTP client against the upstream transit API, normalizing whatever
//! casing/aliasing the feed happens to use into typed raw records.
//!
//! Grounded on two teacher-lineage sources: the retry/backoff shape of
//! `providers::osm::OsmClient::execute_with_retry` (bounded attempts,
//! exponential backoff, a `retryable` classification on the error), and
//! the original `ettu_client` module's field-normalization approach
//! (tolerate uppercase/lowercase/alternate key names at the boundary so
//! nothing downstream ever sees a union type).

use std::time::Duration;

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use serde_json::Value;

const MAX_RETRIES: u32 = 3;
const INITIAL_RETRY_DELAY_SECS: u64 = 2;
const REQUEST_TIMEOUT_SECS: u64 = 30;
const UPSTREAM_UTC_OFFSET_HOURS: i32 = 5;

#[derive(Debug, Clone)]
pub struct RawVehicle {
    pub dev_id: String,
    pub board_num: String,
    pub route_num: String,
    pub lat: f64,
    pub lon: f64,
    pub speed_kmh: f64,
    pub course_deg: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RawStop {
    pub id: i64,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone)]
pub struct RawRouteStop {
    pub id: i64,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub order: i32,
    pub direction: u8,
}

#[derive(Debug, Clone, Default)]
pub struct RawRoute {
    pub id: i64,
    pub number: String,
    pub name: String,
    pub points: Vec<(f64, f64)>,
    pub stops: Vec<RawRouteStop>,
}

pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| UpstreamError::NetworkError(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub async fn fetch_vehicles(&self) -> Vec<RawVehicle> {
        let items = match self.get_json_items("/api/v2/tram/boards/", "vehicles").await {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(error = %e, "Failed to fetch vehicles from upstream");
                return Vec::new();
            }
        };

        items.iter().filter_map(normalize_vehicle).collect()
    }

    pub async fn fetch_routes(&self) -> Vec<RawRoute> {
        let items = match self.get_json_items("/api/v2/tram/routes/", "routes").await {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(error = %e, "Failed to fetch routes from upstream");
                return Vec::new();
            }
        };

        items.iter().filter_map(normalize_route).collect()
    }

    pub async fn fetch_stops(&self) -> Vec<RawStop> {
        let items = match self.get_json_items("/api/v2/tram/stops/", "stops").await {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(error = %e, "Failed to fetch stops from upstream");
                return Vec::new();
            }
        };

        items.iter().filter_map(normalize_stop).collect()
    }

    async fn get_json_items(&self, path: &str, list_key: &str) -> Result<Vec<Value>, UpstreamError> {
        let text = self.execute_with_retry(path).await?;
        let value: Value = serde_json::from_str(&text).map_err(|e| UpstreamError::ParseError(e.to_string()))?;

        let items = match value {
            Value::Array(items) => items,
            Value::Object(mut map) => map
                .remove(list_key)
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        Ok(items)
    }

    async fn execute_with_retry(&self, path: &str) -> Result<String, UpstreamError> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = INITIAL_RETRY_DELAY_SECS * 2_u64.pow(attempt - 1);
                tracing::warn!(attempt, delay_secs = delay, path, "Retrying upstream request");
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }

            match self.execute_request(path).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(attempt, error = %e, "Transient upstream error, will retry");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| UpstreamError::NetworkError("max retries exceeded".to_string())))
    }

    async fn execute_request(&self, path: &str) -> Result<String, UpstreamError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    UpstreamError::RetryableError(e.to_string())
                } else {
                    UpstreamError::NetworkError(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(UpstreamError::RetryableError(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(UpstreamError::NetworkError(format!("HTTP {status}")));
        }

        response.text().await.map_err(|e| UpstreamError::NetworkError(e.to_string()))
    }
}

/// Looks up the first matching key out of `candidates`, in order.
fn first_of<'a>(obj: &'a Value, candidates: &[&str]) -> Option<&'a Value> {
    candidates.iter().find_map(|k| obj.get(*k))
}

fn as_f64(v: &Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

fn as_i64(v: &Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

fn as_string(v: &Value) -> String {
    v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string())
}

fn normalize_vehicle(item: &Value) -> Option<RawVehicle> {
    let dev_id = first_of(item, &["DEV_ID", "dev_id"]).map(as_string)?;
    let lat = first_of(item, &["LAT", "lat"]).and_then(as_f64)?;
    let lon = first_of(item, &["LON", "lon", "lng"]).and_then(as_f64)?;
    if lat == 0.0 && lon == 0.0 {
        return None;
    }

    let board_num = first_of(item, &["BOARD_NUM", "board_num", "gos_num"]).map(as_string).unwrap_or_default();
    let route_num = first_of(item, &["ROUTE", "route", "marsh"]).map(as_string).unwrap_or_default();
    let speed_kmh = first_of(item, &["VELOCITY", "SPEED", "speed"]).and_then(as_f64).unwrap_or(0.0);
    let course_deg = first_of(item, &["COURSE", "course", "dir"]).and_then(as_f64).unwrap_or(0.0);
    let timestamp_raw = first_of(item, &["TIMESTAMP", "timestamp", "last_time"]).map(as_string);

    let on_route = first_of(item, &["ON_ROUTE", "on_route"])
        .and_then(as_i64)
        .map(|v| v != 0)
        .unwrap_or(true);
    if !on_route {
        return None;
    }

    Some(RawVehicle {
        dev_id,
        board_num,
        route_num,
        lat,
        lon,
        speed_kmh,
        course_deg,
        timestamp: timestamp_raw.and_then(|s| parse_upstream_timestamp(&s)).unwrap_or_else(Utc::now),
    })
}

fn normalize_stop(item: &Value) -> Option<RawStop> {
    let id = first_of(item, &["ID", "id"]).and_then(as_i64)?;
    let lat = first_of(item, &["LAT", "lat"]).and_then(as_f64)?;
    let lon = first_of(item, &["LON", "lon", "lng"]).and_then(as_f64)?;
    let name = first_of(item, &["NAME", "name"]).map(as_string).unwrap_or_default();
    Some(RawStop { id, name, lat, lon })
}

fn normalize_route(item: &Value) -> Option<RawRoute> {
    let id = first_of(item, &["ID", "id"]).and_then(as_i64)?;
    let number = first_of(item, &["NUM", "number", "name"]).map(as_string).unwrap_or_default();
    let name = first_of(item, &["NAME", "title"]).map(as_string).unwrap_or_default();

    let mut points = Vec::new();
    if let Some(Value::Array(raw_points)) = first_of(item, &["POINTS", "points", "geometry"]) {
        for pt in raw_points {
            match pt {
                Value::Object(_) => {
                    let lat = first_of(pt, &["LAT", "lat"]).and_then(as_f64).unwrap_or(0.0);
                    let lon = first_of(pt, &["LON", "lon", "lng"]).and_then(as_f64).unwrap_or(0.0);
                    points.push((lat, lon));
                }
                Value::Array(pair) if pair.len() >= 2 => {
                    if let (Some(lat), Some(lon)) = (pair[0].as_f64(), pair[1].as_f64()) {
                        points.push((lat, lon));
                    }
                }
                _ => {}
            }
        }
    }

    let mut stops = Vec::new();
    if let Some(Value::Array(raw_stops)) = first_of(item, &["STOPS", "stops"]) {
        for s in raw_stops {
            let Some(stop_id) = first_of(s, &["ID", "id"]).and_then(as_i64) else { continue };
            stops.push(RawRouteStop {
                id: stop_id,
                name: first_of(s, &["NAME", "name"]).map(as_string).unwrap_or_default(),
                lat: first_of(s, &["LAT", "lat"]).and_then(as_f64).unwrap_or(0.0),
                lon: first_of(s, &["LON", "lon", "lng"]).and_then(as_f64).unwrap_or(0.0),
                order: first_of(s, &["ORDER", "order"]).and_then(as_i64).unwrap_or(0) as i32,
                direction: first_of(s, &["DIRECTION", "direction"]).and_then(as_i64).unwrap_or(0) as u8,
            });
        }
    }

    Some(RawRoute { id, number, name, points, stops })
}

fn parse_upstream_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let offset = FixedOffset::east_opt(UPSTREAM_UTC_OFFSET_HOURS * 3600)?;
    let naive = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .ok()?;
    Some(offset.from_local_datetime(&naive).single()?.with_timezone(&Utc))
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("transient error: {0}")]
    RetryableError(String),
    #[error("failed to parse upstream response: {0}")]
    ParseError(String),
}

impl UpstreamError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, UpstreamError::RetryableError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_uppercase_and_lowercase_keys_to_the_same_vehicle() {
        let upper = json!({"DEV_ID": "7", "LAT": 56.8, "LON": 60.6, "SPEED": 12});
        let lower = json!({"dev_id": "7", "lat": 56.8, "lng": 60.6, "velocity": 12});

        let a = normalize_vehicle(&upper).unwrap();
        let b = normalize_vehicle(&lower).unwrap();

        assert_eq!(a.dev_id, b.dev_id);
        assert_eq!(a.lat, b.lat);
        assert_eq!(a.lon, b.lon);
        assert_eq!(a.speed_kmh, b.speed_kmh);
    }

    #[test]
    fn vehicle_with_zero_coordinates_is_dropped() {
        let item = json!({"DEV_ID": "7", "LAT": 0, "LON": 0});
        assert!(normalize_vehicle(&item).is_none());
    }

    #[test]
    fn vehicle_off_route_is_dropped() {
        let item = json!({"DEV_ID": "7", "LAT": 56.8, "LON": 60.6, "ON_ROUTE": 0});
        assert!(normalize_vehicle(&item).is_none());
    }

    #[test]
    fn route_parses_point_objects_and_pairs() {
        let item = json!({
            "ID": 1,
            "NUM": "5",
            "POINTS": [{"LAT": 56.8, "LON": 60.6}, [56.81, 60.61]],
        });
        let route = normalize_route(&item).unwrap();
        assert_eq!(route.points.len(), 2);
        assert_eq!(route.points[0], (56.8, 60.6));
        assert_eq!(route.points[1], (56.81, 60.61));
    }

    #[test]
    fn retryable_error_is_flagged() {
        let e = UpstreamError::RetryableError("HTTP 503".into());
        assert!(e.is_retryable());
        let e = UpstreamError::NetworkError("boom".into());
        assert!(!e.is_retryable());
    }
}
