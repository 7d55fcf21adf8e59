//! Configuration for the speeding pipeline and its external services.
//!
//! All thresholds, batch sizes and endpoints are passed in at construction.
//! Every struct has sensible defaults and can be loaded from JSON, where any
//! omitted field keeps its default.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpeedMatchError};
use crate::retry::RetryPolicy;

/// How the speeding detector treats points without an enforceable limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownLimitPolicy {
    /// Ignore the point: it neither starts, extends nor ends an event.
    #[default]
    Skip,
    /// Treat the point as non-speeding, closing any open event.
    Break,
}

/// Thresholds for sustained speeding detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedingConfig {
    /// Minimum excess over the limit for a point to count as speeding.
    /// Default: 11.0 mph
    pub excess_threshold_mph: f64,

    /// Minimum span (last timestamp - first timestamp) for an event to be emitted.
    /// Default: 5 seconds
    pub min_duration_secs: i64,

    /// Handling of points with an unknown or zero limit.
    /// Default: Skip
    pub unknown_limit_policy: UnknownLimitPolicy,
}

impl Default for SpeedingConfig {
    fn default() -> Self {
        Self {
            excess_threshold_mph: 11.0,
            min_duration_secs: 5,
            unknown_limit_policy: UnknownLimitPolicy::Skip,
        }
    }
}

/// Configuration for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Trace points per road network window.
    /// Default: 20
    pub window_size: usize,

    /// Records per persistence write call.
    /// Default: 25
    pub write_chunk_size: usize,

    /// Segments matched by fewer points than this are treated as GPS noise
    /// and never written to the store.
    /// Default: 5
    pub min_segment_occurrences: usize,

    /// Maximum sign-to-polyline distance for a sign to apply to a segment.
    /// Default: 10.0 meters
    pub sign_match_radius_m: f64,

    /// Maximum in-flight external calls per stage.
    /// Default: 8
    pub concurrency: usize,

    /// Owner of the trace, part of the speeding event dedup key.
    pub user_id: String,

    pub speeding: SpeedingConfig,

    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            write_chunk_size: 25,
            min_segment_occurrences: 5,
            sign_match_radius_m: 10.0,
            concurrency: 8,
            user_id: "anonymous".to_string(),
            speeding: SpeedingConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SpeedMatchError::config(format!("invalid pipeline config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            SpeedMatchError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(SpeedMatchError::config("window_size must be at least 1"));
        }
        if self.write_chunk_size == 0 {
            return Err(SpeedMatchError::config("write_chunk_size must be at least 1"));
        }
        if self.concurrency == 0 {
            return Err(SpeedMatchError::config("concurrency must be at least 1"));
        }
        if !(self.sign_match_radius_m >= 0.0) {
            return Err(SpeedMatchError::config(
                "sign_match_radius_m must be non-negative",
            ));
        }
        if !(self.speeding.excess_threshold_mph >= 0.0) {
            return Err(SpeedMatchError::config(
                "excess_threshold_mph must be non-negative",
            ));
        }
        if self.speeding.min_duration_secs < 0 {
            return Err(SpeedMatchError::config(
                "min_duration_secs must be non-negative",
            ));
        }
        Ok(())
    }
}

/// Endpoints, credentials and transport limits for the external services.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Overpass interpreter endpoint
    pub road_network_url: String,
    /// Mapillary map features endpoint
    pub traffic_sign_url: String,
    pub traffic_sign_token: String,
    /// MapQuest reverse geocoding endpoint
    pub reverse_geocode_url: String,
    pub reverse_geocode_key: String,

    /// Per-request timeout.
    /// Default: 10000 ms
    pub timeout_ms: u64,

    /// Requests allowed per client within `rate_window_ms`.
    /// Default: 10
    pub max_requests_per_window: u32,

    /// Sliding window for the rate limit.
    /// Default: 1000 ms
    pub rate_window_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            road_network_url: "https://overpass-api.de/api/interpreter".to_string(),
            traffic_sign_url: "https://graph.mapillary.com/map_features".to_string(),
            traffic_sign_token: String::new(),
            reverse_geocode_url: "https://www.mapquestapi.com/geocoding/v1/reverse".to_string(),
            reverse_geocode_key: String::new(),
            timeout_ms: 10_000,
            max_requests_per_window: 10,
            rate_window_ms: 1_000,
        }
    }
}

impl ServiceConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| SpeedMatchError::config(format!("invalid service config: {}", e)))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }
}
