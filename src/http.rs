//! HTTP clients for the road network, traffic sign and reverse geocoding
//! services, with rate limiting.
//!
//! Each client owns a pooled reqwest client with a per-request timeout and a
//! sliding-window rate limiter. Transport failures, timeouts and non-success
//! statuses (429 included) become retryable [`SpeedMatchError::Network`]
//! errors; the retry itself is driven by the caller's [`crate::RetryPolicy`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::debug;
use reqwest::{Client, RequestBuilder};
use tokio::sync::Mutex;

use crate::config::ServiceConfig;
use crate::error::{Result, Service, SpeedMatchError};
use crate::resolver::ReverseGeocoder;
use crate::road_network::RoadNetworkService;
use crate::signs::TrafficSignService;
use crate::wire::{
    mapillary_bbox_param, overpass_query, parse_mapillary_response, parse_mapquest_response,
    parse_overpass_response,
};
use crate::{Bounds, GpsPoint, RoadSegment, TrafficSign};

const POOL_IDLE_PER_HOST: usize = 8;

/// Sliding-window rate limiter: at most `max_requests` start within any `window`.
pub struct RateLimiter {
    request_times: Mutex<VecDeque<Instant>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        let max_requests = (max_requests as usize).max(1);
        Self {
            request_times: Mutex::new(VecDeque::with_capacity(max_requests + 1)),
            max_requests,
            window,
        }
    }

    /// Wait for a free slot in the window and claim it.
    pub async fn acquire(&self) {
        loop {
            let wait_time = {
                let mut times = self.request_times.lock().await;
                let now = Instant::now();

                // Prune requests outside the window
                while times
                    .front()
                    .map_or(false, |&t| now.duration_since(t) >= self.window)
                {
                    times.pop_front();
                }

                if times.len() < self.max_requests {
                    times.push_back(now);
                    None
                } else {
                    times
                        .front()
                        .map(|&oldest| (oldest + self.window).saturating_duration_since(now))
                }
            };

            match wait_time {
                Some(duration) => {
                    debug!("[RateLimiter] Waiting {:?}", duration);
                    tokio::time::sleep(duration).await;
                }
                None => break,
            }
        }
    }

    #[cfg(test)]
    async fn in_flight_window(&self) -> usize {
        let times = self.request_times.lock().await;
        let now = Instant::now();
        times
            .iter()
            .filter(|&&t| now.duration_since(t) < self.window)
            .count()
    }
}

/// Shared transport: pooled client plus rate limiter, labelled by service.
struct Transport {
    client: Client,
    limiter: RateLimiter,
    service: Service,
}

impl Transport {
    fn new(config: &ServiceConfig, service: Service) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(POOL_IDLE_PER_HOST)
            .timeout(config.timeout())
            .build()
            .map_err(|e| SpeedMatchError::config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            limiter: RateLimiter::new(config.max_requests_per_window, config.rate_window()),
            service,
        })
    }

    /// Send a request and return the body of a successful response.
    async fn fetch_text(&self, request: RequestBuilder) -> Result<String> {
        self.limiter.acquire().await;

        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SpeedMatchError::Network {
                service: self.service,
                message: format!("HTTP {}", status),
                status_code: Some(status.as_u16()),
            });
        }

        response.text().await.map_err(|e| self.transport_error(e))
    }

    fn transport_error(&self, e: reqwest::Error) -> SpeedMatchError {
        SpeedMatchError::Network {
            service: self.service,
            message: e.to_string(),
            status_code: e.status().map(|s| s.as_u16()),
        }
    }
}

// ============================================================================
// Road network (Overpass)
// ============================================================================

/// Overpass API client returning every highway way inside a box.
pub struct OverpassClient {
    transport: Transport,
    url: String,
}

impl OverpassClient {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        Ok(Self {
            transport: Transport::new(config, Service::RoadNetwork)?,
            url: config.road_network_url.clone(),
        })
    }
}

impl RoadNetworkService for OverpassClient {
    async fn segments_in(&self, bbox: &Bounds) -> Result<Vec<RoadSegment>> {
        let query = overpass_query(bbox);
        let request = self.transport.client.get(&self.url).query(&[("data", query.as_str())]);
        let body = self.transport.fetch_text(request).await?;
        let segments = parse_overpass_response(&body)?;
        debug!("[RoadNetwork] {} segments in {:?}", segments.len(), bbox);
        Ok(segments)
    }
}

// ============================================================================
// Traffic signs (Mapillary)
// ============================================================================

/// Mapillary map features client, restricted to maximum speed limit signs.
pub struct MapillarySignClient {
    transport: Transport,
    url: String,
    access_token: String,
}

impl MapillarySignClient {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        if config.traffic_sign_token.is_empty() {
            return Err(SpeedMatchError::config("traffic_sign_token is required"));
        }
        Ok(Self {
            transport: Transport::new(config, Service::TrafficSigns)?,
            url: config.traffic_sign_url.clone(),
            access_token: config.traffic_sign_token.clone(),
        })
    }
}

impl TrafficSignService for MapillarySignClient {
    async fn signs_in(&self, bbox: &Bounds) -> Result<Vec<TrafficSign>> {
        let bbox_param = mapillary_bbox_param(bbox);
        let request = self.transport.client.get(&self.url).query(&[
            ("access_token", self.access_token.as_str()),
            ("fields", "id,object_value,geometry"),
            ("bbox", bbox_param.as_str()),
            ("layers", "trafficsigns"),
        ]);
        let body = self.transport.fetch_text(request).await?;
        let signs = parse_mapillary_response(&body)?;
        debug!("[SignLayer] {} speed limit signs in {:?}", signs.len(), bbox);
        Ok(signs)
    }
}

// ============================================================================
// Reverse geocoding (MapQuest)
// ============================================================================

/// MapQuest reverse geocoder reading the road metadata speed limit.
pub struct MapQuestGeocoder {
    transport: Transport,
    url: String,
    api_key: String,
}

impl MapQuestGeocoder {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        if config.reverse_geocode_key.is_empty() {
            return Err(SpeedMatchError::config("reverse_geocode_key is required"));
        }
        Ok(Self {
            transport: Transport::new(config, Service::ReverseGeocode)?,
            url: config.reverse_geocode_url.clone(),
            api_key: config.reverse_geocode_key.clone(),
        })
    }
}

impl ReverseGeocoder for MapQuestGeocoder {
    async fn speed_limit_at(&self, point: &GpsPoint) -> Result<Option<f64>> {
        let location = format!("{},{}", point.latitude, point.longitude);
        let request = self.transport.client.get(&self.url).query(&[
            ("key", self.api_key.as_str()),
            ("location", location.as_str()),
            ("includeRoadMetadata", "true"),
        ]);
        let body = self.transport.fetch_text(request).await?;
        parse_mapquest_response(&body)
    }
}
