//! Unified error handling for the speed-matcher library.
//!
//! Every external failure is represented here so that callers can decide
//! whether to retry, degrade, or give up. An unresolved speed limit is *not*
//! an error: it is reported as [`crate::LimitSource::Unknown`].

use thiserror::Error;

/// External services the pipeline talks to. Used to label errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    RoadNetwork,
    TrafficSigns,
    ReverseGeocode,
    Store,
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Service::RoadNetwork => "road network",
            Service::TrafficSigns => "traffic signs",
            Service::ReverseGeocode => "reverse geocode",
            Service::Store => "segment store",
        };
        f.write_str(name)
    }
}

/// Unified error type for speed-matcher operations.
#[derive(Debug, Clone, Error)]
pub enum SpeedMatchError {
    /// Transport failure, timeout or non-success HTTP status
    #[error("{service} request failed{}: {message}", status_suffix(.status_code))]
    Network {
        service: Service,
        message: String,
        status_code: Option<u16>,
    },
    /// Payload could not be parsed (empty body, broken structure)
    #[error("{service} returned a malformed response: {message}")]
    MalformedResponse { service: Service, message: String },
    /// Store unavailable while writing
    #[error("persistence write failed: {message}")]
    PersistenceWrite { message: String },
    /// Store unavailable while reading
    #[error("persistence read failed: {message}")]
    PersistenceRead { message: String },
    /// Invalid configuration
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl SpeedMatchError {
    pub fn network(service: Service, message: impl Into<String>) -> Self {
        SpeedMatchError::Network {
            service,
            message: message.into(),
            status_code: None,
        }
    }

    pub fn malformed(service: Service, message: impl Into<String>) -> Self {
        SpeedMatchError::MalformedResponse {
            service,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        SpeedMatchError::Config {
            message: message.into(),
        }
    }

    /// Transient failures worth another attempt.
    ///
    /// A malformed payload will parse the same way next time, so it is final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SpeedMatchError::Network { .. } | SpeedMatchError::PersistenceWrite { .. }
        )
    }
}

fn status_suffix(status_code: &Option<u16>) -> String {
    status_code.map(|c| format!(" ({})", c)).unwrap_or_default()
}

/// Result type alias for speed-matcher operations.
pub type Result<T> = std::result::Result<T, SpeedMatchError>;

/// Extension trait for converting missing wire fields into errors.
pub trait OptionExt<T> {
    /// Convert Option to Result with a malformed response error.
    fn ok_or_malformed(self, service: Service, what: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_malformed(self, service: Service, what: &str) -> Result<T> {
        self.ok_or_else(|| SpeedMatchError::malformed(service, format!("missing {}", what)))
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for SpeedMatchError {
    fn from(e: rusqlite::Error) -> Self {
        SpeedMatchError::PersistenceWrite {
            message: e.to_string(),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rmp_serde::encode::Error> for SpeedMatchError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SpeedMatchError::PersistenceWrite {
            message: format!("failed to encode blob: {}", e),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rmp_serde::decode::Error> for SpeedMatchError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SpeedMatchError::PersistenceRead {
            message: format!("failed to decode blob: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SpeedMatchError::Network {
            service: Service::RoadNetwork,
            message: "connection reset".to_string(),
            status_code: Some(429),
        };
        let text = err.to_string();
        assert!(text.contains("road network"));
        assert!(text.contains("(429)"));
        assert!(text.contains("connection reset"));

        let err = SpeedMatchError::network(Service::ReverseGeocode, "timed out");
        assert_eq!(err.to_string(), "reverse geocode request failed: timed out");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(SpeedMatchError::network(Service::TrafficSigns, "x").is_retryable());
        assert!(SpeedMatchError::PersistenceWrite {
            message: "x".to_string()
        }
        .is_retryable());
        assert!(!SpeedMatchError::malformed(Service::RoadNetwork, "empty body").is_retryable());
        assert!(!SpeedMatchError::config("bad").is_retryable());
    }

    #[test]
    fn test_option_ext() {
        let none: Option<i32> = None;
        let result = none.ok_or_malformed(Service::ReverseGeocode, "results");
        assert!(matches!(
            result,
            Err(SpeedMatchError::MalformedResponse { .. })
        ));
        assert_eq!(Some(3).ok_or_malformed(Service::Store, "x").ok(), Some(3));
    }
}
