// src/error.rs
//! Error types for the NMEA relay

use crate::listener::TransportKind;
use crate::source::ProviderId;
use std::fmt;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug)]
pub enum RelayError {
    Io(std::io::Error),
    Serial(tokio_serial::Error),
    Json(serde_json::Error),
    /// A listener could not bind its transport. Terminal for that transport only.
    Bind {
        transport: TransportKind,
        endpoint: String,
        reason: String,
    },
    /// No location backend is configured for the provider.
    ProviderUnavailable(ProviderId),
    Connection(String),
    Config(String),
    /// The hub task is gone; requests can no longer be served.
    HubClosed,
    Other(String),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Io(e) => write!(f, "IO error: {}", e),
            RelayError::Serial(e) => write!(f, "Serial error: {}", e),
            RelayError::Json(e) => write!(f, "JSON error: {}", e),
            RelayError::Bind {
                transport,
                endpoint,
                reason,
            } => write!(f, "{} listener on {} failed: {}", transport, endpoint, reason),
            RelayError::ProviderUnavailable(provider) => {
                write!(f, "Location provider '{}' is not available", provider)
            }
            RelayError::Connection(msg) => write!(f, "Connection error: {}", msg),
            RelayError::Config(msg) => write!(f, "Configuration error: {}", msg),
            RelayError::HubClosed => write!(f, "Hub is no longer running"),
            RelayError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::Io(e) => Some(e),
            RelayError::Serial(e) => Some(e),
            RelayError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(error: std::io::Error) -> Self {
        RelayError::Io(error)
    }
}

impl From<tokio_serial::Error> for RelayError {
    fn from(error: tokio_serial::Error) -> Self {
        RelayError::Serial(error)
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(error: serde_json::Error) -> Self {
        RelayError::Json(error)
    }
}

impl From<anyhow::Error> for RelayError {
    fn from(error: anyhow::Error) -> Self {
        RelayError::Other(error.to_string())
    }
}
