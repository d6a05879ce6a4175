// src/lib.rs
//! NMEA Relay Library
//!
//! Relays the NMEA sentences of one position source to any number of
//! connected TCP and local socket clients.

pub mod config;
pub mod display;
pub mod error;
pub mod gps;
pub mod hub;
pub mod listener;
pub mod peer;
pub mod relay;
pub mod source;

// Re-export main types for convenience
pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use hub::{ChannelObserver, Hub, HubHandle, HubObserver, HubSnapshot, LogObserver, ObserverEvent};
pub use listener::{ConnectionListener, ListenerConfig, ListenerState, ListenerStatus, TransportKind};
pub use peer::{PeerConnection, PeerHandle, PeerId, PeerInfo, PeerOptions};
pub use relay::NmeaRelay;
pub use source::{LocationBackend, PositionSource, ProviderId, ProviderStatus};
