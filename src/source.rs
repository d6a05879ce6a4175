// src/source.rs
//! Position source: owns the active location backend and the subscriber set
//!
//! The hub is the only caller of [`PositionSource`]. Backends run on their own
//! task and report through a [`FixSink`], which delivers each sentence to a
//! snapshot of the subscriber set taken under the subscriber lock. A peer the
//! hub has removed therefore never sees a later fix, and a newly added peer
//! only sees fixes dispatched after registration.

use crate::{
    config::SourceConfig,
    error::{RelayError, Result},
    gps::{gpsd, nmea::Sentence, serial},
    hub::HubHandle,
    peer::{PeerHandle, PeerId},
};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Selectable location provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    /// High-accuracy satellite positioning
    #[default]
    Gps,
    /// Coarse, network-based positioning
    Network,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Gps => "gps",
            ProviderId::Network => "network",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gps" | "high-accuracy" => Ok(ProviderId::Gps),
            "network" | "network-based" => Ok(ProviderId::Network),
            other => Err(RelayError::Config(format!("Unknown location provider '{}'", other))),
        }
    }
}

/// Availability of the active provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderStatus {
    #[default]
    Unknown,
    OutOfService,
    TemporarilyUnavailable,
    Available,
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ProviderStatus::Unknown => "unknown",
            ProviderStatus::OutOfService => "out of service",
            ProviderStatus::TemporarilyUnavailable => "temporarily unavailable",
            ProviderStatus::Available => "available",
        };
        f.write_str(text)
    }
}

type Subscribers = Arc<Mutex<Vec<PeerHandle>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reporting channel handed to a backend task.
///
/// A sink belongs to one provider subscription; once the source switches
/// provider or shuts down, the old sink silently drops everything.
#[derive(Clone)]
pub struct FixSink {
    generation: u64,
    current: Arc<AtomicU64>,
    subscribers: Subscribers,
    status: Arc<Mutex<ProviderStatus>>,
    hub: HubHandle,
}

impl FixSink {
    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }

    /// Deliver a sentence to every current subscriber. Returns the number of
    /// subscribers it was offered to.
    pub fn fix(&self, sentence: &Sentence) -> usize {
        let subscribers = lock(&self.subscribers);
        if !self.is_current() {
            return 0;
        }
        for peer in subscribers.iter() {
            peer.send(sentence.clone());
        }
        subscribers.len()
    }

    /// Report provider availability; only changes reach the hub
    pub fn status(&self, status: ProviderStatus) {
        let mut current = lock(&self.status);
        if !self.is_current() || *current == status {
            return;
        }
        *current = status;
        if self.hub.status_changed(status).is_err() {
            debug!(%status, "Hub gone, status change dropped");
        }
    }
}

/// Something that can produce fixes for a provider.
pub trait LocationBackend: Send + Sync + 'static {
    /// Start feeding `sink` for `provider`. Returns
    /// [`RelayError::ProviderUnavailable`] when the provider can't be served.
    fn spawn(&self, provider: ProviderId, sink: FixSink) -> Result<JoinHandle<()>>;
}

/// Backend driven by the relay configuration: each provider maps to an
/// optional gpsd or serial source.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredBackend {
    gps: Option<SourceConfig>,
    network: Option<SourceConfig>,
}

impl ConfiguredBackend {
    pub fn new(gps: Option<SourceConfig>, network: Option<SourceConfig>) -> Self {
        Self { gps, network }
    }

    pub fn source_for(&self, provider: ProviderId) -> Option<&SourceConfig> {
        match provider {
            ProviderId::Gps => self.gps.as_ref(),
            ProviderId::Network => self.network.as_ref(),
        }
    }
}

impl LocationBackend for ConfiguredBackend {
    fn spawn(&self, provider: ProviderId, sink: FixSink) -> Result<JoinHandle<()>> {
        match self.source_for(provider) {
            Some(SourceConfig::Gpsd { host, port }) => Ok(tokio::spawn(gpsd::run(host.clone(), *port, sink))),
            Some(SourceConfig::Serial { port, baudrate }) => {
                Ok(tokio::spawn(serial::run(port.clone(), *baudrate, sink)))
            }
            None => Err(RelayError::ProviderUnavailable(provider)),
        }
    }
}

pub struct PositionSource {
    provider: ProviderId,
    backend: Arc<dyn LocationBackend>,
    subscribers: Subscribers,
    status: Arc<Mutex<ProviderStatus>>,
    generation: Arc<AtomicU64>,
    hub: HubHandle,
    task: Option<JoinHandle<()>>,
}

impl PositionSource {
    /// Create an idle source; call [`PositionSource::start`] to subscribe to the provider
    pub fn new(provider: ProviderId, backend: Arc<dyn LocationBackend>, hub: HubHandle) -> Self {
        Self {
            provider,
            backend,
            subscribers: Arc::new(Mutex::new(Vec::new())),
            status: Arc::new(Mutex::new(ProviderStatus::Unknown)),
            generation: Arc::new(AtomicU64::new(0)),
            hub,
            task: None,
        }
    }

    pub fn start(&mut self) {
        if self.task.is_none() {
            self.subscribe();
        }
    }

    pub fn provider(&self) -> ProviderId {
        self.provider
    }

    pub fn status(&self) -> ProviderStatus {
        *lock(&self.status)
    }

    /// Switch provider. Returns `false` without touching anything when the
    /// provider is already active; subscribers always survive a switch.
    pub fn set_provider(&mut self, provider: ProviderId) -> bool {
        if provider == self.provider {
            return false;
        }

        info!(from = %self.provider, to = %provider, "Switching location provider");
        self.unsubscribe();
        self.provider = provider;
        self.subscribe();
        true
    }

    fn subscribe(&mut self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let sink = FixSink {
            generation,
            current: Arc::clone(&self.generation),
            subscribers: Arc::clone(&self.subscribers),
            status: Arc::clone(&self.status),
            hub: self.hub.clone(),
        };

        match self.backend.spawn(self.provider, sink.clone()) {
            Ok(task) => self.task = Some(task),
            Err(e) => {
                warn!("{}", e);
                sink.status(ProviderStatus::OutOfService);
            }
        }
    }

    fn unsubscribe(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Returns `true` if the peer was not yet subscribed
    pub fn add_subscriber(&self, peer: PeerHandle) -> bool {
        let mut subscribers = lock(&self.subscribers);
        if subscribers.iter().any(|p| p.id() == peer.id()) {
            return false;
        }
        subscribers.push(peer);
        true
    }

    /// Returns `true` if the peer was subscribed
    pub fn remove_subscriber(&self, id: PeerId) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|p| p.id() != id);
        subscribers.len() != before
    }

    pub fn subscriber_ids(&self) -> Vec<PeerId> {
        lock(&self.subscribers).iter().map(|p| p.id()).collect()
    }

    /// Stop the backend and drop every subscriber
    pub fn shutdown(&mut self) {
        self.unsubscribe();
        lock(&self.subscribers).clear();
    }
}

impl Drop for PositionSource {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
