// src/relay.rs v2
/// Main relay coordination: hub, position source and listeners

use crate::{
    config::RelayConfig,
    error::{RelayError, Result},
    hub::{Hub, HubHandle, HubObserver},
    listener::{ConnectionListener, ListenerConfig},
    peer::PeerOptions,
    source::{LocationBackend, ProviderId},
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Running relay. Listeners that failed to bind are left out; the relay
/// works with any number of them, including none.
pub struct NmeaRelay {
    hub: HubHandle,
    hub_task: JoinHandle<()>,
    listeners: Vec<ConnectionListener>,
    failed: Vec<RelayError>,
}

impl NmeaRelay {
    /// Start a relay from configuration, using the configured gpsd/serial sources
    pub async fn start(config: &RelayConfig, observer: Box<dyn HubObserver>) -> Self {
        Self::start_with_backend(
            config.provider,
            Arc::new(config.backend()),
            config.listener_configs(),
            config.peer_options(),
            observer,
        )
        .await
    }

    /// Start a relay with an explicit location backend
    pub async fn start_with_backend(
        provider: ProviderId,
        backend: Arc<dyn LocationBackend>,
        listener_configs: Vec<ListenerConfig>,
        peer_options: PeerOptions,
        observer: Box<dyn HubObserver>,
    ) -> Self {
        let hub = Hub::new(provider, backend, observer).with_close_timeout(peer_options.close_timeout);
        let handle = hub.handle();
        let hub_task = hub.spawn();

        let mut listeners = Vec::new();
        let mut failed = Vec::new();
        for config in listener_configs {
            match ConnectionListener::start(config, handle.clone(), peer_options).await {
                Ok(listener) => listeners.push(listener),
                Err(e) => failed.push(e),
            }
        }

        info!(
            provider = %provider,
            listening = listeners.len(),
            failed = failed.len(),
            "Relay started"
        );

        Self {
            hub: handle,
            hub_task,
            listeners,
            failed,
        }
    }

    pub fn handle(&self) -> HubHandle {
        self.hub.clone()
    }

    pub fn listeners(&self) -> &[ConnectionListener] {
        &self.listeners
    }

    /// Bind failures from startup, one per failed transport
    pub fn failed_listeners(&self) -> &[RelayError] {
        &self.failed
    }

    /// Stop the listeners, close every client, unsubscribe from the source
    /// and wait for the hub to finish
    pub async fn shutdown(mut self) -> Result<()> {
        for listener in &mut self.listeners {
            listener.stop().await;
        }

        let result = self.hub.shutdown().await;
        if let Err(e) = self.hub_task.await {
            warn!("Hub task ended abnormally: {}", e);
        }
        info!("Relay stopped");
        result
    }
}
