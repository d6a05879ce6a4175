// src/hub.rs
//! The fan-out hub: single consumer of every cross-task event
//!
//! Listeners, peers and the location backend never touch the connection
//! registry. They post [`HubEvent`]s through a [`HubHandle`]; the hub task
//! applies them strictly one at a time in arrival order, keeps the registry
//! and the source's subscriber set identical, and tells the observer.

use crate::{
    error::{RelayError, Result},
    listener::ListenerStatus,
    peer::{PeerConnection, PeerHandle, PeerId, PeerInfo, PeerState},
    source::{LocationBackend, PositionSource, ProviderId, ProviderStatus},
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Everything the hub can be asked to do
pub enum HubEvent {
    NewConnection(PeerConnection),
    ConnectionFailed { peer: PeerId, cause: String },
    StatusChanged(ProviderStatus),
    ListenerChanged(ListenerStatus),
    /// Observer-initiated removal of one client
    Disconnect(PeerId),
    DisconnectAll,
    SetProvider(ProviderId),
    Snapshot(oneshot::Sender<HubSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Point-in-time view of the hub state
#[derive(Debug, Clone, PartialEq)]
pub struct HubSnapshot {
    pub provider: ProviderId,
    pub status: ProviderStatus,
    pub connections: Vec<PeerInfo>,
    pub subscribers: Vec<PeerId>,
    pub listeners: Vec<ListenerStatus>,
}

impl HubSnapshot {
    pub fn connection_ids(&self) -> Vec<PeerId> {
        self.connections.iter().map(|p| p.id).collect()
    }
}

/// Receives hub notifications. Always called from the hub task, never from a
/// producer.
pub trait HubObserver: Send + 'static {
    fn on_status_changed(&mut self, status: ProviderStatus);
    fn on_connection_list_changed(&mut self, connections: &[PeerInfo]);
    fn on_connection_failed(&mut self, peer: &PeerInfo, message: &str);
    fn on_listener_changed(&mut self, _listener: &ListenerStatus) {}
}

/// Observer notifications as values, for consumers running on their own task
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverEvent {
    StatusChanged(ProviderStatus),
    ConnectionListChanged(Vec<PeerInfo>),
    ConnectionFailed { peer: PeerInfo, message: String },
    ListenerChanged(ListenerStatus),
}

/// Forwards every notification into an unbounded channel
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ObserverEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ObserverEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: ObserverEvent) {
        // A consumer that went away just stops listening
        let _ = self.tx.send(event);
    }
}

impl HubObserver for ChannelObserver {
    fn on_status_changed(&mut self, status: ProviderStatus) {
        self.forward(ObserverEvent::StatusChanged(status));
    }

    fn on_connection_list_changed(&mut self, connections: &[PeerInfo]) {
        self.forward(ObserverEvent::ConnectionListChanged(connections.to_vec()));
    }

    fn on_connection_failed(&mut self, peer: &PeerInfo, message: &str) {
        self.forward(ObserverEvent::ConnectionFailed {
            peer: peer.clone(),
            message: message.to_string(),
        });
    }

    fn on_listener_changed(&mut self, listener: &ListenerStatus) {
        self.forward(ObserverEvent::ListenerChanged(listener.clone()));
    }
}

/// Headless observer: notifications only go to the log
pub struct LogObserver;

impl HubObserver for LogObserver {
    fn on_status_changed(&mut self, status: ProviderStatus) {
        info!(%status, "Provider status");
    }

    fn on_connection_list_changed(&mut self, connections: &[PeerInfo]) {
        let labels: Vec<&str> = connections.iter().map(|p| p.label.as_str()).collect();
        info!(count = connections.len(), clients = ?labels, "Clients changed");
    }

    fn on_connection_failed(&mut self, peer: &PeerInfo, message: &str) {
        warn!(peer = %peer, message, "Client dropped");
    }

    fn on_listener_changed(&mut self, listener: &ListenerStatus) {
        info!(transport = %listener.transport, endpoint = %listener.endpoint, state = %listener.state, "Listener");
    }
}

/// Producer side of the hub channel. Posting never blocks.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubEvent>,
}

pub(crate) fn channel() -> (HubHandle, mpsc::UnboundedReceiver<HubEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (HubHandle { tx }, rx)
}

impl HubHandle {
    fn post(&self, event: HubEvent) -> Result<()> {
        self.tx.send(event).map_err(|_| RelayError::HubClosed)
    }

    /// Hand an accepted client to the hub. If the hub is gone the client is closed.
    pub fn new_connection(&self, peer: PeerConnection) -> Result<()> {
        self.tx
            .send(HubEvent::NewConnection(peer))
            .map_err(|mpsc::error::SendError(event)| {
                if let HubEvent::NewConnection(peer) = event {
                    peer.handle().close();
                }
                RelayError::HubClosed
            })
    }

    pub fn connection_failed(&self, peer: PeerId, cause: impl Into<String>) -> Result<()> {
        self.post(HubEvent::ConnectionFailed {
            peer,
            cause: cause.into(),
        })
    }

    pub fn status_changed(&self, status: ProviderStatus) -> Result<()> {
        self.post(HubEvent::StatusChanged(status))
    }

    pub fn listener_changed(&self, status: ListenerStatus) -> Result<()> {
        self.post(HubEvent::ListenerChanged(status))
    }

    pub fn disconnect(&self, peer: PeerId) -> Result<()> {
        self.post(HubEvent::Disconnect(peer))
    }

    pub fn disconnect_all(&self) -> Result<()> {
        self.post(HubEvent::DisconnectAll)
    }

    pub fn set_provider(&self, provider: ProviderId) -> Result<()> {
        self.post(HubEvent::SetProvider(provider))
    }

    /// Ask for the current state; answered after everything posted before it
    pub async fn snapshot(&self) -> Result<HubSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.post(HubEvent::Snapshot(reply))?;
        rx.await.map_err(|_| RelayError::HubClosed)
    }

    /// Close every client, stop the source and end the hub task
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.post(HubEvent::Shutdown(reply))?;
        rx.await.map_err(|_| RelayError::HubClosed)
    }
}

struct RegistryEntry {
    handle: PeerHandle,
    task: JoinHandle<()>,
}

/// Active connections in the order they were registered
#[derive(Default)]
struct Registry {
    entries: Vec<RegistryEntry>,
}

impl Registry {
    fn contains(&self, id: PeerId) -> bool {
        self.entries.iter().any(|e| e.handle.id() == id)
    }

    fn insert(&mut self, handle: PeerHandle, task: JoinHandle<()>) -> bool {
        if self.contains(handle.id()) {
            return false;
        }
        self.entries.push(RegistryEntry { handle, task });
        true
    }

    fn remove(&mut self, id: PeerId) -> Option<RegistryEntry> {
        let index = self.entries.iter().position(|e| e.handle.id() == id)?;
        Some(self.entries.remove(index))
    }

    fn drain(&mut self) -> Vec<RegistryEntry> {
        std::mem::take(&mut self.entries)
    }

    fn infos(&self) -> Vec<PeerInfo> {
        self.entries.iter().map(|e| e.handle.info().clone()).collect()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct Hub {
    events: mpsc::UnboundedReceiver<HubEvent>,
    handle: HubHandle,
    registry: Registry,
    source: PositionSource,
    observer: Box<dyn HubObserver>,
    status: ProviderStatus,
    listeners: Vec<ListenerStatus>,
    close_timeout: Duration,
}

impl Hub {
    pub fn new(provider: ProviderId, backend: Arc<dyn LocationBackend>, observer: Box<dyn HubObserver>) -> Self {
        let (handle, events) = channel();
        let source = PositionSource::new(provider, backend, handle.clone());
        Self {
            events,
            handle,
            registry: Registry::default(),
            source,
            observer,
            status: ProviderStatus::Unknown,
            listeners: Vec::new(),
            close_timeout: Duration::from_secs(2),
        }
    }

    /// Bound on waiting for each client's transport during shutdown
    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    pub fn handle(&self) -> HubHandle {
        self.handle.clone()
    }

    /// Subscribe to the provider and run the control loop on its own task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        self.source.start();
        info!(provider = %self.source.provider(), "Hub started");

        while let Some(event) = self.events.recv().await {
            if let Some(reply) = self.dispatch(event) {
                self.shutdown().await;
                let _ = reply.send(());
                break;
            }
        }

        self.reject_pending();
    }

    /// Refuse whatever is still queued once the loop has stopped
    fn reject_pending(&mut self) {
        self.events.close();
        while let Ok(event) = self.events.try_recv() {
            match event {
                HubEvent::NewConnection(peer) => {
                    peer.handle().close();
                }
                HubEvent::Shutdown(reply) => {
                    let _ = reply.send(());
                }
                _ => {}
            }
        }
    }

    /// Apply one event. Returns the reply channel when the event asks the hub to stop.
    fn dispatch(&mut self, event: HubEvent) -> Option<oneshot::Sender<()>> {
        match event {
            HubEvent::NewConnection(peer) => self.add_connection(peer),
            HubEvent::ConnectionFailed { peer, cause } => self.connection_failed(peer, &cause),
            HubEvent::StatusChanged(status) => {
                self.status = status;
                self.observer.on_status_changed(status);
            }
            HubEvent::ListenerChanged(status) => self.listener_changed(status),
            HubEvent::Disconnect(peer) => {
                if self.disconnect(peer) {
                    self.notify_list_changed();
                } else {
                    debug!(%peer, "Disconnect for unknown client ignored");
                }
            }
            HubEvent::DisconnectAll => self.disconnect_all(),
            HubEvent::SetProvider(provider) => {
                if !self.source.set_provider(provider) {
                    debug!(%provider, "Provider already active");
                }
            }
            HubEvent::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            HubEvent::Shutdown(reply) => return Some(reply),
        }
        None
    }

    fn add_connection(&mut self, peer: PeerConnection) {
        let (handle, task) = peer.into_parts();

        // Already failed before we got to register it; its failure event was
        // (or will be) discarded, so keep it out of the registry.
        if handle.state() != PeerState::Open {
            debug!(peer = %handle.info(), "Client closed before registration");
            return;
        }

        let info = handle.info().clone();
        if !self.registry.insert(handle.clone(), task) {
            warn!(peer = %info, "Client registered twice");
            return;
        }
        self.source.add_subscriber(handle);
        info!(peer = %info, transport = %info.transport, "Client connected");
        self.notify_list_changed();
    }

    fn connection_failed(&mut self, peer: PeerId, cause: &str) {
        if !self.registry.contains(peer) {
            debug!(%peer, cause, "Failure for unknown client ignored");
            return;
        }
        self.source.remove_subscriber(peer);
        let Some(entry) = self.registry.remove(peer) else {
            return;
        };
        let info = entry.handle.info().clone();
        info!(peer = %info, cause, "Client removed after failure");
        self.observer.on_connection_failed(&info, cause);
        self.notify_list_changed();
    }

    /// Observer-initiated removal: unsubscribe, unregister and close
    fn disconnect(&mut self, peer: PeerId) -> bool {
        if !self.registry.contains(peer) {
            return false;
        }
        self.source.remove_subscriber(peer);
        if let Some(entry) = self.registry.remove(peer) {
            info!(peer = %entry.handle.info(), "Client disconnected");
            entry.handle.close();
        }
        true
    }

    fn disconnect_all(&mut self) {
        if self.registry.is_empty() {
            return;
        }
        for entry in self.registry.drain() {
            self.source.remove_subscriber(entry.handle.id());
            entry.handle.close();
        }
        info!("All clients disconnected");
        self.notify_list_changed();
    }

    fn listener_changed(&mut self, status: ListenerStatus) {
        self.observer.on_listener_changed(&status);
        match self
            .listeners
            .iter_mut()
            .find(|l| l.id == status.id)
        {
            Some(existing) => *existing = status,
            None => self.listeners.push(status),
        }
    }

    fn notify_list_changed(&mut self) {
        let connections = self.registry.infos();
        self.observer.on_connection_list_changed(&connections);
    }

    fn snapshot(&self) -> HubSnapshot {
        HubSnapshot {
            provider: self.source.provider(),
            status: self.status,
            connections: self.registry.infos(),
            subscribers: self.source.subscriber_ids(),
            listeners: self.listeners.clone(),
        }
    }

    async fn shutdown(&mut self) {
        let entries = self.registry.drain();
        let count = entries.len();
        for entry in &entries {
            self.source.remove_subscriber(entry.handle.id());
            entry.handle.close();
        }
        for entry in entries {
            if tokio::time::timeout(self.close_timeout, entry.task).await.is_err() {
                warn!(peer = %entry.handle.info(), "Client did not close in time");
            }
        }
        self.source.shutdown();
        if count > 0 {
            self.notify_list_changed();
        }
        info!(closed = count, "Hub stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gps::Sentence,
        listener::{ListenerId, ListenerState, TransportKind},
        peer::PeerOptions,
        source::testing::ManualBackend,
    };
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, DuplexStream};

    struct TestHub {
        handle: HubHandle,
        backend: Arc<ManualBackend>,
        observed: mpsc::UnboundedReceiver<ObserverEvent>,
        task: JoinHandle<()>,
    }

    async fn start_hub() -> TestHub {
        let backend = ManualBackend::new();
        let (observer, observed) = ChannelObserver::new();
        let hub = Hub::new(ProviderId::Gps, backend.clone(), Box::new(observer))
            .with_close_timeout(Duration::from_millis(200));
        let handle = hub.handle();
        let task = hub.spawn();
        // Barrier: the source is subscribed once the first request is answered
        handle.snapshot().await.unwrap();
        TestHub {
            handle,
            backend,
            observed,
            task,
        }
    }

    fn connect(hub: &HubHandle, label: &str) -> (PeerId, DuplexStream) {
        let (server, client) = tokio::io::duplex(4096);
        let conn = PeerConnection::spawn(label, TransportKind::Tcp, server, hub.clone(), PeerOptions::default());
        let id = conn.handle().id();
        hub.new_connection(conn).unwrap();
        (id, client)
    }

    async fn next_list(observed: &mut mpsc::UnboundedReceiver<ObserverEvent>) -> Vec<PeerId> {
        loop {
            match observed.recv().await {
                Some(ObserverEvent::ConnectionListChanged(list)) => return list.iter().map(|p| p.id).collect(),
                Some(_) => continue,
                None => panic!("observer channel closed"),
            }
        }
    }

    async fn next_failure(observed: &mut mpsc::UnboundedReceiver<ObserverEvent>) -> PeerId {
        loop {
            match observed.recv().await {
                Some(ObserverEvent::ConnectionFailed { peer, .. }) => return peer.id,
                Some(_) => continue,
                None => panic!("observer channel closed"),
            }
        }
    }

    async fn read_line(client: &mut DuplexStream) -> String {
        let mut line = String::new();
        let mut reader = BufReader::new(client);
        tokio::time::timeout(Duration::from_secs(1), reader.read_line(&mut line))
            .await
            .expect("line arrives")
            .unwrap();
        line
    }

    fn assert_parity(snapshot: &HubSnapshot) {
        assert_eq!(snapshot.connection_ids(), snapshot.subscribers);
    }

    #[tokio::test]
    async fn test_connections_kept_in_arrival_order() {
        let hub = start_hub().await;
        let (a, _ca) = connect(&hub.handle, "a");
        let (b, _cb) = connect(&hub.handle, "b");
        let (c, _cc) = connect(&hub.handle, "c");

        let snapshot = hub.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.connection_ids(), vec![a, b, c]);
        assert_parity(&snapshot);
    }

    #[tokio::test]
    async fn test_fix_reaches_every_client() {
        let hub = start_hub().await;
        let (_a, mut ca) = connect(&hub.handle, "a");
        let (_b, mut cb) = connect(&hub.handle, "b");
        let (_c, mut cc) = connect(&hub.handle, "c");
        hub.handle.snapshot().await.unwrap();

        assert_eq!(hub.backend.sink().fix(&Sentence::new("$GPTXT,1*00")), 3);

        for client in [&mut ca, &mut cb, &mut cc] {
            assert_eq!(read_line(client).await, "$GPTXT,1*00\r\n");
        }
    }

    #[tokio::test]
    async fn test_failure_then_disconnect_removes_once() {
        let mut hub = start_hub().await;
        let (a, _ca) = connect(&hub.handle, "a");
        let (b, cb) = connect(&hub.handle, "b");
        assert_eq!(next_list(&mut hub.observed).await, vec![a]);
        assert_eq!(next_list(&mut hub.observed).await, vec![a, b]);

        drop(cb);
        assert_eq!(next_failure(&mut hub.observed).await, b);
        assert_eq!(next_list(&mut hub.observed).await, vec![a]);

        hub.handle.disconnect(b).unwrap();
        hub.handle.connection_failed(b, "late duplicate").unwrap();
        let snapshot = hub.handle.snapshot().await.unwrap();

        assert_eq!(snapshot.connection_ids(), vec![a]);
        assert_parity(&snapshot);
        assert!(hub.observed.try_recv().is_err(), "duplicate removals must stay silent");
    }

    #[tokio::test]
    async fn test_no_delivery_after_removal() {
        let hub = start_hub().await;
        let (_a, mut ca) = connect(&hub.handle, "a");
        let (b, mut cb) = connect(&hub.handle, "b");

        hub.handle.disconnect(b).unwrap();
        hub.handle.snapshot().await.unwrap();
        hub.backend.sink().fix(&Sentence::new("$GPTXT,after*00"));

        assert_eq!(read_line(&mut ca).await, "$GPTXT,after*00\r\n");
        let mut received = String::new();
        tokio::time::timeout(Duration::from_secs(1), cb.read_to_string(&mut received))
            .await
            .expect("removed client is closed")
            .unwrap();
        assert!(!received.contains("after"));
    }

    #[tokio::test]
    async fn test_failure_racing_a_fix() {
        let mut hub = start_hub().await;
        let (a, mut ca) = connect(&hub.handle, "a");
        let (b, cb) = connect(&hub.handle, "b");
        let (c, mut cc) = connect(&hub.handle, "c");
        hub.handle.snapshot().await.unwrap();

        let sink = hub.backend.sink();
        let broadcast = tokio::spawn(async move {
            sink.fix(&Sentence::new("$GPTXT,race*00"));
        });
        drop(cb);
        broadcast.await.unwrap();

        assert_eq!(next_failure(&mut hub.observed).await, b);
        let snapshot = hub.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.connection_ids(), vec![a, c]);
        assert_parity(&snapshot);

        assert_eq!(read_line(&mut ca).await, "$GPTXT,race*00\r\n");
        assert_eq!(read_line(&mut cc).await, "$GPTXT,race*00\r\n");
    }

    #[tokio::test]
    async fn test_disconnect_all() {
        let mut hub = start_hub().await;
        let (_a, mut ca) = connect(&hub.handle, "a");
        let (_b, _cb) = connect(&hub.handle, "b");
        let (_c, _cc) = connect(&hub.handle, "c");
        for _ in 0..3 {
            next_list(&mut hub.observed).await;
        }

        hub.handle.disconnect_all().unwrap();
        hub.handle.disconnect_all().unwrap();
        let snapshot = hub.handle.snapshot().await.unwrap();

        assert!(snapshot.connections.is_empty());
        assert!(snapshot.subscribers.is_empty());
        assert!(next_list(&mut hub.observed).await.is_empty());
        assert!(hub.observed.try_recv().is_err());

        let mut rest = Vec::new();
        ca.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_events_from_one_producer_keep_their_order() {
        let mut hub = start_hub().await;
        let (a, _ca) = connect(&hub.handle, "a");
        let (b, _cb) = connect(&hub.handle, "b");
        hub.handle.disconnect(a).unwrap();
        let (c, _cc) = connect(&hub.handle, "c");

        assert_eq!(next_list(&mut hub.observed).await, vec![a]);
        assert_eq!(next_list(&mut hub.observed).await, vec![a, b]);
        assert_eq!(next_list(&mut hub.observed).await, vec![b]);
        assert_eq!(next_list(&mut hub.observed).await, vec![b, c]);
    }

    #[tokio::test]
    async fn test_status_forwarded_verbatim() {
        let mut hub = start_hub().await;
        hub.backend.sink().status(ProviderStatus::Available);

        match hub.observed.recv().await {
            Some(ObserverEvent::StatusChanged(status)) => assert_eq!(status, ProviderStatus::Available),
            other => panic!("expected status, got {:?}", other),
        }
        assert_eq!(hub.handle.snapshot().await.unwrap().status, ProviderStatus::Available);
    }

    #[tokio::test]
    async fn test_same_provider_does_not_resubscribe() {
        let hub = start_hub().await;
        let (a, _ca) = connect(&hub.handle, "a");

        hub.handle.set_provider(ProviderId::Gps).unwrap();
        hub.handle.snapshot().await.unwrap();
        assert_eq!(hub.backend.spawn_count(), 1);

        hub.handle.set_provider(ProviderId::Network).unwrap();
        let snapshot = hub.handle.snapshot().await.unwrap();
        assert_eq!(hub.backend.spawn_count(), 2);
        assert_eq!(snapshot.provider, ProviderId::Network);
        assert_eq!(snapshot.subscribers, vec![a]);
    }

    #[tokio::test]
    async fn test_client_closed_before_registration_is_skipped() {
        let hub = start_hub().await;
        let (server, _client) = tokio::io::duplex(64);
        let conn = PeerConnection::spawn("gone", TransportKind::Tcp, server, hub.handle.clone(), PeerOptions::default());
        conn.handle().close();
        hub.handle.new_connection(conn).unwrap();

        let snapshot = hub.handle.snapshot().await.unwrap();
        assert!(snapshot.connections.is_empty());
        assert!(snapshot.subscribers.is_empty());
    }

    #[tokio::test]
    async fn test_listener_status_tracked_per_listener() {
        let mut hub = start_hub().await;
        let status = |state| ListenerStatus {
            id: ListenerId::from_raw(1),
            transport: TransportKind::Tcp,
            endpoint: "0.0.0.0:4352".to_string(),
            state,
        };
        hub.handle.listener_changed(status(ListenerState::Listening)).unwrap();
        hub.handle.listener_changed(status(ListenerState::Stopped)).unwrap();

        let snapshot = hub.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.listeners, vec![status(ListenerState::Stopped)]);
        assert!(matches!(hub.observed.recv().await, Some(ObserverEvent::ListenerChanged(_))));
    }

    #[tokio::test]
    async fn test_shutdown_with_stalled_client_is_bounded() {
        let hub = start_hub().await;
        // The client end is never read, so the writer stalls on a full pipe
        let (server, _client) = tokio::io::duplex(8);
        let conn = PeerConnection::spawn("stalled", TransportKind::Tcp, server, hub.handle.clone(), PeerOptions::default());
        let id = conn.handle().id();
        hub.handle.new_connection(conn).unwrap();
        hub.handle.snapshot().await.unwrap();

        for _ in 0..10 {
            hub.backend.sink().fix(&Sentence::new("$GPGGA,123519,4807.038,N*47"));
        }
        assert_eq!(hub.handle.snapshot().await.unwrap().connection_ids(), vec![id]);

        tokio::time::timeout(Duration::from_secs(2), hub.handle.shutdown())
            .await
            .expect("shutdown finishes")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), hub.task)
            .await
            .expect("hub task ends")
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients_and_stops() {
        let hub = start_hub().await;
        let (_a, mut ca) = connect(&hub.handle, "a");

        hub.handle.shutdown().await.unwrap();
        hub.task.await.unwrap();

        let mut rest = Vec::new();
        ca.read_to_end(&mut rest).await.unwrap();
        assert!(matches!(hub.handle.snapshot().await, Err(RelayError::HubClosed)));
        assert_eq!(hub.backend.sink().fix(&Sentence::new("$GPTXT*00")), 0);
    }
}
