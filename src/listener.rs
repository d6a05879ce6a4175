// src/listener.rs
//! Transport listeners accepting NMEA clients
//!
//! Each listener binds once, then runs an accept loop on its own task and
//! hands every accepted stream to the hub as a new connection. A listener
//! that fails to bind (or whose transport doesn't exist on this platform)
//! goes to `Failed` without affecting any other listener.

use crate::{
    error::{RelayError, Result},
    hub::HubHandle,
    peer::{PeerConnection, PeerOptions},
};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(unix)]
use tokio::net::UnixListener;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    /// Unix domain socket
    Local,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Local => write!(f, "local"),
        }
    }
}

/// Identifies one listener across its status reports; the endpoint alone
/// changes once a port 0 request is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    Starting,
    Listening,
    Failed(String),
    Stopped,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerState::Starting => write!(f, "starting"),
            ListenerState::Listening => write!(f, "listening"),
            ListenerState::Failed(reason) => write!(f, "failed: {}", reason),
            ListenerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Listener state as reported to the hub and the observer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerStatus {
    pub id: ListenerId,
    pub transport: TransportKind,
    pub endpoint: String,
    pub state: ListenerState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerConfig {
    Tcp { bind: IpAddr, port: u16 },
    Local { path: PathBuf },
}

impl ListenerConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            ListenerConfig::Tcp { .. } => TransportKind::Tcp,
            ListenerConfig::Local { .. } => TransportKind::Local,
        }
    }

    pub fn endpoint(&self) -> String {
        match self {
            ListenerConfig::Tcp { bind, port } => SocketAddr::new(*bind, *port).to_string(),
            ListenerConfig::Local { path } => path.display().to_string(),
        }
    }
}

enum Bound {
    Tcp(TcpListener),
    #[cfg(unix)]
    Local(UnixListener),
    /// Accept always fails with this error kind
    #[cfg(test)]
    Broken(std::io::ErrorKind),
}

impl Bound {
    async fn bind(config: &ListenerConfig) -> std::io::Result<(Self, String)> {
        match config {
            ListenerConfig::Tcp { bind, port } => {
                let listener = TcpListener::bind(SocketAddr::new(*bind, *port)).await?;
                let endpoint = listener.local_addr()?.to_string();
                Ok((Bound::Tcp(listener), endpoint))
            }
            #[cfg(unix)]
            ListenerConfig::Local { path } => {
                remove_stale_socket(path)?;
                let listener = UnixListener::bind(path)?;
                Ok((Bound::Local(listener), path.display().to_string()))
            }
            #[cfg(not(unix))]
            ListenerConfig::Local { .. } => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "not available on this platform",
            )),
        }
    }

    /// Accept one client and wrap it as a connection
    async fn accept(&self, serial: &mut u64, hub: &HubHandle, options: PeerOptions) -> std::io::Result<PeerConnection> {
        *serial += 1;
        match self {
            Bound::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                }
                Ok(PeerConnection::spawn(
                    format!("tcp:{}", addr),
                    TransportKind::Tcp,
                    stream,
                    hub.clone(),
                    options,
                ))
            }
            #[cfg(unix)]
            Bound::Local(listener) => {
                let (stream, _addr) = listener.accept().await?;
                Ok(PeerConnection::spawn(
                    format!("local:{}", serial),
                    TransportKind::Local,
                    stream,
                    hub.clone(),
                    options,
                ))
            }
            #[cfg(test)]
            Bound::Broken(kind) => Err(std::io::Error::new(*kind, "accept failed")),
        }
    }
}

/// Only ever remove something that is a socket; a regular file at the path is a config error
#[cfg(unix)]
fn remove_stale_socket(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => std::fs::remove_file(path),
        Ok(_) => Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "path exists and is not a socket",
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Posts status changes of one listener to the hub
#[derive(Clone)]
struct Reporter {
    id: ListenerId,
    transport: TransportKind,
    endpoint: String,
    hub: HubHandle,
}

impl Reporter {
    fn report(&self, state: ListenerState) {
        // Nobody left to tell once the hub is gone
        let _ = self.hub.listener_changed(ListenerStatus {
            id: self.id,
            transport: self.transport,
            endpoint: self.endpoint.clone(),
            state,
        });
    }
}

fn lock(state: &Mutex<ListenerState>) -> std::sync::MutexGuard<'_, ListenerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ConnectionListener {
    config: ListenerConfig,
    reporter: Reporter,
    state: Arc<Mutex<ListenerState>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConnectionListener {
    /// Bind the transport and start accepting clients.
    ///
    /// The hub sees `Starting` first. A bind failure is then reported once
    /// as `Failed` and returned as [`RelayError::Bind`]; there is no retry.
    pub async fn start(config: ListenerConfig, hub: HubHandle, options: PeerOptions) -> Result<Self> {
        let mut reporter = Reporter {
            id: ListenerId::next(),
            transport: config.kind(),
            endpoint: config.endpoint(),
            hub,
        };
        reporter.report(ListenerState::Starting);

        let (bound, endpoint) = match Bound::bind(&config).await {
            Ok(bound) => bound,
            Err(e) => {
                let reason = e.to_string();
                warn!(transport = %reporter.transport, endpoint = %reporter.endpoint, %reason, "Listener failed to start");
                reporter.report(ListenerState::Failed(reason.clone()));
                return Err(RelayError::Bind {
                    transport: reporter.transport,
                    endpoint: reporter.endpoint,
                    reason,
                });
            }
        };

        reporter.endpoint = endpoint;
        info!(transport = %reporter.transport, endpoint = %reporter.endpoint, "Listening for clients");
        Ok(Self::spawn(config, bound, reporter, options))
    }

    fn spawn(config: ListenerConfig, bound: Bound, reporter: Reporter, options: PeerOptions) -> Self {
        let state = Arc::new(Mutex::new(ListenerState::Listening));
        reporter.report(ListenerState::Listening);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            bound,
            reporter.clone(),
            Arc::clone(&state),
            cancel.clone(),
            options,
        ));

        Self {
            config,
            reporter,
            state,
            cancel,
            task: Some(task),
        }
    }

    pub fn id(&self) -> ListenerId {
        self.reporter.id
    }

    pub fn transport(&self) -> TransportKind {
        self.reporter.transport
    }

    /// Bound address, with the real port when port 0 was requested
    pub fn endpoint(&self) -> &str {
        &self.reporter.endpoint
    }

    pub fn state(&self) -> ListenerState {
        lock(&self.state).clone()
    }

    /// Release the transport and end the accept loop. Stopping twice is a no-op.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        self.cancel.cancel();
        if let Err(e) = task.await {
            warn!(transport = %self.transport(), "Accept loop ended abnormally: {}", e);
        }
        self.remove_socket();

        let mut state = lock(&self.state);
        if *state == ListenerState::Listening {
            *state = ListenerState::Stopped;
            self.reporter.report(ListenerState::Stopped);
            info!(transport = %self.transport(), endpoint = %self.endpoint(), "Listener stopped");
        }
    }

    fn remove_socket(&self) {
        #[cfg(unix)]
        if let ListenerConfig::Local { path } = &self.config {
            let _ = remove_stale_socket(path);
        }
    }
}

impl Drop for ConnectionListener {
    /// A listener dropped without `stop` still releases its socket path
    fn drop(&mut self) {
        if self.task.take().is_some() {
            self.cancel.cancel();
            self.remove_socket();
        }
    }
}

async fn accept_loop(
    bound: Bound,
    reporter: Reporter,
    state: Arc<Mutex<ListenerState>>,
    cancel: CancellationToken,
    options: PeerOptions,
) {
    let transport = reporter.transport;
    let mut serial = 0u64;

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = bound.accept(&mut serial, &reporter.hub, options) => accepted,
        };

        match accepted {
            Ok(peer) => {
                info!(%transport, peer = %peer.handle().info(), "Client accepted");
                if reporter.hub.new_connection(peer).is_err() {
                    warn!(%transport, "Hub gone, closing accepted client");
                    break;
                }
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(%transport, endpoint = %reporter.endpoint, %reason, "Accept failed, listener stopped");
                *lock(&state) = ListenerState::Failed(reason.clone());
                reporter.report(ListenerState::Failed(reason));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{self, HubEvent};
    use tokio::{io::AsyncWriteExt, net::TcpStream};

    fn loopback(port: u16) -> ListenerConfig {
        ListenerConfig::Tcp {
            bind: IpAddr::from([127, 0, 0, 1]),
            port,
        }
    }

    fn listener_state(event: Option<HubEvent>) -> ListenerState {
        match event {
            Some(HubEvent::ListenerChanged(status)) => status.state,
            _ => panic!("expected listener event"),
        }
    }

    #[tokio::test]
    async fn test_tcp_accept_posts_new_connection() {
        let (hub, mut events) = hub::channel();
        let mut listener = ConnectionListener::start(loopback(0), hub, PeerOptions::default())
            .await
            .unwrap();
        assert_eq!(listener_state(events.recv().await), ListenerState::Starting);
        assert_eq!(listener_state(events.recv().await), ListenerState::Listening);
        assert_eq!(listener.state(), ListenerState::Listening);

        let mut client = TcpStream::connect(listener.endpoint()).await.unwrap();
        match events.recv().await {
            Some(HubEvent::NewConnection(peer)) => {
                assert_eq!(peer.handle().info().transport, TransportKind::Tcp);
                assert!(peer.handle().info().label.starts_with("tcp:127.0.0.1:"));
            }
            _ => panic!("expected new connection"),
        }
        client.shutdown().await.unwrap();

        listener.stop().await;
        assert_eq!(listener.state(), ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported_once() {
        let (hub, mut events) = hub::channel();
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let result = ConnectionListener::start(loopback(port), hub, PeerOptions::default()).await;
        match result {
            Err(RelayError::Bind { transport, .. }) => assert_eq!(transport, TransportKind::Tcp),
            _ => panic!("expected bind failure"),
        }
        assert_eq!(listener_state(events.recv().await), ListenerState::Starting);
        assert!(matches!(listener_state(events.recv().await), ListenerState::Failed(_)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_status_keeps_its_id_once_bound() {
        let (hub, mut events) = hub::channel();
        let listener = ConnectionListener::start(loopback(0), hub, PeerOptions::default())
            .await
            .unwrap();

        let mut statuses = Vec::new();
        for _ in 0..2 {
            match events.recv().await {
                Some(HubEvent::ListenerChanged(status)) => statuses.push(status),
                _ => panic!("expected listener event"),
            }
        }
        assert_eq!(statuses[0].endpoint, "127.0.0.1:0");
        assert_eq!(statuses[1].endpoint, listener.endpoint());
        assert!(statuses.iter().all(|s| s.id == listener.id()));
    }

    #[tokio::test]
    async fn test_accept_error_fails_listener_once() {
        let (hub, mut events) = hub::channel();
        let reporter = Reporter {
            id: ListenerId::next(),
            transport: TransportKind::Tcp,
            endpoint: "127.0.0.1:4352".to_string(),
            hub,
        };
        let mut listener = ConnectionListener::spawn(
            loopback(4352),
            Bound::Broken(std::io::ErrorKind::ConnectionAborted),
            reporter,
            PeerOptions::default(),
        );

        assert_eq!(listener_state(events.recv().await), ListenerState::Listening);
        assert!(matches!(listener_state(events.recv().await), ListenerState::Failed(_)));

        // Waits for the accept loop, which already ended on its own
        listener.stop().await;
        assert!(matches!(listener.state(), ListenerState::Failed(_)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_twice_is_noop() {
        let (hub, mut events) = hub::channel();
        let mut listener = ConnectionListener::start(loopback(0), hub, PeerOptions::default())
            .await
            .unwrap();
        let endpoint = listener.endpoint().to_string();

        listener.stop().await;
        listener.stop().await;

        assert_eq!(listener_state(events.recv().await), ListenerState::Starting);
        assert_eq!(listener_state(events.recv().await), ListenerState::Listening);
        assert_eq!(listener_state(events.recv().await), ListenerState::Stopped);
        assert!(events.try_recv().is_err());
        assert!(TcpStream::connect(&endpoint).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_socket_accepts_and_cleans_up() {
        let path = std::env::temp_dir().join(format!("nmea-relay-test-{}.sock", std::process::id()));
        let (hub, mut events) = hub::channel();
        let mut listener = ConnectionListener::start(ListenerConfig::Local { path: path.clone() }, hub, PeerOptions::default())
            .await
            .unwrap();
        assert_eq!(listener_state(events.recv().await), ListenerState::Starting);
        assert_eq!(listener_state(events.recv().await), ListenerState::Listening);

        let _client = tokio::net::UnixStream::connect(&path).await.unwrap();
        match events.recv().await {
            Some(HubEvent::NewConnection(peer)) => assert_eq!(peer.handle().info().label, "local:1"),
            _ => panic!("expected new connection"),
        }

        listener.stop().await;
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropped_local_listener_removes_socket() {
        let path = std::env::temp_dir().join(format!("nmea-relay-drop-{}.sock", std::process::id()));
        let (hub, _events) = hub::channel();
        let listener = ConnectionListener::start(ListenerConfig::Local { path: path.clone() }, hub, PeerOptions::default())
            .await
            .unwrap();
        assert!(path.exists());

        drop(listener);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_socket_refuses_regular_file() {
        let path = std::env::temp_dir().join(format!("nmea-relay-test-{}.file", std::process::id()));
        std::fs::write(&path, b"keep me").unwrap();
        let (hub, _events) = hub::channel();

        let result = ConnectionListener::start(ListenerConfig::Local { path: path.clone() }, hub, PeerOptions::default()).await;
        assert!(matches!(result, Err(RelayError::Bind { .. })));
        assert!(path.exists());
        std::fs::remove_file(&path).unwrap();
    }
}
