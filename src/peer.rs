// src/peer.rs
//! One connected client and its write path
//!
//! Sentences are queued without blocking and written by a per-peer task. The
//! first I/O error, remote hang-up or queue overflow is reported to the hub
//! exactly once; after that, or after an explicit [`PeerHandle::close`], the
//! task releases the transport.

use crate::{gps::Sentence, hub::HubHandle, listener::TransportKind};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    fn next() -> Self {
        Self(NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Open,
    Closing,
    Closed,
}

impl PeerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PeerState::Open,
            1 => PeerState::Closing,
            _ => PeerState::Closed,
        }
    }
}

/// What the observer gets to see about a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub label: String,
    pub transport: TransportKind,
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Per-connection tuning
#[derive(Debug, Clone, Copy)]
pub struct PeerOptions {
    /// Queued sentences before the client is dropped as too slow
    pub send_buffer: usize,
    /// Upper bound for flushing and shutting down the transport
    pub close_timeout: Duration,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            send_buffer: 64,
            close_timeout: Duration::from_secs(2),
        }
    }
}

struct PeerShared {
    info: PeerInfo,
    state: AtomicU8,
    queue: mpsc::Sender<Sentence>,
    cancel: CancellationToken,
    hub: HubHandle,
}

/// Cheap reference to a client, shared by the hub registry and the source
#[derive(Clone)]
pub struct PeerHandle {
    shared: Arc<PeerShared>,
}

impl PeerHandle {
    pub fn id(&self) -> PeerId {
        self.shared.info.id
    }

    pub fn info(&self) -> &PeerInfo {
        &self.shared.info
    }

    pub fn state(&self) -> PeerState {
        PeerState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    /// Queue a sentence for writing. Never blocks; returns `false` if the
    /// sentence was not queued.
    pub fn send(&self, sentence: Sentence) -> bool {
        if self.state() != PeerState::Open {
            return false;
        }
        match self.shared.queue.try_send(sentence) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.fail("send buffer overflow");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Start closing the connection. Idempotent; returns `true` only for the
    /// call that initiated the close.
    pub fn close(&self) -> bool {
        if self.begin_close() {
            debug!(peer = %self.shared.info, "Closing connection");
            self.shared.cancel.cancel();
            true
        } else {
            false
        }
    }

    /// Report a failure to the hub once, then close
    fn fail(&self, cause: &str) {
        if !self.begin_close() {
            return;
        }
        info!(peer = %self.shared.info, cause, "Connection failed");
        if self.shared.hub.connection_failed(self.id(), cause).is_err() {
            debug!(peer = %self.shared.info, "Hub gone, failure not reported");
        }
        self.shared.cancel.cancel();
    }

    fn begin_close(&self) -> bool {
        self.shared
            .state
            .compare_exchange(
                PeerState::Open as u8,
                PeerState::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    fn mark_closed(&self) {
        self.shared.state.store(PeerState::Closed as u8, Ordering::SeqCst);
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("info", &self.shared.info)
            .field("state", &self.state())
            .finish()
    }
}

/// A freshly accepted client: its handle plus the task driving its transport
pub struct PeerConnection {
    handle: PeerHandle,
    task: JoinHandle<()>,
}

impl PeerConnection {
    /// Wrap an accepted stream and start its I/O task
    pub fn spawn<S>(
        label: impl Into<String>,
        transport: TransportKind,
        stream: S,
        hub: HubHandle,
        options: PeerOptions,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (queue, rx) = mpsc::channel(options.send_buffer.max(1));
        let handle = PeerHandle {
            shared: Arc::new(PeerShared {
                info: PeerInfo {
                    id: PeerId::next(),
                    label: label.into(),
                    transport,
                },
                state: AtomicU8::new(PeerState::Open as u8),
                queue,
                cancel: CancellationToken::new(),
                hub,
            }),
        };

        let task = tokio::spawn(run_io(handle.clone(), stream, rx, options.close_timeout));
        Self { handle, task }
    }

    pub fn handle(&self) -> &PeerHandle {
        &self.handle
    }

    pub fn into_parts(self) -> (PeerHandle, JoinHandle<()>) {
        (self.handle, self.task)
    }
}

async fn run_io<S>(handle: PeerHandle, stream: S, mut rx: mpsc::Receiver<Sentence>, close_timeout: Duration)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let cancel = handle.shared.cancel.clone();
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut scratch = [0u8; 512];

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sentence = rx.recv() => {
                let Some(sentence) = sentence else { break };
                let written = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = write_sentence(&mut writer, &sentence) => result,
                };
                if let Err(e) = written {
                    handle.fail(&e.to_string());
                    break;
                }
            }
            // Clients have nothing to say; reading only detects hang-ups
            read = reader.read(&mut scratch) => match read {
                Ok(0) => {
                    handle.fail("connection closed by peer");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    handle.fail(&e.to_string());
                    break;
                }
            },
        }
    }

    if tokio::time::timeout(close_timeout, writer.shutdown()).await.is_err() {
        debug!(peer = %handle.shared.info, "Transport shutdown timed out");
    }
    drop(writer);
    drop(reader);
    handle.mark_closed();
    debug!(peer = %handle.shared.info, "Connection closed");
}

async fn write_sentence<W>(writer: &mut W, sentence: &Sentence) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(sentence.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await
}
