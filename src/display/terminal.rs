// src/display/terminal.rs
//! Terminal-based display implementation
//!
//! Shows the provider status, the listeners and the connected clients, and
//! turns key presses into hub requests.

use crate::{
    error::Result,
    hub::{HubHandle, ObserverEvent},
    listener::{ListenerState, ListenerStatus},
    peer::PeerInfo,
    source::{ProviderId, ProviderStatus},
};
use crossterm::{
    cursor::{Hide, MoveTo, Show},
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute, queue,
    style::{Color, Print, ResetColor, SetForegroundColor},
    terminal::{self, Clear, ClearType, DisableLineWrap, EnableLineWrap},
};
use std::{
    io::{self, Write},
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// What a key press asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Disconnect the client at this position of the list (0-based)
    Disconnect(usize),
    DisconnectAll,
    Provider(ProviderId),
    Quit,
}

pub fn command_for_key(key: KeyEvent) -> Option<Command> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    match key.code {
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Some(Command::Quit),
        KeyCode::Char('q') | KeyCode::Esc => Some(Command::Quit),
        KeyCode::Char('a') => Some(Command::DisconnectAll),
        KeyCode::Char('g') => Some(Command::Provider(ProviderId::Gps)),
        KeyCode::Char('n') => Some(Command::Provider(ProviderId::Network)),
        KeyCode::Char(c @ '1'..='9') => Some(Command::Disconnect(c as usize - '1' as usize)),
        _ => None,
    }
}

/// Everything the screen shows, kept up to date from observer events
#[derive(Debug, Clone, Default)]
pub struct DisplayState {
    pub provider: ProviderId,
    pub status: ProviderStatus,
    pub connections: Vec<PeerInfo>,
    pub listeners: Vec<ListenerStatus>,
    pub last_message: Option<String>,
}

impl DisplayState {
    pub fn apply(&mut self, event: ObserverEvent) {
        match event {
            ObserverEvent::StatusChanged(status) => self.status = status,
            ObserverEvent::ConnectionListChanged(connections) => self.connections = connections,
            ObserverEvent::ConnectionFailed { peer, message } => {
                self.last_message = Some(format!("{} dropped: {}", peer, message));
            }
            ObserverEvent::ListenerChanged(listener) => {
                match self
                    .listeners
                    .iter_mut()
                    .find(|l| l.id == listener.id)
                {
                    Some(existing) => *existing = listener,
                    None => self.listeners.push(listener),
                }
            }
        }
    }

    /// Screen content, one entry per row
    pub fn lines(&self) -> Vec<(Color, String)> {
        let mut lines = vec![
            (Color::Green, "=".repeat(60)),
            (Color::Green, "NMEA Relay".to_string()),
            (Color::Green, "=".repeat(60)),
            (Color::Reset, format!("Provider: {} ({})", self.provider, self.status)),
            (Color::Reset, String::new()),
            (Color::Yellow, "LISTENERS:".to_string()),
        ];

        if self.listeners.is_empty() {
            lines.push((Color::Reset, "  none".to_string()));
        }
        for listener in &self.listeners {
            let color = match listener.state {
                ListenerState::Failed(_) => Color::Red,
                _ => Color::Reset,
            };
            lines.push((
                color,
                format!("  {:<6} {:<28} {}", listener.transport, listener.endpoint, listener.state),
            ));
        }

        lines.push((Color::Reset, String::new()));
        lines.push((Color::Cyan, format!("CLIENTS ({}):", self.connections.len())));
        if self.connections.is_empty() {
            lines.push((Color::Reset, "  no clients connected".to_string()));
        }
        for (index, peer) in self.connections.iter().enumerate() {
            let key = if index < 9 {
                format!("[{}]", index + 1)
            } else {
                "   ".to_string()
            };
            lines.push((Color::Reset, format!("  {} {}", key, peer)));
        }

        lines.push((Color::Reset, String::new()));
        if let Some(message) = &self.last_message {
            lines.push((Color::Magenta, message.clone()));
        }
        lines.push((Color::Green, "=".repeat(60)));
        lines.push((
            Color::Green,
            "1-9 disconnect  a all  g gps  n network  q quit".to_string(),
        ));
        lines
    }
}

pub struct TerminalDisplay {
    hub: HubHandle,
    state: DisplayState,
}

impl TerminalDisplay {
    pub fn new(hub: HubHandle, provider: ProviderId) -> Self {
        Self {
            hub,
            state: DisplayState {
                provider,
                ..Default::default()
            },
        }
    }

    /// Start the terminal display loop. Returns when the user quits, on
    /// Ctrl+C, or when the hub stops sending notifications.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<ObserverEvent>) -> Result<()> {
        if let Ok(snapshot) = self.hub.snapshot().await {
            self.state.provider = snapshot.provider;
            self.state.status = snapshot.status;
            self.state.connections = snapshot.connections;
            self.state.listeners = snapshot.listeners;
        }

        let mut stdout = io::stdout();
        terminal::enable_raw_mode()?;
        let restore = RestoreOnDrop::new(restore_terminal);
        execute!(stdout, Hide, DisableLineWrap)?;

        let stop = CancellationToken::new();
        let (key_tx, mut keys) = mpsc::unbounded_channel();
        let reader = tokio::task::spawn_blocking({
            let stop = stop.clone();
            move || read_keys(key_tx, stop)
        });

        let result: Result<()> = async {
            self.render(&mut stdout)?;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Some(event) => self.state.apply(event),
                        None => break,
                    },
                    command = keys.recv() => match command {
                        Some(Command::Quit) | None => break,
                        Some(command) => self.execute(command),
                    },
                }
                self.render(&mut stdout)?;
            }
            Ok(())
        }
        .await;

        stop.cancel();
        let _ = reader.await;
        execute!(stdout, Clear(ClearType::All), MoveTo(0, 0))?;
        drop(restore);
        println!("Shutting down...");
        result
    }

    fn execute(&mut self, command: Command) {
        let posted = match command {
            Command::Disconnect(index) => match self.state.connections.get(index) {
                Some(peer) => self.hub.disconnect(peer.id),
                None => Ok(()),
            },
            Command::DisconnectAll => self.hub.disconnect_all(),
            Command::Provider(provider) => {
                self.state.provider = provider;
                self.hub.set_provider(provider)
            }
            Command::Quit => Ok(()),
        };
        if let Err(e) = posted {
            self.state.last_message = Some(e.to_string());
        }
    }

    fn render(&self, stdout: &mut impl Write) -> Result<()> {
        queue!(stdout, Clear(ClearType::All))?;
        for (row, (color, text)) in self.state.lines().into_iter().enumerate() {
            queue!(
                stdout,
                MoveTo(0, row as u16),
                SetForegroundColor(color),
                Print(text),
                ResetColor
            )?;
        }
        stdout.flush()?;
        Ok(())
    }
}

/// Runs `restore` when dropped, so every exit path out of the display
/// leaves the terminal usable
struct RestoreOnDrop<F: FnMut()> {
    restore: F,
}

impl<F: FnMut()> RestoreOnDrop<F> {
    fn new(restore: F) -> Self {
        Self { restore }
    }
}

impl<F: FnMut()> Drop for RestoreOnDrop<F> {
    fn drop(&mut self) {
        (self.restore)();
    }
}

fn restore_terminal() {
    if let Err(e) = execute!(io::stdout(), Show, EnableLineWrap) {
        warn!("Failed to restore cursor: {}", e);
    }
    if let Err(e) = terminal::disable_raw_mode() {
        warn!("Failed to leave raw mode: {}", e);
    }
}

/// Blocking key reader, polled so that it notices `stop`
fn read_keys(keys: mpsc::UnboundedSender<Command>, stop: CancellationToken) {
    while !stop.is_cancelled() {
        match event::poll(Duration::from_millis(200)) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                warn!("Terminal input failed: {}", e);
                return;
            }
        }
        match event::read() {
            Ok(Event::Key(key)) => {
                if let Some(command) = command_for_key(key) {
                    if keys.send(command).is_err() {
                        return;
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Terminal input failed: {}", e);
                return;
            }
        }
    }
}
