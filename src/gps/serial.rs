// src/gps/serial.rs
//! Serial NMEA receiver backend. Sentences are forwarded untouched.

use super::nmea::Sentence;
use crate::{
    error::{RelayError, Result},
    source::{FixSink, ProviderStatus},
};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Open a GPS receiver on a serial port
pub fn open(port: &str, baudrate: u32) -> Result<SerialStream> {
    tokio_serial::new(port, baudrate)
        .timeout(Duration::from_millis(1000))
        .open_native_async()
        .map_err(|e| RelayError::Connection(format!("Failed to open serial port {}: {}", port, e)))
}

/// Feed sentences from the serial receiver into the sink until the task is aborted
pub async fn run(port: String, baudrate: u32, sink: FixSink) {
    loop {
        match open(&port, baudrate) {
            Ok(serial) => {
                info!(%port, baudrate, "Serial GPS opened");
                sink.status(ProviderStatus::TemporarilyUnavailable);
                relay_lines(serial, &sink).await;
            }
            Err(e) => warn!("{}", e),
        }

        sink.status(ProviderStatus::OutOfService);
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn relay_lines(serial: SerialStream, sink: &FixSink) {
    let result = read_sentences(serial, |sentence| {
        sink.status(ProviderStatus::Available);
        sink.fix(&sentence);
    })
    .await;

    if let Err(e) = result {
        warn!("Error reading from serial port: {}", e);
    }
}

/// Split a receiver byte stream into sentences until EOF.
///
/// Receivers interleave binary protocol frames with NMEA, and a wrong baud
/// rate produces noise; a line that isn't text keeps only its tail from the
/// last `$` or `!`, or is skipped entirely.
async fn read_sentences<R, F>(reader: R, mut on_sentence: F) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(Sentence),
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(()); // EOF
        }

        if let Some(sentence) = text_of(&line).and_then(Sentence::from_line) {
            on_sentence(sentence);
        }
    }
}

fn text_of(line: &[u8]) -> Option<&str> {
    if let Ok(text) = std::str::from_utf8(line) {
        return Some(text);
    }
    let start = line.iter().rposition(|&b| b == b'$' || b == b'!')?;
    match std::str::from_utf8(&line[start..]) {
        Ok(text) => Some(text),
        Err(_) => {
            debug!(len = line.len(), "Skipping non-text line");
            None
        }
    }
}

/// List available serial ports
pub fn list_serial_ports() -> Result<()> {
    let ports = tokio_serial::available_ports()
        .map_err(|e| RelayError::Other(format!("Failed to list serial ports: {}", e)))?;

    if ports.is_empty() {
        println!("No serial ports found.");
    } else {
        println!("Available serial ports:");
        for port in ports {
            println!("  {} - {:?}", port.port_name, port.port_type);
        }
    }

    Ok(())
}
