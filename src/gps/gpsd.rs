// src/gps/gpsd.rs
//! GPSD client backend

use super::{fix::Fix, nmea};
use crate::{
    error::{RelayError, Result},
    source::{FixSink, ProviderStatus},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::{collections::HashMap, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
};
use tracing::{debug, info, warn};

/// Delay between reconnection attempts once gpsd goes away
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct GpsdMessage {
    class: String,
    #[serde(flatten)]
    data: HashMap<String, serde_json::Value>,
}

/// What a single gpsd report means for the relay
#[derive(Debug, Clone, PartialEq)]
pub enum GpsdReport {
    /// A usable 2D/3D fix
    Fix(Fix),
    /// TPV without a position (mode 0/1)
    NoFix,
    /// Anything that doesn't change the fix (SKY, VERSION, DEVICES, ...)
    Ignored,
}

/// Turns gpsd JSON reports into fixes, carrying satellite data from SKY
/// reports over into the next TPV.
#[derive(Debug, Default)]
pub struct GpsdDecoder {
    satellites: Option<u8>,
    hdop: Option<f64>,
}

impl GpsdDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a single line of gpsd JSON data
    pub fn decode(&mut self, line: &str) -> Result<GpsdReport> {
        let msg: GpsdMessage = serde_json::from_str(line)
            .map_err(|e| RelayError::Other(format!("Failed to parse gpsd JSON: {}", e)))?;

        let report = match msg.class.as_str() {
            "TPV" => self.decode_tpv(&msg.data),
            "SKY" => {
                self.decode_sky(&msg.data);
                GpsdReport::Ignored
            }
            "VERSION" => {
                if let Some(version) = msg.data.get("release").and_then(|v| v.as_str()) {
                    info!(version, "Connected to gpsd");
                }
                GpsdReport::Ignored
            }
            _ => GpsdReport::Ignored,
        };

        Ok(report)
    }

    /// Parse TPV (Time Position Velocity) message
    fn decode_tpv(&self, msg_data: &HashMap<String, serde_json::Value>) -> GpsdReport {
        let mode = msg_data.get("mode").and_then(|v| v.as_u64()).unwrap_or(0);
        let lat = msg_data.get("lat").and_then(|v| v.as_f64());
        let lon = msg_data.get("lon").and_then(|v| v.as_f64());

        let (latitude, longitude) = match (mode, lat, lon) {
            (2.., Some(lat), Some(lon)) => (lat, lon),
            _ => return GpsdReport::NoFix,
        };

        let timestamp = msg_data
            .get("time")
            .and_then(|v| v.as_str())
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let mut fix = Fix::new(timestamp, latitude, longitude);
        fix.altitude = msg_data
            .get("altMSL")
            .or_else(|| msg_data.get("alt"))
            .and_then(|v| v.as_f64());
        fix.speed = msg_data.get("speed").and_then(|v| v.as_f64());
        fix.course = msg_data.get("track").and_then(|v| v.as_f64());
        fix.satellites = self.satellites;
        fix.hdop = self.hdop;

        GpsdReport::Fix(fix)
    }

    /// Parse SKY (satellite data) message
    fn decode_sky(&mut self, msg_data: &HashMap<String, serde_json::Value>) {
        if let Some(satellites) = msg_data.get("satellites").and_then(|v| v.as_array()) {
            let used = satellites
                .iter()
                .filter(|sat| sat.get("used").and_then(|v| v.as_bool()).unwrap_or(false))
                .count();
            self.satellites = Some(used.min(u8::MAX as usize) as u8);
        } else if let Some(used) = msg_data.get("uSat").and_then(|v| v.as_u64()) {
            self.satellites = Some(used.min(u8::MAX as u64) as u8);
        }

        if let Some(hdop) = msg_data.get("hdop").and_then(|v| v.as_f64()) {
            self.hdop = Some(hdop);
        }
    }
}

/// Connect to a gpsd daemon and return a stream reader
pub async fn connect_gpsd(host: &str, port: u16) -> Result<BufReader<TcpStream>> {
    let mut stream = TcpStream::connect(format!("{}:{}", host, port))
        .await
        .map_err(|e| RelayError::Connection(format!("Failed to connect to gpsd at {}:{}: {}", host, port, e)))?;

    // Send WATCH command to start receiving JSON data
    let watch_cmd = "?WATCH={\"enable\":true,\"json\":true}\n";
    stream
        .write_all(watch_cmd.as_bytes())
        .await
        .map_err(|e| RelayError::Connection(format!("Failed to send WATCH command: {}", e)))?;

    Ok(BufReader::new(stream))
}

/// Feed fixes from gpsd into the sink until the task is aborted
pub async fn run(host: String, port: u16, sink: FixSink) {
    loop {
        match connect_gpsd(&host, port).await {
            Ok(reader) => {
                info!(%host, port, "Connected to gpsd");
                sink.status(ProviderStatus::TemporarilyUnavailable);
                relay_reports(reader, &sink).await;
            }
            Err(e) => warn!("{}", e),
        }

        sink.status(ProviderStatus::OutOfService);
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn relay_reports(mut reader: BufReader<TcpStream>, sink: &FixSink) {
    let mut decoder = GpsdDecoder::new();
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                warn!("gpsd closed the connection");
                return;
            }
            Ok(_) => match decoder.decode(line.trim()) {
                Ok(GpsdReport::Fix(fix)) => {
                    sink.status(ProviderStatus::Available);
                    for sentence in nmea::encode_fix(&fix) {
                        sink.fix(&sentence);
                    }
                }
                Ok(GpsdReport::NoFix) => sink.status(ProviderStatus::TemporarilyUnavailable),
                Ok(GpsdReport::Ignored) => {}
                Err(e) => debug!("{}", e),
            },
            Err(e) => {
                warn!("Error reading from gpsd: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tpv_decoding() {
        let mut decoder = GpsdDecoder::new();
        let json = r#"{"class":"TPV","device":"/dev/ttyUSB0","mode":3,"time":"2023-01-01T12:00:00.000Z","ept":0.005,"lat":48.117,"lon":11.517,"alt":545.4,"epx":15.319,"epy":17.054,"epv":124.484,"track":10.3797,"speed":0.091,"climb":10.7,"eps":34.11,"epc":248.97}"#;

        let fix = match decoder.decode(json).unwrap() {
            GpsdReport::Fix(fix) => fix,
            other => panic!("expected fix, got {:?}", other),
        };

        assert_eq!(fix.latitude, 48.117);
        assert_eq!(fix.longitude, 11.517);
        assert_eq!(fix.altitude, Some(545.4));
        assert_eq!(fix.speed, Some(0.091));
        assert_eq!(fix.course, Some(10.3797));
        assert_eq!(fix.timestamp.to_rfc3339(), "2023-01-01T12:00:00+00:00");
    }

    #[test]
    fn test_sky_carried_into_fix() {
        let mut decoder = GpsdDecoder::new();
        let sky = r#"{"class":"SKY","device":"/dev/ttyUSB0","time":"2023-01-01T12:00:00.000Z","hdop":1.2,"satellites":[{"PRN":1,"ss":42,"used":true},{"PRN":2,"ss":38,"used":true},{"PRN":3,"ss":12,"used":false}]}"#;
        let tpv = r#"{"class":"TPV","mode":2,"lat":1.0,"lon":2.0}"#;

        assert_eq!(decoder.decode(sky).unwrap(), GpsdReport::Ignored);
        match decoder.decode(tpv).unwrap() {
            GpsdReport::Fix(fix) => {
                assert_eq!(fix.satellites, Some(2));
                assert_eq!(fix.hdop, Some(1.2));
            }
            other => panic!("expected fix, got {:?}", other),
        }
    }

    #[test]
    fn test_tpv_without_fix() {
        let mut decoder = GpsdDecoder::new();
        let json = r#"{"class":"TPV","device":"/dev/ttyUSB0","mode":1}"#;
        assert_eq!(decoder.decode(json).unwrap(), GpsdReport::NoFix);
    }

    #[test]
    fn test_invalid_json() {
        let mut decoder = GpsdDecoder::new();
        let invalid_json = r#"{"invalid": json"#;

        assert!(decoder.decode(invalid_json).is_err());
    }
}
