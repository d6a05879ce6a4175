// src/gps/nmea.rs
//! NMEA sentence framing and fix encoding
//!
//! The relay never interprets sentences it forwards. This module only builds
//! `$GPGGA`/`$GPRMC` sentences for backends that deliver decoded fixes.

use super::fix::Fix;
use chrono::{DateTime, Timelike, Utc};
use std::{fmt, sync::Arc};

/// An opaque line of NMEA text, without the trailing CR/LF.
///
/// Cloning is cheap; the same sentence is handed to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence(Arc<str>);

impl Sentence {
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        Self(text.into())
    }

    /// Build a sentence from a received line, dropping line terminators
    pub fn from_line(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            None
        } else {
            Some(Self::new(line))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Sentence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// XOR checksum over everything between `$` and `*`
pub fn checksum(body: &str) -> u8 {
    body.bytes().fold(0, |acc, b| acc ^ b)
}

/// Wrap a sentence body in `$...*CS`
pub fn frame(body: &str) -> Sentence {
    Sentence::new(format!("${}*{:02X}", body, checksum(body)))
}

/// Encode a fix as the GGA + RMC pair most consumers expect
pub fn encode_fix(fix: &Fix) -> Vec<Sentence> {
    vec![frame(&gga_body(fix)), frame(&rmc_body(fix))]
}

fn gga_body(fix: &Fix) -> String {
    let (lat, ns) = format_latitude(fix.latitude);
    let (lon, ew) = format_longitude(fix.longitude);
    let satellites = fix.satellites.map(|n| format!("{:02}", n)).unwrap_or_default();
    let hdop = fix.hdop.map(|h| format!("{:.1}", h)).unwrap_or_default();
    let altitude = fix.altitude.map(|a| format!("{:.1}", a)).unwrap_or_default();

    format!(
        "GPGGA,{},{},{},{},{},1,{},{},{},M,,M,,",
        format_time(&fix.timestamp),
        lat,
        ns,
        lon,
        ew,
        satellites,
        hdop,
        altitude
    )
}

fn rmc_body(fix: &Fix) -> String {
    let (lat, ns) = format_latitude(fix.latitude);
    let (lon, ew) = format_longitude(fix.longitude);
    let speed = fix.speed_knots().map(|k| format!("{:.1}", k)).unwrap_or_default();
    let course = fix.course.map(|c| format!("{:.1}", c)).unwrap_or_default();

    format!(
        "GPRMC,{},A,{},{},{},{},{},{},{},,,A",
        format_time(&fix.timestamp),
        lat,
        ns,
        lon,
        ew,
        speed,
        course,
        fix.timestamp.format("%d%m%y")
    )
}

/// `hhmmss.ss`
fn format_time(timestamp: &DateTime<Utc>) -> String {
    format!(
        "{}.{:02}",
        timestamp.format("%H%M%S"),
        timestamp.nanosecond() % 1_000_000_000 / 10_000_000
    )
}

/// `ddmm.mmmm` plus hemisphere
fn format_latitude(latitude: f64) -> (String, char) {
    let hemisphere = if latitude < 0.0 { 'S' } else { 'N' };
    (format_angle(latitude.abs(), 2), hemisphere)
}

/// `dddmm.mmmm` plus hemisphere
fn format_longitude(longitude: f64) -> (String, char) {
    let hemisphere = if longitude < 0.0 { 'W' } else { 'E' };
    (format_angle(longitude.abs(), 3), hemisphere)
}

fn format_angle(degrees: f64, degree_digits: usize) -> String {
    // Work in 1/10000 minute units so minutes never round up to 60
    let units = (degrees * 60.0 * 10_000.0).round() as u64;
    let whole_degrees = units / 600_000;
    let minute_units = units % 600_000;
    format!(
        "{:0width$}{:02}.{:04}",
        whole_degrees,
        minute_units / 10_000,
        minute_units % 10_000,
        width = degree_digits
    )
}
