// src/gps/fix.rs
//! Position fix produced by a location backend

use chrono::{DateTime, Utc};

/// One position sample. Speed is in m/s, course in degrees true.
#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub course: Option<f64>,
    pub satellites: Option<u8>,
    pub hdop: Option<f64>,
}

impl Fix {
    pub fn new(timestamp: DateTime<Utc>, latitude: f64, longitude: f64) -> Self {
        Self {
            timestamp,
            latitude,
            longitude,
            altitude: None,
            speed: None,
            course: None,
            satellites: None,
            hdop: None,
        }
    }

    /// Speed over ground in knots, as NMEA wants it
    pub fn speed_knots(&self) -> Option<f64> {
        self.speed.map(|mps| mps * 3600.0 / 1852.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_knots() {
        let mut fix = Fix::new(Utc::now(), 48.0, 11.0);
        assert_eq!(fix.speed_knots(), None);

        fix.speed = Some(1852.0 / 3600.0);
        assert!((fix.speed_knots().unwrap() - 1.0).abs() < 1e-9);
    }
}
