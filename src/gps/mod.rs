// src/gps/mod.rs
//! Location backends and NMEA encoding

pub mod fix;
pub mod gpsd;
pub mod nmea;
pub mod serial;

pub use fix::Fix;
pub use nmea::Sentence;
