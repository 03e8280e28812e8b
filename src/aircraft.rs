//! ADS-B aircraft tracking
//!
//!  Maintains a table of recently seen aircraft fed by polls of a
//!  readsb-style `aircraft.json` document.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::physics::Coordinate;

/// Top level of the aggregator's aircraft list
#[derive(Debug, Clone, Deserialize)]
pub struct AircraftList {
    #[serde(default)]
    pub aircraft: Vec<AircraftReport>,
}

/// Barometric altitude is a number of feet, or the string "ground"
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum BaroAltitude {
    Feet(f64),
    Ground(String),
}

/// One aircraft entry as the aggregator reports it
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AircraftReport {
    pub hex: String,
    #[serde(default)]
    pub flight: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub alt_baro: Option<BaroAltitude>,
    #[serde(default)]
    pub alt_geom: Option<f64>,
    #[serde(default)]
    pub track: Option<f64>,
    /// Ground speed in knots
    #[serde(default)]
    pub gs: Option<f64>,
    #[serde(default)]
    pub baro_rate: Option<f64>,
    #[serde(default)]
    pub geom_rate: Option<f64>,
    #[serde(default)]
    pub squawk: Option<String>,
    #[serde(default)]
    pub rssi: Option<f64>,
    #[serde(default)]
    pub messages: Option<u64>,
    /// Seconds since the aggregator last heard this aircraft
    #[serde(default)]
    pub seen: Option<f64>,
    #[serde(default)]
    pub category: Option<String>,
}

/// Tracked aircraft data
#[derive(Debug, Clone)]
pub struct Aircraft {
    /// ICAO address as lowercase hex
    pub hex: String,
    /// Flight callsign
    pub flight: String,
    pub position: Option<Coordinate>,
    /// Altitude in feet (barometric, else geometric)
    pub altitude: Option<f64>,
    pub on_ground: bool,
    /// Track in degrees
    pub track: Option<f64>,
    /// Ground speed in knots
    pub speed: Option<f64>,
    /// Vertical rate in ft/min
    pub vertical_rate: Option<f64>,
    pub squawk: Option<String>,
    pub rssi: Option<f64>,
    /// Emitter category, e.g. "A1"
    pub category: Option<String>,
    /// Message count reported by the aggregator
    pub messages: u64,
    /// When the aggregator last heard this aircraft
    pub seen: Instant,
}

impl Aircraft {
    pub fn new(hex: &str, now: Instant) -> Self {
        Self {
            hex: hex.trim().to_ascii_lowercase(),
            flight: String::new(),
            position: None,
            altitude: None,
            on_ground: false,
            track: None,
            speed: None,
            vertical_rate: None,
            squawk: None,
            rssi: None,
            category: None,
            messages: 0,
            seen: now,
        }
    }

    /// Hijack, radio failure and general emergency codes
    pub fn is_emergency(&self) -> bool {
        matches!(self.squawk.as_deref(), Some("7500" | "7600" | "7700"))
    }

    pub fn uid(&self) -> String {
        format!("aircraft-{}", self.hex)
    }
}

/// Store for tracking multiple aircraft
pub struct AircraftStore {
    aircraft: HashMap<String, Aircraft>,
    ttl: Duration,
    /// Minimum messages required before aircraft is considered confirmed
    min_messages: u64,
}

impl AircraftStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self::with_min_messages(ttl_secs, 1)
    }

    /// Create a new store with custom minimum message threshold
    pub fn with_min_messages(ttl_secs: u64, min_messages: u64) -> Self {
        Self {
            aircraft: HashMap::new(),
            ttl: Duration::from_secs(ttl_secs),
            min_messages,
        }
    }

    /// Update aircraft from one report. Reports without a hex id are ignored.
    pub fn update_from_report(&mut self, report: &AircraftReport, now: Instant) -> Option<&Aircraft> {
        let key = report.hex.trim().to_ascii_lowercase();
        if key.is_empty() {
            return None;
        }

        let aircraft = self
            .aircraft
            .entry(key.clone())
            .or_insert_with(|| Aircraft::new(&key, now));
        aircraft.seen = report
            .seen
            .and_then(|age| Duration::try_from_secs_f64(age).ok())
            .and_then(|age| now.checked_sub(age))
            .unwrap_or(now);
        aircraft.messages = report.messages.unwrap_or(aircraft.messages + 1);

        if let Some(flight) = report.flight.as_deref() {
            let flight = flight.trim();
            if !flight.is_empty() {
                aircraft.flight = flight.to_string();
            }
        }

        if let (Some(lat), Some(lon)) = (report.lat, report.lon) {
            let c = Coordinate::new(lat, lon);
            if c.is_valid() {
                aircraft.position = Some(c);
            }
        }

        match &report.alt_baro {
            Some(BaroAltitude::Feet(ft)) => {
                aircraft.altitude = Some(*ft);
                aircraft.on_ground = false;
            }
            Some(BaroAltitude::Ground(_)) => {
                aircraft.altitude = Some(0.0);
                aircraft.on_ground = true;
            }
            None => {
                if report.alt_geom.is_some() {
                    aircraft.altitude = report.alt_geom;
                }
            }
        }

        if report.track.is_some() {
            aircraft.track = report.track;
        }
        if report.gs.is_some() {
            aircraft.speed = report.gs;
        }
        if let Some(rate) = report.baro_rate.or(report.geom_rate) {
            aircraft.vertical_rate = Some(rate);
        }
        if report.squawk.is_some() {
            aircraft.squawk = report.squawk.clone();
        }
        if report.rssi.is_some() {
            aircraft.rssi = report.rssi;
        }
        if report.category.is_some() {
            aircraft.category = report.category.clone();
        }

        self.aircraft.get(&key)
    }

    #[cfg(test)]
    pub fn get(&self, hex: &str) -> Option<&Aircraft> {
        self.aircraft.get(&hex.to_ascii_lowercase())
    }

    /// Get all aircraft that meet the minimum message threshold
    pub fn all(&self) -> impl Iterator<Item = &Aircraft> {
        let min_msg = self.min_messages;
        self.aircraft.values().filter(move |a| a.messages >= min_msg)
    }

    /// Remove stale aircraft
    pub fn remove_stale(&mut self, now: Instant) -> usize {
        let before = self.aircraft.len();
        let ttl = self.ttl;
        self.aircraft
            .retain(|_, a| now.saturating_duration_since(a.seen) <= ttl);
        before - self.aircraft.len()
    }

    /// Number of tracked aircraft (meeting minimum message threshold)
    pub fn len(&self) -> usize {
        self.all().count()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
