//! Proximity alert rings
//!
//!  A drone heard without a position is drawn as a ring around the
//!  listening station, sized from its signal strength.

use std::collections::HashMap;

use serde::Serialize;

use crate::event::FpvDetection;
use crate::physics::{self, Coordinate};
use crate::signature::DroneSignature;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRing {
    pub drone_id: String,
    pub center: Coordinate,
    /// Meters
    pub radius: f64,
    pub rssi: f64,
}

#[derive(Debug, Default)]
pub struct AlertRingCalculator {
    rings: HashMap<String, AlertRing>,
}

impl AlertRingCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute the ring for a drone after a new signature.
    ///
    /// A real position removes the ring. Without a station location there is
    /// nothing to center on and the previous ring is kept.
    pub fn update(&mut self, key: &str, sig: &DroneSignature, station: Option<Coordinate>) -> Option<&AlertRing> {
        if sig.position.has_fix() {
            self.rings.remove(key);
            return None;
        }
        let rssi = sig.transmission.signal_strength.filter(|r| *r != 0.0)?;
        let center = station?;
        let ring = AlertRing {
            drone_id: key.to_string(),
            center,
            radius: physics::distance_from_rssi(rssi),
            rssi,
        };
        self.rings.insert(key.to_string(), ring);
        self.rings.get(key)
    }

    /// FPV receivers report their own distance estimate
    pub fn update_fpv(&mut self, fpv: &FpvDetection, station: Option<Coordinate>) -> Option<&AlertRing> {
        let id = fpv.synthetic_id();
        let radius = fpv.estimated_distance.filter(|d| d.is_finite() && *d > 0.0)?;
        let ring = AlertRing {
            drone_id: id.clone(),
            center: station?,
            radius,
            rssi: fpv.rssi,
        };
        self.rings.insert(id.clone(), ring);
        self.rings.get(&id)
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<&AlertRing> {
        self.rings.get(id)
    }

    /// Drop rings whose drone is no longer tracked
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.rings.retain(|id, _| keep(id));
    }

    pub fn rings(&self) -> impl Iterator<Item = &AlertRing> {
        self.rings.values()
    }

    pub fn len(&self) -> usize {
        self.rings.len()
    }
}
