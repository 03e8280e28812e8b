//! Spoof and anomaly detection
//!
//!  Heuristic rules, each adding to a confidence score:
//!
//!    RSSI off the path-loss prediction by more than 15 dB     +0.2
//!    speed between recent consecutive fixes above 100 m/s     +0.3
//!    RSSI static (< 1 dB) while the position moved > 10 m     +0.4
//!    position jump above 1000 m in under 5 s                  +0.4
//!
//!  A track is flagged at 0.6. Fast genuine platforms will trip this.

use serde::Serialize;

use crate::physics::{self, Coordinate};
use crate::signature::DroneSignature;

const RSSI_DEVIATION_DB: f64 = 15.0;
const MAX_SPEED_MS: f64 = 100.0;
/// Fixes, newest included, whose consecutive legs the speed rule checks
const SPEED_WINDOW: usize = 5;
const STATIC_RSSI_DB: f64 = 1.0;
const STATIC_MOVE_M: f64 = 10.0;
const JUMP_DISTANCE_M: f64 = 1000.0;
const JUMP_WINDOW_S: f64 = 5.0;

const RSSI_DEVIATION_WEIGHT: f64 = 0.2;
const SPEED_WEIGHT: f64 = 0.3;
const STATIC_RSSI_WEIGHT: f64 = 0.4;
const JUMP_WEIGHT: f64 = 0.4;

pub const SPOOF_THRESHOLD: f64 = 0.6;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpoofResult {
    pub is_spoofed: bool,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub expected_rssi: Option<f64>,
    pub actual_rssi: f64,
    /// Meters from the monitor, when the drone has a fix
    pub distance: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct SpoofDetector;

impl SpoofDetector {
    pub fn new() -> Self {
        Self
    }

    /// Check `sig` against the monitor position and the drone's earlier
    /// signatures (oldest first). No result without a signal strength.
    pub fn detect(
        &self,
        sig: &DroneSignature,
        monitor: Coordinate,
        previous: &[DroneSignature],
    ) -> Option<SpoofResult> {
        let actual_rssi = sig.transmission.signal_strength?;
        let mut confidence = 0.0;
        let mut reasons = Vec::new();

        let distance = sig
            .position
            .has_fix()
            .then(|| monitor.distance_to(&sig.position.coordinate));
        let expected_rssi = distance.map(physics::expected_rssi);

        if let Some(expected) = expected_rssi {
            let deviation = (actual_rssi - expected).abs();
            if deviation > RSSI_DEVIATION_DB {
                confidence += RSSI_DEVIATION_WEIGHT;
                reasons.push(format!(
                    "RSSI {:.0} dBm is {:.0} dB off expected {:.0} dBm",
                    actual_rssi, deviation, expected
                ));
            }
        }

        let fixes: Vec<&DroneSignature> = previous
            .iter()
            .chain(std::iter::once(sig))
            .filter(|s| s.position.has_fix())
            .collect();

        let recent = &fixes[fixes.len().saturating_sub(SPEED_WINDOW)..];
        let max_speed = recent
            .windows(2)
            .filter_map(|w| {
                let dt = w[1].timestamp.saturating_duration_since(w[0].timestamp).as_secs_f64();
                (dt > 0.0).then(|| w[0].position.coordinate.distance_to(&w[1].position.coordinate) / dt)
            })
            .fold(0.0, f64::max);
        if max_speed > MAX_SPEED_MS {
            confidence += SPEED_WEIGHT;
            reasons.push(format!("implied speed {:.0} m/s", max_speed));
        }

        if let Some(prev) = previous.iter().rev().find(|p| p.position.has_fix()) {
            if sig.position.has_fix() {
                let moved = prev.position.coordinate.distance_to(&sig.position.coordinate);
                let dt = sig.timestamp.saturating_duration_since(prev.timestamp).as_secs_f64();

                if let Some(prev_rssi) = prev.transmission.signal_strength {
                    if (actual_rssi - prev_rssi).abs() < STATIC_RSSI_DB && moved > STATIC_MOVE_M {
                        confidence += STATIC_RSSI_WEIGHT;
                        reasons.push(format!("RSSI static while position moved {:.0} m", moved));
                    }
                }
                if moved > JUMP_DISTANCE_M && dt < JUMP_WINDOW_S {
                    confidence += JUMP_WEIGHT;
                    reasons.push(format!("position jumped {:.0} m in {:.1} s", moved, dt));
                }
            }
        }

        let confidence: f64 = confidence.min(1.0);
        Some(SpoofResult {
            is_spoofed: confidence >= SPOOF_THRESHOLD,
            confidence,
            reasons,
            expected_rssi,
            actual_rssi,
            distance,
        })
    }
}
