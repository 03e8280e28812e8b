//! Radio and geodesy helpers
//!
//!  Two RSSI models live here and they are deliberately not unified:
//!  `distance_from_rssi` feeds ranging and alert rings, `expected_rssi`
//!  feeds the spoof comparison. Their constants differ and the spoof
//!  thresholds were tuned against the second one.

use serde::Serialize;

/// Mean earth radius in meters
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Reference RSSI at 1 m for the ranging model (dBm)
pub const RANGING_REF_RSSI: f64 = -40.0;
/// Path loss exponent for the ranging model
pub const RANGING_PATH_LOSS: f64 = 2.2;
/// Carrier frequency assumed by the ranging model (GHz)
pub const RANGING_FREQ_GHZ: f64 = 2.4;

/// Transmit power at 1 m for the anomaly model (dBm)
pub const ANOMALY_TX_POWER: f64 = -59.0;
/// Path loss exponent for the anomaly model
pub const ANOMALY_PATH_LOSS: f64 = 2.0;

/// WGS84 position in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// (0,0) is how transmitters without a GPS fix report themselves.
    pub fn is_zero(&self) -> bool {
        self.lat == 0.0 && self.lon == 0.0
    }

    pub fn is_valid(&self) -> bool {
        !self.is_zero()
            && self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    /// Great-circle distance in meters
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        distance_bearing(self.lat, self.lon, other.lat, other.lon).0
    }

    /// Point `north` meters north and `east` meters east of this one.
    /// Flat-earth approximation, fine for the short offsets used in tests.
    #[cfg(test)]
    pub fn offset_m(&self, north: f64, east: f64) -> Coordinate {
        let dlat = (north / EARTH_RADIUS_M).to_degrees();
        let dlon = (east / (EARTH_RADIUS_M * self.lat.to_radians().cos())).to_degrees();
        Coordinate::new(self.lat + dlat, self.lon + dlon)
    }
}

/// Distance (m) and initial bearing (degrees) between two lat/lon points.
/// Uses the Haversine formula
pub fn distance_bearing(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> (f64, f64) {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().min(1.0).asin();
    let distance = EARTH_RADIUS_M * c;

    let y = delta_lon.sin() * lat2_rad.cos();
    let x = lat1_rad.cos() * lat2_rad.sin() - lat1_rad.sin() * lat2_rad.cos() * delta_lon.cos();
    let bearing = (y.atan2(x).to_degrees() + 360.0) % 360.0;

    (distance, bearing)
}

/// Estimated distance in meters for a received signal strength.
/// Stronger signal never yields a longer distance.
pub fn distance_from_rssi(rssi: f64) -> f64 {
    let exponent = (RANGING_REF_RSSI - rssi - 20.0 * RANGING_FREQ_GHZ.log10())
        / (10.0 * RANGING_PATH_LOSS);
    let distance = 10f64.powf(exponent);
    if distance.is_finite() { distance.max(0.0) } else { 0.0 }
}

/// Log-distance path loss: RSSI a transmitter should produce at `distance` meters.
pub fn expected_rssi(distance: f64) -> f64 {
    ANOMALY_TX_POWER - 10.0 * ANOMALY_PATH_LOSS * distance.max(1.0).log10()
}

/// Absolute difference between two headings, wrapped to [0, 180].
pub fn heading_delta(a: f64, b: f64) -> f64 {
    let d = (a - b).abs() % 360.0;
    if d > 180.0 { 360.0 - d } else { d }
}
