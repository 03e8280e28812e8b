//! Drone signatures
//!
//!  A signature is one normalized observation of a drone. The generator
//!  resolves identity, MAC and RSSI through fixed precedence chains because
//!  the vendors disagree on where each field lives.

use std::time::Instant;

use crate::event::{DroneReport, Metadata, PayloadShape, UaTypeField};
use crate::physics::{self, Coordinate};
use crate::tracking::TrackingRegistry;

/// Height deltas considered for the consistency score
const HEIGHT_DELTA_WINDOW: usize = 5;
/// Height delta variance at which consistency reaches zero (m^2)
const HEIGHT_VARIANCE_THRESHOLD: f64 = 2.0;
/// Coefficient of variation at which broadcast consistency reaches zero
const INTERVAL_CV_THRESHOLD: f64 = 0.5;

/// ASTM F3411 UA type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UaType {
    None,
    Aeroplane,
    Helicopter,
    Gyroplane,
    HybridLift,
    Ornithopter,
    Glider,
    Kite,
    FreeBalloon,
    CaptiveBalloon,
    Airship,
    FreeFallParachute,
    Rocket,
    TetheredPowered,
    GroundObstacle,
    Other,
}

impl UaType {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => UaType::None,
            1 => UaType::Aeroplane,
            2 => UaType::Helicopter,
            3 => UaType::Gyroplane,
            4 => UaType::HybridLift,
            5 => UaType::Ornithopter,
            6 => UaType::Glider,
            7 => UaType::Kite,
            8 => UaType::FreeBalloon,
            9 => UaType::CaptiveBalloon,
            10 => UaType::Airship,
            11 => UaType::FreeFallParachute,
            12 => UaType::Rocket,
            13 => UaType::TetheredPowered,
            14 => UaType::GroundObstacle,
            _ => UaType::Other,
        }
    }

    /// Decoders print the enumeration name ("Helicopter (or Multirotor)")
    pub fn from_name(name: &str) -> Self {
        let n = name.to_ascii_lowercase();
        let table: &[(&str, UaType)] = &[
            ("not declared", UaType::None),
            ("none", UaType::None),
            ("aeroplane", UaType::Aeroplane),
            ("airplane", UaType::Aeroplane),
            ("fixed wing", UaType::Aeroplane),
            ("helicopter", UaType::Helicopter),
            ("multirotor", UaType::Helicopter),
            ("gyroplane", UaType::Gyroplane),
            ("hybrid", UaType::HybridLift),
            ("vtol", UaType::HybridLift),
            ("ornithopter", UaType::Ornithopter),
            ("glider", UaType::Glider),
            ("kite", UaType::Kite),
            ("free balloon", UaType::FreeBalloon),
            ("captive balloon", UaType::CaptiveBalloon),
            ("airship", UaType::Airship),
            ("blimp", UaType::Airship),
            ("parachute", UaType::FreeFallParachute),
            ("rocket", UaType::Rocket),
            ("tethered", UaType::TetheredPowered),
            ("ground obstacle", UaType::GroundObstacle),
            ("other", UaType::Other),
        ];
        table
            .iter()
            .find(|(needle, _)| n.contains(needle))
            .map(|(_, ty)| *ty)
            .unwrap_or(UaType::Helicopter)
    }

    /// Absent or unreadable types default to the multirotor most kits see
    pub fn from_field(field: Option<&UaTypeField>) -> Self {
        match field {
            Some(UaTypeField::Code(code)) => Self::from_code(*code),
            Some(UaTypeField::Name(name)) => Self::from_name(name),
            None => UaType::Helicopter,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UaType::None => "None",
            UaType::Aeroplane => "Aeroplane",
            UaType::Helicopter => "Helicopter (or Multirotor)",
            UaType::Gyroplane => "Gyroplane",
            UaType::HybridLift => "Hybrid Lift",
            UaType::Ornithopter => "Ornithopter",
            UaType::Glider => "Glider",
            UaType::Kite => "Kite",
            UaType::FreeBalloon => "Free Balloon",
            UaType::CaptiveBalloon => "Captive Balloon",
            UaType::Airship => "Airship",
            UaType::FreeFallParachute => "Free Fall/Parachute",
            UaType::Rocket => "Rocket",
            UaType::TetheredPowered => "Tethered Powered Aircraft",
            UaType::GroundObstacle => "Ground Obstacle",
            UaType::Other => "Other",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryId {
    pub id: String,
    pub id_type: String,
    pub protocol_version: Option<String>,
    pub aircraft_type: UaType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AltitudeReference {
    Wgs84,
    Pressure,
    AboveTakeoff,
    AboveGround,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct PositionInfo {
    /// (0, 0) when the drone has no GPS fix
    pub coordinate: Coordinate,
    pub altitude: f64,
    pub altitude_reference: AltitudeReference,
    pub operator_location: Option<Coordinate>,
    pub home_location: Option<Coordinate>,
    pub timestamp: Instant,
}

impl PositionInfo {
    pub fn has_fix(&self) -> bool {
        !self.coordinate.is_zero() && self.coordinate.is_valid()
    }
}

#[derive(Debug, Clone)]
pub struct MovementVector {
    /// m/s
    pub ground_speed: f64,
    /// m/s, positive up
    pub vertical_speed: f64,
    /// Degrees from north
    pub heading: f64,
    /// m/s from successive altitudes, else the reported vertical speed
    pub climb_rate: f64,
    pub timestamp: Instant,
}

#[derive(Debug, Clone)]
pub struct HeightInfo {
    pub height_above_ground: f64,
    /// 1.0 for a steady height trend, 0.0 for an erratic one
    pub consistency: f64,
    pub timestamp: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionType {
    Bluetooth,
    Wifi,
    Fpv,
    Unknown,
}

impl TransmissionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransmissionType::Bluetooth => "bluetooth",
            TransmissionType::Wifi => "wifi",
            TransmissionType::Fpv => "fpv",
            TransmissionType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransmissionInfo {
    pub kind: TransmissionType,
    /// dBm; never 0
    pub signal_strength: Option<f64>,
    /// Log-distance prediction at the reported position
    pub expected_signal_strength: Option<f64>,
    /// Uppercase
    pub mac: Option<String>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastPattern {
    /// Most recent protocol block kinds, oldest first
    pub message_sequence: Vec<String>,
    /// Most recent inter-message intervals in seconds, oldest first
    pub interval_pattern: Vec<f64>,
    pub consistency: f64,
}

#[derive(Debug, Clone)]
pub struct DroneSignature {
    pub primary_id: PrimaryId,
    /// CAA registration
    pub secondary_id: Option<String>,
    pub operator_id: Option<String>,
    pub session_id: Option<String>,
    pub description: Option<String>,
    pub position: PositionInfo,
    pub movement: MovementVector,
    pub height: HeightInfo,
    pub transmission: TransmissionInfo,
    pub broadcast: BroadcastPattern,
    pub timestamp: Instant,
    pub first_seen: Instant,
    /// Seconds since the previous signature of the same drone
    pub message_interval: Option<f64>,
}

/// Builds signatures from drone reports and appends them to the registry
#[derive(Debug, Clone)]
pub struct SignatureGenerator {
    sequence_window: usize,
    interval_window: usize,
}

impl Default for SignatureGenerator {
    fn default() -> Self {
        Self {
            sequence_window: 10,
            interval_window: 10,
        }
    }
}

impl SignatureGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a signature for `report` and append it to its tracking record.
    ///
    /// Returns `None` when the report carries no identity, or when it only
    /// carries a CAA registration (which is attached to an existing record).
    pub fn create_signature(
        &self,
        report: &DroneReport,
        registry: &mut TrackingRegistry,
        station: Option<Coordinate>,
        now: Instant,
    ) -> Option<DroneSignature> {
        registry.prune_if_due(now);

        let mac = resolve_mac(report);
        let registration = report
            .caa_block()
            .and_then(|b| b.id.clone())
            .or_else(|| report.caa_registration.clone());

        if report.identity_block().is_none() {
            if let Some(registration) = registration.as_deref() {
                let lookup = report.uid.as_deref();
                registry.attach_registration(mac.as_deref(), lookup, registration);
                return None;
            }
        }

        let primary_id = resolve_primary_id(report)?;
        let key = registry.resolve_key(&primary_id.id, mac.as_deref());
        let record = registry.get(&key);
        let previous = record.and_then(|r| r.latest());

        let position = self.position(report, now);
        let movement = movement(report, &position, previous, now);
        let height = height(report, record.map(|r| r.height_values()).unwrap_or_default(), now);
        let transmission = transmission(report, mac, registration.as_deref(), &position, station);

        let message_interval = previous.map(|p| now.saturating_duration_since(p.timestamp).as_secs_f64());
        let broadcast = self.broadcast(report, previous, message_interval);

        let first_seen = record.map(|r| r.first_seen).unwrap_or(now);
        let session_id = report
            .identity_block()
            .filter(|b| b.id_type.as_deref().is_some_and(|t| t.contains("Session")))
            .and_then(|b| b.id.clone());

        let signature = DroneSignature {
            primary_id,
            secondary_id: registration,
            operator_id: report.operator_id.clone(),
            session_id,
            description: report.self_id.clone(),
            position,
            movement,
            height,
            transmission,
            broadcast,
            timestamp: now,
            first_seen,
            message_interval,
        };

        registry.append(&key, signature.clone());
        Some(signature)
    }

    fn position(&self, report: &DroneReport, now: Instant) -> PositionInfo {
        let loc = report.location.as_ref();
        let lat = loc.and_then(|l| l.latitude).unwrap_or(0.0);
        let lon = loc.and_then(|l| l.longitude).unwrap_or(0.0);

        let (altitude, altitude_reference) = match loc {
            Some(l) if l.geodetic_altitude.is_some() => {
                (l.geodetic_altitude.unwrap_or(0.0), AltitudeReference::Wgs84)
            }
            Some(l) if l.pressure_altitude.is_some() => {
                (l.pressure_altitude.unwrap_or(0.0), AltitudeReference::Pressure)
            }
            Some(l) if l.height_agl.is_some() => {
                let reference = match l.height_type.as_deref() {
                    Some(t) if t.to_ascii_lowercase().contains("ground") => AltitudeReference::AboveGround,
                    _ => AltitudeReference::AboveTakeoff,
                };
                (l.height_agl.unwrap_or(0.0), reference)
            }
            _ => (0.0, AltitudeReference::Unknown),
        };

        let system = report.system.as_ref();
        PositionInfo {
            coordinate: Coordinate::new(lat, lon),
            altitude,
            altitude_reference,
            operator_location: system.and_then(|s| s.operator_location()),
            home_location: system.and_then(|s| s.home_location()),
            timestamp: now,
        }
    }

    fn broadcast(
        &self,
        report: &DroneReport,
        previous: Option<&DroneSignature>,
        message_interval: Option<f64>,
    ) -> BroadcastPattern {
        let mut message_sequence = previous
            .map(|p| p.broadcast.message_sequence.clone())
            .unwrap_or_default();
        message_sequence.extend(report.block_kinds.iter().cloned());
        keep_last(&mut message_sequence, self.sequence_window);

        let mut interval_pattern = previous
            .map(|p| p.broadcast.interval_pattern.clone())
            .unwrap_or_default();
        if let Some(interval) = message_interval {
            interval_pattern.push(interval);
        }
        keep_last(&mut interval_pattern, self.interval_window);

        let consistency = interval_consistency(&interval_pattern);
        BroadcastPattern {
            message_sequence,
            interval_pattern,
            consistency,
        }
    }
}

/// Identity block, else advertisement address, else generic id
fn resolve_primary_id(report: &DroneReport) -> Option<PrimaryId> {
    if let Some(block) = report.identity_block() {
        return Some(PrimaryId {
            id: block.id.clone().unwrap_or_default(),
            id_type: block.id_type.clone().unwrap_or_else(|| "Unknown".to_string()),
            protocol_version: block.protocol_version.clone(),
            aircraft_type: UaType::from_field(block.ua_type.as_ref()),
        });
    }

    let (id, id_type) = match report.aux_adv.as_ref().and_then(|a| a.addr.clone()) {
        Some(addr) => (addr, "Advertisement Address"),
        None => (report.uid.clone()?, "Unknown"),
    };
    let id = id.trim().to_string();
    if id.is_empty() {
        return None;
    }
    Some(PrimaryId {
        id,
        id_type: id_type.to_string(),
        protocol_version: None,
        aircraft_type: UaType::Helicopter,
    })
}

/// Explicit field, identity block, advertisement, extended advertisement
fn resolve_mac(report: &DroneReport) -> Option<String> {
    report
        .mac
        .clone()
        .or_else(|| report.basic_ids.iter().find_map(|b| b.mac.clone()))
        .or_else(|| report.aux_adv.as_ref().and_then(|a| a.addr.clone()))
        .or_else(|| report.aux_ext.as_ref().and_then(|a| a.adv_address.clone()))
        .map(|m| normalize_mac(&m))
        .filter(|m| !m.is_empty())
}

pub fn normalize_mac(mac: &str) -> String {
    mac.trim().to_ascii_uppercase()
}

/// Top-level, advertisement, then Basic ID
fn resolve_rssi(report: &DroneReport) -> Option<f64> {
    report
        .rssi
        .or_else(|| report.aux_adv.as_ref().and_then(|a| a.rssi))
        .or_else(|| report.basic_ids.iter().find_map(|b| b.rssi))
        .filter(|r| *r != 0.0 && r.is_finite())
}

fn movement(
    report: &DroneReport,
    position: &PositionInfo,
    previous: Option<&DroneSignature>,
    now: Instant,
) -> MovementVector {
    let loc = report.location.as_ref();
    let vertical_speed = loc.and_then(|l| l.vert_speed).unwrap_or(0.0);

    let climb_rate = previous
        .filter(|p| p.position.altitude_reference == position.altitude_reference)
        .and_then(|p| {
            let dt = now.saturating_duration_since(p.timestamp).as_secs_f64();
            (dt > 0.0).then(|| (position.altitude - p.position.altitude) / dt)
        })
        .unwrap_or(vertical_speed);

    MovementVector {
        ground_speed: loc.and_then(|l| l.speed).unwrap_or(0.0),
        vertical_speed,
        heading: loc.and_then(|l| l.direction).unwrap_or(0.0),
        climb_rate,
        timestamp: now,
    }
}

fn height(report: &DroneReport, mut history: Vec<f64>, now: Instant) -> HeightInfo {
    let h = report
        .location
        .as_ref()
        .and_then(|l| l.height_agl)
        .unwrap_or(0.0);
    history.push(h);
    HeightInfo {
        height_above_ground: h,
        consistency: height_consistency(&history),
        timestamp: now,
    }
}

/// `max(0, 1 - variance / 2.0)` over the last five height deltas
pub fn height_consistency(heights: &[f64]) -> f64 {
    let start = heights.len().saturating_sub(HEIGHT_DELTA_WINDOW + 1);
    let deltas: Vec<f64> = heights[start..].windows(2).map(|w| w[1] - w[0]).collect();
    if deltas.len() < 2 {
        return 1.0;
    }
    (1.0 - variance(&deltas) / HEIGHT_VARIANCE_THRESHOLD).clamp(0.0, 1.0)
}

/// `1 - min(1, cv / 0.5)`; 1.0 with fewer than two intervals
pub fn interval_consistency(intervals: &[f64]) -> f64 {
    if intervals.len() < 2 {
        return 1.0;
    }
    let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
    if mean <= 0.0 {
        return 0.0;
    }
    let cv = variance(intervals).sqrt() / mean;
    1.0 - (cv / INTERVAL_CV_THRESHOLD).min(1.0)
}

fn variance(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
}

fn transmission(
    report: &DroneReport,
    mac: Option<String>,
    registration: Option<&str>,
    position: &PositionInfo,
    station: Option<Coordinate>,
) -> TransmissionInfo {
    let kind = match report.shape {
        PayloadShape::Bluetooth => TransmissionType::Bluetooth,
        PayloadShape::Wifi => TransmissionType::Wifi,
        PayloadShape::Sdr | PayloadShape::Unknown if report.aux_adv.is_some() => TransmissionType::Bluetooth,
        PayloadShape::Sdr | PayloadShape::Unknown => TransmissionType::Unknown,
    };

    let signal_strength = resolve_rssi(report);
    let expected_signal_strength = match station {
        Some(station) if position.has_fix() => {
            Some(physics::expected_rssi(station.distance_to(&position.coordinate)))
        }
        _ => None,
    };

    TransmissionInfo {
        kind,
        signal_strength,
        expected_signal_strength,
        mac,
        metadata: metadata(report, registration),
    }
}

fn metadata(report: &DroneReport, registration: Option<&str>) -> Metadata {
    let mut m = Metadata::new();
    let mut put = |key: &str, value: Option<String>| {
        if let Some(v) = value {
            m.insert(key.to_string(), v);
        }
    };

    put("caa_registration", registration.map(str::to_string));
    put("operator_id", report.operator_id.clone());

    if let Some(aux) = &report.aux_adv {
        put("aux_rssi", aux.rssi.map(|r| r.to_string()));
        put("channel", aux.channel.map(|c| c.to_string()));
        put("phy", aux.phy.map(|p| p.to_string()));
        put("access_address", aux.access_address.map(|a| a.to_string()));
    }
    if let Some(ext) = &report.aux_ext {
        put("adv_mode", ext.adv_mode.clone());
    }
    if let Some(sys) = &report.system {
        put("area_count", sys.area_count.map(|v| v.to_string()));
        put("area_radius", sys.area_radius.map(|v| v.to_string()));
        put("area_ceiling", sys.area_ceiling.map(|v| v.to_string()));
        put("area_floor", sys.area_floor.map(|v| v.to_string()));
        put("classification", sys.classification.clone());
        put("operator_alt_geo", sys.operator_alt_geo.map(|v| v.to_string()));
    }
    if let Some(loc) = &report.location {
        put("op_status", loc.op_status.clone());
        put("height_type", loc.height_type.clone());
    }

    let e = &report.enrichment;
    put("freq", e.freq.map(|v| v.to_string()));
    put("seen_by", e.seen_by.clone());
    put("observed_at", e.observed_at.map(|v| v.to_string()));
    put("manufacturer", e.rid_make.clone());
    put("model", e.rid_model.clone());
    put("rid_source", e.rid_source.clone());
    put("index", e.index.map(|v| v.to_string()));
    put("runtime", e.runtime.map(|v| v.to_string()));
    m
}

fn keep_last<T>(v: &mut Vec<T>, n: usize) {
    if v.len() > n {
        v.drain(..v.len() - n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AuxAdvertisement, BasicIdBlock, LocationBlock};
    use std::time::Duration;

    fn report(id: &str, mac: &str, rssi: f64) -> DroneReport {
        DroneReport {
            shape: PayloadShape::Bluetooth,
            basic_ids: vec![BasicIdBlock {
                id: Some(id.to_string()),
                id_type: Some("Serial Number (ANSI/CTA-2063-A)".to_string()),
                ua_type: Some(UaTypeField::Code(2)),
                mac: Some(mac.to_string()),
                rssi: Some(rssi),
                ..Default::default()
            }],
            location: Some(LocationBlock {
                latitude: Some(39.73),
                longitude: Some(-105.07),
                geodetic_altitude: Some(100.0),
                height_agl: Some(50.0),
                speed: Some(5.0),
                vert_speed: Some(0.5),
                direction: Some(90.0),
                ..Default::default()
            }),
            block_kinds: vec!["Basic ID".to_string(), "Location/Vector Message".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_ua_type_mapping() {
        assert_eq!(UaType::from_code(0), UaType::None);
        assert_eq!(UaType::from_code(14), UaType::GroundObstacle);
        assert_eq!(UaType::from_code(42), UaType::Other);
        assert_eq!(UaType::from_name("Helicopter (or Multirotor)"), UaType::Helicopter);
        assert_eq!(UaType::from_name("Free Balloon"), UaType::FreeBalloon);
        assert_eq!(UaType::from_name("???"), UaType::Helicopter);
        assert_eq!(UaType::from_field(None), UaType::Helicopter);
    }

    #[test]
    fn test_create_signature() {
        let mut registry = TrackingRegistry::new();
        let station = Coordinate::new(39.7301, -105.0701);
        let now = Instant::now();
        let sig = SignatureGenerator::new()
            .create_signature(&report("SN1", "aa:bb:cc:dd:ee:ff", -60.0), &mut registry, Some(station), now)
            .unwrap();

        assert_eq!(sig.primary_id.id, "SN1");
        assert_eq!(sig.primary_id.aircraft_type, UaType::Helicopter);
        assert_eq!(sig.transmission.mac.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(sig.transmission.signal_strength, Some(-60.0));
        assert!(sig.transmission.expected_signal_strength.is_some());
        assert_eq!(sig.position.altitude_reference, AltitudeReference::Wgs84);
        assert_eq!(sig.broadcast.consistency, 1.0);
        assert!(sig.first_seen <= sig.timestamp);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_no_identity_returns_none() {
        let mut registry = TrackingRegistry::new();
        let empty = DroneReport::default();
        assert!(
            SignatureGenerator::new()
                .create_signature(&empty, &mut registry, None, Instant::now())
                .is_none()
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_advertisement_address_fallback() {
        let mut registry = TrackingRegistry::new();
        let r = DroneReport {
            aux_adv: Some(AuxAdvertisement {
                addr: Some("DRONE101".to_string()),
                rssi: Some(-65.0),
                ..Default::default()
            }),
            ..Default::default()
        };
        let sig = SignatureGenerator::new()
            .create_signature(&r, &mut registry, None, Instant::now())
            .unwrap();
        assert_eq!(sig.primary_id.id, "DRONE101");
        assert_eq!(sig.transmission.kind, TransmissionType::Bluetooth);
        assert_eq!(sig.transmission.signal_strength, Some(-65.0));
        assert!(!sig.position.has_fix());
    }

    #[test]
    fn test_rssi_precedence_and_zero() {
        let mut r = report("SN1", "aa", -70.0);
        r.rssi = Some(-50.0);
        assert_eq!(resolve_rssi(&r), Some(-50.0));
        r.rssi = None;
        r.aux_adv = Some(AuxAdvertisement {
            rssi: Some(-55.0),
            ..Default::default()
        });
        assert_eq!(resolve_rssi(&r), Some(-55.0));
        r.aux_adv = None;
        r.basic_ids[0].rssi = Some(0.0);
        assert_eq!(resolve_rssi(&r), None);
    }

    #[test]
    fn test_caa_only_updates_existing() {
        let mut registry = TrackingRegistry::new();
        let now = Instant::now();
        let generator = SignatureGenerator::new();
        generator.create_signature(&report("SN1", "aa:bb", -60.0), &mut registry, None, now);

        let caa = DroneReport {
            basic_ids: vec![BasicIdBlock {
                id: Some("FA-123".to_string()),
                id_type: Some("CAA Assigned Registration ID".to_string()),
                mac: Some("AA:BB".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(generator.create_signature(&caa, &mut registry, None, now).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("SN1").unwrap().registration.as_deref(), Some("FA-123"));

        let stray = DroneReport {
            basic_ids: vec![BasicIdBlock {
                mac: Some("11:22".to_string()),
                ..caa.basic_ids[0].clone()
            }],
            ..Default::default()
        };
        assert!(generator.create_signature(&stray, &mut registry, None, now).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_broadcast_pattern_accumulates() {
        let mut registry = TrackingRegistry::new();
        let generator = SignatureGenerator::new();
        let t0 = Instant::now();
        let r = report("SN1", "aa", -60.0);
        let mut last = None;
        for i in 0..4 {
            last = generator.create_signature(&r, &mut registry, None, t0 + Duration::from_secs(i));
        }
        let sig = last.unwrap();
        assert_eq!(sig.broadcast.interval_pattern, vec![1.0, 1.0, 1.0]);
        assert!((sig.broadcast.consistency - 1.0).abs() < 1e-9);
        assert_eq!(sig.broadcast.message_sequence.len(), 8);
        assert_eq!(sig.message_interval, Some(1.0));
    }

    #[test]
    fn test_consistency_scores() {
        assert_eq!(height_consistency(&[10.0, 11.0]), 1.0);
        assert!((height_consistency(&[10.0, 11.0, 12.0, 13.0]) - 1.0).abs() < 1e-9);
        assert_eq!(height_consistency(&[0.0, 10.0, 0.0, 10.0, 0.0]), 0.0);

        assert_eq!(interval_consistency(&[1.0]), 1.0);
        assert!((interval_consistency(&[1.0, 1.0, 1.0]) - 1.0).abs() < 1e-9);
        assert_eq!(interval_consistency(&[0.1, 5.0, 0.1, 5.0]), 0.0);
    }

    #[test]
    fn test_climb_rate_from_altitude() {
        let mut registry = TrackingRegistry::new();
        let generator = SignatureGenerator::new();
        let t0 = Instant::now();
        let mut r = report("SN1", "aa", -60.0);
        generator.create_signature(&r, &mut registry, None, t0);
        if let Some(loc) = r.location.as_mut() {
            loc.geodetic_altitude = Some(110.0);
        }
        let sig = generator
            .create_signature(&r, &mut registry, None, t0 + Duration::from_secs(2))
            .unwrap();
        assert!((sig.movement.climb_rate - 5.0).abs() < 1e-9);
        assert_eq!(sig.movement.vertical_speed, 0.5);
    }
}
