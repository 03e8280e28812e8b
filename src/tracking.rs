//! Tracking records
//!
//!  One record per logical drone, keyed by primary id. MACs seen on a record
//!  are indexed so the same airframe heard over another radio folds into the
//!  record it already has.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::correlation::MatchRecord;
use crate::physics::Coordinate;
use crate::signature::{DroneSignature, normalize_mac};

/// Per-record history bound (signatures, flight path, heights, matches)
pub const HISTORY_LIMIT: usize = 100;
/// Records idle longer than this are pruned
pub const RECORD_TTL: Duration = Duration::from_secs(300);
/// Minimum gap between prune sweeps
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(300);

/// Physical layer a source was heard on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Wifi,
    Bluetooth,
    Sdr,
    Fpv,
    Unknown,
}

impl SignalKind {
    /// Lower ranks sort first
    fn precedence(&self) -> u8 {
        match self {
            SignalKind::Wifi => 0,
            SignalKind::Bluetooth => 1,
            SignalKind::Sdr => 2,
            SignalKind::Fpv => 3,
            SignalKind::Unknown => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Wifi => "wifi",
            SignalKind::Bluetooth => "bluetooth",
            SignalKind::Sdr => "sdr",
            SignalKind::Fpv => "fpv",
            SignalKind::Unknown => "unknown",
        }
    }
}

/// One radio path a drone was heard on
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSource {
    pub mac: Option<String>,
    pub rssi: f64,
    pub kind: SignalKind,
    pub timestamp: Instant,
}

impl SignalSource {
    /// A zero RSSI means "not measured"; no source is built for it
    pub fn new(mac: Option<String>, rssi: f64, kind: SignalKind, timestamp: Instant) -> Option<Self> {
        (rssi != 0.0 && rssi.is_finite()).then_some(Self {
            mac,
            rssi,
            kind,
            timestamp,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PathPoint {
    pub coordinate: Coordinate,
    pub altitude: f64,
    pub timestamp: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct HeightSample {
    pub height: f64,
    pub timestamp: Instant,
}

#[derive(Debug, Clone)]
pub struct TrackingRecord {
    pub key: String,
    /// Oldest first
    pub signatures: Vec<DroneSignature>,
    /// Positioned fixes only
    pub flight_path: Vec<PathPoint>,
    pub height_profile: Vec<HeightSample>,
    pub match_history: Vec<MatchRecord>,
    /// At most one per kind, in precedence order
    pub sources: Vec<SignalSource>,
    pub registration: Option<String>,
    pub operator_location: Option<Coordinate>,
    pub home_location: Option<Coordinate>,
    pub macs: Vec<String>,
    pub first_seen: Instant,
    pub last_update: Instant,
}

impl TrackingRecord {
    pub fn new(key: &str, now: Instant) -> Self {
        Self {
            key: key.to_string(),
            signatures: Vec::new(),
            flight_path: Vec::new(),
            height_profile: Vec::new(),
            match_history: Vec::new(),
            sources: Vec::new(),
            registration: None,
            operator_location: None,
            home_location: None,
            macs: Vec::new(),
            first_seen: now,
            last_update: now,
        }
    }

    pub fn latest(&self) -> Option<&DroneSignature> {
        self.signatures.last()
    }

    /// Signatures before the latest one
    pub fn previous(&self) -> &[DroneSignature] {
        match self.signatures.split_last() {
            Some((_, rest)) => rest,
            None => &[],
        }
    }

    pub fn height_values(&self) -> Vec<f64> {
        self.height_profile.iter().map(|h| h.height).collect()
    }

    fn push(&mut self, sig: DroneSignature) {
        let now = sig.timestamp;
        if sig.position.has_fix() {
            push_bounded(
                &mut self.flight_path,
                PathPoint {
                    coordinate: sig.position.coordinate,
                    altitude: sig.position.altitude,
                    timestamp: now,
                },
            );
        }
        push_bounded(
            &mut self.height_profile,
            HeightSample {
                height: sig.height.height_above_ground,
                timestamp: now,
            },
        );
        if let Some(mac) = &sig.transmission.mac {
            if !self.macs.contains(mac) {
                self.macs.push(mac.clone());
            }
        }
        if sig.secondary_id.is_some() {
            self.registration = sig.secondary_id.clone();
        }
        if let Some(op) = sig.position.operator_location {
            self.operator_location = Some(op);
        }
        if let Some(home) = sig.position.home_location {
            self.home_location = Some(home);
        }
        self.last_update = self.last_update.max(now);
        push_bounded(&mut self.signatures, sig);
    }

    pub fn push_match(&mut self, record: MatchRecord) {
        push_bounded(&mut self.match_history, record);
    }

    /// Replace the source of the same kind and keep precedence order
    pub fn update_source(&mut self, source: SignalSource) {
        self.sources.retain(|s| s.kind != source.kind);
        self.sources.push(source);
        self.sources.sort_by_key(|s| s.kind.precedence());
    }

    /// Most recent RSSI across all sources
    pub fn best_rssi(&self) -> Option<f64> {
        self.sources
            .iter()
            .max_by_key(|s| s.timestamp)
            .map(|s| s.rssi)
    }
}

fn push_bounded<T>(v: &mut Vec<T>, item: T) {
    v.push(item);
    if v.len() > HISTORY_LIMIT {
        v.drain(..v.len() - HISTORY_LIMIT);
    }
}

/// Registry of tracked drones, owned by the correlation engine
#[derive(Debug)]
pub struct TrackingRegistry {
    records: HashMap<String, TrackingRecord>,
    /// Uppercase MAC to record key
    mac_index: HashMap<String, String>,
    ttl: Duration,
    prune_interval: Duration,
    last_prune: Option<Instant>,
}

impl Default for TrackingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackingRegistry {
    pub fn new() -> Self {
        Self::with_ttl(RECORD_TTL, PRUNE_INTERVAL)
    }

    pub fn with_ttl(ttl: Duration, prune_interval: Duration) -> Self {
        Self {
            records: HashMap::new(),
            mac_index: HashMap::new(),
            ttl,
            prune_interval,
            last_prune: None,
        }
    }

    /// Key of the record this observation belongs to.
    ///
    /// A MAC already seen on another record wins over the id.
    pub fn resolve_key(&self, id: &str, mac: Option<&str>) -> String {
        mac.map(normalize_mac)
            .and_then(|m| self.mac_index.get(&m))
            .filter(|key| self.records.contains_key(*key))
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }

    pub fn get(&self, key: &str) -> Option<&TrackingRecord> {
        self.records.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut TrackingRecord> {
        self.records.get_mut(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    /// Find a record by key or by one of its MACs
    pub fn lookup_mut(&mut self, key_or_mac: &str) -> Option<&mut TrackingRecord> {
        let key = if self.records.contains_key(key_or_mac) {
            key_or_mac.to_string()
        } else {
            self.mac_index.get(&normalize_mac(key_or_mac))?.clone()
        };
        self.records.get_mut(&key)
    }

    /// Append a signature, creating the record on first sight
    pub fn append(&mut self, key: &str, sig: DroneSignature) -> &mut TrackingRecord {
        if let Some(mac) = &sig.transmission.mac {
            self.mac_index.insert(mac.clone(), key.to_string());
        }
        let record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| TrackingRecord::new(key, sig.timestamp));
        record.push(sig);
        record
    }

    /// Attach a CAA registration to an existing record. Never creates one.
    pub fn attach_registration(&mut self, mac: Option<&str>, id: Option<&str>, registration: &str) -> bool {
        let record = match (mac, id) {
            (Some(mac), _) if self.mac_index.contains_key(&normalize_mac(mac)) => self.lookup_mut(mac),
            (_, Some(id)) => self.lookup_mut(id),
            _ => None,
        };
        match record {
            Some(r) => {
                r.registration = Some(registration.to_string());
                true
            }
            None => false,
        }
    }

    /// Drop records idle for longer than the TTL
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.records.len();
        let ttl = self.ttl;
        self.records
            .retain(|_, r| now.saturating_duration_since(r.last_update) <= ttl);
        let records = &self.records;
        self.mac_index.retain(|_, key| records.contains_key(key));
        self.last_prune = Some(now);
        before - self.records.len()
    }

    /// Prune when the last sweep is older than the prune interval
    pub fn prune_if_due(&mut self, now: Instant) -> usize {
        match self.last_prune {
            Some(last) if now.saturating_duration_since(last) > self.prune_interval => self.prune(now),
            Some(_) => 0,
            None => {
                self.last_prune = Some(now);
                0
            }
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &TrackingRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{BasicIdBlock, DroneReport, LocationBlock, PayloadShape};
    use crate::signature::SignatureGenerator;

    fn report(id: &str, mac: &str, lat: f64) -> DroneReport {
        DroneReport {
            shape: PayloadShape::Wifi,
            basic_ids: vec![BasicIdBlock {
                id: Some(id.to_string()),
                mac: Some(mac.to_string()),
                rssi: Some(-60.0),
                ..Default::default()
            }],
            location: Some(LocationBlock {
                latitude: Some(lat),
                longitude: Some(-105.0),
                height_agl: Some(30.0),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_bounded_history() {
        let mut registry = TrackingRegistry::new();
        let generator = SignatureGenerator::new();
        let t0 = Instant::now();
        for i in 0..101u64 {
            generator.create_signature(
                &report("SN1", "aa", 39.0 + i as f64 * 1e-4),
                &mut registry,
                None,
                t0 + Duration::from_millis(i * 100),
            );
        }
        let record = registry.get("SN1").unwrap();
        assert_eq!(record.signatures.len(), HISTORY_LIMIT);
        assert_eq!(record.flight_path.len(), HISTORY_LIMIT);
        assert_eq!(record.height_profile.len(), HISTORY_LIMIT);
        // The first fix (lat 39.0) is gone
        assert!((record.flight_path[0].coordinate.lat - 39.0001).abs() < 1e-9);
        assert_eq!(record.signatures[0].timestamp, t0 + Duration::from_millis(100));
    }

    #[test]
    fn test_prune() {
        let mut registry = TrackingRegistry::new();
        let generator = SignatureGenerator::new();
        let t0 = Instant::now();
        generator.create_signature(&report("OLD", "aa", 39.0), &mut registry, None, t0);
        generator.create_signature(
            &report("NEW", "bb", 39.0),
            &mut registry,
            None,
            t0 + Duration::from_secs(200),
        );

        assert_eq!(registry.prune(t0 + Duration::from_secs(301)), 1);
        assert!(registry.get("OLD").is_none());
        assert!(registry.get("NEW").is_some());
        assert_eq!(registry.resolve_key("X", Some("aa")), "X");
    }

    #[test]
    fn test_prune_if_due() {
        let mut registry = TrackingRegistry::new();
        let t0 = Instant::now();
        SignatureGenerator::new().create_signature(&report("A", "aa", 39.0), &mut registry, None, t0);
        assert_eq!(registry.prune_if_due(t0 + Duration::from_secs(299)), 0);
        assert_eq!(registry.prune_if_due(t0 + Duration::from_secs(400)), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_mac_alias() {
        let mut registry = TrackingRegistry::new();
        let generator = SignatureGenerator::new();
        let t0 = Instant::now();
        generator.create_signature(&report("SN1", "aa:bb", 39.0), &mut registry, None, t0);
        assert_eq!(registry.resolve_key("OTHER", Some("AA:BB")), "SN1");
        generator.create_signature(&report("OTHER", "aa:bb", 39.0), &mut registry, None, t0);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("SN1").unwrap().signatures.len(), 2);
    }

    #[test]
    fn test_sources_one_per_kind() {
        let now = Instant::now();
        let mut record = TrackingRecord::new("SN1", now);
        assert!(SignalSource::new(None, 0.0, SignalKind::Wifi, now).is_none());

        for (kind, rssi) in [
            (SignalKind::Fpv, -80.0),
            (SignalKind::Bluetooth, -70.0),
            (SignalKind::Wifi, -60.0),
            (SignalKind::Bluetooth, -65.0),
        ] {
            record.update_source(SignalSource::new(None, rssi, kind, now).unwrap());
        }
        let kinds: Vec<_> = record.sources.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![SignalKind::Wifi, SignalKind::Bluetooth, SignalKind::Fpv]);
        assert_eq!(record.sources[1].rssi, -65.0);
    }
}
