//! Correlation engine
//!
//!  Owns the tracking registry. Every drone report goes through `ingest`,
//!  which builds a signature, folds it into its record and scores it against
//!  what the record already knew.
//!
//!  Scoring (all sub-scores floored at 0, averaged within a factor):
//!
//!    position/movement  0.4   distance/10m, dspeed/2, dvspeed/2, dheading/15deg
//!    height profile     0.3   dheight/5m, dconsistency, trend agreement
//!    broadcast          0.3   type, drssi/10dB, sequence overlap, dinterval/0.5s
//!
//!  Factors without data are left out and the weights renormalized. An
//!  operator location on both sides folds in as `base*0.8 + op*0.2`.

use std::collections::HashSet;
use std::time::Instant;

use tracing::debug;

use crate::event::{CompanionRole, CompanionUpdate, DroneReport, PayloadShape};
use crate::physics::{self, Coordinate};
use crate::signature::{DroneSignature, SignatureGenerator, TransmissionType};
use crate::tracking::{SignalKind, SignalSource, TrackingRecord, TrackingRegistry};

const POSITION_WEIGHT: f64 = 0.4;
const HEIGHT_WEIGHT: f64 = 0.3;
const BROADCAST_WEIGHT: f64 = 0.3;
const OPERATOR_BLEND: f64 = 0.2;

const DISTANCE_SCALE_M: f64 = 10.0;
const SPEED_SCALE: f64 = 2.0;
const HEADING_SCALE_DEG: f64 = 15.0;
const HEIGHT_SCALE_M: f64 = 5.0;
const RSSI_SCALE_DB: f64 = 10.0;
const INTERVAL_SCALE_S: f64 = 0.5;
const OPERATOR_SCALE_M: f64 = 50.0;
/// Height deltas below this count as flat
const FLAT_DELTA_M: f64 = 0.1;
/// Samples needed on both sides before trends are compared
const TREND_MIN_SAMPLES: usize = 3;
/// A sub-score above this counts as a matched factor
const FACTOR_MATCH: f64 = 0.5;
/// New records scoring this high against an existing one are flagged
const DUPLICATE_THRESHOLD: f64 = 0.8;

/// Factor categories recorded in match history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchFactor {
    PrimaryId,
    OperatorLocation,
    Position,
    Movement,
    HeightPattern,
    BroadcastPattern,
    SignalCharacteristics,
}

impl MatchFactor {
    pub fn weight(&self) -> f64 {
        match self {
            MatchFactor::PrimaryId => 0.3,
            MatchFactor::OperatorLocation => 0.15,
            MatchFactor::Position => 0.15,
            MatchFactor::Movement => 0.15,
            MatchFactor::HeightPattern => 0.10,
            MatchFactor::BroadcastPattern => 0.10,
            MatchFactor::SignalCharacteristics => 0.05,
        }
    }
}

/// One comparison recorded on the subject record
#[derive(Debug, Clone)]
pub struct MatchRecord {
    /// Key of the record compared against
    pub other: String,
    pub score: f64,
    pub confidence: f64,
    pub factors: Vec<MatchFactor>,
    pub timestamp: Instant,
}

/// Outcome of one `ingest`
#[derive(Debug, Clone)]
pub struct Ingested {
    pub key: String,
    pub signature: DroneSignature,
    pub is_new: bool,
    /// Existing record this new one looks like, with its score
    pub possible_duplicate: Option<(String, f64)>,
}

/// Sub-scores; `None` when the factor had no data
#[derive(Debug, Clone, Default)]
struct Breakdown {
    same_id: bool,
    distance: Option<f64>,
    movement: Option<f64>,
    height: Option<f64>,
    broadcast: Option<f64>,
    signal: Option<f64>,
    operator: Option<f64>,
}

impl Breakdown {
    fn position_movement(&self) -> Option<f64> {
        let mut terms = Vec::new();
        terms.extend(self.distance);
        terms.extend(self.movement.map(|m| m * 3.0));
        let n = self.distance.is_some() as usize + 3 * self.movement.is_some() as usize;
        (n > 0).then(|| terms.iter().sum::<f64>() / n as f64)
    }

    fn score(&self) -> f64 {
        let weighted = [
            (self.position_movement(), POSITION_WEIGHT),
            (self.height, HEIGHT_WEIGHT),
            (self.broadcast, BROADCAST_WEIGHT),
        ];
        let total: f64 = weighted.iter().filter(|(s, _)| s.is_some()).map(|(_, w)| w).sum();
        let base = if total > 0.0 {
            weighted
                .iter()
                .filter_map(|(s, w)| s.map(|s| s * w))
                .sum::<f64>()
                / total
        } else {
            0.0
        };
        let combined = match self.operator {
            Some(op) => base * (1.0 - OPERATOR_BLEND) + op * OPERATOR_BLEND,
            None => base,
        };
        combined.clamp(0.0, 1.0)
    }

    fn factors(&self) -> Vec<MatchFactor> {
        let hit = |s: Option<f64>| s.is_some_and(|s| s > FACTOR_MATCH);
        let mut out = Vec::new();
        if self.same_id {
            out.push(MatchFactor::PrimaryId);
        }
        for (score, factor) in [
            (self.operator, MatchFactor::OperatorLocation),
            (self.distance, MatchFactor::Position),
            (self.movement, MatchFactor::Movement),
            (self.height, MatchFactor::HeightPattern),
            (self.broadcast, MatchFactor::BroadcastPattern),
            (self.signal, MatchFactor::SignalCharacteristics),
        ] {
            if hit(score) {
                out.push(factor);
            }
        }
        out
    }
}

fn closeness(delta: f64, scale: f64) -> f64 {
    (1.0 - delta.abs() / scale).max(0.0)
}

fn mean(terms: &[f64]) -> Option<f64> {
    (!terms.is_empty()).then(|| terms.iter().sum::<f64>() / terms.len() as f64)
}

/// Fraction of paired height deltas moving the same way
fn trend_agreement(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() < TREND_MIN_SAMPLES || b.len() < TREND_MIN_SAMPLES {
        return None;
    }
    let direction = |d: f64| {
        if d.abs() < FLAT_DELTA_M { 0 } else { d.signum() as i8 }
    };
    let da: Vec<i8> = a.windows(2).map(|w| direction(w[1] - w[0])).collect();
    let db: Vec<i8> = b.windows(2).map(|w| direction(w[1] - w[0])).collect();
    let n = da.len().min(db.len());
    let (da, db) = (&da[da.len() - n..], &db[db.len() - n..]);
    let agree = da.iter().zip(db).filter(|(x, y)| x == y).count();
    Some(agree as f64 / n as f64)
}

fn breakdown(a: &DroneSignature, b: &DroneSignature, heights_a: &[f64], heights_b: &[f64]) -> Breakdown {
    let distance = (a.position.has_fix() && b.position.has_fix()).then(|| {
        closeness(
            a.position.coordinate.distance_to(&b.position.coordinate),
            DISTANCE_SCALE_M,
        )
    });

    let movement = mean(&[
        closeness(a.movement.ground_speed - b.movement.ground_speed, SPEED_SCALE),
        closeness(a.movement.vertical_speed - b.movement.vertical_speed, SPEED_SCALE),
        closeness(
            physics::heading_delta(a.movement.heading, b.movement.heading),
            HEADING_SCALE_DEG,
        ),
    ]);

    let mut height_terms = vec![
        closeness(
            a.height.height_above_ground - b.height.height_above_ground,
            HEIGHT_SCALE_M,
        ),
        closeness(a.height.consistency - b.height.consistency, 1.0),
    ];
    height_terms.extend(trend_agreement(heights_a, heights_b));

    let signal = match (a.transmission.signal_strength, b.transmission.signal_strength) {
        (Some(x), Some(y)) => Some(closeness(x - y, RSSI_SCALE_DB)),
        _ => None,
    };

    let mut broadcast_terms = vec![if a.transmission.kind == b.transmission.kind { 1.0 } else { 0.0 }];
    broadcast_terms.extend(signal);
    broadcast_terms.push(sequence_similarity(a, b));
    if let (Some(x), Some(y)) = (a.message_interval, b.message_interval) {
        broadcast_terms.push(closeness(x - y, INTERVAL_SCALE_S));
    }

    let operator = match (a.position.operator_location, b.position.operator_location) {
        (Some(x), Some(y)) => Some(closeness(x.distance_to(&y), OPERATOR_SCALE_M)),
        _ => None,
    };

    Breakdown {
        same_id: a.primary_id.id == b.primary_id.id,
        distance,
        movement,
        height: mean(&height_terms),
        broadcast: mean(&broadcast_terms),
        signal,
        operator,
    }
}

/// Set overlap of block kinds, averaged with pattern consistency closeness
fn sequence_similarity(a: &DroneSignature, b: &DroneSignature) -> f64 {
    let consistency = closeness(a.broadcast.consistency - b.broadcast.consistency, 1.0);
    let sa: HashSet<&str> = a.broadcast.message_sequence.iter().map(String::as_str).collect();
    let sb: HashSet<&str> = b.broadcast.message_sequence.iter().map(String::as_str).collect();
    let union = sa.union(&sb).count();
    if union == 0 {
        return consistency;
    }
    let overlap = sa.intersection(&sb).count() as f64 / union as f64;
    (overlap + consistency) / 2.0
}

fn shared_mac(a: &DroneSignature, b: &DroneSignature) -> bool {
    match (&a.transmission.mac, &b.transmission.mac) {
        (Some(x), Some(y)) => !x.is_empty() && x.eq_ignore_ascii_case(y),
        _ => false,
    }
}

/// Similarity of two signatures in [0, 1]. A shared MAC is certain identity.
/// Height histories, when given, add their trend agreement to the score.
pub fn match_signatures(a: &DroneSignature, b: &DroneSignature, heights_a: &[f64], heights_b: &[f64]) -> f64 {
    if shared_mac(a, b) {
        return 1.0;
    }
    breakdown(a, b, heights_a, heights_b).score()
}

fn match_record(
    subject: &DroneSignature,
    other_key: &str,
    other: &DroneSignature,
    heights_a: &[f64],
    heights_b: &[f64],
    now: Instant,
) -> MatchRecord {
    let score = match_signatures(subject, other, heights_a, heights_b);
    let mut factors = breakdown(subject, other, heights_a, heights_b).factors();
    if shared_mac(subject, other) && !factors.contains(&MatchFactor::PrimaryId) {
        factors.insert(0, MatchFactor::PrimaryId);
    }
    let confidence = factors.iter().map(MatchFactor::weight).sum::<f64>().min(1.0);
    MatchRecord {
        other: other_key.to_string(),
        score,
        confidence,
        factors,
        timestamp: now,
    }
}

fn signal_kind(shape: PayloadShape, kind: TransmissionType) -> SignalKind {
    match (shape, kind) {
        (PayloadShape::Sdr, _) => SignalKind::Sdr,
        (_, TransmissionType::Wifi) => SignalKind::Wifi,
        (_, TransmissionType::Bluetooth) => SignalKind::Bluetooth,
        (_, TransmissionType::Fpv) => SignalKind::Fpv,
        (_, TransmissionType::Unknown) => SignalKind::Unknown,
    }
}

/// Single owner of all tracking state
#[derive(Debug, Default)]
pub struct CorrelationEngine {
    registry: TrackingRegistry,
    generator: SignatureGenerator,
}

impl CorrelationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &TrackingRegistry {
        &self.registry
    }

    pub fn record(&self, key: &str) -> Option<&TrackingRecord> {
        self.registry.get(key)
    }

    /// Build a signature for `report` and fold it into its record
    pub fn ingest(&mut self, report: &DroneReport, station: Option<Coordinate>, now: Instant) -> Option<Ingested> {
        let signature = self
            .generator
            .create_signature(report, &mut self.registry, station, now)?;
        let key = self
            .registry
            .resolve_key(&signature.primary_id.id, signature.transmission.mac.as_deref());

        let record = self.registry.get(&key)?;
        let is_new = record.signatures.len() == 1;
        let heights = record.height_values();
        let previous_heights = &heights[..heights.len().saturating_sub(1)];

        let mut history = Vec::new();
        if let Some(prev) = record.previous().last() {
            history.push(match_record(&signature, &key, prev, &heights, previous_heights, now));
        }

        let mut possible_duplicate = None;
        if is_new {
            for other in self.registry.records().filter(|r| r.key != key) {
                let Some(other_sig) = other.latest() else { continue };
                let other_heights = other.height_values();
                let m = match_record(&signature, &other.key, other_sig, &heights, &other_heights, now);
                if m.score >= DUPLICATE_THRESHOLD
                    && possible_duplicate.as_ref().is_none_or(|(_, s)| m.score > *s)
                {
                    debug!(key = %key, other = %other.key, score = m.score, "possible duplicate track");
                    possible_duplicate = Some((other.key.clone(), m.score));
                    history.push(m);
                }
            }
        }

        let record = self.registry.get_mut(&key)?;
        for m in history {
            record.push_match(m);
        }
        if let Some(rssi) = signature.transmission.signal_strength {
            let kind = signal_kind(report.shape, signature.transmission.kind);
            if let Some(source) = SignalSource::new(signature.transmission.mac.clone(), rssi, kind, now) {
                record.update_source(source);
            }
        }

        Some(Ingested {
            key,
            signature,
            is_new,
            possible_duplicate,
        })
    }

    /// Apply an operator or home position published on its own
    pub fn apply_companion(&mut self, update: &CompanionUpdate) -> bool {
        let id = update.drone_id.strip_prefix("drone-").unwrap_or(&update.drone_id);
        let Some(record) = self.registry.lookup_mut(id) else {
            debug!(drone = %update.drone_id, "companion update for unknown drone");
            return false;
        };
        match update.role {
            CompanionRole::Operator => record.operator_location = Some(update.location),
            CompanionRole::Home => record.home_location = Some(update.location),
        }
        true
    }

    pub fn prune(&mut self, now: Instant) -> usize {
        self.registry.prune(now)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{BasicIdBlock, LocationBlock, SystemBlock};
    use std::time::Duration;

    fn report(id: &str, mac: &str, shape: PayloadShape, lat: f64, rssi: f64) -> DroneReport {
        DroneReport {
            shape,
            basic_ids: vec![BasicIdBlock {
                id: Some(id.to_string()),
                mac: Some(mac.to_string()),
                rssi: Some(rssi),
                ..Default::default()
            }],
            location: Some(LocationBlock {
                latitude: Some(lat),
                longitude: Some(-105.0),
                height_agl: Some(40.0),
                speed: Some(4.0),
                direction: Some(180.0),
                ..Default::default()
            }),
            block_kinds: vec!["Basic ID".to_string()],
            ..Default::default()
        }
    }

    fn signature(engine: &mut CorrelationEngine, r: &DroneReport, now: Instant) -> DroneSignature {
        engine.ingest(r, None, now).unwrap().signature
    }

    #[test]
    fn test_shared_mac_is_certain() {
        let mut engine = CorrelationEngine::new();
        let now = Instant::now();
        let a = signature(&mut engine, &report("A", "11:22", PayloadShape::Wifi, 39.0, -50.0), now);
        let mut b = a.clone();
        b.primary_id.id = "B".to_string();
        b.position.coordinate = Coordinate::new(10.0, 10.0);
        assert_eq!(match_signatures(&a, &b, &[], &[]), 1.0);
        assert_eq!(match_signatures(&a, &a, &[], &[]), 1.0);
    }

    #[test]
    fn test_match_record_shared_mac_names_identity() {
        let mut engine = CorrelationEngine::new();
        let now = Instant::now();
        let a = signature(&mut engine, &report("A", "11:22", PayloadShape::Wifi, 39.0, -50.0), now);
        let mut b = a.clone();
        b.primary_id.id = "B".to_string();
        b.position.coordinate = Coordinate::new(10.0, 10.0);
        let m = match_record(&a, "B", &b, &[40.0, 41.0, 42.0], &[5.0, 4.0, 3.0], now);
        assert_eq!(m.score, 1.0);
        assert_eq!(m.factors.first(), Some(&MatchFactor::PrimaryId));
        assert_eq!(m.other, "B");
    }

    #[test]
    fn test_scores_in_range_and_distance_sensitive() {
        let mut engine = CorrelationEngine::new();
        let now = Instant::now();
        let a = signature(&mut engine, &report("A", "aa", PayloadShape::Wifi, 39.0, -50.0), now);
        let near = signature(&mut engine, &report("B", "bb", PayloadShape::Wifi, 39.00001, -52.0), now);
        let far = signature(&mut engine, &report("C", "cc", PayloadShape::Wifi, 39.1, -90.0), now);

        let s_near = match_signatures(&a, &near, &[], &[]);
        let s_far = match_signatures(&a, &far, &[], &[]);
        assert!((0.0..=1.0).contains(&s_near));
        assert!((0.0..=1.0).contains(&s_far));
        assert!(s_near > s_far);
        assert!(s_near > DUPLICATE_THRESHOLD);
    }

    #[test]
    fn test_missing_factors_are_omitted() {
        let mut engine = CorrelationEngine::new();
        let now = Instant::now();
        let mut r = report("A", "aa", PayloadShape::Wifi, 0.0, -50.0);
        r.location = None;
        let a = signature(&mut engine, &r, now);
        let mut r2 = r.clone();
        r2.basic_ids[0].id = Some("B".to_string());
        r2.basic_ids[0].mac = Some("bb".to_string());
        let b = signature(&mut engine, &r2, now);
        // No positions: identical remaining factors still score perfectly
        assert!((match_signatures(&a, &b, &[], &[]) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_operator_location_blend() {
        let mut engine = CorrelationEngine::new();
        let now = Instant::now();
        let mut ra = report("A", "aa", PayloadShape::Wifi, 39.0, -50.0);
        ra.system = Some(SystemBlock {
            operator_lat: Some(39.0),
            operator_lon: Some(-105.0),
            ..Default::default()
        });
        let mut rb = report("B", "bb", PayloadShape::Wifi, 39.0, -50.0);
        rb.system = Some(SystemBlock {
            operator_lat: Some(39.01),
            operator_lon: Some(-105.0),
            ..Default::default()
        });
        let a = signature(&mut engine, &ra, now);
        let b = signature(&mut engine, &rb, now);
        // Everything identical except an operator 1 km away: 1.0*0.8 + 0*0.2
        assert!((match_signatures(&a, &b, &[], &[]) - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_trend_agreement() {
        assert_eq!(trend_agreement(&[1.0, 2.0], &[1.0, 2.0, 3.0]), None);
        assert_eq!(trend_agreement(&[1.0, 2.0, 3.0], &[5.0, 6.0, 7.0]), Some(1.0));
        assert_eq!(trend_agreement(&[1.0, 2.0, 3.0], &[7.0, 6.0, 5.0]), Some(0.0));
        assert_eq!(trend_agreement(&[1.0, 1.05, 1.0], &[3.0, 3.0, 3.0]), Some(1.0));
    }

    #[test]
    fn test_match_history_recorded() {
        let mut engine = CorrelationEngine::new();
        let t0 = Instant::now();
        let r = report("A", "aa", PayloadShape::Wifi, 39.0, -50.0);
        engine.ingest(&r, None, t0);
        engine.ingest(&r, None, t0 + Duration::from_secs(1));
        let record = engine.record("A").unwrap();
        assert_eq!(record.match_history.len(), 1);
        let m = &record.match_history[0];
        assert_eq!(m.score, 1.0);
        assert!(m.factors.contains(&MatchFactor::PrimaryId));
        assert!(m.confidence >= 0.3 && m.confidence <= 1.0);
    }

    #[test]
    fn test_duplicate_candidates_not_fused() {
        let mut engine = CorrelationEngine::new();
        let now = Instant::now();
        engine.ingest(&report("A", "aa", PayloadShape::Wifi, 39.0, -50.0), None, now);
        let out = engine
            .ingest(&report("B", "bb", PayloadShape::Wifi, 39.0, -50.0), None, now)
            .unwrap();
        assert!(out.is_new);
        assert_eq!(out.possible_duplicate.as_ref().map(|(k, _)| k.as_str()), Some("A"));
        assert_eq!(engine.len(), 2);
    }

    #[test]
    fn test_bluetooth_and_wifi_fold_into_one_drone() {
        let mut engine = CorrelationEngine::new();
        let t0 = Instant::now();
        let mac = "60:60:1f:aa:bb:cc";
        engine.ingest(&report("SN1", mac, PayloadShape::Bluetooth, 39.0, -70.0), None, t0);
        engine.ingest(&report("SN1", mac, PayloadShape::Wifi, 39.0, -60.0), None, t0 + Duration::from_secs(1));
        engine.ingest(&report("SN1", mac, PayloadShape::Bluetooth, 39.0, -68.0), None, t0 + Duration::from_secs(2));

        assert_eq!(engine.len(), 1);
        let record = engine.record("SN1").unwrap();
        let kinds: Vec<_> = record.sources.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![SignalKind::Wifi, SignalKind::Bluetooth]);
        assert_eq!(record.sources[1].rssi, -68.0);
    }

    #[test]
    fn test_apply_companion() {
        let mut engine = CorrelationEngine::new();
        let now = Instant::now();
        engine.ingest(&report("SN1", "aa", PayloadShape::Wifi, 39.0, -50.0), None, now);
        let update = CompanionUpdate {
            drone_id: "drone-SN1".to_string(),
            role: CompanionRole::Home,
            location: Coordinate::new(39.1, -105.1),
            altitude: None,
        };
        assert!(engine.apply_companion(&update));
        assert_eq!(engine.record("SN1").unwrap().home_location, Some(Coordinate::new(39.1, -105.1)));
        assert!(!engine.apply_companion(&CompanionUpdate {
            drone_id: "nobody".to_string(),
            ..update
        }));
    }
}
