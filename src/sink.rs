//! Outbound collaborators and the rate-limited fan-out
//!
//!  Storage, MQTT, TAK and webhook clients live outside this crate; here
//!  they are traits. The dispatcher checks the rate limiter before every
//!  call, skips silently when denied and logs sink errors without retrying.

use std::time::Instant;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::aircraft::Aircraft;
use crate::cot;
use crate::error::SinkError;
use crate::event::{FpvDetection, Metadata, MonitorStatus};
use crate::physics::Coordinate;
use crate::ratelimit::{RateLimitManager, SinkKind};
use crate::signature::DroneSignature;
use crate::spoof::SpoofResult;
use crate::tracking::TrackingRecord;

/// Canonical event dictionary handed to sinks
pub type EventDict = Map<String, Value>;

pub const DRONE_COT_TYPE: &str = "a-u-A-M-H-R";
pub const AIRCRAFT_COT_TYPE: &str = "a-n-A-C-F";
pub const STATUS_COT_TYPE: &str = "a-f-G-E-S";

pub trait Persistence: Send {
    fn persist(&mut self, signature: &DroneSignature, record: &TrackingRecord) -> Result<(), SinkError>;
}

pub trait MqttPublisher: Send {
    fn publish(&mut self, topic: &str, event: &EventDict) -> Result<(), SinkError>;
}

pub trait TakSender: Send {
    fn send(&mut self, cot_xml: &str) -> Result<(), SinkError>;
}

pub trait WebhookSender: Send {
    fn send_webhook(&mut self, event: WebhookEvent, data: &EventDict, metadata: &Metadata) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEvent {
    DroneDetected,
    SpoofDetected,
    FpvDetected,
    AircraftEmergency,
}

impl WebhookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEvent::DroneDetected => "drone_detected",
            WebhookEvent::SpoofDetected => "spoof_detected",
            WebhookEvent::FpvDetected => "fpv_detected",
            WebhookEvent::AircraftEmergency => "aircraft_emergency",
        }
    }
}

/// Sink that writes every delivery to the log
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    /// Log at INFO instead of DEBUG
    pub loud: bool,
}

impl LogSink {
    pub fn new(loud: bool) -> Self {
        Self { loud }
    }

    fn emit(&self, sink: &str, uid: &str, detail: &str) {
        if self.loud {
            info!(sink, uid, "{}", detail);
        } else {
            debug!(sink, uid, "{}", detail);
        }
    }
}

impl Persistence for LogSink {
    fn persist(&mut self, signature: &DroneSignature, record: &TrackingRecord) -> Result<(), SinkError> {
        self.emit(
            "persist",
            &record.key,
            &format!(
                "{} signatures, {} fixes, rssi {:?}",
                record.signatures.len(),
                record.flight_path.len(),
                signature.transmission.signal_strength
            ),
        );
        Ok(())
    }
}

impl MqttPublisher for LogSink {
    fn publish(&mut self, topic: &str, event: &EventDict) -> Result<(), SinkError> {
        let uid = event.get("uid").and_then(Value::as_str).unwrap_or("");
        let body = serde_json::to_string(event).map_err(|e| SinkError::Rejected(e.to_string()))?;
        self.emit("mqtt", uid, &format!("{} {}", topic, body));
        Ok(())
    }
}

impl TakSender for LogSink {
    fn send(&mut self, cot_xml: &str) -> Result<(), SinkError> {
        self.emit("tak", "", &format!("{} bytes of CoT", cot_xml.len()));
        Ok(())
    }
}

impl WebhookSender for LogSink {
    fn send_webhook(&mut self, event: WebhookEvent, data: &EventDict, metadata: &Metadata) -> Result<(), SinkError> {
        let uid = data.get("uid").and_then(Value::as_str).unwrap_or("");
        self.emit(
            "webhook",
            uid,
            &format!("{} ({} metadata fields)", event.as_str(), metadata.len()),
        );
        Ok(())
    }
}

/// The four outbound collaborators
pub struct Sinks {
    pub persistence: Box<dyn Persistence>,
    pub mqtt: Box<dyn MqttPublisher>,
    pub tak: Box<dyn TakSender>,
    pub webhook: Box<dyn WebhookSender>,
}

impl Sinks {
    pub fn logging(loud: bool) -> Self {
        Self {
            persistence: Box::new(LogSink::new(loud)),
            mqtt: Box::new(LogSink::new(loud)),
            tak: Box::new(LogSink::new(loud)),
            webhook: Box::new(LogSink::new(loud)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Keys currently held by the per-drone limiter
    pub limited_items: usize,
}

/// One processed drone observation ready for fan-out
pub struct DroneUpdate<'a> {
    pub key: &'a str,
    pub signature: &'a DroneSignature,
    pub record: &'a TrackingRecord,
    pub spoof: Option<&'a SpoofResult>,
    pub is_new: bool,
}

pub struct Dispatcher {
    sinks: Sinks,
    limits: RateLimitManager,
    topic: String,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(sinks: Sinks, limits: RateLimitManager, topic: &str) -> Self {
        Self {
            sinks,
            limits,
            topic: topic.trim_end_matches('/').to_string(),
            stats: DispatchStats::default(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            limited_items: self.limits.tracked_items(),
            ..self.stats
        }
    }

    fn deliver<F>(&mut self, sink: SinkKind, uid: &str, now: Instant, call: F)
    where
        F: FnOnce(&mut Sinks) -> Result<(), SinkError>,
    {
        if !self.limits.allow_sink(sink, now) {
            self.stats.skipped += 1;
            return;
        }
        match call(&mut self.sinks) {
            Ok(()) => self.stats.delivered += 1,
            Err(e) => {
                self.stats.failed += 1;
                warn!(sink = ?sink, uid, error = %e, "sink delivery failed");
            }
        }
    }

    fn publish_all(&mut self, topic: String, dict: &EventDict, uid: &str, now: Instant) {
        self.deliver(SinkKind::Mqtt, uid, now, |s| s.mqtt.publish(&topic, dict));
        let xml = cot::format_event(dict, Utc::now());
        self.deliver(SinkKind::Tak, uid, now, |s| s.tak.send(&xml));
    }

    pub fn drone(&mut self, update: DroneUpdate<'_>, now: Instant) {
        let spoofed = update.spoof.is_some_and(|s| s.is_spoofed);
        // New and spoofed drones always go out but still count against the limit
        if !self.limits.item_allowed(update.key, now) && !update.is_new && !spoofed {
            self.stats.skipped += 1;
            return;
        }
        self.limits.record_item(update.key, now);

        let dict = drone_dict(update.key, update.signature, update.record, update.spoof);
        let uid = format!("drone-{}", update.key);

        self.deliver(SinkKind::Persist, &uid, now, |s| {
            s.persistence.persist(update.signature, update.record)
        });
        self.publish_all(format!("{}/drones/{}", self.topic, update.key), &dict, &uid, now);

        let metadata = &update.signature.transmission.metadata;
        if update.is_new {
            self.deliver(SinkKind::Webhook, &uid, now, |s| {
                s.webhook.send_webhook(WebhookEvent::DroneDetected, &dict, metadata)
            });
        }
        if spoofed {
            self.deliver(SinkKind::Webhook, &uid, now, |s| {
                s.webhook.send_webhook(WebhookEvent::SpoofDetected, &dict, metadata)
            });
        }
    }

    pub fn fpv(&mut self, fpv: &FpvDetection, station: Option<Coordinate>, is_new: bool, now: Instant) {
        let id = fpv.synthetic_id();
        if !self.limits.item_allowed(&id, now) && !is_new {
            self.stats.skipped += 1;
            return;
        }
        self.limits.record_item(&id, now);
        let dict = fpv_dict(fpv, station);
        self.publish_all(format!("{}/fpv/{}", self.topic, id), &dict, &id, now);
        if is_new {
            self.deliver(SinkKind::Webhook, &id, now, |s| {
                s.webhook.send_webhook(WebhookEvent::FpvDetected, &dict, &Metadata::new())
            });
        }
    }

    pub fn aircraft(&mut self, aircraft: &Aircraft, now: Instant) {
        let uid = aircraft.uid();
        if !self.limits.allow_item(&uid, now) {
            self.stats.skipped += 1;
            return;
        }
        let dict = aircraft_dict(aircraft);
        self.publish_all(format!("{}/aircraft/{}", self.topic, aircraft.hex), &dict, &uid, now);
        if aircraft.is_emergency() {
            self.deliver(SinkKind::Webhook, &uid, now, |s| {
                s.webhook.send_webhook(WebhookEvent::AircraftEmergency, &dict, &Metadata::new())
            });
        }
    }

    pub fn status(&mut self, status: &MonitorStatus, now: Instant) {
        let dict = status_dict(status);
        let uid = status.serial.clone();
        self.publish_all(format!("{}/status", self.topic), &dict, &uid, now);
    }
}

fn put(dict: &mut EventDict, key: &str, value: Option<impl Into<Value>>) {
    if let Some(v) = value {
        dict.insert(key.to_string(), v.into());
    }
}

/// Metadata values that look numeric are sent as numbers
fn meta_value(raw: &str) -> Value {
    match raw.parse::<f64>() {
        Ok(n) if n.is_finite() => Value::from(n),
        _ => Value::from(raw),
    }
}

const METADATA_EXTRAS: &[&str] = &[
    "aux_rssi",
    "channel",
    "phy",
    "adv_mode",
    "operator_id",
    "area_count",
    "area_radius",
    "area_ceiling",
    "area_floor",
    "classification",
    "freq",
    "seen_by",
    "observed_at",
    "model",
    "rid_source",
];

pub fn drone_dict(
    key: &str,
    sig: &DroneSignature,
    record: &TrackingRecord,
    spoof: Option<&SpoofResult>,
) -> EventDict {
    let mut d = EventDict::new();
    d.insert("uid".into(), format!("drone-{}", key).into());
    d.insert("type".into(), DRONE_COT_TYPE.into());
    d.insert("id".into(), sig.primary_id.id.clone().into());
    d.insert("idType".into(), sig.primary_id.id_type.clone().into());
    d.insert("uaType".into(), sig.primary_id.aircraft_type.as_str().into());

    let pos = &sig.position;
    d.insert("lat".into(), pos.coordinate.lat.into());
    d.insert("lon".into(), pos.coordinate.lon.into());
    d.insert("alt".into(), pos.altitude.into());
    d.insert("height".into(), sig.height.height_above_ground.into());
    d.insert("speed".into(), sig.movement.ground_speed.into());
    d.insert("vspeed".into(), sig.movement.vertical_speed.into());
    d.insert("heading".into(), sig.movement.heading.into());
    d.insert("climbRate".into(), sig.movement.climb_rate.into());

    let operator = pos.operator_location.or(record.operator_location);
    put(&mut d, "pilotLat", operator.map(|c| c.lat));
    put(&mut d, "pilotLon", operator.map(|c| c.lon));
    let home = pos.home_location.or(record.home_location);
    put(&mut d, "homeLat", home.map(|c| c.lat));
    put(&mut d, "homeLon", home.map(|c| c.lon));

    put(&mut d, "description", sig.description.clone());
    put(&mut d, "sessionId", sig.session_id.clone());
    put(&mut d, "rssi", sig.transmission.signal_strength);
    put(&mut d, "expectedRssi", sig.transmission.expected_signal_strength);
    put(&mut d, "mac", sig.transmission.mac.clone());
    put(&mut d, "manufacturer", sig.transmission.metadata.get("manufacturer").cloned());
    put(&mut d, "registration", sig.secondary_id.clone().or_else(|| record.registration.clone()));
    d.insert("transmission".into(), sig.transmission.kind.as_str().into());

    d.insert("isSpoofed".into(), spoof.is_some_and(|s| s.is_spoofed).into());
    if let Some(s) = spoof {
        d.insert("spoofConfidence".into(), s.confidence.into());
        d.insert("spoofActualRssi".into(), s.actual_rssi.into());
        put(&mut d, "spoofExpectedRssi", s.expected_rssi);
        put(&mut d, "spoofDistance", s.distance);
        if !s.reasons.is_empty() {
            d.insert("spoofReasons".into(), s.reasons.clone().into());
        }
    }

    if !record.sources.is_empty() {
        let sources: Vec<Value> = record
            .sources
            .iter()
            .map(|s| {
                let mut m = EventDict::new();
                m.insert("type".into(), s.kind.as_str().into());
                m.insert("rssi".into(), s.rssi.into());
                put(&mut m, "mac", s.mac.clone());
                Value::Object(m)
            })
            .collect();
        d.insert("sources".into(), sources.into());
    }

    for key in METADATA_EXTRAS {
        if let Some(v) = sig.transmission.metadata.get(*key) {
            d.insert((*key).to_string(), meta_value(v));
        }
    }
    d
}

pub fn fpv_dict(fpv: &FpvDetection, station: Option<Coordinate>) -> EventDict {
    let mut d = EventDict::new();
    d.insert("uid".into(), fpv.synthetic_id().into());
    d.insert("type".into(), DRONE_COT_TYPE.into());
    put(&mut d, "lat", station.map(|c| c.lat));
    put(&mut d, "lon", station.map(|c| c.lon));
    d.insert("rssi".into(), fpv.rssi.into());
    d.insert("frequency".into(), fpv.frequency_mhz.into());
    d.insert("transmission".into(), "fpv".into());
    d.insert("source".into(), fpv.source.clone().into());
    put(&mut d, "estimatedDistance", fpv.estimated_distance);
    put(&mut d, "description", fpv.device_type.clone());
    put(&mut d, "bandwidth", fpv.bandwidth.clone());
    put(&mut d, "status", fpv.status.clone());
    d.insert("isSpoofed".into(), false.into());
    d
}

pub fn aircraft_dict(a: &Aircraft) -> EventDict {
    let mut d = EventDict::new();
    d.insert("uid".into(), a.uid().into());
    d.insert("type".into(), AIRCRAFT_COT_TYPE.into());
    d.insert("hex".into(), a.hex.clone().into());
    put(&mut d, "lat", a.position.map(|c| c.lat));
    put(&mut d, "lon", a.position.map(|c| c.lon));
    // feet to meters, knots to m/s
    put(&mut d, "alt", a.altitude.map(|ft| ft * 0.3048));
    put(&mut d, "speed", a.speed.map(|kt| kt * 0.514444));
    put(&mut d, "heading", a.track);
    put(&mut d, "vspeed", a.vertical_rate.map(|fpm| fpm * 0.00508));
    put(&mut d, "rssi", a.rssi);
    put(&mut d, "squawk", a.squawk.clone());
    put(&mut d, "category", a.category.clone());
    if !a.flight.is_empty() {
        d.insert("description".into(), a.flight.clone().into());
    }
    d.insert("onGround".into(), a.on_ground.into());
    d.insert("emergency".into(), a.is_emergency().into());
    d
}

pub fn status_dict(s: &MonitorStatus) -> EventDict {
    let mut d = EventDict::new();
    d.insert("uid".into(), s.serial.clone().into());
    d.insert("type".into(), STATUS_COT_TYPE.into());
    put(&mut d, "lat", s.location.map(|c| c.lat));
    put(&mut d, "lon", s.location.map(|c| c.lon));
    put(&mut d, "alt", s.altitude);
    put(&mut d, "speed", s.speed);
    put(&mut d, "heading", s.track);
    put(&mut d, "cpuUsage", s.cpu_usage);
    put(&mut d, "memoryAvailable", s.memory_available);
    put(&mut d, "temperature", s.temperature);
    put(&mut d, "uptime", s.uptime);
    put(&mut d, "plutoTemp", s.pluto_temp);
    put(&mut d, "zynqTemp", s.zynq_temp);
    d
}
