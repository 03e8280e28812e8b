//! Message normalizer
//!
//!  Classifies raw payloads and converts them to `CanonicalEvent`.
//!  XML goes straight to the CoT reader. JSON is tried in order:
//!
//!  1. explicit physical-layer markers (FPV detection, FPV lock update,
//!     bare frequency + signal readings) go to the FPV path
//!  2. `system_stats` marks station status
//!  3. an identity or advertisement block marks drone telemetry
//!  4. anything else is rejected as unrecognized
//!
//!  Each field extractor is total: wrong types and unit-suffixed strings
//!  become `None` or a parsed number, never an error.

use serde_json::{Map, Value};

use crate::aircraft::AircraftList;
use crate::cot;
use crate::error::NormalizeError;
use crate::event::{
    AuxAdvertisement, AuxExtended, BasicIdBlock, CanonicalEvent, DroneReport, Enrichment,
    FpvDetection, LocationBlock, MonitorStatus, PayloadShape, SystemBlock, UaTypeField,
};
use crate::network::{RawMessage, Transport};
use crate::physics::Coordinate;

const BASIC_ID: &str = "Basic ID";
const LOCATION: &str = "Location/Vector Message";
const SYSTEM: &str = "System Message";
const SELF_ID: &str = "Self-ID Message";
const OPERATOR_ID: &str = "Operator ID Message";
const AUTH: &str = "Authentication Message";
const AUX_ADV: &str = "AUX_ADV_IND";
const AUX_EXT: &str = "aext";
const ADV_DATA: &str = "AdvData";
const DRONE_ID: &str = "DroneID";
const FPV_DETECTION: &str = "FPV Detection";

/// Keys that name protocol blocks, recorded as the broadcast message sequence
const BLOCK_KINDS: &[&str] = &[BASIC_ID, LOCATION, SYSTEM, SELF_ID, OPERATOR_ID, AUTH, AUX_ADV];

/// Any of these means Remote-ID telemetry, whatever enrichment rides along
const REMOTE_ID_BLOCKS: &[&str] = &[BASIC_ID, LOCATION, SYSTEM, SELF_ID, OPERATOR_ID];

/// Spellings of a CAA registration carried outside the Basic ID block
const CAA_KEYS: &[&str] = &["caa_registration", "caa_id", "caa"];

/// Normalize one message from any transport
pub fn normalize(msg: &RawMessage) -> Result<CanonicalEvent, NormalizeError> {
    match msg.transport {
        Transport::Adsb => {
            let list: AircraftList = serde_json::from_slice(&msg.payload)?;
            Ok(CanonicalEvent::Aircraft(list.aircraft))
        }
        Transport::Multicast | Transport::Bus => classify(&msg.payload),
    }
}

/// Classify a Remote-ID transport payload and convert it
pub fn classify(payload: &[u8]) -> Result<CanonicalEvent, NormalizeError> {
    let text = strip_topic(std::str::from_utf8(payload)?.trim());

    if text.starts_with('<') {
        return cot::parse(text).map(cot::to_canonical);
    }

    let value: Value = serde_json::from_str(text)?;
    let blocks = Blocks::flatten(&value);

    if let Some(fpv) = fpv_detection(&blocks) {
        return Ok(CanonicalEvent::Fpv(fpv));
    }
    if let Some(status) = value.as_object().filter(|o| o.contains_key("system_stats")) {
        return Ok(CanonicalEvent::Status(monitor_status(status)));
    }
    if blocks.has_identity() {
        return Ok(CanonicalEvent::Drone(drone_report(&blocks)));
    }

    Err(NormalizeError::Unrecognized)
}

/// Drop a leading bus topic word such as `AUX_ADV_IND {...}`
fn strip_topic(text: &str) -> &str {
    if text.starts_with(['{', '[', '<']) {
        return text;
    }
    match text.find(['{', '[', '<']) {
        Some(pos) if !text[..pos].trim().contains(char::is_whitespace) => &text[pos..],
        _ => text,
    }
}

/// Top-level key/value pairs regardless of which of the vendor layouts was used
struct Blocks<'a> {
    pairs: Vec<(&'a str, &'a Value)>,
    /// MAC used as the key of a `DroneID` wrapper
    wrapper_mac: Option<String>,
    shape: PayloadShape,
}

impl<'a> Blocks<'a> {
    fn flatten(value: &'a Value) -> Self {
        let mut pairs = Vec::new();
        let mut wrapper_mac = None;
        let mut wrapped = false;

        match value {
            Value::Array(items) => {
                for item in items {
                    if let Some(obj) = item.as_object() {
                        pairs.extend(obj.iter().map(|(k, v)| (k.as_str(), v)));
                    }
                }
            }
            Value::Object(obj) => match obj.get(DRONE_ID).and_then(Value::as_object) {
                Some(inner) => {
                    wrapped = true;
                    for (mac, body) in inner {
                        wrapper_mac.get_or_insert_with(|| mac.clone());
                        if let Some(body) = body.as_object() {
                            pairs.extend(body.iter().map(|(k, v)| (k.as_str(), v)));
                        }
                    }
                }
                None => pairs.extend(obj.iter().map(|(k, v)| (k.as_str(), v))),
            },
            _ => {}
        }

        let has = |key: &str| pairs.iter().any(|(k, _)| *k == key);
        let shape = if wrapped || has("index") || has("runtime") {
            PayloadShape::Wifi
        } else if has(AUX_ADV) || has(ADV_DATA) {
            PayloadShape::Bluetooth
        } else {
            PayloadShape::Unknown
        };

        Self {
            pairs,
            wrapper_mac,
            shape,
        }
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    fn first_of(&self, keys: &[&str]) -> Option<&'a Value> {
        keys.iter().find_map(|k| self.get(k))
    }

    fn has_identity(&self) -> bool {
        self.get(BASIC_ID).is_some() || self.get(AUX_ADV).is_some() || self.wrapper_mac.is_some()
    }
}

fn fpv_detection(blocks: &Blocks) -> Option<FpvDetection> {
    if let Some(det) = blocks.get(FPV_DETECTION).and_then(Value::as_object) {
        return Some(FpvDetection {
            source: first_text(det, &["detection_source", "manufacturer", "device_type"])
                .unwrap_or_else(|| "fpv".to_string()),
            frequency_mhz: first_number(det, &["frequency", "freq"]).map(to_mhz).unwrap_or(0.0),
            rssi: first_number(det, &["signal_strength", "rssi"]).unwrap_or(0.0),
            estimated_distance: first_number(det, &["estimated_distance", "distance"]),
            device_type: first_text(det, &["device_type", "model"]),
            bandwidth: first_text(det, &["bandwidth"]),
            status: first_text(det, &["status"]),
        });
    }

    if blocks.wrapper_mac.is_some() || blocks.first_of(REMOTE_ID_BLOCKS).is_some() {
        return None;
    }

    let frequency = blocks.first_of(&["frequency", "freq"]).and_then(number)?;

    // Lock update from the video-link receiver: advertisement framing, no identity
    if let Some(aux) = blocks.get(AUX_ADV).and_then(Value::as_object) {
        let source = blocks
            .get(AUX_EXT)
            .and_then(Value::as_object)
            .and_then(|ext| first_text(ext, &["AdvA"]))
            .and_then(|a| a.split_whitespace().next().map(str::to_string))
            .unwrap_or_else(|| "fpv".to_string());
        return Some(FpvDetection {
            source,
            frequency_mhz: to_mhz(frequency),
            rssi: first_number(aux, &["rssi"]).unwrap_or(0.0),
            estimated_distance: blocks.get("distance").and_then(number),
            status: Some("LOCK UPDATE".to_string()),
            ..Default::default()
        });
    }

    // Bare spectrum reading
    let rssi = blocks.first_of(&["signal_strength", "rssi"]).and_then(number)?;
    Some(FpvDetection {
        source: blocks
            .first_of(&["detection_source", "model", "device_type"])
            .and_then(text)
            .unwrap_or_else(|| "sdr".to_string()),
        frequency_mhz: to_mhz(frequency),
        rssi,
        estimated_distance: blocks.get("estimated_distance").and_then(number),
        device_type: blocks.first_of(&["model", "device_type"]).and_then(text),
        ..Default::default()
    })
}

fn monitor_status(obj: &Map<String, Value>) -> MonitorStatus {
    let gps = obj.get("gps_data").and_then(Value::as_object);
    let stats = obj.get("system_stats").and_then(Value::as_object);
    let temps = obj.get("ant_sdr_temps").and_then(Value::as_object);

    let gps_num = |keys: &[&str]| gps.and_then(|g| first_number(g, keys));
    let stat_num = |keys: &[&str]| stats.and_then(|s| first_number(s, keys));
    let temp_num = |keys: &[&str]| temps.and_then(|t| first_number(t, keys));

    let location = match (gps_num(&["latitude", "lat"]), gps_num(&["longitude", "lon"])) {
        (Some(lat), Some(lon)) => Some(Coordinate::new(lat, lon)),
        _ => None,
    };

    MonitorStatus {
        serial: first_text(obj, &["serial_number", "uid", "serial"]).unwrap_or_else(|| "monitor".to_string()),
        location,
        altitude: gps_num(&["altitude", "alt"]),
        speed: gps_num(&["speed"]),
        track: gps_num(&["track", "course"]),
        cpu_usage: stat_num(&["cpu_usage"]),
        memory_available: stats
            .and_then(|s| s.get("memory"))
            .and_then(Value::as_object)
            .and_then(|m| first_number(m, &["available"])),
        temperature: stat_num(&["temperature"]),
        uptime: stat_num(&["uptime"]),
        pluto_temp: temp_num(&["pluto_temp"]),
        zynq_temp: temp_num(&["zynq_temp"]),
    }
}

fn drone_report(blocks: &Blocks) -> DroneReport {
    let mut report = DroneReport {
        shape: blocks.shape,
        ..Default::default()
    };

    for (key, value) in &blocks.pairs {
        match *key {
            BASIC_ID => match value {
                Value::Array(items) => report
                    .basic_ids
                    .extend(items.iter().filter_map(Value::as_object).map(basic_id)),
                Value::Object(obj) => report.basic_ids.push(basic_id(obj)),
                _ => {}
            },
            LOCATION => report.location = value.as_object().map(location),
            SYSTEM => report.system = value.as_object().map(system),
            SELF_ID => {
                report.self_id = value
                    .as_object()
                    .and_then(|o| first_text(o, &["text", "description"]))
            }
            OPERATOR_ID => {
                report.operator_id = value
                    .as_object()
                    .and_then(|o| first_text(o, &["operator_id"]))
            }
            AUX_ADV => report.aux_adv = value.as_object().map(aux_advertisement),
            AUX_EXT => report.aux_ext = value.as_object().map(aux_extended),
            "MAC" | "mac" => report.mac = text(value),
            "rssi" | "RSSI" => report.rssi = number(value).filter(|r| *r != 0.0),
            "id" | "uid" => report.uid = text(value),
            "description" => {
                if report.self_id.is_none() {
                    report.self_id = text(value);
                }
            }
            k if CAA_KEYS.contains(&k) => report.caa_registration = text(value),
            _ => {}
        }
        if BLOCK_KINDS.contains(key) {
            report.block_kinds.push(key.to_string());
        }
    }

    if report.mac.is_none() {
        report.mac = blocks.wrapper_mac.clone();
    }
    report.enrichment = enrichment(blocks);
    report
}

fn basic_id(obj: &Map<String, Value>) -> BasicIdBlock {
    let ua_type = obj.get("ua_type").and_then(|v| match v {
        Value::Number(n) => n.as_i64().map(UaTypeField::Code),
        Value::String(s) => Some(match s.trim().parse::<i64>() {
            Ok(code) => UaTypeField::Code(code),
            Err(_) => UaTypeField::Name(s.trim().to_string()),
        }),
        _ => None,
    });

    BasicIdBlock {
        id: first_text(obj, &["id"]),
        id_type: first_text(obj, &["id_type"]),
        ua_type,
        protocol_version: first_text(obj, &["protocol_version"]),
        mac: first_text(obj, &["MAC", "mac"]),
        rssi: first_number(obj, &["rssi", "RSSI"]).filter(|r| *r != 0.0),
    }
}

fn location(obj: &Map<String, Value>) -> LocationBlock {
    LocationBlock {
        latitude: first_number(obj, &["latitude", "lat"]),
        longitude: first_number(obj, &["longitude", "lon"]),
        geodetic_altitude: first_number(obj, &["geodetic_altitude", "alt"]),
        pressure_altitude: first_number(obj, &["pressure_altitude", "alt_pressure"]),
        height_agl: first_number(obj, &["height_agl", "height"]),
        height_type: first_text(obj, &["height_type"]),
        speed: first_number(obj, &["speed"]),
        vert_speed: first_number(obj, &["vert_speed"]),
        direction: first_number(obj, &["direction", "heading"]),
        op_status: first_text(obj, &["op_status"]),
    }
}

fn system(obj: &Map<String, Value>) -> SystemBlock {
    SystemBlock {
        operator_lat: first_number(obj, &["operator_lat"]),
        operator_lon: first_number(obj, &["operator_lon"]),
        latitude: first_number(obj, &["latitude"]),
        longitude: first_number(obj, &["longitude"]),
        home_lat: first_number(obj, &["home_lat"]),
        home_lon: first_number(obj, &["home_lon"]),
        operator_alt_geo: first_number(obj, &["operator_alt_geo", "geodetic_altitude"]),
        area_count: first_number(obj, &["area_count"]),
        area_radius: first_number(obj, &["area_radius"]),
        area_ceiling: first_number(obj, &["area_ceiling"]),
        area_floor: first_number(obj, &["area_floor"]),
        classification: first_text(obj, &["classification_type", "classification"]),
    }
}

fn aux_advertisement(obj: &Map<String, Value>) -> AuxAdvertisement {
    AuxAdvertisement {
        rssi: first_number(obj, &["rssi"]).filter(|r| *r != 0.0),
        addr: first_text(obj, &["addr"]),
        access_address: obj.get("aa").and_then(Value::as_u64),
        channel: obj.get("chan").and_then(Value::as_u64).map(|c| c as u32),
        phy: obj.get("phy").and_then(Value::as_u64).map(|p| p as u32),
    }
}

fn aux_extended(obj: &Map<String, Value>) -> AuxExtended {
    AuxExtended {
        adv_address: first_text(obj, &["AdvA"])
            .and_then(|a| a.split_whitespace().next().map(str::to_string)),
        adv_mode: first_text(obj, &["AdvMode", "adv_mode"]),
    }
}

fn enrichment(blocks: &Blocks) -> Enrichment {
    let rid = blocks.get("rid").and_then(Value::as_object);
    Enrichment {
        freq: blocks.get("freq").and_then(number),
        seen_by: blocks.get("seen_by").and_then(text),
        observed_at: blocks.get("observed_at").and_then(number),
        rid_make: rid.and_then(|r| first_text(r, &["make"])),
        rid_model: rid.and_then(|r| first_text(r, &["model"])),
        rid_source: rid.and_then(|r| first_text(r, &["source"])),
        index: blocks.get("index").and_then(number),
        runtime: blocks.get("runtime").and_then(number),
    }
}

/// Numbers, numeric strings and unit-suffixed strings ("64.5 m")
fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => cot::leading_number(s),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

/// Non-empty trimmed strings; numbers are rendered
fn text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_number(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| obj.get(*k).and_then(number))
}

fn first_text(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| obj.get(*k).and_then(text))
}

/// Detectors report either MHz or Hz
fn to_mhz(freq: f64) -> f64 {
    if freq > 100_000.0 { freq / 1_000_000.0 } else { freq }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARRAY_FORM: &str = r#"[
        {"Basic ID": {"protocol_version": "F3411.19", "id_type": "Serial Number (ANSI/CTA-2063-A)",
                      "ua_type": "Helicopter (or Multirotor)", "id": "12345678A291",
                      "MAC": "8e:3b:93:22:33:fa", "rssi": -70}},
        {"Basic ID": {"id_type": "CAA Assigned Registration ID", "ua_type": "Helicopter (or Multirotor)", "id": "HS720"}},
        {"AUX_ADV_IND": {"ts": 1.0, "aa": 2391391958, "rssi": -71, "chan": 37, "phy": 2, "event": 0}},
        {"Location/Vector Message": {"latitude": 39.73, "longitude": -105.07, "geodetic_altitude": 120.5,
                                     "height_agl": 80.0, "speed": 12.3, "vert_speed": -1.0,
                                     "timestamp": "2025-01-01T00:00:00Z"}},
        {"Self-ID Message": {"text": "Test UAV operation", "text_type": "Text Description"}},
        {"Operator ID Message": {"operator_id_type": "Operator ID", "operator_id": "Terminator0x00"}}
    ]"#;

    const BT_FORM: &str = r#"{
        "AUX_ADV_IND": {"aa": 2391391958, "addr": "DRONE101", "rssi": -60},
        "AdvData": "16FFFA0D",
        "Basic ID": [
            {"id_type": "Serial Number (ANSI/CTA-2063-A)", "ua_type": "Helicopter (or Multirotor)", "id": "654321", "MAC": "8e:3b:93:22:33:fa"},
            {"id_type": "CAA Assigned Registration ID", "id": "DJI"}
        ],
        "Location/Vector Message": {"direction": 87, "speed": "0.25 m/s", "vert_speed": "-1.0 m/s",
                                    "latitude": 39.73, "longitude": -105.07, "pressure_altitude": "Undefined",
                                    "geodetic_altitude": "64.5 m", "height_agl": "45 m"},
        "System Message": {"latitude": 39.72, "longitude": -105.06, "area_count": 1, "area_radius": 0},
        "Operator ID Message": {"operator_id": ""}
    }"#;

    const WIFI_FORM: &str = r#"{"DroneID": {"WIFI-123456": {
        "Basic ID": {"id_type": "Serial Number (ANSI/CTA-2063-A)", "id": "WIFI-123456", "rssi": -55},
        "Location/Vector Message": {"latitude": 39.73, "longitude": -105.07, "speed": "3 m/s"},
        "Self-ID Message": {"text": "WiFi Drone"}
    }}}"#;

    #[test]
    fn test_array_form() {
        let CanonicalEvent::Drone(report) = classify(ARRAY_FORM.as_bytes()).unwrap() else {
            panic!("expected drone");
        };
        assert_eq!(report.shape, PayloadShape::Bluetooth);
        assert_eq!(report.basic_ids.len(), 2);
        assert_eq!(report.identity_block().unwrap().id.as_deref(), Some("12345678A291"));
        assert_eq!(report.caa_block().unwrap().id.as_deref(), Some("HS720"));
        assert_eq!(report.aux_adv.as_ref().unwrap().channel, Some(37));
        assert_eq!(report.location.as_ref().unwrap().geodetic_altitude, Some(120.5));
        assert_eq!(report.operator_id.as_deref(), Some("Terminator0x00"));
        assert_eq!(report.self_id.as_deref(), Some("Test UAV operation"));
        assert_eq!(report.block_kinds.first().map(String::as_str), Some(BASIC_ID));
    }

    #[test]
    fn test_bluetooth_form_with_unit_strings() {
        let CanonicalEvent::Drone(report) = classify(BT_FORM.as_bytes()).unwrap() else {
            panic!("expected drone");
        };
        let loc = report.location.unwrap();
        assert_eq!(loc.speed, Some(0.25));
        assert_eq!(loc.vert_speed, Some(-1.0));
        assert_eq!(loc.geodetic_altitude, Some(64.5));
        assert_eq!(loc.pressure_altitude, None);
        assert_eq!(report.aux_adv.unwrap().addr.as_deref(), Some("DRONE101"));
        assert!(report.operator_id.is_none());
        assert_eq!(
            report.system.unwrap().operator_location(),
            Some(Coordinate::new(39.72, -105.06))
        );
    }

    #[test]
    fn test_wifi_wrapper() {
        let CanonicalEvent::Drone(report) = classify(WIFI_FORM.as_bytes()).unwrap() else {
            panic!("expected drone");
        };
        assert_eq!(report.shape, PayloadShape::Wifi);
        assert_eq!(report.mac.as_deref(), Some("WIFI-123456"));
        assert_eq!(report.location.unwrap().speed, Some(3.0));
    }

    #[test]
    fn test_esp32_is_wifi() {
        let esp = r#"{"index": 57, "runtime": 11,
            "Basic ID": {"id": "112624150A90E3AE1EC0", "id_type": "Serial Number (ANSI/CTA-2063-A)", "ua_type": 0, "MAC": "8c:17:59:f5:95:65", "RSSI": -50},
            "Location/Vector Message": {"latitude": 39.73, "longitude": -105.07, "speed": 0, "vert_speed": 0, "geodetic_altitude": 110, "height_agl": 80},
            "System Message": {"latitude": 39.73, "longitude": -105.07, "home_lat": 39.7301, "home_lon": -105.0701}}"#;
        let CanonicalEvent::Drone(report) = classify(esp.as_bytes()).unwrap() else {
            panic!("expected drone");
        };
        assert_eq!(report.shape, PayloadShape::Wifi);
        let basic = report.identity_block().unwrap();
        assert_eq!(basic.ua_type, Some(UaTypeField::Code(0)));
        assert_eq!(basic.rssi, Some(-50.0));
        assert_eq!(report.enrichment.index, Some(57.0));
    }

    #[test]
    fn test_fpv_detection() {
        let msg = r#"[{"FPV Detection": {"timestamp": "2025-05-01T14:22:33.123Z", "manufacturer": "01",
            "device_type": "FPV5805MHz", "frequency": 5805, "bandwidth": "20MHz", "signal_strength": 1300,
            "detection_source": "01-97e8", "status": "NEW CONTACT LOCK", "estimated_distance": 250.0}}]"#;
        let CanonicalEvent::Fpv(fpv) = classify(msg.as_bytes()).unwrap() else {
            panic!("expected fpv");
        };
        assert_eq!(fpv.source, "01-97e8");
        assert_eq!(fpv.frequency_mhz, 5805.0);
        assert_eq!(fpv.rssi, 1300.0);
        assert_eq!(fpv.estimated_distance, Some(250.0));
        assert_eq!(fpv.synthetic_id(), "fpv-01-97e8-5805");
    }

    #[test]
    fn test_fpv_lock_update() {
        let msg = r#"{"AUX_ADV_IND": {"rssi": 1290.5, "aa": 2391391958, "time": "x"},
            "aext": {"AdvA": "01-97e8 random"}, "AdvData": "020116faff0d01",
            "location": {"lat": 0.0, "lon": 0.0}, "distance": 155.0, "frequency": 5805}"#;
        let CanonicalEvent::Fpv(fpv) = classify(msg.as_bytes()).unwrap() else {
            panic!("expected fpv");
        };
        assert_eq!(fpv.source, "01-97e8");
        assert_eq!(fpv.rssi, 1290.5);
        assert_eq!(fpv.estimated_distance, Some(155.0));
    }

    #[test]
    fn test_advertisement_with_freq_and_location_is_drone() {
        let msg = r#"[{"AUX_ADV_IND": {"rssi": -61, "aa": 2391391958, "chan": 37}},
            {"aext": {"AdvA": "e0:4e:7a:9a:67:99 random"}},
            {"Location/Vector Message": {"latitude": 37.25, "longitude": -115.8, "geodetic_altitude": 90.0}},
            {"freq": 5800000000.0, "seen_by": "wardragon-101"}]"#;
        let CanonicalEvent::Drone(report) = classify(msg.as_bytes()).unwrap() else {
            panic!("expected drone");
        };
        assert_eq!(report.shape, PayloadShape::Bluetooth);
        assert_eq!(report.location.unwrap().latitude, Some(37.25));
        assert_eq!(report.enrichment.freq, Some(5800000000.0));
        assert_eq!(report.enrichment.seen_by.as_deref(), Some("wardragon-101"));
    }

    #[test]
    fn test_status_json() {
        let msg = r#"{"serial_number": "wardragon-101", "timestamp": 1.0,
            "gps_data": {"latitude": 37.25, "longitude": -115.75, "altitude": 50.0, "speed": 0.0, "track": 0.0},
            "system_stats": {"cpu_usage": 12.5, "memory": {"total": 8.0, "available": 4.0}, "temperature": 44.0, "uptime": 100},
            "ant_sdr_temps": {"pluto_temp": 50.0, "zynq_temp": 45.0}}"#;
        let CanonicalEvent::Status(status) = classify(msg.as_bytes()).unwrap() else {
            panic!("expected status");
        };
        assert_eq!(status.serial, "wardragon-101");
        assert_eq!(status.location, Some(Coordinate::new(37.25, -115.75)));
        assert_eq!(status.memory_available, Some(4.0));
        assert_eq!(status.zynq_temp, Some(45.0));
    }

    #[test]
    fn test_topic_prefix_stripped() {
        let msg = format!("DroneID {}", WIFI_FORM);
        assert!(matches!(classify(msg.as_bytes()), Ok(CanonicalEvent::Drone(_))));
    }

    #[test]
    fn test_unrecognized_and_invalid() {
        assert!(matches!(
            classify(br#"{"hello": "world"}"#),
            Err(NormalizeError::Unrecognized)
        ));
        assert!(matches!(classify(b"{not json"), Err(NormalizeError::Json(_))));
        assert!(matches!(classify(&[0xff, 0xfe]), Err(NormalizeError::Utf8(_))));
    }

    #[test]
    fn test_cot_payload() {
        let xml = r#"<event version="2.0" uid="drone-7" type="a-u-A-M-H-R"><point lat="1.0" lon="2.0" hae="3.0"/></event>"#;
        assert!(matches!(classify(xml.as_bytes()), Ok(CanonicalEvent::Drone(_))));
    }
}
