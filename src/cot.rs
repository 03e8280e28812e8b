//! Cursor-on-Target XML
//!
//!  Reads the handful of elements the detection kits emit (`event`, `point`,
//!  `track`, `contact`, `remarks`) and writes events for TAK consumers.
//!  This is not a general XML parser.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;

use crate::error::NormalizeError;
use crate::event::{
    BasicIdBlock, CanonicalEvent, CompanionRole, CompanionUpdate, DroneReport, Enrichment,
    LocationBlock, MonitorStatus, PayloadShape, SystemBlock, UaTypeField,
};
use crate::physics::Coordinate;
use crate::sink::EventDict;

/// CoT type prefix used by listening stations for their own status
const STATUS_TYPE_PREFIX: &str = "a-f-G-E-S";
/// Minutes until a published event goes stale
const STALE_MINUTES: i64 = 5;

/// The parts of a CoT event this system reads
#[derive(Debug, Clone, Default)]
pub struct CotEvent {
    pub uid: String,
    pub event_type: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub hae: Option<f64>,
    pub course: Option<f64>,
    pub speed: Option<f64>,
    pub callsign: Option<String>,
    pub remarks: String,
}

/// Parse a CoT `<event>` document
pub fn parse(xml: &str) -> Result<CotEvent, NormalizeError> {
    let event = find_tag(xml, "event").ok_or(NormalizeError::Xml("no <event> element"))?;
    let uid = attr(event, "uid").ok_or(NormalizeError::Xml("event without uid"))?;
    let event_type = attr(event, "type").unwrap_or_default();

    let mut cot = CotEvent {
        uid,
        event_type,
        ..Default::default()
    };

    if let Some(point) = find_tag(xml, "point") {
        cot.lat = attr(point, "lat").and_then(|v| v.parse().ok());
        cot.lon = attr(point, "lon").and_then(|v| v.parse().ok());
        cot.hae = attr(point, "hae").and_then(|v| v.parse().ok());
    }
    if let Some(track) = find_tag(xml, "track") {
        cot.course = attr(track, "course").and_then(|v| v.parse().ok());
        cot.speed = attr(track, "speed").and_then(|v| v.parse().ok());
    }
    if let Some(contact) = find_tag(xml, "contact") {
        cot.callsign = attr(contact, "callsign").filter(|c| !c.is_empty());
    }
    cot.remarks = element_text(xml, "remarks").map(unescape).unwrap_or_default();

    Ok(cot)
}

/// Convert a parsed CoT event into the canonical representation
pub fn to_canonical(cot: CotEvent) -> CanonicalEvent {
    if cot.event_type.starts_with(STATUS_TYPE_PREFIX) {
        return CanonicalEvent::Status(status_from_cot(&cot));
    }

    let location = match (cot.lat, cot.lon) {
        (Some(lat), Some(lon)) => Some(Coordinate::new(lat, lon)),
        _ => None,
    };

    for (prefix, role) in [("pilot-", CompanionRole::Operator), ("home-", CompanionRole::Home)] {
        if let Some(drone_id) = cot.uid.strip_prefix(prefix) {
            if let Some(location) = location.filter(|c| c.is_valid()) {
                return CanonicalEvent::Companion(CompanionUpdate {
                    drone_id: drone_id.to_string(),
                    role,
                    location,
                    altitude: cot.hae,
                });
            }
        }
    }

    CanonicalEvent::Drone(drone_from_cot(cot))
}

fn drone_from_cot(cot: CotEvent) -> DroneReport {
    let r = cot.remarks.as_str();
    let id = cot.uid.strip_prefix("drone-").unwrap_or(&cot.uid).to_string();

    let ua_type = remark(r, "UA Type").map(|t| match paren_code(t) {
        Some(code) => UaTypeField::Code(code),
        None => UaTypeField::Name(t.to_string()),
    });

    let basic = BasicIdBlock {
        id: Some(id),
        id_type: remark(r, "ID Type").map(str::to_string),
        ua_type,
        protocol_version: None,
        mac: remark(r, "MAC").map(str::to_string),
        rssi: remark_number(r, "RSSI"),
    };

    let location = LocationBlock {
        latitude: cot.lat,
        longitude: cot.lon,
        geodetic_altitude: remark_number(r, "Geodetic Altitude")
            .or_else(|| remark_number(r, "Altitude"))
            .or(cot.hae),
        height_agl: remark_number(r, "Height AGL").or_else(|| remark_number(r, "AGL")),
        speed: remark_number(r, "Speed").or(cot.speed),
        vert_speed: remark_number(r, "Vert Speed"),
        direction: remark_number(r, "Direction").or(cot.course),
        ..Default::default()
    };

    let system = SystemBlock {
        operator_lat: remark_number(r, "Operator Lat"),
        operator_lon: remark_number(r, "Operator Lon"),
        home_lat: remark_number(r, "Home Lat"),
        home_lon: remark_number(r, "Home Lon"),
        ..Default::default()
    };

    let (rid_make, rid_model, rid_source) = remark(r, "RID").map(split_rid).unwrap_or_default();

    DroneReport {
        shape: if remark(r, "Freq").is_some() { PayloadShape::Sdr } else { PayloadShape::Unknown },
        uid: Some(cot.uid.clone()),
        basic_ids: vec![basic],
        location: Some(location),
        system: Some(system),
        self_id: remark(r, "Self-ID").map(str::to_string),
        operator_id: remark(r, "Operator ID").map(str::to_string),
        caa_registration: remark(r, "CAA").map(str::to_string),
        block_kinds: vec!["CoT".to_string()],
        enrichment: Enrichment {
            freq: remark_number(r, "Freq"),
            seen_by: remark(r, "Seen By").map(str::to_string),
            observed_at: remark_number(r, "Observed At"),
            rid_make,
            rid_model,
            rid_source,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn status_from_cot(cot: &CotEvent) -> MonitorStatus {
    let r = cot.remarks.as_str();
    MonitorStatus {
        serial: cot.callsign.clone().unwrap_or_else(|| cot.uid.clone()),
        location: match (cot.lat, cot.lon) {
            (Some(lat), Some(lon)) => Some(Coordinate::new(lat, lon)),
            _ => None,
        },
        altitude: cot.hae,
        speed: cot.speed,
        track: cot.course,
        cpu_usage: remark_number(r, "CPU Usage"),
        memory_available: remark_number(r, "Memory Available"),
        temperature: remark_number(r, "Temperature"),
        uptime: remark_number(r, "Uptime"),
        pluto_temp: remark_number(r, "Pluto Temp"),
        zynq_temp: remark_number(r, "Zynq Temp"),
    }
}

/// Build a CoT event from a canonical event dictionary
pub fn format_event(dict: &EventDict, now: DateTime<Utc>) -> String {
    let text = |key: &str| dict.get(key).and_then(Value::as_str).unwrap_or("");
    let num = |key: &str| dict.get(key).and_then(Value::as_f64);

    let uid = text("uid");
    let event_type = text("type");
    let time = now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
    let stale = (now + ChronoDuration::minutes(STALE_MINUTES))
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string();

    let mut remarks = Vec::new();
    if let Some(mac) = dict.get("mac").and_then(Value::as_str) {
        remarks.push(format!("MAC: {}", mac));
    }
    if let Some(rssi) = num("rssi") {
        remarks.push(format!("RSSI: {:.0}dBm", rssi));
    }
    if let Some(desc) = dict.get("description").and_then(Value::as_str) {
        remarks.push(format!("Self-ID: {}", desc));
    }
    if dict.get("isSpoofed").and_then(Value::as_bool) == Some(true) {
        remarks.push("Spoof suspected".to_string());
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<event version="2.0" uid="{uid}" type="{ty}" time="{time}" start="{time}" stale="{stale}" how="m-g">
    <point lat="{lat:.6}" lon="{lon:.6}" hae="{alt:.1}" ce="35.0" le="999999"/>
    <detail>
        <contact callsign="{uid}"/>
        <track course="{course:.1}" speed="{speed:.1}"/>
        <remarks>{remarks}</remarks>
    </detail>
</event>"#,
        uid = escape(uid),
        ty = escape(event_type),
        lat = num("lat").unwrap_or(0.0),
        lon = num("lon").unwrap_or(0.0),
        alt = num("alt").unwrap_or(0.0),
        course = num("heading").unwrap_or(0.0),
        speed = num("speed").unwrap_or(0.0),
        remarks = escape(&remarks.join(", ")),
    )
}

/// Attribute section of the first `<name ...>` tag
fn find_tag<'a>(xml: &'a str, name: &str) -> Option<&'a str> {
    find_tag_span(xml, name).map(|(start, end)| &xml[start..end])
}

/// Byte range of the attribute section of the first `<name ...>` tag
fn find_tag_span(xml: &str, name: &str) -> Option<(usize, usize)> {
    let open = format!("<{}", name);
    let mut from = 0;
    while let Some(pos) = xml[from..].find(&open) {
        let start = from + pos + open.len();
        let rest = &xml[start..];
        match rest.chars().next() {
            Some(c) if c.is_whitespace() || c == '>' || c == '/' => {
                let end = rest.find('>')?;
                return Some((start, start + end));
            }
            _ => from = start,
        }
    }
    None
}

fn attr(tag: &str, name: &str) -> Option<String> {
    let mut from = 0;
    while let Some(pos) = tag[from..].find(name) {
        let start = from + pos;
        let preceded_by_space = start == 0
            || tag[..start]
                .chars()
                .next_back()
                .is_some_and(char::is_whitespace);
        let rest = tag[start + name.len()..].trim_start();
        if preceded_by_space {
            if let Some(rest) = rest.strip_prefix('=') {
                let rest = rest.trim_start();
                let quote = rest.chars().next().filter(|q| *q == '"' || *q == '\'')?;
                let body = &rest[1..];
                let end = body.find(quote)?;
                return Some(unescape(&body[..end]));
            }
        }
        from = start + name.len();
    }
    None
}

fn element_text<'a>(xml: &'a str, name: &str) -> Option<&'a str> {
    let (start, end) = find_tag_span(xml, name)?;
    if xml[start..end].ends_with('/') {
        return Some("");
    }
    let body = end + 1;
    let close = format!("</{}>", name);
    let len = xml[body..].find(&close)?;
    Some(xml[body..body + len].trim())
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Value of a `Label: value` pair inside free-form remarks.
///
/// Labels only match at the start of a field, so "Speed" does not match
/// inside "Vert Speed".
pub fn remark<'a>(remarks: &'a str, label: &str) -> Option<&'a str> {
    let needle = format!("{}:", label);
    let mut from = 0;
    while let Some(pos) = remarks[from..].find(&needle) {
        let start = from + pos;
        let before = remarks[..start].trim_end();
        let at_field_start = before.is_empty() || before.ends_with([',', ';', '[']);
        if at_field_start {
            let rest = &remarks[start + needle.len()..];
            let end = rest.find([',', ';', ']']).unwrap_or(rest.len());
            let value = rest[..end].trim();
            return (!value.is_empty()).then_some(value);
        }
        from = start + needle.len();
    }
    None
}

fn remark_number(remarks: &str, label: &str) -> Option<f64> {
    remark(remarks, label).and_then(leading_number)
}

/// Leading numeric part of strings like "-62dBm" or "12.5 m/s"
pub fn leading_number(s: &str) -> Option<f64> {
    let s = s.trim();
    let end = s
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || ((*c == '-' || *c == '+') && *i == 0)))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    s[..end].parse().ok()
}

/// "Helicopter or Multirotor (2)" -> 2
fn paren_code(s: &str) -> Option<i64> {
    let open = s.rfind('(')?;
    let close = s[open..].find(')')? + open;
    s[open + 1..close].trim().parse().ok()
}

/// "DJI Mavic 3 (FAA)" -> make, model, source
fn split_rid(s: &str) -> (Option<String>, Option<String>, Option<String>) {
    let (body, source) = match s.rfind('(') {
        Some(open) => (
            s[..open].trim(),
            Some(s[open + 1..].trim_end_matches(')').trim().to_string()),
        ),
        None => (s.trim(), None),
    };
    let mut parts = body.splitn(2, ' ');
    let make = parts.next().filter(|m| !m.is_empty()).map(str::to_string);
    let model = parts.next().map(|m| m.trim().to_string());
    (make, model, source)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DRONE: &str = r#"<?xml version='1.0' encoding='UTF-8'?>
<event version="2.0" uid="drone-112624150A90E3AE1EC0" type="a-u-A-M-H-R" time="2025-01-01T00:00:00.000Z" start="2025-01-01T00:00:00.000Z" stale="2025-01-01T00:10:00.000Z" how="m-g">
    <point lat="37.250000" lon="-115.750000" hae="310.5" ce="35.0" le="999999"/>
    <detail>
        <contact callsign="112624150A90E3AE1EC0"/>
        <track course="87.0" speed="14.2"/>
        <remarks>MAC: E0:4E:7A:9A:67:99, RSSI: -62dBm; ID Type: Serial Number (ANSI/CTA-2063-A); UA Type: Helicopter or Multirotor (2); Operator ID: TestOperator; Speed: 14.2 m/s; Vert Speed: -1.5 m/s; Altitude: 310.5 m; AGL: 210.5 m; Freq: 5800000000.0 Hz; Seen By: wardragon-101; RID: DJI Mavic 3 (FAA)</remarks>
    </detail>
</event>"#;

    const LEGACY: &str = r#"<event version="2.0" uid="drone-100" type="a-f-G-U-C" how="m-g">
        <point lat="39.729" lon="-105.07" hae="300.0" ce="35.0" le="999999"/>
        <detail>
            <remarks>MAC: E0:4E:7A:9A:67:99, RSSI: -45dBm, Self-ID: DJI 100, Location/Vector: [Speed: 15.0 m/s, Vert Speed: 2.5 m/s, Geodetic Altitude: 300.0 m, Height AGL: 200.0 m], System: [Operator Lat: 39.728, Operator Lon: -105.069, Home Lat: 39.7291, Home Lon: -105.0708]</remarks>
        </detail>
    </event>"#;

    #[test]
    fn test_parse_drone_event() {
        let cot = parse(DRONE).unwrap();
        assert_eq!(cot.uid, "drone-112624150A90E3AE1EC0");
        assert_eq!(cot.lat, Some(37.25));
        assert_eq!(cot.course, Some(87.0));

        let CanonicalEvent::Drone(report) = to_canonical(cot) else {
            panic!("expected drone report");
        };
        let basic = report.identity_block().unwrap();
        assert_eq!(basic.id.as_deref(), Some("112624150A90E3AE1EC0"));
        assert_eq!(basic.mac.as_deref(), Some("E0:4E:7A:9A:67:99"));
        assert_eq!(basic.rssi, Some(-62.0));
        assert_eq!(basic.ua_type, Some(UaTypeField::Code(2)));
        let loc = report.location.unwrap();
        assert_eq!(loc.speed, Some(14.2));
        assert_eq!(loc.vert_speed, Some(-1.5));
        assert_eq!(loc.height_agl, Some(210.5));
        assert_eq!(report.operator_id.as_deref(), Some("TestOperator"));
        assert_eq!(report.enrichment.rid_make.as_deref(), Some("DJI"));
        assert_eq!(report.enrichment.rid_source.as_deref(), Some("FAA"));
        assert_eq!(report.shape, PayloadShape::Sdr);
    }

    #[test]
    fn test_parse_legacy_remarks() {
        let CanonicalEvent::Drone(report) = to_canonical(parse(LEGACY).unwrap()) else {
            panic!("expected drone report");
        };
        let loc = report.location.unwrap();
        assert_eq!(loc.speed, Some(15.0));
        assert_eq!(loc.geodetic_altitude, Some(300.0));
        assert_eq!(loc.height_agl, Some(200.0));
        let sys = report.system.unwrap();
        assert_eq!(sys.operator_location(), Some(Coordinate::new(39.728, -105.069)));
        assert_eq!(sys.home_location(), Some(Coordinate::new(39.7291, -105.0708)));
        assert_eq!(report.self_id.as_deref(), Some("DJI 100"));
    }

    #[test]
    fn test_companion_and_status() {
        let pilot = r#"<event uid="pilot-ABC" type="b-m-p-s-m"><point lat="37.1" lon="-115.1" hae="50"/></event>"#;
        match to_canonical(parse(pilot).unwrap()) {
            CanonicalEvent::Companion(update) => {
                assert_eq!(update.drone_id, "ABC");
                assert_eq!(update.role, CompanionRole::Operator);
            }
            other => panic!("unexpected {:?}", other),
        }

        let status = r#"<event uid="wardragon-101" type="a-f-G-E-S"><point lat="37.2" lon="-115.2" hae="50"/>
            <detail><contact endpoint="" phone="" callsign="wardragon-101"/>
            <remarks>CPU Usage: 12.5%, Temperature: 45.1°C, Uptime: 300 seconds</remarks></detail></event>"#;
        match to_canonical(parse(status).unwrap()) {
            CanonicalEvent::Status(s) => {
                assert_eq!(s.serial, "wardragon-101");
                assert_eq!(s.cpu_usage, Some(12.5));
                assert_eq!(s.uptime, Some(300.0));
                assert_eq!(s.location, Some(Coordinate::new(37.2, -115.2)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_remark_label_boundaries() {
        let r = "Vert Speed: 2.0 m/s; Speed: 9.0 m/s";
        assert_eq!(remark(r, "Speed"), Some("9.0 m/s"));
        assert_eq!(remark(r, "Vert Speed"), Some("2.0 m/s"));
        assert_eq!(remark(r, "Altitude"), None);
    }

    #[test]
    fn test_missing_event_is_error() {
        assert!(matches!(parse("<foo/>"), Err(NormalizeError::Xml(_))));
    }

    #[test]
    fn test_format_event() {
        let mut dict = EventDict::new();
        dict.insert("uid".into(), "drone-1".into());
        dict.insert("type".into(), "a-u-A-M-H-R".into());
        dict.insert("lat".into(), 37.25.into());
        dict.insert("lon".into(), (-115.75).into());
        dict.insert("mac".into(), "AA:BB".into());
        let xml = format_event(&dict, Utc::now());
        let cot = parse(&xml).unwrap();
        assert_eq!(cot.uid, "drone-1");
        assert_eq!(cot.lat, Some(37.25));
        assert_eq!(remark(&cot.remarks, "MAC"), Some("AA:BB"));
    }
}
