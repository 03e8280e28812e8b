//! Canonical events
//!
//!  Every transport converges on `CanonicalEvent`. Drone telemetry keeps the
//!  vendor blocks it arrived with, typed but unresolved; picking which block
//!  wins for identity, MAC or RSSI is the signature generator's job.

use std::collections::BTreeMap;

use crate::aircraft::AircraftReport;
use crate::physics::Coordinate;

/// Result of classifying and converting one inbound payload
#[derive(Debug, Clone)]
pub enum CanonicalEvent {
    /// Remote-ID telemetry (JSON or CoT)
    Drone(DroneReport),
    /// Listening station status
    Status(MonitorStatus),
    /// Physical-layer-only video link detection
    Fpv(FpvDetection),
    /// Operator or home point published as its own CoT event
    Companion(CompanionUpdate),
    /// One poll of the ADS-B aggregator
    Aircraft(Vec<AircraftReport>),
}

/// How the payload looked on the wire, used as the transmission type hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadShape {
    Bluetooth,
    Wifi,
    Sdr,
    #[default]
    Unknown,
}

/// UA type as transmitted: ASTM code or free text
#[derive(Debug, Clone, PartialEq)]
pub enum UaTypeField {
    Code(i64),
    Name(String),
}

/// One "Basic ID" block
#[derive(Debug, Clone, Default)]
pub struct BasicIdBlock {
    pub id: Option<String>,
    pub id_type: Option<String>,
    pub ua_type: Option<UaTypeField>,
    pub protocol_version: Option<String>,
    pub mac: Option<String>,
    pub rssi: Option<f64>,
}

impl BasicIdBlock {
    /// CAA registrations ride in a Basic ID block but are not an aircraft identity.
    pub fn is_caa_registration(&self) -> bool {
        self.id_type
            .as_deref()
            .is_some_and(|t| t.to_ascii_uppercase().contains("CAA"))
    }
}

/// "Location/Vector Message" block
#[derive(Debug, Clone, Default)]
pub struct LocationBlock {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub geodetic_altitude: Option<f64>,
    pub pressure_altitude: Option<f64>,
    pub height_agl: Option<f64>,
    pub height_type: Option<String>,
    pub speed: Option<f64>,
    pub vert_speed: Option<f64>,
    pub direction: Option<f64>,
    pub op_status: Option<String>,
}

/// "System Message" block
#[derive(Debug, Clone, Default)]
pub struct SystemBlock {
    pub operator_lat: Option<f64>,
    pub operator_lon: Option<f64>,
    /// Some encoders put the operator position in plain latitude/longitude
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub home_lat: Option<f64>,
    pub home_lon: Option<f64>,
    pub operator_alt_geo: Option<f64>,
    pub area_count: Option<f64>,
    pub area_radius: Option<f64>,
    pub area_ceiling: Option<f64>,
    pub area_floor: Option<f64>,
    pub classification: Option<String>,
}

impl SystemBlock {
    pub fn operator_location(&self) -> Option<Coordinate> {
        coordinate(self.operator_lat, self.operator_lon)
            .or_else(|| coordinate(self.latitude, self.longitude))
    }

    pub fn home_location(&self) -> Option<Coordinate> {
        coordinate(self.home_lat, self.home_lon)
    }
}

/// "AUX_ADV_IND" block: the Bluetooth auxiliary advertisement
#[derive(Debug, Clone, Default)]
pub struct AuxAdvertisement {
    pub rssi: Option<f64>,
    pub addr: Option<String>,
    pub access_address: Option<u64>,
    pub channel: Option<u32>,
    pub phy: Option<u32>,
}

/// "aext" block: extended advertisement header
#[derive(Debug, Clone, Default)]
pub struct AuxExtended {
    pub adv_address: Option<String>,
    pub adv_mode: Option<String>,
}

/// Backend enrichment carried next to the protocol blocks
#[derive(Debug, Clone, Default)]
pub struct Enrichment {
    pub freq: Option<f64>,
    pub seen_by: Option<String>,
    pub observed_at: Option<f64>,
    pub rid_make: Option<String>,
    pub rid_model: Option<String>,
    pub rid_source: Option<String>,
    pub index: Option<f64>,
    pub runtime: Option<f64>,
}

/// Drone telemetry in canonical form
#[derive(Debug, Clone, Default)]
pub struct DroneReport {
    pub shape: PayloadShape,
    /// Generic id field (CoT uid, top-level "id")
    pub uid: Option<String>,
    pub basic_ids: Vec<BasicIdBlock>,
    pub location: Option<LocationBlock>,
    pub system: Option<SystemBlock>,
    pub self_id: Option<String>,
    pub operator_id: Option<String>,
    pub aux_adv: Option<AuxAdvertisement>,
    pub aux_ext: Option<AuxExtended>,
    /// MAC given outside any block
    pub mac: Option<String>,
    /// RSSI given outside any block
    pub rssi: Option<f64>,
    /// Registration given outside any block
    pub caa_registration: Option<String>,
    /// Block kinds in arrival order
    pub block_kinds: Vec<String>,
    pub enrichment: Enrichment,
}

impl DroneReport {
    pub fn identity_block(&self) -> Option<&BasicIdBlock> {
        self.basic_ids
            .iter()
            .find(|b| !b.is_caa_registration() && b.id.as_deref().is_some_and(|id| !id.is_empty()))
    }

    pub fn caa_block(&self) -> Option<&BasicIdBlock> {
        self.basic_ids.iter().find(|b| b.is_caa_registration())
    }
}

/// Status of the listening station
#[derive(Debug, Clone, Default)]
pub struct MonitorStatus {
    pub serial: String,
    pub location: Option<Coordinate>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub track: Option<f64>,
    pub cpu_usage: Option<f64>,
    pub memory_available: Option<f64>,
    pub temperature: Option<f64>,
    pub uptime: Option<f64>,
    pub pluto_temp: Option<f64>,
    pub zynq_temp: Option<f64>,
}

/// Video-link detection without any protocol identity
#[derive(Debug, Clone, Default)]
pub struct FpvDetection {
    pub source: String,
    pub frequency_mhz: f64,
    /// Raw detector units, not dBm
    pub rssi: f64,
    pub estimated_distance: Option<f64>,
    pub device_type: Option<String>,
    pub bandwidth: Option<String>,
    pub status: Option<String>,
}

impl FpvDetection {
    /// Synthetic identity: detector source plus frequency
    pub fn synthetic_id(&self) -> String {
        format!("fpv-{}-{:.0}", self.source, self.frequency_mhz)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanionRole {
    Operator,
    Home,
}

/// Operator or home position of a drone published separately
#[derive(Debug, Clone)]
pub struct CompanionUpdate {
    pub drone_id: String,
    pub role: CompanionRole,
    pub location: Coordinate,
    pub altitude: Option<f64>,
}

/// String metadata map attached to a transmission
pub type Metadata = BTreeMap<String, String>;

fn coordinate(lat: Option<f64>, lon: Option<f64>) -> Option<Coordinate> {
    match (lat, lon) {
        (Some(lat), Some(lon)) => {
            let c = Coordinate::new(lat, lon);
            c.is_valid().then_some(c)
        }
        _ => None,
    }
}
