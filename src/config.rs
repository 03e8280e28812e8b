//! Configuration and command-line argument parsing

use std::env;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::physics::Coordinate;
use crate::ratelimit::{RateLimitSettings, Strategy};

#[derive(Debug, Clone)]
pub struct Config {
    // Multicast CoT
    pub multicast: bool,
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,

    // ZMQ bus
    pub zmq: bool,
    pub zmq_telemetry: String,
    pub zmq_status: String,

    // ADS-B
    /// aircraft.json URL; polling is off without one
    pub adsb_url: Option<String>,
    /// Seconds between polls
    pub adsb_interval: u64,
    /// Seconds
    pub http_timeout: u64,

    // Monitor position used until a status message supplies one
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,

    // Outbound limits
    /// Seconds between MQTT publishes
    pub mqtt_interval: f64,
    /// Seconds between TAK sends
    pub tak_interval: f64,
    pub webhook_per_minute: u32,
    /// Rolling window in seconds for the webhook cap
    pub webhook_period: u64,
    /// Seconds between publications for one drone
    pub drone_interval: f64,
    pub mqtt_topic: String,

    // Processing
    pub foreground_interval_ms: u64,
    pub background_interval_ms: u64,
    pub start_background: bool,
    pub max_reconnects: u32,

    // Output
    pub log_events: bool,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            multicast: true,
            multicast_group: Ipv4Addr::new(224, 0, 0, 1),
            multicast_port: 6969,
            zmq: true,
            zmq_telemetry: "tcp://127.0.0.1:4224".to_string(),
            zmq_status: "tcp://127.0.0.1:4225".to_string(),
            adsb_url: None,
            adsb_interval: 5,
            http_timeout: 10,
            lat: None,
            lon: None,
            alt: None,
            mqtt_interval: 1.0,
            tak_interval: 1.0,
            webhook_per_minute: 20,
            webhook_period: 60,
            drone_interval: 0.5,
            mqtt_topic: "wardragon".to_string(),
            foreground_interval_ms: 50,
            background_interval_ms: 1000,
            start_background: false,
            max_reconnects: 5,
            log_events: false,
            verbose: false,
        }
    }
}

impl Config {
    pub fn from_args() -> Self {
        let args: Vec<String> = env::args().skip(1).collect();
        match Self::parse(&args) {
            Ok(config) => config,
            Err(ParseOutcome::Help) => {
                print_help();
                std::process::exit(0);
            }
            Err(ParseOutcome::Unknown(arg)) => {
                eprintln!("Unknown option: {}", arg);
                print_help();
                std::process::exit(1);
            }
        }
    }

    fn parse(args: &[String]) -> Result<Self, ParseOutcome> {
        let mut config = Config::default();
        let defaults = Config::default();

        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let mut value = || iter.next().map(String::as_str);
            match arg.as_str() {
                "--multicast-group" => {
                    config.multicast_group = value()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(defaults.multicast_group)
                }
                "--multicast-port" => {
                    config.multicast_port = value()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(defaults.multicast_port)
                }
                "--no-multicast" => config.multicast = false,
                "--zmq-telemetry" => {
                    if let Some(v) = value() {
                        config.zmq_telemetry = v.to_string();
                    }
                }
                "--zmq-status" => {
                    if let Some(v) = value() {
                        config.zmq_status = v.to_string();
                    }
                }
                "--no-zmq" => config.zmq = false,
                "--adsb-url" => config.adsb_url = value().map(str::to_string),
                "--adsb-interval" => {
                    config.adsb_interval = value()
                        .and_then(|s| s.parse().ok())
                        .filter(|s| *s > 0)
                        .unwrap_or(defaults.adsb_interval)
                }
                "--http-timeout" => {
                    config.http_timeout = value()
                        .and_then(|s| s.parse().ok())
                        .filter(|s| *s > 0)
                        .unwrap_or(defaults.http_timeout)
                }
                "--lat" => config.lat = value().and_then(|s| s.parse().ok()),
                "--lon" => config.lon = value().and_then(|s| s.parse().ok()),
                "--alt" => config.alt = value().and_then(|s| s.parse().ok()),
                "--mqtt-interval" => {
                    config.mqtt_interval = value()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(defaults.mqtt_interval)
                }
                "--tak-interval" => {
                    config.tak_interval = value()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(defaults.tak_interval)
                }
                "--webhook-per-minute" => {
                    config.webhook_per_minute = value()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(defaults.webhook_per_minute)
                }
                "--webhook-period" => {
                    config.webhook_period = value()
                        .and_then(|s| s.parse().ok())
                        .filter(|s| *s > 0)
                        .unwrap_or(defaults.webhook_period)
                }
                "--drone-interval" => {
                    config.drone_interval = value()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(defaults.drone_interval)
                }
                "--mqtt-topic" => {
                    if let Some(v) = value() {
                        config.mqtt_topic = v.to_string();
                    }
                }
                "--foreground-interval-ms" => {
                    config.foreground_interval_ms = value()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(defaults.foreground_interval_ms)
                }
                "--background-interval-ms" => {
                    config.background_interval_ms = value()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(defaults.background_interval_ms)
                }
                "--max-reconnects" => {
                    config.max_reconnects = value()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(defaults.max_reconnects)
                }
                "--background" => config.start_background = true,
                "--log-events" => config.log_events = true,
                "--verbose" => config.verbose = true,
                "--help" | "-h" => return Err(ParseOutcome::Help),
                other => return Err(ParseOutcome::Unknown(other.to_string())),
            }
        }

        Ok(config)
    }

    /// Static monitor position, when both coordinates were given
    pub fn monitor_location(&self) -> Option<Coordinate> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some(Coordinate::new(lat, lon)).filter(|c| c.is_valid()),
            _ => None,
        }
    }

    pub fn rate_limits(&self) -> RateLimitSettings {
        let defaults = RateLimitSettings::default();
        let interval = |secs: f64, fallback: Strategy| {
            Duration::try_from_secs_f64(secs).map_or(fallback, Strategy::Interval)
        };
        RateLimitSettings {
            mqtt: interval(self.mqtt_interval, defaults.mqtt),
            tak: interval(self.tak_interval, defaults.tak),
            webhook: match self.webhook_period {
                60 => Strategy::PerMinute(self.webhook_per_minute),
                secs => Strategy::Burst {
                    max: self.webhook_per_minute,
                    period: Duration::from_secs(secs),
                },
            },
            per_drone: interval(self.drone_interval, defaults.per_drone),
            ..defaults
        }
    }
}

#[derive(Debug, PartialEq)]
enum ParseOutcome {
    Help,
    Unknown(String),
}

fn print_help() {
    println!(
        r#"rid-sentry - Remote ID and ADS-B detection, correlation and spoof checking

Usage: rid-sentry [OPTIONS]

Options:
  --multicast-group <ip>        CoT multicast group (default: 224.0.0.1)
  --multicast-port <port>       CoT multicast port (default: 6969)
  --no-multicast                Do not listen for CoT multicast
  --zmq-telemetry <endpoint>    ZMQ telemetry publisher (default: tcp://127.0.0.1:4224)
  --zmq-status <endpoint>       ZMQ status publisher (default: tcp://127.0.0.1:4225)
  --no-zmq                      Do not subscribe to ZMQ
  --adsb-url <url>              Poll this aircraft.json for ADS-B traffic
  --adsb-interval <s>           Seconds between ADS-B polls (default: 5)
  --http-timeout <s>            HTTP request timeout (default: 10)
  --lat <degrees>               Monitor latitude until a status message arrives
  --lon <degrees>               Monitor longitude until a status message arrives
  --alt <meters>                Monitor altitude
  --mqtt-interval <s>           Minimum seconds between MQTT publishes (default: 1)
  --tak-interval <s>            Minimum seconds between TAK sends (default: 1)
  --webhook-per-minute <N>      Webhook calls allowed per window (default: 20)
  --webhook-period <s>          Window for the webhook cap (default: 60)
  --drone-interval <s>          Minimum seconds between updates per drone (default: 0.5)
  --mqtt-topic <topic>          Base MQTT topic (default: wardragon)
  --foreground-interval-ms <N>  Minimum gap between processed messages (default: 50)
  --background-interval-ms <N>  Same, while backgrounded (default: 1000)
  --background                  Start in background mode
  --max-reconnects <N>          Consecutive listener failures before giving up (default: 5)
  --log-events                  Log every outbound event at INFO
  --verbose                     Debug logging
  --help                        Show this help

Signals:
  SIGUSR1                       Switch to background processing
  SIGUSR2                       Return to foreground and replay buffered messages
"#
    );
}
