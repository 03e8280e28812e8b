//! Single-writer processing loop
//!
//!  Listeners feed one channel; this thread owns the correlation engine
//!  and everything else that mutates. Readers only ever see the `Snapshot`
//!  it republishes after each message.
//!
//!  In the foreground messages are paced at the foreground interval. In the
//!  background anything arriving before the background interval elapses is
//!  buffered (newest 50 kept) and replayed, paced, on resume.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, select, tick};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::aircraft::{Aircraft, AircraftStore};
use crate::alert::{AlertRing, AlertRingCalculator};
use crate::correlation::{CorrelationEngine, Ingested};
use crate::event::{CanonicalEvent, DroneReport, FpvDetection, MonitorStatus};
use crate::network::{ListenerState, RawMessage};
use crate::normalizer;
use crate::physics::Coordinate;
use crate::sink::{DispatchStats, Dispatcher, DroneUpdate};
use crate::spoof::{SpoofDetector, SpoofResult};
use crate::tracking::{PRUNE_INTERVAL, RECORD_TTL, SignalKind};

pub const BACKGROUND_BUFFER: usize = 50;
pub const REPLAY_PACING: Duration = Duration::from_millis(100);
const HOUSEKEEPING_TICK: Duration = Duration::from_secs(1);
const AIRCRAFT_TTL_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Foreground,
    Background,
}

/// Commands from the application to the processing thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Lifecycle(Lifecycle),
    Stop,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub foreground_interval: Duration,
    pub background_interval: Duration,
    pub buffer_limit: usize,
    pub replay_pacing: Duration,
    /// Station position used until a status message supplies one
    pub monitor: Option<Coordinate>,
    pub monitor_altitude: Option<f64>,
    pub lifecycle: Lifecycle,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            foreground_interval: Duration::from_millis(50),
            background_interval: Duration::from_millis(1000),
            buffer_limit: BACKGROUND_BUFFER,
            replay_pacing: REPLAY_PACING,
            monitor: None,
            monitor_altitude: None,
            lifecycle: Lifecycle::Foreground,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub received: u64,
    pub processed: u64,
    pub rejected: u64,
    pub buffered: u64,
    /// Oldest buffered messages pushed out by newer ones
    pub dropped: u64,
    pub replayed: u64,
}

#[derive(Debug, Clone)]
pub struct DroneSummary {
    pub key: String,
    pub id: String,
    pub ua_type: &'static str,
    pub position: Option<Coordinate>,
    pub altitude: f64,
    pub rssi: Option<f64>,
    pub sources: Vec<SignalKind>,
    pub registration: Option<String>,
    pub spoof: Option<SpoofResult>,
    pub observations: usize,
    pub last_update: Instant,
    /// Other tracks this one closely resembled, with match confidence
    pub resembles: Vec<(String, f64)>,
}

/// Read-only view of the pipeline state
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub drones: Vec<DroneSummary>,
    pub rings: Vec<AlertRing>,
    pub fpv: Vec<FpvDetection>,
    pub aircraft: Vec<Aircraft>,
    pub listeners: Vec<(String, ListenerState)>,
    pub monitor: Option<Coordinate>,
    pub monitor_altitude: Option<f64>,
    pub lifecycle: Option<Lifecycle>,
    /// Messages waiting for the return to the foreground
    pub backlog: usize,
    pub stats: PipelineStats,
    pub dispatch: DispatchStats,
}

pub struct Pipeline {
    settings: PipelineSettings,
    engine: CorrelationEngine,
    spoof: SpoofDetector,
    rings: AlertRingCalculator,
    fpv: HashMap<String, (FpvDetection, Instant)>,
    aircraft: AircraftStore,
    dispatcher: Dispatcher,
    status: Option<MonitorStatus>,
    spoofs: HashMap<String, SpoofResult>,
    lifecycle: Lifecycle,
    last_processed: Option<Instant>,
    backlog: VecDeque<RawMessage>,
    listeners: Vec<(String, watch::Receiver<ListenerState>)>,
    snapshot: Arc<RwLock<Snapshot>>,
    stats: PipelineStats,
    last_prune: Instant,
}

impl Pipeline {
    pub fn new(settings: PipelineSettings, dispatcher: Dispatcher) -> Self {
        Self {
            lifecycle: settings.lifecycle,
            settings,
            engine: CorrelationEngine::new(),
            spoof: SpoofDetector::new(),
            rings: AlertRingCalculator::new(),
            fpv: HashMap::new(),
            aircraft: AircraftStore::new(AIRCRAFT_TTL_SECS),
            dispatcher,
            status: None,
            spoofs: HashMap::new(),
            last_processed: None,
            backlog: VecDeque::new(),
            listeners: Vec::new(),
            snapshot: Arc::new(RwLock::new(Snapshot::default())),
            stats: PipelineStats::default(),
            last_prune: Instant::now(),
        }
    }

    /// Report these listeners' states in every snapshot
    pub fn watch_listeners(&mut self, listeners: Vec<(String, watch::Receiver<ListenerState>)>) {
        self.listeners = listeners;
    }

    pub fn snapshot_handle(&self) -> Arc<RwLock<Snapshot>> {
        Arc::clone(&self.snapshot)
    }

    pub fn engine(&self) -> &CorrelationEngine {
        &self.engine
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Newest status position, else the configured one
    pub fn station(&self) -> Option<Coordinate> {
        self.status
            .as_ref()
            .and_then(|s| s.location)
            .filter(|c| c.is_valid())
            .or(self.settings.monitor)
    }

    fn interval(&self) -> Duration {
        match self.lifecycle {
            Lifecycle::Foreground => self.settings.foreground_interval,
            Lifecycle::Background => self.settings.background_interval,
        }
    }

    /// Time still to wait before the next message may be processed
    fn remaining(&self, now: Instant) -> Duration {
        match self.last_processed {
            Some(last) => self.interval().saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }

    /// Admit one message. Returns it when it should be processed now, after
    /// the returned delay; in the background an early message is buffered.
    pub fn offer(&mut self, msg: RawMessage, now: Instant) -> Option<(RawMessage, Duration)> {
        self.stats.received += 1;
        let wait = self.remaining(now);
        match self.lifecycle {
            Lifecycle::Foreground => Some((msg, wait)),
            Lifecycle::Background if wait.is_zero() => Some((msg, wait)),
            Lifecycle::Background => {
                self.buffer(msg);
                None
            }
        }
    }

    fn buffer(&mut self, msg: RawMessage) {
        if self.backlog.len() >= self.settings.buffer_limit {
            self.backlog.pop_front();
            self.stats.dropped += 1;
            debug!(limit = self.settings.buffer_limit, "background buffer full, dropped oldest");
        }
        self.backlog.push_back(msg);
        self.stats.buffered += 1;
    }

    /// Switch lifecycle. Going to the foreground hands back the buffered
    /// messages, oldest first, for paced replay.
    pub fn set_lifecycle(&mut self, lifecycle: Lifecycle) -> Vec<RawMessage> {
        if lifecycle != self.lifecycle {
            info!(?lifecycle, buffered = self.backlog.len(), "lifecycle change");
        }
        self.lifecycle = lifecycle;
        match lifecycle {
            Lifecycle::Foreground => self.backlog.drain(..).collect(),
            Lifecycle::Background => Vec::new(),
        }
    }

    /// Normalize and fold one message into the tracked state
    pub fn process(&mut self, msg: &RawMessage, now: Instant) {
        self.last_processed = Some(now);
        let event = match normalizer::normalize(msg) {
            Ok(event) => event,
            Err(e) => {
                self.stats.rejected += 1;
                debug!(transport = ?msg.transport, error = %e, "dropped message");
                return;
            }
        };
        self.stats.processed += 1;

        match event {
            CanonicalEvent::Drone(report) => self.on_drone(&report, now),
            CanonicalEvent::Status(mut status) => {
                // Fixed stations often run without a GPS altitude
                if status.altitude.is_none() {
                    status.altitude = self.settings.monitor_altitude;
                }
                debug!(serial = %status.serial, location = ?status.location, "monitor status");
                self.dispatcher.status(&status, now);
                self.status = Some(status);
            }
            CanonicalEvent::Fpv(fpv) => self.on_fpv(fpv, now),
            CanonicalEvent::Companion(update) => {
                self.engine.apply_companion(&update);
            }
            CanonicalEvent::Aircraft(reports) => {
                for report in &reports {
                    if let Some(aircraft) = self.aircraft.update_from_report(report, now) {
                        self.dispatcher.aircraft(aircraft, now);
                    }
                }
            }
        }
        self.publish();
    }

    fn on_drone(&mut self, report: &DroneReport, now: Instant) {
        let station = self.station();
        let Some(Ingested {
            key,
            signature,
            is_new,
            possible_duplicate,
        }) = self.engine.ingest(report, station, now)
        else {
            return;
        };
        let Some(record) = self.engine.record(&key) else {
            return;
        };

        if is_new {
            info!(key = %key, kind = signature.transmission.kind.as_str(), "new drone");
        }
        if let Some((other, score)) = possible_duplicate {
            debug!(key = %key, other = %other, score, "kept as separate track");
        }

        let spoof = station.and_then(|monitor| self.spoof.detect(&signature, monitor, record.previous()));
        if let Some(result) = spoof.as_ref().filter(|s| s.is_spoofed) {
            warn!(
                key = %key,
                confidence = result.confidence,
                reasons = ?result.reasons,
                "possible spoofed drone"
            );
        }

        self.rings.update(&key, &signature, station);
        self.dispatcher.drone(
            DroneUpdate {
                key: &key,
                signature: &signature,
                record,
                spoof: spoof.as_ref(),
                is_new,
            },
            now,
        );

        match spoof {
            Some(result) => {
                self.spoofs.insert(key, result);
            }
            None => {
                self.spoofs.remove(&key);
            }
        }
    }

    fn on_fpv(&mut self, fpv: FpvDetection, now: Instant) {
        let station = self.station();
        let id = fpv.synthetic_id();
        let is_new = !self.fpv.contains_key(&id);
        if is_new {
            info!(id = %id, frequency = fpv.frequency_mhz, "new FPV signal");
        }
        self.rings.update_fpv(&fpv, station);
        self.dispatcher.fpv(&fpv, station, is_new, now);
        self.fpv.insert(id, (fpv, now));
    }

    /// Periodic eviction of everything that has gone quiet
    pub fn housekeeping(&mut self, now: Instant) {
        let aircraft = self.aircraft.remove_stale(now);
        self.fpv
            .retain(|_, (_, seen)| now.saturating_duration_since(*seen) <= RECORD_TTL);

        let mut drones = 0;
        if now.saturating_duration_since(self.last_prune) >= PRUNE_INTERVAL {
            drones = self.engine.prune(now);
            self.last_prune = now;
        }

        let registry = self.engine.registry();
        let fpv = &self.fpv;
        self.rings.retain(|id| registry.contains(id) || fpv.contains_key(id));
        self.spoofs.retain(|key, _| registry.contains(key));

        if aircraft > 0 || drones > 0 {
            debug!(
                aircraft,
                drones,
                tracked_drones = self.engine.len(),
                tracked_aircraft = self.aircraft.len(),
                rings = self.rings.len(),
                "pruned stale tracks"
            );
        }
        self.publish();
    }

    fn publish(&self) {
        let drones = self
            .engine
            .registry()
            .records()
            .filter_map(|record| {
                let latest = record.latest()?;
                Some(DroneSummary {
                    key: record.key.clone(),
                    id: latest.primary_id.id.clone(),
                    ua_type: latest.primary_id.aircraft_type.as_str(),
                    position: latest.position.has_fix().then_some(latest.position.coordinate),
                    altitude: latest.position.altitude,
                    rssi: record.best_rssi(),
                    sources: record.sources.iter().map(|s| s.kind).collect(),
                    registration: record.registration.clone(),
                    spoof: self.spoofs.get(&record.key).cloned(),
                    observations: record.signatures.len(),
                    last_update: record.last_update,
                    resembles: record
                        .match_history
                        .iter()
                        .filter(|m| m.other != record.key && m.timestamp.elapsed() <= RECORD_TTL)
                        .map(|m| (m.other.clone(), m.confidence))
                        .collect(),
                })
            })
            .collect();

        let snapshot = Snapshot {
            drones,
            rings: self.rings.rings().cloned().collect(),
            fpv: self.fpv.values().map(|(f, _)| f.clone()).collect(),
            aircraft: self.aircraft.all().cloned().collect(),
            listeners: self
                .listeners
                .iter()
                .map(|(name, rx)| (name.clone(), *rx.borrow()))
                .collect(),
            monitor: self.station(),
            monitor_altitude: self
                .status
                .as_ref()
                .and_then(|s| s.altitude)
                .or(self.settings.monitor_altitude),
            lifecycle: Some(self.lifecycle),
            backlog: self.backlog_len(),
            stats: self.stats,
            dispatch: self.dispatcher.stats(),
        };
        *self.snapshot.write() = snapshot;
    }

    /// Replay buffered messages with pacing. False when told to stop.
    fn replay(&mut self, backlog: Vec<RawMessage>, control: &Receiver<Control>) -> bool {
        let total = backlog.len();
        if let Some(oldest) = backlog.first() {
            info!(
                count = total,
                oldest_ms = oldest.received_at.elapsed().as_millis() as u64,
                "replaying buffered messages"
            );
        }
        let mut pending = backlog.into_iter();
        while let Some(msg) = pending.next() {
            match control.try_recv() {
                Ok(Control::Stop) => return false,
                Ok(Control::Lifecycle(Lifecycle::Background)) => {
                    self.set_lifecycle(Lifecycle::Background);
                    self.buffer(msg);
                    for rest in pending {
                        self.buffer(rest);
                    }
                    return true;
                }
                _ => {}
            }
            self.stats.replayed += 1;
            self.process(&msg, Instant::now());
            thread::sleep(self.settings.replay_pacing);
        }
        true
    }

    /// Run until `Control::Stop` or until every sender is gone
    pub fn run(mut self, messages: Receiver<RawMessage>, control: Receiver<Control>) {
        info!(lifecycle = ?self.lifecycle, "pipeline started");
        let ticker = tick(HOUSEKEEPING_TICK);

        loop {
            select! {
                recv(control) -> cmd => match cmd {
                    Ok(Control::Lifecycle(lifecycle)) => {
                        let backlog = self.set_lifecycle(lifecycle);
                        if !self.replay(backlog, &control) {
                            break;
                        }
                    }
                    Ok(Control::Stop) | Err(_) => break,
                },
                recv(messages) -> msg => match msg {
                    Ok(msg) => {
                        if let Some((msg, wait)) = self.offer(msg, Instant::now()) {
                            if !wait.is_zero() {
                                thread::sleep(wait);
                            }
                            self.process(&msg, Instant::now());
                        }
                    }
                    Err(_) => break,
                },
                recv(ticker) -> _ => self.housekeeping(Instant::now()),
            }
        }

        info!(
            processed = self.stats.processed,
            rejected = self.stats.rejected,
            unreplayed = self.backlog.len(),
            "pipeline stopped"
        );
    }
}
