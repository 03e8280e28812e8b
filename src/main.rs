//!   rid-sentry:   Remote ID and ADS-B detection pipeline
//!
//!  Listens for drone telemetry over CoT multicast and a ZMQ bus, polls an
//!  ADS-B aggregator, correlates observations into tracked drones, checks
//!  them for spoofing and fans the results out to rate-limited sinks.

mod aircraft;
mod alert;
mod config;
mod correlation;
mod cot;
mod error;
mod event;
mod network;
mod normalizer;
mod physics;
mod pipeline;
mod ratelimit;
mod signature;
mod sink;
mod spoof;
mod tracking;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::Config;
use crate::network::{RawMessage, Shutdown};
use crate::pipeline::{Control, Lifecycle, Pipeline, PipelineSettings, Snapshot};
use crate::ratelimit::RateLimitManager;
use crate::sink::{Dispatcher, Sinks};

const CHANNEL_CAPACITY: usize = 1024;
const SUMMARY_INTERVAL: Duration = Duration::from_secs(30);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_args();

    let default_level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).ok();
    info!("rid-sentry starting");
    info!("Configuration: {:?}", config);

    let dispatcher = Dispatcher::new(
        Sinks::logging(config.log_events),
        RateLimitManager::new(&config.rate_limits()),
        &config.mqtt_topic,
    );
    let settings = PipelineSettings {
        foreground_interval: Duration::from_millis(config.foreground_interval_ms),
        background_interval: Duration::from_millis(config.background_interval_ms),
        monitor: config.monitor_location(),
        monitor_altitude: config.alt,
        lifecycle: if config.start_background {
            Lifecycle::Background
        } else {
            Lifecycle::Foreground
        },
        ..Default::default()
    };
    let mut pipeline = Pipeline::new(settings, dispatcher);
    let snapshot = pipeline.snapshot_handle();

    // Raw payloads from every listener
    let (msg_tx, msg_rx): (Sender<RawMessage>, Receiver<RawMessage>) = bounded(CHANNEL_CAPACITY);
    let (control_tx, control_rx) = unbounded();
    let shutdown = Shutdown::new();

    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let listeners = network::spawn_listeners(&config, &msg_tx, &shutdown);
        if listeners.is_empty() {
            warn!("No listeners enabled, nothing will be received");
        }
        pipeline.watch_listeners(
            listeners
                .iter()
                .map(|l| (l.name.clone(), l.state.clone()))
                .collect(),
        );
        // Listeners hold their own clones
        drop(msg_tx);

        let processor = thread::Builder::new()
            .name("pipeline".to_string())
            .spawn(move || pipeline.run(msg_rx, control_rx));
        let processor = match processor {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to start pipeline thread: {}", e);
                shutdown.trigger();
                return;
            }
        };

        let lifecycle_handle = spawn_lifecycle_signals(control_tx.clone());

        let summary_handle = {
            let snapshot = Arc::clone(&snapshot);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(SUMMARY_INTERVAL);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    log_summary(&snapshot);
                }
            })
        };

        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down");

        // Cleanup
        shutdown.trigger();
        control_tx.send(Control::Stop).ok();
        summary_handle.abort();
        if let Some(h) = lifecycle_handle {
            h.abort();
        }
        for listener in listeners {
            if let Err(e) = listener.task.await {
                warn!(listener = %listener.name, "Listener task ended abnormally: {}", e);
            }
        }
        if processor.join().is_err() {
            error!("Pipeline thread panicked");
        }
    });

    log_summary(&snapshot);
    Ok(())
}

/// SIGUSR1 moves processing to the background, SIGUSR2 back to the foreground
#[cfg(unix)]
fn spawn_lifecycle_signals(control: Sender<Control>) -> Option<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut background = signal(SignalKind::user_defined1()).ok()?;
    let mut foreground = signal(SignalKind::user_defined2()).ok()?;
    Some(tokio::spawn(async move {
        loop {
            let lifecycle = tokio::select! {
                _ = background.recv() => Lifecycle::Background,
                _ = foreground.recv() => Lifecycle::Foreground,
            };
            if control.send(Control::Lifecycle(lifecycle)).is_err() {
                break;
            }
        }
    }))
}

#[cfg(not(unix))]
fn spawn_lifecycle_signals(_control: Sender<Control>) -> Option<tokio::task::JoinHandle<()>> {
    None
}

fn log_summary(snapshot: &Arc<RwLock<Snapshot>>) {
    let s = snapshot.read();
    let spoofed = s
        .drones
        .iter()
        .filter(|d| d.spoof.as_ref().is_some_and(|r| r.is_spoofed))
        .count();
    let observations: usize = s.drones.iter().map(|d| d.observations).sum();
    let listeners: Vec<String> = s
        .listeners
        .iter()
        .map(|(name, state)| format!("{}={:?}", name, state))
        .collect();
    info!(
        drones = s.drones.len(),
        spoofed,
        observations,
        rings = s.rings.len(),
        fpv = s.fpv.len(),
        aircraft = s.aircraft.len(),
        processed = s.stats.processed,
        rejected = s.stats.rejected,
        delivered = s.dispatch.delivered,
        skipped = s.dispatch.skipped,
        limited = s.dispatch.limited_items,
        backlog = s.backlog,
        listeners = %listeners.join(", "),
        lifecycle = ?s.lifecycle,
        monitor = ?s.monitor,
        monitor_altitude = ?s.monitor_altitude,
        "summary"
    );
}
