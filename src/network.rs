//! Transport listeners
//!
//!  Three inbound paths: CoT over UDP multicast, JSON over a ZMQ SUB bus,
//!  and periodic polling of an ADS-B aggregator. Each runs as its own task
//!  and pushes `RawMessage`s into the processing channel.
//!
//!  On failure a listener tears its socket down, waits a settle delay plus
//!  an exponential backoff, and reconnects. After too many consecutive
//!  failures it gives up and reports `Failed`.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Sender, TrySendError};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use zeromq::{Socket, SocketRecv, SubSocket};

use crate::config::Config;
use crate::error::ListenerError;

const UDP_BUFFER_SIZE: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Multicast,
    Bus,
    Adsb,
}

/// One payload as received, before classification
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub transport: Transport,
    pub payload: Bytes,
    pub received_at: Instant,
}

impl RawMessage {
    pub fn new(transport: Transport, payload: impl Into<Bytes>) -> Self {
        Self {
            transport,
            payload: payload.into(),
            received_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Gave up after too many consecutive failures
    Failed,
    Stopped,
}

/// Cooperative stop signal shared by every task. Triggering twice is harmless.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    #[cfg(test)]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Resolves once shutdown has been triggered
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    // A closed channel means every handle is gone; treat it as shutdown
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Sleep, returning `true` if shutdown fired first
pub async fn sleep_or_shutdown(delay: Duration, rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = wait_for_shutdown(rx) => true,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Pause between tearing a socket down and binding a new one
    pub settle: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            settle: Duration::from_millis(500),
        }
    }
}

/// Doubling delay with a cap and a limit on consecutive failures
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let delay = self
            .policy
            .initial_delay
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.policy.max_delay);
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// A reconnectable inbound transport
pub trait Source: Send {
    fn name(&self) -> &str;
    fn transport(&self) -> Transport;
    fn connect(&mut self) -> impl Future<Output = Result<(), ListenerError>> + Send;
    fn recv(&mut self) -> impl Future<Output = Result<Bytes, ListenerError>> + Send;
    /// Drop the underlying socket
    fn close(&mut self);
}

/// CoT over UDP multicast
pub struct MulticastSource {
    group: Ipv4Addr,
    port: u16,
    socket: Option<UdpSocket>,
    buf: Vec<u8>,
}

impl MulticastSource {
    pub fn new(group: Ipv4Addr, port: u16) -> Self {
        Self {
            group,
            port,
            socket: None,
            buf: vec![0u8; UDP_BUFFER_SIZE],
        }
    }
}

impl Source for MulticastSource {
    fn name(&self) -> &str {
        "multicast"
    }

    fn transport(&self) -> Transport {
        Transport::Multicast
    }

    async fn connect(&mut self) -> Result<(), ListenerError> {
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))).await?;
        socket.join_multicast_v4(self.group, Ipv4Addr::UNSPECIFIED)?;
        info!("Joined multicast group {}:{}", self.group, self.port);
        self.socket = Some(socket);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Bytes, ListenerError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;
        let (n, from) = socket.recv_from(&mut self.buf).await?;
        debug!("{} bytes from {}", n, from);
        Ok(Bytes::copy_from_slice(&self.buf[..n]))
    }

    fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            let _ = socket.leave_multicast_v4(self.group, Ipv4Addr::UNSPECIFIED);
        }
    }
}

/// JSON telemetry or status from a ZMQ publisher
pub struct BusSource {
    name: String,
    endpoint: String,
    socket: Option<SubSocket>,
}

impl BusSource {
    pub fn new(name: &str, endpoint: &str) -> Self {
        Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            socket: None,
        }
    }
}

impl Source for BusSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn transport(&self) -> Transport {
        Transport::Bus
    }

    async fn connect(&mut self) -> Result<(), ListenerError> {
        let mut socket = SubSocket::new();
        socket.connect(&self.endpoint).await?;
        socket.subscribe("").await?;
        info!("Subscribed to {}", self.endpoint);
        self.socket = Some(socket);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Bytes, ListenerError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;
        let msg = socket.recv().await?;
        // Topic frames come first; the payload is the last frame
        Ok(msg.into_vec().pop().unwrap_or_default())
    }

    fn close(&mut self) {
        self.socket = None;
    }
}

/// Polls an aggregator's `aircraft.json`
pub struct AdsbSource {
    url: String,
    timeout: Duration,
    interval: Duration,
    client: Option<reqwest::Client>,
    ticker: Option<tokio::time::Interval>,
}

impl AdsbSource {
    pub fn new(url: &str, interval: Duration, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            timeout,
            interval,
            client: None,
            ticker: None,
        }
    }
}

impl Source for AdsbSource {
    fn name(&self) -> &str {
        "adsb"
    }

    fn transport(&self) -> Transport {
        Transport::Adsb
    }

    async fn connect(&mut self) -> Result<(), ListenerError> {
        let client = reqwest::Client::builder().timeout(self.timeout).build()?;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        self.client = Some(client);
        self.ticker = Some(ticker);
        info!("Polling {} every {:?}", self.url, self.interval);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Bytes, ListenerError> {
        let (Some(client), Some(ticker)) = (&self.client, &mut self.ticker) else {
            return Err(std::io::Error::from(std::io::ErrorKind::NotConnected).into());
        };
        let url = self.url.as_str();
        loop {
            ticker.tick().await;
            let result = async {
                client
                    .get(url)
                    .send()
                    .await?
                    .error_for_status()?
                    .bytes()
                    .await
            }
            .await;
            match result {
                Ok(body) => return Ok(body),
                // A slow aggregator costs one poll, not the connection
                Err(e) if e.is_timeout() => warn!("ADS-B poll timed out: {}", e),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close(&mut self) {
        self.client = None;
        self.ticker = None;
    }
}

/// Receive loop with reconnect, backoff and cooperative shutdown
pub async fn run_listener<S: Source>(
    mut source: S,
    tx: Sender<RawMessage>,
    state: watch::Sender<ListenerState>,
    mut shutdown: watch::Receiver<bool>,
    policy: ReconnectPolicy,
) {
    let mut backoff = Backoff::new(policy);
    state.send_replace(ListenerState::Connecting);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let result = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            r = session(&mut source, &tx, &state, &mut backoff) => r,
        };
        source.close();

        match result {
            Ok(()) => {
                debug!("{}: processing channel closed", source.name());
                break;
            }
            Err(e) => warn!("{}: {}", source.name(), e),
        }

        match backoff.next_delay() {
            Some(delay) => {
                let attempt = backoff.attempt();
                state.send_replace(ListenerState::Reconnecting { attempt });
                info!("{}: reconnect attempt {} in {:?}", source.name(), attempt, policy.settle + delay);
                if sleep_or_shutdown(policy.settle + delay, &mut shutdown).await {
                    break;
                }
            }
            None => {
                let e = ListenerError::Exhausted(policy.max_attempts);
                error!("{}: {}", source.name(), e);
                state.send_replace(ListenerState::Failed);
                return;
            }
        }
    }

    source.close();
    state.send_replace(ListenerState::Stopped);
    info!("{}: stopped", source.name());
}

/// One connection's lifetime. `Ok` means the receiving side went away.
async fn session<S: Source>(
    source: &mut S,
    tx: &Sender<RawMessage>,
    state: &watch::Sender<ListenerState>,
    backoff: &mut Backoff,
) -> Result<(), ListenerError> {
    source.connect().await?;
    state.send_replace(ListenerState::Connected);
    let mut dropped = 0u64;

    loop {
        let payload = source.recv().await?;
        backoff.reset();
        if payload.is_empty() {
            continue;
        }
        match tx.try_send(RawMessage::new(source.transport(), payload)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                if dropped.is_power_of_two() {
                    warn!("{}: processing queue full, {} messages dropped", source.name(), dropped);
                }
            }
            Err(TrySendError::Disconnected(_)) => return Ok(()),
        }
    }
}

/// A spawned listener and its published state
pub struct ListenerHandle {
    pub name: String,
    pub state: watch::Receiver<ListenerState>,
    pub task: JoinHandle<()>,
}

fn spawn<S: Source + 'static>(
    source: S,
    tx: &Sender<RawMessage>,
    shutdown: &Shutdown,
    policy: ReconnectPolicy,
) -> ListenerHandle {
    let name = source.name().to_string();
    let (state_tx, state_rx) = watch::channel(ListenerState::Connecting);
    let task = tokio::spawn(run_listener(source, tx.clone(), state_tx, shutdown.subscribe(), policy));
    ListenerHandle {
        name,
        state: state_rx,
        task,
    }
}

/// Start every listener the configuration enables
pub fn spawn_listeners(config: &Config, tx: &Sender<RawMessage>, shutdown: &Shutdown) -> Vec<ListenerHandle> {
    let policy = ReconnectPolicy {
        max_attempts: config.max_reconnects,
        ..Default::default()
    };
    let mut handles = Vec::new();

    if config.multicast {
        handles.push(spawn(
            MulticastSource::new(config.multicast_group, config.multicast_port),
            tx,
            shutdown,
            policy,
        ));
    }
    if config.zmq {
        handles.push(spawn(BusSource::new("zmq-telemetry", &config.zmq_telemetry), tx, shutdown, policy));
        handles.push(spawn(BusSource::new("zmq-status", &config.zmq_status), tx, shutdown, policy));
    }
    if let Some(url) = &config.adsb_url {
        handles.push(spawn(
            AdsbSource::new(
                url,
                Duration::from_secs(config.adsb_interval),
                Duration::from_secs(config.http_timeout),
            ),
            tx,
            shutdown,
            policy,
        ));
    }
    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use crossbeam_channel::bounded;

    /// Scripted source: each connection yields its payloads, then fails
    struct Scripted {
        sessions: VecDeque<Vec<&'static str>>,
        current: VecDeque<&'static str>,
        connects: Arc<parking_lot::Mutex<u32>>,
    }

    impl Source for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn transport(&self) -> Transport {
            Transport::Bus
        }

        async fn connect(&mut self) -> Result<(), ListenerError> {
            *self.connects.lock() += 1;
            match self.sessions.pop_front() {
                Some(s) => {
                    self.current = s.into();
                    Ok(())
                }
                None => Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into()),
            }
        }

        async fn recv(&mut self) -> Result<Bytes, ListenerError> {
            match self.current.pop_front() {
                Some(p) => Ok(Bytes::from_static(p.as_bytes())),
                None => Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset).into()),
            }
        }

        fn close(&mut self) {
            self.current.clear();
        }
    }

    fn quick_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            settle: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(ReconnectPolicy::default());
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 8, 16].map(Duration::from_secs).to_vec()
        );
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));

        let mut long = Backoff::new(ReconnectPolicy {
            max_attempts: 10,
            ..Default::default()
        });
        assert_eq!(
            std::iter::from_fn(|| long.next_delay()).last(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_shutdown_idempotent() {
        let shutdown = Shutdown::new();
        let rx = shutdown.subscribe();
        assert!(!shutdown.is_triggered());
        shutdown.trigger();
        shutdown.trigger();
        assert!(shutdown.is_triggered());
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_reconnects_then_fails() {
        let (tx, rx) = bounded(16);
        let (state_tx, state_rx) = watch::channel(ListenerState::Connecting);
        let shutdown = Shutdown::new();
        let connects = Arc::new(parking_lot::Mutex::new(0));
        let source = Scripted {
            sessions: VecDeque::from([vec!["one", "two"], vec!["three"]]),
            current: VecDeque::new(),
            connects: Arc::clone(&connects),
        };

        run_listener(source, tx, state_tx, shutdown.subscribe(), quick_policy(2)).await;

        let got: Vec<_> = rx.try_iter().map(|m| m.payload).collect();
        assert_eq!(got, vec!["one", "two", "three"]);
        assert_eq!(*state_rx.borrow(), ListenerState::Failed);
        // Two sessions that delivered data, then two refused attempts
        assert_eq!(*connects.lock(), 4);
    }

    #[tokio::test]
    async fn test_shutdown_stops_listener() {
        let (tx, _rx) = bounded(16);
        let (state_tx, state_rx) = watch::channel(ListenerState::Connecting);
        let shutdown = Shutdown::new();
        let source = Scripted {
            sessions: VecDeque::new(),
            current: VecDeque::new(),
            connects: Arc::default(),
        };
        let mut policy = quick_policy(100);
        policy.settle = Duration::from_secs(60);

        let task = tokio::spawn(run_listener(source, tx, state_tx, shutdown.subscribe(), policy));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();
        task.await.unwrap();
        assert_eq!(*state_rx.borrow(), ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_closed_channel_ends_listener() {
        let (tx, rx) = bounded::<RawMessage>(16);
        drop(rx);
        let (state_tx, state_rx) = watch::channel(ListenerState::Connecting);
        let source = Scripted {
            sessions: VecDeque::from([vec!["one"]]),
            current: VecDeque::new(),
            connects: Arc::default(),
        };
        run_listener(source, tx, state_tx, Shutdown::new().subscribe(), quick_policy(3)).await;
        assert_eq!(*state_rx.borrow(), ListenerState::Stopped);
    }
}
