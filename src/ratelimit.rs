//! Outbound rate limiting
//!
//!  Every strategy reduces to "at most N events in a sliding window":
//!  an interval limiter is N = 1 over the interval.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

/// Keys unused this long are evicted from a per-item limiter
pub const IDLE_EVICTION: Duration = Duration::from_secs(600);
/// How often a per-item limiter looks for idle keys
pub const EVICTION_CHECK: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Strategy {
    /// Minimum gap between events
    Interval(Duration),
    PerSecond(u32),
    PerMinute(u32),
    /// `max` events per rolling `period`
    Burst { max: u32, period: Duration },
}

impl Strategy {
    fn window(&self) -> (usize, Duration) {
        match *self {
            Strategy::Interval(gap) => (1, gap),
            Strategy::PerSecond(n) => (n as usize, Duration::from_secs(1)),
            Strategy::PerMinute(n) => (n as usize, Duration::from_secs(60)),
            Strategy::Burst { max, period } => (max as usize, period),
        }
    }
}

#[derive(Debug, Default)]
struct LimiterState {
    events: VecDeque<Instant>,
    last_used: Option<Instant>,
}

impl LimiterState {
    fn expire(&mut self, window: Duration, now: Instant) {
        while let Some(&front) = self.events.front() {
            if now.saturating_duration_since(front) >= window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    strategy: Strategy,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Whether an event at `now` would be allowed. Records nothing.
    pub fn should_allow_at(&self, now: Instant) -> bool {
        let (max, window) = self.strategy.window();
        let mut state = self.state.lock();
        state.expire(window, now);
        state.events.len() < max
    }

    pub fn record_event_at(&self, now: Instant) {
        let (_, window) = self.strategy.window();
        let mut state = self.state.lock();
        state.expire(window, now);
        state.events.push_back(now);
        state.last_used = Some(now);
    }

    /// Check and record under one lock
    pub fn try_allow_at(&self, now: Instant) -> bool {
        let (max, window) = self.strategy.window();
        let mut state = self.state.lock();
        state.expire(window, now);
        state.last_used = Some(now);
        if state.events.len() < max {
            state.events.push_back(now);
            true
        } else {
            false
        }
    }

    fn idle_since(&self, now: Instant) -> Duration {
        match self.state.lock().last_used {
            Some(t) => now.saturating_duration_since(t),
            None => Duration::ZERO,
        }
    }
}

/// Independent limiter per key (drone id)
#[derive(Debug)]
pub struct PerItemLimiter {
    strategy: Strategy,
    limiters: RwLock<HashMap<String, Arc<RateLimiter>>>,
    idle: Duration,
    last_eviction: Mutex<Option<Instant>>,
}

impl PerItemLimiter {
    pub fn new(strategy: Strategy) -> Self {
        Self::with_idle(strategy, IDLE_EVICTION)
    }

    pub fn with_idle(strategy: Strategy, idle: Duration) -> Self {
        Self {
            strategy,
            limiters: RwLock::new(HashMap::new()),
            idle,
            last_eviction: Mutex::new(None),
        }
    }

    fn limiter(&self, key: &str) -> Arc<RateLimiter> {
        if let Some(l) = self.limiters.read().get(key) {
            return Arc::clone(l);
        }
        let mut map = self.limiters.write();
        Arc::clone(
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(RateLimiter::new(self.strategy))),
        )
    }

    pub fn try_allow_at(&self, key: &str, now: Instant) -> bool {
        self.maybe_evict(now);
        self.limiter(key).try_allow_at(now)
    }

    pub fn should_allow_at(&self, key: &str, now: Instant) -> bool {
        match self.limiters.read().get(key) {
            Some(l) => l.should_allow_at(now),
            None => true,
        }
    }

    pub fn record_event_at(&self, key: &str, now: Instant) {
        self.maybe_evict(now);
        self.limiter(key).record_event_at(now)
    }

    /// Remove limiters idle longer than the eviction threshold
    pub fn evict_idle(&self, now: Instant) -> usize {
        let mut map = self.limiters.write();
        let before = map.len();
        let idle = self.idle;
        map.retain(|_, l| l.idle_since(now) <= idle);
        let evicted = before - map.len();
        if evicted > 0 {
            debug!(evicted, remaining = map.len(), "evicted idle rate limiters");
        }
        evicted
    }

    fn maybe_evict(&self, now: Instant) {
        let due = {
            let mut last = self.last_eviction.lock();
            match *last {
                Some(t) if now.saturating_duration_since(t) < EVICTION_CHECK => false,
                _ => {
                    *last = Some(now);
                    true
                }
            }
        };
        if due {
            self.evict_idle(now);
        }
    }

    pub fn len(&self) -> usize {
        self.limiters.read().len()
    }
}

/// Which outbound collaborator a limiter guards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkKind {
    Persist,
    Mqtt,
    Tak,
    Webhook,
}

/// Limits for each sink plus the per-drone publication limit
#[derive(Debug)]
pub struct RateLimitManager {
    sinks: HashMap<SinkKind, RateLimiter>,
    per_drone: PerItemLimiter,
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub persist: Strategy,
    pub mqtt: Strategy,
    pub tak: Strategy,
    pub webhook: Strategy,
    pub per_drone: Strategy,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            persist: Strategy::PerSecond(10),
            mqtt: Strategy::Interval(Duration::from_secs(1)),
            tak: Strategy::Interval(Duration::from_secs(1)),
            webhook: Strategy::PerMinute(20),
            per_drone: Strategy::Interval(Duration::from_millis(500)),
        }
    }
}

impl RateLimitManager {
    pub fn new(settings: &RateLimitSettings) -> Self {
        let sinks = [
            (SinkKind::Persist, settings.persist),
            (SinkKind::Mqtt, settings.mqtt),
            (SinkKind::Tak, settings.tak),
            (SinkKind::Webhook, settings.webhook),
        ]
        .into_iter()
        .map(|(kind, strategy)| (kind, RateLimiter::new(strategy)))
        .collect();

        Self {
            sinks,
            per_drone: PerItemLimiter::new(settings.per_drone),
        }
    }

    pub fn allow_sink(&self, sink: SinkKind, now: Instant) -> bool {
        self.sinks
            .get(&sink)
            .is_none_or(|l| l.try_allow_at(now))
    }

    pub fn allow_item(&self, key: &str, now: Instant) -> bool {
        self.per_drone.try_allow_at(key, now)
    }

    /// Whether `key` is within its limit. Records nothing.
    pub fn item_allowed(&self, key: &str, now: Instant) -> bool {
        self.per_drone.should_allow_at(key, now)
    }

    pub fn record_item(&self, key: &str, now: Instant) {
        self.per_drone.record_event_at(key, now)
    }

    pub fn tracked_items(&self) -> usize {
        self.per_drone.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_interval() {
        let limiter = RateLimiter::new(Strategy::Interval(Duration::from_secs(1)));
        let t0 = Instant::now();
        assert!(limiter.try_allow_at(t0));
        assert!(!limiter.try_allow_at(t0 + ms(500)));
        assert!(limiter.try_allow_at(t0 + ms(1100)));
    }

    #[test]
    fn test_per_second() {
        let limiter = RateLimiter::new(Strategy::PerSecond(3));
        let t0 = Instant::now();
        for i in 0..3 {
            assert!(limiter.try_allow_at(t0 + ms(i * 100)));
        }
        assert!(!limiter.try_allow_at(t0 + ms(900)));
        assert!(limiter.try_allow_at(t0 + ms(1000)));
    }

    #[test]
    fn test_per_minute_and_burst() {
        let t0 = Instant::now();
        let per_minute = RateLimiter::new(Strategy::PerMinute(2));
        assert!(per_minute.try_allow_at(t0));
        assert!(per_minute.try_allow_at(t0 + Duration::from_secs(10)));
        assert!(!per_minute.try_allow_at(t0 + Duration::from_secs(59)));
        assert!(per_minute.try_allow_at(t0 + Duration::from_secs(61)));

        let burst = RateLimiter::new(Strategy::Burst {
            max: 5,
            period: Duration::from_secs(10),
        });
        for i in 0..5 {
            assert!(burst.try_allow_at(t0 + ms(i)));
        }
        assert!(!burst.try_allow_at(t0 + Duration::from_secs(5)));
        assert!(burst.try_allow_at(t0 + Duration::from_secs(11)));
    }

    #[test]
    fn test_should_allow_does_not_record() {
        let limiter = RateLimiter::new(Strategy::Interval(Duration::from_secs(1)));
        let t0 = Instant::now();
        assert!(limiter.should_allow_at(t0));
        assert!(limiter.should_allow_at(t0));
        limiter.record_event_at(t0);
        assert!(!limiter.should_allow_at(t0 + ms(10)));
    }

    #[test]
    fn test_record_only_stays_bounded() {
        let limiter = RateLimiter::new(Strategy::PerSecond(2));
        let t0 = Instant::now();
        for i in 0..500 {
            limiter.record_event_at(t0 + ms(i * 100));
        }
        assert!(limiter.state.lock().events.len() <= 10);
    }

    #[test]
    fn test_per_item_independent_and_evicted() {
        let limiter = PerItemLimiter::new(Strategy::Interval(Duration::from_secs(1)));
        let t0 = Instant::now();
        assert!(limiter.try_allow_at("a", t0));
        assert!(limiter.try_allow_at("b", t0));
        assert!(!limiter.try_allow_at("a", t0 + ms(100)));
        assert!(limiter.should_allow_at("never-seen", t0));
        assert_eq!(limiter.len(), 2);

        assert!(limiter.try_allow_at("b", t0 + Duration::from_secs(300)));
        assert_eq!(limiter.evict_idle(t0 + Duration::from_secs(660)), 1);
        assert_eq!(limiter.len(), 1);
        assert!(limiter.should_allow_at("b", t0 + Duration::from_secs(660)));
    }

    #[test]
    fn test_manager() {
        let manager = RateLimitManager::new(&RateLimitSettings::default());
        let t0 = Instant::now();
        assert!(manager.allow_sink(SinkKind::Mqtt, t0));
        assert!(!manager.allow_sink(SinkKind::Mqtt, t0 + ms(100)));
        assert!(manager.allow_sink(SinkKind::Tak, t0 + ms(100)));
        assert!(manager.allow_item("SN1", t0));
        assert!(!manager.allow_item("SN1", t0 + ms(100)));
        assert_eq!(manager.tracked_items(), 1);

        assert!(manager.item_allowed("SN2", t0));
        manager.record_item("SN2", t0);
        assert!(!manager.item_allowed("SN2", t0 + ms(100)));
        assert!(manager.item_allowed("SN2", t0 + ms(600)));
        assert_eq!(manager.tracked_items(), 2);
    }
}
