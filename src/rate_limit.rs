//! Sliding-window admission control for download requests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// Source of "now" for the limiter.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

type Window = Mutex<VecDeque<Instant>>;

/// Map size past which a new client triggers a sweep of idle windows.
const SWEEP_THRESHOLD: usize = 1024;

/// Per-client request timestamps. Each client has its own lock, so two clients
/// only ever share the brief map lookup. Clients with nothing left in their
/// window are swept once the map grows past a threshold.
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    sweep_threshold: usize,
    clock: Arc<dyn Clock>,
    clients: RwLock<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self::with_clock(limit, window, Arc::new(SystemClock))
    }

    pub fn with_clock(limit: usize, window: Duration, clock: Arc<dyn Clock>) -> Self {
        RateLimiter {
            limit,
            window,
            sweep_threshold: SWEEP_THRESHOLD,
            clock,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, Duration::from_secs(config.window_secs))
    }

    /// Records a request for `client_id` and returns whether it is admitted.
    /// Rejected attempts are not recorded.
    pub fn admit(&self, client_id: &str) -> bool {
        let now = self.clock.now();

        // a window is only touched while the map lock is held, so a sweep
        // never drops one mid-update
        {
            let clients = self.clients.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(window) = clients.get(client_id) {
                return self.record(window, now, client_id);
            }
        }

        let mut clients = self.clients.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if clients.len() >= self.sweep_threshold && !clients.contains_key(client_id) {
            self.sweep(&mut clients, now);
        }
        let window = clients.entry(client_id.to_string()).or_default();
        self.record(window, now, client_id)
    }

    fn record(&self, window: &Window, now: Instant, client_id: &str) -> bool {
        let mut stamps = window.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while let Some(oldest) = stamps.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                stamps.pop_front();
            } else {
                break;
            }
        }

        if stamps.len() >= self.limit {
            tracing::warn!("Rate limit exceeded for client {}", client_id);
            return false;
        }
        stamps.push_back(now);
        true
    }

    fn sweep(&self, clients: &mut HashMap<String, Window>, now: Instant) {
        let before = clients.len();
        clients.retain(|_, window| {
            let stamps = window.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            stamps.back().map_or(false, |newest| now.saturating_duration_since(*newest) < self.window)
        });
        tracing::debug!("Rate limiter swept {} idle clients", before - clients.len());
    }

    #[cfg(test)]
    fn tracked_clients(&self) -> usize {
        self.clients.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A clock that only moves when told to.
    pub(crate) struct ManualClock {
        start: Instant,
        offset: Mutex<Duration>,
    }

    impl ManualClock {
        pub(crate) fn new() -> Self {
            ManualClock { start: Instant::now(), offset: Mutex::new(Duration::ZERO) }
        }

        pub(crate) fn advance(&self, by: Duration) {
            *self.offset.lock().unwrap() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.start + *self.offset.lock().unwrap()
        }
    }

    fn limiter() -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::with_clock(5, Duration::from_secs(60), clock.clone());
        (clock, limiter)
    }

    #[test]
    fn admits_up_to_limit_within_window() {
        let (clock, limiter) = limiter();
        for _ in 0..5 {
            assert!(limiter.admit("1.2.3.4"));
            clock.advance(Duration::from_secs(1));
        }
        assert!(!limiter.admit("1.2.3.4"));
        clock.advance(Duration::from_secs(50));
        assert!(!limiter.admit("1.2.3.4"));
    }

    #[test]
    fn exactly_one_more_after_oldest_ages_out() {
        let (clock, limiter) = limiter();
        assert!(limiter.admit("a"));
        clock.advance(Duration::from_secs(10));
        for _ in 0..4 {
            assert!(limiter.admit("a"));
        }
        // the first stamp expires at t=60, the other four at t=70
        clock.advance(Duration::from_secs(50));
        assert!(limiter.admit("a"));
        assert!(!limiter.admit("a"));
    }

    #[test]
    fn rejected_attempts_are_not_recorded() {
        let (clock, limiter) = limiter();
        for _ in 0..5 {
            assert!(limiter.admit("a"));
        }
        clock.advance(Duration::from_secs(30));
        for _ in 0..10 {
            assert!(!limiter.admit("a"));
        }
        clock.advance(Duration::from_secs(30));
        for _ in 0..5 {
            assert!(limiter.admit("a"));
        }
    }

    #[test]
    fn clients_are_independent() {
        let (_clock, limiter) = limiter();
        for _ in 0..5 {
            assert!(limiter.admit("a"));
        }
        assert!(!limiter.admit("a"));
        assert!(limiter.admit("b"));
    }

    #[test]
    fn idle_clients_are_swept_once_the_map_is_large() {
        let (clock, mut limiter) = limiter();
        limiter.sweep_threshold = 4;
        for n in 0..10 {
            assert!(limiter.admit(&format!("10.0.0.{}", n)));
        }
        // nothing has aged out yet, so nothing is dropped
        assert_eq!(limiter.tracked_clients(), 10);

        clock.advance(Duration::from_secs(61));
        assert!(limiter.admit("10.0.0.0"));
        assert!(limiter.admit("192.0.2.1"));
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[test]
    fn sweep_keeps_limits_of_active_clients() {
        let (clock, mut limiter) = limiter();
        limiter.sweep_threshold = 2;
        for _ in 0..5 {
            assert!(limiter.admit("busy"));
        }
        clock.advance(Duration::from_secs(30));
        for n in 0..5 {
            assert!(limiter.admit(&format!("other-{}", n)));
        }
        assert!(!limiter.admit("busy"));
    }

    #[test]
    fn concurrent_admits_never_exceed_limit() {
        let limiter = Arc::new(RateLimiter::new(5, Duration::from_secs(60)));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || limiter.admit("shared"))
            })
            .collect();
        let admitted = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
        assert_eq!(admitted, 5);
    }
}
