//! Per-client admission state.
//!
//! One [`TokenBucket`] per client identity, created on first sight and
//! forgotten again once the client has been idle for a full cleanup interval.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info};

use crate::config::RateLimitSettings;
use crate::metrics::TRACKED_CLIENTS;
use crate::rate_limit::TokenBucket;

/// Admission state for a single caller.
#[derive(Debug)]
pub struct ClientState {
    limiter: TokenBucket,
    last_seen: Instant,
}

impl ClientState {
    fn new(settings: &RateLimitSettings, now: Instant) -> Self {
        Self {
            limiter: TokenBucket::new(settings, now),
            last_seen: now,
        }
    }
}

/// Owns every [`ClientState`].
///
/// All access goes through one mutex over the whole map, so find-or-create,
/// the `last_seen` refresh and the token check happen atomically per call.
pub struct ClientRegistry {
    settings: Option<RateLimitSettings>,
    clients: Mutex<HashMap<String, ClientState>>,
}

impl ClientRegistry {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings: Some(settings),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// A registry without rate-limit configuration admits everything.
    pub fn disabled() -> Self {
        Self {
            settings: None,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: Option<RateLimitSettings>) -> Self {
        match settings {
            Some(settings) => Self::new(settings),
            None => Self::disabled(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.is_some()
    }

    pub fn settings(&self) -> Option<&RateLimitSettings> {
        self.settings.as_ref()
    }

    /// Returns whether `identity` had a token available, consuming it if so.
    pub fn admit(&self, identity: &str) -> bool {
        self.admit_at(identity, Instant::now())
    }

    pub fn admit_at(&self, identity: &str, now: Instant) -> bool {
        let Some(settings) = &self.settings else {
            return true;
        };

        let mut clients = self.clients.lock();
        let admitted = match clients.get_mut(identity) {
            Some(state) => {
                state.last_seen = now;
                state.limiter.try_consume_at(now)
            }
            None => {
                let mut state = ClientState::new(settings, now);
                let admitted = state.limiter.try_consume_at(now);
                clients.insert(identity.to_string(), state);
                TRACKED_CLIENTS.set(clients.len() as f64);
                admitted
            }
        };

        if !admitted {
            debug!(client = %identity, "Rate limit exceeded");
        }
        admitted
    }

    /// How long `identity` has to wait for its next token.
    pub fn retry_after(&self, identity: &str) -> Duration {
        let clients = self.clients.lock();
        clients
            .get(identity)
            .map(|state| state.limiter.retry_after())
            .unwrap_or(Duration::ZERO)
    }

    /// Remove every client whose last request is older than `max_idle`.
    ///
    /// Returns the number of evicted clients.
    pub fn sweep_at(&self, now: Instant, max_idle: Duration) -> usize {
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|_, state| now.saturating_duration_since(state.last_seen) <= max_idle);
        TRACKED_CLIENTS.set(clients.len() as f64);
        before - clients.len()
    }

    /// Number of clients currently tracked.
    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the periodic eviction loop.
    ///
    /// Every `interval` the loop drops clients idle for longer than `interval`.
    /// The task holds only a weak reference: it ends on its own once the
    /// registry is dropped, and can be stopped earlier by aborting the handle.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(sweep_loop(registry, interval))
    }
}

async fn sweep_loop(registry: Weak<ClientRegistry>, period: Duration) {
    info!(interval_secs = period.as_secs(), "Client sweeper started");

    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(registry) = registry.upgrade() else {
            debug!("Client registry dropped, sweeper exiting");
            return;
        };

        let evicted = registry.sweep_at(Instant::now(), period);
        if evicted > 0 {
            debug!(evicted, remaining = registry.len(), "Evicted idle clients");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn settings(requests_per_minute: u32, burst_size: u32) -> RateLimitSettings {
        RateLimitSettings::new(requests_per_minute, burst_size, Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn test_disabled_registry_admits_everything() {
        let registry = ClientRegistry::disabled();
        for _ in 0..1000 {
            assert!(registry.admit("10.0.0.1"));
        }
        // nothing is tracked when there is no configuration
        assert!(registry.is_empty());
    }

    #[test]
    fn test_burst_scenario() {
        let registry = ClientRegistry::new(settings(60, 5));
        let start = Instant::now();

        for i in 0..5u64 {
            assert!(registry.admit_at("client-a", start + Duration::from_millis(i * 100)));
        }
        assert!(!registry.admit_at("client-a", start + Duration::from_millis(600)));

        let later = start + Duration::from_millis(1600);
        assert!(registry.admit_at("client-a", later));
        assert!(!registry.admit_at("client-a", later));
    }

    #[test]
    fn test_clients_are_independent() {
        let registry = ClientRegistry::new(settings(60, 2));
        let now = Instant::now();

        assert!(registry.admit_at("a", now));
        assert!(registry.admit_at("a", now));
        assert!(!registry.admit_at("a", now));

        assert!(registry.admit_at("b", now));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_sweep_evicts_idle_clients() {
        let registry = ClientRegistry::new(settings(60, 3));
        let start = Instant::now();
        let idle = Duration::from_secs(60);

        for _ in 0..3 {
            registry.admit_at("idle", start);
        }
        assert!(!registry.admit_at("idle", start));
        registry.admit_at("active", start + Duration::from_secs(50));

        let evicted = registry.sweep_at(start + Duration::from_secs(61), idle);
        assert_eq!(evicted, 1);
        assert_eq!(registry.len(), 1);

        // A returning client starts over with a full burst
        let back = start + Duration::from_secs(61);
        for _ in 0..3 {
            assert!(registry.admit_at("idle", back));
        }
        assert!(!registry.admit_at("idle", back));
    }

    #[test]
    fn test_last_seen_refreshed_on_denied_request() {
        let registry = ClientRegistry::new(settings(1, 1));
        let start = Instant::now();

        assert!(registry.admit_at("c", start));
        assert!(!registry.admit_at("c", start + Duration::from_secs(50)));

        // Denied requests still count as activity
        assert_eq!(registry.sweep_at(start + Duration::from_secs(100), Duration::from_secs(60)), 0);
    }

    #[test]
    fn test_concurrent_admission_never_overspends() {
        let registry = Arc::new(ClientRegistry::new(settings(1, 50)));
        let now = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || (0..100).filter(|_| registry.admit_at("shared", now)).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_retry_after_for_unknown_client() {
        let registry = ClientRegistry::new(settings(60, 1));
        assert_eq!(registry.retry_after("nobody"), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_after_interval() {
        let registry = Arc::new(ClientRegistry::new(settings(60, 5)));
        let interval = Duration::from_secs(300);
        let handle = registry.start_sweeper(interval);

        tokio::time::sleep(Duration::from_secs(100)).await;
        registry.admit("10.0.0.1");
        assert_eq!(registry.len(), 1);

        // First sweep at 300s: client idle for 200s is kept
        tokio::time::sleep(Duration::from_secs(201)).await;
        tokio::task::yield_now().await;
        assert_eq!(registry.len(), 1);

        // Second sweep at 600s removes it
        tokio::time::sleep(interval).await;
        tokio::task::yield_now().await;
        assert_eq!(registry.len(), 0);

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_when_registry_dropped() {
        let registry = Arc::new(ClientRegistry::new(settings(60, 5)));
        let handle = registry.start_sweeper(Duration::from_secs(1));

        drop(registry);
        tokio::time::sleep(Duration::from_secs(2)).await;

        handle.await.unwrap();
    }
}
