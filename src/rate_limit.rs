//! Per-client fixed-window rate limiting.
//!
//! Window state lives in a [`RateLimitStore`] owned by whoever builds the
//! limiter, so tests can inject a clock and servers can swap the backing store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::SecurityConfig;

/// Client id used when the caller does not supply one.
pub const DEFAULT_CLIENT_ID: &str = "default";

/// Window record for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitState {
    pub file_count: u32,
    /// Milliseconds since the Unix epoch.
    pub window_start: u64,
}

/// Millisecond clock.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Keyed window storage.
pub trait RateLimitStore: Send + Sync {
    fn get(&self, client_id: &str) -> Option<RateLimitState>;
    fn set(&self, client_id: &str, state: RateLimitState);
    /// Drop every record whose window started before `cutoff`. Returns how many went.
    fn evict_expired(&self, cutoff: u64) -> usize;
    fn now(&self) -> u64;
}

/// In-process store. Entries are created on first use and age out by window expiry.
pub struct InMemoryRateLimitStore {
    entries: RwLock<HashMap<String, RateLimitState>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }
}

impl Default for InMemoryRateLimitStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitStore for InMemoryRateLimitStore {
    fn get(&self, client_id: &str) -> Option<RateLimitState> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_id)
            .copied()
    }

    fn set(&self, client_id: &str, state: RateLimitState) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client_id.to_string(), state);
    }

    fn evict_expired(&self, cutoff: u64) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, state| state.window_start >= cutoff);
        before - entries.len()
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }
}

/// Fixed-window limiter over a shared store.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    // Serializes read-modify-write on window records. Holds the time of the last sweep.
    update: Mutex<u64>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            store,
            update: Mutex::new(0),
        }
    }

    /// Record one submission for `client_id`. Returns false, without
    /// counting it, when the client has used up its window.
    pub fn allow(&self, client_id: &str, config: &SecurityConfig) -> bool {
        let mut last_sweep = self.update.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.store.now();

        // At most one sweep per window length.
        if now.saturating_sub(*last_sweep) > config.rate_limit_window {
            let evicted = self
                .store
                .evict_expired(now.saturating_sub(config.rate_limit_window));
            if evicted > 0 {
                debug!("Rate limit: evicted {} expired client window(s)", evicted);
            }
            *last_sweep = now;
        }

        let mut state = match self.store.get(client_id) {
            Some(state) if now.saturating_sub(state.window_start) <= config.rate_limit_window => {
                state
            }
            _ => RateLimitState {
                file_count: 0,
                window_start: now,
            },
        };

        if state.file_count >= config.max_files_per_window {
            warn!(
                "Rate limit hit for client '{}' ({} files in window)",
                client_id, state.file_count
            );
            return false;
        }

        state.file_count += 1;
        self.store.set(client_id, state);
        debug!(
            "Rate limit: client '{}' at {}/{}",
            client_id, state.file_count, config.max_files_per_window
        );
        true
    }

    pub fn state(&self, client_id: &str) -> Option<RateLimitState> {
        self.store.get(client_id)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryRateLimitStore::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_with_clock() -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = InMemoryRateLimitStore::with_clock(clock.clone());
        (RateLimiter::new(Arc::new(store)), clock)
    }

    fn config(max: u32, window_ms: u64) -> SecurityConfig {
        SecurityConfig {
            max_files_per_window: max,
            rate_limit_window: window_ms,
            ..Default::default()
        }
    }

    #[test]
    fn test_denies_after_cap_within_window() {
        let (limiter, _clock) = limiter_with_clock();
        let config = config(3, 60_000);

        for _ in 0..3 {
            assert!(limiter.allow("client", &config));
        }
        assert!(!limiter.allow("client", &config));
        assert_eq!(limiter.state("client").unwrap().file_count, 3);
    }

    #[test]
    fn test_window_expiry_resets() {
        let (limiter, clock) = limiter_with_clock();
        let config = config(2, 60_000);

        assert!(limiter.allow("client", &config));
        assert!(limiter.allow("client", &config));
        assert!(!limiter.allow("client", &config));

        // Exactly at the boundary the window is still open.
        clock.advance(Duration::from_millis(60_000));
        assert!(!limiter.allow("client", &config));

        clock.advance(Duration::from_millis(1));
        assert!(limiter.allow("client", &config));
        let state = limiter.state("client").unwrap();
        assert_eq!(state.file_count, 1);
        assert_eq!(state.window_start, 1_060_001);
    }

    #[test]
    fn test_expired_windows_are_evicted() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(InMemoryRateLimitStore::with_clock(clock.clone()));
        let limiter = RateLimiter::new(store.clone());
        let config = config(10, 60_000);

        for i in 0..1_000 {
            assert!(limiter.allow(&format!("client-{}", i), &config));
        }

        clock.advance(Duration::from_millis(30_000));
        assert!(limiter.allow("recent", &config));

        clock.advance(Duration::from_millis(30_001));
        assert!(limiter.allow("late", &config));

        // Only windows still open survive the sweep
        assert!(limiter.state("client-0").is_none());
        assert!(limiter.state("client-999").is_none());
        assert_eq!(limiter.state("recent").unwrap().file_count, 1);
        assert_eq!(store.evict_expired(u64::MAX), 2);
    }

    #[test]
    fn test_evict_expired_keeps_open_windows() {
        let clock = Arc::new(ManualClock::new(5_000));
        let store = InMemoryRateLimitStore::with_clock(clock);
        store.set("old", RateLimitState { file_count: 3, window_start: 1_000 });
        store.set("new", RateLimitState { file_count: 1, window_start: 4_000 });

        assert_eq!(store.evict_expired(2_000), 1);
        assert!(store.get("old").is_none());
        assert!(store.get("new").is_some());
    }

    #[test]
    fn test_clients_are_independent() {
        let (limiter, _clock) = limiter_with_clock();
        let config = config(1, 60_000);

        assert!(limiter.allow("a", &config));
        assert!(!limiter.allow("a", &config));
        assert!(limiter.allow("b", &config));
        assert!(limiter.allow(DEFAULT_CLIENT_ID, &config));
    }

    #[test]
    fn test_concurrent_allows_never_exceed_cap() {
        let limiter = Arc::new(RateLimiter::default());
        let config = Arc::new(config(25, 60_000));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                let config = config.clone();
                std::thread::spawn(move || {
                    (0..10).filter(|_| limiter.allow("shared", &config)).count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 25);
    }
}
