//! Rate limiting primitives for the OTP send and verify gates.
//!
//! Fixed windows per key: the first request for a key opens a window, every
//! later request inside it bumps the counter, and the window restarts once
//! `window` has elapsed since it opened. Denied requests still count so
//! sustained abuse keeps the key throttled until the window rolls over.
//!
//! State lives in process memory only. Running several replicas gives each
//! replica its own budget.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

const DEFAULT_MAX_KEYS: usize = 100_000;
const UNKNOWN_CLIENT: &str = "unknown";
// A full map evicts this fraction of its capacity at once.
const EVICTION_DIVISOR: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitAction {
    SendCode,
    VerifyCode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

/// Window length and request budget applied to one key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub window: Duration,
    pub max_requests: u32,
}

impl RateLimitPolicy {
    #[must_use]
    pub const fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
        }
    }
}

pub trait RateLimiter: Send + Sync {
    fn check(&self, key: &str, policy: RateLimitPolicy) -> RateLimitDecision;
}

/// Build the limiter key for an action.
///
/// Send and verify use separate keys so mistyped codes never eat into the
/// budget for requesting a new one.
#[must_use]
pub fn rate_limit_key(action: RateLimitAction, client_ip: Option<&str>, email: &str) -> String {
    let ip = client_ip
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or(UNKNOWN_CLIENT);
    match action {
        RateLimitAction::SendCode => format!("{ip}:{email}"),
        RateLimitAction::VerifyCode => format!("{ip}:{email}:verify"),
    }
}

/// Verify key for one `{email, caseId}` pair regardless of client address.
///
/// Changing source addresses gets a fresh per-client budget but never a fresh
/// per-case one.
#[must_use]
pub fn case_verify_key(email: &str, case_id: &str) -> String {
    format!("case:{email}:{case_id}:verify")
}

#[derive(Clone, Copy, Debug)]
struct RateLimitRecord {
    count: u32,
    window_start: Instant,
    window: Duration,
}

impl RateLimitRecord {
    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= self.window
    }
}

#[derive(Debug)]
pub struct InMemoryRateLimiter {
    records: Mutex<HashMap<String, RateLimitRecord>>,
    max_keys: usize,
}

impl Default for InMemoryRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_keys(DEFAULT_MAX_KEYS)
    }

    /// Bound the number of tracked keys; zero is treated as one.
    #[must_use]
    pub fn with_max_keys(max_keys: usize) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            max_keys: max_keys.max(1),
        }
    }

    /// Same as [`RateLimiter::check`] with an explicit clock.
    pub fn check_at(&self, key: &str, policy: RateLimitPolicy, now: Instant) -> RateLimitDecision {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(record) = records.get_mut(key) {
            if !record.expired(now) {
                let previous = record.count;
                record.count = record.count.saturating_add(1);
                return if previous < policy.max_requests {
                    RateLimitDecision::Allowed
                } else {
                    RateLimitDecision::Limited
                };
            }
        } else if records.len() >= self.max_keys {
            make_room(&mut records, now, self.max_keys);
        }

        records.insert(
            key.to_string(),
            RateLimitRecord {
                count: 1,
                window_start: now,
                window: policy.window,
            },
        );
        RateLimitDecision::Allowed
    }

    /// Drop every record whose window has elapsed. Returns how many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|_, record| !record.expired(now));
        before - records.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RateLimiter for InMemoryRateLimiter {
    fn check(&self, key: &str, policy: RateLimitPolicy) -> RateLimitDecision {
        self.check_at(key, policy, Instant::now())
    }
}

// Stale windows go first. If that frees too little, the oldest live windows
// are evicted in one batch so a full map is not rescanned on every new key.
fn make_room(records: &mut HashMap<String, RateLimitRecord>, now: Instant, max_keys: usize) {
    records.retain(|_, record| !record.expired(now));

    let batch = (max_keys / EVICTION_DIVISOR).max(1);
    let target = max_keys.saturating_sub(batch);
    let excess = records.len().saturating_sub(target);
    if excess == 0 {
        return;
    }

    let mut starts: Vec<Instant> = records.values().map(|record| record.window_start).collect();
    let (_, cutoff, _) = starts.select_nth_unstable(excess - 1);
    let cutoff = *cutoff;

    let mut evicted = 0;
    records.retain(|_, record| {
        if evicted < excess && record.window_start <= cutoff {
            evicted += 1;
            false
        } else {
            true
        }
    });
    debug!(evicted, remaining = records.len(), "rate limiter evicted live windows");
}

/// Periodically sweep stale records so idle keys do not linger.
pub fn spawn_sweeper(limiter: Arc<InMemoryRateLimiter>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = limiter.sweep(Instant::now());
            if removed > 0 {
                debug!(removed, remaining = limiter.len(), "rate limiter sweep");
            }
        }
    })
}

#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn check(&self, _key: &str, _policy: RateLimitPolicy) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }
}
