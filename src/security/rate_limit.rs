//! Per-operation quota enforcement with escalating block and blacklist.
//!
//! Every `(operation, source)` pair maps to one [`RateLimitEntry`], keyed
//! by HMAC-SHA256 of the pair under a per-limiter random salt, truncated to
//! 16 bytes and hex encoded. Raw source identifiers (IPs, user names) never
//! sit in the table, and keys do not carry over between limiters.
//!
//! # Escalation
//!
//! | Violations | Effect |
//! |------------|--------|
//! | 1-2        | request rejected; a later success decays the count by one |
//! | 3..9       | rejected and blocked for `2 × window` |
//! | 10         | key moved to the blacklist for the limiter's lifetime |
//!
//! Requests rejected while blocked or blacklisted do not add violations.
//! The limiter never returns an error: callers branch on `bool` or on
//! [`RateLimitStatus`].

use hmac::{Hmac, Mac};
use rand::RngExt;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::events::{Auditor, EventBus, EventKind, SecurityEvent, Severity};

type HmacSha256 = Hmac<Sha256>;

/// Violations that trigger a temporary block.
pub const BLOCK_THRESHOLD: u32 = 3;
/// Cumulative violations that blacklist a key.
pub const BLACKLIST_THRESHOLD: u32 = 10;
/// Entries idle for longer than this are swept.
pub const INACTIVITY_TTL: Duration = Duration::from_secs(60 * 60);
/// How often the background sweeper runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Maximum blacklisted keys; the least recently hit key is evicted beyond this.
pub const BLACKLIST_CAPACITY: usize = 1_000;
/// Longest window a profile can express; larger `window_ms` values are capped.
pub const MAX_WINDOW: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Profile used for operations without an explicit profile.
pub const DEFAULT_OPERATION: &str = "default";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    TokenBucket,
    SlidingWindow,
    FixedWindow,
}

/// Quota parameters for one operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitProfile {
    pub window_ms: u64,
    pub max_requests: u32,
    pub bucket_capacity: u32,
    /// Tokens added per second.
    pub refill_rate: f64,
    #[serde(default)]
    pub algorithm: Algorithm,
}

impl RateLimitProfile {
    pub fn token_bucket(window_ms: u64, bucket_capacity: u32, refill_rate: f64) -> Self {
        Self {
            window_ms,
            max_requests: bucket_capacity,
            bucket_capacity,
            refill_rate,
            algorithm: Algorithm::TokenBucket,
        }
    }

    pub fn fixed_window(window_ms: u64, max_requests: u32) -> Self {
        Self {
            window_ms,
            max_requests,
            bucket_capacity: max_requests,
            refill_rate: 0.0,
            algorithm: Algorithm::FixedWindow,
        }
    }

    pub fn sliding_window(window_ms: u64, max_requests: u32) -> Self {
        Self {
            algorithm: Algorithm::SlidingWindow,
            ..Self::fixed_window(window_ms, max_requests)
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms.max(1)).min(MAX_WINDOW)
    }

    /// Tokens per second, with negative or non-finite rates read as no refill.
    fn effective_refill_rate(&self) -> f64 {
        if self.refill_rate.is_finite() {
            self.refill_rate.max(0.0)
        } else {
            0.0
        }
    }

    /// Reject parameters the limiter cannot honor.
    pub fn check(&self) -> Result<(), String> {
        if !self.refill_rate.is_finite() || self.refill_rate < 0.0 {
            return Err(format!(
                "refill_rate must be a finite number >= 0, got {}",
                self.refill_rate
            ));
        }
        Ok(())
    }

    fn limit(&self) -> u32 {
        match self.algorithm {
            Algorithm::TokenBucket => self.bucket_capacity,
            Algorithm::SlidingWindow | Algorithm::FixedWindow => self.max_requests,
        }
    }
}

/// Built-in profiles for the operations the surrounding tool performs.
pub fn default_profiles() -> HashMap<String, RateLimitProfile> {
    HashMap::from([
        (
            "config_load".to_string(),
            RateLimitProfile::token_bucket(60_000, 10, 0.5),
        ),
        (
            "error_generation".to_string(),
            RateLimitProfile::token_bucket(60_000, 20, 2.0),
        ),
        (
            "resource_probe".to_string(),
            RateLimitProfile::token_bucket(60_000, 10, 1.0),
        ),
        (
            "logging".to_string(),
            RateLimitProfile::token_bucket(1_000, 100, 100.0),
        ),
        (
            "api_call".to_string(),
            RateLimitProfile::token_bucket(60_000, 10, 1.0),
        ),
        (
            DEFAULT_OPERATION.to_string(),
            RateLimitProfile::token_bucket(60_000, 60, 1.0),
        ),
    ])
}

/// Mutable quota state for one `(operation, source)` key.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitEntry {
    /// Requests seen in the current window.
    pub count: u32,
    /// Count carried over from the previous window (sliding window only).
    pub previous_count: u32,
    pub window_start: Instant,
    pub first_request: Instant,
    pub last_request: Instant,
    pub tokens: f64,
    pub last_refill: Instant,
    pub violations: u32,
    pub blocked: bool,
    pub blocked_until: Option<Instant>,
}

impl RateLimitEntry {
    fn new(now: Instant, profile: &RateLimitProfile) -> Self {
        Self {
            count: 0,
            previous_count: 0,
            window_start: now,
            first_request: now,
            last_request: now,
            tokens: profile.bucket_capacity as f64,
            last_refill: now,
            violations: 0,
            blocked: false,
            blocked_until: None,
        }
    }

    fn refill(&mut self, now: Instant, profile: &RateLimitProfile) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let capacity = profile.bucket_capacity as f64;
        self.tokens = (self.tokens + elapsed * profile.effective_refill_rate()).clamp(0.0, capacity);
        self.last_refill = now;
    }

    fn roll_window(&mut self, now: Instant, profile: &RateLimitProfile) {
        let window = profile.window();
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= window.saturating_mul(2) {
            self.previous_count = 0;
            self.count = 0;
            self.window_start = now;
        } else if elapsed >= window {
            self.previous_count = match profile.algorithm {
                Algorithm::SlidingWindow => self.count,
                _ => 0,
            };
            self.count = 0;
            self.window_start += window;
        }
    }

    /// Weighted request estimate for the sliding window algorithm.
    fn sliding_estimate(&self, now: Instant, profile: &RateLimitProfile) -> f64 {
        let window = profile.window().as_secs_f64();
        let offset = now.saturating_duration_since(self.window_start).as_secs_f64();
        let weight = (1.0 - offset / window).clamp(0.0, 1.0);
        self.previous_count as f64 * weight + self.count as f64
    }

    /// Apply the algorithm; consumes quota when the request is allowed.
    fn try_acquire(&mut self, now: Instant, profile: &RateLimitProfile) -> bool {
        match profile.algorithm {
            Algorithm::TokenBucket => {
                self.refill(now, profile);
                self.count = self.count.saturating_add(1);
                if self.tokens >= 1.0 {
                    self.tokens -= 1.0;
                    true
                } else {
                    false
                }
            }
            Algorithm::FixedWindow => {
                self.roll_window(now, profile);
                if self.count < profile.max_requests {
                    self.count += 1;
                    true
                } else {
                    false
                }
            }
            Algorithm::SlidingWindow => {
                self.roll_window(now, profile);
                if self.sliding_estimate(now, profile) < profile.max_requests as f64 {
                    self.count += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn remaining(&self, now: Instant, profile: &RateLimitProfile) -> u32 {
        match profile.algorithm {
            Algorithm::TokenBucket => self.tokens.floor().max(0.0) as u32,
            Algorithm::FixedWindow => profile.max_requests.saturating_sub(self.count),
            Algorithm::SlidingWindow => {
                let estimate = self.sliding_estimate(now, profile).ceil() as u32;
                profile.max_requests.saturating_sub(estimate)
            }
        }
    }

    /// Time until the next request would pass the algorithm check, or `None`
    /// when an empty bucket never refills.
    fn wait_for_capacity(&self, now: Instant, profile: &RateLimitProfile) -> Option<Duration> {
        match profile.algorithm {
            Algorithm::TokenBucket => {
                let rate = profile.effective_refill_rate();
                if self.tokens >= 1.0 {
                    Some(Duration::ZERO)
                } else if rate <= 0.0 {
                    None
                } else {
                    Some(saturating_secs((1.0 - self.tokens) / rate))
                }
            }
            Algorithm::FixedWindow => {
                if self.count < profile.max_requests {
                    Some(Duration::ZERO)
                } else {
                    Some(self.until_window_end(now, profile))
                }
            }
            Algorithm::SlidingWindow => {
                let max = profile.max_requests as f64;
                if self.sliding_estimate(now, profile) < max {
                    return Some(Duration::ZERO);
                }
                let window = profile.window().as_secs_f64();
                let offset = now.saturating_duration_since(self.window_start).as_secs_f64();
                let current = self.count as f64;
                let previous = self.previous_count as f64;
                let secs = if current < max && previous > 0.0 {
                    // The previous window's weight decays below the headroom.
                    window * (1.0 - (max - current) / previous) - offset
                } else {
                    // Current window must itself become the decaying one.
                    (window - offset) + window * (1.0 - max / current.max(1.0))
                };
                Some(saturating_secs(secs.max(0.0)))
            }
        }
    }

    fn until_window_end(&self, now: Instant, profile: &RateLimitProfile) -> Duration {
        (self.window_start + profile.window()).saturating_duration_since(now)
    }

    fn reset_after(&self, now: Instant, profile: &RateLimitProfile) -> Duration {
        match profile.algorithm {
            Algorithm::TokenBucket => self
                .wait_for_capacity(now, profile)
                .unwrap_or(Duration::MAX),
            Algorithm::FixedWindow | Algorithm::SlidingWindow => {
                self.until_window_end(now, profile)
            }
        }
    }
}

/// Read-only view of a key's quota.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the quota replenishes (window end, or next token).
    #[serde(with = "duration_ms")]
    pub reset_after: Duration,
    /// Set when the next request would be rejected and waiting helps.
    #[serde(with = "option_duration_ms")]
    pub retry_after: Option<Duration>,
    pub blocked: bool,
    pub blacklisted: bool,
}

/// Bounded LRU of blacklisted keys.
struct Blacklist {
    keys: HashMap<String, Instant>,
    capacity: usize,
}

impl Blacklist {
    fn new(capacity: usize) -> Self {
        Self {
            keys: HashMap::new(),
            capacity,
        }
    }

    fn hit(&mut self, key: &str, now: Instant) -> bool {
        match self.keys.get_mut(key) {
            Some(last_hit) => {
                *last_hit = now;
                true
            }
            None => false,
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    fn insert(&mut self, key: String, now: Instant) {
        if self.keys.len() >= self.capacity && !self.keys.contains_key(&key) {
            let victim = self
                .keys
                .iter()
                .min_by_key(|(_, last_hit)| **last_hit)
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                warn!(
                    evicted = %victim,
                    capacity = self.capacity,
                    "Blacklist full, evicting least recently seen key"
                );
                self.keys.remove(&victim);
            }
        }
        self.keys.insert(key, now);
    }
}

struct LimiterState {
    entries: HashMap<String, RateLimitEntry>,
    blacklist: Blacklist,
}

/// Quota enforcement for every operation the core guards.
pub struct RateLimiter {
    profiles: HashMap<String, RateLimitProfile>,
    state: Mutex<LimiterState>,
    clock: Arc<dyn Clock>,
    salt: [u8; 32],
    auditor: Auditor,
}

impl RateLimiter {
    pub fn new(profiles: HashMap<String, RateLimitProfile>, bus: Arc<EventBus>) -> Self {
        Self::with_clock(profiles, bus, Arc::new(SystemClock))
    }

    pub fn with_clock(
        profiles: HashMap<String, RateLimitProfile>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut salt = [0u8; 32];
        rand::rng().fill(&mut salt);

        Self {
            profiles,
            state: Mutex::new(LimiterState {
                entries: HashMap::new(),
                blacklist: Blacklist::new(BLACKLIST_CAPACITY),
            }),
            clock,
            salt,
            auditor: Auditor::new(bus),
        }
    }

    /// Profile for an operation, falling back to [`DEFAULT_OPERATION`].
    pub fn profile(&self, operation: &str) -> RateLimitProfile {
        self.profiles
            .get(operation)
            .or_else(|| self.profiles.get(DEFAULT_OPERATION))
            .cloned()
            .unwrap_or_else(|| RateLimitProfile::token_bucket(60_000, 60, 1.0))
    }

    /// Check and consume quota. Returns `false` when the request must be rejected.
    pub fn check_limit(&self, operation: &str, source: &str) -> bool {
        let profile = self.profile(operation);
        let key = self.key_for(operation, source);
        let now = self.clock.now();
        let event_source = format!("rate_limiter:{}", operation);

        let mut state = self.lock();

        if state.blacklist.hit(&key, now) {
            drop(state);
            self.auditor.record(
                SecurityEvent::new(EventKind::Blocked, Severity::High, event_source, &key)
                    .with_detail("source is blacklisted"),
            );
            return false;
        }

        let entry = state
            .entries
            .entry(key.clone())
            .or_insert_with(|| RateLimitEntry::new(now, &profile));
        entry.last_request = now;

        if let Some(until) = entry.blocked_until {
            if now < until {
                drop(state);
                self.auditor.record(
                    SecurityEvent::new(EventKind::Blocked, Severity::Medium, event_source, &key)
                        .with_detail("temporarily blocked"),
                );
                return false;
            }
            entry.blocked_until = None;
            entry.blocked = false;
        }

        if entry.try_acquire(now, &profile) {
            if entry.violations > 0 && entry.violations < BLOCK_THRESHOLD {
                entry.violations -= 1;
            }
            return true;
        }

        entry.violations += 1;
        let violations = entry.violations;
        let mut events = vec![
            SecurityEvent::new(
                EventKind::RateLimitExceeded,
                Severity::Medium,
                event_source.clone(),
                &key,
            )
            .with_detail(format!("violation {}", violations)),
        ];

        if violations >= BLACKLIST_THRESHOLD {
            state.entries.remove(&key);
            state.blacklist.insert(key.clone(), now);
            info!(operation, key = %key, "Rate limit key blacklisted");
            events.push(
                SecurityEvent::new(EventKind::Blacklisted, Severity::Critical, event_source, &key)
                    .with_detail(format!("{} cumulative violations", violations)),
            );
        } else if violations >= BLOCK_THRESHOLD {
            let block_for = profile.window().saturating_mul(2);
            entry.blocked = true;
            entry.blocked_until = now
                .checked_add(block_for)
                .or_else(|| now.checked_add(MAX_WINDOW));
            events.push(
                SecurityEvent::new(EventKind::Blocked, Severity::High, event_source, &key)
                    .with_detail(format!("blocked for {}ms", block_for.as_millis())),
            );
        }
        drop(state);

        for event in events {
            self.auditor.record(event);
        }
        false
    }

    /// Inspect quota without consuming it.
    pub fn status(&self, operation: &str, source: &str) -> RateLimitStatus {
        let profile = self.profile(operation);
        let key = self.key_for(operation, source);
        let now = self.clock.now();
        let state = self.lock();

        if state.blacklist.contains(&key) {
            return RateLimitStatus {
                allowed: false,
                limit: profile.limit(),
                remaining: 0,
                reset_after: Duration::ZERO,
                retry_after: None,
                blocked: true,
                blacklisted: true,
            };
        }

        let mut entry = match state.entries.get(&key) {
            Some(entry) => entry.clone(),
            None => RateLimitEntry::new(now, &profile),
        };
        drop(state);

        if let Some(until) = entry.blocked_until
            && now < until
        {
            let wait = until - now;
            return RateLimitStatus {
                allowed: false,
                limit: profile.limit(),
                remaining: 0,
                reset_after: wait,
                retry_after: Some(wait),
                blocked: true,
                blacklisted: false,
            };
        }

        match profile.algorithm {
            Algorithm::TokenBucket => entry.refill(now, &profile),
            _ => entry.roll_window(now, &profile),
        }
        let wait = entry.wait_for_capacity(now, &profile);
        let allowed = wait == Some(Duration::ZERO);

        RateLimitStatus {
            allowed,
            limit: profile.limit(),
            remaining: entry.remaining(now, &profile),
            reset_after: entry.reset_after(now, &profile),
            retry_after: if allowed { None } else { wait },
            blocked: false,
            blacklisted: false,
        }
    }

    /// Snapshot of the entry for a key, if one exists.
    pub fn entry(&self, operation: &str, source: &str) -> Option<RateLimitEntry> {
        let key = self.key_for(operation, source);
        self.lock().entries.get(&key).cloned()
    }

    pub fn is_blacklisted(&self, operation: &str, source: &str) -> bool {
        let key = self.key_for(operation, source);
        self.lock().blacklist.contains(&key)
    }

    pub fn tracked_keys(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn blacklist_len(&self) -> usize {
        self.lock().blacklist.keys.len()
    }

    /// Evict entries idle for longer than [`INACTIVITY_TTL`]. Idempotent.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.lock();
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| now.saturating_duration_since(entry.last_request) <= INACTIVITY_TTL);
        let removed = before - state.entries.len();
        if removed > 0 {
            debug!(removed, "Swept idle rate limit entries");
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every `every` until the handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                ticker.tick().await;
                limiter.sweep();
            }
        })
    }

    pub fn auditor(&self) -> &Auditor {
        &self.auditor
    }

    fn key_for(&self, operation: &str, source: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.salt)
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
        mac.update(operation.as_bytes());
        mac.update(&[0]);
        mac.update(source.as_bytes());
        mac.finalize()
            .into_bytes()
            .iter()
            .take(16)
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Seconds as a `Duration`, capped at `Duration::MAX`.
fn saturating_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

mod option_duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }
}
