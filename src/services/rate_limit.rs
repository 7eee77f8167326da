//! Per-tenant, per-endpoint fixed-window rate limiting.
//!
//! Counters live in process memory only. Each instance enforces its own
//! limit when several API processes run side by side.

use crate::config::{RateLimitRule, RateLimitSettings};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Longest accepted window: one leap year.
pub const MAX_WINDOW_SECS: u64 = 366 * 24 * 60 * 60;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RateLimitConfigError {
    #[error("rate limit for {scope} must allow at least one request")]
    ZeroMax { scope: String },

    #[error("rate limit window for {scope} must be greater than 0")]
    ZeroWindow { scope: String },

    #[error("rate limit window for {scope} is too large")]
    WindowTooLarge { scope: String },
}

/// Outcome of a single [`RateLimiter::allow`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    /// Seconds until the window resets, rounded up and never below 1.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000).max(1)
    }
}

#[derive(Debug, Clone, Copy)]
struct Limit {
    max_requests: u32,
    window: TimeDelta,
}

impl Limit {
    fn from_rule(rule: &RateLimitRule, scope: &str) -> Result<Self, RateLimitConfigError> {
        if rule.max_requests == 0 {
            return Err(RateLimitConfigError::ZeroMax {
                scope: scope.to_string(),
            });
        }
        if rule.window_secs == 0 {
            return Err(RateLimitConfigError::ZeroWindow {
                scope: scope.to_string(),
            });
        }
        if rule.window_secs > MAX_WINDOW_SECS {
            return Err(RateLimitConfigError::WindowTooLarge {
                scope: scope.to_string(),
            });
        }
        let window = TimeDelta::from_std(rule.window()).map_err(|_| {
            RateLimitConfigError::WindowTooLarge {
                scope: scope.to_string(),
            }
        })?;
        Ok(Self {
            max_requests: rule.max_requests,
            window,
        })
    }
}

fn window_end(now: DateTime<Utc>, window: TimeDelta) -> DateTime<Utc> {
    now.checked_add_signed(window)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug)]
struct Counter {
    count: u32,
    window_end: DateTime<Utc>,
    last_access: DateTime<Utc>,
    window: TimeDelta,
}

/// Fixed-window counters keyed by `tenant:path`, guarded by one lock.
#[derive(Debug)]
pub struct RateLimiter {
    default: Limit,
    overrides: HashMap<String, Limit>,
    counters: Mutex<HashMap<String, Counter>>,
}

impl RateLimiter {
    pub fn new(
        default: RateLimitRule,
        overrides: &HashMap<String, RateLimitRule>,
    ) -> Result<Self, RateLimitConfigError> {
        let default = Limit::from_rule(&default, "the default rule")?;
        let overrides = overrides
            .iter()
            .map(|(path, rule)| Ok((path.clone(), Limit::from_rule(rule, path)?)))
            .collect::<Result<HashMap<_, _>, RateLimitConfigError>>()?;

        Ok(Self {
            default,
            overrides,
            counters: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_settings(settings: &RateLimitSettings) -> Result<Self, RateLimitConfigError> {
        Self::new(settings.default_rule(), &settings.endpoints)
    }

    fn limit_for(&self, path: &str) -> Limit {
        self.overrides.get(path).copied().unwrap_or(self.default)
    }

    pub fn allow(&self, tenant: Option<&str>, path: &str) -> RateLimitDecision {
        self.allow_at(tenant, path, Utc::now())
    }

    /// Count one request for `tenant` on `path` at `now`.
    ///
    /// Anonymous callers (no key, or an empty one) are always allowed and
    /// never create a counter.
    pub fn allow_at(&self, tenant: Option<&str>, path: &str, now: DateTime<Utc>) -> RateLimitDecision {
        let limit = self.limit_for(path);

        let tenant = match tenant {
            Some(t) if !t.is_empty() => t,
            _ => {
                return RateLimitDecision {
                    allowed: true,
                    limit: self.default.max_requests,
                    remaining: self.default.max_requests,
                    reset_at: window_end(now, self.default.window),
                }
            }
        };

        let key = format!("{}:{}", tenant, path);
        let mut counters = self.counters.lock();
        let counter = counters.entry(key).or_insert_with(|| Counter {
            count: 0,
            window_end: now,
            last_access: now,
            window: limit.window,
        });

        if counter.count == 0 || now > counter.window_end {
            counter.count = 1;
            counter.window_end = window_end(now, limit.window);
            counter.window = limit.window;
        } else {
            counter.count = counter.count.saturating_add(1);
        }
        counter.last_access = now;

        RateLimitDecision {
            allowed: counter.count <= limit.max_requests,
            limit: limit.max_requests,
            remaining: limit.max_requests.saturating_sub(counter.count),
            reset_at: counter.window_end,
        }
    }

    /// Drop counters not touched for more than twice their window.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut counters = self.counters.lock();
        let before = counters.len();
        counters.retain(|_, c| {
            match c.window.checked_mul(2).and_then(|idle| now.checked_sub_signed(idle)) {
                Some(cutoff) => c.last_access >= cutoff,
                None => true,
            }
        });
        before - counters.len()
    }

    pub fn len(&self) -> usize {
        self.counters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Periodically sweep stale counters until `cancel` fires.
pub async fn run_sweeper(limiter: Arc<RateLimiter>, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let removed = limiter.sweep_at(Utc::now());
        tracing::debug!(
            removed,
            remaining = limiter.len(),
            "Rate limit sweep finished"
        );
    }

    tracing::info!("Rate limit sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(max_requests: u32, window_secs: u64) -> RateLimitRule {
        RateLimitRule {
            max_requests,
            window_secs,
        }
    }

    fn limiter(max_requests: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(rule(max_requests, window_secs), &HashMap::new()).unwrap()
    }

    #[test]
    fn test_rejects_after_max_and_reports_remaining() {
        let limiter = limiter(3, 60);
        let now = Utc::now();

        let remaining: Vec<u32> = (0..3)
            .map(|_| {
                let d = limiter.allow_at(Some("t1"), "/api/v1/faces", now);
                assert!(d.allowed);
                d.remaining
            })
            .collect();
        assert_eq!(remaining, vec![2, 1, 0]);

        let rejected = limiter.allow_at(Some("t1"), "/api/v1/faces", now);
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert_eq!(rejected.limit, 3);
        assert_eq!(rejected.reset_at, now + TimeDelta::seconds(60));
        assert_eq!(rejected.retry_after_secs(now), 60);
    }

    #[test]
    fn test_window_resets_after_end() {
        let limiter = limiter(2, 10);
        let start = Utc::now();
        limiter.allow_at(Some("t1"), "/p", start);
        limiter.allow_at(Some("t1"), "/p", start);
        assert!(!limiter.allow_at(Some("t1"), "/p", start).allowed);

        // The boundary instant itself still belongs to the old window.
        let edge = start + TimeDelta::seconds(10);
        assert!(!limiter.allow_at(Some("t1"), "/p", edge).allowed);

        let after = edge + TimeDelta::milliseconds(1);
        let d = limiter.allow_at(Some("t1"), "/p", after);
        assert!(d.allowed);
        assert_eq!(d.remaining, 1);
        assert_eq!(d.reset_at, after + TimeDelta::seconds(10));
    }

    #[test]
    fn test_tenants_and_paths_are_isolated() {
        let limiter = limiter(1, 60);
        let now = Utc::now();
        assert!(limiter.allow_at(Some("a"), "/p", now).allowed);
        assert!(!limiter.allow_at(Some("a"), "/p", now).allowed);
        assert!(limiter.allow_at(Some("b"), "/p", now).allowed);
        assert!(limiter.allow_at(Some("a"), "/q", now).allowed);
        assert_eq!(limiter.len(), 3);
    }

    #[test]
    fn test_override_applies_to_exact_path_only() {
        let mut overrides = HashMap::new();
        overrides.insert("/api/v1/admin".to_string(), rule(2, 30));
        let limiter = RateLimiter::new(rule(100, 60), &overrides).unwrap();
        let now = Utc::now();

        let admin = limiter.allow_at(Some("t"), "/api/v1/admin", now);
        assert_eq!(admin.limit, 2);
        assert_eq!(admin.reset_at, now + TimeDelta::seconds(30));

        let nested = limiter.allow_at(Some("t"), "/api/v1/admin/users", now);
        assert_eq!(nested.limit, 100);
    }

    #[test]
    fn test_anonymous_bypass_creates_no_counter() {
        let limiter = limiter(1, 60);
        let now = Utc::now();
        for _ in 0..5 {
            let none = limiter.allow_at(None, "/p", now);
            let empty = limiter.allow_at(Some(""), "/p", now);
            assert!(none.allowed && empty.allowed);
            assert_eq!(none.remaining, 1);
        }
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_sweep_drops_idle_counters() {
        let limiter = limiter(10, 60);
        let start = Utc::now();
        limiter.allow_at(Some("old"), "/p", start);
        limiter.allow_at(Some("fresh"), "/p", start + TimeDelta::seconds(100));

        assert_eq!(limiter.sweep_at(start + TimeDelta::seconds(120)), 0);
        assert_eq!(limiter.sweep_at(start + TimeDelta::seconds(121)), 1);
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn test_invalid_rules_are_rejected() {
        assert_eq!(
            RateLimiter::new(rule(0, 60), &HashMap::new()).unwrap_err(),
            RateLimitConfigError::ZeroMax {
                scope: "the default rule".to_string()
            }
        );
        assert!(matches!(
            RateLimiter::new(rule(1, 0), &HashMap::new()),
            Err(RateLimitConfigError::ZeroWindow { .. })
        ));

        let mut overrides = HashMap::new();
        overrides.insert("/x".to_string(), rule(1, u64::MAX));
        assert!(matches!(
            RateLimiter::new(rule(1, 1), &overrides),
            Err(RateLimitConfigError::WindowTooLarge { .. })
        ));
    }

    #[test]
    fn test_window_past_calendar_range_is_rejected() {
        assert!(matches!(
            RateLimiter::new(rule(1, 10_000_000_000_000), &HashMap::new()),
            Err(RateLimitConfigError::WindowTooLarge { .. })
        ));
        assert!(matches!(
            RateLimiter::new(rule(1, MAX_WINDOW_SECS + 1), &HashMap::new()),
            Err(RateLimitConfigError::WindowTooLarge { .. })
        ));

        let mut config = crate::config::Config::default();
        config.rate_limit.window_secs = 10_000_000_000_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_longest_window_never_overflows() {
        let limiter = limiter(1, MAX_WINDOW_SECS);
        let far = DateTime::<Utc>::MAX_UTC - TimeDelta::seconds(10);

        let first = limiter.allow_at(Some("t"), "/p", far);
        assert!(first.allowed);
        assert_eq!(first.reset_at, DateTime::<Utc>::MAX_UTC);
        assert!(!limiter.allow_at(Some("t"), "/p", far).allowed);
        assert!(limiter.allow_at(None, "/p", far).allowed);

        let early = DateTime::<Utc>::MIN_UTC + TimeDelta::seconds(10);
        limiter.allow_at(Some("u"), "/p", early);
        assert_eq!(limiter.sweep_at(early), 0);
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let limiter = Arc::new(limiter(1000, 60));
        let now = Utc::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        limiter.allow_at(Some("t"), "/p", now);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(limiter.allow_at(Some("t"), "/p", now).remaining, 1000 - 401);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let limiter = Arc::new(limiter(1, 60));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_sweeper(
            limiter,
            Duration::from_millis(10),
            cancel.clone(),
        ));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
