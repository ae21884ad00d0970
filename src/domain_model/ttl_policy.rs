use crate::domain_model::Session;
use chrono::{DateTime, Utc};
use std::time::Duration;

pub const DEFAULT_REFRESH_THRESHOLD: f64 = 0.5;
/// Upper bound for both durations, about a century.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid ttl policy: {0}")]
pub struct InvalidTtlPolicy(pub String);

/// Sliding expiration bounded by an absolute lifetime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TtlPolicy {
    idle_timeout: Duration,
    max_lifetime: Duration,
    refresh_threshold: f64,
}

impl TtlPolicy {
    pub fn new(
        idle_timeout: Duration,
        max_lifetime: Duration,
        refresh_threshold: f64,
    ) -> Result<Self, InvalidTtlPolicy> {
        if idle_timeout.as_millis() == 0 {
            return Err(InvalidTtlPolicy("idle timeout must be positive".into()));
        }
        if max_lifetime < idle_timeout {
            return Err(InvalidTtlPolicy(format!(
                "max lifetime {:?} is shorter than idle timeout {:?}",
                max_lifetime, idle_timeout
            )));
        }
        if !(refresh_threshold > 0.0 && refresh_threshold <= 1.0) {
            return Err(InvalidTtlPolicy(format!(
                "refresh threshold {} is outside (0, 1]",
                refresh_threshold
            )));
        }
        if max_lifetime > MAX_TTL {
            return Err(InvalidTtlPolicy(format!(
                "max lifetime {:?} exceeds the {:?} limit",
                max_lifetime, MAX_TTL
            )));
        }
        Ok(TtlPolicy {
            idle_timeout,
            max_lifetime,
            refresh_threshold,
        })
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn max_lifetime(&self) -> Duration {
        self.max_lifetime
    }

    /// `min(now + idle_timeout, created_at + max_lifetime)`
    pub fn compute_expiry(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        let idle = offset(now, self.idle_timeout);
        let hard = offset(created_at, self.max_lifetime);
        idle.min(hard)
    }

    /// TTL to attach to a write at `now`, or `None` once the absolute
    /// lifetime is used up. Sub-millisecond remainders count as used up.
    pub fn ttl_at(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
        (self.compute_expiry(created_at, now) - now)
            .to_std()
            .ok()
            .filter(|ttl| ttl.as_millis() > 0)
    }

    /// True when less than `refresh_threshold` of the idle window remains
    /// and rewriting the TTL would actually push the expiry out.
    pub fn should_refresh(&self, session: &Session, remaining: Duration, now: DateTime<Utc>) -> bool {
        if remaining >= self.idle_timeout.mul_f64(self.refresh_threshold) {
            return false;
        }
        match self.ttl_at(session.created_at, now) {
            Some(extended) => extended > remaining,
            None => false,
        }
    }
}

// saturates at the end of representable time
fn offset(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|by| at.checked_add_signed(by))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
