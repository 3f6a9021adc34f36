//! Sliding-window admission control per identity and traffic category.
//!
//! Each check prunes events older than the trailing 60-second window, admits
//! the request iff the remaining count is under the category ceiling, and
//! records the event. State is process-local; it neither survives restarts
//! nor coordinates across instances.

use dashmap::DashMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

use crate::types::UserId;

/// Length of the trailing admission window.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Traffic categories with independent ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateCategory {
    /// Message create/edit/delete/forward.
    MessageMutation,
    /// Typing indicators.
    Typing,
    /// Everything without a dedicated ceiling.
    General,
    /// Authentication attempts; the tightest ceiling.
    Auth,
}

/// Per-minute ceilings for each category.
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub messages_per_minute: u32,
    pub typing_per_minute: u32,
    pub general_per_minute: u32,
    pub auth_per_minute: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            messages_per_minute: 30,
            typing_per_minute: 10,
            general_per_minute: 100,
            auth_per_minute: 5,
        }
    }
}

impl RateLimits {
    fn ceiling(&self, category: RateCategory) -> u32 {
        match category {
            RateCategory::MessageMutation => self.messages_per_minute,
            RateCategory::Typing => self.typing_per_minute,
            RateCategory::General => self.general_per_minute,
            RateCategory::Auth => self.auth_per_minute,
        }
    }
}

/// Sliding-window rate limiter keyed by (identity, category).
pub struct RateLimiter {
    limits: RateLimits,
    windows: DashMap<UserId, HashMap<RateCategory, Vec<Instant>>>,
}

impl RateLimiter {
    /// Create a limiter with the given ceilings.
    #[must_use]
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            windows: DashMap::new(),
        }
    }

    /// The identity used for traffic on not-yet-authenticated connections.
    #[must_use]
    pub fn anonymous() -> UserId {
        Uuid::nil()
    }

    /// Check and record one event. Returns `false` when the ceiling is hit;
    /// rejected events are not recorded.
    pub fn is_allowed(&self, identity: UserId, category: RateCategory) -> bool {
        self.check_at(identity, category, Instant::now())
    }

    fn check_at(&self, identity: UserId, category: RateCategory, now: Instant) -> bool {
        let ceiling = self.limits.ceiling(category) as usize;
        let mut entry = self.windows.entry(identity).or_default();
        let events = entry.entry(category).or_default();

        events.retain(|&ts| now.duration_since(ts) < WINDOW);

        if events.len() >= ceiling {
            warn!(
                identity = %identity,
                category = ?category,
                count = events.len(),
                ceiling,
                "Rate limit exceeded"
            );
            return false;
        }

        events.push(now);
        true
    }

    /// Drop all window state for an identity, e.g. on disconnect.
    pub fn reset(&self, identity: UserId) {
        self.windows.remove(&identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimits {
            messages_per_minute: 3,
            typing_per_minute: 2,
            general_per_minute: 5,
            auth_per_minute: 1,
        })
    }

    #[test]
    fn test_ceiling_within_window() {
        let limiter = limiter();
        let user = Uuid::new_v4();
        let now = Instant::now();

        for _ in 0..3 {
            assert!(limiter.check_at(user, RateCategory::MessageMutation, now));
        }
        assert!(!limiter.check_at(user, RateCategory::MessageMutation, now));

        // Other categories are unaffected.
        assert!(limiter.check_at(user, RateCategory::Typing, now));
    }

    #[test]
    fn test_events_age_out() {
        let limiter = limiter();
        let user = Uuid::new_v4();
        let start = Instant::now();

        assert!(limiter.check_at(user, RateCategory::Auth, start));
        assert!(!limiter.check_at(user, RateCategory::Auth, start + Duration::from_secs(59)));
        // The first event leaves the trailing window.
        assert!(limiter.check_at(user, RateCategory::Auth, start + Duration::from_secs(61)));
    }

    #[test]
    fn test_rejected_events_are_not_recorded() {
        let limiter = limiter();
        let user = Uuid::new_v4();
        let start = Instant::now();

        assert!(limiter.check_at(user, RateCategory::Auth, start));
        for i in 0..30 {
            assert!(!limiter.check_at(user, RateCategory::Auth, start + Duration::from_secs(i)));
        }
        // Only the admitted event counts against the window.
        assert!(limiter.check_at(user, RateCategory::Auth, start + Duration::from_secs(61)));
    }

    #[test]
    fn test_identities_are_independent() {
        let limiter = limiter();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Instant::now();

        assert!(limiter.check_at(a, RateCategory::Auth, now));
        assert!(!limiter.check_at(a, RateCategory::Auth, now));
        assert!(limiter.check_at(b, RateCategory::Auth, now));
    }

    #[test]
    fn test_reset_clears_state() {
        let limiter = limiter();
        let user = Uuid::new_v4();
        let now = Instant::now();

        assert!(limiter.check_at(user, RateCategory::Auth, now));
        assert!(!limiter.check_at(user, RateCategory::Auth, now));

        limiter.reset(user);
        assert!(limiter.check_at(user, RateCategory::Auth, now));
    }
}
