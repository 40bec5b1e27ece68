//! Local call budget for the generation API.
//!
//! Two budgets apply at once: a sliding 60 second window and a per-day counter
//! that resets when the UTC date changes. A cooldown set after a provider
//! rejection overrides both.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const MINUTE_WINDOW: Duration = Duration::from_secs(60);

/// Floor for any cooldown derived from a provider retry hint.
pub const MIN_COOLDOWN: Duration = Duration::from_secs(60);

/// Ceiling for any cooldown, whatever the provider asks for.
pub const MAX_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

/// Configured ceilings. Keep these below the provider's published limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimits {
    pub max_calls_per_minute: u32,
    pub max_calls_per_day: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        // Provider free tier: 15/minute, 1500/day.
        Self {
            max_calls_per_minute: 12,
            max_calls_per_day: 1400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    Cooldown { remaining: Duration },
    DailyLimit { used: u32, limit: u32 },
    MinuteLimit { wait: Duration },
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cooldown { remaining } => {
                write!(f, "cooldown active, {}s remaining", remaining.as_secs().max(1))
            }
            Self::DailyLimit { used, limit } => {
                write!(f, "daily limit reached ({used}/{limit})")
            }
            Self::MinuteLimit { wait } => {
                write!(f, "per-minute limit reached, wait {}s", wait.as_secs().max(1))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied(DenyReason),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub calls_last_minute: u32,
    pub minute_limit: u32,
    pub calls_today: u32,
    pub daily_limit: u32,
    pub cooldown_remaining_seconds: Option<u64>,
}

#[derive(Debug)]
struct BudgetState {
    window: VecDeque<DateTime<Utc>>,
    daily_count: u32,
    daily_date: NaiveDate,
    cooldown_until: Option<DateTime<Utc>>,
}

impl BudgetState {
    fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today > self.daily_date {
            tracing::info!(
                previous = %self.daily_date,
                %today,
                calls = self.daily_count,
                "generation daily budget reset"
            );
            self.daily_date = today;
            self.daily_count = 0;
        }
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        while let Some(oldest) = self.window.front() {
            if elapsed(*oldest, now) >= MINUTE_WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Process-wide budget shared between the worker and operator reads.
#[derive(Debug)]
pub struct RateLimiter {
    limits: RateLimits,
    state: Mutex<BudgetState>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self::new_at(limits, Utc::now())
    }

    pub fn new_at(limits: RateLimits, now: DateTime<Utc>) -> Self {
        Self {
            limits,
            state: Mutex::new(BudgetState {
                window: VecDeque::new(),
                daily_count: 0,
                daily_date: now.date_naive(),
                cooldown_until: None,
            }),
        }
    }

    pub fn can_call(&self) -> Admission {
        self.can_call_at(Utc::now())
    }

    pub fn can_call_at(&self, now: DateTime<Utc>) -> Admission {
        let mut state = self.state();

        if let Some(until) = state.cooldown_until {
            if now < until {
                return Admission::Denied(DenyReason::Cooldown {
                    remaining: elapsed(now, until),
                });
            }
            state.cooldown_until = None;
        }

        state.roll_day(now);
        if state.daily_count >= self.limits.max_calls_per_day {
            return Admission::Denied(DenyReason::DailyLimit {
                used: state.daily_count,
                limit: self.limits.max_calls_per_day,
            });
        }

        state.evict(now);
        if state.window.len() >= self.limits.max_calls_per_minute as usize {
            let wait = state
                .window
                .front()
                .map(|oldest| MINUTE_WINDOW.saturating_sub(elapsed(*oldest, now)))
                .unwrap_or(MINUTE_WINDOW);
            return Admission::Denied(DenyReason::MinuteLimit { wait });
        }

        Admission::Allowed
    }

    pub fn register_call(&self) {
        self.register_call_at(Utc::now());
    }

    pub fn register_call_at(&self, now: DateTime<Utc>) {
        let mut state = self.state();
        state.roll_day(now);
        state.window.push_back(now);
        state.daily_count = state.daily_count.saturating_add(1);
    }

    pub fn usage_stats(&self) -> UsageStats {
        self.usage_stats_at(Utc::now())
    }

    pub fn usage_stats_at(&self, now: DateTime<Utc>) -> UsageStats {
        let mut state = self.state();
        state.evict(now);
        let calls_today = if now.date_naive() > state.daily_date {
            0
        } else {
            state.daily_count
        };
        UsageStats {
            calls_last_minute: state.window.len() as u32,
            minute_limit: self.limits.max_calls_per_minute,
            calls_today,
            daily_limit: self.limits.max_calls_per_day,
            cooldown_remaining_seconds: state
                .cooldown_until
                .filter(|until| now < *until)
                .map(|until| elapsed(now, until).as_secs()),
        }
    }

    /// Refuse calls for `duration`, capped at [`MAX_COOLDOWN`]. An existing
    /// longer cooldown is kept.
    pub fn set_cooldown(&self, duration: Duration) {
        self.set_cooldown_at(Utc::now(), duration);
    }

    pub fn set_cooldown_at(&self, now: DateTime<Utc>, duration: Duration) {
        let duration = duration.min(MAX_COOLDOWN);
        let until = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut state = self.state();
        if state.cooldown_until.is_none_or(|current| current < until) {
            state.cooldown_until = Some(until);
        }
        tracing::warn!(
            cooldown_seconds = duration.as_secs(),
            until = %until,
            "generation cooldown set"
        );
    }

    /// Applies a provider retry hint, clamped to [`MIN_COOLDOWN`]..=[`MAX_COOLDOWN`].
    /// Returns the applied duration.
    pub fn set_cooldown_from_hint(&self, hint: Option<Duration>) -> Duration {
        self.set_cooldown_from_hint_at(Utc::now(), hint)
    }

    pub fn set_cooldown_from_hint_at(&self, now: DateTime<Utc>, hint: Option<Duration>) -> Duration {
        let duration = cooldown_for_hint(hint);
        self.set_cooldown_at(now, duration);
        duration
    }

    fn state(&self) -> MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn cooldown_for_hint(hint: Option<Duration>) -> Duration {
    hint.unwrap_or(MIN_COOLDOWN).clamp(MIN_COOLDOWN, MAX_COOLDOWN)
}

fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn limits(per_minute: u32, per_day: u32) -> RateLimits {
        RateLimits {
            max_calls_per_minute: per_minute,
            max_calls_per_day: per_day,
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, s)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn minute_window_denies_then_recovers_when_oldest_call_expires() {
        let start = at(10, 0, 0);
        let limiter = RateLimiter::new_at(limits(3, 100), start);

        limiter.register_call_at(start);
        limiter.register_call_at(start + chrono::Duration::seconds(10));
        limiter.register_call_at(start + chrono::Duration::seconds(20));

        let probe = start + chrono::Duration::seconds(30);
        match limiter.can_call_at(probe) {
            Admission::Denied(DenyReason::MinuteLimit { wait }) => {
                assert_eq!(wait, Duration::from_secs(30));
            }
            other => panic!("expected minute limit denial, got {other:?}"),
        }

        assert!(
            !limiter
                .can_call_at(start + chrono::Duration::seconds(59))
                .is_allowed()
        );
        assert!(
            limiter
                .can_call_at(start + chrono::Duration::seconds(60))
                .is_allowed()
        );
    }

    #[test]
    fn register_does_not_evict_but_reads_do() {
        let start = at(10, 0, 0);
        let limiter = RateLimiter::new_at(limits(5, 100), start);
        limiter.register_call_at(start);
        limiter.register_call_at(start + chrono::Duration::seconds(90));

        let stats = limiter.usage_stats_at(start + chrono::Duration::seconds(90));
        assert_eq!(stats.calls_last_minute, 1);
        assert_eq!(stats.calls_today, 2);
    }

    #[test]
    fn daily_limit_denies_and_resets_once_on_date_change() {
        let start = at(23, 50, 0);
        let limiter = RateLimiter::new_at(limits(100, 2), start);
        limiter.register_call_at(start);
        limiter.register_call_at(start + chrono::Duration::seconds(1));

        assert_eq!(
            limiter.can_call_at(start + chrono::Duration::minutes(5)),
            Admission::Denied(DenyReason::DailyLimit { used: 2, limit: 2 })
        );

        let next_day = start + chrono::Duration::minutes(15);
        assert!(limiter.can_call_at(next_day).is_allowed());
        limiter.register_call_at(next_day);
        limiter.register_call_at(next_day + chrono::Duration::minutes(1));

        // Same day: no second reset, the new day's calls still count.
        assert_eq!(
            limiter.can_call_at(next_day + chrono::Duration::hours(3)),
            Admission::Denied(DenyReason::DailyLimit { used: 2, limit: 2 })
        );
    }

    #[test]
    fn register_call_also_rolls_the_day() {
        let start = at(23, 59, 0);
        let limiter = RateLimiter::new_at(limits(100, 10), start);
        limiter.register_call_at(start);
        limiter.register_call_at(start + chrono::Duration::minutes(2));
        let stats = limiter.usage_stats_at(start + chrono::Duration::minutes(2));
        assert_eq!(stats.calls_today, 1);
    }

    #[test]
    fn cooldown_is_checked_first_and_expires() {
        let start = at(12, 0, 0);
        let limiter = RateLimiter::new_at(limits(100, 100), start);
        limiter.set_cooldown_at(start, Duration::from_secs(120));

        match limiter.can_call_at(start + chrono::Duration::seconds(20)) {
            Admission::Denied(DenyReason::Cooldown { remaining }) => {
                assert_eq!(remaining, Duration::from_secs(100));
            }
            other => panic!("expected cooldown denial, got {other:?}"),
        }
        assert!(
            limiter
                .can_call_at(start + chrono::Duration::seconds(120))
                .is_allowed()
        );
    }

    #[test]
    fn shorter_cooldown_does_not_shrink_a_longer_one() {
        let start = at(12, 0, 0);
        let limiter = RateLimiter::new_at(limits(100, 100), start);
        limiter.set_cooldown_at(start, Duration::from_secs(3600));
        limiter.set_cooldown_at(start, Duration::from_secs(60));
        let stats = limiter.usage_stats_at(start);
        assert_eq!(stats.cooldown_remaining_seconds, Some(3600));
    }

    #[test]
    fn retry_hints_are_floored() {
        assert_eq!(cooldown_for_hint(None), MIN_COOLDOWN);
        assert_eq!(cooldown_for_hint(Some(Duration::from_secs(5))), MIN_COOLDOWN);
        assert_eq!(
            cooldown_for_hint(Some(Duration::from_secs(300))),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn huge_hints_are_capped_at_one_day() {
        let start = at(12, 0, 0);
        let limiter = RateLimiter::new_at(limits(100, 100), start);
        let applied = limiter
            .set_cooldown_from_hint_at(start, Some(Duration::from_secs(9_000_000_000_000)));
        assert_eq!(applied, MAX_COOLDOWN);
        assert_eq!(
            limiter.usage_stats_at(start).cooldown_remaining_seconds,
            Some(MAX_COOLDOWN.as_secs())
        );

        limiter.set_cooldown_at(start, Duration::MAX);
        assert!(!limiter.can_call_at(start + chrono::Duration::hours(23)).is_allowed());
        assert!(
            limiter
                .can_call_at(start + chrono::Duration::hours(24))
                .is_allowed()
        );
    }
}
