//! Expiration policies.
//!
//! A policy is a pure function of a ticket's [`TicketMeta`] and the current
//! time. It is bound to the ticket at creation and serialized with it, so every
//! backend evaluates the same rule the issuing node chose.
//!
//! | Policy | Expired when | Typical use |
//! |--------|--------------|-------------|
//! | [`Never`](ExpirationPolicy::Never) | never | administrative tickets |
//! | [`HardTimeout`](ExpirationPolicy::HardTimeout) | `now - created > time_to_kill` | fixed lifetime |
//! | [`Timeout`](ExpirationPolicy::Timeout) | idle or hard deadline passed | TGT / PGT |
//! | [`MultiUse`](ExpirationPolicy::MultiUse) | `uses >= max_uses` or TTL passed | ST / PT (`max_uses = 1`) |
//! | [`Throttled`](ExpirationPolicy::Throttled) | idle TTL passed, or reused within `min_interval` | rate-limited tickets |
//!
//! [`time_to_live`](ExpirationPolicy::time_to_live) is only an eviction hint
//! for backends with native TTL. `None` means "no limit"; revocation still
//! applies to such tickets.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ticket::TicketMeta;

/// Rule deciding when a ticket stops being usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ExpirationPolicy {
    /// The ticket never expires on its own.
    Never,

    /// Expires a fixed time after creation, regardless of use.
    HardTimeout {
        /// Lifetime measured from creation.
        #[serde(with = "humantime_serde")]
        time_to_kill: Duration,
    },

    /// Expires after an idle period or an absolute lifetime, whichever is first.
    Timeout {
        /// Maximum time between uses.
        #[serde(with = "humantime_serde")]
        idle: Duration,
        /// Maximum lifetime measured from creation.
        #[serde(with = "humantime_serde")]
        hard: Duration,
    },

    /// Expires after `max_uses` uses or `time_to_live` after creation.
    MultiUse {
        /// Number of uses allowed.
        max_uses: u32,
        /// Lifetime measured from creation.
        #[serde(with = "humantime_serde")]
        time_to_live: Duration,
    },

    /// Expires after `time_to_live` without use, or when used again within
    /// `min_interval` of the previous use.
    ///
    /// The `min_interval` window is transient: a ticket refused inside it is
    /// usable again once the window passes. [`time_to_live`](Self::time_to_live)
    /// therefore ignores the window, and so do eviction deadlines and the
    /// index-based counts of the document and relational registries. Those
    /// counts include a throttled ticket that [`is_expired`](Self::is_expired)
    /// currently reports as expired.
    Throttled {
        /// Maximum time since the last use.
        #[serde(with = "humantime_serde")]
        time_to_live: Duration,
        /// Minimum spacing between consecutive uses.
        #[serde(with = "humantime_serde")]
        min_interval: Duration,
    },
}

/// `start + duration`, saturating at the maximum representable instant.
fn deadline(start: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| start.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn remaining(until: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (until - now).to_std().unwrap_or(Duration::ZERO)
}

impl ExpirationPolicy {
    /// The single-use service ticket policy: one use within `time_to_live`.
    #[must_use]
    pub fn single_use(time_to_live: Duration) -> Self {
        Self::MultiUse { max_uses: 1, time_to_live }
    }

    /// Whether a ticket with `meta` is expired at `now`.
    #[must_use]
    pub fn is_expired(&self, meta: &TicketMeta, now: DateTime<Utc>) -> bool {
        match *self {
            Self::Never => false,
            Self::HardTimeout { time_to_kill } => now > deadline(meta.created_at, time_to_kill),
            Self::Timeout { idle, hard } => {
                now > deadline(meta.created_at, hard) || now > deadline(meta.last_used_at, idle)
            },
            Self::MultiUse { max_uses, time_to_live } => {
                meta.count_of_uses >= max_uses || now > deadline(meta.created_at, time_to_live)
            },
            Self::Throttled { time_to_live, min_interval } => {
                if now > deadline(meta.last_used_at, time_to_live) {
                    return true;
                }
                meta.count_of_uses > 0 && now < deadline(meta.last_used_at, min_interval)
            },
        }
    }

    /// Remaining lifetime at `now`, for backends that need an eviction deadline.
    ///
    /// `now + time_to_live` is the last instant at which the ticket can be
    /// live: [`is_expired`](Self::is_expired) is false at that instant and
    /// true after it, throttle windows aside. Returns `Some(Duration::ZERO)`
    /// once the ticket can never be used again and `None` when the policy
    /// imposes no limit.
    #[must_use]
    pub fn time_to_live(&self, meta: &TicketMeta, now: DateTime<Utc>) -> Option<Duration> {
        let until = match *self {
            Self::Never => return None,
            Self::HardTimeout { time_to_kill } => deadline(meta.created_at, time_to_kill),
            Self::Timeout { idle, hard } => {
                deadline(meta.created_at, hard).min(deadline(meta.last_used_at, idle))
            },
            Self::MultiUse { max_uses, time_to_live } => {
                if meta.count_of_uses >= max_uses {
                    return Some(Duration::ZERO);
                }
                deadline(meta.created_at, time_to_live)
            },
            Self::Throttled { time_to_live, .. } => deadline(meta.last_used_at, time_to_live),
        };
        Some(remaining(until, now))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn at(n: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::seconds(n)
    }

    fn meta(policy: ExpirationPolicy) -> TicketMeta {
        TicketMeta::new("TGT-1-x", t0(), policy)
    }

    #[test]
    fn never_expires_and_has_no_ttl() {
        let m = meta(ExpirationPolicy::Never);
        assert!(!m.expiration_policy.is_expired(&m, at(10_000_000)));
        assert_eq!(m.expiration_policy.time_to_live(&m, at(0)), None);
    }

    #[test]
    fn hard_timeout_ignores_use() {
        let policy = ExpirationPolicy::HardTimeout { time_to_kill: secs(60) };
        let mut m = meta(policy);
        m.record_use(at(59));
        assert!(!policy.is_expired(&m, at(60)));
        assert!(policy.is_expired(&m, at(61)));
        assert_eq!(policy.time_to_live(&m, at(20)), Some(secs(40)));
    }

    #[test]
    fn idle_timeout_resets_on_use() {
        let policy = ExpirationPolicy::Timeout { idle: secs(100), hard: secs(1000) };
        let mut m = meta(policy);
        assert!(policy.is_expired(&m, at(101)));

        m.record_use(at(90));
        assert!(!policy.is_expired(&m, at(180)));
        assert!(policy.is_expired(&m, at(191)));
    }

    #[test]
    fn hard_timeout_wins_over_activity() {
        let policy = ExpirationPolicy::Timeout { idle: secs(100), hard: secs(250) };
        let mut m = meta(policy);
        m.record_use(at(90));
        m.record_use(at(180));
        assert!(!policy.is_expired(&m, at(250)));
        assert!(policy.is_expired(&m, at(251)));
        // The earlier deadline bounds the eviction hint.
        assert_eq!(policy.time_to_live(&m, at(200)), Some(secs(50)));
    }

    #[test]
    fn single_use_expires_after_first_use() {
        let policy = ExpirationPolicy::single_use(secs(10));
        let mut m = meta(policy);
        assert!(!policy.is_expired(&m, at(5)));
        m.record_use(at(5));
        assert!(policy.is_expired(&m, at(5)));
        assert_eq!(policy.time_to_live(&m, at(5)), Some(Duration::ZERO));
    }

    #[test]
    fn single_use_expires_after_ttl_unused() {
        let policy = ExpirationPolicy::single_use(secs(10));
        let m = meta(policy);
        assert!(!policy.is_expired(&m, at(10)));
        assert!(policy.is_expired(&m, at(11)));
    }

    #[test]
    fn throttled_rejects_rapid_reuse() {
        let policy = ExpirationPolicy::Throttled { time_to_live: secs(60), min_interval: secs(5) };
        let mut m = meta(policy);
        assert!(!policy.is_expired(&m, at(1)), "unused ticket is not throttled");

        m.record_use(at(10));
        assert!(policy.is_expired(&m, at(12)), "reuse inside the interval");
        assert!(!policy.is_expired(&m, at(16)));
        assert!(policy.is_expired(&m, at(71)), "idle past the TTL");
    }

    #[test]
    fn throttle_window_does_not_shorten_the_eviction_deadline() {
        let policy = ExpirationPolicy::Throttled { time_to_live: secs(60), min_interval: secs(5) };
        let mut m = meta(policy);
        m.record_use(at(10));

        assert!(policy.is_expired(&m, at(12)));
        assert_eq!(policy.time_to_live(&m, at(12)), Some(secs(58)));
        assert!(!policy.is_expired(&m, at(16)), "usable again after the window");
    }

    #[test]
    fn ttl_deadline_is_the_last_live_instant() {
        let policy = ExpirationPolicy::HardTimeout { time_to_kill: secs(60) };
        let m = meta(policy);
        assert_eq!(policy.time_to_live(&m, at(60)), Some(Duration::ZERO));
        assert!(!policy.is_expired(&m, at(60)));
        assert!(policy.is_expired(&m, at(61)));
    }

    #[test]
    fn serde_uses_humantime_durations() {
        let policy = ExpirationPolicy::Timeout { idle: secs(7200), hard: secs(28_800) };
        let json = serde_json::to_string(&policy).unwrap();
        assert_eq!(json, r#"{"type":"timeout","idle":"2h","hard":"8h"}"#);
        assert_eq!(serde_json::from_str::<ExpirationPolicy>(&json).unwrap(), policy);
    }

    proptest! {
        /// Once a ticket is expired it stays expired as time moves forward.
        #[test]
        fn expiry_is_monotonic_in_time(
            idle in 1u64..10_000,
            hard in 1u64..10_000,
            instant in 0i64..20_000,
            later in 0i64..20_000,
        ) {
            let policy = ExpirationPolicy::Timeout { idle: secs(idle), hard: secs(hard) };
            let m = meta(policy);
            if policy.is_expired(&m, at(instant)) {
                prop_assert!(policy.is_expired(&m, at(instant + later)));
            }
        }

        /// A ticket is never expired while its reported TTL is positive.
        #[test]
        fn positive_ttl_means_alive(ttl in 1u64..10_000, instant in 0i64..20_000) {
            let policy = ExpirationPolicy::HardTimeout { time_to_kill: secs(ttl) };
            let m = meta(policy);
            let remaining = policy.time_to_live(&m, at(instant)).unwrap();
            if remaining > Duration::ZERO {
                prop_assert!(!policy.is_expired(&m, at(instant)));
            }
        }
    }
}
