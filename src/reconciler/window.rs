//! Budget window computation in local time
//!
//! Local time is UTC plus a configured fixed offset. Daily windows start at
//! the most recent local midnight, weekly windows at the most recent ISO
//! Monday midnight, rolling windows trail the current instant. A manual
//! reset anchor later than the natural start replaces it until the natural
//! boundary overtakes the anchor.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDateTime, Utc};

use crate::store::ResetStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBounds {
    pub start: DateTime<Utc>,
    /// Rolling windows never reset at a point; the value written is a
    /// recency hint of now + 1 minute, matching what consumers expect.
    pub next_reset: Option<DateTime<Utc>>,
}

fn from_local(naive: NaiveDateTime, offset: FixedOffset) -> DateTime<Utc> {
    match naive.and_local_timezone(offset) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        // Fixed offsets are never ambiguous; keep a deterministic fallback.
        _ => DateTime::from_naive_utc_and_offset(
            naive - Duration::seconds(i64::from(offset.local_minus_utc())),
            Utc,
        ),
    }
}

/// Natural window bounds for a strategy at `now`
pub fn natural_window(
    strategy: ResetStrategy,
    window_minutes: i64,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> WindowBounds {
    match strategy {
        ResetStrategy::Rolling => WindowBounds {
            start: now - Duration::minutes(window_minutes.max(1)),
            next_reset: Some(now + Duration::minutes(1)),
        },
        ResetStrategy::Daily => {
            let local = now.with_timezone(&offset);
            let midnight = local.date_naive().and_time(chrono::NaiveTime::MIN);
            let start = from_local(midnight, offset);
            WindowBounds {
                start,
                next_reset: Some(start + Duration::hours(24)),
            }
        }
        ResetStrategy::Weekly => {
            let local = now.with_timezone(&offset);
            let days_back = i64::from(local.weekday().num_days_from_monday());
            let monday = local.date_naive() - Duration::days(days_back);
            let start = from_local(monday.and_time(chrono::NaiveTime::MIN), offset);
            WindowBounds {
                start,
                next_reset: Some(start + Duration::days(7)),
            }
        }
    }
}

/// Apply a manual reset anchor: a later anchor advances the effective start;
/// anchors at or before the natural start have expired and are ignored.
pub fn effective_start(
    natural_start: DateTime<Utc>,
    anchor: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    match anchor {
        Some(anchor) if anchor > natural_start => anchor,
        _ => natural_start,
    }
}
