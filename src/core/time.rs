//! Age arithmetic shared by staleness and expiry checks

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Convert a std duration, saturating instead of failing on overflow
pub fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// The instant `max_age` before `now`
///
/// Anything stamped strictly before the cutoff is older than `max_age`.
pub fn cutoff(now: DateTime<Utc>, max_age: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(to_delta(max_age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
