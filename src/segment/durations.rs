use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;

/// Fan-out of the segment tree: every level is ten times coarser than the one below.
pub(crate) const MULTIPLIER: usize = 10;

const FINEST_RESOLUTION_NANOS: i64 = 10 * 1_000_000_000;
const MAX_LADDER_LEN: usize = 16;

// Seconds between 0001-01-01T00:00:00Z and the Unix epoch. Buckets are aligned to the former.
const ZERO_TIME_TO_UNIX_SECS: i64 = 62_135_596_800;

static DURATIONS: Lazy<Vec<Duration>> = Lazy::new(|| {
    let mut ladder = Vec::with_capacity(MAX_LADDER_LEN);
    let mut nanos = FINEST_RESOLUTION_NANOS;
    while ladder.len() < MAX_LADDER_LEN {
        ladder.push(Duration::nanoseconds(nanos));
        nanos = match nanos.checked_mul(MULTIPLIER as i64) {
            Some(next) => next,
            None => break,
        };
    }
    ladder
});

/// The bucket ladder: `durations()[0]` is ten seconds and every following entry is ten times
/// the previous one. The ladder stops before a bucket would overflow a nanosecond count.
pub fn durations() -> &'static [Duration] {
    &DURATIONS
}

pub(crate) fn duration(depth: usize) -> Duration {
    DURATIONS[depth]
}

/// Truncates `t` down to a multiple of `d`.
///
/// Like Go's `time.Truncate`, multiples are counted from `0001-01-01T00:00:00Z` rather than
/// from the Unix epoch. Every ladder duration is a whole number of seconds, so sub-second
/// precision is always dropped.
pub fn truncate(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    let step = d.num_seconds();
    if step <= 0 {
        return t;
    }
    let secs = t.timestamp();
    let rem = (secs + ZERO_TIME_TO_UNIX_SECS).rem_euclid(step);
    DateTime::from_timestamp(secs - rem, 0).unwrap_or(t)
}

/// Aligns a time range to the finest resolution.
///
/// The start is truncated. The end is truncated too and then moved one bucket forward, unless
/// it was already aligned and the range is not empty.
pub(crate) fn normalize(st: DateTime<Utc>, et: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let st = normalize_time(st);
    let et2 = normalize_time(et);
    if et2 == et && st != et2 {
        return (st, et);
    }
    (st, et2 + duration(0))
}

pub(crate) fn normalize_time(t: DateTime<Utc>) -> DateTime<Utc> {
    truncate(t, duration(0))
}
