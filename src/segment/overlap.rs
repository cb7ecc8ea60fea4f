use std::fmt;

use chrono::{DateTime, Duration, Utc};

/// How a node's range `[t1, t2)` relates to a query range `[st, et)`.
///
/// ```text
///  relationship                   overlap read    overlap write
///  Inside    | S E |              <1              1/1
///  Match     matching ranges      1/1             1/1
///  Outside   | | S E              0/1             0/1
///  Overlap   | S | E              <1              <1
///  Contain   S | | E              1/1             <1
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Rel {
    Inside,
    Match,
    Outside,
    Overlap,
    Contain,
}

pub(crate) fn relationship(
    t1: DateTime<Utc>,
    t2: DateTime<Utc>,
    st: DateTime<Utc>,
    et: DateTime<Utc>,
) -> Rel {
    if t1 == st && t2 == et {
        return Rel::Match;
    }
    if t1 <= st && t2 >= et {
        return Rel::Inside;
    }
    if t1 >= st && t2 <= et {
        return Rel::Contain;
    }
    if t1 <= st && t2 <= st {
        return Rel::Outside;
    }
    if t1 >= et && t2 >= et {
        return Rel::Outside;
    }
    Rel::Overlap
}

/// A non-negative fraction, always kept in lowest terms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Ratio {
    num: u64,
    den: u64,
}

impl Ratio {
    /// The ratio `1/1`.
    pub const ONE: Ratio = Ratio { num: 1, den: 1 };

    /// The ratio `0/1`.
    pub const ZERO: Ratio = Ratio { num: 0, den: 1 };

    /// Creates `num/den` reduced to lowest terms.
    ///
    /// # Panics
    ///
    /// Panics if `den` is zero.
    pub fn new(num: u64, den: u64) -> Self {
        assert_ne!(den, 0, "ratio with a zero denominator");
        let g = gcd(num, den);
        Ratio {
            num: num / g,
            den: den / g,
        }
    }

    /// The numerator.
    pub fn numer(&self) -> u64 {
        self.num
    }

    /// The denominator.
    pub fn denom(&self) -> u64 {
        self.den
    }

    /// Whether the ratio is zero.
    pub fn is_zero(&self) -> bool {
        self.num == 0
    }

    /// The ratio as a float.
    pub fn to_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// Scales `value` by this ratio, rounding down.
    pub fn apply(&self, value: u64) -> u64 {
        if self.num == self.den {
            return value;
        }
        let scaled = value as u128 * self.num as u128 / self.den as u128;
        u64::try_from(scaled).unwrap_or(u64::MAX)
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

fn overlap_units(
    t1: DateTime<Utc>,
    t2: DateTime<Utc>,
    st: DateTime<Utc>,
    et: DateTime<Utc>,
    dur: Duration,
) -> u64 {
    let overlap = t2.min(et) - t1.max(st);
    if overlap <= Duration::zero() {
        return 0;
    }
    units(overlap, dur)
}

fn units(d: Duration, dur: Duration) -> u64 {
    (d.num_seconds() / dur.num_seconds()).max(0) as u64
}

/// The share of a node's range `[t1, t2)` that falls inside the query `[st, et)`, counted in
/// units of `dur`.
///
/// A fully covered node reads as `1/1`, a disjoint one as `0/1`. A node shorter than `dur`
/// holds no whole unit and reads as `0/1` too.
pub fn overlap_read(
    t1: DateTime<Utc>,
    t2: DateTime<Utc>,
    st: DateTime<Utc>,
    et: DateTime<Utc>,
    dur: Duration,
) -> Ratio {
    let d = units(t2 - t1, dur);
    if d == 0 {
        return Ratio::ZERO;
    }
    Ratio::new(overlap_units(t1, t2, st, et, dur), d)
}

/// The share of the write range `[st, et)` that lands in the node `[t1, t2)`, counted in units
/// of `dur`.
///
/// # Panics
///
/// Panics if the write range is shorter than `dur`.
pub fn overlap_write(
    t1: DateTime<Utc>,
    t2: DateTime<Utc>,
    st: DateTime<Utc>,
    et: DateTime<Utc>,
    dur: Duration,
) -> Ratio {
    let m = overlap_units(t1, t2, st, et, dur);
    Ratio::new(m, units(et - st, dur))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::testing::simple_time;

    fn secs(n: i64) -> Duration {
        Duration::seconds(n)
    }

    #[test]
    fn relationships() {
        let t = simple_time;
        assert_eq!(relationship(t(0), t(100), t(0), t(100)), Rel::Match);
        assert_eq!(relationship(t(0), t(100), t(10), t(20)), Rel::Inside);
        assert_eq!(relationship(t(10), t(20), t(0), t(100)), Rel::Contain);
        assert_eq!(relationship(t(0), t(10), t(10), t(20)), Rel::Outside);
        assert_eq!(relationship(t(20), t(30), t(10), t(20)), Rel::Outside);
        assert_eq!(relationship(t(0), t(100), t(50), t(150)), Rel::Overlap);
    }

    #[test]
    fn exact_match_reads_whole() {
        let r = overlap_read(
            simple_time(0),
            simple_time(100),
            simple_time(0),
            simple_time(100),
            secs(10),
        );
        assert_eq!(r, Ratio::ONE);
        assert_eq!(r.to_string(), "1/1");
    }

    #[test]
    fn disjoint_reads_zero() {
        let r = overlap_read(
            simple_time(0),
            simple_time(100),
            simple_time(100),
            simple_time(3700),
            secs(10),
        );
        assert_eq!(r, Ratio::ZERO);
        assert_eq!(r.to_string(), "0/1");
    }

    #[test]
    fn partial_read_and_write() {
        let (t1, t2) = (simple_time(0), simple_time(100));
        let r = overlap_read(t1, t2, simple_time(0), simple_time(30), secs(10));
        assert_eq!(r.to_string(), "3/10");

        // the write spans 60s, 40s of which land in the node
        let w = overlap_write(t1, t2, simple_time(60), simple_time(120), secs(10));
        assert_eq!(w.to_string(), "2/3");
        let w = overlap_write(t1, t2, simple_time(10), simple_time(20), secs(10));
        assert_eq!(w, Ratio::ONE);
    }

    #[test]
    fn empty_node_reads_zero() {
        let t = simple_time(100);
        assert_eq!(overlap_read(t, t, simple_time(0), simple_time(200), secs(10)), Ratio::ZERO);
        let r = overlap_read(t, simple_time(105), simple_time(0), simple_time(200), secs(10));
        assert_eq!(r, Ratio::ZERO);
    }

    #[test]
    fn apply_rounds_down() {
        assert_eq!(Ratio::new(1, 3).apply(10), 3);
        assert_eq!(Ratio::ONE.apply(u64::MAX), u64::MAX);
        assert_eq!(Ratio::ZERO.apply(42), 0);
    }
}
