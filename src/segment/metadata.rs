use std::fmt;
use std::str::FromStr;

/// What the samples of a segment count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Units {
    /// CPU samples.
    #[default]
    Samples,
    /// Allocated objects.
    Objects,
    /// Live goroutines.
    Goroutines,
    /// Allocated bytes.
    Bytes,
    /// Lock contention samples.
    LockSamples,
    /// Time spent waiting on locks.
    LockNanoseconds,
}

const UNITS: [(Units, &str); 6] = [
    (Units::Samples, "samples"),
    (Units::Objects, "objects"),
    (Units::Goroutines, "goroutines"),
    (Units::Bytes, "bytes"),
    (Units::LockSamples, "lock_samples"),
    (Units::LockNanoseconds, "lock_nanoseconds"),
];

impl Units {
    /// The name used in keys and query parameters.
    pub fn as_str(&self) -> &'static str {
        UNITS[self.code() as usize].1
    }

    pub(crate) fn code(&self) -> u8 {
        match self {
            Units::Samples => 0,
            Units::Objects => 1,
            Units::Goroutines => 2,
            Units::Bytes => 3,
            Units::LockSamples => 4,
            Units::LockNanoseconds => 5,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        UNITS.get(code as usize).map(|&(u, _)| u)
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Units {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UNITS
            .iter()
            .find(|&&(_, name)| name == s)
            .map(|&(u, _)| u)
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

/// How samples from overlapping writes combine when read back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum AggregationType {
    /// Samples add up.
    #[default]
    Sum,
    /// Samples are averaged over the number of writes.
    Average,
}

impl AggregationType {
    /// The name used in query parameters.
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationType::Sum => "sum",
            AggregationType::Average => "average",
        }
    }

    pub(crate) fn code(&self) -> u8 {
        match self {
            AggregationType::Sum => 0,
            AggregationType::Average => 1,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(AggregationType::Sum),
            1 => Some(AggregationType::Average),
            _ => None,
        }
    }
}

impl fmt::Display for AggregationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sum" => Ok(AggregationType::Sum),
            "average" => Ok(AggregationType::Average),
            _ => Err(UnknownVariant(s.to_string())),
        }
    }
}

/// Returned when parsing [`Units`] or [`AggregationType`] from an unknown name.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown variant `{0}`")]
pub struct UnknownVariant(pub String);

/// Everything a segment knows about the profiles it holds, besides the samples.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    /// Name of the profiler that produced the data, e.g. `rbspy`.
    pub spy_name: String,

    /// Samples per second.
    pub sample_rate: u32,

    /// What a sample counts.
    pub units: Units,

    /// How overlapping writes combine.
    pub aggregation_type: AggregationType,
}
