use std::io;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::encoding::DecodeError;
use crate::segment::{self, ParseKeyError};

/// Errors returned by the storage layer.
#[derive(Error, Debug)]
pub enum Error {
    /// The backing store failed.
    #[error("store: {0}")]
    Store(#[from] io::Error),

    /// A stored value could not be decoded.
    #[error("decoding {key}: {source}")]
    Decode {
        /// The store key of the broken value.
        key: String,
        /// Why decoding failed.
        source: DecodeError,
    },

    /// The segment rejected a write.
    #[error(transparent)]
    Segment(#[from] segment::Error),

    /// A segment key did not parse.
    #[error(transparent)]
    Key(#[from] ParseKeyError),

    /// The write starts before the retention period.
    #[error("start time {0} is outside of the retention period")]
    Retention(DateTime<Utc>),
}

/// Shorthand for results of the storage layer.
pub type Result<T, E = Error> = std::result::Result<T, E>;
