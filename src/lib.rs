//! Storage for continuous profiling data.
//!
//! A continuous profiler sends a stream of short profiles for every application it watches. To
//! answer "what did this application do between 2pm and 4pm" without merging thousands of
//! profiles on every query, profiles are aggregated into a tree of time buckets as they arrive.
//! The finest buckets are ten seconds wide, and every level above is ten times wider than the
//! one below it. A write lands in the buckets that cover its time range; a read picks the
//! coarsest buckets that cover the query range and merges only those.
//!
//! The crate is made of a few layers:
//!
//!  - [`segment`]: the tree of time buckets for one application, which only counts samples and
//!    reports which buckets a write or a read touches. It also carries the [retention policy]
//!    that decides which buckets may be deleted.
//!  - [`call_tree`]: the profile attached to every bucket, a tree of call stacks stored in a
//!    flat arena so that merging and trimming stay linear.
//!  - [`cache`]: a least-frequently-used cache in front of a key-value store, which writes
//!    dirty entries back in the background.
//!  - [`storage`]: ties the above together into `put`, `get`, `delete` and retention
//!    enforcement.
//!  - [`folded`]: reads and writes call trees as folded stack lines, the format produced by
//!    most stack collapsing tools.
//!
//! # Command-line use
//!
//! The `pyroscope-fold` binary stores folded stack files as consecutive profiles of one
//! application and prints the merged profile of a time range:
//!
//! ```console
//! $ pyroscope-fold --app my.app.cpu --from 1600000000 --interval 10 a.folded b.folded
//! main;compute 90
//! main;idle 10
//! ```
//!
//! # Programmatic access
//!
//! ```
//! use std::sync::Arc;
//!
//! use chrono::{DateTime, Duration};
//! use pyroscope_storage::call_tree::CallTree;
//! use pyroscope_storage::segment::{AggregationType, Key, Units};
//! use pyroscope_storage::storage::{Config, GetInput, MemoryStore, PutInput, Storage};
//!
//! let storage = Storage::new(Config::default(), Arc::new(MemoryStore::new())).unwrap();
//!
//! let mut tree = CallTree::new(0);
//! tree.insert(&[2, 1], 10);
//! let start = DateTime::from_timestamp(1_600_000_000, 0).unwrap();
//! let key = Key::parse("my.app.cpu{env=prod}").unwrap();
//! storage
//!     .put(&PutInput {
//!         key: key.clone(),
//!         start_time: start,
//!         end_time: start + Duration::seconds(10),
//!         tree,
//!         spy_name: "rbspy".to_string(),
//!         sample_rate: 100,
//!         units: Units::Samples,
//!         aggregation_type: AggregationType::Sum,
//!     })
//!     .unwrap();
//!
//! let out = storage
//!     .get(&GetInput {
//!         key,
//!         start_time: start,
//!         end_time: start + Duration::seconds(10),
//!     })
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(out.tree.total(), 10);
//! ```
//!
//!   [retention policy]: segment::RetentionPolicy

#![deny(missing_docs)]

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

#[macro_use]
extern crate log;

mod encoding;
mod error;

pub mod segment;

pub mod call_tree;

pub mod cache;

pub mod storage;

pub mod folded;

pub use crate::encoding::DecodeError;
pub use crate::error::{Error, Result};
