//! Tag-based inverted index for time-series series lookup.
//!
//! Series are identified by a measurement name plus a set of tags and receive a 64-bit TSID
//! on first sight. The index stores three row families in one sorted key/value table:
//! series key to TSID, `(measurement, tag key, tag value)` to TSID postings, and TSID back to
//! series key. Queries compile tag predicates (`=`, `!=`, `=~`, `!~`) into prefix scans and
//! combine them with `AND`/`OR` into sets or lazy iterators of TSIDs.
//!
//! ```no_run
//! use ugnos_tsi::{Expr, TimeRange, TsIndex};
//! use ugnos_tsi::types::tags_from_pairs;
//!
//! let index = TsIndex::in_memory();
//! index
//!     .create_index_if_not_exists(&[("cpu".to_string(), tags_from_pairs(&[("host", "a")]))])
//!     .unwrap();
//! let cond = Expr::tag_match("host", "^a");
//! let ids = index.search_series_ids("cpu", Some(&cond), TimeRange::all()).unwrap();
//! assert_eq!(ids.len(), 1);
//! ```

pub mod buffer;
pub mod core;
pub mod encoding;
pub mod error;
pub mod expr;
pub mod index;
pub mod persistence;
pub mod scanner;
pub mod search;
pub mod series_set;
pub mod storage;
pub mod tag_filter;
pub mod tagset;
pub mod telemetry;
pub mod types;

/// Index configuration, optionally read from TOML.
pub use crate::core::{IndexConfig, IndexFileConfig};
/// Main entry point of the index.
pub use crate::core::{SeriesSearchOptions, TsIndex};
/// Error type for index operations.
pub use crate::error::IndexError;
/// Query expressions over tags and fields.
pub use crate::expr::{BinaryOp, Expr, VarKind};
/// Single-query search state, for callers driving the scanner directly.
pub use crate::scanner::IndexSearch;
/// Series id sets and lazy iterators.
pub use crate::series_set::{SeriesIdElem, SeriesIdIterator, SeriesIdSet};
/// Sorted key/value table abstraction.
pub use crate::storage::{MemTable, Substrate, TableCursor};
/// Compiled tag predicate.
pub use crate::tag_filter::TagFilter;
/// Grouped results.
pub use crate::tagset::{GroupSeries, PooledTagSet, TagSetInfo, TagSetPool};
/// Structured event hook for observability.
pub use crate::telemetry::{IndexEvent, IndexEventListener};
pub use crate::types::{PointTags, Tag, TimeRange, Timestamp, Tsid};
