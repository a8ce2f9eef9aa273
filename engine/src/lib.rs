//! delta-engine: a transactional, Delta-compatible table engine layered over
//! object storage.
//!
//! Tables are directories of parquet data files plus a `_delta_log/` of
//! newline-delimited JSON actions; the linearizable append order of that log
//! defines table state. On top of it the engine provides ACID writes through
//! an optimistic commit protocol, snapshot reads with time travel, row-level
//! update/delete/merge (with deletion vectors), change data capture, and
//! storage optimization (compaction, deduplication, space-filling-curve
//! clustering, vacuum).
//!
//! # Example
//!
//! ```no_run
//! # use delta_engine::{Table, DeltaResult};
//! # use delta_engine::schema::{DataType, StructField, StructType};
//! # async fn example() -> DeltaResult<()> {
//! let schema = StructType::new([
//!     StructField::new("id", DataType::Integer, false),
//!     StructField::new("name", DataType::String, true),
//! ]);
//! let table = Table::try_from_uri("memory:///events")?
//!     .create(schema)
//!     .execute()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency model
//!
//! The engine is single-threaded-cooperative per table instance: operations
//! are async tasks that yield at storage boundaries, and a snapshot handed to
//! a caller is an immutable value. Cross-process safety rests entirely on the
//! storage backend's conditional-write primitive; there are no locks.

pub mod actions;
pub mod cancel;
pub mod cdc;
pub mod checkpoint;
pub mod error;
pub mod log_segment;
pub mod ops;
pub mod parquet;
pub mod path;
pub mod predicate;
pub mod retry;
pub mod schema;
pub mod snapshot;
pub mod stats;
pub mod storage;
pub mod table;
pub mod table_properties;
pub mod transaction;
pub mod value;

pub use error::{CdcErrorKind, DeltaResult, Error};
pub use predicate::Filter;
pub use snapshot::Snapshot;
pub use table::Table;
pub use transaction::Transaction;
pub use value::{Row, Value};

/// A table version number.
pub type Version = u64;
