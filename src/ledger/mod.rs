//! Fjall-based persistence for job records and idempotency keys
//!
//! The ledger is the single durable home of job state. Partitions:
//!
//! - `jobs`: `job:{job_id}` → [`crate::api::models::JobRecord`] (JSON)
//! - `idempotency`: `idem:{key}` → idempotency record (JSON, TTL-bounded)
//! - `metadata`: `meta:{key}` → housekeeping values (last-prune cursors)
//!
//! Writers own exclusive fields by construction (submission creates, the
//! finalizer performs the terminal transition, the archive task sets only the
//! archive key, maintenance deletes); the store additionally serializes every
//! read-modify-write behind one mutex so whole-record JSON rewrites cannot
//! interleave.

pub mod error;
pub mod partitions;
pub mod pruning;
pub mod store;

pub use error::{LedgerError, Result};
pub use pruning::PruneStats;
pub use store::JobStore;
