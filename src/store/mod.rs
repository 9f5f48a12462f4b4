//! In-process embedded store satisfying the "external relational store"
//! contract: transactional rows, typed columns, ordered iteration, and
//! multi-column indexed lookup — without a SQL parser or planner, since
//! the settings engine's schema (§6) is fixed at compile time.

pub mod persistence;
pub mod table;
pub mod txn;

pub use persistence::SnapshotManager;
pub use table::{RowId, Table};
pub use txn::{Snapshot, TransactionId, TransactionManager, TxnGuard};
