//! Disposable, queryable index derived from the journal.
//!
//! The reducer folds events into rows; the store persists those rows in
//! SQLite and reports how current they are. Deleting the store loses
//! nothing: `rebuild_all` regenerates it from the journal.

mod reducer;
mod store;

pub use reducer::{DecisionRow, ReceiptRow, RunProjection, RunRow, StepRow};
pub use store::{Freshness, ProjectionHealth, ProjectionStore, QueryResult, SCHEMA_VERSION};
