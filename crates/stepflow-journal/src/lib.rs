pub mod artifacts;
pub mod journal;
pub mod projection;

pub use artifacts::ArtifactStore;
pub use journal::{MemoryJournal, SqliteJournal};
pub use projection::{Freshness, ProjectionHealth, ProjectionStore, QueryResult, RunProjection};
