use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use stepflow::{AppConfig, MemoryJournal, Orchestrator, ProjectionStore};
use stepflow_core::traits::Journal;

/// Route kernel logs to the test harness. Set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stepflow=warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Orchestrator over an in-memory journal with a projection attached.
pub fn orchestrator_with(dir: &Path, config: AppConfig) -> Orchestrator {
    init_tracing();
    let journal: Arc<dyn Journal> = Arc::new(MemoryJournal::new());
    let projection = ProjectionStore::in_memory(journal.clone()).expect("open projection");
    Orchestrator::builder(config)
        .journal(journal)
        .artifacts(stepflow::ArtifactStore::new(dir.join("runs")))
        .projection(Arc::new(projection))
        .build()
        .expect("build orchestrator")
}
