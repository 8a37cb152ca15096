pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod probe;
pub mod profile;
pub mod progress;
pub mod record;
pub mod retry;
pub mod scanner;
pub mod selector;
pub mod session;
pub mod store;
pub mod writer;

// Re-export primary types for convenience
pub use cache::{CacheStats, MigrationCache};
pub use config::{EngineConfig, RetryPolicy};
pub use engine::MigrationEngine;
pub use error::{BackfillError, Result};
pub use probe::{EligibilityReport, EligibleCandidate};
pub use profile::MigrationProfile;
pub use progress::{MigrationProgress, ProgressReporter, Subscription};
pub use record::{CandidateRecord, JoinRecord};
pub use session::{
    BatchOutcome, DebugEntry, EnginePhase, LogLevel, MigrationSession, MigrationState,
    MigrationSummary, Page,
};
pub use store::{Cursor, Direction, Document, DocumentStore, MemoryStore, Query, Snapshot, WriteBatch};

#[cfg(feature = "sqlite")]
pub use store::SqliteStore;
