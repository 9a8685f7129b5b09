//! Batch query orchestration: structured queries, parallel execution,
//! result snapshots, and export.

pub mod export;
pub mod job;
pub mod orchestrator;
pub mod query;

pub use export::{export_snapshot, ExportFormat};
pub use job::{BatchSnapshot, BatchStatus, QueryOutcome, QueryResult};
pub use orchestrator::{BatchConfig, BatchOptions, BatchOrchestrator};
pub use query::{Query, QuerySpec};
