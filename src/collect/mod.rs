//! Collection: persisted entities, storage, task registry and the runner
//! that ties keyword replays to record upserts.

pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod store;

pub use model::{
    CollectionTask, RecordDraft, RecordPage, RecordQuery, Source, TaskStatus, TaskUpdate,
    TenderRecord, TraceRecord, UpsertOutcome,
};
pub use orchestrator::{import_trace_files, CollectRequest, Orchestrator, OrchestratorError};
pub use registry::{CancelRegistry, NotActive};
pub use store::{FileStore, StoreError, Stores};
