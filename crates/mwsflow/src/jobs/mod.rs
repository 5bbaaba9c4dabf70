pub mod lifecycle;
pub mod model;
pub mod params;
pub mod retry;
pub mod verify;

pub mod memory;
pub mod repo;
pub mod store;
pub use memory::{InMemoryEntryStore, StoreStats};
pub use repo::PgEntryStore;
pub use store::{Change, ChangeSet, EntryFilter, EntryStore, StoreError};

pub mod feed_processor;
pub mod processor;
pub mod report_processor;
pub mod stage;
pub use feed_processor::FeedProcessor;
pub use processor::JobProcessor;
pub use report_processor::ReportProcessor;
pub use stage::{DownloadOutcome, StatusSummary, SubmitOutcome, Verification};

pub mod metrics;
pub use metrics::{KindMetrics, Metrics};

pub use lifecycle::{Stage, TransitionError};
pub use model::{
    CallbackDescriptor, DownloadedResult, EntryState, JobEntry, JobKind, NewJobEntry, Owner,
    Region, RetryStage,
};
pub use params::{FeedSubmissionParams, ReportRequestParams};
pub use retry::{BackoffConfig, RetryPolicy};
pub use verify::{DigestAlgorithm, VerifyError};
