pub mod api;
pub mod callbacks;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod orchestrator;
pub mod remote;

pub use callbacks::{CallbackRegistry, Delivery, HandlerOptions};
pub use config::{Config, OrchestratorOptions};
pub use error::{CallbackError, EnqueueError};
pub use orchestrator::{KindReport, Orchestrator, PollReport};
pub use remote::{ProcessingStatus, RemoteJobService, RemoteStatus, UnconfiguredRemote};
