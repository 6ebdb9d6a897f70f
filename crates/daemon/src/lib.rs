pub mod batch;
pub mod concurrency;
pub mod config;
pub mod dispatch;
pub mod encoder;
pub mod events;
pub mod failures;
pub mod media;
pub mod mediainfo;
pub mod perf;
pub mod pipeline;
pub mod scan;
pub mod sidecar;
pub mod stages;
pub mod state;
pub mod store;

pub use config::DaemonConfig;
pub use events::{DaemonEvent, EventBus};
pub use failures::{FailureCategory, FailureTracker};
pub use media::{VideoRecord, VideoState, WorkItem};
pub use pipeline::{spawn_pipeline, PipelineDeps, PipelineHandle};
pub use state::PipelineState;
pub use store::{JsonFileStore, VideoStore};
