//! The three-stage offload pipeline.
//!
//! A [`PipelineNode`] owns an initialized [`Accelerator`](crate::accel::Accelerator)
//! and three stage threads joined by bounded queues:
//!
//! ```text
//! intake -> uploader -> launcher -> downloader -> results
//! ```
//!
//! The uploader acquires a buffer set and queues the input copies, the
//! launcher queues the kernel behind them, and the downloader performs the one
//! blocking wait, releases the buffer set and retires the task. Tasks leave
//! the node in the order they entered.

pub mod node;
pub mod source;
pub mod stats;
pub mod task;

use thiserror::Error;

use crate::accel::AccelError;

pub use node::{CompletionHandle, PipelineNode};
pub use source::{InputPattern, TaskSource, VectorSource};
pub use stats::{PerformanceData, StatsCollector, StatsSnapshot};
pub use task::{Message, Task, TaskState};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("accelerator initialization failed: {0}")]
    Init(#[source] AccelError),

    #[error("failed to spawn {stage} thread: {source}")]
    Spawn {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage} stage failed on task {task_id}: {source}")]
    Stage {
        stage: &'static str,
        task_id: u64,
        #[source]
        source: AccelError,
    },

    #[error("pipeline aborted: {0}")]
    Fatal(String),

    #[error("{stage} thread panicked")]
    StagePanicked { stage: &'static str },

    #[error("pipeline no longer accepts tasks")]
    Closed,

    #[error("completion channel dropped before a count was published")]
    CompletionDropped,

    #[error("invalid task {task_id}: {detail}")]
    InvalidTask { task_id: u64, detail: String },

    #[error("task {task_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        task_id: u64,
        from: TaskState,
        to: TaskState,
    },
}

impl PipelineError {
    /// Whether the error leaves the backend unusable for further tasks.
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::Stage { source, .. } => source.is_fatal(),
            PipelineError::InvalidTask { .. } | PipelineError::InvalidTransition { .. } => false,
            _ => true,
        }
    }
}
