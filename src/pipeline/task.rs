use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::PipelineError;
use crate::device::Token;

/// Where a task is in the accelerator contract. States are only ever entered
/// in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Created,
    BufferAcquired,
    UploadSubmitted,
    ExecutionSubmitted,
    ResultsReady,
    Retired,
}

impl TaskState {
    pub fn next(self) -> Option<TaskState> {
        match self {
            TaskState::Created => Some(TaskState::BufferAcquired),
            TaskState::BufferAcquired => Some(TaskState::UploadSubmitted),
            TaskState::UploadSubmitted => Some(TaskState::ExecutionSubmitted),
            TaskState::ExecutionSubmitted => Some(TaskState::ResultsReady),
            TaskState::ResultsReady => Some(TaskState::Retired),
            TaskState::Retired => None,
        }
    }
}

/// One unit of work: `c = f(a, b)` over `n` elements.
pub struct Task {
    pub id: u64,
    pub n: usize,
    pub a: Arc<[i32]>,
    pub b: Arc<[i32]>,
    /// Output, written once by the backend's read-back.
    pub c: Vec<i32>,
    /// Pool slot, held between the uploader's acquire and the downloader's
    /// release.
    pub buffer_idx: Option<usize>,
    /// Most recent pending asynchronous operation for this task.
    pub completion_token: Option<Token>,
    /// Set when the task enters the pipeline node.
    pub arrival_time: Option<Instant>,
    state: TaskState,
}

impl Task {
    pub fn new(id: u64, a: Arc<[i32]>, b: Arc<[i32]>) -> Result<Self, PipelineError> {
        if a.len() != b.len() {
            return Err(PipelineError::InvalidTask {
                task_id: id,
                detail: format!("input lengths differ ({} vs {})", a.len(), b.len()),
            });
        }
        let n = a.len();
        Ok(Self {
            id,
            n,
            a,
            b,
            c: vec![0; n],
            buffer_idx: None,
            completion_token: None,
            arrival_time: None,
            state: TaskState::Created,
        })
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Move to `next`, which must directly follow the current state.
    pub fn advance(&mut self, next: TaskState) -> Result<(), PipelineError> {
        if self.state.next() != Some(next) {
            return Err(PipelineError::InvalidTransition {
                task_id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Time since the task entered the node.
    pub fn time_in_node(&self) -> Option<Duration> {
        self.arrival_time.map(|t| t.elapsed())
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("n", &self.n)
            .field("state", &self.state)
            .field("buffer_idx", &self.buffer_idx)
            .field("pending", &self.completion_token.is_some())
            .finish()
    }
}

/// What flows through the inter-stage queues.
#[derive(Debug)]
pub enum Message {
    Task(Box<Task>),
    /// No more tasks follow. Every stage forwards it before exiting.
    StreamEnd,
}
