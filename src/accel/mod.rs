//! Accelerator backends -- CPU baseline, emulated GPU and emulated FPGA.
//!
//! Every backend implements [`Accelerator`], the capability contract the
//! pipeline node drives: one-time setup, buffer-set acquire/release and the
//! three pipeline primitives (send, launch, blocking read-back).

pub mod cpu;
pub mod device;
pub mod fpga;
pub mod gpu;
pub mod manager;
pub mod ops;
pub mod pool;

use std::time::Duration;

use thiserror::Error;

use crate::device::DeviceError;
use crate::pipeline::Task;

pub use crate::device::CompletionToken;
pub use manager::{build_accelerator, Backend};

#[derive(Debug, Error)]
pub enum AccelError {
    #[error("accelerator used before initialize()")]
    NotInitialized,

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("{call} failed for task {task_id}: {source}")]
    Submission {
        call: &'static str,
        task_id: u64,
        #[source]
        source: DeviceError,
    },

    #[error("{call} rejected task {task_id}: {detail}")]
    InvalidTask {
        call: &'static str,
        task_id: u64,
        detail: String,
    },
}

impl AccelError {
    /// Whether the backend can no longer make progress at all.
    pub fn is_fatal(&self) -> bool {
        match self {
            AccelError::NotInitialized | AccelError::Device(_) => true,
            AccelError::Submission { source, .. } => {
                matches!(source, DeviceError::QueueClosed | DeviceError::OutOfMemory { .. })
            }
            AccelError::InvalidTask { .. } => false,
        }
    }

    pub(crate) fn submission(call: &'static str, task_id: u64) -> impl FnOnce(DeviceError) -> Self {
        move |source| AccelError::Submission {
            call,
            task_id,
            source,
        }
    }
}

/// Capability contract every backend satisfies.
///
/// `initialize` runs once, before the backend is shared between the pipeline
/// stages; everything else takes `&self` and may be called concurrently from
/// the uploader, launcher and downloader threads.
pub trait Accelerator: Send + Sync {
    fn name(&self) -> &str;

    /// Discover the device, create the context and queue, load the program.
    fn initialize(&mut self) -> Result<(), AccelError>;

    /// Block until a buffer set is free and return its index.
    fn acquire_buffer_set(&self) -> Result<usize, AccelError>;

    fn release_buffer_set(&self, idx: usize);

    /// Queue non-blocking copies of `task.a` and `task.b` into the task's
    /// buffer set. Leaves a token on the task that is ready once both landed.
    fn send_data_async(&self, task: &mut Task) -> Result<(), AccelError>;

    /// Queue the kernel behind the upload token and replace it with the
    /// kernel's token.
    fn execute_async(&self, task: &mut Task) -> Result<(), AccelError>;

    /// Wait for the kernel, copy the output into `task.c` and clear the
    /// token. Returns the time spent in this call.
    fn read_results_blocking(&self, task: &mut Task) -> Result<Duration, AccelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_classification() {
        assert!(AccelError::NotInitialized.is_fatal());
        assert!(AccelError::Device(DeviceError::QueueClosed).is_fatal());
        assert!(AccelError::submission("enqueue_write", 3)(DeviceError::QueueClosed).is_fatal());

        let transient = AccelError::submission("enqueue_nd_range", 3)(DeviceError::InvalidBuffer(
            "bad".into(),
        ));
        assert!(!transient.is_fatal());
        assert!(transient.to_string().contains("task 3"));
    }
}
