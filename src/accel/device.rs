//! Backend glue shared by the GPU and FPGA accelerators.
//!
//! Both hold the same runtime objects (context, queue, program, kernel and a
//! buffer pool) and chain their commands through completion tokens: the two
//! uploads are chained to each other, the kernel waits on the second upload,
//! and the read-back waits on the kernel.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::pool::{BufferPool, POOL_SIZE};
use super::{fpga, gpu, AccelError, Accelerator};
use crate::config::DeviceConfig;
use crate::device::{
    CommandQueue, Context, DeviceKind, Kernel, KernelArgs, Platform, Program,
};
use crate::pipeline::Task;

/// Objects created by `initialize`. Fields drop in declaration order: the
/// queue thread is joined before any buffer, program or context goes away.
struct DeviceRuntime {
    queue: CommandQueue,
    pool: BufferPool,
    kernel: Kernel,
    #[allow(dead_code)]
    program: Program,
    context: Context,
}

pub struct DeviceBackend {
    kind: DeviceKind,
    name: String,
    program_path: PathBuf,
    entry_point: String,
    device_config: DeviceConfig,
    pool_size: usize,
    runtime: Option<DeviceRuntime>,
}

impl DeviceBackend {
    /// GPU backend running `entry_point` from the program source at `program_path`.
    pub fn gpu(program_path: &Path, entry_point: &str, device_config: &DeviceConfig) -> Self {
        Self::new(DeviceKind::Gpu, program_path, entry_point, device_config)
    }

    /// FPGA backend running `entry_point` from the `.xclbin` at `program_path`.
    pub fn fpga(program_path: &Path, entry_point: &str, device_config: &DeviceConfig) -> Self {
        Self::new(DeviceKind::Fpga, program_path, entry_point, device_config)
    }

    fn new(kind: DeviceKind, program_path: &Path, entry_point: &str, device_config: &DeviceConfig) -> Self {
        Self {
            kind,
            name: kind.to_string(),
            program_path: program_path.to_path_buf(),
            entry_point: entry_point.to_string(),
            device_config: device_config.clone(),
            pool_size: POOL_SIZE,
            runtime: None,
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Per-buffer byte size the pool is currently allocated for.
    pub fn pool_bytes(&self) -> Option<usize> {
        self.runtime.as_ref().and_then(|rt| rt.pool.allocated_bytes())
    }

    /// Device memory in use by this backend.
    pub fn memory_in_use(&self) -> usize {
        self.runtime.as_ref().map_or(0, |rt| rt.context.memory_in_use())
    }

    fn runtime(&self) -> Result<&DeviceRuntime, AccelError> {
        self.runtime.as_ref().ok_or(AccelError::NotInitialized)
    }

    fn slot(&self, call: &'static str, task: &Task) -> Result<usize, AccelError> {
        task.buffer_idx.ok_or_else(|| AccelError::InvalidTask {
            call,
            task_id: task.id,
            detail: "no buffer set acquired".to_string(),
        })
    }
}

impl Accelerator for DeviceBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self) -> Result<(), AccelError> {
        if self.runtime.is_some() {
            return Ok(());
        }

        let device = Platform::new(&self.device_config).device(self.kind)?;
        let context = Context::create(&device)?;
        let queue = CommandQueue::create(&context)?;
        let program = match self.kind {
            DeviceKind::Gpu => gpu::load_program(&context, &self.program_path)?,
            DeviceKind::Fpga => fpga::load_program(&context, &self.program_path)?,
        };
        let kernel = Kernel::create(&program, &self.entry_point)?;
        let pool = BufferPool::new(&context, self.pool_size);

        info!(
            backend = %self.kind,
            device = %device.name,
            program = %self.program_path.display(),
            kernel = kernel.name(),
            pool_size = pool.size(),
            "device backend initialized"
        );
        self.runtime = Some(DeviceRuntime {
            queue,
            pool,
            kernel,
            program,
            context,
        });
        Ok(())
    }

    fn acquire_buffer_set(&self) -> Result<usize, AccelError> {
        Ok(self.runtime()?.pool.acquire())
    }

    fn release_buffer_set(&self, idx: usize) {
        if let Some(rt) = &self.runtime {
            rt.pool.release(idx);
        }
    }

    fn send_data_async(&self, task: &mut Task) -> Result<(), AccelError> {
        const CALL: &str = "send_data_async";
        let rt = self.runtime()?;
        let idx = self.slot(CALL, task)?;

        // Allocation failure here is fatal, not a per-call failure.
        rt.pool
            .ensure_capacity(task.n * std::mem::size_of::<i32>(), idx)?;
        let set = rt.pool.buffer_set(idx)?;

        let upload_a = rt
            .queue
            .enqueue_write(&set.a, task.a.clone(), Vec::new())
            .map_err(AccelError::submission(CALL, task.id))?;
        let upload_b = rt
            .queue
            .enqueue_write(&set.b, task.b.clone(), vec![upload_a.into_token()])
            .map_err(AccelError::submission(CALL, task.id))?;

        task.completion_token = Some(upload_b.into_token());
        debug!(task_id = task.id, buffer_idx = idx, n = task.n, "upload queued");
        Ok(())
    }

    fn execute_async(&self, task: &mut Task) -> Result<(), AccelError> {
        const CALL: &str = "execute_async";
        let rt = self.runtime()?;
        let idx = self.slot(CALL, task)?;
        let set = rt.pool.buffer_set(idx)?;

        let upload = task.completion_token.clone().ok_or_else(|| AccelError::InvalidTask {
            call: CALL,
            task_id: task.id,
            detail: "no upload submitted".to_string(),
        })?;
        let args = KernelArgs {
            a: set.a,
            b: set.b,
            c: set.c,
            n: task.n,
        };

        let event = match self.kind {
            DeviceKind::Gpu => gpu::launch(&rt.queue, &rt.kernel, args, vec![upload]),
            DeviceKind::Fpga => fpga::launch(&rt.queue, &rt.kernel, args, vec![upload]),
        }
        .map_err(AccelError::submission(CALL, task.id))?;

        // The queue now holds the upload dependency; the task only tracks the kernel.
        task.completion_token = Some(event.into_token());
        debug!(task_id = task.id, buffer_idx = idx, "kernel queued");
        Ok(())
    }

    fn read_results_blocking(&self, task: &mut Task) -> Result<Duration, AccelError> {
        const CALL: &str = "read_results_blocking";
        let start = Instant::now();
        let rt = self.runtime()?;
        let idx = self.slot(CALL, task)?;
        let set = rt.pool.buffer_set(idx)?;

        let token = task.completion_token.take().ok_or_else(|| AccelError::InvalidTask {
            call: CALL,
            task_id: task.id,
            detail: "no kernel submitted".to_string(),
        })?;
        token.wait().map_err(AccelError::submission(CALL, task.id))?;

        task.c.resize(task.n, 0);
        rt.queue
            .enqueue_read_blocking(&set.c, &mut task.c, Vec::new())
            .map_err(AccelError::submission(CALL, task.id))?;

        let elapsed = start.elapsed();
        debug!(task_id = task.id, buffer_idx = idx, elapsed_us = elapsed.as_micros() as u64, "results read");
        Ok(elapsed)
    }
}

impl Drop for DeviceBackend {
    fn drop(&mut self) {
        if self.runtime.take().is_some() {
            debug!(backend = %self.kind, "device backend released");
        }
    }
}
