use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::ops::ComputeOp;
use super::{AccelError, Accelerator};
use crate::pipeline::Task;

/// Inputs shorter than this per worker are not worth a thread.
const MIN_CHUNK: usize = 4096;

/// Host-only backend. Data is already where the computation runs, so
/// transfers and launch are no-ops and the read-back does all the work.
///
/// There is a single implicit buffer slot (index 0) that every task shares;
/// nothing is allocated for it.
#[derive(Debug)]
pub struct CpuAccelerator {
    op: ComputeOp,
    workers: usize,
}

impl CpuAccelerator {
    /// `workers == 0` uses all available cores.
    pub fn new(op: ComputeOp, workers: usize) -> Self {
        let workers = if workers == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            workers
        };
        Self { op, workers }
    }

    pub fn op(&self) -> ComputeOp {
        self.op
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl Accelerator for CpuAccelerator {
    fn name(&self) -> &str {
        "cpu"
    }

    fn initialize(&mut self) -> Result<(), AccelError> {
        info!(op = %self.op, workers = self.workers, "cpu backend ready");
        Ok(())
    }

    fn acquire_buffer_set(&self) -> Result<usize, AccelError> {
        Ok(0)
    }

    fn release_buffer_set(&self, _idx: usize) {}

    fn send_data_async(&self, _task: &mut Task) -> Result<(), AccelError> {
        Ok(())
    }

    fn execute_async(&self, _task: &mut Task) -> Result<(), AccelError> {
        Ok(())
    }

    fn read_results_blocking(&self, task: &mut Task) -> Result<Duration, AccelError> {
        let start = Instant::now();
        let n = task.n;
        task.c.resize(n, 0);

        let (a, b, c) = (&task.a[..n], &task.b[..n], &mut task.c[..]);
        let chunk = n.div_ceil(self.workers).max(MIN_CHUNK);
        if self.workers <= 1 || n <= chunk {
            self.op.apply(a, b, c);
        } else {
            let op = self.op;
            thread::scope(|s| {
                for ((c, a), b) in c.chunks_mut(chunk).zip(a.chunks(chunk)).zip(b.chunks(chunk)) {
                    s.spawn(move || op.apply(a, b, c));
                }
            });
        }

        let elapsed = start.elapsed();
        debug!(task_id = task.id, n, elapsed_us = elapsed.as_micros() as u64, "cpu task computed");
        Ok(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn task(n: usize) -> Task {
        let a: Arc<[i32]> = (0..n as i32).collect();
        let b: Arc<[i32]> = (0..n as i32).map(|x| x * 2).collect();
        Task::new(1, a, b).unwrap()
    }

    #[test]
    fn test_read_computes_whole_task() {
        let cpu = CpuAccelerator::new(ComputeOp::VecAdd, 1);
        let mut t = task(8);
        cpu.read_results_blocking(&mut t).unwrap();
        assert_eq!(t.c, vec![0, 3, 6, 9, 12, 15, 18, 21]);
    }

    #[test]
    fn test_parallel_workers_match_single_worker() {
        let n = 50_000;
        let mut single = task(n);
        let mut parallel = task(n);
        CpuAccelerator::new(ComputeOp::PolynomialOp, 1)
            .read_results_blocking(&mut single)
            .unwrap();
        CpuAccelerator::new(ComputeOp::PolynomialOp, 4)
            .read_results_blocking(&mut parallel)
            .unwrap();
        assert_eq!(single.c, parallel.c);
    }

    #[test]
    fn test_single_implicit_slot() {
        let cpu = CpuAccelerator::new(ComputeOp::VecAdd, 1);
        assert_eq!(cpu.acquire_buffer_set().unwrap(), 0);
        assert_eq!(cpu.acquire_buffer_set().unwrap(), 0);
        cpu.release_buffer_set(0);
    }

    #[test]
    fn test_zero_workers_means_all_cores() {
        assert!(CpuAccelerator::new(ComputeOp::VecAdd, 0).workers() >= 1);
    }
}
