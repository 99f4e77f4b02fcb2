//! One end-to-end run: build the backend, push the tasks through a pipeline
//! node, collect the results and derive the metrics.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::accel::manager::{self, verify_against_reference};
use crate::accel::ops::ComputeOp;
use crate::accel::Backend;
use crate::config::AppConfig;
use crate::pipeline::{PerformanceData, PipelineNode, StatsSnapshot, Task, VectorSource};

/// Outcome of `--verify`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Verification {
    pub checked: u64,
    pub mismatches: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub backend: Backend,
    pub op: ComputeOp,
    pub program: Option<PathBuf>,
    pub vector_len: usize,
    pub tasks_requested: u64,
    pub tasks_submitted: u64,
    /// Count published through the node's completion channel.
    pub tasks_processed: u64,
    /// Whether results left the node in submission order.
    pub in_order: bool,
    pub verification: Option<Verification>,
    pub stats: StatsSnapshot,
    pub performance: PerformanceData,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.tasks_processed == self.tasks_requested
            && self.in_order
            && self.verification.map_or(true, |v| v.mismatches == 0)
    }

    /// Human-readable summary.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let perf = &self.performance;
        let _ = writeln!(out, "\n=== accelpipe run {} ===", self.run_id);
        let _ = writeln!(out, "{:<24} | {}", "Backend", self.backend);
        let _ = writeln!(out, "{:<24} | {}", "Kernel", self.op);
        if let Some(program) = &self.program {
            let _ = writeln!(out, "{:<24} | {}", "Program", program.display());
        }
        let _ = writeln!(out, "{:<24} | {}", "Vector length", self.vector_len);
        let _ = writeln!(
            out,
            "{:<24} | {} / {}",
            "Tasks completed", self.tasks_processed, self.tasks_requested
        );
        if self.stats.tasks_failed > 0 {
            let _ = writeln!(out, "{:<24} | {}", "Tasks failed", self.stats.tasks_failed);
        }
        let _ = writeln!(out, "{:-<24}-|-{:-<24}", "", "");
        let _ = writeln!(out, "{:<24} | {:.3} s", "Elapsed", perf.elapsed_s);
        let _ = writeln!(out, "{:<24} | {:.3} ms/task", "Avg service time", perf.avg_service_time_ms);
        let _ = writeln!(out, "{:<24} | {:.3} ms/task", "Avg in-node time", perf.avg_in_node_time_ms);
        let _ = writeln!(out, "{:<24} | {:.3} ms/task", "Avg pure compute time", perf.avg_computed_ms);
        let _ = writeln!(out, "{:<24} | {:.3} ms/task", "Avg overhead time", perf.avg_overhead_ms);
        let _ = writeln!(out, "{:<24} | {:.2} tasks/s", "Throughput", perf.throughput);
        if let Some(v) = &self.verification {
            let _ = writeln!(out, "{:<24} | {} checked, {} mismatches", "Verification", v.checked, v.mismatches);
        }
        let status = if self.success() { "OK" } else { "INCOMPLETE" };
        let _ = writeln!(out, "{:<24} | {}", "Status", status);
        out
    }
}

struct ConsumerSummary {
    retired: u64,
    in_order: bool,
    verification: Option<Verification>,
}

/// Drain retired tasks, checking order and (optionally) correctness.
fn consume(results: Receiver<Box<Task>>, verify: Option<ComputeOp>) -> ConsumerSummary {
    let mut summary = ConsumerSummary {
        retired: 0,
        in_order: true,
        verification: verify.map(|_| Verification::default()),
    };
    let mut last_id = 0;

    for task in results.iter() {
        summary.retired += 1;
        if task.id <= last_id {
            warn!(task_id = task.id, previous = last_id, "task retired out of order");
            summary.in_order = false;
        }
        last_id = task.id;

        if let (Some(op), Some(v)) = (verify, summary.verification.as_mut()) {
            v.checked += 1;
            if !verify_against_reference(op, &task.a, &task.b, &task.c) {
                v.mismatches += 1;
                warn!(task_id = task.id, op = %op, "result differs from the CPU reference");
            }
        }
    }
    summary
}

/// Execute the run described by `config`.
pub fn run(config: &AppConfig) -> Result<RunReport> {
    config.validate()?;
    let plan = manager::plan(config)?;
    let accelerator = manager::build_accelerator(&plan, config)?;

    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    info!(
        %run_id,
        backend = %plan.backend,
        n = config.run.vector_len,
        tasks = config.run.tasks,
        "starting run"
    );

    let mut node = PipelineNode::start(accelerator, &config.pipeline)
        .with_context(|| format!("failed to start the {} pipeline", plan.backend))?;
    let completion = node
        .take_completion()
        .ok_or_else(|| anyhow!("completion handle already taken"))?;
    let results = node
        .take_results()
        .ok_or_else(|| anyhow!("result receiver already taken"))?;

    let verify = config.run.verify.then_some(plan.op);
    let consumer = thread::Builder::new()
        .name("accelpipe-consumer".to_string())
        .spawn(move || consume(results, verify))
        .context("failed to spawn result consumer")?;

    let started = Instant::now();
    let mut source = VectorSource::new(config.run.vector_len, config.run.tasks, config.run.input);
    let submitted = node.feed(&mut source).context("failed to submit tasks")?;
    let processed = completion
        .blocking_wait()
        .context("pipeline ended without reporting a count")?;
    let elapsed = started.elapsed();

    let stats = node.shutdown().context("pipeline failed")?;
    let summary = consumer
        .join()
        .map_err(|_| anyhow!("result consumer panicked"))?;
    if summary.retired != processed {
        warn!(retired = summary.retired, processed, "consumer saw a different task count");
    }

    let report = RunReport {
        run_id,
        started_at,
        backend: plan.backend,
        op: plan.op,
        program: plan.program,
        vector_len: config.run.vector_len,
        tasks_requested: config.run.tasks as u64,
        tasks_submitted: submitted,
        tasks_processed: processed,
        in_order: summary.in_order,
        verification: summary.verification,
        performance: PerformanceData::calculate(&stats, elapsed),
        stats,
    };
    info!(
        %run_id,
        processed,
        throughput = report.performance.throughput,
        success = report.success(),
        "run finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::InputPattern;

    fn small_config(backend: Backend) -> AppConfig {
        let mut config = AppConfig::default();
        config.run.backend = backend;
        config.run.vector_len = 1024;
        config.run.tasks = 6;
        config.run.verify = true;
        config.run.workers = 2;
        config
    }

    #[test]
    fn test_cpu_run_succeeds() {
        let report = run(&small_config(Backend::Cpu)).unwrap();
        assert!(report.success());
        assert_eq!(report.tasks_processed, 6);
        assert_eq!(report.tasks_submitted, 6);
        assert_eq!(report.verification.unwrap().mismatches, 0);
        assert!(report.render().contains("Tasks completed"));
    }

    #[test]
    fn test_gpu_run_with_generated_program() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("heavy_compute.cl");
        std::fs::write(&path, "__kernel void heavy_compute(__global const int* a) {}").unwrap();

        let mut config = small_config(Backend::Gpu);
        config.run.kernel_path = Some(path);
        config.run.input = InputPattern::Random { seed: 3 };
        let report = run(&config).unwrap();
        assert!(report.success());
        assert_eq!(report.op, ComputeOp::HeavyCompute);
    }

    #[test]
    fn test_missing_program_fails_before_running() {
        let mut config = small_config(Backend::Gpu);
        config.run.kernel_path = Some(PathBuf::from("/nonexistent/vec_add.cl"));
        assert!(run(&config).is_err());
    }

    #[test]
    fn test_zero_tasks_rejected() {
        let mut config = small_config(Backend::Cpu);
        config.run.tasks = 0;
        assert!(run(&config).is_err());
    }

    #[test]
    fn test_report_serializes() {
        let report = run(&small_config(Backend::Cpu)).unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["backend"], "cpu");
        assert_eq!(json["tasks_processed"], 6);
    }
}
