//! Backend selection: turns the run configuration into a boxed
//! [`Accelerator`] and provides the CPU reference check used by `--verify`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::cpu::CpuAccelerator;
use super::device::DeviceBackend;
use super::ops::ComputeOp;
use super::Accelerator;
use crate::config::AppConfig;

/// Compute function used when nothing else selects one.
pub const DEFAULT_OP: ComputeOp = ComputeOp::PolynomialOp;

/// Backend types selectable at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Host computation inside the read-back, no overlap.
    Cpu,
    /// Emulated GPU, NDRange launches from a built program source.
    Gpu,
    /// Emulated FPGA, single work-item launches from an `.xclbin`.
    Fpga,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::Cpu, Backend::Gpu, Backend::Fpga];

    /// Program loaded when no kernel path is given.
    pub fn default_program(&self) -> Option<PathBuf> {
        match self {
            Backend::Cpu => None,
            Backend::Gpu => Some(PathBuf::from("kernels/gpu/polynomial_op.cl")),
            Backend::Fpga => Some(PathBuf::from("kernels/fpga/krnl_polynomial_op.xclbin")),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Cpu => write!(f, "cpu"),
            Backend::Gpu => write!(f, "gpu"),
            Backend::Fpga => write!(f, "fpga"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Backend::Cpu),
            "gpu" => Ok(Backend::Gpu),
            "fpga" => Ok(Backend::Fpga),
            other => bail!("invalid device type '{}' (expected cpu, gpu or fpga)", other),
        }
    }
}

/// Entry-point name for a program path: the file name up to its first `.`.
///
/// `kernels/fpga/krnl_vadd.hw.xclbin` names `krnl_vadd`.
pub fn entry_point_from_path(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    let stem = file_name.split('.').next()?;
    (!stem.is_empty()).then(|| stem.to_string())
}

/// Everything the runner needs to know about the selected backend.
#[derive(Debug, Clone)]
pub struct BackendPlan {
    pub backend: Backend,
    pub program: Option<PathBuf>,
    pub entry_point: Option<String>,
    /// Compute function the results correspond to.
    pub op: ComputeOp,
}

/// Work out program, entry point and compute function for `config.run`.
pub fn plan(config: &AppConfig) -> Result<BackendPlan> {
    let backend = config.run.backend;
    let program = config
        .run
        .kernel_path
        .clone()
        .or_else(|| backend.default_program());

    let entry_point = match &program {
        Some(path) => match entry_point_from_path(path) {
            Some(name) => Some(name),
            None => bail!("cannot derive a kernel name from '{}'", path.display()),
        },
        None => None,
    };

    let op = match &entry_point {
        Some(name) => match ComputeOp::lookup(name) {
            Some(op) => op,
            None if backend == Backend::Cpu => bail!("no CPU implementation for kernel '{}'", name),
            // Device programs are checked at build time; results are only
            // verifiable for known functions.
            None => {
                warn!(kernel = %name, "kernel has no host reference implementation");
                DEFAULT_OP
            }
        },
        None => DEFAULT_OP,
    };

    debug!(%backend, ?program, ?entry_point, %op, "backend planned");
    Ok(BackendPlan {
        backend,
        program,
        entry_point,
        op,
    })
}

/// Build the accelerator described by `plan`. The result is not initialized.
pub fn build_accelerator(plan: &BackendPlan, config: &AppConfig) -> Result<Box<dyn Accelerator>> {
    let accelerator: Box<dyn Accelerator> = match plan.backend {
        Backend::Cpu => Box::new(CpuAccelerator::new(plan.op, config.run.workers)),
        Backend::Gpu | Backend::Fpga => {
            let (Some(program), Some(entry_point)) = (&plan.program, &plan.entry_point) else {
                bail!("{} backend needs a kernel program", plan.backend);
            };
            let backend = if plan.backend == Backend::Gpu {
                DeviceBackend::gpu(program, entry_point, &config.device)
            } else {
                DeviceBackend::fpga(program, entry_point, &config.device)
            };
            Box::new(backend.with_pool_size(config.pipeline.pool_size))
        }
    };

    info!(backend = %plan.backend, op = %plan.op, "accelerator selected");
    Ok(accelerator)
}

/// Compare a backend's output against the scalar reference of `op`.
pub fn verify_against_reference(op: ComputeOp, a: &[i32], b: &[i32], c: &[i32]) -> bool {
    if a.len() != c.len() || b.len() != c.len() {
        return false;
    }
    let mut reference = vec![0; c.len()];
    op.apply(a, b, &mut reference);
    reference == c
}
