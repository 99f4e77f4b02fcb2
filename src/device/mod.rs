//! Host-emulated accelerator runtime.
//!
//! Models an OpenCL-style device so the GPU and FPGA backends run anywhere:
//! a [`Platform`] that enumerates devices, a [`Context`] that owns device
//! memory, an in-order [`CommandQueue`] executed on its own thread, programs
//! loaded from a path and [`Event`]s that chain commands together.
//!
//! Every handle here releases its resource in `Drop`, exactly once.

pub mod context;
pub mod event;
pub mod memory;
pub mod program;
pub mod queue;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::DeviceConfig;

pub use context::Context;
pub use event::{CompletionToken, Event, EventStatus, Token};
pub use memory::{DeviceBuffer, MemFlags};
pub use program::{Kernel, KernelArgs, Program};
pub use queue::CommandQueue;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no {kind} device found on platform")]
    DeviceNotFound { kind: DeviceKind },

    #[error("failed to create {what}: {reason}")]
    Creation { what: &'static str, reason: String },

    #[error("device out of memory: requested {requested} bytes, {available} bytes available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("could not load program {}: {reason}", path.display())]
    ProgramLoad { path: PathBuf, reason: String },

    #[error("program build failed for {}: {log}", path.display())]
    ProgramBuild { path: PathBuf, log: String },

    #[error("kernel entry point '{name}' not found in program")]
    KernelNotFound { name: String },

    #[error("command queue is closed")]
    QueueClosed,

    #[error("{command} failed: {reason}")]
    CommandFailed { command: &'static str, reason: String },

    #[error("invalid buffer access: {0}")]
    InvalidBuffer(String),
}

/// Class of physical device a backend asks the platform for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Gpu,
    Fpga,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            DeviceKind::Gpu => "gpu",
            DeviceKind::Fpga => "fpga",
        })
    }
}

/// Static description of one device on the platform.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub id: usize,
    pub kind: DeviceKind,
    pub name: String,
    /// Parallel lanes an NDRange launch is split across.
    pub compute_units: usize,
    pub global_mem_bytes: usize,
}

/// The set of devices visible to this process.
#[derive(Debug, Clone)]
pub struct Platform {
    devices: Vec<DeviceInfo>,
}

impl Platform {
    /// Enumerate the devices enabled in `config`.
    pub fn new(config: &DeviceConfig) -> Self {
        let compute_units = if config.compute_units == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            config.compute_units
        };

        let mut devices = Vec::new();
        if config.gpu_present {
            devices.push(DeviceInfo {
                id: devices.len(),
                kind: DeviceKind::Gpu,
                name: format!("emulated-gpu ({} CU)", compute_units),
                compute_units,
                global_mem_bytes: config.global_mem_bytes,
            });
        }
        if config.fpga_present {
            // One kernel instance on the fabric: single work-item execution.
            devices.push(DeviceInfo {
                id: devices.len(),
                kind: DeviceKind::Fpga,
                name: "emulated-fpga (1 CU)".to_string(),
                compute_units: 1,
                global_mem_bytes: config.global_mem_bytes,
            });
        }

        debug!(count = devices.len(), "platform enumerated");
        Self { devices }
    }

    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    /// First device of the requested kind.
    pub fn device(&self, kind: DeviceKind) -> Result<DeviceInfo, DeviceError> {
        self.devices
            .iter()
            .find(|d| d.kind == kind)
            .cloned()
            .ok_or(DeviceError::DeviceNotFound { kind })
    }
}
