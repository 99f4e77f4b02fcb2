//! Device programs and kernel entry points.
//!
//! GPU programs are text sources that must be built before a kernel can be
//! created from them. FPGA programs are precompiled `.xclbin` binaries that
//! are loaded as-is. In both cases the entry point resolves to one of the
//! compute functions in [`crate::accel::ops`].

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{Context, DeviceBuffer, DeviceError};
use crate::accel::ops::ComputeOp;

/// Leading bytes of every device binary container.
pub const XCLBIN_MAGIC: &[u8] = b"xclbin2";

#[derive(Debug)]
enum ProgramImage {
    Source(String),
    Binary(Vec<u8>),
}

/// A program loaded onto a context.
#[derive(Debug)]
pub struct Program {
    path: PathBuf,
    image: ProgramImage,
    entry_points: Vec<String>,
    built: bool,
    context: Context,
}

impl Program {
    /// Load a text program. It has to be [built](Program::build) before use.
    pub fn from_source(context: &Context, path: &Path) -> Result<Self, DeviceError> {
        let source = std::fs::read_to_string(path).map_err(|e| DeviceError::ProgramLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        debug!(path = %path.display(), bytes = source.len(), "program source loaded");

        Ok(Self {
            path: path.to_path_buf(),
            image: ProgramImage::Source(source),
            entry_points: Vec::new(),
            built: false,
            context: context.clone(),
        })
    }

    /// Load a precompiled binary. No build step is needed.
    pub fn from_binary(context: &Context, path: &Path) -> Result<Self, DeviceError> {
        let load_err = |reason: String| DeviceError::ProgramLoad {
            path: path.to_path_buf(),
            reason,
        };

        if path.extension().and_then(|e| e.to_str()) != Some("xclbin") {
            return Err(load_err("expected a .xclbin binary".to_string()));
        }
        if !path.is_file() {
            return Err(load_err("not a regular file".to_string()));
        }
        let bytes = std::fs::read(path).map_err(|e| load_err(e.to_string()))?;
        if !bytes.starts_with(XCLBIN_MAGIC) {
            return Err(load_err("missing xclbin header".to_string()));
        }

        let entry_points = binary_entry_points(&bytes[XCLBIN_MAGIC.len()..]);
        info!(
            path = %path.display(),
            bytes = bytes.len(),
            kernels = ?entry_points,
            "program binary loaded"
        );

        Ok(Self {
            path: path.to_path_buf(),
            image: ProgramImage::Binary(bytes),
            entry_points,
            built: true,
            context: context.clone(),
        })
    }

    /// Compile the program source for the context's device.
    pub fn build(&mut self) -> Result<(), DeviceError> {
        let source = match &self.image {
            ProgramImage::Binary(_) => return Ok(()),
            ProgramImage::Source(source) => source,
        };

        let entry_points = source_entry_points(source);
        if entry_points.is_empty() {
            return Err(DeviceError::ProgramBuild {
                path: self.path.clone(),
                log: "no kernel entry points declared".to_string(),
            });
        }
        if let Some(unknown) = entry_points.iter().find(|n| ComputeOp::lookup(n).is_none()) {
            return Err(DeviceError::ProgramBuild {
                path: self.path.clone(),
                log: format!("kernel '{}' has no implementation for this device", unknown),
            });
        }

        info!(
            path = %self.path.display(),
            device = %self.context.device().name,
            kernels = ?entry_points,
            "program built"
        );
        self.entry_points = entry_points;
        self.built = true;
        Ok(())
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_points(&self) -> &[String] {
        &self.entry_points
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "program released");
    }
}

/// Scan `kernel void <name>(` / `__kernel void <name>(` declarations.
fn source_entry_points(source: &str) -> Vec<String> {
    let tokens: Vec<&str> = source
        .split(|c: char| c.is_whitespace() || c == '(')
        .filter(|t| !t.is_empty())
        .collect();

    let mut names = Vec::new();
    for window in tokens.windows(3) {
        if matches!(window[0], "kernel" | "__kernel") && window[1] == "void" {
            let name: String = window[2]
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect();
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

/// Kernel names are stored NUL-separated in the binary body.
fn binary_entry_points(body: &[u8]) -> Vec<String> {
    body.split(|b| *b == 0)
        .filter_map(|chunk| std::str::from_utf8(chunk).ok())
        .filter(|name| ComputeOp::lookup(name).is_some())
        .map(str::to_string)
        .collect()
}

/// A compute entry point created from a built program.
#[derive(Debug, Clone)]
pub struct Kernel {
    name: String,
    op: ComputeOp,
}

impl Kernel {
    pub fn create(program: &Program, name: &str) -> Result<Self, DeviceError> {
        if !program.is_built() {
            return Err(DeviceError::Creation {
                what: "kernel",
                reason: format!("program {} is not built", program.path().display()),
            });
        }
        if !program.entry_points().iter().any(|e| e == name) {
            return Err(DeviceError::KernelNotFound {
                name: name.to_string(),
            });
        }
        let op = ComputeOp::lookup(name).ok_or_else(|| DeviceError::KernelNotFound {
            name: name.to_string(),
        })?;

        debug!(kernel = name, op = %op, "kernel created");
        Ok(Self {
            name: name.to_string(),
            op,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op(&self) -> ComputeOp {
        self.op
    }
}

/// Arguments bound to a kernel for one launch: two inputs, one output and the
/// element count.
#[derive(Debug, Clone)]
pub struct KernelArgs {
    pub a: DeviceBuffer,
    pub b: DeviceBuffer,
    pub c: DeviceBuffer,
    pub n: usize,
}
