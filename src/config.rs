//! TOML configuration for accelpipe.
//!
//! Every section and field has a default, so an empty file (or no file at all)
//! is a valid configuration. Command-line flags override whatever is loaded
//! here.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::accel::Backend;
use crate::pipeline::InputPattern;

/// Environment variable naming a configuration file.
pub const CONFIG_ENV: &str = "ACCELPIPE_CONFIG";

/// Configuration file looked up in the working directory.
pub const LOCAL_CONFIG: &str = "accelpipe.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration, in order:
    /// 1. `explicit` (a `--config` flag). Failing to load it is an error.
    /// 2. The file named by `ACCELPIPE_CONFIG`.
    /// 3. `./accelpipe.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        Ok(Self::load_or_default())
    }

    /// Steps 2-4 of [`resolve`](Self::resolve). Unreadable files are logged and
    /// skipped.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "ACCELPIPE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.run.vector_len == 0 {
            bail!("vector length must be greater than zero");
        }
        if self.run.tasks == 0 {
            bail!("task count must be greater than zero");
        }
        if self.pipeline.pool_size == 0 {
            bail!("pipeline.pool_size must be at least 1");
        }
        if self.pipeline.queue_capacity == 0 {
            bail!("pipeline.queue_capacity must be at least 1");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// What to run: problem size, task count and backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Elements per input vector.
    pub vector_len: usize,
    /// Number of tasks pushed through the pipeline.
    pub tasks: usize,
    pub backend: Backend,
    /// Device program. Defaults depend on the backend.
    pub kernel_path: Option<PathBuf>,
    /// CPU worker threads, 0 = one per core.
    pub workers: usize,
    /// Check every result against the CPU reference.
    pub verify: bool,
    /// How the input vectors are filled.
    pub input: InputPattern,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            vector_len: 1_000_000,
            tasks: 50,
            backend: Backend::Cpu,
            kernel_path: None,
            workers: 0,
            verify: false,
            input: InputPattern::Linear,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Device buffer sets shared by the stages.
    pub pool_size: usize,
    /// Capacity of each inter-stage queue.
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pool_size: crate::accel::pool::POOL_SIZE,
            queue_capacity: 16,
        }
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// Devices exposed by the emulated platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub gpu_present: bool,
    pub fpga_present: bool,
    /// Compute units of the GPU, 0 = one per host core.
    pub compute_units: usize,
    /// Global memory per device.
    pub global_mem_bytes: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            gpu_present: true,
            fpga_present: true,
            compute_units: 0,
            global_mem_bytes: 1 << 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON log lines instead of human-readable ones.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.run.vector_len, 1_000_000);
        assert_eq!(cfg.run.tasks, 50);
        assert_eq!(cfg.run.backend, Backend::Cpu);
        assert!(cfg.run.kernel_path.is_none());
        assert!(!cfg.run.verify);

        assert_eq!(cfg.pipeline.pool_size, 3);
        assert_eq!(cfg.pipeline.queue_capacity, 16);

        assert!(cfg.device.gpu_present);
        assert!(cfg.device.fpga_present);
        assert_eq!(cfg.device.global_mem_bytes, 1 << 30);

        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[run]
vector_len = 4096
tasks = 8
backend = "fpga"
kernel_path = "kernels/fpga/krnl_vadd.xclbin"
workers = 2
verify = true
input = { random = { seed = 42 } }

[pipeline]
pool_size = 4
queue_capacity = 2

[device]
gpu_present = false
compute_units = 8
global_mem_bytes = 1048576

[logging]
level = "debug"
json = true
"#;

        let cfg: AppConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.run.vector_len, 4096);
        assert_eq!(cfg.run.tasks, 8);
        assert_eq!(cfg.run.backend, Backend::Fpga);
        assert_eq!(
            cfg.run.kernel_path,
            Some(PathBuf::from("kernels/fpga/krnl_vadd.xclbin"))
        );
        assert_eq!(cfg.run.workers, 2);
        assert!(cfg.run.verify);
        assert_eq!(cfg.run.input, InputPattern::Random { seed: 42 });
        assert_eq!(cfg.pipeline.pool_size, 4);
        assert_eq!(cfg.pipeline.queue_capacity, 2);
        assert!(!cfg.device.gpu_present);
        assert!(cfg.device.fpga_present);
        assert_eq!(cfg.device.compute_units, 8);
        assert_eq!(cfg.device.global_mem_bytes, 1 << 20);
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: AppConfig = toml::from_str("[run]\ntasks = 3\n").unwrap();
        assert_eq!(cfg.run.tasks, 3);
        assert_eq!(cfg.run.vector_len, 1_000_000);
        assert_eq!(cfg.pipeline.pool_size, 3);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_empty_toml_is_default() {
        let cfg: AppConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.run.tasks, 50);
        assert!(cfg.device.gpu_present);
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let mut cfg = AppConfig::default();
        cfg.run.vector_len = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.run.tasks = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.pipeline.queue_capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_file_and_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("accelpipe.toml");
        std::fs::write(&path, "[run]\nbackend = \"gpu\"\n").unwrap();

        let cfg = AppConfig::resolve(Some(&path)).unwrap();
        assert_eq!(cfg.run.backend, Backend::Gpu);

        let missing = dir.path().join("nope.toml");
        assert!(AppConfig::resolve(Some(&missing)).is_err());
    }
}
