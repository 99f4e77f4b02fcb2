//! accelpipe -- overlapped offload of vector tasks to CPU, GPU and FPGA backends.
//!
//! This crate provides the accelerator pipeline runtime: the backend
//! capability contract, the device buffer pool, the three-stage
//! upload/launch/download node, and an emulated device runtime the GPU and
//! FPGA backends run on.

pub mod accel;
pub mod config;
pub mod device;
pub mod pipeline;
pub mod runner;

pub use accel::{AccelError, Accelerator, Backend};
pub use config::AppConfig;
pub use pipeline::{PipelineError, PipelineNode, Task};
pub use runner::{run, RunReport};
