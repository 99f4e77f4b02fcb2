//! CPU and device backends must produce bit-identical output for the same
//! inputs and compute function.

use std::path::Path;

use accelpipe::accel::cpu::CpuAccelerator;
use accelpipe::accel::device::DeviceBackend;
use accelpipe::accel::ops::ComputeOp;
use accelpipe::accel::Accelerator;
use accelpipe::config::{DeviceConfig, PipelineConfig};
use accelpipe::pipeline::{InputPattern, PipelineNode, VectorSource};

const N: usize = 3000;
const TASKS: usize = 4;

fn outputs(backend: Box<dyn Accelerator>, pattern: InputPattern) -> Vec<Vec<i32>> {
    let mut node = PipelineNode::start(backend, &PipelineConfig::default()).unwrap();
    let results = node.take_results().unwrap();
    node.feed(&mut VectorSource::new(N, TASKS, pattern)).unwrap();
    let stats = node.shutdown().unwrap();
    assert_eq!(stats.tasks_processed, TASKS as u64);
    results.iter().map(|t| t.c).collect()
}

fn write_programs(dir: &Path, op: ComputeOp) -> (std::path::PathBuf, std::path::PathBuf) {
    let source = dir.join(format!("{}.cl", op.name()));
    std::fs::write(
        &source,
        format!("__kernel void {}(__global const int* a) {{}}", op.name()),
    )
    .unwrap();

    let binary = dir.join(format!("krnl_{}.xclbin", op.name()));
    let mut image = b"xclbin2\0".to_vec();
    image.extend_from_slice(format!("krnl_{}\0", op.name()).as_bytes());
    std::fs::write(&binary, image).unwrap();

    (source, binary)
}

#[test]
fn test_all_backends_agree_for_every_op() {
    let dir = tempfile::TempDir::new().unwrap();
    let device = DeviceConfig {
        compute_units: 4,
        ..DeviceConfig::default()
    };

    for op in ComputeOp::ALL {
        let (source, binary) = write_programs(dir.path(), op);
        let pattern = InputPattern::Random { seed: 17 };

        let cpu = outputs(Box::new(CpuAccelerator::new(op, 3)), pattern);
        let gpu = outputs(Box::new(DeviceBackend::gpu(&source, op.name(), &device)), pattern);
        let fpga_entry = format!("krnl_{}", op.name());
        let fpga = outputs(Box::new(DeviceBackend::fpga(&binary, &fpga_entry, &device)), pattern);

        assert_eq!(cpu.len(), TASKS);
        assert_eq!(cpu, gpu, "gpu differs from cpu for {}", op);
        assert_eq!(cpu, fpga, "fpga differs from cpu for {}", op);
    }
}

#[test]
fn test_shipped_programs_load() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("kernels");
    let device = DeviceConfig::default();

    for op in ComputeOp::ALL {
        let mut gpu = DeviceBackend::gpu(&root.join(format!("gpu/{}.cl", op.name())), op.name(), &device);
        gpu.initialize().unwrap();
    }

    for name in ["krnl_vadd", "krnl_polynomial_op", "krnl_heavy_compute"] {
        let path = root.join(format!("fpga/{}.xclbin", name));
        let mut fpga = DeviceBackend::fpga(&path, name, &device);
        fpga.initialize().unwrap();
    }
}
