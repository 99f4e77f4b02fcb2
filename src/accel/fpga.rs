//! FPGA specifics: programs are precompiled `.xclbin` images loaded as-is,
//! and the kernel is a single work item that loops over the data itself.

use std::path::Path;

use tracing::debug;

use crate::device::{CommandQueue, Context, DeviceError, Event, Kernel, KernelArgs, Program, Token};

pub(crate) fn load_program(context: &Context, path: &Path) -> Result<Program, DeviceError> {
    Program::from_binary(context, path)
}

pub(crate) fn launch(
    queue: &CommandQueue,
    kernel: &Kernel,
    args: KernelArgs,
    wait_list: Vec<Token>,
) -> Result<Event, DeviceError> {
    debug!(kernel = kernel.name(), n = args.n, "enqueue task");
    queue.enqueue_task(kernel, args, wait_list)
}
