//! GPU specifics: programs are text sources built at initialization, and
//! kernels launch as an NDRange with one work item per element.

use std::path::Path;

use tracing::debug;

use crate::device::{CommandQueue, Context, DeviceError, Event, Kernel, KernelArgs, Program, Token};

pub(crate) fn load_program(context: &Context, path: &Path) -> Result<Program, DeviceError> {
    let mut program = Program::from_source(context, path)?;
    program.build()?;
    Ok(program)
}

pub(crate) fn launch(
    queue: &CommandQueue,
    kernel: &Kernel,
    args: KernelArgs,
    wait_list: Vec<Token>,
) -> Result<Event, DeviceError> {
    let global_size = args.n;
    debug!(kernel = kernel.name(), global_size, "enqueue nd-range");
    queue.enqueue_nd_range(kernel, args, global_size, wait_list)
}
