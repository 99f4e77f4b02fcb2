//! In-order command queue backed by a dedicated device thread.
//!
//! Every `enqueue_*` call returns immediately with an [`Event`]; the device
//! thread executes commands in submission order, waiting on each command's
//! wait list first. A failed dependency fails the dependent command without
//! running it.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, trace};

use super::event::{Event, Token};
use super::program::{Kernel, KernelArgs};
use super::{Context, DeviceBuffer, DeviceError, DeviceInfo};

enum Command {
    Write {
        buffer: DeviceBuffer,
        data: Arc<[i32]>,
    },
    NdRange {
        kernel: Kernel,
        args: KernelArgs,
        global_size: usize,
    },
    SingleTask {
        kernel: Kernel,
        args: KernelArgs,
    },
    Read {
        buffer: DeviceBuffer,
        len: usize,
        reply: Sender<Result<Vec<i32>, DeviceError>>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Write { .. } => "write_buffer",
            Command::NdRange { .. } => "nd_range_kernel",
            Command::SingleTask { .. } => "task_kernel",
            Command::Read { .. } => "read_buffer",
        }
    }
}

struct Submission {
    command: Command,
    wait_list: Vec<Token>,
    event: Event,
}

pub struct CommandQueue {
    tx: Option<Sender<Submission>>,
    worker: Option<JoinHandle<()>>,
    device: DeviceInfo,
}

impl CommandQueue {
    pub fn create(context: &Context) -> Result<Self, DeviceError> {
        let device = context.device().clone();
        let (tx, rx) = crossbeam_channel::unbounded();
        let compute_units = device.compute_units.max(1);

        let worker = thread::Builder::new()
            .name(format!("{}-queue", device.kind))
            .spawn(move || device_loop(rx, compute_units))
            .map_err(|e| DeviceError::Creation {
                what: "command queue",
                reason: e.to_string(),
            })?;

        debug!(device = %device.name, "command queue created");
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            device,
        })
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    fn submit(&self, command: Command, wait_list: Vec<Token>) -> Result<Event, DeviceError> {
        let event = Event::new(command.name());
        let tx = self.tx.as_ref().ok_or(DeviceError::QueueClosed)?;
        tx.send(Submission {
            command,
            wait_list,
            event: event.clone(),
        })
        .map_err(|_| DeviceError::QueueClosed)?;
        Ok(event)
    }

    /// Non-blocking host-to-device copy of `data` into the start of `buffer`.
    pub fn enqueue_write(
        &self,
        buffer: &DeviceBuffer,
        data: Arc<[i32]>,
        wait_list: Vec<Token>,
    ) -> Result<Event, DeviceError> {
        if data.len() > buffer.len() {
            return Err(DeviceError::InvalidBuffer(format!(
                "write of {} elements exceeds buffer capacity {}",
                data.len(),
                buffer.len()
            )));
        }
        self.submit(
            Command::Write {
                buffer: buffer.clone(),
                data,
            },
            wait_list,
        )
    }

    /// Data-parallel launch over `global_size` work items.
    pub fn enqueue_nd_range(
        &self,
        kernel: &Kernel,
        args: KernelArgs,
        global_size: usize,
        wait_list: Vec<Token>,
    ) -> Result<Event, DeviceError> {
        validate_args(&args)?;
        self.submit(
            Command::NdRange {
                kernel: kernel.clone(),
                args,
                global_size,
            },
            wait_list,
        )
    }

    /// Single work-item launch; the kernel loops over all `n` elements itself.
    pub fn enqueue_task(
        &self,
        kernel: &Kernel,
        args: KernelArgs,
        wait_list: Vec<Token>,
    ) -> Result<Event, DeviceError> {
        validate_args(&args)?;
        self.submit(
            Command::SingleTask {
                kernel: kernel.clone(),
                args,
            },
            wait_list,
        )
    }

    /// Device-to-host copy of the first `dst.len()` elements of `buffer`.
    /// Blocks until the copy, and everything in `wait_list`, has finished.
    pub fn enqueue_read_blocking(
        &self,
        buffer: &DeviceBuffer,
        dst: &mut [i32],
        wait_list: Vec<Token>,
    ) -> Result<(), DeviceError> {
        let (reply, result) = crossbeam_channel::bounded(1);
        let event = self.submit(
            Command::Read {
                buffer: buffer.clone(),
                len: dst.len(),
                reply,
            },
            wait_list,
        )?;

        let data = result.recv().map_err(|_| DeviceError::QueueClosed)??;
        dst.copy_from_slice(&data);
        trace!(command = event.command(), len = dst.len(), "blocking read finished");
        Ok(())
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        // Closing the channel lets the device thread drain pending commands
        // and exit.
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(device = %self.device.name, "device thread panicked");
            }
        }
        debug!(device = %self.device.name, "command queue released");
    }
}

fn validate_args(args: &KernelArgs) -> Result<(), DeviceError> {
    let ids = [args.a.id(), args.b.id(), args.c.id()];
    if ids[0] == ids[2] || ids[1] == ids[2] || ids[0] == ids[1] {
        return Err(DeviceError::InvalidBuffer(
            "kernel arguments must be three distinct buffers".to_string(),
        ));
    }
    for buffer in [&args.a, &args.b, &args.c] {
        if args.n > buffer.len() {
            return Err(DeviceError::InvalidBuffer(format!(
                "n = {} exceeds buffer {} capacity {}",
                args.n,
                buffer.id(),
                buffer.len()
            )));
        }
    }
    Ok(())
}

fn device_loop(rx: Receiver<Submission>, compute_units: usize) {
    for Submission {
        command,
        wait_list,
        event,
    } in rx
    {
        if let Some(failed) = wait_list.iter().find_map(|t| t.wait().err()) {
            let reason = format!("dependency failed: {}", failed);
            if let Command::Read { reply, .. } = &command {
                let _ = reply.send(Err(DeviceError::CommandFailed {
                    command: "read_buffer",
                    reason: reason.clone(),
                }));
            }
            event.fail(reason);
            continue;
        }
        // Dependencies are satisfied; release them before running.
        drop(wait_list);

        event.set_running();
        match execute(command, compute_units) {
            Ok(()) => event.complete(),
            Err(e) => {
                error!(command = event.command(), error = %e, "device command failed");
                event.fail(e.to_string());
            }
        }
    }
    trace!("device thread exiting");
}

fn execute(command: Command, compute_units: usize) -> Result<(), DeviceError> {
    match command {
        Command::Write { buffer, data } => buffer.write(&data),
        Command::NdRange {
            kernel,
            args,
            global_size,
        } => run_nd_range(&kernel, &args, global_size.min(args.n), compute_units),
        Command::SingleTask { kernel, args } => run_nd_range(&kernel, &args, args.n, 1),
        Command::Read { buffer, len, reply } => {
            let result = buffer.read(len);
            let outcome = match &result {
                Ok(_) => Ok(()),
                Err(e) => Err(DeviceError::InvalidBuffer(e.to_string())),
            };
            let _ = reply.send(result);
            outcome
        }
    }
}

/// Run `kernel` over `0..n`, split into one contiguous chunk per compute unit.
fn run_nd_range(kernel: &Kernel, args: &KernelArgs, n: usize, compute_units: usize) -> Result<(), DeviceError> {
    let a = args.a.lock();
    let b = args.b.lock();
    let mut c = args.c.lock();

    let (a, b, c) = (&a[..n], &b[..n], &mut c[..n]);
    let op = kernel.op();

    if compute_units <= 1 || n < compute_units * 2 {
        op.apply(a, b, c);
        return Ok(());
    }

    let chunk = n.div_ceil(compute_units);
    thread::scope(|s| {
        for ((c, a), b) in c.chunks_mut(chunk).zip(a.chunks(chunk)).zip(b.chunks(chunk)) {
            s.spawn(move || op.apply(a, b, c));
        }
    });
    Ok(())
}
