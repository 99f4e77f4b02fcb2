use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use accelpipe::accel::ops::ComputeOp;
use accelpipe::device::Platform;
use accelpipe::{AppConfig, Backend};

#[derive(Parser)]
#[command(
    name = "accelpipe",
    about = "Overlapped offload of vector tasks to CPU, GPU and FPGA backends",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (default: $ACCELPIPE_CONFIG, then ./accelpipe.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push a stream of tasks through the pipeline and report metrics
    Run {
        /// Elements per vector
        n: Option<usize>,

        /// Number of tasks
        tasks: Option<usize>,

        /// Backend: cpu, gpu or fpga
        device: Option<Backend>,

        /// Device program (.cl source for gpu, .xclbin for fpga)
        kernel_path: Option<PathBuf>,

        /// CPU worker threads (0 = one per core)
        #[arg(long)]
        workers: Option<usize>,

        /// Check every result against the CPU reference
        #[arg(long)]
        verify: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// List the available compute functions
    Kernels,

    /// List the devices of the emulated platform
    Devices {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Run {
            n,
            tasks,
            device,
            kernel_path,
            workers,
            verify,
            json,
        } => {
            if let Some(n) = n {
                config.run.vector_len = n;
            }
            if let Some(tasks) = tasks {
                config.run.tasks = tasks;
            }
            if let Some(device) = device {
                config.run.backend = device;
            }
            if kernel_path.is_some() {
                config.run.kernel_path = kernel_path;
            }
            if let Some(workers) = workers {
                config.run.workers = workers;
            }
            config.run.verify |= verify;

            tracing::info!(
                n = config.run.vector_len,
                tasks = config.run.tasks,
                backend = %config.run.backend,
                "Running pipeline"
            );
            let report = tokio::task::spawn_blocking(move || accelpipe::run(&config)).await??;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render());
            }
            if !report.success() {
                bail!(
                    "run incomplete: {} of {} tasks processed",
                    report.tasks_processed,
                    report.tasks_requested
                );
            }
        }
        Commands::Kernels => {
            println!("{:<16} | Operation", "Kernel");
            println!("{:-<16}-|-{:-<50}", "", "");
            for op in ComputeOp::ALL {
                println!("{:<16} | {}", op, op.description());
            }
        }
        Commands::Devices { json } => {
            let platform = Platform::new(&config.device);
            if json {
                println!("{}", serde_json::to_string_pretty(platform.devices())?);
            } else if platform.devices().is_empty() {
                println!("No devices enabled.");
            } else {
                println!("{:<4} | {:<6} | {:<24} | {:>4} | Memory", "ID", "Kind", "Name", "CUs");
                println!("{:-<4}-|-{:-<6}-|-{:-<24}-|-{:->4}-|-{:-<12}", "", "", "", "", "");
                for d in platform.devices() {
                    println!(
                        "{:<4} | {:<6} | {:<24} | {:>4} | {} MiB",
                        d.id,
                        d.kind,
                        d.name,
                        d.compute_units,
                        d.global_mem_bytes >> 20
                    );
                }
            }
        }
    }

    Ok(())
}
