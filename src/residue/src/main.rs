//! `residue` command-line front end.
//!
//! Geometry and adapter flags fall back to the `RESIDUE_*` environment
//! variables read by `ChannelOptions::from_env`.

use std::io::BufRead;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};

use residue_channel::{
    ChannelDriver, ChannelOptions, DEFAULT_CANARY_VALUE, KernelRole, ListenerOptions,
    ListenerReport, SearchMode, WgpuBackend, WriterOptions, list_adapters,
};

#[derive(Parser)]
#[command(name = "residue")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Send and observe data through uncleared GPU workgroup memory")]
struct Cli {
    /// Workgroups per dispatch
    #[arg(long, global = true)]
    workgroups: Option<u32>,

    /// Threads per workgroup
    #[arg(long, global = true)]
    threads: Option<u32>,

    /// 32-bit words of workgroup memory per workgroup
    #[arg(long, global = true)]
    local_words: Option<u32>,

    /// Adapter index as printed by `residue devices`
    #[arg(long, global = true)]
    device: Option<usize>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, global = true, value_enum, default_value = "info")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List GPU adapters
    Devices,

    /// Keep priming workgroup memory until stdin sees a newline or EOF
    Write {
        #[arg(long, required_unless_present = "canary")]
        secret: Option<String>,

        /// Payload framed between two copies of the secret
        #[arg(long, conflicts_with = "canary", requires = "secret")]
        message: Option<String>,

        /// Fill workgroup memory with a single repeated word instead
        #[arg(long)]
        canary: Option<u32>,

        /// Stop after this many dispatches
        #[arg(long)]
        iterations: Option<u64>,
    },

    /// Dump workgroup memory and decode or histogram it
    Listen {
        #[arg(long, default_value = "")]
        secret: String,

        #[arg(long, value_enum, default_value = "delimiter")]
        mode: Mode,

        #[arg(long, default_value_t = 1)]
        iterations: u32,

        #[arg(long, default_value_t = DEFAULT_CANARY_VALUE)]
        canary: u32,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Delimiter,
    Histogram,
}

impl From<Mode> for SearchMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Delimiter => SearchMode::DelimiterScan,
            Mode::Histogram => SearchMode::Histogram,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(cli.log_level.as_filter()),
    )
    .init();

    match cli.command {
        Commands::Devices => list_devices(),
        Commands::Write {
            ref secret,
            ref message,
            canary,
            iterations,
        } => {
            let options = channel_options(&cli)?;
            let writer = match (canary, message) {
                (Some(value), _) => WriterOptions::canary(value),
                (None, Some(message)) => {
                    WriterOptions::message(secret.clone().unwrap_or_default(), message.clone())
                }
                (None, None) => bail!("write needs --message or --canary"),
            };
            let writer = match iterations {
                Some(n) => writer.with_max_iterations(n),
                None => writer,
            };
            run_write(&options, writer)
        }
        Commands::Listen {
            ref secret,
            mode,
            iterations,
            canary,
        } => {
            let options = channel_options(&cli)?;
            let listener = ListenerOptions {
                secret_phrase: secret.clone(),
                iteration_count: iterations,
                canary_value: canary,
                search_mode: mode.into(),
            };
            run_listen(&options, listener)
        }
    }
}

fn channel_options(cli: &Cli) -> Result<ChannelOptions> {
    let mut options = ChannelOptions::from_env();
    if let Some(workgroups) = cli.workgroups {
        options.workgroup_count = workgroups;
    }
    if let Some(threads) = cli.threads {
        options.threads_per_workgroup = threads;
    }
    if let Some(words) = cli.local_words {
        options.local_memory_words = words;
    }
    if let Some(device) = cli.device {
        options.adapter_index = Some(device);
    }
    options.validate().context("invalid channel geometry")?;
    Ok(options)
}

fn list_devices() -> Result<()> {
    let adapters = list_adapters();
    if adapters.is_empty() {
        bail!("no GPU adapters found");
    }
    for adapter in adapters {
        println!(
            "[{}] {} ({}, {}) workgroup storage: {} bytes, invocations: {}",
            adapter.index,
            adapter.name,
            adapter.backend,
            adapter.device_type,
            adapter.max_workgroup_storage_bytes,
            adapter.max_invocations_per_workgroup
        );
    }
    Ok(())
}

fn run_write(options: &ChannelOptions, writer: WriterOptions) -> Result<()> {
    let backend = WgpuBackend::open(KernelRole::Writer, options)
        .context("failed to set up writer backend")?;
    let driver = ChannelDriver::new(backend);
    let handle = driver
        .start_writer(writer)
        .context("failed to start writer session")?;

    let cancel = handle.cancel_token();
    std::thread::Builder::new()
        .name("residue-stdin".to_string())
        .spawn(move || {
            let mut line = String::new();
            let _ = std::io::stdin().lock().read_line(&mut line);
            cancel.cancel();
        })
        .context("failed to spawn stdin watcher")?;
    eprintln!("writing; press enter to stop");

    let summary = handle.join().context("writer session aborted")?;
    println!(
        "writer stopped after {} dispatches{}",
        summary.iterations,
        if summary.cancelled { " (cancelled)" } else { "" }
    );
    Ok(())
}

fn run_listen(options: &ChannelOptions, listener: ListenerOptions) -> Result<()> {
    listener.validate().context("invalid listener options")?;
    let backend = WgpuBackend::open(KernelRole::Listener, options)
        .context("failed to set up listener backend")?;
    let driver = ChannelDriver::new(backend);
    let report = driver
        .start_listener(listener)
        .context("failed to start listener session")?
        .join()
        .context("listener session aborted")?;

    match &report {
        ListenerReport::Decoded(message) => println!("{message}"),
        ListenerReport::NotFound(_) => println!("{report}"),
        ListenerReport::Histogram(histogram) => {
            print!("{histogram}");
            log::info!(
                "{} of {} observed words were nonzero across {} dumps",
                histogram.residue_words,
                histogram.total_observations,
                histogram.buffers_observed
            );
        }
    }
    Ok(())
}
