use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{
    fmt::{self, format, time},
    prelude::*,
    EnvFilter,
};

use bds_config_data::parse_config_file;

mod pipeline;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct BdsRunCliArgs {
    /// Path to the TOML configuration file
    config_file: std::path::PathBuf,

    /// Detector backend: a JSON file of precomputed detections keyed by
    /// camera and frame. Live GPU inference implements the same interface
    /// out of tree.
    #[arg(long = "model", value_name = "PATH")]
    model: Utf8PathBuf,

    /// Override the routes directory from the config file
    #[arg(long)]
    routes_dir: Option<std::path::PathBuf>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Install the tracing subscriber: compact output with uptime timestamps,
/// filter from `RUST_LOG` falling back to the CLI switch.
fn init_logging(default_directive: &str) {
    let evt_fmt = format().with_timer(time::Uptime::default()).compact();
    let fmt_layer = fmt::layer().event_format(evt_fmt);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .init();
}

fn main() -> Result<()> {
    let args = BdsRunCliArgs::parse();
    init_logging(&args.log_level);
    debug!("{args:?}");

    let mut cfg = parse_config_file(&args.config_file)?;
    if let Some(routes_dir) = args.routes_dir {
        cfg.routes_dir = routes_dir;
    }
    debug!("{cfg:?}");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(4)
        .thread_name("bds-runtime")
        .build()?;

    // This runs the whole pipeline and blocks until shutdown.
    runtime.block_on(pipeline::run(cfg, args.model))?;

    Ok(())
}
