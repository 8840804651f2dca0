use std::io::{self, Write};

use anyhow::{Context, Result};
use fluid::{remote_channel, PreviewOptions, SimulationOptions};
use fluidconfig::Config;
use tracing_subscriber::EnvFilter;

use crate::bootstrap::{effective_config, load_patch, parse_surface_size, resolve_config_path};
use crate::cli::{Cli, Command, ConfigAction, RunArgs};
use crate::paths::AppPaths;
use crate::relay;

const DEFAULT_SIZE: (u32, u32) = (1280, 720);

pub fn run(cli: Cli) -> Result<()> {
    initialise_tracing();

    let paths = AppPaths::discover()?;
    tracing::debug!(
        config = %paths.config_dir().display(),
        data = %paths.data_dir().display(),
        "resolved dyeflow paths"
    );

    match cli.command {
        Some(Command::Config(command)) => run_config(command.action, &cli.run, &paths),
        None => run_preview(&cli.run, &paths),
    }
}

fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run_config(action: ConfigAction, args: &RunArgs, paths: &AppPaths) -> Result<()> {
    let mut stdout = io::stdout().lock();
    match action {
        ConfigAction::Print => {
            let config = effective_config(&load_patch(args, paths)?)?;
            write!(stdout, "{}", config.to_toml_string()?)?;
        }
        ConfigAction::Defaults => {
            write!(stdout, "{}", Config::default().to_toml_string()?)?;
        }
        ConfigAction::Where => {
            let path = resolve_config_path(args, paths).unwrap_or_else(|| paths.config_file());
            writeln!(stdout, "{}", path.display())?;
        }
    }
    Ok(())
}

fn run_preview(args: &RunArgs, paths: &AppPaths) -> Result<()> {
    let patch = load_patch(args, paths)?;
    // Reject bad settings before a window is opened.
    effective_config(&patch)?;

    let size = match args.size.as_deref() {
        Some(value) => parse_surface_size(value).context("invalid --size")?,
        None => DEFAULT_SIZE,
    };

    let (remote, _relay) = match &args.relay {
        Some(address) => {
            let (sender, receiver) = remote_channel();
            let handle = relay::spawn(address.clone(), sender)?;
            tracing::info!(%address, "relay client started");
            (Some(receiver), Some(handle))
        }
        None => (None, None),
    };

    tracing::info!(
        width = size.0,
        height = size.1,
        policy = ?args.kernel_failures,
        "starting dyeflow preview"
    );
    fluid::run_preview(PreviewOptions {
        title: "dyeflow".to_string(),
        size,
        patch,
        simulation: SimulationOptions {
            seed: args.seed,
            kernel_failures: args.kernel_failures,
            dithering: args.dithering.clone(),
        },
        remote,
        capture_dir: paths.captures_dir(),
    })
}
