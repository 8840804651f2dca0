use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fluid::KernelFailurePolicy;

#[derive(Parser, Debug)]
#[command(
    name = "dyeflow",
    author,
    version,
    about = "Interactive GPU fluid simulation",
    arg_required_else_help = false
)]
pub struct Cli {
    #[command(flatten)]
    pub run: RunArgs,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Config file to merge over the defaults (defaults to `dyeflow.toml` in the config dir).
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Override a single config key, e.g. `--set CURL=20`. Repeatable.
    #[arg(long = "set", value_name = "KEY=VALUE", global = true)]
    pub overrides: Vec<String>,

    /// Window size (e.g. `1280x720`).
    #[arg(long, value_name = "WIDTHxHEIGHT")]
    pub size: Option<String>,

    /// Relay server to receive pointer, command and beat messages from.
    #[arg(long, value_name = "HOST:PORT", env = "DYEFLOW_RELAY")]
    pub relay: Option<String>,

    /// Image used as bloom dithering noise.
    #[arg(long, value_name = "PATH")]
    pub dithering: Option<PathBuf>,

    /// Seed for splat positions and colors.
    #[arg(long, value_name = "N")]
    pub seed: Option<u64>,

    /// Kernel compile/link failure handling: `fail-fast` or `continue`.
    #[arg(
        long,
        value_name = "POLICY",
        value_parser = parse_kernel_failures,
        default_value = "fail-fast"
    )]
    pub kernel_failures: KernelFailurePolicy,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Inspect the effective configuration.
    Config(ConfigCommand),
}

#[derive(Parser, Debug)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the merged configuration as TOML.
    Print,
    /// Print the built-in defaults as TOML.
    Defaults,
    /// Print the config file path that would be loaded.
    Where,
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_kernel_failures(value: &str) -> Result<KernelFailurePolicy, String> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "fail-fast" | "failfast" | "strict" => Ok(KernelFailurePolicy::FailFast),
        "continue" | "lenient" => Ok(KernelFailurePolicy::Continue),
        "" => Err("kernel failure policy must not be empty".to_string()),
        other => Err(format!(
            "unknown kernel failure policy '{other}'; expected fail-fast or continue"
        )),
    }
}
