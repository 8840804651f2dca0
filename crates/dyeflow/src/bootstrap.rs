use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use fluidconfig::{Config, ConfigPatch};
use tracing::debug;

use crate::cli::RunArgs;
use crate::paths::AppPaths;

/// The config file to read: `--config` when given, otherwise the default
/// location if it exists.
pub fn resolve_config_path(args: &RunArgs, paths: &AppPaths) -> Option<PathBuf> {
    if let Some(path) = &args.config {
        return Some(path.clone());
    }
    let default = paths.config_file();
    default.exists().then_some(default)
}

/// File settings with every `--set` override layered on top, in order.
pub fn load_patch(args: &RunArgs, paths: &AppPaths) -> Result<ConfigPatch> {
    let mut patch = match resolve_config_path(args, paths) {
        Some(path) => {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            debug!(path = %path.display(), "loaded config file");
            ConfigPatch::from_toml_str(&text)
                .with_context(|| format!("invalid config file {}", path.display()))?
        }
        None => ConfigPatch::default(),
    };
    for raw in &args.overrides {
        let layer = ConfigPatch::from_assignment(raw)
            .with_context(|| format!("invalid override '{raw}'"))?;
        patch.merge(&layer);
    }
    Ok(patch)
}

/// The fully merged config a run would start with.
pub fn effective_config(patch: &ConfigPatch) -> Result<Config> {
    let mut config = Config::default();
    config.apply(patch).context("configuration rejected")?;
    Ok(config)
}

pub fn parse_surface_size(value: &str) -> Result<(u32, u32)> {
    let trimmed = value.trim();
    let (width, height) = trimmed
        .split_once(['x', 'X', '×'])
        .ok_or_else(|| anyhow::anyhow!("expected WxH format, e.g. 1280x720"))?;

    let width: u32 = width
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid width in size"))?;
    let height: u32 = height
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid height in size"))?;

    if width == 0 || height == 0 {
        bail!("surface dimensions must be greater than zero");
    }

    Ok((width, height))
}
