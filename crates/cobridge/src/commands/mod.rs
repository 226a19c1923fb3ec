pub mod config_cmd;
pub mod run;

use std::path::PathBuf;

use cobridge_config::BridgeConfig;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// The config file in effect: `--config` or the platform default.
pub fn config_file(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(cobridge_config::config_path)
}

pub fn load(global: &GlobalOpts) -> Result<(PathBuf, BridgeConfig), CliError> {
    let path = config_file(global);
    let cfg = cobridge_config::load_config(Some(&path))
        .map_err(|e| CliError::from_config(&path, e))?;
    Ok((path, cfg))
}
