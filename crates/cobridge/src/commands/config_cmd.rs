//! Config subcommand handlers.

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::error::CliError;

pub fn handle(args: &ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            println!("{}", super::config_file(global).display());
            Ok(())
        }
        ConfigCommand::Show => {
            let (path, cfg) = super::load(global)?;
            let rendered =
                cobridge_config::to_toml(&cfg).map_err(|e| CliError::from_config(&path, e))?;
            print!("{rendered}");
            Ok(())
        }
    }
}
