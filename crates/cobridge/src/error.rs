//! CLI error types with miette diagnostics.
//!
//! Maps config, transport, and device errors into user-facing errors with
//! actionable help text and a process exit code.

use miette::Diagnostic;
use thiserror::Error;

use cobridge_config::ConfigError;
use cobridge_core::CoreError;

pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const CONFIG: i32 = 3;
    pub const CONNECTION: i32 = 7;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(cobridge::validation))]
    Validation { field: String, reason: String },

    #[error("Could not load configuration from {path}")]
    #[diagnostic(
        code(cobridge::config),
        help(
            "Check the file syntax, or print the file in use with: cobridge config path\n\
             Environment overrides use COBRIDGE_<SECTION>__<KEY>."
        )
    )]
    Config {
        path: String,
        #[source]
        source: ConfigError,
    },

    #[error("Could not read persisted state for device '{device}'")]
    #[diagnostic(
        code(cobridge::state),
        help("Delete the state file to start the device unregistered.")
    )]
    State {
        device: String,
        #[source]
        source: ConfigError,
    },

    // ── Runtime ──────────────────────────────────────────────────────
    #[error("Could not bind CoAP endpoint on {addr}")]
    #[diagnostic(
        code(cobridge::bind),
        help("Check that no other process is using the port, or pass --listen.")
    )]
    Bind {
        addr: String,
        #[source]
        source: cobridge_api::Error,
    },

    #[error("Device '{device}' could not be started")]
    #[diagnostic(code(cobridge::device))]
    Device {
        device: String,
        #[source]
        source: CoreError,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation { .. } => exit_code::USAGE,
            Self::Config { .. } | Self::State { .. } => exit_code::CONFIG,
            Self::Bind { .. } => exit_code::CONNECTION,
            Self::Device { .. } | Self::Io(_) => exit_code::GENERAL,
        }
    }

    /// Wrap a config loading failure, lifting validation errors so they
    /// exit with the usage code.
    pub fn from_config(path: &std::path::Path, err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            source => Self::Config {
                path: path.display().to_string(),
                source,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_exits_with_usage() {
        let err = CliError::from_config(
            std::path::Path::new("/tmp/c.toml"),
            ConfigError::Validation {
                field: "runtime.listen".into(),
                reason: "bad".into(),
            },
        );
        assert_eq!(err.exit_code(), exit_code::USAGE);
        assert!(err.to_string().contains("runtime.listen"));
    }

    #[test]
    fn io_failures_are_config_errors() {
        let err = CliError::from_config(
            std::path::Path::new("/tmp/c.toml"),
            ConfigError::Io(std::io::Error::other("denied")),
        );
        assert_eq!(err.exit_code(), exit_code::CONFIG);
        assert_eq!(exit_code::SUCCESS, 0);
    }
}
