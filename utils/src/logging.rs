//! Log initialisation shared by the binaries in this workspace.
//!
//! The subscriber writes to stdout without colors, so output works the same
//! under an init system, in a container, or piped to a file. `RUST_LOG`
//! overrides the caller's default filter when set.

use std::str::FromStr;

use anyhow::Context;
use strum_macros::{EnumString, EnumVariantNames};

#[derive(EnumString, EnumVariantNames, Eq, PartialEq, Debug, Clone, Copy)]
#[strum(serialize_all = "snake_case")]
pub enum LogFormat {
    Plain,
    Json,
}

impl LogFormat {
    pub fn from_config(s: &str) -> anyhow::Result<LogFormat> {
        use strum::VariantNames;
        LogFormat::from_str(s).with_context(|| {
            format!(
                "Unrecognized log format. Please specify one of: {:?}",
                LogFormat::VARIANTS
            )
        })
    }
}

/// Install the process-wide subscriber. `default_filter` applies when the
/// `RUST_LOG` environment variable is not set; a serving process wants at
/// least `info` so connection lifecycles show up in the log.
pub fn init(log_format: LogFormat, default_filter: &str) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stdout);

    match log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Plain => subscriber.init(),
    }

    Ok(())
}
