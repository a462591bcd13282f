use anyhow::{anyhow, Result};
use clap::{Args, ValueEnum};
use std::io;
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Plaintext,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct LoggingArgs {
    /// Log verbosity (RUST_LOG overrides when set)
    #[arg(long, value_enum, global = true, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,
    /// Log output format
    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Plaintext)]
    pub log_format: LogFormat,
}

impl LoggingArgs {
    /// Installs the global subscriber. Logs go to stderr with RFC 3339 local
    /// timestamps so stdout stays free for JSON output.
    pub fn init(&self) -> Result<()> {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::default().add_directive(LevelFilter::from(Level::from(self.log_level)).into())
        });
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .with_timer(ChronoLocal::rfc_3339())
            .with_target(false);

        match self.log_format {
            LogFormat::Plaintext => builder.try_init(),
            LogFormat::Json => builder.json().try_init(),
        }
        .map_err(|err| anyhow!("failed to initialise logging: {err}"))
    }
}
