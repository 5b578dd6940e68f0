use std::{fs::OpenOptions, path::PathBuf};

use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::{filter::FromEnvError, fmt, EnvFilter, Layer};

#[derive(Clone, Debug, Copy, ValueEnum, PartialEq)]
pub enum LogOutput {
    Console,
    Json,
    None,
}

pub struct LoggingBuilder {
    output: LogOutput,
    level: Level,
    write_logs_file: Option<PathBuf>,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self {
            output: LogOutput::Console,
            level: Level::INFO,
            write_logs_file: None,
        }
    }

    /// Set the log output format
    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    /// Set the log level. `RUST_LOG` still takes precedence.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Also append logs to a file, filtered by `WRITE_RUST_LOG` if set
    pub fn with_log_file(mut self, path: Option<PathBuf>) -> Self {
        self.write_logs_file = path;
        self
    }

    pub fn init(self) -> anyhow::Result<()> {
        init_logging_core(self.output, self.level, self.write_logs_file)
    }
}

pub fn logging() -> LoggingBuilder {
    LoggingBuilder::new()
}

fn init_logging_core(
    output: LogOutput,
    level: Level,
    write_logs_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;

    let output_logs_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env()?;

    let make_detailed_logs_filter = || -> Result<EnvFilter, FromEnvError> {
        match std::env::var("WRITE_RUST_LOG").is_ok() {
            true => EnvFilter::builder()
                .with_env_var("WRITE_RUST_LOG")
                .from_env(),
            false => EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env(),
        }
    };

    let mut layers: Vec<Box<dyn tracing_subscriber::Layer<_> + Send + Sync>> = Vec::new();

    match output {
        LogOutput::Console => layers.push(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(output_logs_filter)
                .boxed(),
        ),
        LogOutput::Json => layers.push(
            fmt::layer()
                .json()
                .with_writer(std::io::stdout)
                .flatten_event(true)
                .with_current_span(true)
                .with_filter(output_logs_filter)
                .boxed(),
        ),
        LogOutput::None => {}
    }

    if let Some(log_file_path) = write_logs_file {
        let log_file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(log_file_path)?;

        layers.push(
            fmt::layer()
                .with_ansi(false)
                .with_writer(log_file)
                .with_filter(make_detailed_logs_filter()?)
                .boxed(),
        );
    }

    let subscriber = tracing_subscriber::registry().with(layers);
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}
