//! Subscriber setup for the command line tools: human readable (or JSON)
//! events on stderr and, when a directory is given, rolling JSON log files.
//!
//! To get started, see [`Tracing`].

use std::path::PathBuf;

use snafu::{ResultExt as _, Snafu};
use tracing::{level_filters::LevelFilter, subscriber::SetGlobalDefaultError};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{InitError, RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to initialize rolling file appender"))]
    InitRollingFileAppender { source: InitError },

    #[snafu(display("unable to set the global default subscriber"))]
    SetGlobalDefaultSubscriber { source: SetGlobalDefaultError },
}

/// Console and file subscribers configured from [`TelemetryOptions`].
///
/// The subscribers stay installed for the lifetime of the process. The value
/// returned by [`Tracing::init`] owns the background writer of the file logs,
/// keep it bound to a named variable until `main` returns.
///
/// ```no_run
/// use moodle_solr_telemetry::tracing::{Error, TelemetryOptions, Tracing};
///
/// fn main() -> Result<(), Error> {
///     let _tracing_guard =
///         Tracing::pre_configured("moodle-solr-tenant", TelemetryOptions::default()).init()?;
///
///     tracing::info!("log a message");
///     Ok(())
/// }
/// ```
///
/// Levels are read from `CONSOLE_LOG_LEVEL` and `FILE_LOG_LEVEL` using the
/// `EnvFilter` directive syntax and default to `info`.
pub struct Tracing {
    service_name: &'static str,
    console_log: Option<ConsoleLog>,
    file_log: Option<FileLog>,

    file_log_guard: Option<WorkerGuard>,
}

#[derive(Debug, PartialEq, Eq)]
struct ConsoleLog {
    format: ConsoleLogFormat,
}

#[derive(Debug, PartialEq)]
struct FileLog {
    directory: PathBuf,
    rotation: Rotation,
}

impl Tracing {
    pub const CONSOLE_LOG_LEVEL: &str = "CONSOLE_LOG_LEVEL";
    pub const FILE_LOG_LEVEL: &str = "FILE_LOG_LEVEL";

    /// Log files are named `<service>.<date>.<suffix>`.
    pub const FILE_LOG_SUFFIX: &str = "tracing-rs.json";

    pub fn pre_configured(service_name: &'static str, options: TelemetryOptions) -> Self {
        let TelemetryOptions {
            console_log_disabled,
            console_log_format,
            file_log_directory,
            file_log_rotation_period,
        } = options;

        Self {
            service_name,
            console_log: (!console_log_disabled).then_some(ConsoleLog {
                format: console_log_format,
            }),
            file_log: file_log_directory.map(|directory| FileLog {
                directory,
                rotation: file_log_rotation_period.unwrap_or_default().into(),
            }),
            file_log_guard: None,
        }
    }

    /// Installs the configured subscribers as the global default.
    pub fn init(mut self) -> Result<Self> {
        let mut layers: Vec<Box<dyn Layer<Registry> + Sync + Send>> = Vec::new();

        if let Some(console_log) = &self.console_log {
            let filter = level_filter(Self::CONSOLE_LOG_LEVEL);
            let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            layers.push(match console_log.format {
                ConsoleLogFormat::Plain => layer.with_filter(filter).boxed(),
                ConsoleLogFormat::Json => layer.json().with_filter(filter).boxed(),
            });
        }

        if let Some(file_log) = &self.file_log {
            let appender = RollingFileAppender::builder()
                .rotation(file_log.rotation.clone())
                .filename_prefix(self.service_name)
                .filename_suffix(Self::FILE_LOG_SUFFIX)
                .build(&file_log.directory)
                .context(InitRollingFileAppenderSnafu)?;

            let (writer, guard) = tracing_appender::non_blocking(appender);
            self.file_log_guard = Some(guard);

            layers.push(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_filter(level_filter(Self::FILE_LOG_LEVEL))
                    .boxed(),
            );
        }

        if !layers.is_empty() {
            tracing::subscriber::set_global_default(tracing_subscriber::registry().with(layers))
                .context(SetGlobalDefaultSubscriberSnafu)?;
        }

        // Returning self keeps the file writer alive.
        Ok(self)
    }
}

impl Drop for Tracing {
    fn drop(&mut self) {
        tracing::debug!(
            service = self.service_name,
            file_log.enabled = self.file_log.is_some(),
            "shutting down tracing subscribers"
        );
    }
}

fn level_filter(env_var: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_env_var(env_var)
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
}

/// Logging options shared by every binary of the toolkit.
///
/// With the `clap` feature enabled this can be flattened into a CLI.
#[cfg_attr(
    feature = "clap",
    derive(clap::Args, PartialEq, Eq),
    command(next_help_heading = "Telemetry Options")
)]
#[derive(Debug, Default)]
pub struct TelemetryOptions {
    /// Disable console logs.
    #[cfg_attr(feature = "clap", arg(long, env))]
    pub console_log_disabled: bool,

    /// Output FORMAT of console logs.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_name = "FORMAT", default_value_t, value_enum)
    )]
    pub console_log_format: ConsoleLogFormat,

    /// Enable logging to files located in the specified DIRECTORY.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_name = "DIRECTORY", group = "file_log")
    )]
    pub file_log_directory: Option<PathBuf>,

    /// Time PERIOD after which log files are rolled over.
    #[cfg_attr(
        feature = "clap",
        arg(long, env, value_name = "PERIOD", requires = "file_log", value_enum)
    )]
    pub file_log_rotation_period: Option<RotationPeriod>,
}

#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ConsoleLogFormat {
    #[default]
    Plain,

    /// One JSON object per event, for runs from cron or CI.
    Json,
}

#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum RotationPeriod {
    Minutely,
    Hourly,
    Daily,

    #[default]
    Never,
}

impl From<RotationPeriod> for Rotation {
    fn from(value: RotationPeriod) -> Self {
        match value {
            RotationPeriod::Minutely => Self::MINUTELY,
            RotationPeriod::Hourly => Self::HOURLY,
            RotationPeriod::Daily => Self::DAILY,
            RotationPeriod::Never => Self::NEVER,
        }
    }
}
