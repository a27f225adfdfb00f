//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. An example
//! configuration file can be found in the `configs/` directory located in the repository root.

use std::{collections::HashMap, fmt, net::SocketAddr, path::Path, path::PathBuf, time::Duration};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationErrors};

#[cfg(test)]
mod tests;

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    pub api: ApiSettings,
    pub log: LoggingSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[validate]
    pub task: TaskSettings,
    #[serde(default)]
    #[validate]
    pub report: ReportSettings,
    #[serde(default)]
    pub hwe: HweSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("hydra")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Deserialize, Clone)]
/// REST API settings.
pub struct ApiSettings {
    /// The address to which the REST API should be bound.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// bind_address = "0.0.0.0:8081"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// HYDRA_API__BIND_ADDRESS=127.0.0.1:8081
    /// ```
    pub bind_address: SocketAddr,
}

#[derive(Debug, Default, Deserialize, Clone)]
/// Settings of the array store holding the counts and the statistics.
pub struct StoreSettings {
    /// The directory of the store. The store is kept in memory if no directory is given.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [store]
    /// path = "/var/lib/hydra/central"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// HYDRA_STORE__PATH=/var/lib/hydra/central
    /// ```
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Validate, Clone)]
/// Settings of the task supervision.
pub struct TaskSettings {
    /// The interval in seconds of the warnings logged while a task waits for its clients.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [task]
    /// stall_warning = 60
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// HYDRA_TASK__STALL_WARNING=60
    /// ```
    #[validate(range(min = 0.001))]
    pub stall_warning: f64,

    /// The time in seconds the clients have to finish a task. The clients which did not finish
    /// in time are marked as failed. Without a deadline, a task waits forever.
    ///
    /// **TOML**
    /// ```text
    /// [task]
    /// deadline = 3600
    /// ```
    #[validate(range(min = 0.001))]
    #[serde(default)]
    pub deadline: Option<f64>,

    /// Whether a task whose deadline elapsed completes with the counts of the clients which
    /// finished in time. Otherwise the task fails.
    #[serde(default)]
    pub partial_completion: bool,

    /// Context forwarded to the clients with every broadcast.
    ///
    /// **TOML**
    /// ```text
    /// [task.env]
    /// study = "cohort-a"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// HYDRA_TASK__ENV__STUDY=cohort-a
    /// ```
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl TaskSettings {
    pub fn stall_warning(&self) -> Duration {
        Duration::from_secs_f64(self.stall_warning)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline.map(Duration::from_secs_f64)
    }
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            stall_warning: 60.0,
            deadline: None,
            partial_completion: false,
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize, Validate, Clone)]
/// Settings of the QC reports.
pub struct ReportSettings {
    /// An external command rendering the QC plots. It is invoked with the path of the store and
    /// the name of the output file appended to its arguments. Reports are only logged if no
    /// command is given.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [report]
    /// command = ["python3", "-m", "hydra.plots"]
    /// ```
    #[validate(length(min = 1))]
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize, Clone, Copy)]
/// Settings of the Hardy-Weinberg equilibrium test.
pub struct HweSettings {
    /// Whether the mid-p correction is applied.
    #[serde(default)]
    pub midp: bool,
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// HYDRA_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3.1/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3.1/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
