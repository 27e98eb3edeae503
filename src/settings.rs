//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables, e.g.
//! `DFL_TRAINING__ROUNDS=20`. Examples of configuration files can be found in the `configs/`
//! directory located in the repository root.

use std::{fmt, net::SocketAddr, path::Path, path::PathBuf, time::Duration};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{
    aggregation::Algorithm,
    common::records::RecordPaths,
    compression::Compression,
    market::SynchronizationStrategy,
    model::linear::LinearTrainerSettings,
    participation::Participation,
};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
#[validate(schema(function = "validate_settings"))]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    pub actor: ActorSettings,
    pub topology: TopologySettings,
    #[validate]
    pub training: TrainingSettings,
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default)]
    pub synchronization: SynchronizationSettings,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default)]
    pub participation: Participation,
    #[validate]
    pub trainer: LinearTrainerSettings,
    #[serde(default)]
    pub rpc: RpcSettings,
    #[serde(default)]
    pub records: RecordSettings,
    #[serde(default)]
    pub log: LoggingSettings,
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
                Environment::with_prefix("dfl")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    fn validate_settings(&self) -> Result<(), ValidationError> {
        self.compression
            .check()
            .map_err(|_| ValidationError::new("invalid compression settings"))?;
        match self.synchronization.strategy {
            SynchronizationStrategy::OneFromMinPercent { percentage }
                if !(0.0..=1.0).contains(&percentage) =>
            {
                return Err(ValidationError::new("invalid synchronization percentage"));
            }
            SynchronizationStrategy::MinK { k: 0 } => {
                return Err(ValidationError::new("invalid synchronization amount"));
            }
            _ => {}
        }
        if let Algorithm::ConsensusGradient { smoothing, .. } = self.algorithm {
            if !(smoothing > 0.0 && smoothing <= 1.0) {
                return Err(ValidationError::new("invalid smoothing factor"));
            }
        }
        if let Some(mu) = self.training.proximal_mu {
            if mu < 0.0 {
                return Err(ValidationError::new("invalid proximal mu"));
            }
        }
        Ok(())
    }
}

fn validate_settings(s: &Settings) -> Result<(), ValidationError> {
    s.validate_settings()
}

#[derive(Debug, Deserialize, Clone)]
/// The identity of this actor.
pub struct ActorSettings {
    /// The address under which the neighbors reach this actor. It must be one of the
    /// `topology.addresses`, its position there is the index of the actor.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [actor]
    /// address = "127.0.0.1:50051"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// DFL_ACTOR__ADDRESS=127.0.0.1:50051
    /// ```
    pub address: String,
    /// The address the RPC server binds to.
    pub bind_address: SocketAddr,
}

#[derive(Debug, Deserialize, Clone)]
/// The network of actors.
pub struct TopologySettings {
    /// The addresses of all actors, ordered by actor index.
    pub addresses: Vec<String>,
    /// The symmetric adjacency matrix of the actors. A non-zero entry at `(i, j)` makes actor `j`
    /// a neighbor of actor `i`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [topology]
    /// adjacency = [[0, 1, 1], [1, 0, 1], [1, 1, 0]]
    /// ```
    pub adjacency: Vec<Vec<u8>>,
}

#[derive(Debug, Deserialize, Validate, Clone)]
/// The training schedule.
pub struct TrainingSettings {
    /// The number of rounds.
    #[validate(range(min = 1))]
    pub rounds: u32,
    /// The seed of all random draws of a run.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Adds the proximal term `(mu / 2) * ||w - w_round_start||^2` to the local objective.
    #[serde(default)]
    pub proximal_mu: Option<f64>,
}

fn default_seed() -> u64 {
    13
}

#[derive(Debug, Deserialize, Clone, Default)]
/// The synchronization of a round.
pub struct SynchronizationSettings {
    /// When the received updates are enough.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [synchronization.strategy]
    /// kind = "one_from_each_timeout"
    /// timeout_ms = 3000
    /// ```
    #[serde(default)]
    pub strategy: SynchronizationStrategy,
    /// Keeps updates without content as placeholders instead of dropping them.
    #[serde(default)]
    pub allow_empty: bool,
}

#[derive(Debug, Deserialize, Clone)]
/// The RPC client settings.
pub struct RpcSettings {
    /// How often a connection to a neighbor is attempted before giving up.
    pub connect_attempts: u32,
    /// The delay between two connection attempts, in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            connect_attempts: 30,
            retry_delay_ms: 1000,
        }
    }
}

impl RpcSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
/// Where the run records are written to at shutdown. Nothing is written for a missing path.
pub struct RecordSettings {
    /// A CSV file of the performance metrics.
    pub performance: Option<PathBuf>,
    /// A JSON file of the messages sent to neighbors.
    pub communication: Option<PathBuf>,
}

impl From<RecordSettings> for RecordPaths {
    fn from(settings: RecordSettings) -> Self {
        Self {
            performance: settings.performance,
            communication: settings.communication,
        }
    }
}

#[derive(Debug, Deserialize)]
/// The logging settings.
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
    /// DFL_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: EnvFilter::new("info"),
        }
    }
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives")
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
