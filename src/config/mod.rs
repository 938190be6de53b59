use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

const DEFAULTS: &str = include_str!("defaults.toml");

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	pub worklist: WorklistConfig,
}

impl AppConfig {
	/// Loads the configuration from the built-in defaults, an optional `config.toml`
	/// and `DICOM_MWL_` environment variables, in increasing precedence.
	///
	/// Nested keys are separated by `__` in variable names, e.g.
	/// `DICOM_MWL_WORKLIST__ENTRIES_DIR`.
	pub fn new() -> Result<Self, ConfigError> {
		Config::builder()
			.add_source(File::from_str(DEFAULTS, FileFormat::Toml))
			.add_source(File::with_name("config.toml").required(false))
			.add_source(
				Environment::with_prefix("DICOM_MWL")
					.prefix_separator("_")
					.separator("__"),
			)
			.build()?
			.try_deserialize()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	/// Default log level. `RUST_LOG` takes precedence.
	#[serde(deserialize_with = "deserialize_level")]
	pub level: Level,
	/// Sentry DSN. Sentry stays disabled without one.
	#[serde(default)]
	pub sentry: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorklistConfig {
	/// Directory that holds the worklist files polled by the modalities
	pub entries_dir: PathBuf,
	/// Directory that holds the rule scripts
	pub rules_dir: PathBuf,
	/// File extension of worklist files
	pub extension: String,
	/// Time limit of a single rule invocation in milliseconds. 0 disables the limit.
	pub rule_timeout: u64,
	/// Keyword file that extends the built-in tag dictionary
	#[serde(default)]
	pub dictionary: Option<PathBuf>,
}

impl WorklistConfig {
	pub const fn rule_timeout(&self) -> Option<Duration> {
		match self.rule_timeout {
			0 => None,
			millis => Some(Duration::from_millis(millis)),
		}
	}
}

fn deserialize_level<'de, D>(deserializer: D) -> Result<Level, D::Error>
where
	D: Deserializer<'de>,
{
	let level = String::deserialize(deserializer)?;
	level.parse().map_err(serde::de::Error::custom)
}
