use crate::reconcile::FetchFailurePolicy;
use crate::types::{DateFilter, InvalidDateFilter};
use config::builder::{ConfigBuilder, DefaultState};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Environment variable that points to an alternative configuration file.
pub const CONFIG_FILE_ENV: &str = "PACS_RECONCILE_CONFIG";
/// Prefix for configuration overrides through environment variables,
/// e.g. `PACS_RECONCILE_REMOTE__URL=http://pacs:8042`.
pub const ENV_PREFIX: &str = "PACS_RECONCILE";

const DEFAULTS: &str = include_str!("defaults.toml");

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	/// The local server that is searched for studies and owns the event queue.
	#[serde(rename = "self")]
	pub local: ServerConfig,
	/// The peer server that should contain every local series.
	pub remote: ServerConfig,
	pub reconcile: ReconcileConfig,
	pub dispatch: DispatchConfig,
}

impl AppConfig {
	/// Loads the configuration from the built-in defaults, an optional `config.toml`
	/// (or the file named by [`CONFIG_FILE_ENV`]) and `PACS_RECONCILE_*` environment variables.
	pub fn new() -> Result<Self, ConfigError> {
		let file = config_file(std::env::var(CONFIG_FILE_ENV).ok());
		Self::load(layered(&file, environment()))
	}

	fn load(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
		let config: Self = builder.build()?.try_deserialize()?;
		config.local.credentials()?;
		config.remote.credentials()?;
		config.reconcile.date_filter()?;
		Ok(config)
	}
}

fn defaults() -> ConfigBuilder<DefaultState> {
	Config::builder().add_source(File::from_str(DEFAULTS, FileFormat::Toml))
}

/// The built-in defaults, overridden by the (optional) configuration file and then by
/// the environment.
fn layered(file: &str, env: Environment) -> ConfigBuilder<DefaultState> {
	defaults()
		.add_source(File::with_name(file).required(false))
		.add_source(env)
}

fn config_file(name: Option<String>) -> String {
	name.filter(|name| !name.trim().is_empty())
		.unwrap_or_else(|| String::from("config.toml"))
}

/// Section separator is `__` because option names contain `_`.
fn environment() -> Environment {
	Environment::with_prefix(ENV_PREFIX)
		.prefix_separator("_")
		.separator("__")
		.try_parsing(true)
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	/// Also configurable via the `RUST_LOG` environment variable.
	#[serde(deserialize_with = "deserialize_level")]
	pub level: tracing::Level,
	/// Sentry DSN. Sentry stays disabled if unset.
	pub sentry: Option<String>,
}

fn deserialize_level<'de, D>(deserializer: D) -> Result<tracing::Level, D::Error>
where
	D: Deserializer<'de>,
{
	let level = String::deserialize(deserializer)?;
	level.parse().map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
	/// Base URL of the Orthanc REST API. A path prefix (reverse proxy) is preserved.
	pub url: Url,
	pub username: Option<String>,
	pub password: Option<String>,
	/// A raw `Authorization` header value. Mutually exclusive with username and password.
	pub authorization: Option<String>,
	/// Request timeout in milliseconds.
	pub timeout: u64,
	#[serde(default)]
	pub retry: RetryConfig,
}

impl ServerConfig {
	pub const fn timeout(&self) -> Duration {
		Duration::from_millis(self.timeout)
	}

	/// Empty values count as unset, so a layer can clear credentials set by an earlier one.
	pub fn credentials(&self) -> Result<Option<Credentials>, ConfigError> {
		let set = |value: &Option<String>| value.clone().filter(|v| !v.is_empty());
		match (set(&self.username), set(&self.password), set(&self.authorization)) {
			(None, None, None) => Ok(None),
			(Some(username), Some(password), None) => {
				Ok(Some(Credentials::Basic { username, password }))
			}
			(None, None, Some(header)) => Ok(Some(Credentials::Header(header))),
			(Some(_) | None, Some(_) | None, None) => {
				Err(ConfigError::IncompleteCredentials(self.url.to_string()))
			}
			(_, _, Some(_)) => Err(ConfigError::ConflictingCredentials(self.url.to_string())),
		}
	}
}

/// Static credentials for a server.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
	Basic { username: String, password: String },
	Header(String),
}

impl std::fmt::Debug for Credentials {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Basic { username, .. } => write!(f, "Basic({username}:***)"),
			Self::Header(_) => write!(f, "Header(***)"),
		}
	}
}

/// Retry policy for transient failures (connection errors, timeouts, 429 and 502-504).
/// Event queue requests are only retried on connection errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
	/// Number of additional attempts after the first one.
	pub attempts: u32,
	/// Initial backoff in milliseconds. Doubles after every attempt.
	pub backoff: u64,
	/// Upper bound for the backoff in milliseconds.
	pub max_backoff: u64,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			attempts: 2,
			backoff: 500,
			max_backoff: 5000,
		}
	}
}

impl RetryConfig {
	/// The delay before the retry following the given (zero-based) attempt.
	pub fn delay(&self, attempt: u32) -> Duration {
		let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
		Duration::from_millis(self.backoff.saturating_mul(factor).min(self.max_backoff))
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
	/// StudyDate filter (`YYYYMMDD` or a DICOM date range). Defaults to today.
	pub date: Option<String>,
	#[serde(default)]
	pub on_fetch_failure: FetchFailurePolicy,
	#[serde(default)]
	pub deduplicate: bool,
}

impl ReconcileConfig {
	/// The configured date filter, or [`DateFilter::today`] if none is configured.
	pub fn date_filter(&self) -> Result<DateFilter, ConfigError> {
		match self.date.as_deref().map(str::trim) {
			None | Some("") => Ok(DateFilter::today()),
			Some(date) => Ok(date.parse()?),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
	/// The application tag of the transfer target, e.g. `Transfer1`.
	pub app: String,
	/// Placeholder instance UID sent with every event.
	pub iuid: String,
	/// Path of the event queue endpoint, relative to the self server's base URL.
	pub path: String,
	/// Delay in seconds before the event queue executes the event.
	pub delay: Option<u32>,
	#[serde(default)]
	pub dry_run: bool,
	#[serde(default)]
	pub continue_on_error: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error(transparent)]
	Load(#[from] config::ConfigError),
	#[error(transparent)]
	DateFilter(#[from] InvalidDateFilter),
	#[error("username and password must both be set for {0}")]
	IncompleteCredentials(String),
	#[error("authorization cannot be combined with username/password for {0}")]
	ConflictingCredentials(String),
}

#[cfg(test)]
mod tests {
	use super::*;

	fn load(overrides: &str) -> Result<AppConfig, ConfigError> {
		AppConfig::load(defaults().add_source(File::from_str(overrides, FileFormat::Toml)))
	}

	#[test]
	fn load_defaults() {
		let config = load("").unwrap();

		assert_eq!(config.telemetry.level, tracing::Level::INFO);
		assert_eq!(config.local.url.as_str(), "http://127.0.0.1:8045/");
		assert_eq!(config.remote.url.as_str(), "http://127.0.0.1:8042/");
		assert_eq!(config.local.timeout(), Duration::from_secs(10));
		assert_eq!(config.remote.timeout(), Duration::from_secs(30));
		assert_eq!(config.reconcile.on_fetch_failure, FetchFailurePolicy::FullResync);
		assert!(!config.reconcile.deduplicate);
		assert_eq!(config.dispatch.app, "Transfer1");
		assert_eq!(config.dispatch.iuid, "1.2.3");
		assert_eq!(config.dispatch.path, "/itech/execute-event-queues");
		assert_eq!(config.dispatch.delay, None);
		assert_eq!(config.local.credentials().unwrap(), None);
		assert_eq!(config.remote.credentials().unwrap(), None);
	}

	#[test]
	fn load_authorization_header() {
		let config = load(
			r#"
			[self]
			authorization = "Bearer token"
			"#,
		)
		.unwrap();

		assert_eq!(
			config.local.credentials().unwrap(),
			Some(Credentials::Header(String::from("Bearer token")))
		);
		assert_eq!(config.remote.credentials().unwrap(), None);
	}

	#[test]
	fn load_basic_credentials() {
		let config = load(
			r#"
			[remote]
			username = "orthanc"
			password = "orthanc"
			"#,
		)
		.unwrap();

		assert_eq!(
			config.remote.credentials().unwrap(),
			Some(Credentials::Basic {
				username: String::from("orthanc"),
				password: String::from("orthanc"),
			})
		);
	}

	#[test]
	fn empty_credentials_are_unset() {
		let file = r#"
			[self]
			username = "orthanc"
			password = "orthanc"
			"#;
		let env = environment().source(Some(vars(&[
			("PACS_RECONCILE_SELF__USERNAME", ""),
			("PACS_RECONCILE_SELF__PASSWORD", ""),
			("PACS_RECONCILE_SELF__AUTHORIZATION", "Bearer token"),
		])));
		let config = AppConfig::load(
			defaults()
				.add_source(File::from_str(file, FileFormat::Toml))
				.add_source(env),
		)
		.unwrap();

		assert_eq!(
			config.local.credentials().unwrap(),
			Some(Credentials::Header(String::from("Bearer token")))
		);
	}

	const NO_FILE: &str = "/nonexistent/pacs-reconcile.toml";

	fn vars(pairs: &[(&str, &str)]) -> config::Map<String, String> {
		pairs
			.iter()
			.map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
			.collect()
	}

	/// A configuration file in the temp directory that is removed on drop.
	struct TempConfig(std::path::PathBuf);

	impl TempConfig {
		fn new(name: &str, content: &str) -> Self {
			let path = std::env::temp_dir()
				.join(format!("pacs-reconcile-{}-{name}.toml", std::process::id()));
			std::fs::write(&path, content).unwrap();
			Self(path)
		}

		fn name(&self) -> String {
			self.0.to_string_lossy().into_owned()
		}
	}

	impl Drop for TempConfig {
		fn drop(&mut self) {
			let _ = std::fs::remove_file(&self.0);
		}
	}

	#[test]
	fn environment_overrides_nested_keys() {
		let env = environment().source(Some(vars(&[
			("PACS_RECONCILE_REMOTE__URL", "http://pacs:8042"),
			("PACS_RECONCILE_REMOTE__RETRY__ATTEMPTS", "5"),
			("PACS_RECONCILE_SELF__USERNAME", "admin"),
			("PACS_RECONCILE_SELF__PASSWORD", "1234"),
			("PACS_RECONCILE_DISPATCH__DRY_RUN", "true"),
			("PACS_RECONCILE_DISPATCH__DELAY", "30"),
			("PACS_RECONCILE_RECONCILE__ON_FETCH_FAILURE", "skip"),
			("OTHER_REMOTE__URL", "http://ignored:8042"),
		])));
		let config = AppConfig::load(layered(NO_FILE, env)).unwrap();

		assert_eq!(config.remote.url.as_str(), "http://pacs:8042/");
		assert_eq!(config.remote.retry.attempts, 5);
		assert_eq!(config.remote.retry.backoff, 500);
		assert_eq!(
			config.local.credentials().unwrap(),
			Some(Credentials::Basic {
				username: String::from("admin"),
				password: String::from("1234"),
			})
		);
		assert!(config.dispatch.dry_run);
		assert_eq!(config.dispatch.delay, Some(30));
		assert_eq!(config.reconcile.on_fetch_failure, FetchFailurePolicy::Skip);
	}

	#[test]
	fn environment_authorization_with_defaults() {
		let env = environment().source(Some(vars(&[(
			"PACS_RECONCILE_SELF__AUTHORIZATION",
			"Bearer token",
		)])));
		let config = AppConfig::load(layered(NO_FILE, env)).unwrap();

		assert_eq!(
			config.local.credentials().unwrap(),
			Some(Credentials::Header(String::from("Bearer token")))
		);
	}

	#[test]
	fn config_file_from_variable() {
		assert_eq!(config_file(None), "config.toml");
		assert_eq!(config_file(Some(String::new())), "config.toml");
		assert_eq!(config_file(Some(String::from("/etc/reconcile.toml"))), "/etc/reconcile.toml");

		let file = TempConfig::new(
			"file",
			r#"
			[remote]
			url = "http://from-file:8042"
			timeout = 5000

			[dispatch]
			app = "Exporter1"
			"#,
		);
		let env = environment().source(Some(vars(&[(
			"PACS_RECONCILE_REMOTE__URL",
			"http://from-env:8042",
		)])));
		let config = AppConfig::load(layered(&config_file(Some(file.name())), env)).unwrap();

		assert_eq!(config.remote.url.as_str(), "http://from-env:8042/");
		assert_eq!(config.remote.timeout(), Duration::from_secs(5));
		assert_eq!(config.dispatch.app, "Exporter1");
	}

	#[test]
	fn missing_config_file_is_optional() {
		let config =
			AppConfig::load(layered(NO_FILE, environment().source(Some(config::Map::new()))))
				.unwrap();

		assert_eq!(config.remote.url.as_str(), "http://127.0.0.1:8042/");
	}

	#[test]
	fn load_overrides() {
		let config = load(
			r#"
			[remote]
			url = "https://pacs.example.org/orthanc/"
			timeout = 5000

			[remote.retry]
			attempts = 0

			[reconcile]
			date = "20240131"
			on_fetch_failure = "skip"
			deduplicate = true

			[dispatch]
			app = "Exporter1"
			delay = 30
			"#,
		)
		.unwrap();

		assert_eq!(config.remote.url.path(), "/orthanc/");
		assert_eq!(config.remote.timeout(), Duration::from_secs(5));
		assert_eq!(config.remote.retry.attempts, 0);
		assert_eq!(config.remote.retry.backoff, 500);
		assert_eq!(config.reconcile.on_fetch_failure, FetchFailurePolicy::Skip);
		assert!(config.reconcile.deduplicate);
		assert_eq!(
			config.reconcile.date_filter().unwrap().to_string(),
			"20240131"
		);
		assert_eq!(config.dispatch.app, "Exporter1");
		assert_eq!(config.dispatch.delay, Some(30));
	}

	#[test]
	fn reject_invalid_date() {
		let result = load(
			r#"
			[reconcile]
			date = "2024-01-31"
			"#,
		);
		assert!(matches!(result, Err(ConfigError::DateFilter(_))));
	}

	#[test]
	fn empty_date_means_today() {
		let config = load(
			r#"
			[reconcile]
			date = ""
			"#,
		)
		.unwrap();
		assert_eq!(config.reconcile.date_filter().unwrap(), DateFilter::today());
	}

	#[test]
	fn reject_invalid_level() {
		let result = load(
			r#"
			[telemetry]
			level = "chatty"
			"#,
		);
		assert!(matches!(result, Err(ConfigError::Load(_))));
	}

	fn server(username: Option<&str>, password: Option<&str>, header: Option<&str>) -> ServerConfig {
		ServerConfig {
			url: Url::parse("http://localhost:8042").unwrap(),
			username: username.map(String::from),
			password: password.map(String::from),
			authorization: header.map(String::from),
			timeout: 1000,
			retry: RetryConfig::default(),
		}
	}

	#[test]
	fn credentials() {
		assert_eq!(server(None, None, None).credentials().unwrap(), None);
		assert_eq!(
			server(None, None, Some("Bearer token")).credentials().unwrap(),
			Some(Credentials::Header(String::from("Bearer token")))
		);
		assert!(matches!(
			server(Some("orthanc"), None, None).credentials(),
			Err(ConfigError::IncompleteCredentials(_))
		));
		assert!(matches!(
			server(Some("orthanc"), Some("orthanc"), Some("Bearer token")).credentials(),
			Err(ConfigError::ConflictingCredentials(_))
		));
		assert_eq!(server(Some(""), Some(""), None).credentials().unwrap(), None);
		assert_eq!(
			server(Some(""), None, Some("Bearer token")).credentials().unwrap(),
			Some(Credentials::Header(String::from("Bearer token")))
		);
	}

	#[test]
	fn credentials_are_redacted() {
		let credentials = Credentials::Basic {
			username: String::from("orthanc"),
			password: String::from("secret"),
		};
		assert!(!format!("{credentials:?}").contains("secret"));
	}

	#[test]
	fn retry_delay_doubles_until_capped() {
		let retry = RetryConfig {
			attempts: 10,
			backoff: 500,
			max_backoff: 3000,
		};
		assert_eq!(retry.delay(0), Duration::from_millis(500));
		assert_eq!(retry.delay(1), Duration::from_millis(1000));
		assert_eq!(retry.delay(2), Duration::from_millis(2000));
		assert_eq!(retry.delay(3), Duration::from_millis(3000));
		assert_eq!(retry.delay(64), Duration::from_millis(3000));
	}
}
