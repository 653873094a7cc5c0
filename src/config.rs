use std::time::Duration;

use crate::error::SyncError;

pub const RECORD_PATH: &str = "lampada";
pub const STATE_TOPIC: &str = "lampada/state";
pub const COMMAND_TOPIC: &str = "lampada/command";

const DEFAULT_PORT: u16 = 9001;
const DEFAULT_PATH: &str = "/mqtt";
const DEFAULT_RECONNECT_MS: u64 = 2000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
	Broker,
	Database,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BrokerConfig {
	pub endpoint: String,
	pub port: u16,
	pub path: String,
	pub use_tls: bool,
	pub username: Option<String>,
	pub password: Option<String>,
	pub client_id: String,
	pub reconnect_interval: Duration,
}

impl BrokerConfig {
	pub fn url(&self) -> String {
		let scheme = if self.use_tls { "wss" } else { "ws" };
		format!("{}://{}:{}{}", scheme, self.endpoint, self.port, self.path)
	}
}

#[derive(Clone, Debug, PartialEq)]
pub struct DatabaseConfig {
	pub api_key: String,
	pub database_url: String,
	pub project_id: String,
	pub auth_token: Option<String>,
	pub anonymous_auth: bool,
	pub record_path: String,
	pub reconnect_interval: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LampConfig {
	Broker(BrokerConfig),
	Database(DatabaseConfig),
}

/// Reads settings through `lookup`, which maps an environment variable name to
/// its value. Empty values are treated as absent.
struct Settings<F> {
	lookup: F,
	missing: Vec<String>,
}

impl<F> Settings<F>
where
	F: Fn(&str) -> Option<String>,
{
	fn optional(&self, var: &str) -> Option<String> {
		(self.lookup)(var)
			.map(|v| v.trim().to_string())
			.filter(|v| !v.is_empty())
	}

	fn required(&mut self, name: &str, var: &str) -> String {
		match self.optional(var) {
			Some(value) => value,
			None => {
				self.missing.push(name.to_string());
				String::new()
			}
		}
	}

	fn parsed<T: std::str::FromStr>(&self, name: &str, var: &str, default: T) -> Result<T, SyncError> {
		match self.optional(var) {
			Some(raw) => raw.parse().map_err(|_| SyncError::InvalidSetting {
				name: name.to_string(),
				value: raw,
			}),
			None => Ok(default),
		}
	}

	fn finish<T>(self, config: T) -> Result<T, SyncError> {
		if self.missing.is_empty() {
			Ok(config)
		} else {
			Err(SyncError::ConfigurationMissing(self.missing))
		}
	}
}

impl LampConfig {
	/// Loads `.env` if present, then reads the process environment.
	pub fn from_env() -> Result<Self, SyncError> {
		dotenv::dotenv().ok();
		Self::from_lookup(|var| dotenv::var(var).ok())
	}

	pub fn from_lookup<F>(lookup: F) -> Result<Self, SyncError>
	where
		F: Fn(&str) -> Option<String>,
	{
		let mut settings = Settings {
			lookup,
			missing: Vec::new(),
		};
		let transport = match settings.optional("LAMPADA_TRANSPORT").as_deref() {
			None | Some("mqtt") => TransportKind::Broker,
			Some("firebase") => TransportKind::Database,
			Some(other) => {
				return Err(SyncError::InvalidSetting {
					name: "transport".into(),
					value: other.into(),
				})
			}
		};
		let reconnect_interval =
			Duration::from_millis(settings.parsed("reconnectMs", "LAMPADA_RECONNECT_MS", DEFAULT_RECONNECT_MS)?);

		match transport {
			TransportKind::Broker => {
				let endpoint = settings.required("endpoint", "LAMPADA_MQTT_ENDPOINT");
				let port = settings.parsed("port", "LAMPADA_MQTT_PORT", DEFAULT_PORT)?;
				let path = settings
					.optional("LAMPADA_MQTT_PATH")
					.unwrap_or_else(|| DEFAULT_PATH.to_string());
				let path = if path.starts_with('/') { path } else { format!("/{path}") };
				let use_tls = settings.optional("LAMPADA_MQTT_TLS").as_deref() == Some("true");
				let client_id = settings
					.optional("LAMPADA_MQTT_CLIENT_ID")
					.unwrap_or_else(|| format!("lampada-dashboard-{}", std::process::id()));
				let config = BrokerConfig {
					endpoint,
					port,
					path,
					use_tls,
					username: settings.optional("LAMPADA_MQTT_USERNAME"),
					password: settings.optional("LAMPADA_MQTT_PASSWORD"),
					client_id,
					reconnect_interval,
				};
				settings.finish(LampConfig::Broker(config))
			}
			TransportKind::Database => {
				let api_key = settings.required("apiKey", "LAMPADA_FIREBASE_API_KEY");
				let database_url = settings.required("databaseURL", "LAMPADA_FIREBASE_DATABASE_URL");
				let project_id = settings.required("projectId", "LAMPADA_FIREBASE_PROJECT_ID");
				let config = DatabaseConfig {
					api_key,
					database_url: database_url.trim_end_matches('/').to_string(),
					project_id,
					auth_token: settings.optional("LAMPADA_FIREBASE_AUTH_TOKEN"),
					anonymous_auth: settings.optional("LAMPADA_FIREBASE_ANONYMOUS_AUTH").as_deref()
						== Some("true"),
					record_path: RECORD_PATH.to_string(),
					reconnect_interval,
				};
				settings.finish(LampConfig::Database(config))
			}
		}
	}

	pub fn transport(&self) -> TransportKind {
		match self {
			LampConfig::Broker(_) => TransportKind::Broker,
			LampConfig::Database(_) => TransportKind::Database,
		}
	}
}
