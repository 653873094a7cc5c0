use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
	#[error("missing configuration: {}", .0.join(", "))]
	ConfigurationMissing(Vec<String>),
	#[error("invalid value {value:?} for setting {name}")]
	InvalidSetting { name: String, value: String },
	#[error("connection failure: {0}")]
	ConnectionFailure(String),
	#[error("disconnected: {0}")]
	TransientDisconnect(String),
	#[error("no live session to send the command on")]
	CommandWithoutSession,
	#[error("malformed payload: {0}")]
	MalformedPayload(String),
	#[error(transparent)]
	Json(#[from] serde_json::Error),
	#[error(transparent)]
	Http(#[from] reqwest::Error),
}

impl SyncError {
	/// Errors that the transport recovers from on its own by reconnecting.
	pub fn is_transient(&self) -> bool {
		matches!(
			self,
			SyncError::ConnectionFailure(_) | SyncError::TransientDisconnect(_) | SyncError::Http(_)
		)
	}
}
