use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::SyncError;

pub const SLIDER_MIN: i64 = 0;
pub const SLIDER_MAX: i64 = 4095;
/// Width of every color bucket except the last one, which is open above.
pub const BUCKET_WIDTH: i64 = 585;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LampColor {
	#[serde(rename = "Verde")]
	Green,
	#[serde(rename = "Amarelo")]
	Yellow,
	#[serde(rename = "Laranja")]
	Orange,
	#[serde(rename = "Vermelho")]
	Red,
	#[serde(rename = "Rosa")]
	Pink,
	#[serde(rename = "Roxo")]
	Purple,
	#[serde(rename = "Azul")]
	Blue,
	#[serde(rename = "Desligado")]
	Off,
}

impl LampColor {
	/// Slider buckets in ascending order.
	pub const BUCKETS: [LampColor; 7] = [
		LampColor::Green,
		LampColor::Yellow,
		LampColor::Orange,
		LampColor::Red,
		LampColor::Pink,
		LampColor::Purple,
		LampColor::Blue,
	];

	/// Label the device and the database use for this color.
	pub fn label(self) -> &'static str {
		match self {
			LampColor::Green => "Verde",
			LampColor::Yellow => "Amarelo",
			LampColor::Orange => "Laranja",
			LampColor::Red => "Vermelho",
			LampColor::Pink => "Rosa",
			LampColor::Purple => "Roxo",
			LampColor::Blue => "Azul",
			LampColor::Off => "Desligado",
		}
	}

	pub fn rgb(self) -> &'static str {
		match self {
			LampColor::Green => "#10b981",
			LampColor::Yellow => "#eab308",
			LampColor::Orange => "#f97316",
			LampColor::Red => "#ef4444",
			LampColor::Pink => "#ec4899",
			LampColor::Purple => "#8b5cf6",
			LampColor::Blue => "#3b82f6",
			LampColor::Off => "#6b7280",
		}
	}

	pub fn from_label(label: &str) -> Option<LampColor> {
		LampColor::BUCKETS
			.iter()
			.copied()
			.chain(std::iter::once(LampColor::Off))
			.find(|color| color.label() == label)
	}
}

impl fmt::Display for LampColor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.label())
	}
}

/// Maps a raw slider value onto one of the seven color buckets.
///
/// Total over `i64`: anything below the first boundary is green and anything
/// at or past 3510 is blue. No clamping happens here.
pub fn color_from_slider(value: i64) -> LampColor {
	if value < 0 {
		return LampColor::Green;
	}
	let bucket = (value / BUCKET_WIDTH).min(LampColor::BUCKETS.len() as i64 - 1);
	LampColor::BUCKETS[bucket as usize]
}

pub fn clamp_slider(value: i64) -> i64 {
	value.clamp(SLIDER_MIN, SLIDER_MAX)
}

/// Timestamp in the same shape the dashboard has always written (millisecond
/// precision, `Z` suffix).
pub fn timestamp_now() -> String {
	Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LampState {
	#[serde(rename = "ligado")]
	pub is_on: bool,
	#[serde(rename = "cor")]
	pub color_name: String,
	#[serde(rename = "slider")]
	pub slider_value: i64,
	#[serde(rename = "lastUpdated")]
	pub last_updated_at: String,
}

impl LampState {
	/// The record written when the remote store has none yet.
	pub fn initial(last_updated_at: impl Into<String>) -> Self {
		LampState {
			is_on: false,
			color_name: LampColor::Off.label().to_string(),
			slider_value: 0,
			last_updated_at: last_updated_at.into(),
		}
	}

	/// Color to show for this state. Always `Off` while the lamp is off.
	pub fn display_color(&self) -> LampColor {
		if self.is_on {
			color_from_slider(self.slider_value)
		} else {
			LampColor::Off
		}
	}
}

/// Partial update of a `LampState`. Fields left as `None` are not sent.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct StatePatch {
	#[serde(rename = "ligado", skip_serializing_if = "Option::is_none")]
	pub is_on: Option<bool>,
	#[serde(rename = "cor", skip_serializing_if = "Option::is_none")]
	pub color_name: Option<String>,
	#[serde(rename = "slider", skip_serializing_if = "Option::is_none")]
	pub slider_value: Option<i64>,
	#[serde(rename = "lastUpdated", skip_serializing_if = "Option::is_none")]
	pub last_updated_at: Option<String>,
}

impl StatePatch {
	pub fn to_fields(&self) -> Result<Map<String, Value>, SyncError> {
		match serde_json::to_value(self)? {
			Value::Object(fields) => Ok(fields),
			other => Err(SyncError::MalformedPayload(format!(
				"patch serialized to {other}"
			))),
		}
	}
}

static NULL: Value = Value::Null;

fn truthy(value: &Value) -> bool {
	match value {
		Value::Null => false,
		Value::Bool(b) => *b,
		Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
		Value::String(s) => !s.is_empty(),
		Value::Array(_) | Value::Object(_) => true,
	}
}

fn text_of(value: &Value) -> String {
	match value {
		Value::String(s) => s.clone(),
		other => other.to_string(),
	}
}

/// Coerces an already-parsed JSON value into a `LampState`.
///
/// Only objects are accepted. Field values are never trusted: `ligado` goes
/// through truthiness, a falsy `cor` becomes the off label, a non-numeric
/// `slider` becomes 0 and a falsy `lastUpdated` is replaced by `received_at`.
pub fn coerce_state(value: &Value, received_at: &str) -> Result<LampState, SyncError> {
	let fields = value
		.as_object()
		.ok_or_else(|| SyncError::MalformedPayload(format!("expected an object, got {value}")))?;
	let field = |name: &str| fields.get(name).unwrap_or(&NULL);

	let color = field("cor");
	let color_name = if truthy(color) {
		text_of(color)
	} else {
		LampColor::Off.label().to_string()
	};

	let slider_value = match field("slider") {
		Value::Number(n) => n
			.as_i64()
			.or_else(|| n.as_f64().map(|f| f as i64))
			.map_or(0, clamp_slider),
		_ => 0,
	};

	let updated = field("lastUpdated");
	let last_updated_at = if truthy(updated) {
		text_of(updated)
	} else {
		received_at.to_string()
	};

	Ok(LampState {
		is_on: truthy(field("ligado")),
		color_name,
		slider_value,
		last_updated_at,
	})
}

/// Parses raw message bytes and coerces them into a `LampState`.
pub fn ingest_payload(payload: &[u8], received_at: &str) -> Result<LampState, SyncError> {
	let value: Value = serde_json::from_slice(payload)
		.map_err(|e| SyncError::MalformedPayload(e.to_string()))?;
	coerce_state(&value, received_at)
}
