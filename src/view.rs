use std::fmt;

use chrono::{DateTime, Local};

use crate::{
	states::{LampColor, LampState, SLIDER_MAX},
	sync::SyncEvent,
};

const GAUGE_WIDTH: i64 = 28;

/// What the dashboard should currently show.
#[derive(Debug, PartialEq)]
pub enum Screen<'a> {
	Loading,
	ConfigError(&'a [String]),
	Dashboard(&'a LampState),
}

/// Presentational state of the dashboard. It only ever changes through
/// inbound events; sending a command does not touch it.
#[derive(Debug, Clone, Default)]
pub struct DashboardView {
	lamp: Option<LampState>,
	connected: bool,
	status: Option<String>,
	config_error: Option<Vec<String>>,
	location: String,
}

impl DashboardView {
	pub fn new(location: impl Into<String>) -> Self {
		DashboardView {
			location: location.into(),
			..DashboardView::default()
		}
	}

	/// View for a startup where required settings are absent. No session is
	/// ever attached to it.
	pub fn missing_configuration(missing: Vec<String>) -> Self {
		DashboardView {
			config_error: Some(missing),
			..DashboardView::default()
		}
	}

	pub fn apply(&mut self, event: &SyncEvent) {
		match event {
			SyncEvent::State(state) => self.lamp = Some(state.clone()),
			SyncEvent::Connected => {
				self.connected = true;
				self.status = None;
			}
			SyncEvent::Disconnected(reason) => {
				self.connected = false;
				self.status = Some(reason.clone());
			}
		}
	}

	pub fn set_status(&mut self, status: impl Into<String>) {
		self.status = Some(status.into());
	}

	pub fn screen(&self) -> Screen<'_> {
		if let Some(missing) = &self.config_error {
			return Screen::ConfigError(missing);
		}
		match &self.lamp {
			Some(lamp) => Screen::Dashboard(lamp),
			None => Screen::Loading,
		}
	}

	pub fn lamp(&self) -> Option<&LampState> {
		self.lamp.as_ref()
	}

	pub fn is_connected(&self) -> bool {
		self.connected
	}

	pub fn status(&self) -> Option<&str> {
		self.status.as_deref()
	}
}

fn clock_time(timestamp: &str) -> String {
	match DateTime::parse_from_rfc3339(timestamp) {
		Ok(at) => at.with_timezone(&Local).format("%H:%M:%S").to_string(),
		Err(_) => timestamp.to_string(),
	}
}

fn gauge(slider: i64) -> String {
	let filled = (slider.clamp(0, SLIDER_MAX) * GAUGE_WIDTH / SLIDER_MAX) as usize;
	format!(
		"[{}{}]",
		"#".repeat(filled),
		".".repeat(GAUGE_WIDTH as usize - filled)
	)
}

impl fmt::Display for DashboardView {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.screen() {
			Screen::Loading => {
				writeln!(f, "Connecting to {}...", self.location)?;
				if let Some(status) = &self.status {
					writeln!(f, "{status}")?;
				}
				Ok(())
			}
			Screen::ConfigError(missing) => {
				writeln!(f, "Configuration error")?;
				writeln!(f, "Missing settings: {}", missing.join(", "))?;
				writeln!(f, "Add them to .env or the environment and restart.")
			}
			Screen::Dashboard(lamp) => {
				let color = lamp.display_color();
				let link = if self.connected { "connected" } else { "disconnected" };
				writeln!(f, "Lâmpada Inteligente [{link}]")?;
				writeln!(f, "  state    {}", if lamp.is_on { "Ligada" } else { "Desligada" })?;
				writeln!(f, "  color    {} {}", color, color.rgb())?;
				match LampColor::from_label(&lamp.color_name) {
					Some(reported) => writeln!(f, "  reported {} {}", reported, reported.rgb())?,
					None => writeln!(f, "  reported {}", lamp.color_name)?,
				}
				writeln!(f, "  slider   {} {}", gauge(lamp.slider_value), lamp.slider_value)?;
				writeln!(f, "  updated  {}", clock_time(&lamp.last_updated_at))?;
				writeln!(f, "  data     {}", self.location)?;
				if let Some(status) = &self.status {
					writeln!(f, "  ! {status}")?;
				}
				writeln!(f, "t = toggle, s <0-{SLIDER_MAX}> = color, q = quit")
			}
		}
	}
}
