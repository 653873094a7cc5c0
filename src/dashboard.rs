use std::sync::Arc;

use log::{info, warn};

use crate::{
	error::SyncError,
	sync::{LampSync, Subscription},
	view::DashboardView,
};

/// Owns one adapter session for as long as the dashboard is mounted and turns
/// user intents into adapter commands.
pub struct Dashboard {
	sync: Arc<dyn LampSync>,
	view: DashboardView,
	subscription: Option<Subscription>,
}

impl Dashboard {
	pub fn new(sync: Arc<dyn LampSync>) -> Self {
		let view = DashboardView::new(sync.describe());
		Dashboard {
			sync,
			view,
			subscription: None,
		}
	}

	/// Seeds the remote record if needed and opens the session. A failed seed
	/// is shown as a status message; the session is opened regardless.
	pub async fn mount(&mut self) -> Result<(), SyncError> {
		if let Err(e) = self.sync.ensure_initialized().await {
			warn!("could not initialize the lamp record: {}", e);
			if e.is_transient() {
				self.view.set_status(format!("Connection problem, retrying: {e}"));
			} else {
				self.view.set_status(format!("Initialization failed: {e}"));
			}
		}
		self.subscription = Some(self.sync.connect().await?);
		info!("dashboard mounted on {}", self.sync.describe());
		Ok(())
	}

	/// Waits for the next session event and applies it to the view. Returns
	/// `false` when not mounted or once the session is over.
	pub async fn next_update(&mut self) -> bool {
		let Some(subscription) = self.subscription.as_mut() else {
			return false;
		};
		match subscription.next_event().await {
			Some(event) => {
				self.view.apply(&event);
				true
			}
			None => false,
		}
	}

	pub async fn toggle(&self) -> Result<(), SyncError> {
		let next_is_on = !self.view.lamp().map_or(false, |lamp| lamp.is_on);
		self.sync.send_toggle(next_is_on).await
	}

	pub async fn slide(&self, value: i64) -> Result<(), SyncError> {
		self.sync.send_slider(value).await
	}

	pub fn view(&self) -> &DashboardView {
		&self.view
	}

	pub fn unmount(&mut self) {
		if let Some(subscription) = self.subscription.take() {
			subscription.dispose();
			info!("dashboard unmounted");
		}
	}
}

impl Drop for Dashboard {
	fn drop(&mut self) {
		self.unmount();
	}
}
