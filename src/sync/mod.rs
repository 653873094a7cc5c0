//! Lamp state synchronization.
//!
//! Both transports implement [`LampSync`]. A session is opened with
//! [`LampSync::connect`], which hands back a [`Subscription`] delivering
//! [`SyncEvent`]s in transport order to a single consumer. Dropping or
//! disposing the subscription's [`Disposer`] ends the session.

use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc, Mutex,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::{config::LampConfig, error::SyncError, states::LampState};

pub mod broker;
pub mod database;
pub mod firebase;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
	State(LampState),
	Connected,
	/// Session dropped or failed; the adapter keeps retrying on its own.
	Disconnected(String),
}

#[async_trait]
pub trait LampSync: Send + Sync {
	/// Opens a live session. A previous session of the same adapter is disposed.
	async fn connect(&self) -> Result<Subscription, SyncError>;

	async fn send_toggle(&self, next_is_on: bool) -> Result<(), SyncError>;

	async fn send_slider(&self, value: i64) -> Result<(), SyncError>;

	/// Reads the remote record once and writes the default record if absent.
	async fn ensure_initialized(&self) -> Result<(), SyncError>;

	/// Human readable location of the shared record, for display.
	fn describe(&self) -> String;
}

/// Builds the adapter for the configured transport.
pub fn from_config(config: &LampConfig) -> Result<Arc<dyn LampSync>, SyncError> {
	Ok(match config {
		LampConfig::Broker(broker) => Arc::new(broker::BrokerSync::new(broker.clone())),
		LampConfig::Database(db) => Arc::new(database::DatabaseSync::new(
			firebase::FirebaseStore::new(db.clone())?,
			db.reconnect_interval,
		)),
	})
}

/// Tears a session down. Cloneable; every call after the first is a no-op.
#[derive(Clone)]
pub struct Disposer {
	inner: Arc<DisposerInner>,
}

struct DisposerInner {
	disposed: Arc<AtomicBool>,
	stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl Disposer {
	pub fn dispose(&self) {
		if self.inner.disposed.swap(true, Ordering::SeqCst) {
			return;
		}
		let stop = match self.inner.stop.lock() {
			Ok(mut guard) => guard.take(),
			Err(poisoned) => poisoned.into_inner().take(),
		};
		if let Some(stop) = stop {
			let _ = stop.send(());
		}
	}

	pub fn is_disposed(&self) -> bool {
		self.inner.disposed.load(Ordering::SeqCst)
	}
}

/// Receiving end of a session.
pub struct Subscription {
	events: mpsc::UnboundedReceiver<SyncEvent>,
	disposer: Disposer,
}

impl Subscription {
	/// Next event in delivery order. Returns `None` once the session is
	/// disposed, even if events were still buffered.
	pub async fn next_event(&mut self) -> Option<SyncEvent> {
		if self.disposer.is_disposed() {
			return None;
		}
		let event = self.events.recv().await?;
		if self.disposer.is_disposed() {
			None
		} else {
			Some(event)
		}
	}

	pub fn disposer(&self) -> Disposer {
		self.disposer.clone()
	}

	pub fn dispose(&self) {
		self.disposer.dispose();
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		self.disposer.dispose();
	}
}

/// Producer half handed to a transport's pump task.
#[derive(Clone)]
pub(crate) struct EventSink {
	tx: mpsc::UnboundedSender<SyncEvent>,
	disposed: Arc<AtomicBool>,
}

impl EventSink {
	pub(crate) fn emit(&self, event: SyncEvent) {
		if self.is_closed() {
			return;
		}
		let _ = self.tx.send(event);
	}

	pub(crate) fn is_closed(&self) -> bool {
		self.disposed.load(Ordering::SeqCst)
	}
}

/// Creates the pieces of one session: the sink the pump writes to, the
/// subscription returned to the caller, and the stop signal the pump awaits.
pub(crate) fn session() -> (EventSink, Subscription, oneshot::Receiver<()>) {
	let (tx, events) = mpsc::unbounded_channel();
	let (stop_tx, stop_rx) = oneshot::channel();
	let disposed = Arc::new(AtomicBool::new(false));
	let disposer = Disposer {
		inner: Arc::new(DisposerInner {
			disposed: disposed.clone(),
			stop: Mutex::new(Some(stop_tx)),
		}),
	};
	(
		EventSink { tx, disposed },
		Subscription { events, disposer },
		stop_rx,
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn events_arrive_in_order() {
		let (sink, mut subscription, _stop) = session();
		sink.emit(SyncEvent::Connected);
		sink.emit(SyncEvent::Disconnected("gone".into()));
		assert_eq!(subscription.next_event().await, Some(SyncEvent::Connected));
		assert_eq!(
			subscription.next_event().await,
			Some(SyncEvent::Disconnected("gone".into()))
		);
	}

	#[tokio::test]
	async fn dispose_twice_is_safe_and_silences_the_session() {
		let (sink, mut subscription, mut stop) = session();
		sink.emit(SyncEvent::Connected);
		let disposer = subscription.disposer();
		disposer.dispose();
		disposer.dispose();
		subscription.dispose();
		assert!(disposer.is_disposed());
		assert!(stop.try_recv().is_ok());
		sink.emit(SyncEvent::Connected);
		assert_eq!(subscription.next_event().await, None);
		assert!(sink.is_closed());
	}

	#[tokio::test]
	async fn dropping_the_subscription_stops_the_pump() {
		let (sink, subscription, stop) = session();
		drop(subscription);
		assert!(stop.await.is_ok());
		assert!(sink.is_closed());
	}
}
