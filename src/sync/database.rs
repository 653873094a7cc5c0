use std::{
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use log::{debug, info, warn};
use serde_json::{Map, Value};
use tokio::{
	sync::{oneshot, Mutex},
	time,
};

use super::{session, Disposer, EventSink, LampSync, Subscription, SyncEvent};
use crate::{
	error::SyncError,
	states::{clamp_slider, coerce_state, color_from_slider, timestamp_now, LampColor, LampState, StatePatch},
};

/// Slider value whose color is used when the lamp is switched on.
const TOGGLE_SLIDER_BASELINE: i64 = 0;

/// Live view of the record: each item is the whole record after a change,
/// `None` when it does not exist.
pub type Snapshots = BoxStream<'static, Result<Option<Value>, SyncError>>;

/// A single remote document addressed by a fixed path.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
	async fn read(&self) -> Result<Option<Value>, SyncError>;

	/// Replaces the whole record.
	async fn write(&self, record: &Value) -> Result<(), SyncError>;

	/// Merges the given fields into the record, leaving the others untouched.
	async fn merge(&self, fields: &Map<String, Value>) -> Result<(), SyncError>;

	async fn watch(&self) -> Result<Snapshots, SyncError>;

	fn location(&self) -> String;
}

struct LiveSession {
	disposer: Disposer,
	online: Arc<AtomicBool>,
}

/// Realtime-database adapter. Writes are partial merges stamped with the
/// local time; reads come from a live subscription to the record.
pub struct DatabaseSync<S> {
	store: Arc<S>,
	reconnect_interval: Duration,
	live: Mutex<Option<LiveSession>>,
}

impl<S: RecordStore> DatabaseSync<S> {
	pub fn new(store: S, reconnect_interval: Duration) -> Self {
		DatabaseSync {
			store: Arc::new(store),
			reconnect_interval,
			live: Mutex::new(None),
		}
	}

	async fn merge(&self, patch: StatePatch) -> Result<(), SyncError> {
		match self.live.lock().await.as_ref() {
			Some(live) if !live.disposer.is_disposed() && live.online.load(Ordering::SeqCst) => {}
			_ => return Err(SyncError::CommandWithoutSession),
		}
		self.store.merge(&patch.to_fields()?).await
	}
}

pub fn toggle_patch(next_is_on: bool, at: String) -> StatePatch {
	let color = if next_is_on {
		color_from_slider(TOGGLE_SLIDER_BASELINE)
	} else {
		LampColor::Off
	};
	StatePatch {
		is_on: Some(next_is_on),
		color_name: Some(color.label().to_string()),
		slider_value: None,
		last_updated_at: Some(at),
	}
}

pub fn slider_patch(value: i64, at: String) -> StatePatch {
	let value = clamp_slider(value);
	StatePatch {
		is_on: Some(true),
		color_name: Some(color_from_slider(value).label().to_string()),
		slider_value: Some(value),
		last_updated_at: Some(at),
	}
}

async fn pump<S: RecordStore>(
	store: Arc<S>,
	sink: EventSink,
	online: Arc<AtomicBool>,
	reconnect_interval: Duration,
	mut stop: oneshot::Receiver<()>,
) {
	'session: loop {
		let watched = tokio::select! {
			_ = &mut stop => break 'session,
			watched = store.watch() => watched,
		};
		match watched {
			Ok(mut snapshots) => {
				online.store(true, Ordering::SeqCst);
				info!("watching {}", store.location());
				sink.emit(SyncEvent::Connected);
				let reason = loop {
					tokio::select! {
						_ = &mut stop => break 'session,
						next = snapshots.next() => match next {
							Some(Ok(Some(value))) => match coerce_state(&value, &timestamp_now()) {
								Ok(state) => sink.emit(SyncEvent::State(state)),
								Err(e) => warn!("ignoring record update: {}", e),
							},
							Some(Ok(None)) => debug!("{} has no record yet", store.location()),
							Some(Err(e)) => break e.to_string(),
							None => break "stream closed".to_string(),
						}
					}
				};
				online.store(false, Ordering::SeqCst);
				warn!("lost {}: {}", store.location(), reason);
				sink.emit(SyncEvent::Disconnected(format!("Database disconnected: {reason}")));
			}
			Err(e) => {
				warn!("could not watch {}: {}", store.location(), e);
				sink.emit(SyncEvent::Disconnected(format!("Database error: {e}")));
			}
		}
		tokio::select! {
			_ = &mut stop => break 'session,
			_ = time::sleep(reconnect_interval) => {}
		}
	}
	online.store(false, Ordering::SeqCst);
	info!("stopped watching {}", store.location());
}

#[async_trait]
impl<S: RecordStore> LampSync for DatabaseSync<S> {
	async fn connect(&self) -> Result<Subscription, SyncError> {
		let (sink, subscription, stop) = session();
		let online = Arc::new(AtomicBool::new(false));
		let previous = self.live.lock().await.replace(LiveSession {
			disposer: subscription.disposer(),
			online: online.clone(),
		});
		if let Some(previous) = previous {
			previous.disposer.dispose();
		}
		tokio::spawn(pump(
			self.store.clone(),
			sink,
			online,
			self.reconnect_interval,
			stop,
		));
		Ok(subscription)
	}

	async fn send_toggle(&self, next_is_on: bool) -> Result<(), SyncError> {
		self.merge(toggle_patch(next_is_on, timestamp_now())).await
	}

	async fn send_slider(&self, value: i64) -> Result<(), SyncError> {
		self.merge(slider_patch(value, timestamp_now())).await
	}

	async fn ensure_initialized(&self) -> Result<(), SyncError> {
		if self.store.read().await?.is_some() {
			return Ok(());
		}
		let record = serde_json::to_value(LampState::initial(timestamp_now()))?;
		self.store.write(&record).await?;
		info!("created default record at {}", self.store.location());
		Ok(())
	}

	fn describe(&self) -> String {
		self.store.location()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use std::sync::atomic::AtomicUsize;
	use tokio::sync::watch;
	use tokio_stream::wrappers::WatchStream;

	struct MemoryStore {
		record: watch::Sender<Option<Value>>,
		writes: AtomicUsize,
		merges: std::sync::Mutex<Vec<Map<String, Value>>>,
	}

	impl MemoryStore {
		fn new(record: Option<Value>) -> Self {
			MemoryStore {
				record: watch::channel(record).0,
				writes: AtomicUsize::new(0),
				merges: std::sync::Mutex::new(Vec::new()),
			}
		}
	}

	#[async_trait]
	impl RecordStore for MemoryStore {
		async fn read(&self) -> Result<Option<Value>, SyncError> {
			Ok(self.record.borrow().clone())
		}

		async fn write(&self, record: &Value) -> Result<(), SyncError> {
			self.writes.fetch_add(1, Ordering::SeqCst);
			self.record.send_replace(Some(record.clone()));
			Ok(())
		}

		async fn merge(&self, fields: &Map<String, Value>) -> Result<(), SyncError> {
			self.merges.lock().unwrap().push(fields.clone());
			self.record.send_modify(|record| {
				let record = record.get_or_insert_with(|| json!({}));
				if let Some(object) = record.as_object_mut() {
					for (key, value) in fields {
						object.insert(key.clone(), value.clone());
					}
				}
			});
			Ok(())
		}

		async fn watch(&self) -> Result<Snapshots, SyncError> {
			Ok(WatchStream::new(self.record.subscribe()).map(Ok).boxed())
		}

		fn location(&self) -> String {
			"memory://lampada".to_string()
		}
	}

	fn adapter(record: Option<Value>) -> DatabaseSync<MemoryStore> {
		DatabaseSync::new(MemoryStore::new(record), Duration::from_millis(10))
	}

	async fn next_state(subscription: &mut Subscription) -> LampState {
		loop {
			match subscription.next_event().await {
				Some(SyncEvent::State(state)) => return state,
				Some(_) => continue,
				None => panic!("session ended"),
			}
		}
	}

	#[tokio::test]
	async fn initializes_missing_record_once() {
		let db = adapter(None);
		db.ensure_initialized().await.unwrap();
		assert_eq!(db.store.writes.load(Ordering::SeqCst), 1);
		let record = db.store.read().await.unwrap().unwrap();
		assert_eq!(record["ligado"], json!(false));
		assert_eq!(record["cor"], json!("Desligado"));
		assert_eq!(record["slider"], json!(0));
		assert!(record["lastUpdated"].is_string());
	}

	#[tokio::test]
	async fn existing_record_is_left_alone() {
		let db = adapter(Some(json!({"ligado": true, "cor": "Rosa", "slider": 2600})));
		db.ensure_initialized().await.unwrap();
		db.ensure_initialized().await.unwrap();
		assert_eq!(db.store.writes.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn send_without_session_fails() {
		let db = adapter(None);
		assert!(matches!(db.send_toggle(true).await, Err(SyncError::CommandWithoutSession)));
		assert!(matches!(db.send_slider(10).await, Err(SyncError::CommandWithoutSession)));
		assert!(db.store.merges.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn toggle_on_resets_color_to_first_bucket() {
		let db = adapter(Some(json!({"ligado": false, "cor": "Desligado", "slider": 3000})));
		let mut subscription = db.connect().await.unwrap();
		assert_eq!(subscription.next_event().await, Some(SyncEvent::Connected));
		assert_eq!(next_state(&mut subscription).await.slider_value, 3000);

		db.send_toggle(true).await.unwrap();
		let merged = db.store.merges.lock().unwrap()[0].clone();
		assert_eq!(merged["ligado"], json!(true));
		assert_eq!(merged["cor"], json!(color_from_slider(0).label()));
		assert!(!merged.contains_key("slider"));

		let state = next_state(&mut subscription).await;
		assert!(state.is_on);
		assert_eq!(state.slider_value, 3000);
	}

	#[tokio::test]
	async fn slider_turns_the_lamp_on() {
		let db = adapter(Some(json!({"ligado": false, "cor": "Desligado", "slider": 0})));
		let mut subscription = db.connect().await.unwrap();
		next_state(&mut subscription).await;

		db.send_slider(700).await.unwrap();
		let merged = db.store.merges.lock().unwrap()[0].clone();
		assert_eq!(merged["ligado"], json!(true));
		assert_eq!(merged["slider"], json!(700));
		assert_eq!(merged["cor"], json!("Amarelo"));
	}

	/// Store whose watch replays a fixed list of snapshots, then stays open.
	struct ReplayStore {
		snapshots: Vec<Value>,
	}

	#[async_trait]
	impl RecordStore for ReplayStore {
		async fn read(&self) -> Result<Option<Value>, SyncError> {
			Ok(self.snapshots.first().cloned())
		}

		async fn write(&self, _: &Value) -> Result<(), SyncError> {
			Ok(())
		}

		async fn merge(&self, _: &Map<String, Value>) -> Result<(), SyncError> {
			Ok(())
		}

		async fn watch(&self) -> Result<Snapshots, SyncError> {
			let replay: Vec<Result<Option<Value>, SyncError>> =
				self.snapshots.iter().cloned().map(|v| Ok(Some(v))).collect();
			Ok(futures::stream::iter(replay)
				.chain(futures::stream::pending())
				.boxed())
		}

		fn location(&self) -> String {
			"replay://lampada".to_string()
		}
	}

	#[tokio::test]
	async fn malformed_record_does_not_replace_state() {
		let db = DatabaseSync::new(
			ReplayStore {
				snapshots: vec![
					json!({"ligado": true, "cor": "Azul", "slider": 4000}),
					json!("garbage"),
					json!([1, 2, 3]),
					json!({"ligado": false, "slider": 10}),
				],
			},
			Duration::from_millis(10),
		);
		let mut subscription = db.connect().await.unwrap();
		assert_eq!(subscription.next_event().await, Some(SyncEvent::Connected));

		let first = match subscription.next_event().await {
			Some(SyncEvent::State(state)) => state,
			other => panic!("unexpected {other:?}"),
		};
		assert_eq!(first.color_name, "Azul");

		// The two malformed snapshots in between produce no events at all.
		match subscription.next_event().await {
			Some(SyncEvent::State(second)) => {
				assert!(!second.is_on);
				assert_eq!(second.slider_value, 10);
				assert_eq!(second.color_name, "Desligado");
			}
			other => panic!("unexpected {other:?}"),
		}
	}

	#[tokio::test]
	async fn disposed_session_goes_quiet() {
		let db = adapter(Some(json!({"ligado": true, "cor": "Verde", "slider": 0})));
		let mut subscription = db.connect().await.unwrap();
		next_state(&mut subscription).await;

		let disposer = subscription.disposer();
		disposer.dispose();
		disposer.dispose();
		db.store.record.send_replace(Some(json!({"ligado": false})));
		assert_eq!(subscription.next_event().await, None);
		assert!(matches!(db.send_toggle(false).await, Err(SyncError::CommandWithoutSession)));
	}

	#[test]
	fn toggle_off_writes_off_label() {
		let patch = toggle_patch(false, "t".into());
		assert_eq!(patch.color_name.as_deref(), Some("Desligado"));
		assert_eq!(patch.slider_value, None);
	}

	#[test]
	fn slider_patch_clamps() {
		let patch = slider_patch(-20, "t".into());
		assert_eq!(patch.slider_value, Some(0));
		assert_eq!(patch.color_name.as_deref(), Some("Verde"));
	}
}
