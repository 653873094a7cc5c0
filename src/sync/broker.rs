use std::{
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use async_trait::async_trait;
use log::{debug, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport};
use tokio::{
	sync::{oneshot, Mutex},
	time,
};

use super::{session, Disposer, EventSink, LampSync, Subscription, SyncEvent};
use crate::{
	config::{BrokerConfig, COMMAND_TOPIC, STATE_TOPIC},
	error::SyncError,
	states::{clamp_slider, ingest_payload, timestamp_now, StatePatch},
};

/// Slider value sent when a toggle turns the lamp on.
const TOGGLE_SLIDER_BASELINE: i64 = 0;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
/// How long a closing session may take to hand its DISCONNECT to the network.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Where commands go once a session is up.
#[async_trait]
pub trait CommandSink: Send + Sync {
	async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SyncError>;
}

#[async_trait]
impl CommandSink for AsyncClient {
	async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SyncError> {
		AsyncClient::publish(self, topic, QoS::AtMostOnce, false, payload)
			.await
			.map_err(|e| SyncError::ConnectionFailure(e.to_string()))
	}
}

struct LiveSession {
	sink: Arc<dyn CommandSink>,
	disposer: Disposer,
	connected: Arc<AtomicBool>,
}

/// MQTT adapter: subscribes to the retained state topic and publishes
/// partial commands to the command topic.
pub struct BrokerSync {
	config: BrokerConfig,
	live: Mutex<Option<LiveSession>>,
}

impl BrokerSync {
	pub fn new(config: BrokerConfig) -> Self {
		BrokerSync {
			config,
			live: Mutex::new(None),
		}
	}

	async fn install(&self, sink: Arc<dyn CommandSink>, disposer: Disposer, connected: Arc<AtomicBool>) {
		let previous = self.live.lock().await.replace(LiveSession {
			sink,
			disposer,
			connected,
		});
		if let Some(previous) = previous {
			previous.disposer.dispose();
		}
	}

	async fn publish_command(&self, command: StatePatch) -> Result<(), SyncError> {
		let sink = match self.live.lock().await.as_ref() {
			Some(live) if !live.disposer.is_disposed() && live.connected.load(Ordering::SeqCst) => {
				live.sink.clone()
			}
			_ => return Err(SyncError::CommandWithoutSession),
		};
		let payload = serde_json::to_vec(&command)?;
		debug!("publishing {} to {}", String::from_utf8_lossy(&payload), COMMAND_TOPIC);
		sink.publish(COMMAND_TOPIC, payload).await
	}
}

pub fn toggle_command(next_is_on: bool) -> StatePatch {
	StatePatch {
		is_on: Some(next_is_on),
		slider_value: next_is_on.then_some(TOGGLE_SLIDER_BASELINE),
		..StatePatch::default()
	}
}

pub fn slider_command(value: i64) -> StatePatch {
	StatePatch {
		is_on: Some(true),
		slider_value: Some(clamp_slider(value)),
		..StatePatch::default()
	}
}

fn mqtt_options(config: &BrokerConfig) -> MqttOptions {
	let mut options = MqttOptions::new(config.client_id.clone(), config.url(), config.port);
	options.set_keep_alive(KEEP_ALIVE);
	options.set_clean_session(true);
	if config.use_tls {
		options.set_transport(Transport::wss_with_default_config());
	} else {
		options.set_transport(Transport::Ws);
	}
	if let Some(username) = &config.username {
		options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
	}
	options
}

fn handle_event(event: Event, client: &AsyncClient, sink: &EventSink, connected: &AtomicBool) {
	match event {
		Event::Incoming(Packet::ConnAck(_)) => {
			connected.store(true, Ordering::SeqCst);
			if let Err(e) = client.try_subscribe(STATE_TOPIC, QoS::AtMostOnce) {
				warn!("could not subscribe to {}: {}", STATE_TOPIC, e);
			}
			info!("MQTT session established");
			sink.emit(SyncEvent::Connected);
		}
		Event::Incoming(Packet::Publish(message)) if message.topic == STATE_TOPIC => {
			match ingest_payload(&message.payload, &timestamp_now()) {
				Ok(state) => sink.emit(SyncEvent::State(state)),
				Err(e) => warn!("dropping message on {}: {}", message.topic, e),
			}
		}
		Event::Incoming(Packet::Disconnect) => {
			connected.store(false, Ordering::SeqCst);
		}
		_ => {}
	}
}

async fn pump(
	mut eventloop: EventLoop,
	client: AsyncClient,
	sink: EventSink,
	connected: Arc<AtomicBool>,
	reconnect_interval: Duration,
	mut stop: oneshot::Receiver<()>,
) {
	loop {
		tokio::select! {
			_ = &mut stop => break,
			polled = eventloop.poll() => match polled {
				Ok(event) => handle_event(event, &client, &sink, &connected),
				Err(e) => {
					connected.store(false, Ordering::SeqCst);
					warn!("MQTT connection lost: {}", e);
					sink.emit(SyncEvent::Disconnected(format!("MQTT error: {e}")));
					tokio::select! {
						_ = &mut stop => break,
						_ = time::sleep(reconnect_interval) => {
							sink.emit(SyncEvent::Disconnected("Reconnecting to MQTT...".to_string()));
						}
					}
				}
			}
		}
	}
	let was_connected = connected.swap(false, Ordering::SeqCst);
	close_session(&client, &mut eventloop, was_connected).await;
	info!("MQTT session closed");
}

/// Queues a DISCONNECT and drives the event loop until it has been written,
/// giving up after [`DISCONNECT_GRACE`].
async fn close_session(client: &AsyncClient, eventloop: &mut EventLoop, connected: bool) {
	if !connected {
		return;
	}
	if let Err(e) = client.try_disconnect() {
		debug!("could not queue MQTT disconnect: {}", e);
		return;
	}
	let flushed = time::timeout(DISCONNECT_GRACE, async {
		loop {
			match eventloop.poll().await {
				Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
				Ok(_) => {}
				Err(e) => {
					debug!("MQTT connection ended while closing: {}", e);
					break;
				}
			}
		}
	})
	.await;
	if flushed.is_err() {
		warn!("MQTT disconnect not sent within {:?}", DISCONNECT_GRACE);
	}
}

#[async_trait]
impl LampSync for BrokerSync {
	async fn connect(&self) -> Result<Subscription, SyncError> {
		info!("connecting to {}", self.config.url());
		let (client, eventloop) = AsyncClient::new(mqtt_options(&self.config), 10);
		let (sink, subscription, stop) = session();
		let connected = Arc::new(AtomicBool::new(false));
		self.install(Arc::new(client.clone()), subscription.disposer(), connected.clone())
			.await;
		tokio::spawn(pump(
			eventloop,
			client,
			sink,
			connected,
			self.config.reconnect_interval,
			stop,
		));
		Ok(subscription)
	}

	async fn send_toggle(&self, next_is_on: bool) -> Result<(), SyncError> {
		self.publish_command(toggle_command(next_is_on)).await
	}

	async fn send_slider(&self, value: i64) -> Result<(), SyncError> {
		self.publish_command(slider_command(value)).await
	}

	async fn ensure_initialized(&self) -> Result<(), SyncError> {
		// The device owns the retained state topic; clients only publish commands.
		Ok(())
	}

	fn describe(&self) -> String {
		format!("{} ({})", self.config.url(), STATE_TOPIC)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::states::{color_from_slider, LampColor};
	use rumqttc::{ConnAck, ConnectReturnCode, Publish};
	use serde_json::{json, Value};

	#[derive(Default)]
	struct RecordingSink {
		published: std::sync::Mutex<Vec<(String, Value)>>,
	}

	#[async_trait]
	impl CommandSink for RecordingSink {
		async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SyncError> {
			let body = serde_json::from_slice(&payload)?;
			self.published.lock().unwrap().push((topic.to_string(), body));
			Ok(())
		}
	}

	fn config() -> BrokerConfig {
		BrokerConfig {
			endpoint: "localhost".into(),
			port: 9001,
			path: "/mqtt".into(),
			use_tls: false,
			username: None,
			password: None,
			client_id: "test".into(),
			reconnect_interval: Duration::from_millis(2000),
		}
	}

	async fn attached(connected: bool) -> (BrokerSync, Arc<RecordingSink>, Subscription) {
		let adapter = BrokerSync::new(config());
		let recorder = Arc::new(RecordingSink::default());
		let (_sink, subscription, _stop) = session();
		adapter
			.install(
				recorder.clone(),
				subscription.disposer(),
				Arc::new(AtomicBool::new(connected)),
			)
			.await;
		(adapter, recorder, subscription)
	}

	#[tokio::test]
	async fn send_without_session_fails() {
		let adapter = BrokerSync::new(config());
		assert!(matches!(adapter.send_toggle(true).await, Err(SyncError::CommandWithoutSession)));
		assert!(matches!(adapter.send_slider(100).await, Err(SyncError::CommandWithoutSession)));
	}

	#[tokio::test]
	async fn send_while_reconnecting_is_not_queued() {
		let (adapter, recorder, _subscription) = attached(false).await;
		assert!(matches!(adapter.send_slider(100).await, Err(SyncError::CommandWithoutSession)));
		assert!(recorder.published.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn slider_turns_the_lamp_on() {
		let (adapter, recorder, _subscription) = attached(true).await;
		adapter.send_slider(5000).await.unwrap();
		let published = recorder.published.lock().unwrap();
		assert_eq!(
			published.as_slice(),
			&[(COMMAND_TOPIC.to_string(), json!({"ligado": true, "slider": 4095}))]
		);
	}

	#[tokio::test]
	async fn toggle_on_sends_slider_baseline() {
		let (adapter, recorder, _subscription) = attached(true).await;
		adapter.send_toggle(true).await.unwrap();
		let published = recorder.published.lock().unwrap();
		let (_, body) = &published[0];
		assert_eq!(body, &json!({"ligado": true, "slider": 0}));
		assert_eq!(color_from_slider(body["slider"].as_i64().unwrap()), LampColor::Green);
	}

	#[tokio::test]
	async fn toggle_off_leaves_slider_alone() {
		let (adapter, recorder, _subscription) = attached(true).await;
		adapter.send_toggle(false).await.unwrap();
		let published = recorder.published.lock().unwrap();
		assert_eq!(
			published.as_slice(),
			&[(COMMAND_TOPIC.to_string(), json!({"ligado": false}))]
		);
	}

	#[tokio::test]
	async fn disposed_session_rejects_commands() {
		let (adapter, recorder, subscription) = attached(true).await;
		subscription.dispose();
		assert!(matches!(adapter.send_toggle(false).await, Err(SyncError::CommandWithoutSession)));
		assert!(recorder.published.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn ensure_initialized_writes_nothing() {
		let (adapter, recorder, _subscription) = attached(true).await;
		adapter.ensure_initialized().await.unwrap();
		assert!(recorder.published.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn incoming_messages_become_events() {
		let (client, _eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 10);
		let (sink, mut subscription, _stop) = session();
		let connected = AtomicBool::new(false);

		handle_event(
			Event::Incoming(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, false))),
			&client,
			&sink,
			&connected,
		);
		assert!(connected.load(Ordering::SeqCst));

		let malformed = Publish::new(STATE_TOPIC, QoS::AtMostOnce, b"{not json".to_vec());
		handle_event(Event::Incoming(Packet::Publish(malformed)), &client, &sink, &connected);
		let elsewhere = Publish::new(COMMAND_TOPIC, QoS::AtMostOnce, br#"{"ligado":true}"#.to_vec());
		handle_event(Event::Incoming(Packet::Publish(elsewhere)), &client, &sink, &connected);
		let good = Publish::new(
			STATE_TOPIC,
			QoS::AtMostOnce,
			br#"{"ligado":true,"slider":1200,"cor":"Laranja","lastUpdated":99}"#.to_vec(),
		);
		handle_event(Event::Incoming(Packet::Publish(good)), &client, &sink, &connected);

		assert_eq!(subscription.next_event().await, Some(SyncEvent::Connected));
		match subscription.next_event().await {
			Some(SyncEvent::State(state)) => {
				assert!(state.is_on);
				assert_eq!(state.slider_value, 1200);
				assert_eq!(state.color_name, "Laranja");
				assert_eq!(state.last_updated_at, "99");
			}
			other => panic!("unexpected {other:?}"),
		}
	}

	#[test]
	fn options_use_websocket_url() {
		let options = mqtt_options(&BrokerConfig {
			username: Some("lamp".into()),
			..config()
		});
		assert_eq!(options.broker_address(), ("ws://localhost:9001/mqtt".to_string(), 9001));
		assert_eq!(options.client_id(), "test");
	}

	#[tokio::test]
	async fn closing_a_live_session_sends_disconnect() {
		use tokio::{
			io::{AsyncReadExt, AsyncWriteExt},
			net::TcpListener,
		};

		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let port = listener.local_addr().unwrap().port();
		let broker = tokio::spawn(async move {
			let (mut socket, _) = listener.accept().await.unwrap();
			let mut connect = [0u8; 256];
			let read = socket.read(&mut connect).await.unwrap();
			assert_eq!(connect[0], 0x10);
			assert!(read > 0);
			socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
			let mut rest = Vec::new();
			socket.read_to_end(&mut rest).await.unwrap();
			rest
		});

		let (client, mut eventloop) = AsyncClient::new(MqttOptions::new("closer", "127.0.0.1", port), 10);
		loop {
			if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await.unwrap() {
				break;
			}
		}
		close_session(&client, &mut eventloop, true).await;
		drop(eventloop);

		let received = time::timeout(Duration::from_secs(5), broker).await.unwrap().unwrap();
		assert!(received.windows(2).any(|packet| packet == [0xE0, 0x00]));
	}
}
