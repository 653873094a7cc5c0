//! Firebase Realtime Database over its REST API.
//!
//! Reads and writes go to `<databaseURL>/<path>.json`. The live subscription
//! is the streaming variant of the same URL: a server-sent event stream of
//! `put` and `patch` events that are folded into a cached copy of the record.

use std::{collections::VecDeque, time::Duration};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use log::{debug, info, warn};
use reqwest::{header, Client, Method, RequestBuilder};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use super::database::{RecordStore, Snapshots};
use crate::{config::DatabaseConfig, error::SyncError};

const SIGN_UP_URL: &str = "https://identitytoolkit.googleapis.com/v1/accounts:signUp";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Largest unterminated event the stream decoder will hold on to.
const MAX_EVENT_BYTES: usize = 1 << 20;

#[derive(Deserialize)]
struct SignUpResponse {
	#[serde(rename = "idToken")]
	id_token: String,
}

#[derive(Deserialize)]
struct StreamPayload {
	path: String,
	data: Value,
}

pub struct FirebaseStore {
	http: Client,
	config: DatabaseConfig,
	id_token: Mutex<Option<String>>,
}

impl FirebaseStore {
	pub fn new(config: DatabaseConfig) -> Result<Self, SyncError> {
		let http = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
		Ok(FirebaseStore {
			http,
			config,
			id_token: Mutex::new(None),
		})
	}

	fn record_url(&self) -> String {
		format!("{}/{}.json", self.config.database_url, self.config.record_path)
	}

	async fn auth_token(&self) -> Result<Option<String>, SyncError> {
		if let Some(token) = &self.config.auth_token {
			return Ok(Some(token.clone()));
		}
		if !self.config.anonymous_auth {
			return Ok(None);
		}
		let mut cached = self.id_token.lock().await;
		if let Some(token) = cached.as_ref() {
			return Ok(Some(token.clone()));
		}
		let response: SignUpResponse = self
			.http
			.post(SIGN_UP_URL)
			.query(&[("key", self.config.api_key.as_str())])
			.json(&json!({ "returnSecureToken": true }))
			.send()
			.await?
			.error_for_status()
			.map_err(|e| SyncError::ConnectionFailure(format!("anonymous sign-in failed: {e}")))?
			.json()
			.await?;
		info!("signed in anonymously to project {}", self.config.project_id);
		*cached = Some(response.id_token.clone());
		Ok(Some(response.id_token))
	}

	async fn request(&self, method: Method) -> Result<RequestBuilder, SyncError> {
		let builder = self.http.request(method, self.record_url());
		Ok(match self.auth_token().await? {
			Some(token) => builder.query(&[("auth", token)]),
			None => builder,
		})
	}

	async fn forget_token(&self) {
		self.id_token.lock().await.take();
	}
}

#[async_trait]
impl RecordStore for FirebaseStore {
	async fn read(&self) -> Result<Option<Value>, SyncError> {
		let value: Value = self
			.request(Method::GET)
			.await?
			.send()
			.await?
			.error_for_status()?
			.json()
			.await?;
		Ok(if value.is_null() { None } else { Some(value) })
	}

	async fn write(&self, record: &Value) -> Result<(), SyncError> {
		self.request(Method::PUT)
			.await?
			.json(record)
			.send()
			.await?
			.error_for_status()?;
		Ok(())
	}

	async fn merge(&self, fields: &Map<String, Value>) -> Result<(), SyncError> {
		self.request(Method::PATCH)
			.await?
			.json(fields)
			.send()
			.await?
			.error_for_status()?;
		Ok(())
	}

	async fn watch(&self) -> Result<Snapshots, SyncError> {
		let response = self
			.request(Method::GET)
			.await?
			.header(header::ACCEPT, "text/event-stream")
			.send()
			.await?;
		let response = match response.error_for_status() {
			Ok(response) => response,
			Err(e) => {
				self.forget_token().await;
				return Err(SyncError::ConnectionFailure(e.to_string()));
			}
		};
		let body = response.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec())).boxed();
		let state = WatchState {
			body,
			decoder: EventDecoder::default(),
			record: Value::Null,
			pending: VecDeque::new(),
			done: false,
		};
		Ok(stream::unfold(state, next_snapshot).boxed())
	}

	fn location(&self) -> String {
		format!("{}/{}", self.config.database_url, self.config.record_path)
	}
}

struct WatchState {
	body: futures::stream::BoxStream<'static, reqwest::Result<Vec<u8>>>,
	decoder: EventDecoder,
	record: Value,
	pending: VecDeque<Result<Option<Value>, SyncError>>,
	done: bool,
}

async fn next_snapshot(
	mut state: WatchState,
) -> Option<(Result<Option<Value>, SyncError>, WatchState)> {
	loop {
		if let Some(item) = state.pending.pop_front() {
			return Some((item, state));
		}
		if state.done {
			return None;
		}
		match state.body.next().await {
			Some(Ok(chunk)) => {
				for event in state.decoder.push(&chunk) {
					match apply_event(&mut state.record, &event) {
						Ok(Outcome::Changed) => {
							let snapshot = Some(state.record.clone()).filter(|v| !v.is_null());
							state.pending.push_back(Ok(snapshot));
						}
						Ok(Outcome::Ignored) => {}
						Ok(Outcome::Closed(reason)) => {
							state.pending.push_back(Err(SyncError::TransientDisconnect(reason)));
							state.done = true;
							break;
						}
						Err(e) => warn!("dropping stream event {:?}: {}", event.name, e),
					}
				}
			}
			Some(Err(e)) => {
				state.done = true;
				return Some((Err(e.into()), state));
			}
			None => return None,
		}
	}
}

/// One server-sent event.
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct StreamEvent {
	pub name: String,
	pub data: String,
}

/// Splits a server-sent event byte stream into events. Input may be cut at
/// any byte boundary.
#[derive(Debug, Default)]
pub(crate) struct EventDecoder {
	buffer: Vec<u8>,
}

impl EventDecoder {
	pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
		self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
		let mut events = Vec::new();
		while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
			let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
			let text = String::from_utf8_lossy(&block[..end]);
			let mut event = StreamEvent::default();
			let mut data = Vec::new();
			for line in text.lines() {
				if let Some(name) = line.strip_prefix("event:") {
					event.name = name.trim().to_string();
				} else if let Some(value) = line.strip_prefix("data:") {
					data.push(value.strip_prefix(' ').unwrap_or(value));
				}
			}
			event.data = data.join("\n");
			if !event.name.is_empty() || !event.data.is_empty() {
				events.push(event);
			}
		}
		if self.buffer.len() > MAX_EVENT_BYTES {
			warn!("discarding {} bytes of an oversized stream event", self.buffer.len());
			self.buffer.clear();
		}
		events
	}
}

#[derive(Debug, PartialEq)]
pub(crate) enum Outcome {
	Changed,
	Ignored,
	Closed(String),
}

/// Folds one stream event into the cached record.
pub(crate) fn apply_event(record: &mut Value, event: &StreamEvent) -> Result<Outcome, SyncError> {
	match event.name.as_str() {
		"put" => {
			let payload: StreamPayload = serde_json::from_str(&event.data)?;
			set_at(record, &segments(&payload.path), payload.data);
			Ok(Outcome::Changed)
		}
		"patch" => {
			let payload: StreamPayload = serde_json::from_str(&event.data)?;
			let Value::Object(fields) = payload.data else {
				return Err(SyncError::MalformedPayload("patch data is not an object".into()));
			};
			let base = segments(&payload.path);
			for (key, value) in fields {
				let mut path = base.clone();
				path.extend(segments(&key));
				set_at(record, &path, value);
			}
			Ok(Outcome::Changed)
		}
		"keep-alive" => Ok(Outcome::Ignored),
		"cancel" => Ok(Outcome::Closed("read permission revoked".into())),
		"auth_revoked" => Ok(Outcome::Closed("credential expired".into())),
		other => {
			debug!("ignoring stream event {:?}", other);
			Ok(Outcome::Ignored)
		}
	}
}

fn segments(path: &str) -> Vec<String> {
	path.split('/')
		.filter(|s| !s.is_empty())
		.map(str::to_string)
		.collect()
}

fn set_at(record: &mut Value, path: &[String], value: Value) {
	let Some((last, parents)) = path.split_last() else {
		*record = value;
		return;
	};
	let mut node = record;
	for key in parents {
		if !node.is_object() {
			*node = Value::Object(Map::new());
		}
		let Value::Object(map) = node else {
			return;
		};
		node = map.entry(key.clone()).or_insert(Value::Null);
	}
	if !node.is_object() {
		if value.is_null() {
			return;
		}
		*node = Value::Object(Map::new());
	}
	if let Value::Object(map) = node {
		if value.is_null() {
			map.remove(last);
		} else {
			map.insert(last.clone(), value);
		}
	}
}
