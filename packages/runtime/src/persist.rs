//! Persisted representations of the actor, its connections, and the queue.
//!
//! The actor blob lives at `keys::persist_data()`; each connection occupies
//! its own row under `keys::CONN_PREFIX`. A legacy layout embedded the
//! connection list inside the actor blob; it is still read, but writes always
//! use the per-connection rows.

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::definition::ActorTypes;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "")]
pub struct PersistedActor<T: ActorTypes> {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub input: Option<T::Input>,
	pub has_initialized: bool,
	pub state: Option<T::State>,
	pub scheduled_events: Vec<ScheduleEvent>,
}

impl<T: ActorTypes> PersistedActor<T> {
	pub fn new(input: Option<T::Input>) -> Self {
		PersistedActor {
			input,
			has_initialized: false,
			state: None,
			scheduled_events: Vec::new(),
		}
	}
}

/// Read-side shape accepting both layouts. `connections` is only present in
/// legacy blobs.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase", bound = "")]
struct PersistedActorBlob<T: ActorTypes> {
	#[serde(default)]
	input: Option<T::Input>,
	has_initialized: bool,
	state: Option<T::State>,
	#[serde(default)]
	scheduled_events: Vec<ScheduleEvent>,
	#[serde(default)]
	connections: Option<Vec<PersistedConn<T>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEvent {
	pub event_id: String,
	pub timestamp: i64,
	pub action: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub args: Option<Value>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "")]
pub struct PersistedConn<T: ActorTypes> {
	pub conn_id: Uuid,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub params: Option<T::ConnParams>,
	pub state: Option<T::ConnState>,
	#[serde(default)]
	pub subscriptions: Vec<Subscription>,
	pub last_seen: i64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub hibernatable_request_id: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
	pub event_name: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetadata {
	pub next_id: u64,
	pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
	pub id: u64,
	pub name: String,
	pub body: Value,
	pub created_at: i64,
	pub failure_count: u32,
	pub available_at: i64,
	pub in_flight: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub in_flight_at: Option<i64>,
}

pub fn encode_actor<T: ActorTypes>(actor: &PersistedActor<T>) -> Result<Bytes> {
	Ok(Bytes::from(
		serde_json::to_vec(actor).context("failed encoding actor blob")?,
	))
}

/// Decodes an actor blob in either layout. Returns the actor plus any
/// connections embedded by the legacy layout; callers adopt those and write
/// them back as per-connection rows.
pub fn decode_actor<T: ActorTypes>(buf: &[u8]) -> Result<(PersistedActor<T>, Vec<PersistedConn<T>>)> {
	let blob: PersistedActorBlob<T> =
		serde_json::from_slice(buf).context("failed decoding actor blob")?;
	Ok((
		PersistedActor {
			input: blob.input,
			has_initialized: blob.has_initialized,
			state: blob.state,
			scheduled_events: blob.scheduled_events,
		},
		blob.connections.unwrap_or_default(),
	))
}

pub fn encode_conn<T: ActorTypes>(conn: &PersistedConn<T>) -> Result<Bytes> {
	Ok(Bytes::from(
		serde_json::to_vec(conn).context("failed encoding connection row")?,
	))
}

pub fn decode_conn<T: ActorTypes>(buf: &[u8]) -> Result<PersistedConn<T>> {
	serde_json::from_slice(buf).context("failed decoding connection row")
}

pub fn encode_queue_metadata(meta: &QueueMetadata) -> Result<Bytes> {
	Ok(Bytes::from(
		serde_json::to_vec(meta).context("failed encoding queue metadata")?,
	))
}

pub fn decode_queue_metadata(buf: &[u8]) -> Result<QueueMetadata> {
	serde_json::from_slice(buf).context("failed decoding queue metadata")
}

pub fn encode_queue_message(msg: &QueueMessage) -> Result<Bytes> {
	Ok(Bytes::from(
		serde_json::to_vec(msg).context("failed encoding queue message")?,
	))
}

pub fn decode_queue_message(buf: &[u8]) -> Result<QueueMessage> {
	serde_json::from_slice(buf).context("failed decoding queue message")
}
