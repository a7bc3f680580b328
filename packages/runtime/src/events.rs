//! Event subscription index and broadcast fan-out.
//!
//! The index maps event names to subscriber connection ids. It is derived
//! state: the authoritative subscription lists live on each persisted
//! connection and the index is rebuilt from them on load.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use anyhow::Result;
use hearth_protocol::ToClient;
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::conn::Conn;
use crate::connections::ConnectionManager;
use crate::definition::ActorTypes;
use crate::errors;
use crate::options::RunnerOptions;
use crate::state::StateManager;

pub struct EventManager<T: ActorTypes> {
	options: RunnerOptions,
	index: Mutex<HashMap<String, HashSet<Uuid>>>,
	state_mgr: Weak<StateManager<T>>,
	conns: OnceLock<Weak<ConnectionManager<T>>>,
}

impl<T: ActorTypes> EventManager<T> {
	pub fn new(options: RunnerOptions, state_mgr: &Arc<StateManager<T>>) -> Arc<Self> {
		Arc::new(EventManager {
			options,
			index: Mutex::new(HashMap::new()),
			state_mgr: Arc::downgrade(state_mgr),
			conns: OnceLock::new(),
		})
	}

	pub(crate) fn attach(&self, conns: &Arc<ConnectionManager<T>>) {
		let _ = self.conns.set(Arc::downgrade(conns));
	}

	/// Idempotent. `from_persist` marks index rebuilds on load, which must
	/// not touch the persisted list again.
	pub fn add_subscription(&self, event_name: &str, conn: &Arc<Conn<T>>, from_persist: bool) {
		{
			let mut index = self.index.lock();
			index
				.entry(event_name.to_string())
				.or_default()
				.insert(conn.id());
		}

		if !from_persist && conn.add_persisted_subscription(event_name) {
			conn.mark_dirty();
			self.request_immediate_save();
		}
	}

	pub fn remove_subscription(&self, event_name: &str, conn: &Arc<Conn<T>>) {
		{
			let mut index = self.index.lock();
			if let Some(subscribers) = index.get_mut(event_name) {
				subscribers.remove(&conn.id());
				if subscribers.is_empty() {
					index.remove(event_name);
				}
			}
		}

		if conn.remove_persisted_subscription(event_name) {
			conn.mark_dirty();
			self.request_immediate_save();
		}
	}

	/// Drops every subscription of a disconnecting connection from the index.
	pub(crate) fn remove_conn(&self, conn: &Arc<Conn<T>>) {
		let mut index = self.index.lock();
		for event_name in conn.subscriptions() {
			if let Some(subscribers) = index.get_mut(&event_name) {
				subscribers.remove(&conn.id());
				if subscribers.is_empty() {
					index.remove(&event_name);
				}
			}
		}
	}

	pub fn subscriber_count(&self, event_name: &str) -> usize {
		self.index
			.lock()
			.get(event_name)
			.map(|subscribers| subscribers.len())
			.unwrap_or(0)
	}

	pub fn subscribed_events(&self) -> Vec<String> {
		self.index.lock().keys().cloned().collect()
	}

	/// Sends an `Event` message to every subscriber. Per-connection send
	/// failures are logged and skipped; an oversized message fails the whole
	/// broadcast.
	pub async fn broadcast(&self, name: &str, args: Vec<Value>) -> Result<()> {
		let subscriber_ids: Vec<Uuid> = {
			let index = self.index.lock();
			match index.get(name) {
				Some(subscribers) => subscribers.iter().copied().collect(),
				None => return Ok(()),
			}
		};

		let Some(conns) = self.conns.get().and_then(Weak::upgrade) else {
			return Ok(());
		};

		let msg = ToClient::Event {
			name: name.to_string(),
			args,
		};
		let buf = hearth_protocol::encode_to_client(&msg, self.options.max_outgoing_message_size())
			.map_err(|err| match err {
				hearth_protocol::ProtocolError::MessageTooLong { size, limit } => {
					anyhow::Error::from(errors::Message::OutgoingMessageTooLong { size, limit })
				}
				other => other.into(),
			})?;

		for conn_id in subscriber_ids {
			let Some(conn) = conns.get(conn_id) else {
				continue;
			};
			if !conn.is_connected() {
				// Hibernating; no transport to deliver to
				continue;
			}
			if let Err(err) = conn.send_raw(buf.clone()).await {
				tracing::warn!(?err, ?conn_id, event=%name, "failed sending event to subscriber");
			}
		}

		Ok(())
	}

	fn request_immediate_save(&self) {
		if let Some(state_mgr) = self.state_mgr.upgrade() {
			state_mgr.schedule_save(Some(Duration::ZERO));
		}
	}
}
