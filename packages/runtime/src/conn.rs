//! A single client connection attached to an actor.
//!
//! The `Conn` owns the persisted fields; the transport is an attachable
//! driver so hibernatable websockets can drop and reattach their transport
//! without losing the connection. Conns hold no reference to the instance;
//! they talk back through a narrow state-manager handle.

use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use hearth_protocol::ToClient;
use hearth_util::timestamp;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::definition::ActorTypes;
use crate::errors;
use crate::options::RunnerOptions;
use crate::persist::{self, PersistedConn, Subscription};
use crate::state::{StateManager, validate_serializable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
	/// Speaks the framed protocol; receives `Init` and `Event` messages.
	Framed,
	/// A raw HTTP request scoped to one handler invocation.
	HttpRequest,
	/// A raw websocket owned by the `on_websocket` handler.
	WebSocket,
}

/// Transport half of a connection, provided by the host.
#[async_trait]
pub trait ConnDriver: Send + Sync + 'static {
	fn kind(&self) -> ConnKind;

	/// Whether this transport survives unclean disconnects pending
	/// reconnection. Only meaningful for websockets.
	fn hibernatable(&self) -> bool {
		false
	}

	/// Transport-level request id used to match a reconnecting hibernatable
	/// websocket to its previous connection.
	fn request_id_buf(&self) -> Option<Vec<u8>> {
		None
	}

	async fn send_message(&self, buf: Bytes) -> Result<()>;

	async fn disconnect(&self, reason: Option<&str>) -> Result<()>;
}

pub struct Conn<T: ActorTypes> {
	persist: Mutex<PersistedConn<T>>,
	driver: Mutex<Option<Arc<dyn ConnDriver>>>,
	conn_state_enabled: bool,
	options: RunnerOptions,
	state_mgr: Weak<StateManager<T>>,
}

impl<T: ActorTypes> Conn<T> {
	pub(crate) fn new(
		persist: PersistedConn<T>,
		driver: Option<Arc<dyn ConnDriver>>,
		conn_state_enabled: bool,
		options: RunnerOptions,
		state_mgr: Weak<StateManager<T>>,
	) -> Arc<Self> {
		Arc::new(Conn {
			persist: Mutex::new(persist),
			driver: Mutex::new(driver),
			conn_state_enabled,
			options,
			state_mgr,
		})
	}

	pub fn id(&self) -> Uuid {
		self.persist.lock().conn_id
	}

	pub fn params(&self) -> Option<T::ConnParams> {
		self.persist.lock().params.clone()
	}

	pub fn state(&self) -> Result<T::ConnState> {
		if !self.conn_state_enabled {
			return Err(errors::State::ConnStateNotEnabled.into());
		}
		self.persist
			.lock()
			.state
			.clone()
			.ok_or_else(|| errors::State::ConnStateNotEnabled.into())
	}

	/// Commits a connection-state mutation; same copy-validate-swap contract
	/// as actor state.
	pub fn update_state<F, R>(&self, f: F) -> Result<R>
	where
		F: FnOnce(&mut T::ConnState) -> R,
	{
		if !self.conn_state_enabled {
			return Err(errors::State::ConnStateNotEnabled.into());
		}

		let result = {
			let mut persist = self.persist.lock();
			let state = persist
				.state
				.as_mut()
				.ok_or(errors::State::ConnStateNotEnabled)?;

			let mut next = state.clone();
			let result = f(&mut next);
			validate_serializable(&next, "conn.state")?;

			*state = next;
			result
		};

		self.mark_dirty();
		Ok(result)
	}

	pub fn last_seen(&self) -> i64 {
		self.persist.lock().last_seen
	}

	pub fn subscriptions(&self) -> Vec<String> {
		self.persist
			.lock()
			.subscriptions
			.iter()
			.map(|sub| sub.event_name.clone())
			.collect()
	}

	pub fn hibernatable_request_id(&self) -> Option<Vec<u8>> {
		self.persist.lock().hibernatable_request_id.clone()
	}

	pub fn kind(&self) -> Option<ConnKind> {
		self.driver.lock().as_ref().map(|driver| driver.kind())
	}

	pub fn is_connected(&self) -> bool {
		self.driver.lock().is_some()
	}

	// MARK: Internal

	pub(crate) fn mark_dirty(&self) {
		if let Some(state_mgr) = self.state_mgr.upgrade() {
			state_mgr.mark_conn_dirty(self.id());
		}
	}

	pub(crate) fn touch(&self) {
		self.persist.lock().last_seen = timestamp::now();
		self.mark_dirty();
	}

	pub(crate) fn encode_persist(&self) -> Result<Bytes> {
		let persist = self.persist.lock();
		persist::encode_conn(&persist)
	}

	pub(crate) fn has_subscription(&self, event_name: &str) -> bool {
		self.persist
			.lock()
			.subscriptions
			.iter()
			.any(|sub| sub.event_name == event_name)
	}

	pub(crate) fn add_persisted_subscription(&self, event_name: &str) -> bool {
		let mut persist = self.persist.lock();
		if persist
			.subscriptions
			.iter()
			.any(|sub| sub.event_name == event_name)
		{
			return false;
		}
		persist.subscriptions.push(Subscription {
			event_name: event_name.to_string(),
		});
		true
	}

	pub(crate) fn remove_persisted_subscription(&self, event_name: &str) -> bool {
		let mut persist = self.persist.lock();
		let before = persist.subscriptions.len();
		persist.subscriptions.retain(|sub| sub.event_name != event_name);
		persist.subscriptions.len() != before
	}

	pub(crate) fn attach_driver(&self, driver: Arc<dyn ConnDriver>) {
		*self.driver.lock() = Some(driver);
	}

	pub(crate) fn take_driver(&self) -> Option<Arc<dyn ConnDriver>> {
		self.driver.lock().take()
	}

	pub(crate) fn driver(&self) -> Option<Arc<dyn ConnDriver>> {
		self.driver.lock().clone()
	}

	// MARK: Sending

	/// Sends a framed message, enforcing the outgoing size limit.
	pub async fn send_message(&self, msg: &ToClient) -> Result<()> {
		let buf = hearth_protocol::encode_to_client(msg, self.options.max_outgoing_message_size())
			.map_err(|err| match err {
				hearth_protocol::ProtocolError::MessageTooLong { size, limit } => {
					anyhow::Error::from(errors::Message::OutgoingMessageTooLong { size, limit })
				}
				other => other.into(),
			})?;
		self.send_raw(buf).await
	}

	pub(crate) async fn send_raw(&self, buf: Bytes) -> Result<()> {
		let driver = self
			.driver()
			.context("connection has no attached transport")?;
		driver.send_message(buf).await
	}

	pub(crate) async fn disconnect_driver(&self, reason: Option<&str>) {
		if let Some(driver) = self.take_driver() {
			if let Err(err) = driver.disconnect(reason).await {
				tracing::debug!(?err, conn_id=?self.id(), "transport disconnect failed");
			}
		}
	}
}
