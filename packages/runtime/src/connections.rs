//! Connection lifecycle: prepare, connect, clean and unclean disconnect, and
//! hibernatable websocket reattachment.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock, Weak};

use anyhow::{Context, Result};
use hearth_protocol::{RawRequest, ToClient};
use hearth_util::timestamp;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::conn::{Conn, ConnDriver, ConnKind};
use crate::context::{ActorContext, ConnSetupContext};
use crate::definition::{ActorDefinition, ActorTypes};
use crate::driver::DriverHandle;
use crate::events::EventManager;
use crate::hooks;
use crate::instance::ActorInstance;
use crate::options::RunnerOptions;
use crate::persist::PersistedConn;
use crate::sleep::Counters;
use crate::state::StateManager;

pub struct ConnectionManager<T: ActorTypes> {
	actor_id: String,
	driver: DriverHandle,
	definition: Arc<ActorDefinition<T>>,
	options: RunnerOptions,

	conns: Mutex<HashMap<Uuid, Arc<Conn<T>>>>,
	state_mgr: Arc<StateManager<T>>,
	events: Arc<EventManager<T>>,
	counters: Arc<Counters>,
	instance: OnceLock<Weak<ActorInstance<T>>>,
}

impl<T: ActorTypes> ConnectionManager<T> {
	pub fn new(
		actor_id: String,
		driver: DriverHandle,
		definition: Arc<ActorDefinition<T>>,
		state_mgr: Arc<StateManager<T>>,
		events: Arc<EventManager<T>>,
		counters: Arc<Counters>,
	) -> Arc<Self> {
		let options = definition.options().clone();
		Arc::new(ConnectionManager {
			actor_id,
			driver,
			definition,
			options,
			conns: Mutex::new(HashMap::new()),
			state_mgr,
			events,
			counters,
			instance: OnceLock::new(),
		})
	}

	pub(crate) fn attach(&self, instance: &Arc<ActorInstance<T>>) {
		let _ = self.instance.set(Arc::downgrade(instance));
	}

	pub fn get(&self, conn_id: Uuid) -> Option<Arc<Conn<T>>> {
		self.conns.lock().get(&conn_id).cloned()
	}

	pub fn all(&self) -> Vec<Arc<Conn<T>>> {
		self.conns.lock().values().cloned().collect()
	}

	pub fn count(&self) -> usize {
		self.conns.lock().len()
	}

	/// Rebuilds the in-memory connection set (and the subscription index)
	/// from persisted rows on load. Loaded conns start without a transport.
	pub(crate) fn load_persisted(&self, rows: Vec<PersistedConn<T>>) {
		for row in rows {
			let conn = Conn::new(
				row,
				None,
				self.definition.conn_state_enabled(),
				self.options.clone(),
				Arc::downgrade(&self.state_mgr),
			);
			for event_name in conn.subscriptions() {
				self.events.add_subscription(&event_name, &conn, true);
			}
			self.conns.lock().insert(conn.id(), conn);
		}
	}

	fn find_hibernatable(&self, request_id: &[u8]) -> Option<Arc<Conn<T>>> {
		self.conns
			.lock()
			.values()
			.find(|conn| {
				conn.hibernatable_request_id()
					.is_some_and(|id| id == request_id)
			})
			.cloned()
	}

	/// Builds (or reattaches) a connection for an incoming transport. The
	/// returned conn is not yet in the map; follow up with `connect_conn`
	/// unless it was reattached.
	pub async fn prepare_conn(
		self: &Arc<Self>,
		conn_driver: Arc<dyn ConnDriver>,
		params: Option<T::ConnParams>,
		request: Option<RawRequest>,
	) -> Result<PreparedConn<T>> {
		// Hibernatable reconnect: same transport request id means the same
		// logical connection
		if conn_driver.kind() == ConnKind::WebSocket && conn_driver.hibernatable() {
			if let Some(request_id) = conn_driver.request_id_buf() {
				if let Some(existing) = self.find_hibernatable(&request_id) {
					tracing::debug!(conn_id=?existing.id(), "reattaching hibernatable connection");
					existing.disconnect_driver(Some("reconnecting")).await;
					existing.attach_driver(conn_driver);
					existing.touch();
					self.reset_sleep();
					return Ok(PreparedConn::Reattached(existing));
				}
			}
		}

		let instance = self.instance()?;

		if let Some(hook) = &self.definition.on_before_connect {
			hook(ConnSetupContext::new(
				instance.clone(),
				params.clone(),
				request.clone(),
			))
			.await?;
		}

		let state = if self.definition.conn_state_enabled() {
			if let Some(hook) = &self.definition.create_conn_state {
				let setup = ConnSetupContext::new(instance, params.clone(), request);
				Some(
					hooks::with_timeout(
						"create_conn_state",
						self.options.create_conn_state_timeout(),
						hook(setup),
					)
					.await?,
				)
			} else {
				self.definition.initial_conn_state.clone()
			}
		} else {
			None
		};

		let conn_id = Uuid::new_v4();
		let hibernatable_request_id = if conn_driver.kind() == ConnKind::WebSocket
			&& conn_driver.hibernatable()
		{
			conn_driver.request_id_buf()
		} else {
			None
		};

		let persist = PersistedConn {
			conn_id,
			params,
			state,
			subscriptions: Vec::new(),
			last_seen: timestamp::now(),
			hibernatable_request_id,
		};
		let conn = Conn::new(
			persist,
			Some(conn_driver),
			self.definition.conn_state_enabled(),
			self.options.clone(),
			Arc::downgrade(&self.state_mgr),
		);

		if let Err(err) = self.driver.on_create_conn(&self.actor_id, conn_id).await {
			tracing::warn!(?err, ?conn_id, "driver on_create_conn failed");
		}

		Ok(PreparedConn::Created(conn))
	}

	/// Registers a freshly prepared connection. Insertion happens before any
	/// await so a websocket's open precedes its first message.
	pub async fn connect_conn(self: &Arc<Self>, conn: Arc<Conn<T>>) -> Result<()> {
		self.conns.lock().insert(conn.id(), conn.clone());
		conn.mark_dirty();

		if let Some(hook) = &self.definition.on_connect {
			let instance = self.instance()?;
			let res = hooks::with_timeout(
				"on_connect",
				self.options.on_connect_timeout(),
				hook(ActorContext::new(instance), conn.clone()),
			)
			.await;

			if let Err(err) = res {
				tracing::warn!(?err, conn_id=?conn.id(), "on_connect failed, disconnecting");
				self.disconnect_conn(&conn, Some("onConnect failed")).await?;
				return Err(err);
			}
		}

		self.reset_sleep();

		if conn.kind() == Some(ConnKind::Framed) {
			let init = ToClient::Init {
				actor_id: self.actor_id.clone(),
				connection_id: conn.id(),
			};
			if let Err(err) = conn.send_message(&init).await {
				tracing::warn!(?err, conn_id=?conn.id(), "failed sending init message");
			}
		}

		Ok(())
	}

	/// Clean disconnect: the connection is gone for good. Removes it from
	/// the map and the subscription index, runs `on_disconnect`, and deletes
	/// the persisted row.
	pub async fn disconnect_conn(
		self: &Arc<Self>,
		conn: &Arc<Conn<T>>,
		reason: Option<&str>,
	) -> Result<()> {
		self.conns.lock().remove(&conn.id());
		self.events.remove_conn(conn);
		self.reset_sleep();

		conn.disconnect_driver(reason).await;

		if let Some(hook) = &self.definition.on_disconnect {
			if let Ok(instance) = self.instance() {
				self.counters
					.pending_disconnects
					.fetch_add(1, Ordering::SeqCst);
				if let Err(err) = hook(ActorContext::new(instance), conn.clone()).await {
					tracing::warn!(?err, conn_id=?conn.id(), "on_disconnect failed");
				}
				self.counters
					.pending_disconnects
					.fetch_sub(1, Ordering::SeqCst);
				self.reset_sleep();
			}
		}

		self.driver
			.kv_batch_delete(&self.actor_id, vec![crate::keys::conn(conn.id())])
			.await
			.context("failed deleting persisted connection")?;
		if let Err(err) = self.driver.on_destroy_conn(&self.actor_id, conn.id()).await {
			tracing::warn!(?err, conn_id=?conn.id(), "driver on_destroy_conn failed");
		}

		Ok(())
	}

	/// Unclean disconnect: the transport dropped without a close. Hibernatable
	/// connections stay resident awaiting reattach; everything else is
	/// destroyed.
	pub async fn unclean_disconnected(self: &Arc<Self>, conn: &Arc<Conn<T>>) -> Result<()> {
		if conn.hibernatable_request_id().is_some() {
			let _ = conn.take_driver();
			conn.touch();
			self.reset_sleep();
			Ok(())
		} else {
			self.disconnect_conn(conn, None).await
		}
	}

	/// Closes every live transport without destroying rows. Used when the
	/// actor goes to sleep so hibernatable conns can come back.
	pub(crate) async fn release_transports(&self, reason: &str) {
		let conns = self.all();
		for conn in conns {
			conn.disconnect_driver(Some(reason)).await;
		}
	}

	fn instance(&self) -> Result<Arc<ActorInstance<T>>> {
		self.instance
			.get()
			.and_then(Weak::upgrade)
			.context("instance dropped")
	}

	fn reset_sleep(&self) {
		if let Some(instance) = self.instance.get().and_then(Weak::upgrade) {
			instance.sleep().reset();
		}
	}
}

/// Result of `prepare_conn`.
pub enum PreparedConn<T: ActorTypes> {
	/// A fresh connection; register it with `connect_conn`.
	Created(Arc<Conn<T>>),
	/// An existing hibernatable connection reattached to a new transport.
	Reattached(Arc<Conn<T>>),
}

impl<T: ActorTypes> PreparedConn<T> {
	pub fn conn(&self) -> &Arc<Conn<T>> {
		match self {
			PreparedConn::Created(conn) | PreparedConn::Reattached(conn) => conn,
		}
	}

	pub fn is_reattached(&self) -> bool {
		matches!(self, PreparedConn::Reattached(_))
	}
}

impl<T: ActorTypes> std::fmt::Debug for PreparedConn<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			PreparedConn::Created(_) => write!(f, "PreparedConn::Created(..)"),
			PreparedConn::Reattached(_) => write!(f, "PreparedConn::Reattached(..)"),
		}
	}
}
