//! Capability surfaces handed to user handlers.
//!
//! Contexts are cheap clones of `Arc`s; one is created per handler
//! invocation. Connections never appear inside a context by back-pointer;
//! the action context carries the calling connection explicitly.

use std::any::Any;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use hearth_protocol::RawRequest;
use serde_json::Value;

use crate::conn::Conn;
use crate::definition::ActorTypes;
use crate::errors;
use crate::instance::ActorInstance;
use crate::kv::ActorKv;
use crate::persist::ScheduleEvent;
use crate::queue::QueueManager;

/// Identity of one actor instance.
#[derive(Debug, Clone)]
pub struct ActorIdentity {
	pub actor_id: String,
	pub name: String,
	pub key: Vec<String>,
	pub region: Option<String>,
}

pub struct ActorContext<T: ActorTypes> {
	instance: Arc<ActorInstance<T>>,
}

impl<T: ActorTypes> Clone for ActorContext<T> {
	fn clone(&self) -> Self {
		ActorContext {
			instance: self.instance.clone(),
		}
	}
}

impl<T: ActorTypes> ActorContext<T> {
	pub(crate) fn new(instance: Arc<ActorInstance<T>>) -> Self {
		ActorContext { instance }
	}

	pub fn actor_id(&self) -> &str {
		&self.instance.identity().actor_id
	}

	pub fn name(&self) -> &str {
		&self.instance.identity().name
	}

	pub fn key(&self) -> &[String] {
		&self.instance.identity().key
	}

	pub fn region(&self) -> Option<&str> {
		self.instance.identity().region.as_deref()
	}

	// MARK: State

	pub fn state(&self) -> Result<T::State> {
		self.instance.state_mgr().state()
	}

	pub fn update_state<F, R>(&self, f: F) -> Result<R>
	where
		F: FnOnce(&mut T::State) -> R,
	{
		self.instance.state_mgr().update_state(f)
	}

	pub fn input(&self) -> Option<T::Input> {
		self.instance.state_mgr().input()
	}

	pub fn vars(&self) -> Result<Arc<T::Vars>> {
		self.instance.vars()
	}

	pub async fn save_state(&self, immediate: bool) -> Result<()> {
		self.instance.state_mgr().save_state(immediate).await
	}

	// MARK: Events

	pub async fn broadcast(&self, name: &str, args: Vec<Value>) -> Result<()> {
		self.instance.broadcast(name, args).await
	}

	// MARK: Schedule

	pub async fn schedule_at(
		&self,
		timestamp: i64,
		action: &str,
		args: Option<Value>,
	) -> Result<ScheduleEvent> {
		self.instance.schedule_event(timestamp, action, args).await
	}

	pub async fn schedule_after(
		&self,
		delay: Duration,
		action: &str,
		args: Option<Value>,
	) -> Result<ScheduleEvent> {
		let timestamp = hearth_util::timestamp::now() + delay.as_millis() as i64;
		self.instance.schedule_event(timestamp, action, args).await
	}

	pub async fn cancel_event(&self, event_id: &str) -> Result<bool> {
		self.instance.schedule().cancel(event_id).await
	}

	// MARK: Queue

	pub fn queue(&self) -> Arc<QueueManager> {
		self.instance.queue()
	}

	// MARK: Storage

	pub fn kv(&self) -> ActorKv {
		self.instance.kv()
	}

	pub fn database(&self) -> Result<Arc<dyn Any + Send + Sync>> {
		self.instance
			.driver()
			.get_database(self.actor_id())
			.ok_or_else(|| errors::State::DatabaseNotEnabled.into())
	}

	// MARK: Connections

	pub fn conns(&self) -> Vec<Arc<Conn<T>>> {
		self.instance.conns().all()
	}

	/// Keeps the actor awake until `fut` settles. Errors are logged.
	pub fn wait_until<F>(&self, fut: F)
	where
		F: Future<Output = Result<()>> + Send + 'static,
	{
		self.instance.wait_until(fut);
	}
}

pub struct ActionContext<T: ActorTypes> {
	ctx: ActorContext<T>,
	conn: Option<Arc<Conn<T>>>,
}

impl<T: ActorTypes> Clone for ActionContext<T> {
	fn clone(&self) -> Self {
		ActionContext {
			ctx: self.ctx.clone(),
			conn: self.conn.clone(),
		}
	}
}

impl<T: ActorTypes> ActionContext<T> {
	pub(crate) fn new(instance: Arc<ActorInstance<T>>, conn: Option<Arc<Conn<T>>>) -> Self {
		ActionContext {
			ctx: ActorContext::new(instance),
			conn,
		}
	}

	/// The connection this invocation arrived on, if any.
	pub fn conn(&self) -> Option<&Arc<Conn<T>>> {
		self.conn.as_ref()
	}
}

impl<T: ActorTypes> Deref for ActionContext<T> {
	type Target = ActorContext<T>;

	fn deref(&self) -> &Self::Target {
		&self.ctx
	}
}

/// Context for `create_state` and `create_vars`: the actor identity plus the
/// creation input. The instance is not ready yet, so no runtime capabilities
/// are exposed.
pub struct CreateContext<T: ActorTypes> {
	identity: ActorIdentity,
	input: Option<T::Input>,
}

impl<T: ActorTypes> Clone for CreateContext<T> {
	fn clone(&self) -> Self {
		CreateContext {
			identity: self.identity.clone(),
			input: self.input.clone(),
		}
	}
}

impl<T: ActorTypes> CreateContext<T> {
	pub(crate) fn new(identity: ActorIdentity, input: Option<T::Input>) -> Self {
		CreateContext { identity, input }
	}

	pub fn actor_id(&self) -> &str {
		&self.identity.actor_id
	}

	pub fn name(&self) -> &str {
		&self.identity.name
	}

	pub fn key(&self) -> &[String] {
		&self.identity.key
	}

	pub fn region(&self) -> Option<&str> {
		self.identity.region.as_deref()
	}

	pub fn input(&self) -> Option<&T::Input> {
		self.input.as_ref()
	}
}

/// Context for `on_before_connect` and `create_conn_state`.
pub struct ConnSetupContext<T: ActorTypes> {
	ctx: ActorContext<T>,
	params: Option<T::ConnParams>,
	request: Option<RawRequest>,
}

impl<T: ActorTypes> Clone for ConnSetupContext<T> {
	fn clone(&self) -> Self {
		ConnSetupContext {
			ctx: self.ctx.clone(),
			params: self.params.clone(),
			request: self.request.clone(),
		}
	}
}

impl<T: ActorTypes> ConnSetupContext<T> {
	pub(crate) fn new(
		instance: Arc<ActorInstance<T>>,
		params: Option<T::ConnParams>,
		request: Option<RawRequest>,
	) -> Self {
		ConnSetupContext {
			ctx: ActorContext::new(instance),
			params,
			request,
		}
	}

	pub fn params(&self) -> Option<&T::ConnParams> {
		self.params.as_ref()
	}

	pub fn request(&self) -> Option<&RawRequest> {
		self.request.as_ref()
	}
}

impl<T: ActorTypes> Deref for ConnSetupContext<T> {
	type Target = ActorContext<T>;

	fn deref(&self) -> &Self::Target {
		&self.ctx
	}
}
