//! The per-actor orchestrator.
//!
//! Owns the lifecycle `Loading → Ready → Started → Stopping → Stopped`,
//! dispatches actions and raw handlers, supervises the optional `run`
//! handler, and drives orderly teardown for sleep and destroy.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock, Weak};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hearth_protocol::{RawRequest, RawResponse, ToClient, ToServer};
use hearth_util::timestamp;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::conn::Conn;
use crate::connections::ConnectionManager;
use crate::context::{ActionContext, ActorContext, ActorIdentity, CreateContext};
use crate::definition::{ActorDefinition, ActorTypes};
use crate::driver::{ActorCallbacks, DriverHandle, StopIntent};
use crate::errors;
use crate::events::EventManager;
use crate::hooks;
use crate::inspector::Inspector;
use crate::keys;
use crate::kv::ActorKv;
use crate::options::RunnerOptions;
use crate::persist::{self, PersistedActor, ScheduleEvent};
use crate::queue::QueueManager;
use crate::schedule::ScheduleManager;
use crate::sleep::{Counters, SleepArbiter};
use crate::state::StateManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
	Loading,
	Ready,
	Started,
	Stopping,
	Stopped,
}

pub struct ActorInstance<T: ActorTypes> {
	identity: ActorIdentity,
	definition: Arc<ActorDefinition<T>>,
	driver: DriverHandle,
	options: RunnerOptions,

	status_tx: watch::Sender<InstanceStatus>,
	state_mgr: Arc<StateManager<T>>,
	conns: Arc<ConnectionManager<T>>,
	events: Arc<EventManager<T>>,
	schedule: Arc<ScheduleManager<T>>,
	queue: Arc<QueueManager>,
	sleep: Arc<SleepArbiter>,
	counters: Arc<Counters>,

	vars: OnceLock<Arc<T::Vars>>,
	abort: CancellationToken,
	run_task: Mutex<Option<JoinHandle<()>>>,
	start_lock: tokio::sync::Mutex<()>,
	self_ref: OnceLock<Weak<ActorInstance<T>>>,
}

impl<T: ActorTypes> ActorInstance<T> {
	pub fn new(
		driver: DriverHandle,
		definition: Arc<ActorDefinition<T>>,
		actor_id: impl Into<String>,
		name: impl Into<String>,
		key: Vec<String>,
		region: Option<String>,
	) -> Arc<Self> {
		let identity = ActorIdentity {
			actor_id: actor_id.into(),
			name: name.into(),
			key,
			region,
		};
		let options = definition.options().clone();
		let counters = Arc::new(Counters::default());
		let abort = CancellationToken::new();
		let (status_tx, _) = watch::channel(InstanceStatus::Loading);

		let state_mgr = StateManager::new(
			identity.actor_id.clone(),
			driver.clone(),
			definition.clone(),
			PersistedActor::new(None),
		);
		let events = EventManager::new(options.clone(), &state_mgr);
		let conns = ConnectionManager::new(
			identity.actor_id.clone(),
			driver.clone(),
			definition.clone(),
			state_mgr.clone(),
			events.clone(),
			counters.clone(),
		);
		let schedule = ScheduleManager::new(
			identity.actor_id.clone(),
			driver.clone(),
			state_mgr.clone(),
		);
		let queue = QueueManager::new(
			identity.actor_id.clone(),
			driver.clone(),
			options.clone(),
			counters.clone(),
			abort.clone(),
		);
		let sleep = SleepArbiter::new(
			identity.actor_id.clone(),
			driver.clone(),
			options.clone(),
			counters.clone(),
		);

		let instance = Arc::new(ActorInstance {
			identity,
			definition,
			driver,
			options,
			status_tx,
			state_mgr: state_mgr.clone(),
			conns: conns.clone(),
			events: events.clone(),
			schedule: schedule.clone(),
			queue: queue.clone(),
			sleep: sleep.clone(),
			counters,
			vars: OnceLock::new(),
			abort,
			run_task: Mutex::new(None),
			start_lock: tokio::sync::Mutex::new(()),
			self_ref: OnceLock::new(),
		});
		let _ = instance.self_ref.set(Arc::downgrade(&instance));

		state_mgr.attach(&conns, &instance);
		events.attach(&conns);
		conns.attach(&instance);
		schedule.attach(&instance);

		{
			let weak = Arc::downgrade(&instance);
			queue.set_sleep_hook(Box::new(move || {
				if let Some(instance) = weak.upgrade() {
					instance.sleep.reset();
				}
			}));
		}
		{
			let weak_conns = Arc::downgrade(&conns);
			let status_rx = instance.status_tx.subscribe();
			sleep.wire(
				Box::new(move || {
					weak_conns.upgrade().map(|conns| conns.count()).unwrap_or(0)
				}),
				Box::new(move || *status_rx.borrow()),
			);
		}

		instance
	}

	fn arc(&self) -> Result<Arc<Self>> {
		self.self_ref
			.get()
			.and_then(Weak::upgrade)
			.context("instance dropped")
	}

	// MARK: Accessors

	pub fn identity(&self) -> &ActorIdentity {
		&self.identity
	}

	pub fn status(&self) -> InstanceStatus {
		*self.status_tx.borrow()
	}

	pub fn status_rx(&self) -> watch::Receiver<InstanceStatus> {
		self.status_tx.subscribe()
	}

	fn set_status(&self, status: InstanceStatus) {
		self.status_tx.send_replace(status);
	}

	pub fn state_mgr(&self) -> &Arc<StateManager<T>> {
		&self.state_mgr
	}

	pub fn conns(&self) -> &Arc<ConnectionManager<T>> {
		&self.conns
	}

	pub fn events(&self) -> &Arc<EventManager<T>> {
		&self.events
	}

	pub fn schedule(&self) -> &Arc<ScheduleManager<T>> {
		&self.schedule
	}

	pub fn queue(&self) -> Arc<QueueManager> {
		self.queue.clone()
	}

	pub fn sleep(&self) -> &Arc<SleepArbiter> {
		&self.sleep
	}

	pub fn driver(&self) -> &DriverHandle {
		&self.driver
	}

	pub fn abort_token(&self) -> CancellationToken {
		self.abort.clone()
	}

	pub fn kv(&self) -> ActorKv {
		ActorKv::new(
			self.identity.actor_id.clone(),
			self.driver.clone(),
			self.options.clone(),
		)
	}

	pub fn inspector(&self) -> Result<Inspector<T>> {
		Ok(Inspector::new(self.arc()?))
	}

	pub fn vars(&self) -> Result<Arc<T::Vars>> {
		if !self.definition.vars_enabled() {
			return Err(errors::State::VarsNotEnabled.into());
		}
		self.vars
			.get()
			.cloned()
			.ok_or_else(|| errors::Actor::NotReady.into())
	}

	fn ensure_ready(&self) -> Result<()> {
		match self.status() {
			InstanceStatus::Loading => Err(errors::Actor::NotReady.into()),
			InstanceStatus::Stopping | InstanceStatus::Stopped => {
				Err(errors::Actor::Stopping.into())
			}
			InstanceStatus::Ready | InstanceStatus::Started => Ok(()),
		}
	}

	// MARK: Start

	/// Loads persisted data, initializes state on first create, and brings
	/// the instance to `Started`. Idempotent until `Ready`.
	#[tracing::instrument(skip_all, fields(actor_id=%self.identity.actor_id))]
	pub async fn start(&self, input: Option<T::Input>) -> Result<()> {
		let _guard = self.start_lock.lock().await;
		if self.status() != InstanceStatus::Loading {
			return Ok(());
		}

		tracing::debug!(name=%self.identity.name, "loading actor");

		// Actor blob. The legacy layout embeds connections; adopt them and
		// write back per-connection rows.
		let blob = self
			.driver
			.kv_batch_get(&self.identity.actor_id, vec![keys::persist_data()])
			.await?
			.pop()
			.flatten();
		let mut legacy_conns = Vec::new();
		match blob {
			Some(buf) => {
				let (persisted, embedded) = persist::decode_actor::<T>(&buf)?;
				legacy_conns = embedded;
				self.state_mgr.replace_persisted(persisted);
			}
			None => {
				self.state_mgr
					.replace_persisted(PersistedActor::new(input.clone()));
			}
		}

		// First create
		if !self.state_mgr.has_initialized() {
			let state = if self.definition.state_enabled() {
				if let Some(hook) = &self.definition.create_state {
					let ctx = CreateContext::new(self.identity.clone(), input.clone());
					Some(
						hooks::with_timeout(
							"create_state",
							self.options.create_state_timeout(),
							hook(ctx),
						)
						.await?,
					)
				} else {
					self.definition.initial_state.clone()
				}
			} else {
				None
			};
			self.state_mgr.initialize(state);

			if let Some(hook) = &self.definition.on_create {
				hook(ActorContext::new(self.arc()?)).await?;
			}

			self.state_mgr.mark_actor_dirty();
			self.state_mgr.save_state(true).await?;
		}

		// Connections: per-connection rows are authoritative; legacy embedded
		// conns are adopted and marked dirty so the next flush migrates them
		let rows = self
			.driver
			.kv_list_prefix(&self.identity.actor_id, keys::conn_prefix())
			.await?;
		let mut conn_rows = Vec::new();
		for (key, value) in rows {
			match persist::decode_conn::<T>(&value) {
				Ok(row) => conn_rows.push(row),
				Err(err) => {
					tracing::error!(?err, ?key, "dropping undecodable connection row");
				}
			}
		}
		let mut migrated: Vec<Uuid> = Vec::new();
		for legacy in legacy_conns {
			if !conn_rows.iter().any(|row| row.conn_id == legacy.conn_id) {
				migrated.push(legacy.conn_id);
				conn_rows.push(legacy);
			}
		}
		self.conns.load_persisted(conn_rows);
		if !migrated.is_empty() {
			for conn_id in migrated {
				self.state_mgr.mark_conn_dirty(conn_id);
			}
			// Rewrite the blob without the embedded list
			self.state_mgr.mark_actor_dirty();
		}

		self.queue.init().await?;

		if let Some(hook) = &self.definition.create_vars {
			let ctx = CreateContext::new(self.identity.clone(), input.clone());
			let vars = hooks::with_timeout(
				"create_vars",
				self.options.create_vars_timeout(),
				hook(ctx),
			)
			.await?;
			let _ = self.vars.set(Arc::new(vars));
		}

		self.set_status(InstanceStatus::Ready);

		if let Some(hook) = &self.definition.on_wake {
			hook(ActorContext::new(self.arc()?)).await?;
		}

		self.schedule.init_alarm().await?;
		self.driver
			.on_before_actor_start(&self.identity.actor_id)
			.await?;

		self.set_status(InstanceStatus::Started);
		self.sleep.reset();

		if let Some(run) = &self.definition.run {
			self.counters.run_active.store(true, Ordering::SeqCst);
			let run = run.clone();
			let this = self.arc()?;
			let handle = tokio::spawn(async move {
				let res = run(ActorContext::new(this.clone())).await;
				this.counters.run_active.store(false, Ordering::SeqCst);
				this.sleep.reset();

				// This task IS the run task; clear the handle so the stop
				// path doesn't join us while we initiate it
				*this.run_task.lock() = None;

				// A spontaneous exit is a crash; exiting during stop is the
				// expected join
				if !matches!(
					this.status(),
					InstanceStatus::Stopping | InstanceStatus::Stopped
				) {
					match res {
						Ok(()) => {
							tracing::error!("run handler exited unexpectedly, destroying actor")
						}
						Err(err) => {
							tracing::error!(?err, "run handler failed, destroying actor")
						}
					}
					if let Err(err) = this.on_stop(StopIntent::Destroy).await {
						tracing::error!(?err, "failed destroying actor after run exit");
					}
				}
			});
			*self.run_task.lock() = Some(handle);
		}

		tracing::debug!("actor started");
		Ok(())
	}

	// MARK: Actions

	/// Resolves and runs an action handler under the action timeout, routing
	/// the output through `on_before_action_response`. Every exit path
	/// triggers a throttled persistence write.
	pub async fn execute_action(
		&self,
		conn: Option<Arc<Conn<T>>>,
		name: &str,
		args: Vec<Value>,
	) -> Result<Value> {
		self.ensure_ready()?;

		let Some(handler) = self.definition.actions.get(name) else {
			return Err(errors::Action::NotFound {
				name: name.to_string(),
			}
			.into());
		};

		let ctx = ActionContext::new(self.arc()?, conn);
		let res = tokio::time::timeout(self.options.action_timeout(), handler(ctx, args)).await;

		let result = match res {
			Ok(Ok(output)) => {
				if let Some(hook) = &self.definition.on_before_action_response {
					match hook(ActorContext::new(self.arc()?), name.to_string(), output.clone())
						.await
					{
						Ok(mapped) => Ok(mapped),
						Err(err) => {
							tracing::warn!(?err, action=%name, "on_before_action_response failed");
							Ok(output)
						}
					}
				} else {
					Ok(output)
				}
			}
			Ok(Err(err)) => Err(err),
			Err(_) => Err(errors::Action::TimedOut.into()),
		};

		self.state_mgr.schedule_save(None);
		self.sleep.reset();
		result
	}

	/// Dispatches one framed message from a connection.
	pub async fn process_message(&self, msg: ToServer, conn: &Arc<Conn<T>>) -> Result<()> {
		match msg {
			ToServer::ActionRequest { id, name, args } => {
				match self.execute_action(Some(conn.clone()), &name, args).await {
					Ok(output) => {
						conn.send_message(&ToClient::ActionResponse { id, output })
							.await?;
					}
					Err(err) => {
						tracing::debug!(?err, action=%name, "action failed");
						conn.send_message(&ToClient::Error {
							error: errors::to_payload(&err),
							action_id: Some(id),
						})
						.await?;
					}
				}
			}
			ToServer::SubscriptionRequest {
				event_name,
				subscribe,
			} => {
				if subscribe {
					self.events.add_subscription(&event_name, conn, false);
				} else {
					self.events.remove_subscription(&event_name, conn);
				}
			}
		}
		Ok(())
	}

	pub async fn broadcast(&self, name: &str, args: Vec<Value>) -> Result<()> {
		self.ensure_ready()?;
		self.events.broadcast(name, args).await
	}

	pub async fn schedule_event(
		&self,
		timestamp: i64,
		action: &str,
		args: Option<Value>,
	) -> Result<ScheduleEvent> {
		self.schedule.schedule_at(timestamp, action, args).await
	}

	// MARK: Raw handlers

	pub async fn handle_raw_request(
		&self,
		conn: Option<Arc<Conn<T>>>,
		request: RawRequest,
	) -> Result<RawResponse> {
		self.ensure_ready()?;

		let Some(handler) = &self.definition.on_request else {
			return Err(errors::Request::HandlerNotDefined.into());
		};

		self.counters.http_requests.fetch_add(1, Ordering::SeqCst);
		self.sleep.reset();

		let ctx = ActionContext::new(self.arc()?, conn);
		let res = handler(ctx, request).await;

		self.counters.http_requests.fetch_sub(1, Ordering::SeqCst);
		self.state_mgr.schedule_save(None);
		self.sleep.reset();

		match res {
			Ok(Some(response)) => Ok(response),
			Ok(None) => Err(errors::Request::InvalidHandlerResponse.into()),
			Err(err) => Err(err),
		}
	}

	/// Runs the websocket handler. No awaits happen before the handler is
	/// invoked so a socket's open is observed before its first message.
	pub async fn handle_raw_websocket(
		&self,
		conn: Arc<Conn<T>>,
		request: Option<RawRequest>,
	) -> Result<()> {
		self.ensure_ready()?;

		let Some(handler) = &self.definition.on_websocket else {
			return Err(errors::Request::FetchHandlerNotDefined.into());
		};

		let ctx = ActionContext::new(self.arc()?, Some(conn));
		let fut = handler(ctx, request);
		let res = fut.await;

		self.state_mgr.schedule_save(None);
		self.sleep.reset();
		res
	}

	// MARK: Keep-awake

	/// Holds the actor awake while `fut` runs; the sleep timer resets on both
	/// edges.
	pub fn schedule_keep_awake<F>(&self, fut: F) -> impl Future<Output = F::Output> + Send
	where
		F: Future + Send,
		F::Output: Send,
	{
		let counters = self.counters.clone();
		let sleep = self.sleep.clone();
		counters.keep_awake.fetch_add(1, Ordering::SeqCst);
		sleep.reset();

		async move {
			let out = fut.await;
			counters.keep_awake.fetch_sub(1, Ordering::SeqCst);
			sleep.reset();
			out
		}
	}

	/// Fire-and-forget background work under the keep-awake counter, bounded
	/// by `wait_until_timeout`. Failures are logged.
	pub fn wait_until<F>(&self, fut: F)
	where
		F: Future<Output = Result<()>> + Send + 'static,
	{
		let deadline = self.options.wait_until_timeout();
		let wrapped = self.schedule_keep_awake(async move {
			match tokio::time::timeout(deadline, fut).await {
				Ok(Ok(())) => {}
				Ok(Err(err)) => tracing::warn!(?err, "background task failed"),
				Err(_) => tracing::warn!("background task timed out"),
			}
		});
		tokio::spawn(wrapped);
	}

	// MARK: Alarm

	/// Drains due scheduled events and runs their actions. Safe to call
	/// repeatedly; events only run once.
	pub async fn on_alarm(&self) -> Result<()> {
		if !matches!(
			self.status(),
			InstanceStatus::Ready | InstanceStatus::Started
		) {
			return Ok(());
		}

		let now = timestamp::now();
		let due = self.schedule.drain_due(now).await?;
		if due.is_empty() {
			return Ok(());
		}

		let arc = self.arc()?;
		for event in due {
			let Some(handler) = self.definition.actions.get(&event.action) else {
				tracing::error!(
					action=%event.action,
					event_id=%event.event_id,
					"scheduled action not found"
				);
				continue;
			};
			let args = match event.args {
				Some(Value::Array(items)) => items,
				Some(value) => vec![value],
				None => Vec::new(),
			};
			if let Err(err) = handler(ActionContext::new(arc.clone(), None), args).await {
				tracing::error!(?err, action=%event.action, event_id=%event.event_id, "scheduled event failed");
			}
		}

		self.state_mgr.schedule_save(None);
		self.sleep.reset();
		Ok(())
	}

	// MARK: Stop

	/// Orderly teardown for sleep or destroy.
	#[tracing::instrument(skip_all, fields(actor_id=%self.identity.actor_id, intent=%intent.as_str()))]
	pub async fn on_stop(&self, intent: StopIntent) -> Result<()> {
		if matches!(
			self.status(),
			InstanceStatus::Stopping | InstanceStatus::Stopped
		) {
			return Ok(());
		}
		self.set_status(InstanceStatus::Stopping);

		tracing::debug!("stopping actor");
		self.abort.cancel();
		self.sleep.stop();

		// Join the run handler; exceeding the deadline is logged, not fatal
		let run_task = self.run_task.lock().take();
		if let Some(handle) = run_task {
			match tokio::time::timeout(self.options.run_stop_timeout(), handle).await {
				Ok(Ok(())) => {}
				Ok(Err(err)) => tracing::warn!(?err, "run task join failed"),
				Err(_) => tracing::warn!("run handler did not stop within run_stop_timeout"),
			}
		}

		let hook_res = match intent {
			StopIntent::Sleep => {
				if let Some(hook) = &self.definition.on_sleep {
					hooks::with_timeout(
						"on_sleep",
						self.options.on_sleep_timeout(),
						hook(ActorContext::new(self.arc()?)),
					)
					.await
				} else {
					Ok(())
				}
			}
			StopIntent::Destroy => {
				if let Some(hook) = &self.definition.on_destroy {
					hooks::with_timeout(
						"on_destroy",
						self.options.on_destroy_timeout(),
						hook(ActorContext::new(self.arc()?)),
					)
					.await
				} else {
					Ok(())
				}
			}
		};
		if let Err(err) = &hook_res {
			tracing::error!(?err, "stop hook failed");
		}

		// Flush whatever the hook left dirty
		let flush_res = self.state_mgr.save_state(true).await;
		if let Err(err) = &flush_res {
			tracing::error!(?err, "final state flush failed");
		}
		self.state_mgr.stop();

		let mut teardown_res = Ok(());
		match intent {
			StopIntent::Sleep => {
				// Rows stay; hibernatable conns reattach on the next wake
				self.conns.release_transports("sleep").await;
			}
			StopIntent::Destroy => {
				for conn in self.conns.all() {
					if let Err(err) = self.conns.disconnect_conn(&conn, Some("destroy")).await {
						tracing::warn!(?err, conn_id=?conn.id(), "failed disconnecting during destroy");
					}
				}
				teardown_res = self.driver.start_destroy(&self.identity.actor_id).await;
				if let Err(err) = &teardown_res {
					tracing::error!(?err, "start_destroy failed");
				}
			}
		}

		self.set_status(InstanceStatus::Stopped);
		tracing::debug!("actor stopped");

		hook_res.and(flush_res).and(teardown_res)
	}
}

#[async_trait]
impl<T: ActorTypes> ActorCallbacks for ActorInstance<T> {
	async fn on_alarm(&self) -> Result<()> {
		ActorInstance::on_alarm(self).await
	}

	async fn on_stop(&self, intent: StopIntent) -> Result<()> {
		ActorInstance::on_stop(self, intent).await
	}
}
