//! Change tracking and throttled persistence for the actor's persisted root.
//!
//! Mutations go through an explicit commit API: the mutation runs against a
//! copy, the copy is validated for serializability, then swapped in and the
//! dirty flag set. Dirty state coalesces into one KV batch per throttle
//! window; the batch also carries every connection row marked dirty since the
//! last write.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use hearth_util::op_queue::OpQueue;
use hearth_util::timestamp;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::connections::ConnectionManager;
use crate::context::ActorContext;
use crate::definition::{ActorDefinition, ActorTypes};
use crate::driver::DriverHandle;
use crate::errors;
use crate::instance::{ActorInstance, InstanceStatus};
use crate::keys;
use crate::options::RunnerOptions;
use crate::persist::{self, PersistedActor, ScheduleEvent};

#[derive(Default)]
struct Dirty {
	actor: bool,
	conns: HashSet<Uuid>,
}

struct ScheduledSave {
	at_ms: i64,
	handle: JoinHandle<()>,
}

pub struct StateManager<T: ActorTypes> {
	actor_id: String,
	driver: DriverHandle,
	definition: Arc<ActorDefinition<T>>,
	options: RunnerOptions,

	persist: Mutex<PersistedActor<T>>,
	dirty: Mutex<Dirty>,
	last_save_ms: AtomicI64,
	scheduled: Mutex<Option<ScheduledSave>>,
	/// Callers awaiting `save_state` share the next write's result.
	waiters: Mutex<Vec<oneshot::Sender<Result<(), String>>>>,
	flush_queue: OpQueue,
	in_state_change: AtomicBool,

	conns: OnceLock<Weak<ConnectionManager<T>>>,
	instance: OnceLock<Weak<ActorInstance<T>>>,
}

impl<T: ActorTypes> StateManager<T> {
	pub fn new(
		actor_id: String,
		driver: DriverHandle,
		definition: Arc<ActorDefinition<T>>,
		persisted: PersistedActor<T>,
	) -> Arc<Self> {
		let options = definition.options().clone();
		Arc::new(StateManager {
			actor_id,
			driver,
			definition,
			options,
			persist: Mutex::new(persisted),
			dirty: Mutex::new(Dirty::default()),
			last_save_ms: AtomicI64::new(0),
			scheduled: Mutex::new(None),
			waiters: Mutex::new(Vec::new()),
			flush_queue: OpQueue::new(),
			in_state_change: AtomicBool::new(false),
			conns: OnceLock::new(),
			instance: OnceLock::new(),
		})
	}

	pub(crate) fn attach(
		&self,
		conns: &Arc<ConnectionManager<T>>,
		instance: &Arc<ActorInstance<T>>,
	) {
		let _ = self.conns.set(Arc::downgrade(conns));
		let _ = self.instance.set(Arc::downgrade(instance));
	}

	pub fn state_enabled(&self) -> bool {
		self.definition.state_enabled()
	}

	// MARK: Persisted root access

	pub fn state(&self) -> Result<T::State> {
		let persist = self.persist.lock();
		persist
			.state
			.clone()
			.ok_or_else(|| errors::State::NotEnabled.into())
	}

	pub fn input(&self) -> Option<T::Input> {
		let persist = self.persist.lock();
		persist.input.clone()
	}

	pub fn has_initialized(&self) -> bool {
		let persist = self.persist.lock();
		persist.has_initialized
	}

	/// Replaces the persisted root with the blob loaded from KV.
	pub(crate) fn replace_persisted(&self, persisted: PersistedActor<T>) {
		*self.persist.lock() = persisted;
	}

	/// Seeds the state root at first create. Does not mark dirty; callers
	/// follow up with an immediate save.
	pub(crate) fn initialize(&self, state: Option<T::State>) {
		let mut persist = self.persist.lock();
		persist.state = state;
		persist.has_initialized = true;
	}

	pub(crate) fn with_scheduled_events<R>(&self, f: impl FnOnce(&Vec<ScheduleEvent>) -> R) -> R {
		let persist = self.persist.lock();
		f(&persist.scheduled_events)
	}

	pub(crate) fn with_scheduled_events_mut<R>(
		&self,
		f: impl FnOnce(&mut Vec<ScheduleEvent>) -> R,
	) -> R {
		let mut persist = self.persist.lock();
		f(&mut persist.scheduled_events)
	}

	// MARK: Mutation

	/// Commits a state mutation. The closure runs against a copy; the copy
	/// must serialize cleanly or the commit is rejected without touching the
	/// live root.
	pub fn update_state<F, R>(self: &Arc<Self>, f: F) -> Result<R>
	where
		F: FnOnce(&mut T::State) -> R,
	{
		let (result, snapshot) = {
			let mut persist = self.persist.lock();
			let state = persist
				.state
				.as_mut()
				.ok_or(errors::State::NotEnabled)?;

			let mut next = state.clone();
			let result = f(&mut next);
			validate_serializable(&next, "state")?;

			*state = next;
			(result, state.clone())
		};

		self.mark_actor_dirty();
		self.notify_state_change(&snapshot);

		Ok(result)
	}

	fn notify_state_change(self: &Arc<Self>, state: &T::State) {
		let Some(hook) = &self.definition.on_state_change else {
			return;
		};
		let Some(instance) = self.instance.get().and_then(Weak::upgrade) else {
			return;
		};
		if !matches!(
			instance.status(),
			InstanceStatus::Ready | InstanceStatus::Started
		) {
			return;
		}

		// Guard against the hook mutating state and recursing forever
		if self.in_state_change.swap(true, Ordering::SeqCst) {
			return;
		}
		hook(ActorContext::new(instance), state);
		self.in_state_change.store(false, Ordering::SeqCst);
	}

	pub(crate) fn mark_actor_dirty(self: &Arc<Self>) {
		{
			let mut dirty = self.dirty.lock();
			dirty.actor = true;
		}
		self.schedule_save(None);
	}

	pub(crate) fn mark_conn_dirty(self: &Arc<Self>, conn_id: Uuid) {
		{
			let mut dirty = self.dirty.lock();
			dirty.conns.insert(conn_id);
		}
		self.schedule_save(None);
	}

	// MARK: Saving

	/// Schedules a coalesced write. `delay = max(0, interval − (now −
	/// last_save))`, tightened by `max_wait`; an already scheduled earlier
	/// write is left alone.
	pub(crate) fn schedule_save(self: &Arc<Self>, max_wait: Option<Duration>) {
		let now = timestamp::now();
		let interval = self.options.state_save_interval().as_millis() as i64;
		let last = self.last_save_ms.load(Ordering::SeqCst);
		let mut delay = (interval - (now - last)).max(0);
		if let Some(max_wait) = max_wait {
			delay = delay.min(max_wait.as_millis() as i64);
		}
		let target = now + delay;

		let mut scheduled = self.scheduled.lock();
		if let Some(existing) = &*scheduled {
			if existing.at_ms <= target {
				return;
			}
			existing.handle.abort();
		}

		let this = Arc::downgrade(self);
		let handle = tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(delay as u64)).await;
			if let Some(mgr) = this.upgrade() {
				if let Err(err) = mgr.flush().await {
					tracing::warn!(?err, "scheduled state save failed");
				}
			}
		});
		*scheduled = Some(ScheduledSave {
			at_ms: target,
			handle,
		});
	}

	/// Persists dirty state. `immediate` writes now; otherwise the caller
	/// shares the result of the next scheduled write.
	pub async fn save_state(self: &Arc<Self>, immediate: bool) -> Result<()> {
		if immediate {
			return self.flush().await;
		}

		let rx = {
			let (tx, rx) = oneshot::channel();
			self.waiters.lock().push(tx);
			rx
		};
		self.schedule_save(None);
		rx.await
			.context("state manager dropped before save completed")?
			.map_err(|err| anyhow!(err))
	}

	/// Runs one write now. Serialized with scheduled writes so at most one
	/// batch is in flight.
	pub(crate) async fn flush(self: &Arc<Self>) -> Result<()> {
		self.flush_queue
			.run(async {
				let waiters = {
					let mut waiters = self.waiters.lock();
					std::mem::take(&mut *waiters)
				};

				let res = self.flush_inner().await;

				let shared = res.as_ref().map(|_| ()).map_err(|err| err.to_string());
				for waiter in waiters {
					let _ = waiter.send(shared.clone());
				}

				res
			})
			.await
	}

	async fn flush_inner(self: &Arc<Self>) -> Result<()> {
		// Cancel any scheduled write; this one covers it
		{
			let mut scheduled = self.scheduled.lock();
			if let Some(scheduled) = scheduled.take() {
				scheduled.handle.abort();
			}
		}

		let taken = {
			let mut dirty = self.dirty.lock();
			std::mem::take(&mut *dirty)
		};
		if !taken.actor && taken.conns.is_empty() {
			return Ok(());
		}

		let res = self.write_batch(&taken).await;
		if res.is_err() {
			// Restore the flags so the next mutation retries the write
			let mut dirty = self.dirty.lock();
			dirty.actor |= taken.actor;
			dirty.conns.extend(taken.conns.iter().copied());
		}
		res
	}

	async fn write_batch(&self, taken: &Dirty) -> Result<()> {
		let mut entries = Vec::new();

		if taken.actor {
			let buf = {
				let persist = self.persist.lock();
				persist::encode_actor(&persist)?
			};
			entries.push((keys::persist_data(), buf));
		}

		let mut persisted_conns = Vec::new();
		if !taken.conns.is_empty() {
			if let Some(conns) = self.conns.get().and_then(Weak::upgrade) {
				for conn_id in &taken.conns {
					// Disconnected before the write fired; its row was
					// deleted on disconnect
					let Some(conn) = conns.get(*conn_id) else {
						continue;
					};
					self.driver
						.on_before_persist_conn(&self.actor_id, *conn_id)
						.await?;
					entries.push((keys::conn(*conn_id), conn.encode_persist()?));
					persisted_conns.push(*conn_id);
				}
			}
		}

		if entries.is_empty() {
			return Ok(());
		}

		self.driver.kv_batch_put(&self.actor_id, entries).await?;
		self.last_save_ms.store(timestamp::now(), Ordering::SeqCst);

		for conn_id in persisted_conns {
			if let Err(err) = self
				.driver
				.on_after_persist_conn(&self.actor_id, conn_id)
				.await
			{
				tracing::warn!(?err, ?conn_id, "on_after_persist_conn failed");
			}
		}

		Ok(())
	}

	pub(crate) fn stop(&self) {
		let mut scheduled = self.scheduled.lock();
		if let Some(scheduled) = scheduled.take() {
			scheduled.handle.abort();
		}
	}
}

/// Rejects values the persistence codec cannot represent.
pub(crate) fn validate_serializable<V: Serialize>(value: &V, path: &str) -> Result<()> {
	serde_json::to_value(value).map_err(|err| {
		errors::State::InvalidType {
			path: format!("{path}: {err}"),
		}
	})?;
	Ok(())
}
