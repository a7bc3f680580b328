//! Scheduled-event timeline.
//!
//! The timeline lives inside the persisted actor blob so it survives reload.
//! The driver holds at most one alarm per actor, always set to the head of
//! the timeline; alarm writes are serialized through their own op queue.

use std::sync::{Arc, OnceLock, Weak};

use anyhow::{Context, Result};
use hearth_util::op_queue::OpQueue;
use serde_json::Value;
use uuid::Uuid;

use crate::definition::ActorTypes;
use crate::driver::{ActorHandle, DriverHandle};
use crate::instance::ActorInstance;
use crate::persist::ScheduleEvent;
use crate::state::StateManager;

pub struct ScheduleManager<T: ActorTypes> {
	actor_id: String,
	driver: DriverHandle,
	state_mgr: Arc<StateManager<T>>,
	alarm_queue: OpQueue,
	instance: OnceLock<Weak<ActorInstance<T>>>,
}

impl<T: ActorTypes> ScheduleManager<T> {
	pub fn new(
		actor_id: String,
		driver: DriverHandle,
		state_mgr: Arc<StateManager<T>>,
	) -> Arc<Self> {
		Arc::new(ScheduleManager {
			actor_id,
			driver,
			state_mgr,
			alarm_queue: OpQueue::new(),
			instance: OnceLock::new(),
		})
	}

	pub(crate) fn attach(&self, instance: &Arc<ActorInstance<T>>) {
		let _ = self.instance.set(Arc::downgrade(instance));
	}

	/// Inserts an event into the timeline (stable on equal timestamps) and
	/// moves the driver alarm if the head changed.
	pub async fn schedule_at(
		&self,
		timestamp: i64,
		action: &str,
		args: Option<Value>,
	) -> Result<ScheduleEvent> {
		let event = ScheduleEvent {
			event_id: Uuid::new_v4().to_string(),
			timestamp,
			action: action.to_string(),
			args,
		};

		let at_head = self.state_mgr.with_scheduled_events_mut(|events| {
			let idx = events.partition_point(|ev| ev.timestamp <= timestamp);
			events.insert(idx, event.clone());
			idx == 0
		});
		self.state_mgr.mark_actor_dirty();

		if at_head {
			self.set_alarm(timestamp).await?;
		}

		tracing::debug!(event_id=%event.event_id, action=%event.action, timestamp, "scheduled event");
		Ok(event)
	}

	/// Removes an event by id. Returns whether anything was removed.
	pub async fn cancel(&self, event_id: &str) -> Result<bool> {
		let (removed, new_head) = self.state_mgr.with_scheduled_events_mut(|events| {
			let was_head = events
				.first()
				.is_some_and(|ev| ev.event_id == event_id);
			let len = events.len();
			events.retain(|ev| ev.event_id != event_id);
			let removed = events.len() != len;
			let new_head = (removed && was_head)
				.then(|| events.first().map(|ev| ev.timestamp))
				.flatten();
			(removed, new_head)
		});

		if removed {
			self.state_mgr.mark_actor_dirty();
		}
		if let Some(ts) = new_head {
			self.set_alarm(ts).await?;
		}

		Ok(removed)
	}

	/// Sets the driver alarm to the timeline head after load.
	pub(crate) async fn init_alarm(&self) -> Result<()> {
		let head = self
			.state_mgr
			.with_scheduled_events(|events| events.first().map(|ev| ev.timestamp));
		if let Some(ts) = head {
			self.set_alarm(ts).await?;
		}
		Ok(())
	}

	/// Splices out every event due at `now` and re-arms the alarm for the new
	/// head BEFORE the drained events run, so a crash mid-drain re-fires.
	/// Idempotent: with nothing due it only re-arms.
	pub(crate) async fn drain_due(&self, now: i64) -> Result<Vec<ScheduleEvent>> {
		let (due, next) = self.state_mgr.with_scheduled_events_mut(|events| {
			let split = events.partition_point(|ev| ev.timestamp <= now);
			let due: Vec<ScheduleEvent> = events.drain(..split).collect();
			(due, events.first().map(|ev| ev.timestamp))
		});

		if !due.is_empty() {
			self.state_mgr.mark_actor_dirty();
		}
		if let Some(ts) = next {
			self.set_alarm(ts).await?;
		}

		Ok(due)
	}

	pub fn len(&self) -> usize {
		self.state_mgr.with_scheduled_events(|events| events.len())
	}

	/// Snapshot of the timeline's timestamps, in order.
	pub fn timestamps(&self) -> Vec<i64> {
		self.state_mgr
			.with_scheduled_events(|events| events.iter().map(|ev| ev.timestamp).collect())
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	async fn set_alarm(&self, ts: i64) -> Result<()> {
		let handle: ActorHandle = self
			.instance
			.get()
			.and_then(Weak::upgrade)
			.context("instance dropped")?;

		self.alarm_queue
			.run(self.driver.set_alarm(handle, &self.actor_id, ts))
			.await
	}
}
