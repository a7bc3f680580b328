//! Sleep arbiter: decides when an idle actor can be handed back to the
//! driver for teardown.
//!
//! Every transition that could affect eligibility resets the timer. The
//! timer only arms while the predicate says `Yes`; when it fires without an
//! intervening reset, the driver's `start_sleep` is dispatched exactly once.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::driver::DriverHandle;
use crate::instance::InstanceStatus;
use crate::options::RunnerOptions;

/// Live-work counters owned by the instance, shared with the managers that
/// drive them.
#[derive(Default)]
pub struct Counters {
	pub http_requests: AtomicUsize,
	pub keep_awake: AtomicUsize,
	pub run_active: AtomicBool,
	pub queue_waits: AtomicUsize,
	pub pending_disconnects: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanSleep {
	NotReady,
	NotStarted,
	ActiveHttpRequests,
	ActiveKeepAwake,
	ActiveRun,
	ActiveConns,
	ActiveDisconnectCallbacks,
	Yes,
}

type ConnCountFn = Box<dyn Fn() -> usize + Send + Sync>;
type StatusFn = Box<dyn Fn() -> InstanceStatus + Send + Sync>;

pub struct SleepArbiter {
	actor_id: String,
	driver: DriverHandle,
	options: RunnerOptions,
	counters: Arc<Counters>,
	enabled: bool,

	conn_count: OnceLock<ConnCountFn>,
	status: OnceLock<StatusFn>,
	generation: AtomicU64,
	timer: Mutex<Option<JoinHandle<()>>>,
	slept: AtomicBool,
}

impl SleepArbiter {
	pub fn new(
		actor_id: String,
		driver: DriverHandle,
		options: RunnerOptions,
		counters: Arc<Counters>,
	) -> Arc<Self> {
		let enabled = !options.no_sleep() && driver.can_sleep();
		Arc::new(SleepArbiter {
			actor_id,
			driver,
			options,
			counters,
			enabled,
			conn_count: OnceLock::new(),
			status: OnceLock::new(),
			generation: AtomicU64::new(0),
			timer: Mutex::new(None),
			slept: AtomicBool::new(false),
		})
	}

	pub(crate) fn wire(&self, conn_count: ConnCountFn, status: StatusFn) {
		let _ = self.conn_count.set(conn_count);
		let _ = self.status.set(status);
	}

	pub fn enabled(&self) -> bool {
		self.enabled
	}

	pub fn can_sleep(&self) -> CanSleep {
		let status = match self.status.get() {
			Some(status) => status(),
			None => return CanSleep::NotReady,
		};
		match status {
			InstanceStatus::Loading | InstanceStatus::Stopping | InstanceStatus::Stopped => {
				return CanSleep::NotReady;
			}
			InstanceStatus::Ready => return CanSleep::NotStarted,
			InstanceStatus::Started => {}
		}

		if self.counters.http_requests.load(Ordering::SeqCst) > 0 {
			return CanSleep::ActiveHttpRequests;
		}
		if self.counters.keep_awake.load(Ordering::SeqCst) > 0 {
			return CanSleep::ActiveKeepAwake;
		}
		// A run handler parked on the queue is idle work; it wakes with the
		// actor
		if self.counters.run_active.load(Ordering::SeqCst)
			&& self.counters.queue_waits.load(Ordering::SeqCst) == 0
		{
			return CanSleep::ActiveRun;
		}
		let conn_count = self.conn_count.get().map(|f| f()).unwrap_or(0);
		if conn_count > 0 {
			return CanSleep::ActiveConns;
		}
		if self.counters.pending_disconnects.load(Ordering::SeqCst) > 0 {
			return CanSleep::ActiveDisconnectCallbacks;
		}

		CanSleep::Yes
	}

	/// Re-evaluates eligibility and re-arms (or disarms) the idle timer.
	pub fn reset(self: &Arc<Self>) {
		if !self.enabled || self.slept.load(Ordering::SeqCst) {
			return;
		}

		let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
		{
			let mut timer = self.timer.lock();
			if let Some(timer) = timer.take() {
				timer.abort();
			}
		}

		if self.can_sleep() != CanSleep::Yes {
			return;
		}

		let this = Arc::downgrade(self);
		let sleep_timeout = self.options.sleep_timeout();
		let handle = tokio::spawn(async move {
			tokio::time::sleep(sleep_timeout).await;

			let Some(arbiter) = this.upgrade() else {
				return;
			};
			if arbiter.generation.load(Ordering::SeqCst) != generation {
				return;
			}
			if arbiter.can_sleep() != CanSleep::Yes {
				return;
			}
			if arbiter.slept.swap(true, Ordering::SeqCst) {
				return;
			}

			tracing::debug!(actor_id=%arbiter.actor_id, "actor idle, requesting sleep");

			// Dispatch on a fresh task; the driver call may block on the
			// instance stopping
			let driver = arbiter.driver.clone();
			let actor_id = arbiter.actor_id.clone();
			tokio::spawn(async move {
				if let Err(err) = driver.start_sleep(&actor_id).await {
					tracing::error!(?err, %actor_id, "start_sleep failed");
				}
			});
		});
		*self.timer.lock() = Some(handle);
	}

	pub(crate) fn stop(&self) {
		let mut timer = self.timer.lock();
		if let Some(timer) = timer.take() {
			timer.abort();
		}
	}
}
