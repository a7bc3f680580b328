//! Durable per-actor FIFO with at most one in-flight message.
//!
//! Messages persist under big-endian u64 keys so prefix scans come back in
//! id order. `QueueMetadata` tracks the id counter and the live size; if it
//! goes missing or corrupt it is rebuilt from a prefix scan. Messages found
//! in-flight at load are recovered with an incremented failure count and an
//! exponential-backoff redelivery time.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Result;
use hearth_util::op_queue::OpQueue;
use hearth_util::{backoff, timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;

use crate::driver::DriverHandle;
use crate::errors;
use crate::keys;
use crate::options::RunnerOptions;
use crate::persist::{self, QueueMessage, QueueMetadata};
use crate::sleep::Counters;

pub(crate) const BACKOFF_INITIAL_MS: u64 = 1000;
pub(crate) const BACKOFF_MAX_MS: u64 = 30_000;

type SleepHook = Box<dyn Fn() + Send + Sync>;

struct ReceiveWaiter {
	names: Vec<String>,
	notify: Arc<Notify>,
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
	/// Skip waking matching receive waiters. Used when the caller is about
	/// to enqueue a batch and wants one wake-up at the end.
	pub defer_waiters: bool,
}

#[derive(Debug, Clone)]
pub struct ReceiveOptions {
	/// Message names to match. Empty matches every message.
	pub names: Vec<String>,
	/// Maximum messages to return when not waiting for completion.
	pub count: usize,
	/// How long to wait for an eligible message. `None` waits forever;
	/// zero returns immediately.
	pub timeout: Option<Duration>,
	/// Caller-scoped cancellation, joined with the actor's own signal.
	pub signal: Option<CancellationToken>,
	/// Take a single message and hold it in flight until `complete`.
	pub wait: bool,
}

impl Default for ReceiveOptions {
	fn default() -> Self {
		ReceiveOptions {
			names: Vec::new(),
			count: 1,
			timeout: None,
			signal: None,
			wait: false,
		}
	}
}

#[derive(Debug, Clone)]
pub struct ReceiveResult {
	pub messages: Vec<QueueMessage>,
	/// Set when `wait = true`: the id that must be completed before the next
	/// receive.
	pub pending: Option<u64>,
}

/// Outcome delivered to an `enqueue_and_wait` caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum QueueCompletion {
	#[serde(rename_all = "camelCase")]
	Completed {
		#[serde(default, skip_serializing_if = "Option::is_none")]
		response: Option<Value>,
	},
	TimedOut,
}

pub struct QueueManager {
	actor_id: String,
	driver: DriverHandle,
	options: RunnerOptions,

	messages: Mutex<BTreeMap<u64, QueueMessage>>,
	metadata: Mutex<QueueMetadata>,
	pending_message_id: Mutex<Option<u64>>,
	receive_waiters: Mutex<Vec<ReceiveWaiter>>,
	completion_waiters: Mutex<HashMap<u64, oneshot::Sender<QueueCompletion>>>,
	write_queue: OpQueue,

	counters: Arc<Counters>,
	abort: CancellationToken,
	sleep_hook: OnceLock<SleepHook>,
}

impl QueueManager {
	pub fn new(
		actor_id: String,
		driver: DriverHandle,
		options: RunnerOptions,
		counters: Arc<Counters>,
		abort: CancellationToken,
	) -> Arc<Self> {
		Arc::new(QueueManager {
			actor_id,
			driver,
			options,
			messages: Mutex::new(BTreeMap::new()),
			metadata: Mutex::new(QueueMetadata::default()),
			pending_message_id: Mutex::new(None),
			receive_waiters: Mutex::new(Vec::new()),
			completion_waiters: Mutex::new(HashMap::new()),
			write_queue: OpQueue::new(),
			counters,
			abort,
			sleep_hook: OnceLock::new(),
		})
	}

	pub(crate) fn set_sleep_hook(&self, hook: SleepHook) {
		let _ = self.sleep_hook.set(hook);
	}

	pub fn size(&self) -> u64 {
		self.metadata.lock().size
	}

	pub fn pending_message_id(&self) -> Option<u64> {
		*self.pending_message_id.lock()
	}

	// MARK: Init

	/// Loads metadata and messages, rebuilding metadata from a prefix scan if
	/// missing or corrupt, then recovers any message left in flight by a
	/// crash.
	pub(crate) async fn init(&self) -> Result<()> {
		let metadata_buf = self
			.driver
			.kv_batch_get(&self.actor_id, vec![keys::queue_metadata()])
			.await?
			.pop()
			.flatten();

		let rows = self
			.driver
			.kv_list_prefix(&self.actor_id, keys::queue_prefix())
			.await?;
		let mut messages = BTreeMap::new();
		for (key, value) in rows {
			match persist::decode_queue_message(&value) {
				Ok(msg) => {
					messages.insert(msg.id, msg);
				}
				Err(err) => {
					tracing::error!(?err, ?key, "dropping undecodable queue message");
				}
			}
		}

		let rebuild = || QueueMetadata {
			next_id: messages
				.last_key_value()
				.map(|(id, _)| id + 1)
				.unwrap_or(0),
			size: messages.len() as u64,
		};
		let (metadata, mut metadata_dirty) = match metadata_buf {
			Some(buf) => match persist::decode_queue_metadata(&buf) {
				Ok(metadata) => (metadata, false),
				Err(err) => {
					tracing::warn!(?err, "queue metadata corrupt, rebuilding from scan");
					(rebuild(), true)
				}
			},
			None if !messages.is_empty() => {
				tracing::warn!("queue metadata missing, rebuilding from scan");
				(rebuild(), true)
			}
			None => (QueueMetadata::default(), false),
		};

		// In-flight recovery: the previous incarnation died mid-receive
		let now = timestamp::now();
		let mut entries = Vec::new();
		for msg in messages.values_mut() {
			if !msg.in_flight {
				continue;
			}
			msg.failure_count += 1;
			msg.available_at = now
				+ backoff::calculate_backoff(msg.failure_count, BACKOFF_INITIAL_MS, BACKOFF_MAX_MS)
					.as_millis() as i64;
			msg.in_flight = false;
			msg.in_flight_at = None;
			tracing::debug!(
				id = msg.id,
				failure_count = msg.failure_count,
				available_at = msg.available_at,
				"recovered in-flight queue message"
			);
			entries.push((keys::queue_message(msg.id), persist::encode_queue_message(msg)?));
			metadata_dirty = true;
		}

		if metadata_dirty {
			entries.push((keys::queue_metadata(), persist::encode_queue_metadata(&metadata)?));
		}
		if !entries.is_empty() {
			self.driver.kv_batch_put(&self.actor_id, entries).await?;
		}

		*self.messages.lock() = messages;
		*self.metadata.lock() = metadata;
		Ok(())
	}

	// MARK: Enqueue

	pub async fn enqueue<B: Serialize>(
		&self,
		name: &str,
		body: &B,
		opts: EnqueueOptions,
	) -> Result<QueueMessage> {
		let (msg, _rx) = self.enqueue_inner(name, body, false).await?;
		if !opts.defer_waiters {
			self.notify_receive_waiters(name);
		}
		Ok(msg)
	}

	/// Enqueues and waits for the message to be completed, up to `timeout`.
	/// The completion waiter is registered atomically with the enqueue.
	pub async fn enqueue_and_wait<B: Serialize>(
		&self,
		name: &str,
		body: &B,
		timeout: Duration,
	) -> Result<QueueCompletion> {
		let (msg, rx) = self.enqueue_inner(name, body, true).await?;
		let Some(rx) = rx else {
			return Err(errors::Actor::Unreachable.into());
		};
		self.notify_receive_waiters(name);

		tokio::select! {
			res = rx => match res {
				Ok(completion) => Ok(completion),
				Err(_) => Err(errors::Actor::Aborted.into()),
			},
			_ = tokio::time::sleep(timeout) => {
				self.completion_waiters.lock().remove(&msg.id);
				Ok(QueueCompletion::TimedOut)
			}
			_ = self.abort.cancelled() => {
				self.completion_waiters.lock().remove(&msg.id);
				Err(errors::Actor::Aborted.into())
			}
		}
	}

	async fn enqueue_inner<B: Serialize>(
		&self,
		name: &str,
		body: &B,
		with_completion: bool,
	) -> Result<(QueueMessage, Option<oneshot::Receiver<QueueCompletion>>)> {
		{
			let metadata = self.metadata.lock();
			if metadata.size as usize >= self.options.max_queue_size() {
				return Err(errors::Queue::Full {
					max: self.options.max_queue_size(),
				}
				.into());
			}
		}

		let body = serde_json::to_value(body).map_err(|err| errors::Queue::MessageInvalid {
			path: err.to_string(),
		})?;
		let encoded_len = serde_json::to_vec(&body)
			.map_err(|err| errors::Queue::MessageInvalid {
				path: err.to_string(),
			})?
			.len();
		if encoded_len > self.options.max_queue_message_size() {
			return Err(errors::Queue::MessageTooLarge {
				size: encoded_len,
				limit: self.options.max_queue_message_size(),
			}
			.into());
		}

		let msg = {
			let mut metadata = self.metadata.lock();
			let id = metadata.next_id;
			metadata.next_id += 1;
			metadata.size += 1;

			let now = timestamp::now();
			QueueMessage {
				id,
				name: name.to_string(),
				body,
				created_at: now,
				failure_count: 0,
				available_at: now,
				in_flight: false,
				in_flight_at: None,
			}
		};
		self.messages.lock().insert(msg.id, msg.clone());

		let rx = if with_completion {
			let (tx, rx) = oneshot::channel();
			self.completion_waiters.lock().insert(msg.id, tx);
			Some(rx)
		} else {
			None
		};

		let res = self
			.write_queue
			.run(async {
				// Snapshot metadata at write time; writes are serialized so
				// the latest snapshot is never stale
				let metadata = *self.metadata.lock();
				self.driver
					.kv_batch_put(
						&self.actor_id,
						vec![
							(
								keys::queue_message(msg.id),
								persist::encode_queue_message(&msg)?,
							),
							(
								keys::queue_metadata(),
								persist::encode_queue_metadata(&metadata)?,
							),
						],
					)
					.await
			})
			.await;

		if let Err(err) = res {
			self.messages.lock().remove(&msg.id);
			{
				let mut metadata = self.metadata.lock();
				metadata.size -= 1;
			}
			if with_completion {
				self.completion_waiters.lock().remove(&msg.id);
			}
			return Err(err);
		}

		self.reset_sleep();
		Ok((msg, rx))
	}

	// MARK: Receive

	pub async fn receive(&self, opts: ReceiveOptions) -> Result<ReceiveResult> {
		if self.pending_message_id.lock().is_some() {
			return Err(errors::Queue::MessagePending.into());
		}

		let deadline = opts.timeout.map(|t| tokio::time::Instant::now() + t);
		let immediate = opts.timeout == Some(Duration::ZERO);

		loop {
			let now = timestamp::now();

			enum Scan {
				Ready(Vec<QueueMessage>),
				Park { redeliver_at: Option<i64> },
			}

			let scan = {
				let messages = self.messages.lock();
				let mut eligible = Vec::new();
				let mut redeliver_at: Option<i64> = None;
				for msg in messages.values() {
					if msg.in_flight || !name_matches(&opts.names, &msg.name) {
						continue;
					}
					if msg.available_at <= now {
						if eligible.len() < opts.count.max(1) {
							eligible.push(msg.clone());
						}
					} else {
						redeliver_at = Some(match redeliver_at {
							Some(at) => at.min(msg.available_at),
							None => msg.available_at,
						});
					}
				}
				if eligible.is_empty() {
					Scan::Park { redeliver_at }
				} else {
					Scan::Ready(eligible)
				}
			};

			match scan {
				Scan::Ready(msgs) => {
					if opts.wait {
						return self.take_in_flight(msgs).await;
					} else {
						return self.consume(msgs).await;
					}
				}
				Scan::Park { redeliver_at } => {
					if immediate {
						return Ok(ReceiveResult {
							messages: Vec::new(),
							pending: None,
						});
					}

					if self.park(&opts, deadline, redeliver_at, now).await? {
						continue;
					}
					// Deadline elapsed
					return Ok(ReceiveResult {
						messages: Vec::new(),
						pending: None,
					});
				}
			}
		}
	}

	/// Marks the first eligible message in flight and persists the mark.
	async fn take_in_flight(&self, msgs: Vec<QueueMessage>) -> Result<ReceiveResult> {
		let Some(first) = msgs.into_iter().next() else {
			return Err(errors::Actor::Unreachable.into());
		};

		// Reserve the in-flight slot before touching the message so two
		// concurrent waits cannot both take one
		{
			let mut pending = self.pending_message_id.lock();
			if pending.is_some() {
				return Err(errors::Queue::MessagePending.into());
			}
			*pending = Some(first.id);
		}

		let now = timestamp::now();
		let updated = {
			let mut messages = self.messages.lock();
			let Some(msg) = messages.get_mut(&first.id) else {
				*self.pending_message_id.lock() = None;
				return Err(errors::Actor::Unreachable.into());
			};
			msg.in_flight = true;
			msg.in_flight_at = Some(now);
			msg.clone()
		};

		let res = self
			.write_queue
			.run(async {
				self.driver
					.kv_batch_put(
						&self.actor_id,
						vec![(
							keys::queue_message(updated.id),
							persist::encode_queue_message(&updated)?,
						)],
					)
					.await
			})
			.await;

		if let Err(err) = res {
			{
				let mut messages = self.messages.lock();
				if let Some(msg) = messages.get_mut(&updated.id) {
					msg.in_flight = false;
					msg.in_flight_at = None;
				}
			}
			*self.pending_message_id.lock() = None;
			return Err(err);
		}

		Ok(ReceiveResult {
			pending: Some(updated.id),
			messages: vec![updated],
		})
	}

	/// Removes consumed messages in one write and resolves their completion
	/// waiters with an empty response.
	async fn consume(&self, msgs: Vec<QueueMessage>) -> Result<ReceiveResult> {
		{
			let mut messages = self.messages.lock();
			for msg in &msgs {
				messages.remove(&msg.id);
			}
			let mut metadata = self.metadata.lock();
			metadata.size = metadata.size.saturating_sub(msgs.len() as u64);
		}

		let res = self
			.write_queue
			.run(async {
				self.driver
					.kv_batch_delete(
						&self.actor_id,
						msgs.iter().map(|msg| keys::queue_message(msg.id)).collect(),
					)
					.await?;
				let metadata = *self.metadata.lock();
				self.driver
					.kv_batch_put(
						&self.actor_id,
						vec![(
							keys::queue_metadata(),
							persist::encode_queue_metadata(&metadata)?,
						)],
					)
					.await
			})
			.await;

		if let Err(err) = res {
			// Restore in-memory shape; the rows may or may not be gone, the
			// next init reconciles from the scan
			{
				let mut messages = self.messages.lock();
				for msg in &msgs {
					messages.insert(msg.id, msg.clone());
				}
				let mut metadata = self.metadata.lock();
				metadata.size += msgs.len() as u64;
			}
			return Err(err);
		}

		{
			let mut waiters = self.completion_waiters.lock();
			for msg in &msgs {
				if let Some(tx) = waiters.remove(&msg.id) {
					let _ = tx.send(QueueCompletion::Completed { response: None });
				}
			}
		}

		self.reset_sleep();
		Ok(ReceiveResult {
			messages: msgs,
			pending: None,
		})
	}

	/// Parks until a matching enqueue, the redelivery time, the deadline, or
	/// cancellation. Returns true to rescan, false when the deadline elapsed.
	async fn park(
		&self,
		opts: &ReceiveOptions,
		deadline: Option<tokio::time::Instant>,
		redeliver_at: Option<i64>,
		now: i64,
	) -> Result<bool> {
		let notify = Arc::new(Notify::new());
		self.receive_waiters.lock().push(ReceiveWaiter {
			names: opts.names.clone(),
			notify: notify.clone(),
		});

		struct WaitGuard<'a>(&'a QueueManager, &'a Arc<Notify>);
		impl Drop for WaitGuard<'_> {
			fn drop(&mut self) {
				self.0
					.receive_waiters
					.lock()
					.retain(|waiter| !Arc::ptr_eq(&waiter.notify, self.1));
				self.0.counters.queue_waits.fetch_sub(1, Ordering::SeqCst);
				self.0.reset_sleep();
			}
		}

		self.counters.queue_waits.fetch_add(1, Ordering::SeqCst);
		self.reset_sleep();
		let _guard = WaitGuard(self, &notify);

		let redeliver_fut = async {
			match redeliver_at {
				Some(at) => {
					tokio::time::sleep(Duration::from_millis((at - now).max(0) as u64)).await
				}
				None => std::future::pending().await,
			}
		};
		let deadline_fut = async {
			match deadline {
				Some(deadline) => tokio::time::sleep_until(deadline).await,
				None => std::future::pending().await,
			}
		};
		let signal_fut = async {
			match &opts.signal {
				Some(signal) => signal.cancelled().await,
				None => std::future::pending().await,
			}
		};

		tokio::select! {
			_ = notify.notified() => Ok(true),
			_ = redeliver_fut => Ok(true),
			_ = deadline_fut => Ok(false),
			_ = signal_fut => Err(errors::Actor::Aborted.into()),
			_ = self.abort.cancelled() => Err(errors::Actor::Aborted.into()),
		}
	}

	// MARK: Complete

	/// Completes the in-flight message, removing it and resolving its
	/// completion waiter with `response`.
	pub async fn complete(&self, msg_id: u64, response: Option<Value>) -> Result<()> {
		{
			let pending = self.pending_message_id.lock();
			if *pending != Some(msg_id) {
				return Err(errors::Queue::AlreadyCompleted.into());
			}
		}

		let removed = self.messages.lock().remove(&msg_id);
		if removed.is_some() {
			let mut metadata = self.metadata.lock();
			metadata.size = metadata.size.saturating_sub(1);
		}

		let res = self
			.write_queue
			.run(async {
				self.driver
					.kv_batch_delete(&self.actor_id, vec![keys::queue_message(msg_id)])
					.await?;
				let metadata = *self.metadata.lock();
				self.driver
					.kv_batch_put(
						&self.actor_id,
						vec![(
							keys::queue_metadata(),
							persist::encode_queue_metadata(&metadata)?,
						)],
					)
					.await
			})
			.await;

		if let Err(err) = res {
			if let Some(msg) = removed {
				self.messages.lock().insert(msg_id, msg);
				let mut metadata = self.metadata.lock();
				metadata.size += 1;
			}
			return Err(err);
		}

		*self.pending_message_id.lock() = None;

		if let Some(tx) = self.completion_waiters.lock().remove(&msg_id) {
			let _ = tx.send(QueueCompletion::Completed { response });
		}

		self.reset_sleep();
		Ok(())
	}

	// MARK: Internal

	fn notify_receive_waiters(&self, name: &str) {
		let waiters = self.receive_waiters.lock();
		for waiter in waiters.iter() {
			if name_matches(&waiter.names, name) {
				waiter.notify.notify_one();
			}
		}
	}

	fn reset_sleep(&self) {
		if let Some(hook) = self.sleep_hook.get() {
			hook();
		}
	}
}

fn name_matches(names: &[String], name: &str) -> bool {
	names.is_empty() || names.iter().any(|n| n == name)
}
