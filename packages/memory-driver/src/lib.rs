//! In-memory actor driver.
//!
//! Backs each actor with a `BTreeMap` namespace so prefix scans come back in
//! key order, drives alarms with tokio timers, and dispatches sleep/destroy
//! back into registered instances. Used by tests and by embedded hosts that
//! do not need durability.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use hearth_runtime::driver::{ActorCallbacks, ActorDriver, ActorHandle, StopIntent};
use hearth_util::timestamp;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

struct Alarm {
	timestamp: i64,
	handle: JoinHandle<()>,
}

#[derive(Default)]
struct DriverCalls {
	start_sleep: usize,
	start_destroy: usize,
}

#[derive(Default)]
struct Inner {
	kv: HashMap<String, BTreeMap<Vec<u8>, Bytes>>,
	alarms: HashMap<String, Alarm>,
	actors: HashMap<String, Weak<dyn ActorCallbacks>>,
	calls: HashMap<String, DriverCalls>,
}

pub struct MemoryDriver {
	inner: Mutex<Inner>,
	sleep_enabled: bool,
}

impl MemoryDriver {
	pub fn new() -> Arc<Self> {
		Arc::new(MemoryDriver {
			inner: Mutex::new(Inner::default()),
			sleep_enabled: true,
		})
	}

	pub fn without_sleep() -> Arc<Self> {
		Arc::new(MemoryDriver {
			inner: Mutex::new(Inner::default()),
			sleep_enabled: false,
		})
	}

	/// Registers the instance that receives sleep/destroy/alarm dispatches
	/// for `actor_id`.
	pub fn register(&self, actor_id: &str, actor: &ActorHandle) {
		self.inner
			.lock()
			.actors
			.insert(actor_id.to_string(), Arc::downgrade(actor));
	}

	pub fn unregister(&self, actor_id: &str) {
		let mut inner = self.inner.lock();
		inner.actors.remove(actor_id);
		if let Some(alarm) = inner.alarms.remove(actor_id) {
			alarm.handle.abort();
		}
	}

	// MARK: Test observability

	pub fn raw_get(&self, actor_id: &str, key: &[u8]) -> Option<Bytes> {
		self.inner
			.lock()
			.kv
			.get(actor_id)
			.and_then(|ns| ns.get(key).cloned())
	}

	pub fn raw_put(&self, actor_id: &str, key: Vec<u8>, value: Bytes) {
		self.inner
			.lock()
			.kv
			.entry(actor_id.to_string())
			.or_default()
			.insert(key, value);
	}

	pub fn dump(&self, actor_id: &str) -> Vec<(Vec<u8>, Bytes)> {
		self.inner
			.lock()
			.kv
			.get(actor_id)
			.map(|ns| ns.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
			.unwrap_or_default()
	}

	pub fn pending_alarm(&self, actor_id: &str) -> Option<i64> {
		self.inner
			.lock()
			.alarms
			.get(actor_id)
			.map(|alarm| alarm.timestamp)
	}

	pub fn start_sleep_calls(&self, actor_id: &str) -> usize {
		self.inner
			.lock()
			.calls
			.get(actor_id)
			.map(|calls| calls.start_sleep)
			.unwrap_or(0)
	}

	pub fn start_destroy_calls(&self, actor_id: &str) -> usize {
		self.inner
			.lock()
			.calls
			.get(actor_id)
			.map(|calls| calls.start_destroy)
			.unwrap_or(0)
	}

	fn actor(&self, actor_id: &str) -> Option<ActorHandle> {
		self.inner
			.lock()
			.actors
			.get(actor_id)
			.and_then(Weak::upgrade)
	}
}

#[async_trait]
impl ActorDriver for MemoryDriver {
	async fn kv_batch_get(&self, actor_id: &str, keys: Vec<Bytes>) -> Result<Vec<Option<Bytes>>> {
		let inner = self.inner.lock();
		let ns = inner.kv.get(actor_id);
		Ok(keys
			.iter()
			.map(|key| ns.and_then(|ns| ns.get(key.as_ref()).cloned()))
			.collect())
	}

	async fn kv_batch_put(&self, actor_id: &str, entries: Vec<(Bytes, Bytes)>) -> Result<()> {
		let mut inner = self.inner.lock();
		let ns = inner.kv.entry(actor_id.to_string()).or_default();
		for (key, value) in entries {
			ns.insert(key.to_vec(), value);
		}
		Ok(())
	}

	async fn kv_batch_delete(&self, actor_id: &str, keys: Vec<Bytes>) -> Result<()> {
		let mut inner = self.inner.lock();
		if let Some(ns) = inner.kv.get_mut(actor_id) {
			for key in keys {
				ns.remove(key.as_ref());
			}
		}
		Ok(())
	}

	async fn kv_list_prefix(&self, actor_id: &str, prefix: Bytes) -> Result<Vec<(Bytes, Bytes)>> {
		let inner = self.inner.lock();
		let Some(ns) = inner.kv.get(actor_id) else {
			return Ok(Vec::new());
		};
		Ok(ns
			.range(prefix.to_vec()..)
			.take_while(|(key, _)| key.starts_with(prefix.as_ref()))
			.map(|(key, value)| (Bytes::from(key.clone()), value.clone()))
			.collect())
	}

	async fn set_alarm(&self, actor: ActorHandle, actor_id: &str, timestamp: i64) -> Result<()> {
		let mut inner = self.inner.lock();
		inner
			.actors
			.insert(actor_id.to_string(), Arc::downgrade(&actor));

		if let Some(previous) = inner.alarms.remove(actor_id) {
			previous.handle.abort();
		}

		let delay_ms = (timestamp - timestamp::now()).max(0) as u64;
		let weak = Arc::downgrade(&actor);
		let id = actor_id.to_string();
		let handle = tokio::spawn(async move {
			tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
			let Some(actor) = weak.upgrade() else {
				return;
			};
			if let Err(err) = actor.on_alarm().await {
				tracing::error!(?err, actor_id=%id, "alarm dispatch failed");
			}
		});
		inner.alarms.insert(
			actor_id.to_string(),
			Alarm { timestamp, handle },
		);
		Ok(())
	}

	fn can_sleep(&self) -> bool {
		self.sleep_enabled
	}

	async fn start_sleep(&self, actor_id: &str) -> Result<()> {
		{
			let mut inner = self.inner.lock();
			inner
				.calls
				.entry(actor_id.to_string())
				.or_default()
				.start_sleep += 1;
		}

		let actor = self
			.actor(actor_id)
			.context("no registered actor for start_sleep")?;
		actor.on_stop(StopIntent::Sleep).await
	}

	async fn start_destroy(&self, actor_id: &str) -> Result<()> {
		let mut inner = self.inner.lock();
		inner
			.calls
			.entry(actor_id.to_string())
			.or_default()
			.start_destroy += 1;
		inner.kv.remove(actor_id);
		inner.actors.remove(actor_id);
		if let Some(alarm) = inner.alarms.remove(actor_id) {
			alarm.handle.abort();
		}
		Ok(())
	}
}
