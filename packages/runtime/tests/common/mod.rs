#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use hearth_memory_driver::MemoryDriver;
use hearth_protocol::ToClient;
use hearth_runtime::conn::{ConnDriver, ConnKind};
use hearth_runtime::context::ActionContext;
use hearth_runtime::definition::{ActorDefinition, ActorTypes, Types};
use hearth_runtime::driver::{ActorDriver, ActorHandle};
use hearth_runtime::instance::ActorInstance;
use hearth_runtime::options::RunnerOptions;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

pub fn setup_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| "info".into()),
		)
		.with_test_writer()
		.try_init();
}

pub fn test_actor_id(prefix: &str) -> String {
	format!("{prefix}-{}", Uuid::new_v4())
}

// MARK: Test actor types

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterState {
	pub count: i64,
}

pub type CounterTypes = Types<CounterState>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecorderState {
	pub entries: Vec<String>,
}

pub type RecorderTypes = Types<RecorderState>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomParams {
	pub username: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomConnState {
	pub messages_seen: u64,
}

pub type RoomTypes = Types<CounterState, RoomParams, RoomConnState>;

/// Counter actor used across suites: `increment(amount)` and `get_count()`.
pub fn counter_definition(options: RunnerOptions) -> Arc<ActorDefinition<CounterTypes>> {
	ActorDefinition::<CounterTypes>::builder()
		.options(options)
		.initial_state(CounterState::default())
		.action("increment", |ctx: ActionContext<CounterTypes>, args: Vec<Value>| async move {
			let amount = args.first().and_then(Value::as_i64).unwrap_or(1);
			let count = ctx.update_state(|state| {
				state.count += amount;
				state.count
			})?;
			Ok(json!(count))
		})
		.action("get_count", |ctx: ActionContext<CounterTypes>, _args: Vec<Value>| async move {
			Ok(json!(ctx.state()?.count))
		})
		.build()
}

/// Recorder actor: the `record(label)` action appends to state. Used to
/// observe scheduled-event execution order.
pub fn recorder_definition(options: RunnerOptions) -> Arc<ActorDefinition<RecorderTypes>> {
	ActorDefinition::<RecorderTypes>::builder()
		.options(options)
		.initial_state(RecorderState::default())
		.action("record", |ctx: ActionContext<RecorderTypes>, args: Vec<Value>| async move {
			let label = args
				.first()
				.and_then(Value::as_str)
				.unwrap_or("?")
				.to_string();
			ctx.update_state(|state| state.entries.push(label))?;
			Ok(Value::Null)
		})
		.build()
}

pub async fn start_instance<T: ActorTypes>(
	driver: &Arc<MemoryDriver>,
	definition: Arc<ActorDefinition<T>>,
	actor_id: &str,
) -> Result<Arc<ActorInstance<T>>> {
	let instance = ActorInstance::new(
		driver.clone(),
		definition,
		actor_id,
		"test",
		vec![actor_id.to_string()],
		None,
	);
	let handle: ActorHandle = instance.clone();
	driver.register(actor_id, &handle);
	instance.start(None).await?;
	Ok(instance)
}

// MARK: Fake transport

pub struct TestSocket {
	kind: ConnKind,
	hibernatable: bool,
	request_id: Option<Vec<u8>>,
	sent: Mutex<Vec<Bytes>>,
	disconnects: Mutex<Vec<Option<String>>>,
}

impl TestSocket {
	pub fn framed() -> Arc<Self> {
		Arc::new(TestSocket {
			kind: ConnKind::Framed,
			hibernatable: false,
			request_id: None,
			sent: Mutex::new(Vec::new()),
			disconnects: Mutex::new(Vec::new()),
		})
	}

	pub fn websocket() -> Arc<Self> {
		Arc::new(TestSocket {
			kind: ConnKind::WebSocket,
			hibernatable: false,
			request_id: None,
			sent: Mutex::new(Vec::new()),
			disconnects: Mutex::new(Vec::new()),
		})
	}

	pub fn hibernatable_ws(request_id: &[u8]) -> Arc<Self> {
		Arc::new(TestSocket {
			kind: ConnKind::WebSocket,
			hibernatable: true,
			request_id: Some(request_id.to_vec()),
			sent: Mutex::new(Vec::new()),
			disconnects: Mutex::new(Vec::new()),
		})
	}

	/// Decoded framed messages sent over this transport.
	pub fn messages(&self) -> Vec<ToClient> {
		self.sent
			.lock()
			.iter()
			.filter_map(|buf| serde_json::from_slice(buf).ok())
			.collect()
	}

	pub fn sent_count(&self) -> usize {
		self.sent.lock().len()
	}

	pub fn disconnect_reasons(&self) -> Vec<Option<String>> {
		self.disconnects.lock().clone()
	}
}

#[async_trait]
impl ConnDriver for TestSocket {
	fn kind(&self) -> ConnKind {
		self.kind
	}

	fn hibernatable(&self) -> bool {
		self.hibernatable
	}

	fn request_id_buf(&self) -> Option<Vec<u8>> {
		self.request_id.clone()
	}

	async fn send_message(&self, buf: Bytes) -> Result<()> {
		self.sent.lock().push(buf);
		Ok(())
	}

	async fn disconnect(&self, reason: Option<&str>) -> Result<()> {
		self.disconnects.lock().push(reason.map(str::to_string));
		Ok(())
	}
}

// MARK: Instrumented driver

/// Wraps the memory driver to count batch writes and inject failures.
pub struct CountingDriver {
	inner: Arc<MemoryDriver>,
	pub puts: AtomicUsize,
	pub fail_puts: AtomicBool,
}

impl CountingDriver {
	pub fn new(inner: Arc<MemoryDriver>) -> Arc<Self> {
		Arc::new(CountingDriver {
			inner,
			puts: AtomicUsize::new(0),
			fail_puts: AtomicBool::new(false),
		})
	}

	pub fn put_count(&self) -> usize {
		self.puts.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl ActorDriver for CountingDriver {
	async fn kv_batch_get(&self, actor_id: &str, keys: Vec<Bytes>) -> Result<Vec<Option<Bytes>>> {
		self.inner.kv_batch_get(actor_id, keys).await
	}

	async fn kv_batch_put(&self, actor_id: &str, entries: Vec<(Bytes, Bytes)>) -> Result<()> {
		if self.fail_puts.load(Ordering::SeqCst) {
			anyhow::bail!("injected kv failure");
		}
		self.puts.fetch_add(1, Ordering::SeqCst);
		self.inner.kv_batch_put(actor_id, entries).await
	}

	async fn kv_batch_delete(&self, actor_id: &str, keys: Vec<Bytes>) -> Result<()> {
		self.inner.kv_batch_delete(actor_id, keys).await
	}

	async fn kv_list_prefix(&self, actor_id: &str, prefix: Bytes) -> Result<Vec<(Bytes, Bytes)>> {
		self.inner.kv_list_prefix(actor_id, prefix).await
	}

	async fn set_alarm(&self, actor: ActorHandle, actor_id: &str, timestamp: i64) -> Result<()> {
		self.inner.set_alarm(actor, actor_id, timestamp).await
	}

	fn can_sleep(&self) -> bool {
		self.inner.can_sleep()
	}

	async fn start_sleep(&self, actor_id: &str) -> Result<()> {
		self.inner.start_sleep(actor_id).await
	}

	async fn start_destroy(&self, actor_id: &str) -> Result<()> {
		self.inner.start_destroy(actor_id).await
	}
}

pub async fn start_instance_with_driver<T: ActorTypes, D: ActorDriver>(
	driver: Arc<D>,
	memory: &Arc<MemoryDriver>,
	definition: Arc<ActorDefinition<T>>,
	actor_id: &str,
) -> Result<Arc<ActorInstance<T>>> {
	let instance = ActorInstance::new(
		driver,
		definition,
		actor_id,
		"test",
		vec![actor_id.to_string()],
		None,
	);
	let handle: ActorHandle = instance.clone();
	memory.register(actor_id, &handle);
	instance.start(None).await?;
	Ok(instance)
}

// MARK: Polling helpers

/// Polls until `f` returns true or the timeout elapses.
pub async fn wait_for(timeout_ms: u64, mut f: impl FnMut() -> bool) -> bool {
	let start = std::time::Instant::now();
	loop {
		if f() {
			return true;
		}
		if start.elapsed().as_millis() as u64 > timeout_ms {
			return false;
		}
		tokio::time::sleep(std::time::Duration::from_millis(10)).await;
	}
}
