//! Traits the runtime consumes from its host.
//!
//! The driver owns everything outside a single actor's memory: the KV
//! backend, the alarm clock, and the ability to tear the actor down. Drivers
//! MUST provide sequential consistency for operations on the same actor id.

use std::any::Any;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

/// Why the host is stopping the actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopIntent {
	Sleep,
	Destroy,
}

impl StopIntent {
	pub fn as_str(&self) -> &'static str {
		match self {
			StopIntent::Sleep => "sleep",
			StopIntent::Destroy => "destroy",
		}
	}
}

/// Re-entry points the driver invokes on a live instance.
#[async_trait]
pub trait ActorCallbacks: Send + Sync + 'static {
	/// The driver alarm fired. Idempotent.
	async fn on_alarm(&self) -> Result<()>;

	/// Begin orderly teardown.
	async fn on_stop(&self, intent: StopIntent) -> Result<()>;
}

pub type ActorHandle = Arc<dyn ActorCallbacks>;

#[async_trait]
pub trait ActorDriver: Send + Sync + 'static {
	async fn kv_batch_get(&self, actor_id: &str, keys: Vec<Bytes>) -> Result<Vec<Option<Bytes>>>;

	async fn kv_batch_put(&self, actor_id: &str, entries: Vec<(Bytes, Bytes)>) -> Result<()>;

	async fn kv_batch_delete(&self, actor_id: &str, keys: Vec<Bytes>) -> Result<()>;

	/// Returns `(key, value)` pairs in ascending key order.
	async fn kv_list_prefix(&self, actor_id: &str, prefix: Bytes) -> Result<Vec<(Bytes, Bytes)>>;

	/// Replaces any previously set alarm. At most one alarm is pending per
	/// actor; when it fires the driver calls `actor.on_alarm()`.
	async fn set_alarm(&self, actor: ActorHandle, actor_id: &str, timestamp: i64) -> Result<()>;

	/// Whether this driver can put idle actors to sleep. `false` disables the
	/// sleep arbiter.
	fn can_sleep(&self) -> bool {
		false
	}

	/// Requests teardown of an idle actor. The driver follows up by calling
	/// `on_stop(StopIntent::Sleep)` on the instance.
	async fn start_sleep(&self, _actor_id: &str) -> Result<()> {
		Ok(())
	}

	/// Tears the actor down for good after orderly stop, deleting its
	/// namespace.
	async fn start_destroy(&self, actor_id: &str) -> Result<()>;

	async fn on_before_actor_start(&self, _actor_id: &str) -> Result<()> {
		Ok(())
	}

	async fn on_create_conn(&self, _actor_id: &str, _conn_id: Uuid) -> Result<()> {
		Ok(())
	}

	async fn on_destroy_conn(&self, _actor_id: &str, _conn_id: Uuid) -> Result<()> {
		Ok(())
	}

	async fn on_before_persist_conn(&self, _actor_id: &str, _conn_id: Uuid) -> Result<()> {
		Ok(())
	}

	async fn on_after_persist_conn(&self, _actor_id: &str, _conn_id: Uuid) -> Result<()> {
		Ok(())
	}

	/// Optional SQL handle for user code. `None` means the database is not
	/// enabled.
	fn get_database(&self, _actor_id: &str) -> Option<Arc<dyn Any + Send + Sync>> {
		None
	}
}

pub type DriverHandle = Arc<dyn ActorDriver>;
