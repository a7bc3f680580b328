//! Optional introspection facade for tooling.
//!
//! Returned by the orchestrator on demand; there is no process-wide
//! inspector. Access is gated by a random token persisted in the actor's
//! namespace so it survives sleep.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::definition::ActorTypes;
use crate::instance::{ActorInstance, InstanceStatus};
use crate::keys;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectorSnapshot {
	pub actor_id: String,
	pub name: String,
	pub status: String,
	pub conn_count: usize,
	pub queue_size: u64,
	pub scheduled_event_count: usize,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub state: Option<Value>,
}

pub struct Inspector<T: ActorTypes> {
	instance: Arc<ActorInstance<T>>,
}

impl<T: ActorTypes> Inspector<T> {
	pub(crate) fn new(instance: Arc<ActorInstance<T>>) -> Self {
		Inspector { instance }
	}

	/// Returns the persistent access token, creating it on first use.
	pub async fn token(&self) -> Result<String> {
		let actor_id = self.instance.identity().actor_id.clone();
		let driver = self.instance.driver().clone();

		let existing = driver
			.kv_batch_get(&actor_id, vec![keys::inspector_token()])
			.await?
			.pop()
			.flatten();
		if let Some(buf) = existing {
			return Ok(String::from_utf8_lossy(&buf).into_owned());
		}

		let token = Uuid::new_v4().to_string();
		driver
			.kv_batch_put(
				&actor_id,
				vec![(keys::inspector_token(), Bytes::from(token.clone()))],
			)
			.await?;
		Ok(token)
	}

	pub fn snapshot(&self) -> InspectorSnapshot {
		let identity = self.instance.identity();
		let state = self
			.instance
			.state_mgr()
			.state()
			.ok()
			.and_then(|state| serde_json::to_value(&state).ok());

		InspectorSnapshot {
			actor_id: identity.actor_id.clone(),
			name: identity.name.clone(),
			status: status_str(self.instance.status()).to_string(),
			conn_count: self.instance.conns().count(),
			queue_size: self.instance.queue().size(),
			scheduled_event_count: self.instance.schedule().len(),
			state,
		}
	}
}

fn status_str(status: InstanceStatus) -> &'static str {
	match status {
		InstanceStatus::Loading => "loading",
		InstanceStatus::Ready => "ready",
		InstanceStatus::Started => "started",
		InstanceStatus::Stopping => "stopping",
		InstanceStatus::Stopped => "stopped",
	}
}
