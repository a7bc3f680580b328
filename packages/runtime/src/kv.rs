//! User-facing KV facade over the actor's namespace.
//!
//! User keys live under the `USER_KV` prefix so they can never collide with
//! runtime keys. Size limits guard the shared backend.

use anyhow::Result;
use bytes::Bytes;

use crate::driver::DriverHandle;
use crate::errors;
use crate::keys;
use crate::options::RunnerOptions;

#[derive(Clone)]
pub struct ActorKv {
	actor_id: String,
	driver: DriverHandle,
	options: RunnerOptions,
}

impl ActorKv {
	pub(crate) fn new(actor_id: String, driver: DriverHandle, options: RunnerOptions) -> Self {
		ActorKv {
			actor_id,
			driver,
			options,
		}
	}

	fn check_key(&self, key: &[u8]) -> Result<()> {
		let limit = self.options.max_kv_key_size();
		if key.len() > limit {
			return Err(errors::Kv::KeyTooLarge {
				size: key.len(),
				limit,
			}
			.into());
		}
		Ok(())
	}

	pub async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
		self.check_key(key)?;
		Ok(self
			.driver
			.kv_batch_get(&self.actor_id, vec![keys::user_kv(key)])
			.await?
			.pop()
			.flatten())
	}

	pub async fn put(&self, key: &[u8], value: impl Into<Bytes>) -> Result<()> {
		self.check_key(key)?;
		let value = value.into();
		let limit = self.options.max_kv_value_size();
		if value.len() > limit {
			return Err(errors::Kv::ValueTooLarge {
				size: value.len(),
				limit,
			}
			.into());
		}

		self.driver
			.kv_batch_put(&self.actor_id, vec![(keys::user_kv(key), value)])
			.await
	}

	pub async fn delete(&self, key: &[u8]) -> Result<()> {
		self.check_key(key)?;
		self.driver
			.kv_batch_delete(&self.actor_id, vec![keys::user_kv(key)])
			.await
	}

	/// Lists user entries under `prefix` with the namespace prefix stripped.
	pub async fn list(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Bytes)>> {
		self.check_key(prefix)?;
		let rows = self
			.driver
			.kv_list_prefix(&self.actor_id, keys::user_kv(prefix))
			.await?;
		Ok(rows
			.into_iter()
			.filter_map(|(key, value)| {
				keys::strip_user_kv(&key).map(|key| (key.to_vec(), value))
			})
			.collect())
	}
}
