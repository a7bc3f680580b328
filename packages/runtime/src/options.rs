use std::time::Duration;

/// Tunables for a single actor definition. All fields are optional; accessors
/// supply the defaults.
#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
	/// Throttle window for state writes. Mutations within the window coalesce
	/// into one KV batch.
	///
	/// Unit is in milliseconds.
	pub state_save_interval: Option<u64>,
	/// Deadline for a single action handler.
	///
	/// Unit is in milliseconds.
	pub action_timeout: Option<u64>,
	/// Deadline for the `create_state` hook.
	///
	/// Unit is in milliseconds.
	pub create_state_timeout: Option<u64>,
	/// Deadline for the `create_vars` hook.
	///
	/// Unit is in milliseconds.
	pub create_vars_timeout: Option<u64>,
	/// Deadline for the `create_conn_state` hook.
	///
	/// Unit is in milliseconds.
	pub create_conn_state_timeout: Option<u64>,
	/// Deadline for an async `on_connect` hook.
	///
	/// Unit is in milliseconds.
	pub on_connect_timeout: Option<u64>,
	/// Deadline for the `on_sleep` hook during orderly stop.
	///
	/// Unit is in milliseconds.
	pub on_sleep_timeout: Option<u64>,
	/// Deadline for the `on_destroy` hook during orderly stop.
	///
	/// Unit is in milliseconds.
	pub on_destroy_timeout: Option<u64>,
	/// How long to wait for the `run` handler to join during orderly stop.
	/// Exceeding it is logged, not fatal.
	///
	/// Unit is in milliseconds.
	pub run_stop_timeout: Option<u64>,
	/// Deadline for background promises registered through `wait_until`.
	///
	/// Unit is in milliseconds.
	pub wait_until_timeout: Option<u64>,
	/// Idle duration before the actor becomes eligible for sleep.
	///
	/// Unit is in milliseconds.
	pub sleep_timeout: Option<u64>,
	/// Disables the sleep arbiter entirely.
	pub no_sleep: Option<bool>,
	/// Maximum number of persisted queue messages.
	pub max_queue_size: Option<usize>,
	/// Maximum encoded size of a single queue message body.
	///
	/// Unit is in bytes.
	pub max_queue_message_size: Option<usize>,
	/// Maximum encoded size of a single outgoing wire message.
	///
	/// Unit is in bytes.
	pub max_outgoing_message_size: Option<usize>,
	/// Maximum user KV key size.
	///
	/// Unit is in bytes.
	pub max_kv_key_size: Option<usize>,
	/// Maximum user KV value size.
	///
	/// Unit is in bytes.
	pub max_kv_value_size: Option<usize>,
}

impl RunnerOptions {
	pub fn state_save_interval(&self) -> Duration {
		Duration::from_millis(self.state_save_interval.unwrap_or(100))
	}

	pub fn action_timeout(&self) -> Duration {
		Duration::from_millis(self.action_timeout.unwrap_or(60_000))
	}

	pub fn create_state_timeout(&self) -> Duration {
		Duration::from_millis(self.create_state_timeout.unwrap_or(5_000))
	}

	pub fn create_vars_timeout(&self) -> Duration {
		Duration::from_millis(self.create_vars_timeout.unwrap_or(5_000))
	}

	pub fn create_conn_state_timeout(&self) -> Duration {
		Duration::from_millis(self.create_conn_state_timeout.unwrap_or(5_000))
	}

	pub fn on_connect_timeout(&self) -> Duration {
		Duration::from_millis(self.on_connect_timeout.unwrap_or(5_000))
	}

	pub fn on_sleep_timeout(&self) -> Duration {
		Duration::from_millis(self.on_sleep_timeout.unwrap_or(5_000))
	}

	pub fn on_destroy_timeout(&self) -> Duration {
		Duration::from_millis(self.on_destroy_timeout.unwrap_or(5_000))
	}

	pub fn run_stop_timeout(&self) -> Duration {
		Duration::from_millis(self.run_stop_timeout.unwrap_or(5_000))
	}

	pub fn wait_until_timeout(&self) -> Duration {
		Duration::from_millis(self.wait_until_timeout.unwrap_or(30_000))
	}

	pub fn sleep_timeout(&self) -> Duration {
		Duration::from_millis(self.sleep_timeout.unwrap_or(30_000))
	}

	pub fn no_sleep(&self) -> bool {
		self.no_sleep.unwrap_or(false)
	}

	pub fn max_queue_size(&self) -> usize {
		self.max_queue_size.unwrap_or(10_000)
	}

	pub fn max_queue_message_size(&self) -> usize {
		self.max_queue_message_size.unwrap_or(1024 * 1024)
	}

	pub fn max_outgoing_message_size(&self) -> usize {
		self.max_outgoing_message_size.unwrap_or(1024 * 1024)
	}

	pub fn max_kv_key_size(&self) -> usize {
		self.max_kv_key_size.unwrap_or(2048)
	}

	pub fn max_kv_value_size(&self) -> usize {
		self.max_kv_value_size.unwrap_or(128 * 1024)
	}
}
