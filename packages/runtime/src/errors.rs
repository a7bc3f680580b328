//! Typed error taxonomy surfaced to callers and to the wire protocol.
//!
//! Internals return `anyhow::Result`; these enums are raised into it and
//! downcast at the boundary where the host or the wire needs a machine
//! readable group/code.

use hearth_protocol::ErrorPayload;
use serde_json::json;

/// Errors with a stable wire representation.
pub trait TypedError: std::error::Error + Send + Sync + 'static {
	fn group(&self) -> &'static str;
	fn code(&self) -> &'static str;
	fn metadata(&self) -> Option<serde_json::Value> {
		None
	}

	fn payload(&self) -> ErrorPayload {
		ErrorPayload {
			group: self.group().to_string(),
			code: self.code().to_string(),
			message: self.to_string(),
			metadata: self.metadata(),
		}
	}
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Actor {
	#[error("Actor is not ready.")]
	NotReady,

	#[error("Actor is stopping.")]
	Stopping,

	#[error("Actor aborted the operation.")]
	Aborted,

	#[error("Unreachable.")]
	Unreachable,

	#[error("Internal error: {message}")]
	Internal { message: String },
}

impl TypedError for Actor {
	fn group(&self) -> &'static str {
		"actor"
	}

	fn code(&self) -> &'static str {
		match self {
			Actor::NotReady => "not_ready",
			Actor::Stopping => "stopping",
			Actor::Aborted => "aborted",
			Actor::Unreachable => "unreachable",
			Actor::Internal { .. } => "internal",
		}
	}
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Action {
	#[error("Action '{name}' not found.")]
	NotFound { name: String },

	#[error("Action timed out.")]
	TimedOut,
}

impl TypedError for Action {
	fn group(&self) -> &'static str {
		"action"
	}

	fn code(&self) -> &'static str {
		match self {
			Action::NotFound { .. } => "not_found",
			Action::TimedOut => "timed_out",
		}
	}

	fn metadata(&self) -> Option<serde_json::Value> {
		match self {
			Action::NotFound { name } => Some(json!({ "name": name })),
			Action::TimedOut => None,
		}
	}
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum State {
	#[error("State is not enabled for this actor.")]
	NotEnabled,

	#[error("Vars are not enabled for this actor.")]
	VarsNotEnabled,

	#[error("Database is not enabled for this actor.")]
	DatabaseNotEnabled,

	#[error("Connection state is not enabled for this actor.")]
	ConnStateNotEnabled,

	#[error("Invalid state value at {path}.")]
	InvalidType { path: String },
}

impl TypedError for State {
	fn group(&self) -> &'static str {
		"state"
	}

	fn code(&self) -> &'static str {
		match self {
			State::NotEnabled => "not_enabled",
			State::VarsNotEnabled => "vars_not_enabled",
			State::DatabaseNotEnabled => "database_not_enabled",
			State::ConnStateNotEnabled => "conn_state_not_enabled",
			State::InvalidType { .. } => "invalid_type",
		}
	}

	fn metadata(&self) -> Option<serde_json::Value> {
		match self {
			State::InvalidType { path } => Some(json!({ "path": path })),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Request {
	#[error("No request handler is defined for this actor.")]
	HandlerNotDefined,

	#[error("The request handler did not return a response.")]
	InvalidHandlerResponse,

	#[error("No fetch handler is defined for this actor.")]
	FetchHandlerNotDefined,

	#[error("Forbidden.")]
	Forbidden,

	#[error("canInvoke returned an invalid response.")]
	InvalidCanInvokeResponse,
}

impl TypedError for Request {
	fn group(&self) -> &'static str {
		"request"
	}

	fn code(&self) -> &'static str {
		match self {
			Request::HandlerNotDefined => "handler_not_defined",
			Request::InvalidHandlerResponse => "invalid_handler_response",
			Request::FetchHandlerNotDefined => "fetch_handler_not_defined",
			Request::Forbidden => "forbidden",
			Request::InvalidCanInvokeResponse => "invalid_can_invoke_response",
		}
	}
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Queue {
	#[error("Queue is full (max {max} messages).")]
	Full { max: usize },

	#[error("Queue message is not serializable at {path}.")]
	MessageInvalid { path: String },

	#[error("Queue message too large ({size} > {limit}).")]
	MessageTooLarge { size: usize, limit: usize },

	#[error("A received message is already pending completion.")]
	MessagePending,

	#[error("Queue message was already completed.")]
	AlreadyCompleted,
}

impl TypedError for Queue {
	fn group(&self) -> &'static str {
		"queue"
	}

	fn code(&self) -> &'static str {
		match self {
			Queue::Full { .. } => "full",
			Queue::MessageInvalid { .. } => "message_invalid",
			Queue::MessageTooLarge { .. } => "message_too_large",
			Queue::MessagePending => "message_pending",
			Queue::AlreadyCompleted => "already_completed",
		}
	}

	fn metadata(&self) -> Option<serde_json::Value> {
		match self {
			Queue::Full { max } => Some(json!({ "max": max })),
			Queue::MessageInvalid { path } => Some(json!({ "path": path })),
			Queue::MessageTooLarge { size, limit } => {
				Some(json!({ "size": size, "limit": limit }))
			}
			_ => None,
		}
	}
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Message {
	#[error("Outgoing message too long ({size} > {limit}).")]
	OutgoingMessageTooLong { size: usize, limit: usize },
}

impl TypedError for Message {
	fn group(&self) -> &'static str {
		"message"
	}

	fn code(&self) -> &'static str {
		match self {
			Message::OutgoingMessageTooLong { .. } => "outgoing_message_too_long",
		}
	}

	fn metadata(&self) -> Option<serde_json::Value> {
		match self {
			Message::OutgoingMessageTooLong { size, limit } => {
				Some(json!({ "size": size, "limit": limit }))
			}
		}
	}
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Kv {
	#[error("KV key too large ({size} > {limit}).")]
	KeyTooLarge { size: usize, limit: usize },

	#[error("KV value too large ({size} > {limit}).")]
	ValueTooLarge { size: usize, limit: usize },
}

impl TypedError for Kv {
	fn group(&self) -> &'static str {
		"kv"
	}

	fn code(&self) -> &'static str {
		match self {
			Kv::KeyTooLarge { .. } => "key_too_large",
			Kv::ValueTooLarge { .. } => "value_too_large",
		}
	}
}

/// Deadline errors for user lifecycle hooks, distinct from errors the hook
/// itself returns.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Hook {
	#[error("Hook '{hook}' timed out.")]
	TimedOut { hook: &'static str },
}

impl TypedError for Hook {
	fn group(&self) -> &'static str {
		"hook"
	}

	fn code(&self) -> &'static str {
		match self {
			Hook::TimedOut { .. } => "timed_out",
		}
	}

	fn metadata(&self) -> Option<serde_json::Value> {
		match self {
			Hook::TimedOut { hook } => Some(json!({ "hook": hook })),
		}
	}
}

/// Converts any error into its wire payload, falling back to an opaque
/// internal error so internals never leak.
pub fn to_payload(err: &anyhow::Error) -> ErrorPayload {
	macro_rules! try_downcast {
		($($ty:ty),* $(,)?) => {
			$(
				if let Some(err) = err.downcast_ref::<$ty>() {
					return err.payload();
				}
			)*
		};
	}

	try_downcast!(Actor, Action, State, Request, Queue, Message, Kv, Hook);

	if let Some(err) = err.downcast_ref::<hearth_protocol::ProtocolError>() {
		if let hearth_protocol::ProtocolError::MessageTooLong { size, limit } = err {
			return Message::OutgoingMessageTooLong {
				size: *size,
				limit: *limit,
			}
			.payload();
		}
	}

	ErrorPayload {
		group: "actor".to_string(),
		code: "internal".to_string(),
		message: "Internal error.".to_string(),
		metadata: None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn payload_carries_group_and_code() {
		let err = anyhow::Error::from(Queue::MessageTooLarge {
			size: 2048,
			limit: 1024,
		});
		let payload = to_payload(&err);
		assert_eq!(payload.group, "queue");
		assert_eq!(payload.code, "message_too_large");
		assert_eq!(payload.metadata.unwrap()["limit"], 1024);
	}

	#[test]
	fn unknown_errors_are_opaque() {
		let err = anyhow::anyhow!("kv backend exploded at /var/data");
		let payload = to_payload(&err);
		assert_eq!(payload.code, "internal");
		assert!(!payload.message.contains("/var/data"));
	}
}
