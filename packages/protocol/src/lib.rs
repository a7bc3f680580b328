//! Framed wire messages exchanged between clients and a single actor.
//!
//! The network framing itself (CBOR vs JSON negotiation, websocket upgrade)
//! lives in the transport layer; this crate only defines the message shapes
//! and the JSON codec used for persistence-adjacent encoding.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const PROTOCOL_VERSION: u16 = 1;

/// Messages sent from the actor to a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ToClient {
	/// First message sent on a framed connection after it is registered.
	#[serde(rename_all = "camelCase")]
	Init {
		actor_id: String,
		connection_id: Uuid,
	},
	#[serde(rename_all = "camelCase")]
	ActionResponse { id: i64, output: Value },
	#[serde(rename_all = "camelCase")]
	Error {
		error: ErrorPayload,
		/// Set when the error terminates a specific in-flight action.
		#[serde(default, skip_serializing_if = "Option::is_none")]
		action_id: Option<i64>,
	},
	#[serde(rename_all = "camelCase")]
	Event { name: String, args: Vec<Value> },
}

/// Messages sent from a connection to the actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ToServer {
	#[serde(rename_all = "camelCase")]
	ActionRequest {
		id: i64,
		name: String,
		#[serde(default)]
		args: Vec<Value>,
	},
	#[serde(rename_all = "camelCase")]
	SubscriptionRequest { event_name: String, subscribe: bool },
}

/// Machine-readable error surfaced over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
	pub group: String,
	pub code: String,
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub metadata: Option<Value>,
}

/// A raw HTTP request forwarded to an actor's request handler. The transport
/// layer owns the real connection; only the shape crosses into the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRequest {
	pub method: String,
	pub path: String,
	#[serde(default)]
	pub headers: Vec<(String, String)>,
	#[serde(default, skip_serializing_if = "Bytes::is_empty", with = "raw_body")]
	pub body: Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawResponse {
	pub status: u16,
	#[serde(default)]
	pub headers: Vec<(String, String)>,
	#[serde(default, skip_serializing_if = "Bytes::is_empty", with = "raw_body")]
	pub body: Bytes,
}

impl RawResponse {
	pub fn new(status: u16) -> Self {
		RawResponse {
			status,
			headers: Vec::new(),
			body: Bytes::new(),
		}
	}

	pub fn with_body(status: u16, body: impl Into<Bytes>) -> Self {
		RawResponse {
			status,
			headers: Vec::new(),
			body: body.into(),
		}
	}
}

mod raw_body {
	use bytes::Bytes;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(body: &Bytes, ser: S) -> Result<S::Ok, S::Error> {
		ser.serialize_bytes(body)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Bytes, D::Error> {
		let buf = Vec::<u8>::deserialize(de)?;
		Ok(Bytes::from(buf))
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
	#[error("outgoing message too long ({size} > {limit})")]
	MessageTooLong { size: usize, limit: usize },
	#[error("malformed message: {0}")]
	Malformed(#[from] serde_json::Error),
}

/// Encodes a message, enforcing the outgoing size limit.
pub fn encode_to_client(msg: &ToClient, limit: usize) -> Result<Bytes, ProtocolError> {
	let buf = serde_json::to_vec(msg)?;
	if buf.len() > limit {
		return Err(ProtocolError::MessageTooLong {
			size: buf.len(),
			limit,
		});
	}
	Ok(Bytes::from(buf))
}

pub fn decode_to_server(buf: &[u8]) -> Result<ToServer, ProtocolError> {
	Ok(serde_json::from_slice(buf)?)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn action_request_round_trip() {
		let buf = br#"{"type":"actionRequest","id":4,"name":"increment","args":[1]}"#;
		let msg = decode_to_server(buf).unwrap();
		match msg {
			ToServer::ActionRequest { id, name, args } => {
				assert_eq!(id, 4);
				assert_eq!(name, "increment");
				assert_eq!(args, vec![serde_json::json!(1)]);
			}
			other => panic!("unexpected message: {other:?}"),
		}
	}

	#[test]
	fn encode_enforces_limit() {
		let msg = ToClient::Event {
			name: "spam".into(),
			args: vec![serde_json::json!("x".repeat(1024))],
		};
		let err = encode_to_client(&msg, 64).unwrap_err();
		match err {
			ProtocolError::MessageTooLong { size, limit } => {
				assert!(size > limit);
				assert_eq!(limit, 64);
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}
}
