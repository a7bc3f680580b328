//! Key namespaces within an actor's KV space.
//!
//! Every actor owns a single KV namespace scoped by the driver; all keys in
//! it are built from the single-byte prefixes below. Queue message keys use
//! big-endian ids so prefix iteration yields messages in id order.

use anyhow::{Context, Result, ensure};
use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

pub const PERSIST_DATA: u8 = 0x01;
pub const CONN_PREFIX: u8 = 0x02;
pub const INSPECTOR_TOKEN: u8 = 0x03;
pub const USER_KV: u8 = 0x04;
pub const QUEUE_PREFIX: u8 = 0x05;
pub const QUEUE_METADATA: u8 = 0x06;
/// Reserved for the trace exporter.
pub const TRACES_PREFIX: u8 = 0x07;
/// Reserved for drivers embedding a SQL database in the actor's namespace.
pub const SQLITE_PREFIX: u8 = 0x08;

pub fn persist_data() -> Bytes {
	Bytes::from_static(&[PERSIST_DATA])
}

pub fn inspector_token() -> Bytes {
	Bytes::from_static(&[INSPECTOR_TOKEN])
}

pub fn queue_metadata() -> Bytes {
	Bytes::from_static(&[QUEUE_METADATA])
}

pub fn conn_prefix() -> Bytes {
	Bytes::from_static(&[CONN_PREFIX])
}

pub fn conn(conn_id: Uuid) -> Bytes {
	let id = conn_id.to_string();
	let mut buf = BytesMut::with_capacity(1 + id.len());
	buf.put_u8(CONN_PREFIX);
	buf.put_slice(id.as_bytes());
	buf.freeze()
}

pub fn conn_id_from_key(key: &[u8]) -> Result<Uuid> {
	ensure!(
		key.first() == Some(&CONN_PREFIX),
		"not a connection key: {key:?}"
	);
	let id = std::str::from_utf8(&key[1..]).context("connection key is not utf8")?;
	id.parse().context("connection key is not a uuid")
}

pub fn queue_prefix() -> Bytes {
	Bytes::from_static(&[QUEUE_PREFIX])
}

pub fn queue_message(id: u64) -> Bytes {
	let mut buf = BytesMut::with_capacity(9);
	buf.put_u8(QUEUE_PREFIX);
	buf.put_u64(id);
	buf.freeze()
}

pub fn queue_id_from_key(key: &[u8]) -> Result<u64> {
	ensure!(
		key.first() == Some(&QUEUE_PREFIX) && key.len() == 9,
		"not a queue message key: {key:?}"
	);
	Ok(u64::from_be_bytes(key[1..9].try_into()?))
}

pub fn user_kv_prefix() -> Bytes {
	Bytes::from_static(&[USER_KV])
}

pub fn user_kv(key: &[u8]) -> Bytes {
	let mut buf = BytesMut::with_capacity(1 + key.len());
	buf.put_u8(USER_KV);
	buf.put_slice(key);
	buf.freeze()
}

pub fn strip_user_kv(key: &[u8]) -> Option<&[u8]> {
	key.strip_prefix(&[USER_KV])
}
