//! Per-instance actor runtime: state persistence with throttled batching,
//! connection lifecycle (including websocket hibernation), event
//! subscriptions, a scheduled-event timeline, a durable message queue, and
//! the sleep arbiter that coordinates all of them.
//!
//! The transport layer (request routing, websocket upgrades, wire framing)
//! and the KV storage backend live behind the traits in [`driver`].

pub mod conn;
pub mod connections;
pub mod context;
pub mod definition;
pub mod driver;
pub mod errors;
pub mod events;
mod hooks;
pub mod inspector;
pub mod instance;
pub mod keys;
pub mod kv;
pub mod options;
pub mod persist;
pub mod queue;
pub mod schedule;
pub mod sleep;
pub mod state;

pub use conn::{Conn, ConnDriver, ConnKind};
pub use connections::PreparedConn;
pub use context::{ActionContext, ActorContext, ActorIdentity, ConnSetupContext, CreateContext};
pub use definition::{ActorDefinition, ActorDefinitionBuilder, ActorTypes, Types};
pub use driver::{ActorCallbacks, ActorDriver, ActorHandle, DriverHandle, StopIntent};
pub use inspector::{Inspector, InspectorSnapshot};
pub use instance::{ActorInstance, InstanceStatus};
pub use kv::ActorKv;
pub use options::RunnerOptions;
pub use queue::{EnqueueOptions, QueueCompletion, QueueManager, ReceiveOptions, ReceiveResult};
pub use sleep::{CanSleep, Counters};
