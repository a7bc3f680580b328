//! Actor definitions: the typed state/params bundle plus the handler map and
//! lifecycle hooks registered by user code.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use futures_util::future::BoxFuture;
use hearth_protocol::{RawRequest, RawResponse};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::conn::Conn;
use crate::context::{ActionContext, ActorContext, ConnSetupContext, CreateContext};
use crate::options::RunnerOptions;

/// Bundle of the user-visible types a definition is generic over. Use
/// [`Types`] to assemble one without writing an impl by hand.
pub trait ActorTypes: 'static {
	type State: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
	type ConnParams: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
	type ConnState: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
	type Input: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
	type Vars: Send + Sync + 'static;
}

/// `Types<State, ConnParams, ConnState, Input, Vars>` with `()` defaults.
pub struct Types<S = (), CP = (), CS = (), I = (), V = ()> {
	_marker: PhantomData<fn() -> (S, CP, CS, I, V)>,
}

impl<S, CP, CS, I, V> ActorTypes for Types<S, CP, CS, I, V>
where
	S: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
	CP: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
	CS: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
	I: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
	V: Send + Sync + 'static,
{
	type State = S;
	type ConnParams = CP;
	type ConnState = CS;
	type Input = I;
	type Vars = V;
}

pub(crate) type BoxFut<T> = BoxFuture<'static, T>;

pub(crate) type CreateStateFn<T> =
	Arc<dyn Fn(CreateContext<T>) -> BoxFut<Result<<T as ActorTypes>::State>> + Send + Sync>;
pub(crate) type CreateVarsFn<T> =
	Arc<dyn Fn(CreateContext<T>) -> BoxFut<Result<<T as ActorTypes>::Vars>> + Send + Sync>;
pub(crate) type CreateConnStateFn<T> =
	Arc<dyn Fn(ConnSetupContext<T>) -> BoxFut<Result<<T as ActorTypes>::ConnState>> + Send + Sync>;
pub(crate) type BeforeConnectFn<T> =
	Arc<dyn Fn(ConnSetupContext<T>) -> BoxFut<Result<()>> + Send + Sync>;
pub(crate) type ActionFn<T> =
	Arc<dyn Fn(ActionContext<T>, Vec<Value>) -> BoxFut<Result<Value>> + Send + Sync>;
pub(crate) type LifecycleFn<T> = Arc<dyn Fn(ActorContext<T>) -> BoxFut<Result<()>> + Send + Sync>;
pub(crate) type ConnLifecycleFn<T> =
	Arc<dyn Fn(ActorContext<T>, Arc<Conn<T>>) -> BoxFut<Result<()>> + Send + Sync>;
pub(crate) type StateChangeFn<T> =
	Arc<dyn for<'a> Fn(ActorContext<T>, &'a <T as ActorTypes>::State) + Send + Sync>;
pub(crate) type BeforeActionResponseFn<T> =
	Arc<dyn Fn(ActorContext<T>, String, Value) -> BoxFut<Result<Value>> + Send + Sync>;
pub(crate) type RequestFn<T> =
	Arc<dyn Fn(ActionContext<T>, RawRequest) -> BoxFut<Result<Option<RawResponse>>> + Send + Sync>;
pub(crate) type WebSocketFn<T> =
	Arc<dyn Fn(ActionContext<T>, Option<RawRequest>) -> BoxFut<Result<()>> + Send + Sync>;

pub struct ActorDefinition<T: ActorTypes> {
	pub(crate) options: RunnerOptions,

	pub(crate) initial_state: Option<T::State>,
	pub(crate) create_state: Option<CreateStateFn<T>>,
	pub(crate) initial_conn_state: Option<T::ConnState>,
	pub(crate) create_conn_state: Option<CreateConnStateFn<T>>,
	pub(crate) create_vars: Option<CreateVarsFn<T>>,

	pub(crate) actions: HashMap<String, ActionFn<T>>,

	pub(crate) on_create: Option<LifecycleFn<T>>,
	pub(crate) on_wake: Option<LifecycleFn<T>>,
	pub(crate) on_sleep: Option<LifecycleFn<T>>,
	pub(crate) on_destroy: Option<LifecycleFn<T>>,
	pub(crate) on_before_connect: Option<BeforeConnectFn<T>>,
	pub(crate) on_connect: Option<ConnLifecycleFn<T>>,
	pub(crate) on_disconnect: Option<ConnLifecycleFn<T>>,
	pub(crate) on_state_change: Option<StateChangeFn<T>>,
	pub(crate) on_before_action_response: Option<BeforeActionResponseFn<T>>,
	pub(crate) on_request: Option<RequestFn<T>>,
	pub(crate) on_websocket: Option<WebSocketFn<T>>,
	pub(crate) run: Option<LifecycleFn<T>>,
}

impl<T: ActorTypes> ActorDefinition<T> {
	pub fn builder() -> ActorDefinitionBuilder<T> {
		ActorDefinitionBuilder {
			def: ActorDefinition {
				options: RunnerOptions::default(),
				initial_state: None,
				create_state: None,
				initial_conn_state: None,
				create_conn_state: None,
				create_vars: None,
				actions: HashMap::new(),
				on_create: None,
				on_wake: None,
				on_sleep: None,
				on_destroy: None,
				on_before_connect: None,
				on_connect: None,
				on_disconnect: None,
				on_state_change: None,
				on_before_action_response: None,
				on_request: None,
				on_websocket: None,
				run: None,
			},
		}
	}

	pub fn options(&self) -> &RunnerOptions {
		&self.options
	}

	pub fn state_enabled(&self) -> bool {
		self.initial_state.is_some() || self.create_state.is_some()
	}

	pub fn conn_state_enabled(&self) -> bool {
		self.initial_conn_state.is_some() || self.create_conn_state.is_some()
	}

	pub fn vars_enabled(&self) -> bool {
		self.create_vars.is_some()
	}
}

pub struct ActorDefinitionBuilder<T: ActorTypes> {
	def: ActorDefinition<T>,
}

impl<T: ActorTypes> ActorDefinitionBuilder<T> {
	pub fn options(mut self, options: RunnerOptions) -> Self {
		self.def.options = options;
		self
	}

	/// Enables state with a static initial value, cloned at first create.
	pub fn initial_state(mut self, state: T::State) -> Self {
		self.def.initial_state = Some(state);
		self
	}

	/// Enables state with a hook invoked once at first create.
	pub fn create_state<F, Fut>(mut self, f: F) -> Self
	where
		F: Fn(CreateContext<T>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<T::State>> + Send + 'static,
	{
		self.def.create_state = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
		self
	}

	pub fn initial_conn_state(mut self, state: T::ConnState) -> Self {
		self.def.initial_conn_state = Some(state);
		self
	}

	pub fn create_conn_state<F, Fut>(mut self, f: F) -> Self
	where
		F: Fn(ConnSetupContext<T>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<T::ConnState>> + Send + 'static,
	{
		self.def.create_conn_state = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
		self
	}

	pub fn create_vars<F, Fut>(mut self, f: F) -> Self
	where
		F: Fn(CreateContext<T>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<T::Vars>> + Send + 'static,
	{
		self.def.create_vars = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
		self
	}

	pub fn action<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
	where
		F: Fn(ActionContext<T>, Vec<Value>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Value>> + Send + 'static,
	{
		self.def
			.actions
			.insert(name.into(), Arc::new(move |ctx, args| Box::pin(f(ctx, args))));
		self
	}

	pub fn on_create<F, Fut>(mut self, f: F) -> Self
	where
		F: Fn(ActorContext<T>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		self.def.on_create = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
		self
	}

	pub fn on_wake<F, Fut>(mut self, f: F) -> Self
	where
		F: Fn(ActorContext<T>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		self.def.on_wake = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
		self
	}

	pub fn on_sleep<F, Fut>(mut self, f: F) -> Self
	where
		F: Fn(ActorContext<T>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		self.def.on_sleep = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
		self
	}

	pub fn on_destroy<F, Fut>(mut self, f: F) -> Self
	where
		F: Fn(ActorContext<T>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		self.def.on_destroy = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
		self
	}

	/// Gate invoked before a new connection is prepared; an error rejects the
	/// connection.
	pub fn on_before_connect<F, Fut>(mut self, f: F) -> Self
	where
		F: Fn(ConnSetupContext<T>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		self.def.on_before_connect = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
		self
	}

	pub fn on_connect<F, Fut>(mut self, f: F) -> Self
	where
		F: Fn(ActorContext<T>, Arc<Conn<T>>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		self.def.on_connect = Some(Arc::new(move |ctx, conn| Box::pin(f(ctx, conn))));
		self
	}

	/// Errors from this hook are logged and swallowed.
	pub fn on_disconnect<F, Fut>(mut self, f: F) -> Self
	where
		F: Fn(ActorContext<T>, Arc<Conn<T>>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		self.def.on_disconnect = Some(Arc::new(move |ctx, conn| Box::pin(f(ctx, conn))));
		self
	}

	/// Invoked with the committed state after every actor-state mutation.
	pub fn on_state_change<F>(mut self, f: F) -> Self
	where
		F: for<'a> Fn(ActorContext<T>, &'a T::State) + Send + Sync + 'static,
	{
		self.def.on_state_change = Some(Arc::new(f));
		self
	}

	/// Maps an action's output before it is returned. Errors are logged and
	/// the original output is returned unchanged.
	pub fn on_before_action_response<F, Fut>(mut self, f: F) -> Self
	where
		F: Fn(ActorContext<T>, String, Value) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Value>> + Send + 'static,
	{
		self.def.on_before_action_response =
			Some(Arc::new(move |ctx, name, output| Box::pin(f(ctx, name, output))));
		self
	}

	pub fn on_request<F, Fut>(mut self, f: F) -> Self
	where
		F: Fn(ActionContext<T>, RawRequest) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Option<RawResponse>>> + Send + 'static,
	{
		self.def.on_request = Some(Arc::new(move |ctx, req| Box::pin(f(ctx, req))));
		self
	}

	pub fn on_websocket<F, Fut>(mut self, f: F) -> Self
	where
		F: Fn(ActionContext<T>, Option<RawRequest>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		self.def.on_websocket = Some(Arc::new(move |ctx, req| Box::pin(f(ctx, req))));
		self
	}

	/// Long-lived background handler launched after start. A spontaneous exit
	/// while the actor is not stopping is treated as a crash.
	pub fn run<F, Fut>(mut self, f: F) -> Self
	where
		F: Fn(ActorContext<T>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		self.def.run = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
		self
	}

	pub fn build(self) -> Arc<ActorDefinition<T>> {
		Arc::new(self.def)
	}
}
