use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use hearth_memory_driver::MemoryDriver;
use hearth_runtime::context::ActionContext;
use hearth_runtime::definition::{ActorDefinition, Types};
use hearth_runtime::errors;
use hearth_runtime::instance::InstanceStatus;
use hearth_runtime::keys;
use hearth_runtime::options::RunnerOptions;
use hearth_runtime::persist;
use serde_json::{Value, json};

mod common;
use common::*;

fn no_sleep_options() -> RunnerOptions {
	RunnerOptions {
		no_sleep: Some(true),
		..Default::default()
	}
}

#[tokio::test(flavor = "multi_thread")]
async fn counter_actions_persist_state() -> Result<()> {
	setup_tracing();
	let driver = MemoryDriver::new();
	let actor_id = test_actor_id("counter");
	let instance =
		start_instance(&driver, counter_definition(no_sleep_options()), &actor_id).await?;

	let out = instance
		.execute_action(None, "increment", vec![json!(1)])
		.await?;
	assert_eq!(out, json!(1));
	let out = instance
		.execute_action(None, "increment", vec![json!(1)])
		.await?;
	assert_eq!(out, json!(2));

	let out = instance.execute_action(None, "get_count", vec![]).await?;
	assert_eq!(out, json!(2));

	// Persisted blob carries the committed state
	instance.state_mgr().save_state(true).await?;
	let buf = driver
		.raw_get(&actor_id, &keys::persist_data())
		.expect("actor blob missing");
	let (persisted, _) = persist::decode_actor::<CounterTypes>(&buf)?;
	assert!(persisted.has_initialized);
	assert_eq!(persisted.state.unwrap().count, 2);

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn create_state_runs_once_across_restarts() -> Result<()> {
	setup_tracing();
	let driver = MemoryDriver::new();
	let actor_id = test_actor_id("create-once");

	let creates = Arc::new(AtomicUsize::new(0));
	let wakes = Arc::new(AtomicUsize::new(0));
	let definition = {
		let creates = creates.clone();
		let wakes = wakes.clone();
		ActorDefinition::<CounterTypes>::builder()
			.options(no_sleep_options())
			.create_state(move |_ctx| {
				let creates = creates.clone();
				async move {
					creates.fetch_add(1, Ordering::SeqCst);
					Ok(CounterState { count: 10 })
				}
			})
			.on_wake(move |_ctx| {
				let wakes = wakes.clone();
				async move {
					wakes.fetch_add(1, Ordering::SeqCst);
					Ok(())
				}
			})
			.action("get_count", |ctx: ActionContext<CounterTypes>, _args| async move {
				Ok(json!(ctx.state()?.count))
			})
			.build()
	};

	let instance = start_instance(&driver, definition.clone(), &actor_id).await?;
	assert_eq!(creates.load(Ordering::SeqCst), 1);
	assert_eq!(wakes.load(Ordering::SeqCst), 1);
	instance
		.on_stop(hearth_runtime::driver::StopIntent::Sleep)
		.await?;
	assert_eq!(instance.status(), InstanceStatus::Stopped);

	// Reload skips creation but wakes again
	let instance = start_instance(&driver, definition, &actor_id).await?;
	assert_eq!(creates.load(Ordering::SeqCst), 1);
	assert_eq!(wakes.load(Ordering::SeqCst), 2);
	let out = instance.execute_action(None, "get_count", vec![]).await?;
	assert_eq!(out, json!(10));

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_action_and_timeout() -> Result<()> {
	setup_tracing();
	let driver = MemoryDriver::new();
	let actor_id = test_actor_id("timeouts");

	let definition = ActorDefinition::<CounterTypes>::builder()
		.options(RunnerOptions {
			no_sleep: Some(true),
			action_timeout: Some(50),
			..Default::default()
		})
		.initial_state(CounterState::default())
		.action("slow", |_ctx: ActionContext<CounterTypes>, _args| async move {
			tokio::time::sleep(Duration::from_millis(500)).await;
			Ok(Value::Null)
		})
		.build();

	let instance = start_instance(&driver, definition, &actor_id).await?;

	let err = instance
		.execute_action(None, "nope", vec![])
		.await
		.unwrap_err();
	assert!(matches!(
		err.downcast_ref::<errors::Action>(),
		Some(errors::Action::NotFound { .. })
	));

	let err = instance
		.execute_action(None, "slow", vec![])
		.await
		.unwrap_err();
	assert!(matches!(
		err.downcast_ref::<errors::Action>(),
		Some(errors::Action::TimedOut)
	));

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn before_action_response_maps_output_and_swallows_errors() -> Result<()> {
	setup_tracing();
	let driver = MemoryDriver::new();
	let actor_id = test_actor_id("before-response");

	let definition = ActorDefinition::<CounterTypes>::builder()
		.options(no_sleep_options())
		.initial_state(CounterState::default())
		.action("ok", |_ctx: ActionContext<CounterTypes>, _args| async move {
			Ok(json!({ "value": 1 }))
		})
		.action("fail_hook", |_ctx: ActionContext<CounterTypes>, _args| async move {
			Ok(json!("untouched"))
		})
		.on_before_action_response(|_ctx, name, output| async move {
			if name == "fail_hook" {
				anyhow::bail!("hook exploded");
			}
			Ok(json!({ "wrapped": output }))
		})
		.build();

	let instance = start_instance(&driver, definition, &actor_id).await?;

	let out = instance.execute_action(None, "ok", vec![]).await?;
	assert_eq!(out, json!({ "wrapped": { "value": 1 } }));

	// Hook errors are logged; the original output comes back
	let out = instance.execute_action(None, "fail_hook", vec![]).await?;
	assert_eq!(out, json!("untouched"));

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn run_exit_destroys_actor() -> Result<()> {
	setup_tracing();
	let driver = MemoryDriver::new();
	let actor_id = test_actor_id("run-crash");

	let definition = ActorDefinition::<Types<CounterState>>::builder()
		.options(no_sleep_options())
		.initial_state(CounterState::default())
		.run(|_ctx| async move { anyhow::bail!("boom") })
		.build();

	let instance = start_instance(&driver, definition, &actor_id).await?;

	assert!(
		wait_for(2_000, || driver.start_destroy_calls(&actor_id) == 1).await,
		"run crash should destroy the actor"
	);
	assert!(wait_for(2_000, || instance.status() == InstanceStatus::Stopped).await);

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn sleep_fires_once_after_idle() -> Result<()> {
	setup_tracing();
	let driver = MemoryDriver::new();
	let actor_id = test_actor_id("sleepy");

	let definition = counter_definition(RunnerOptions {
		sleep_timeout: Some(50),
		..Default::default()
	});
	let instance = start_instance(&driver, definition, &actor_id).await?;

	assert!(
		wait_for(2_000, || driver.start_sleep_calls(&actor_id) == 1).await,
		"idle actor should request sleep"
	);
	// One-shot: no repeat dispatch
	tokio::time::sleep(Duration::from_millis(200)).await;
	assert_eq!(driver.start_sleep_calls(&actor_id), 1);
	assert!(wait_for(2_000, || instance.status() == InstanceStatus::Stopped).await);

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn open_connection_cancels_sleep() -> Result<()> {
	setup_tracing();
	let driver = MemoryDriver::new();
	let actor_id = test_actor_id("conn-awake");

	let definition = counter_definition(RunnerOptions {
		sleep_timeout: Some(100),
		..Default::default()
	});
	let instance = start_instance(&driver, definition, &actor_id).await?;

	// Connect before the idle timer fires
	let prepared = instance
		.conns()
		.prepare_conn(TestSocket::framed(), None, None)
		.await?;
	let conn = prepared.conn().clone();
	instance.conns().connect_conn(conn.clone()).await?;

	tokio::time::sleep(Duration::from_millis(300)).await;
	assert_eq!(
		driver.start_sleep_calls(&actor_id),
		0,
		"live connection must block sleep"
	);

	// Dropping the connection re-arms the timer
	instance.conns().disconnect_conn(&conn, None).await?;
	assert!(wait_for(2_000, || driver.start_sleep_calls(&actor_id) == 1).await);

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn keep_awake_defers_sleep() -> Result<()> {
	setup_tracing();
	let driver = MemoryDriver::new();
	let actor_id = test_actor_id("awake");

	let definition = counter_definition(RunnerOptions {
		sleep_timeout: Some(50),
		..Default::default()
	});
	let instance = start_instance(&driver, definition, &actor_id).await?;

	let held = instance.schedule_keep_awake(async {
		tokio::time::sleep(Duration::from_millis(300)).await;
	});

	tokio::time::sleep(Duration::from_millis(150)).await;
	assert_eq!(
		driver.start_sleep_calls(&actor_id),
		0,
		"keep-awake must hold off the sleep timer"
	);

	held.await;
	assert!(wait_for(2_000, || driver.start_sleep_calls(&actor_id) == 1).await);

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn not_ready_and_stopping_are_rejected() -> Result<()> {
	setup_tracing();
	let driver = MemoryDriver::new();
	let actor_id = test_actor_id("gates");
	let definition = counter_definition(no_sleep_options());

	// Before start
	let instance = hearth_runtime::instance::ActorInstance::new(
		driver.clone(),
		definition.clone(),
		&actor_id,
		"test",
		vec![],
		None,
	);
	let err = instance
		.execute_action(None, "get_count", vec![])
		.await
		.unwrap_err();
	assert!(matches!(
		err.downcast_ref::<errors::Actor>(),
		Some(errors::Actor::NotReady)
	));

	// After stop
	let instance = start_instance(&driver, definition, &actor_id).await?;
	instance
		.on_stop(hearth_runtime::driver::StopIntent::Sleep)
		.await?;
	let err = instance
		.execute_action(None, "get_count", vec![])
		.await
		.unwrap_err();
	assert!(matches!(
		err.downcast_ref::<errors::Actor>(),
		Some(errors::Actor::Stopping)
	));

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn on_state_change_fires_with_reentry_guard() -> Result<()> {
	setup_tracing();
	let driver = MemoryDriver::new();
	let actor_id = test_actor_id("state-change");

	let changes = Arc::new(AtomicUsize::new(0));
	let definition = {
		let changes = changes.clone();
		ActorDefinition::<CounterTypes>::builder()
			.options(no_sleep_options())
			.initial_state(CounterState::default())
			.on_state_change(move |ctx, _state| {
				changes.fetch_add(1, Ordering::SeqCst);
				// Re-entrant mutation must not recurse
				let _ = ctx.update_state(|state| state.count += 100);
			})
			.action("bump", |ctx: ActionContext<CounterTypes>, _args| async move {
				ctx.update_state(|state| state.count += 1)?;
				Ok(Value::Null)
			})
			.build()
	};

	let instance = start_instance(&driver, definition, &actor_id).await?;
	instance.execute_action(None, "bump", vec![]).await?;

	assert_eq!(changes.load(Ordering::SeqCst), 1);
	Ok(())
}
