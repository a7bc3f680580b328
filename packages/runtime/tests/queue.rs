use std::time::Duration;

use anyhow::Result;
use hearth_memory_driver::MemoryDriver;
use hearth_runtime::errors;
use hearth_runtime::keys;
use hearth_runtime::options::RunnerOptions;
use hearth_runtime::persist;
use hearth_runtime::queue::{EnqueueOptions, QueueCompletion, ReceiveOptions};
use hearth_util::timestamp;
use serde_json::json;
use tokio_util::sync::CancellationToken;

mod common;
use common::*;

fn options() -> RunnerOptions {
	RunnerOptions {
		no_sleep: Some(true),
		..Default::default()
	}
}

fn queue_rows(driver: &MemoryDriver, actor_id: &str) -> usize {
	driver
		.dump(actor_id)
		.into_iter()
		.filter(|(key, _)| key.first() == Some(&keys::QUEUE_PREFIX))
		.count()
}

#[tokio::test(flavor = "multi_thread")]
async fn enqueue_and_wait_resolves_on_complete() -> Result<()> {
	setup_tracing();
	let driver = MemoryDriver::new();
	let actor_id = test_actor_id("completion");
	let instance = start_instance(&driver, counter_definition(options()), &actor_id).await?;
	let queue = instance.queue();

	let recv_task = tokio::spawn({
		let queue = queue.clone();
		async move {
			queue
				.receive(ReceiveOptions {
					names: vec!["q".into()],
					count: 1,
					timeout: Some(Duration::from_millis(1_000)),
					signal: None,
					wait: true,
				})
				.await
		}
	});

	tokio::time::sleep(Duration::from_millis(50)).await;
	let wait_task = tokio::spawn({
		let queue = queue.clone();
		async move {
			queue
				.enqueue_and_wait("q", &json!({ "x": 1 }), Duration::from_millis(5_000))
				.await
		}
	});

	let received = recv_task.await??;
	assert_eq!(received.messages.len(), 1);
	let msg = &received.messages[0];
	assert_eq!(received.pending, Some(msg.id));
	assert!(msg.in_flight);
	assert_eq!(msg.body, json!({ "x": 1 }));

	queue.complete(msg.id, Some(json!({ "ok": true }))).await?;

	let completion = wait_task.await??;
	match completion {
		QueueCompletion::Completed { response } => {
			assert_eq!(response, Some(json!({ "ok": true })));
		}
		other => panic!("unexpected completion: {other:?}"),
	}

	assert_eq!(queue.size(), 0);
	assert_eq!(queue_rows(&driver, &actor_id), 0);
	assert_eq!(queue.pending_message_id(), None);

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn in_flight_recovery_after_crash() -> Result<()> {
	setup_tracing();
	let driver = MemoryDriver::new();
	let actor_id = test_actor_id("recovery");
	let definition = counter_definition(options());
	let instance = start_instance(&driver, definition.clone(), &actor_id).await?;
	let queue = instance.queue();

	queue
		.enqueue("jobs", &json!({ "payload": 42 }), EnqueueOptions::default())
		.await?;
	let received = queue
		.receive(ReceiveOptions {
			names: vec!["jobs".into()],
			wait: true,
			timeout: Some(Duration::from_millis(500)),
			..Default::default()
		})
		.await?;
	let msg_id = received.messages[0].id;

	// Crash: the instance disappears without completing
	drop(queue);
	drop(instance);
	driver.unregister(&actor_id);

	let before = timestamp::now();
	let _instance = start_instance(&driver, definition, &actor_id).await?;

	let row = driver
		.raw_get(&actor_id, &keys::queue_message(msg_id))
		.expect("recovered message missing");
	let recovered = persist::decode_queue_message(&row)?;
	assert_eq!(recovered.failure_count, 1);
	assert!(!recovered.in_flight);
	assert!(recovered.in_flight_at.is_none());
	let delay = recovered.available_at - before;
	assert!(
		(900..=1_500).contains(&delay),
		"redelivery should back off ~1000ms, got {delay}"
	);

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn metadata_size_matches_rows() -> Result<()> {
	setup_tracing();
	let driver = MemoryDriver::new();
	let actor_id = test_actor_id("metadata");
	let instance = start_instance(&driver, counter_definition(options()), &actor_id).await?;
	let queue = instance.queue();

	for i in 0..4 {
		queue
			.enqueue("batch", &json!(i), EnqueueOptions::default())
			.await?;
	}
	assert_eq!(queue.size(), 4);
	assert_eq!(queue_rows(&driver, &actor_id), 4);

	let received = queue
		.receive(ReceiveOptions {
			names: vec!["batch".into()],
			count: 2,
			timeout: Some(Duration::ZERO),
			..Default::default()
		})
		.await?;
	assert_eq!(received.messages.len(), 2);
	assert_eq!(queue.size(), 2);
	assert_eq!(queue_rows(&driver, &actor_id), 2);

	// Ids are strictly increasing and FIFO
	assert_eq!(
		received.messages.iter().map(|m| m.id).collect::<Vec<_>>(),
		vec![0, 1]
	);

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn second_wait_receive_is_rejected() -> Result<()> {
	setup_tracing();
	let driver = MemoryDriver::new();
	let actor_id = test_actor_id("pending-guard");
	let instance = start_instance(&driver, counter_definition(options()), &actor_id).await?;
	let queue = instance.queue();

	queue
		.enqueue("q", &json!(1), EnqueueOptions::default())
		.await?;
	queue
		.enqueue("q", &json!(2), EnqueueOptions::default())
		.await?;

	let received = queue
		.receive(ReceiveOptions {
			names: vec!["q".into()],
			wait: true,
			timeout: Some(Duration::from_millis(200)),
			..Default::default()
		})
		.await?;
	assert!(received.pending.is_some());

	let err = queue
		.receive(ReceiveOptions {
			names: vec!["q".into()],
			wait: true,
			timeout: Some(Duration::from_millis(200)),
			..Default::default()
		})
		.await
		.unwrap_err();
	assert!(matches!(
		err.downcast_ref::<errors::Queue>(),
		Some(errors::Queue::MessagePending)
	));

	// Completing out of order is rejected too
	let err = queue.complete(999, None).await.unwrap_err();
	assert!(matches!(
		err.downcast_ref::<errors::Queue>(),
		Some(errors::Queue::AlreadyCompleted)
	));

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn queue_limits() -> Result<()> {
	setup_tracing();
	let driver = MemoryDriver::new();
	let actor_id = test_actor_id("limits");

	let definition = counter_definition(RunnerOptions {
		no_sleep: Some(true),
		max_queue_size: Some(2),
		max_queue_message_size: Some(32),
		..Default::default()
	});
	let instance = start_instance(&driver, definition, &actor_id).await?;
	let queue = instance.queue();

	queue
		.enqueue("q", &json!(1), EnqueueOptions::default())
		.await?;
	queue
		.enqueue("q", &json!(2), EnqueueOptions::default())
		.await?;

	let err = queue
		.enqueue("q", &json!(3), EnqueueOptions::default())
		.await
		.unwrap_err();
	assert!(matches!(
		err.downcast_ref::<errors::Queue>(),
		Some(errors::Queue::Full { max: 2 })
	));

	// Size check happens before capacity is consumed elsewhere
	let big = "x".repeat(64);
	let err = queue
		.enqueue("big", &json!(big), EnqueueOptions::default())
		.await
		.unwrap_err();
	assert!(matches!(
		err.downcast_ref::<errors::Queue>(),
		Some(errors::Queue::MessageTooLarge { .. })
	));

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn parked_receive_wakes_on_enqueue() -> Result<()> {
	setup_tracing();
	let driver = MemoryDriver::new();
	let actor_id = test_actor_id("waker");
	let instance = start_instance(&driver, counter_definition(options()), &actor_id).await?;
	let queue = instance.queue();

	let recv_task = tokio::spawn({
		let queue = queue.clone();
		async move {
			queue
				.receive(ReceiveOptions {
					names: vec!["events".into()],
					count: 1,
					timeout: Some(Duration::from_millis(2_000)),
					..Default::default()
				})
				.await
		}
	});

	tokio::time::sleep(Duration::from_millis(50)).await;
	queue
		.enqueue("events", &json!("hello"), EnqueueOptions::default())
		.await?;

	let received = recv_task.await??;
	assert_eq!(received.messages.len(), 1);
	assert_eq!(received.messages[0].body, json!("hello"));
	assert_eq!(queue.size(), 0);

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn deferred_waiters_skip_notification() -> Result<()> {
	setup_tracing();
	let driver = MemoryDriver::new();
	let actor_id = test_actor_id("defer");
	let instance = start_instance(&driver, counter_definition(options()), &actor_id).await?;
	let queue = instance.queue();

	queue
		.enqueue(
			"quiet",
			&json!(1),
			EnqueueOptions {
				defer_waiters: true,
			},
		)
		.await?;

	// The message is there for an immediate receive
	let received = queue
		.receive(ReceiveOptions {
			names: vec!["quiet".into()],
			timeout: Some(Duration::ZERO),
			..Default::default()
		})
		.await?;
	assert_eq!(received.messages.len(), 1);

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn receive_rejects_on_abort_signals() -> Result<()> {
	setup_tracing();
	let driver = MemoryDriver::new();
	let actor_id = test_actor_id("abort");
	let instance = start_instance(&driver, counter_definition(options()), &actor_id).await?;
	let queue = instance.queue();

	// Caller-scoped signal
	let signal = CancellationToken::new();
	let recv_task = tokio::spawn({
		let queue = queue.clone();
		let signal = signal.clone();
		async move {
			queue
				.receive(ReceiveOptions {
					names: vec!["never".into()],
					signal: Some(signal),
					..Default::default()
				})
				.await
		}
	});
	tokio::time::sleep(Duration::from_millis(50)).await;
	signal.cancel();
	let err = recv_task.await?.unwrap_err();
	assert!(matches!(
		err.downcast_ref::<errors::Actor>(),
		Some(errors::Actor::Aborted)
	));

	// Actor-scoped signal via stop
	let recv_task = tokio::spawn({
		let queue = queue.clone();
		async move {
			queue
				.receive(ReceiveOptions {
					names: vec!["never".into()],
					..Default::default()
				})
				.await
		}
	});
	tokio::time::sleep(Duration::from_millis(50)).await;
	instance
		.on_stop(hearth_runtime::driver::StopIntent::Sleep)
		.await?;
	let err = recv_task.await?.unwrap_err();
	assert!(matches!(
		err.downcast_ref::<errors::Actor>(),
		Some(errors::Actor::Aborted)
	));

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn enqueue_and_wait_times_out() -> Result<()> {
	setup_tracing();
	let driver = MemoryDriver::new();
	let actor_id = test_actor_id("wait-timeout");
	let instance = start_instance(&driver, counter_definition(options()), &actor_id).await?;
	let queue = instance.queue();

	let completion = queue
		.enqueue_and_wait("q", &json!(1), Duration::from_millis(100))
		.await?;
	assert!(matches!(completion, QueueCompletion::TimedOut));

	// The message itself stays queued
	assert_eq!(queue.size(), 1);

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn consumed_messages_resolve_waiters_with_empty_response() -> Result<()> {
	setup_tracing();
	let driver = MemoryDriver::new();
	let actor_id = test_actor_id("consume-resolve");
	let instance = start_instance(&driver, counter_definition(options()), &actor_id).await?;
	let queue = instance.queue();

	let wait_task = tokio::spawn({
		let queue = queue.clone();
		async move {
			queue
				.enqueue_and_wait("q", &json!(1), Duration::from_millis(5_000))
				.await
		}
	});

	// Plain receive (no wait) consumes the message outright
	tokio::time::sleep(Duration::from_millis(50)).await;
	let received = queue
		.receive(ReceiveOptions {
			names: vec!["q".into()],
			timeout: Some(Duration::from_millis(1_000)),
			..Default::default()
		})
		.await?;
	assert_eq!(received.messages.len(), 1);
	assert!(received.pending.is_none());

	let completion = wait_task.await??;
	match completion {
		QueueCompletion::Completed { response } => assert_eq!(response, None),
		other => panic!("unexpected completion: {other:?}"),
	}

	Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn metadata_rebuilds_from_scan() -> Result<()> {
	setup_tracing();
	let driver = MemoryDriver::new();
	let actor_id = test_actor_id("rebuild");
	let definition = counter_definition(options());
	let instance = start_instance(&driver, definition.clone(), &actor_id).await?;
	let queue = instance.queue();

	for i in 0..3 {
		queue
			.enqueue("q", &json!(i), EnqueueOptions::default())
			.await?;
	}

	drop(queue);
	drop(instance);
	driver.unregister(&actor_id);

	// Corrupt the metadata row; init must fall back to the scan
	driver.raw_put(
		&actor_id,
		keys::queue_metadata().to_vec(),
		bytes::Bytes::from_static(b"not json"),
	);

	let instance = start_instance(&driver, definition, &actor_id).await?;
	let queue = instance.queue();
	assert_eq!(queue.size(), 3);

	// The id counter resumes past the highest persisted id
	let msg = queue
		.enqueue("q", &json!(99), EnqueueOptions::default())
		.await?;
	assert_eq!(msg.id, 3);

	Ok(())
}
