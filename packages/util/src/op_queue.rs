use std::future::Future;

use tokio::sync::Mutex;

/// Serializes async operations so at most one is in flight at a time.
///
/// Used for write paths that must not race: KV persistence batches and driver
/// alarm updates each get their own queue. Operations run in the order the
/// lock is granted.
pub struct OpQueue {
	lock: Mutex<()>,
}

impl OpQueue {
	pub fn new() -> Self {
		OpQueue {
			lock: Mutex::new(()),
		}
	}

	/// Runs `fut` once all previously enqueued operations have completed.
	pub async fn run<F, T>(&self, fut: F) -> T
	where
		F: Future<Output = T>,
	{
		let _guard = self.lock.lock().await;
		fut.await
	}
}

impl Default for OpQueue {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	};

	use super::*;

	#[tokio::test]
	async fn ops_do_not_overlap() {
		let queue = Arc::new(OpQueue::new());
		let active = Arc::new(AtomicUsize::new(0));
		let max_active = Arc::new(AtomicUsize::new(0));

		let mut handles = Vec::new();
		for _ in 0..8 {
			let queue = queue.clone();
			let active = active.clone();
			let max_active = max_active.clone();
			handles.push(tokio::spawn(async move {
				queue
					.run(async {
						let n = active.fetch_add(1, Ordering::SeqCst) + 1;
						max_active.fetch_max(n, Ordering::SeqCst);
						tokio::time::sleep(std::time::Duration::from_millis(5)).await;
						active.fetch_sub(1, Ordering::SeqCst);
					})
					.await;
			}));
		}

		for handle in handles {
			handle.await.unwrap();
		}

		assert_eq!(max_active.load(Ordering::SeqCst), 1);
	}
}
