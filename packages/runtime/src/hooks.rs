//! Deadline wrapper for user lifecycle hooks.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;

use crate::errors;

/// Runs a hook under its deadline. Exceeding the deadline raises
/// `errors::Hook::TimedOut`, distinct from any error the hook returns. The
/// hook's side effects are not cancelled beyond dropping its future.
pub(crate) async fn with_timeout<F, T>(hook: &'static str, deadline: Duration, fut: F) -> Result<T>
where
	F: Future<Output = Result<T>>,
{
	match tokio::time::timeout(deadline, fut).await {
		Ok(res) => res,
		Err(_) => Err(errors::Hook::TimedOut { hook }.into()),
	}
}
