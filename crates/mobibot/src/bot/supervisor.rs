#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info};

const BASE_DELAY: Duration = Duration::from_secs(10);
const MAX_DELAY: Duration = Duration::from_secs(60 * 60);

/// A run that lasted this long resets the attempt counter.
const HEALTHY_RUN: Duration = Duration::from_secs(60 * 60);

/// Delay before restart `attempt` (1-based): 10s doubling, capped at one hour.
pub fn backoff_delay(attempt: u32) -> Duration {
	let exp = attempt.saturating_sub(1).min(16);
	BASE_DELAY.saturating_mul(1u32 << exp).min(MAX_DELAY)
}

/// Keep calling `run_once` until it returns `Ok` or `shutdown` flips to true.
///
/// Each call gets the 1-based attempt number and its own shutdown receiver.
pub async fn run_with_backoff<F, Fut>(mut shutdown: watch::Receiver<bool>, mut run_once: F)
where
	F: FnMut(u32, watch::Receiver<bool>) -> Fut,
	Fut: Future<Output = anyhow::Result<()>>,
{
	let mut attempt: u32 = 1;
	loop {
		if *shutdown.borrow() {
			return;
		}

		let started = Instant::now();
		let err = match run_once(attempt, shutdown.clone()).await {
			Ok(()) => {
				info!(attempt, "bot stopped");
				return;
			}
			Err(e) => e,
		};

		metrics::counter!("mobibot_restarts_total").increment(1);
		if started.elapsed() >= HEALTHY_RUN {
			attempt = 1;
		}

		let delay = backoff_delay(attempt);
		error!(attempt, error = ?err, delay_secs = delay.as_secs(), "bot run failed; restarting");

		tokio::select! {
			_ = tokio::time::sleep(delay) => {}
			_ = shutdown.wait_for(|stop| *stop) => {
				info!("shutdown requested during restart backoff");
				return;
			}
		}
		attempt = attempt.saturating_add(1);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use parking_lot::Mutex;

	use super::*;

	#[test]
	fn backoff_doubles_then_caps() {
		assert_eq!(backoff_delay(1), Duration::from_secs(10));
		assert_eq!(backoff_delay(2), Duration::from_secs(20));
		assert_eq!(backoff_delay(4), Duration::from_secs(80));
		assert_eq!(backoff_delay(9), Duration::from_secs(2560));
		assert_eq!(backoff_delay(10), MAX_DELAY);
		assert_eq!(backoff_delay(u32::MAX), MAX_DELAY);
		assert_eq!(backoff_delay(0), Duration::from_secs(10));
	}

	#[tokio::test(start_paused = true)]
	async fn restarts_with_growing_delay_until_ok() {
		let (_tx, rx) = watch::channel(false);
		let calls = Arc::new(Mutex::new(Vec::new()));
		let start = Instant::now();

		let seen = calls.clone();
		run_with_backoff(rx, move |attempt, _| {
			seen.lock().push((attempt, start.elapsed()));
			async move {
				if attempt < 3 {
					anyhow::bail!("session died");
				}
				Ok(())
			}
		})
		.await;

		let calls = calls.lock().clone();
		assert_eq!(
			calls,
			vec![
				(1, Duration::ZERO),
				(2, Duration::from_secs(10)),
				(3, Duration::from_secs(30)),
			]
		);
	}

	#[tokio::test(start_paused = true)]
	async fn long_healthy_run_resets_attempts() {
		let (_tx, rx) = watch::channel(false);
		let attempts = Arc::new(Mutex::new(Vec::new()));

		let seen = attempts.clone();
		run_with_backoff(rx, move |attempt, _| {
			let n = {
				let mut seen = seen.lock();
				seen.push(attempt);
				seen.len()
			};
			async move {
				match n {
					1 => anyhow::bail!("quick failure"),
					2 => {
						tokio::time::sleep(HEALTHY_RUN).await;
						anyhow::bail!("failure after a long run")
					}
					_ => Ok(()),
				}
			}
		})
		.await;

		assert_eq!(*attempts.lock(), vec![1, 2, 2]);
	}

	#[tokio::test(start_paused = true)]
	async fn shutdown_interrupts_backoff() {
		let (tx, rx) = watch::channel(false);
		let calls = Arc::new(Mutex::new(0u32));

		let seen = calls.clone();
		let task = tokio::spawn(run_with_backoff(rx, move |_, _| {
			*seen.lock() += 1;
			async { anyhow::bail!("always fails") }
		}));

		tokio::time::sleep(Duration::from_secs(1)).await;
		tx.send(true).expect("supervisor listening");
		task.await.expect("supervisor task");
		assert_eq!(*calls.lock(), 1);
	}

	#[tokio::test]
	async fn already_shut_down_never_runs() {
		let (_tx, rx) = watch::channel(true);
		let mut ran = false;
		run_with_backoff(rx, |_, _| {
			ran = true;
			async { Ok(()) }
		})
		.await;
		assert!(!ran);
	}
}
