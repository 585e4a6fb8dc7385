#![forbid(unsafe_code)]

use std::time::Duration;

use tokio::time::Instant;

use crate::FatalError;

/// How a close code is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseClass {
	/// Closed on purpose; nothing to do.
	Intentional,
	/// Worth a new session.
	Recoverable,
	/// The service will keep refusing us; give up.
	Unrecoverable,
}

pub fn classify_close_code(code: u16) -> CloseClass {
	match code {
		1000 => CloseClass::Intentional,
		// going away, abnormal, server error, service restart, try again later
		1001 | 1006 | 1011 | 1012 | 1013 => CloseClass::Recoverable,
		// EventSub: internal error, ping-pong, unused, grace expired, network timeout/error, invalid reconnect
		4000 | 4002..=4007 => CloseClass::Recoverable,
		_ => CloseClass::Unrecoverable,
	}
}

/// Backoff and ceiling for reconnection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
	pub base_delay: Duration,
	pub max_delay: Duration,
	/// Consecutive failed attempts before escalating.
	pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
	fn default() -> Self {
		Self {
			base_delay: Duration::from_secs(1),
			max_delay: Duration::from_secs(30),
			max_attempts: 10,
		}
	}
}

impl ReconnectPolicy {
	/// Wait before attempt `attempt` (1-based): `min(max, base * 2^(attempt-1))`.
	pub fn delay(&self, attempt: u32) -> Duration {
		let pow = attempt.saturating_sub(1).min(31);
		self.base_delay.saturating_mul(1u32 << pow).min(self.max_delay)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
	Idle,
	Waiting { attempt: u32, deadline: Instant },
	Connecting { attempt: u32 },
}

/// What the controller should do after a close or failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Decision {
	Ignored,
	Scheduled { attempt: u32, delay: Duration },
	Fatal(FatalError),
}

/// Single-sequence reconnection state machine.
#[derive(Debug)]
pub(crate) struct ReconnectController {
	policy: ReconnectPolicy,
	phase: Phase,
}

impl ReconnectController {
	pub(crate) fn new(policy: ReconnectPolicy) -> Self {
		Self {
			policy,
			phase: Phase::Idle,
		}
	}

	/// When the pending attempt is due.
	pub(crate) fn deadline(&self) -> Option<Instant> {
		match self.phase {
			Phase::Waiting { deadline, .. } => Some(deadline),
			_ => None,
		}
	}

	/// React to the primary socket closing.
	///
	/// Any non-fatal close while an attempt is connecting counts as that
	/// attempt failing. A close while already waiting is a duplicate. A
	/// normal close of a live session means the service ended it, which the
	/// session cannot recover from on its own.
	pub(crate) fn on_close(&mut self, code: u16, reason: &str) -> Decision {
		match (classify_close_code(code), self.phase) {
			(CloseClass::Unrecoverable, _) => {
				self.phase = Phase::Idle;
				Decision::Fatal(FatalError::UnrecoverableClose {
					code,
					reason: reason.to_string(),
				})
			}
			(_, Phase::Connecting { .. }) => self.attempt_failed(),
			(_, Phase::Waiting { .. }) => Decision::Ignored,
			(CloseClass::Intentional, Phase::Idle) => Decision::Fatal(FatalError::ClosedByPeer {
				code,
				reason: reason.to_string(),
			}),
			(CloseClass::Recoverable, Phase::Idle) => self.schedule(1),
		}
	}

	/// Move a due attempt into the connecting phase. Returns its number.
	pub(crate) fn begin_attempt(&mut self) -> Option<u32> {
		let Phase::Waiting { attempt, .. } = self.phase else {
			return None;
		};
		self.phase = Phase::Connecting { attempt };
		metrics::counter!("mobibot_eventsub_reconnect_attempts_total").increment(1);
		Some(attempt)
	}

	/// The current attempt failed before reaching a welcome.
	pub(crate) fn attempt_failed(&mut self) -> Decision {
		let attempt = match self.phase {
			Phase::Connecting { attempt } | Phase::Waiting { attempt, .. } => attempt,
			Phase::Idle => 0,
		};

		if attempt >= self.policy.max_attempts {
			self.phase = Phase::Idle;
			return Decision::Fatal(FatalError::ReconnectExhausted { attempts: attempt });
		}
		self.schedule(attempt + 1)
	}

	/// A welcome arrived; reset counters.
	pub(crate) fn succeeded(&mut self) {
		self.phase = Phase::Idle;
	}

	fn schedule(&mut self, attempt: u32) -> Decision {
		let delay = self.policy.delay(attempt);
		self.phase = Phase::Waiting {
			attempt,
			deadline: Instant::now() + delay,
		};
		Decision::Scheduled { attempt, delay }
	}
}
