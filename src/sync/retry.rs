use log::{debug, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ErrorKind, SyncError};
use crate::model::{OperationState, SyncOperation};

/// Exponential backoff with jitter and an attempt ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
	pub max_attempts: u32,
	pub initial_backoff: Duration,
	pub max_backoff: Duration,
	pub jitter: bool,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 5,
			initial_backoff: Duration::from_millis(500),
			max_backoff: Duration::from_secs(60),
			jitter: true,
		}
	}
}

impl RetryPolicy {
	/// Base delay before attempt `attempt + 1`, without jitter.
	pub fn base_delay(&self, attempt: u32) -> Duration {
		let exp = attempt.saturating_sub(1).min(31);
		self.initial_backoff
			.saturating_mul(1u32 << exp)
			.min(self.max_backoff)
	}

	/// Delay after the `attempt`-th failure. Rate limiting never shortens the
	/// delay the backend asked for.
	pub fn delay_for(&self, attempt: u32, error: &SyncError) -> Duration {
		let mut delay = self.base_delay(attempt);
		if self.jitter {
			let max_jitter = delay.as_millis() as u64 / 4;
			if max_jitter > 0 {
				let jitter_ms = rand::thread_rng().gen_range(0..=max_jitter);
				delay = delay.saturating_add(Duration::from_millis(jitter_ms));
			}
		}
		match error.retry_after() {
			Some(mandated) => delay.max(mandated),
			None => delay,
		}
	}
}

/// What the orchestrator does with an operation after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
	Succeeded,
	/// Back to the queue after `delay`.
	Retry { delay: Duration },
	/// Back to the queue immediately with delta encoding disabled.
	RetransmitFull,
	/// Held until a fresh auth context arrives. Does not consume an attempt.
	AwaitAuth,
	/// Dead-letter the operation.
	Terminal,
	Cancelled,
}

impl Transition {
	pub fn state(&self) -> OperationState {
		match self {
			Transition::Succeeded => OperationState::Succeeded,
			Transition::Retry { .. } | Transition::RetransmitFull | Transition::AwaitAuth => {
				OperationState::RecoverableFailure
			}
			Transition::Terminal => OperationState::TerminalFailure,
			Transition::Cancelled => OperationState::Cancelled,
		}
	}
}

impl RetryPolicy {
	/// Move `op` through the state machine after a failed attempt.
	///
	/// `pending -> inFlight -> {succeeded | recoverableFailure(attempt+1) -> pending | terminalFailure -> deadLetter}`
	pub fn on_failure(&self, op: &mut SyncOperation, error: &SyncError) -> Transition {
		let kind = error.kind();

		if kind.requires_reauth() {
			op.last_error = Some(error.clone());
			op.state = OperationState::RecoverableFailure;
			warn!("{}/{} waiting for re-authentication: {}", op.entity, op.record_id, error);
			return Transition::AwaitAuth;
		}

		op.attempts += 1;
		op.last_error = Some(error.clone());

		let transition = match kind {
			ErrorKind::Integrity if !op.force_full => {
				op.force_full = true;
				Transition::RetransmitFull
			}
			ErrorKind::Cancelled => Transition::Cancelled,
			// A record that kept changing under re-resolution is retried like a
			// transient failure.
			k if (k.is_retryable() || k == ErrorKind::Conflict) && op.attempts < self.max_attempts => {
				Transition::Retry {
					delay: self.delay_for(op.attempts, error),
				}
			}
			_ => Transition::Terminal,
		};

		op.state = transition.state();
		debug!(
			"{}/{} attempt {} failed ({:?}): {:?}",
			op.entity, op.record_id, op.attempts, kind, transition
		);
		transition
	}

	pub fn on_success(&self, op: &mut SyncOperation) -> Transition {
		op.state = OperationState::Succeeded;
		op.last_error = None;
		Transition::Succeeded
	}
}
