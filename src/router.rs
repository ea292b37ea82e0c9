use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use chrono::DateTime;
use chrono::Utc;
use parking_lot::Mutex;

use crate::envelope::Envelope;
use crate::error::RoutingError;
use crate::registry::Registry;

/// An envelope whose destination could not be resolved.
#[derive(Debug, Clone)]
pub struct DeadLetter {
	pub envelope: Envelope,
	pub error: RoutingError,
	pub at: DateTime<Utc>,
}

/// Dead-letter office: a running count plus the last few samples.
pub struct DeadLetters {
	count: AtomicU64,
	capacity: usize,
	samples: Mutex<VecDeque<DeadLetter>>,
}

impl DeadLetters {
	pub fn new(capacity: usize) -> Self {
		Self {
			count: AtomicU64::new(0),
			capacity,
			samples: Mutex::new(VecDeque::with_capacity(capacity)),
		}
	}

	pub fn record(&self, envelope: Envelope, error: RoutingError) {
		self.count.fetch_add(1, Ordering::Relaxed);
		metrics::counter!("chat.dead_letters").increment(1);
		tracing::warn!(
			to = %envelope.to(),
			from = %envelope.from(),
			message = envelope.payload().tag(),
			%error,
			"dead letter"
		);

		if self.capacity == 0 {
			return;
		}
		let mut samples = self.samples.lock();
		if samples.len() == self.capacity {
			samples.pop_front();
		}
		samples.push_back(DeadLetter {
			envelope,
			error,
			at: Utc::now(),
		});
	}

	pub fn count(&self) -> u64 {
		self.count.load(Ordering::Relaxed)
	}

	/// Most recent dead letters, oldest first.
	pub fn samples(&self) -> Vec<DeadLetter> {
		self.samples.lock().iter().cloned().collect()
	}
}

/// Pure dispatch layer: resolves `to` through the registry and enqueues.
/// Never looks at payloads and never retries.
#[derive(Clone)]
pub struct Router {
	registry: Arc<Registry>,
	dead_letters: Arc<DeadLetters>,
}

impl Router {
	pub fn new(registry: Arc<Registry>, dead_letter_samples: usize) -> Self {
		Self {
			registry,
			dead_letters: Arc::new(DeadLetters::new(dead_letter_samples)),
		}
	}

	pub fn route(&self, envelope: Envelope) -> Result<(), RoutingError> {
		let Some(target) = self.registry.lookup(envelope.to()) else {
			let error = RoutingError::DeadLetter(envelope.to().clone());
			self.dead_letters.record(envelope, error.clone());
			return Err(error);
		};

		target.deliver(envelope).map_err(|envelope| {
			let error = RoutingError::MailboxClosed(envelope.to().clone());
			self.dead_letters.record(envelope, error.clone());
			error
		})
	}

	pub fn registry(&self) -> &Arc<Registry> {
		&self.registry
	}

	pub fn dead_letters(&self) -> &DeadLetters {
		&self.dead_letters
	}
}
