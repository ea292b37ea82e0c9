//! Inbound edge: envelopes produced outside this process enter through a
//! [`Transport`] and are handed to the router unchanged.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::envelope::Envelope;
use crate::router::Router;
use crate::stop::StopReason;
use crate::stop::StopToken;

#[async_trait]
pub trait Transport: Send + 'static {
	/// Next inbound envelope, or `None` once the transport is closed.
	async fn recv(&mut self) -> Option<Envelope>;
}

/// In-process transport backed by a bounded channel.
pub struct ChannelTransport {
	rx: mpsc::Receiver<Envelope>,
}

impl ChannelTransport {
	pub fn new(capacity: usize) -> (mpsc::Sender<Envelope>, Self) {
		let (tx, rx) = mpsc::channel(capacity);
		(tx, Self { rx })
	}
}

#[async_trait]
impl Transport for ChannelTransport {
	async fn recv(&mut self) -> Option<Envelope> {
		self.rx.recv().await
	}
}

/// Background pump from a [`Transport`] into a [`Router`]. Stops when the
/// transport closes, on [`stop`](Self::stop), or when dropped.
pub struct InboundBridge {
	token: StopToken,
	routed: Arc<AtomicU64>,
	handle: JoinHandle<()>,
}

impl InboundBridge {
	pub fn spawn(mut transport: impl Transport, router: Router) -> Self {
		let token = StopToken::new();
		let stopped = token.stopped();
		let routed = Arc::new(AtomicU64::new(0));
		let counter = routed.clone();

		let handle = tokio::spawn(
			async move {
				tokio::pin!(stopped);
				loop {
					let envelope = tokio::select! {
						biased;
						_ = &mut stopped => break,
						envelope = transport.recv() => match envelope {
							Some(envelope) => envelope,
							None => break,
						},
					};
					// failures are already recorded as dead letters
					if router.route(envelope).is_ok() {
						counter.fetch_add(1, Ordering::Relaxed);
					}
				}
				tracing::info!(routed = counter.load(Ordering::Relaxed), "inbound bridge closed");
			}
			.instrument(tracing::info_span!("inbound")),
		);

		Self { token, routed, handle }
	}

	/// Envelopes successfully handed to a mailbox so far.
	pub fn routed(&self) -> u64 {
		self.routed.load(Ordering::Relaxed)
	}

	#[track_caller]
	pub fn stop(&self) {
		self.token.stop(StopReason::Requested)
	}

	/// Waits for the pump to finish.
	pub async fn join(mut self) {
		if let Err(err) = (&mut self.handle).await {
			tracing::error!(%err, "inbound bridge crashed");
		}
	}
}

impl Drop for InboundBridge {
	fn drop(&mut self) {
		self.token.stop(StopReason::Dropped)
	}
}
