use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use downcast_rs::DowncastSync;
use downcast_rs::impl_downcast;
use tokio::sync::oneshot;
use tokio::sync::watch;

use crate::actor::Actor;
use crate::envelope::Envelope;
use crate::error::ChatError;
use crate::id::ActorId;
use crate::id::InstanceId;
use crate::mailbox::Mail;
use crate::mailbox::MailboxSender;
use crate::stop::StopReason;
use crate::stop::StopToken;

pub struct LinkState<A: Actor> {
	pub(crate) id: ActorId,
	pub(crate) instance: InstanceId,
	pub(crate) tx: MailboxSender<A::Control>,
	pub(crate) token: StopToken,
	pub(crate) exit: watch::Receiver<Option<StopReason>>,
	pub(crate) state: Arc<A::State>,
}

/// Strong handle to a running actor. The actor stops once every strong
/// handle is gone.
pub struct Link<A: Actor> {
	pub(crate) state: Arc<LinkState<A>>,
}

impl<A: Actor> Debug for Link<A> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Link")
			.field("id", &self.state.id)
			.field("alive", &self.alive())
			.finish()
	}
}

impl<A: Actor> Clone for Link<A> {
	fn clone(&self) -> Self {
		Self {
			state: self.state.clone(),
		}
	}
}

impl<A: Actor> Link<A> {
	pub(crate) fn new(
		id: ActorId,
		tx: MailboxSender<A::Control>,
		token: StopToken,
		exit: watch::Receiver<Option<StopReason>>,
		state: A::State,
	) -> Self {
		let state = Arc::new(LinkState {
			id,
			instance: InstanceId::next(),
			tx,
			token,
			exit,
			state: Arc::new(state),
		});
		Self { state }
	}

	pub fn id(&self) -> &ActorId {
		&self.state.id
	}

	pub fn instance(&self) -> InstanceId {
		self.state.instance
	}

	pub fn alive(&self) -> bool {
		!self.state.tx.is_closed() && !self.state.token.is_stopped()
	}

	pub fn state(&self) -> &A::State {
		&self.state.state
	}

	/// Enqueues an envelope directly, bypassing the router.
	pub fn deliver(&self, envelope: Envelope) -> Result<(), Envelope> {
		self.state.deliver(envelope)
	}

	/// Fire-and-forget control message.
	pub fn tell(&self, control: A::Control) -> Result<(), ChatError> {
		self.state
			.tx
			.enqueue(Mail::Control(control))
			.map_err(|_| ChatError::ActorStopped(self.state.id.clone()))
	}

	/// Request/response over the mailbox: `make` wraps the reply port into a
	/// control message, the actor answers through it.
	pub async fn ask<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> A::Control) -> Result<R, ChatError> {
		let (reply, rx) = oneshot::channel();
		self.tell(make(reply))?;
		rx.await
			.map_err(|_| ChatError::ActorStopped(self.state.id.clone()))
	}

	#[track_caller]
	pub fn stop(&self, reason: StopReason) {
		self.state.token.stop(reason)
	}

	/// Stops the actor and waits until its run loop has fully exited.
	#[track_caller]
	pub fn stop_and_wait(&self, reason: StopReason) -> impl Future<Output = StopReason> + Send + 'static {
		self.state.token.stop(reason);
		self.wait_exit()
	}

	/// Resolves with the final stop reason once the actor has exited.
	pub fn wait_exit(&self) -> impl Future<Output = StopReason> + Send + 'static {
		let mut exit = self.state.exit.clone();
		async move {
			match exit.wait_for(Option::is_some).await {
				Ok(reason) => reason.clone().unwrap_or(StopReason::Dropped),
				Err(_) => StopReason::Failed("actor task vanished".into()),
			}
		}
	}

	pub fn downgrade(&self) -> WeakLink<A> {
		WeakLink {
			id: self.state.id.clone(),
			state: Arc::downgrade(&self.state),
		}
	}

	pub(crate) fn mailbox(&self) -> Arc<dyn Deliver> {
		self.state.clone()
	}
}

impl<A: Actor> Drop for LinkState<A> {
	fn drop(&mut self) {
		self.token.stop(StopReason::Dropped)
	}
}

/// Non-owning handle. Never keeps an actor alive.
pub struct WeakLink<A: Actor> {
	id: ActorId,
	state: std::sync::Weak<LinkState<A>>,
}

impl<A: Actor> Clone for WeakLink<A> {
	fn clone(&self) -> Self {
		Self {
			id: self.id.clone(),
			state: self.state.clone(),
		}
	}
}

impl<A: Actor> WeakLink<A> {
	pub fn id(&self) -> &ActorId {
		&self.id
	}

	pub fn upgrade(&self) -> Option<Link<A>> {
		self.state.upgrade().map(|state| Link { state })
	}

	pub fn tell(&self, control: A::Control) -> Result<(), ChatError> {
		match self.upgrade() {
			Some(link) => link.tell(control),
			None => Err(ChatError::ActorStopped(self.id.clone())),
		}
	}

	pub fn stop(&self, reason: StopReason) {
		if let Some(link) = self.upgrade() {
			link.stop(reason);
		}
	}
}

/// Type-erased envelope sink stored by the registry.
pub trait Deliver: DowncastSync {
	fn actor_id(&self) -> &ActorId;
	fn instance(&self) -> InstanceId;
	fn is_alive(&self) -> bool;
	fn deliver(&self, envelope: Envelope) -> Result<(), Envelope>;
}

impl_downcast!(sync Deliver);

impl<A: Actor> Deliver for LinkState<A> {
	fn actor_id(&self) -> &ActorId {
		&self.id
	}

	fn instance(&self) -> InstanceId {
		self.instance
	}

	fn is_alive(&self) -> bool {
		!self.tx.is_closed() && !self.token.is_stopped()
	}

	fn deliver(&self, envelope: Envelope) -> Result<(), Envelope> {
		self.tx.enqueue(Mail::Envelope(envelope)).map_err(|mail| match mail {
			Mail::Envelope(envelope) => envelope,
			Mail::Control(_) => unreachable!("enqueued an envelope"),
		})
	}
}
