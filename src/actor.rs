use std::any::Any;
use std::any::type_name;
use std::future::Future;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt as _;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio::time::Interval;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use crate::envelope::Envelope;
use crate::envelope::Payload;
use crate::error::ActorFailure;
use crate::error::ProtocolError;
use crate::error::RoutingError;
use crate::id::ActorId;
use crate::id::InstanceId;
use crate::id::Sequence;
use crate::link::Link;
use crate::link::WeakLink;
use crate::mailbox::Mail;
use crate::mailbox::MailboxReceiver;
use crate::mailbox::mailbox;
use crate::router::Router;
use crate::stop::StopReason;
use crate::stop::StopToken;

/// Outcome of offering an envelope to an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receive {
	Handled,
	/// The actor has no handler for this message type. It is logged and
	/// dropped; the actor keeps running.
	Unhandled,
}

/// Final notification an actor sends to whoever spawned it.
#[derive(Debug, Clone)]
pub struct Exit {
	pub id: ActorId,
	pub instance: InstanceId,
	pub reason: StopReason,
}

pub type ExitHook = Arc<dyn Fn(Exit) + Send + Sync>;

/// Supervision link handed to a child at spawn time.
#[derive(Clone)]
pub struct Parent {
	/// The child's stop token is derived from this one.
	pub token: StopToken,
	pub on_exit: ExitHook,
}

/// Runtime context for an active actor instance.
///
/// Owned by the actor's run loop; handlers get it by `&mut` alongside their
/// own state.
pub struct ActorContext<A: Actor> {
	pub(crate) rx: MailboxReceiver<A::Control>,
	/// Stop token; stopping it ends the receive loop after the current message.
	pub token: StopToken,
	/// Background work owned by the actor, aborted when it exits.
	pub tasks: JoinSet<()>,
	/// Tracing span the actor runs in.
	pub span: tracing::Span,
	/// Weak reference to the actor's own link.
	pub link: WeakLink<A>,
	id: ActorId,
	instance: InstanceId,
	state: Arc<A::State>,
	router: Router,
	sequence: Sequence,
	ticker: Option<Interval>,
}

impl<A: Actor> ActorContext<A> {
	pub fn id(&self) -> &ActorId {
		&self.id
	}

	pub fn instance(&self) -> InstanceId {
		self.instance
	}

	/// State shared with the actor's links.
	pub fn state(&self) -> &A::State {
		&self.state
	}

	pub fn router(&self) -> &Router {
		&self.router
	}

	/// Builds an envelope from this actor, stamped with its next sequence id.
	pub fn envelope(&mut self, to: ActorId, payload: Payload) -> Envelope {
		Envelope::stamped(&mut self.sequence, self.id.clone(), to, payload)
	}

	/// Builds and routes an envelope. Failures are already recorded as dead
	/// letters by the router; the result tells the caller whether to react.
	pub fn route(&mut self, to: ActorId, payload: Payload) -> Result<(), RoutingError> {
		let envelope = self.envelope(to, payload);
		self.router.route(envelope)
	}

	/// Spawn a background task within the actor's context.
	pub fn spawn(&mut self, future: impl Future<Output = ()> + Send + 'static) {
		self.tasks.spawn(future);
	}

	/// Refuses new mail, drops the registry entry and hands every queued
	/// envelope to [`Actor::reject`]. Queued control messages are dropped,
	/// which fails their reply ports.
	fn close(&mut self, reason: &StopReason) {
		self.rx.close();
		self.router.registry().release(&self.id, self.instance);
		for mail in self.rx.drain() {
			match mail {
				Mail::Envelope(envelope) => A::reject(self, envelope, reason),
				Mail::Control(_) => {}
			}
		}
	}
}

/// Initialization context provided to actors during startup.
pub struct Init<'a, A: Actor> {
	/// The specification data required for actor initialization
	pub spec: A::Spec,
	pub id: ActorId,
	pub link: WeakLink<A>,
	pub router: Router,
	pub token: StopToken,
	/// Task set for spawning background tasks during initialization
	pub tasks: &'a mut JoinSet<()>,
}

impl<A: Actor> Init<'_, A> {
	pub fn spawn<F>(&mut self, future: F)
	where
		F: Future<Output = ()> + Send + 'static,
	{
		self.tasks.spawn(future);
	}
}

pub trait InitFuture<A: Actor>: Future<Output = Result<A, ActorFailure>> + Send + 'static {}

impl<A: Actor, F: Future<Output = Result<A, ActorFailure>> + Send + 'static> InitFuture<A> for F {}

pub trait Actor: Sized + Send + 'static {
	type Spec: Send + 'static;
	/// Local messages from the actor's own handles (queries, lifecycle).
	type Control: Send + 'static;
	/// Immutable-by-convention data shared between the actor and its links.
	type State: Send + Sync + 'static;

	fn id(spec: &Self::Spec) -> ActorId;

	fn span(spec: &Self::Spec) -> tracing::Span {
		tracing::info_span!("actor", id = %Self::id(spec))
	}

	fn state(spec: &Self::Spec) -> Self::State;

	fn init(ctx: Init<'_, Self>) -> impl InitFuture<Self>;

	/// Handles one routed envelope to completion.
	fn receive(
		&mut self,
		ctx: &mut ActorContext<Self>,
		envelope: &Envelope,
	) -> impl Future<Output = Result<Receive, ActorFailure>> + Send;

	fn control(
		&mut self,
		ctx: &mut ActorContext<Self>,
		control: Self::Control,
	) -> impl Future<Output = Result<ControlFlow<StopReason>, ActorFailure>> + Send;

	fn tick_interval(&self) -> Option<Duration> {
		None
	}

	fn tick(&mut self, _ctx: &mut ActorContext<Self>) -> impl Future<Output = Result<(), ActorFailure>> + Send {
		futures::future::ready(Ok(()))
	}

	/// Called for every envelope the actor will never process: the one that
	/// was in flight when a handler failed and everything still queued at exit.
	fn reject(ctx: &mut ActorContext<Self>, envelope: Envelope, _reason: &StopReason) {
		ctx.router()
			.dead_letters()
			.record(envelope, RoutingError::MailboxClosed(ctx.id().clone()));
	}

	fn terminate(
		self,
		_ctx: &mut ActorContext<Self>,
		_reason: &StopReason,
	) -> impl Future<Output = ()> + Send {
		futures::future::ready(())
	}

	fn cycle(&mut self, ctx: &mut ActorContext<Self>) -> impl Future<Output = ControlFlow<StopReason>> + Send {
		async move {
			tokio::select! {
				biased;
				stopped = ctx.token.stopped() => ControlFlow::Break(stopped.reason),
				mail = ctx.rx.recv() => match mail {
					Some(mail) => dispatch(self, ctx, mail).await,
					None => ControlFlow::Break(StopReason::Dropped),
				},
				_ = next_tick(&mut ctx.ticker) => {
					let outcome = AssertUnwindSafe(self.tick(ctx)).catch_unwind().await;
					match settle(outcome) {
						Ok(()) => ControlFlow::Continue(()),
						Err(failure) => ControlFlow::Break(failed::<Self>(failure)),
					}
				}
			}
		}
	}

	/// Registers the actor under its id and starts its receive loop.
	fn spawn(spec: Self::Spec, router: &Router, parent: Option<Parent>) -> Result<Link<Self>, ProtocolError> {
		let id = Self::id(&spec);
		let span = Self::span(&spec);
		let (tx, rx) = mailbox::<Self::Control>();
		let (token, on_exit) = match parent {
			Some(parent) => (parent.token.child(), Some(parent.on_exit)),
			None => (StopToken::new(), None),
		};
		let (exit_tx, exit_rx) = watch::channel(None);

		let link = Link::<Self>::new(id.clone(), tx, token.clone(), exit_rx, Self::state(&spec));
		router.registry().register(&link)?;
		let instance = link.instance();

		let mut tasks = JoinSet::new();
		let init = Self::init(Init {
			spec,
			id: id.clone(),
			link: link.downgrade(),
			router: router.clone(),
			token: token.clone(),
			tasks: &mut tasks,
		});

		let mut ctx = ActorContext {
			rx,
			token,
			tasks,
			span: span.clone(),
			link: link.downgrade(),
			id: id.clone(),
			instance,
			state: link.state.state.clone(),
			router: router.clone(),
			sequence: Sequence::default(),
			ticker: None,
		};

		let handle = tokio::spawn(
			async move {
				let reason = match init.await {
					Ok(mut actor) => {
						ctx.ticker = actor.tick_interval().map(|period| {
							let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
							ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
							ticker
						});
						tracing::debug!("actor started");

						let reason = loop {
							match actor.cycle(&mut ctx).await {
								ControlFlow::Continue(()) => {}
								ControlFlow::Break(reason) => break reason,
							}
						};

						ctx.close(&reason);
						actor.terminate(&mut ctx, &reason).await;
						reason
					}
					Err(failure) => {
						tracing::error!(%failure, "actor failed to initialize");
						let reason = StopReason::Failed(failure.cause().to_string());
						ctx.close(&reason);
						reason
					}
				};

				ctx.tasks.abort_all();
				reason
			}
			.instrument(span),
		);

		tokio::spawn(async move {
			let reason = match handle.await {
				Ok(reason) => reason,
				Err(err) => {
					tracing::error!("actor {} crashed outside a handler: {err}", type_name::<Self>());
					StopReason::Failed(format!("crashed: {err}"))
				}
			};

			if reason.is_failure() {
				metrics::counter!("chat.actor.failures").increment(1);
			}
			tracing::info!(actor = %id, %reason, "actor exited");

			let _ = exit_tx.send(Some(reason.clone()));
			if let Some(on_exit) = on_exit {
				on_exit(Exit { id, instance, reason });
			}
		});

		Ok(link)
	}
}

async fn dispatch<A: Actor>(actor: &mut A, ctx: &mut ActorContext<A>, mail: Mail<A::Control>) -> ControlFlow<StopReason> {
	match mail {
		Mail::Envelope(envelope) => {
			let outcome = AssertUnwindSafe(actor.receive(ctx, &envelope)).catch_unwind().await;
			match settle(outcome) {
				Ok(Receive::Handled) => ControlFlow::Continue(()),
				Ok(Receive::Unhandled) => {
					tracing::warn!(
						from = %envelope.from(),
						message = envelope.payload().tag(),
						"unhandled message dropped"
					);
					ControlFlow::Continue(())
				}
				Err(failure) => {
					let reason = failed::<A>(failure);
					// refuse new mail before the sender hears about the failure
					ctx.rx.close();
					A::reject(ctx, envelope, &reason);
					ControlFlow::Break(reason)
				}
			}
		}
		Mail::Control(control) => {
			let outcome = AssertUnwindSafe(actor.control(ctx, control)).catch_unwind().await;
			match settle(outcome) {
				Ok(flow) => flow,
				Err(failure) => ControlFlow::Break(failed::<A>(failure)),
			}
		}
	}
}

fn settle<T>(outcome: Result<Result<T, ActorFailure>, Box<dyn Any + Send>>) -> Result<T, ActorFailure> {
	match outcome {
		Ok(result) => result,
		Err(panic) => Err(ActorFailure::from_panic(panic)),
	}
}

fn failed<A: Actor>(failure: ActorFailure) -> StopReason {
	tracing::error!(%failure, "actor {} handler failed", type_name::<A>());
	StopReason::Failed(failure.cause().to_string())
}

async fn next_tick(ticker: &mut Option<Interval>) {
	match ticker {
		Some(ticker) => {
			ticker.tick().await;
		}
		None => futures::future::pending::<()>().await,
	}
}
