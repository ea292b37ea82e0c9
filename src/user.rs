//! Session actor: one per connected user.
//!
//! Turns session calls into room commands, keeps the session's view of its
//! rooms (unread sets, typing, presence) and tracks the delivery lifecycle of
//! every message it sends. Everything a UI needs leaves through [`UiEvent`]
//! callbacks.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::oneshot;

use crate::actor::Actor;
use crate::actor::ActorContext;
use crate::actor::Init;
use crate::actor::InitFuture;
use crate::actor::Receive;
use crate::config::ChatConfig;
use crate::envelope::Envelope;
use crate::envelope::Payload;
use crate::envelope::Rejection;
use crate::error::ActorFailure;
use crate::error::ChatError;
use crate::event::UiCallback;
use crate::event::UiEvent;
use crate::id::ActorId;
use crate::id::ClientRef;
use crate::id::MessageId;
use crate::id::RoomId;
use crate::id::Sequence;
use crate::id::UserId;
use crate::link::Link;
use crate::message::ChatMessage;
use crate::message::DeliveryState;
use crate::message::MessageDraft;
use crate::message::SendOptions;
use crate::message::Status;
use crate::stop::StopReason;
use crate::supervisor::RoomSupervisor;

pub struct UserSpec {
	pub user: UserId,
	pub config: Arc<ChatConfig>,
	pub supervisor: Link<RoomSupervisor>,
}

/// Data shared between a session actor and its handles.
pub struct UserShared {
	pub user: UserId,
	callbacks: ArcSwap<Vec<UiCallback>>,
}

impl UserShared {
	fn emit(&self, event: UiEvent) {
		for callback in self.callbacks.load().iter() {
			if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&event))) {
				let failure = ActorFailure::from_panic(panic);
				tracing::warn!(event = event.event_type(), %failure, "ui callback panicked");
			}
		}
	}
}

type Reply<T> = oneshot::Sender<Result<T, ChatError>>;

pub enum SessionCommand {
	Join {
		room: RoomId,
		reply: Reply<()>,
	},
	Leave {
		room: RoomId,
		reply: Reply<()>,
	},
	SendMessage {
		room: RoomId,
		content: String,
		options: SendOptions,
		reply: Reply<ClientRef>,
	},
	AddReaction {
		room: RoomId,
		message_id: MessageId,
		emoji: String,
		reply: Reply<()>,
	},
	SetTyping {
		room: RoomId,
		typing: bool,
		reply: Reply<()>,
	},
	MarkRead {
		room: RoomId,
		message_ids: Vec<MessageId>,
		reply: Reply<()>,
	},
	SetStatus {
		status: Status,
		reply: Reply<()>,
	},
	ActiveChats {
		reply: oneshot::Sender<Vec<RoomId>>,
	},
	UnreadCount {
		room: Option<RoomId>,
		reply: oneshot::Sender<usize>,
	},
	DeliveryHistory {
		client_ref: ClientRef,
		reply: oneshot::Sender<Option<Vec<DeliveryState>>>,
	},
	Abandon {
		client_ref: ClientRef,
		cause: String,
		reply: Reply<bool>,
	},
	Stop {
		reply: oneshot::Sender<()>,
	},
}

/// A message this session sent, keyed by its client reference.
struct Outgoing {
	room: RoomId,
	message_id: Option<MessageId>,
	/// Every delivery state observed so far, in order. Never empty.
	history: Vec<DeliveryState>,
}

impl Outgoing {
	fn state(&self) -> DeliveryState {
		self.history.last().copied().unwrap_or(DeliveryState::Sending)
	}

	fn advance(&mut self, next: DeliveryState) -> bool {
		if !self.state().can_advance_to(next) {
			return false;
		}
		self.history.push(next);
		true
	}
}

/// Commands the session re-sends once after re-resolving a stopped room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Retry {
	Join,
	Leave,
}

pub struct UserActor {
	user: UserId,
	supervisor: Link<RoomSupervisor>,
	status: Status,
	joined: BTreeSet<RoomId>,
	/// Last known actor per room; re-resolved through the supervisor when stale.
	rooms: HashMap<RoomId, ActorId>,
	/// Room instance each joined room was last addressed at. Outlives cache
	/// invalidation so a new incarnation can be told apart from the old one.
	incarnations: HashMap<RoomId, ActorId>,
	unread: HashMap<RoomId, HashSet<MessageId>>,
	typing: HashMap<RoomId, Vec<UserId>>,
	presence: HashMap<RoomId, HashMap<UserId, Status>>,
	outbox: HashMap<ClientRef, Outgoing>,
	sent: HashMap<MessageId, ClientRef>,
	/// Outgoing messages that reached `read` or `failed`, oldest first.
	settled: VecDeque<ClientRef>,
	history_limit: usize,
	pending_joins: HashMap<RoomId, Vec<Reply<()>>>,
	pending_leaves: HashMap<RoomId, Vec<Reply<()>>>,
	retried: HashSet<(RoomId, Retry)>,
	client_refs: Sequence,
}

impl UserActor {
	async fn room_actor(&mut self, ctx: &mut ActorContext<Self>, room: &RoomId) -> Result<ActorId, ChatError> {
		if let Some(id) = self.rooms.get(room) {
			if ctx.router().registry().contains(id) {
				return Ok(id.clone());
			}
		}
		let link = self.supervisor.resolve_room(room).await?;
		let id = link.id().clone();
		self.rooms.insert(room.clone(), id.clone());
		Ok(id)
	}

	async fn send_to_room(&mut self, ctx: &mut ActorContext<Self>, room: &RoomId, payload: Payload) -> Result<(), ChatError> {
		let to = self.room_actor(ctx, room).await?;
		let restarted = self
			.incarnations
			.insert(room.clone(), to.clone())
			.is_some_and(|previous| previous != to);
		let membership = matches!(payload, Payload::Join { .. } | Payload::Leave { .. });
		if restarted && !membership && self.joined.contains(room) {
			// the new instance only knows the durable roster, which may have missed us
			tracing::info!(%room, actor = %to, "room restarted, joining again");
			if let Err(err) = ctx.route(to.clone(), self.command(Retry::Join)) {
				tracing::debug!(%room, %err, "rejoin not delivered");
			}
		}
		if let Err(err) = ctx.route(to, payload) {
			self.rooms.remove(room);
			return Err(err.into());
		}
		Ok(())
	}

	fn ensure_joined(&self, room: &RoomId) -> Result<(), ChatError> {
		if self.joined.contains(room) {
			Ok(())
		} else {
			Err(ChatError::NotJoined(room.clone()))
		}
	}

	fn command(&self, retry: Retry) -> Payload {
		let user = self.user.clone();
		match retry {
			Retry::Join => Payload::Join { user },
			Retry::Leave => Payload::Leave { user },
		}
	}

	async fn join(&mut self, ctx: &mut ActorContext<Self>, room: RoomId, reply: Reply<()>) {
		if self.joined.contains(&room) {
			let _ = reply.send(Ok(()));
			return;
		}
		let waiters = self.pending_joins.entry(room.clone()).or_default();
		waiters.push(reply);
		if waiters.len() > 1 {
			return;
		}

		match self.send_to_room(ctx, &room, self.command(Retry::Join)).await {
			Ok(()) => {}
			Err(ChatError::Routing(err)) => self.retry(ctx, &room, Retry::Join, err.to_string()).await,
			Err(err) => self.finish_join(ctx.state(), &room, Err(err)),
		}
	}

	/// Re-resolves `room` and re-sends `what` once. A second failure is final.
	async fn retry(&mut self, ctx: &mut ActorContext<Self>, room: &RoomId, what: Retry, cause: String) {
		self.rooms.remove(room);
		let outcome = if self.retried.insert((room.clone(), what)) {
			tracing::debug!(%room, ?what, %cause, "room instance gone, re-resolving");
			self.send_to_room(ctx, room, self.command(what)).await
		} else {
			Err(ChatError::RoomUnavailable {
				room: room.clone(),
				cause,
			})
		};

		if let Err(err) = outcome {
			match what {
				Retry::Join => self.finish_join(ctx.state(), room, Err(err)),
				Retry::Leave => {
					tracing::debug!(%room, %err, "room unreachable, leaving locally");
					self.left(ctx.state(), room);
				}
			}
		}
	}

	fn finish_join(&mut self, shared: &UserShared, room: &RoomId, result: Result<(), ChatError>) {
		self.retried.remove(&(room.clone(), Retry::Join));
		if let Err(err) = &result {
			tracing::warn!(%room, %err, "join failed");
			shared.emit(UiEvent::MessageError {
				room_id: room.clone(),
				client_ref: None,
				message_id: None,
				cause: err.to_string(),
			});
		}
		for waiter in self.pending_joins.remove(room).unwrap_or_default() {
			let _ = waiter.send(result.clone());
		}
	}

	async fn leave(&mut self, ctx: &mut ActorContext<Self>, room: RoomId, reply: Reply<()>) {
		if let Err(err) = self.ensure_joined(&room) {
			let _ = reply.send(Err(err));
			return;
		}
		let waiters = self.pending_leaves.entry(room.clone()).or_default();
		waiters.push(reply);
		if waiters.len() > 1 {
			return;
		}

		match self.send_to_room(ctx, &room, self.command(Retry::Leave)).await {
			Ok(()) => {}
			Err(ChatError::Routing(err)) => self.retry(ctx, &room, Retry::Leave, err.to_string()).await,
			Err(err) => {
				tracing::debug!(%room, %err, "room unreachable, leaving locally");
				self.left(ctx.state(), &room);
			}
		}
	}

	/// Drops every trace of `room` from the session and confirms pending leaves.
	fn left(&mut self, shared: &UserShared, room: &RoomId) {
		self.retried.remove(&(room.clone(), Retry::Leave));
		let was_joined = self.joined.remove(room);
		self.incarnations.remove(room);
		self.unread.remove(room);
		self.typing.remove(room);
		self.presence.remove(room);
		for waiter in self.pending_leaves.remove(room).unwrap_or_default() {
			let _ = waiter.send(Ok(()));
		}
		if was_joined {
			tracing::info!(%room, "left room");
			shared.emit(UiEvent::UserLeft {
				room_id: room.clone(),
				user_id: self.user.clone(),
			});
		}
	}

	async fn send_message(
		&mut self,
		ctx: &mut ActorContext<Self>,
		room: RoomId,
		content: String,
		options: SendOptions,
	) -> Result<ClientRef, ChatError> {
		self.ensure_joined(&room)?;

		let client_ref = ClientRef(self.client_refs.next());
		let draft = MessageDraft {
			client_ref,
			sender: self.user.clone(),
			content,
			options,
		};

		// optimistic echo; its id is provisional until the room answers
		let mut echo = ChatMessage::from_draft(&room, &draft);
		echo.delivery_state = DeliveryState::Sending;
		self.outbox.insert(
			client_ref,
			Outgoing {
				room: room.clone(),
				message_id: None,
				history: vec![DeliveryState::Sending],
			},
		);
		ctx.state().emit(UiEvent::NewMessage {
			message: echo,
			client_ref: Some(client_ref),
		});

		if let Err(err) = self.send_to_room(ctx, &room, Payload::Post { draft }).await {
			self.fail_outgoing(ctx.state(), client_ref, err.to_string());
		}
		Ok(client_ref)
	}

	/// Moves an outgoing message to `failed` and tells the UI to roll back
	/// its echo. Returns `false` if the message is past the point of failing.
	fn fail_outgoing(&mut self, shared: &UserShared, client_ref: ClientRef, cause: String) -> bool {
		let Some(outgoing) = self.outbox.get_mut(&client_ref) else {
			return false;
		};
		if !outgoing.advance(DeliveryState::Failed) {
			return false;
		}
		tracing::warn!(%client_ref, room = %outgoing.room, %cause, "message failed");
		shared.emit(UiEvent::MessageError {
			room_id: outgoing.room.clone(),
			client_ref: Some(client_ref),
			message_id: outgoing.message_id,
			cause,
		});
		self.settle(client_ref);
		true
	}

	/// Keeps the histories of the last `history_limit` settled messages and
	/// forgets older ones.
	fn settle(&mut self, client_ref: ClientRef) {
		self.settled.push_back(client_ref);
		while self.settled.len() > self.history_limit {
			let Some(oldest) = self.settled.pop_front() else {
				break;
			};
			if let Some(message_id) = self.outbox.remove(&oldest).and_then(|outgoing| outgoing.message_id) {
				self.sent.remove(&message_id);
			}
		}
	}

	async fn mark_read(&mut self, ctx: &mut ActorContext<Self>, room: RoomId, message_ids: Vec<MessageId>) -> Result<(), ChatError> {
		self.ensure_joined(&room)?;

		let unread = self.unread.entry(room.clone()).or_default();
		let message_ids = if message_ids.is_empty() {
			unread.drain().collect()
		} else {
			for id in &message_ids {
				unread.remove(id);
			}
			message_ids
		};
		if message_ids.is_empty() {
			return Ok(());
		}

		let payload = Payload::MarkRead {
			user: self.user.clone(),
			message_ids,
		};
		self.send_to_room(ctx, &room, payload).await
	}

	async fn set_status(&mut self, ctx: &mut ActorContext<Self>, status: Status) {
		self.status = status;
		let rooms: Vec<_> = self.joined.iter().cloned().collect();
		for room in rooms {
			let payload = Payload::PresenceUpdate {
				user: self.user.clone(),
				status,
			};
			if let Err(err) = self.send_to_room(ctx, &room, payload).await {
				tracing::debug!(%room, %err, "presence not delivered");
			}
		}
	}

	async fn leave_all(&mut self, ctx: &mut ActorContext<Self>) {
		let rooms = std::mem::take(&mut self.joined);
		for room in rooms {
			if let Err(err) = self.send_to_room(ctx, &room, self.command(Retry::Leave)).await {
				tracing::debug!(%room, %err, "leave not delivered");
			}
		}
	}

	fn unread_count(&self, room: Option<&RoomId>) -> usize {
		match room {
			Some(room) => self.unread.get(room).map_or(0, HashSet::len),
			None => self.unread.values().map(HashSet::len).sum(),
		}
	}

	/// Whether a broadcast about `room` should reach this session's UI.
	fn follows(&self, room: &RoomId) -> bool {
		self.joined.contains(room)
	}

	fn on_user_joined(&mut self, shared: &UserShared, room: &RoomId, user: &UserId) {
		if *user == self.user {
			let fresh = self.joined.insert(room.clone());
			self.finish_join(shared, room, Ok(()));
			if !fresh {
				// confirmation of a rejoin; the UI already knows
				return;
			}
			tracing::info!(%room, "joined room");
		} else if !self.follows(room) {
			return;
		}
		shared.emit(UiEvent::UserJoined {
			room_id: room.clone(),
			user_id: user.clone(),
		});
	}

	fn on_user_left(&mut self, shared: &UserShared, room: &RoomId, user: &UserId) {
		if *user == self.user {
			self.left(shared, room);
			return;
		}
		if !self.follows(room) {
			return;
		}
		if let Some(presence) = self.presence.get_mut(room) {
			presence.remove(user);
		}
		shared.emit(UiEvent::UserLeft {
			room_id: room.clone(),
			user_id: user.clone(),
		});
	}

	fn on_message_posted(&mut self, shared: &UserShared, message: &ChatMessage, client_ref: Option<ClientRef>) {
		if !self.follows(&message.room_id) {
			return;
		}

		let client_ref = if message.sender_id == self.user {
			client_ref
		} else {
			self.unread
				.entry(message.room_id.clone())
				.or_default()
				.insert(message.id);
			None
		};

		if let Some(client_ref) = client_ref {
			if let Some(outgoing) = self.outbox.get_mut(&client_ref) {
				outgoing.message_id = Some(message.id);
				outgoing.advance(message.delivery_state);
				self.sent.insert(message.id, client_ref);
			}
		}

		shared.emit(UiEvent::NewMessage {
			message: message.clone(),
			client_ref,
		});
	}

	fn on_delivery_updated(&mut self, message_id: MessageId, state: DeliveryState) {
		let Some(client_ref) = self.sent.get(&message_id).copied() else {
			return;
		};
		let Some(outgoing) = self.outbox.get_mut(&client_ref) else {
			return;
		};
		if !outgoing.advance(state) {
			tracing::debug!(%message_id, ?state, current = ?outgoing.state(), "stale delivery update ignored");
			return;
		}
		if state.is_terminal() {
			self.settle(client_ref);
		}
	}

	async fn on_rejected(&mut self, ctx: &mut ActorContext<Self>, room: &RoomId, command: &Payload, cause: &str, reason: Rejection) {
		let retryable = reason.is_retryable();
		if retryable {
			self.rooms.remove(room);
		}
		if reason == Rejection::NotMember && self.joined.contains(room) {
			tracing::info!(%room, "room does not list this session, joining again");
			if let Err(err) = self.send_to_room(ctx, room, self.command(Retry::Join)).await {
				tracing::debug!(%room, %err, "rejoin not delivered");
			}
		}
		match command {
			Payload::Join { .. } if retryable => self.retry(ctx, room, Retry::Join, cause.to_string()).await,
			Payload::Leave { .. } if retryable => self.retry(ctx, room, Retry::Leave, cause.to_string()).await,
			Payload::Join { .. } => {
				let err = ChatError::RoomUnavailable {
					room: room.clone(),
					cause: cause.to_string(),
				};
				self.finish_join(ctx.state(), room, Err(err));
			}
			Payload::Post { draft } => {
				self.fail_outgoing(ctx.state(), draft.client_ref, cause.to_string());
			}
			other => {
				tracing::warn!(%room, command = other.tag(), %cause, "command rejected");
				ctx.state().emit(UiEvent::MessageError {
					room_id: room.clone(),
					client_ref: None,
					message_id: None,
					cause: cause.to_string(),
				});
			}
		}
	}
}

impl Actor for UserActor {
	type Spec = UserSpec;
	type Control = SessionCommand;
	type State = UserShared;

	fn id(spec: &Self::Spec) -> ActorId {
		ActorId::user(&spec.user)
	}

	fn span(spec: &Self::Spec) -> tracing::Span {
		tracing::info_span!("user", user_id = %spec.user)
	}

	fn state(spec: &Self::Spec) -> Self::State {
		UserShared {
			user: spec.user.clone(),
			callbacks: ArcSwap::from_pointee(Vec::new()),
		}
	}

	fn init(ctx: Init<'_, Self>) -> impl InitFuture<Self> {
		let spec = ctx.spec;
		futures::future::ready(Ok::<_, ActorFailure>(UserActor {
			user: spec.user,
			history_limit: spec.config.delivery_history_limit,
			supervisor: spec.supervisor,
			status: Status::Online,
			joined: BTreeSet::new(),
			rooms: HashMap::new(),
			incarnations: HashMap::new(),
			unread: HashMap::new(),
			typing: HashMap::new(),
			presence: HashMap::new(),
			outbox: HashMap::new(),
			sent: HashMap::new(),
			settled: VecDeque::new(),
			pending_joins: HashMap::new(),
			pending_leaves: HashMap::new(),
			retried: HashSet::new(),
			client_refs: Sequence::default(),
		}))
	}

	async fn receive(&mut self, ctx: &mut ActorContext<Self>, envelope: &Envelope) -> Result<Receive, ActorFailure> {
		match envelope.payload() {
			Payload::UserJoined { room, user } => self.on_user_joined(ctx.state(), room, user),
			Payload::UserLeft { room, user } => self.on_user_left(ctx.state(), room, user),
			Payload::MessagePosted { message, client_ref } => self.on_message_posted(ctx.state(), message, *client_ref),
			Payload::DeliveryUpdated { message_id, state, .. } => self.on_delivery_updated(*message_id, *state),
			Payload::ReactionUpdated {
				room,
				message_id,
				reactions,
				..
			} => {
				if self.follows(room) {
					ctx.state().emit(UiEvent::ReactionUpdated {
						room_id: room.clone(),
						message_id: *message_id,
						reactions: reactions.clone(),
					});
				}
			}
			Payload::TypingUpdated { room, users } => {
				if self.follows(room) {
					let others: Vec<_> = users.iter().filter(|user| **user != self.user).cloned().collect();
					self.typing.insert(room.clone(), others.clone());
					ctx.state().emit(UiEvent::TypingUsersUpdated {
						room_id: room.clone(),
						users: others,
					});
				}
			}
			Payload::PresenceUpdated { room, user, status } => {
				if self.follows(room) {
					self.presence
						.entry(room.clone())
						.or_default()
						.insert(user.clone(), *status);
					ctx.state().emit(UiEvent::PresenceUpdated {
						room_id: room.clone(),
						user_id: user.clone(),
						status: *status,
					});
				}
			}
			Payload::MessagesRead {
				room,
				reader,
				message_ids,
			} => {
				if self.follows(room) {
					if *reader == self.user {
						if let Some(unread) = self.unread.get_mut(room) {
							for id in message_ids {
								unread.remove(id);
							}
						}
					}
					ctx.state().emit(UiEvent::MessagesRead {
						room_id: room.clone(),
						reader: reader.clone(),
						message_ids: message_ids.clone(),
					});
				}
			}
			Payload::Rejected {
				room,
				command,
				cause,
				reason,
			} => self.on_rejected(ctx, room, command, cause, *reason).await,
			Payload::PersistFailed {
				room,
				message_id,
				cause,
			} => {
				let client_ref = message_id.and_then(|id| self.sent.get(&id).copied());
				ctx.state().emit(UiEvent::MessageError {
					room_id: room.clone(),
					client_ref,
					message_id: *message_id,
					cause: cause.clone(),
				});
			}
			_ => return Ok(Receive::Unhandled),
		}
		Ok(Receive::Handled)
	}

	async fn control(
		&mut self,
		ctx: &mut ActorContext<Self>,
		control: Self::Control,
	) -> Result<ControlFlow<StopReason>, ActorFailure> {
		match control {
			SessionCommand::Join { room, reply } => self.join(ctx, room, reply).await,
			SessionCommand::Leave { room, reply } => self.leave(ctx, room, reply).await,
			SessionCommand::SendMessage {
				room,
				content,
				options,
				reply,
			} => {
				let _ = reply.send(self.send_message(ctx, room, content, options).await);
			}
			SessionCommand::AddReaction {
				room,
				message_id,
				emoji,
				reply,
			} => {
				let result = match self.ensure_joined(&room) {
					Ok(()) => {
						let payload = Payload::React {
							user: self.user.clone(),
							message_id,
							emoji,
						};
						self.send_to_room(ctx, &room, payload).await
					}
					Err(err) => Err(err),
				};
				let _ = reply.send(result);
			}
			SessionCommand::SetTyping { room, typing, reply } => {
				let result = match self.ensure_joined(&room) {
					Ok(()) => {
						let payload = Payload::SetTyping {
							user: self.user.clone(),
							typing,
						};
						self.send_to_room(ctx, &room, payload).await
					}
					Err(err) => Err(err),
				};
				let _ = reply.send(result);
			}
			SessionCommand::MarkRead {
				room,
				message_ids,
				reply,
			} => {
				let _ = reply.send(self.mark_read(ctx, room, message_ids).await);
			}
			SessionCommand::SetStatus { status, reply } => {
				self.set_status(ctx, status).await;
				let _ = reply.send(Ok(()));
			}
			SessionCommand::ActiveChats { reply } => {
				let _ = reply.send(self.joined.iter().cloned().collect());
			}
			SessionCommand::UnreadCount { room, reply } => {
				let _ = reply.send(self.unread_count(room.as_ref()));
			}
			SessionCommand::DeliveryHistory { client_ref, reply } => {
				let history = self.outbox.get(&client_ref).map(|outgoing| outgoing.history.clone());
				let _ = reply.send(history);
			}
			SessionCommand::Abandon {
				client_ref,
				cause,
				reply,
			} => {
				let result = if self.outbox.contains_key(&client_ref) {
					Ok(self.fail_outgoing(ctx.state(), client_ref, cause))
				} else {
					Err(ChatError::UnknownMessage(client_ref))
				};
				let _ = reply.send(result);
			}
			SessionCommand::Stop { reply } => {
				self.leave_all(ctx).await;
				let _ = reply.send(());
				return Ok(ControlFlow::Break(StopReason::Requested));
			}
		}
		Ok(ControlFlow::Continue(()))
	}

	async fn terminate(mut self, ctx: &mut ActorContext<Self>, reason: &StopReason) {
		if !self.joined.is_empty() {
			self.leave_all(ctx).await;
		}
		tracing::info!(user = %self.user, status = ?self.status, %reason, "session closed");
	}
}

/// Handle to a connected session. Cloning it is cheap; the session stops
/// when the last handle is dropped or [`stop`](Self::stop) is called.
#[derive(Clone, Debug)]
pub struct UserHandle {
	link: Link<UserActor>,
}

impl UserHandle {
	pub(crate) fn new(link: Link<UserActor>) -> Self {
		Self { link }
	}

	pub fn user_id(&self) -> &UserId {
		&self.link.state().user
	}

	pub fn actor_id(&self) -> &ActorId {
		self.link.id()
	}

	pub fn link(&self) -> &Link<UserActor> {
		&self.link
	}

	/// Registers a callback for every [`UiEvent`] this session emits.
	/// Callbacks run on the session's task, in registration order.
	pub fn add_ui_callback(&self, callback: impl Fn(&UiEvent) + Send + Sync + 'static) {
		let callback: UiCallback = Arc::new(callback);
		self.link.state().callbacks.rcu(|current| {
			let mut next = Vec::clone(current);
			next.push(callback.clone());
			next
		});
	}

	/// Joins `room`, starting it if needed. Resolves once the room has
	/// confirmed the membership.
	pub async fn join_room(&self, room: impl Into<RoomId>) -> Result<(), ChatError> {
		let room = room.into();
		self.link.ask(|reply| SessionCommand::Join { room, reply }).await?
	}

	/// Leaves `room`. Resolves once the room has confirmed, or immediately if
	/// the room can no longer be reached.
	pub async fn leave_room(&self, room: impl Into<RoomId>) -> Result<(), ChatError> {
		let room = room.into();
		self.link.ask(|reply| SessionCommand::Leave { room, reply }).await?
	}

	/// Posts a message. Returns as soon as the command is handed to the room;
	/// the outcome arrives as `new_message` or `message_error` events.
	pub async fn send_message(
		&self,
		room: impl Into<RoomId>,
		content: impl Into<String>,
		options: SendOptions,
	) -> Result<ClientRef, ChatError> {
		let room = room.into();
		let content = content.into();
		self.link
			.ask(|reply| SessionCommand::SendMessage {
				room,
				content,
				options,
				reply,
			})
			.await?
	}

	/// Toggles `emoji` on a message.
	pub async fn add_reaction(&self, room: impl Into<RoomId>, message_id: MessageId, emoji: impl Into<String>) -> Result<(), ChatError> {
		let room = room.into();
		let emoji = emoji.into();
		self.link
			.ask(|reply| SessionCommand::AddReaction {
				room,
				message_id,
				emoji,
				reply,
			})
			.await?
	}

	pub async fn start_typing(&self, room: impl Into<RoomId>) -> Result<(), ChatError> {
		self.set_typing(room.into(), true).await
	}

	pub async fn stop_typing(&self, room: impl Into<RoomId>) -> Result<(), ChatError> {
		self.set_typing(room.into(), false).await
	}

	async fn set_typing(&self, room: RoomId, typing: bool) -> Result<(), ChatError> {
		self.link
			.ask(|reply| SessionCommand::SetTyping { room, typing, reply })
			.await?
	}

	/// Marks messages read. An empty list marks everything unread in `room`.
	pub async fn mark_messages_read(&self, room: impl Into<RoomId>, message_ids: Vec<MessageId>) -> Result<(), ChatError> {
		let room = room.into();
		self.link
			.ask(|reply| SessionCommand::MarkRead {
				room,
				message_ids,
				reply,
			})
			.await?
	}

	pub async fn update_connection_status(&self, status: Status) -> Result<(), ChatError> {
		self.link
			.ask(|reply| SessionCommand::SetStatus { status, reply })
			.await?
	}

	pub async fn get_active_chats(&self) -> Result<Vec<RoomId>, ChatError> {
		self.link.ask(|reply| SessionCommand::ActiveChats { reply }).await
	}

	pub async fn get_unread_count(&self, room: impl Into<RoomId>) -> Result<usize, ChatError> {
		let room = Some(room.into());
		self.link
			.ask(|reply| SessionCommand::UnreadCount { room, reply })
			.await
	}

	pub async fn get_total_unread(&self) -> Result<usize, ChatError> {
		self.link
			.ask(|reply| SessionCommand::UnreadCount { room: None, reply })
			.await
	}

	/// Delivery states observed for one of this session's messages, oldest
	/// first. Only the most recent settled messages are remembered.
	pub async fn delivery_history(&self, client_ref: ClientRef) -> Result<Option<Vec<DeliveryState>>, ChatError> {
		self.link
			.ask(|reply| SessionCommand::DeliveryHistory { client_ref, reply })
			.await
	}

	/// Gives up on a pending message, e.g. after a caller-side deadline.
	/// Returns `false` if it had already left the `sending`/`sent` stages.
	pub async fn abandon(&self, client_ref: ClientRef, cause: impl Into<String>) -> Result<bool, ChatError> {
		let cause = cause.into();
		self.link
			.ask(|reply| SessionCommand::Abandon {
				client_ref,
				cause,
				reply,
			})
			.await?
	}

	/// Leaves every joined room, then stops the session and waits for it to exit.
	pub async fn stop(&self) -> Result<StopReason, ChatError> {
		self.link.ask(|reply| SessionCommand::Stop { reply }).await?;
		Ok(self.link.wait_exit().await)
	}
}
