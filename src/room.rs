use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

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
use crate::id::ActorId;
use crate::id::MessageId;
use crate::id::RoomId;
use crate::id::UserId;
use crate::link::WeakLink;
use crate::message::ChatMessage;
use crate::message::DeliveryState;
use crate::message::MessageDraft;
use crate::message::Status;
use crate::persistence::Persistence;
use crate::stop::StopReason;
use crate::supervisor::RoomSupervisor;
use crate::supervisor::SupervisorControl;

pub struct RoomSpec {
	pub room: RoomId,
	pub incarnation: u64,
	pub config: Arc<ChatConfig>,
	pub persistence: Arc<dyn Persistence>,
	pub supervisor: Option<WeakLink<RoomSupervisor>>,
}

/// Fixed facts about one room incarnation, readable through its links.
#[derive(Debug, Clone)]
pub struct RoomInfo {
	pub room: RoomId,
	pub incarnation: u64,
}

/// Point-in-time copy of a room's state.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSnapshot {
	pub room: RoomId,
	pub incarnation: u64,
	pub members: BTreeSet<UserId>,
	pub recent: Vec<ChatMessage>,
	pub typing: Vec<UserId>,
	pub presence: HashMap<UserId, Status>,
}

pub enum RoomControl {
	Snapshot { reply: oneshot::Sender<RoomSnapshot> },
	/// Makes the current handler fail, as if it had hit a bug.
	Fail { cause: String },
	/// Sent by the supervisor after an idle report; stops the room only if it
	/// is still empty once this reaches the front of the mailbox.
	Retire,
}

/// Canonical state of one room. Only the owning [`RoomActor`] writes it.
#[derive(Debug, Default)]
pub struct RoomState {
	pub members: BTreeSet<UserId>,
	pub recent: VecDeque<ChatMessage>,
	pub typing: HashMap<UserId, Instant>,
	pub presence: HashMap<UserId, Status>,
	reads: HashMap<MessageId, BTreeSet<UserId>>,
}

impl RoomState {
	fn message_mut(&mut self, id: MessageId) -> Option<&mut ChatMessage> {
		self.recent.iter_mut().find(|message| message.id == id)
	}

	fn typing_users(&self) -> Vec<UserId> {
		let mut users: Vec<_> = self.typing.keys().cloned().collect();
		users.sort();
		users
	}

	/// Every current member other than the sender has read `message`.
	fn fully_read(&self, message: &ChatMessage) -> bool {
		let readers = self.reads.get(&message.id);
		self.members
			.iter()
			.filter(|member| **member != message.sender_id)
			.all(|member| readers.is_some_and(|readers| readers.contains(member)))
	}
}

pub struct RoomActor {
	room: RoomId,
	incarnation: u64,
	config: Arc<ChatConfig>,
	persistence: Arc<dyn Persistence>,
	supervisor: Option<WeakLink<RoomSupervisor>>,
	state: RoomState,
	empty_since: Option<Instant>,
	idle_reported: bool,
}

impl RoomActor {
	pub fn snapshot(&self) -> RoomSnapshot {
		RoomSnapshot {
			room: self.room.clone(),
			incarnation: self.incarnation,
			members: self.state.members.clone(),
			recent: self.state.recent.iter().cloned().collect(),
			typing: self.state.typing_users(),
			presence: self.state.presence.clone(),
		}
	}

	/// Sends `payload` to every connected member, in member order. Returns
	/// the members whose mailbox accepted it.
	fn fan_out(&self, ctx: &mut ActorContext<Self>, payload: &Payload) -> Vec<UserId> {
		let mut reached = Vec::with_capacity(self.state.members.len());
		for member in &self.state.members {
			let session = ActorId::user(member);
			// rostered members without a connected session are skipped, not dead-lettered
			if !ctx.router().registry().contains(&session) {
				continue;
			}
			match ctx.route(session, payload.clone()) {
				Ok(()) => reached.push(member.clone()),
				Err(err) => tracing::debug!(%member, %err, "member unreachable"),
			}
		}
		reached
	}

	fn reply(&self, ctx: &mut ActorContext<Self>, to: &ActorId, payload: Payload) {
		if let Err(err) = ctx.route(to.clone(), payload) {
			tracing::debug!(%to, %err, "reply not delivered");
		}
	}

	fn refuse(&self, ctx: &mut ActorContext<Self>, envelope: &Envelope, cause: impl Into<String>) {
		let payload = Payload::Rejected {
			room: self.room.clone(),
			command: Box::new(envelope.payload().clone()),
			cause: cause.into(),
			reason: Rejection::NotMember,
		};
		self.reply(ctx, envelope.from(), payload);
	}

	fn persist_failed(&self, ctx: &mut ActorContext<Self>, to: &ActorId, message_id: Option<MessageId>, err: anyhow::Error) {
		tracing::warn!(room = %self.room, error = %err, "persistence failed");
		let payload = Payload::PersistFailed {
			room: self.room.clone(),
			message_id,
			cause: format!("{err:#}"),
		};
		self.reply(ctx, to, payload);
	}

	fn typing_changed(&self, ctx: &mut ActorContext<Self>) {
		let payload = Payload::TypingUpdated {
			room: self.room.clone(),
			users: self.state.typing_users(),
		};
		self.fan_out(ctx, &payload);
	}

	async fn join(&mut self, ctx: &mut ActorContext<Self>, envelope: &Envelope, user: &UserId) {
		self.empty_since = None;
		self.idle_reported = false;

		let joined = Payload::UserJoined {
			room: self.room.clone(),
			user: user.clone(),
		};
		let fresh = self.state.members.insert(user.clone());
		if fresh {
			self.state.presence.entry(user.clone()).or_insert(Status::Online);
			tracing::info!(%user, "joined");
			self.fan_out(ctx, &joined);
		} else {
			// already on the roster: a reconnecting session or a re-sent join
			self.reply(ctx, envelope.from(), joined);
		}
		self.send_presence(ctx, envelope.from(), user);

		if fresh {
			if let Err(err) = self.persistence.add_member(&self.room, user).await {
				self.persist_failed(ctx, envelope.from(), None, err);
			}
		}
	}

	/// Tells a joining session the current status of every other member.
	fn send_presence(&self, ctx: &mut ActorContext<Self>, to: &ActorId, user: &UserId) {
		for (member, status) in &self.state.presence {
			if member != user {
				let payload = Payload::PresenceUpdated {
					room: self.room.clone(),
					user: member.clone(),
					status: *status,
				};
				self.reply(ctx, to, payload);
			}
		}
	}

	async fn leave(&mut self, ctx: &mut ActorContext<Self>, envelope: &Envelope, user: &UserId) {
		let left = Payload::UserLeft {
			room: self.room.clone(),
			user: user.clone(),
		};
		if !self.state.members.contains(user) {
			// the session may still think it is a member, e.g. after a lost roster write
			self.reply(ctx, envelope.from(), left);
			return;
		}

		// the leaver is still a member here, so it gets the confirmation too
		self.fan_out(ctx, &left);

		self.state.members.remove(user);
		self.state.presence.remove(user);
		if self.state.typing.remove(user).is_some() {
			self.typing_changed(ctx);
		}
		if self.state.members.is_empty() {
			self.empty_since = Some(Instant::now());
		}
		tracing::info!(%user, "left");

		if let Err(err) = self.persistence.remove_member(&self.room, user).await {
			self.persist_failed(ctx, envelope.from(), None, err);
		}
	}

	async fn post(&mut self, ctx: &mut ActorContext<Self>, envelope: &Envelope, draft: &MessageDraft) {
		let mut message = ChatMessage::from_draft(&self.room, draft);
		let id = message.id;

		if self.state.recent.len() >= self.config.recent_message_limit {
			if let Some(evicted) = self.state.recent.pop_front() {
				self.state.reads.remove(&evicted.id);
			}
		}
		self.state.recent.push_back(message.clone());
		metrics::counter!("chat.messages.posted").increment(1);

		if self.state.typing.remove(&draft.sender).is_some() {
			self.typing_changed(ctx);
		}

		let posted = Payload::MessagePosted {
			message: message.clone(),
			client_ref: Some(draft.client_ref),
		};
		let reached = self.fan_out(ctx, &posted);

		if reached.iter().any(|member| *member != draft.sender) {
			message.advance(DeliveryState::Delivered);
			if let Some(logged) = self.state.message_mut(id) {
				logged.advance(DeliveryState::Delivered);
			}
			let payload = Payload::DeliveryUpdated {
				room: self.room.clone(),
				message_id: id,
				state: DeliveryState::Delivered,
			};
			self.reply(ctx, envelope.from(), payload);
		}

		if let Err(err) = self.persistence.append_message(&message).await {
			self.persist_failed(ctx, envelope.from(), Some(id), err);
		}
	}

	async fn react(&mut self, ctx: &mut ActorContext<Self>, envelope: &Envelope, user: &UserId, message_id: MessageId, emoji: &str) {
		let Some(message) = self.state.message_mut(message_id) else {
			tracing::debug!(%message_id, "reaction to unknown message ignored");
			return;
		};
		let added = message.toggle_reaction(emoji, user);
		let reactions = message.reactions.clone();

		let payload = Payload::ReactionUpdated {
			room: self.room.clone(),
			message_id,
			emoji: emoji.to_string(),
			user: user.clone(),
			added,
			reactions: reactions.clone(),
		};
		self.fan_out(ctx, &payload);

		if let Err(err) = self.persistence.record_reaction(&self.room, message_id, &reactions).await {
			self.persist_failed(ctx, envelope.from(), Some(message_id), err);
		}
	}

	fn set_typing(&mut self, ctx: &mut ActorContext<Self>, user: &UserId, typing: bool) {
		let changed = if typing {
			self.state.typing.insert(user.clone(), Instant::now()).is_none()
		} else {
			self.state.typing.remove(user).is_some()
		};
		if changed {
			self.typing_changed(ctx);
		}
	}

	async fn mark_read(&mut self, ctx: &mut ActorContext<Self>, envelope: &Envelope, reader: &UserId, ids: &[MessageId]) {
		let mut newly_read = Vec::new();
		for id in ids {
			let Some(message) = self.state.recent.iter().find(|m| m.id == *id) else {
				continue;
			};
			if message.sender_id == *reader {
				continue;
			}
			if self.state.reads.entry(*id).or_default().insert(reader.clone()) {
				newly_read.push(*id);
			}
		}
		if newly_read.is_empty() {
			return;
		}

		let payload = Payload::MessagesRead {
			room: self.room.clone(),
			reader: reader.clone(),
			message_ids: newly_read.clone(),
		};
		self.fan_out(ctx, &payload);

		// a reader has evidently received the message, even if no other
		// member was connected when it was posted
		let mut transitions = Vec::new();
		for id in &newly_read {
			let Some(message) = self.state.message_mut(*id) else {
				continue;
			};
			if message.advance(DeliveryState::Delivered) {
				transitions.push((*id, message.sender_id.clone(), DeliveryState::Delivered));
			}
		}
		for id in &newly_read {
			let Some(message) = self.state.recent.iter().find(|m| m.id == *id) else {
				continue;
			};
			if !self.state.fully_read(message) {
				continue;
			}
			let sender = message.sender_id.clone();
			if let Some(message) = self.state.message_mut(*id) {
				if message.advance(DeliveryState::Read) {
					transitions.push((*id, sender, DeliveryState::Read));
				}
			}
		}

		for (id, sender, state) in &transitions {
			if self.state.members.contains(sender) {
				let payload = Payload::DeliveryUpdated {
					room: self.room.clone(),
					message_id: *id,
					state: *state,
				};
				self.reply(ctx, &ActorId::user(sender), payload);
			}
		}

		if let Err(err) = self.persistence.mark_read(&self.room, reader, &newly_read).await {
			self.persist_failed(ctx, envelope.from(), None, err);
		}
		for (id, _, state) in transitions {
			if let Err(err) = self.persistence.update_delivery(&self.room, id, state).await {
				tracing::warn!(room = %self.room, message = %id, error = %err, "delivery state not persisted");
			}
		}
	}

	fn presence_update(&mut self, ctx: &mut ActorContext<Self>, user: &UserId, status: Status) {
		if self.state.presence.insert(user.clone(), status) == Some(status) {
			return;
		}
		let payload = Payload::PresenceUpdated {
			room: self.room.clone(),
			user: user.clone(),
			status,
		};
		self.fan_out(ctx, &payload);
	}

	fn expire_typing(&mut self, ctx: &mut ActorContext<Self>) {
		let ttl = self.config.typing_ttl();
		let before = self.state.typing.len();
		self.state.typing.retain(|_, since| since.elapsed() < ttl);
		if self.state.typing.len() != before {
			self.typing_changed(ctx);
		}
	}

	fn check_idle(&mut self, ctx: &ActorContext<Self>) {
		let Some(since) = self.empty_since else {
			return;
		};
		if self.idle_reported || since.elapsed() < self.config.room_idle() {
			return;
		}
		let Some(supervisor) = &self.supervisor else {
			return;
		};

		tracing::debug!(room = %self.room, "reporting idle room");
		let report = SupervisorControl::RoomIdle {
			room: self.room.clone(),
			instance: ctx.instance(),
		};
		self.idle_reported = supervisor.tell(report).is_ok();
	}
}

impl Actor for RoomActor {
	type Spec = RoomSpec;
	type Control = RoomControl;
	type State = RoomInfo;

	fn id(spec: &Self::Spec) -> ActorId {
		ActorId::room(&spec.room, spec.incarnation)
	}

	fn span(spec: &Self::Spec) -> tracing::Span {
		tracing::info_span!("room", room_id = %spec.room, incarnation = spec.incarnation)
	}

	fn state(spec: &Self::Spec) -> Self::State {
		RoomInfo {
			room: spec.room.clone(),
			incarnation: spec.incarnation,
		}
	}

	fn init(ctx: Init<'_, Self>) -> impl InitFuture<Self> {
		let spec = ctx.spec;
		async move {
			let mut state = RoomState::default();

			match spec.persistence.load_members(&spec.room).await {
				Ok(members) => state.members.extend(members),
				Err(err) => tracing::warn!(error = %err, "roster not loaded, starting empty"),
			}
			match spec
				.persistence
				.load_recent_messages(&spec.room, spec.config.recent_message_limit)
				.await
			{
				Ok(messages) => state.recent.extend(messages),
				Err(err) => tracing::warn!(error = %err, "history not loaded, starting empty"),
			}
			let ids: Vec<_> = state.recent.iter().map(|message| message.id).collect();
			match spec.persistence.load_reads(&spec.room, &ids).await {
				Ok(reads) => state.reads = reads,
				Err(err) => tracing::warn!(error = %err, "read receipts not loaded"),
			}
			for member in &state.members {
				state.presence.insert(member.clone(), Status::Online);
			}

			tracing::info!(members = state.members.len(), messages = state.recent.len(), "room started");
			let empty_since = state.members.is_empty().then(Instant::now);

			Ok::<_, ActorFailure>(RoomActor {
				room: spec.room,
				incarnation: spec.incarnation,
				config: spec.config,
				persistence: spec.persistence,
				supervisor: spec.supervisor,
				state,
				empty_since,
				idle_reported: false,
			})
		}
	}

	async fn receive(&mut self, ctx: &mut ActorContext<Self>, envelope: &Envelope) -> Result<Receive, ActorFailure> {
		let payload = envelope.payload();
		if let Some(user) = acting_user(payload) {
			let needs_membership = !matches!(payload, Payload::Join { .. } | Payload::Leave { .. });
			if needs_membership && !self.state.members.contains(user) {
				self.refuse(ctx, envelope, format!("{user} is not a member of room {}", self.room));
				return Ok(Receive::Handled);
			}
		}

		match payload {
			Payload::Join { user } => self.join(ctx, envelope, user).await,
			Payload::Leave { user } => self.leave(ctx, envelope, user).await,
			Payload::Post { draft } => self.post(ctx, envelope, draft).await,
			Payload::React {
				user,
				message_id,
				emoji,
			} => self.react(ctx, envelope, user, *message_id, emoji).await,
			Payload::SetTyping { user, typing } => self.set_typing(ctx, user, *typing),
			Payload::MarkRead { user, message_ids } => self.mark_read(ctx, envelope, user, message_ids).await,
			Payload::PresenceUpdate { user, status } => self.presence_update(ctx, user, *status),
			_ => return Ok(Receive::Unhandled),
		}
		Ok(Receive::Handled)
	}

	async fn control(
		&mut self,
		_ctx: &mut ActorContext<Self>,
		control: Self::Control,
	) -> Result<ControlFlow<StopReason>, ActorFailure> {
		match control {
			RoomControl::Snapshot { reply } => {
				let _ = reply.send(self.snapshot());
			}
			RoomControl::Fail { cause } => return Err(ActorFailure::new(cause)),
			RoomControl::Retire => {
				if self.state.members.is_empty() {
					return Ok(ControlFlow::Break(StopReason::Idle));
				}
				self.idle_reported = false;
			}
		}
		Ok(ControlFlow::Continue(()))
	}

	fn tick_interval(&self) -> Option<Duration> {
		Some(self.config.sweep_interval())
	}

	async fn tick(&mut self, ctx: &mut ActorContext<Self>) -> Result<(), ActorFailure> {
		self.expire_typing(ctx);
		self.check_idle(ctx);
		Ok(())
	}

	fn reject(ctx: &mut ActorContext<Self>, envelope: Envelope, reason: &StopReason) {
		if !envelope.payload().is_room_command() {
			return;
		}
		let payload = Payload::Rejected {
			room: ctx.state().room.clone(),
			command: Box::new(envelope.payload().clone()),
			cause: format!("room {} stopped before handling it ({reason})", ctx.state().room),
			reason: Rejection::Stopped,
		};
		if let Err(err) = ctx.route(envelope.from().clone(), payload) {
			tracing::debug!(%err, "rejection not delivered");
		}
	}

	async fn terminate(self, _ctx: &mut ActorContext<Self>, reason: &StopReason) {
		tracing::info!(room = %self.room, %reason, "room stopped");
	}
}

fn acting_user(payload: &Payload) -> Option<&UserId> {
	match payload {
		Payload::Join { user }
		| Payload::Leave { user }
		| Payload::React { user, .. }
		| Payload::SetTyping { user, .. }
		| Payload::MarkRead { user, .. }
		| Payload::PresenceUpdate { user, .. } => Some(user),
		Payload::Post { draft } => Some(&draft.sender),
		_ => None,
	}
}
