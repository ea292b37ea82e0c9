use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::id::ActorId;
use crate::id::ClientRef;
use crate::id::MessageId;
use crate::id::RoomId;
use crate::id::Sequence;
use crate::id::UserId;
use crate::message::ChatMessage;
use crate::message::DeliveryState;
use crate::message::MessageDraft;
use crate::message::Reactions;
use crate::message::Status;

/// Sender-scoped, monotonically assigned envelope number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(pub u64);

/// Why a room refused a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
	/// The room instance stopped before reaching it; re-resolving the room may help.
	Stopped,
	/// The acting user is not on the room's roster.
	NotMember,
}

impl Rejection {
	pub fn is_retryable(self) -> bool {
		self == Rejection::Stopped
	}
}

/// Every message shape that can travel between actors.
///
/// The first group are commands addressed to a room actor, the second group
/// are the broadcasts and replies a room sends back to member sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
	Join {
		user: UserId,
	},
	Leave {
		user: UserId,
	},
	Post {
		draft: MessageDraft,
	},
	React {
		user: UserId,
		message_id: MessageId,
		emoji: String,
	},
	SetTyping {
		user: UserId,
		typing: bool,
	},
	MarkRead {
		user: UserId,
		message_ids: Vec<MessageId>,
	},
	PresenceUpdate {
		user: UserId,
		status: Status,
	},

	UserJoined {
		room: RoomId,
		user: UserId,
	},
	UserLeft {
		room: RoomId,
		user: UserId,
	},
	MessagePosted {
		message: ChatMessage,
		client_ref: Option<ClientRef>,
	},
	ReactionUpdated {
		room: RoomId,
		message_id: MessageId,
		emoji: String,
		user: UserId,
		added: bool,
		reactions: Reactions,
	},
	TypingUpdated {
		room: RoomId,
		users: Vec<UserId>,
	},
	PresenceUpdated {
		room: RoomId,
		user: UserId,
		status: Status,
	},
	MessagesRead {
		room: RoomId,
		reader: UserId,
		message_ids: Vec<MessageId>,
	},
	DeliveryUpdated {
		room: RoomId,
		message_id: MessageId,
		state: DeliveryState,
	},
	/// A command the room will not execute.
	Rejected {
		room: RoomId,
		command: Box<Payload>,
		cause: String,
		reason: Rejection,
	},
	PersistFailed {
		room: RoomId,
		message_id: Option<MessageId>,
		cause: String,
	},
}

impl Payload {
	pub fn tag(&self) -> &'static str {
		match self {
			Payload::Join { .. } => "join",
			Payload::Leave { .. } => "leave",
			Payload::Post { .. } => "post",
			Payload::React { .. } => "react",
			Payload::SetTyping { .. } => "set_typing",
			Payload::MarkRead { .. } => "mark_read",
			Payload::PresenceUpdate { .. } => "presence_update",
			Payload::UserJoined { .. } => "user_joined",
			Payload::UserLeft { .. } => "user_left",
			Payload::MessagePosted { .. } => "message_posted",
			Payload::ReactionUpdated { .. } => "reaction_updated",
			Payload::TypingUpdated { .. } => "typing_updated",
			Payload::PresenceUpdated { .. } => "presence_updated",
			Payload::MessagesRead { .. } => "messages_read",
			Payload::DeliveryUpdated { .. } => "delivery_updated",
			Payload::Rejected { .. } => "rejected",
			Payload::PersistFailed { .. } => "persist_failed",
		}
	}

	/// Whether this payload is a command a room actor executes.
	pub fn is_room_command(&self) -> bool {
		matches!(
			self,
			Payload::Join { .. }
				| Payload::Leave { .. }
				| Payload::Post { .. }
				| Payload::React { .. }
				| Payload::SetTyping { .. }
				| Payload::MarkRead { .. }
				| Payload::PresenceUpdate { .. }
		)
	}
}

/// Addressed, immutable message unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
	to: ActorId,
	from: ActorId,
	id: EnvelopeId,
	timestamp: DateTime<Utc>,
	payload: Payload,
}

impl Envelope {
	pub fn new(from: ActorId, to: ActorId, id: EnvelopeId, payload: Payload) -> Self {
		Self {
			to,
			from,
			id,
			timestamp: Utc::now(),
			payload,
		}
	}

	/// Stamps a new envelope with the next id from the sender's sequence.
	pub fn stamped(sequence: &mut Sequence, from: ActorId, to: ActorId, payload: Payload) -> Self {
		Self::new(from, to, EnvelopeId(sequence.next()), payload)
	}

	pub fn to(&self) -> &ActorId {
		&self.to
	}

	pub fn from(&self) -> &ActorId {
		&self.from
	}

	pub fn id(&self) -> EnvelopeId {
		self.id
	}

	pub fn timestamp(&self) -> DateTime<Utc> {
		self.timestamp
	}

	pub fn payload(&self) -> &Payload {
		&self.payload
	}

	pub fn into_payload(self) -> Payload {
		self.payload
	}
}
