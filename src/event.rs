use std::sync::Arc;

use serde::Serialize;

use crate::id::ClientRef;
use crate::id::MessageId;
use crate::id::RoomId;
use crate::id::UserId;
use crate::message::ChatMessage;
use crate::message::Reactions;
use crate::message::Status;

/// Typed event handed to UI callbacks. These are the only event types a
/// session ever emits.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum UiEvent {
	NewMessage {
		message: ChatMessage,
		/// Set on the sender's own session so the UI can swap out its
		/// optimistic echo.
		client_ref: Option<ClientRef>,
	},
	ReactionUpdated {
		room_id: RoomId,
		message_id: MessageId,
		reactions: Reactions,
	},
	TypingUsersUpdated {
		room_id: RoomId,
		users: Vec<UserId>,
	},
	PresenceUpdated {
		room_id: RoomId,
		user_id: UserId,
		status: Status,
	},
	UserJoined {
		room_id: RoomId,
		user_id: UserId,
	},
	UserLeft {
		room_id: RoomId,
		user_id: UserId,
	},
	MessagesRead {
		room_id: RoomId,
		reader: UserId,
		message_ids: Vec<MessageId>,
	},
	MessageError {
		room_id: RoomId,
		client_ref: Option<ClientRef>,
		message_id: Option<MessageId>,
		cause: String,
	},
}

impl UiEvent {
	pub fn event_type(&self) -> &'static str {
		match self {
			UiEvent::NewMessage { .. } => "new_message",
			UiEvent::ReactionUpdated { .. } => "reaction_updated",
			UiEvent::TypingUsersUpdated { .. } => "typing_users_updated",
			UiEvent::PresenceUpdated { .. } => "presence_updated",
			UiEvent::UserJoined { .. } => "user_joined",
			UiEvent::UserLeft { .. } => "user_left",
			UiEvent::MessagesRead { .. } => "messages_read",
			UiEvent::MessageError { .. } => "message_error",
		}
	}

	/// The event's data object, as the UI layer consumes it.
	pub fn data(&self) -> serde_json::Value {
		match serde_json::to_value(self) {
			Ok(serde_json::Value::Object(mut map)) => map.remove("data").unwrap_or_default(),
			_ => serde_json::Value::Null,
		}
	}

	pub fn room_id(&self) -> &RoomId {
		match self {
			UiEvent::NewMessage { message, .. } => &message.room_id,
			UiEvent::ReactionUpdated { room_id, .. }
			| UiEvent::TypingUsersUpdated { room_id, .. }
			| UiEvent::PresenceUpdated { room_id, .. }
			| UiEvent::UserJoined { room_id, .. }
			| UiEvent::UserLeft { room_id, .. }
			| UiEvent::MessagesRead { room_id, .. }
			| UiEvent::MessageError { room_id, .. } => room_id,
		}
	}
}

pub type UiCallback = Arc<dyn Fn(&UiEvent) + Send + Sync>;
