use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::id::ClientRef;
use crate::id::MessageId;
use crate::id::RoomId;
use crate::id::UserId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
	#[default]
	Text,
	Image,
	File,
	System,
}

/// Lifecycle stage of a chat message.
///
/// The happy path only moves forward (`Sending -> Sent -> Delivered -> Read`).
/// `Failed` is reachable from `Sending` and `Sent` and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
	Sending,
	Sent,
	Delivered,
	Read,
	Failed,
}

impl DeliveryState {
	fn rank(self) -> u8 {
		match self {
			DeliveryState::Sending => 0,
			DeliveryState::Sent => 1,
			DeliveryState::Delivered => 2,
			DeliveryState::Read => 3,
			DeliveryState::Failed => u8::MAX,
		}
	}

	/// Only the next stage of the happy path is allowed; a message is never
	/// `Read` without having been `Delivered` first.
	pub fn can_advance_to(self, next: DeliveryState) -> bool {
		match (self, next) {
			(DeliveryState::Failed, _) => false,
			(DeliveryState::Sending | DeliveryState::Sent, DeliveryState::Failed) => true,
			(_, DeliveryState::Failed) => false,
			(current, next) => next.rank() == current.rank() + 1,
		}
	}

	pub fn is_terminal(self) -> bool {
		matches!(self, DeliveryState::Read | DeliveryState::Failed)
	}
}

/// Session presence as seen by room members.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
	#[default]
	Online,
	Away,
	Busy,
	Offline,
}

/// Emoji reactions on one message. An emoji key never maps to an empty set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reactions(BTreeMap<String, BTreeSet<UserId>>);

impl Reactions {
	/// Adds `user` under `emoji`, or removes it if already present.
	/// Returns `true` when the reaction was added.
	pub fn toggle(&mut self, emoji: &str, user: &UserId) -> bool {
		match self.0.get_mut(emoji) {
			Some(users) if users.contains(user) => {
				users.remove(user);
				if users.is_empty() {
					self.0.remove(emoji);
				}
				false
			}
			Some(users) => {
				users.insert(user.clone());
				true
			}
			None => {
				self.0.insert(emoji.to_string(), BTreeSet::from([user.clone()]));
				true
			}
		}
	}

	pub fn users(&self, emoji: &str) -> Option<&BTreeSet<UserId>> {
		self.0.get(emoji)
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}
}

/// Options accepted by `send_message` besides the text itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOptions {
	pub kind: MessageKind,
	pub file_ref: Option<String>,
	pub reply_to: Option<MessageId>,
}

/// What a user submits to a room. The room turns it into a [`ChatMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
	pub client_ref: ClientRef,
	pub sender: UserId,
	pub content: String,
	#[serde(default)]
	pub options: SendOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub id: MessageId,
	pub room_id: RoomId,
	pub sender_id: UserId,
	pub content: String,
	pub kind: MessageKind,
	pub file_ref: Option<String>,
	pub reply_to_id: Option<MessageId>,
	pub reactions: Reactions,
	pub delivery_state: DeliveryState,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl ChatMessage {
	/// Builds the canonical message for `draft`, stamped with a fresh id.
	pub fn from_draft(room: &RoomId, draft: &MessageDraft) -> Self {
		let now = Utc::now();
		Self {
			id: MessageId::generate(),
			room_id: room.clone(),
			sender_id: draft.sender.clone(),
			content: draft.content.clone(),
			kind: draft.options.kind,
			file_ref: draft.options.file_ref.clone(),
			reply_to_id: draft.options.reply_to,
			reactions: Reactions::default(),
			delivery_state: DeliveryState::Sent,
			created_at: now,
			updated_at: now,
		}
	}

	/// Moves the delivery state forward. Backward or out-of-order
	/// transitions are ignored and reported as `false`.
	pub fn advance(&mut self, next: DeliveryState) -> bool {
		if !self.delivery_state.can_advance_to(next) {
			return false;
		}
		self.delivery_state = next;
		self.updated_at = Utc::now();
		true
	}

	pub fn toggle_reaction(&mut self, emoji: &str, user: &UserId) -> bool {
		let added = self.reactions.toggle(emoji, user);
		self.updated_at = Utc::now();
		added
	}
}
