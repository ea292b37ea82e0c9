//! Boundary to the durable store. The engine keeps canonical state in memory
//! and mirrors every mutation here; a restarted room seeds itself from it.

use std::collections::BTreeSet;
use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::id::MessageId;
use crate::id::RoomId;
use crate::id::UserId;
use crate::message::ChatMessage;
use crate::message::DeliveryState;
use crate::message::Reactions;

#[async_trait]
pub trait Persistence: Send + Sync + 'static {
	/// Newest `limit` messages of `room`, oldest first.
	async fn load_recent_messages(&self, room: &RoomId, limit: usize) -> anyhow::Result<Vec<ChatMessage>>;

	async fn append_message(&self, message: &ChatMessage) -> anyhow::Result<()>;

	async fn record_reaction(&self, room: &RoomId, message_id: MessageId, reactions: &Reactions) -> anyhow::Result<()>;

	async fn mark_read(&self, room: &RoomId, reader: &UserId, message_ids: &[MessageId]) -> anyhow::Result<()>;

	/// Recorded readers of each of `message_ids`. Ids nobody has read may be
	/// left out.
	async fn load_reads(&self, room: &RoomId, message_ids: &[MessageId]) -> anyhow::Result<HashMap<MessageId, BTreeSet<UserId>>>;

	async fn update_delivery(&self, room: &RoomId, message_id: MessageId, state: DeliveryState) -> anyhow::Result<()>;

	/// Durable room roster.
	async fn load_members(&self, room: &RoomId) -> anyhow::Result<Vec<UserId>>;

	async fn add_member(&self, room: &RoomId, user: &UserId) -> anyhow::Result<()>;

	async fn remove_member(&self, room: &RoomId, user: &UserId) -> anyhow::Result<()>;
}

#[derive(Default)]
struct RoomRecord {
	messages: Vec<ChatMessage>,
	members: BTreeSet<UserId>,
	reads: HashMap<MessageId, BTreeSet<UserId>>,
}

/// Process-local store, used by tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryStore {
	rooms: Mutex<HashMap<RoomId, RoomRecord>>,
}

impl InMemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn messages(&self, room: &RoomId) -> Vec<ChatMessage> {
		self.rooms
			.lock()
			.get(room)
			.map(|record| record.messages.clone())
			.unwrap_or_default()
	}

	pub fn members(&self, room: &RoomId) -> BTreeSet<UserId> {
		self.rooms
			.lock()
			.get(room)
			.map(|record| record.members.clone())
			.unwrap_or_default()
	}

	pub fn readers(&self, room: &RoomId, message_id: MessageId) -> BTreeSet<UserId> {
		self.rooms
			.lock()
			.get(room)
			.and_then(|record| record.reads.get(&message_id).cloned())
			.unwrap_or_default()
	}
}

#[async_trait]
impl Persistence for InMemoryStore {
	async fn load_recent_messages(&self, room: &RoomId, limit: usize) -> anyhow::Result<Vec<ChatMessage>> {
		let rooms = self.rooms.lock();
		let Some(record) = rooms.get(room) else {
			return Ok(Vec::new());
		};
		let skip = record.messages.len().saturating_sub(limit);
		Ok(record.messages[skip..].to_vec())
	}

	async fn append_message(&self, message: &ChatMessage) -> anyhow::Result<()> {
		let mut rooms = self.rooms.lock();
		let record = rooms.entry(message.room_id.clone()).or_default();
		if record.messages.iter().any(|known| known.id == message.id) {
			anyhow::bail!("message {} already stored", message.id);
		}
		record.messages.push(message.clone());
		Ok(())
	}

	async fn record_reaction(&self, room: &RoomId, message_id: MessageId, reactions: &Reactions) -> anyhow::Result<()> {
		let mut rooms = self.rooms.lock();
		let message = rooms
			.get_mut(room)
			.and_then(|record| record.messages.iter_mut().find(|m| m.id == message_id));
		match message {
			Some(message) => {
				message.reactions = reactions.clone();
				Ok(())
			}
			None => anyhow::bail!("unknown message {message_id} in room {room}"),
		}
	}

	async fn mark_read(&self, room: &RoomId, reader: &UserId, message_ids: &[MessageId]) -> anyhow::Result<()> {
		let mut rooms = self.rooms.lock();
		let record = rooms.entry(room.clone()).or_default();
		for id in message_ids {
			record.reads.entry(*id).or_default().insert(reader.clone());
		}
		Ok(())
	}

	async fn load_reads(&self, room: &RoomId, message_ids: &[MessageId]) -> anyhow::Result<HashMap<MessageId, BTreeSet<UserId>>> {
		let rooms = self.rooms.lock();
		let Some(record) = rooms.get(room) else {
			return Ok(HashMap::new());
		};
		Ok(message_ids
			.iter()
			.filter_map(|id| record.reads.get(id).map(|readers| (*id, readers.clone())))
			.collect())
	}

	async fn update_delivery(&self, room: &RoomId, message_id: MessageId, state: DeliveryState) -> anyhow::Result<()> {
		let mut rooms = self.rooms.lock();
		if let Some(message) = rooms
			.get_mut(room)
			.and_then(|record| record.messages.iter_mut().find(|m| m.id == message_id))
		{
			message.advance(state);
		}
		Ok(())
	}

	async fn load_members(&self, room: &RoomId) -> anyhow::Result<Vec<UserId>> {
		Ok(self.members(room).into_iter().collect())
	}

	async fn add_member(&self, room: &RoomId, user: &UserId) -> anyhow::Result<()> {
		self.rooms
			.lock()
			.entry(room.clone())
			.or_default()
			.members
			.insert(user.clone());
		Ok(())
	}

	async fn remove_member(&self, room: &RoomId, user: &UserId) -> anyhow::Result<()> {
		if let Some(record) = self.rooms.lock().get_mut(room) {
			record.members.remove(user);
		}
		Ok(())
	}
}
