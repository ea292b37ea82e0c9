use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

macro_rules! string_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(Arc<str>);

		impl $name {
			pub fn new(value: impl AsRef<str>) -> Self {
				Self(Arc::from(value.as_ref()))
			}

			pub fn as_str(&self) -> &str {
				&self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl From<&str> for $name {
			fn from(value: &str) -> Self {
				Self::new(value)
			}
		}

		impl From<String> for $name {
			fn from(value: String) -> Self {
				Self(Arc::from(value))
			}
		}
	};
}

string_id! {
	/// Opaque, process-unique address of an actor.
	ActorId
}

string_id! {
	/// Identity of a chat room.
	RoomId
}

string_id! {
	/// Identity of a chat participant.
	UserId
}

impl ActorId {
	/// Address of the session actor serving `user`.
	pub fn user(user: &UserId) -> Self {
		Self::from(format!("user:{user}"))
	}

	/// Address of one incarnation of the actor owning `room`.
	///
	/// Every restart bumps the incarnation so a stopped room's identity is
	/// never handed out again.
	pub fn room(room: &RoomId, incarnation: u64) -> Self {
		Self::from(format!("room:{room}#{incarnation}"))
	}

	pub fn supervisor() -> Self {
		Self::new("supervisor:rooms")
	}
}

/// Canonical chat message id, assigned by the room actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
	pub fn generate() -> Self {
		Self(Uuid::new_v4())
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(&self.0, f)
	}
}

/// Sender-side reference to an optimistic echo that has no canonical id yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientRef(pub u64);

impl fmt::Display for ClientRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "local-{}", self.0)
	}
}

/// Distinguishes two actor instances that were registered under the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(u64);

impl InstanceId {
	pub fn next() -> Self {
		static NEXT: AtomicU64 = AtomicU64::new(1);
		Self(NEXT.fetch_add(1, Ordering::Relaxed))
	}
}

/// Monotonic counter owned by a single sender.
#[derive(Debug, Default)]
pub struct Sequence {
	last: u64,
}

impl Sequence {
	pub fn next(&mut self) -> u64 {
		self.last += 1;
		self.last
	}

	pub fn last(&self) -> u64 {
		self.last
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ids_are_plain_json_strings() {
		let user: UserId = serde_json::from_str("\"ada\"").unwrap();
		assert_eq!(user, UserId::new("ada"));
		assert_eq!(serde_json::to_string(&ActorId::user(&user)).unwrap(), "\"user:ada\"");

		let room: RoomId = serde_json::from_value(serde_json::json!("lobby")).unwrap();
		assert_eq!(ActorId::room(&room, 3).as_str(), "room:lobby#3");
	}
}
