use std::sync::Arc;
use std::sync::Weak;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::actor::Actor;
use crate::error::ProtocolError;
use crate::id::ActorId;
use crate::id::InstanceId;
use crate::link::Deliver;
use crate::link::Link;
use crate::link::LinkState;

/// Process table mapping actor ids to their mailboxes.
///
/// Entries are weak: the registry never keeps a stopped actor alive and never
/// stops an actor itself. Each entry is only written by the actor that owns it
/// (on spawn and on exit), so the map needs no coordination beyond DashMap's
/// per-shard locking.
#[derive(Default)]
pub struct Registry {
	table: DashMap<ActorId, Weak<dyn Deliver>>,
}

impl Registry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Binds `link` under its id.
	///
	/// Re-registering the same instance is a no-op; binding a different
	/// instance while the current one is alive is a protocol error.
	pub fn register<A: Actor>(&self, link: &Link<A>) -> Result<(), ProtocolError> {
		self.insert(link.mailbox())
	}

	fn insert(&self, mailbox: Arc<dyn Deliver>) -> Result<(), ProtocolError> {
		let id = mailbox.actor_id().clone();
		match self.table.entry(id.clone()) {
			Entry::Occupied(mut entry) => {
				if let Some(current) = entry.get().upgrade() {
					if current.instance() != mailbox.instance() && current.is_alive() {
						tracing::warn!(actor = %id, "rejected duplicate registration");
						return Err(ProtocolError::DuplicateRegistration(id));
					}
				}
				entry.insert(Arc::downgrade(&mailbox));
			}
			Entry::Vacant(entry) => {
				entry.insert(Arc::downgrade(&mailbox));
			}
		}
		tracing::debug!(actor = %id, "registered");
		Ok(())
	}

	pub fn unregister(&self, id: &ActorId) -> bool {
		self.table.remove(id).is_some()
	}

	/// Removes `id` only while it is still bound to `instance`, so an exiting
	/// actor never evicts its successor.
	pub(crate) fn release(&self, id: &ActorId, instance: InstanceId) {
		self.table.remove_if(id, |_, weak| match weak.upgrade() {
			Some(current) => current.instance() == instance,
			None => true,
		});
	}

	pub fn lookup(&self, id: &ActorId) -> Option<Arc<dyn Deliver>> {
		let found = self.table.get(id).and_then(|weak| weak.upgrade());
		if found.is_none() {
			self.table.remove_if(id, |_, weak| weak.strong_count() == 0);
		}
		found
	}

	/// Typed lookup: recovers the concrete [`Link`] behind an id.
	pub fn resolve<A: Actor>(&self, id: &ActorId) -> Option<Link<A>> {
		let mailbox = self.lookup(id)?;
		mailbox
			.into_any_arc()
			.downcast::<LinkState<A>>()
			.ok()
			.map(|state| Link { state })
	}

	pub fn contains(&self, id: &ActorId) -> bool {
		self.lookup(id).is_some()
	}

	pub fn len(&self) -> usize {
		self.table.len()
	}

	pub fn is_empty(&self) -> bool {
		self.table.is_empty()
	}

	pub fn ids(&self) -> Vec<ActorId> {
		self.table.iter().map(|entry| entry.key().clone()).collect()
	}
}
