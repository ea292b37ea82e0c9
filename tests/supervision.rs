mod common;

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use common::WAIT;
use common::eventually;
use common::record;
use common::system;
use common::system_with;
use runy_chat::ChatConfig;
use runy_chat::ChatError;
use runy_chat::ChatMessage;
use runy_chat::ChatSystem;
use runy_chat::ChildReport;
use runy_chat::ChildStatus;
use runy_chat::DeliveryState;
use runy_chat::InMemoryStore;
use runy_chat::Link;
use runy_chat::MessageId;
use runy_chat::Persistence;
use runy_chat::Reactions;
use runy_chat::RoomId;
use runy_chat::RoomSupervisor;
use runy_chat::SendOptions;
use runy_chat::StopReason;
use runy_chat::UiEvent;
use runy_chat::UserId;
use tokio::sync::Notify;
use tokio::time::timeout;

async fn child(supervisor: &Link<RoomSupervisor>, room: &str) -> Option<ChildReport> {
	supervisor
		.children_status()
		.await
		.unwrap()
		.into_iter()
		.find(|report| report.room.as_str() == room)
}

async fn wait_incarnation(supervisor: &Link<RoomSupervisor>, room: &str, incarnation: u64) -> ChildReport {
	eventually("room restarted", || async {
		child(supervisor, room)
			.await
			.filter(|report| report.incarnation == incarnation && report.status == ChildStatus::Running)
	})
	.await
}

#[tokio::test]
async fn test_start_room_is_idempotent() {
	let (system, _store) = system();
	let supervisor = system.supervisor();

	let first = supervisor.start_room("r").await.unwrap();
	let second = supervisor.start_room("r").await.unwrap();
	assert_eq!(first.id(), second.id());
	assert_eq!(first.id().as_str(), "room:r#1");
	assert_eq!(supervisor.child_count().await.unwrap(), 1);

	assert!(supervisor.stop_room("r").await.unwrap());
	assert!(!first.alive());
	assert!(!supervisor.stop_room("r").await.unwrap());
	assert_eq!(supervisor.child_count().await.unwrap(), 0);

	// a stopped room never hands out its old identity again
	let third = supervisor.start_room("r").await.unwrap();
	assert_eq!(third.id().as_str(), "room:r#2");
}

#[tokio::test]
async fn test_failed_room_restarts_with_durable_roster() {
	let (system, _store) = system();
	let u1 = system.connect("u1").unwrap();
	let u2 = system.connect("u2").unwrap();
	let mut e2 = record(&u2);

	u1.join_room("r").await.unwrap();
	u2.join_room("r").await.unwrap();
	u1.send_message("r", "before", SendOptions::default()).await.unwrap();
	e2.wait_for("first message", |event| {
		matches!(event, UiEvent::NewMessage { message, .. } if message.content == "before")
	})
	.await;

	let supervisor = system.supervisor();
	assert!(supervisor.fail_room("r", "injected").await.unwrap());
	let report = wait_incarnation(supervisor, "r", 2).await;
	assert_eq!(report.restarts, 1);
	assert_eq!(report.actor.as_str(), "room:r#2");

	let snapshot = supervisor.snapshot("r").await.unwrap().unwrap();
	assert_eq!(snapshot.incarnation, 2);
	assert_eq!(
		snapshot.members,
		BTreeSet::from([UserId::new("u1"), UserId::new("u2")])
	);
	assert_eq!(snapshot.recent.len(), 1);
	assert_eq!(snapshot.recent[0].content, "before");

	// sessions re-resolve the room on their next command
	u1.send_message("r", "after", SendOptions::default()).await.unwrap();
	e2.wait_for("message after restart", |event| {
		matches!(event, UiEvent::NewMessage { message, .. } if message.content == "after")
	})
	.await;
}

#[tokio::test]
async fn test_room_failure_is_isolated() {
	let (system, _store) = system();
	let u1 = system.connect("u1").unwrap();
	let mut e1 = record(&u1);

	u1.join_room("a").await.unwrap();
	u1.join_room("b").await.unwrap();
	u1.send_message("b", "kept", SendOptions::default()).await.unwrap();
	e1.wait_for("b message", |event| {
		matches!(event, UiEvent::NewMessage { message, .. }
			if message.content == "kept" && message.delivery_state != DeliveryState::Sending)
	})
	.await;

	let supervisor = system.supervisor();
	let before = supervisor.snapshot("b").await.unwrap().unwrap();

	supervisor.fail_room("a", "only a").await.unwrap();
	wait_incarnation(supervisor, "a", 2).await;

	let after = supervisor.snapshot("b").await.unwrap().unwrap();
	assert_eq!(after, before);
	let b = child(supervisor, "b").await.unwrap();
	assert_eq!(b.incarnation, 1);
	assert_eq!(b.restarts, 0);
}

/// Store whose first roster write for `victim` blocks until released and
/// then crashes the handler.
struct CrashingRoster {
	inner: InMemoryStore,
	victim: UserId,
	armed: AtomicBool,
	entered: Notify,
	release: Notify,
}

#[async_trait]
impl Persistence for CrashingRoster {
	async fn load_recent_messages(&self, room: &RoomId, limit: usize) -> anyhow::Result<Vec<ChatMessage>> {
		self.inner.load_recent_messages(room, limit).await
	}

	async fn append_message(&self, message: &ChatMessage) -> anyhow::Result<()> {
		self.inner.append_message(message).await
	}

	async fn record_reaction(&self, room: &RoomId, message_id: MessageId, reactions: &Reactions) -> anyhow::Result<()> {
		self.inner.record_reaction(room, message_id, reactions).await
	}

	async fn mark_read(&self, room: &RoomId, reader: &UserId, message_ids: &[MessageId]) -> anyhow::Result<()> {
		self.inner.mark_read(room, reader, message_ids).await
	}

	async fn load_reads(&self, room: &RoomId, message_ids: &[MessageId]) -> anyhow::Result<HashMap<MessageId, BTreeSet<UserId>>> {
		self.inner.load_reads(room, message_ids).await
	}

	async fn update_delivery(&self, room: &RoomId, message_id: MessageId, state: DeliveryState) -> anyhow::Result<()> {
		self.inner.update_delivery(room, message_id, state).await
	}

	async fn load_members(&self, room: &RoomId) -> anyhow::Result<Vec<UserId>> {
		self.inner.load_members(room).await
	}

	async fn add_member(&self, room: &RoomId, user: &UserId) -> anyhow::Result<()> {
		if *user == self.victim && self.armed.swap(false, Ordering::SeqCst) {
			self.entered.notify_one();
			self.release.notified().await;
			panic!("roster write crashed");
		}
		self.inner.add_member(room, user).await
	}

	async fn remove_member(&self, room: &RoomId, user: &UserId) -> anyhow::Result<()> {
		self.inner.remove_member(room, user).await
	}
}

#[tokio::test]
async fn test_in_flight_posts_fail_when_room_crashes() {
	common::init_tracing();
	let store = Arc::new(CrashingRoster {
		inner: InMemoryStore::new(),
		victim: UserId::new("trouble"),
		armed: AtomicBool::new(true),
		entered: Notify::new(),
		release: Notify::new(),
	});
	let system = ChatSystem::new(ChatConfig::default(), store.clone()).unwrap();
	let u1 = system.connect("u1").unwrap();
	let trouble = system.connect("trouble").unwrap();
	let mut e1 = record(&u1);

	u1.join_room("r").await.unwrap();

	let joining = tokio::spawn({
		let trouble = trouble.clone();
		async move { trouble.join_room("r").await }
	});
	store.entered.notified().await;

	// queued behind the handler that is about to crash
	let client_ref = u1.send_message("r", "stuck", SendOptions::default()).await.unwrap();
	store.release.notify_one();

	let error = e1
		.wait_for("post rolled back", |event| {
			matches!(event, UiEvent::MessageError { client_ref: Some(_), .. })
		})
		.await;
	assert!(matches!(error, UiEvent::MessageError { client_ref: Some(cr), .. } if cr == client_ref));
	assert_eq!(
		u1.delivery_history(client_ref).await.unwrap().unwrap(),
		vec![DeliveryState::Sending, DeliveryState::Failed]
	);

	// the interrupted join is retried against the fresh instance
	joining.await.unwrap().unwrap();
	let report = wait_incarnation(system.supervisor(), "r", 2).await;
	assert_eq!(report.restarts, 1);
	let snapshot = eventually("trouble rejoined", || async {
		let snapshot = system.supervisor().snapshot("r").await.unwrap()?;
		snapshot
			.members
			.contains(&UserId::new("trouble"))
			.then_some(snapshot)
	})
	.await;
	assert!(snapshot.members.contains(&UserId::new("u1")));
	assert!(snapshot.recent.iter().all(|message| message.content != "stuck"));
}

#[tokio::test]
async fn test_restart_intensity_gives_up_until_explicit_start() {
	let config = ChatConfig {
		max_restarts: 1,
		restart_window_ms: 60_000,
		..ChatConfig::default()
	};
	let (system, _store) = system_with(config);
	let supervisor = system.supervisor();
	let u1 = system.connect("u1").unwrap();

	supervisor.start_room("r").await.unwrap();
	supervisor.fail_room("r", "first").await.unwrap();
	wait_incarnation(supervisor, "r", 2).await;

	supervisor.fail_room("r", "second").await.unwrap();
	let report = eventually("supervisor gave up", || async {
		child(supervisor, "r")
			.await
			.filter(|report| report.status == ChildStatus::GaveUp)
	})
	.await;
	assert_eq!(report.incarnation, 2);
	assert!(supervisor.snapshot("r").await.unwrap().is_none());

	// sessions do not revive it implicitly
	let err = u1.join_room("r").await.unwrap_err();
	assert!(matches!(err, ChatError::RoomUnavailable { .. }), "{err:?}");

	let revived = supervisor.start_room("r").await.unwrap();
	assert_eq!(revived.id().as_str(), "room:r#3");
	let report = child(supervisor, "r").await.unwrap();
	assert_eq!(report.status, ChildStatus::Running);
	assert_eq!(report.restarts, 0);
	u1.join_room("r").await.unwrap();
}

#[tokio::test]
async fn test_idle_rooms_are_reclaimed() {
	let config = ChatConfig {
		room_idle_ms: 50,
		sweep_interval_ms: 10,
		..ChatConfig::default()
	};
	let (system, _store) = system_with(config);
	let supervisor = system.supervisor();
	let u1 = system.connect("u1").unwrap();

	u1.join_room("quiet").await.unwrap();
	u1.join_room("busy").await.unwrap();
	let quiet = supervisor.start_room("quiet").await.unwrap();
	u1.leave_room("quiet").await.unwrap();

	assert_eq!(quiet.wait_exit().await, StopReason::Idle);
	let remaining = eventually("quiet room removed", || async {
		let rooms: Vec<_> = supervisor
			.children_status()
			.await
			.unwrap()
			.into_iter()
			.map(|report| report.room)
			.collect();
		(rooms.len() == 1).then_some(rooms)
	})
	.await;
	assert_eq!(remaining, vec![RoomId::new("busy")]);

	// a room with members survives well past the idle threshold
	tokio::time::sleep(Duration::from_millis(200)).await;
	assert_eq!(supervisor.child_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_shutdown_stops_every_room() {
	let (system, _store) = system();
	let supervisor = system.supervisor();
	let u1 = system.connect("u1").unwrap();

	let a = supervisor.start_room("a").await.unwrap();
	let b = supervisor.start_room("b").await.unwrap();

	assert_eq!(system.shutdown().await, StopReason::Shutdown);
	assert_eq!(a.wait_exit().await, StopReason::Shutdown);
	assert_eq!(b.wait_exit().await, StopReason::Shutdown);
	assert!(!system.registry().contains(a.id()));

	let err = u1.join_room("c").await.unwrap_err();
	assert!(matches!(err, ChatError::ActorStopped(_)), "{err:?}");
}

/// Store that never manages to write the roster.
struct LossyRoster {
	inner: InMemoryStore,
}

#[async_trait]
impl Persistence for LossyRoster {
	async fn load_recent_messages(&self, room: &RoomId, limit: usize) -> anyhow::Result<Vec<ChatMessage>> {
		self.inner.load_recent_messages(room, limit).await
	}

	async fn append_message(&self, message: &ChatMessage) -> anyhow::Result<()> {
		self.inner.append_message(message).await
	}

	async fn record_reaction(&self, room: &RoomId, message_id: MessageId, reactions: &Reactions) -> anyhow::Result<()> {
		self.inner.record_reaction(room, message_id, reactions).await
	}

	async fn mark_read(&self, room: &RoomId, reader: &UserId, message_ids: &[MessageId]) -> anyhow::Result<()> {
		self.inner.mark_read(room, reader, message_ids).await
	}

	async fn load_reads(&self, room: &RoomId, message_ids: &[MessageId]) -> anyhow::Result<HashMap<MessageId, BTreeSet<UserId>>> {
		self.inner.load_reads(room, message_ids).await
	}

	async fn update_delivery(&self, room: &RoomId, message_id: MessageId, state: DeliveryState) -> anyhow::Result<()> {
		self.inner.update_delivery(room, message_id, state).await
	}

	async fn load_members(&self, room: &RoomId) -> anyhow::Result<Vec<UserId>> {
		self.inner.load_members(room).await
	}

	async fn add_member(&self, _room: &RoomId, _user: &UserId) -> anyhow::Result<()> {
		anyhow::bail!("roster unavailable")
	}

	async fn remove_member(&self, room: &RoomId, user: &UserId) -> anyhow::Result<()> {
		self.inner.remove_member(room, user).await
	}
}

/// Joins `u1` to `r` over a store that loses the roster write, then restarts
/// the room so the new instance has never heard of `u1`.
async fn forgotten_member() -> (ChatSystem, runy_chat::UserHandle, common::Events) {
	common::init_tracing();
	let store = Arc::new(LossyRoster {
		inner: InMemoryStore::new(),
	});
	let system = ChatSystem::new(ChatConfig::default(), store).unwrap();
	let u1 = system.connect("u1").unwrap();
	let mut e1 = record(&u1);

	u1.join_room("r").await.unwrap();
	e1.wait_for("roster write failure", |event| {
		matches!(event, UiEvent::MessageError { cause, .. } if cause.contains("roster unavailable"))
	})
	.await;

	let supervisor = system.supervisor();
	supervisor.fail_room("r", "lose the roster").await.unwrap();
	wait_incarnation(supervisor, "r", 2).await;
	let snapshot = supervisor.snapshot("r").await.unwrap().unwrap();
	assert!(snapshot.members.is_empty());
	assert_eq!(u1.get_active_chats().await.unwrap(), vec![RoomId::new("r")]);

	(system, u1, e1)
}

#[tokio::test]
async fn test_leave_completes_when_room_lost_the_member() {
	let (_system, u1, mut e1) = forgotten_member().await;

	timeout(WAIT, u1.leave_room("r"))
		.await
		.expect("leave never confirmed")
		.unwrap();
	assert!(u1.get_active_chats().await.unwrap().is_empty());
	e1.wait_for("own leave", |event| {
		matches!(event, UiEvent::UserLeft { user_id, .. } if user_id.as_str() == "u1")
	})
	.await;
}

#[tokio::test]
async fn test_session_rejoins_room_that_lost_it() {
	let (system, u1, mut e1) = forgotten_member().await;

	let client_ref = u1.send_message("r", "still here", SendOptions::default()).await.unwrap();
	e1.wait_for("message accepted", |event| {
		matches!(event, UiEvent::NewMessage { message, client_ref: Some(cr) }
			if *cr == client_ref && message.delivery_state == DeliveryState::Sent)
	})
	.await;

	let snapshot = system.supervisor().snapshot("r").await.unwrap().unwrap();
	assert!(snapshot.members.contains(&UserId::new("u1")));
	assert_eq!(snapshot.recent.len(), 1);
	assert_eq!(
		u1.delivery_history(client_ref).await.unwrap().unwrap(),
		vec![DeliveryState::Sending, DeliveryState::Sent]
	);
}

#[tokio::test]
async fn test_read_receipts_survive_restart() {
	let (system, store) = system();
	let u1 = system.connect("u1").unwrap();
	let u2 = system.connect("u2").unwrap();
	let u3 = system.connect("u3").unwrap();
	let mut e2 = record(&u2);
	let mut e3 = record(&u3);

	for user in [&u1, &u2, &u3] {
		user.join_room("r").await.unwrap();
	}
	let client_ref = u1.send_message("r", "hello", SendOptions::default()).await.unwrap();
	let is_hello = |event: &UiEvent| matches!(event, UiEvent::NewMessage { message, .. } if message.content == "hello");
	let seen = e2.wait_for("hello at u2", is_hello).await;
	e3.wait_for("hello at u3", is_hello).await;
	let UiEvent::NewMessage { message, .. } = seen else {
		unreachable!()
	};

	u2.mark_messages_read("r", Vec::new()).await.unwrap();
	let room = RoomId::new("r");
	eventually("u2 receipt stored", || async {
		store.readers(&room, message.id).contains(&UserId::new("u2")).then_some(())
	})
	.await;

	let supervisor = system.supervisor();
	supervisor.fail_room("r", "reload").await.unwrap();
	wait_incarnation(supervisor, "r", 2).await;

	// only u3 reads after the restart; u2's receipt comes from the store
	u3.mark_messages_read("r", Vec::new()).await.unwrap();
	let history = eventually("message fully read", || async {
		let history = u1.delivery_history(client_ref).await.unwrap()?;
		(history.last() == Some(&DeliveryState::Read)).then_some(history)
	})
	.await;
	assert_eq!(
		history,
		vec![
			DeliveryState::Sending,
			DeliveryState::Sent,
			DeliveryState::Delivered,
			DeliveryState::Read,
		]
	);
}
