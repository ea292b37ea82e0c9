mod common;

use std::ops::ControlFlow;
use std::sync::Arc;

use common::eventually;
use common::record;
use common::system;
use parking_lot::Mutex;
use runy_chat::Actor;
use runy_chat::ActorContext;
use runy_chat::ActorFailure;
use runy_chat::ActorId;
use runy_chat::ChannelTransport;
use runy_chat::ChatError;
use runy_chat::Envelope;
use runy_chat::EnvelopeId;
use runy_chat::Init;
use runy_chat::InitFuture;
use runy_chat::Payload;
use runy_chat::ProtocolError;
use runy_chat::Receive;
use runy_chat::Registry;
use runy_chat::RoomActor;
use runy_chat::Router;
use runy_chat::RoutingError;
use runy_chat::Sequence;
use runy_chat::StopReason;
use runy_chat::UiEvent;
use runy_chat::UserActor;
use runy_chat::UserId;

/// Keeps `(sender, envelope id)` for every typing-on envelope it receives,
/// ignores everything else and crashes on typing-off.
struct Recorder;

impl Actor for Recorder {
	type Spec = ActorId;
	type Control = ();
	type State = Mutex<Vec<(ActorId, u64)>>;

	fn id(spec: &ActorId) -> ActorId {
		spec.clone()
	}

	fn state(_spec: &ActorId) -> Self::State {
		Mutex::new(Vec::new())
	}

	fn init(_ctx: Init<'_, Self>) -> impl InitFuture<Self> {
		futures::future::ready(Ok::<_, ActorFailure>(Recorder))
	}

	async fn receive(&mut self, ctx: &mut ActorContext<Self>, envelope: &Envelope) -> Result<Receive, ActorFailure> {
		match envelope.payload() {
			Payload::SetTyping { typing: true, .. } => {
				ctx.state().lock().push((envelope.from().clone(), envelope.id().0));
				Ok(Receive::Handled)
			}
			Payload::SetTyping { typing: false, .. } => panic!("poisoned envelope"),
			_ => Ok(Receive::Unhandled),
		}
	}

	async fn control(&mut self, _ctx: &mut ActorContext<Self>, _control: ()) -> Result<ControlFlow<StopReason>, ActorFailure> {
		Ok(ControlFlow::Continue(()))
	}
}

fn typing(typing: bool) -> Payload {
	Payload::SetTyping {
		user: UserId::new("tester"),
		typing,
	}
}

fn addressed(to: &str, payload: Payload) -> Envelope {
	Envelope::new(ActorId::new("test:origin"), ActorId::new(to), EnvelopeId(1), payload)
}

#[tokio::test]
async fn test_unknown_destination_is_dead_lettered() {
	let (system, _store) = system();
	let router = system.router();
	let before = router.dead_letters().count();

	let err = router.route(addressed("user:nobody", typing(true))).unwrap_err();
	assert_eq!(err, RoutingError::DeadLetter(ActorId::new("user:nobody")));
	assert_eq!(err.destination().as_str(), "user:nobody");

	assert_eq!(router.dead_letters().count(), before + 1);
	let last = router.dead_letters().samples().pop().unwrap();
	assert_eq!(last.envelope.to().as_str(), "user:nobody");
	assert_eq!(last.error, err);
}

#[tokio::test]
async fn test_dead_letter_samples_are_bounded() {
	let router = Router::new(Arc::new(Registry::new()), 2);
	for to in ["a", "b", "c"] {
		assert!(router.route(addressed(to, typing(true))).is_err());
	}

	assert_eq!(router.dead_letters().count(), 3);
	let kept: Vec<_> = router
		.dead_letters()
		.samples()
		.into_iter()
		.map(|letter| letter.envelope.to().clone())
		.collect();
	assert_eq!(kept, vec![ActorId::new("b"), ActorId::new("c")]);
}

#[tokio::test]
async fn test_duplicate_session_is_refused_until_first_exits() {
	let (system, _store) = system();
	let ada = system.connect("ada").unwrap();

	let err = system.connect("ada").unwrap_err();
	assert_eq!(
		err,
		ChatError::Protocol(ProtocolError::DuplicateRegistration(ActorId::new("user:ada")))
	);
	// the refused attempt leaves the live session bound
	assert!(system.registry().contains(ada.actor_id()));

	assert_eq!(ada.stop().await, Ok(StopReason::Requested));
	assert!(!system.registry().contains(&ActorId::new("user:ada")));
	let again = system.connect("ada").unwrap();
	assert_eq!(again.actor_id().as_str(), "user:ada");
}

#[tokio::test]
async fn test_typed_resolve_matches_actor_kind() {
	let (system, _store) = system();
	let ada = system.connect("ada").unwrap();
	let room = system.supervisor().start_room("lobby").await.unwrap();
	let registry = system.registry();

	let session = registry.resolve::<UserActor>(ada.actor_id()).unwrap();
	assert_eq!(session.instance(), ada.link().instance());
	assert!(registry.resolve::<RoomActor>(ada.actor_id()).is_none());

	let resolved = registry.resolve::<RoomActor>(room.id()).unwrap();
	assert_eq!(resolved.id().as_str(), "room:lobby#1");
	assert!(registry.resolve::<RoomActor>(&ActorId::new("room:lobby#2")).is_none());
}

#[tokio::test]
async fn test_per_sender_order_is_preserved() {
	let (system, _store) = system();
	let recorder = Recorder::spawn(ActorId::new("test:recorder"), system.router(), None).unwrap();

	let senders: Vec<_> = (0..4)
		.map(|n| {
			let router = system.router().clone();
			tokio::spawn(async move {
				let from = ActorId::new(format!("test:sender{n}"));
				let mut sequence = Sequence::default();
				for _ in 0..100 {
					let envelope = Envelope::stamped(&mut sequence, from.clone(), ActorId::new("test:recorder"), typing(true));
					router.route(envelope).unwrap();
					tokio::task::yield_now().await;
				}
			})
		})
		.collect();
	for sender in senders {
		sender.await.unwrap();
	}

	let seen = eventually("all envelopes handled", || async {
		let seen = recorder.state().lock().clone();
		(seen.len() == 400).then_some(seen)
	})
	.await;

	for n in 0..4 {
		let from = ActorId::new(format!("test:sender{n}"));
		let ids: Vec<u64> = seen.iter().filter(|(sender, _)| *sender == from).map(|(_, id)| *id).collect();
		assert_eq!(ids, (1..=100).collect::<Vec<_>>(), "order broken for {from}");
	}
}

#[tokio::test]
async fn test_unhandled_message_is_dropped_and_actor_continues() {
	let (system, _store) = system();
	let recorder = Recorder::spawn(ActorId::new("test:recorder"), system.router(), None).unwrap();
	let router = system.router();

	let join = Payload::Join {
		user: UserId::new("tester"),
	};
	router.route(addressed("test:recorder", join)).unwrap();
	router.route(addressed("test:recorder", typing(true))).unwrap();

	eventually("typing recorded", || async { (recorder.state().lock().len() == 1).then_some(()) }).await;
	assert!(recorder.alive());
}

#[tokio::test]
async fn test_handler_panic_stops_actor_and_rejects_queued_mail() {
	let (system, _store) = system();
	let recorder = Recorder::spawn(ActorId::new("test:recorder"), system.router(), None).unwrap();
	let router = system.router();
	let before = router.dead_letters().count();

	router.route(addressed("test:recorder", typing(false))).unwrap();
	for _ in 0..3 {
		router.route(addressed("test:recorder", typing(true))).unwrap();
	}

	let reason = recorder.wait_exit().await;
	assert!(matches!(&reason, StopReason::Failed(cause) if cause.contains("poisoned envelope")), "{reason:?}");
	assert!(recorder.state().lock().is_empty());
	// the crashing envelope plus everything queued behind it
	assert_eq!(router.dead_letters().count(), before + 4);

	assert!(!system.registry().contains(recorder.id()));
	let err = router.route(addressed("test:recorder", typing(true))).unwrap_err();
	assert!(matches!(err, RoutingError::DeadLetter(_)));
}

#[tokio::test]
async fn test_inbound_envelopes_are_routed_and_checked_by_the_room() {
	let (system, _store) = system();
	let member = system.connect("member").unwrap();
	let stranger = system.connect("stranger").unwrap();
	let mut events = record(&stranger);
	member.join_room("r").await.unwrap();
	let room = system.supervisor().start_room("r").await.unwrap();

	let (tx, transport) = ChannelTransport::new(8);
	let bridge = system.attach(transport);

	let forged = Envelope::new(
		stranger.actor_id().clone(),
		room.id().clone(),
		EnvelopeId(1),
		Payload::SetTyping {
			user: UserId::new("stranger"),
			typing: true,
		},
	);
	tx.send(forged).await.unwrap();

	let error = events
		.wait_for("membership refusal", |event| matches!(event, UiEvent::MessageError { .. }))
		.await;
	match error {
		UiEvent::MessageError { room_id, cause, .. } => {
			assert_eq!(room_id.as_str(), "r");
			assert!(cause.contains("not a member"), "{cause}");
		}
		other => panic!("unexpected event {other:?}"),
	}
	assert!(bridge.routed() >= 1);

	// an undeliverable inbound envelope is dead-lettered, not counted
	let before = system.router().dead_letters().count();
	tx.send(addressed("user:ghost", typing(true))).await.unwrap();
	eventually("ghost dead-lettered", || async {
		(system.router().dead_letters().count() > before).then_some(())
	})
	.await;
	assert_eq!(bridge.routed(), 1);

	drop(tx);
	bridge.join().await;
}
