use std::collections::HashMap;
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::actor::Actor;
use crate::actor::ActorContext;
use crate::actor::Exit;
use crate::actor::Init;
use crate::actor::InitFuture;
use crate::actor::Parent;
use crate::actor::Receive;
use crate::config::ChatConfig;
use crate::envelope::Envelope;
use crate::error::ActorFailure;
use crate::error::ChatError;
use crate::id::ActorId;
use crate::id::InstanceId;
use crate::id::RoomId;
use crate::link::Link;
use crate::persistence::Persistence;
use crate::room::RoomActor;
use crate::room::RoomControl;
use crate::room::RoomSnapshot;
use crate::room::RoomSpec;
use crate::stop::StopReason;

pub struct SupervisorSpec {
	pub config: Arc<ChatConfig>,
	pub persistence: Arc<dyn Persistence>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
	Running,
	/// The current incarnation has exited and no replacement is running yet.
	Stopped,
	/// Restart intensity exhausted. Only an explicit `start_room` revives it.
	GaveUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildReport {
	pub room: RoomId,
	pub actor: ActorId,
	pub incarnation: u64,
	pub status: ChildStatus,
	/// Restarts inside the current intensity window.
	pub restarts: usize,
}

pub enum SupervisorControl {
	StartRoom {
		room: RoomId,
		/// Revives a room the supervisor gave up on.
		force: bool,
		reply: oneshot::Sender<Result<Link<RoomActor>, ChatError>>,
	},
	StopRoom {
		room: RoomId,
		reply: oneshot::Sender<Option<Link<RoomActor>>>,
	},
	/// The running actor for `room`, if any. Never starts one.
	Lookup {
		room: RoomId,
		reply: oneshot::Sender<Option<Link<RoomActor>>>,
	},
	ChildCount {
		reply: oneshot::Sender<usize>,
	},
	ChildrenStatus {
		reply: oneshot::Sender<Vec<ChildReport>>,
	},
	FailRoom {
		room: RoomId,
		cause: String,
		reply: oneshot::Sender<bool>,
	},
	/// A room has been empty past the idle threshold.
	RoomIdle {
		room: RoomId,
		instance: InstanceId,
	},
	ChildExited(Exit),
}

struct Child {
	link: Link<RoomActor>,
	incarnation: u64,
	restarts: VecDeque<Instant>,
	status: ChildStatus,
}

/// Owns every room actor and restarts them one-for-one.
pub struct RoomSupervisor {
	config: Arc<ChatConfig>,
	persistence: Arc<dyn Persistence>,
	children: HashMap<RoomId, Child>,
	/// Last incarnation handed out per room. Never decreases, so a room id
	/// plus incarnation is never reused.
	incarnations: HashMap<RoomId, u64>,
}

impl RoomSupervisor {
	fn spawn_child(&mut self, ctx: &ActorContext<Self>, room: &RoomId) -> Result<(Link<RoomActor>, u64), ChatError> {
		let incarnation = {
			let last = self.incarnations.entry(room.clone()).or_insert(0);
			*last += 1;
			*last
		};

		let notify = ctx.link.clone();
		let parent = Parent {
			token: ctx.token.clone(),
			on_exit: Arc::new(move |exit: Exit| {
				let _ = notify.tell(SupervisorControl::ChildExited(exit));
			}),
		};
		let spec = RoomSpec {
			room: room.clone(),
			incarnation,
			config: self.config.clone(),
			persistence: self.persistence.clone(),
			supervisor: Some(ctx.link.clone()),
		};

		let link = RoomActor::spawn(spec, ctx.router(), Some(parent))?;
		tracing::info!(%room, incarnation, "room started");
		Ok((link, incarnation))
	}

	async fn start_room(&mut self, ctx: &mut ActorContext<Self>, room: RoomId, force: bool) -> Result<Link<RoomActor>, ChatError> {
		let exiting = self
			.children
			.get(&room)
			.filter(|child| child.status == ChildStatus::Running && !child.link.alive())
			.map(|child| (child.link.id().clone(), child.link.instance(), child.link.wait_exit()));
		if let Some((id, instance, exit)) = exiting {
			// settle the old instance first so a failure counts against the room
			let reason = exit.await;
			self.child_exited(ctx, Exit { id, instance, reason });
		}

		let restarts = match self.children.get(&room) {
			Some(child) if child.status == ChildStatus::Running && child.link.alive() => {
				return Ok(child.link.clone());
			}
			Some(child) if child.status == ChildStatus::GaveUp && !force => {
				return Err(ChatError::RoomUnavailable {
					room,
					cause: "restart intensity exhausted".into(),
				});
			}
			Some(child) if child.status == ChildStatus::GaveUp => VecDeque::new(),
			Some(child) => child.restarts.clone(),
			None => VecDeque::new(),
		};

		let (link, incarnation) = self.spawn_child(ctx, &room)?;
		self.children.insert(
			room,
			Child {
				link: link.clone(),
				incarnation,
				restarts,
				status: ChildStatus::Running,
			},
		);
		self.report_active();
		Ok(link)
	}

	fn child_exited(&mut self, ctx: &ActorContext<Self>, exit: Exit) {
		let Some(room) = self
			.children
			.iter()
			.find(|(_, child)| child.link.instance() == exit.instance)
			.map(|(room, _)| room.clone())
		else {
			// an instance we already replaced or removed
			return;
		};

		match exit.reason {
			StopReason::Failed(cause) => self.restart(ctx, room, &cause),
			reason => {
				tracing::info!(%room, %reason, "room removed");
				self.children.remove(&room);
			}
		}
		self.report_active();
	}

	fn restart(&mut self, ctx: &ActorContext<Self>, room: RoomId, cause: &str) {
		let window = self.config.restart_window();
		let max_restarts = self.config.max_restarts as usize;
		let Some(child) = self.children.get_mut(&room) else {
			return;
		};

		let now = Instant::now();
		while child
			.restarts
			.front()
			.is_some_and(|at| now.duration_since(*at) > window)
		{
			child.restarts.pop_front();
		}
		if child.restarts.len() >= max_restarts {
			tracing::error!(%room, restarts = child.restarts.len(), %cause, "restart intensity exhausted, giving up on room");
			child.status = ChildStatus::GaveUp;
			return;
		}
		child.restarts.push_back(now);
		child.status = ChildStatus::Stopped;

		tracing::warn!(%room, %cause, "room failed, restarting");
		metrics::counter!("chat.room.restarts").increment(1);
		match self.spawn_child(ctx, &room) {
			Ok((link, incarnation)) => {
				if let Some(child) = self.children.get_mut(&room) {
					child.link = link;
					child.incarnation = incarnation;
					child.status = ChildStatus::Running;
				}
			}
			Err(err) => tracing::error!(%room, %err, "room restart failed"),
		}
	}

	fn report_active(&self) {
		let active = self
			.children
			.values()
			.filter(|child| child.status == ChildStatus::Running)
			.count();
		metrics::gauge!("chat.rooms.active").set(active as f64);
	}

	fn children_status(&self) -> Vec<ChildReport> {
		let mut reports: Vec<_> = self
			.children
			.iter()
			.map(|(room, child)| ChildReport {
				room: room.clone(),
				actor: child.link.id().clone(),
				incarnation: child.incarnation,
				status: match child.status {
					ChildStatus::Running if !child.link.alive() => ChildStatus::Stopped,
					status => status,
				},
				restarts: child.restarts.len(),
			})
			.collect();
		reports.sort_by(|a, b| a.room.cmp(&b.room));
		reports
	}
}

impl Actor for RoomSupervisor {
	type Spec = SupervisorSpec;
	type Control = SupervisorControl;
	type State = ();

	fn id(_spec: &Self::Spec) -> ActorId {
		ActorId::supervisor()
	}

	fn span(_spec: &Self::Spec) -> tracing::Span {
		tracing::info_span!("supervisor")
	}

	fn state(_spec: &Self::Spec) -> Self::State {}

	fn init(ctx: Init<'_, Self>) -> impl InitFuture<Self> {
		let spec = ctx.spec;
		futures::future::ready(Ok::<_, ActorFailure>(RoomSupervisor {
			config: spec.config,
			persistence: spec.persistence,
			children: HashMap::new(),
			incarnations: HashMap::new(),
		}))
	}

	async fn receive(&mut self, _ctx: &mut ActorContext<Self>, _envelope: &Envelope) -> Result<Receive, ActorFailure> {
		Ok(Receive::Unhandled)
	}

	async fn control(
		&mut self,
		ctx: &mut ActorContext<Self>,
		control: Self::Control,
	) -> Result<ControlFlow<StopReason>, ActorFailure> {
		match control {
			SupervisorControl::StartRoom { room, force, reply } => {
				let _ = reply.send(self.start_room(ctx, room, force).await);
			}
			SupervisorControl::StopRoom { room, reply } => {
				let removed = self.children.remove(&room).map(|child| {
					child.link.stop(StopReason::Requested);
					child.link
				});
				if removed.is_some() {
					tracing::info!(%room, "room stopped on request");
				}
				self.report_active();
				let _ = reply.send(removed);
			}
			SupervisorControl::Lookup { room, reply } => {
				let running = self
					.children
					.get(&room)
					.filter(|child| child.status == ChildStatus::Running && child.link.alive())
					.map(|child| child.link.clone());
				let _ = reply.send(running);
			}
			SupervisorControl::ChildCount { reply } => {
				let _ = reply.send(self.children.len());
			}
			SupervisorControl::ChildrenStatus { reply } => {
				let _ = reply.send(self.children_status());
			}
			SupervisorControl::FailRoom { room, cause, reply } => {
				let sent = self
					.children
					.get(&room)
					.is_some_and(|child| child.link.tell(RoomControl::Fail { cause }).is_ok());
				let _ = reply.send(sent);
			}
			SupervisorControl::RoomIdle { room, instance } => {
				if let Some(child) = self.children.get(&room) {
					if child.link.instance() == instance {
						tracing::debug!(%room, "retiring idle room");
						let _ = child.link.tell(RoomControl::Retire);
					}
				}
			}
			SupervisorControl::ChildExited(exit) => self.child_exited(ctx, exit),
		}
		Ok(ControlFlow::Continue(()))
	}

	async fn terminate(self, _ctx: &mut ActorContext<Self>, reason: &StopReason) {
		for child in self.children.values() {
			child.link.stop(StopReason::Shutdown);
		}
		metrics::gauge!("chat.rooms.active").set(0.0);
		tracing::info!(%reason, rooms = self.children.len(), "supervisor stopped");
	}
}

impl Link<RoomSupervisor> {
	/// Returns the running actor for `room`, starting it if needed.
	pub async fn start_room(&self, room: impl Into<RoomId>) -> Result<Link<RoomActor>, ChatError> {
		let room = room.into();
		self.ask(|reply| SupervisorControl::StartRoom { room, force: true, reply })
			.await?
	}

	/// Like [`start_room`](Self::start_room) but refuses rooms the
	/// supervisor has given up on.
	pub(crate) async fn resolve_room(&self, room: &RoomId) -> Result<Link<RoomActor>, ChatError> {
		let room = room.clone();
		self.ask(|reply| SupervisorControl::StartRoom { room, force: false, reply })
			.await?
	}

	/// Stops `room` and waits for it to exit. Returns `false` if it was not running.
	pub async fn stop_room(&self, room: impl Into<RoomId>) -> Result<bool, ChatError> {
		let room = room.into();
		match self.ask(|reply| SupervisorControl::StopRoom { room, reply }).await? {
			Some(link) => {
				link.wait_exit().await;
				Ok(true)
			}
			None => Ok(false),
		}
	}

	pub async fn child_count(&self) -> Result<usize, ChatError> {
		self.ask(|reply| SupervisorControl::ChildCount { reply }).await
	}

	pub async fn children_status(&self) -> Result<Vec<ChildReport>, ChatError> {
		self.ask(|reply| SupervisorControl::ChildrenStatus { reply }).await
	}

	/// Forces the room's current handler to fail, exercising the restart path.
	pub async fn fail_room(&self, room: impl Into<RoomId>, cause: impl Into<String>) -> Result<bool, ChatError> {
		let room = room.into();
		let cause = cause.into();
		self.ask(|reply| SupervisorControl::FailRoom { room, cause, reply })
			.await
	}

	/// Snapshot of a running room. Does not start it.
	pub async fn snapshot(&self, room: impl Into<RoomId>) -> Result<Option<RoomSnapshot>, ChatError> {
		let room = room.into();
		let Some(link) = self.ask(|reply| SupervisorControl::Lookup { room, reply }).await? else {
			return Ok(None);
		};
		link.ask(|reply| RoomControl::Snapshot { reply }).await.map(Some)
	}
}
