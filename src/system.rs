use std::sync::Arc;

use crate::actor::Actor;
use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::id::UserId;
use crate::link::Link;
use crate::persistence::Persistence;
use crate::registry::Registry;
use crate::router::Router;
use crate::stop::StopReason;
use crate::supervisor::RoomSupervisor;
use crate::supervisor::SupervisorSpec;
use crate::transport::InboundBridge;
use crate::transport::Transport;
use crate::user::UserActor;
use crate::user::UserHandle;
use crate::user::UserSpec;

/// Entry point: one registry, one router and one room supervisor.
///
/// Must be created inside a tokio runtime.
pub struct ChatSystem {
	config: Arc<ChatConfig>,
	registry: Arc<Registry>,
	router: Router,
	supervisor: Link<RoomSupervisor>,
}

impl ChatSystem {
	pub fn new(config: ChatConfig, persistence: Arc<dyn Persistence>) -> Result<Self, ChatError> {
		config.validate()?;
		let config = Arc::new(config);
		let registry = Arc::new(Registry::new());
		let router = Router::new(registry.clone(), config.dead_letter_samples);

		let spec = SupervisorSpec {
			config: config.clone(),
			persistence,
		};
		let supervisor = RoomSupervisor::spawn(spec, &router, None)?;
		tracing::info!("chat system started");

		Ok(Self {
			config,
			registry,
			router,
			supervisor,
		})
	}

	pub fn config(&self) -> &ChatConfig {
		&self.config
	}

	pub fn registry(&self) -> &Arc<Registry> {
		&self.registry
	}

	pub fn router(&self) -> &Router {
		&self.router
	}

	pub fn supervisor(&self) -> &Link<RoomSupervisor> {
		&self.supervisor
	}

	/// Starts a session for `user`. Fails while another session for the same
	/// user is still running.
	pub fn connect(&self, user: impl Into<UserId>) -> Result<UserHandle, ChatError> {
		let spec = UserSpec {
			user: user.into(),
			config: self.config.clone(),
			supervisor: self.supervisor.clone(),
		};
		let link = UserActor::spawn(spec, &self.router, None)?;
		Ok(UserHandle::new(link))
	}

	/// Pumps envelopes from `transport` into this system's router.
	pub fn attach(&self, transport: impl Transport) -> InboundBridge {
		InboundBridge::spawn(transport, self.router.clone())
	}

	/// Stops the supervisor and with it every room.
	pub async fn shutdown(&self) -> StopReason {
		tracing::info!("chat system shutting down");
		self.supervisor.stop_and_wait(StopReason::Shutdown).await
	}
}
