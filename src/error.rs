use std::any::Any;

use crate::id::ActorId;
use crate::id::ClientRef;
use crate::id::RoomId;

/// Destination of an envelope could not be resolved.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
	#[error("no actor registered under {0}")]
	DeadLetter(ActorId),

	#[error("mailbox of {0} is closed")]
	MailboxClosed(ActorId),
}

impl RoutingError {
	pub fn destination(&self) -> &ActorId {
		match self {
			RoutingError::DeadLetter(id) | RoutingError::MailboxClosed(id) => id,
		}
	}
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
	#[error("{0} is already bound to a live actor")]
	DuplicateRegistration(ActorId),
}

/// A handler returned an error or panicked.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{cause}")]
pub struct ActorFailure {
	cause: String,
}

impl ActorFailure {
	pub fn new(cause: impl Into<String>) -> Self {
		Self {
			cause: cause.into(),
		}
	}

	pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
		let cause = if let Some(text) = payload.downcast_ref::<&'static str>() {
			(*text).to_string()
		} else if let Some(text) = payload.downcast_ref::<String>() {
			text.clone()
		} else {
			"handler panicked".to_string()
		};
		Self::new(format!("panic: {cause}"))
	}

	pub fn cause(&self) -> &str {
		&self.cause
	}
}

impl From<anyhow::Error> for ActorFailure {
	fn from(err: anyhow::Error) -> Self {
		Self::new(format!("{err:#}"))
	}
}

/// Errors surfaced by the public session and supervision API.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
	#[error("actor {0} is already stopped")]
	ActorStopped(ActorId),

	#[error("session has not joined room {0}")]
	NotJoined(RoomId),

	#[error("room {room} is unavailable: {cause}")]
	RoomUnavailable { room: RoomId, cause: String },

	#[error("no pending message {0}")]
	UnknownMessage(ClientRef),

	#[error(transparent)]
	Routing(#[from] RoutingError),

	#[error(transparent)]
	Protocol(#[from] ProtocolError),

	#[error("persistence failure: {0}")]
	Persistence(String),

	#[error("invalid configuration: {0}")]
	Config(String),
}

impl From<anyhow::Error> for ChatError {
	fn from(err: anyhow::Error) -> Self {
		ChatError::Persistence(format!("{err:#}"))
	}
}
