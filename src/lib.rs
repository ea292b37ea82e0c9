mod actor;
mod config;
mod envelope;
mod error;
mod event;
mod id;
mod link;
mod mailbox;
mod message;
mod persistence;
mod registry;
mod room;
mod router;
mod stop;
mod supervisor;
mod system;
mod transport;
mod user;

pub mod prelude {
	pub use super::actor::Actor;
	pub use super::actor::ActorContext;
	pub use super::actor::Init;
	pub use super::actor::InitFuture;
	pub use super::actor::Receive;
	pub use super::system::ChatSystem;
	pub use super::user::UserHandle;
}

pub use actor::Actor;
pub use actor::ActorContext;
pub use actor::Exit;
pub use actor::Init;
pub use actor::InitFuture;
pub use actor::Parent;
pub use actor::Receive;
pub use config::ChatConfig;
pub use envelope::Envelope;
pub use envelope::EnvelopeId;
pub use envelope::Payload;
pub use envelope::Rejection;
pub use error::ActorFailure;
pub use error::ChatError;
pub use error::ProtocolError;
pub use error::RoutingError;
pub use event::UiCallback;
pub use event::UiEvent;
pub use id::ActorId;
pub use id::ClientRef;
pub use id::InstanceId;
pub use id::MessageId;
pub use id::RoomId;
pub use id::Sequence;
pub use id::UserId;
pub use link::Deliver;
pub use link::Link;
pub use link::WeakLink;
pub use message::ChatMessage;
pub use message::DeliveryState;
pub use message::MessageDraft;
pub use message::MessageKind;
pub use message::Reactions;
pub use message::SendOptions;
pub use message::Status;
pub use persistence::InMemoryStore;
pub use persistence::Persistence;
pub use registry::Registry;
pub use room::RoomActor;
pub use room::RoomControl;
pub use room::RoomInfo;
pub use room::RoomSnapshot;
pub use room::RoomSpec;
pub use router::DeadLetter;
pub use router::DeadLetters;
pub use router::Router;
pub use stop::StopReason;
pub use stop::StopToken;
pub use supervisor::ChildReport;
pub use supervisor::ChildStatus;
pub use supervisor::RoomSupervisor;
pub use supervisor::SupervisorControl;
pub use supervisor::SupervisorSpec;
pub use system::ChatSystem;
pub use transport::ChannelTransport;
pub use transport::InboundBridge;
pub use transport::Transport;
pub use user::SessionCommand;
pub use user::UserActor;
pub use user::UserHandle;
pub use user::UserShared;
pub use user::UserSpec;
