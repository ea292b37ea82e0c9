use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;
use tokio::sync::watch;

/// Why an actor left its receive loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
	/// `stop()` was called explicitly.
	Requested,
	/// Reclaimed by its supervisor after staying empty for too long.
	Idle,
	/// Every strong handle to the actor went away.
	Dropped,
	/// The owning tree (supervisor, system) is being torn down.
	Shutdown,
	/// A handler returned an error or panicked.
	Failed(String),
}

impl StopReason {
	pub fn is_failure(&self) -> bool {
		matches!(self, StopReason::Failed(_))
	}
}

impl fmt::Display for StopReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StopReason::Requested => f.write_str("stop requested"),
			StopReason::Idle => f.write_str("idle"),
			StopReason::Dropped => f.write_str("all handles dropped"),
			StopReason::Shutdown => f.write_str("shutdown"),
			StopReason::Failed(cause) => write!(f, "failed: {cause}"),
		}
	}
}

/// A stop reason together with the call site that requested it.
#[derive(Debug, Clone)]
pub struct Stopped {
	pub reason: StopReason,
	pub location: &'static Location<'static>,
}

/// Hierarchical stop signal. Stopping a token stops every child created from it.
#[derive(Clone)]
pub struct StopToken {
	inner: Arc<Node>,
}

struct Node {
	state: watch::Sender<Option<Stopped>>,
	children: Mutex<Vec<Weak<Node>>>,
}

impl fmt::Debug for StopToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("StopToken")
			.field("state", &*self.inner.state.borrow())
			.finish()
	}
}

impl Default for StopToken {
	fn default() -> Self {
		Self::new()
	}
}

impl StopToken {
	pub fn new() -> Self {
		Self {
			inner: Node::new(),
		}
	}

	#[track_caller]
	pub fn stop(&self, reason: StopReason) {
		self.inner.stop(Stopped {
			reason,
			location: Location::caller(),
		})
	}

	pub fn is_stopped(&self) -> bool {
		self.inner.state.borrow().is_some()
	}

	pub fn reason(&self) -> Option<StopReason> {
		self.inner.state.borrow().as_ref().map(|s| s.reason.clone())
	}

	/// Resolves once the token (or one of its ancestors) is stopped.
	pub fn stopped(&self) -> impl Future<Output = Stopped> + Send + 'static {
		let mut rx = self.inner.state.subscribe();
		async move {
			match rx.wait_for(Option::is_some).await {
				Ok(state) => match state.as_ref() {
					Some(stopped) => stopped.clone(),
					None => unreachable!("wait_for returned an unstopped state"),
				},
				// the sender lives inside the node we hold a receiver of, so
				// this only happens while the whole tree is being dropped
				Err(_) => Stopped {
					reason: StopReason::Dropped,
					location: Location::caller(),
				},
			}
		}
	}

	pub fn child(&self) -> StopToken {
		StopToken {
			inner: self.inner.child(),
		}
	}
}

impl Node {
	fn new() -> Arc<Self> {
		Arc::new(Self {
			state: watch::Sender::new(None),
			children: Mutex::new(Vec::new()),
		})
	}

	fn child(self: &Arc<Self>) -> Arc<Self> {
		let mut children = self.children.lock();
		let node = Node::new();
		if let Some(stopped) = self.state.borrow().clone() {
			node.stop(Stopped {
				reason: StopReason::Shutdown,
				location: stopped.location,
			});
			return node;
		}
		children.retain(|child| child.strong_count() > 0);
		children.push(Arc::downgrade(&node));
		node
	}

	fn stop(&self, stopped: Stopped) {
		// held so no child can be attached halfway through the cascade
		let children = self.children.lock();

		let changed = self.state.send_if_modified(|state| match state {
			None => {
				*state = Some(stopped.clone());
				true
			}
			Some(_) => false,
		});

		if changed {
			for child in children.iter().filter_map(Weak::upgrade) {
				child.stop(Stopped {
					reason: StopReason::Shutdown,
					location: stopped.location,
				});
			}
		}
	}
}
