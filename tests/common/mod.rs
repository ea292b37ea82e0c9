#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use runy_chat::ChatConfig;
use runy_chat::ChatSystem;
use runy_chat::InMemoryStore;
use runy_chat::UiEvent;
use runy_chat::UserHandle;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

pub fn system_with(config: ChatConfig) -> (ChatSystem, Arc<InMemoryStore>) {
	init_tracing();
	let store = Arc::new(InMemoryStore::new());
	let system = ChatSystem::new(config, store.clone()).expect("valid config");
	(system, store)
}

pub fn system() -> (ChatSystem, Arc<InMemoryStore>) {
	system_with(ChatConfig::default())
}

/// Everything one session emitted to its UI, in order.
pub struct Events {
	rx: mpsc::UnboundedReceiver<UiEvent>,
}

pub fn record(handle: &UserHandle) -> Events {
	let (tx, rx) = mpsc::unbounded_channel();
	handle.add_ui_callback(move |event| {
		let _ = tx.send(event.clone());
	});
	Events { rx }
}

impl Events {
	/// Skips events until one matches `pred`.
	pub async fn wait_for(&mut self, what: &str, mut pred: impl FnMut(&UiEvent) -> bool) -> UiEvent {
		let found = timeout(WAIT, async {
			while let Some(event) = self.rx.recv().await {
				if pred(&event) {
					return Some(event);
				}
			}
			None
		})
		.await;

		match found {
			Ok(Some(event)) => event,
			Ok(None) => panic!("event stream closed while waiting for {what}"),
			Err(_) => panic!("timed out waiting for {what}"),
		}
	}

	/// Events already delivered, without waiting.
	pub fn drain(&mut self) -> Vec<UiEvent> {
		let mut events = Vec::new();
		while let Ok(event) = self.rx.try_recv() {
			events.push(event);
		}
		events
	}
}

/// Polls `check` until it yields a value or the wait runs out.
pub async fn eventually<T, F, Fut>(what: &str, mut check: F) -> T
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Option<T>>,
{
	let polled = timeout(WAIT, async {
		loop {
			if let Some(value) = check().await {
				return value;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await;

	match polled {
		Ok(value) => value,
		Err(_) => panic!("condition never held: {what}"),
	}
}
