use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::envelope::Envelope;

/// One item in an actor's mailbox: a routed envelope or a local control
/// message coming from the actor's own handle.
#[derive(Debug)]
pub enum Mail<C> {
	Envelope(Envelope),
	Control(C),
}

/// Creates an unbounded, strictly ordered mailbox.
pub fn mailbox<C: Send + 'static>() -> (MailboxSender<C>, MailboxReceiver<C>) {
	let (tx, rx) = mpsc::unbounded_channel();
	(MailboxSender { tx }, MailboxReceiver { rx })
}

/// Enqueue side. Never blocks the caller.
pub struct MailboxSender<C> {
	tx: mpsc::UnboundedSender<Mail<C>>,
}

impl<C> Clone for MailboxSender<C> {
	fn clone(&self) -> Self {
		Self {
			tx: self.tx.clone(),
		}
	}
}

impl<C: Send + 'static> MailboxSender<C> {
	pub fn enqueue(&self, mail: Mail<C>) -> Result<(), Mail<C>> {
		self.tx.send(mail).map_err(|err| err.0)
	}

	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}

	pub async fn closed(&self) {
		self.tx.closed().await
	}
}

/// Dequeue side, owned by the actor's run loop only.
pub struct MailboxReceiver<C> {
	rx: mpsc::UnboundedReceiver<Mail<C>>,
}

impl<C: Send + 'static> MailboxReceiver<C> {
	pub async fn recv(&mut self) -> Option<Mail<C>> {
		self.rx.recv().await
	}

	/// Refuses further enqueues while keeping what is already queued.
	pub fn close(&mut self) {
		self.rx.close()
	}

	/// Pops everything still queued without waiting.
	pub fn drain(&mut self) -> Vec<Mail<C>> {
		let mut rest = Vec::new();
		loop {
			match self.rx.try_recv() {
				Ok(mail) => rest.push(mail),
				Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
			}
		}
		rest
	}
}
