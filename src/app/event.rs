use tokio::sync::mpsc;

use crate::events::GlobalEvent;
use crate::notify::{ErrorReporter, Notice};

/// Events driving the watch loop
#[derive(Debug)]
pub enum Event {
  /// A domain event arrived from another instance
  Domain(GlobalEvent),
  /// Something failed that the user should know about
  Notice(Notice),
  /// Ctrl-C or the loop was asked to stop
  Shutdown,
}

/// Event handler that merges bus callbacks, notices and Ctrl-C into one queue
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    let shutdown_tx = tx.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        let _ = shutdown_tx.send(Event::Shutdown);
      }
    });

    Self { tx, rx }
  }

  /// Sender for producers (bus callbacks, reporters)
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

impl Default for EventHandler {
  fn default() -> Self {
    Self::new()
  }
}

impl ErrorReporter for mpsc::UnboundedSender<Event> {
  fn report(&self, notice: Notice) {
    let _ = self.send(Event::Notice(notice));
  }
}
