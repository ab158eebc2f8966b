//! User-facing error reporting hooks.
//!
//! Failures that the layer handles locally (a refetch that did not land, a
//! broken store step) still need to reach the user. The host decides how:
//! log them, or forward them into its own event loop.

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
  Warning,
  Error,
}

/// A message for the host's notification area (toast, status bar, log).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
  pub level: NoticeLevel,
  pub title: String,
  pub message: String,
}

impl Notice {
  pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      level: NoticeLevel::Error,
      title: title.into(),
      message: message.into(),
    }
  }

  pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      level: NoticeLevel::Warning,
      title: title.into(),
      message: message.into(),
    }
  }
}

/// Sink for notices raised by the cache layer.
pub trait ErrorReporter: Send + Sync {
  fn report(&self, notice: Notice);
}

/// Reporter that writes notices to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
  fn report(&self, notice: Notice) {
    match notice.level {
      NoticeLevel::Error => tracing::error!(title = %notice.title, "{}", notice.message),
      NoticeLevel::Warning => tracing::warn!(title = %notice.title, "{}", notice.message),
    }
  }
}

impl ErrorReporter for mpsc::UnboundedSender<Notice> {
  fn report(&self, notice: Notice) {
    // Receiver gone means the host is shutting down
    let _ = self.send(notice);
  }
}
