//! Engine-wide configuration.
//!
//! ```rust
//! use std::time::Duration;
//! use sockcore::{CloseTimeout, EngineConfig};
//!
//! let config = EngineConfig::default()
//!   .event_capacity(512)
//!   .close_timeout(CloseTimeout::Graceful(Duration::from_secs(2)));
//!
//! // Only the first initialisation wins; later sockets share the reactor.
//! let _ = sockcore::try_init(config);
//! ```

use std::time::Duration;

/// How a socket is closed when it is disposed without an explicit
/// strategy. Mirrors the classic linger setting: negative means "let the
/// OS decide", zero means reset, positive means drain within a budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseTimeout {
  /// Plain `close(2)`; the kernel applies its own lingering.
  #[default]
  OsDefault,
  /// Discard unsent and unread data and reset the connection.
  Abortive,
  /// Shut down the send side and wait up to the duration for the peer to
  /// finish. Falls back to abortive on error, leftover data or timeout.
  Graceful(Duration),
}

impl CloseTimeout {
  /// Interprets a linger value in seconds.
  pub fn from_linger_seconds(secs: i32) -> Self {
    match secs {
      s if s < 0 => Self::OsDefault,
      0 => Self::Abortive,
      s => Self::Graceful(Duration::from_secs(s as u64)),
    }
  }
}

/// Configuration for the process-wide reactor and the defaults new
/// sockets start with.
#[derive(Debug, Clone)]
pub struct EngineConfig {
  pub(crate) event_capacity: usize,
  pub(crate) skip_sync_notification: bool,
  pub(crate) close_timeout: CloseTimeout,
  pub(crate) listen_backlog: i32,
  pub(crate) thread_name: String,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      event_capacity: 256,
      skip_sync_notification: true,
      close_timeout: CloseTimeout::OsDefault,
      listen_backlog: 128,
      thread_name: String::from("sockcore-reactor"),
    }
  }
}

impl EngineConfig {
  /// Maximum number of readiness events handled per `epoll_wait`.
  pub fn event_capacity(mut self, cap: usize) -> Self {
    self.event_capacity = cap.max(1);
    self
  }

  /// When `true` (default), operations that finish during submission are
  /// returned as ready results without going through the completion
  /// callback.
  pub fn skip_sync_notification(mut self, skip: bool) -> Self {
    self.skip_sync_notification = skip;
    self
  }

  pub fn close_timeout(mut self, timeout: CloseTimeout) -> Self {
    self.close_timeout = timeout;
    self
  }

  /// Backlog used by [`Socket::listen_default`](crate::Socket::listen_default).
  pub fn listen_backlog(mut self, backlog: i32) -> Self {
    self.listen_backlog = backlog;
    self
  }

  pub fn thread_name(mut self, name: impl Into<String>) -> Self {
    self.thread_name = name.into();
    self
  }
}
