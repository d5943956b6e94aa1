#![cfg_attr(docsrs, feature(doc_cfg))]

//! # sockcore - completion-style async sockets
//!
//! sockcore drives socket I/O through a single process-wide reactor and
//! hands every operation back as a [`Completion`]: a future that can also
//! be waited on, delivered through a channel, or finished with a callback.
//!
//! ## Features
//! - **Safe close.** A socket closes exactly once no matter how many
//!   threads dispose it, after every in-flight operation is cancelled and
//!   every in-flight syscall has returned.
//! - **Pooled, versioned completions.** Each socket keeps one reusable
//!   completion per direction; a late result for a recycled completion is
//!   rejected.
//! - **Cancellation.** Attach a [`CancellationToken`] to any operation.
//! - **Graceful, abortive or OS-default close**, configurable per socket.
//!
//! ## Platform support
//!
//! Linux only. Completion is emulated on top of edge-triggered epoll.
//!
//! ## Quick Start
//!
//! ```rust
//! use sockcore::{Socket, Type};
//!
//! let addr = "127.0.0.1:0".parse().unwrap();
//! let listener = Socket::for_address(&addr, Type::STREAM)?;
//! listener.bind(addr)?;
//! listener.listen_default()?;
//!
//! let client = Socket::for_address(&addr, Type::STREAM)?;
//! // Blocking wait.
//! client.connect(listener.local_addr()?).wait()?;
//!
//! // Channel delivery.
//! let (conn, _peer) = listener.accept().send().recv().unwrap()?;
//!
//! // Callback.
//! client.send(b"hello".to_vec()).when_done(|(res, _buf)| {
//!   assert_eq!(res.unwrap(), 5);
//! });
//!
//! let (res, buf) = conn.receive(Vec::with_capacity(16)).wait();
//! assert_eq!(&buf[..res?], b"hello");
//! # Ok::<(), sockcore::SocketError>(())
//! ```
//!
//! **Note**: a [`Completion`] is consumed by whichever of these is used.
//!
//! ## Error Handling
//!
//! Operations return [`SocketResult`], or [`BufResult`] when they hand a
//! buffer back. Operations that fail because the socket was disposed
//! report [`SocketErrorKind::Aborted`] (stream sockets) or
//! [`SocketErrorKind::Interrupted`] (datagram sockets) and are flagged by
//! [`SocketError::is_disposed`].

#[cfg(not(linux))]
compile_error!("sockcore only supports Linux");

#[macro_use]
mod macros;

mod binder;
mod cancel;
mod completion;
mod config;
mod engine;
mod error;
mod handle;
mod net_utils;
mod reactor;
mod slot;
mod sync;

#[doc(hidden)]
pub mod test_utils;

pub use cancel::CancellationToken;
pub use completion::{Completion, Receiver};
pub use config::{CloseTimeout, EngineConfig};
pub use engine::{ReceivedMessage, Socket, SocketShape};
pub use error::{BufResult, SocketError, SocketErrorKind, SocketResult};
pub use handle::CloseKind;
pub use reactor::TryInitError;
pub use slot::PacketInfo;

pub use socket2::{Domain, Protocol, Type};

/// Starts the reactor with `config`.
///
/// Optional: the first socket operation starts it with
/// [`EngineConfig::default`] otherwise. Fails with
/// [`TryInitError::AlreadyInit`] once a reactor is running.
pub fn try_init(config: EngineConfig) -> Result<(), TryInitError> {
  reactor::Reactor::try_init(config).map(|_| ())
}
