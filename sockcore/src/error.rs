//! Error taxonomy for socket operations.
//!
//! Every native failure is translated into a [`SocketErrorKind`]; the raw
//! `errno` is kept on the [`SocketError`] for diagnostics. Two kinds are
//! not failures at all: [`SocketErrorKind::Pending`] and
//! [`SocketErrorKind::WouldBlock`] mean "the operation is still in flight"
//! and the engine resolves them itself. They only reach callers through
//! the non-blocking synchronous API, where retrying is the caller's job.

use std::{fmt, io};

/// Result alias used across the crate.
pub type SocketResult<T> = Result<T, SocketError>;

/// Result type for operations that hand a buffer back to the caller
/// together with the outcome.
pub type BufResult<T, B> = (SocketResult<T>, B);

/// Domain classification of a socket failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SocketErrorKind {
  /// Submitted, result arrives later. Never a terminal outcome.
  Pending,
  /// Transient, retry at a higher layer.
  WouldBlock,
  /// The caller's own cancellation token fired.
  Cancelled,
  /// Local disposal or forced teardown of a connection-oriented socket.
  Aborted,
  /// Local disposal of a datagram socket, or an interrupted syscall.
  Interrupted,
  PeerReset,
  Unreachable,
  TimedOut,
  /// The socket is in the wrong state for the requested operation.
  InvalidState,
  ArgumentInvalid,
  NotConnected,
  ConnectionRefused,
  AddressInUse,
  AddressNotAvailable,
  AddressFamilyNotSupported,
  OperationNotSupported,
  MessageSize,
  NoBufferSpace,
  AccessDenied,
  /// The socket was shut down in the direction of the operation.
  Shutdown,
  NotSocket,
  TooManyOpenSockets,
  Other,
}

impl SocketErrorKind {
  /// Maps a Linux `errno` value into the taxonomy.
  pub fn from_errno(errno: i32) -> Self {
    match errno {
      libc::EINPROGRESS | libc::EALREADY => Self::Pending,
      // EWOULDBLOCK == EAGAIN on Linux.
      libc::EAGAIN => Self::WouldBlock,
      libc::ECANCELED | libc::ECONNABORTED => Self::Aborted,
      libc::EINTR => Self::Interrupted,
      libc::ECONNRESET => Self::PeerReset,
      libc::ENETUNREACH
      | libc::EHOSTUNREACH
      | libc::ENETDOWN
      | libc::EHOSTDOWN
      | libc::ENETRESET => Self::Unreachable,
      libc::ETIMEDOUT => Self::TimedOut,
      libc::EISCONN => Self::InvalidState,
      libc::EINVAL | libc::EFAULT | libc::EDESTADDRREQ | libc::ENOPROTOOPT => {
        Self::ArgumentInvalid
      }
      libc::ENOTCONN => Self::NotConnected,
      libc::ECONNREFUSED => Self::ConnectionRefused,
      libc::EADDRINUSE => Self::AddressInUse,
      libc::EADDRNOTAVAIL => Self::AddressNotAvailable,
      libc::EAFNOSUPPORT | libc::EPFNOSUPPORT => {
        Self::AddressFamilyNotSupported
      }
      libc::EOPNOTSUPP | libc::EPROTONOSUPPORT | libc::ESOCKTNOSUPPORT => {
        Self::OperationNotSupported
      }
      libc::EMSGSIZE => Self::MessageSize,
      libc::ENOBUFS | libc::ENOMEM => Self::NoBufferSpace,
      libc::EACCES | libc::EPERM => Self::AccessDenied,
      libc::EPIPE | libc::ESHUTDOWN => Self::Shutdown,
      libc::EBADF | libc::ENOTSOCK => Self::NotSocket,
      libc::EMFILE | libc::ENFILE => Self::TooManyOpenSockets,
      _ => Self::Other,
    }
  }

  /// Whether the kind only means "not finished yet".
  pub const fn is_in_flight(self) -> bool {
    matches!(self, Self::Pending | Self::WouldBlock)
  }

  fn describe(self) -> &'static str {
    match self {
      Self::Pending => "operation pending",
      Self::WouldBlock => "operation would block",
      Self::Cancelled => "operation cancelled",
      Self::Aborted => "operation aborted",
      Self::Interrupted => "operation interrupted",
      Self::PeerReset => "connection reset by peer",
      Self::Unreachable => "network unreachable",
      Self::TimedOut => "operation timed out",
      Self::InvalidState => "socket is in an invalid state for this operation",
      Self::ArgumentInvalid => "invalid argument",
      Self::NotConnected => "socket is not connected",
      Self::ConnectionRefused => "connection refused",
      Self::AddressInUse => "address in use",
      Self::AddressNotAvailable => "address not available",
      Self::AddressFamilyNotSupported => "address family not supported",
      Self::OperationNotSupported => "operation not supported",
      Self::MessageSize => "message too long",
      Self::NoBufferSpace => "no buffer space available",
      Self::AccessDenied => "access denied",
      Self::Shutdown => "socket has been shut down",
      Self::NotSocket => "descriptor is not a socket",
      Self::TooManyOpenSockets => "too many open sockets",
      Self::Other => "socket error",
    }
  }
}

impl fmt::Display for SocketErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.describe())
  }
}

struct OsCode<'a>(&'a Option<i32>);

impl fmt::Display for OsCode<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.0 {
      Some(code) => write!(f, " (os error {code})"),
      None => Ok(()),
    }
  }
}

struct DisposedNote<'a>(&'a bool);

impl fmt::Display for DisposedNote<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if *self.0 { f.write_str(" (socket disposed)") } else { Ok(()) }
  }
}

/// A typed socket failure.
///
/// `disposed` marks errors the engine synthesized because the socket was
/// disposed while, or before, the operation ran.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}{}{}", OsCode(.raw_os_error), DisposedNote(.disposed))]
pub struct SocketError {
  kind: SocketErrorKind,
  raw_os_error: Option<i32>,
  disposed: bool,
}

impl SocketError {
  pub const fn new(kind: SocketErrorKind) -> Self {
    Self { kind, raw_os_error: None, disposed: false }
  }

  pub fn from_errno(errno: i32) -> Self {
    Self {
      kind: SocketErrorKind::from_errno(errno),
      raw_os_error: Some(errno),
      disposed: false,
    }
  }

  /// Builds the error from a raw syscall return encoded as `-errno`.
  pub(crate) fn from_raw_result(res: isize) -> Self {
    debug_assert!(res < 0, "from_raw_result called with a success value");
    Self::from_errno((-res) as i32)
  }

  /// The error every operation sees once the socket is disposed:
  /// `Aborted` for connection-oriented sockets, `Interrupted` otherwise.
  pub(crate) const fn disposed(connection_oriented: bool) -> Self {
    Self {
      kind: if connection_oriented {
        SocketErrorKind::Aborted
      } else {
        SocketErrorKind::Interrupted
      },
      raw_os_error: None,
      disposed: true,
    }
  }

  pub(crate) fn with_raw(mut self, raw: Option<i32>) -> Self {
    self.raw_os_error = raw;
    self
  }

  pub const fn kind(&self) -> SocketErrorKind {
    self.kind
  }

  pub const fn raw_os_error(&self) -> Option<i32> {
    self.raw_os_error
  }

  pub const fn is_disposed(&self) -> bool {
    self.disposed
  }

  pub const fn is_cancelled(&self) -> bool {
    matches!(self.kind, SocketErrorKind::Cancelled)
  }
}

impl From<SocketErrorKind> for SocketError {
  fn from(kind: SocketErrorKind) -> Self {
    Self::new(kind)
  }
}

impl From<io::Error> for SocketError {
  fn from(err: io::Error) -> Self {
    match err.raw_os_error() {
      Some(code) => Self::from_errno(code),
      None => Self::new(match err.kind() {
        io::ErrorKind::WouldBlock => SocketErrorKind::WouldBlock,
        io::ErrorKind::InvalidInput => SocketErrorKind::ArgumentInvalid,
        io::ErrorKind::TimedOut => SocketErrorKind::TimedOut,
        io::ErrorKind::Interrupted => SocketErrorKind::Interrupted,
        _ => SocketErrorKind::Other,
      }),
    }
  }
}

impl From<SocketError> for io::Error {
  fn from(err: SocketError) -> Self {
    if let (Some(code), false) = (err.raw_os_error, err.disposed) {
      return io::Error::from_raw_os_error(code);
    }
    let kind = match err.kind {
      SocketErrorKind::WouldBlock | SocketErrorKind::Pending => {
        io::ErrorKind::WouldBlock
      }
      SocketErrorKind::Aborted => io::ErrorKind::ConnectionAborted,
      SocketErrorKind::Interrupted => io::ErrorKind::Interrupted,
      SocketErrorKind::PeerReset => io::ErrorKind::ConnectionReset,
      SocketErrorKind::TimedOut => io::ErrorKind::TimedOut,
      SocketErrorKind::ArgumentInvalid => io::ErrorKind::InvalidInput,
      SocketErrorKind::NotConnected => io::ErrorKind::NotConnected,
      SocketErrorKind::ConnectionRefused => io::ErrorKind::ConnectionRefused,
      SocketErrorKind::AddressInUse => io::ErrorKind::AddrInUse,
      SocketErrorKind::AddressNotAvailable => io::ErrorKind::AddrNotAvailable,
      SocketErrorKind::AccessDenied => io::ErrorKind::PermissionDenied,
      SocketErrorKind::Shutdown => io::ErrorKind::BrokenPipe,
      SocketErrorKind::OperationNotSupported => io::ErrorKind::Unsupported,
      _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  #[test]
  fn in_flight_codes_are_not_failures() {
    assert!(SocketErrorKind::from_errno(libc::EAGAIN).is_in_flight());
    assert!(SocketErrorKind::from_errno(libc::EWOULDBLOCK).is_in_flight());
    assert!(SocketErrorKind::from_errno(libc::EINPROGRESS).is_in_flight());
    assert!(!SocketErrorKind::from_errno(libc::ECONNRESET).is_in_flight());
  }

  #[test]
  fn well_known_codes() {
    assert_eq!(
      SocketErrorKind::from_errno(libc::ECONNRESET),
      SocketErrorKind::PeerReset
    );
    assert_eq!(
      SocketErrorKind::from_errno(libc::EHOSTUNREACH),
      SocketErrorKind::Unreachable
    );
    assert_eq!(
      SocketErrorKind::from_errno(libc::ETIMEDOUT),
      SocketErrorKind::TimedOut
    );
    assert_eq!(
      SocketErrorKind::from_errno(libc::EISCONN),
      SocketErrorKind::InvalidState
    );
    assert_eq!(
      SocketErrorKind::from_errno(libc::EINVAL),
      SocketErrorKind::ArgumentInvalid
    );
  }

  #[test]
  fn disposed_error_depends_on_socket_kind() {
    let stream = SocketError::disposed(true);
    assert_eq!(stream.kind(), SocketErrorKind::Aborted);
    assert!(stream.is_disposed());

    let dgram = SocketError::disposed(false);
    assert_eq!(dgram.kind(), SocketErrorKind::Interrupted);
    assert!(dgram.raw_os_error().is_none());
  }

  #[test]
  fn display_includes_os_code() {
    let err = SocketError::from_errno(libc::ECONNREFUSED);
    let text = err.to_string();
    assert!(text.starts_with("connection refused"), "{text}");
    assert!(text.contains(&format!("os error {}", libc::ECONNREFUSED)));
  }

  proptest! {
    #[test]
    fn raw_code_survives_io_round_trip(code in 1i32..134) {
      let err = SocketError::from_errno(code);
      prop_assert_eq!(err.raw_os_error(), Some(code));

      let io_err: io::Error = err.clone().into();
      prop_assert_eq!(io_err.raw_os_error(), Some(code));
      prop_assert_eq!(SocketError::from(io_err), err);
    }

    #[test]
    fn mapping_is_total_and_deterministic(code in any::<i32>()) {
      let first = SocketErrorKind::from_errno(code);
      prop_assert_eq!(first, SocketErrorKind::from_errno(code));
    }
  }
}
