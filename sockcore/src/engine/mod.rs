//! The socket state machine and the uniform async issue protocol.

mod ops;
mod state;
mod sync;

pub use ops::ReceivedMessage;
pub use state::SocketShape;

pub(crate) use state::SocketState;

use std::{
  fmt,
  net::{Shutdown, SocketAddr},
  os::fd::{IntoRawFd, OwnedFd, RawFd},
  sync::{Arc, atomic::AtomicBool},
};

use socket2::{Domain, Protocol, SockAddr, Type};

use crate::{
  completion::{AwaitableCompletion, CancelCause, Completion, CompletionPool, OpWait},
  config::CloseTimeout,
  error::{SocketError, SocketErrorKind, SocketResult},
  handle::{self, CloseKind, HandleGuard, HandleRef},
  reactor::{Direction, Reactor, Submission},
  slot::{OpKind, OperationSlot},
  sync::Mutex,
};

const CANCELED: isize = -(libc::ECANCELED as isize);

/// State shared by every clone of a [`Socket`] and by its in-flight
/// operations.
pub(crate) struct SocketShared {
  pub(crate) shape: SocketShape,
  pub(crate) guard: HandleGuard,
  pub(crate) state: SocketState,
  send_pool: CompletionPool,
  recv_pool: CompletionPool,
  close_timeout: Mutex<CloseTimeout>,
  pktinfo: AtomicBool,
}

impl SocketShared {
  fn pool(&self, dir: Direction) -> &CompletionPool {
    match dir {
      Direction::Read => &self.recv_pool,
      Direction::Write => &self.send_pool,
    }
  }

  pub(crate) fn is_disposed(&self) -> bool {
    self.state.is_disposed()
  }

  pub(crate) fn disposed_error(&self) -> SocketError {
    SocketError::disposed(self.shape.is_connection_oriented())
  }

  /// Returns an idle completion to its pool, unless the socket is gone.
  pub(crate) fn release_completion(&self, dir: Direction, cell: Arc<AwaitableCompletion>) {
    if self.is_disposed() {
      return;
    }
    let pool = self.pool(dir);
    pool.release(cell);
    // Lost a race with dispose: it may already have drained.
    if self.is_disposed() {
      pool.drain();
    }
  }

  /// Maps a raw result into the operation's outcome, applying the
  /// cancellation and disposal rewrites.
  pub(crate) fn outcome(&self, kind: OpKind, res: isize, cause: CancelCause) -> SocketResult<usize> {
    if res == CANCELED {
      match cause {
        CancelCause::Token => return Err(SocketErrorKind::Cancelled.into()),
        CancelCause::Teardown => return Err(self.disposed_error()),
        CancelCause::None => {}
      }
    }

    let transfers = !matches!(kind, OpKind::Accept | OpKind::Connect);
    if self.is_disposed() && (res < 0 || (res == 0 && transfers)) {
      let raw = (res < 0).then_some((-res) as i32);
      return Err(self.disposed_error().with_raw(raw));
    }

    if res < 0 { Err(SocketError::from_raw_result(res)) } else { Ok(res as usize) }
  }

  fn dispose(&self, timeout: CloseTimeout) -> Option<CloseKind> {
    self.state.insert(SocketState::DISPOSED);
    let kind = self.guard.close(timeout);
    self.send_pool.drain();
    self.recv_pool.drain();
    kind
  }
}

impl Drop for SocketShared {
  fn drop(&mut self) {
    if !self.guard.is_closed() {
      let timeout = *self.close_timeout.lock();
      self.dispose(timeout);
    }
  }
}

/// An asynchronous socket.
///
/// Cloning is cheap and every clone refers to the same descriptor. The
/// descriptor is closed by [`dispose`](Socket::dispose),
/// [`close`](Socket::close), or when the last clone and the last
/// in-flight [`Completion`] are dropped.
#[derive(Clone)]
pub struct Socket {
  shared: Arc<SocketShared>,
}

impl fmt::Debug for Socket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Socket")
      .field("fd", &self.shared.guard.fd())
      .field("shape", &self.shared.shape)
      .field("state", &format_args!("{:#09b}", self.shared.state.load()))
      .finish()
  }
}

impl Socket {
  /// Creates a socket. The descriptor is always non-blocking at the OS
  /// level; see [`set_blocking`](Self::set_blocking) for the synchronous
  /// API's behaviour.
  pub fn new(domain: Domain, ty: Type, protocol: Option<Protocol>) -> SocketResult<Socket> {
    let socket = socket2::Socket::new(domain, ty, protocol)?;
    socket.set_nonblocking(true)?;
    let fd: OwnedFd = socket.into();
    Ok(Self::from_parts(fd, SocketShape::new(domain, ty, protocol), SocketState::BLOCKING))
  }

  /// Creates a socket whose family matches `addr`.
  pub fn for_address(addr: &SocketAddr, ty: Type) -> SocketResult<Socket> {
    let protocol = if ty == Type::STREAM {
      Some(Protocol::TCP)
    } else if ty == Type::DGRAM {
      Some(Protocol::UDP)
    } else {
      None
    };
    Self::new(Domain::for_address(*addr), ty, protocol)
  }

  /// Adopts an existing socket descriptor, inferring its shape and state.
  ///
  /// # Safety
  ///
  /// `fd` must be an open socket that nothing else will close.
  pub unsafe fn from_raw_fd(fd: RawFd) -> SocketResult<Socket> {
    // SAFETY: upheld by the caller.
    let socket = unsafe { <socket2::Socket as std::os::fd::FromRawFd>::from_raw_fd(fd) };
    let shape = SocketShape::new(socket.domain()?, socket.r#type()?, socket.protocol()?);
    socket.set_nonblocking(true)?;

    let mut bits = SocketState::BLOCKING;
    if socket.local_addr().ok().and_then(|a| a.as_socket()).is_some_and(|a| a.port() != 0) {
      bits |= SocketState::BOUND;
    }
    if shape.is_connection_oriented() && socket.is_listener().unwrap_or(false) {
      bits |= SocketState::LISTENING | SocketState::BOUND;
    }
    if socket.peer_addr().is_ok() {
      bits |= SocketState::CONNECTED | SocketState::BOUND;
    }
    Ok(Self::from_parts(socket.into(), shape, bits))
  }

  pub(crate) fn from_parts(fd: OwnedFd, shape: SocketShape, bits: u32) -> Socket {
    let close_timeout = Reactor::get()
      .map(|r| r.config().close_timeout)
      .unwrap_or_default();
    let fd = fd.into_raw_fd();
    let shared = SocketShared {
      shape,
      guard: HandleGuard::new(fd, shape.raw_type(), shape.is_connection_oriented()),
      state: SocketState::new(bits),
      send_pool: CompletionPool::new(),
      recv_pool: CompletionPool::new(),
      close_timeout: Mutex::new(close_timeout),
      pktinfo: AtomicBool::new(false),
    };
    tracing::trace!(fd, ?shape, "socket created");
    Socket { shared: Arc::new(shared) }
  }

  pub fn shape(&self) -> SocketShape {
    self.shared.shape
  }

  pub fn as_raw_fd(&self) -> RawFd {
    self.shared.guard.fd()
  }

  pub fn is_bound(&self) -> bool {
    self.shared.state.contains(SocketState::BOUND)
  }

  pub fn is_listening(&self) -> bool {
    self.shared.state.contains(SocketState::LISTENING)
  }

  /// Whether the socket is connected. Resolves a non-blocking connect
  /// that was still in progress.
  pub fn is_connected(&self) -> bool {
    if self.shared.state.contains(SocketState::PENDING_CONNECT) {
      let _ = self.poll_pending_connect();
    }
    self.shared.state.contains(SocketState::CONNECTED)
  }

  pub fn is_disposed(&self) -> bool {
    self.shared.is_disposed()
  }

  pub fn is_blocking(&self) -> bool {
    self.shared.state.contains(SocketState::BLOCKING)
  }

  /// Selects how the synchronous API behaves: blocking (default) waits
  /// for completion, non-blocking makes one attempt and may fail with
  /// [`SocketErrorKind::WouldBlock`].
  pub fn set_blocking(&self, blocking: bool) -> SocketResult<()> {
    self.ensure_live()?;
    if blocking {
      self.shared.state.insert(SocketState::BLOCKING);
    } else {
      self.shared.state.remove(SocketState::BLOCKING);
    }
    Ok(())
  }

  /// Strategy used by [`dispose`](Self::dispose) and by drop.
  pub fn set_close_timeout(&self, timeout: CloseTimeout) {
    *self.shared.close_timeout.lock() = timeout;
  }

  pub fn close_timeout(&self) -> CloseTimeout {
    *self.shared.close_timeout.lock()
  }

  pub fn bind(&self, addr: SocketAddr) -> SocketResult<()> {
    let handle = self.acquire()?;
    self.check_family(&addr)?;
    handle.sock().bind(&SockAddr::from(addr))?;
    self.shared.state.insert(SocketState::BOUND);
    tracing::debug!(fd = handle.fd(), %addr, "bound");
    Ok(())
  }

  /// Starts listening. An unbound socket is bound to an ephemeral port by
  /// the kernel.
  pub fn listen(&self, backlog: i32) -> SocketResult<()> {
    let handle = self.acquire()?;
    if !self.shared.shape.is_connection_oriented() {
      return Err(SocketErrorKind::OperationNotSupported.into());
    }
    if self.shared.state.intersects(SocketState::CONNECTED | SocketState::PENDING_CONNECT) {
      return Err(SocketErrorKind::InvalidState.into());
    }
    handle.sock().listen(backlog)?;
    self.shared.state.insert(SocketState::LISTENING | SocketState::BOUND);
    tracing::debug!(fd = handle.fd(), backlog, "listening");
    Ok(())
  }

  /// [`listen`](Self::listen) with the configured default backlog.
  pub fn listen_default(&self) -> SocketResult<()> {
    let backlog = Reactor::get().map(|r| r.config().listen_backlog).unwrap_or(128);
    self.listen(backlog)
  }

  pub fn shutdown(&self, how: Shutdown) -> SocketResult<()> {
    let handle = self.acquire()?;
    handle.sock().shutdown(how)?;
    Ok(())
  }

  pub fn local_addr(&self) -> SocketResult<SocketAddr> {
    let handle = self.acquire()?;
    let addr = handle.sock().local_addr()?;
    addr.as_socket().ok_or_else(|| SocketErrorKind::AddressFamilyNotSupported.into())
  }

  pub fn peer_addr(&self) -> SocketResult<SocketAddr> {
    let handle = self.acquire()?;
    let addr = handle.sock().peer_addr()?;
    addr.as_socket().ok_or_else(|| SocketErrorKind::AddressFamilyNotSupported.into())
  }

  /// Bytes that can be read without blocking.
  pub fn available(&self) -> SocketResult<usize> {
    let handle = self.acquire()?;
    Ok(handle::available(handle.fd())?)
  }

  /// Disposes the socket with its configured close timeout. Returns
  /// `true` for the call that actually closed the descriptor.
  ///
  /// Pending operations resolve with [`SocketErrorKind::Aborted`]
  /// (connection-oriented sockets) or [`SocketErrorKind::Interrupted`]
  /// (others), flagged as [disposed](SocketError::is_disposed).
  pub fn dispose(&self) -> bool {
    self.shared.dispose(self.close_timeout()).is_some()
  }

  /// Disposes the socket with an explicit close strategy. Returns how the
  /// descriptor was closed, or `None` if another call already closed it.
  pub fn close(&self, timeout: CloseTimeout) -> Option<CloseKind> {
    self.shared.dispose(timeout)
  }

  fn acquire(&self) -> SocketResult<HandleRef<'_>> {
    if self.shared.is_disposed() {
      return Err(self.shared.disposed_error());
    }
    self.shared.guard.try_acquire().ok_or_else(|| self.shared.disposed_error())
  }

  fn ensure_live(&self) -> SocketResult<()> {
    if self.shared.is_disposed() { Err(self.shared.disposed_error()) } else { Ok(()) }
  }

  fn check_family(&self, addr: &SocketAddr) -> SocketResult<()> {
    if Domain::for_address(*addr) == self.shared.shape.domain {
      Ok(())
    } else {
      Err(SocketErrorKind::ArgumentInvalid.into())
    }
  }

  /// The canonical issue path every asynchronous operation goes through:
  /// acquire a completion, stamp its slot, submit through the binding,
  /// then either finish inline or hand back an awaitable.
  pub(crate) fn issue<T>(
    &self,
    kind: OpKind,
    stamp: impl FnOnce(&mut OperationSlot),
    decode: fn(&SocketShared, &mut OperationSlot, isize, CancelCause) -> T,
  ) -> Completion<T> {
    let shared = &self.shared;
    let dir = kind.direction();
    let (cell, pooled) = shared.pool(dir).acquire();
    let version = cell.begin();
    {
      // SAFETY: freshly begun and not queued anywhere.
      let slot = unsafe { cell.slot_mut() };
      slot.prepare(kind);
      stamp(slot);
    }
    let wait = OpWait::new(cell.clone(), version, dir, shared.clone(), decode, pooled);

    let submitted = if shared.is_disposed() {
      cell.set_cause(CancelCause::Teardown);
      Submission::Completed(CANCELED)
    } else {
      match shared.guard.binder().get_or_bind(shared.guard.fd()) {
        Ok(ctx) => ctx.submit(dir, &cell, version),
        Err(err) if err.is_disposed() => {
          cell.set_cause(CancelCause::Teardown);
          Submission::Completed(CANCELED)
        }
        Err(err) => {
          let errno = err.raw_os_error().unwrap_or(libc::EIO);
          Submission::Completed(-(errno as isize))
        }
      }
    };

    match submitted {
      Submission::Completed(res) => {
        cell.complete(version, res);
        if shared.guard.binder().skip_notification_on_sync_success() {
          tracing::trace!(?kind, res, "completed inline");
          Completion::ready(wait.finish(res))
        } else {
          Completion::op(wait)
        }
      }
      Submission::Pending => Completion::op(wait),
    }
  }
}
