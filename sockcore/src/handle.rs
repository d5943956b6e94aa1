//! Exclusive ownership of a socket descriptor and its close protocol.
//!
//! Closing is the one place where user code, in-flight operations and the
//! OS all race for the same small integer. The guard makes the order
//! explicit:
//!
//! 1. claim `owns_close` by CAS; losers wait for `released` and return,
//! 2. mark the handle closing so no new [`HandleRef`] can be taken,
//! 3. tear down the reactor binding (cancel parked operations, remove the
//!    epoll registration),
//! 4. wait for outstanding [`HandleRef`]s,
//! 5. run the chosen close strategy,
//! 6. publish `released`.
//!
//! After step 3 nothing in the crate will issue a syscall on the
//! descriptor, so the number can be recycled by the OS safely.
//!
//! A graceful close can wait for the peer for its whole budget. When it is
//! requested on the reactor thread (a socket dropped inside a completion
//! callback), that wait runs on a short-lived closer thread instead, so
//! other sockets' completions keep flowing.

use std::{
  hint,
  os::fd::{BorrowedFd, RawFd},
  sync::atomic::{AtomicBool, AtomicUsize, Ordering},
  thread,
  time::{Duration, Instant},
};

use socket2::SockRef;

use crate::{binder::CompletionBinder, config::CloseTimeout, reactor};

const CLOSING: usize = 1 << (usize::BITS - 1);
const SPINS_BEFORE_YIELD: u32 = 64;

/// How a socket was actually closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
  /// Plain close, lingering left to the OS.
  OsDefault,
  /// Send side shut down and the peer's end of stream observed with no
  /// unread data left.
  Graceful,
  /// Connection reset; pending data discarded.
  Abortive,
  /// Graceful close requested on the reactor thread and handed to a
  /// closer thread, which ends it as `Graceful` or `Abortive`.
  Deferred,
}

pub(crate) struct HandleGuard {
  fd: RawFd,
  owns_close: AtomicBool,
  released: AtomicBool,
  /// In-flight synchronous syscalls, plus the `CLOSING` bit.
  refs: AtomicUsize,
  binder: CompletionBinder,
  stream: bool,
}

/// Keeps the descriptor open for the duration of a synchronous syscall.
pub(crate) struct HandleRef<'a> {
  guard: &'a HandleGuard,
  fd: BorrowedFd<'a>,
}

impl HandleRef<'_> {
  pub fn fd(&self) -> RawFd {
    self.guard.fd
  }

  /// `socket2` view of the descriptor, for option and address calls.
  pub fn sock(&self) -> SockRef<'_> {
    SockRef::from(&self.fd)
  }
}

impl Drop for HandleRef<'_> {
  fn drop(&mut self) {
    self.guard.refs.fetch_sub(1, Ordering::Release);
  }
}

impl HandleGuard {
  pub fn new(fd: RawFd, socket_type: libc::c_int, stream: bool) -> Self {
    Self {
      fd,
      owns_close: AtomicBool::new(false),
      released: AtomicBool::new(false),
      refs: AtomicUsize::new(0),
      binder: CompletionBinder::new(socket_type, stream),
      stream,
    }
  }

  /// The raw descriptor. Only for submissions through the binder, which
  /// stop touching it once torn down.
  pub fn fd(&self) -> RawFd {
    self.fd
  }

  pub fn binder(&self) -> &CompletionBinder {
    &self.binder
  }

  /// Pins the descriptor open, or `None` once closing has started.
  pub fn try_acquire(&self) -> Option<HandleRef<'_>> {
    let prev = self.refs.fetch_add(1, Ordering::Acquire);
    if prev & CLOSING != 0 {
      self.refs.fetch_sub(1, Ordering::Release);
      return None;
    }
    // SAFETY: the descriptor stays open while the reference is counted.
    Some(HandleRef { guard: self, fd: unsafe { BorrowedFd::borrow_raw(self.fd) } })
  }

  pub fn is_closed(&self) -> bool {
    self.owns_close.load(Ordering::Acquire)
  }

  #[cfg(test)]
  pub fn is_released(&self) -> bool {
    self.released.load(Ordering::Acquire)
  }

  /// Closes the descriptor. Exactly one caller gets `Some`; every other
  /// caller waits until the descriptor is released and gets `None`.
  /// Callers on the reactor thread never wait: a losing caller returns at
  /// once, and a graceful winner releases once the closer thread owns the
  /// descriptor.
  pub fn close(&self, timeout: CloseTimeout) -> Option<CloseKind> {
    if self
      .owns_close
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      if !reactor::on_dispatch_thread() {
        spin_until(|| self.released.load(Ordering::Acquire));
      }
      return None;
    }

    self.refs.fetch_or(CLOSING, Ordering::AcqRel);

    let cancelled = self.binder.teardown();
    let strategy = if cancelled > 0 {
      tracing::debug!(fd = self.fd, cancelled, "pending operations cancelled, closing abortively");
      CloseTimeout::Abortive
    } else {
      timeout
    };

    spin_until(|| self.refs.load(Ordering::Acquire) & !CLOSING == 0);

    let kind = match strategy {
      CloseTimeout::OsDefault => {
        close_fd(self.fd);
        CloseKind::OsDefault
      }
      CloseTimeout::Graceful(_) if !self.stream => {
        close_fd(self.fd);
        CloseKind::OsDefault
      }
      CloseTimeout::Abortive => {
        abort(self.fd, self.stream);
        CloseKind::Abortive
      }
      CloseTimeout::Graceful(budget) if reactor::on_dispatch_thread() => {
        defer_graceful(self.fd, budget)
      }
      CloseTimeout::Graceful(budget) => graceful(self.fd, budget),
    };

    self.released.store(true, Ordering::Release);
    tracing::debug!(fd = self.fd, ?kind, "socket closed");
    Some(kind)
  }
}

/// Shuts down, waits for the peer, and falls back to a reset.
fn graceful(fd: RawFd, budget: Duration) -> CloseKind {
  if drained(fd, budget) {
    close_fd(fd);
    CloseKind::Graceful
  } else {
    abort(fd, true);
    CloseKind::Abortive
  }
}

/// Hands the descriptor to a closer thread. The caller gives up the
/// descriptor when this returns.
fn defer_graceful(fd: RawFd, budget: Duration) -> CloseKind {
  let spawned = thread::Builder::new()
    .name("sockcore-closer".into())
    .spawn(move || {
      let kind = graceful(fd, budget);
      tracing::debug!(fd, ?kind, "deferred close finished");
    });
  match spawned {
    Ok(_) => CloseKind::Deferred,
    Err(err) => {
      tracing::warn!(fd, %err, "no closer thread, closing abortively");
      abort(fd, true);
      CloseKind::Abortive
    }
  }
}

fn abort(fd: RawFd, stream: bool) {
  if stream {
    // SAFETY: the descriptor is still open; only the closer gets here.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    if let Err(err) = SockRef::from(&borrowed).set_linger(Some(Duration::ZERO)) {
      tracing::warn!(fd, %err, "failed to arm abortive close");
    }
  }
  close_fd(fd);
}

fn close_fd(fd: RawFd) {
  if let Err(err) = syscall!(close(fd)) {
    tracing::warn!(fd, %err, "close failed");
  }
}

impl Drop for HandleGuard {
  fn drop(&mut self) {
    if !self.owns_close.load(Ordering::Acquire) {
      self.close(CloseTimeout::OsDefault);
    }
  }
}

fn spin_until(mut done: impl FnMut() -> bool) {
  let mut spins = 0;
  while !done() {
    if spins < SPINS_BEFORE_YIELD {
      hint::spin_loop();
      spins += 1;
    } else {
      thread::yield_now();
    }
  }
}

/// Bytes queued for reading, via `FIONREAD`.
pub(crate) fn available(fd: RawFd) -> std::io::Result<usize> {
  let mut n: libc::c_int = 0;
  syscall!(ioctl(fd, libc::FIONREAD, &mut n))?;
  Ok(n.max(0) as usize)
}

/// Shuts the send side down and waits up to `budget` for the peer's end
/// of stream. `true` only if it arrived with nothing left unread.
fn drained(fd: RawFd, budget: Duration) -> bool {
  if !matches!(available(fd), Ok(0)) {
    return false;
  }
  if syscall!(shutdown(fd, libc::SHUT_WR)).is_err() {
    return false;
  }

  let deadline = Instant::now() + budget;
  loop {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
      return false;
    }

    let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
    let ms = remaining.as_millis().clamp(1, i32::MAX as u128) as libc::c_int;
    match syscall!(poll(&mut pfd, 1, ms)) {
      Ok(0) => continue,
      Ok(_) => {}
      Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
      Err(_) => return false,
    }

    let mut byte = 0u8;
    let res = syscall!(raw recv(
      fd,
      (&mut byte as *mut u8).cast(),
      1,
      libc::MSG_PEEK | libc::MSG_DONTWAIT,
    ));
    match res {
      0 => return matches!(available(fd), Ok(0)),
      r if r == -(libc::EAGAIN as isize) => continue,
      _ => return false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::{Arc, Barrier};

  fn stream_pair() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    syscall!(socketpair(
      libc::AF_UNIX,
      libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
      0,
      fds.as_mut_ptr()
    ))
    .unwrap();
    (fds[0], fds[1])
  }

  fn is_open(fd: RawFd) -> bool {
    syscall!(fcntl(fd, libc::F_GETFD)).is_ok()
  }

  #[test]
  fn exactly_one_closer_wins() {
    for _ in 0..20 {
      let (a, b) = stream_pair();
      let guard = Arc::new(HandleGuard::new(a, libc::SOCK_STREAM, true));
      let threads = 8;
      let barrier = Arc::new(Barrier::new(threads));

      let winners: usize = (0..threads)
        .map(|_| {
          let guard = guard.clone();
          let barrier = barrier.clone();
          thread::spawn(move || {
            barrier.wait();
            let res = guard.close(CloseTimeout::OsDefault);
            // Every caller returns only after the release.
            assert!(guard.is_released());
            res.is_some() as usize
          })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .sum();

      assert_eq!(winners, 1);
      unsafe { libc::close(b) };
    }
  }

  #[test]
  fn refs_are_refused_once_closing() {
    let (a, b) = stream_pair();
    let guard = HandleGuard::new(a, libc::SOCK_STREAM, true);
    {
      let r = guard.try_acquire().unwrap();
      assert_eq!(r.fd(), a);
      assert!(r.sock().r#type().is_ok());
    }
    assert_eq!(guard.close(CloseTimeout::OsDefault), Some(CloseKind::OsDefault));
    assert!(guard.try_acquire().is_none());
    assert_eq!(guard.close(CloseTimeout::Abortive), None);
    unsafe { libc::close(b) };
  }

  #[test]
  fn close_waits_for_in_flight_ref() {
    let (a, b) = stream_pair();
    let guard = Arc::new(HandleGuard::new(a, libc::SOCK_STREAM, true));
    let (held_tx, held_rx) = std::sync::mpsc::channel();
    let (go_tx, go_rx) = std::sync::mpsc::channel::<()>();

    let holder = {
      let guard = guard.clone();
      thread::spawn(move || {
        let r = guard.try_acquire().unwrap();
        held_tx.send(()).unwrap();
        go_rx.recv().unwrap();
        // Still open while the reference is held.
        assert!(is_open(r.fd()));
      })
    };

    held_rx.recv().unwrap();
    let closer = {
      let guard = guard.clone();
      thread::spawn(move || guard.close(CloseTimeout::OsDefault))
    };
    thread::sleep(Duration::from_millis(20));
    assert!(!guard.is_released());

    go_tx.send(()).unwrap();
    holder.join().unwrap();
    assert_eq!(closer.join().unwrap(), Some(CloseKind::OsDefault));
    assert!(guard.is_released());
    unsafe { libc::close(b) };
  }

  #[test]
  fn graceful_after_peer_eof() {
    let (a, b) = stream_pair();
    unsafe { libc::close(b) };
    let guard = HandleGuard::new(a, libc::SOCK_STREAM, true);
    assert_eq!(
      guard.close(CloseTimeout::Graceful(Duration::from_secs(2))),
      Some(CloseKind::Graceful)
    );
  }

  #[test]
  fn graceful_with_unread_data_aborts() {
    let (a, b) = stream_pair();
    syscall!(write(b, b"left".as_ptr().cast(), 4)).unwrap();
    let guard = HandleGuard::new(a, libc::SOCK_STREAM, true);
    assert_eq!(
      guard.close(CloseTimeout::Graceful(Duration::from_secs(2))),
      Some(CloseKind::Abortive)
    );
    unsafe { libc::close(b) };
  }

  #[test]
  fn graceful_times_out_without_peer_eof() {
    let (a, b) = stream_pair();
    let guard = HandleGuard::new(a, libc::SOCK_STREAM, true);
    assert_eq!(
      guard.close(CloseTimeout::Graceful(Duration::from_millis(30))),
      Some(CloseKind::Abortive)
    );
    unsafe { libc::close(b) };
  }

  #[test]
  fn drop_closes_descriptor() {
    let (a, b) = stream_pair();
    let guard = HandleGuard::new(a, libc::SOCK_STREAM, true);
    assert!(is_open(a));
    drop(guard);

    // The peer sees end of stream once our side is gone.
    let mut byte = 0u8;
    let n = syscall!(raw recv(b, (&mut byte as *mut u8).cast(), 1, libc::MSG_DONTWAIT));
    assert_eq!(n, 0);
    unsafe { libc::close(b) };
  }
}
