//! Per-descriptor binding to the reactor.
//!
//! A binding holds two FIFO queues of parked operations, one per
//! direction. Submission attempts the syscall and, if it would block,
//! parks the operation, both under the binding's lock. The dispatch thread
//! takes the same lock before retrying, so with edge-triggered epoll no
//! readiness edge can slip between "attempt failed" and "parked".

use std::{collections::VecDeque, os::fd::RawFd, sync::Arc};

use super::interest::{Direction, Readiness};
use crate::{
  completion::{AwaitableCompletion, CancelCause},
  slot::would_block,
  sync::Mutex,
};

const CANCELED: isize = -(libc::ECANCELED as isize);

/// Outcome of [`CompletionContext::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Submission {
  /// Finished during submission with this raw result.
  Completed(isize),
  /// Parked; the reactor will complete it.
  Pending,
}

struct PendingIo {
  cell: Arc<AwaitableCompletion>,
  version: u64,
}

#[derive(Default)]
struct Queues {
  read: VecDeque<PendingIo>,
  write: VecDeque<PendingIo>,
  closed: bool,
}

impl Queues {
  fn get(&mut self, dir: Direction) -> &mut VecDeque<PendingIo> {
    match dir {
      Direction::Read => &mut self.read,
      Direction::Write => &mut self.write,
    }
  }
}

pub(crate) struct Binding {
  fd: RawFd,
  queues: Mutex<Queues>,
}

impl Binding {
  pub fn new(fd: RawFd) -> Self {
    Self { fd, queues: Mutex::new(Queues::default()) }
  }

  /// Retries parked operations for every direction `ready` covers.
  pub fn dispatch(&self, ready: Readiness) {
    let mut done = Vec::new();
    {
      let mut queues = self.queues.lock();
      for dir in [Direction::Read, Direction::Write] {
        if ready.wakes(dir) {
          drain(self.fd, queues.get(dir), &mut done);
        }
      }
    }

    for (io, res) in done {
      tracing::trace!(fd = self.fd, version = io.version, res, "completing parked operation");
      io.cell.complete(io.version, res);
    }
  }
}

/// Runs queued operations front-first until one would block.
fn drain(fd: RawFd, queue: &mut VecDeque<PendingIo>, done: &mut Vec<(PendingIo, isize)>) {
  while let Some(front) = queue.front() {
    // SAFETY: the cell is parked here and the queue lock is held.
    let res = unsafe { front.cell.slot_mut() }.attempt(fd);
    if would_block(res) {
      break;
    }
    if let Some(io) = queue.pop_front() {
      done.push((io, res));
    }
  }
}

/// Handle on a descriptor's reactor binding. Cheap to clone.
#[derive(Clone)]
pub(crate) struct CompletionContext {
  binding: Arc<Binding>,
  /// Generational key the binding is stored under.
  key: u64,
}

impl std::fmt::Debug for CompletionContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CompletionContext")
      .field("fd", &self.binding.fd)
      .field("key", &self.key)
      .finish()
  }
}

impl CompletionContext {
  pub(crate) fn new(binding: Arc<Binding>, key: u64) -> Self {
    Self { binding, key }
  }

  pub fn fd(&self) -> RawFd {
    self.binding.fd
  }

  pub fn key(&self) -> u64 {
    self.key
  }

  #[cfg(test)]
  pub(crate) fn binding(&self) -> &Arc<Binding> {
    &self.binding
  }

  /// Attempts the operation stamped into `cell` and parks it if the
  /// kernel is not ready.
  ///
  /// The cell must be pending under `version` and not queued anywhere.
  pub fn submit(
    &self,
    dir: Direction,
    cell: &Arc<AwaitableCompletion>,
    version: u64,
  ) -> Submission {
    let mut queues = self.binding.queues.lock();
    if queues.closed {
      cell.set_cause(CancelCause::Teardown);
      return Submission::Completed(CANCELED);
    }

    let queue = queues.get(dir);
    if queue.is_empty() {
      // SAFETY: the issuer owns the cell until it is queued.
      let res = unsafe { cell.slot_mut() }.attempt(self.binding.fd);
      if !would_block(res) {
        return Submission::Completed(res);
      }
    }

    tracing::trace!(fd = self.binding.fd, ?dir, version, "parking operation");
    queue.push_back(PendingIo { cell: cell.clone(), version });
    Submission::Pending
  }

  /// Removes one parked operation and resolves it as cancelled by the
  /// caller's token. Returns `false` if it already left the queue.
  pub fn cancel_op(&self, cell: &Arc<AwaitableCompletion>, version: u64) -> bool {
    let removed = {
      let mut queues = self.binding.queues.lock();
      let mut found = None;
      for dir in [Direction::Read, Direction::Write] {
        let queue = queues.get(dir);
        if let Some(pos) = queue
          .iter()
          .position(|io| io.version == version && Arc::ptr_eq(&io.cell, cell))
        {
          found = queue.remove(pos);
          break;
        }
      }
      found
    };

    match removed {
      Some(io) => {
        io.cell.set_cause(CancelCause::Token);
        io.cell.complete(io.version, CANCELED);
        tracing::trace!(fd = self.binding.fd, version, "cancelled by token");
        true
      }
      None => false,
    }
  }

  /// Closes the binding to new submissions and resolves every parked
  /// operation as torn down. Returns how many were cancelled.
  pub fn cancel_all(&self) -> usize {
    let drained: Vec<PendingIo> = {
      let mut queues = self.binding.queues.lock();
      queues.closed = true;
      let mut all: Vec<_> = queues.read.drain(..).collect();
      all.extend(queues.write.drain(..));
      all
    };

    for io in &drained {
      io.cell.set_cause(CancelCause::Teardown);
      io.cell.complete(io.version, CANCELED);
    }
    drained.len()
  }

  #[cfg(test)]
  pub fn parked(&self, dir: Direction) -> usize {
    self.binding.queues.lock().get(dir).len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::slot::OpKind;
  use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

  fn pair() -> (OwnedFd, OwnedFd) {
    let mut fds = [0; 2];
    syscall!(socketpair(
      libc::AF_UNIX,
      libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
      0,
      fds.as_mut_ptr()
    ))
    .unwrap();
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
  }

  fn receive_cell(cap: usize) -> (Arc<AwaitableCompletion>, u64) {
    let cell = Arc::new(AwaitableCompletion::new());
    let version = cell.begin();
    let slot = unsafe { cell.slot_mut() };
    slot.prepare(OpKind::Receive);
    slot.buffer = Vec::with_capacity(cap);
    (cell, version)
  }

  fn context(fd: RawFd) -> CompletionContext {
    CompletionContext::new(Arc::new(Binding::new(fd)), 0)
  }

  #[test]
  fn ready_data_completes_inline() {
    let (a, b) = pair();
    syscall!(write(b.as_raw_fd(), b"hi".as_ptr().cast(), 2)).unwrap();

    let ctx = context(a.as_raw_fd());
    let (cell, v) = receive_cell(8);
    assert_eq!(ctx.submit(Direction::Read, &cell, v), Submission::Completed(2));
    assert_eq!(ctx.parked(Direction::Read), 0);
  }

  #[test]
  fn parked_operation_finishes_on_dispatch() {
    let (a, b) = pair();
    let ctx = context(a.as_raw_fd());
    let (cell, v) = receive_cell(8);
    assert_eq!(ctx.submit(Direction::Read, &cell, v), Submission::Pending);

    // Not readable yet: stays parked.
    ctx.binding().dispatch(Readiness::READ);
    assert!(cell.is_pending(v));

    syscall!(write(b.as_raw_fd(), b"abc".as_ptr().cast(), 3)).unwrap();
    ctx.binding().dispatch(Readiness::WRITE);
    assert!(cell.is_pending(v), "write readiness must not touch the read queue");

    ctx.binding().dispatch(Readiness::READ);
    assert_eq!(cell.try_result(v), Some(3));
    assert_eq!(ctx.parked(Direction::Read), 0);
  }

  #[test]
  fn submissions_queue_behind_parked_ones() {
    let (a, b) = pair();
    let ctx = context(a.as_raw_fd());
    let (first, v1) = receive_cell(4);
    let (second, v2) = receive_cell(4);
    assert_eq!(ctx.submit(Direction::Read, &first, v1), Submission::Pending);

    syscall!(write(b.as_raw_fd(), b"x".as_ptr().cast(), 1)).unwrap();
    // Data is available, but FIFO order keeps the second one behind.
    assert_eq!(ctx.submit(Direction::Read, &second, v2), Submission::Pending);

    ctx.binding().dispatch(Readiness::READ);
    assert_eq!(first.try_result(v1), Some(1));
    assert!(second.is_pending(v2));
  }

  #[test]
  fn token_cancel_removes_only_target() {
    let (a, _b) = pair();
    let ctx = context(a.as_raw_fd());
    let (first, v1) = receive_cell(4);
    let (second, v2) = receive_cell(4);
    ctx.submit(Direction::Read, &first, v1);
    ctx.submit(Direction::Read, &second, v2);

    assert!(ctx.cancel_op(&second, v2));
    assert!(!ctx.cancel_op(&second, v2), "second cancel is a no-op");
    assert_eq!(second.try_result(v2), Some(CANCELED));
    assert_eq!(second.cause(), CancelCause::Token);
    assert!(first.is_pending(v1));
  }

  #[test]
  fn cancel_all_closes_binding() {
    let (a, _b) = pair();
    let ctx = context(a.as_raw_fd());
    let (first, v1) = receive_cell(4);
    ctx.submit(Direction::Read, &first, v1);

    assert_eq!(ctx.cancel_all(), 1);
    assert_eq!(first.try_result(v1), Some(CANCELED));
    assert_eq!(first.cause(), CancelCause::Teardown);

    let (late, v2) = receive_cell(4);
    assert_eq!(ctx.submit(Direction::Read, &late, v2), Submission::Completed(CANCELED));
    assert_eq!(late.cause(), CancelCause::Teardown);
    assert_eq!(ctx.cancel_all(), 0);
  }
}
