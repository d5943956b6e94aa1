//! Versioned, reusable completion cells.
//!
//! An [`AwaitableCompletion`] is the meeting point of exactly one producer
//! (whoever finishes the syscall: the submitting thread or the reactor)
//! and one consumer (the [`Completion`] future). Everything is driven by a
//! single atomic word holding `version << 2 | phase`:
//!
//! ```text
//! Idle --begin--> Pending --complete(v)--> Completing --> Complete --reset--> Idle
//! ```
//!
//! `complete` only succeeds for the version that is currently pending, so
//! a late callback for a cell that has since been reset and reused is
//! rejected instead of clobbering the new operation.

mod future;
mod pool;

pub use future::{Completion, Receiver};
pub(crate) use future::OpWait;
pub(crate) use pool::CompletionPool;

use std::{
  cell::UnsafeCell,
  sync::atomic::{AtomicU8, AtomicU64, Ordering},
  task::{Context, Poll},
};

use futures_util::task::AtomicWaker;

use crate::slot::OperationSlot;

const IDLE: u64 = 0;
const PENDING: u64 = 1;
const COMPLETING: u64 = 2;
const COMPLETE: u64 = 3;
const PHASE_MASK: u64 = 0b11;
const VERSION_MASK: u64 = u64::MAX >> 2;

const fn pack(version: u64, phase: u64) -> u64 {
  (version << 2) | phase
}

/// Why an operation was resolved with `ECANCELED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum CancelCause {
  None = 0,
  /// The caller's [`CancellationToken`](crate::CancellationToken) fired.
  Token = 1,
  /// The socket was disposed while the operation was parked.
  Teardown = 2,
}

impl CancelCause {
  const fn from_u8(v: u8) -> Self {
    match v {
      1 => Self::Token,
      2 => Self::Teardown,
      _ => Self::None,
    }
  }
}

pub(crate) struct AwaitableCompletion {
  state: AtomicU64,
  waker: AtomicWaker,
  cause: AtomicU8,
  result: UnsafeCell<isize>,
  slot: UnsafeCell<OperationSlot>,
}

// SAFETY: `result` is written only by the thread that won the
// Pending -> Completing transition and read only after Complete is
// observed with Acquire. `slot` is touched by the issuer while the cell is
// not queued, and by whoever holds the binding's queue lock while it is.
unsafe impl Send for AwaitableCompletion {}
unsafe impl Sync for AwaitableCompletion {}

impl AwaitableCompletion {
  pub fn new() -> Self {
    Self {
      state: AtomicU64::new(pack(0, IDLE)),
      waker: AtomicWaker::new(),
      cause: AtomicU8::new(CancelCause::None as u8),
      result: UnsafeCell::new(0),
      slot: UnsafeCell::new(OperationSlot::new()),
    }
  }

  /// Moves an idle cell to pending under a fresh version and returns it.
  pub fn begin(&self) -> u64 {
    let current = self.state.load(Ordering::Acquire);
    debug_assert_eq!(current & PHASE_MASK, IDLE, "begin on a busy completion");
    let version = ((current >> 2) + 1) & VERSION_MASK;
    self.cause.store(CancelCause::None as u8, Ordering::Relaxed);
    self.state.store(pack(version, PENDING), Ordering::Release);
    version
  }

  /// Publishes `res` for `version`. Returns `false` if that version is not
  /// the pending one (stale or already completed).
  pub fn complete(&self, version: u64, res: isize) -> bool {
    if self
      .state
      .compare_exchange(
        pack(version, PENDING),
        pack(version, COMPLETING),
        Ordering::AcqRel,
        Ordering::Acquire,
      )
      .is_err()
    {
      tracing::trace!(version, "rejected stale completion");
      return false;
    }

    // SAFETY: winning the CAS gives exclusive write access to `result`.
    unsafe { *self.result.get() = res };
    self.state.store(pack(version, COMPLETE), Ordering::Release);
    self.waker.wake();
    true
  }

  pub fn try_result(&self, version: u64) -> Option<isize> {
    if self.state.load(Ordering::Acquire) == pack(version, COMPLETE) {
      // SAFETY: Complete was observed with Acquire; the write happened
      // before the Release store.
      Some(unsafe { *self.result.get() })
    } else {
      None
    }
  }

  pub fn poll_result(&self, version: u64, cx: &mut Context<'_>) -> Poll<isize> {
    if let Some(res) = self.try_result(version) {
      return Poll::Ready(res);
    }
    self.waker.register(cx.waker());
    match self.try_result(version) {
      Some(res) => Poll::Ready(res),
      None => Poll::Pending,
    }
  }

  pub fn is_pending(&self, version: u64) -> bool {
    self.state.load(Ordering::Acquire) == pack(version, PENDING)
  }

  pub fn set_cause(&self, cause: CancelCause) {
    self.cause.store(cause as u8, Ordering::Relaxed);
  }

  pub fn cause(&self) -> CancelCause {
    CancelCause::from_u8(self.cause.load(Ordering::Relaxed))
  }

  /// # Safety
  ///
  /// The caller must have exclusive access to the slot: either it issued
  /// the current operation and the cell is not queued on any binding, or
  /// it holds the queue lock of the binding the cell is parked on.
  #[allow(clippy::mut_from_ref)]
  pub unsafe fn slot_mut(&self) -> &mut OperationSlot {
    // SAFETY: upheld by the caller.
    unsafe { &mut *self.slot.get() }
  }

  /// Returns a completed cell to idle, keeping its version so that any
  /// straggling `complete` for it is rejected.
  ///
  /// # Safety
  ///
  /// The cell must be complete and the caller must be its only consumer.
  pub unsafe fn reset(&self) {
    let current = self.state.load(Ordering::Acquire);
    debug_assert_eq!(current & PHASE_MASK, COMPLETE, "reset of an unfinished completion");
    // SAFETY: upheld by the caller.
    unsafe { self.slot_mut() }.reset();
    // A waker registered by the last consumer must not fire for the next.
    drop(self.waker.take());
    self.cause.store(CancelCause::None as u8, Ordering::Relaxed);
    self.state.store(pack(current >> 2, IDLE), Ordering::Release);
  }

  pub fn is_idle(&self) -> bool {
    self.state.load(Ordering::Acquire) & PHASE_MASK == IDLE
  }
}

impl Drop for AwaitableCompletion {
  fn drop(&mut self) {
    if *self.state.get_mut() & PHASE_MASK == COMPLETE {
      let res = *self.result.get_mut();
      self.slot.get_mut().discard(res);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{
    sync::{Arc, mpsc},
    task::{Wake, Waker},
    thread,
  };

  struct Flag(mpsc::Sender<()>);

  impl Wake for Flag {
    fn wake(self: Arc<Self>) {
      let _ = self.0.send(());
    }
  }

  #[test]
  fn completes_once_per_version() {
    let cell = AwaitableCompletion::new();
    let v = cell.begin();
    assert!(cell.is_pending(v));
    assert!(cell.complete(v, 7));
    assert!(!cell.complete(v, 8), "second completion must be rejected");
    assert_eq!(cell.try_result(v), Some(7));
  }

  #[test]
  fn stale_version_is_rejected_after_reuse() {
    let cell = AwaitableCompletion::new();
    let old = cell.begin();
    assert!(cell.complete(old, 1));
    unsafe { cell.reset() };
    assert!(cell.is_idle());

    let new = cell.begin();
    assert_ne!(old, new);
    assert!(!cell.complete(old, 99));
    assert!(cell.is_pending(new));
    assert!(cell.complete(new, 2));
    assert_eq!(cell.try_result(new), Some(2));
    assert_eq!(cell.try_result(old), None);
  }

  #[test]
  fn waker_fires_from_other_thread() {
    let cell = Arc::new(AwaitableCompletion::new());
    let v = cell.begin();

    let (tx, rx) = mpsc::channel();
    let waker = Waker::from(Arc::new(Flag(tx)));
    let mut cx = Context::from_waker(&waker);
    assert!(cell.poll_result(v, &mut cx).is_pending());

    let producer = cell.clone();
    thread::spawn(move || assert!(producer.complete(v, 5))).join().unwrap();

    rx.recv().unwrap();
    assert_eq!(cell.poll_result(v, &mut cx), Poll::Ready(5));
  }

  #[test]
  fn cause_is_cleared_by_begin() {
    let cell = AwaitableCompletion::new();
    let v = cell.begin();
    cell.set_cause(CancelCause::Token);
    cell.complete(v, -(libc::ECANCELED as isize));
    assert_eq!(cell.cause(), CancelCause::Token);
    unsafe { cell.reset() };
    cell.begin();
    assert_eq!(cell.cause(), CancelCause::None);
  }
}
