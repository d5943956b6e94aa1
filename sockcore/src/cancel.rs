//! Cooperative cancellation tokens.
//!
//! A [`CancellationToken`] is a shared flag plus a list of callbacks. Pending
//! socket operations register a callback through
//! [`Completion::with_cancellation`](crate::Completion::with_cancellation);
//! firing the token removes each of them from its descriptor's queue and
//! resolves it as [`Cancelled`](crate::SocketErrorKind::Cancelled).

use std::sync::{
  Arc, Weak,
  atomic::{AtomicBool, AtomicU64, Ordering},
};

use crate::sync::Mutex;

type Callback = Box<dyn FnOnce() + Send>;

/// Clonable handle to one cancellation signal. Clones observe the same
/// state.
#[derive(Clone, Default)]
pub struct CancellationToken {
  inner: Arc<TokenState>,
}

#[derive(Default)]
struct TokenState {
  cancelled: AtomicBool,
  next_id: AtomicU64,
  callbacks: Mutex<Vec<(u64, Callback)>>,
}

impl std::fmt::Debug for CancellationToken {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CancellationToken")
      .field("cancelled", &self.is_cancelled())
      .finish()
  }
}

impl CancellationToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn is_cancelled(&self) -> bool {
    self.inner.cancelled.load(Ordering::Acquire)
  }

  /// Fires the token. Returns `true` for the call that actually fired it.
  ///
  /// Callbacks run on the calling thread, outside the token's lock.
  pub fn cancel(&self) -> bool {
    if self
      .inner
      .cancelled
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      return false;
    }

    let callbacks = std::mem::take(&mut *self.inner.callbacks.lock());
    for (_, callback) in callbacks {
      callback();
    }
    true
  }

  /// Runs `f` once when the token fires. If it already fired, `f` runs
  /// immediately. Dropping the returned registration unregisters `f`.
  pub(crate) fn register<F>(&self, f: F) -> CancelRegistration
  where
    F: FnOnce() + Send + 'static,
  {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    {
      let mut callbacks = self.inner.callbacks.lock();
      // Checked under the lock so `cancel` either sees our entry or we see
      // its flag.
      if !self.inner.cancelled.load(Ordering::Acquire) {
        callbacks.push((id, Box::new(f)));
        return CancelRegistration { token: Arc::downgrade(&self.inner), id };
      }
    }
    f();
    CancelRegistration { token: Weak::new(), id }
  }
}

/// Keeps a callback registered on a [`CancellationToken`].
pub(crate) struct CancelRegistration {
  token: Weak<TokenState>,
  id: u64,
}

impl Drop for CancelRegistration {
  fn drop(&mut self) {
    if let Some(state) = self.token.upgrade() {
      state.callbacks.lock().retain(|(id, _)| *id != self.id);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  #[test]
  fn fires_once() {
    let token = CancellationToken::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let _reg = token.register(move || {
      h.fetch_add(1, Ordering::SeqCst);
    });

    assert!(token.cancel());
    assert!(!token.cancel());
    assert!(token.clone().is_cancelled());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn dropped_registration_does_not_run() {
    let token = CancellationToken::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    drop(token.register(move || {
      h.fetch_add(1, Ordering::SeqCst);
    }));
    token.cancel();
    assert_eq!(hits.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn late_registration_runs_inline() {
    let token = CancellationToken::new();
    token.cancel();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let _reg = token.register(move || {
      h.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }
}
