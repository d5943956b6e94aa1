//! Lock used by the binder, the reactor store and completion queues.
//!
//! With the `parking_lot` feature this is `parking_lot::Mutex`; otherwise a
//! thin `std::sync::Mutex` wrapper that ignores poisoning. A panic inside a
//! completion callback must not wedge every later close of the socket.

#[cfg(feature = "parking_lot")]
pub use parking_lot::{Mutex, MutexGuard};

#[cfg(not(feature = "parking_lot"))]
pub use self::std_sync::*;

#[cfg(not(feature = "parking_lot"))]
mod std_sync {
  use std::sync as std_sync;

  /// `std::sync::Mutex` without poisoning.
  #[derive(Default)]
  pub struct Mutex<T: ?Sized> {
    inner: std_sync::Mutex<T>,
  }

  impl<T> Mutex<T> {
    /// An unlocked mutex holding `value`.
    #[inline]
    pub const fn new(value: T) -> Self {
      Self { inner: std_sync::Mutex::new(value) }
    }
  }

  impl<T: ?Sized> Mutex<T> {
    /// Blocks until the lock is held. Poisoning is stripped.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
      MutexGuard { inner: self.inner.lock().unwrap_or_else(|e| e.into_inner()) }
    }
  }

  /// Holds the lock until dropped.
  pub struct MutexGuard<'a, T: ?Sized> {
    inner: std_sync::MutexGuard<'a, T>,
  }

  impl<T: ?Sized> std::ops::Deref for MutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
      &self.inner
    }
  }

  impl<T: ?Sized> std::ops::DerefMut for MutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
      &mut self.inner
    }
  }
}
