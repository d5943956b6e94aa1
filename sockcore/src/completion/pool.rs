use std::{
  ptr,
  sync::{
    Arc,
    atomic::{AtomicPtr, Ordering},
  },
};

use super::AwaitableCompletion;

/// Single-entry cache of an idle [`AwaitableCompletion`].
///
/// Each socket keeps one per direction. `acquire` swaps the entry out, so
/// two callers can never receive the same instance; when the pool is
/// empty a fresh instance is allocated. `release` publishes by CAS against
/// null and drops the instance if another one got there first.
pub(crate) struct CompletionPool {
  cached: AtomicPtr<AwaitableCompletion>,
}

impl CompletionPool {
  pub const fn new() -> Self {
    Self { cached: AtomicPtr::new(ptr::null_mut()) }
  }

  /// Returns an idle completion and whether it came from the pool.
  pub fn acquire(&self) -> (Arc<AwaitableCompletion>, bool) {
    let raw = self.cached.swap(ptr::null_mut(), Ordering::AcqRel);
    if raw.is_null() {
      (Arc::new(AwaitableCompletion::new()), false)
    } else {
      // SAFETY: the pointer came from `Arc::into_raw` in `release` and the
      // swap transferred its ownership to us.
      (unsafe { Arc::from_raw(raw) }, true)
    }
  }

  /// Offers an idle completion back. Returns whether it was kept.
  pub fn release(&self, cell: Arc<AwaitableCompletion>) -> bool {
    debug_assert!(cell.is_idle(), "released a busy completion");
    let raw = Arc::into_raw(cell) as *mut AwaitableCompletion;
    match self.cached.compare_exchange(
      ptr::null_mut(),
      raw,
      Ordering::AcqRel,
      Ordering::Acquire,
    ) {
      Ok(_) => true,
      Err(_) => {
        // SAFETY: we still own `raw`; it was never published.
        drop(unsafe { Arc::from_raw(raw) });
        false
      }
    }
  }

  /// Drops the cached instance, if any.
  pub fn drain(&self) {
    let raw = self.cached.swap(ptr::null_mut(), Ordering::AcqRel);
    if !raw.is_null() {
      // SAFETY: as in `acquire`.
      drop(unsafe { Arc::from_raw(raw) });
    }
  }

  #[cfg(test)]
  pub fn is_empty(&self) -> bool {
    self.cached.load(Ordering::Acquire).is_null()
  }
}

impl Drop for CompletionPool {
  fn drop(&mut self) {
    self.drain();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;
  use std::{sync::Barrier, thread};

  #[test]
  fn reuses_released_instance() {
    let pool = CompletionPool::new();
    let (first, pooled) = pool.acquire();
    assert!(!pooled);
    let addr = Arc::as_ptr(&first);

    assert!(pool.release(first));
    let (second, pooled) = pool.acquire();
    assert!(pooled);
    assert_eq!(Arc::as_ptr(&second), addr);
    assert!(pool.is_empty());
  }

  #[test]
  fn second_release_is_dropped() {
    let pool = CompletionPool::new();
    let (a, _) = pool.acquire();
    let (b, _) = pool.acquire();
    let b_weak = Arc::downgrade(&b);

    assert!(pool.release(a));
    assert!(!pool.release(b));
    assert!(b_weak.upgrade().is_none(), "loser must be dropped");
  }

  #[test]
  fn drain_empties() {
    let pool = CompletionPool::new();
    let (a, _) = pool.acquire();
    let weak = Arc::downgrade(&a);
    pool.release(a);
    pool.drain();
    assert!(pool.is_empty());
    assert!(weak.upgrade().is_none());
  }

  #[test]
  fn concurrent_acquirers_get_distinct_instances() {
    let pool = Arc::new(CompletionPool::new());
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
      .map(|_| {
        let pool = pool.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
          let mut seen = Vec::new();
          barrier.wait();
          for _ in 0..200 {
            let (cell, _) = pool.acquire();
            // Holding the Arc keeps the address unique while we check.
            seen.push(Arc::as_ptr(&cell) as usize);
            assert_eq!(Arc::strong_count(&cell), 1);
            if fastrand::bool() {
              pool.release(cell);
            }
          }
          seen.len()
        })
      })
      .collect();

    for h in handles {
      assert_eq!(h.join().unwrap(), 200);
    }
  }

  proptest! {
    #[test]
    fn never_hands_out_a_live_instance(ops in proptest::collection::vec(any::<bool>(), 1..64)) {
      let pool = CompletionPool::new();
      let mut live: Vec<Arc<AwaitableCompletion>> = Vec::new();

      for acquire in ops {
        if acquire || live.is_empty() {
          let (cell, _) = pool.acquire();
          prop_assert!(live.iter().all(|l| !Arc::ptr_eq(l, &cell)));
          live.push(cell);
        } else if let Some(cell) = live.pop() {
          pool.release(cell);
        }
      }
    }
  }
}
