//! The process-wide completion dispatcher.
//!
//! Linux has no completion port, so one is emulated: every socket that
//! issues an asynchronous operation is registered once, edge-triggered,
//! with a single epoll instance. A dedicated thread waits on it and, for
//! each readiness event, finishes the operations parked on that socket's
//! [`CompletionContext`]. Completion callbacks and wakers therefore run on
//! the reactor thread.

mod context;
mod epoll;
mod interest;
mod store;

pub(crate) use context::{CompletionContext, Submission};
pub(crate) use interest::Direction;

use std::{
  cell::Cell,
  io,
  os::fd::RawFd,
  ptr,
  sync::{
    Arc,
    atomic::{AtomicPtr, Ordering},
  },
  thread,
};

use context::Binding;
use epoll::Epoll;
use interest::Readiness;
use store::Store;

use crate::{config::EngineConfig, error::SocketResult, sync::Mutex};

/// Error returned by [`try_init`](crate::try_init).
#[derive(Debug, thiserror::Error)]
pub enum TryInitError {
  #[error("sockcore is already initialised")]
  AlreadyInit,
  #[error("failed to start the reactor: {0}")]
  Io(#[from] io::Error),
}

pub(crate) struct Reactor {
  epoll: Epoll,
  bindings: Mutex<Store<Arc<Binding>>>,
  config: EngineConfig,
}

static REACTOR: AtomicPtr<Reactor> = AtomicPtr::new(ptr::null_mut());

thread_local! {
  static ON_DISPATCH: Cell<bool> = const { Cell::new(false) };
}

/// Whether the caller is running on the reactor thread, i.e. inside a
/// completion callback or a waker. Nothing here may block for long.
pub(crate) fn on_dispatch_thread() -> bool {
  ON_DISPATCH.with(Cell::get)
}

impl Reactor {
  fn new(config: EngineConfig) -> io::Result<Self> {
    Ok(Self {
      epoll: Epoll::new()?,
      bindings: Mutex::new(Store::with_capacity(64)),
      config,
    })
  }

  /// Installs the reactor and starts its thread. Only the first call wins.
  pub(crate) fn try_init(config: EngineConfig) -> Result<&'static Reactor, TryInitError> {
    if !REACTOR.load(Ordering::Acquire).is_null() {
      return Err(TryInitError::AlreadyInit);
    }

    let thread_name = config.thread_name.clone();
    let raw = Box::into_raw(Box::new(Reactor::new(config)?));
    // SAFETY: freed below only after the dispatch thread has exited.
    let reactor: &'static Reactor = unsafe { &*raw };

    // The thread exists before the pointer is published, so an installed
    // reactor always has a dispatcher. It idles until told which way the
    // install went.
    let (start_tx, start_rx) = crossbeam_channel::bounded::<bool>(1);
    let spawned = thread::Builder::new().name(thread_name).spawn(move || {
      if matches!(start_rx.recv(), Ok(true)) {
        reactor.run();
      }
    });
    let handle = match spawned {
      Ok(handle) => handle,
      Err(err) => {
        // SAFETY: never shared; no thread holds it.
        drop(unsafe { Box::from_raw(raw) });
        return Err(err.into());
      }
    };

    if REACTOR
      .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      // Another thread installed one first; ours was never shared.
      let _ = start_tx.send(false);
      let _ = handle.join();
      // SAFETY: `raw` came from Box::into_raw above and its thread is gone.
      drop(unsafe { Box::from_raw(raw) });
      return Err(TryInitError::AlreadyInit);
    }

    let _ = start_tx.send(true);
    tracing::debug!(
      event_capacity = reactor.config.event_capacity,
      "reactor started"
    );
    Ok(reactor)
  }

  /// The installed reactor, starting one with default settings if needed.
  pub(crate) fn get() -> SocketResult<&'static Reactor> {
    let raw = REACTOR.load(Ordering::Acquire);
    if !raw.is_null() {
      // SAFETY: installed pointers stay valid for the process lifetime.
      return Ok(unsafe { &*raw });
    }

    match Self::try_init(EngineConfig::default()) {
      Ok(reactor) => Ok(reactor),
      Err(TryInitError::AlreadyInit) => {
        // SAFETY: AlreadyInit means a pointer was installed.
        Ok(unsafe { &*REACTOR.load(Ordering::Acquire) })
      }
      Err(TryInitError::Io(err)) => Err(err.into()),
    }
  }

  pub(crate) fn config(&self) -> &EngineConfig {
    &self.config
  }

  /// Registers `fd` for both directions and returns its context.
  pub(crate) fn register(&self, fd: RawFd) -> SocketResult<CompletionContext> {
    let binding = Arc::new(Binding::new(fd));
    let key = self.bindings.lock().insert(binding.clone());

    if let Err(err) = self.epoll.add(fd, key) {
      self.bindings.lock().remove(key);
      return Err(err.into());
    }

    tracing::debug!(fd, key, "bound descriptor to reactor");
    Ok(CompletionContext::new(binding, key))
  }

  /// Removes the registration. Must run before the descriptor is closed.
  pub(crate) fn deregister(&self, ctx: &CompletionContext) {
    let (fd, key) = (ctx.fd(), ctx.key());
    if let Err(err) = self.epoll.delete(fd) {
      tracing::trace!(fd, %err, "epoll delete failed");
    }
    self.bindings.lock().remove(key);
    tracing::debug!(fd, key, "unbound descriptor");
  }

  fn run(&'static self) {
    ON_DISPATCH.with(|on| on.set(true));
    let empty = libc::epoll_event { events: 0, u64: 0 };
    let mut events = vec![empty; self.config.event_capacity];
    let mut ready = Vec::with_capacity(self.config.event_capacity);

    loop {
      let n = match self.epoll.wait(&mut events, None) {
        Ok(n) => n,
        Err(err) => {
          tracing::warn!(%err, "epoll_wait failed");
          continue;
        }
      };

      {
        let bindings = self.bindings.lock();
        for event in &events[..n] {
          let event = *event;
          let (key, flags) = (event.u64, event.events);
          let readiness = Readiness::from_epoll(flags);
          if readiness.is_none() {
            continue;
          }
          match bindings.get(key) {
            Some(binding) => ready.push((binding.clone(), readiness)),
            None => tracing::trace!(key, "dropping event for stale binding"),
          }
        }
      }

      for (binding, readiness) in ready.drain(..) {
        binding.dispatch(readiness);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{completion::AwaitableCompletion, slot::OpKind};
  use std::{
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    time::{Duration, Instant},
  };

  #[test]
  fn get_is_stable() {
    let a = Reactor::get().unwrap() as *const Reactor;
    let b = Reactor::get().unwrap() as *const Reactor;
    assert_eq!(a, b);
    assert!(matches!(
      Reactor::try_init(EngineConfig::default()),
      Err(TryInitError::AlreadyInit)
    ));
  }

  #[test]
  fn racing_inits_leave_one_running_reactor() {
    let racers: Vec<_> = (0..8)
      .map(|_| {
        thread::spawn(|| {
          Reactor::try_init(EngineConfig::default()).map(|r| r as *const Reactor as usize)
        })
      })
      .collect();
    let won: Vec<_> = racers.into_iter().filter_map(|h| h.join().unwrap().ok()).collect();
    assert!(won.len() <= 1);

    let installed = Reactor::get().unwrap();
    if let Some(addr) = won.first() {
      assert_eq!(*addr, installed as *const Reactor as usize);
    }

    // The installed reactor dispatches: a parked read finishes once data arrives.
    let mut fds = [0; 2];
    syscall!(socketpair(
      libc::AF_UNIX,
      libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
      0,
      fds.as_mut_ptr()
    ))
    .unwrap();
    let (a, b) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    let ctx = installed.register(a.as_raw_fd()).unwrap();
    let cell = Arc::new(AwaitableCompletion::new());
    let version = cell.begin();
    let slot = unsafe { cell.slot_mut() };
    slot.prepare(OpKind::Receive);
    slot.buffer = Vec::with_capacity(4);
    assert_eq!(ctx.submit(Direction::Read, &cell, version), Submission::Pending);

    syscall!(write(b.as_raw_fd(), b"go".as_ptr().cast(), 2)).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while cell.is_pending(version) {
      assert!(Instant::now() < deadline, "reactor never dispatched");
      thread::sleep(Duration::from_millis(1));
    }
    installed.deregister(&ctx);
  }
}
