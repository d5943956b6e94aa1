//! Lazy, once-only association of a descriptor with the reactor.

use std::{
  os::fd::RawFd,
  sync::{
    OnceLock,
    atomic::{AtomicBool, AtomicU8, Ordering},
  },
};

use crate::{
  error::{SocketError, SocketResult},
  reactor::{CompletionContext, Reactor},
  sync::Mutex,
};

const UNKNOWN: u8 = 0;
const SKIP: u8 = 1;
const NOTIFY: u8 = 2;

/// Per socket type (`SOCK_STREAM` = 1 .. `SOCK_SEQPACKET` = 5), whether
/// inline completions may bypass the completion callback.
static SKIP_BY_TYPE: [AtomicU8; 6] = [const { AtomicU8::new(UNKNOWN) }; 6];

fn type_allows_skip(ty: libc::c_int) -> bool {
  let Some(entry) = SKIP_BY_TYPE.get(ty as usize) else {
    return false;
  };
  match entry.load(Ordering::Relaxed) {
    SKIP => true,
    NOTIFY => false,
    _ => {
      // Only types whose non-blocking syscalls finish inline with a final
      // result qualify; anything else keeps the notification path.
      let skip = matches!(ty, libc::SOCK_STREAM | libc::SOCK_DGRAM | libc::SOCK_SEQPACKET);
      entry.store(if skip { SKIP } else { NOTIFY }, Ordering::Relaxed);
      skip
    }
  }
}

/// Binds a descriptor to the reactor at most once and tears the binding
/// down before the descriptor is closed. Never rebinds.
pub(crate) struct CompletionBinder {
  context: OnceLock<CompletionContext>,
  bind_lock: Mutex<()>,
  torn_down: AtomicBool,
  socket_type: libc::c_int,
  connection_oriented: bool,
}

impl CompletionBinder {
  pub fn new(socket_type: libc::c_int, connection_oriented: bool) -> Self {
    Self {
      context: OnceLock::new(),
      bind_lock: Mutex::new(()),
      torn_down: AtomicBool::new(false),
      socket_type,
      connection_oriented,
    }
  }

  /// Returns the context, binding `fd` on first use. Concurrent callers
  /// block on the same lock and all observe the single binding.
  pub fn get_or_bind(&self, fd: RawFd) -> SocketResult<&CompletionContext> {
    if self.torn_down.load(Ordering::Acquire) {
      return Err(SocketError::disposed(self.connection_oriented));
    }
    if let Some(ctx) = self.context.get() {
      return Ok(ctx);
    }

    let _guard = self.bind_lock.lock();
    if self.torn_down.load(Ordering::Acquire) {
      return Err(SocketError::disposed(self.connection_oriented));
    }
    if let Some(ctx) = self.context.get() {
      return Ok(ctx);
    }

    let ctx = Reactor::get()?.register(fd)?;
    Ok(self.context.get_or_init(|| ctx))
  }

  /// The binding if it exists and the handle is still live. Never binds.
  pub fn try_get_without_allocating(&self) -> Option<&CompletionContext> {
    if self.torn_down.load(Ordering::Acquire) {
      return None;
    }
    self.context.get()
  }

  pub fn skip_notification_on_sync_success(&self) -> bool {
    type_allows_skip(self.socket_type)
      && Reactor::get().is_ok_and(|r| r.config().skip_sync_notification)
  }

  /// Cancels every parked operation and removes the epoll registration.
  /// Returns how many operations were cancelled. Idempotent.
  pub fn teardown(&self) -> usize {
    let _guard = self.bind_lock.lock();
    if self.torn_down.swap(true, Ordering::AcqRel) {
      return 0;
    }

    let Some(ctx) = self.context.get() else {
      return 0;
    };
    let cancelled = ctx.cancel_all();
    if let Ok(reactor) = Reactor::get() {
      reactor.deregister(ctx);
    }
    tracing::debug!(fd = ctx.fd(), cancelled, "completion binding torn down");
    cancelled
  }
}
