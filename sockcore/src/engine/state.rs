use std::sync::atomic::{AtomicU32, Ordering};

use socket2::{Domain, Protocol, Type};

/// The immutable kind of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketShape {
  pub domain: Domain,
  pub ty: Type,
  pub protocol: Option<Protocol>,
}

impl SocketShape {
  pub const fn new(domain: Domain, ty: Type, protocol: Option<Protocol>) -> Self {
    Self { domain, ty, protocol }
  }

  /// Stream and sequenced-packet sockets.
  pub fn is_connection_oriented(&self) -> bool {
    self.ty == Type::STREAM || self.ty == Type::SEQPACKET
  }

  pub(crate) fn raw_type(&self) -> libc::c_int {
    self.ty.into()
  }
}

/// Lifecycle flags of a socket.
///
/// `Created -> [Bound] -> {Listening | PendingConnect -> Connected} ->
/// Disconnected`, with `Disposed` reachable from anywhere.
#[derive(Debug, Default)]
pub(crate) struct SocketState {
  bits: AtomicU32,
}

impl SocketState {
  pub const BOUND: u32 = 1 << 0;
  pub const LISTENING: u32 = 1 << 1;
  pub const CONNECTED: u32 = 1 << 2;
  pub const DISCONNECTED: u32 = 1 << 3;
  /// Synchronous calls wait for completion instead of failing with
  /// `WouldBlock`.
  pub const BLOCKING: u32 = 1 << 4;
  pub const PENDING_CONNECT: u32 = 1 << 5;
  pub const DISPOSED: u32 = 1 << 6;

  pub fn new(bits: u32) -> Self {
    Self { bits: AtomicU32::new(bits) }
  }

  pub fn load(&self) -> u32 {
    self.bits.load(Ordering::Acquire)
  }

  pub fn contains(&self, flags: u32) -> bool {
    self.load() & flags == flags
  }

  pub fn intersects(&self, flags: u32) -> bool {
    self.load() & flags != 0
  }

  /// Sets `flags`, returning the previous bits.
  pub fn insert(&self, flags: u32) -> u32 {
    self.bits.fetch_or(flags, Ordering::AcqRel)
  }

  pub fn remove(&self, flags: u32) -> u32 {
    self.bits.fetch_and(!flags, Ordering::AcqRel)
  }

  /// Sets `set` and clears `clear` in one step.
  pub fn transition(&self, set: u32, clear: u32) {
    let _ = self
      .bits
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| Some((bits | set) & !clear));
  }

  pub fn is_disposed(&self) -> bool {
    self.contains(Self::DISPOSED)
  }
}
