//! Asynchronous operations.
//!
//! Every operation validates the socket state, then goes through
//! [`Socket::issue`] with a decoder that turns the raw result back into a
//! typed outcome. Buffers are moved into the operation and handed back
//! with the result.
//!
//! The transfer operations have `*_with_flags` forms taking `MSG_*` bits
//! (`MSG_PEEK`, `MSG_OOB`, `MSG_DONTROUTE`, ...). `MSG_DONTWAIT` is always
//! added, and sends always carry `MSG_NOSIGNAL`.

use std::{
  fs::File,
  mem,
  net::{Shutdown, SocketAddr},
  os::fd::{FromRawFd, OwnedFd, RawFd},
  sync::atomic::Ordering,
};

use socket2::Domain;

use super::{Socket, SocketShared, SocketState};
use crate::{
  completion::{CancelCause, Completion},
  error::{BufResult, SocketErrorKind, SocketResult},
  slot::{OpKind, OperationSlot, PacketInfo},
};

/// A datagram received by [`Socket::receive_message_from`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedMessage {
  pub bytes: usize,
  pub from: SocketAddr,
  /// `msg_flags` reported by the kernel.
  pub flags: i32,
  /// Where the datagram was addressed to, if the kernel reported it.
  pub packet_info: Option<PacketInfo>,
}

impl ReceivedMessage {
  /// The datagram was larger than the buffer's spare capacity.
  pub fn is_truncated(&self) -> bool {
    self.flags & libc::MSG_TRUNC != 0
  }
}

impl Socket {
  /// Accepts one connection. The accepted socket inherits this socket's
  /// shape and starts out bound and connected.
  pub fn accept(&self) -> Completion<SocketResult<(Socket, SocketAddr)>> {
    if let Err(err) = self.check_accept() {
      return Completion::ready(Err(err));
    }
    self.issue(OpKind::Accept, |_| {}, decode_accept)
  }

  /// Connects to `addr`. Resumes a non-blocking connect that is still in
  /// progress.
  pub fn connect(&self, addr: SocketAddr) -> Completion<SocketResult<()>> {
    let resume = match self.check_connect(&addr) {
      Ok(resume) => resume,
      Err(err) => return Completion::ready(Err(err)),
    };
    self.shared.state.insert(SocketState::PENDING_CONNECT);
    tracing::debug!(fd = self.as_raw_fd(), %addr, resume, "connecting");
    self.issue(
      OpKind::Connect,
      |slot| {
        slot.set_remote(addr);
        slot.connect_started = resume;
      },
      decode_connect,
    )
  }

  /// Sends from `buf` once; the count may be short on stream sockets.
  pub fn send(&self, buf: Vec<u8>) -> Completion<BufResult<usize, Vec<u8>>> {
    self.send_from(buf, 0, 0)
  }

  pub fn send_with_flags(
    &self,
    buf: Vec<u8>,
    flags: i32,
  ) -> Completion<BufResult<usize, Vec<u8>>> {
    self.send_from(buf, 0, flags)
  }

  /// Sends `buf[cursor..]` once.
  pub(crate) fn send_from(
    &self,
    buf: Vec<u8>,
    cursor: usize,
    flags: i32,
  ) -> Completion<BufResult<usize, Vec<u8>>> {
    if let Err(err) = self.ensure_live() {
      return Completion::ready((Err(err), buf));
    }
    self.issue(
      OpKind::Send,
      move |slot| {
        slot.buffer = buf;
        slot.cursor = cursor;
        slot.flags = flags;
      },
      decode_buffer,
    )
  }

  /// Sends the whole buffer, issuing as many sends as it takes. On error
  /// the count of bytes already sent is lost but the buffer is returned.
  pub fn send_all(&self, buf: Vec<u8>) -> Completion<BufResult<usize, Vec<u8>>> {
    let socket = self.clone();
    Completion::composed(move |token| async move {
      let mut buf = buf;
      let mut sent = 0;
      while sent < buf.len() {
        let op = socket.send_from(buf, sent, 0).with_cancellation(&token);
        let (res, returned) = op.await;
        buf = returned;
        match res {
          Ok(0) => return (Err(SocketErrorKind::Shutdown.into()), buf),
          Ok(n) => sent += n,
          Err(err) => return (Err(err), buf),
        }
      }
      (Ok(sent), buf)
    })
  }

  /// Sends one datagram to `addr`.
  pub fn send_to(&self, buf: Vec<u8>, addr: SocketAddr) -> Completion<BufResult<usize, Vec<u8>>> {
    self.send_to_with_flags(buf, addr, 0)
  }

  pub fn send_to_with_flags(
    &self,
    buf: Vec<u8>,
    addr: SocketAddr,
    flags: i32,
  ) -> Completion<BufResult<usize, Vec<u8>>> {
    if let Err(err) = self.ensure_live().and_then(|_| self.check_family(&addr)) {
      return Completion::ready((Err(err), buf));
    }
    self.issue(
      OpKind::SendTo,
      move |slot| {
        slot.buffer = buf;
        slot.set_remote(addr);
        slot.flags = flags;
      },
      decode_buffer,
    )
  }

  /// Gather send: the buffers go out in one `sendmsg`, as one datagram on
  /// datagram sockets. `addr` is required on unconnected datagram sockets.
  pub fn send_packets(
    &self,
    bufs: Vec<Vec<u8>>,
    addr: Option<SocketAddr>,
  ) -> Completion<BufResult<usize, Vec<Vec<u8>>>> {
    self.send_packets_with_flags(bufs, addr, 0)
  }

  pub fn send_packets_with_flags(
    &self,
    bufs: Vec<Vec<u8>>,
    addr: Option<SocketAddr>,
    flags: i32,
  ) -> Completion<BufResult<usize, Vec<Vec<u8>>>> {
    let checked = self
      .ensure_live()
      .and_then(|_| addr.as_ref().map_or(Ok(()), |a| self.check_family(a)));
    if let Err(err) = checked {
      return Completion::ready((Err(err), bufs));
    }
    self.issue(
      OpKind::SendPackets,
      move |slot| {
        slot.buffers = bufs;
        slot.flags = flags;
        if let Some(addr) = addr {
          slot.set_remote(addr);
        }
      },
      decode_packets,
    )
  }

  /// Sends up to `count` bytes of `file` starting at `offset`, without
  /// copying through user space. The file's own position is untouched.
  pub fn send_file(&self, file: &File, offset: u64, count: usize) -> Completion<SocketResult<usize>> {
    let file = match self.ensure_live().and_then(|_| Ok(file.try_clone()?)) {
      Ok(file) => file,
      Err(err) => return Completion::ready(Err(err)),
    };
    self.issue(
      OpKind::SendFile,
      move |slot| {
        slot.file = Some(file);
        slot.offset = offset as i64;
        slot.count = count;
      },
      decode_count,
    )
  }

  /// Receives into the spare capacity of `buf`, appending to its contents.
  /// A buffer without spare capacity is rejected, since a zero-byte read
  /// could not be told apart from end of stream.
  pub fn receive(&self, buf: Vec<u8>) -> Completion<BufResult<usize, Vec<u8>>> {
    self.receive_with_flags(buf, 0)
  }

  /// With `MSG_PEEK` the bytes are still appended to `buf` but stay
  /// queued in the socket for the next receive.
  pub fn receive_with_flags(
    &self,
    buf: Vec<u8>,
    flags: i32,
  ) -> Completion<BufResult<usize, Vec<u8>>> {
    if let Err(err) = self.check_receive(buf.capacity() - buf.len(), false) {
      return Completion::ready((Err(err), buf));
    }
    self.issue(OpKind::Receive, move |slot| stamp_receive(slot, buf, flags), decode_buffer)
  }

  /// Receives one datagram and its source address.
  pub fn receive_from(&self, buf: Vec<u8>) -> Completion<BufResult<(usize, SocketAddr), Vec<u8>>> {
    self.receive_from_with_flags(buf, 0)
  }

  pub fn receive_from_with_flags(
    &self,
    buf: Vec<u8>,
    flags: i32,
  ) -> Completion<BufResult<(usize, SocketAddr), Vec<u8>>> {
    if let Err(err) = self.check_receive(buf.capacity() - buf.len(), true) {
      return Completion::ready((Err(err), buf));
    }
    self.issue(OpKind::ReceiveFrom, move |slot| stamp_receive(slot, buf, flags), decode_from)
  }

  /// Like [`receive_from`](Self::receive_from), also reporting message
  /// flags and the local address the datagram was sent to.
  pub fn receive_message_from(
    &self,
    buf: Vec<u8>,
  ) -> Completion<BufResult<ReceivedMessage, Vec<u8>>> {
    self.receive_message_from_with_flags(buf, 0)
  }

  pub fn receive_message_from_with_flags(
    &self,
    buf: Vec<u8>,
    flags: i32,
  ) -> Completion<BufResult<ReceivedMessage, Vec<u8>>> {
    let checked = self
      .check_receive(buf.capacity() - buf.len(), true)
      .and_then(|_| self.enable_packet_info());
    if let Err(err) = checked {
      return Completion::ready((Err(err), buf));
    }
    self.issue(
      OpKind::ReceiveMessageFrom,
      move |slot| stamp_receive(slot, buf, flags),
      decode_message,
    )
  }

  /// Shuts both directions of a connected stream socket. The socket
  /// cannot be reconnected afterwards.
  pub fn disconnect(&self) -> Completion<SocketResult<()>> {
    Completion::ready(self.disconnect_now())
  }

  fn disconnect_now(&self) -> SocketResult<()> {
    let handle = self.acquire()?;
    if !self.shared.shape.is_connection_oriented() {
      return Err(SocketErrorKind::InvalidState.into());
    }
    if !self.shared.state.contains(SocketState::CONNECTED) {
      return Err(SocketErrorKind::NotConnected.into());
    }
    handle.sock().shutdown(Shutdown::Both)?;
    self.shared.state.transition(SocketState::DISCONNECTED, SocketState::CONNECTED);
    tracing::debug!(fd = handle.fd(), "disconnected");
    Ok(())
  }

  pub(crate) fn check_accept(&self) -> SocketResult<()> {
    self.ensure_live()?;
    if !self.shared.shape.is_connection_oriented() {
      return Err(SocketErrorKind::OperationNotSupported.into());
    }
    if !self.shared.state.contains(SocketState::LISTENING | SocketState::BOUND) {
      return Err(SocketErrorKind::InvalidState.into());
    }
    Ok(())
  }

  /// Validates a connect and reports whether it resumes one in progress.
  pub(crate) fn check_connect(&self, addr: &SocketAddr) -> SocketResult<bool> {
    self.ensure_live()?;
    self.check_family(addr)?;
    let state = &self.shared.state;
    if self.shared.shape.is_connection_oriented()
      && state.intersects(SocketState::CONNECTED | SocketState::LISTENING | SocketState::DISCONNECTED)
    {
      return Err(SocketErrorKind::InvalidState.into());
    }
    Ok(state.contains(SocketState::PENDING_CONNECT))
  }

  pub(crate) fn check_receive(&self, spare: usize, datagram: bool) -> SocketResult<()> {
    self.ensure_live()?;
    if spare == 0 {
      return Err(SocketErrorKind::ArgumentInvalid.into());
    }
    // An unbound datagram socket has no address to receive on.
    if datagram
      && !self.shared.shape.is_connection_oriented()
      && !self.shared.state.contains(SocketState::BOUND)
    {
      return Err(SocketErrorKind::InvalidState.into());
    }
    Ok(())
  }

  fn enable_packet_info(&self) -> SocketResult<()> {
    if self.shared.pktinfo.load(Ordering::Acquire) {
      return Ok(());
    }
    let handle = self.acquire()?;
    let (level, name) = match self.shared.shape.domain {
      Domain::IPV4 => (libc::IPPROTO_IP, libc::IP_PKTINFO),
      Domain::IPV6 => (libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO),
      _ => return Err(SocketErrorKind::AddressFamilyNotSupported.into()),
    };
    let on: libc::c_int = 1;
    syscall!(setsockopt(
      handle.fd(),
      level,
      name,
      (&on as *const libc::c_int).cast(),
      mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))?;
    self.shared.pktinfo.store(true, Ordering::Release);
    Ok(())
  }
}

fn stamp_receive(slot: &mut OperationSlot, buf: Vec<u8>, flags: i32) {
  slot.buffer = buf;
  slot.flags = flags;
}

fn decode_accept(
  socket: &SocketShared,
  slot: &mut OperationSlot,
  res: isize,
  cause: CancelCause,
) -> SocketResult<(Socket, SocketAddr)> {
  let fd = socket.outcome(OpKind::Accept, res, cause)? as RawFd;
  // SAFETY: accept4 returned a fresh descriptor nothing else owns.
  let fd = unsafe { OwnedFd::from_raw_fd(fd) };
  let peer = slot.remote()?;
  let bits = SocketState::BOUND | SocketState::CONNECTED | SocketState::BLOCKING;
  tracing::debug!(listener = socket.guard.fd(), %peer, "accepted");
  Ok((Socket::from_parts(fd, socket.shape, bits), peer))
}

fn decode_connect(
  socket: &SocketShared,
  slot: &mut OperationSlot,
  res: isize,
  cause: CancelCause,
) -> SocketResult<()> {
  match socket.outcome(OpKind::Connect, res, cause) {
    Ok(_) => {
      socket
        .state
        .transition(SocketState::CONNECTED | SocketState::BOUND, SocketState::PENDING_CONNECT);
      tracing::debug!(fd = socket.guard.fd(), peer = ?slot.remote().ok(), "connected");
      Ok(())
    }
    Err(err) => {
      socket.state.remove(SocketState::PENDING_CONNECT);
      Err(err)
    }
  }
}

fn decode_buffer(
  socket: &SocketShared,
  slot: &mut OperationSlot,
  res: isize,
  cause: CancelCause,
) -> BufResult<usize, Vec<u8>> {
  (socket.outcome(slot.kind, res, cause), mem::take(&mut slot.buffer))
}

fn decode_packets(
  socket: &SocketShared,
  slot: &mut OperationSlot,
  res: isize,
  cause: CancelCause,
) -> BufResult<usize, Vec<Vec<u8>>> {
  (socket.outcome(slot.kind, res, cause), mem::take(&mut slot.buffers))
}

fn decode_count(
  socket: &SocketShared,
  slot: &mut OperationSlot,
  res: isize,
  cause: CancelCause,
) -> SocketResult<usize> {
  socket.outcome(slot.kind, res, cause)
}

fn decode_from(
  socket: &SocketShared,
  slot: &mut OperationSlot,
  res: isize,
  cause: CancelCause,
) -> BufResult<(usize, SocketAddr), Vec<u8>> {
  let out = socket
    .outcome(slot.kind, res, cause)
    .and_then(|n| Ok((n, slot.remote()?)));
  (out, mem::take(&mut slot.buffer))
}

fn decode_message(
  socket: &SocketShared,
  slot: &mut OperationSlot,
  res: isize,
  cause: CancelCause,
) -> BufResult<ReceivedMessage, Vec<u8>> {
  let out = socket.outcome(slot.kind, res, cause).and_then(|bytes| {
    Ok(ReceivedMessage {
      bytes,
      from: slot.remote()?,
      flags: slot.msg_flags,
      packet_info: slot.packet_info(),
    })
  });
  (out, mem::take(&mut slot.buffer))
}
