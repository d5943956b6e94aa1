//! Synchronous surface.
//!
//! In blocking mode each call issues the asynchronous operation and waits
//! for it. In non-blocking mode each call makes exactly one attempt and
//! reports [`SocketErrorKind::WouldBlock`] instead of waiting.

use std::{
  net::SocketAddr,
  os::fd::{FromRawFd, OwnedFd},
};

use super::{Socket, SocketState};
use crate::{
  error::{SocketError, SocketErrorKind, SocketResult},
  net_utils,
};

const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;

fn in_progress(err: std::io::Error) -> SocketError {
  match err.raw_os_error() {
    Some(libc::EINPROGRESS) => {
      SocketError::new(SocketErrorKind::WouldBlock).with_raw(Some(libc::EINPROGRESS))
    }
    _ => err.into(),
  }
}

impl Socket {
  pub fn send_sync(&self, buf: &[u8]) -> SocketResult<usize> {
    if self.is_blocking() {
      return self.send(buf.to_vec()).wait().0;
    }
    let handle = self.acquire()?;
    let n = syscall!(send(handle.fd(), buf.as_ptr().cast(), buf.len(), SEND_FLAGS))?;
    Ok(n as usize)
  }

  pub fn send_to_sync(&self, buf: &[u8], addr: SocketAddr) -> SocketResult<usize> {
    if self.is_blocking() {
      return self.send_to(buf.to_vec(), addr).wait().0;
    }
    self.check_family(&addr)?;
    let handle = self.acquire()?;
    let (storage, len) = net_utils::socketaddr_into_storage(addr);
    let n = syscall!(sendto(
      handle.fd(),
      buf.as_ptr().cast(),
      buf.len(),
      SEND_FLAGS,
      (&storage as *const libc::sockaddr_storage).cast(),
      len,
    ))?;
    Ok(n as usize)
  }

  /// Reads into `buf`, returning the number of bytes read. Zero means end
  /// of stream on stream sockets.
  pub fn receive_sync(&self, buf: &mut [u8]) -> SocketResult<usize> {
    if self.is_blocking() {
      let (res, filled) = self.receive(Vec::with_capacity(buf.len())).wait();
      let n = res?;
      buf[..n].copy_from_slice(&filled[..n]);
      return Ok(n);
    }
    self.check_receive(buf.len(), false)?;
    let handle = self.acquire()?;
    let n = syscall!(recv(handle.fd(), buf.as_mut_ptr().cast(), buf.len(), libc::MSG_DONTWAIT))?;
    Ok(n as usize)
  }

  pub fn receive_from_sync(&self, buf: &mut [u8]) -> SocketResult<(usize, SocketAddr)> {
    if self.is_blocking() {
      let (res, filled) = self.receive_from(Vec::with_capacity(buf.len())).wait();
      let (n, from) = res?;
      buf[..n].copy_from_slice(&filled[..n]);
      return Ok((n, from));
    }
    self.check_receive(buf.len(), true)?;
    let handle = self.acquire()?;
    let (mut storage, mut len) = net_utils::empty_storage();
    let n = syscall!(recvfrom(
      handle.fd(),
      buf.as_mut_ptr().cast(),
      buf.len(),
      libc::MSG_DONTWAIT,
      (&mut storage as *mut libc::sockaddr_storage).cast(),
      &mut len,
    ))?;
    Ok((n as usize, net_utils::storage_into_socketaddr(&storage, len)?))
  }

  pub fn accept_sync(&self) -> SocketResult<(Socket, SocketAddr)> {
    if self.is_blocking() {
      return self.accept().wait();
    }
    self.check_accept()?;
    let handle = self.acquire()?;
    let (mut storage, mut len) = net_utils::empty_storage();
    let fd = syscall!(accept4(
      handle.fd(),
      (&mut storage as *mut libc::sockaddr_storage).cast(),
      &mut len,
      libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))?;
    // SAFETY: accept4 returned a fresh descriptor nothing else owns.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    let peer = net_utils::storage_into_socketaddr(&storage, len)?;
    let bits = SocketState::BOUND | SocketState::CONNECTED | SocketState::BLOCKING;
    Ok((Socket::from_parts(fd, self.shared.shape, bits), peer))
  }

  /// Connects to `addr`. In non-blocking mode a connect that cannot finish
  /// immediately fails with `WouldBlock` and stays pending; call again (or
  /// check [`is_connected`](Self::is_connected)) to learn the outcome.
  pub fn connect_sync(&self, addr: SocketAddr) -> SocketResult<()> {
    if self.is_blocking() {
      return self.connect(addr).wait();
    }
    if self.check_connect(&addr)? {
      return match self.poll_pending_connect()? {
        true => Ok(()),
        false => Err(SocketErrorKind::WouldBlock.into()),
      };
    }

    let handle = self.acquire()?;
    let (storage, len) = net_utils::socketaddr_into_storage(addr);
    let res = syscall!(connect(
      handle.fd(),
      (&storage as *const libc::sockaddr_storage).cast(),
      len,
    ));
    match res {
      Ok(_) => {
        self.shared.state.insert(SocketState::CONNECTED | SocketState::BOUND);
        tracing::debug!(fd = handle.fd(), %addr, "connected");
        Ok(())
      }
      Err(err) => {
        if err.raw_os_error() == Some(libc::EINPROGRESS) {
          self.shared.state.insert(SocketState::PENDING_CONNECT | SocketState::BOUND);
          tracing::debug!(fd = handle.fd(), %addr, "connect in progress");
        }
        Err(in_progress(err))
      }
    }
  }

  /// Checks on a connect left in progress. `Ok(true)` once connected,
  /// `Ok(false)` while still in flight.
  pub(crate) fn poll_pending_connect(&self) -> SocketResult<bool> {
    let handle = self.acquire()?;
    if let Some(err) = handle.sock().take_error()? {
      self.shared.state.remove(SocketState::PENDING_CONNECT);
      return Err(err.into());
    }
    match handle.sock().peer_addr() {
      Ok(_) => {
        self
          .shared
          .state
          .transition(SocketState::CONNECTED | SocketState::BOUND, SocketState::PENDING_CONNECT);
        Ok(true)
      }
      Err(err) if err.raw_os_error() == Some(libc::ENOTCONN) => Ok(false),
      Err(err) => Err(err.into()),
    }
  }
}
