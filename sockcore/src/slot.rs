//! Per-operation native state.
//!
//! An [`OperationSlot`] lives inside an
//! [`AwaitableCompletion`](crate::completion::AwaitableCompletion) and is
//! reset, never reallocated, between uses. It owns everything the kernel
//! may touch while the operation is outstanding: the caller's buffer, the
//! address scratch, the control-message area. Nothing else may alias
//! those while the operation is parked.

use std::{
  fs::File,
  mem,
  net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
  os::fd::{AsRawFd, RawFd},
};

use crate::{error::SocketResult, net_utils, reactor::Direction};

/// Room for one `IP_PKTINFO` or `IPV6_PKTINFO` control message.
const CONTROL_LEN: usize = 64;

const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
const RECV_FLAGS: libc::c_int = libc::MSG_DONTWAIT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
  Accept,
  Connect,
  Send,
  SendTo,
  /// Gather send of several buffers in one `sendmsg`.
  SendPackets,
  SendFile,
  Receive,
  ReceiveFrom,
  ReceiveMessageFrom,
}

impl OpKind {
  pub const fn direction(self) -> Direction {
    match self {
      Self::Accept | Self::Receive | Self::ReceiveFrom | Self::ReceiveMessageFrom => {
        Direction::Read
      }
      Self::Connect
      | Self::Send
      | Self::SendTo
      | Self::SendPackets
      | Self::SendFile => Direction::Write,
    }
  }
}

/// Whether a raw result means "not finished, wait for readiness".
pub(crate) const fn would_block(res: isize) -> bool {
  res == -(libc::EAGAIN as isize)
    || res == -(libc::EINPROGRESS as isize)
    || res == -(libc::EALREADY as isize)
}

/// Local destination of a datagram, as reported by `IP_PKTINFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
  /// Address the datagram was sent to.
  pub address: IpAddr,
  /// Index of the interface it arrived on.
  pub interface: u32,
}

pub(crate) struct OperationSlot {
  pub kind: OpKind,
  pub buffer: Vec<u8>,
  /// Send progress into `buffer`.
  pub cursor: usize,
  pub buffers: Vec<Vec<u8>>,
  pub addr: libc::sockaddr_storage,
  pub addr_len: libc::socklen_t,
  control: Vec<u8>,
  control_len: usize,
  pub flags: libc::c_int,
  pub msg_flags: libc::c_int,
  pub file: Option<File>,
  pub offset: i64,
  pub count: usize,
  pub connect_started: bool,
}

impl OperationSlot {
  pub fn new() -> Self {
    let (addr, _) = net_utils::empty_storage();
    Self {
      kind: OpKind::Receive,
      buffer: Vec::new(),
      cursor: 0,
      buffers: Vec::new(),
      addr,
      addr_len: 0,
      control: Vec::new(),
      control_len: 0,
      flags: 0,
      msg_flags: 0,
      file: None,
      offset: 0,
      count: 0,
      connect_started: false,
    }
  }

  /// Stamps the slot for a new operation. Buffers handed to a previous
  /// operation are expected to have been taken already.
  pub fn prepare(&mut self, kind: OpKind) {
    self.kind = kind;
    self.cursor = 0;
    self.addr_len = 0;
    self.control_len = 0;
    self.flags = 0;
    self.msg_flags = 0;
    self.offset = 0;
    self.count = 0;
    self.connect_started = false;
  }

  /// Drops whatever the last operation left behind.
  pub fn reset(&mut self) {
    self.buffer = Vec::new();
    self.buffers.clear();
    self.file = None;
    self.prepare(self.kind);
  }

  pub fn set_remote(&mut self, addr: SocketAddr) {
    let (storage, len) = net_utils::socketaddr_into_storage(addr);
    self.addr = storage;
    self.addr_len = len;
  }

  pub fn remote(&self) -> SocketResult<SocketAddr> {
    net_utils::storage_into_socketaddr(&self.addr, self.addr_len)
  }

  /// Releases what a finished but unobserved operation produced.
  pub fn discard(&mut self, res: isize) {
    if self.kind == OpKind::Accept && res >= 0 {
      // SAFETY: the accepted descriptor was never handed out.
      unsafe { libc::close(res as RawFd) };
    }
  }

  /// Makes one non-blocking attempt. Returns the syscall's value or
  /// `-errno`; see [`would_block`].
  pub fn attempt(&mut self, fd: RawFd) -> isize {
    match self.kind {
      OpKind::Accept => self.accept(fd),
      OpKind::Connect => self.connect(fd),
      OpKind::Send => {
        let rest = &self.buffer[self.cursor.min(self.buffer.len())..];
        syscall!(raw send(fd, rest.as_ptr().cast(), rest.len(), self.flags | SEND_FLAGS))
      }
      OpKind::SendTo => {
        let rest = &self.buffer[self.cursor.min(self.buffer.len())..];
        syscall!(raw sendto(
          fd,
          rest.as_ptr().cast(),
          rest.len(),
          self.flags | SEND_FLAGS,
          (&self.addr as *const libc::sockaddr_storage).cast(),
          self.addr_len,
        ))
      }
      OpKind::SendPackets => self.send_packets(fd),
      OpKind::SendFile => self.send_file(fd),
      OpKind::Receive => {
        let (ptr, spare) = self.spare();
        let res = syscall!(raw recv(fd, ptr.cast(), spare, self.flags | RECV_FLAGS));
        self.commit(res);
        res
      }
      OpKind::ReceiveFrom => {
        let (ptr, spare) = self.spare();
        self.addr_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let res = syscall!(raw recvfrom(
          fd,
          ptr.cast(),
          spare,
          self.flags | RECV_FLAGS,
          (&mut self.addr as *mut libc::sockaddr_storage).cast(),
          &mut self.addr_len,
        ));
        self.commit(res);
        res
      }
      OpKind::ReceiveMessageFrom => self.receive_message(fd),
    }
  }

  fn accept(&mut self, fd: RawFd) -> isize {
    self.addr_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(raw accept4(
      fd,
      (&mut self.addr as *mut libc::sockaddr_storage).cast(),
      &mut self.addr_len,
      libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))
  }

  fn connect(&mut self, fd: RawFd) -> isize {
    if !self.connect_started {
      self.connect_started = true;
      return syscall!(raw connect(
        fd,
        (&self.addr as *const libc::sockaddr_storage).cast(),
        self.addr_len,
      ));
    }

    // Already in flight: the outcome is in SO_ERROR once writable.
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let res = syscall!(raw getsockopt(
      fd,
      libc::SOL_SOCKET,
      libc::SO_ERROR,
      (&mut err as *mut libc::c_int).cast(),
      &mut len,
    ));
    if res < 0 {
      return res;
    }
    if err != 0 {
      return -(err as isize);
    }

    let (mut peer, mut peer_len) = net_utils::empty_storage();
    match syscall!(raw getpeername(
      fd,
      (&mut peer as *mut libc::sockaddr_storage).cast(),
      &mut peer_len,
    )) {
      r if r == -(libc::ENOTCONN as isize) => -(libc::EINPROGRESS as isize),
      r if r < 0 => r,
      _ => 0,
    }
  }

  fn send_packets(&mut self, fd: RawFd) -> isize {
    let mut iov: Vec<libc::iovec> = self
      .buffers
      .iter()
      .map(|b| libc::iovec { iov_base: b.as_ptr() as *mut libc::c_void, iov_len: b.len() })
      .collect();

    // SAFETY: msghdr is plain old data; zero is a valid starting point.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    if self.addr_len > 0 {
      msg.msg_name = (&mut self.addr as *mut libc::sockaddr_storage).cast();
      msg.msg_namelen = self.addr_len;
    }
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = iov.len() as _;

    syscall!(raw sendmsg(fd, &msg, self.flags | SEND_FLAGS))
  }

  fn send_file(&mut self, fd: RawFd) -> isize {
    let Some(file) = self.file.as_ref() else {
      return -(libc::EBADF as isize);
    };
    let mut offset = self.offset as libc::off_t;
    let res = syscall!(raw sendfile(fd, file.as_raw_fd(), &mut offset, self.count));
    if res >= 0 {
      self.offset = offset as i64;
    }
    res
  }

  fn receive_message(&mut self, fd: RawFd) -> isize {
    if self.control.len() < CONTROL_LEN {
      self.control.resize(CONTROL_LEN, 0);
    }
    let (ptr, spare) = self.spare();
    let mut iov = libc::iovec { iov_base: ptr.cast(), iov_len: spare };

    // SAFETY: as in `send_packets`.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = (&mut self.addr as *mut libc::sockaddr_storage).cast();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = self.control.as_mut_ptr().cast();
    msg.msg_controllen = self.control.len() as _;

    let res = syscall!(raw recvmsg(fd, &mut msg, self.flags | RECV_FLAGS));
    if res >= 0 {
      self.addr_len = msg.msg_namelen;
      self.msg_flags = msg.msg_flags;
      self.control_len = msg.msg_controllen as usize;
    }
    self.commit(res);
    res
  }

  /// Destination info from the last `ReceiveMessageFrom`, if the kernel
  /// attached any.
  pub fn packet_info(&self) -> Option<PacketInfo> {
    if self.control_len == 0 {
      return None;
    }

    // SAFETY: the CMSG_* helpers only walk the control area the kernel
    // filled in, bounded by `control_len`.
    unsafe {
      let mut msg: libc::msghdr = mem::zeroed();
      msg.msg_control = self.control.as_ptr() as *mut libc::c_void;
      msg.msg_controllen = self.control_len as _;

      let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
      while !cmsg.is_null() {
        let header = &*cmsg;
        if header.cmsg_level == libc::IPPROTO_IP && header.cmsg_type == libc::IP_PKTINFO {
          let info: libc::in_pktinfo =
            std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast());
          return Some(PacketInfo {
            address: IpAddr::V4(Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr))),
            interface: info.ipi_ifindex as u32,
          });
        }
        if header.cmsg_level == libc::IPPROTO_IPV6 && header.cmsg_type == libc::IPV6_PKTINFO
        {
          let info: libc::in6_pktinfo =
            std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast());
          return Some(PacketInfo {
            address: IpAddr::V6(Ipv6Addr::from(info.ipi6_addr.s6_addr)),
            interface: info.ipi6_ifindex as u32,
          });
        }
        cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
      }
    }
    None
  }

  /// Pointer to and length of the buffer's unused capacity.
  fn spare(&mut self) -> (*mut u8, usize) {
    let len = self.buffer.len();
    let spare = self.buffer.capacity() - len;
    // SAFETY: `len` is within the allocation.
    (unsafe { self.buffer.as_mut_ptr().add(len) }, spare)
  }

  fn commit(&mut self, res: isize) {
    if res > 0 {
      let len = self.buffer.len() + res as usize;
      debug_assert!(len <= self.buffer.capacity());
      // SAFETY: the kernel initialised `res` bytes past the old length.
      unsafe { self.buffer.set_len(len) };
    }
  }
}
