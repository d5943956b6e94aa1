//! Conversions between `std::net::SocketAddr` and the kernel's
//! `sockaddr_storage`.

use std::{
  mem,
  net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
  ptr,
};

use crate::error::{SocketError, SocketErrorKind, SocketResult};

/// Zeroed storage sized for any address, with its full length.
pub(crate) fn empty_storage() -> (libc::sockaddr_storage, libc::socklen_t) {
  // SAFETY: sockaddr_storage is plain old data; all-zero is a valid value.
  let storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
  (storage, mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t)
}

/// Encodes `addr` and returns the storage together with the length the
/// kernel expects for that family.
pub(crate) fn socketaddr_into_storage(
  addr: SocketAddr,
) -> (libc::sockaddr_storage, libc::socklen_t) {
  let (mut storage, _) = empty_storage();
  let len = match addr {
    SocketAddr::V4(v4) => {
      let raw = into_addr(v4);
      // SAFETY: sockaddr_in fits in sockaddr_storage and the regions are
      // distinct stack values.
      unsafe {
        ptr::copy_nonoverlapping(
          &raw as *const libc::sockaddr_in as *const u8,
          &mut storage as *mut libc::sockaddr_storage as *mut u8,
          mem::size_of::<libc::sockaddr_in>(),
        );
      }
      mem::size_of::<libc::sockaddr_in>()
    }
    SocketAddr::V6(v6) => {
      let raw = into_addr6(v6);
      // SAFETY: as above, for sockaddr_in6.
      unsafe {
        ptr::copy_nonoverlapping(
          &raw as *const libc::sockaddr_in6 as *const u8,
          &mut storage as *mut libc::sockaddr_storage as *mut u8,
          mem::size_of::<libc::sockaddr_in6>(),
        );
      }
      mem::size_of::<libc::sockaddr_in6>()
    }
  };
  (storage, len as libc::socklen_t)
}

/// Decodes a kernel-filled address. `len` is the length the kernel
/// reported; anything shorter than the family's struct is rejected.
pub(crate) fn storage_into_socketaddr(
  storage: &libc::sockaddr_storage,
  len: libc::socklen_t,
) -> SocketResult<SocketAddr> {
  let len = len as usize;
  match storage.ss_family as libc::c_int {
    libc::AF_INET if len >= mem::size_of::<libc::sockaddr_in>() => {
      // SAFETY: the family is AF_INET and the storage is large and aligned
      // enough for sockaddr_in.
      let sin = unsafe {
        &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>()
      };
      let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
      Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
    }
    libc::AF_INET6 if len >= mem::size_of::<libc::sockaddr_in6>() => {
      // SAFETY: as above, for sockaddr_in6.
      let sin6 = unsafe {
        &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>()
      };
      Ok(SocketAddr::V6(SocketAddrV6::new(
        Ipv6Addr::from(sin6.sin6_addr.s6_addr),
        u16::from_be(sin6.sin6_port),
        sin6.sin6_flowinfo,
        sin6.sin6_scope_id,
      )))
    }
    _ => Err(SocketError::new(SocketErrorKind::AddressFamilyNotSupported)),
  }
}

fn into_addr(addr: SocketAddrV4) -> libc::sockaddr_in {
  // SAFETY: sockaddr_in has only integer fields; zero is valid.
  let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
  raw.sin_family = libc::AF_INET as libc::sa_family_t;
  raw.sin_port = addr.port().to_be();
  raw.sin_addr = libc::in_addr { s_addr: u32::from(*addr.ip()).to_be() };
  raw
}

fn into_addr6(addr: SocketAddrV6) -> libc::sockaddr_in6 {
  // SAFETY: sockaddr_in6 has only integer and array fields; zero is valid.
  let mut raw: libc::sockaddr_in6 = unsafe { mem::zeroed() };
  raw.sin6_family = libc::AF_INET6 as libc::sa_family_t;
  raw.sin6_port = addr.port().to_be();
  raw.sin6_addr = libc::in6_addr { s6_addr: addr.ip().octets() };
  raw.sin6_flowinfo = addr.flowinfo();
  raw.sin6_scope_id = addr.scope_id();
  raw
}
