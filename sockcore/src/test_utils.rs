//! Test utilities for integration tests.
//!
//! Helpers for building connected socket pairs over loopback. Not part of
//! the public API.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Type};

use crate::{Socket, SocketResult};

/// `127.0.0.1:0`.
#[doc(hidden)]
pub fn any_local() -> SocketAddr {
  SocketAddr::from(([127, 0, 0, 1], 0))
}

/// A TCP socket listening on an ephemeral loopback port.
#[doc(hidden)]
pub fn tcp_listener() -> SocketResult<Socket> {
  let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
  listener.bind(any_local())?;
  listener.listen(16)?;
  Ok(listener)
}

/// A connected TCP pair: `(client, server side)`.
#[doc(hidden)]
pub fn tcp_pair() -> SocketResult<(Socket, Socket)> {
  let listener = tcp_listener()?;
  let client = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
  let accept = listener.accept();
  client.connect(listener.local_addr()?).wait()?;
  let (server, _) = accept.wait()?;
  listener.dispose();
  Ok((client, server))
}

/// A UDP socket bound to an ephemeral loopback port.
#[doc(hidden)]
pub fn udp_bound() -> SocketResult<Socket> {
  let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
  sock.bind(any_local())?;
  Ok(sock)
}
