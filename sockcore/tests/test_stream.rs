use sockcore::{Socket, SocketErrorKind, Type, test_utils};
use std::{
  fs::File,
  io::Write,
  sync::mpsc,
  thread,
  time::Duration,
};

fn read_exactly(sock: &Socket, len: usize) -> Vec<u8> {
  let mut out = Vec::with_capacity(len);
  while out.len() < len {
    let (res, buf) = sock.receive(out).wait();
    out = buf;
    let n = res.unwrap();
    assert!(n > 0, "unexpected end of stream after {} bytes", out.len());
  }
  out
}

#[test]
fn test_accept_connect_round_trip() {
  let listener = test_utils::tcp_listener().unwrap();
  let addr = listener.local_addr().unwrap();

  let (tx, rx) = mpsc::channel();
  listener.accept().when_done(move |res| tx.send(res).unwrap());

  let client = Socket::for_address(&addr, Type::STREAM).unwrap();
  client.connect(addr).wait().unwrap();
  assert!(client.is_connected());
  assert!(client.is_bound());

  let (server, peer) = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
  assert_eq!(peer, client.local_addr().unwrap());
  assert_eq!(server.peer_addr().unwrap(), peer);
  assert!(server.is_connected());

  let (res, buf) = client.send(b"Hello, World!".to_vec()).wait();
  assert_eq!(res.unwrap(), 13);
  assert_eq!(buf, b"Hello, World!");

  assert_eq!(read_exactly(&server, 13), b"Hello, World!");
}

#[test]
fn test_receive_appends_to_buffer() {
  let (client, server) = test_utils::tcp_pair().unwrap();
  client.send(b"abc".to_vec()).wait().0.unwrap();

  let mut buf = Vec::with_capacity(16);
  buf.extend_from_slice(b">>");

  let (res, buf) = server.receive(buf).wait();
  let n = res.unwrap();
  assert!(n >= 1);
  assert!(buf.starts_with(b">>a"));
}

#[test]
fn test_receive_without_spare_capacity_is_rejected() {
  let (_client, server) = test_utils::tcp_pair().unwrap();
  let (res, buf) = server.receive(Vec::new()).wait();
  assert_eq!(res.unwrap_err().kind(), SocketErrorKind::ArgumentInvalid);
  assert!(buf.is_empty());
}

#[test]
fn test_peek_leaves_data_queued() {
  let (client, server) = test_utils::tcp_pair().unwrap();
  let rx = server.receive_with_flags(Vec::with_capacity(16), libc::MSG_PEEK).send();
  client.send(b"peek".to_vec()).wait().0.unwrap();

  let (res, peeked) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
  let n = res.unwrap();
  assert!(n >= 1);
  assert_eq!(peeked.len(), n);

  // The peeked bytes are read again by a plain receive.
  let read = read_exactly(&server, 4);
  assert_eq!(read, b"peek");
  assert!(read.starts_with(&peeked));
}

#[test]
fn test_send_all_large_buffer() {
  let (client, server) = test_utils::tcp_pair().unwrap();
  let payload: Vec<u8> = (0..8 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
  let expected = payload.clone();

  let reader = thread::spawn(move || read_exactly(&server, expected.len()) == expected);

  let (res, buf) = client.send_all(payload).wait();
  assert_eq!(res.unwrap(), buf.len());
  assert!(reader.join().unwrap());
}

#[test]
fn test_send_packets_gathers_buffers() {
  let (client, server) = test_utils::tcp_pair().unwrap();
  let parts = vec![b"one ".to_vec(), b"two ".to_vec(), b"three".to_vec()];

  let (res, parts) = client.send_packets(parts, None).wait();
  assert_eq!(res.unwrap(), 13);
  assert_eq!(parts.len(), 3);

  assert_eq!(read_exactly(&server, 13), b"one two three");
}

#[test]
fn test_send_file() {
  let path = std::env::temp_dir().join(format!("sockcore_send_file_{}", std::process::id()));
  let contents: Vec<u8> = (0..1000u32).map(|i| (i % 13) as u8).collect();
  File::create(&path).unwrap().write_all(&contents).unwrap();
  let file = File::open(&path).unwrap();

  let (client, server) = test_utils::tcp_pair().unwrap();
  let sent = client.send_file(&file, 100, 500).wait().unwrap();
  assert!(sent > 0 && sent <= 500);

  assert_eq!(read_exactly(&server, sent), &contents[100..100 + sent]);
  std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_connect_refused() {
  let listener = test_utils::tcp_listener().unwrap();
  let addr = listener.local_addr().unwrap();
  listener.dispose();

  let client = Socket::for_address(&addr, Type::STREAM).unwrap();
  let err = client.connect(addr).wait().unwrap_err();
  assert_eq!(err.kind(), SocketErrorKind::ConnectionRefused);
  assert!(!client.is_connected());
}

#[test]
fn test_disconnect() {
  let (client, server) = test_utils::tcp_pair().unwrap();
  client.disconnect().wait().unwrap();
  assert!(!client.is_connected());

  let (res, _) = server.receive(Vec::with_capacity(8)).wait();
  assert_eq!(res.unwrap(), 0);

  // A disconnected stream socket cannot be reused for a new connection.
  let err = client.connect(server.local_addr().unwrap()).wait().unwrap_err();
  assert_eq!(err.kind(), SocketErrorKind::InvalidState);
  assert_eq!(client.disconnect().wait().unwrap_err().kind(), SocketErrorKind::NotConnected);
}

#[test]
fn test_state_preconditions() {
  let (client, _server) = test_utils::tcp_pair().unwrap();
  let listener = test_utils::tcp_listener().unwrap();

  // Already connected.
  let err = client.connect(listener.local_addr().unwrap()).wait().unwrap_err();
  assert_eq!(err.kind(), SocketErrorKind::InvalidState);
  // Not listening.
  assert_eq!(client.accept().wait().unwrap_err().kind(), SocketErrorKind::InvalidState);
  // Listening.
  let err = listener.connect(test_utils::any_local()).wait().unwrap_err();
  assert_eq!(err.kind(), SocketErrorKind::InvalidState);

  let udp = test_utils::udp_bound().unwrap();
  assert_eq!(udp.accept().wait().unwrap_err().kind(), SocketErrorKind::OperationNotSupported);
  assert_eq!(udp.disconnect().wait().unwrap_err().kind(), SocketErrorKind::InvalidState);
}

#[test]
fn test_peer_close_is_end_of_stream() {
  let (client, server) = test_utils::tcp_pair().unwrap();
  let rx = server.receive(Vec::with_capacity(8)).send();
  client.dispose();

  let (res, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
  assert_eq!(res.unwrap(), 0);
}
