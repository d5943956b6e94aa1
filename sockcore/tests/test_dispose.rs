use sockcore::{Socket, SocketErrorKind, test_utils};
use std::{
  net::Shutdown,
  sync::mpsc,
  thread,
  time::{Duration, Instant},
};

/// `RUST_LOG=sockcore=trace` shows the close protocol step by step.
fn trace() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

#[test]
fn test_pending_receive_fails_with_aborted() {
  trace();
  let (_client, server) = test_utils::tcp_pair().unwrap();
  let rx = server.receive(Vec::with_capacity(32)).send();
  assert!(rx.try_recv().is_none());

  assert!(server.dispose());

  let (res, _) = rx.recv_timeout(Duration::from_secs(5)).expect("pending receive hung");
  let err = res.unwrap_err();
  assert_eq!(err.kind(), SocketErrorKind::Aborted);
  assert!(err.is_disposed());
}

#[test]
fn test_pending_datagram_receive_fails_with_interrupted() {
  trace();
  let sock = test_utils::udp_bound().unwrap();
  let rx = sock.receive_from(Vec::with_capacity(32)).send();
  sock.dispose();

  let (res, _) = rx.recv_timeout(Duration::from_secs(5)).expect("pending receive hung");
  let err = res.unwrap_err();
  assert_eq!(err.kind(), SocketErrorKind::Interrupted);
  assert!(err.is_disposed());
}

fn wait_until_ready<T>(op: &sockcore::Completion<T>) {
  let deadline = Instant::now() + Duration::from_secs(5);
  while !op.is_ready() {
    assert!(Instant::now() < deadline, "operation never finished");
    thread::sleep(Duration::from_millis(1));
  }
}

#[test]
fn test_finished_eof_observed_after_dispose_is_aborted() {
  trace();
  let (client, server) = test_utils::tcp_pair().unwrap();
  let pending = server.receive(Vec::with_capacity(8));
  client.shutdown(Shutdown::Write).unwrap();
  wait_until_ready(&pending);

  assert!(server.dispose());

  // The receive finished with end of stream before the dispose, but is
  // observed afterwards.
  let (res, _) = pending.wait();
  let err = res.unwrap_err();
  assert_eq!(err.kind(), SocketErrorKind::Aborted);
  assert!(err.is_disposed());
}

#[test]
fn test_finished_empty_datagram_observed_after_dispose_is_interrupted() {
  trace();
  let sender = test_utils::udp_bound().unwrap();
  let sock = test_utils::udp_bound().unwrap();
  let pending = sock.receive_from(Vec::with_capacity(8));
  sender.send_to(Vec::new(), sock.local_addr().unwrap()).wait().0.unwrap();
  wait_until_ready(&pending);

  assert!(sock.dispose());

  let (res, _) = pending.wait();
  let err = res.unwrap_err();
  assert_eq!(err.kind(), SocketErrorKind::Interrupted);
  assert!(err.is_disposed());
}

#[test]
fn test_finished_transfer_with_bytes_survives_dispose() {
  trace();
  let (client, server) = test_utils::tcp_pair().unwrap();
  let pending = server.receive(Vec::with_capacity(8));
  client.send(b"late".to_vec()).wait().0.unwrap();
  wait_until_ready(&pending);

  server.dispose();

  let (res, buf) = pending.wait();
  assert_eq!(&buf[..res.unwrap()], &b"late"[..buf.len()]);
}

#[test]
fn test_operations_after_dispose_fail_fast() {
  trace();
  let (client, server) = test_utils::tcp_pair().unwrap();
  server.dispose();

  let (res, buf) = server.send(b"late".to_vec()).wait();
  assert_eq!(res.unwrap_err().kind(), SocketErrorKind::Aborted);
  assert_eq!(buf, b"late");

  let (res, _) = server.receive(Vec::with_capacity(4)).wait();
  assert!(res.unwrap_err().is_disposed());
  assert!(server.accept().wait().unwrap_err().is_disposed());
  assert!(server.connect(test_utils::any_local()).wait().unwrap_err().is_disposed());

  // The other end is unaffected.
  assert!(!client.is_disposed());
}

#[test]
fn test_udp_operations_after_dispose_are_interrupted() {
  trace();
  let sock = test_utils::udp_bound().unwrap();
  let target = sock.local_addr().unwrap();
  sock.dispose();

  let (res, _) = sock.send_to(b"x".to_vec(), target).wait();
  let err = res.unwrap_err();
  assert_eq!(err.kind(), SocketErrorKind::Interrupted);
  assert!(err.is_disposed());
}

#[test]
fn test_accept_racing_dispose() {
  trace();
  for _ in 0..32 {
    let listener = test_utils::tcp_listener().unwrap();
    let addr = listener.local_addr().unwrap();

    let (tx, rx) = mpsc::channel();
    listener.accept().when_done(move |res| tx.send(res).unwrap());

    let client = thread::spawn(move || {
      let sock = Socket::for_address(&addr, sockcore::Type::STREAM).unwrap();
      let _ = sock.connect(addr).wait();
    });
    let disposer = {
      let listener = listener.clone();
      thread::spawn(move || listener.dispose())
    };

    match rx.recv_timeout(Duration::from_secs(5)).expect("accept hung") {
      Ok((conn, _peer)) => assert!(conn.is_connected()),
      Err(err) => {
        assert_eq!(err.kind(), SocketErrorKind::Aborted);
        assert!(err.is_disposed());
      }
    }
    client.join().unwrap();
    disposer.join().unwrap();
  }
}

#[test]
fn test_dispose_through_clone_cancels_parked_operations() {
  trace();
  let (_client, server) = test_utils::tcp_pair().unwrap();
  let (tx, rx) = mpsc::channel();
  server.receive(Vec::with_capacity(8)).when_done(move |(res, _)| tx.send(res).unwrap());

  let other = server.clone();
  drop(server);
  other.dispose();

  let res = rx.recv_timeout(Duration::from_secs(5)).unwrap();
  assert_eq!(res.unwrap_err().kind(), SocketErrorKind::Aborted);
}
