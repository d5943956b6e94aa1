use std::{
  io,
  os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
  ptr,
  time::Duration,
};

/// Edge-triggered epoll instance.
///
/// Descriptors are registered once for both directions; the reactor keeps
/// the per-direction bookkeeping itself, so there is no `modify`.
pub(crate) struct Epoll {
  fd: OwnedFd,
}

const EVENTS: u32 = (libc::EPOLLIN
  | libc::EPOLLOUT
  | libc::EPOLLRDHUP
  | libc::EPOLLPRI
  | libc::EPOLLET) as u32;

impl Epoll {
  pub fn new() -> io::Result<Self> {
    let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
    // SAFETY: epoll_create1 just returned this descriptor to us.
    Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
  }

  /// Not idempotent: adding the same fd twice fails with `EEXIST`.
  pub fn add(&self, fd: RawFd, key: u64) -> io::Result<()> {
    let mut event = libc::epoll_event { events: EVENTS, u64: key };
    syscall!(epoll_ctl(
      self.fd.as_raw_fd(),
      libc::EPOLL_CTL_ADD,
      fd,
      &mut event as *mut libc::epoll_event,
    ))?;
    Ok(())
  }

  pub fn delete(&self, fd: RawFd) -> io::Result<()> {
    // A NULL event is accepted for EPOLL_CTL_DEL since Linux 2.6.9.
    match syscall!(epoll_ctl(
      self.fd.as_raw_fd(),
      libc::EPOLL_CTL_DEL,
      fd,
      ptr::null_mut(),
    )) {
      Ok(_) => Ok(()),
      Err(err) => Err(match err.raw_os_error() {
        Some(libc::EBADF) => io::Error::from_raw_os_error(libc::ENOENT),
        _ => err,
      }),
    }
  }

  /// Waits for events. `EINTR` is reported as zero events.
  pub fn wait(
    &self,
    events: &mut [libc::epoll_event],
    timeout: Option<Duration>,
  ) -> io::Result<usize> {
    let timeout_ms = match timeout {
      None => -1,
      Some(t) => t.as_millis().min(i32::MAX as u128) as i32,
    };

    match syscall!(epoll_wait(
      self.fd.as_raw_fd(),
      events.as_mut_ptr(),
      events.len() as i32,
      timeout_ms,
    )) {
      Ok(n) => Ok(n as usize),
      Err(err) if err.raw_os_error() == Some(libc::EINTR) => Ok(0),
      Err(err) => Err(err),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::os::fd::AsRawFd;

  fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0; 2];
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK))
      .unwrap();
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
  }

  #[test]
  fn reports_key_of_ready_descriptor() {
    let epoll = Epoll::new().unwrap();
    let (read, write) = pipe();
    epoll.add(read.as_raw_fd(), 42).unwrap();

    let mut events = [libc::epoll_event { events: 0, u64: 0 }; 4];
    assert_eq!(epoll.wait(&mut events, Some(Duration::ZERO)).unwrap(), 0);

    let byte = [1u8];
    syscall!(write(write.as_raw_fd(), byte.as_ptr().cast(), 1)).unwrap();

    let n = epoll.wait(&mut events, Some(Duration::from_secs(1))).unwrap();
    assert_eq!(n, 1);
    let ev = events[0];
    let key = ev.u64;
    assert_eq!(key, 42);
  }

  #[test]
  fn double_add_and_missing_delete_fail() {
    let epoll = Epoll::new().unwrap();
    let (read, _write) = pipe();
    epoll.add(read.as_raw_fd(), 1).unwrap();
    assert!(epoll.add(read.as_raw_fd(), 1).is_err());

    epoll.delete(read.as_raw_fd()).unwrap();
    let err = epoll.delete(read.as_raw_fd()).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
  }
}
