/// Which queue of a binding an operation parks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
  Read,
  Write,
}

/// Readiness reported by the kernel for one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Readiness {
  bits: u8,
}

impl Readiness {
  pub const READ: Self = Self { bits: 1 << 0 };
  pub const WRITE: Self = Self { bits: 1 << 1 };
  /// Error or hang-up: every parked operation must be retried so it can
  /// observe the failure.
  pub const HANGUP: Self = Self { bits: 1 << 2 };

  pub const NONE: Self = Self { bits: 0 };

  pub fn from_epoll(events: u32) -> Self {
    let mut ready = Self::NONE;
    if events & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32 != 0 {
      ready |= Self::READ;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
      ready |= Self::WRITE;
    }
    if events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
      ready |= Self::HANGUP;
    }
    ready
  }

  pub const fn is_none(self) -> bool {
    self.bits == 0
  }

  pub const fn contains(self, other: Self) -> bool {
    (self.bits & other.bits) == other.bits
  }

  /// Whether operations waiting in `dir` should be retried.
  pub const fn wakes(self, dir: Direction) -> bool {
    if self.contains(Self::HANGUP) {
      return true;
    }
    match dir {
      Direction::Read => self.contains(Self::READ),
      Direction::Write => self.contains(Self::WRITE),
    }
  }
}

impl std::ops::BitOr for Readiness {
  type Output = Self;

  fn bitor(self, rhs: Self) -> Self {
    Self { bits: self.bits | rhs.bits }
  }
}

impl std::ops::BitOrAssign for Readiness {
  fn bitor_assign(&mut self, rhs: Self) {
    self.bits |= rhs.bits;
  }
}
