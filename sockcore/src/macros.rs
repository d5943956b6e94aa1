/// Calls a `libc` function and turns the `-1`/`errno` convention into a
/// result.
///
/// The `raw` form returns the syscall's value as `isize`, with failures
/// encoded as `-errno`. That is the shape [`OperationSlot`] hands to the
/// completion machinery.
///
/// [`OperationSlot`]: crate::slot::OperationSlot
macro_rules! syscall {
  (raw $fn: ident ( $($arg: expr),* $(,)* ) ) => {{
      #[allow(unused_unsafe)]
      let res = unsafe { libc::$fn($($arg, )*) } as isize;
      if res == -1 {
          -(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO) as isize)
      } else {
          res
      }
  }};
  ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
      #[allow(unused_unsafe)]
      let res = unsafe { libc::$fn($($arg, )*) };
      if res == -1 {
          Err(std::io::Error::last_os_error())
      } else {
          Ok(res)
      }
  }};
}
