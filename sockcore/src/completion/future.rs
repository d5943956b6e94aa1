use std::{
  fmt,
  future::Future,
  mem,
  pin::Pin,
  sync::Arc,
  task::{Context, Poll, Wake, Waker, ready},
  thread::{self, Thread},
  time::Duration,
};

use super::{AwaitableCompletion, CancelCause};
use crate::{
  cancel::{CancelRegistration, CancellationToken},
  engine::SocketShared,
  reactor::Direction,
  slot::OperationSlot,
  sync::Mutex,
};

/// Turns the raw result of a finished operation into its public output.
pub(crate) type Decode<T> = fn(&SocketShared, &mut OperationSlot, isize, CancelCause) -> T;

/// A submitted operation awaiting its completion.
pub(crate) struct OpWait<T> {
  cell: Arc<AwaitableCompletion>,
  version: u64,
  dir: Direction,
  socket: Arc<SocketShared>,
  decode: Decode<T>,
  pooled: bool,
  /// One entry per attached token.
  cancel: Vec<CancelRegistration>,
  finished: bool,
}

impl<T> OpWait<T> {
  pub fn new(
    cell: Arc<AwaitableCompletion>,
    version: u64,
    dir: Direction,
    socket: Arc<SocketShared>,
    decode: Decode<T>,
    pooled: bool,
  ) -> Self {
    Self { cell, version, dir, socket, decode, pooled, cancel: Vec::new(), finished: false }
  }

  /// Decodes a completed result and hands the cell back to the pool.
  pub fn finish(mut self, res: isize) -> T {
    self.finished = true;
    self.cancel.clear();
    // SAFETY: the cell is complete, out of every queue, and this is its
    // only consumer.
    let slot = unsafe { self.cell.slot_mut() };
    let out = (self.decode)(&self.socket, slot, res, self.cell.cause());
    // SAFETY: as above.
    unsafe { self.cell.reset() };
    tracing::trace!(version = self.version, pooled = self.pooled, "operation finished");
    self.socket.release_completion(self.dir, self.cell.clone());
    out
  }

  fn register_cancel(&mut self, token: &CancellationToken) {
    let Some(ctx) = self.socket.guard.binder().try_get_without_allocating().cloned() else {
      // Torn down: teardown already resolved the operation.
      return;
    };
    let cell = self.cell.clone();
    let version = self.version;
    self.cancel.push(token.register(move || {
      ctx.cancel_op(&cell, version);
    }));
  }
}

impl<T> Drop for OpWait<T> {
  fn drop(&mut self) {
    if self.finished {
      return;
    }
    self.cancel.clear();
    match self.cell.try_result(self.version) {
      Some(res) => {
        // Completed but never observed.
        // SAFETY: complete and unobserved; we are the only consumer.
        unsafe { self.cell.slot_mut() }.discard(res);
        unsafe { self.cell.reset() };
        self.socket.release_completion(self.dir, self.cell.clone());
      }
      None => {
        // Still parked: the binding keeps the cell alive and the result
        // is discarded when the last reference goes.
        tracing::trace!(version = self.version, "detaching pending operation");
      }
    }
  }
}

/// Cancellation plumbing of a composed completion. Every attached token
/// forwards into `token`, which the composed future passes to each step.
struct Composed {
  token: CancellationToken,
  forwards: Vec<CancelRegistration>,
}

enum Repr<T> {
  Ready(Option<T>),
  Op(OpWait<T>),
  Boxed(Pin<Box<dyn Future<Output = T> + Send>>, Composed),
  Taken,
}

/// Result of an asynchronous socket operation.
///
/// A `Completion` is a [`Future`], and can also be consumed without an
/// executor:
///
/// - [`wait`](Completion::wait) blocks the current thread,
/// - [`when_done`](Completion::when_done) runs a callback on completion,
/// - [`send`](Completion::send) delivers the result through a channel.
///
/// Dropping a `Completion` before it resolves detaches the operation: it
/// still runs to completion, and anything it produced (an accepted
/// connection, for example) is released.
#[must_use = "dropping a Completion detaches the operation"]
pub struct Completion<T> {
  repr: Repr<T>,
}

// The output is only ever moved out by value, never pinned.
impl<T> Unpin for Completion<T> {}

impl<T> fmt::Debug for Completion<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = match &self.repr {
      Repr::Ready(_) => "ready",
      Repr::Op(_) => "pending",
      Repr::Boxed(..) => "composed",
      Repr::Taken => "taken",
    };
    f.debug_struct("Completion").field("state", &state).finish()
  }
}

impl<T> Completion<T> {
  pub(crate) fn ready(value: T) -> Self {
    Self { repr: Repr::Ready(Some(value)) }
  }

  pub(crate) fn op(wait: OpWait<T>) -> Self {
    Self { repr: Repr::Op(wait) }
  }

  /// Wraps a composed future. The closure receives a token that fires
  /// when any token later attached through
  /// [`with_cancellation`](Self::with_cancellation) fires.
  pub(crate) fn composed<F, Fut>(f: F) -> Self
  where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
  {
    let token = CancellationToken::new();
    let fut = Box::pin(f(token.clone()));
    Self { repr: Repr::Boxed(fut, Composed { token, forwards: Vec::new() }) }
  }

  /// Whether the result is available without waiting.
  pub fn is_ready(&self) -> bool {
    match &self.repr {
      Repr::Ready(v) => v.is_some(),
      Repr::Op(wait) => wait.cell.try_result(wait.version).is_some(),
      Repr::Boxed(..) | Repr::Taken => false,
    }
  }

  /// Cancels the pending operation when `token` fires. Several tokens can
  /// be attached; whichever fires first cancels.
  ///
  /// The operation then resolves with
  /// [`SocketErrorKind::Cancelled`](crate::SocketErrorKind::Cancelled).
  /// Firing the token after the operation finished has no effect, and so
  /// does attaching an already fired token to an already finished
  /// operation.
  pub fn with_cancellation(mut self, token: &CancellationToken) -> Self {
    match &mut self.repr {
      Repr::Op(wait) => wait.register_cancel(token),
      Repr::Boxed(_, composed) => {
        let inner = composed.token.clone();
        composed.forwards.push(token.register(move || {
          inner.cancel();
        }));
      }
      Repr::Ready(_) | Repr::Taken => {}
    }
    self
  }

  /// Blocks the current thread until the operation completes.
  pub fn wait(mut self) -> T {
    let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
    let mut cx = Context::from_waker(&waker);
    loop {
      match Pin::new(&mut self).poll(&mut cx) {
        Poll::Ready(value) => return value,
        Poll::Pending => thread::park(),
      }
    }
  }

  /// Runs `f` with the result once the operation completes. `f` runs
  /// either on the calling thread (if already complete) or on the thread
  /// that completes the operation.
  pub fn when_done<F>(self, f: F)
  where
    T: Send + 'static,
    F: FnOnce(T) + Send + 'static,
  {
    let task = Arc::new(WhenDone { state: Mutex::new(Some((self, f))) });
    task.poll_once();
  }

  /// Delivers the result through a channel.
  pub fn send(self) -> Receiver<T>
  where
    T: Send + 'static,
  {
    let (tx, rx) = crossbeam_channel::bounded(1);
    self.when_done(move |value| {
      let _ = tx.send(value);
    });
    Receiver { rx }
  }
}

impl<T> Future for Completion<T> {
  type Output = T;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
    let this = self.get_mut();
    match &mut this.repr {
      Repr::Ready(value) => match value.take() {
        Some(value) => {
          this.repr = Repr::Taken;
          Poll::Ready(value)
        }
        None => panic!("Completion polled after it resolved"),
      },
      Repr::Op(wait) => {
        let res = ready!(wait.cell.poll_result(wait.version, cx));
        let Repr::Op(wait) = mem::replace(&mut this.repr, Repr::Taken) else {
          unreachable!()
        };
        Poll::Ready(wait.finish(res))
      }
      Repr::Boxed(fut, _) => {
        let value = ready!(fut.as_mut().poll(cx));
        this.repr = Repr::Taken;
        Poll::Ready(value)
      }
      Repr::Taken => panic!("Completion polled after it resolved"),
    }
  }
}

struct ThreadWaker(Thread);

impl Wake for ThreadWaker {
  fn wake(self: Arc<Self>) {
    self.0.unpark();
  }

  fn wake_by_ref(self: &Arc<Self>) {
    self.0.unpark();
  }
}

struct WhenDone<T, F> {
  state: Mutex<Option<(Completion<T>, F)>>,
}

impl<T, F> WhenDone<T, F>
where
  T: Send + 'static,
  F: FnOnce(T) + Send + 'static,
{
  fn poll_once(self: &Arc<Self>) {
    let mut state = self.state.lock();
    let Some((completion, _)) = state.as_mut() else {
      return;
    };

    let waker = Waker::from(self.clone());
    let mut cx = Context::from_waker(&waker);
    if let Poll::Ready(value) = Pin::new(completion).poll(&mut cx) {
      let taken = state.take();
      drop(state);
      if let Some((_, f)) = taken {
        f(value);
      }
    }
  }
}

impl<T, F> Wake for WhenDone<T, F>
where
  T: Send + 'static,
  F: FnOnce(T) + Send + 'static,
{
  fn wake(self: Arc<Self>) {
    self.poll_once();
  }
}

/// Receiving end of [`Completion::send`].
pub struct Receiver<T> {
  rx: crossbeam_channel::Receiver<T>,
}

impl<T> Receiver<T> {
  /// Blocks until the result arrives. `None` if the operation was dropped
  /// without producing one.
  pub fn recv(self) -> Option<T> {
    self.rx.recv().ok()
  }

  /// Like [`recv`](Self::recv), giving up after `timeout`.
  pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
    self.rx.recv_timeout(timeout).ok()
  }

  pub fn try_recv(&self) -> Option<T> {
    self.rx.try_recv().ok()
  }
}
