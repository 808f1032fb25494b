use crate::state::{AssocState, FutureStatus, StateRef};
use crate::Error;
use std::fmt::{self, Debug};
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// The unique consumer of a completion state. Its result can be retrieved once.
///
/// A `Future` comes from [`Promise::get_future`](crate::Promise::get_future),
/// [`PackagedTask::get_future`](crate::PackagedTask::get_future), [`spawn`](crate::spawn),
/// [`launch`](crate::launch) or [`request_async`](crate::request_async). The default value has
/// no state and every operation on it fails with [`Error::NoState`].
///
/// It also implements [`std::future::Future`], so it can be `.await`ed with any executor.
///
/// # Examples
///
/// ```
/// use mpiex::{Error, Promise};
/// use std::thread;
///
/// let promise = Promise::<u32>::new();
/// let mut future = promise.get_future().unwrap();
/// let task = thread::spawn(move || promise.set_value(7).unwrap());
/// assert_eq!(future.get().unwrap(), 7);
/// assert!(matches!(future.get(), Err(Error::NoState)));
/// task.join().expect("The task thread has panicked");
/// ```
pub struct Future<T> {
    state: Option<StateRef<T>>,
}

impl<T> Future<T> {
    /// Attaches the one future a state may have.
    pub(crate) fn attach(state: StateRef<T>) -> Result<Self, Error> {
        state.attach_future()?;
        Ok(Self { state: Some(state) })
    }

    fn state(&self) -> Result<&StateRef<T>, Error> {
        self.state.as_ref().ok_or(Error::NoState)
    }

    /// Whether this future still refers to a state.
    pub fn valid(&self) -> bool {
        self.state.is_some()
    }

    /// Blocks until the result is available and moves it out.
    ///
    /// The state is released before returning, so a second call fails with
    /// [`Error::NoState`]. An error stored by the producer is returned as-is.
    pub fn get(&mut self) -> Result<T, Error> {
        let state = self.state.take().ok_or(Error::NoState)?;
        state.take()
    }

    /// Blocks until the result is available. Deferred work runs now, on this thread.
    pub fn wait(&self) -> Result<(), Error> {
        self.state()?.wait();
        Ok(())
    }

    pub fn wait_for(&self, timeout: Duration) -> Result<FutureStatus, Error> {
        Ok(self.state()?.wait_for(timeout))
    }

    pub fn wait_until(&self, deadline: Instant) -> Result<FutureStatus, Error> {
        Ok(self.state()?.wait_until(deadline))
    }

    /// Polls without blocking. For request-backed futures this tests the request.
    pub fn is_ready(&self) -> bool {
        self.state.as_ref().map_or(false, |state| state.is_ready())
    }

    /// Turns this future into a [`SharedFuture`] over the same state.
    pub fn share(mut self) -> SharedFuture<T> {
        SharedFuture {
            state: self.state.take(),
            outcome: Arc::new(OnceLock::new()),
        }
    }

    pub fn swap(&mut self, other: &mut Future<T>) {
        mem::swap(&mut self.state, &mut other.state);
    }
}

impl<T> Default for Future<T> {
    fn default() -> Self {
        Self { state: None }
    }
}

impl<T> Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future").field("state", &self.state).finish()
    }
}

impl<T> std::future::Future for Future<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let poll = match &this.state {
            Some(state) => state.poll_take(cx),
            None => return Poll::Ready(Err(Error::NoState)),
        };
        if poll.is_ready() {
            this.state = None;
        }
        poll
    }
}

/// A consumer that can be cloned and read any number of times.
///
/// Every clone refers to the same state and sees the same result. The first `get` moves
/// the result out of the state into a cache all clones share.
///
/// # Examples
///
/// ```
/// use mpiex::spawn;
/// use std::thread;
///
/// let shared = spawn(|| vec![1, 2, 3]).share();
/// let other = shared.clone();
/// let task = thread::spawn(move || other.get().unwrap().len());
/// assert_eq!(shared.get().unwrap(), &vec![1, 2, 3]);
/// assert_eq!(task.join().expect("The task thread has panicked"), 3);
/// ```
pub struct SharedFuture<T> {
    state: Option<StateRef<T>>,
    outcome: Arc<OnceLock<Result<T, Error>>>,
}

impl<T> SharedFuture<T> {
    fn state(&self) -> Result<&AssocState<T>, Error> {
        self.state.as_deref().ok_or(Error::NoState)
    }

    pub fn valid(&self) -> bool {
        self.state.is_some()
    }

    /// Blocks until the result is available and returns a reference to it. Can be called
    /// repeatedly and from several threads at once.
    pub fn get(&self) -> Result<&T, Error> {
        let state = self.state()?;
        self.outcome
            .get_or_init(|| state.take())
            .as_ref()
            .map_err(Clone::clone)
    }

    pub fn wait(&self) -> Result<(), Error> {
        self.state()?.wait();
        Ok(())
    }

    pub fn wait_for(&self, timeout: Duration) -> Result<FutureStatus, Error> {
        Ok(self.state()?.wait_for(timeout))
    }

    pub fn wait_until(&self, deadline: Instant) -> Result<FutureStatus, Error> {
        Ok(self.state()?.wait_until(deadline))
    }

    pub fn is_ready(&self) -> bool {
        self.outcome.get().is_some() || self.state().map_or(false, |state| state.is_ready())
    }
}

impl<T> Clone for SharedFuture<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            outcome: Arc::clone(&self.outcome),
        }
    }
}

impl<T> Default for SharedFuture<T> {
    fn default() -> Self {
        Self {
            state: None,
            outcome: Arc::new(OnceLock::new()),
        }
    }
}

impl<T> From<Future<T>> for SharedFuture<T> {
    fn from(future: Future<T>) -> Self {
        future.share()
    }
}

impl<T> Debug for SharedFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedFuture")
            .field("state", &self.state)
            .field("retrieved", &self.outcome.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Future, SharedFuture};
    use crate::state::{AssocState, StateRef};
    use crate::{Error, FutureStatus};
    use futures::executor::block_on;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn pair<T>() -> (StateRef<T>, Future<T>) {
        let state = StateRef::new(AssocState::new());
        let future = Future::attach(state.clone()).unwrap();
        (state, future)
    }

    #[test]
    fn test_get_twice_is_no_state() {
        let (state, mut future) = pair();
        state.set_value(String::from("🍓")).unwrap();
        assert_eq!(future.get().unwrap(), "🍓");
        assert!(!future.valid());
        assert!(matches!(future.get(), Err(Error::NoState)));
    }

    #[test]
    fn test_second_attach_is_rejected() {
        let (state, _future) = pair::<u8>();
        assert!(matches!(Future::attach(state), Err(Error::AlreadyRetrieved)));
    }

    #[test]
    fn test_default_future_has_no_state() {
        let mut future = Future::<u8>::default();
        assert!(!future.valid());
        assert!(!future.is_ready());
        assert!(matches!(future.wait(), Err(Error::NoState)));
        assert!(matches!(future.wait_for(Duration::from_millis(1)), Err(Error::NoState)));
        assert!(matches!(future.get(), Err(Error::NoState)));
        assert!(matches!(block_on(future), Err(Error::NoState)));
    }

    #[test]
    fn test_wait_for_reports_timeout_then_ready() {
        let (state, future) = pair();
        assert_eq!(future.wait_for(Duration::from_millis(10)).unwrap(), FutureStatus::Timeout);
        state.set_value(()).unwrap();
        assert_eq!(future.wait_for(Duration::from_millis(10)).unwrap(), FutureStatus::Ready);
        assert!(future.is_ready());
    }

    #[test]
    fn test_wait_until_deadline() {
        let (state, future) = pair();
        assert_eq!(future.wait_until(Instant::now()).unwrap(), FutureStatus::Timeout);
        state.set_value(1u8).unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        assert_eq!(future.wait_until(deadline).unwrap(), FutureStatus::Ready);
    }

    #[test]
    fn test_shared_wait_until_deadline() {
        let (state, future) = pair();
        let shared = future.share();
        assert_eq!(shared.wait_until(Instant::now()).unwrap(), FutureStatus::Timeout);
        state.set_value(1u8).unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        assert_eq!(shared.wait_until(deadline).unwrap(), FutureStatus::Ready);
        assert!(matches!(
            SharedFuture::<u8>::default().wait_until(deadline),
            Err(Error::NoState)
        ));
    }

    #[test]
    fn test_swap() {
        let (state, mut a) = pair();
        let mut b = Future::default();
        a.swap(&mut b);
        assert!(!a.valid());
        state.set_value(3).unwrap();
        assert_eq!(b.get().unwrap(), 3);
    }

    #[test]
    fn test_await_from_another_thread() {
        let (state, future) = pair();
        let task1 = thread::spawn(move || block_on(async { future.await }));
        let task2 = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            state.set_value(String::from("🍓")).unwrap();
        });
        task2.join().expect("The task2 thread has panicked");
        let value = task1.join().expect("The task1 thread has panicked");
        assert_eq!(value.unwrap(), "🍓");
    }

    #[test]
    fn test_await_runs_deferred_work() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let state = StateRef::new(AssocState::deferred(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst) + 40
        })));
        let future = Future::attach(state).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(block_on(future).unwrap(), 40);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shared_get_repeats() {
        let (state, future) = pair();
        let shared = future.share();
        state.set_value(vec![1u8, 2, 3]).unwrap();
        let first: *const Vec<u8> = shared.get().unwrap();
        for _ in 0..5 {
            let again: *const Vec<u8> = shared.get().unwrap();
            assert_eq!(first, again);
        }
        let clone = shared.clone();
        assert_eq!(clone.get().unwrap(), &vec![1, 2, 3]);
    }

    #[test]
    fn test_shared_get_from_many_threads() {
        let (state, future) = pair();
        let shared = future.share();
        let readers: Vec<_> = (0..8)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || *shared.get().unwrap())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        state.set_value(99u64).unwrap();
        for reader in readers {
            assert_eq!(reader.join().expect("The reader thread has panicked"), 99);
        }
        assert_eq!(*shared.get().unwrap(), 99);
    }

    #[test]
    fn test_shared_error_is_seen_by_every_clone() {
        let (state, future) = pair::<u8>();
        let shared = SharedFuture::from(future);
        let clone = shared.clone();
        state.set_exception(Error::Panicked("💥".into())).unwrap();
        assert!(matches!(shared.get(), Err(Error::Panicked(_))));
        assert!(matches!(clone.get(), Err(Error::Panicked(_))));
    }

    #[test]
    fn test_shared_default_has_no_state() {
        let shared = SharedFuture::<u8>::default();
        assert!(!shared.valid());
        assert!(matches!(shared.get(), Err(Error::NoState)));
    }

    #[test]
    fn test_shared_clone_counts_owners() {
        let (state, future) = pair::<u8>();
        let shared = future.share();
        assert_eq!(state.use_count(), 2);
        let clone = shared.clone();
        assert_eq!(state.use_count(), 3);
        drop(clone);
        drop(shared);
        assert_eq!(state.use_count(), 1);
    }
}
