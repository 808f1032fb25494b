use crate::{Error, Future, Promise};
use std::fmt::{self, Debug};
use std::mem;
use std::panic::{self, AssertUnwindSafe};

type Callable<A, R> = Box<dyn FnMut(A) -> R + Send>;

/// A callable bundled with the promise for its result.
///
/// Calling the task runs the callable and publishes its return value (or its panic) to the
/// task's [`Future`]. A task runs once; [`PackagedTask::reset`] arms it for one more run
/// with a fresh promise. Several arguments are passed as a tuple.
///
/// # Examples
///
/// ```
/// use mpiex::{Error, PackagedTask};
///
/// let mut task = PackagedTask::new(|x: i32| x * 2);
/// let mut future = task.get_future().unwrap();
/// task.call(21).unwrap();
/// assert_eq!(future.get().unwrap(), 42);
/// assert!(matches!(task.call(1), Err(Error::PromiseAlreadySatisfied)));
///
/// task.reset().unwrap();
/// let mut future = task.get_future().unwrap();
/// task.call(5).unwrap();
/// assert_eq!(future.get().unwrap(), 10);
/// ```
pub struct PackagedTask<A, R> {
    f: Option<Callable<A, R>>,
    promise: Promise<R>,
}

impl<A, R> PackagedTask<A, R> {
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut(A) -> R + Send + 'static,
    {
        Self {
            f: Some(Box::new(f)),
            promise: Promise::new(),
        }
    }

    pub fn valid(&self) -> bool {
        self.f.is_some() && self.promise.valid()
    }

    pub fn get_future(&self) -> Result<Future<R>, Error> {
        self.promise.get_future()
    }

    /// Runs the callable and publishes the outcome.
    ///
    /// Fails with [`Error::NoState`] on a default task and with
    /// [`Error::PromiseAlreadySatisfied`] when the task already ran since its last reset.
    /// A panic in the callable is not an error of `call`; it reaches the future as
    /// [`Error::Panicked`].
    pub fn call(&mut self, args: A) -> Result<(), Error> {
        let f = self.f.as_mut().ok_or(Error::NoState)?;
        if self.promise.is_satisfied()? {
            return Err(Error::PromiseAlreadySatisfied);
        }
        match panic::catch_unwind(AssertUnwindSafe(|| f(args))) {
            Ok(value) => self.promise.set_value(value),
            Err(payload) => {
                let err = Error::from_panic(payload);
                log::error!("packaged task failed: {}", err);
                self.promise.set_exception(err)
            }
        }
    }

    /// Swaps in a fresh promise so the task can run once more. A future obtained before the
    /// reset and never satisfied sees [`Error::BrokenPromise`].
    pub fn reset(&mut self) -> Result<(), Error> {
        if !self.valid() {
            return Err(Error::NoState);
        }
        self.promise = Promise::new();
        Ok(())
    }

    pub fn swap(&mut self, other: &mut PackagedTask<A, R>) {
        mem::swap(&mut self.f, &mut other.f);
        self.promise.swap(&mut other.promise);
    }
}

impl<A, R> Default for PackagedTask<A, R> {
    fn default() -> Self {
        Self {
            f: None,
            promise: Promise::empty(),
        }
    }
}

impl<A, R> Debug for PackagedTask<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackagedTask")
            .field("f", &self.f.as_ref().map(|_| "<opaque>"))
            .field("promise", &self.promise)
            .finish()
    }
}
