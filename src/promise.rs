use crate::state::{AssocState, StateRef};
use crate::{Error, Future};
use std::fmt::{self, Debug};
use std::mem;

/// The producing side of a completion state.
///
/// A promise is satisfied exactly once, with either a value or an error. Dropping a
/// promise that was never satisfied while a [`Future`] still waits on it publishes
/// [`Error::BrokenPromise`], so the waiter is released instead of blocking forever.
///
/// # Examples
///
/// ```
/// use mpiex::{Error, Promise};
/// use std::thread;
///
/// let promise = Promise::<String>::new();
/// let mut future = promise.get_future().unwrap();
/// let task = thread::spawn(move || {
///     // Ensure we move the promise into this thread but never satisfy it.
///     drop(promise);
/// });
/// task.join().expect("The task thread has panicked");
/// assert!(matches!(future.get(), Err(Error::BrokenPromise)));
/// ```
pub struct Promise<T> {
    state: Option<StateRef<T>>,
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            state: Some(StateRef::new(AssocState::new())),
        }
    }

    /// A promise without a state, the starting point of a default [`PackagedTask`](crate::PackagedTask).
    pub(crate) fn empty() -> Self {
        Self { state: None }
    }

    fn state(&self) -> Result<&StateRef<T>, Error> {
        self.state.as_ref().ok_or(Error::NoState)
    }

    pub(crate) fn valid(&self) -> bool {
        self.state.is_some()
    }

    pub(crate) fn is_satisfied(&self) -> Result<bool, Error> {
        Ok(self.state()?.has_value())
    }

    /// Returns the one [`Future`] for this promise.
    ///
    /// Fails with [`Error::AlreadyRetrieved`] on the second call.
    pub fn get_future(&self) -> Result<Future<T>, Error> {
        Future::attach(self.state()?.clone())
    }

    /// Stores `value` and wakes every waiter.
    ///
    /// Fails with [`Error::PromiseAlreadySatisfied`] if a value or an error was stored before.
    pub fn set_value(&self, value: T) -> Result<(), Error> {
        self.state()?.set_value(value)
    }

    /// Stores `err`, to be returned by `get()` on the consumer side.
    pub fn set_exception(&self, err: Error) -> Result<(), Error> {
        self.state()?.set_exception(err)
    }

    pub fn swap(&mut self, other: &mut Promise<T>) {
        mem::swap(&mut self.state, &mut other.state);
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Promise<T> {
    /// If this is an unsatisfied promise that someone still waits on, wake them with an error.
    fn drop(&mut self) {
        if let Some(state) = &self.state {
            if !state.has_value() && state.use_count() > 1 {
                log::warn!("promise dropped before it was satisfied");
                // Losing the race against a concurrent set is fine, the waiter has a result.
                let _ = state.set_exception(Error::BrokenPromise);
            }
        }
    }
}

impl<T> Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attached = self.state.as_ref().map(|state| state.has_future_attached());
        f.debug_struct("Promise")
            .field("state", &self.state)
            .field("future_attached", &attached)
            .finish()
    }
}
