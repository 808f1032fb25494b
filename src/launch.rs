//! Entry points that create a state together with its producer.
use crate::request::Request;
use crate::state::{AssocState, StateRef, Task};
use crate::{Error, Future};
use std::fmt;
use std::ops::{BitAnd, BitOr};
use std::thread;

/// Where [`launch`] may run its callable.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Launch(u8);

impl Launch {
    /// On a new thread, started right away.
    pub const ASYNC: Launch = Launch(1);
    /// Inline, on the first thread that waits for the result.
    pub const DEFERRED: Launch = Launch(2);
    /// A thread if one can be started, deferred otherwise.
    pub const ANY: Launch = Launch(1 | 2);

    pub fn contains(self, other: Launch) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Launch {
    type Output = Launch;

    fn bitor(self, rhs: Launch) -> Launch {
        Launch(self.0 | rhs.0)
    }
}

impl BitAnd for Launch {
    type Output = Launch;

    fn bitand(self, rhs: Launch) -> Launch {
        Launch(self.0 & rhs.0)
    }
}

impl Default for Launch {
    fn default() -> Self {
        Launch::ANY
    }
}

impl fmt::Debug for Launch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Launch::ASYNC => f.write_str("Launch::ASYNC"),
            Launch::DEFERRED => f.write_str("Launch::DEFERRED"),
            Launch::ANY => f.write_str("Launch::ANY"),
            Launch(bits) => write!(f, "Launch({:#x})", bits),
        }
    }
}

/// Configures the worker threads used by [`Launch::ASYNC`].
///
/// # Examples
///
/// ```
/// use mpiex::{Builder, Launch};
///
/// let mut future = Builder::new()
///     .name("worker".into())
///     .launch(Launch::ASYNC, || std::thread::current().name().map(String::from))
///     .unwrap();
/// assert_eq!(future.get().unwrap().as_deref(), Some("worker"));
/// ```
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: String) -> Self {
        self.name = Some(name);
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    fn thread_builder(&self) -> thread::Builder {
        let mut builder = thread::Builder::new();
        if let Some(name) = &self.name {
            builder = builder.name(name.clone());
        }
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        builder
    }

    /// Runs `f` according to `policy`.
    ///
    /// With [`Launch::ASYNC`] in the policy a thread is tried first. If it cannot be started,
    /// the error is returned when the policy is exactly [`Launch::ASYNC`]; otherwise `f` is
    /// deferred if the policy allows it. A policy allowing neither yields a future without
    /// a state.
    pub fn launch<F, T>(self, policy: Launch, f: F) -> Result<Future<T>, Error>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut task: Option<Task<T>> = Some(Box::new(f));
        if policy.contains(Launch::ASYNC) {
            if let Some(f) = task.take() {
                match StateRef::spawn(self.thread_builder(), f) {
                    Ok(state) => return Future::attach(state),
                    Err((err, _)) if policy == Launch::ASYNC => return Err(err),
                    Err((err, reclaimed)) => {
                        log::debug!("falling back to deferred launch: {}", err);
                        task = reclaimed;
                    }
                }
            }
        }
        if policy.contains(Launch::DEFERRED) {
            if let Some(f) = task {
                return Future::attach(StateRef::new(AssocState::deferred(f)));
            }
        }
        Ok(Future::default())
    }

    /// [`Builder::launch`] with [`Launch::ANY`], which cannot fail.
    pub fn spawn<F, T>(self, f: F) -> Future<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.launch(Launch::ANY, f).unwrap_or_default()
    }
}

/// Runs `f` according to `policy` with default thread settings. See [`Builder::launch`].
///
/// # Examples
///
/// ```
/// use mpiex::{launch, FutureStatus, Launch};
///
/// let mut future = launch(Launch::DEFERRED, || 3).unwrap();
/// assert_eq!(future.wait_for(std::time::Duration::ZERO).unwrap(), FutureStatus::Deferred);
/// assert_eq!(future.get().unwrap(), 3);
/// ```
pub fn launch<F, T>(policy: Launch, f: F) -> Result<Future<T>, Error>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new().launch(policy, f)
}

/// Runs `f` on a new thread, or deferred if no thread can be started.
pub fn spawn<F, T>(f: F) -> Future<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new().spawn(f)
}

/// Issues a non-blocking operation now and returns a future for its completion.
///
/// `issue` is called before this function returns; only the completion is deferred. The
/// future is ready once [`Request::test`] reports completion or a wait on it returns. When
/// the last handle goes away the request is waited on, never abandoned.
pub fn request_async<F, R>(issue: F) -> Future<R::Output>
where
    F: FnOnce() -> R + Send + 'static,
    R: Request + 'static,
{
    let state = StateRef::new(AssocState::request(Box::new(move || {
        Box::new(issue()) as crate::request::BoxedRequest<R::Output>
    })));
    if let Err(err) = state.execute() {
        log::error!("request state had nothing to issue: {}", err);
    }
    // A fresh state has no future yet.
    Future::attach(state).unwrap_or_default()
}
