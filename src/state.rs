//! The completion state shared by every handle.
//!
//! A state is a mutex-guarded bitmask of flags, an optional stored error, the typed value
//! slot, and the producer describing how the state becomes ready:
//!
//! ```ascii
//! {}  ──set_value/set_exception/execute──▶  {READY[, CONSTRUCTED]}
//!  │                                              ▲
//!  └─▶ {DEFERRED} ──first wait: clear, execute────┘
//! ```
//!
//! `FUTURE_ATTACHED` may be added at any point before the value is taken. `READY` is never
//! cleared and `CONSTRUCTED` and the stored error never coexist.
use crate::count::SharedCount;
use crate::request::BoxedRequest;
use crate::Error;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt::{self, Debug};
use std::ops::{BitOr, Deref};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use std::{mem, thread};

/// Result of a bounded wait.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FutureStatus {
    Ready,
    Timeout,
    /// The state holds deferred work. Timed waits never run it; call `wait()` or `get()`.
    Deferred,
}

#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub(crate) struct Flags(u8);

impl Flags {
    pub(crate) const CONSTRUCTED: Flags = Flags(1);
    pub(crate) const FUTURE_ATTACHED: Flags = Flags(2);
    pub(crate) const READY: Flags = Flags(4);
    pub(crate) const DEFERRED: Flags = Flags(8);

    pub(crate) fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Flags::CONSTRUCTED, "CONSTRUCTED"),
            (Flags::FUTURE_ATTACHED, "FUTURE_ATTACHED"),
            (Flags::READY, "READY"),
            (Flags::DEFERRED, "DEFERRED"),
        ];
        f.debug_set()
            .entries(names.iter().filter(|(flag, _)| self.contains(*flag)).map(|(_, name)| name))
            .finish()
    }
}

pub(crate) type Task<T> = Box<dyn FnOnce() -> T + Send>;
pub(crate) type Issuer<T> = Box<dyn FnOnce() -> BoxedRequest<T> + Send>;

enum Issue<T> {
    Pending(Issuer<T>),
    InFlight(BoxedRequest<T>),
    Finished,
}

/// How a state becomes ready. Exactly one per state.
enum Producer<T> {
    /// Only an explicit `set_value`/`set_exception` completes it.
    Promise,
    Deferred(Mutex<Option<Task<T>>>),
    Thread(Mutex<Option<Task<T>>>),
    /// The mutex guards the request slot while it is issued or tested. A blocking wait
    /// moves the request out first, so the slot is never locked across it.
    Request(Mutex<Issue<T>>),
}

impl<T> Producer<T> {
    fn name(&self) -> &'static str {
        match self {
            Producer::Promise => "promise",
            Producer::Deferred(_) => "deferred",
            Producer::Thread(_) => "thread",
            Producer::Request(_) => "request",
        }
    }
}

struct Inner<T> {
    flags: Flags,
    exception: Option<Error>,
    value: Option<T>,
    wakers: Vec<Waker>,
}

impl<T> Inner<T> {
    fn has_value(&self) -> bool {
        self.flags.contains(Flags::CONSTRUCTED) || self.exception.is_some()
    }
}

pub(crate) struct AssocState<T> {
    count: SharedCount,
    inner: Mutex<Inner<T>>,
    cv: Condvar,
    producer: Producer<T>,
}

const MAX_POLL_BACKOFF: Duration = Duration::from_millis(5);

impl<T> AssocState<T> {
    fn with_producer(producer: Producer<T>, flags: Flags) -> Self {
        log::trace!("new {} state", producer.name());
        Self {
            count: SharedCount::new(),
            inner: Mutex::new(Inner {
                flags,
                exception: None,
                value: None,
                wakers: Vec::new(),
            }),
            cv: Condvar::new(),
            producer,
        }
    }

    pub(crate) fn new() -> Self {
        Self::with_producer(Producer::Promise, Flags::default())
    }

    pub(crate) fn deferred(task: Task<T>) -> Self {
        Self::with_producer(Producer::Deferred(Mutex::new(Some(task))), Flags::DEFERRED)
    }

    pub(crate) fn thread(task: Task<T>) -> Self {
        Self::with_producer(Producer::Thread(Mutex::new(Some(task))), Flags::default())
    }

    pub(crate) fn request(issue: Issuer<T>) -> Self {
        Self::with_producer(
            Producer::Request(Mutex::new(Issue::Pending(issue))),
            Flags::default(),
        )
    }

    pub(crate) fn use_count(&self) -> usize {
        self.count.use_count()
    }

    pub(crate) fn has_value(&self) -> bool {
        self.inner.lock().has_value()
    }

    pub(crate) fn has_future_attached(&self) -> bool {
        self.inner.lock().flags.contains(Flags::FUTURE_ATTACHED)
    }

    pub(crate) fn attach_future(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.flags.contains(Flags::FUTURE_ATTACHED) {
            return Err(Error::AlreadyRetrieved);
        }
        inner.flags.insert(Flags::FUTURE_ATTACHED);
        Ok(())
    }

    pub(crate) fn set_value(&self, value: T) -> Result<(), Error> {
        self.publish(Ok(value))
    }

    pub(crate) fn set_exception(&self, err: Error) -> Result<(), Error> {
        self.publish(Err(err))
    }

    fn publish(&self, outcome: Result<T, Error>) -> Result<(), Error> {
        let wakers = {
            let mut inner = self.inner.lock();
            if inner.has_value() {
                return Err(Error::PromiseAlreadySatisfied);
            }
            match outcome {
                Ok(value) => {
                    inner.value = Some(value);
                    inner.flags.insert(Flags::CONSTRUCTED | Flags::READY);
                }
                Err(err) => {
                    inner.exception = Some(err);
                    inner.flags.insert(Flags::READY);
                }
            }
            self.cv.notify_all();
            mem::take(&mut inner.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
        Ok(())
    }

    /// Publishes the outcome of this state's own producer, which cannot race a promise.
    fn complete(&self, outcome: Result<T, Error>) {
        if let Err(err) = self.publish(outcome) {
            log::warn!("{} state completed twice: {}", self.producer.name(), err);
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        if self.inner.lock().flags.contains(Flags::READY) {
            return true;
        }
        match &self.producer {
            Producer::Request(issue) => self.test_request(issue),
            _ => false,
        }
    }

    /// Blocks until the state is ready, running deferred work inline if there is any.
    pub(crate) fn wait(&self) {
        match &self.producer {
            Producer::Request(issue) => self.wait_request(issue),
            _ => {
                let mut inner = self.inner.lock();
                self.sub_wait(&mut inner);
            }
        }
    }

    fn sub_wait(&self, inner: &mut MutexGuard<'_, Inner<T>>) {
        if inner.flags.contains(Flags::READY) {
            return;
        }
        if inner.flags.contains(Flags::DEFERRED) {
            inner.flags.remove(Flags::DEFERRED);
            MutexGuard::unlocked(inner, || {
                log::debug!("running deferred work inline");
                if let Err(err) = self.execute() {
                    self.complete(Err(err));
                }
            });
        }
        while !inner.flags.contains(Flags::READY) {
            self.cv.wait(inner);
        }
    }

    pub(crate) fn wait_for(&self, timeout: Duration) -> FutureStatus {
        self.timed_wait(Instant::now().checked_add(timeout))
    }

    pub(crate) fn wait_until(&self, deadline: Instant) -> FutureStatus {
        self.timed_wait(Some(deadline))
    }

    fn timed_wait(&self, deadline: Option<Instant>) -> FutureStatus {
        if let Producer::Request(_) = &self.producer {
            return self.poll_until(deadline);
        }
        let mut inner = self.inner.lock();
        if inner.flags.contains(Flags::DEFERRED) {
            return FutureStatus::Deferred;
        }
        while !inner.flags.contains(Flags::READY) {
            match deadline {
                Some(deadline) => {
                    if self.cv.wait_until(&mut inner, deadline).timed_out() {
                        break;
                    }
                }
                None => self.cv.wait(&mut inner),
            }
        }
        if inner.flags.contains(Flags::READY) {
            FutureStatus::Ready
        } else {
            FutureStatus::Timeout
        }
    }

    /// The transport offers no timed wait, so bounded waits on a request poll it. Between
    /// polls the condvar is waited on, which also catches a completion published by a
    /// thread blocked in [`AssocState::wait`].
    fn poll_until(&self, deadline: Option<Instant>) -> FutureStatus {
        let mut backoff = Duration::from_micros(50);
        loop {
            if self.is_ready() {
                return FutureStatus::Ready;
            }
            let now = Instant::now();
            let mut wake = now + backoff;
            if let Some(deadline) = deadline {
                if now >= deadline {
                    return FutureStatus::Timeout;
                }
                wake = wake.min(deadline);
            }
            let mut inner = self.inner.lock();
            if !inner.flags.contains(Flags::READY) {
                self.cv.wait_until(&mut inner, wake);
            }
            drop(inner);
            backoff = (backoff * 2).min(MAX_POLL_BACKOFF);
        }
    }

    /// Runs this state's producer. A promise-backed state has nothing to run.
    pub(crate) fn execute(&self) -> Result<(), Error> {
        match &self.producer {
            Producer::Promise => Err(Error::NoState),
            Producer::Deferred(task) | Producer::Thread(task) => {
                let task = task.lock().take().ok_or(Error::NoState)?;
                let outcome = panic::catch_unwind(AssertUnwindSafe(task)).map_err(|payload| {
                    let err = Error::from_panic(payload);
                    log::error!("{} work failed: {}", self.producer.name(), err);
                    err
                });
                self.complete(outcome);
                Ok(())
            }
            Producer::Request(issue) => {
                let mut issue = issue.lock();
                if !matches!(*issue, Issue::Pending(_)) {
                    return Err(Error::NoState);
                }
                self.issue_request(&mut issue);
                Ok(())
            }
        }
    }

    fn issue_request(&self, issue: &mut Issue<T>) {
        if let Issue::Pending(start) = mem::replace(issue, Issue::Finished) {
            log::trace!("issuing request");
            match panic::catch_unwind(AssertUnwindSafe(start)) {
                Ok(request) => *issue = Issue::InFlight(request),
                Err(payload) => {
                    let err = Error::from_panic(payload);
                    log::error!("issuing request failed: {}", err);
                    self.complete(Err(err));
                }
            }
        }
    }

    /// Never blocks: a slot that is busy, or whose request another thread is waiting on,
    /// reports not ready.
    fn test_request(&self, issue: &Mutex<Issue<T>>) -> bool {
        let Some(mut issue) = issue.try_lock() else {
            return false;
        };
        let done = match &mut *issue {
            Issue::InFlight(request) => request.test(),
            Issue::Pending(_) | Issue::Finished => false,
        };
        if !done {
            return false;
        }
        let done = mem::replace(&mut *issue, Issue::Finished);
        drop(issue);
        if let Issue::InFlight(request) = done {
            self.finish_request(request);
        }
        true
    }

    fn wait_request(&self, issue: &Mutex<Issue<T>>) {
        if self.inner.lock().flags.contains(Flags::READY) {
            return;
        }
        let taken = {
            let mut issue = issue.lock();
            if matches!(*issue, Issue::Pending(_)) {
                self.issue_request(&mut issue);
            }
            match mem::replace(&mut *issue, Issue::Finished) {
                Issue::InFlight(request) => Some(request),
                Issue::Pending(_) | Issue::Finished => None,
            }
        };
        match taken {
            Some(request) => self.finish_request(request),
            // Another thread owns the request and publishes when it completes.
            None => {
                let mut inner = self.inner.lock();
                while !inner.flags.contains(Flags::READY) {
                    self.cv.wait(&mut inner);
                }
            }
        }
    }

    fn finish_request(&self, mut request: BoxedRequest<T>) {
        let outcome = request.wait();
        if let Err(err) = &outcome {
            log::error!("request wait failed: {}", err);
        }
        self.complete(outcome);
    }

    /// Waits and moves the result out. Only the single attached consumer calls this.
    pub(crate) fn take(&self) -> Result<T, Error> {
        self.wait();
        let mut inner = self.inner.lock();
        if let Some(err) = &inner.exception {
            return Err(err.clone());
        }
        inner.value.take().ok_or(Error::AlreadyRetrieved)
    }

    /// Non-blocking counterpart of [`AssocState::take`] for `std::future::Future` consumers.
    pub(crate) fn poll_take(&self, cx: &mut Context<'_>) -> Poll<Result<T, Error>> {
        if let Producer::Request(_) = &self.producer {
            if self.is_ready() {
                return Poll::Ready(self.take());
            }
            // Transports do not call back, so ask to be polled again.
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        {
            let mut inner = self.inner.lock();
            if !inner.flags.contains(Flags::READY) && !inner.flags.contains(Flags::DEFERRED) {
                if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    inner.wakers.push(cx.waker().clone());
                }
                return Poll::Pending;
            }
        }
        Poll::Ready(self.take())
    }

    /// Runs when the last owning handle goes away. Thread and request producers may still
    /// be writing into the state, so block until they are done.
    fn on_zero_shared(&self) {
        match &self.producer {
            Producer::Thread(_) | Producer::Request(_) => self.wait(),
            Producer::Promise | Producer::Deferred(_) => {}
        }
    }

    /// Takes back the callable of a thread state whose thread never started.
    fn reclaim_task(&self) -> Option<Task<T>> {
        match &self.producer {
            Producer::Thread(task) | Producer::Deferred(task) => task.lock().take(),
            Producer::Promise | Producer::Request(_) => None,
        }
    }
}

impl<T> Debug for AssocState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (flags, has_exception) = match self.inner.try_lock() {
            Some(inner) => (Some(inner.flags), inner.exception.is_some()),
            None => (None, false),
        };
        f.debug_struct("AssocState")
            .field("producer", &self.producer.name())
            .field("flags", &flags)
            .field("has_exception", &has_exception)
            .field("count", &self.count)
            .finish()
    }
}

/// An owning reference: one unit of the state's owner count.
pub(crate) struct StateRef<T> {
    state: Arc<AssocState<T>>,
}

impl<T> StateRef<T> {
    pub(crate) fn new(state: AssocState<T>) -> Self {
        Self {
            state: Arc::new(state),
        }
    }
}

impl<T: Send + 'static> StateRef<T> {
    /// Starts `task` on its own detached thread. If the thread cannot be started the error
    /// is returned together with the untouched task.
    pub(crate) fn spawn(
        builder: thread::Builder,
        task: Task<T>,
    ) -> Result<Self, (Error, Option<Task<T>>)> {
        let state = StateRef::new(AssocState::thread(task));
        // Not an owner: the thread only keeps the memory alive, it never releases.
        let worker = Arc::clone(&state.state);
        let spawned = builder.spawn(move || {
            if let Err(err) = worker.execute() {
                log::error!("thread state had nothing to run: {}", err);
            }
        });
        match spawned {
            Ok(_detached) => {
                log::trace!("spawned worker thread");
                Ok(state)
            }
            Err(err) => {
                let err = Error::Spawn(Arc::new(err));
                let task = state.reclaim_task();
                // Nothing will ever run, so make the zero-owner wait return at once.
                state.complete(Err(err.clone()));
                Err((err, task))
            }
        }
    }
}

impl<T> Clone for StateRef<T> {
    fn clone(&self) -> Self {
        self.state.count.add_owner();
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Drop for StateRef<T> {
    fn drop(&mut self) {
        if self.state.count.release_owner() {
            self.state.on_zero_shared();
        }
    }
}

impl<T> Deref for StateRef<T> {
    type Target = AssocState<T>;

    fn deref(&self) -> &AssocState<T> {
        &self.state
    }
}

impl<T> Debug for StateRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&*self.state, f)
    }
}
