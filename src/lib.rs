//! Futures and promises whose result is produced either by ordinary work on a thread or by a
//! non-blocking message-passing request completing.
//!
//! Every handle in this crate refers to one reference-counted completion state. A state is
//! made ready in exactly one of three ways:
//!
//! - deferred work, run inline by the first thread that waits on it ([`launch`] with
//!   [`Launch::DEFERRED`]);
//! - work started eagerly on a detached thread ([`launch`] with [`Launch::ASYNC`], [`spawn`]);
//! - a non-blocking [`Request`] issued immediately and completed by the transport
//!   ([`request_async`], and the [`comm`] helpers built on it).
//!
//! or explicitly by a [`Promise`] or [`PackagedTask`].
//!
//! # Examples
//!
//! ```
//! use mpiex::spawn;
//!
//! let mut future = spawn(|| 3);
//! assert_eq!(future.get().unwrap(), 3);
//! ```
//!
//! A promise handed to another thread:
//!
//! ```
//! use mpiex::Promise;
//! use std::thread;
//!
//! let promise = Promise::new();
//! let mut future = promise.get_future().unwrap();
//! let task = thread::spawn(move || promise.set_value(String::from("Hi")).unwrap());
//! assert_eq!(future.get().unwrap(), "Hi");
//! task.join().expect("The task thread has panicked");
//! ```
use std::any::Any;
use std::io;
use std::sync::Arc;

pub mod comm;
mod count;
mod future;
mod launch;
mod promise;
mod request;
mod state;
mod task;

pub use future::{Future, SharedFuture};
pub use launch::{launch, request_async, spawn, Builder, Launch};
pub use promise::Promise;
pub use request::Request;
pub use state::FutureStatus;
pub use task::PackagedTask;

/// Everything a handle operation or a stored result can fail with.
///
/// The first four variants are protocol errors raised at the call site. The rest are
/// captured on the producing side and handed to whoever calls `get()`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("the handle has no associated state")]
    NoState,
    #[error("the future has already been retrieved")]
    AlreadyRetrieved,
    #[error("the promise has already been satisfied")]
    PromiseAlreadySatisfied,
    #[error("the promise was dropped before it was satisfied")]
    BrokenPromise,
    #[error("transport operation failed: {0}")]
    Transport(Arc<dyn std::error::Error + Send + Sync>),
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("failed to spawn a worker thread: {0}")]
    Spawn(Arc<io::Error>),
    #[error("{0}")]
    Failed(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps an application error so it can be stored with [`Promise::set_exception`].
    pub fn failed<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Failed(Arc::new(err))
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => (*message).to_owned(),
                Err(_) => String::from("<opaque>"),
            },
        };
        Error::Panicked(message)
    }
}

#[cfg(test)]
mod tests {
    use super::Error;
    use std::panic;

    #[test]
    fn test_panic_message_is_kept() {
        let payload = panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        match Error::from_panic(payload) {
            Error::Panicked(message) => assert_eq!(message, "boom 7"),
            other => panic!("unexpected error {:?}", other),
        }

        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(Error::from_panic(payload).to_string(), "task panicked: static");
    }

    #[test]
    fn test_failed_displays_inner() {
        let err = Error::failed(std::fmt::Error);
        assert_eq!(err.to_string(), std::fmt::Error.to_string());
    }
}
