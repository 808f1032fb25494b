use crate::Error;
use std::sync::Arc;

/// A non-blocking operation that has already been issued to a transport.
///
/// This is the only thing a request-backed future knows about the transport: it can ask
/// whether the operation has finished and it can block until it has. Implementations are
/// free to make progress on the operation from either call.
///
/// # Examples
///
/// ```
/// use mpiex::{request_async, Request};
/// use std::convert::Infallible;
///
/// struct Immediate(Option<u32>);
///
/// impl Request for Immediate {
///     type Output = u32;
///     type Error = Infallible;
///     fn test(&mut self) -> bool {
///         true
///     }
///     fn wait(&mut self) -> Result<u32, Infallible> {
///         Ok(self.0.take().unwrap_or_default())
///     }
/// }
///
/// let mut future = request_async(|| Immediate(Some(9)));
/// assert!(future.is_ready());
/// assert_eq!(future.get().unwrap(), 9);
/// ```
pub trait Request: Send {
    /// What a completed operation yields, `()` for a plain send.
    type Output: Send;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Returns `true` once the operation has completed. After that, [`Request::wait`] must
    /// return without blocking.
    fn test(&mut self) -> bool;

    /// Blocks until the operation completes. Called at most once per request by this crate.
    fn wait(&mut self) -> Result<Self::Output, Self::Error>;
}

/// Object-safe form of [`Request`] with the transport error already folded into [`Error`].
pub(crate) trait ErasedRequest<T>: Send {
    fn test(&mut self) -> bool;
    fn wait(&mut self) -> Result<T, Error>;
}

impl<R: Request> ErasedRequest<R::Output> for R {
    fn test(&mut self) -> bool {
        Request::test(self)
    }

    fn wait(&mut self) -> Result<R::Output, Error> {
        Request::wait(self).map_err(|e| Error::Transport(Arc::new(e)))
    }
}

pub(crate) type BoxedRequest<T> = Box<dyn ErasedRequest<T>>;
