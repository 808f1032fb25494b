//! Point-to-point messaging whose operations complete request-backed futures.
//!
//! A [`World`] is a group of `size` endpoints sharing one in-process transport; each
//! endpoint is a [`Communicator`] with its own rank. Messages are matched on
//! (source, destination, tag) and delivered in the order they were sent for that triple.
//!
//! A send is a rendezvous: its future becomes ready only once a matching receive has taken
//! the message. A receive makes progress whenever its future is tested or waited on.
//!
//! # Examples
//!
//! ```
//! use mpiex::comm::{receive, send_value, World};
//! use std::thread;
//!
//! let world = World::new(2);
//! let (a, b) = (world.communicator(0).unwrap(), world.communicator(1).unwrap());
//!
//! let sent = send_value(&a, 1, &42i64, 0);
//! assert!(!sent.is_ready());
//!
//! let task = thread::spawn(move || receive::<i64>(&b, 0, 0).get());
//! sent.wait().unwrap();
//! assert_eq!(task.join().expect("The task thread has panicked").unwrap(), 42);
//! ```
use crate::{request_async, Future, Request};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Why a messaging operation failed. Reaches consumers as [`Error::Transport`](crate::Error::Transport).
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("rank {rank} is out of range for a world of size {size}")]
    InvalidRank { rank: usize, size: usize },
    #[error("message of {received} elements does not fit a receive of {capacity}")]
    Truncated { capacity: usize, received: usize },
    #[error("message element type does not match the receive")]
    TypeMismatch,
    #[error("message is empty")]
    EmptyMessage,
    #[error("request already completed")]
    Completed,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
struct Envelope {
    source: usize,
    dest: usize,
    tag: i32,
}

struct Parcel {
    payload: Box<dyn Any + Send>,
    delivered: Arc<AtomicBool>,
}

struct Fabric {
    size: usize,
    mailboxes: Mutex<HashMap<Envelope, VecDeque<Parcel>>>,
    progress: Condvar,
}

impl Fabric {
    fn check_rank(&self, rank: usize) -> Result<(), CommError> {
        if rank < self.size {
            Ok(())
        } else {
            Err(CommError::InvalidRank {
                rank,
                size: self.size,
            })
        }
    }

    fn post(&self, envelope: Envelope, payload: Box<dyn Any + Send>) -> Arc<AtomicBool> {
        let delivered = Arc::new(AtomicBool::new(false));
        let parcel = Parcel {
            payload,
            delivered: delivered.clone(),
        };
        self.mailboxes
            .lock()
            .entry(envelope)
            .or_default()
            .push_back(parcel);
        log::trace!("posted {:?}", envelope);
        self.progress.notify_all();
        delivered
    }

    /// Takes the oldest parcel for `envelope` and tells its sender. Call with the lock held.
    fn claim(
        &self,
        mailboxes: &mut MutexGuard<'_, HashMap<Envelope, VecDeque<Parcel>>>,
        envelope: &Envelope,
    ) -> Option<Box<dyn Any + Send>> {
        let queue = mailboxes.get_mut(envelope)?;
        let parcel = queue.pop_front()?;
        if queue.is_empty() {
            mailboxes.remove(envelope);
        }
        parcel.delivered.store(true, Ordering::Release);
        self.progress.notify_all();
        log::trace!("delivered {:?}", envelope);
        Some(parcel.payload)
    }
}

/// A group of endpoints sharing one transport.
#[derive(Clone)]
pub struct World {
    fabric: Arc<Fabric>,
}

impl World {
    pub fn new(size: usize) -> Self {
        Self {
            fabric: Arc::new(Fabric {
                size,
                mailboxes: Mutex::new(HashMap::new()),
                progress: Condvar::new(),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.fabric.size
    }

    pub fn communicator(&self, rank: usize) -> Result<Communicator, CommError> {
        self.fabric.check_rank(rank)?;
        Ok(Communicator {
            rank,
            world: self.clone(),
        })
    }

    /// One communicator per rank, in rank order.
    pub fn communicators(&self) -> Vec<Communicator> {
        (0..self.size())
            .map(|rank| Communicator {
                rank,
                world: self.clone(),
            })
            .collect()
    }
}

impl Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World").field("size", &self.size()).finish()
    }
}

/// One endpoint of a [`World`].
#[derive(Clone, Debug)]
pub struct Communicator {
    rank: usize,
    world: World,
}

impl Communicator {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.world.size()
    }

    /// The transport this endpoint belongs to.
    pub fn world(&self) -> &World {
        &self.world
    }

    fn fabric(&self) -> &Arc<Fabric> {
        &self.world.fabric
    }
}

/// An in-flight send. Complete once a receive has claimed the message.
pub struct SendRequest {
    fabric: Arc<Fabric>,
    delivered: Arc<AtomicBool>,
    failure: Option<CommError>,
}

impl Request for SendRequest {
    type Output = ();
    type Error = CommError;

    fn test(&mut self) -> bool {
        self.failure.is_some() || self.delivered.load(Ordering::Acquire)
    }

    fn wait(&mut self) -> Result<(), CommError> {
        if let Some(err) = self.failure.take() {
            return Err(err);
        }
        let mut mailboxes = self.fabric.mailboxes.lock();
        while !self.delivered.load(Ordering::Acquire) {
            self.fabric.progress.wait(&mut mailboxes);
        }
        Ok(())
    }
}

/// An in-flight receive of at most `capacity` elements.
pub struct RecvRequest<T> {
    fabric: Arc<Fabric>,
    envelope: Envelope,
    capacity: usize,
    received: Option<Result<Vec<T>, CommError>>,
    completed: bool,
}

impl<T: Send + 'static> RecvRequest<T> {
    fn accept(&mut self, payload: Box<dyn Any + Send>) {
        let outcome = match payload.downcast::<Vec<T>>() {
            Ok(data) if data.len() > self.capacity => Err(CommError::Truncated {
                capacity: self.capacity,
                received: data.len(),
            }),
            Ok(data) => Ok(*data),
            Err(_) => Err(CommError::TypeMismatch),
        };
        self.received = Some(outcome);
        self.completed = true;
    }
}

impl<T: Send + 'static> Request for RecvRequest<T> {
    type Output = Vec<T>;
    type Error = CommError;

    fn test(&mut self) -> bool {
        if !self.completed {
            let payload = self.fabric.claim(&mut self.fabric.mailboxes.lock(), &self.envelope);
            if let Some(payload) = payload {
                self.accept(payload);
            }
        }
        self.completed
    }

    fn wait(&mut self) -> Result<Vec<T>, CommError> {
        if !self.completed {
            let fabric = self.fabric.clone();
            let mut mailboxes = fabric.mailboxes.lock();
            let payload = loop {
                if let Some(payload) = fabric.claim(&mut mailboxes, &self.envelope) {
                    break payload;
                }
                fabric.progress.wait(&mut mailboxes);
            };
            drop(mailboxes);
            self.accept(payload);
        }
        self.received.take().unwrap_or(Err(CommError::Completed))
    }
}

/// A receive of exactly one element.
pub struct RecvValue<T> {
    inner: RecvRequest<T>,
}

impl<T: Send + 'static> Request for RecvValue<T> {
    type Output = T;
    type Error = CommError;

    fn test(&mut self) -> bool {
        self.inner.test()
    }

    fn wait(&mut self) -> Result<T, CommError> {
        self.inner
            .wait()?
            .into_iter()
            .next()
            .ok_or(CommError::EmptyMessage)
    }
}

fn recv_request<T>(comm: &Communicator, source: usize, capacity: usize, tag: i32) -> RecvRequest<T> {
    let fabric = comm.fabric().clone();
    let received = fabric.check_rank(source).err().map(Err);
    RecvRequest {
        envelope: Envelope {
            source,
            dest: comm.rank(),
            tag,
        },
        fabric,
        capacity,
        completed: received.is_some(),
        received,
    }
}

/// Sends a copy of `data` to rank `dest`. The future is ready once the receiver has it.
pub fn send<T>(comm: &Communicator, dest: usize, data: &[T], tag: i32) -> Future<()>
where
    T: Clone + Send + 'static,
{
    let fabric = comm.fabric().clone();
    let envelope = Envelope {
        source: comm.rank(),
        dest,
        tag,
    };
    let data = data.to_vec();
    request_async(move || match fabric.check_rank(dest) {
        Ok(()) => SendRequest {
            delivered: fabric.post(envelope, Box::new(data)),
            fabric,
            failure: None,
        },
        Err(err) => SendRequest {
            delivered: Arc::new(AtomicBool::new(false)),
            fabric,
            failure: Some(err),
        },
    })
}

/// Sends a single value to rank `dest`.
pub fn send_value<T>(comm: &Communicator, dest: usize, value: &T, tag: i32) -> Future<()>
where
    T: Clone + Send + 'static,
{
    send(comm, dest, std::slice::from_ref(value), tag)
}

/// Receives up to `capacity` elements from rank `source`.
pub fn recv<T>(comm: &Communicator, source: usize, capacity: usize, tag: i32) -> Future<Vec<T>>
where
    T: Send + 'static,
{
    let request = recv_request(comm, source, capacity, tag);
    request_async(move || request)
}

/// Receives a single value from rank `source`.
pub fn receive<T>(comm: &Communicator, source: usize, tag: i32) -> Future<T>
where
    T: Send + 'static,
{
    let inner = recv_request(comm, source, 1, tag);
    request_async(move || RecvValue { inner })
}

#[cfg(test)]
mod tests {
    use super::{receive, recv, send, send_value, CommError, World};
    use crate::Error;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn transport_error(err: Error) -> String {
        match err {
            Error::Transport(inner) => inner.to_string(),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_world_ranks() {
        let world = World::new(3);
        let comms = world.communicators();
        assert_eq!(comms.len(), 3);
        assert_eq!(comms[2].rank(), 2);
        assert_eq!(comms[2].size(), 3);
        assert_eq!(comms[0].world().size(), 3);
        assert!(matches!(
            world.communicator(3),
            Err(CommError::InvalidRank { rank: 3, size: 3 })
        ));
    }

    #[test]
    fn test_send_is_ready_only_after_receive() {
        let world = World::new(2);
        let comms = world.communicators();
        let sent = send(&comms[0], 1, &[1u8, 2, 3], 7);
        thread::sleep(Duration::from_millis(10));
        assert!(!sent.is_ready());

        let mut received = recv::<u8>(&comms[1], 0, 8, 7);
        assert!(received.is_ready());
        assert!(sent.is_ready());
        assert_eq!(received.get().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_receive_before_send() {
        let world = World::new(2);
        let comms = world.communicators();
        let mut received = receive::<f32>(&comms[1], 0, 0);
        assert!(!received.is_ready());
        let sent = send_value(&comms[0], 1, &2.5f32, 0);
        assert!(received.is_ready());
        assert_eq!(received.get().unwrap(), 2.5);
        sent.wait().unwrap();
    }

    #[test]
    fn test_dropping_send_waits_for_delivery() {
        let world = World::new(2);
        let comms = world.communicators();
        let receiving = Arc::new(AtomicBool::new(false));
        let flag = receiving.clone();
        let peer = comms[1].clone();
        let task = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
            receive::<u32>(&peer, 0, 0).get()
        });
        let sent = send_value(&comms[0], 1, &5u32, 0);
        drop(sent);
        assert!(receiving.load(Ordering::SeqCst));
        assert_eq!(task.join().expect("The task thread has panicked").unwrap(), 5);
    }

    #[test]
    fn test_tags_are_matched_separately() {
        let world = World::new(2);
        let comms = world.communicators();
        let _a = send_value(&comms[0], 1, &1u32, 1);
        let _b = send_value(&comms[0], 1, &2u32, 2);
        assert_eq!(receive::<u32>(&comms[1], 0, 2).get().unwrap(), 2);
        assert_eq!(receive::<u32>(&comms[1], 0, 1).get().unwrap(), 1);
    }

    #[test]
    fn test_fifo_per_envelope() {
        let world = World::new(2);
        let comms = world.communicators();
        let sends: Vec<_> = (0..4u32).map(|i| send_value(&comms[0], 1, &i, 0)).collect();
        for i in 0..4u32 {
            assert_eq!(receive::<u32>(&comms[1], 0, 0).get().unwrap(), i);
        }
        for sent in sends {
            assert!(sent.is_ready());
        }
    }

    #[test]
    fn test_truncated_receive() {
        let world = World::new(2);
        let comms = world.communicators();
        let _sent = send(&comms[0], 1, &[0u8; 4], 0);
        let message = transport_error(recv::<u8>(&comms[1], 0, 2, 0).get().unwrap_err());
        assert_eq!(message, "message of 4 elements does not fit a receive of 2");
    }

    #[test]
    fn test_type_mismatch() {
        let world = World::new(2);
        let comms = world.communicators();
        let _sent = send_value(&comms[0], 1, &1u8, 0);
        let message = transport_error(receive::<u64>(&comms[1], 0, 0).get().unwrap_err());
        assert_eq!(message, CommError::TypeMismatch.to_string());
    }

    #[test]
    fn test_invalid_ranks() {
        let world = World::new(1);
        let comm = world.communicator(0).unwrap();
        let mut sent = send_value(&comm, 5, &1u8, 0);
        assert!(sent.is_ready());
        assert!(transport_error(sent.get().unwrap_err()).contains("rank 5"));
        let mut received = receive::<u8>(&comm, 9, 0);
        assert!(transport_error(received.get().unwrap_err()).contains("rank 9"));
    }

    #[test]
    fn test_empty_message() {
        let world = World::new(1);
        let comm = world.communicator(0).unwrap();
        let _sent = send::<u8>(&comm, 0, &[], 0);
        let message = transport_error(receive::<u8>(&comm, 0, 0).get().unwrap_err());
        assert_eq!(message, CommError::EmptyMessage.to_string());
    }

    #[test]
    fn test_blocking_exchange_across_threads() {
        let world = World::new(2);
        let mut comms = world.communicators().into_iter();
        let (a, b) = (comms.next().unwrap(), comms.next().unwrap());
        let task1 = thread::spawn(move || {
            send_value(&a, 1, &String::from("🍓"), 3).wait().unwrap();
            receive::<String>(&a, 1, 4).get().unwrap()
        });
        let task2 = thread::spawn(move || {
            let got = receive::<String>(&b, 0, 3).get().unwrap();
            send_value(&b, 0, &format!("{}!", got), 4).wait().unwrap();
        });
        task2.join().expect("The task2 thread has panicked");
        assert_eq!(task1.join().expect("The task1 thread has panicked"), "🍓!");
    }
}
