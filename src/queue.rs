//! Bounded queues between pipeline stages.
//!
//! A [`Queue`] carries [`Message`]s: either a [`Task`] or the explicit
//! [`Message::Shutdown`] signal. Capacity is the pipeline's flow control: a
//! full queue blocks its producer, so a fast stage cannot run ahead of a slow
//! one and fill memory or disk. A capacity of `0` means unbounded.
//!
//! Both directions expose a timeout variant. Workers and the orchestrator never
//! block forever; they wake up periodically to check whether the run is
//! stopping.

use crossbeam_channel::{
    Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded, unbounded,
};
use std::time::Duration;

/// One unit of work travelling between two stages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task<T> {
    pub batch_index: usize,
    pub payload: T,
}

impl<T> Task<T> {
    #[must_use]
    pub fn new(batch_index: usize, payload: T) -> Self {
        Self { batch_index, payload }
    }
}

/// What a worker can find at the head of its queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message<T> {
    Task(Task<T>),
    /// Tear down and exit. Delivered exactly once per worker by the orchestrator.
    Shutdown,
}

/// Outcome of a timed dequeue.
#[derive(Debug, PartialEq, Eq)]
pub enum Recv<T> {
    Message(Message<T>),
    /// Nothing arrived within the timeout.
    Idle,
    /// Every sender is gone; the queue can never produce again.
    Closed,
}

/// Outcome of a timed enqueue that did not succeed.
#[derive(Debug, PartialEq, Eq)]
pub enum SendFailure<T> {
    /// The queue stayed full for the whole timeout; the message is handed back.
    Full(Message<T>),
    Closed(Message<T>),
}

/// A multi-producer, multi-consumer queue of [`Message`]s.
///
/// Cloning is cheap and yields another handle to the same channel.
pub struct Queue<T> {
    tx: Sender<Message<T>>,
    rx: Receiver<Message<T>>,
    capacity: Option<usize>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone(), rx: self.rx.clone(), capacity: self.capacity }
    }
}

impl<T> Queue<T> {
    /// Create a queue holding at most `capacity` messages (`0` = unbounded).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = if capacity == 0 { unbounded() } else { bounded(capacity) };
        Self { tx, rx, capacity: (capacity > 0).then_some(capacity) }
    }

    /// `None` when unbounded.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Enqueue a task, blocking while the queue is full.
    ///
    /// # Errors
    /// Returns the message back if the queue is closed.
    pub fn put(&self, task: Task<T>) -> Result<(), Message<T>> {
        self.tx.send(Message::Task(task)).map_err(|e| e.into_inner())
    }

    /// Enqueue a message, waiting at most `timeout` for room.
    ///
    /// # Errors
    /// Hands the message back when the queue stayed full or is closed.
    pub fn put_timeout(&self, msg: Message<T>, timeout: Duration) -> Result<(), SendFailure<T>> {
        self.tx.send_timeout(msg, timeout).map_err(|e| match e {
            SendTimeoutError::Timeout(m) => SendFailure::Full(m),
            SendTimeoutError::Disconnected(m) => SendFailure::Closed(m),
        })
    }

    /// Dequeue, waiting at most `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Recv<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(m) => Recv::Message(m),
            Err(RecvTimeoutError::Timeout) => Recv::Idle,
            Err(RecvTimeoutError::Disconnected) => Recv::Closed,
        }
    }

    /// Dequeue without blocking.
    pub fn try_get(&self) -> Option<Message<T>> {
        self.rx.try_recv().ok()
    }

    pub(crate) fn receiver(&self) -> &Receiver<Message<T>> {
        &self.rx
    }
}
