//! The process-wide queue registry and public operation surface.
//!
//! Queues are named by opaque [`QueueDescriptor`]s and pending operations by
//! opaque [`QueueToken`]s; every call dispatches on the descriptor. The
//! registry also drives the one operation that spans two queues: servicing an
//! accept attaches an incoming connection to the child queue that was created
//! when the accept was submitted.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use crate::error::{Error, Result};
use crate::memory::ScatterGatherArray;
use crate::queue::{Queue, SocketType};
use crate::task::{OperationResult, OperationType, PollResult, QueueToken};

/// Names one registered queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueDescriptor(u32);

impl QueueDescriptor {
    pub fn as_u32(self) -> u32 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u32) -> Self {
        QueueDescriptor(raw)
    }
}

impl fmt::Display for QueueDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owns every queue of the process and dispatches the public operation set
/// `{socket, bind, listen, accept, connect, close, push, pop, poll, drop}`.
///
/// The registry is single-threaded and cooperative: nothing here spawns
/// threads, and all progress on outstanding tokens is made inside
/// [`poll`](QueueRegistry::poll) and [`drop_token`](QueueRegistry::drop_token).
#[derive(Default)]
pub struct QueueRegistry {
    queues: HashMap<QueueDescriptor, Queue>,
    next_qd: u32,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_descriptor(&mut self) -> QueueDescriptor {
        let qd = QueueDescriptor(self.next_qd);
        self.next_qd += 1;
        qd
    }

    fn queue_mut(&mut self, qd: QueueDescriptor) -> Result<&mut Queue> {
        self.queues.get_mut(&qd).ok_or(Error::InvalidQueue(qd))
    }

    /// Create a new unconnected queue with its own event channel and
    /// connection-manager identifier.
    pub fn socket(&mut self, socket_type: SocketType) -> Result<QueueDescriptor> {
        let qd = self.alloc_descriptor();
        let mut queue = Queue::new(qd);
        queue.socket(socket_type)?;
        self.queues.insert(qd, queue);
        Ok(qd)
    }

    pub fn bind(&mut self, qd: QueueDescriptor, addr: SocketAddr) -> Result<()> {
        self.queue_mut(qd)?.bind(addr)
    }

    pub fn listen(&mut self, qd: QueueDescriptor, backlog: i32) -> Result<()> {
        self.queue_mut(qd)?.listen(backlog)
    }

    /// Synchronously resolve, route and connect to a listening peer. On
    /// success the queue is connected and its event channel switches to
    /// non-blocking mode.
    pub fn connect(&mut self, qd: QueueDescriptor, addr: SocketAddr) -> Result<()> {
        self.queue_mut(qd)?.connect(addr)
    }

    pub fn close(&mut self, qd: QueueDescriptor) -> Result<()> {
        self.queue_mut(qd)?.close()
    }

    /// Submit an accept on a listening queue. The child queue named by the
    /// returned descriptor is registered immediately and becomes connected
    /// when the token completes.
    pub fn accept(&mut self, qd: QueueDescriptor) -> Result<(QueueToken, QueueDescriptor)> {
        if !self.queues.contains_key(&qd) {
            return Err(Error::InvalidQueue(qd));
        }

        let child_qd = self.alloc_descriptor();
        let qt = QueueToken::next();
        self.queue_mut(qd)?.register_accept(qt, child_qd)?;
        self.queues.insert(child_qd, Queue::new(child_qd));
        Ok((qt, child_qd))
    }

    /// Submit an outbound message. The segments stay pinned until the send
    /// completion is observed by a later poll of the returned token.
    pub fn push(&mut self, qd: QueueDescriptor, sga: ScatterGatherArray) -> Result<QueueToken> {
        let qt = QueueToken::next();
        self.queue_mut(qd)?.push(qt, sga)?;
        Ok(qt)
    }

    /// Submit an inbound-message request.
    pub fn pop(&mut self, qd: QueueDescriptor) -> Result<QueueToken> {
        let qt = QueueToken::next();
        self.queue_mut(qd)?.pop(qt)?;
        Ok(qt)
    }

    /// Advance the named token one step and report what it observes. Once a
    /// token completes, every further poll returns the same result until the
    /// token is dropped.
    pub fn poll(&mut self, qd: QueueDescriptor, qt: QueueToken) -> Result<PollResult> {
        let listener = self.queue_mut(qd)?;
        if listener.task_opcode(qt)? != OperationType::Accept {
            return listener.poll(qt);
        }

        listener.expect_open()?;
        if let PollResult::Completed(result) = listener.task_snapshot(qt)? {
            return Ok(PollResult::Completed(result));
        }

        let Some(incoming) = listener.take_pending_connection()? else {
            return Ok(PollResult::Pending);
        };
        let child_qd = listener.task_child(qt)?;

        // The child is detached from the map while it is brought up so the
        // listener and the child can be touched independently.
        let mut child = self.queues.remove(&child_qd).ok_or(Error::InvalidQueue(child_qd))?;
        let adopted = child.adopt_connection(incoming);
        self.queues.insert(child_qd, child);

        let result = match adopted {
            Ok(()) => OperationResult::Accepted(child_qd),
            Err(err) => OperationResult::Failed(err),
        };
        let listener = self.queue_mut(qd)?;
        listener.complete_task(qt, result.clone());
        Ok(PollResult::Completed(result))
    }

    /// Release a token after one best-effort poll. Dropping an incomplete
    /// token is legal; a push whose work request is already posted has its
    /// completion absorbed silently later.
    pub fn drop_token(&mut self, qd: QueueDescriptor, qt: QueueToken) -> Result<()> {
        self.queue_mut(qd)?.drop_task(qt)
    }
}
