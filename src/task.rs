//! Per-token bookkeeping for outstanding asynchronous operations.
//!
//! Every submitted operation is named by a [`QueueToken`] and backed by a
//! [`Task`] record in its queue's [`TaskTable`]. A task transitions to done
//! exactly once; afterwards its result is immutable and every poll of the
//! token observes the same outcome until the token is dropped.
//!
//! Dropping a push whose work request is already posted does not revoke the
//! request: the task is kept as a tombstone that absorbs the eventual send
//! completion, performs the deferred unpins, and then disappears.

use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::memory::ScatterGatherArray;
use crate::registry::QueueDescriptor;

/// Names one pending operation. Tokens are allocated monotonically and never
/// reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueToken(u64);

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

impl QueueToken {
    pub(crate) fn next() -> Self {
        QueueToken(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub(crate) fn from_wr_id(wr_id: u64) -> Self {
        QueueToken(wr_id)
    }
}

impl fmt::Display for QueueToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of operation a task stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Accept,
    Push,
    Pop,
}

/// The materialized outcome of a completed operation.
#[derive(Debug, Clone)]
pub enum OperationResult {
    /// A connection was accepted into the named child queue.
    Accepted(QueueDescriptor),
    /// A message went out on the wire; `bytes` is its total framed size.
    Pushed { bytes: u32 },
    /// A message arrived. The caller owns the frame's backing buffer and
    /// releases it through [`free_scatter_gather`](crate::memory::free_scatter_gather).
    Popped { frame: ScatterGatherArray, bytes: u32 },
    /// The operation failed; the error is part of the task's result, not of
    /// the poll that observed it.
    Failed(Error),
}

/// What a poll of a token currently observes.
#[derive(Debug, Clone)]
pub enum PollResult {
    Pending,
    Completed(OperationResult),
}

pub(crate) struct Task {
    pub opcode: OperationType,
    pub done: bool,
    pub result: Option<OperationResult>,
    /// The caller's segments, held for the pin/unpin balance of a push.
    pub sga: Option<ScatterGatherArray>,
    /// The transient header-and-prefix allocation of a push.
    pub scratch: Option<NonNull<u8>>,
    /// Total framed size of a push, captured at encode time.
    pub wire_bytes: u32,
    /// The child queue an accept will hand over when it completes.
    pub child: Option<QueueDescriptor>,
    /// Whether a push's work request reached the send queue.
    pub posted: bool,
}

impl Task {
    pub fn new(opcode: OperationType) -> Self {
        Self {
            opcode,
            done: false,
            result: None,
            sga: None,
            scratch: None,
            wire_bytes: 0,
            child: None,
            posted: false,
        }
    }

    /// Transition to done. The transition happens at most once; a second
    /// completion attempt is ignored and flagged, since results are immutable
    /// once observed.
    pub fn complete(&mut self, result: OperationResult) {
        if self.done {
            tracing::warn!("ignoring second completion of a finished task");
            return;
        }
        self.done = true;
        self.result = Some(result);
    }

    pub fn snapshot(&self) -> PollResult {
        if self.done {
            PollResult::Completed(self.result.clone().expect("done task carries a result"))
        } else {
            PollResult::Pending
        }
    }
}

/// A dropped-but-posted push, waiting for its send completion.
pub(crate) struct Tombstone {
    pub sga: ScatterGatherArray,
    pub scratch: NonNull<u8>,
}

/// The per-queue token-to-task mapping.
#[derive(Default)]
pub(crate) struct TaskTable {
    tasks: HashMap<QueueToken, Task>,
    tombstones: HashMap<QueueToken, Tombstone>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, qt: QueueToken, task: Task) {
        let previous = self.tasks.insert(qt, task);
        debug_assert!(previous.is_none(), "queue token reused");
    }

    pub fn get(&self, qt: QueueToken) -> Result<&Task> {
        self.tasks.get(&qt).ok_or(Error::InvalidToken(qt))
    }

    pub fn get_mut(&mut self, qt: QueueToken) -> Result<&mut Task> {
        self.tasks.get_mut(&qt).ok_or(Error::InvalidToken(qt))
    }

    pub fn contains(&self, qt: QueueToken) -> bool {
        self.tasks.contains_key(&qt)
    }

    pub fn remove(&mut self, qt: QueueToken) -> Result<Task> {
        self.tasks.remove(&qt).ok_or(Error::InvalidToken(qt))
    }

    /// Turn a dropped push into a tombstone awaiting its completion.
    pub fn bury(&mut self, qt: QueueToken, tombstone: Tombstone) {
        self.tombstones.insert(qt, tombstone);
    }

    /// Claim the tombstone a stray send completion belongs to, if any.
    pub fn exhume(&mut self, qt: QueueToken) -> Option<Tombstone> {
        self.tombstones.remove(&qt)
    }

    pub fn drain_tombstones(&mut self) -> Vec<Tombstone> {
        self.tombstones.drain().map(|(_, t)| t).collect()
    }
}
