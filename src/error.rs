//! Error types shared by every causeway operation.
//!
//! The queue surface is deliberately errno-flavored: every failure falls into
//! one of a small set of classes (transient, precondition, protocol,
//! connection, resource, unsupported), and the only errors recovered
//! internally are the transient ones.

use std::io;

use crate::registry::QueueDescriptor;
use crate::task::QueueToken;

/// Errors reported by queue, memory and connection-manager operations.
///
/// The type is `Clone` so that a completed task can hand the same result to
/// every subsequent poll of its token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No event or completion is available right now; retry on the next poll.
    #[error("resource temporarily unavailable")]
    WouldBlock,

    /// An inbound frame violated the wire format.
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// The remote side refused the connection attempt.
    #[error("connection refused")]
    ConnectionRefused,

    /// The peer disconnected; the queue has been closed.
    #[error("connection aborted")]
    ConnectionAborted,

    /// The destination address could not be resolved to an RDMA device.
    #[error("address not available")]
    AddressNotAvailable,

    /// The operation is not permitted in the queue's current role.
    #[error("operation not permitted: {0}")]
    InvalidState(&'static str),

    /// The queue descriptor does not name a registered queue.
    #[error("unknown queue descriptor {0}")]
    InvalidQueue(QueueDescriptor),

    /// The queue token does not name an outstanding task.
    #[error("unknown queue token {0}")]
    InvalidToken(QueueToken),

    /// The scatter-gather array has more segments than a work request can
    /// carry.
    #[error("scatter-gather array has {requested} segments, limit is {limit}")]
    TooManySegments { requested: usize, limit: usize },

    /// A pinned allocation could not be satisfied.
    #[error("out of pinned memory")]
    OutOfMemory,

    /// The operation or event is outside what this transport implements.
    #[error("not supported: {0}")]
    Unsupported(&'static str),

    /// A verbs or connection-manager entry point failed with an errno.
    #[error("{call} failed (errno {errno})")]
    Os { call: &'static str, errno: i32 },
}

impl Error {
    /// Capture `errno` left behind by a failed FFI call.
    pub(crate) fn last_os(call: &'static str) -> Self {
        Error::Os {
            call,
            errno: io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO),
        }
    }

    pub(crate) fn os(call: &'static str, errno: i32) -> Self {
        Error::Os { call, errno }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
