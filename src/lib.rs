//! Causeway is a user-space asynchronous message-queue library over RDMA
//! reliable connections, built on [rdma-core]'s librdmacm and libibverbs.
//!
//! Endpoints are queues named by opaque descriptors; submitting an operation
//! (`accept`, `push`, `pop`) hands back an opaque token that is polled for
//! completion. The library is single-threaded and cooperative: all progress
//! is made inside `poll` and `drop_token`, and nothing blocks outside the
//! synchronous control path of `connect`.
//!
//! Message payloads are scatter-gather arrays whose segments must come from
//! the crate's pinned heap ([`memory`]), so that every byte referenced by an
//! in-flight work request stays resolvable to a registered memory region
//! until its completion is observed.
//!
//! [rdma-core]: https://github.com/linux-rdma/rdma-core

pub mod cm;
pub mod completion;
pub mod error;
pub mod memory;
pub mod pd;
pub mod queue;
pub mod registry;
pub mod task;
pub mod wire;

pub use error::{Error, Result};
pub use memory::{ScatterGatherArray, ScatterGatherSegment};
pub use queue::{Queue, SocketType, RECV_BUFFER_COUNT, RECV_BUFFER_SIZE};
pub use registry::{QueueDescriptor, QueueRegistry};
pub use task::{OperationResult, PollResult, QueueToken};
