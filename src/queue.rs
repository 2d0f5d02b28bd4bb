//! The connection-backed message queue and its state machine.
//!
//! A queue is created unbound, receives its connection-manager identifier
//! through `socket`, and then follows one of two paths: `bind` + `listen`
//! turns it into a listener whose accepts hand out connected child queues,
//! while `connect` turns it into a connected endpoint that pushes and pops
//! framed messages.
//!
//! All progress is caller-driven: `poll` advances the event channel, the
//! relevant completion queue and the receive FIFO just far enough for the
//! polled token to make progress. Nothing here blocks except the synchronous
//! control-path steps inside `connect`, which wait on the event channel while
//! it is still in blocking mode.

use std::collections::VecDeque;
use std::mem::MaybeUninit;
use std::ptr::{null_mut, NonNull};
use std::sync::Arc;

use rdma_mummy_sys::{
    ibv_post_recv, ibv_post_send, ibv_qp_cap, ibv_qp_init_attr, ibv_qp_type, ibv_recv_wr, ibv_send_flags,
    ibv_send_wr, ibv_sge, ibv_wr_opcode,
};
use tracing::{debug, warn};

use crate::cm::{CmEventType, CmId, ConnectionParameter, EventChannel, PortSpace};
use crate::completion::{self, CompletionOpcode, CompletionStatus, WorkCompletion};
use crate::error::{Error, Result};
use crate::memory::{self, ScatterGatherArray};
use crate::pd::{self, DomainHandle};
use crate::registry::QueueDescriptor;
use crate::task::{OperationResult, OperationType, PollResult, QueueToken, Task, TaskTable, Tombstone};
use crate::wire;

/// Steady-state number of receive buffers kept posted per connected queue.
pub const RECV_BUFFER_COUNT: usize = 1;

/// Size of each posted receive buffer; the upper bound on a framed message.
pub const RECV_BUFFER_SIZE: usize = 1024;

/// Scatter-gather elements a work request may carry: a frame of
/// [`wire::MAX_SEGMENTS`] segments needs one element for the header plus two
/// per segment.
pub const MAX_WORK_REQUEST_SGE: u32 = 2 * wire::MAX_SEGMENTS as u32 + 1;

const MAX_SEND_WR: u32 = 20;
const MAX_RECV_WR: u32 = 20;
const MAX_INLINE_DATA: u32 = 64;
const RESOLVE_TIMEOUT_MS: i32 = 1000;

/// Transport selector for [`Queue::socket`]. Only the stream variant (an RC
/// queue pair in the TCP port space) is implemented; the datagram path is
/// unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Stream,
    Datagram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Unbound,
    Bound,
    Listening,
    Connected,
}

/// A message queue endpoint over one RDMA reliable connection.
pub struct Queue {
    qd: QueueDescriptor,
    role: Role,
    // cm_id is declared before domain and channel so that the queue pair and
    // identifier go away before the protection domain and the channel.
    cm_id: Option<CmId>,
    domain: Option<DomainHandle>,
    channel: Option<Arc<EventChannel>>,
    accept_backlog: VecDeque<CmId>,
    /// Received frames, in wire order: `(buffer, received length)`.
    ready_frames: VecDeque<(NonNull<u8>, usize)>,
    posted_recvs: Vec<NonNull<u8>>,
    tasks: TaskTable,
}

impl Queue {
    pub(crate) fn new(qd: QueueDescriptor) -> Self {
        Self {
            qd,
            role: Role::Unbound,
            cm_id: None,
            domain: None,
            channel: None,
            accept_backlog: VecDeque::new(),
            ready_frames: VecDeque::new(),
            posted_recvs: Vec::new(),
            tasks: TaskTable::new(),
        }
    }

    pub(crate) fn expect_open(&self) -> Result<()> {
        if self.cm_id.is_none() {
            return Err(Error::InvalidState("queue is not open"));
        }
        Ok(())
    }

    // ---- lifecycle ------------------------------------------------------

    pub(crate) fn socket(&mut self, socket_type: SocketType) -> Result<()> {
        if self.cm_id.is_some() {
            return Err(Error::InvalidState("queue already has an identifier"));
        }
        match socket_type {
            SocketType::Stream => {},
            SocketType::Datagram => return Err(Error::Unsupported("datagram queues are not implemented")),
        }

        let channel = EventChannel::new()?;
        let id = channel.create_id(PortSpace::Tcp)?;
        self.channel = Some(channel);
        self.cm_id = Some(id);
        self.role = Role::Bound;
        Ok(())
    }

    pub(crate) fn bind(&mut self, addr: std::net::SocketAddr) -> Result<()> {
        self.expect_open()?;
        self.cm_id.as_ref().unwrap().bind_addr(addr)
    }

    pub(crate) fn listen(&mut self, backlog: i32) -> Result<()> {
        if self.role == Role::Listening {
            return Err(Error::InvalidState("queue is already listening"));
        }
        self.expect_open()?;
        self.channel.as_ref().unwrap().set_nonblocking(true)?;
        self.cm_id.as_ref().unwrap().listen(backlog)?;
        self.role = Role::Listening;
        Ok(())
    }

    pub(crate) fn connect(&mut self, addr: std::net::SocketAddr) -> Result<()> {
        if self.role != Role::Bound {
            return Err(Error::InvalidState("queue cannot connect in its current role"));
        }
        self.expect_open()?;

        match self.connect_inner(addr) {
            Ok(()) => {
                self.role = Role::Connected;
                Ok(())
            },
            Err(err) => {
                self.release_resources();
                Err(err)
            },
        }
    }

    fn connect_inner(&mut self, addr: std::net::SocketAddr) -> Result<()> {
        {
            let id = self.cm_id.as_ref().unwrap();
            let channel = self.channel.as_ref().unwrap();

            id.resolve_addr(addr, RESOLVE_TIMEOUT_MS)?;
            channel.expect_event(CmEventType::AddressResolved, Error::AddressNotAvailable)?;

            id.resolve_route(RESOLVE_TIMEOUT_MS)?;
            channel.expect_event(
                CmEventType::RouteResolved,
                Error::InvalidState("no RDMA route to the destination"),
            )?;
        }

        self.setup_qp()?;
        self.setup_recv_pool()?;

        let id = self.cm_id.as_ref().unwrap();
        let channel = self.channel.as_ref().unwrap();

        let mut param = ConnectionParameter::new();
        param
            .setup_initiator_depth(1)
            .setup_responder_resources(1)
            .setup_rnr_retry_count(1);
        id.connect(&mut param)?;
        channel.expect_event(CmEventType::Established, Error::ConnectionRefused)?;

        channel.set_nonblocking(true)?;
        Ok(())
    }

    /// Attach an identifier popped off a listener's accept backlog, bringing
    /// this queue up as the connected side of the incoming request.
    pub(crate) fn adopt_connection(&mut self, id: CmId) -> Result<()> {
        if self.cm_id.is_some() {
            return Err(Error::InvalidState("queue already has an identifier"));
        }

        match self.adopt_inner(id) {
            Ok(()) => {
                self.role = Role::Connected;
                Ok(())
            },
            Err(err) => {
                self.release_resources();
                Err(err)
            },
        }
    }

    fn adopt_inner(&mut self, id: CmId) -> Result<()> {
        // Events for the accepted identifier would otherwise keep arriving on
        // the listener's channel; give the connection a channel of its own.
        let channel = EventChannel::new()?;
        id.migrate(&channel)?;
        channel.set_nonblocking(true)?;

        self.channel = Some(channel);
        self.cm_id = Some(id);

        self.setup_qp()?;
        self.setup_recv_pool()?;

        let mut param = ConnectionParameter::new();
        param
            .setup_initiator_depth(1)
            .setup_responder_resources(1)
            .setup_rnr_retry_count(7);
        self.cm_id.as_ref().unwrap().accept(&mut param)
    }

    fn setup_qp(&mut self) -> Result<()> {
        let id = self.cm_id.as_ref().unwrap();
        let verbs = id
            .verbs()
            .ok_or(Error::InvalidState("identifier is not bound to a device"))?;
        let domain = unsafe { pd::acquire(verbs)? };

        let mut attr = ibv_qp_init_attr {
            qp_context: null_mut(),
            send_cq: null_mut(),
            recv_cq: null_mut(),
            srq: null_mut(),
            cap: ibv_qp_cap {
                max_send_wr: MAX_SEND_WR,
                max_recv_wr: MAX_RECV_WR,
                max_send_sge: MAX_WORK_REQUEST_SGE,
                max_recv_sge: MAX_WORK_REQUEST_SGE,
                max_inline_data: MAX_INLINE_DATA,
            },
            qp_type: ibv_qp_type::IBV_QPT_RC,
            sq_sig_all: 1,
        };
        unsafe { id.create_qp(domain.pd(), &mut attr)? };
        self.domain = Some(domain);
        Ok(())
    }

    pub(crate) fn close(&mut self) -> Result<()> {
        self.expect_open()?;
        self.release_resources();
        Ok(())
    }

    fn release_resources(&mut self) {
        self.accept_backlog.clear();

        // Completions for these can no longer be delivered once the queue
        // pair is gone; settle their pins now.
        for tomb in self.tasks.drain_tombstones() {
            let _ = memory::unpin_all(&tomb.sga);
            let _ = memory::unpin(tomb.scratch);
            let _ = memory::free(tomb.scratch);
        }

        // Tell the peer before tearing the endpoint down, so its next poll
        // observes the disconnect rather than a transport error.
        if self.role == Role::Connected {
            if let Some(id) = &self.cm_id {
                let _ = id.disconnect();
            }
        }

        // Destroys the queue pair and then the identifier.
        self.cm_id = None;

        for buf in self.posted_recvs.drain(..) {
            let _ = memory::unpin(buf);
            let _ = memory::free(buf);
        }
        for (buf, _) in self.ready_frames.drain(..) {
            let _ = memory::free(buf);
        }

        self.domain = None;
        self.channel = None;
        self.role = Role::Unbound;
    }

    // ---- receive pool ---------------------------------------------------

    fn setup_recv_pool(&mut self) -> Result<()> {
        for _ in 0..RECV_BUFFER_COUNT {
            self.post_recv_buffer()?;
        }
        Ok(())
    }

    fn post_recv_buffer(&mut self) -> Result<()> {
        let id = self.cm_id.as_ref().unwrap();
        let qp = id.qp().ok_or(Error::InvalidState("queue pair is not set up"))?;
        let pd = self.domain.as_ref().unwrap().pd();

        let buf = memory::alloc(RECV_BUFFER_SIZE)?;
        memory::pin(buf)?;
        let keys = match unsafe { memory::resolve(buf, pd) } {
            Ok(keys) => keys,
            Err(err) => {
                let _ = memory::unpin(buf);
                let _ = memory::free(buf);
                return Err(err);
            },
        };

        let mut sge = ibv_sge {
            addr: buf.as_ptr() as u64,
            length: RECV_BUFFER_SIZE as u32,
            lkey: keys.lkey,
        };
        let mut wr = ibv_recv_wr {
            wr_id: buf.as_ptr() as u64,
            next: null_mut(),
            sg_list: &mut sge,
            num_sge: 1,
        };
        let mut bad_wr: *mut ibv_recv_wr = null_mut();
        let ret = unsafe { ibv_post_recv(qp.as_ptr(), &mut wr, &mut bad_wr) };
        if ret != 0 {
            let _ = memory::unpin(buf);
            let _ = memory::free(buf);
            return Err(Error::os("ibv_post_recv", ret));
        }

        self.posted_recvs.push(buf);
        Ok(())
    }

    // ---- event channel --------------------------------------------------

    fn service_event_queue(&mut self) -> Result<()> {
        let Some(channel) = self.channel.clone() else {
            return Ok(());
        };

        let event = match channel.get_event() {
            Ok(event) => event,
            Err(Error::WouldBlock) => return Ok(()),
            Err(err) => return Err(err),
        };

        match event.event_type() {
            CmEventType::ConnectRequest => {
                debug!(qd = %self.qd, "cm event: connect request");
                match event.connection_request_id() {
                    Some(id) if self.role == Role::Listening => self.accept_backlog.push_back(id),
                    _ => warn!(qd = %self.qd, "connect request on a non-listening queue"),
                }
                Ok(())
            },
            CmEventType::Established => {
                debug!(qd = %self.qd, "cm event: established");
                Ok(())
            },
            CmEventType::Disconnected => {
                debug!(qd = %self.qd, "cm event: disconnected");
                drop(event);
                self.release_resources();
                Err(Error::ConnectionAborted)
            },
            CmEventType::TimewaitExit => Ok(()),
            other => {
                warn!(qd = %self.qd, event = ?other, "unhandled cm event");
                Err(Error::Unsupported("unexpected connection-manager event"))
            },
        }
    }

    // ---- completions ----------------------------------------------------

    fn service_send_cq(&mut self, max: usize) -> Result<()> {
        let cq = self
            .cm_id
            .as_ref()
            .and_then(CmId::send_cq)
            .ok_or(Error::InvalidState("queue has no send completion queue"))?;
        let completions = unsafe { completion::drain(cq, max)? };
        for wc in completions {
            self.on_work_completed(&wc)?;
        }
        Ok(())
    }

    fn service_recv_cq(&mut self, max: usize) -> Result<()> {
        let cq = self
            .cm_id
            .as_ref()
            .and_then(CmId::recv_cq)
            .ok_or(Error::InvalidState("queue has no receive completion queue"))?;
        let completions = unsafe { completion::drain(cq, max)? };
        for wc in completions {
            self.on_work_completed(&wc)?;
        }
        Ok(())
    }

    fn on_work_completed(&mut self, wc: &WorkCompletion) -> Result<()> {
        if let CompletionStatus::Failure(code) = wc.status {
            warn!(qd = %self.qd, code, "work completion failed");
            return Err(Error::Unsupported("failed work completion"));
        }

        match wc.opcode {
            CompletionOpcode::Receive => {
                let Some(buf) = NonNull::new(wc.wr_id as *mut u8) else {
                    return Err(Error::Unsupported("receive completion without a buffer"));
                };
                // The buffer is about to become user-visible.
                memory::unpin(buf)?;
                self.posted_recvs.retain(|posted| *posted != buf);
                self.ready_frames.push_back((buf, wc.byte_len as usize));
                self.post_recv_buffer()
            },
            CompletionOpcode::Send => {
                let qt = QueueToken::from_wr_id(wc.wr_id);
                if self.tasks.contains(qt) {
                    let task = self.tasks.get_mut(qt)?;
                    if let Some(sga) = &task.sga {
                        memory::unpin_all(sga)?;
                    }
                    if let Some(scratch) = task.scratch {
                        memory::unpin(scratch)?;
                    }
                    let bytes = task.wire_bytes;
                    task.complete(OperationResult::Pushed { bytes });
                    Ok(())
                } else if let Some(tomb) = self.tasks.exhume(qt) {
                    debug!(qd = %self.qd, %qt, "absorbed completion for a dropped push");
                    memory::unpin_all(&tomb.sga)?;
                    memory::unpin(tomb.scratch)?;
                    memory::free(tomb.scratch)?;
                    Ok(())
                } else {
                    warn!(qd = %self.qd, %qt, "send completion for an unknown token");
                    Ok(())
                }
            },
            CompletionOpcode::Other(op) => {
                warn!(qd = %self.qd, opcode = op, "unexpected work completion opcode");
                Err(Error::Unsupported("unexpected work completion opcode"))
            },
        }
    }

    // ---- operations -----------------------------------------------------

    fn expect_connected(&self) -> Result<()> {
        if self.role == Role::Listening {
            return Err(Error::Unsupported("listening queues do not carry messages"));
        }
        self.expect_open()?;
        if self.role != Role::Connected {
            return Err(Error::InvalidState("queue is not connected"));
        }
        Ok(())
    }

    pub(crate) fn push(&mut self, qt: QueueToken, sga: ScatterGatherArray) -> Result<()> {
        self.expect_connected()?;

        // Fails before anything is allocated or posted when the array is too
        // wide for a work request.
        let framed = wire::frame(&sga)?;

        let mut pinned = 0;
        let mut pin_err = None;
        for seg in &sga.segments {
            match memory::pin(seg.addr) {
                Ok(()) => pinned += 1,
                Err(err) => {
                    pin_err = Some(err);
                    break;
                },
            }
        }
        if let Some(err) = pin_err {
            for seg in sga.segments.iter().take(pinned) {
                let _ = memory::unpin(seg.addr);
            }
            let _ = memory::unpin(framed.scratch);
            let _ = memory::free(framed.scratch);
            return Err(err);
        }

        if let Err(err) = self.post_framed(qt, &framed) {
            let _ = memory::unpin_all(&sga);
            let _ = memory::unpin(framed.scratch);
            let _ = memory::free(framed.scratch);
            return Err(err);
        }

        let mut task = Task::new(OperationType::Push);
        task.sga = Some(sga);
        task.scratch = Some(framed.scratch);
        task.wire_bytes = framed.wire_bytes;
        task.posted = true;
        self.tasks.insert(qt, task);
        Ok(())
    }

    fn post_framed(&mut self, qt: QueueToken, framed: &wire::FramedMessage) -> Result<()> {
        let id = self.cm_id.as_ref().unwrap();
        let qp = id.qp().ok_or(Error::InvalidState("queue pair is not set up"))?;
        let pd = self.domain.as_ref().unwrap().pd();

        let mut sges = Vec::with_capacity(framed.elements.len());
        for element in &framed.elements {
            let addr = NonNull::new(element.addr as *mut u8).unwrap();
            let keys = unsafe { memory::resolve(addr, pd)? };
            sges.push(ibv_sge {
                addr: element.addr,
                length: element.len,
                lkey: keys.lkey,
            });
        }

        let mut wr = ibv_send_wr {
            wr_id: qt.as_u64(),
            next: null_mut(),
            sg_list: sges.as_mut_ptr(),
            num_sge: sges.len() as i32,
            opcode: ibv_wr_opcode::IBV_WR_SEND,
            send_flags: ibv_send_flags::IBV_SEND_SIGNALED.0,
            ..unsafe { MaybeUninit::zeroed().assume_init() }
        };
        let mut bad_wr: *mut ibv_send_wr = null_mut();
        let ret = unsafe { ibv_post_send(qp.as_ptr(), &mut wr, &mut bad_wr) };
        if ret != 0 {
            return Err(Error::os("ibv_post_send", ret));
        }
        Ok(())
    }

    pub(crate) fn pop(&mut self, qt: QueueToken) -> Result<()> {
        self.expect_connected()?;
        self.tasks.insert(qt, Task::new(OperationType::Pop));
        Ok(())
    }

    pub(crate) fn register_accept(&mut self, qt: QueueToken, child: QueueDescriptor) -> Result<()> {
        if self.role != Role::Listening {
            return Err(Error::InvalidState("only listening queues accept connections"));
        }
        let mut task = Task::new(OperationType::Accept);
        task.child = Some(child);
        self.tasks.insert(qt, task);
        Ok(())
    }

    // ---- poll driver ----------------------------------------------------

    pub(crate) fn task_opcode(&self, qt: QueueToken) -> Result<OperationType> {
        Ok(self.tasks.get(qt)?.opcode)
    }

    pub(crate) fn task_snapshot(&self, qt: QueueToken) -> Result<PollResult> {
        Ok(self.tasks.get(qt)?.snapshot())
    }

    pub(crate) fn task_child(&self, qt: QueueToken) -> Result<QueueDescriptor> {
        self.tasks
            .get(qt)?
            .child
            .ok_or(Error::InvalidState("task has no child queue"))
    }

    pub(crate) fn complete_task(&mut self, qt: QueueToken, result: OperationResult) {
        if let Ok(task) = self.tasks.get_mut(qt) {
            task.complete(result);
        }
    }

    /// Drain the event channel once and hand out the oldest pending incoming
    /// connection, if there is one.
    pub(crate) fn take_pending_connection(&mut self) -> Result<Option<CmId>> {
        if self.role != Role::Listening {
            return Err(Error::InvalidState("only listening queues accept connections"));
        }
        self.service_event_queue()?;
        Ok(self.accept_backlog.pop_front())
    }

    /// Advance the polled token one step: one event-channel drain plus one
    /// completion-queue drain for its direction.
    pub(crate) fn poll(&mut self, qt: QueueToken) -> Result<PollResult> {
        self.expect_open()?;

        let task = self.tasks.get(qt)?;
        if task.done {
            return self.task_snapshot(qt);
        }
        let opcode = task.opcode;

        self.service_event_queue()?;

        match opcode {
            OperationType::Push => {
                self.service_send_cq(1)?;
            },
            OperationType::Pop => {
                self.service_recv_cq(1)?;
                if let Some((buf, len)) = self.ready_frames.pop_front() {
                    self.complete_recv(qt, buf, len)?;
                }
            },
            OperationType::Accept => {
                // Accepts span two queues and are serviced by the registry.
                return Err(Error::InvalidState("accept tasks are serviced through the registry"));
            },
        }

        self.task_snapshot(qt)
    }

    fn complete_recv(&mut self, qt: QueueToken, buf: NonNull<u8>, len: usize) -> Result<()> {
        let outcome = unsafe { wire::parse(buf, len) };
        let task = self.tasks.get_mut(qt)?;
        match outcome {
            Ok((_, frame)) => {
                task.complete(OperationResult::Popped {
                    frame,
                    bytes: len as u32,
                });
            },
            Err(err) => {
                task.complete(OperationResult::Failed(err));
                let _ = memory::free(buf);
            },
        }
        Ok(())
    }

    /// Release a token after one best-effort poll. A pending push whose work
    /// request is already on the send queue leaves a tombstone behind; its
    /// completion is absorbed silently when it arrives.
    pub(crate) fn drop_task(&mut self, qt: QueueToken) -> Result<()> {
        if !self.tasks.contains(qt) {
            return Err(Error::InvalidToken(qt));
        }

        let _ = self.poll(qt);

        let task = self.tasks.remove(qt)?;
        if task.opcode == OperationType::Push {
            if !task.done && task.posted {
                self.tasks.bury(
                    qt,
                    Tombstone {
                        sga: task.sga.expect("posted push carries its segments"),
                        scratch: task.scratch.expect("posted push carries its scratch buffer"),
                    },
                );
            } else if let Some(scratch) = task.scratch {
                // Completed pushes were unpinned when the completion arrived.
                if !task.done {
                    let _ = memory::unpin(scratch);
                }
                let _ = memory::free(scratch);
            }
        }
        Ok(())
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.release_resources();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{frame, HEADER_SIZE};

    fn test_qd() -> QueueDescriptor {
        QueueDescriptor::from_raw(9999)
    }

    #[test]
    fn operations_require_an_open_queue() {
        let mut q = Queue::new(test_qd());
        let qt = QueueToken::next();
        assert!(matches!(q.push(qt, ScatterGatherArray::from_segments(Vec::new())), Err(Error::InvalidState(_))));
        assert!(matches!(q.pop(qt), Err(Error::InvalidState(_))));
        assert!(matches!(q.poll(qt), Err(Error::InvalidState(_))));
        assert!(matches!(q.close(), Err(Error::InvalidState(_))));
        assert!(matches!(q.listen(10), Err(Error::InvalidState(_))));
    }

    #[test]
    fn listening_queues_do_not_carry_messages() {
        let mut q = Queue::new(test_qd());
        q.role = Role::Listening;
        let qt = QueueToken::next();
        assert!(matches!(
            q.push(qt, ScatterGatherArray::from_segments(Vec::new())),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(q.pop(qt), Err(Error::Unsupported(_))));
    }

    #[test]
    fn truncated_frames_fail_the_pop_task_with_a_protocol_error() {
        let mut q = Queue::new(test_qd());
        let qt = QueueToken::next();
        q.tasks.insert(qt, Task::new(OperationType::Pop));

        let buf = memory::alloc(4).unwrap();
        q.complete_recv(qt, buf, 4).unwrap();

        match q.task_snapshot(qt).unwrap() {
            PollResult::Completed(OperationResult::Failed(Error::Protocol(_))) => {},
            other => panic!("expected a protocol failure, got {other:?}"),
        }

        // A later pop on a fresh token proceeds normally.
        let qt2 = QueueToken::next();
        q.tasks.insert(qt2, Task::new(OperationType::Pop));

        let payload = memory::alloc_scatter_gather(5).unwrap();
        unsafe {
            std::ptr::copy_nonoverlapping(b"hello".as_ptr(), payload.segments[0].addr.as_ptr(), 5);
        }
        let framed = frame(&payload).unwrap();
        let mut wire_bytes = Vec::new();
        for el in &framed.elements {
            wire_bytes
                .extend_from_slice(unsafe { std::slice::from_raw_parts(el.addr as *const u8, el.len as usize) });
        }
        let recv = memory::alloc(wire_bytes.len()).unwrap();
        unsafe { std::ptr::copy_nonoverlapping(wire_bytes.as_ptr(), recv.as_ptr(), wire_bytes.len()) };

        q.complete_recv(qt2, recv, wire_bytes.len()).unwrap();
        match q.task_snapshot(qt2).unwrap() {
            PollResult::Completed(OperationResult::Popped { frame, bytes }) => {
                assert_eq!(bytes as usize, HEADER_SIZE + 4 + 5);
                assert_eq!(frame.segments.len(), 1);
                assert_eq!(unsafe { frame.segments[0].as_slice() }, b"hello");
                memory::free_scatter_gather(frame).unwrap();
            },
            other => panic!("expected a decoded frame, got {other:?}"),
        }

        memory::unpin(framed.scratch).unwrap();
        memory::free(framed.scratch).unwrap();
        memory::free_scatter_gather(payload).unwrap();
    }
}
