//! Thin wrappers over the librdmacm control plane.
//!
//! Connection setup and teardown is driven by [`CmEvent`]s reported on an
//! [`EventChannel`]. A [`CmId`] is the connection-manager identifier a queue
//! binds, listens, connects and accepts on; identifiers created for incoming
//! connection requests arrive attached to the [`CmEventType::ConnectRequest`]
//! event.
//!
//! Error conversion is uniform: a failed call surfaces the errno it left
//! behind, and an empty non-blocking channel reports
//! [`Error::WouldBlock`](crate::Error::WouldBlock).

use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::ptr::{null_mut, NonNull};
use std::sync::Arc;

use os_socketaddr::OsSocketAddr;
use rdma_mummy_sys::{
    ibv_context, ibv_cq, ibv_pd, ibv_qp, ibv_qp_init_attr, rdma_accept, rdma_ack_cm_event, rdma_bind_addr,
    rdma_cm_event, rdma_cm_event_type, rdma_cm_id, rdma_conn_param, rdma_connect, rdma_create_event_channel,
    rdma_create_id, rdma_create_qp, rdma_destroy_event_channel, rdma_destroy_id, rdma_destroy_qp,
    rdma_disconnect, rdma_event_channel, rdma_get_cm_event, rdma_listen, rdma_migrate_id, rdma_port_space,
    rdma_resolve_addr, rdma_resolve_route,
};

use crate::error::{Error, Result};

/// The RDMA port space an identifier is created in.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpace {
    /// Reliable, connection-oriented queue pairs (message based, not stream
    /// based, despite the TCP name).
    Tcp = rdma_port_space::RDMA_PS_TCP,
    /// Unreliable datagram queue pairs.
    Udp = rdma_port_space::RDMA_PS_UDP,
}

/// The kind of communication event reported on an event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEventType {
    AddressResolved,
    AddressError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    TimewaitExit,
    Other(u32),
}

impl From<u32> for CmEventType {
    fn from(event: u32) -> Self {
        match event {
            rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED => CmEventType::AddressResolved,
            rdma_cm_event_type::RDMA_CM_EVENT_ADDR_ERROR => CmEventType::AddressError,
            rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED => CmEventType::RouteResolved,
            rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_ERROR => CmEventType::RouteError,
            rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST => CmEventType::ConnectRequest,
            rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_RESPONSE => CmEventType::ConnectResponse,
            rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_ERROR => CmEventType::ConnectError,
            rdma_cm_event_type::RDMA_CM_EVENT_UNREACHABLE => CmEventType::Unreachable,
            rdma_cm_event_type::RDMA_CM_EVENT_REJECTED => CmEventType::Rejected,
            rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED => CmEventType::Established,
            rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED => CmEventType::Disconnected,
            rdma_cm_event_type::RDMA_CM_EVENT_TIMEWAIT_EXIT => CmEventType::TimewaitExit,
            other => CmEventType::Other(other),
        }
    }
}

/// An event channel over which identifiers report their [`CmEvent`]s.
pub struct EventChannel {
    channel: NonNull<rdma_event_channel>,
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        unsafe {
            rdma_destroy_event_channel(self.channel.as_mut());
        }
    }
}

impl EventChannel {
    pub fn new() -> Result<Arc<EventChannel>> {
        let channel = unsafe { rdma_create_event_channel() };
        let channel = NonNull::new(channel).ok_or_else(|| Error::last_os("rdma_create_event_channel"))?;
        Ok(Arc::new(EventChannel { channel }))
    }

    /// Create a new identifier whose events will be delivered to this
    /// channel.
    pub fn create_id(&self, port_space: PortSpace) -> Result<CmId> {
        let mut id: *mut rdma_cm_id = null_mut();
        let ret = unsafe { rdma_create_id(self.channel.as_ptr(), &mut id, null_mut(), port_space as u32) };
        if ret < 0 {
            return Err(Error::last_os("rdma_create_id"));
        }
        Ok(CmId {
            id: NonNull::new(id).unwrap(),
        })
    }

    /// Fetch one event. Blocks while the channel is in blocking mode;
    /// otherwise reports [`Error::WouldBlock`] when no event is pending.
    pub fn get_event(&self) -> Result<CmEvent> {
        let mut event = MaybeUninit::<*mut rdma_cm_event>::uninit();
        let ret = unsafe { rdma_get_cm_event(self.channel.as_ptr(), event.as_mut_ptr()) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Err(Error::WouldBlock);
            }
            return Err(Error::os("rdma_get_cm_event", err.raw_os_error().unwrap_or(libc::EIO)));
        }
        Ok(CmEvent {
            event: unsafe { NonNull::new(event.assume_init()).unwrap() },
        })
    }

    /// Fetch exactly one event and require it to be of the expected kind,
    /// failing with `mismatch` otherwise. Meant for the synchronous phases of
    /// connection setup, while the channel is still blocking.
    pub fn expect_event(&self, expected: CmEventType, mismatch: Error) -> Result<()> {
        let event = self.get_event()?;
        let actual = event.event_type();
        if actual != expected {
            tracing::debug!(?actual, ?expected, "unexpected cm event during synchronous setup");
            return Err(mismatch);
        }
        Ok(())
    }

    /// Switch the channel's underlying file descriptor between blocking and
    /// non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        let fd = self.as_raw_fd();
        unsafe {
            let previous = libc::fcntl(fd, libc::F_GETFL);
            if previous < 0 {
                return Err(Error::last_os("fcntl"));
            }
            let flags = if nonblocking {
                previous | libc::O_NONBLOCK
            } else {
                previous & !libc::O_NONBLOCK
            };
            if libc::fcntl(fd, libc::F_SETFL, flags) < 0 {
                return Err(Error::last_os("fcntl"));
            }
        }
        Ok(())
    }
}

impl AsRawFd for EventChannel {
    fn as_raw_fd(&self) -> RawFd {
        unsafe { self.channel.as_ref().fd }
    }
}

unsafe impl Send for EventChannel {}
unsafe impl Sync for EventChannel {}

/// A connection-manager identifier, conceptually the socket of the RDMA
/// control plane.
///
/// Dropping an identifier destroys its queue pair (when one was created on
/// it) and then the identifier itself, so an identifier must never outlive
/// the event channel it was created on.
pub struct CmId {
    id: NonNull<rdma_cm_id>,
}

impl Drop for CmId {
    fn drop(&mut self) {
        unsafe {
            if !self.id.as_ref().qp.is_null() {
                rdma_destroy_qp(self.id.as_ptr());
            }
            rdma_destroy_id(self.id.as_ptr());
        }
    }
}

unsafe impl Send for CmId {}

impl CmId {
    pub fn bind_addr(&self, addr: SocketAddr) -> Result<()> {
        let ret = unsafe { rdma_bind_addr(self.id.as_ptr(), OsSocketAddr::from(addr).as_mut_ptr()) };
        if ret < 0 {
            return Err(Error::last_os("rdma_bind_addr"));
        }
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> Result<()> {
        let ret = unsafe { rdma_listen(self.id.as_ptr(), backlog) };
        if ret < 0 {
            return Err(Error::last_os("rdma_listen"));
        }
        Ok(())
    }

    /// Map the destination address to an RDMA device, binding the identifier
    /// to it. Completion is reported as an address-resolved event.
    pub fn resolve_addr(&self, dst: SocketAddr, timeout_ms: i32) -> Result<()> {
        let ret = unsafe {
            rdma_resolve_addr(
                self.id.as_ptr(),
                null_mut(),
                OsSocketAddr::from(dst).as_mut_ptr(),
                timeout_ms,
            )
        };
        if ret < 0 {
            return Err(Error::last_os("rdma_resolve_addr"));
        }
        Ok(())
    }

    /// Resolve an RDMA route to the previously resolved destination.
    /// Completion is reported as a route-resolved event.
    pub fn resolve_route(&self, timeout_ms: i32) -> Result<()> {
        let ret = unsafe { rdma_resolve_route(self.id.as_ptr(), timeout_ms) };
        if ret < 0 {
            return Err(Error::last_os("rdma_resolve_route"));
        }
        Ok(())
    }

    pub fn connect(&self, param: &mut ConnectionParameter) -> Result<()> {
        let ret = unsafe { rdma_connect(self.id.as_ptr(), &mut param.0) };
        if ret < 0 {
            return Err(Error::last_os("rdma_connect"));
        }
        Ok(())
    }

    /// Tear the established connection down, notifying the peer.
    pub fn disconnect(&self) -> Result<()> {
        let ret = unsafe { rdma_disconnect(self.id.as_ptr()) };
        if ret < 0 {
            return Err(Error::last_os("rdma_disconnect"));
        }
        Ok(())
    }

    /// Accept an incoming connection on an identifier delivered by a
    /// connect-request event. The queue pair must exist before this call.
    pub fn accept(&self, param: &mut ConnectionParameter) -> Result<()> {
        let ret = unsafe { rdma_accept(self.id.as_ptr(), &mut param.0) };
        if ret < 0 {
            return Err(Error::last_os("rdma_accept"));
        }
        Ok(())
    }

    /// Create the identifier's queue pair on `pd`. The connection manager
    /// transitions the queue pair through its states during connect/accept.
    ///
    /// # Safety
    ///
    /// `pd` must point at a live protection domain allocated on the device
    /// the identifier is bound to.
    pub unsafe fn create_qp(&self, pd: NonNull<ibv_pd>, attr: &mut ibv_qp_init_attr) -> Result<()> {
        let ret = rdma_create_qp(self.id.as_ptr(), pd.as_ptr(), attr);
        if ret < 0 {
            return Err(Error::last_os("rdma_create_qp"));
        }
        Ok(())
    }

    /// Move the identifier onto another event channel. Pending and future
    /// events are reported there instead.
    pub fn migrate(&self, channel: &EventChannel) -> Result<()> {
        let ret = unsafe { rdma_migrate_id(self.id.as_ptr(), channel.channel.as_ptr()) };
        if ret < 0 {
            return Err(Error::last_os("rdma_migrate_id"));
        }
        Ok(())
    }

    /// The verbs device context the identifier is bound to, once address
    /// resolution (or an incoming request) has attached one.
    pub fn verbs(&self) -> Option<NonNull<ibv_context>> {
        NonNull::new(unsafe { self.id.as_ref().verbs })
    }

    pub fn qp(&self) -> Option<NonNull<ibv_qp>> {
        NonNull::new(unsafe { self.id.as_ref().qp })
    }

    pub fn send_cq(&self) -> Option<NonNull<ibv_cq>> {
        NonNull::new(unsafe { self.id.as_ref().send_cq })
    }

    pub fn recv_cq(&self) -> Option<NonNull<ibv_cq>> {
        NonNull::new(unsafe { self.id.as_ref().recv_cq })
    }
}

/// One event fetched from an [`EventChannel`]. The event is acknowledged
/// back to the connection manager when the value is dropped.
pub struct CmEvent {
    event: NonNull<rdma_cm_event>,
}

impl Drop for CmEvent {
    fn drop(&mut self) {
        unsafe {
            rdma_ack_cm_event(self.event.as_mut());
        }
    }
}

impl CmEvent {
    pub fn event_type(&self) -> CmEventType {
        unsafe { self.event.as_ref().event.into() }
    }

    /// The status carried by error events such as rejections.
    pub fn status(&self) -> i32 {
        unsafe { self.event.as_ref().status }
    }

    /// For a connect-request event, take ownership of the identifier the
    /// connection manager created for the incoming connection. The
    /// identifier stays valid after the event is acknowledged.
    pub fn connection_request_id(&self) -> Option<CmId> {
        if self.event_type() != CmEventType::ConnectRequest {
            return None;
        }
        NonNull::new(unsafe { self.event.as_ref().id }).map(|id| CmId { id })
    }
}

/// Parameters exchanged while connecting or accepting.
pub struct ConnectionParameter(rdma_conn_param);

impl Default for ConnectionParameter {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionParameter {
    pub fn new() -> Self {
        Self(unsafe { MaybeUninit::zeroed().assume_init() })
    }

    pub fn setup_initiator_depth(&mut self, depth: u8) -> &mut Self {
        self.0.initiator_depth = depth;
        self
    }

    pub fn setup_responder_resources(&mut self, resources: u8) -> &mut Self {
        self.0.responder_resources = resources;
        self
    }

    pub fn setup_rnr_retry_count(&mut self, count: u8) -> &mut Self {
        self.0.rnr_retry_count = count;
        self
    }
}
