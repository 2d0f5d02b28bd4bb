//! Draining work completions out of send and receive completion queues.

use std::ptr::NonNull;

use rdma_mummy_sys::{ibv_cq, ibv_poll_cq, ibv_wc, ibv_wc_opcode, ibv_wc_status};

use crate::error::{Error, Result};

/// Outcome of one work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    Failure(u32),
}

impl From<u32> for CompletionStatus {
    fn from(status: u32) -> Self {
        match status {
            ibv_wc_status::IBV_WC_SUCCESS => CompletionStatus::Success,
            other => CompletionStatus::Failure(other),
        }
    }
}

/// The operation a work completion reports on. Only sends and receives are
/// expected on a message queue's queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOpcode {
    Send,
    Receive,
    Other(u32),
}

impl From<u32> for CompletionOpcode {
    fn from(opcode: u32) -> Self {
        match opcode {
            ibv_wc_opcode::IBV_WC_SEND => CompletionOpcode::Send,
            ibv_wc_opcode::IBV_WC_RECV => CompletionOpcode::Receive,
            other => CompletionOpcode::Other(other),
        }
    }
}

/// One decoded work completion.
#[derive(Debug, Clone, Copy)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: CompletionStatus,
    pub opcode: CompletionOpcode,
    pub byte_len: u32,
}

impl From<&ibv_wc> for WorkCompletion {
    fn from(wc: &ibv_wc) -> Self {
        Self {
            wr_id: wc.wr_id,
            status: wc.status.into(),
            opcode: wc.opcode.into(),
            byte_len: wc.byte_len,
        }
    }
}

/// Poll up to `max` work completions off `cq`. An empty queue yields an
/// empty vector, not an error.
///
/// # Safety
///
/// `cq` must point at a live completion queue.
pub unsafe fn drain(cq: NonNull<ibv_cq>, max: usize) -> Result<Vec<WorkCompletion>> {
    let mut wcs = Vec::<ibv_wc>::with_capacity(max);
    let ret = ibv_poll_cq(cq.as_ptr(), max as i32, wcs.as_mut_ptr());
    if ret < 0 {
        return Err(Error::os("ibv_poll_cq", -ret));
    }
    wcs.set_len(ret as usize);
    Ok(wcs.iter().map(WorkCompletion::from).collect())
}
