//! The process-wide protection domain, shared by every connected queue.
//!
//! At most one protection domain exists per process. It is allocated lazily
//! from the first connected queue's device context and handed out as counted
//! [`DomainHandle`]s; the domain is deallocated only when the last holder
//! releases it, after every memory region cached against it has been
//! deregistered.

use std::ptr::NonNull;
use std::sync::{LazyLock, Mutex};

use rdma_mummy_sys::{ibv_alloc_pd, ibv_context, ibv_dealloc_pd, ibv_pd};

use crate::error::{Error, Result};
use crate::memory;

struct SharedDomain {
    pd: usize,
    verbs: usize,
    holders: usize,
}

static DOMAIN: LazyLock<Mutex<Option<SharedDomain>>> = LazyLock::new(|| Mutex::new(None));

/// A counted reference to the shared protection domain.
pub struct DomainHandle {
    pd: NonNull<ibv_pd>,
}

impl DomainHandle {
    pub fn pd(&self) -> NonNull<ibv_pd> {
        self.pd
    }
}

impl Drop for DomainHandle {
    fn drop(&mut self) {
        let mut slot = DOMAIN.lock().unwrap();
        let Some(shared) = slot.as_mut() else {
            return;
        };
        shared.holders -= 1;
        if shared.holders == 0 {
            let pd = shared.pd;
            *slot = None;
            memory::release_domain_regions(pd);
            unsafe {
                ibv_dealloc_pd(pd as *mut ibv_pd);
            }
        }
    }
}

/// Acquire a counted reference to the shared protection domain, allocating it
/// from `verbs` on first use.
///
/// Every queue in a process must sit on the same device: acquiring with a
/// different device context while the domain is live is reported as an
/// unsupported configuration rather than handing back keys the NIC would
/// reject.
///
/// # Safety
///
/// `verbs` must point at a live device context that outlives the returned
/// handle.
pub unsafe fn acquire(verbs: NonNull<ibv_context>) -> Result<DomainHandle> {
    let mut slot = DOMAIN.lock().unwrap();
    if let Some(shared) = slot.as_mut() {
        if shared.verbs != verbs.as_ptr() as usize {
            return Err(Error::Unsupported(
                "the shared protection domain belongs to a different device",
            ));
        }
        shared.holders += 1;
        return Ok(DomainHandle {
            pd: NonNull::new(shared.pd as *mut ibv_pd).unwrap(),
        });
    }

    let pd = ibv_alloc_pd(verbs.as_ptr());
    let pd = NonNull::new(pd).ok_or_else(|| Error::last_os("ibv_alloc_pd"))?;
    *slot = Some(SharedDomain {
        pd: pd.as_ptr() as usize,
        verbs: verbs.as_ptr() as usize,
        holders: 1,
    });
    Ok(DomainHandle { pd })
}
