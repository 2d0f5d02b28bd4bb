//! The pinned heap backing every buffer an in-flight work request may touch.
//!
//! All payload memory handed to the NIC must come from this module. Each
//! allocation is tracked process-wide so that any address *inside* it can be
//! resolved back to the allocation, pin-counted, and lazily registered as a
//! memory region under a protection domain. Registration is
//! one-per-allocation-per-domain; interior pointers share the containing
//! allocation's region and keys.
//!
//! Pins are reference counts, not registrations: a buffer must hold at least
//! one pin for as long as a posted work request references it, and every pin
//! taken when an operation is submitted is released when the matching
//! completion is observed.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::{BTreeMap, HashMap};
use std::ptr::NonNull;
use std::sync::{LazyLock, Mutex};

use bitmask_enum::bitmask;
use rdma_mummy_sys::{ibv_access_flags, ibv_dereg_mr, ibv_mr, ibv_pd, ibv_reg_mr};

use crate::error::{Error, Result};

/// Access rights requested when an allocation is registered with the NIC.
#[bitmask(i32)]
#[bitmask_config(vec_debug)]
pub enum AccessFlags {
    LocalWrite = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0 as _,
    RemoteWrite = ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0 as _,
    RemoteRead = ibv_access_flags::IBV_ACCESS_REMOTE_READ.0 as _,
}

/// One `(pointer, length)` element of a scatter-gather array.
#[derive(Debug, Clone, Copy)]
pub struct ScatterGatherSegment {
    pub addr: NonNull<u8>,
    pub len: u32,
}

impl ScatterGatherSegment {
    /// View the segment as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure the segment still points at live memory and no
    /// in-flight work request is writing to it.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.addr.as_ptr(), self.len as usize)
    }
}

/// An ordered list of `(pointer, length)` pairs, the framing unit of message
/// payloads.
///
/// `owner`, when present, names the pinned allocation that has to be released
/// to free the array: the receive buffer the segments alias into for inbound
/// messages, or an auxiliary allocation for outbound ones.
#[derive(Debug, Clone)]
pub struct ScatterGatherArray {
    pub segments: Vec<ScatterGatherSegment>,
    pub owner: Option<NonNull<u8>>,
}

impl ScatterGatherArray {
    pub fn from_segments(segments: Vec<ScatterGatherSegment>) -> Self {
        Self { segments, owner: None }
    }

    /// Total payload length across all segments.
    pub fn total_len(&self) -> usize {
        self.segments.iter().map(|seg| seg.len as usize).sum()
    }
}

struct Registration {
    mr: usize,
    lkey: u32,
}

struct Allocation {
    len: usize,
    pins: usize,
    regions: HashMap<usize, Registration>,
}

static HEAP: LazyLock<Mutex<BTreeMap<usize, Allocation>>> = LazyLock::new(|| Mutex::new(BTreeMap::new()));

const ALLOC_ALIGN: usize = 64;

fn containing(heap: &BTreeMap<usize, Allocation>, addr: usize) -> Option<usize> {
    heap.range(..=addr)
        .next_back()
        .filter(|(base, alloc)| addr < *base + alloc.len)
        .map(|(base, _)| *base)
}

/// Local keys of a registered allocation, as needed to build an SGE.
#[derive(Debug, Clone, Copy)]
pub struct RegionKeys {
    pub lkey: u32,
}

/// Allocate `len` zeroed bytes from the pinned heap.
pub fn alloc(len: usize) -> Result<NonNull<u8>> {
    let layout = Layout::from_size_align(len.max(1), ALLOC_ALIGN).map_err(|_| Error::OutOfMemory)?;
    let ptr = unsafe { alloc_zeroed(layout) };
    let ptr = NonNull::new(ptr).ok_or(Error::OutOfMemory)?;

    let mut heap = HEAP.lock().unwrap();
    heap.insert(
        ptr.as_ptr() as usize,
        Allocation {
            len: len.max(1),
            pins: 0,
            regions: HashMap::new(),
        },
    );
    Ok(ptr)
}

/// Release an allocation previously returned by [`alloc`], deregistering any
/// memory regions cached against it.
pub fn free(ptr: NonNull<u8>) -> Result<()> {
    let alloc = {
        let mut heap = HEAP.lock().unwrap();
        heap.remove(&(ptr.as_ptr() as usize))
            .ok_or(Error::Unsupported("buffer was not allocated from the pinned heap"))?
    };

    for reg in alloc.regions.values() {
        unsafe {
            ibv_dereg_mr(reg.mr as *mut ibv_mr);
        }
    }

    let layout = Layout::from_size_align(alloc.len, ALLOC_ALIGN).unwrap();
    unsafe { dealloc(ptr.as_ptr(), layout) };
    Ok(())
}

/// Take a pin on the allocation containing `ptr`.
pub fn pin(ptr: NonNull<u8>) -> Result<()> {
    let mut heap = HEAP.lock().unwrap();
    let base = containing(&heap, ptr.as_ptr() as usize)
        .ok_or(Error::Unsupported("buffer was not allocated from the pinned heap"))?;
    heap.get_mut(&base).unwrap().pins += 1;
    Ok(())
}

/// Release one pin on the allocation containing `ptr`.
pub fn unpin(ptr: NonNull<u8>) -> Result<()> {
    let mut heap = HEAP.lock().unwrap();
    let base = containing(&heap, ptr.as_ptr() as usize)
        .ok_or(Error::Unsupported("buffer was not allocated from the pinned heap"))?;
    let alloc = heap.get_mut(&base).unwrap();
    debug_assert!(alloc.pins > 0, "unpin without a matching pin");
    if alloc.pins == 0 {
        tracing::warn!(addr = ?ptr, "unpin without a matching pin");
        return Ok(());
    }
    alloc.pins -= 1;
    Ok(())
}

/// Pin every segment of a scatter-gather array.
pub fn pin_all(sga: &ScatterGatherArray) -> Result<()> {
    for seg in &sga.segments {
        pin(seg.addr)?;
    }
    Ok(())
}

/// Unpin every segment of a scatter-gather array.
pub fn unpin_all(sga: &ScatterGatherArray) -> Result<()> {
    for seg in &sga.segments {
        unpin(seg.addr)?;
    }
    Ok(())
}

/// Resolve an address inside a pinned allocation to its memory-region keys
/// under `pd`, registering the allocation on first use.
///
/// # Safety
///
/// `pd` must point at a live protection domain, and it must stay live for as
/// long as the returned keys are used in work requests.
pub unsafe fn resolve(ptr: NonNull<u8>, pd: NonNull<ibv_pd>) -> Result<RegionKeys> {
    let mut heap = HEAP.lock().unwrap();
    let base = containing(&heap, ptr.as_ptr() as usize)
        .ok_or(Error::Unsupported("buffer was not allocated from the pinned heap"))?;
    let alloc = heap.get_mut(&base).unwrap();

    let key = pd.as_ptr() as usize;
    if let Some(reg) = alloc.regions.get(&key) {
        return Ok(RegionKeys { lkey: reg.lkey });
    }

    let mr = ibv_reg_mr(pd.as_ptr(), base as *mut _, alloc.len, AccessFlags::LocalWrite.into());
    if mr.is_null() {
        return Err(Error::last_os("ibv_reg_mr"));
    }

    let lkey = (*mr).lkey;
    alloc.regions.insert(key, Registration { mr: mr as usize, lkey });
    Ok(RegionKeys { lkey })
}

/// Deregister every memory region cached under `pd`, across all allocations.
///
/// Called right before the shared protection domain is deallocated so that no
/// region outlives its domain.
pub(crate) fn release_domain_regions(pd: usize) {
    let mut heap = HEAP.lock().unwrap();
    for alloc in heap.values_mut() {
        if let Some(reg) = alloc.regions.remove(&pd) {
            unsafe {
                ibv_dereg_mr(reg.mr as *mut ibv_mr);
            }
        }
    }
}

/// Allocate a single-segment scatter-gather array backed by a fresh pinned
/// buffer of `len` bytes.
pub fn alloc_scatter_gather(len: usize) -> Result<ScatterGatherArray> {
    let buf = alloc(len)?;
    Ok(ScatterGatherArray {
        segments: vec![ScatterGatherSegment {
            addr: buf,
            len: len as u32,
        }],
        owner: None,
    })
}

/// Free a scatter-gather array: its owning buffer when one is attached,
/// otherwise every segment allocation.
pub fn free_scatter_gather(sga: ScatterGatherArray) -> Result<()> {
    match sga.owner {
        Some(owner) => free(owner),
        None => {
            for seg in &sga.segments {
                free(seg.addr)?;
            }
            Ok(())
        },
    }
}

#[cfg(test)]
pub(crate) fn pin_count(ptr: NonNull<u8>) -> Option<usize> {
    let heap = HEAP.lock().unwrap();
    containing(&heap, ptr.as_ptr() as usize).map(|base| heap[&base].pins)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_free_roundtrip() {
        let buf = alloc(256).unwrap();
        assert_eq!(pin_count(buf), Some(0));
        free(buf).unwrap();
        assert_eq!(pin_count(buf), None);
    }

    #[test]
    fn pins_balance() {
        let buf = alloc(64).unwrap();
        pin(buf).unwrap();
        pin(buf).unwrap();
        assert_eq!(pin_count(buf), Some(2));
        unpin(buf).unwrap();
        unpin(buf).unwrap();
        assert_eq!(pin_count(buf), Some(0));
        free(buf).unwrap();
    }

    #[test]
    fn interior_pointers_resolve_to_the_containing_allocation() {
        let buf = alloc(1024).unwrap();
        let interior = unsafe { NonNull::new_unchecked(buf.as_ptr().add(700)) };
        pin(interior).unwrap();
        assert_eq!(pin_count(buf), Some(1));
        unpin(interior).unwrap();
        free(buf).unwrap();
    }

    #[test]
    fn foreign_buffers_are_rejected() {
        let mut local = [0u8; 16];
        let ptr = NonNull::new(local.as_mut_ptr()).unwrap();
        assert!(matches!(pin(ptr), Err(Error::Unsupported(_))));
        assert!(matches!(free(ptr), Err(Error::Unsupported(_))));
    }

    #[test]
    fn scatter_gather_helpers() {
        let sga = alloc_scatter_gather(100).unwrap();
        assert_eq!(sga.segments.len(), 1);
        assert_eq!(sga.total_len(), 100);
        free_scatter_gather(sga).unwrap();
    }
}
