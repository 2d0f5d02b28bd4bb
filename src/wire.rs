//! Message framing over RDMA `SEND`/`RECV` work requests.
//!
//! Every message starts with a fixed 12-byte header followed by the payload
//! segments, each preceded by its own 4-byte length prefix:
//!
//! ```text
//! | magic: u32 | bytes: u32 | segments: u32 | len_0 | data_0 | len_1 | data_1 | ...
//! ```
//!
//! `bytes` counts everything after the header, i.e. the length prefixes plus
//! the payloads. All header fields and length prefixes are **little-endian**
//! on the wire.
//!
//! On the send side the header and the length-prefix array are written into a
//! single transient pinned allocation, and the message is described to the
//! NIC as a gather list of `2N + 1` elements: the header, then one
//! `(prefix, payload)` element pair per segment. The receive side parses the
//! mirror image out of one contiguous receive buffer, producing segments that
//! alias into that buffer.

use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::memory::{self, ScatterGatherArray, ScatterGatherSegment};

/// First word of every frame.
pub const HEADER_MAGIC: u32 = 0x4d51_3031; // "MQ01"

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 12;

/// Size of each per-segment length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Upper bound on segments per message. A frame of `N` segments occupies
/// `2N + 1` gather elements, so the queue-pair SGE caps are derived from this
/// constant.
pub const MAX_SEGMENTS: usize = 4;

/// The fixed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: u32,
    /// Length-prefix plus payload bytes following the header.
    pub bytes: u32,
    /// Number of payload segments.
    pub segments: u32,
}

impl MessageHeader {
    fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.bytes.to_le_bytes());
        buf[8..12].copy_from_slice(&self.segments.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            magic: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            bytes: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            segments: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        }
    }
}

/// One `(address, length)` element of an outbound gather list, before memory
/// keys are attached.
#[derive(Debug, Clone, Copy)]
pub struct GatherElement {
    pub addr: u64,
    pub len: u32,
}

/// An encoded outbound message: the gather list in wire order plus the
/// transient allocation holding the header and length prefixes.
///
/// The scratch allocation is pinned on creation; ownership passes to the task
/// that posts the message, which unpins it when the send completes and frees
/// it when the task is dropped.
#[derive(Debug)]
pub struct FramedMessage {
    pub scratch: NonNull<u8>,
    pub elements: Vec<GatherElement>,
    /// Total size of the message on the wire, header included.
    pub wire_bytes: u32,
}

/// Serialize a scatter-gather array into a gather list with header and
/// length prefixes.
///
/// Fails with [`Error::TooManySegments`] before allocating anything when the
/// array exceeds [`MAX_SEGMENTS`]; nothing is posted in that case.
pub fn frame(sga: &ScatterGatherArray) -> Result<FramedMessage> {
    let count = sga.segments.len();
    if count > MAX_SEGMENTS {
        return Err(Error::TooManySegments {
            requested: count,
            limit: MAX_SEGMENTS,
        });
    }

    let payload: usize = sga.total_len();
    let body = payload + count * LENGTH_PREFIX_SIZE;
    let header = MessageHeader {
        magic: HEADER_MAGIC,
        bytes: body as u32,
        segments: count as u32,
    };

    let scratch_len = HEADER_SIZE + count * LENGTH_PREFIX_SIZE;
    let scratch = memory::alloc(scratch_len)?;
    memory::pin(scratch)?;

    let scratch_slice = unsafe { std::slice::from_raw_parts_mut(scratch.as_ptr(), scratch_len) };
    header.write_to(&mut scratch_slice[..HEADER_SIZE]);

    let mut elements = Vec::with_capacity(2 * count + 1);
    elements.push(GatherElement {
        addr: scratch.as_ptr() as u64,
        len: HEADER_SIZE as u32,
    });

    for (i, seg) in sga.segments.iter().enumerate() {
        let prefix_off = HEADER_SIZE + i * LENGTH_PREFIX_SIZE;
        scratch_slice[prefix_off..prefix_off + LENGTH_PREFIX_SIZE].copy_from_slice(&seg.len.to_le_bytes());

        elements.push(GatherElement {
            addr: scratch.as_ptr() as u64 + prefix_off as u64,
            len: LENGTH_PREFIX_SIZE as u32,
        });
        elements.push(GatherElement {
            addr: seg.addr.as_ptr() as u64,
            len: seg.len,
        });
    }

    Ok(FramedMessage {
        scratch,
        elements,
        wire_bytes: (HEADER_SIZE + body) as u32,
    })
}

/// Parse one received buffer back into a header and a scatter-gather array
/// whose segments alias into the buffer.
///
/// The buffer itself becomes the array's owning pointer so the consumer can
/// release it once the payload is no longer needed.
///
/// # Safety
///
/// `buf` must be valid for reads of `len` bytes and stay untouched while the
/// returned segments are in use.
pub unsafe fn parse(buf: NonNull<u8>, len: usize) -> Result<(MessageHeader, ScatterGatherArray)> {
    if len < HEADER_SIZE {
        return Err(Error::Protocol("buffer shorter than the frame header"));
    }

    let bytes = std::slice::from_raw_parts(buf.as_ptr(), len);
    let header = MessageHeader::read_from(&bytes[..HEADER_SIZE]);

    if header.magic != HEADER_MAGIC {
        return Err(Error::Protocol("bad frame magic"));
    }
    if header.segments as usize > MAX_SEGMENTS {
        return Err(Error::Protocol("frame segment count exceeds the limit"));
    }

    let mut segments = Vec::with_capacity(header.segments as usize);
    let mut offset = HEADER_SIZE;
    for _ in 0..header.segments {
        if offset + LENGTH_PREFIX_SIZE > len {
            return Err(Error::Protocol("frame truncated inside a length prefix"));
        }
        let seg_len = u32::from_le_bytes(bytes[offset..offset + LENGTH_PREFIX_SIZE].try_into().unwrap());
        offset += LENGTH_PREFIX_SIZE;

        if offset + seg_len as usize > len {
            return Err(Error::Protocol("frame truncated inside a segment"));
        }
        segments.push(ScatterGatherSegment {
            addr: NonNull::new_unchecked(buf.as_ptr().add(offset)),
            len: seg_len,
        });
        offset += seg_len as usize;
    }

    if offset - HEADER_SIZE != header.bytes as usize {
        return Err(Error::Protocol("frame body length disagrees with the header"));
    }

    Ok((
        header,
        ScatterGatherArray {
            segments,
            owner: Some(buf),
        },
    ))
}
