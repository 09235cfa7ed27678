//! Segment memory layout definitions.
//!
//! This module defines the `repr(C)` header that starts every queue segment
//! and the offset/size arithmetic for the regions that follow it.
//!
//! # Memory Layout
//!
//! ```text
//! +--------------------------------------------------------------+
//! | SegmentHeader (64 bytes, cache-line aligned)                 |
//! |   magic, version, sizes, creation time, creator pid          |
//! +--------------------------------------------------------------+
//! | Message ring (cache-line aligned)                            |
//! |   RingHeader (192 bytes) + slot_count * SlotDesc (16 bytes)  |
//! +--------------------------------------------------------------+
//! | Slot pool ring (same size, cache-line aligned)               |
//! +--------------------------------------------------------------+
//! | Payload data area (slot_count * slot_size bytes)             |
//! +--------------------------------------------------------------+
//! ```
//!
//! The total file size is rounded up to the page size; the trailing pad is
//! never addressed.

use std::mem::size_of;

use shmq_primitives::{Ring, SlotDesc};

/// Magic constant at the start of every segment file.
pub const SEGMENT_MAGIC: u32 = 0x4649_464F;

/// Current segment version (major << 16 | minor).
pub const SEGMENT_VERSION: u32 = 1 << 16; // v1.0

/// Slot sizes are aligned up to this boundary.
pub const SLOT_SIZE_ALIGN: u64 = 1024;

/// Alignment of the ring regions.
pub const CACHE_LINE: usize = 64;

/// The total segment size is rounded up to this boundary.
pub const PAGE_SIZE: usize = 4096;

/// Segment header at the start of the mapped file (64 bytes).
///
/// Written once by the creating process; every attaching process checks it
/// field-for-field. Nothing in it is renegotiated after creation.
#[repr(C, align(64))]
pub struct SegmentHeader {
    /// Magic constant identifying a queue segment.
    pub magic: u32,
    /// Version (major.minor packed).
    pub version: u32,
    /// Total mapped size in bytes (page-aligned).
    pub total_size: u64,
    /// Byte size of one ring region (header + descriptors, aligned).
    pub ring_region_size: u64,
    /// Payload slot size in bytes (1024-aligned).
    pub slot_size: u64,
    /// Number of payload slots (power of two).
    pub slot_count: u64,
    /// Creation time, seconds since the Unix epoch.
    pub created_at: u64,
    /// PID of the creating process.
    pub creator_pid: u32,
    _pad: [u8; 12],
}

const _: () = assert!(size_of::<SegmentHeader>() == 64);

impl SegmentHeader {
    /// Initialize a new header for the given geometry.
    pub fn init(&mut self, geometry: &SegmentGeometry, created_at: u64, creator_pid: u32) {
        self.magic = SEGMENT_MAGIC;
        self.version = SEGMENT_VERSION;
        self.total_size = geometry.total_size as u64;
        self.ring_region_size = geometry.ring_region_size as u64;
        self.slot_size = geometry.slot_size;
        self.slot_count = geometry.slot_count;
        self.created_at = created_at;
        self.creator_pid = creator_pid;
        self._pad = [0; 12];
    }

    /// Validate the header against the mapped length.
    pub fn validate(&self, mapped_len: usize) -> Result<(), LayoutError> {
        if self.magic != SEGMENT_MAGIC {
            return Err(LayoutError::InvalidMagic);
        }
        let major = self.version >> 16;
        let our_major = SEGMENT_VERSION >> 16;
        if major != our_major {
            return Err(LayoutError::IncompatibleVersion {
                expected: SEGMENT_VERSION,
                found: self.version,
            });
        }
        if self.total_size != mapped_len as u64 {
            return Err(LayoutError::InvalidConfig("total_size does not match mapping"));
        }
        if self.slot_size == 0 || self.slot_size % SLOT_SIZE_ALIGN != 0 {
            return Err(LayoutError::InvalidConfig("slot_size must be 1024-aligned"));
        }
        if self.slot_count == 0 || !self.slot_count.is_power_of_two() {
            return Err(LayoutError::InvalidConfig("slot_count must be a power of 2"));
        }
        Ok(())
    }
}

/// Align `value` up to `align` (a power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + (align - 1)) & !(align - 1)
}

#[inline]
const fn align_up_u64(value: u64, align: u64) -> u64 {
    (value + (align - 1)) & !(align - 1)
}

/// Computed geometry of a segment, derived once from the caller's request.
///
/// `slot_size` is the requested size aligned up to 1024 bytes; `slot_count`
/// is the requested count plus one headroom slot, rounded up to the next
/// power of two. Both rings share the same region size and descriptor
/// capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentGeometry {
    /// Payload slot size in bytes (1024-aligned).
    pub slot_size: u64,
    /// Number of payload slots (power of two).
    pub slot_count: u64,
    /// Byte size of one ring region, cache-line aligned.
    pub ring_region_size: usize,
    /// Total file size, page-aligned.
    pub total_size: usize,
}

impl SegmentGeometry {
    /// Compute the geometry for a requested slot size and count.
    pub fn compute(slot_size: u64, slot_count: u64) -> Result<Self, LayoutError> {
        if slot_size == 0 {
            return Err(LayoutError::InvalidConfig("slot_size must be > 0"));
        }
        if slot_count == 0 {
            return Err(LayoutError::InvalidConfig("slot_count must be > 0"));
        }
        if slot_count >= 1 << 30 {
            return Err(LayoutError::InvalidConfig("slot_count too large"));
        }

        let slot_size = align_up_u64(slot_size, SLOT_SIZE_ALIGN);
        // One headroom slot, then the ring's power-of-two rounding.
        let slot_count = (slot_count + 1).next_power_of_two();

        let ring_region_size = align_up(
            Ring::<SlotDesc>::bytes_for(slot_count as u32),
            CACHE_LINE,
        );

        let data_size = (slot_size as usize)
            .checked_mul(slot_count as usize)
            .ok_or(LayoutError::SizeOverflow("payload area"))?;

        let total_size = size_of::<SegmentHeader>()
            .checked_add(
                ring_region_size
                    .checked_mul(2)
                    .ok_or(LayoutError::SizeOverflow("ring regions"))?,
            )
            .and_then(|v| v.checked_add(data_size))
            .and_then(|v| v.checked_add(PAGE_SIZE - 1))
            .ok_or(LayoutError::SizeOverflow("total size"))?;
        let total_size = total_size & !(PAGE_SIZE - 1);

        Ok(Self {
            slot_size,
            slot_count,
            ring_region_size,
            total_size,
        })
    }
}

/// Byte offsets of the segment's regions.
#[derive(Debug, Clone, Copy)]
pub struct SegmentOffsets {
    pub header: usize,
    pub message_ring: usize,
    pub pool_ring: usize,
    pub data: usize,
}

impl SegmentOffsets {
    /// Offsets for a computed geometry.
    pub fn of(geometry: &SegmentGeometry) -> Self {
        let header = 0usize;
        let message_ring = header + size_of::<SegmentHeader>();
        let pool_ring = message_ring + geometry.ring_region_size;
        let data = pool_ring + geometry.ring_region_size;
        Self {
            header,
            message_ring,
            pool_ring,
            data,
        }
    }
}

/// Errors from layout computation and header validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// Invalid magic constant.
    InvalidMagic,
    /// Incompatible segment version.
    IncompatibleVersion { expected: u32, found: u32 },
    /// Invalid configuration in header or request.
    InvalidConfig(&'static str),
    /// Size arithmetic overflowed.
    SizeOverflow(&'static str),
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic => write!(f, "invalid segment magic"),
            Self::IncompatibleVersion { expected, found } => {
                write!(
                    f,
                    "incompatible segment version: expected {}.{}, found {}.{}",
                    expected >> 16,
                    expected & 0xFFFF,
                    found >> 16,
                    found & 0xFFFF
                )
            }
            Self::InvalidConfig(msg) => write!(f, "invalid segment config: {}", msg),
            Self::SizeOverflow(what) => write!(f, "segment size overflow ({})", what),
        }
    }
}

impl std::error::Error for LayoutError {}
