//! Ring-backed free list of fixed-size payload slots.
//!
//! The pool is a [`Ring`] of [`SlotDesc`] entries, pre-populated once at
//! initialization with one descriptor per payload slot. Allocation dequeues
//! a descriptor; freeing resets its stored length and enqueues it back.
//! The pool is never resized after initialization.

use crate::region::Region;
use crate::ring::Ring;

/// Descriptor for one payload slot in a shared data area.
///
/// Descriptors are value types copied by the ring, never referenced by
/// pointer across processes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotDesc {
    /// Byte offset of the slot in the data area.
    pub offset: u64,
    /// Valid payload bytes currently stored there (0 = free).
    pub size: u64,
}

const _: () = assert!(core::mem::size_of::<SlotDesc>() == 16);

/// A ring used as a free list of fixed-size payload slots.
pub struct SlotPool {
    ring: Ring<SlotDesc>,
}

impl SlotPool {
    /// Bytes needed for a pool of `slot_count` descriptors.
    pub fn bytes_for(slot_count: u32) -> usize {
        Ring::<SlotDesc>::bytes_for(slot_count)
    }

    /// Initialize a new pool and fill it with one free descriptor per slot.
    ///
    /// Slot `i` gets `offset = i * slot_size`, `size = 0`. The allocation
    /// side is a *dequeue*, so `single_alloc`/`single_free` describe which
    /// sides of the underlying ring are driven by a single thread.
    ///
    /// # Safety
    ///
    /// The region must be writable and exclusively owned during
    /// initialization.
    pub unsafe fn init(
        region: Region,
        header_offset: usize,
        slot_count: u32,
        slot_size: u64,
        single_alloc: bool,
        single_free: bool,
    ) -> Result<Self, &'static str> {
        if slot_count == 0 {
            return Err("slot_count must be > 0");
        }
        if slot_size == 0 {
            return Err("slot_size must be > 0");
        }

        let ring = unsafe {
            Ring::init(region, header_offset, slot_count, single_free, single_alloc)
        };

        for i in 0..slot_count {
            let desc = SlotDesc {
                offset: i as u64 * slot_size,
                size: 0,
            };
            if !ring.enqueue(desc) {
                return Err("pool prefill overflowed its ring");
            }
        }

        Ok(Self { ring })
    }

    /// Attach to an existing pool.
    ///
    /// # Safety
    ///
    /// The region must contain a valid, initialized pool ring at
    /// `header_offset`.
    pub unsafe fn attach(region: Region, header_offset: usize) -> Self {
        Self {
            ring: unsafe { Ring::attach(region, header_offset) },
        }
    }

    /// Take a free slot descriptor, or `None` if the pool is exhausted.
    #[inline]
    pub fn alloc(&self) -> Option<SlotDesc> {
        self.ring.dequeue()
    }

    /// Return a slot descriptor to the pool.
    ///
    /// The stored length is reset to 0 before requeueing; this is the only
    /// path that resets it, so a new owner never observes a stale size.
    /// Returns false if the ring rejected the descriptor, which means a
    /// descriptor was freed twice or fabricated.
    #[inline]
    pub fn free(&self, mut desc: SlotDesc) -> bool {
        desc.size = 0;
        self.ring.enqueue(desc)
    }

    /// Number of free slots currently in the pool.
    #[inline]
    pub fn free_count(&self) -> u32 {
        self.ring.count()
    }

    /// Total descriptor capacity of the pool ring.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.ring.capacity()
    }
}
