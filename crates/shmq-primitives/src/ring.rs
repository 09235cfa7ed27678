//! Bulk lock-free descriptor ring.
//!
//! The ring is a fixed-capacity circular buffer of `Copy` descriptors with
//! separate producer and consumer cursor pairs. Each side can be configured
//! as *single* (exactly one thread ever drives it, enabling a non-atomic
//! head update) or *multi* (heads move by CAS, tails are published in
//! reservation order).
//!
//! Counters are `u32` and wrap modulo 2^32 by design; every comparison and
//! subtraction uses wrapping arithmetic. `capacity == size`: full and empty
//! are disambiguated by the cursor pairs, not by a reserved slot.
//!
//! # Layout
//!
//! ```text
//! +--------------------------------------------------------+
//! | RingHeader (192 bytes)                                 |
//! |   size, mask, capacity           (one cache line)      |
//! |   producer cursor: head, tail, single (one cache line) |
//! |   consumer cursor: head, tail, single (one cache line) |
//! +--------------------------------------------------------+
//! | entries: size * T                                      |
//! +--------------------------------------------------------+
//! ```

use core::mem::{align_of, size_of};
use core::mem::MaybeUninit;
use core::ptr;

use crate::region::Region;
use crate::sync::{AtomicU32, Ordering, spin_loop};

/// One side of the ring: reservation (`head`) and publication (`tail`)
/// counters, padded to a cache line.
///
/// `tail` trails `head` while a reserved batch is being copied; the opposing
/// side only ever reads `tail`.
#[repr(C)]
pub struct Cursor {
    /// Reservation counter, monotonically increasing modulo 2^32.
    pub head: AtomicU32,
    /// Publication counter; never passes `head`.
    pub tail: AtomicU32,
    /// 1 when the caller guarantees a single thread drives this side.
    pub single: u32,
    _pad: [u8; 52],
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(core::mem::size_of::<Cursor>() == 64);

impl Cursor {
    fn init(&mut self, single: bool) {
        self.head = AtomicU32::new(0);
        self.tail = AtomicU32::new(0);
        self.single = single as u32;
        self._pad = [0; 52];
    }

    #[inline]
    fn is_single(&self) -> bool {
        self.single != 0
    }
}

/// Ring header (192 bytes, cache-line aligned fields).
#[repr(C, align(64))]
pub struct RingHeader {
    /// Entry count (power of 2, immutable after init).
    pub size: u32,
    /// `size - 1`, for index masking.
    pub mask: u32,
    /// Usable capacity (`== size`).
    pub capacity: u32,
    _pad0: [u8; 52],
    /// Producer cursor pair.
    pub prod: Cursor,
    /// Consumer cursor pair.
    pub cons: Cursor,
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(core::mem::size_of::<RingHeader>() == 192);

impl RingHeader {
    /// Initialize a new ring header.
    ///
    /// `capacity_hint` is rounded up to the next power of two.
    pub fn init(&mut self, capacity_hint: u32, single_producer: bool, single_consumer: bool) {
        assert!(capacity_hint > 0, "capacity_hint must be > 0");
        assert!(capacity_hint <= 1 << 31, "capacity_hint too large");
        let size = capacity_hint.next_power_of_two();
        self.size = size;
        self.mask = size - 1;
        self.capacity = size;
        self._pad0 = [0; 52];
        self.prod.init(single_producer);
        self.cons.init(single_consumer);
    }
}

/// A lock-free bulk ring of descriptors in a shared memory region.
pub struct Ring<T> {
    region: Region,
    header_offset: usize,
    entries_offset: usize,
    _marker: core::marker::PhantomData<T>,
}

// SAFETY: all shared mutation goes through the atomics in the header; entry
// slots are handed between sides by the reserve/publish protocol.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T: Copy> Ring<T> {
    /// Bytes needed for a ring with this capacity hint (header + entries).
    pub fn bytes_for(capacity_hint: u32) -> usize {
        let size = capacity_hint.max(1).next_power_of_two() as usize;
        size_of::<RingHeader>() + size * size_of::<T>()
    }

    /// Initialize a new ring in the region.
    ///
    /// # Safety
    ///
    /// The region must be writable and exclusively owned during
    /// initialization.
    pub unsafe fn init(
        region: Region,
        header_offset: usize,
        capacity_hint: u32,
        single_producer: bool,
        single_consumer: bool,
    ) -> Self {
        assert!(
            header_offset % 64 == 0,
            "header_offset must be 64-byte aligned"
        );
        assert!(align_of::<T>() <= 64, "entry alignment must be <= 64");

        let entries_offset = header_offset + size_of::<RingHeader>();

        let header = unsafe { region.get_mut::<RingHeader>(header_offset) };
        header.init(capacity_hint, single_producer, single_consumer);

        let required = entries_offset + header.size as usize * size_of::<T>();
        assert!(required <= region.len(), "region too small for ring");

        Self {
            region,
            header_offset,
            entries_offset,
            _marker: core::marker::PhantomData,
        }
    }

    /// Attach to an existing ring in the region.
    ///
    /// # Safety
    ///
    /// The region must contain a valid, initialized ring header at
    /// `header_offset`.
    pub unsafe fn attach(region: Region, header_offset: usize) -> Self {
        assert!(
            header_offset % 64 == 0,
            "header_offset must be 64-byte aligned"
        );
        assert!(align_of::<T>() <= 64, "entry alignment must be <= 64");

        let entries_offset = header_offset + size_of::<RingHeader>();
        let header = unsafe { region.get::<RingHeader>(header_offset) };
        let size = header.size;

        assert!(
            size.is_power_of_two() && size > 0,
            "invalid ring size"
        );
        assert!(header.mask == size - 1, "invalid ring mask");
        let required = entries_offset + size as usize * size_of::<T>();
        assert!(required <= region.len(), "region too small for ring");

        Self {
            region,
            header_offset,
            entries_offset,
            _marker: core::marker::PhantomData,
        }
    }

    #[inline]
    fn header(&self) -> &RingHeader {
        // SAFETY: init/attach validated the header at this offset.
        unsafe { self.region.get::<RingHeader>(self.header_offset) }
    }

    #[inline]
    fn entry_ptr(&self, slot: usize) -> *mut T {
        let base = self.region.offset(self.entries_offset);
        // SAFETY: slot < size, checked by the callers' masking.
        unsafe { (base as *mut T).add(slot) }
    }

    /// Number of entries the ring can hold.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.header().capacity
    }

    /// Power-of-two entry count (equal to [`Ring::capacity`]).
    #[inline]
    pub fn size(&self) -> u32 {
        self.header().size
    }

    /// True if a single thread drives the producer side.
    #[inline]
    pub fn is_single_producer(&self) -> bool {
        self.header().prod.is_single()
    }

    /// True if a single thread drives the consumer side.
    #[inline]
    pub fn is_single_consumer(&self) -> bool {
        self.header().cons.is_single()
    }

    /// Published entry count, clipped to capacity.
    ///
    /// Computed from the two tails with wrapping arithmetic; the clip
    /// tolerates transient skew while an update is in flight.
    #[inline]
    pub fn count(&self) -> u32 {
        let header = self.header();
        let prod_tail = header.prod.tail.load(Ordering::Acquire);
        let cons_tail = header.cons.tail.load(Ordering::Acquire);
        prod_tail.wrapping_sub(cons_tail).min(header.capacity)
    }

    /// Free entry count.
    #[inline]
    pub fn free_count(&self) -> u32 {
        self.header().capacity - self.count()
    }

    /// True if no free entries remain.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.free_count() == 0
    }

    /// True if no published entries remain.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Reserve up to `max` entries on the producer side.
    ///
    /// Returns `(old_head, accepted, free_entries)`. The CAS retry loop is
    /// the only point where a producer redoes work; it is bounded by
    /// contention, never by data size.
    fn move_prod_head(&self, max: u32) -> (u32, u32, u32) {
        let header = self.header();
        let capacity = header.capacity;
        let single = header.prod.is_single();

        loop {
            let old_head = header.prod.head.load(Ordering::Relaxed);
            // Acquire pairs with the consumer's Release tail publish, so the
            // free-space computation never sees a tail older than the entries
            // the consumer has already vacated.
            let cons_tail = header.cons.tail.load(Ordering::Acquire);

            let free_entries = capacity.wrapping_add(cons_tail).wrapping_sub(old_head);
            let n = max.min(free_entries);
            if n == 0 {
                return (old_head, 0, free_entries);
            }
            let new_head = old_head.wrapping_add(n);

            if single {
                header.prod.head.store(new_head, Ordering::Relaxed);
                return (old_head, n, free_entries);
            }
            if header
                .prod
                .head
                .compare_exchange_weak(old_head, new_head, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return (old_head, n, free_entries);
            }
            spin_loop();
        }
    }

    /// Reserve up to `max` entries on the consumer side.
    ///
    /// Returns `(old_head, accepted, available_entries)`.
    fn move_cons_head(&self, max: u32) -> (u32, u32, u32) {
        let header = self.header();
        let single = header.cons.is_single();

        loop {
            let old_head = header.cons.head.load(Ordering::Relaxed);
            // Acquire pairs with the producer's Release tail publish, making
            // the copied entries visible before we read them.
            let prod_tail = header.prod.tail.load(Ordering::Acquire);

            let entries = prod_tail.wrapping_sub(old_head);
            let n = max.min(entries);
            if n == 0 {
                return (old_head, 0, entries);
            }
            let new_head = old_head.wrapping_add(n);

            if single {
                header.cons.head.store(new_head, Ordering::Relaxed);
                return (old_head, n, entries);
            }
            if header
                .cons
                .head
                .compare_exchange_weak(old_head, new_head, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return (old_head, n, entries);
            }
            spin_loop();
        }
    }

    /// Publish a completed reservation by advancing `tail`.
    ///
    /// In multi mode, tails advance in reservation order: each publisher
    /// spins (with a CPU pause hint) until the preceding reservation has
    /// published, so the opposing side never observes a hole.
    fn publish(cursor: &Cursor, old_val: u32, new_val: u32) {
        if !cursor.is_single() {
            // Acquire pairs with the preceding reservation's Release below,
            // so its entry copies are carried through our own publish.
            while cursor.tail.load(Ordering::Acquire) != old_val {
                spin_loop();
            }
        }
        // Release pairs with the opposing side's Acquire tail load: entry
        // copies become visible no later than the new tail.
        cursor.tail.store(new_val, Ordering::Release);
    }

    fn copy_in(&self, head: u32, src: *const T, n: u32) {
        let header = self.header();
        let size = header.size as usize;
        let idx = (head & header.mask) as usize;
        let n = n as usize;
        let first = n.min(size - idx);
        // SAFETY: the reservation [head, head+n) is exclusively ours until
        // published; the split keeps both copies in bounds.
        unsafe {
            ptr::copy_nonoverlapping(src, self.entry_ptr(idx), first);
            if first < n {
                ptr::copy_nonoverlapping(src.add(first), self.entry_ptr(0), n - first);
            }
        }
    }

    fn copy_out(&self, head: u32, dst: *mut T, n: u32) {
        let header = self.header();
        let size = header.size as usize;
        let idx = (head & header.mask) as usize;
        let n = n as usize;
        let first = n.min(size - idx);
        // SAFETY: the reservation [head, head+n) is exclusively ours until
        // published; the split keeps both copies in bounds.
        unsafe {
            ptr::copy_nonoverlapping(self.entry_ptr(idx), dst, first);
            if first < n {
                ptr::copy_nonoverlapping(self.entry_ptr(0), dst.add(first), n - first);
            }
        }
    }

    /// Enqueue as many entries of `batch` as fit.
    ///
    /// Returns `(accepted, free_after)`. Never blocks waiting for space: a
    /// request that cannot be fully satisfied is partially satisfied.
    pub fn enqueue_bulk(&self, batch: &[T]) -> (usize, usize) {
        let max = batch.len().min(u32::MAX as usize) as u32;
        let (old_head, n, free_entries) = self.move_prod_head(max);
        if n == 0 {
            return (0, free_entries as usize);
        }
        self.copy_in(old_head, batch.as_ptr(), n);
        Self::publish(&self.header().prod, old_head, old_head.wrapping_add(n));
        (n as usize, (free_entries - n) as usize)
    }

    /// Dequeue up to `out.len()` entries into `out`.
    ///
    /// Returns `(accepted, available_after)`.
    pub fn dequeue_bulk(&self, out: &mut [T]) -> (usize, usize) {
        let max = out.len().min(u32::MAX as usize) as u32;
        let (n, available) = self.dequeue_bulk_raw(out.as_mut_ptr(), max);
        (n as usize, available as usize)
    }

    fn dequeue_bulk_raw(&self, out: *mut T, max: u32) -> (u32, u32) {
        let (old_head, n, entries) = self.move_cons_head(max);
        if n == 0 {
            return (0, entries);
        }
        self.copy_out(old_head, out, n);
        Self::publish(&self.header().cons, old_head, old_head.wrapping_add(n));
        (n, entries - n)
    }

    /// Enqueue a single entry. Returns false if the ring was full.
    pub fn enqueue(&self, entry: T) -> bool {
        self.enqueue_bulk(core::slice::from_ref(&entry)).0 == 1
    }

    /// Dequeue a single entry.
    pub fn dequeue(&self) -> Option<T> {
        let mut out = MaybeUninit::<T>::uninit();
        let (n, _) = self.dequeue_bulk_raw(out.as_mut_ptr(), 1);
        // SAFETY: copy_out initialized the entry when n == 1.
        (n == 1).then(|| unsafe { out.assume_init() })
    }

    /// Read the entry at the consumption point without removing it.
    ///
    /// Returns `None` when the ring is empty. Single-consumer use: with
    /// rival consumers the peeked entry may be claimed by another thread
    /// before a subsequent dequeue.
    pub fn peek_head(&self) -> Option<T> {
        let header = self.header();
        let head = header.cons.head.load(Ordering::Relaxed);
        // Acquire pairs with the producer's Release tail publish.
        let prod_tail = header.prod.tail.load(Ordering::Acquire);
        if prod_tail.wrapping_sub(head) == 0 {
            return None;
        }
        let slot = (head & header.mask) as usize;
        // SAFETY: the entry at `slot` was published by the producer and is
        // not reused until cons.tail passes it.
        Some(unsafe { ptr::read(self.entry_ptr(slot)) })
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::region::HeapRegion;
    use std::sync::Arc;
    use std::vec::Vec;

    fn ring_region(capacity: u32) -> HeapRegion {
        HeapRegion::new_zeroed(Ring::<u64>::bytes_for(capacity) + 64)
    }

    #[test]
    fn test_ring_header_size() {
        assert_eq!(core::mem::size_of::<RingHeader>(), 192);
        assert_eq!(core::mem::size_of::<Cursor>(), 64);
    }

    #[test]
    fn test_init_rounds_to_power_of_two() {
        let owner = ring_region(8);
        let ring: Ring<u64> = unsafe { Ring::init(owner.region(), 0, 5, true, true) };
        assert_eq!(ring.size(), 8);
        assert_eq!(ring.capacity(), 8);
        assert_eq!(ring.header().mask, 7);
        assert!(ring.is_single_producer());
        assert!(ring.is_single_consumer());
    }

    #[test]
    fn test_spsc_fifo_order() {
        let owner = ring_region(8);
        let ring: Ring<u64> = unsafe { Ring::init(owner.region(), 0, 8, true, true) };

        for i in 0..8u64 {
            assert!(ring.enqueue(i));
        }
        assert!(ring.is_full());
        assert!(!ring.enqueue(99));

        for i in 0..8u64 {
            assert_eq!(ring.dequeue(), Some(i));
        }
        assert!(ring.is_empty());
        assert_eq!(ring.dequeue(), None);
    }

    #[test]
    fn test_bulk_partial_accept() {
        let owner = ring_region(4);
        let ring: Ring<u64> = unsafe { Ring::init(owner.region(), 0, 4, false, false) };

        let batch = [1u64, 2, 3, 4, 5, 6];
        let (accepted, free_after) = ring.enqueue_bulk(&batch);
        assert_eq!(accepted, 4);
        assert_eq!(free_after, 0);

        // Full ring accepts nothing, reports free space.
        let (accepted, free_after) = ring.enqueue_bulk(&batch);
        assert_eq!(accepted, 0);
        assert_eq!(free_after, 0);

        let mut out = [0u64; 8];
        let (taken, available_after) = ring.dequeue_bulk(&mut out);
        assert_eq!(taken, 4);
        assert_eq!(available_after, 0);
        assert_eq!(&out[..4], &[1, 2, 3, 4]);

        let (taken, _) = ring.dequeue_bulk(&mut out);
        assert_eq!(taken, 0);
    }

    #[test]
    fn test_count_plus_free_is_capacity() {
        let owner = ring_region(8);
        let ring: Ring<u64> = unsafe { Ring::init(owner.region(), 0, 8, true, true) };

        // Deterministic pseudo-random mix of pushes and pops.
        let mut state = 0x2545_F491u32;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state
        };

        for i in 0..1000u64 {
            if next() % 3 != 0 {
                let _ = ring.enqueue(i);
            } else {
                let _ = ring.dequeue();
            }
            assert_eq!(ring.count() + ring.free_count(), ring.capacity());
        }
    }

    #[test]
    fn test_wraparound_split_copy() {
        let owner = ring_region(4);
        let ring: Ring<u64> = unsafe { Ring::init(owner.region(), 0, 4, true, true) };

        // Offset the cursors so bulk copies straddle the end of storage.
        assert!(ring.enqueue(0));
        assert_eq!(ring.dequeue(), Some(0));

        let mut expected = 1u64;
        for round in 0..64u64 {
            let batch = [round * 3 + 1, round * 3 + 2, round * 3 + 3];
            let (accepted, _) = ring.enqueue_bulk(&batch);
            assert_eq!(accepted, 3);
            let mut out = [0u64; 3];
            let (taken, _) = ring.dequeue_bulk(&mut out);
            assert_eq!(taken, 3);
            for v in out {
                assert_eq!(v, expected);
                expected += 1;
            }
        }
    }

    #[test]
    fn test_counter_wraparound() {
        let owner = ring_region(8);
        let ring: Ring<u64> = unsafe { Ring::init(owner.region(), 0, 8, true, true) };

        // Seed all cursors just below the 2^32 boundary; arithmetic must
        // wrap, not saturate.
        let start = u32::MAX - 3;
        let header = ring.header();
        header.prod.head.store(start, Ordering::Relaxed);
        header.prod.tail.store(start, Ordering::Relaxed);
        header.cons.head.store(start, Ordering::Relaxed);
        header.cons.tail.store(start, Ordering::Relaxed);

        for i in 0..16u64 {
            assert!(ring.enqueue(i), "push {i} across wraparound");
            assert_eq!(ring.count(), 1);
            assert_eq!(ring.dequeue(), Some(i));
            assert_eq!(ring.count() + ring.free_count(), ring.capacity());
        }
    }

    #[test]
    fn test_peek_head_returns_next_dequeue() {
        let owner = ring_region(4);
        let ring: Ring<u64> = unsafe { Ring::init(owner.region(), 0, 4, true, true) };

        assert_eq!(ring.peek_head(), None);

        assert!(ring.enqueue(7));
        assert!(ring.enqueue(8));

        // Peeking a non-empty ring yields the head and does not consume it.
        assert_eq!(ring.peek_head(), Some(7));
        assert_eq!(ring.peek_head(), Some(7));
        assert_eq!(ring.count(), 2);

        assert_eq!(ring.dequeue(), Some(7));
        assert_eq!(ring.peek_head(), Some(8));
        assert_eq!(ring.dequeue(), Some(8));
        assert_eq!(ring.peek_head(), None);
    }

    #[test]
    fn test_attach_second_view() {
        let owner = ring_region(8);
        let ring: Ring<u64> = unsafe { Ring::init(owner.region(), 0, 8, true, true) };
        let other: Ring<u64> = unsafe { Ring::attach(owner.region(), 0) };

        assert_eq!(other.capacity(), 8);
        assert!(other.is_single_producer());
        assert!(ring.enqueue(42));
        assert_eq!(other.dequeue(), Some(42));
    }

    #[test]
    fn test_mpmc_exactly_once() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 2;
        const PER_PRODUCER: u64 = 1000;

        let owner = Arc::new(ring_region(64));
        let ring: Arc<Ring<u64>> =
            Arc::new(unsafe { Ring::init(owner.region(), 0, 64, false, false) });

        let mut handles = Vec::new();
        for p in 0..PRODUCERS as u64 {
            let ring = ring.clone();
            let keep = owner.clone();
            handles.push(std::thread::spawn(move || {
                let _keep = keep;
                for i in 0..PER_PRODUCER {
                    let value = p * PER_PRODUCER + i;
                    while !ring.enqueue(value) {
                        std::thread::yield_now();
                    }
                }
            }));
        }

        let mut consumers = Vec::new();
        for _ in 0..CONSUMERS {
            let ring = ring.clone();
            let keep = owner.clone();
            consumers.push(std::thread::spawn(move || {
                let _keep = keep;
                let mut seen = Vec::new();
                loop {
                    if let Some(v) = ring.dequeue() {
                        if v == u64::MAX {
                            break;
                        }
                        seen.push(v);
                    } else {
                        std::thread::yield_now();
                    }
                }
                seen
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        // One poison pill per consumer.
        for _ in 0..CONSUMERS {
            while !ring.enqueue(u64::MAX) {
                std::thread::yield_now();
            }
        }

        let mut all: Vec<u64> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();

        let expected: Vec<u64> = (0..PRODUCERS as u64 * PER_PRODUCER).collect();
        assert_eq!(all, expected, "every message observed exactly once");
    }
}
