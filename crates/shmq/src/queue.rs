//! File-backed shared-memory queue sessions.
//!
//! [`ShmQueue::open`] owns the whole segment lifecycle: it formats the
//! backing file when it is new or unrecognizable, attaches to it when a
//! compatible segment already exists, and maps it shared so every attached
//! process sees the same rings and payload slots.
//!
//! Whichever process opens the path first becomes the creator and
//! initializes the header and both rings; later openers validate the header
//! and fail on any geometry or discipline mismatch. Closing a handle never
//! deletes the file — messages survive until an operator removes it.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::time::{SystemTime, UNIX_EPOCH};

use shmq_primitives::{Region, Ring, SlotDesc, SlotPool};

use crate::layout::{
    PAGE_SIZE, SegmentGeometry, SegmentHeader, SegmentOffsets, LayoutError,
};

/// Ring discipline configuration for a queue.
///
/// `single_*` asserts that exactly one thread (across all attached
/// processes) drives that side, enabling the ring's non-atomic fast path.
/// This changes which safety invariants the implementation may assume, so
/// it is explicit configuration, recorded in the shared ring headers and
/// re-checked on every attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Exactly one pushing thread.
    pub single_producer: bool,
    /// Exactly one popping thread.
    pub single_consumer: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            single_producer: true,
            single_consumer: true,
        }
    }
}

/// The shared mapping behind a queue handle.
struct Mapping {
    base: *mut u8,
    len: usize,
    _file: File,
}

// SAFETY: the mapped memory is synchronized via the atomics placed in it.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: base/len were returned by mmap and are still mapped.
        unsafe {
            libc::munlock(self.base as *const libc::c_void, self.len);
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

/// A handle to a shared-memory FIFO message queue.
///
/// All operations take `&self`; the handle is `Send + Sync`. The configured
/// [`QueueConfig`] governs how many threads may drive each side.
pub struct ShmQueue {
    region: Region,
    geometry: SegmentGeometry,
    offsets: SegmentOffsets,
    messages: Ring<SlotDesc>,
    pool: SlotPool,
    path: PathBuf,
    mapping: Mapping,
}

// SAFETY: every shared field in the segment is driven through atomics under
// the configured ring disciplines; slot payload ownership transfers with the
// descriptors.
unsafe impl Send for ShmQueue {}
unsafe impl Sync for ShmQueue {}

impl core::fmt::Debug for ShmQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ShmQueue")
            .field("geometry", &self.geometry)
            .field("offsets", &self.offsets)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Result of probing a backing file before mapping it.
enum Probe {
    /// New, empty, or unrecognizable: format from scratch.
    Fresh,
    /// A valid segment with exactly the requested geometry.
    Attach,
    /// A valid segment whose geometry differs from the request.
    Mismatch {
        stored_slot_size: u64,
        stored_slot_count: u64,
    },
}

impl ShmQueue {
    /// Open (or create) a queue at `path` with the default single-producer,
    /// single-consumer discipline.
    ///
    /// `slot_size` is aligned up to 1024 bytes; `slot_count` gains one
    /// headroom slot and is rounded up to the next power of two. Every
    /// attaching process must request the same values.
    pub fn open(
        path: impl AsRef<Path>,
        slot_size: u64,
        slot_count: u64,
    ) -> Result<Self, OpenError> {
        Self::open_with(path, slot_size, slot_count, QueueConfig::default())
    }

    /// Open (or create) a queue with an explicit ring discipline.
    pub fn open_with(
        path: impl AsRef<Path>,
        slot_size: u64,
        slot_count: u64,
        config: QueueConfig,
    ) -> Result<Self, OpenError> {
        let path = path.as_ref();
        let geometry = SegmentGeometry::compute(slot_size, slot_count).map_err(OpenError::Layout)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o666)
            .open(path)
            .map_err(|e| {
                tracing::error!(path = %path.display(), error = %e, "queue open failed");
                OpenError::Io(e)
            })?;

        let probe = probe_segment(&file, &geometry).map_err(OpenError::Io)?;
        let fresh = match probe {
            Probe::Fresh => {
                // Truncate to zero first so the grow to target zero-fills.
                file.set_len(0).map_err(OpenError::Io)?;
                file.set_len(geometry.total_size as u64).map_err(OpenError::Io)?;
                true
            }
            Probe::Attach => false,
            Probe::Mismatch {
                stored_slot_size,
                stored_slot_count,
            } => {
                tracing::error!(
                    path = %path.display(),
                    requested_slot_size = geometry.slot_size,
                    requested_slot_count = geometry.slot_count,
                    stored_slot_size,
                    stored_slot_count,
                    "queue geometry mismatch"
                );
                return Err(OpenError::ConfigMismatch {
                    requested_slot_size: geometry.slot_size,
                    requested_slot_count: geometry.slot_count,
                    stored_slot_size,
                    stored_slot_count,
                });
            }
        };

        // SAFETY: mapping a regular file we hold open, at its exact length.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                geometry.total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let e = io::Error::last_os_error();
            tracing::error!(path = %path.display(), error = %e, "queue mmap failed");
            return Err(OpenError::Io(e));
        }
        let base = base as *mut u8;

        // Unmaps on every subsequent error path.
        let mapping = Mapping {
            base,
            len: geometry.total_size,
            _file: file,
        };

        // SAFETY: base/len come from the successful mmap above.
        unsafe {
            if libc::madvise(
                base as *mut libc::c_void,
                geometry.total_size,
                libc::MADV_SEQUENTIAL,
            ) != 0
            {
                let e = io::Error::last_os_error();
                tracing::error!(path = %path.display(), error = %e, "queue madvise failed");
                return Err(OpenError::Io(e));
            }
            // Pinning is best-effort: RLIMIT_MEMLOCK is routinely smaller
            // than a queue segment in containers.
            if libc::mlock(base as *const libc::c_void, geometry.total_size) != 0 {
                let e = io::Error::last_os_error();
                tracing::warn!(path = %path.display(), error = %e, "queue mlock failed");
            }
        }

        // SAFETY: the mapping stays alive as long as the returned handle.
        let region = unsafe { Region::from_raw(base, geometry.total_size) };
        let offsets = SegmentOffsets::of(&geometry);

        let (messages, pool) = if fresh {
            let created_at = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);

            // SAFETY: freshly formatted file; this process is the exclusive
            // initializer until the header is published.
            let header = unsafe { region.get_mut::<SegmentHeader>(offsets.header) };
            header.init(&geometry, created_at, std::process::id());

            // SAFETY: region is writable and exclusively owned during init.
            let messages = unsafe {
                Ring::<SlotDesc>::init(
                    region,
                    offsets.message_ring,
                    geometry.slot_count as u32,
                    config.single_producer,
                    config.single_consumer,
                )
            };
            // Slots are allocated by pushers and freed by poppers, so the
            // pool's dequeue side follows the producer discipline and its
            // enqueue side the consumer discipline.
            let pool = unsafe {
                SlotPool::init(
                    region,
                    offsets.pool_ring,
                    geometry.slot_count as u32,
                    geometry.slot_size,
                    config.single_producer,
                    config.single_consumer,
                )
            }
            .map_err(|msg| OpenError::Layout(LayoutError::InvalidConfig(msg)))?;

            tracing::debug!(
                path = %path.display(),
                total_size = geometry.total_size,
                slot_size = geometry.slot_size,
                slot_count = geometry.slot_count,
                "formatted new queue segment"
            );
            (messages, pool)
        } else {
            // SAFETY: probe validated magic/version/length for this mapping.
            let header = unsafe { region.get::<SegmentHeader>(offsets.header) };
            header
                .validate(geometry.total_size)
                .map_err(OpenError::Layout)?;

            // SAFETY: a validated segment holds initialized rings at these
            // offsets.
            let messages =
                unsafe { Ring::<SlotDesc>::attach(region, offsets.message_ring) };
            let stored = QueueConfig {
                single_producer: messages.is_single_producer(),
                single_consumer: messages.is_single_consumer(),
            };
            if stored != config {
                tracing::error!(
                    path = %path.display(),
                    ?stored,
                    requested = ?config,
                    "queue ring discipline mismatch"
                );
                return Err(OpenError::ModeMismatch {
                    requested: config,
                    stored,
                });
            }
            let pool = unsafe { SlotPool::attach(region, offsets.pool_ring) };

            tracing::debug!(
                path = %path.display(),
                messages = messages.count(),
                "attached to existing queue segment"
            );
            (messages, pool)
        };

        // Touch every page once to force physical backing before use.
        for off in (0..geometry.total_size).step_by(PAGE_SIZE) {
            // SAFETY: off < total_size, all mapped.
            unsafe { ptr::read_volatile(base.add(off)) };
        }

        Ok(Self {
            region,
            geometry,
            offsets,
            messages,
            pool,
            path: path.to_path_buf(),
            mapping,
        })
    }

    /// Unmap and close the handle.
    ///
    /// The backing file and any queued messages persist; attach again with
    /// [`ShmQueue::open`] to resume.
    pub fn close(self) {
        drop(self);
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pointer to a slot's payload bytes.
    fn slot_ptr(&self, desc: &SlotDesc) -> *mut u8 {
        debug_assert!(
            desc.offset + self.geometry.slot_size
                <= (self.geometry.slot_count * self.geometry.slot_size),
            "descriptor outside data area"
        );
        self.region.offset(self.offsets.data + desc.offset as usize)
    }

    /// Push a message, copying `buf` into a free slot.
    ///
    /// Returns the number of bytes stored. Messages longer than
    /// [`ShmQueue::slot_size`] are silently truncated to it; size messages
    /// accordingly to avoid loss.
    pub fn push(&self, buf: &[u8]) -> Result<usize, PushError> {
        if self.messages.is_full() {
            tracing::debug!(path = %self.path.display(), "queue full");
            return Err(PushError::Full);
        }

        let Some(mut desc) = self.pool.alloc() else {
            tracing::debug!(path = %self.path.display(), "slot pool exhausted");
            return Err(PushError::AllocFailed);
        };

        let len = (self.geometry.slot_size as usize).min(buf.len());
        // SAFETY: the slot is exclusively ours between alloc and enqueue.
        unsafe {
            ptr::copy_nonoverlapping(buf.as_ptr(), self.slot_ptr(&desc), len);
        }
        desc.size = len as u64;

        if !self.messages.enqueue(desc) {
            // The ring filled between the capacity check and the
            // reservation; return the slot rather than leak it.
            tracing::error!(
                path = %self.path.display(),
                offset = desc.offset,
                "message enqueue failed after slot allocation"
            );
            self.pool.free(desc);
            return Err(PushError::EnqueueFailed);
        }

        Ok(len)
    }

    /// Discard the oldest message.
    pub fn pop(&self) -> Result<(), PopError> {
        let Some(desc) = self.messages.dequeue() else {
            return Err(PopError::Empty);
        };

        if !self.pool.free(desc) {
            // A slot that cannot be returned means the segment state is
            // corrupt; callers should stop using this queue.
            tracing::error!(
                path = %self.path.display(),
                offset = desc.offset,
                "slot free failed after dequeue"
            );
            return Err(PopError::SlotFree);
        }
        Ok(())
    }

    /// Pop the oldest message into `buf`, returning the stored length.
    ///
    /// If `buf` is smaller than the stored message the queue is left
    /// untouched and [`PopError::BufferTooSmall`] is returned. That check is
    /// exact under the single-consumer discipline; with rival consumers a
    /// different message may be claimed between the check and the dequeue,
    /// so multi-consumer callers should size `buf` to
    /// [`ShmQueue::slot_size`], which always suffices.
    pub fn pop_into(&self, buf: &mut [u8]) -> Result<usize, PopError> {
        let Some(head) = self.messages.peek_head() else {
            return Err(PopError::Empty);
        };
        if (buf.len() as u64) < head.size {
            return Err(PopError::BufferTooSmall {
                needed: head.size as usize,
                capacity: buf.len(),
            });
        }

        let Some(desc) = self.messages.dequeue() else {
            return Err(PopError::Empty);
        };
        let len = (desc.size as usize).min(buf.len());
        // SAFETY: the slot is exclusively ours between dequeue and free.
        unsafe {
            ptr::copy_nonoverlapping(self.slot_ptr(&desc), buf.as_mut_ptr(), len);
        }

        if !self.pool.free(desc) {
            tracing::error!(
                path = %self.path.display(),
                offset = desc.offset,
                "slot free failed after dequeue"
            );
            return Err(PopError::SlotFree);
        }
        Ok(len)
    }

    /// View the oldest message's bytes in place, without removing it.
    ///
    /// Zero-copy, single-consumer use: the slice is only stable while this
    /// thread refrains from popping, since a pop returns the slot to the
    /// pool for reuse.
    pub fn peek(&self) -> Option<&[u8]> {
        let desc = self.messages.peek_head()?;
        // SAFETY: the head slot stays owned by the message ring until it is
        // dequeued; under the single-consumer discipline nobody else
        // dequeues it while the caller holds the slice.
        Some(unsafe { slice::from_raw_parts(self.slot_ptr(&desc), desc.size as usize) })
    }

    /// Number of queued messages.
    pub fn len(&self) -> u32 {
        self.messages.count()
    }

    /// True if no messages are queued.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// True if the message ring is at capacity.
    pub fn is_full(&self) -> bool {
        self.messages.is_full()
    }

    /// Message capacity of the queue.
    pub fn capacity(&self) -> u32 {
        self.messages.capacity()
    }

    /// Free payload slots available to pushers.
    pub fn free_slots(&self) -> u32 {
        self.pool.free_count()
    }

    /// Payload capacity of one message slot, in bytes.
    pub fn slot_size(&self) -> u64 {
        self.geometry.slot_size
    }
}

/// Probe the backing file before mapping: reads the header area and decides
/// between formatting, attaching, and rejecting.
fn probe_segment(file: &File, geometry: &SegmentGeometry) -> io::Result<Probe> {
    let mut raw = [0u8; std::mem::size_of::<SegmentHeader>()];
    let n = file.read_at(&mut raw, 0)?;
    if n < raw.len() {
        // New or truncated file; a short header read means reformat.
        return Ok(Probe::Fresh);
    }

    // SAFETY: SegmentHeader is plain integers, valid for any bit pattern;
    // read_unaligned because the stack buffer is not 64-byte aligned.
    let header = unsafe { ptr::read_unaligned(raw.as_ptr() as *const SegmentHeader) };

    if header.magic != crate::layout::SEGMENT_MAGIC
        || header.version != crate::layout::SEGMENT_VERSION
    {
        return Ok(Probe::Fresh);
    }

    let file_len = file.metadata()?.len();
    if file_len != header.total_size {
        // The header does not describe this file; treat as unformatted.
        return Ok(Probe::Fresh);
    }

    if header.slot_size != geometry.slot_size
        || header.slot_count != geometry.slot_count
        || header.total_size != geometry.total_size as u64
    {
        return Ok(Probe::Mismatch {
            stored_slot_size: header.slot_size,
            stored_slot_count: header.slot_count,
        });
    }

    Ok(Probe::Attach)
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from opening a queue. All are fatal to that open call.
#[derive(Debug)]
pub enum OpenError {
    /// File open, size, map, or advise failure.
    Io(io::Error),
    /// Segment layout computation or header validation failure.
    Layout(LayoutError),
    /// An existing segment has a different geometry than requested.
    ConfigMismatch {
        requested_slot_size: u64,
        requested_slot_count: u64,
        stored_slot_size: u64,
        stored_slot_count: u64,
    },
    /// An existing segment records a different ring discipline.
    ModeMismatch {
        requested: QueueConfig,
        stored: QueueConfig,
    },
}

impl std::fmt::Display for OpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Layout(e) => write!(f, "layout error: {}", e),
            Self::ConfigMismatch {
                requested_slot_size,
                requested_slot_count,
                stored_slot_size,
                stored_slot_count,
            } => write!(
                f,
                "segment geometry mismatch: requested {} x {}, stored {} x {}",
                requested_slot_size, requested_slot_count, stored_slot_size, stored_slot_count
            ),
            Self::ModeMismatch { requested, stored } => write!(
                f,
                "ring discipline mismatch: requested {:?}, stored {:?}",
                requested, stored
            ),
        }
    }
}

impl std::error::Error for OpenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Layout(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors from pushing a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// The message ring is at capacity. Expected under load; retry later.
    Full,
    /// No free payload slot was available. Expected under load.
    AllocFailed,
    /// The descriptor could not be enqueued after a slot was allocated; the
    /// slot was returned to the pool.
    EnqueueFailed,
}

impl std::fmt::Display for PushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "queue is full"),
            Self::AllocFailed => write!(f, "slot pool exhausted"),
            Self::EnqueueFailed => write!(f, "descriptor enqueue failed after allocation"),
        }
    }
}

impl std::error::Error for PushError {}

/// Errors from popping a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    /// The queue is empty. Expected; retry later.
    Empty,
    /// The caller's buffer is smaller than the stored message. The queue is
    /// left unchanged.
    BufferTooSmall { needed: usize, capacity: usize },
    /// A dequeued slot could not be returned to the pool; the segment state
    /// is inconsistent.
    SlotFree,
}

impl std::fmt::Display for PopError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "queue is empty"),
            Self::BufferTooSmall { needed, capacity } => {
                write!(
                    f,
                    "buffer too small: message is {} bytes, buffer holds {}",
                    needed, capacity
                )
            }
            Self::SlotFree => write!(f, "slot free failed; segment state is inconsistent"),
        }
    }
}

impl std::error::Error for PopError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_path(tag: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "shmq_unit_{}_{}.shm",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn test_open_formats_and_reports_geometry() {
        let path = test_path("open");
        let queue = ShmQueue::open(&path, 1000, 32).unwrap();

        assert_eq!(queue.slot_size(), 1024);
        assert_eq!(queue.capacity(), 64);
        assert_eq!(queue.free_slots(), 64);
        assert!(queue.is_empty());
        assert_eq!(queue.path(), path.as_path());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_mode_mismatch_rejected() {
        let path = test_path("mode");
        let creator = ShmQueue::open_with(
            &path,
            1024,
            8,
            QueueConfig {
                single_producer: false,
                single_consumer: true,
            },
        )
        .unwrap();

        let err = ShmQueue::open(&path, 1024, 8).unwrap_err();
        assert!(matches!(err, OpenError::ModeMismatch { .. }));

        drop(creator);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_garbage_file_is_reformatted() {
        let path = test_path("garbage");
        std::fs::write(&path, b"not a queue segment").unwrap();

        let queue = ShmQueue::open(&path, 1024, 8).unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);

        std::fs::remove_file(&path).ok();
    }
}
