//! Fixed-capacity shared-memory FIFO message queue.
//!
//! One or more writers deposit variable-length (size-capped) messages into a
//! memory region backed by a file; one or more readers consume them in FIFO
//! order, with no kernel syscalls on the hot path. Independent processes
//! attach to the same region by path and agree on its geometry through a
//! validated header.
//!
//! ```no_run
//! use shmq::ShmQueue;
//!
//! let queue = ShmQueue::open("/tmp/q", 1024, 32)?;
//! queue.push(b"hello")?;
//!
//! let mut buf = [0u8; 1024];
//! let n = queue.pop_into(&mut buf)?;
//! assert_eq!(&buf[..n], b"hello");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! The lock-free ring and slot-pool primitives live in
//! [`shmq_primitives`]; this crate owns the backing file, the segment
//! layout, and the push/pop surface.

pub mod layout;
pub mod queue;

pub use queue::{OpenError, PopError, PushError, QueueConfig, ShmQueue};
