//! Lock-free primitives for shared memory IPC.
//!
//! This crate provides `no_std`-compatible, lock-free data structures designed
//! for use in shared memory contexts where you work with byte offsets into
//! memory-mapped regions.
//!
//! # Primitives
//!
//! - [`Ring`]: bulk enqueue/dequeue circular buffer of fixed-size descriptors,
//!   configurable for single- or multi-producer and single- or multi-consumer
//!   disciplines
//! - [`SlotPool`]: a [`Ring`] of [`SlotDesc`] entries used as a free list of
//!   fixed-size payload slots
//!
//! # Regions, not pointers
//!
//! Nothing in this crate stores a pointer in shared memory. Every structure is
//! addressed as a [`Region`] (base + length of a mapping) plus a byte offset,
//! so independently-mapped processes agree on all cross-process state.
//!
//! # Loom Testing
//!
//! Enable the `loom` feature for concurrency verification:
//!
//! ```text
//! cargo test -p shmq-primitives --features loom
//! ```

#![no_std]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod pool;
pub mod region;
pub mod ring;
pub mod sync;

#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::Region;
pub use ring::{Cursor, Ring, RingHeader};
pub use pool::{SlotDesc, SlotPool};

#[cfg(all(test, feature = "loom"))]
mod loom_tests;
