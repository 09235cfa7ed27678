#![cfg(all(test, feature = "loom"))]

use crate::pool::SlotPool;
use crate::region::HeapRegion;
use crate::ring::Ring;
use crate::sync::thread;
use alloc::vec::Vec;
use loom::sync::Arc;

#[test]
fn spsc_ring_transfer() {
    loom::model(|| {
        let owner = Arc::new(HeapRegion::new_zeroed(8192));
        let ring: Arc<Ring<u64>> =
            Arc::new(unsafe { Ring::init(owner.region(), 0, 4, true, true) });

        let producer_ring = ring.clone();
        let producer_owner = owner.clone();
        let producer = thread::spawn(move || {
            let _keep = producer_owner;
            for i in 0..3u64 {
                while !producer_ring.enqueue(i) {
                    thread::yield_now();
                }
            }
        });

        let consumer_ring = ring.clone();
        let consumer_owner = owner.clone();
        let consumer = thread::spawn(move || {
            let _keep = consumer_owner;
            let mut received = Vec::new();
            while received.len() < 3 {
                if let Some(v) = consumer_ring.dequeue() {
                    received.push(v);
                } else {
                    thread::yield_now();
                }
            }
            received
        });

        producer.join().unwrap();
        let received = consumer.join().unwrap();
        assert_eq!(received, alloc::vec![0, 1, 2]);
    });
}

#[test]
fn mpmc_ring_no_duplication() {
    loom::model(|| {
        let owner = Arc::new(HeapRegion::new_zeroed(8192));
        let ring: Arc<Ring<u64>> =
            Arc::new(unsafe { Ring::init(owner.region(), 0, 2, false, false) });

        let mut producers = Vec::new();
        for p in 0..2u64 {
            let ring = ring.clone();
            let keep = owner.clone();
            producers.push(thread::spawn(move || {
                let _keep = keep;
                while !ring.enqueue(p) {
                    thread::yield_now();
                }
            }));
        }
        for p in producers {
            p.join().unwrap();
        }

        let mut seen = Vec::new();
        while let Some(v) = ring.dequeue() {
            seen.push(v);
        }
        seen.sort_unstable();
        assert_eq!(seen, alloc::vec![0, 1]);
    });
}

#[test]
fn pool_no_double_alloc() {
    loom::model(|| {
        let owner = Arc::new(HeapRegion::new_zeroed(8192));
        let pool = Arc::new(
            unsafe { SlotPool::init(owner.region(), 0, 2, 64, false, false) }.unwrap(),
        );

        let t1_pool = pool.clone();
        let t1_owner = owner.clone();
        let t1 = thread::spawn(move || {
            let _keep = t1_owner;
            t1_pool.alloc()
        });

        let t2_pool = pool.clone();
        let t2_owner = owner.clone();
        let t2 = thread::spawn(move || {
            let _keep = t2_owner;
            t2_pool.alloc()
        });

        let a = t1.join().unwrap();
        let b = t2.join().unwrap();
        if let (Some(a), Some(b)) = (a, b) {
            assert_ne!(a.offset, b.offset, "one slot handed to two owners");
        }
    });
}
