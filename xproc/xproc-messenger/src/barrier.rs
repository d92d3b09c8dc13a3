// SPDX-License-Identifier: Apache-2.0

//! Two-phase, polarity-flipping barrier (§4.3 "Barrier").
//!
//! Each rank owns a single barrier byte in its [`PerRankRecord`]. A local
//! "flip" value alternates 0/1 across calls — every rank calls `wait` the
//! same number of times, so no shared flip storage is needed. Non-zero
//! ranks write the flip into their own box then spin on rank 0's box;
//! rank 0 spins over every other box then writes its own, fanning in then
//! fanning out in O(n) space with no locks.

use crate::segment::SharedSegment;
use std::sync::atomic::Ordering;

const SPIN_YIELD_AFTER: u32 = 256;

pub struct Barrier {
    flip: u8,
}

impl Barrier {
    /// Starts at 1, not 0: `PerRankRecord::init` zero-initializes every
    /// barrier box, so a first flip of 0 would already match every box and
    /// let every rank sail through the very first `wait` without actually
    /// synchronizing.
    pub fn new() -> Self {
        Self { flip: 1 }
    }

    pub fn wait(&mut self, segment: &SharedSegment, rank: usize) {
        let flip = self.flip;
        if rank == 0 {
            for other in 1..segment.nprocs() {
                let record = unsafe { segment.rank(other) };
                spin_until(|| record.barrier.load(Ordering::Acquire) == flip);
            }
            let mine = unsafe { segment.rank(0) };
            mine.barrier.store(flip, Ordering::Release);
        } else {
            let mine = unsafe { segment.rank(rank) };
            mine.barrier.store(flip, Ordering::Release);
            let root = unsafe { segment.rank(0) };
            spin_until(|| root.barrier.load(Ordering::Acquire) == flip);
        }
        self.flip ^= 1;
    }
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}

fn spin_until(mut condition: impl FnMut() -> bool) {
    let mut spins = 0u32;
    while !condition() {
        spins += 1;
        if spins % SPIN_YIELD_AFTER == 0 {
            std::thread::yield_now();
        } else {
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn idempotent_polarity_after_a_pair_of_barriers() {
        let segment = Arc::new(SharedSegment::create(3).unwrap());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for rank in 0..3 {
            let segment = Arc::clone(&segment);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                let mut barrier = Barrier::new();
                barrier.wait(&segment, rank);
                counter.fetch_add(1, Ordering::SeqCst);
                barrier.wait(&segment, rank);
                assert_eq!(counter.load(Ordering::SeqCst), 3);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for rank in 0..3 {
            let record = unsafe { segment.rank(rank) };
            assert_eq!(record.barrier.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn no_rank_observes_completion_before_all_have_entered() {
        let segment = Arc::new(SharedSegment::create(4).unwrap());
        let entered = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for rank in 0..4 {
            let segment = Arc::clone(&segment);
            let entered = Arc::clone(&entered);
            handles.push(std::thread::spawn(move || {
                let mut barrier = Barrier::new();
                for _ in 0..10 {
                    entered.fetch_add(1, Ordering::SeqCst);
                    barrier.wait(&segment, rank);
                    assert_eq!(entered.load(Ordering::SeqCst) % 4, 0);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
