// SPDX-License-Identifier: Apache-2.0

//! Spinlock-guarded intrusive queue: a [`Link`] header plus the
//! [`Spinlock`] that serializes every enqueue/dequeue against it (§5
//! "Shared-resource policy": "each message queue has its own spinlock;
//! enqueue and dequeue hold it. Critical sections contain no syscalls.").

use crate::list::Link;
use crate::slot::MsgSlot;
use crate::spinlock::Spinlock;

#[repr(C)]
pub struct Queue {
    lock: Spinlock,
    header: Link,
}

impl Queue {
    pub const fn new() -> Self {
        Self {
            lock: Spinlock::new(),
            header: Link::new(),
        }
    }

    /// # Safety
    /// `queue` must point at a valid, owned `Queue`.
    pub unsafe fn init(queue: *mut Queue) {
        Link::init(&mut (*queue).header);
    }

    /// # Safety
    /// `queue` and `slot` must be valid; `slot` must not already be linked
    /// into any queue.
    pub unsafe fn enqueue(queue: *mut Queue, slot: *mut MsgSlot) {
        let _guard = (*queue).lock.lock();
        Link::push_back(&mut (*queue).header, &mut (*slot).link);
    }

    /// # Safety
    /// `queue` must be valid.
    pub unsafe fn dequeue(queue: *mut Queue) -> Option<*mut MsgSlot> {
        let _guard = (*queue).lock.lock();
        Link::pop_front(&mut (*queue).header).map(|link| link as *mut MsgSlot)
    }

    /// Dequeues the first slot whose source rank equals `source` (§4.3
    /// "Dequeue from the local receive-queue the first slot whose source
    /// equals the requested source").
    ///
    /// # Safety
    /// `queue` must be valid.
    pub unsafe fn dequeue_from(queue: *mut Queue, source: u32) -> Option<*mut MsgSlot> {
        let _guard = (*queue).lock.lock();
        Link::pop_matching(&mut (*queue).header, |link| {
            (*(link as *mut MsgSlot)).source_rank == source
        })
        .map(|link| link as *mut MsgSlot)
    }

    /// # Safety
    /// `queue` must be valid.
    pub unsafe fn is_empty(queue: *const Queue) -> bool {
        Link::is_empty(&(*queue).header)
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::MsgSlotType;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    unsafe fn alloc_slot() -> *mut MsgSlot {
        let ptr = alloc_zeroed(Layout::new::<MsgSlot>()) as *mut MsgSlot;
        MsgSlot::init(ptr);
        ptr
    }

    unsafe fn free_slot(ptr: *mut MsgSlot) {
        dealloc(ptr as *mut u8, Layout::new::<MsgSlot>());
    }

    #[test]
    fn enqueue_dequeue_preserves_fifo_order() {
        unsafe {
            let mut queue = Queue::new();
            let a = alloc_slot();
            let b = alloc_slot();
            (*a).fill_inline(MsgSlotType::Data, 1, b"a");
            (*b).fill_inline(MsgSlotType::Data, 2, b"b");

            Queue::enqueue(&mut queue, a);
            Queue::enqueue(&mut queue, b);

            let first = Queue::dequeue(&mut queue).unwrap();
            assert_eq!((*first).source_rank, 1);
            let second = Queue::dequeue(&mut queue).unwrap();
            assert_eq!((*second).source_rank, 2);
            assert!(Queue::dequeue(&mut queue).is_none());

            free_slot(a);
            free_slot(b);
        }
    }

    #[test]
    fn dequeue_from_filters_by_source_rank() {
        unsafe {
            let mut queue = Queue::new();
            let a = alloc_slot();
            let b = alloc_slot();
            let c = alloc_slot();
            (*a).fill_inline(MsgSlotType::Data, 1, b"a");
            (*b).fill_inline(MsgSlotType::Data, 2, b"b");
            (*c).fill_inline(MsgSlotType::Data, 1, b"c");
            Queue::enqueue(&mut queue, a);
            Queue::enqueue(&mut queue, b);
            Queue::enqueue(&mut queue, c);

            let hit = Queue::dequeue_from(&mut queue, 2).unwrap();
            assert_eq!((*hit).source_rank, 2);

            let first = Queue::dequeue(&mut queue).unwrap();
            assert_eq!((*first).source_rank, 1);
            let second = Queue::dequeue(&mut queue).unwrap();
            assert_eq!((*second).source_rank, 1);

            free_slot(a);
            free_slot(b);
            free_slot(c);
        }
    }
}
