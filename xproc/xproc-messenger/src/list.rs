// SPDX-License-Identifier: Apache-2.0

//! Intrusive, self-relative doubly linked list (§3 "Message queue", §9
//! "Intrusive shared-memory lists").
//!
//! A real pointer is meaningless once written into shared memory, since
//! each participant maps the segment at a virtual address of the kernel's
//! choosing. Every link is instead stored as a signed byte offset from the
//! *link's own address* to its neighbor's; a traversal reconstructs the
//! neighbor as `self_addr + offset`. An empty circular list is represented
//! by a header whose `next`/`prev` both point back at itself (offset 0).

use std::sync::atomic::{AtomicI64, Ordering};

/// Embedded in both the queue header and every list node (§3). Using the
/// same layout for header and node lets the header act as its own
/// terminator in the circular list, avoiding a separate "is this the head"
/// check during traversal.
#[repr(C)]
pub struct Link {
    next: AtomicI64,
    prev: AtomicI64,
}

impl Link {
    pub const fn new() -> Self {
        Self {
            next: AtomicI64::new(0),
            prev: AtomicI64::new(0),
        }
    }

    /// # Safety
    /// `link` must point at a valid, owned `Link`.
    pub unsafe fn init(link: *mut Link) {
        (*link).next.store(0, Ordering::Relaxed);
        (*link).prev.store(0, Ordering::Relaxed);
    }

    /// # Safety
    /// `link` must point at a valid `Link` whose `next`/`prev` were
    /// initialized by [`Link::init`] or produced by this module's own
    /// mutators.
    pub unsafe fn is_empty(link: *const Link) -> bool {
        (*link).next.load(Ordering::Acquire) == 0
    }

    // Plain address arithmetic rather than `pointer::offset`/`offset_from`:
    // nodes generally live in one shared mapping, but nothing here requires
    // it, and address subtraction imposes no same-allocation requirement.
    fn resolve(from: *const Link, offset: i64) -> *mut Link {
        ((from as i64).wrapping_add(offset)) as *mut Link
    }

    fn offset_to(from: *const Link, to: *const Link) -> i64 {
        (to as i64).wrapping_sub(from as i64)
    }

    /// # Safety
    /// `header` and `node` must both be valid, non-aliasing `Link`s; `node`
    /// must not already be linked into any list.
    pub unsafe fn push_back(header: *mut Link, node: *mut Link) {
        let last_offset = (*header).prev.load(Ordering::Acquire);
        let last = if last_offset == 0 {
            header
        } else {
            Self::resolve(header, last_offset)
        };

        (*node).next.store(Self::offset_to(node, header), Ordering::Relaxed);
        (*node).prev.store(Self::offset_to(node, last), Ordering::Relaxed);
        (*last).next.store(Self::offset_to(last, node), Ordering::Release);
        (*header).prev.store(Self::offset_to(header, node), Ordering::Release);
    }

    /// Removes and returns the first node, or `None` if the list is empty.
    ///
    /// # Safety
    /// `header` must be a valid `Link` whose list contains only nodes
    /// reachable through this module's offset convention.
    pub unsafe fn pop_front(header: *mut Link) -> Option<*mut Link> {
        if Self::is_empty(header) {
            return None;
        }
        let first_offset = (*header).next.load(Ordering::Acquire);
        let first = Self::resolve(header, first_offset);
        Self::unlink(header, first);
        Some(first)
    }

    /// Removes the first node whose tag (read via `matches`) satisfies the
    /// predicate, without disturbing the order of the others (§4.3 "Dequeue
    /// from the local receive-queue the first slot whose source equals the
    /// requested source").
    ///
    /// # Safety
    /// Same contract as [`Link::pop_front`]; `matches` must not mutate the
    /// list.
    pub unsafe fn pop_matching(
        header: *mut Link,
        mut matches: impl FnMut(*mut Link) -> bool,
    ) -> Option<*mut Link> {
        let first_offset = (*header).next.load(Ordering::Acquire);
        if first_offset == 0 {
            return None;
        }
        // The offset stored in `header` itself is header-relative, but every
        // other node's `next` is relative to *that node*; once off the
        // header we resolve each step from the current node, not `header`.
        let mut cursor = Self::resolve(header, first_offset);
        while cursor != header {
            if matches(cursor) {
                Self::unlink(header, cursor);
                return Some(cursor);
            }
            let next_offset = (*cursor).next.load(Ordering::Acquire);
            cursor = Self::resolve(cursor, next_offset);
        }
        None
    }

    unsafe fn unlink(header: *mut Link, node: *mut Link) {
        let next_offset = (*node).next.load(Ordering::Acquire);
        let prev_offset = (*node).prev.load(Ordering::Acquire);
        let next = Self::resolve(node, next_offset);
        let prev = Self::resolve(node, prev_offset);

        (*prev).next.store(Self::offset_to(prev, next), Ordering::Release);
        (*next).prev.store(Self::offset_to(next, prev), Ordering::Release);

        let _ = header;
        (*node).next.store(0, Ordering::Relaxed);
        (*node).prev.store(0, Ordering::Relaxed);
    }
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    #[repr(C)]
    struct Node {
        link: Link,
        tag: u32,
    }

    unsafe fn alloc_node(tag: u32) -> *mut Node {
        let layout = Layout::new::<Node>();
        let ptr = alloc_zeroed(layout) as *mut Node;
        Link::init(&mut (*ptr).link);
        (*ptr).tag = tag;
        ptr
    }

    unsafe fn free_node(ptr: *mut Node) {
        dealloc(ptr as *mut u8, Layout::new::<Node>());
    }

    #[test]
    fn push_and_pop_front_preserves_fifo_order() {
        unsafe {
            let mut header = Link::new();
            let a = alloc_node(1);
            let b = alloc_node(2);
            let c = alloc_node(3);

            Link::push_back(&mut header, &mut (*a).link);
            Link::push_back(&mut header, &mut (*b).link);
            Link::push_back(&mut header, &mut (*c).link);

            let first = Link::pop_front(&mut header).unwrap() as *mut Node;
            assert_eq!((*first).tag, 1);
            let second = Link::pop_front(&mut header).unwrap() as *mut Node;
            assert_eq!((*second).tag, 2);
            let third = Link::pop_front(&mut header).unwrap() as *mut Node;
            assert_eq!((*third).tag, 3);
            assert!(Link::pop_front(&mut header).is_none());

            free_node(a);
            free_node(b);
            free_node(c);
        }
    }

    #[test]
    fn pop_matching_finds_by_predicate_and_preserves_remaining_order() {
        unsafe {
            let mut header = Link::new();
            let a = alloc_node(10);
            let b = alloc_node(20);
            let c = alloc_node(30);
            Link::push_back(&mut header, &mut (*a).link);
            Link::push_back(&mut header, &mut (*b).link);
            Link::push_back(&mut header, &mut (*c).link);

            let hit = Link::pop_matching(&mut header, |l| (*(l as *mut Node)).tag == 20).unwrap() as *mut Node;
            assert_eq!((*hit).tag, 20);

            let first = Link::pop_front(&mut header).unwrap() as *mut Node;
            assert_eq!((*first).tag, 10);
            let second = Link::pop_front(&mut header).unwrap() as *mut Node;
            assert_eq!((*second).tag, 30);

            free_node(a);
            free_node(b);
            free_node(c);
        }
    }
}
