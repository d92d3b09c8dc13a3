// SPDX-License-Identifier: Apache-2.0

//! Public send/recv/barrier surface (§4.3 "Send path", "Receive path",
//! "Barrier").

use crate::barrier::Barrier;
use crate::error::{MessengerError, Result};
use crate::queue::Queue;
use crate::region_cache::RegionCache;
use crate::segment::SharedSegment;
use crate::slot::{MsgSlot, MsgSlotType, RvPayload, PAYLOAD_SIZE_BYTES};
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use tracing::{debug, trace, warn};
use xproc_broker::Client;
use xproc_core::DescriptorKey;
use xproc_platform::Driller;

/// A descriptor publishing record: the key a region was published under and
/// which ranks are known to hold a rendezvous reference into it (§4.3 —
/// "allocate a descriptor-publishing record (key + per-rank reference
/// vector of length nprocs)").
struct PublishRecord {
    key: DescriptorKey,
    ref_vector: Vec<bool>,
}

pub struct Messenger {
    broker: Mutex<Client>,
    driller: &'static Driller,
    segment: SharedSegment,
    region_cache: Mutex<RegionCache>,
    publish_records: Mutex<Vec<PublishRecord>>,
    barrier: Mutex<Barrier>,
    rank: u32,
    nprocs: u32,
}

impl Messenger {
    pub fn new(broker: Client, driller: &'static Driller, segment: SharedSegment, rank: u32, nprocs: u32) -> Self {
        Self {
            broker: Mutex::new(broker),
            driller,
            segment,
            region_cache: Mutex::new(RegionCache::new()),
            publish_records: Mutex::new(Vec::new()),
            barrier: Mutex::new(Barrier::new()),
            rank,
            nprocs,
        }
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn nprocs(&self) -> u32 {
        self.nprocs
    }

    /// Invalidation callback body, registered with the driller at job init
    /// (§4.3 "Invalidation callback"): broker-invalidate the key, then
    /// RV-INVALIDATE every rank the reference vector marks as a user, then
    /// release the publishing record.
    pub fn on_region_invalidated(&self, region: &xproc_core::Region) {
        let Some(cookie) = region.cookie() else { return };
        let record = {
            let mut records = self.publish_records.lock().unwrap();
            let idx = cookie as usize;
            if idx >= records.len() {
                return;
            }
            std::mem::replace(
                &mut records[idx],
                PublishRecord {
                    key: DescriptorKey::UNSET,
                    ref_vector: Vec::new(),
                },
            )
        };
        if record.ref_vector.is_empty() {
            return;
        }
        let _ = self.broker.lock().unwrap().invalidate(record.key);
        for (dest, used) in record.ref_vector.iter().enumerate() {
            if *used {
                if let Err(e) = self.send_control_invalidate(dest as u32, record.key) {
                    warn!(dest, error = %e, "failed to deliver RV-INVALIDATE");
                }
            }
        }
    }

    fn send_control_invalidate(&self, dest: u32, key: DescriptorKey) -> Result<()> {
        let slot = self.take_free_slot()?;
        unsafe {
            (*slot).fill_rv_invalidate(self.rank, key);
        }
        self.enqueue_to(dest, slot);
        Ok(())
    }

    pub fn barrier(&self) {
        let mut barrier = self.barrier.lock().unwrap();
        barrier.wait(&self.segment, self.rank as usize);
    }

    /// Sends `buf` to `dest`, choosing fragmentation or rendezvous per the
    /// configured size threshold and whether `buf` lies entirely inside one
    /// known region.
    pub fn send(&self, dest: u32, buf: &[u8]) -> Result<()> {
        let threshold = self.driller.tunables().msg_driller_size_threshold;
        let prefer_rendezvous = threshold == 0 || buf.len() > threshold;
        if prefer_rendezvous {
            if let Some(region) = self.driller.lookup_map(buf.as_ptr() as usize, buf.len()) {
                if region.contains_range(buf.as_ptr() as usize, buf.as_ptr() as usize + buf.len()) {
                    return self.send_rendezvous(dest, buf, region);
                }
            }
        }
        self.send_fragmented(dest, buf)
    }

    fn send_fragmented(&self, dest: u32, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            let slot = self.take_free_slot()?;
            unsafe {
                (*slot).fill_inline(MsgSlotType::Data, self.rank, &[]);
            }
            self.enqueue_to(dest, slot);
            return Ok(());
        }
        let mut offset = 0usize;
        while offset < buf.len() {
            let end = (offset + PAYLOAD_SIZE_BYTES).min(buf.len());
            let is_last = end == buf.len();
            let slot = self.take_free_slot()?;
            unsafe {
                (*slot).fill_inline(
                    if is_last { MsgSlotType::Data } else { MsgSlotType::Frag },
                    self.rank,
                    &buf[offset..end],
                );
            }
            self.enqueue_to(dest, slot);
            offset = end;
        }
        trace!(dest, len = buf.len(), "fragmented send complete");
        Ok(())
    }

    fn send_rendezvous(&self, dest: u32, buf: &[u8], region: xproc_core::Region) -> Result<()> {
        let cookie = match region.cookie() {
            Some(c) => c,
            None => self.publish_region(&region)?,
        };

        let key = {
            let mut records = self.publish_records.lock().unwrap();
            let record = &mut records[cookie as usize];
            record.ref_vector[dest as usize] = true;
            record.key
        };

        let buf_offset = buf.as_ptr() as usize - region.start();
        let rv = RvPayload {
            key,
            region_offset: region.offset(),
            region_len: region.len() as u64,
            buf_offset: buf_offset as u64,
            len: buf.len() as u64,
        };

        let slot = self.take_free_slot()?;
        unsafe {
            (*slot).fill_rv(self.rank, rv);
        }
        unsafe { self.rank_record(self.rank) }.rv_active.store(1, Ordering::Release);
        self.enqueue_to(dest, slot);

        spin_until(|| unsafe { self.rank_record(self.rank) }.rv_active.load(Ordering::Acquire) == 0);
        debug!(dest, len = buf.len(), key = %key, "rendezvous send complete");
        Ok(())
    }

    /// Publishes `region`'s descriptor under a fresh key, stamps the
    /// region's cookie with the new publish record's index, and returns
    /// that index.
    fn publish_region(&self, region: &xproc_core::Region) -> Result<u64> {
        let mut key = DescriptorKey::UNSET;
        let fd = region.fd().ok_or(MessengerError::MalformedSlot {
            reason: "region has no backing descriptor to publish",
        })?;
        self.broker.lock().unwrap().publish(&mut key, fd, std::process::id() as i32)?;

        let mut records = self.publish_records.lock().unwrap();
        let idx = records.len() as u64;
        records.push(PublishRecord {
            key,
            ref_vector: vec![false; self.nprocs as usize],
        });
        drop(records);
        if !self.driller.set_region_cookie(region.id(), idx) {
            return Err(MessengerError::MalformedSlot {
                reason: "region invalidated while publishing its descriptor",
            });
        }
        Ok(idx)
    }

    /// Receives the next message from `src`, writing its payload into `buf`
    /// and returning the number of bytes written.
    pub fn recv(&self, src: u32, buf: &mut [u8]) -> Result<usize> {
        let mut written = 0usize;
        loop {
            let slot = self.take_from(src)?;
            let ty = unsafe { (*slot).slot_type() };
            match ty {
                Some(MsgSlotType::Data) | Some(MsgSlotType::Frag) => {
                    let n = unsafe { (*slot).copy_inline_to(&mut buf[written..]) };
                    written += n;
                    let done = ty == Some(MsgSlotType::Data);
                    self.release_to_home(slot);
                    if done {
                        return Ok(written);
                    }
                }
                Some(MsgSlotType::Rv) => {
                    let rv = unsafe { (*slot).read_rv() }.ok_or(MessengerError::MalformedSlot {
                        reason: "RV slot failed to decode",
                    })?;
                    let source_rank = unsafe { (*slot).source_rank };
                    let fd = self
                        .broker
                        .lock()
                        .unwrap()
                        .lookup(rv.key)?
                        .ok_or(MessengerError::MalformedSlot {
                            reason: "rendezvous key not found at broker",
                        })?;
                    let ptr = self.region_cache.lock().unwrap().resolve(
                        self.driller,
                        rv.key,
                        fd,
                        rv.region_offset,
                        rv.region_len,
                        rv.buf_offset,
                        rv.len,
                    )?;
                    let n = rv.len as usize;
                    unsafe {
                        std::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), n);
                    }
                    unsafe { self.rank_record(source_rank) }.rv_active.store(0, Ordering::Release);
                    self.release_to_home(slot);
                    return Ok(n);
                }
                Some(MsgSlotType::RvInvalidate) => {
                    let key = unsafe { (*slot).read_invalidate_key() }.ok_or(MessengerError::MalformedSlot {
                        reason: "RV-INVALIDATE slot failed to decode",
                    })?;
                    self.region_cache.lock().unwrap().invalidate(self.driller, key);
                    self.release_to_home(slot);
                    continue;
                }
                Some(MsgSlotType::Free) | None => {
                    return Err(MessengerError::MalformedSlot {
                        reason: "dequeued a FREE or unrecognized slot from a receive-queue",
                    });
                }
            }
        }
    }

    /// # Safety
    /// The returned reference must not outlive `self`.
    unsafe fn rank_record(&self, rank: u32) -> &crate::segment::PerRankRecord {
        &*self.segment.rank_ptr(rank as usize)
    }

    fn take_free_slot(&self) -> Result<*mut MsgSlot> {
        let queue = unsafe { &mut (*self.segment.rank_ptr(self.rank as usize)).free_queue as *mut Queue };
        unsafe { Queue::dequeue(queue) }.ok_or(MessengerError::PoolExhausted { rank: self.rank })
    }

    fn take_from(&self, src: u32) -> Result<*mut MsgSlot> {
        let queue = unsafe { &mut (*self.segment.rank_ptr(self.rank as usize)).recv_queue as *mut Queue };
        loop {
            if let Some(slot) = unsafe { Queue::dequeue_from(queue, src) } {
                return Ok(slot);
            }
            std::hint::spin_loop();
        }
    }

    fn enqueue_to(&self, dest: u32, slot: *mut MsgSlot) {
        let queue = unsafe { &mut (*self.segment.rank_ptr(dest as usize)).recv_queue as *mut Queue };
        unsafe {
            Queue::enqueue(queue, slot);
        }
    }

    fn release_to_home(&self, slot: *mut MsgSlot) {
        let home = unsafe { (*slot).source_rank };
        unsafe {
            (*slot).set_slot_type(MsgSlotType::Free);
        }
        let queue = unsafe { &mut (*self.segment.rank_ptr(home as usize)).free_queue as *mut Queue };
        unsafe {
            Queue::enqueue(queue, slot);
        }
    }
}

fn spin_until(mut condition: impl FnMut() -> bool) {
    let mut spins = 0u32;
    while !condition() {
        spins += 1;
        if spins % 256 == 0 {
            std::thread::yield_now();
        } else {
            std::hint::spin_loop();
        }
    }
}
