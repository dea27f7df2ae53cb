//! Ready queue set
//!
//! One FIFO bucket per priority class plus a bitmap of non-empty buckets, so
//! the most urgent bucket is found with a single bit scan. Buckets are
//! intrusive lists threaded through [`Thread::ready_link`](super::thread::Thread),
//! which makes enqueue and dequeue allocation-free.
//!
//! Every operation here requires the global scheduler lock.

use alloc::vec::Vec;

use log::Level;

use super::{
    config::READY_QUEUE_BUCKETS,
    debug::dump_threads,
    table::ThreadTable,
    thread::{ReadyLink, ThreadId, ThreadState},
};
use crate::arch::CpuId;

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    head: Option<ThreadId>,
    tail: Option<ThreadId>,
    len: usize,
}

/// Bitmap-indexed array of per-priority FIFO buckets
pub struct ReadyQueueSet {
    buckets: [Bucket; READY_QUEUE_BUCKETS],
    /// Bit N set iff bucket N is non-empty
    mask: u128,
}

impl Default for ReadyQueueSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyQueueSet {
    pub const fn new() -> Self {
        Self {
            buckets: [Bucket {
                head: None,
                tail: None,
                len: 0,
            }; READY_QUEUE_BUCKETS],
            mask: 0,
        }
    }

    pub fn mask(&self) -> u128 {
        self.mask
    }

    /// Number of queued threads
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }

    pub fn bucket_len(&self, bucket: usize) -> usize {
        self.buckets[bucket].len
    }

    /// Append `tid` to the tail of its priority bucket.
    ///
    /// Idle threads are never queued; enqueueing one does nothing.
    pub fn enqueue(&mut self, threads: &mut ThreadTable, tid: ThreadId) {
        let Some(thread) = threads.get_mut(tid) else {
            crate::sched_fatal!(
                dump = dump_threads(threads, Level::Error);
                "enqueue of unknown thread {}", tid
            );
        };
        if thread.is_idle() {
            return;
        }
        if thread.is_queued() {
            let queued_in = thread.runnable_priority;
            crate::sched_fatal!(
                dump = dump_threads(threads, Level::Error);
                "thread {} enqueued twice (already in bucket {})", tid, queued_in
            );
        }
        if thread.state != ThreadState::Runnable {
            let state = thread.state;
            crate::sched_fatal!(
                dump = dump_threads(threads, Level::Error);
                "enqueue of thread {} in state {}", tid, state
            );
        }

        let index = thread.bucket();
        let bucket = &mut self.buckets[index];
        thread.runnable_priority = index as i32;
        thread.ready_link = ReadyLink {
            prev: bucket.tail,
            next: None,
        };

        match bucket.tail {
            Some(tail) => link_mut(threads, tail).next = Some(tid),
            None => bucket.head = Some(tid),
        }
        bucket.tail = Some(tid);
        bucket.len += 1;
        self.mask |= 1u128 << index;

        self.debug_verify(threads);
    }

    /// Unlink `tid` from its bucket.
    ///
    /// With `affinity_cpu` set, a thread that may not run on that CPU is
    /// left in place. Returns whether the thread was removed; the idle thread
    /// always counts as removed.
    pub fn dequeue(
        &mut self,
        threads: &mut ThreadTable,
        tid: ThreadId,
        affinity_cpu: Option<CpuId>,
    ) -> bool {
        let Some(thread) = threads.get(tid) else {
            return false;
        };
        if thread.is_idle() {
            return true;
        }
        if !thread.is_queued() {
            return false;
        }
        if let Some(cpu) = affinity_cpu {
            if !thread.can_run_on(cpu) {
                return false;
            }
        }

        self.unlink(threads, tid);
        self.debug_verify(threads);
        true
    }

    /// Remove and return the most urgent thread eligible on `cpu`, or
    /// `idle` when nothing is. The returned thread is marked active.
    ///
    /// Buckets are scanned in priority order and each bucket in FIFO order,
    /// skipping threads active on another CPU and threads whose affinity
    /// excludes `cpu`.
    pub fn pull_next_runnable(
        &mut self,
        threads: &mut ThreadTable,
        cpu: CpuId,
        idle: ThreadId,
    ) -> ThreadId {
        let chosen = self.find_eligible(threads, cpu);
        if let Some(tid) = chosen {
            self.unlink(threads, tid);
            self.debug_verify(threads);
        }

        let tid = chosen.unwrap_or(idle);
        match threads.get_mut(tid) {
            Some(thread) => thread.active = true,
            None => crate::sched_fatal!(
                dump = dump_threads(threads, Level::Error);
                "CPU {} has no idle thread {}", cpu, tid
            ),
        }
        tid
    }

    /// Same scan as [`pull_next_runnable`](Self::pull_next_runnable), without
    /// removing or marking anything. Never returns an idle thread.
    pub fn peek_next_runnable(&self, threads: &ThreadTable, cpu: CpuId) -> Option<ThreadId> {
        self.find_eligible(threads, cpu)
    }

    fn find_eligible(&self, threads: &ThreadTable, cpu: CpuId) -> Option<ThreadId> {
        let mut mask = self.mask;
        while mask != 0 {
            let index = mask.trailing_zeros() as usize;
            mask &= mask - 1;

            let mut cursor = self.buckets[index].head;
            while let Some(tid) = cursor {
                let Some(thread) = threads.get(tid) else {
                    crate::sched_fatal!(
                        dump = dump_threads(threads, Level::Error);
                        "bucket {} links to missing thread {}", index, tid
                    );
                };
                if !thread.active && thread.can_run_on(cpu) {
                    return Some(tid);
                }
                cursor = thread.ready_link.next;
            }
        }
        None
    }

    fn unlink(&mut self, threads: &mut ThreadTable, tid: ThreadId) {
        let Some(thread) = threads.get_mut(tid) else {
            return;
        };
        let index = thread.runnable_priority as usize;
        let ReadyLink { prev, next } = thread.ready_link;
        thread.ready_link = ReadyLink::default();
        thread.runnable_priority = -1;

        let bucket = &mut self.buckets[index];
        match prev {
            Some(prev) => link_mut(threads, prev).next = next,
            None => bucket.head = next,
        }
        match next {
            Some(next) => link_mut(threads, next).prev = prev,
            None => bucket.tail = prev,
        }
        bucket.len -= 1;
        if bucket.len == 0 {
            self.mask &= !(1u128 << index);
        }
    }

    /// Ids queued in `bucket`, head first
    pub fn bucket_ids(&self, threads: &ThreadTable, bucket: usize) -> Vec<ThreadId> {
        let mut ids = Vec::with_capacity(self.buckets[bucket].len);
        let mut cursor = self.buckets[bucket].head;
        while let Some(tid) = cursor {
            ids.push(tid);
            cursor = threads.get(tid).and_then(|t| t.ready_link.next);
        }
        ids
    }

    /// Check the bucket and bitmap bookkeeping against the thread records.
    pub fn verify(&self, threads: &ThreadTable) -> Result<(), &'static str> {
        let mut linked = 0;
        for (index, bucket) in self.buckets.iter().enumerate() {
            if (self.mask & (1u128 << index) != 0) != (bucket.len != 0) {
                return Err("bitmap bit disagrees with bucket occupancy");
            }

            let mut count = 0;
            let mut prev = None;
            let mut cursor = bucket.head;
            while let Some(tid) = cursor {
                let thread = threads.get(tid).ok_or("bucket links to a missing thread")?;
                if thread.runnable_priority != index as i32 {
                    return Err("queued thread records a different bucket");
                }
                if thread.ready_link.prev != prev {
                    return Err("broken back link");
                }
                if thread.is_idle() {
                    return Err("idle thread linked into a bucket");
                }
                count += 1;
                if count > bucket.len {
                    return Err("bucket longer than its count");
                }
                prev = cursor;
                cursor = thread.ready_link.next;
            }
            if count != bucket.len || bucket.tail != prev {
                return Err("bucket count or tail mismatch");
            }
            linked += count;
        }

        let marked = threads.iter().filter(|t| t.is_queued()).count();
        if marked != linked {
            return Err("thread marked queued but not linked");
        }
        Ok(())
    }

    #[cfg(feature = "sched-debug")]
    fn debug_verify(&self, threads: &ThreadTable) {
        if let Err(reason) = self.verify(threads) {
            crate::sched_fatal!(
                dump = dump_threads(threads, Level::Error);
                "ready queue corrupted: {}", reason
            );
        }
    }

    #[cfg(not(feature = "sched-debug"))]
    #[inline(always)]
    fn debug_verify(&self, _threads: &ThreadTable) {}
}

fn link_mut(threads: &mut ThreadTable, tid: ThreadId) -> &mut ReadyLink {
    match threads.get_mut(tid) {
        Some(thread) => &mut thread.ready_link,
        None => crate::sched_fatal!("ready queue links to missing thread {}", tid),
    }
}
