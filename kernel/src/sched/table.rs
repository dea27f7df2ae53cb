//! Thread arena
//!
//! Thread records are stored by slot index and addressed through
//! generational [`ThreadId`]s. Ready-queue linkage refers to other records by
//! id, so enqueueing never allocates.

use alloc::vec::Vec;

use super::thread::{Thread, ThreadId, ThreadSpec};
use crate::error::{KernelError, KernelResult};

struct Slot {
    generation: u32,
    thread: Option<Thread>,
}

/// Bounded arena of thread records
pub struct ThreadTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
    max_threads: usize,
}

impl ThreadTable {
    pub fn new(max_threads: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            max_threads,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity_limit(&self) -> usize {
        self.max_threads
    }

    /// Store a new thread record built from `spec`
    pub fn insert(&mut self, spec: ThreadSpec) -> KernelResult<ThreadId> {
        if self.len >= self.max_threads {
            return Err(KernelError::ResourceExhausted {
                resource: "thread table",
            });
        }

        let tid = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                let tid = ThreadId::new(index, slot.generation);
                slot.thread = Some(Thread::new(tid, spec));
                tid
            }
            None => {
                self.slots.try_reserve(1)?;
                // The free list must be able to take every slot back
                // without allocating during reclamation.
                self.free.try_reserve(self.slots.len() + 1 - self.free.len())?;
                let tid = ThreadId::new(self.slots.len() as u32, 0);
                self.slots.push(Slot {
                    generation: 0,
                    thread: Some(Thread::new(tid, spec)),
                });
                tid
            }
        };

        self.len += 1;
        Ok(tid)
    }

    pub fn get(&self, tid: ThreadId) -> Option<&Thread> {
        self.slots
            .get(tid.index())
            .filter(|slot| slot.generation == tid.generation())
            .and_then(|slot| slot.thread.as_ref())
    }

    pub fn get_mut(&mut self, tid: ThreadId) -> Option<&mut Thread> {
        self.slots
            .get_mut(tid.index())
            .filter(|slot| slot.generation == tid.generation())
            .and_then(|slot| slot.thread.as_mut())
    }

    pub fn contains(&self, tid: ThreadId) -> bool {
        self.get(tid).is_some()
    }

    /// Take a record out of the arena. The slot is reused under a new
    /// generation, so `tid` stops resolving.
    pub fn remove(&mut self, tid: ThreadId) -> Option<Thread> {
        let slot = self.slots.get_mut(tid.index())?;
        if slot.generation != tid.generation() {
            return None;
        }
        let thread = slot.thread.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(tid.index() as u32);
        self.len -= 1;
        Some(thread)
    }

    /// Live records in slot order
    pub fn iter(&self) -> impl Iterator<Item = &Thread> {
        self.slots.iter().filter_map(|slot| slot.thread.as_ref())
    }

    pub fn ids(&self) -> Vec<ThreadId> {
        self.iter().map(Thread::tid).collect()
    }
}
