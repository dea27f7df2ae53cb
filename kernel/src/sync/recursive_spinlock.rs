//! Recursive spinlock owned by a CPU
//!
//! The owner is a CPU index, not a thread: the scheduler takes the lock on
//! one thread's stack and drops it on another's, after a context switch.
//! A CPU may re-acquire the lock it already holds; every acquisition must be
//! matched by one [`RecursiveSpinlock::unlock`] from the same CPU.
//!
//! Only shared references to the protected value are handed out, so the
//! value normally wraps its mutable state in a `RefCell`. Re-entrant
//! acquisition then cannot produce two live `&mut` to the same data.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::arch::CpuId;

const NO_OWNER: usize = usize::MAX;

pub struct RecursiveSpinlock<T> {
    owner: AtomicUsize,
    depth: AtomicU32,
    data: T,
}

// SAFETY: the protected value is only reachable through `get`, which checks
// that the calling CPU owns the lock, so at most one CPU observes `T` at a
// time. Moving that access between CPUs requires `T: Send`.
unsafe impl<T: Send> Sync for RecursiveSpinlock<T> {}

impl<T> RecursiveSpinlock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            owner: AtomicUsize::new(NO_OWNER),
            depth: AtomicU32::new(0),
            data,
        }
    }

    /// Acquire on behalf of `cpu`, spinning while another CPU holds the lock.
    ///
    /// Returns the nesting depth after the acquisition.
    pub fn lock(&self, cpu: CpuId) -> u32 {
        if self.owner.load(Ordering::Acquire) == cpu {
            return self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        }

        while self
            .owner
            .compare_exchange_weak(NO_OWNER, cpu, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.owner.load(Ordering::Relaxed) != NO_OWNER {
                core::hint::spin_loop();
            }
        }
        self.depth.store(1, Ordering::Relaxed);
        1
    }

    /// Acquire without spinning. `None` if another CPU holds the lock.
    pub fn try_lock(&self, cpu: CpuId) -> Option<u32> {
        if self.owner.load(Ordering::Acquire) == cpu {
            return Some(self.depth.fetch_add(1, Ordering::Relaxed) + 1);
        }
        self.owner
            .compare_exchange(NO_OWNER, cpu, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| {
                self.depth.store(1, Ordering::Relaxed);
                1
            })
    }

    /// Drop one level of ownership held by `cpu`.
    ///
    /// Returns the remaining depth; the lock is free once it reaches zero.
    ///
    /// # Panics
    ///
    /// If `cpu` does not own the lock.
    pub fn unlock(&self, cpu: CpuId) -> u32 {
        let owner = self.owner.load(Ordering::Relaxed);
        assert!(
            owner == cpu,
            "recursive spinlock released by CPU {} but owned by {}",
            cpu,
            OwnerName(owner)
        );

        let remaining = self.depth.fetch_sub(1, Ordering::Relaxed) - 1;
        if remaining == 0 {
            self.owner.store(NO_OWNER, Ordering::Release);
        }
        remaining
    }

    /// Access the protected value.
    ///
    /// # Panics
    ///
    /// If `cpu` does not own the lock.
    pub fn get(&self, cpu: CpuId) -> &T {
        assert!(
            self.is_locked_by(cpu),
            "recursive spinlock accessed by CPU {} without holding it",
            cpu
        );
        &self.data
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != NO_OWNER
    }

    pub fn is_locked_by(&self, cpu: CpuId) -> bool {
        self.owner.load(Ordering::Acquire) == cpu
    }

    /// Current owner, if any.
    pub fn owner(&self) -> Option<CpuId> {
        match self.owner.load(Ordering::Relaxed) {
            NO_OWNER => None,
            cpu => Some(cpu),
        }
    }

    /// Nesting depth. Only meaningful when read by the owning CPU.
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }
}

struct OwnerName(usize);

impl core::fmt::Display for OwnerName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.0 == NO_OWNER {
            f.write_str("nobody")
        } else {
            write!(f, "CPU {}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use core::cell::RefCell;
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn test_same_cpu_reacquires() {
        let lock = RecursiveSpinlock::new(RefCell::new(0u32));
        assert_eq!(lock.lock(0), 1);
        assert_eq!(lock.lock(0), 2);
        assert_eq!(lock.depth(), 2);

        *lock.get(0).borrow_mut() += 1;

        assert_eq!(lock.unlock(0), 1);
        assert!(lock.is_locked_by(0));
        assert_eq!(lock.unlock(0), 0);
        assert!(!lock.is_locked());
        assert_eq!(lock.owner(), None);
    }

    #[test]
    fn test_other_cpu_is_excluded() {
        let lock = RecursiveSpinlock::new(());
        lock.lock(0);
        assert_eq!(lock.try_lock(1), None);
        assert_eq!(lock.try_lock(0), Some(2));
        lock.unlock(0);
        lock.unlock(0);
        assert_eq!(lock.try_lock(1), Some(1));
        assert_eq!(lock.owner(), Some(1));
    }

    #[test]
    #[should_panic(expected = "released by CPU 1 but owned by CPU 0")]
    fn test_unlock_by_non_owner_panics() {
        let lock = RecursiveSpinlock::new(());
        lock.lock(0);
        lock.unlock(1);
    }

    #[test]
    #[should_panic(expected = "without holding it")]
    fn test_get_without_ownership_panics() {
        let lock = RecursiveSpinlock::new(());
        let _ = lock.get(0);
    }

    #[test]
    fn test_contended_increments_are_serialized() {
        let lock = Arc::new(RecursiveSpinlock::new(RefCell::new(0u64)));
        let workers: std::vec::Vec<_> = (0..4)
            .map(|cpu| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        lock.lock(cpu);
                        lock.lock(cpu);
                        *lock.get(cpu).borrow_mut() += 1;
                        lock.unlock(cpu);
                        lock.unlock(cpu);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        lock.lock(0);
        assert_eq!(*lock.get(0).borrow(), 4000);
        lock.unlock(0);
    }
}
