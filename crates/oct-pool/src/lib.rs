//! Fixed-capacity slot pools for high-rate acquisition and frame handling.
//!
//! The acquisition, reconstruction and consumer threads exchange data by
//! slot index only. Every slot is allocated once at startup and overwritten in
//! place afterwards, so steady-state operation performs no per-frame heap
//! allocation.
//!
//! - [`IndexQueue`]: bounded FIFO of slot indices behind one mutex
//! - [`SlotPool<T>`]: the slot array plus its `ready` (completion order) and
//!   `free` queues
//!
//! # Overflow policies
//!
//! [`OverflowPolicy::Lossy`] is used for live acquisition: when the consumer
//! falls behind, the writer reuses the oldest slot and the unconsumed data in
//! it is lost. [`OverflowPolicy::Backpressure`] is used for playback and
//! recording: writes are refused until a reader hands a slot back.
//!
//! # Safety Model
//!
//! Each slot is a `parking_lot::RwLock<T>` paired with a write generation.
//! Writers only ever `try_write`, so a writer can never obtain a slot that a
//! reader is holding, and readers holding the ready-queue lock only ever
//! `try_read`. A reader therefore never sees a buffer that is being written.
//! The generation is odd while a write is in progress and even otherwise.
//!
//! # Example
//!
//! ```
//! use oct_pool::{OverflowPolicy, SlotPool};
//!
//! let pool = SlotPool::new("raw", 4, OverflowPolicy::Lossy, || vec![0u16; 1024]).unwrap();
//!
//! let mut slot = pool.begin_write().unwrap();
//! slot[0] = 42;
//! let index = slot.index();
//! slot.commit();
//!
//! let read = pool.pop_ready().unwrap();
//! assert_eq!(read.index(), index);
//! assert_eq!(read[0], 42);
//! ```

pub mod index_queue;

pub use index_queue::IndexQueue;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

/// Polling interval used while waiting for a slot or a ready index.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Type alias for the in-place reset applied when a slot is reused.
type ResetFn<T> = Box<dyn Fn(&mut T) + Send + Sync>;

/// Pool construction errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool was created with no slots.
    #[error("pool '{label}' must have at least one slot")]
    ZeroCapacity {
        /// Pool name.
        label: &'static str,
    },

    /// Slot storage could not be allocated.
    #[error("pool '{label}' could not allocate {capacity} slots")]
    Allocation {
        /// Pool name.
        label: &'static str,
        /// Requested slot count.
        capacity: usize,
    },
}

/// What a writer does when every slot holds unconsumed data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Reuse the oldest slot; unconsumed data is overwritten.
    Lossy,
    /// Refuse the write until a reader releases a slot.
    Backpressure,
}

/// Counters describing pool traffic since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Slots in the pool.
    pub capacity: usize,
    /// Committed slots not yet popped.
    pub ready: usize,
    /// Slots free to write (backpressure pools).
    pub free: usize,
    /// Writes committed.
    pub committed: u64,
    /// Writes abandoned.
    pub aborted: u64,
    /// Ready slots overwritten by lossy writes.
    pub overwritten: u64,
    /// Writes refused while full.
    pub refused: u64,
}

struct Slot<T> {
    data: RwLock<T>,
    generation: AtomicU64,
}

/// Fixed array of pre-allocated slots with index-based hand-off.
pub struct SlotPool<T> {
    label: &'static str,
    slots: Box<[Slot<T>]>,
    /// Committed, not yet consumed, oldest first.
    ready: IndexQueue,
    /// Slots available to writers (backpressure mode only).
    free: IndexQueue,
    policy: OverflowPolicy,
    cursor: AtomicUsize,
    reset_fn: Option<ResetFn<T>>,
    committed: AtomicU64,
    aborted: AtomicU64,
    overwritten: AtomicU64,
    refused: AtomicU64,
}

impl<T: Send + Sync> std::fmt::Debug for SlotPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPool")
            .field("label", &self.label)
            .field("capacity", &self.slots.len())
            .field("policy", &self.policy)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<T: Send + Sync> SlotPool<T> {
    /// Create a pool of `capacity` slots built by `factory`.
    pub fn new<F>(
        label: &'static str,
        capacity: usize,
        policy: OverflowPolicy,
        factory: F,
    ) -> Result<Self, PoolError>
    where
        F: FnMut() -> T,
    {
        Self::build(label, capacity, policy, factory, None)
    }

    /// Create a pool whose slots are passed through `reset` each time a
    /// writer takes them.
    pub fn with_reset<F, R>(
        label: &'static str,
        capacity: usize,
        policy: OverflowPolicy,
        factory: F,
        reset: R,
    ) -> Result<Self, PoolError>
    where
        F: FnMut() -> T,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        Self::build(label, capacity, policy, factory, Some(Box::new(reset)))
    }

    fn build<F>(
        label: &'static str,
        capacity: usize,
        policy: OverflowPolicy,
        mut factory: F,
        reset_fn: Option<ResetFn<T>>,
    ) -> Result<Self, PoolError>
    where
        F: FnMut() -> T,
    {
        if capacity == 0 {
            return Err(PoolError::ZeroCapacity { label });
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| PoolError::Allocation { label, capacity })?;
        for _ in 0..capacity {
            slots.push(Slot {
                data: RwLock::new(factory()),
                generation: AtomicU64::new(0),
            });
        }

        let free = match policy {
            OverflowPolicy::Lossy => IndexQueue::new(capacity),
            OverflowPolicy::Backpressure => IndexQueue::filled(capacity, capacity),
        };

        debug!(pool = label, capacity, ?policy, "Created slot pool");

        Ok(Self {
            label,
            slots: slots.into_boxed_slice(),
            ready: IndexQueue::new(capacity),
            free,
            policy,
            cursor: AtomicUsize::new(0),
            reset_fn,
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            overwritten: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        })
    }

    /// Take a slot for writing without blocking.
    ///
    /// Lossy pools walk the slots round-robin starting after the last write
    /// and take the first one no reader holds; if it still held unconsumed
    /// data, that data is dropped. Backpressure pools only hand out slots from
    /// the free queue. Returns `None` when nothing can be written right now.
    pub fn begin_write(&self) -> Option<WriteSlot<'_, T>> {
        let claimed = match self.policy {
            OverflowPolicy::Lossy => self.claim_lossy(),
            OverflowPolicy::Backpressure => self.claim_free(),
        };

        let Some((index, mut guard)) = claimed else {
            self.refused.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        self.slots[index].generation.fetch_add(1, Ordering::AcqRel);
        if let Some(reset) = &self.reset_fn {
            reset(&mut *guard);
        }

        Some(WriteSlot {
            pool: self,
            index,
            guard: Some(guard),
            committed: false,
        })
    }

    /// Like [`begin_write`](Self::begin_write) but polls until `timeout`.
    pub fn begin_write_timeout(&self, timeout: Duration) -> Option<WriteSlot<'_, T>> {
        let start = Instant::now();
        loop {
            if let Some(slot) = self.begin_write() {
                return Some(slot);
            }
            if start.elapsed() >= timeout {
                return None;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn claim_lossy(&self) -> Option<(usize, RwLockWriteGuard<'_, T>)> {
        let capacity = self.slots.len();
        for _ in 0..capacity {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % capacity;
            if let Some(guard) = self.slots[index].data.try_write() {
                if self.ready.remove(index) {
                    self.overwritten.fetch_add(1, Ordering::Relaxed);
                    trace!(pool = self.label, slot = index, "Overwriting unconsumed slot");
                }
                return Some((index, guard));
            }
        }
        None
    }

    fn claim_free(&self) -> Option<(usize, RwLockWriteGuard<'_, T>)> {
        let index = self.free.pop()?;
        match self.slots[index].data.try_write() {
            Some(guard) => Some((index, guard)),
            None => {
                // A stale reader still holds it; hand it back and refuse.
                self.free.push(index);
                None
            }
        }
    }

    /// Pop the oldest committed slot for exclusive consumption.
    ///
    /// In backpressure mode the slot returns to the free queue when the
    /// returned guard is dropped.
    pub fn pop_ready(&self) -> Option<ReadSlot<'_, T>> {
        self.ready.pop_until(|index| {
            let guard = self.slots[index].data.try_read()?;
            Some(ReadSlot {
                pool: self,
                index,
                generation: self.slots[index].generation.load(Ordering::Acquire),
                guard: Some(guard),
                release: true,
            })
        })
    }

    /// Poll [`pop_ready`](Self::pop_ready) until `timeout` elapses.
    pub fn wait_ready(&self, timeout: Duration) -> Option<ReadSlot<'_, T>> {
        let start = Instant::now();
        loop {
            if let Some(slot) = self.pop_ready() {
                return Some(slot);
            }
            if start.elapsed() >= timeout {
                return None;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Borrow the newest committed slot without consuming it.
    ///
    /// Used by consumers that only care about the most recent frame
    /// (renderer, recorder). Any number of readers may hold it at once.
    pub fn latest(&self) -> Option<ReadSlot<'_, T>> {
        self.ready.with_back(|index| {
            let guard = self.slots[index].data.try_read()?;
            Some(ReadSlot {
                pool: self,
                index,
                generation: self.slots[index].generation.load(Ordering::Acquire),
                guard: Some(guard),
                release: false,
            })
        })
    }

    /// Borrow a specific slot read-only, blocking while it is being written.
    pub fn read(&self, index: usize) -> Option<ReadSlot<'_, T>> {
        let slot = self.slots.get(index)?;
        let guard = slot.data.read();
        Some(ReadSlot {
            pool: self,
            index,
            generation: slot.generation.load(Ordering::Acquire),
            guard: Some(guard),
            release: false,
        })
    }

    /// Current write generation of a slot (odd while being written).
    #[must_use]
    pub fn generation(&self, index: usize) -> Option<u64> {
        self.slots
            .get(index)
            .map(|slot| slot.generation.load(Ordering::Acquire))
    }

    /// Drop every committed-but-unconsumed index and refill the free queue.
    ///
    /// Only call while no writer or reader is active (pipeline stopped).
    pub fn clear(&self) {
        self.ready.clear();
        if self.policy == OverflowPolicy::Backpressure {
            self.free.clear();
            for index in 0..self.slots.len() {
                self.free.push(index);
            }
        }
        self.cursor.store(0, Ordering::Relaxed);
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Overflow policy.
    #[must_use]
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Name used in logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Number of committed slots waiting for a consumer.
    #[must_use]
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// True when no committed slot awaits a reader.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    /// Oldest committed index, if any.
    #[must_use]
    pub fn front_index(&self) -> Option<usize> {
        self.ready.front_index()
    }

    /// Counters snapshot.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.slots.len(),
            ready: self.ready.len(),
            free: match self.policy {
                OverflowPolicy::Lossy => self.slots.len() - self.ready.len(),
                OverflowPolicy::Backpressure => self.free.len(),
            },
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            overwritten: self.overwritten.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
        }
    }

    fn finish_write(&self, index: usize, committed: bool) {
        self.slots[index].generation.fetch_add(1, Ordering::AcqRel);
        if committed {
            self.committed.fetch_add(1, Ordering::Relaxed);
            self.ready.requeue(index);
        } else {
            self.aborted.fetch_add(1, Ordering::Relaxed);
            if self.policy == OverflowPolicy::Backpressure {
                self.free.push(index);
            }
        }
    }

    fn release_read(&self, index: usize) {
        if self.policy == OverflowPolicy::Backpressure && !self.ready.contains(index) {
            self.free.push(index);
        }
    }
}

/// Exclusive write access to one slot.
///
/// Call [`commit`](Self::commit) to publish the slot to readers. Dropping an
/// uncommitted `WriteSlot` leaves the slot unpublished and reusable.
pub struct WriteSlot<'a, T: Send + Sync> {
    pool: &'a SlotPool<T>,
    index: usize,
    guard: Option<RwLockWriteGuard<'a, T>>,
    committed: bool,
}

impl<'a, T: Send + Sync> WriteSlot<'a, T> {
    /// Slot index.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Publish the slot in completion order. Returns the slot index.
    pub fn commit(mut self) -> usize {
        self.committed = true;
        // Unlock before publishing so a reader never finds a locked ready slot.
        self.guard.take();
        self.pool.finish_write(self.index, true);
        self.index
    }
}

impl<T: Send + Sync> Deref for WriteSlot<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.guard {
            Some(guard) => guard,
            None => unreachable!("write guard released before drop"),
        }
    }
}

impl<T: Send + Sync> DerefMut for WriteSlot<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.guard {
            Some(guard) => guard,
            None => unreachable!("write guard released before drop"),
        }
    }
}

impl<T: Send + Sync> Drop for WriteSlot<'_, T> {
    fn drop(&mut self) {
        if !self.committed {
            self.guard.take();
            self.pool.finish_write(self.index, false);
            trace!(pool = self.pool.label, slot = self.index, "Write abandoned");
        }
    }
}

/// Shared read access to one slot.
pub struct ReadSlot<'a, T: Send + Sync> {
    pool: &'a SlotPool<T>,
    index: usize,
    generation: u64,
    guard: Option<RwLockReadGuard<'a, T>>,
    release: bool,
}

impl<T: Send + Sync> ReadSlot<'_, T> {
    /// Slot index.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Write generation observed when the slot was borrowed.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl<T: Send + Sync> Deref for ReadSlot<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.guard {
            Some(guard) => guard,
            None => unreachable!("read guard released before drop"),
        }
    }
}

impl<T: Send + Sync> Drop for ReadSlot<'_, T> {
    fn drop(&mut self) {
        self.guard.take();
        if self.release {
            self.pool.release_read(self.index);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
