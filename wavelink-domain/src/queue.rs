use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

// ---

use super::error::{Result, WaveLinkError};
use super::unit::OutputUnit;

// ---------------------------------------------------------------------------
// QueueInner
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct QueueInner {
    // ---
    /// Pre-allocated slots.  Sample vectors are reused across adds.
    slots: Vec<OutputUnit>,

    /// Next slot the producer writes.
    head: usize,

    /// Oldest slot not yet fully transmitted.
    tail: usize,

    /// `true` between `get_tail` and the matching `bump_tail`.
    tail_held: bool,

    /// Consumed slots directly behind `tail` whose contents are still intact.
    rewindable: usize,
}

// ---

impl QueueInner {
    // ---
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn used(&self) -> usize {
        (self.head + self.capacity() - self.tail) % self.capacity()
    }
}

// ---------------------------------------------------------------------------
// DeliveryQueue
// ---------------------------------------------------------------------------

/// Fixed-capacity circular buffer of [`OutputUnit`] slots.
///
/// One slot is always left empty so `head == tail` means empty and
/// `used == capacity - 1` means full, without a separate counter.
///
/// Safe for exactly one producer and one consumer.  The consumer reads the
/// oldest unit with [`get_tail`](Self::get_tail) and releases the slot with
/// [`bump_tail`](Self::bump_tail) only once that unit is on the wire.
#[derive(Debug)]
pub struct DeliveryQueue {
    // ---
    inner: Mutex<QueueInner>,

    /// Adds refused because the queue was full.
    rejected: AtomicU64,
}

// ---

impl DeliveryQueue {
    // ---
    /// Create a queue with `capacity` slots (`capacity - 1` usable).
    ///
    /// Capacities below 2 are raised to 2.
    pub fn new(capacity: usize) -> Self {
        // ---
        let capacity = capacity.max(2);
        Self {
            inner: Mutex::new(QueueInner {
                slots: (0..capacity).map(|_| OutputUnit::default()).collect(),
                head: 0,
                tail: 0,
                tail_held: false,
                rewindable: 0,
            }),
            rejected: AtomicU64::new(0),
        }
    }

    // ---

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---

    /// Copy `unit` into the head slot, stamping it with `seq`.
    ///
    /// Returns `false` if the queue is full; the refusal is counted in
    /// [`rejected`](Self::rejected) and the caller decides whether to drop or
    /// retry.
    pub fn add(&self, unit: &OutputUnit, seq: u32) -> bool {
        // ---
        let mut q = self.lock();
        if q.used() >= q.capacity() - 1 {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let head = q.head;
        q.slots[head].assign_from(unit);
        q.slots[head].seq = seq;
        q.head = (head + 1) % q.capacity();

        // The slot just written may have been the oldest rewindable one.
        let free = q.capacity() - q.used();
        q.rewindable = q.rewindable.min(free);
        true
    }

    // ---

    pub fn has_room(&self) -> bool {
        let q = self.lock();
        q.used() < q.capacity() - 1
    }

    /// Number of adds that would currently succeed.
    pub fn free(&self) -> usize {
        let q = self.lock();
        q.capacity() - 1 - q.used()
    }

    pub fn used(&self) -> usize {
        self.lock().used()
    }

    pub fn is_empty(&self) -> bool {
        self.used() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    // ---

    /// Clone of the oldest queued unit, or `None` when empty.
    ///
    /// Marks the tail as held; repeated calls return the same unit until
    /// [`bump_tail`](Self::bump_tail) releases it.
    pub fn get_tail(&self) -> Option<OutputUnit> {
        // ---
        let mut q = self.lock();
        if q.used() == 0 {
            return None;
        }
        q.tail_held = true;
        Some(q.slots[q.tail].clone())
    }

    /// Sequence number of the oldest queued unit.
    pub fn get_tail_seq(&self) -> Option<u32> {
        // ---
        let q = self.lock();
        if q.used() == 0 {
            None
        } else {
            Some(q.slots[q.tail].seq)
        }
    }

    // ---

    /// Release the slot returned by the last [`get_tail`](Self::get_tail).
    pub fn bump_tail(&self) -> Result<()> {
        // ---
        let mut q = self.lock();
        if !q.tail_held || q.used() == 0 {
            return Err(WaveLinkError::TailNotHeld);
        }
        q.tail = (q.tail + 1) % q.capacity();
        q.tail_held = false;
        q.rewindable = (q.rewindable + 1).min(q.capacity() - 1);
        Ok(())
    }

    // ---

    /// Re-queue the last `n` transmitted units.
    ///
    /// Fails, leaving the queue untouched, if any of those slots has since
    /// been reused by the producer or the rollback would reach the head.
    pub fn move_tail_back(&self, n: usize) -> bool {
        // ---
        let mut q = self.lock();
        if n == 0 {
            return true;
        }
        if n > q.rewindable || q.used() + n > q.capacity() - 1 {
            return false;
        }
        let cap = q.capacity();
        q.tail = (q.tail + cap - n % cap) % cap;
        q.rewindable -= n;
        q.tail_held = false;
        true
    }

    // ---

    /// Grow to `new_capacity` slots, preserving queued units in order.
    ///
    /// Returns `false` (and does nothing) unless the queue actually grows.
    /// Rollback history is discarded.
    pub fn resize(&self, new_capacity: usize) -> bool {
        // ---
        let mut q = self.lock();
        let old_capacity = q.capacity();
        if new_capacity <= old_capacity {
            return false;
        }

        let used = q.used();
        let mut slots: Vec<OutputUnit> = Vec::with_capacity(new_capacity);
        for i in 0..used {
            let idx = (q.tail + i) % old_capacity;
            slots.push(std::mem::take(&mut q.slots[idx]));
        }
        slots.resize_with(new_capacity, OutputUnit::default);

        q.slots = slots;
        q.tail = 0;
        q.head = used;
        q.rewindable = 0;
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
