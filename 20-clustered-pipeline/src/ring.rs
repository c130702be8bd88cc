//! Fixed-capacity sequenced ring shared by pipeline stages.
//!
//! Producers claim a sequence with a compare-and-swap on the claim cursor,
//! fill the slot, then publish it. The single consumer of a ring reads every
//! sequence up to the highest *contiguous* published one and then releases
//! it, which is what lets producers reuse the slot on the next lap.
//!
//! Claiming never blocks: when the next sequence would lap an unreleased slot
//! the producer gets [`RingError::Full`] and decides what to do (retry later,
//! drop, close the session). Consumers block in [`Ring::wait_for`], which can
//! be interrupted with [`Ring::halt`].

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::command::Priority;
use crate::error::RingError;

pub type Sequence = i64;

/// Cursor value before anything has been claimed or released.
pub const INITIAL_SEQUENCE: Sequence = -1;

pub struct Ring<T> {
    name: String,
    slots: Box<[Mutex<T>]>,
    published: Box<[AtomicI64]>,
    mask: usize,
    claimed: AtomicI64,
    released: AtomicI64,
    halted: AtomicBool,
    waiting: AtomicUsize,
    gate: Mutex<()>,
    signal: Condvar,
}

impl<T: Default> Ring<T> {
    /// Creates a ring holding `2^power` slots.
    pub fn new(name: impl Into<String>, power: u32) -> Self {
        let capacity = 1usize << power;
        let slots = (0..capacity).map(|_| Mutex::new(T::default())).collect();
        let published = (0..capacity)
            .map(|_| AtomicI64::new(INITIAL_SEQUENCE))
            .collect();
        Self {
            name: name.into(),
            slots,
            published,
            mask: capacity - 1,
            claimed: AtomicI64::new(INITIAL_SEQUENCE),
            released: AtomicI64::new(INITIAL_SEQUENCE),
            halted: AtomicBool::new(false),
            waiting: AtomicUsize::new(0),
            gate: Mutex::new(()),
            signal: Condvar::new(),
        }
    }

    /// Moves the slot content out, leaving the default value behind.
    ///
    /// Consumers use this so a slot never keeps a session alive after handoff.
    pub fn take(&self, sequence: Sequence) -> T {
        std::mem::take(&mut *self.slot(sequence))
    }
}

impl<T> Ring<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Claims the next sequence without blocking.
    pub fn claim(&self) -> Result<Sequence, RingError> {
        if self.is_halted() {
            return Err(RingError::Halted);
        }
        let capacity = self.capacity() as Sequence;
        let mut current = self.claimed.load(Ordering::Acquire);
        loop {
            let next = current + 1;
            if next - capacity > self.released.load(Ordering::Acquire) {
                return Err(RingError::Full);
            }
            match self.claimed.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(next),
                Err(actual) => current = actual,
            }
        }
    }

    /// Claims a slot for a command of `priority`. The last `reserved` free
    /// slots are kept for network-control traffic.
    pub fn claim_for(&self, priority: Priority, reserved: usize) -> Result<Sequence, RingError> {
        if priority != Priority::NetworkControl && self.remaining() <= reserved {
            if self.is_halted() {
                return Err(RingError::Halted);
            }
            return Err(RingError::Full);
        }
        self.claim()
    }

    /// Number of slots a producer could still claim right now.
    pub fn remaining(&self) -> usize {
        let in_use = self.claimed.load(Ordering::Acquire) - self.released.load(Ordering::Acquire);
        self.capacity().saturating_sub(in_use.max(0) as usize)
    }

    /// Locks the slot for `sequence`. Only the claimer (before publish) or the
    /// consumer (after publish) may touch it.
    pub fn slot(&self, sequence: Sequence) -> MutexGuard<'_, T> {
        self.slots[self.index(sequence)].lock()
    }

    /// Makes `sequence` visible to the consumer.
    pub fn publish(&self, sequence: Sequence) {
        self.published[self.index(sequence)].store(sequence, Ordering::SeqCst);
        if self.waiting.load(Ordering::SeqCst) > 0 {
            let _gate = self.gate.lock();
            self.signal.notify_all();
        }
    }

    /// Claims, fills and publishes a slot in one call.
    pub fn produce(&self, value: T) -> Result<Sequence, RingError> {
        let sequence = self.claim()?;
        *self.slot(sequence) = value;
        self.publish(sequence);
        Ok(sequence)
    }

    /// Publishes `value`, retrying a full ring until `patience` runs out.
    /// `None` retries until the ring is halted.
    pub fn offer(
        &self,
        value: T,
        priority: Priority,
        reserved: usize,
        patience: Option<Duration>,
    ) -> Result<Sequence, RingError> {
        let deadline = patience.map(|patience| Instant::now() + patience);
        let mut attempts = 0u32;
        let sequence = loop {
            match self.claim_for(priority, reserved) {
                Ok(sequence) => break sequence,
                Err(RingError::Full) => {
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        return Err(RingError::Full);
                    }
                    attempts += 1;
                    if attempts < 64 {
                        thread::yield_now();
                    } else {
                        thread::sleep(Duration::from_micros(50));
                    }
                }
                Err(err) => return Err(err),
            }
        };
        *self.slot(sequence) = value;
        self.publish(sequence);
        Ok(sequence)
    }

    /// Publishes `value`, waiting for space as long as the ring runs.
    pub fn push(&self, value: T) -> Result<Sequence, RingError> {
        self.offer(value, Priority::NetworkControl, 0, None)
    }

    /// Highest sequence handed out to a producer so far.
    pub fn claimed(&self) -> Sequence {
        self.claimed.load(Ordering::Acquire)
    }

    /// Highest sequence the consumer has released.
    pub fn released(&self) -> Sequence {
        self.released.load(Ordering::Acquire)
    }

    /// Highest contiguous published sequence starting at `next`, or `next - 1`
    /// when `next` itself is not yet visible. Never blocks.
    pub fn available(&self, next: Sequence) -> Sequence {
        let claimed = self.claimed();
        let mut sequence = next;
        while sequence <= claimed {
            if self.published[self.index(sequence)].load(Ordering::SeqCst) != sequence {
                break;
            }
            sequence += 1;
        }
        sequence - 1
    }

    /// Blocks until `sequence` is published, the timeout elapses, or the ring
    /// is halted.
    ///
    /// On timeout the returned value may be below `sequence`; the caller treats
    /// that as a deficit, not a failure.
    pub fn wait_for(&self, sequence: Sequence, timeout: Duration) -> Result<Sequence, RingError> {
        if self.is_halted() {
            return Err(RingError::Halted);
        }
        let available = self.available(sequence);
        if available >= sequence {
            return Ok(available);
        }

        let deadline = Instant::now() + timeout;
        let mut gate = self.gate.lock();
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let outcome = loop {
            if self.is_halted() {
                break Err(RingError::Halted);
            }
            let available = self.available(sequence);
            if available >= sequence {
                break Ok(available);
            }
            if self.signal.wait_until(&mut gate, deadline).timed_out() {
                break Ok(self.available(sequence));
            }
        };
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    /// Hands slots up to and including `sequence` back to producers.
    pub fn release(&self, sequence: Sequence) {
        self.released.store(sequence, Ordering::Release);
    }

    /// Stops the ring: blocked consumers wake with [`RingError::Halted`] and
    /// further claims fail.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        let _gate = self.gate.lock();
        self.signal.notify_all();
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn index(&self, sequence: Sequence) -> usize {
        (sequence as usize) & self.mask
    }
}
